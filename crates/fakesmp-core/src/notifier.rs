//! Notifier chain stubs.
//!
//! CPU hotplug and power management are not emulated, so registration only
//! counts blocks and callbacks are never invoked. The action codes are kept
//! so hosted notifier callbacks still compile and can be unit-tested directly.

use std::sync::atomic::{AtomicUsize, Ordering};

pub const NOTIFY_DONE: i32 = 0x0000;
pub const NOTIFY_OK: i32 = 0x0001;
/// Don't call further blocks.
pub const NOTIFY_STOP_MASK: i32 = 0x8000;
/// Veto the action.
pub const NOTIFY_BAD: i32 = NOTIFY_STOP_MASK | 0x0002;

pub const CPU_ONLINE: u64 = 0x0002;
pub const CPU_UP_PREPARE: u64 = 0x0003;
pub const CPU_UP_CANCELED: u64 = 0x0004;
pub const CPU_DOWN_PREPARE: u64 = 0x0005;
pub const CPU_DOWN_FAILED: u64 = 0x0006;
pub const CPU_DEAD: u64 = 0x0007;
pub const CPU_DYING: u64 = 0x0008;
pub const CPU_POST_DEAD: u64 = 0x0009;
pub const CPU_STARTING: u64 = 0x000A;

/// Set on hotplug actions issued while tasks are frozen.
pub const CPU_TASKS_FROZEN: u64 = 0x0010;
pub const CPU_ONLINE_FROZEN: u64 = CPU_ONLINE | CPU_TASKS_FROZEN;
pub const CPU_UP_PREPARE_FROZEN: u64 = CPU_UP_PREPARE | CPU_TASKS_FROZEN;
pub const CPU_UP_CANCELED_FROZEN: u64 = CPU_UP_CANCELED | CPU_TASKS_FROZEN;
pub const CPU_DOWN_PREPARE_FROZEN: u64 = CPU_DOWN_PREPARE | CPU_TASKS_FROZEN;
pub const CPU_DOWN_FAILED_FROZEN: u64 = CPU_DOWN_FAILED | CPU_TASKS_FROZEN;
pub const CPU_DEAD_FROZEN: u64 = CPU_DEAD | CPU_TASKS_FROZEN;
pub const CPU_DYING_FROZEN: u64 = CPU_DYING | CPU_TASKS_FROZEN;
pub const CPU_STARTING_FROZEN: u64 = CPU_STARTING | CPU_TASKS_FROZEN;

pub const PM_HIBERNATION_PREPARE: u64 = 0x0001;
pub const PM_POST_HIBERNATION: u64 = 0x0002;
pub const PM_SUSPEND_PREPARE: u64 = 0x0003;
pub const PM_POST_SUSPEND: u64 = 0x0004;
pub const PM_RESTORE_PREPARE: u64 = 0x0005;
pub const PM_POST_RESTORE: u64 = 0x0006;

/// `notifier_fn_t`.
pub type NotifierFn = fn(block: &NotifierBlock, action: u64, cpu: usize) -> i32;

/// `struct notifier_block`.
#[derive(Debug, Clone, Copy)]
pub struct NotifierBlock {
    pub notifier_call: NotifierFn,
    pub priority: i32,
}

impl NotifierBlock {
    #[must_use]
    pub const fn new(notifier_call: NotifierFn, priority: i32) -> Self {
        Self {
            notifier_call,
            priority,
        }
    }

    /// Invoke the callback directly, as a unit test of the hosted code would.
    pub fn call(&self, action: u64, cpu: usize) -> i32 {
        (self.notifier_call)(self, action, cpu)
    }
}

/// Strip `CPU_TASKS_FROZEN` so callbacks can match on the base action.
#[must_use]
pub const fn base_action(action: u64) -> u64 {
    action & !CPU_TASKS_FROZEN
}

/// True when a callback result stops the chain.
#[must_use]
pub const fn stops_chain(ret: i32) -> bool {
    ret & NOTIFY_STOP_MASK != 0
}

/// `atomic_notifier_chain_register` / `register_cpu_notifier` /
/// `pm_notifier`: accepted and counted, never called.
#[derive(Debug, Default)]
pub struct NotifierChain {
    registered: AtomicUsize,
}

impl NotifierChain {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            registered: AtomicUsize::new(0),
        }
    }

    pub fn register(&self, block: &NotifierBlock) {
        self.registered.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(priority = block.priority, "notifier registered (not invoked)");
    }

    /// Number of blocks registered so far.
    #[must_use]
    pub fn registered(&self) -> usize {
        self.registered.load(Ordering::Relaxed)
    }
}
