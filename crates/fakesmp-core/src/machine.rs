//! The emulated machine.
//!
//! [`Smp`] owns everything one emulated system shares between its threads:
//! configuration, CPU registry, invariant bridge, per-CPU arena, `jiffies`,
//! and the per-CPU soft-irq / reschedule / irq-off flags. Hosted code gets an
//! `Arc<Smp>` and calls the kernel-shaped operations on it.
//!
//! Registry misuse at run time (a second holder, a nesting error under
//! [`NestingPolicy::Report`], pool exhaustion) is a defect of the hosted
//! code, so the facade reports it as a fatal violation instead of returning
//! it. Only [`Smp::assign_cpu`], a harness operation, returns its error.
//!
//! [`NestingPolicy::Report`]: crate::config::NestingPolicy::Report

use std::sync::Arc;

use crate::config::SmpConfig;
use crate::cpu::{CpuIter, CpuRegistry, CpuSlot};
use crate::error::{ConfigError, CpuError, PerCpuError};
use crate::fence::{SharedFlag, SharedWord, read_once, write_once};
use crate::invariant::InvariantBridge;
use crate::notifier::NotifierChain;
use crate::percpu::{PerCpu, PerCpuArena, PerCpuId};

/// One emulated SMP system.
#[derive(Debug)]
pub struct Smp {
    config: SmpConfig,
    registry: Arc<CpuRegistry>,
    bridge: InvariantBridge,
    percpu: PerCpuArena,
    jiffies: SharedWord,
    pub(crate) softirq_pending: PerCpu<SharedFlag>,
    pub(crate) resched: PerCpu<SharedFlag>,
    pub(crate) irqs_off: PerCpu<SharedFlag>,
    cpu_notifiers: NotifierChain,
    pm_notifiers: NotifierChain,
}

impl Smp {
    /// Validate `config` and build the machine.
    pub fn new(config: SmpConfig) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let levels = config.tree_levels()?;
        let nr_cpus = config.nr_cpus;
        let registry = Arc::new(CpuRegistry::new(nr_cpus, config.nesting));
        tracing::info!(
            nr_cpus,
            fanout = config.rcu_fanout,
            fanout_leaf = config.rcu_fanout_leaf,
            ?levels,
            nesting = ?config.nesting,
            fencing = ?config.suppression_fencing,
            "emulated SMP machine up"
        );
        Ok(Arc::new(Self {
            bridge: InvariantBridge::with_registry(
                config.suppression_fencing,
                Arc::clone(&registry),
            ),
            registry,
            percpu: PerCpuArena::new(nr_cpus),
            jiffies: SharedWord::default(),
            softirq_pending: PerCpu::with_default(nr_cpus),
            resched: PerCpu::with_default(nr_cpus),
            irqs_off: PerCpu::with_default(nr_cpus),
            cpu_notifiers: NotifierChain::new(),
            pm_notifiers: NotifierChain::new(),
            config,
        }))
    }

    /// Machine built from `FAKESMP_*` environment variables.
    pub fn from_env() -> Result<Arc<Self>, ConfigError> {
        Self::new(SmpConfig::from_env()?)
    }

    #[must_use]
    pub fn config(&self) -> &SmpConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<CpuRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn bridge(&self) -> &InvariantBridge {
        &self.bridge
    }

    #[must_use]
    pub fn percpu(&self) -> &PerCpuArena {
        &self.percpu
    }

    #[track_caller]
    fn expect_cpu<T>(&self, result: Result<T, CpuError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => self.bridge.kernel_panic(&err.to_string()),
        }
    }

    /// `slot` checked against this pool. A slot from another machine (or
    /// a deserialized one) that is out of range is a fatal violation.
    #[track_caller]
    pub(crate) fn checked_cpu(&self, slot: CpuSlot) -> CpuSlot {
        self.expect_cpu(self.registry.slot(slot.index()))
    }

    // CPU identity.

    /// `nr_cpu_ids`.
    #[must_use]
    pub fn nr_cpu_ids(&self) -> usize {
        self.config.nr_cpus
    }

    /// `num_online_cpus()`: every CPU is online.
    #[must_use]
    pub fn num_online_cpus(&self) -> usize {
        self.config.nr_cpus
    }

    #[must_use]
    pub fn cpu_online(&self, slot: CpuSlot) -> bool {
        slot.index() < self.config.nr_cpus
    }

    #[must_use]
    pub fn cpu_is_offline(&self, slot: CpuSlot) -> bool {
        !self.cpu_online(slot)
    }

    /// `get_cpu()` / `smp_processor_id()`.
    #[track_caller]
    pub fn current_cpu(&self) -> CpuSlot {
        self.expect_cpu(self.registry.current_cpu())
    }

    /// `smp_processor_id()`.
    #[track_caller]
    pub fn smp_processor_id(&self) -> CpuSlot {
        self.current_cpu()
    }

    /// `set_cpu()`: harness placement of the calling thread.
    pub fn assign_cpu(&self, index: usize) -> Result<CpuSlot, CpuError> {
        self.registry.assign_cpu(index)
    }

    /// Range-checked slot handle. Out of range is a fatal violation.
    #[track_caller]
    pub fn cpu(&self, index: usize) -> CpuSlot {
        self.expect_cpu(self.registry.slot(index))
    }

    /// `fake_acquire_cpu()`.
    #[track_caller]
    pub fn soft_acquire(&self, slot: CpuSlot) {
        self.expect_cpu(self.registry.soft_acquire(slot));
    }

    /// `fake_release_cpu()`.
    #[track_caller]
    pub fn soft_release(&self, slot: CpuSlot) {
        self.expect_cpu(self.registry.soft_release(slot));
    }

    #[must_use]
    pub fn for_each_possible_cpu(&self) -> CpuIter {
        self.registry.possible_cpus()
    }

    #[must_use]
    pub fn for_each_online_cpu(&self) -> CpuIter {
        self.registry.online_cpus()
    }

    // Per-CPU data.

    /// `DEFINE_PER_CPU(T, name)`.
    pub fn define_per_cpu<T>(&self, name: &str) -> Result<PerCpuId<T>, PerCpuError>
    where
        T: Default + Send + 'static,
    {
        self.percpu.define(name)
    }

    /// `per_cpu(var, cpu)` for self-synchronizing payloads.
    pub fn per_cpu<T>(&self, id: PerCpuId<T>) -> Result<Arc<PerCpu<T>>, PerCpuError>
    where
        T: Send + 'static,
    {
        self.percpu.var(id)
    }

    /// `this_cpu_ptr(var)`: run `f` on the calling thread's element.
    ///
    /// # Safety
    ///
    /// No other reference to that element may exist while `f` runs. Holding
    /// the slot through [`Smp::soft_acquire`] or [`Smp::local_irq_disable`]
    /// and leaving other CPUs' elements alone is the intended discipline.
    #[track_caller]
    pub unsafe fn this_cpu<T, R>(
        &self,
        id: PerCpuId<T>,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R, PerCpuError>
    where
        T: Send + 'static,
    {
        let slot = self.current_cpu();
        // SAFETY: forwarded to the caller.
        unsafe { self.percpu.with_storage(id, slot, f) }
    }

    /// Visit every CPU's element of a self-synchronizing variable.
    pub fn for_each_cpu<T>(
        &self,
        id: PerCpuId<T>,
        mut f: impl FnMut(CpuSlot, &T),
    ) -> Result<(), PerCpuError>
    where
        T: Send + Sync + 'static,
    {
        let var = self.percpu.var(id)?;
        for (slot, value) in var.iter() {
            f(slot, value);
        }
        Ok(())
    }

    // Invariants.

    /// `WARN_ON(!condition)`.
    #[track_caller]
    pub fn check(&self, condition: bool, message: &str) {
        self.bridge.check(condition, message);
    }

    #[track_caller]
    pub fn check_fatal(&self, condition: bool, message: &str) {
        self.bridge.check_fatal(condition, message);
    }

    /// `__VERIFIER_assume(condition)`. See [`InvariantBridge::assume`].
    #[track_caller]
    pub fn assume(&self, condition: bool) {
        self.bridge.assume(condition);
    }

    /// `SET_NOASSERT()`.
    pub fn set_suppressed(&self) {
        self.bridge.set_suppressed();
    }

    #[must_use]
    pub fn is_suppressed(&self) -> bool {
        self.bridge.is_suppressed()
    }

    // Time.

    /// Current `jiffies`.
    #[must_use]
    pub fn jiffies(&self) -> usize {
        read_once(&self.jiffies)
    }

    /// Advance `jiffies` by one tick and return the new value.
    pub fn tick(&self) -> usize {
        self.jiffies.bump()
    }

    /// Set `jiffies` (harness use, e.g. to start near wrap-around).
    pub fn set_jiffies(&self, value: usize) {
        write_once(&self.jiffies, value);
    }

    /// Stall timeout expressed in jiffies.
    #[must_use]
    pub fn stall_timeout_jiffies(&self) -> u64 {
        self.config.stall_timeout_jiffies()
    }

    // Notifiers.

    /// `cpu_notifier` / `register_cpu_notifier` / `hotcpu_notifier`.
    #[must_use]
    pub fn cpu_notifiers(&self) -> &NotifierChain {
        &self.cpu_notifiers
    }

    /// `pm_notifier`.
    #[must_use]
    pub fn pm_notifiers(&self) -> &NotifierChain {
        &self.pm_notifiers
    }
}
