#![cfg(not(feature = "loom"))]

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use fakesmp_core::atomic::AtomicOp;
use fakesmp_core::cpu::CpuOp;
use fakesmp_core::fence::{self, FenceKind, SharedFlag};
use fakesmp_core::observe::{self, Event, EventLog};
use fakesmp_core::{AssumptionFailed, AtomicCell, CpuSlot, MemOrder, Severity, Smp, SmpConfig};

// The observer slot is process-wide; tests in this binary take turns.
static TEST_GUARD_HELD: AtomicBool = AtomicBool::new(false);

struct TestGuard;

impl Drop for TestGuard {
    fn drop(&mut self) {
        TEST_GUARD_HELD.store(false, Ordering::Release);
    }
}

fn acquire_test_guard() -> TestGuard {
    loop {
        if TEST_GUARD_HELD
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return TestGuard;
        }
        std::thread::yield_now();
    }
}

#[test]
fn atomic_operations_publish_declared_order() {
    let _guard = acquire_test_guard();
    let log = EventLog::new();
    let _installed = observe::install(log.clone());

    let cell = AtomicCell::with_order(0, MemOrder::Relaxed);
    cell.add(3);
    cell.compare_and_swap(9, 1);
    cell.swap(5);

    let events = log.take();
    let cell_addr = &cell as *const AtomicCell as usize;
    assert_eq!(
        events,
        vec![
            Event::Atomic {
                cell: cell_addr,
                op: AtomicOp::Add,
                declared: MemOrder::Relaxed,
                value: 3,
            },
            Event::Atomic {
                cell: cell_addr,
                op: AtomicOp::CompareAndSwap { success: false },
                declared: MemOrder::Relaxed,
                value: 3,
            },
            Event::Atomic {
                cell: cell_addr,
                op: AtomicOp::Swap,
                declared: MemOrder::Relaxed,
                value: 3,
            },
        ]
    );
}

#[test]
fn once_accessors_on_a_cell_are_atomic_events() {
    let _guard = acquire_test_guard();
    let log = EventLog::new();
    let _installed = observe::install(log.clone());

    let cell = AtomicCell::with_order(0, MemOrder::Relaxed);
    fence::write_once(&cell, 42);
    assert_eq!(fence::read_once(&cell), 42);

    let cell_addr = &cell as *const AtomicCell as usize;
    assert_eq!(
        log.take(),
        vec![
            Event::Atomic {
                cell: cell_addr,
                op: AtomicOp::Write,
                declared: MemOrder::Relaxed,
                value: 42,
            },
            Event::Atomic {
                cell: cell_addr,
                op: AtomicOp::Read,
                declared: MemOrder::Relaxed,
                value: 42,
            },
        ]
    );
}

#[test]
fn per_call_order_overrides_the_cell_default() {
    let _guard = acquire_test_guard();
    let log = EventLog::new();
    let _installed = observe::install(log.clone());

    let cell = AtomicCell::with_order(0, MemOrder::Relaxed);
    cell.add(1);
    cell.add_ordered(1, MemOrder::SeqCst);
    let _ = cell.compare_exchange_ordered(2, 7, MemOrder::Acquire);
    cell.write_ordered(3, MemOrder::Release);

    let declared: Vec<_> = log
        .take()
        .into_iter()
        .map(|e| match e {
            Event::Atomic { op, declared, .. } => (op, declared),
            other => panic!("unexpected event {other:?}"),
        })
        .collect();
    assert_eq!(
        declared,
        vec![
            (AtomicOp::Add, MemOrder::Relaxed),
            (AtomicOp::Add, MemOrder::SeqCst),
            (AtomicOp::CompareAndSwap { success: true }, MemOrder::Acquire),
            (AtomicOp::Write, MemOrder::Release),
        ]
    );
    assert_eq!(cell.declared_order(), MemOrder::Relaxed);
}

#[test]
fn each_fence_is_a_distinct_event() {
    let _guard = acquire_test_guard();
    let log = EventLog::new();
    let _installed = observe::install(log.clone());

    let flag = SharedFlag::new(false);
    fence::compiler_barrier();
    fence::full_fence();
    fence::load_fence();
    fence::store_fence();
    fence::release_store(&flag, true);
    let _ = fence::acquire_load(&flag);
    fakesmp_core::kernel::read_barrier_depends();

    let kinds: Vec<_> = log
        .take()
        .into_iter()
        .map(|e| match e {
            Event::Fence { fence } => fence,
            other => panic!("unexpected event {other:?}"),
        })
        .collect();
    assert_eq!(
        kinds,
        vec![
            FenceKind::Compiler,
            FenceKind::Full,
            FenceKind::Load,
            FenceKind::Store,
            FenceKind::ReleaseStore,
            FenceKind::AcquireLoad,
        ]
    );
}

#[test]
fn registry_and_suppression_events() {
    let _guard = acquire_test_guard();
    let smp = Smp::new(SmpConfig::default()).unwrap();
    let log = EventLog::new();
    let _installed = observe::install(log.clone());

    let cpu = smp.current_cpu();
    smp.soft_acquire(cpu);
    smp.soft_release(cpu);
    smp.set_suppressed();
    smp.set_suppressed();

    let events = log.take();
    let cpu_ops: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            Event::Cpu { op, slot } => Some((*op, *slot)),
            _ => None,
        })
        .collect();
    assert_eq!(
        cpu_ops,
        vec![(CpuOp::Assign, cpu), (CpuOp::Acquire, cpu), (CpuOp::Release, cpu)]
    );
    assert_eq!(
        events.iter().filter(|e| matches!(e, Event::Suppressed)).count(),
        1
    );
}

#[test]
fn violations_reach_the_observer_before_the_panic() {
    let _guard = acquire_test_guard();
    let smp = Smp::new(SmpConfig::default()).unwrap();
    let log = EventLog::new();
    let _installed = observe::install(log.clone());

    let cpu = smp.assign_cpu(1).unwrap();
    let result = catch_unwind(AssertUnwindSafe(|| smp.check(false, "qsmask not clear")));
    assert!(result.is_err());

    let violations = log.violations();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].severity, Severity::Recoverable);
    assert_eq!(violations[0].message, "qsmask not clear");
    assert_eq!(violations[0].cpu, Some(cpu));
    assert!(violations[0].location.contains("observer_events_test.rs"));
}

#[test]
fn foreign_cpu_slot_is_reported_not_indexed() {
    let _guard = acquire_test_guard();
    let smp = Smp::new(SmpConfig::with_cpus(2)).unwrap();
    let log = EventLog::new();
    let _installed = observe::install(log.clone());

    let foreign: CpuSlot = serde_json::from_str("7").unwrap();
    let result = catch_unwind(AssertUnwindSafe(|| smp.smp_send_reschedule(foreign)));
    assert!(result.is_err());

    let violations = log.violations();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].severity, Severity::Fatal);
    assert!(violations[0].message.contains("out of range"));
    assert!(violations[0].location.contains("observer_events_test.rs"));
}

#[test]
fn false_assumption_publishes_nothing() {
    let _guard = acquire_test_guard();
    let smp = Smp::new(SmpConfig::default()).unwrap();
    let log = EventLog::new();
    let _installed = observe::install(log.clone());

    let result = catch_unwind(AssertUnwindSafe(|| smp.assume(false)));
    let payload = result.unwrap_err();
    assert!(AssumptionFailed::from_payload(&*payload).is_some());
    assert!(log.violations().is_empty());
}

#[test]
fn guard_restores_previous_observer() {
    let _guard = acquire_test_guard();
    let outer = EventLog::new();
    let inner = EventLog::new();
    let _outer_installed = observe::install(outer.clone());
    {
        let _inner_installed = observe::install(inner.clone());
        fence::full_fence();
    }
    fence::full_fence();
    assert_eq!(inner.len(), 1);
    assert_eq!(outer.len(), 1);
}

#[test]
fn closure_observer_sees_events() {
    let _guard = acquire_test_guard();
    let seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    let _installed = observe::install(Arc::new(move |_: &Event| {
        counter.fetch_add(1, Ordering::Relaxed);
    }));
    AtomicCell::new(0).increment();
    assert_eq!(seen.load(Ordering::Relaxed), 1);
}
