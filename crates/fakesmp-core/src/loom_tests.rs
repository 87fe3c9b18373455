//! Loom models of the layer's guarantees.
//!
//! ```bash
//! cargo test -p fakesmp-core --features loom -- --test-threads=1 loom
//! ```
//!
//! Each model runs the real layer types; with the `loom` feature their atomics
//! and fences come from loom, so every interleaving is explored.

use std::sync::Arc;

use loom::thread;

use crate::atomic::AtomicCell;
use crate::config::{SmpConfig, SuppressionFencing};
use crate::invariant::InvariantBridge;
use crate::machine::Smp;

#[test]
fn loom_increment_decrement_ends_at_zero() {
    loom::model(|| {
        let counter = Arc::new(AtomicCell::new(0));
        let c = Arc::clone(&counter);
        let inc = thread::spawn(move || {
            c.increment();
            c.increment();
        });
        counter.decrement();
        counter.decrement();
        inc.join().unwrap();
        assert_eq!(counter.read(), 0);
    });
}

#[test]
fn loom_compare_and_swap_has_one_winner() {
    loom::model(|| {
        let cell = Arc::new(AtomicCell::new(0));
        let c = Arc::clone(&cell);
        let other = thread::spawn(move || c.compare_and_swap(0, 2));
        let mine = cell.compare_and_swap(0, 1);
        let theirs = other.join().unwrap();
        assert!(mine ^ theirs);
        assert_eq!(cell.read(), if mine { 1 } else { 2 });
    });
}

#[test]
fn loom_current_cpu_is_distinct_and_stable() {
    loom::model(|| {
        let smp = Smp::new(SmpConfig::default()).unwrap();
        let s = Arc::clone(&smp);
        let other = thread::spawn(move || {
            let first = s.current_cpu();
            assert_eq!(first, s.current_cpu());
            first
        });
        let mine = smp.current_cpu();
        let theirs = other.join().unwrap();
        assert_ne!(mine, theirs);
        assert_eq!(mine, smp.current_cpu());
    });
}

#[test]
fn loom_fenced_suppression_is_seen_after_forced_failure() {
    loom::model(|| {
        let bridge = Arc::new(InvariantBridge::new(SuppressionFencing::Fenced));
        let broken = Arc::new(AtomicCell::new(0));
        let (b, x) = (Arc::clone(&bridge), Arc::clone(&broken));
        let forcer = thread::spawn(move || {
            b.set_suppressed();
            x.write(1);
        });
        bridge.check_with(|| broken.read() == 0, "state broken without suppression");
        forcer.join().unwrap();
    });
}

#[test]
#[should_panic(expected = "state broken without suppression")]
fn loom_unfenced_suppression_misses_forced_failure() {
    loom::model(|| {
        let bridge = Arc::new(InvariantBridge::new(SuppressionFencing::Unfenced));
        let broken = Arc::new(AtomicCell::new(0));
        let (b, x) = (Arc::clone(&bridge), Arc::clone(&broken));
        let forcer = thread::spawn(move || {
            b.set_suppressed();
            x.write(1);
        });
        // The flag is read before the condition, so it can be stale while
        // the broken state is already visible.
        bridge.check_with(|| broken.read() == 0, "state broken without suppression");
        forcer.join().unwrap();
    });
}

#[test]
#[should_panic(expected = "fatal invariant violated")]
fn loom_check_fatal_fires_after_suppression() {
    loom::model(|| {
        let bridge = InvariantBridge::default();
        bridge.set_suppressed();
        bridge.check(false, "silenced");
        bridge.check_fatal(false, "grace period ended early");
    });
}
