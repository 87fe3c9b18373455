//! Checker event surface.
//!
//! Every atomic operation, fence, registry operation, suppression transition
//! and invariant violation is published here as one [`Event`]. A checker (or a
//! test) installs an [`Observer`]; with none installed, publishing costs a
//! single relaxed load.
//!
//! The observer slot is process-global and uses std primitives even under the
//! `loom` feature: it is harness plumbing, not part of the modelled program.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock, const_rwlock};
use serde::{Deserialize, Serialize};

use crate::atomic::{AtomicOp, MemOrder};
use crate::cpu::{CpuOp, CpuSlot};
use crate::fence::FenceKind;
use crate::invariant::Violation;

/// One checker-visible step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    Atomic {
        /// Address of the cell, stable for its lifetime.
        cell: usize,
        op: AtomicOp,
        declared: MemOrder,
        /// New value for writes and read-modify-writes, old value for swaps
        /// and compare-exchange.
        value: i64,
    },
    Fence {
        fence: FenceKind,
    },
    Cpu {
        op: CpuOp,
        slot: CpuSlot,
    },
    /// The invariant bridge entered its terminal suppressed state.
    Suppressed,
    Violation(Violation),
}

impl Event {
    /// Short name used in logs and summaries.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Atomic { .. } => "atomic",
            Self::Fence { .. } => "fence",
            Self::Cpu { .. } => "cpu",
            Self::Suppressed => "suppressed",
            Self::Violation(_) => "violation",
        }
    }
}

/// Receiver of published events. Called on the publishing thread.
pub trait Observer: Send + Sync {
    fn on_event(&self, event: &Event);
}

impl<F> Observer for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn on_event(&self, event: &Event) {
        self(event);
    }
}

static ACTIVE: AtomicBool = AtomicBool::new(false);
static OBSERVER: RwLock<Option<Arc<dyn Observer>>> = const_rwlock(None);

/// True when an observer is installed.
#[inline]
#[must_use]
pub fn is_active() -> bool {
    ACTIVE.load(Ordering::Relaxed)
}

/// Deliver `event` to the installed observer, if any.
pub fn emit(event: Event) {
    let observer = OBSERVER.read().clone();
    if let Some(observer) = observer {
        observer.on_event(&event);
    }
}

/// Install `observer`, replacing the current one until the guard drops.
pub fn install(observer: Arc<dyn Observer>) -> ObserverGuard {
    let previous = OBSERVER.write().replace(observer);
    ACTIVE.store(true, Ordering::Release);
    ObserverGuard { previous }
}

/// Restores the previously installed observer on drop.
#[must_use = "dropping the guard uninstalls the observer"]
pub struct ObserverGuard {
    previous: Option<Arc<dyn Observer>>,
}

impl std::fmt::Debug for ObserverGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverGuard")
            .field("restores_previous", &self.previous.is_some())
            .finish()
    }
}

impl Drop for ObserverGuard {
    fn drop(&mut self) {
        let mut slot = OBSERVER.write();
        *slot = self.previous.take();
        ACTIVE.store(slot.is_some(), Ordering::Release);
    }
}

/// Recording observer: keeps every event in publication order.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<Event>>,
}

impl EventLog {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Copy of everything recorded so far.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Drain the recorded events.
    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of recorded events whose [`Event::kind`] is `kind`.
    #[must_use]
    pub fn count(&self, kind: &str) -> usize {
        self.events.lock().iter().filter(|e| e.kind() == kind).count()
    }

    /// Recorded violations, oldest first.
    #[must_use]
    pub fn violations(&self) -> Vec<Violation> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Violation(v) => Some(v.clone()),
                _ => None,
            })
            .collect()
    }
}

impl Observer for EventLog {
    fn on_event(&self, event: &Event) {
        self.events.lock().push(event.clone());
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    // Installing an observer is process-wide; these tests only check
    // serialization and the log itself. Delivery is covered by
    // `tests/observer_events_test.rs`, which runs in its own binary.

    #[test]
    fn events_serialize_with_kind_tag() {
        let event = Event::Fence {
            fence: FenceKind::AcquireLoad,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"kind":"fence","fence":"acquire_load"}"#);

        let event = Event::Atomic {
            cell: 16,
            op: AtomicOp::CompareAndSwap { success: true },
            declared: MemOrder::Relaxed,
            value: -1,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "atomic");
        assert_eq!(json["declared"], "relaxed");
        assert_eq!(json["op"]["op"], "compare_and_swap");
        assert_eq!(json["op"]["success"], true);
        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn event_log_counts_by_kind() {
        let log = EventLog::default();
        log.on_event(&Event::Suppressed);
        log.on_event(&Event::Fence {
            fence: FenceKind::Full,
        });
        log.on_event(&Event::Fence {
            fence: FenceKind::Compiler,
        });
        assert_eq!(log.len(), 3);
        assert_eq!(log.count("fence"), 2);
        assert_eq!(log.count("suppressed"), 1);
        assert!(log.violations().is_empty());
        assert_eq!(log.take().len(), 3);
        assert!(log.is_empty());
    }

    #[test]
    fn closures_are_observers() {
        let hits = Mutex::new(0usize);
        let observer = |_: &Event| *hits.lock() += 1;
        observer.on_event(&Event::Suppressed);
        observer.on_event(&Event::Suppressed);
        assert_eq!(*hits.lock(), 2);
    }
}
