//! CPU identity registry.
//!
//! Maps every execution thread to one virtual CPU slot out of a fixed pool and
//! tracks which thread currently holds each slot inside a soft acquire/release
//! bracket (the stand-in for `local_irq_disable()` / `preempt_disable()`).
//!
//! # Design
//!
//! - A thread gets the lowest unassigned slot the first time it asks for its
//!   identity, or an explicit slot through [`CpuRegistry::assign_cpu`].
//!   There is no migration: the mapping is fixed for the thread's lifetime.
//! - The acquire/release bracket never blocks. Interleaving belongs to the
//!   checker; the registry only records who holds what and refuses a second
//!   holder.
//! - Nesting depth is only checked under [`NestingPolicy::Report`].
//!
//! Bookkeeping lives behind one `parking_lot` mutex. No checker-visible
//! operation happens while it is held, so the lock never hides an
//! interleaving point.

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::NestingPolicy;
use crate::error::CpuError;
use crate::observe::{self, Event};
use crate::sync::{self, ThreadKey};

/// A virtual CPU identity in `[0, nr_cpus)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CpuSlot(usize);

impl CpuSlot {
    pub(crate) const fn new(index: usize) -> Self {
        Self(index)
    }

    /// Index into per-CPU arrays.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for CpuSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

/// Registry operation carried by [`Event::Cpu`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CpuOp {
    Assign,
    Acquire,
    Release,
}

/// Ascending iterator over every slot of the pool.
#[derive(Debug, Clone)]
pub struct CpuIter {
    next: usize,
    end: usize,
}

impl Iterator for CpuIter {
    type Item = CpuSlot;

    fn next(&mut self) -> Option<CpuSlot> {
        if self.next >= self.end {
            return None;
        }
        let slot = CpuSlot(self.next);
        self.next += 1;
        Some(slot)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.end - self.next;
        (n, Some(n))
    }
}

impl ExactSizeIterator for CpuIter {}

#[derive(Debug, Default, Clone, Copy)]
struct SlotState {
    /// Thread whose identity is this slot.
    assigned: Option<ThreadKey>,
    /// Thread inside an acquire bracket on this slot.
    holder: Option<ThreadKey>,
}

#[derive(Debug)]
struct Inner {
    threads: HashMap<ThreadKey, CpuSlot>,
    slots: Vec<SlotState>,
}

/// Thread-to-CPU identity table.
#[derive(Debug)]
pub struct CpuRegistry {
    nr_cpus: usize,
    nesting: NestingPolicy,
    inner: Mutex<Inner>,
}

fn publish(op: CpuOp, slot: CpuSlot) {
    if observe::is_active() {
        observe::emit(Event::Cpu { op, slot });
    }
}

impl CpuRegistry {
    /// Registry for a pool of `nr_cpus` slots. The pool size is validated by
    /// [`crate::config::SmpConfig::validate`].
    #[must_use]
    pub fn new(nr_cpus: usize, nesting: NestingPolicy) -> Self {
        Self {
            nr_cpus,
            nesting,
            inner: Mutex::new(Inner {
                threads: HashMap::with_capacity(nr_cpus),
                slots: vec![SlotState::default(); nr_cpus],
            }),
        }
    }

    /// Pool size (`nr_cpu_ids`).
    #[must_use]
    pub fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }

    /// Configured nesting policy.
    #[must_use]
    pub fn nesting(&self) -> NestingPolicy {
        self.nesting
    }

    /// Range-checked slot for `index`.
    pub fn slot(&self, index: usize) -> Result<CpuSlot, CpuError> {
        if index < self.nr_cpus {
            Ok(CpuSlot(index))
        } else {
            Err(CpuError::OutOfRange {
                slot: index,
                nr_cpus: self.nr_cpus,
            })
        }
    }

    /// `smp_processor_id()`: the calling thread's slot, assigning the lowest
    /// free one on first use.
    pub fn current_cpu(&self) -> Result<CpuSlot, CpuError> {
        let me = sync::current_thread();
        let mut inner = self.inner.lock();
        if let Some(&slot) = inner.threads.get(&me) {
            return Ok(slot);
        }
        let index = inner
            .slots
            .iter()
            .position(|state| state.assigned.is_none())
            .ok_or(CpuError::PoolExhausted(self.nr_cpus))?;
        inner.slots[index].assigned = Some(me);
        let slot = CpuSlot(index);
        inner.threads.insert(me, slot);
        drop(inner);

        tracing::debug!(%slot, thread = ?me, "assigned CPU on first query");
        publish(CpuOp::Assign, slot);
        Ok(slot)
    }

    /// `set_cpu()`: place the calling thread on `index` explicitly.
    ///
    /// Moving a thread is allowed only outside an acquire bracket.
    pub fn assign_cpu(&self, index: usize) -> Result<CpuSlot, CpuError> {
        let slot = self.slot(index)?;
        let me = sync::current_thread();
        let mut inner = self.inner.lock();

        match inner.slots[index].assigned {
            Some(owner) if owner == me => return Ok(slot),
            Some(_) => return Err(CpuError::AlreadyAssigned(slot)),
            None => {}
        }

        if let Some(&previous) = inner.threads.get(&me) {
            if inner.slots[previous.index()].holder == Some(me) {
                return Err(CpuError::Pinned(previous));
            }
            inner.slots[previous.index()].assigned = None;
        }
        inner.slots[index].assigned = Some(me);
        inner.threads.insert(me, slot);
        drop(inner);

        tracing::debug!(%slot, thread = ?me, "assigned CPU explicitly");
        publish(CpuOp::Assign, slot);
        Ok(slot)
    }

    /// `fake_acquire_cpu()`: enter the non-preemptible bracket on `slot`.
    pub fn soft_acquire(&self, slot: CpuSlot) -> Result<(), CpuError> {
        let slot = self.slot(slot.index())?;
        let me = sync::current_thread();
        let mut inner = self.inner.lock();
        let state = &mut inner.slots[slot.index()];

        match state.holder {
            None => state.holder = Some(me),
            Some(holder) if holder == me => {
                if self.nesting == NestingPolicy::Report {
                    return Err(CpuError::DoubleAcquire(slot));
                }
            }
            Some(_) => return Err(CpuError::HeldElsewhere(slot)),
        }
        drop(inner);

        publish(CpuOp::Acquire, slot);
        Ok(())
    }

    /// `fake_release_cpu()`: leave the bracket on `slot`.
    pub fn soft_release(&self, slot: CpuSlot) -> Result<(), CpuError> {
        let slot = self.slot(slot.index())?;
        let me = sync::current_thread();
        let mut inner = self.inner.lock();
        let state = &mut inner.slots[slot.index()];

        match state.holder {
            Some(holder) if holder == me => state.holder = None,
            _ if self.nesting == NestingPolicy::Report => {
                return Err(CpuError::UnmatchedRelease(slot));
            }
            _ => return Ok(()),
        }
        drop(inner);

        publish(CpuOp::Release, slot);
        Ok(())
    }

    /// True when some thread is inside an acquire bracket on `slot`.
    #[must_use]
    pub fn is_held(&self, slot: CpuSlot) -> bool {
        self.inner
            .lock()
            .slots
            .get(slot.index())
            .is_some_and(|state| state.holder.is_some())
    }

    /// True when the calling thread holds `slot`.
    #[must_use]
    pub fn held_by_current(&self, slot: CpuSlot) -> bool {
        let me = sync::current_thread();
        self.inner
            .lock()
            .slots
            .get(slot.index())
            .is_some_and(|state| state.holder == Some(me))
    }

    /// Thread whose identity is `slot`, if any.
    #[must_use]
    pub fn assigned_thread(&self, slot: CpuSlot) -> Option<ThreadKey> {
        self.inner
            .lock()
            .slots
            .get(slot.index())
            .and_then(|state| state.assigned)
    }

    /// Thread inside an acquire bracket on `slot`, if any.
    #[must_use]
    pub fn holder_of(&self, slot: CpuSlot) -> Option<ThreadKey> {
        self.inner
            .lock()
            .slots
            .get(slot.index())
            .and_then(|state| state.holder)
    }

    /// The calling thread's slot if it already has one. Never assigns.
    #[must_use]
    pub fn known_cpu(&self) -> Option<CpuSlot> {
        let me = sync::current_thread();
        self.inner.lock().threads.get(&me).copied()
    }

    /// `for_each_possible_cpu`.
    #[must_use]
    pub fn possible_cpus(&self) -> CpuIter {
        CpuIter {
            next: 0,
            end: self.nr_cpus,
        }
    }

    /// `for_each_online_cpu`. Hotplug is not emulated, so this is the
    /// possible set.
    #[must_use]
    pub fn online_cpus(&self) -> CpuIter {
        self.possible_cpus()
    }
}
