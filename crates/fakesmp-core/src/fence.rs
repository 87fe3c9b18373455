//! Named memory-ordering operations.
//!
//! The kernel barrier macros (`barrier()`, `smp_mb()`, `smp_load_acquire()`,
//! ...) map onto the six operations below instead of being inlined, so the
//! checker can intercept each one as a distinct [`FenceKind`] event no matter
//! which macro the hosted code spelled. Hardware fences are pinned to `SeqCst`
//! the same way atomic cells are (see [`crate::atomic`]).

use serde::{Deserialize, Serialize};

use crate::atomic::HONORED;
use crate::observe::{self, Event};
use crate::sync::{AtomicBool, AtomicUsize, Ordering, compiler_fence, fence};

/// Fence operation carried by [`Event::Fence`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FenceKind {
    /// Translator-only barrier, no hardware effect.
    Compiler,
    Full,
    Load,
    Store,
    AcquireLoad,
    ReleaseStore,
}

/// A shared location the acquire/release operations can target.
pub trait Location {
    type Value: Copy;

    /// Single untorn load (`READ_ONCE`).
    fn load_once(&self) -> Self::Value;

    /// Single untorn store (`WRITE_ONCE`).
    fn store_once(&self, value: Self::Value);
}

#[inline]
fn publish(kind: FenceKind) {
    tracing::trace!(?kind, "fence");
    if observe::is_active() {
        observe::emit(Event::Fence { fence: kind });
    }
}

/// `barrier()`: forbid compiler reordering across this point.
pub fn compiler_barrier() {
    compiler_fence(Ordering::SeqCst);
    publish(FenceKind::Compiler);
}

/// `mb()` / `smp_mb()`: total order point for loads and stores.
pub fn full_fence() {
    fence(HONORED);
    publish(FenceKind::Full);
}

/// `rmb()`: orders loads. Executed as a full fence.
pub fn load_fence() {
    fence(HONORED);
    publish(FenceKind::Load);
}

/// `wmb()`: orders stores. Executed as a full fence.
pub fn store_fence() {
    fence(HONORED);
    publish(FenceKind::Store);
}

/// `smp_load_acquire()`: no later access may be observed before this load.
pub fn acquire_load<L: Location>(location: &L) -> L::Value {
    let value = location.load_once();
    publish(FenceKind::AcquireLoad);
    value
}

/// `smp_store_release()`: no earlier access may be observed after this store.
pub fn release_store<L: Location>(location: &L, value: L::Value) {
    publish(FenceKind::ReleaseStore);
    location.store_once(value);
}

/// `READ_ONCE()` without ordering beyond the location's own.
pub fn read_once<L: Location>(location: &L) -> L::Value {
    location.load_once()
}

/// `WRITE_ONCE()` without ordering beyond the location's own.
pub fn write_once<L: Location>(location: &L, value: L::Value) {
    location.store_once(value);
}

/// A shared boolean accessed only through [`Location`] operations.
#[derive(Debug, Default)]
pub struct SharedFlag {
    value: AtomicBool,
}

impl SharedFlag {
    #[must_use]
    pub fn new(value: bool) -> Self {
        Self {
            value: AtomicBool::new(value),
        }
    }

    /// Clear the flag, returning whether it was set.
    pub(crate) fn take(&self) -> bool {
        self.value.swap(false, HONORED)
    }
}

impl Location for SharedFlag {
    type Value = bool;

    fn load_once(&self) -> bool {
        self.value.load(HONORED)
    }

    fn store_once(&self, value: bool) {
        self.value.store(value, HONORED);
    }
}

/// A shared unsigned word (`unsigned long`) accessed through [`Location`].
#[derive(Debug, Default)]
pub struct SharedWord {
    value: AtomicUsize,
}

impl SharedWord {
    #[must_use]
    pub fn new(value: usize) -> Self {
        Self {
            value: AtomicUsize::new(value),
        }
    }

    /// Wrapping increment by one writer (`jiffies++`), returning the new value.
    pub(crate) fn bump(&self) -> usize {
        self.value.fetch_add(1, HONORED).wrapping_add(1)
    }
}

impl Location for SharedWord {
    type Value = usize;

    fn load_once(&self) -> usize {
        self.value.load(HONORED)
    }

    fn store_once(&self, value: usize) {
        self.value.store(value, HONORED);
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::atomic::{AtomicCell, AtomicInt};

    #[test]
    fn acquire_release_roundtrip_on_flag() {
        let flag = SharedFlag::new(false);
        release_store(&flag, true);
        assert!(acquire_load(&flag));
    }

    #[test]
    fn acquire_release_on_atomic_cells() {
        let cell = AtomicCell::new(1);
        release_store(&cell, 42);
        assert_eq!(acquire_load(&cell), 42);

        let int = AtomicInt::new(0);
        write_once(&int, -3);
        assert_eq!(read_once(&int), -3);
    }

    #[test]
    fn shared_word_bump_wraps() {
        let word = SharedWord::new(usize::MAX);
        assert_eq!(word.bump(), 0);
        assert_eq!(read_once(&word), 0);
    }

    #[test]
    fn fences_are_callable_anywhere() {
        compiler_barrier();
        full_fence();
        load_fence();
        store_fence();
    }
}
