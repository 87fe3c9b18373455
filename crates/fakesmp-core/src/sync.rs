//! Backend switch between std and loom primitives.
//!
//! Everything the checker has to see (atomic cells, fences, thread identity)
//! is imported from here. With the `loom` feature the layer runs inside
//! `loom::model` and every operation becomes an exploration point.

#[cfg(feature = "loom")]
pub(crate) use loom::sync::atomic::{AtomicBool, AtomicI32, AtomicIsize, AtomicUsize, fence};

#[cfg(not(feature = "loom"))]
pub(crate) use std::sync::atomic::{AtomicBool, AtomicI32, AtomicIsize, AtomicUsize, fence};

pub(crate) use std::sync::atomic::{Ordering, compiler_fence};

/// Identity of an execution thread as seen by the active backend.
#[cfg(feature = "loom")]
pub type ThreadKey = loom::thread::ThreadId;

/// Identity of an execution thread as seen by the active backend.
#[cfg(not(feature = "loom"))]
pub type ThreadKey = std::thread::ThreadId;

/// Key of the calling thread.
#[cfg(feature = "loom")]
pub(crate) fn current_thread() -> ThreadKey {
    loom::thread::current().id()
}

/// Key of the calling thread.
#[cfg(not(feature = "loom"))]
pub(crate) fn current_thread() -> ThreadKey {
    std::thread::current().id()
}
