//! Atomic cells with a declared-but-pinned memory ordering.
//!
//! The hosted kernel code uses `atomic_t` / `atomic_long_t` counters whose
//! operations nominally carry weaker orderings. The checker behind this layer
//! is only sound under sequential consistency, so every operation executes at
//! `SeqCst` whatever was declared. The declared ordering is still recorded on
//! the cell and in every emitted event: results obtained here hold for the SC
//! model only, and [`MemOrder::is_pinned`] tells which call sites were
//! strengthened. A relaxed-memory checker can later honor the declared
//! ordering without touching call sites.
//!
//! The cell's ordering is the default for each operation. The `*_ordered`
//! variants declare an ordering for one call, the way the kernel's
//! `_relaxed` / `_acquire` / `_release` suffixes do, and that ordering is
//! what the event records.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::fence::Location;
use crate::observe::{self, Event};
use crate::sync::{AtomicI32, AtomicIsize, Ordering};

/// Ordering actually used for every operation.
pub(crate) const HONORED: Ordering = Ordering::SeqCst;

/// A memory ordering as requested by client code.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemOrder {
    Relaxed,
    Acquire,
    Release,
    AcqRel,
    #[default]
    SeqCst,
}

impl MemOrder {
    /// The ordering the layer executes for this request. Always `SeqCst`.
    #[must_use]
    pub const fn honored(self) -> Self {
        Self::SeqCst
    }

    /// True when the request was strengthened to honor it.
    #[must_use]
    pub const fn is_pinned(self) -> bool {
        !matches!(self, Self::SeqCst)
    }
}

/// Operation kind carried by [`Event::Atomic`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum AtomicOp {
    Read,
    Write,
    Add,
    Sub,
    Swap,
    CompareAndSwap { success: bool },
}

macro_rules! atomic_cell {
    ($(#[$meta:meta])* $name:ident, $value:ty, $backing:ident) => {
        $(#[$meta])*
        pub struct $name {
            value: $backing,
            declared: MemOrder,
        }

        impl $name {
            /// New cell declaring `SeqCst`.
            #[must_use]
            pub fn new(value: $value) -> Self {
                Self::with_order(value, MemOrder::SeqCst)
            }

            /// New cell declaring `declared` (executed as `SeqCst`).
            #[must_use]
            pub fn with_order(value: $value, declared: MemOrder) -> Self {
                Self {
                    value: $backing::new(value),
                    declared,
                }
            }

            /// Ordering requested for this cell.
            #[must_use]
            pub fn declared_order(&self) -> MemOrder {
                self.declared
            }

            #[inline]
            fn publish(&self, op: AtomicOp, value: $value, declared: MemOrder) {
                if observe::is_active() {
                    observe::emit(Event::Atomic {
                        cell: self as *const Self as usize,
                        op,
                        declared,
                        value: value as i64,
                    });
                }
            }

            /// `atomic_read`.
            pub fn read(&self) -> $value {
                self.read_ordered(self.declared)
            }

            /// `atomic_read` declaring `order` for this call only.
            pub fn read_ordered(&self, order: MemOrder) -> $value {
                let v = self.value.load(HONORED);
                self.publish(AtomicOp::Read, v, order);
                v
            }

            /// `atomic_set`.
            pub fn write(&self, value: $value) {
                self.write_ordered(value, self.declared);
            }

            /// `atomic_set` declaring `order` for this call only.
            pub fn write_ordered(&self, value: $value, order: MemOrder) {
                self.value.store(value, HONORED);
                self.publish(AtomicOp::Write, value, order);
            }

            /// `atomic_add_return`: add `delta` (wrapping) and return the new value.
            pub fn add(&self, delta: $value) -> $value {
                self.add_ordered(delta, self.declared)
            }

            /// [`add`](Self::add) declaring `order` for this call only,
            /// e.g. `atomic_add_return_relaxed`.
            pub fn add_ordered(&self, delta: $value, order: MemOrder) -> $value {
                let new = self.value.fetch_add(delta, HONORED).wrapping_add(delta);
                self.publish(AtomicOp::Add, new, order);
                new
            }

            /// `atomic_sub_return`: subtract `delta` (wrapping) and return the new value.
            pub fn sub(&self, delta: $value) -> $value {
                self.sub_ordered(delta, self.declared)
            }

            pub fn sub_ordered(&self, delta: $value, order: MemOrder) -> $value {
                let new = self.value.fetch_sub(delta, HONORED).wrapping_sub(delta);
                self.publish(AtomicOp::Sub, new, order);
                new
            }

            /// `atomic_inc`.
            pub fn increment(&self) {
                self.add(1);
            }

            /// `atomic_dec`.
            pub fn decrement(&self) {
                self.sub(1);
            }

            /// `atomic_inc_return`.
            pub fn increment_return(&self) -> $value {
                self.add(1)
            }

            /// `atomic_dec_and_test`: true when the decrement reached zero.
            pub fn decrement_and_test(&self) -> bool {
                self.sub(1) == 0
            }

            /// `atomic_xchg`: store `value`, return the previous value.
            pub fn swap(&self, value: $value) -> $value {
                self.swap_ordered(value, self.declared)
            }

            pub fn swap_ordered(&self, value: $value, order: MemOrder) -> $value {
                let old = self.value.swap(value, HONORED);
                self.publish(AtomicOp::Swap, old, order);
                old
            }

            /// Store `new` iff the current value equals `expected`.
            pub fn compare_and_swap(&self, expected: $value, new: $value) -> bool {
                self.compare_exchange(expected, new).is_ok()
            }

            /// `atomic_cmpxchg` with the witnessed value: `Ok(previous)` on
            /// success, `Err(actual)` when the value differed from `expected`.
            pub fn compare_exchange(&self, expected: $value, new: $value) -> Result<$value, $value> {
                self.compare_exchange_ordered(expected, new, self.declared)
            }

            /// [`compare_exchange`](Self::compare_exchange) declaring `order`
            /// for this call only, e.g. `atomic_cmpxchg_acquire`.
            pub fn compare_exchange_ordered(
                &self,
                expected: $value,
                new: $value,
                order: MemOrder,
            ) -> Result<$value, $value> {
                let result = self.value.compare_exchange(expected, new, HONORED, HONORED);
                let witnessed = match result {
                    Ok(v) | Err(v) => v,
                };
                self.publish(
                    AtomicOp::CompareAndSwap {
                        success: result.is_ok(),
                    },
                    witnessed,
                    order,
                );
                result
            }
        }

        // READ_ONCE / WRITE_ONCE on a counter are plain reads and writes of it.
        impl Location for $name {
            type Value = $value;

            fn load_once(&self) -> $value {
                self.read()
            }

            fn store_once(&self, value: $value) {
                self.write(value);
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new(0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("value", &self.value.load(HONORED))
                    .field("declared", &self.declared)
                    .finish()
            }
        }
    };
}

atomic_cell!(
    /// Machine-word signed counter (`atomic_long_t`).
    AtomicCell,
    isize,
    AtomicIsize
);

atomic_cell!(
    /// 32-bit signed counter (`atomic_t`).
    AtomicInt,
    i32,
    AtomicI32
);
