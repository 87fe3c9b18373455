//! Kernel-spelled entry points.
//!
//! Hosted code written against the kernel API can `use fakesmp_core::kernel::*`
//! and keep its barrier and assertion call sites. Each alias forwards to one
//! operation of [`crate::fence`] or [`crate::invariant`].
//!
//! `smp_rmb()` / `smp_wmb()` and the `smp_mb__{before,after}_atomic()`
//! family are compiler barriers on x86. Here they map to pinned hardware
//! fences so the result does not depend on the host memory model.

use std::sync::Arc;

use crate::fence::{self, Location};
use crate::invariant::InvariantBridge;
use crate::machine::Smp;

pub use crate::fence::{read_once, write_once};

/// Anything the assertion macros can report through.
pub trait HasBridge {
    fn bridge(&self) -> &InvariantBridge;
}

impl HasBridge for InvariantBridge {
    fn bridge(&self) -> &InvariantBridge {
        self
    }
}

impl HasBridge for Smp {
    fn bridge(&self) -> &InvariantBridge {
        Smp::bridge(self)
    }
}

impl<T: HasBridge + ?Sized> HasBridge for &T {
    fn bridge(&self) -> &InvariantBridge {
        (**self).bridge()
    }
}

impl<T: HasBridge + ?Sized> HasBridge for Arc<T> {
    fn bridge(&self) -> &InvariantBridge {
        (**self).bridge()
    }
}

/// `barrier()`.
pub fn barrier() {
    fence::compiler_barrier();
}

/// `mb()`.
pub fn mb() {
    fence::full_fence();
}

/// `rmb()`.
pub fn rmb() {
    fence::load_fence();
}

/// `wmb()`.
pub fn wmb() {
    fence::store_fence();
}

pub fn smp_mb() {
    fence::full_fence();
}

pub fn smp_rmb() {
    fence::load_fence();
}

pub fn smp_wmb() {
    fence::store_fence();
}

#[allow(non_snake_case)]
pub fn smp_mb__before_atomic() {
    fence::full_fence();
}

#[allow(non_snake_case)]
pub fn smp_mb__after_atomic() {
    fence::full_fence();
}

/// `smp_mb__after_unlock_lock()`: no-op on this architecture.
#[allow(non_snake_case)]
pub fn smp_mb__after_unlock_lock() {}

pub fn smp_load_acquire<L: Location>(location: &L) -> L::Value {
    fence::acquire_load(location)
}

pub fn smp_store_release<L: Location>(location: &L, value: L::Value) {
    fence::release_store(location, value);
}

/// `read_barrier_depends()`: no-op, emits nothing.
pub fn read_barrier_depends() {}

/// `smp_read_barrier_depends()`: no-op, emits nothing.
pub fn smp_read_barrier_depends() {}

/// `preempt_disable()`: the bracket is explicit, so only a compiler barrier.
pub fn preempt_disable() {
    fence::compiler_barrier();
}

pub fn preempt_enable() {
    fence::compiler_barrier();
}

pub fn preempt_disable_notrace() {
    fence::compiler_barrier();
}

pub fn preempt_enable_notrace() {
    fence::compiler_barrier();
}

/// `DIV_ROUND_UP(n, d)`.
#[must_use]
pub const fn div_round_up(n: usize, d: usize) -> usize {
    n.div_ceil(d)
}

/// `ULONG_CMP_GE(a, b)`: wrap-safe `a >= b` on free-running counters.
#[must_use]
pub const fn ulong_cmp_ge(a: usize, b: usize) -> bool {
    usize::MAX / 2 >= a.wrapping_sub(b)
}

/// `ULONG_CMP_LT(a, b)`: wrap-safe `a < b` on free-running counters.
#[must_use]
pub const fn ulong_cmp_lt(a: usize, b: usize) -> bool {
    usize::MAX / 2 < a.wrapping_sub(b)
}

/// `WARN_ON(cond)`: recoverable defect when `cond` holds. Evaluates to `cond`.
#[macro_export]
macro_rules! warn_on {
    ($ctx:expr, $cond:expr $(,)?) => {{
        let cond: bool = $cond;
        $crate::kernel::HasBridge::bridge(&$ctx)
            .check(!cond, concat!("WARN_ON(", stringify!($cond), ")"));
        cond
    }};
}

/// `WARN_ON_ONCE(cond)`. Every occurrence is reported, like `WARN_ON`.
#[macro_export]
macro_rules! warn_on_once {
    ($ctx:expr, $cond:expr $(,)?) => {{
        let cond: bool = $cond;
        $crate::kernel::HasBridge::bridge(&$ctx)
            .check(!cond, concat!("WARN_ON_ONCE(", stringify!($cond), ")"));
        cond
    }};
}

/// `WARN_ONCE(cond, fmt, ...)`: like `warn_on!` with a formatted message.
#[macro_export]
macro_rules! warn_once {
    ($ctx:expr, $cond:expr, $($arg:tt)+) => {{
        let cond: bool = $cond;
        if cond {
            $crate::kernel::HasBridge::bridge(&$ctx).check(false, &format!($($arg)+));
        }
        cond
    }};
}

/// `BUG_ON(cond)`: recoverable defect when `cond` holds.
#[macro_export]
macro_rules! bug_on {
    ($ctx:expr, $cond:expr $(,)?) => {{
        let cond: bool = $cond;
        $crate::kernel::HasBridge::bridge(&$ctx)
            .check(!cond, concat!("BUG_ON(", stringify!($cond), ")"));
    }};
}

/// `BUILD_BUG_ON(cond)`: rejected at compile time.
#[macro_export]
macro_rules! build_bug_on {
    ($cond:expr $(,)?) => {
        let _: () = const {
            assert!(!$cond, concat!("BUILD_BUG_ON(", stringify!($cond), ")"));
        };
    };
}

/// `panic(fmt, ...)`: fatal defect, never returns.
#[macro_export]
macro_rules! kernel_panic {
    ($ctx:expr, $($arg:tt)+) => {{
        $crate::kernel::HasBridge::bridge(&$ctx).kernel_panic(&format!($($arg)+))
    }};
}
