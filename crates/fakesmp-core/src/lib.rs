//! # fakesmp-core
//!
//! A user-level stand-in for the SMP kernel environment that lock-free kernel
//! algorithms (hierarchical RCU and friends) are written against, so their
//! synchronization logic can run unmodified as ordinary threads under a
//! concurrency checker.
//!
//! The layer provides atomic counters with a declared-but-pinned memory
//! ordering ([`atomic`]), named fences ([`fence`]), soft CPU identity
//! ([`cpu`]), per-CPU storage ([`percpu`]), and an assertion bridge that turns
//! the algorithm's sanity checks into checker-visible failures
//! ([`invariant`]). [`machine::Smp`] ties them into one emulated system.
//!
//! Every operation executes at `SeqCst`. Results obtained through this layer
//! hold for sequential consistency only.
//!
//! Enable the `loom` feature to run the layer inside `loom::model`.

#![deny(unsafe_code)]

pub mod atomic;
pub mod config;
pub mod cpu;
pub mod error;
pub mod fence;
pub mod invariant;
pub mod irq;
pub mod kernel;
#[allow(unsafe_code)]
pub mod list;
#[allow(unsafe_code)]
pub mod machine;
pub mod notifier;
pub mod observe;
#[allow(unsafe_code)]
pub mod percpu;
pub mod printk;
pub mod ratelimit;
mod sync;

#[cfg(all(test, feature = "loom"))]
mod loom_tests;

pub use atomic::{AtomicCell, AtomicInt, MemOrder};
pub use config::{NestingPolicy, SmpConfig, SuppressionFencing};
pub use cpu::{CpuRegistry, CpuSlot};
pub use error::{ConfigError, CpuError, PerCpuError};
pub use invariant::{AssumptionFailed, InvariantBridge, Severity, Violation};
pub use machine::Smp;
pub use observe::{Event, EventLog, Observer};
pub use percpu::{PerCpu, PerCpuArena, PerCpuId};
pub use sync::ThreadKey;

#[doc(hidden)]
pub mod __private {
    pub use tracing;
}
