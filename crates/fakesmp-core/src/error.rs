//! Error taxonomy for the emulation layer.
//!
//! Configuration and registry errors are ordinary `Result` values. Invariant
//! violations are not errors: they are reported to the checker and halt the
//! calling thread (see [`crate::invariant`]).

use thiserror::Error;

use crate::cpu::CpuSlot;

/// Rejected machine configuration. Never silently clamped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("CPU pool size must be at least 1")]
    NoCpus,
    #[error("CPU pool size {requested} exceeds the supported maximum {max}")]
    TooManyCpus { requested: usize, max: usize },
    #[error("RCU fanout must be at least 2, got {0}")]
    BadFanout(usize),
    #[error("RCU leaf fanout {leaf} must be in 1..={fanout}")]
    BadLeafFanout { leaf: usize, fanout: usize },
    #[error("{nr_cpus} CPUs need more than {max_levels} combining-tree levels")]
    TreeTooDeep { nr_cpus: usize, max_levels: usize },
    #[error("stall timeout must be non-zero")]
    ZeroStallTimeout,
    #[error("HZ must be non-zero")]
    ZeroHz,
    #[error("{var}: cannot parse {value:?}")]
    Unparsable { var: &'static str, value: String },
}

/// Misuse of the CPU identity registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CpuError {
    #[error("CPU slot {slot} out of range for a pool of {nr_cpus}")]
    OutOfRange { slot: usize, nr_cpus: usize },
    #[error("CPU slot {0} is already assigned to another thread")]
    AlreadyAssigned(CpuSlot),
    #[error("no free CPU slot left in a pool of {0}")]
    PoolExhausted(usize),
    #[error("CPU slot {0} is held by another thread")]
    HeldElsewhere(CpuSlot),
    #[error("calling thread is inside a soft-acquire bracket on CPU slot {0}")]
    Pinned(CpuSlot),
    #[error("CPU slot {0} acquired twice by the same thread")]
    DoubleAcquire(CpuSlot),
    #[error("CPU slot {0} released without a matching acquire")]
    UnmatchedRelease(CpuSlot),
}

/// Misuse of the per-CPU arena.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PerCpuError {
    #[error("per-CPU variable {0:?} is already defined")]
    Duplicate(String),
    #[error("per-CPU variable {0:?} is not defined")]
    Unknown(String),
    #[error("per-CPU variable {0:?} has a different element type")]
    TypeMismatch(String),
    #[error("CPU slot {slot} out of range for a per-CPU variable of {nr_cpus}")]
    SlotOutOfRange { slot: usize, nr_cpus: usize },
}
