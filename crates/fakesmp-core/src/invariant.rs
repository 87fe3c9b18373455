//! Invariant bridge.
//!
//! Turns the hosted code's sanity checks (`WARN_ON`, `BUG_ON`, ...) into
//! checker-visible failures. A failed check is published as
//! [`Event::Violation`], logged at `error`, and halts the calling thread with
//! a panic, which the checker records as a failed execution.
//!
//! Recoverable checks can be switched off once with
//! [`InvariantBridge::set_suppressed`]: after a deliberate forced failure the
//! hosted code may legitimately break its own invariants, and only
//! [`InvariantBridge::check_fatal`] keeps firing. The suppression flag is
//! published with a full fence after the write and observed with a full fence
//! before the read, and only read once the condition has already failed.
//! [`SuppressionFencing::Unfenced`] drops both fences and reads the flag
//! first, reproducing a known ordering bug a checker should be able to find.
//!
//! [`InvariantBridge::assume`] is the opposite of a check: a false assumption
//! is not a defect but an execution outside the checked set. The thread
//! unwinds with an [`AssumptionFailed`] payload, nothing is published as a
//! violation, and runners count the execution as pruned. Under `loom` the
//! unwind still fails the model; keep assumptions to std-thread harnesses.

use std::fmt;
use std::panic::Location;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::atomic::HONORED;
use crate::config::SuppressionFencing;
use crate::cpu::{CpuRegistry, CpuSlot};
use crate::fence::full_fence;
use crate::observe::{self, Event};
use crate::sync::{AtomicBool, Ordering};

/// How a failed check is classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// `WARN_ON` / `BUG_ON`: silenced by suppression.
    Recoverable,
    /// `BUILD_BUG_ON`: rejected at compile time, never reported at run time.
    Build,
    /// Fires regardless of suppression.
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Recoverable => "recoverable",
            Self::Build => "build",
            Self::Fatal => "fatal",
        })
    }
}

/// A failed check as reported to the checker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub severity: Severity,
    pub message: String,
    /// `file:line:column` of the check.
    pub location: String,
    /// CPU of the failing thread, when it had one.
    pub cpu: Option<CpuSlot>,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} invariant violated at {}", self.severity, self.location)?;
        if let Some(cpu) = self.cpu {
            write!(f, " on {cpu}")?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Panic payload of a false [`InvariantBridge::assume`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssumptionFailed {
    /// `file:line:column` of the assumption.
    pub location: String,
    pub cpu: Option<CpuSlot>,
}

impl AssumptionFailed {
    /// The assumption carried by a caught panic, if that is what it was.
    #[must_use]
    pub fn from_payload(payload: &(dyn std::any::Any + Send)) -> Option<&Self> {
        payload.downcast_ref::<Self>()
    }
}

impl fmt::Display for AssumptionFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "assumption failed at {}", self.location)?;
        if let Some(cpu) = self.cpu {
            write!(f, " on {cpu}")?;
        }
        Ok(())
    }
}

/// Assertion entry point shared by every thread of one machine.
#[derive(Debug)]
pub struct InvariantBridge {
    suppressed: AtomicBool,
    fencing: SuppressionFencing,
    registry: Option<Arc<CpuRegistry>>,
}

impl Default for InvariantBridge {
    fn default() -> Self {
        Self::new(SuppressionFencing::Fenced)
    }
}

impl InvariantBridge {
    /// Standalone bridge. Violations carry no CPU.
    #[must_use]
    pub fn new(fencing: SuppressionFencing) -> Self {
        Self {
            suppressed: AtomicBool::new(false),
            fencing,
            registry: None,
        }
    }

    /// Bridge whose violations name the failing thread's CPU.
    #[must_use]
    pub fn with_registry(fencing: SuppressionFencing, registry: Arc<CpuRegistry>) -> Self {
        Self {
            registry: Some(registry),
            ..Self::new(fencing)
        }
    }

    #[must_use]
    pub fn fencing(&self) -> SuppressionFencing {
        self.fencing
    }

    /// `WARN_ON(!condition)`: a defect unless suppressed.
    #[track_caller]
    pub fn check(&self, condition: bool, message: &str) {
        self.check_with(|| condition, message);
    }

    /// [`Self::check`] with a lazily evaluated condition, so the order of the
    /// condition's loads relative to the suppression flag read is part of
    /// the checked program.
    #[track_caller]
    pub fn check_with(&self, condition: impl FnOnce() -> bool, message: &str) {
        let silenced = match self.fencing {
            SuppressionFencing::Fenced => condition() || self.is_suppressed(),
            SuppressionFencing::Unfenced => self.is_suppressed() || condition(),
        };
        if !silenced {
            self.fail(Severity::Recoverable, message);
        }
    }

    /// A defect whatever the suppression state.
    #[track_caller]
    pub fn check_fatal(&self, condition: bool, message: &str) {
        if !condition {
            self.fail(Severity::Fatal, message);
        }
    }

    /// `SET_NOASSERT()`: silence recoverable checks from now on. One-way;
    /// repeated calls are no-ops.
    pub fn set_suppressed(&self) {
        let first = match self.fencing {
            SuppressionFencing::Fenced => {
                let was = self.suppressed.swap(true, HONORED);
                full_fence();
                !was
            }
            SuppressionFencing::Unfenced => !self.suppressed.swap(true, Ordering::Relaxed),
        };
        if first {
            tracing::info!(fencing = ?self.fencing, "invariant checks suppressed");
            if observe::is_active() {
                observe::emit(Event::Suppressed);
            }
        }
    }

    /// `CK_NOASSERT()`.
    #[must_use]
    pub fn is_suppressed(&self) -> bool {
        match self.fencing {
            SuppressionFencing::Fenced => {
                full_fence();
                self.suppressed.load(HONORED)
            }
            SuppressionFencing::Unfenced => self.suppressed.load(Ordering::Relaxed),
        }
    }

    /// `__VERIFIER_assume(condition)`: prune the execution unless
    /// `condition` holds.
    #[track_caller]
    pub fn assume(&self, condition: bool) {
        if !condition {
            self.prune();
        }
    }

    /// `panic()`: report a fatal defect unconditionally.
    #[track_caller]
    pub fn kernel_panic(&self, message: &str) -> ! {
        self.fail(Severity::Fatal, message)
    }

    #[cold]
    #[track_caller]
    fn fail(&self, severity: Severity, message: &str) -> ! {
        let location = Location::caller();
        let violation = Violation {
            severity,
            message: message.to_string(),
            location: location.to_string(),
            cpu: self.registry.as_ref().and_then(|r| r.known_cpu()),
        };
        tracing::error!(
            %severity,
            location = %violation.location,
            cpu = ?violation.cpu,
            "{message}"
        );
        if observe::is_active() {
            observe::emit(Event::Violation(violation.clone()));
        }
        panic!("{violation}");
    }

    #[cold]
    #[track_caller]
    fn prune(&self) -> ! {
        let assumption = AssumptionFailed {
            location: Location::caller().to_string(),
            cpu: self.registry.as_ref().and_then(|r| r.known_cpu()),
        };
        tracing::debug!(
            location = %assumption.location,
            cpu = ?assumption.cpu,
            "assumption failed, execution pruned"
        );
        std::panic::resume_unwind(Box::new(assumption))
    }
}
