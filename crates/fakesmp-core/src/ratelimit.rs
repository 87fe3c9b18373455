//! `struct ratelimit_state`.
//!
//! The window bookkeeping follows the kernel's `__ratelimit`, driven by an
//! explicit `now` in jiffies. [`warn_on_ratelimit`] does not consult the
//! state: every failure is reported, as `WARN_ON_RATELIMIT` does in the
//! emulated kernel.

use crate::config::HZ;
use crate::invariant::InvariantBridge;

/// `DEFAULT_RATELIMIT_INTERVAL`, in jiffies.
pub const DEFAULT_RATELIMIT_INTERVAL: u64 = 5 * HZ as u64;
/// `DEFAULT_RATELIMIT_BURST`.
pub const DEFAULT_RATELIMIT_BURST: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitState {
    /// Window length in jiffies. Zero disables limiting.
    pub interval: u64,
    /// Messages allowed per window.
    pub burst: u32,
    pub printed: u32,
    pub missed: u32,
    /// Jiffies at which the current window opened. Zero before first use.
    pub begin: u64,
}

impl Default for RateLimitState {
    fn default() -> Self {
        Self::new(DEFAULT_RATELIMIT_INTERVAL, DEFAULT_RATELIMIT_BURST)
    }
}

impl RateLimitState {
    /// `RATELIMIT_STATE_INIT(name, interval, burst)`.
    #[must_use]
    pub const fn new(interval: u64, burst: u32) -> Self {
        Self {
            interval,
            burst,
            printed: 0,
            missed: 0,
            begin: 0,
        }
    }

    /// `RATELIMIT_STATE_INIT_DISABLED`.
    #[must_use]
    pub const fn disabled() -> Self {
        Self::new(0, DEFAULT_RATELIMIT_BURST)
    }

    /// `__ratelimit`: true when a message may be emitted at `now`.
    pub fn allow(&mut self, now: u64) -> bool {
        if self.interval == 0 {
            return true;
        }
        if self.begin == 0 {
            self.begin = now;
        }
        if now.wrapping_sub(self.begin) > self.interval {
            if self.missed > 0 {
                tracing::warn!(missed = self.missed, "callbacks suppressed");
            }
            self.begin = now;
            self.printed = 0;
            self.missed = 0;
        }
        if self.burst > self.printed {
            self.printed += 1;
            true
        } else {
            self.missed += 1;
            false
        }
    }
}

/// `WARN_ON_RATELIMIT(condition, state)`: a recoverable defect when
/// `condition` holds. Returns `condition`.
#[track_caller]
pub fn warn_on_ratelimit(bridge: &InvariantBridge, condition: bool, _state: &RateLimitState) -> bool {
    bridge.check(!condition, "WARN_ON_RATELIMIT");
    condition
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn disabled_state_always_allows() {
        let mut state = RateLimitState::disabled();
        assert!((0..100).all(|t| state.allow(t)));
    }

    #[test]
    fn burst_then_window_reset() {
        let mut state = RateLimitState::new(10, 2);
        assert!(state.allow(1));
        assert!(state.allow(2));
        assert!(!state.allow(3));
        assert!(!state.allow(11));
        assert_eq!(state.missed, 2);
        assert!(state.allow(12));
        assert_eq!(state.missed, 0);
        assert_eq!(state.printed, 1);
        assert_eq!(state.begin, 12);
    }

    #[test]
    fn warn_on_ratelimit_passes_condition_through() {
        let bridge = InvariantBridge::default();
        let state = RateLimitState::default();
        assert!(!warn_on_ratelimit(&bridge, false, &state));
        bridge.set_suppressed();
        assert!(warn_on_ratelimit(&bridge, true, &state));
    }
}
