//! Machine configuration.
//!
//! The kernel code hosted by this layer is written against a fixed Kconfig
//! (`CONFIG_NR_CPUS`, `CONFIG_RCU_FANOUT`, ...). Here those knobs are an
//! explicit [`SmpConfig`] resolved once before the machine is built. The
//! environment can override them:
//!
//! - `FAKESMP_NR_CPUS` (default 2)
//! - `FAKESMP_RCU_FANOUT` (default 32)
//! - `FAKESMP_RCU_FANOUT_LEAF` (default 16)
//! - `FAKESMP_STALL_TIMEOUT` (default 21)
//! - `FAKESMP_NESTING`: `tolerate` (default) or `report`
//! - `FAKESMP_SUPPRESSION`: `fenced` (default) or `unfenced`
//!
//! Unlike most runtime knobs, a bad value is an error rather than a fallback:
//! a silently adjusted CPU count would invalidate whatever the checker reports.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default CPU pool size.
pub const DEFAULT_NR_CPUS: usize = 2;

/// Default interior fanout of the RCU combining tree.
pub const DEFAULT_RCU_FANOUT: usize = 32;

/// Default leaf fanout of the RCU combining tree.
pub const DEFAULT_RCU_FANOUT_LEAF: usize = 16;

/// Default CPU stall timeout, in seconds.
pub const DEFAULT_STALL_TIMEOUT: u32 = 21;

/// Timer ticks per second.
pub const HZ: u32 = 100;

/// Largest CPU pool the registry accepts.
pub const MAX_CPUS: usize = 256;

/// Deepest combining tree the hosted algorithm supports.
pub const MAX_TREE_LEVELS: usize = 4;

/// What the registry does with badly nested soft acquire/release pairs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NestingPolicy {
    /// No depth tracking. Double acquire and unmatched release pass silently.
    #[default]
    Tolerate,
    /// Track the holder per slot and report misuse as a fatal violation.
    Report,
}

impl NestingPolicy {
    /// Parse from string (case-insensitive).
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tolerate" | "ignore" | "off" => Some(Self::Tolerate),
            "report" | "strict" | "on" => Some(Self::Report),
            _ => None,
        }
    }
}

/// How the invariant suppression flag is published and observed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuppressionFencing {
    /// Write then full fence; full fence then read.
    #[default]
    Fenced,
    /// Plain write and read, flag consulted before the condition. This is a
    /// deliberately seeded ordering bug for validating the checker.
    Unfenced,
}

impl SuppressionFencing {
    /// Parse from string (case-insensitive).
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fenced" | "default" => Some(Self::Fenced),
            "unfenced" | "ordering-bug" | "ordering_bug" => Some(Self::Unfenced),
            _ => None,
        }
    }
}

/// Resolved machine configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmpConfig {
    /// Number of virtual CPUs (`NR_CPUS`).
    pub nr_cpus: usize,
    /// Interior fanout of the combining tree (`CONFIG_RCU_FANOUT`).
    pub rcu_fanout: usize,
    /// Leaf fanout of the combining tree (`CONFIG_RCU_FANOUT_LEAF`).
    pub rcu_fanout_leaf: usize,
    /// Stall warning timeout in seconds (`CONFIG_RCU_CPU_STALL_TIMEOUT`).
    pub stall_timeout: u32,
    /// Timer ticks per second.
    pub hz: u32,
    /// Soft acquire/release nesting enforcement.
    pub nesting: NestingPolicy,
    /// Suppression flag publication mode.
    pub suppression_fencing: SuppressionFencing,
}

impl Default for SmpConfig {
    fn default() -> Self {
        Self {
            nr_cpus: DEFAULT_NR_CPUS,
            rcu_fanout: DEFAULT_RCU_FANOUT,
            rcu_fanout_leaf: DEFAULT_RCU_FANOUT_LEAF,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            hz: HZ,
            nesting: NestingPolicy::Tolerate,
            suppression_fencing: SuppressionFencing::Fenced,
        }
    }
}

impl SmpConfig {
    /// Default configuration with `nr_cpus` CPUs.
    #[must_use]
    pub fn with_cpus(nr_cpus: usize) -> Self {
        Self {
            nr_cpus,
            ..Self::default()
        }
    }

    /// One CPU more than a single leaf can hold, forcing a two-level tree.
    #[must_use]
    pub fn leaf_overflow() -> Self {
        Self::with_cpus(DEFAULT_RCU_FANOUT_LEAF + 1)
    }

    /// Builder-style nesting policy override.
    #[must_use]
    pub fn nesting(mut self, nesting: NestingPolicy) -> Self {
        self.nesting = nesting;
        self
    }

    /// Builder-style suppression fencing override.
    #[must_use]
    pub fn suppression_fencing(mut self, fencing: SuppressionFencing) -> Self {
        self.suppression_fencing = fencing;
        self
    }

    /// Reject configurations the hosted algorithm cannot run under.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nr_cpus == 0 {
            return Err(ConfigError::NoCpus);
        }
        if self.nr_cpus > MAX_CPUS {
            return Err(ConfigError::TooManyCpus {
                requested: self.nr_cpus,
                max: MAX_CPUS,
            });
        }
        if self.rcu_fanout < 2 {
            return Err(ConfigError::BadFanout(self.rcu_fanout));
        }
        if self.rcu_fanout_leaf == 0 || self.rcu_fanout_leaf > self.rcu_fanout {
            return Err(ConfigError::BadLeafFanout {
                leaf: self.rcu_fanout_leaf,
                fanout: self.rcu_fanout,
            });
        }
        if self.stall_timeout == 0 {
            return Err(ConfigError::ZeroStallTimeout);
        }
        if self.hz == 0 {
            return Err(ConfigError::ZeroHz);
        }
        self.tree_levels().map(|_| ())
    }

    /// Node count per level of the combining tree, root first.
    ///
    /// The leaf level holds `rcu_fanout_leaf` CPUs per node and every level
    /// above it multiplies capacity by `rcu_fanout`.
    pub fn tree_levels(&self) -> Result<Vec<usize>, ConfigError> {
        let mut capacity = self.rcu_fanout_leaf.max(1);
        let mut depth = 1;
        while capacity < self.nr_cpus {
            capacity = capacity.saturating_mul(self.rcu_fanout.max(2));
            depth += 1;
            if depth > MAX_TREE_LEVELS {
                return Err(ConfigError::TreeTooDeep {
                    nr_cpus: self.nr_cpus,
                    max_levels: MAX_TREE_LEVELS,
                });
            }
        }

        let mut levels = Vec::with_capacity(depth);
        let mut span = self.rcu_fanout_leaf.max(1);
        levels.push(self.nr_cpus.div_ceil(span));
        for _ in 1..depth {
            span = span.saturating_mul(self.rcu_fanout.max(2));
            levels.push(self.nr_cpus.div_ceil(span));
        }
        levels.reverse();
        Ok(levels)
    }

    /// Stall timeout expressed in jiffies.
    #[must_use]
    pub fn stall_timeout_jiffies(&self) -> u64 {
        u64::from(self.stall_timeout) * u64::from(self.hz)
    }

    /// Resolve from the process environment, then validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Resolve through an arbitrary variable lookup, then validate.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let config = Self::parse_lookup(lookup)?;
        config.validate()?;
        tracing::debug!(?config, "resolved SMP configuration");
        Ok(config)
    }

    /// Parse the variables `lookup` knows about over the defaults without
    /// validating, for callers that layer further overrides before calling
    /// [`Self::validate`] once.
    pub fn parse_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(v) = lookup("FAKESMP_NR_CPUS") {
            config.nr_cpus = parse_number("FAKESMP_NR_CPUS", &v)?;
        }
        if let Some(v) = lookup("FAKESMP_RCU_FANOUT") {
            config.rcu_fanout = parse_number("FAKESMP_RCU_FANOUT", &v)?;
        }
        if let Some(v) = lookup("FAKESMP_RCU_FANOUT_LEAF") {
            config.rcu_fanout_leaf = parse_number("FAKESMP_RCU_FANOUT_LEAF", &v)?;
        }
        if let Some(v) = lookup("FAKESMP_STALL_TIMEOUT") {
            config.stall_timeout = parse_number("FAKESMP_STALL_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("FAKESMP_NESTING") {
            config.nesting = NestingPolicy::parse(&v).ok_or_else(|| ConfigError::Unparsable {
                var: "FAKESMP_NESTING",
                value: v.clone(),
            })?;
        }
        if let Some(v) = lookup("FAKESMP_SUPPRESSION") {
            config.suppression_fencing =
                SuppressionFencing::parse(&v).ok_or_else(|| ConfigError::Unparsable {
                    var: "FAKESMP_SUPPRESSION",
                    value: v.clone(),
                })?;
        }
        Ok(config)
    }
}

fn parse_number<T: std::str::FromStr>(var: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Unparsable {
        var,
        value: raw.to_string(),
    })
}
