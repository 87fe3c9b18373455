//! Scenario execution engine.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use fakesmp_core::observe;
use fakesmp_core::{
    AssumptionFailed, ConfigError, EventLog, NestingPolicy, Severity, Smp, SmpConfig, SuppressionFencing, Violation,
};
use parking_lot::{Mutex, const_mutex};
use serde::{Deserialize, Serialize};

use crate::scenario::{Expectation, ScenarioKind};
use crate::structured_log::{LogEmitter, LogEntry, LogLevel, Outcome, now_utc};

/// Violations kept per scenario report.
pub const MAX_REPORTED_VIOLATIONS: usize = 16;

// The observer slot and the panic hook are process-wide.
static RUN_LOCK: Mutex<()> = const_mutex(());

#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("invalid machine configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Command-line settings layered over the `FAKESMP_*` environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachineOverrides {
    pub cpus: Option<usize>,
    /// `fenced` or `unfenced`.
    pub fencing: Option<String>,
    /// `tolerate` or `report`.
    pub nesting: Option<String>,
}

impl MachineOverrides {
    /// Resolve against the process environment.
    pub fn resolve_env(&self) -> Result<SmpConfig, HarnessError> {
        self.resolve(|var| std::env::var(var).ok())
    }

    /// Parse `lookup`, apply the overrides, then validate once. A variable
    /// whose field is overridden is never read, so a bad value there cannot
    /// fail the run.
    pub fn resolve<F>(&self, lookup: F) -> Result<SmpConfig, HarnessError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let mut config = SmpConfig::parse_lookup(|var| {
            let shadowed = match var {
                "FAKESMP_NR_CPUS" => self.cpus.is_some(),
                "FAKESMP_SUPPRESSION" => self.fencing.is_some(),
                "FAKESMP_NESTING" => self.nesting.is_some(),
                _ => false,
            };
            if shadowed { None } else { lookup(var) }
        })?;
        if let Some(cpus) = self.cpus {
            config.nr_cpus = cpus;
        }
        if let Some(raw) = &self.fencing {
            config.suppression_fencing =
                SuppressionFencing::parse(raw).ok_or_else(|| ConfigError::Unparsable {
                    var: "--fencing",
                    value: raw.clone(),
                })?;
        }
        if let Some(raw) = &self.nesting {
            config.nesting = NestingPolicy::parse(raw).ok_or_else(|| ConfigError::Unparsable {
                var: "--nesting",
                value: raw.clone(),
            })?;
        }
        config.validate()?;
        tracing::debug!(?config, ?self, "resolved machine configuration");
        Ok(config)
    }
}

/// Result of one scenario over all iterations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub scenario: ScenarioKind,
    pub expectation: Expectation,
    pub outcome: Outcome,
    pub iterations: u64,
    /// Iterations that met the expectation.
    pub passed: u64,
    /// Iterations cut short by a false assumption. Neither passed nor failed.
    #[serde(default)]
    pub pruned: u64,
    /// Total violations observed, including ones beyond `violations`.
    pub violation_count: u64,
    pub violations: Vec<Violation>,
    /// Panics that carried no violation event.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub errors: Vec<String>,
    /// Events seen per kind across all iterations.
    pub event_counts: BTreeMap<String, u64>,
    pub duration_ms: u64,
}

impl ScenarioReport {
    fn skipped(scenario: ScenarioKind, config: &SmpConfig) -> Self {
        Self {
            scenario,
            expectation: scenario.expectation(config),
            outcome: Outcome::Skip,
            iterations: 0,
            passed: 0,
            pruned: 0,
            violation_count: 0,
            violations: Vec::new(),
            errors: Vec::new(),
            event_counts: BTreeMap::new(),
            duration_ms: 0,
        }
    }
}

/// Result of a whole run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub generated_utc: String,
    pub config: SmpConfig,
    /// Combining-tree shape the configuration produces, root first.
    pub tree_levels: Vec<usize>,
    pub scenarios: Vec<ScenarioReport>,
}

impl RunReport {
    /// No scenario failed or errored.
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.scenarios
            .iter()
            .all(|s| matches!(s.outcome, Outcome::Pass | Outcome::Skip))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// What one iteration produced.
#[derive(Debug, Default)]
struct Iteration {
    violations: Vec<Violation>,
    /// Panic message when the iteration panicked without a violation.
    error: Option<String>,
    /// Ended by a false assumption before any violation.
    pruned: bool,
    event_counts: BTreeMap<String, u64>,
}

impl Iteration {
    fn meets(&self, expectation: Expectation) -> bool {
        if self.error.is_some() {
            return false;
        }
        match expectation {
            Expectation::Clean => self.violations.is_empty(),
            Expectation::Violation { severity } => {
                self.violations.iter().any(|v| v.severity == severity)
            }
            Expectation::MayViolate => self
                .violations
                .iter()
                .all(|v| v.severity == Severity::Recoverable),
        }
    }
}

/// Runs scenarios against fresh machines built from one configuration.
#[derive(Debug, Clone)]
pub struct ScenarioRunner {
    pub config: SmpConfig,
    pub iterations: u64,
}

impl ScenarioRunner {
    /// Validates `config` up front so a bad shape fails before any run.
    pub fn new(config: SmpConfig, iterations: u64) -> Result<Self, HarnessError> {
        config.validate()?;
        Ok(Self {
            config,
            iterations: iterations.max(1),
        })
    }

    /// Run one scenario for every iteration.
    pub fn run(&self, kind: ScenarioKind) -> Result<ScenarioReport, HarnessError> {
        if !kind.supports(&self.config) {
            tracing::info!(scenario = %kind, nr_cpus = self.config.nr_cpus, "scenario skipped");
            return Ok(ScenarioReport::skipped(kind, &self.config));
        }

        let _lock = RUN_LOCK.lock();
        let expectation = kind.expectation(&self.config);
        let started = Instant::now();
        let mut report = ScenarioReport::skipped(kind, &self.config);
        report.iterations = self.iterations;

        let previous_hook = panic::take_hook();
        panic::set_hook(Box::new(|info| {
            tracing::debug!(target: "fakesmp::panic", "{info}");
        }));
        let result = (0..self.iterations).try_for_each(|i| {
            let iteration = self.run_once(kind)?;
            tracing::debug!(
                scenario = %kind,
                iteration = i,
                violations = iteration.violations.len(),
                "iteration finished"
            );
            if iteration.pruned {
                report.pruned += 1;
            } else if iteration.meets(expectation) {
                report.passed += 1;
            }
            report.violation_count += iteration.violations.len() as u64;
            let room = MAX_REPORTED_VIOLATIONS.saturating_sub(report.violations.len());
            report
                .violations
                .extend(iteration.violations.into_iter().take(room));
            if let Some(error) = iteration.error
                && report.errors.len() < MAX_REPORTED_VIOLATIONS
            {
                report.errors.push(error);
            }
            for (name, n) in iteration.event_counts {
                *report.event_counts.entry(name).or_default() += n;
            }
            Ok::<(), HarnessError>(())
        });
        panic::set_hook(previous_hook);
        result?;

        report.duration_ms = started.elapsed().as_millis() as u64;
        report.outcome = if !report.errors.is_empty() {
            Outcome::Error
        } else if report.passed + report.pruned == report.iterations {
            Outcome::Pass
        } else {
            Outcome::Fail
        };
        tracing::info!(
            scenario = %kind,
            outcome = ?report.outcome,
            passed = report.passed,
            pruned = report.pruned,
            iterations = report.iterations,
            "scenario finished"
        );
        Ok(report)
    }

    fn run_once(&self, kind: ScenarioKind) -> Result<Iteration, HarnessError> {
        let smp = Smp::new(self.config)?;
        let log = EventLog::new();
        let panicked = {
            let _installed = observe::install(log.clone());
            panic::catch_unwind(AssertUnwindSafe(|| kind.execute(&smp))).err()
        };

        let mut iteration = Iteration::default();
        for event in log.take() {
            *iteration
                .event_counts
                .entry(event.kind().to_string())
                .or_default() += 1;
            if let observe::Event::Violation(v) = event {
                iteration.violations.push(v);
            }
        }
        if let Some(payload) = panicked
            && iteration.violations.is_empty()
        {
            if let Some(assumption) = AssumptionFailed::from_payload(&*payload) {
                tracing::debug!(scenario = %kind, %assumption, "iteration pruned");
                iteration.pruned = true;
                return Ok(iteration);
            }
            let message = payload
                .downcast_ref::<String>()
                .cloned()
                .or_else(|| payload.downcast_ref::<&str>().map(|s| (*s).to_string()))
                .unwrap_or_else(|| "non-string panic payload".to_string());
            iteration.error = Some(message);
        }
        Ok(iteration)
    }

    /// Run `kinds` in order, logging each to `emitter` when given.
    pub fn run_all(
        &self,
        run_id: &str,
        kinds: &[ScenarioKind],
        mut emitter: Option<&mut LogEmitter>,
    ) -> Result<RunReport, HarnessError> {
        let fencing = fencing_name(&self.config);
        let mut scenarios = Vec::with_capacity(kinds.len());
        for &kind in kinds {
            if let Some(emitter) = emitter.as_deref_mut() {
                emitter.emit_entry(
                    LogEntry::new("", LogLevel::Info, "scenario_start")
                        .with_scenario(kind.name())
                        .with_machine(self.config.nr_cpus, fencing),
                )?;
            }
            let report = self.run(kind)?;
            if let Some(emitter) = emitter.as_deref_mut() {
                for v in &report.violations {
                    let mut entry = LogEntry::new("", LogLevel::Error, "violation")
                        .with_scenario(kind.name())
                        .with_details(serde_json::to_value(v)?);
                    if let Some(cpu) = v.cpu {
                        entry = entry.with_cpu(cpu.index());
                    }
                    emitter.emit_entry(entry)?;
                }
                let level = match report.outcome {
                    Outcome::Pass | Outcome::Skip => LogLevel::Info,
                    Outcome::Fail => LogLevel::Warn,
                    Outcome::Error => LogLevel::Error,
                };
                emitter.emit_entry(
                    LogEntry::new("", level, "scenario_end")
                        .with_scenario(kind.name())
                        .with_machine(self.config.nr_cpus, fencing)
                        .with_iteration(report.iterations)
                        .with_outcome(report.outcome)
                        .with_violations(report.violation_count)
                        .with_duration_ms(report.duration_ms),
                )?;
            }
            scenarios.push(report);
        }
        Ok(RunReport {
            run_id: run_id.to_string(),
            generated_utc: now_utc(),
            config: self.config,
            tree_levels: self.config.tree_levels()?,
            scenarios,
        })
    }
}

fn fencing_name(config: &SmpConfig) -> &'static str {
    match config.suppression_fencing {
        fakesmp_core::SuppressionFencing::Fenced => "fenced",
        fakesmp_core::SuppressionFencing::Unfenced => "unfenced",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iteration_expectations() {
        let violation = |severity| Violation {
            severity,
            message: "x".to_string(),
            location: "a.rs:1:1".to_string(),
            cpu: None,
        };
        let clean = Iteration::default();
        assert!(clean.meets(Expectation::Clean));
        assert!(!clean.meets(Expectation::Violation {
            severity: Severity::Fatal
        }));
        assert!(clean.meets(Expectation::MayViolate));

        let fatal = Iteration {
            violations: vec![violation(Severity::Fatal)],
            ..Iteration::default()
        };
        assert!(!fatal.meets(Expectation::Clean));
        assert!(fatal.meets(Expectation::Violation {
            severity: Severity::Fatal
        }));
        assert!(!fatal.meets(Expectation::MayViolate));

        let errored = Iteration {
            error: Some("boom".to_string()),
            ..Iteration::default()
        };
        assert!(!errored.meets(Expectation::MayViolate));
    }

    #[test]
    fn runner_rejects_bad_config() {
        let err = ScenarioRunner::new(SmpConfig::with_cpus(0), 1).unwrap_err();
        assert!(matches!(err, HarnessError::Config(ConfigError::NoCpus)));
    }

    #[test]
    fn overrides_reject_unknown_flag_values() {
        let overrides = MachineOverrides {
            fencing: Some("sometimes".to_string()),
            ..MachineOverrides::default()
        };
        let err = overrides.resolve(|_| None).unwrap_err();
        assert!(matches!(
            err,
            HarnessError::Config(ConfigError::Unparsable { var: "--fencing", .. })
        ));
    }

    #[test]
    fn zero_iterations_runs_once() {
        let runner = ScenarioRunner::new(SmpConfig::default(), 0).unwrap();
        assert_eq!(runner.iterations, 1);
    }
}
