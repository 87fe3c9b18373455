//! Integration test: scenario runner outcomes and run bundles.
//!
//! Run: cargo test -p fakesmp-harness --test runner_test

use fakesmp_core::{ConfigError, NestingPolicy, Severity, SmpConfig, SuppressionFencing};
use fakesmp_harness::structured_log::{LogEmitter, Outcome, validate_log_file};
use fakesmp_harness::{Expectation, HarnessError, MachineOverrides, ScenarioKind, ScenarioRunner};

#[test]
fn clean_scenarios_pass_on_default_machine() {
    let runner = ScenarioRunner::new(SmpConfig::with_cpus(4), 3).unwrap();
    for kind in [
        ScenarioKind::IncDec,
        ScenarioKind::CasRace,
        ScenarioKind::CpuIdentity,
        ScenarioKind::SuppressedCheck,
        ScenarioKind::GracePeriod,
    ] {
        let report = runner.run(kind).unwrap();
        assert_eq!(report.outcome, Outcome::Pass, "{kind}: {report:?}");
        assert_eq!(report.passed, 3);
        assert_eq!(report.violation_count, 0);
        assert!(report.event_counts.contains_key("cpu"), "{kind} assigned no CPUs");
    }
}

#[test]
fn fatal_after_suppress_reports_expected_violation() {
    let runner = ScenarioRunner::new(SmpConfig::default(), 2).unwrap();
    let report = runner.run(ScenarioKind::FatalAfterSuppress).unwrap();
    assert_eq!(
        report.expectation,
        Expectation::Violation {
            severity: Severity::Fatal
        }
    );
    assert_eq!(report.outcome, Outcome::Pass);
    assert_eq!(report.violation_count, 2);
    assert!(report.violations.iter().all(|v| v.severity == Severity::Fatal));
    assert_eq!(report.event_counts.get("suppressed"), Some(&2));
}

#[test]
fn unfenced_suppressed_check_never_errors() {
    let config = SmpConfig::default().suppression_fencing(SuppressionFencing::Unfenced);
    let runner = ScenarioRunner::new(config, 5).unwrap();
    let report = runner.run(ScenarioKind::SuppressedCheck).unwrap();
    assert_eq!(report.expectation, Expectation::MayViolate);
    assert_eq!(report.outcome, Outcome::Pass);
    assert!(report.errors.is_empty());
}

#[test]
fn unsupported_shapes_are_skipped() {
    let runner = ScenarioRunner::new(SmpConfig::with_cpus(1), 1).unwrap();
    let report = runner.run(ScenarioKind::SuppressedCheck).unwrap();
    assert_eq!(report.outcome, Outcome::Skip);
    assert_eq!(report.iterations, 0);
}

#[test]
fn run_all_emits_a_valid_log() {
    let dir = std::env::temp_dir().join("fakesmp_runner_test");
    std::fs::create_dir_all(&dir).unwrap();
    let log_path = dir.join("run.jsonl");

    let runner = ScenarioRunner::new(SmpConfig::default(), 1).unwrap();
    let mut emitter = LogEmitter::to_file(&log_path, "run-it").unwrap();
    let report = runner
        .run_all(
            "run-it",
            &[ScenarioKind::CasRace, ScenarioKind::FatalAfterSuppress],
            Some(&mut emitter),
        )
        .unwrap();
    emitter.flush().unwrap();
    drop(emitter);

    assert!(report.all_passed());
    assert_eq!(report.scenarios.len(), 2);
    assert_eq!(report.tree_levels, vec![1]);

    let (lines, errors) = validate_log_file(&log_path).unwrap();
    assert!(errors.is_empty(), "{errors:?}");
    // Two starts, one violation, two ends.
    assert_eq!(lines, 5);

    let content = std::fs::read_to_string(&log_path).unwrap();
    let ends: Vec<serde_json::Value> = content
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .filter(|v: &serde_json::Value| v["event"] == "scenario_end")
        .collect();
    assert_eq!(ends[0]["scenario"], "cas-race");
    assert_eq!(ends[1]["outcome"], "pass");
    assert_eq!(ends[1]["violations"], 1);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn report_round_trips_through_json() {
    let runner = ScenarioRunner::new(SmpConfig::default(), 1).unwrap();
    let report = runner.run_all("run-json", &[ScenarioKind::IncDec], None).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
    assert_eq!(parsed["run_id"], "run-json");
    assert_eq!(parsed["config"]["nr_cpus"], 2);
    assert_eq!(parsed["scenarios"][0]["scenario"], "inc-dec");
    assert_eq!(parsed["scenarios"][0]["expectation"]["expect"], "clean");
}

#[test]
fn command_line_overrides_beat_a_bad_environment() {
    let env = |var: &'static str| match var {
        "FAKESMP_NR_CPUS" => Some("0".to_string()),
        "FAKESMP_SUPPRESSION" => Some("sideways".to_string()),
        "FAKESMP_NESTING" => Some("report".to_string()),
        _ => None,
    };
    let overrides = MachineOverrides {
        cpus: Some(4),
        fencing: Some("unfenced".to_string()),
        nesting: None,
    };
    let config = overrides.resolve(env).unwrap();
    assert_eq!(config.nr_cpus, 4);
    assert_eq!(config.suppression_fencing, SuppressionFencing::Unfenced);
    assert_eq!(config.nesting, NestingPolicy::Report);

    // Without the flag the same environment is still rejected.
    let err = MachineOverrides::default().resolve(env).unwrap_err();
    assert!(matches!(err, HarnessError::Config(ConfigError::Unparsable { .. })));
    let err = MachineOverrides {
        fencing: Some("fenced".to_string()),
        ..MachineOverrides::default()
    }
    .resolve(env)
    .unwrap_err();
    assert!(matches!(err, HarnessError::Config(ConfigError::NoCpus)));
}

#[test]
fn pruned_iterations_are_neither_passes_nor_errors() {
    let runner = ScenarioRunner::new(SmpConfig::with_cpus(4), 12).unwrap();
    let report = runner.run(ScenarioKind::AssumedWinner).unwrap();
    assert_eq!(report.outcome, Outcome::Pass, "{report:?}");
    assert_eq!(report.passed + report.pruned, 12);
    assert!(report.errors.is_empty());
    assert_eq!(report.violation_count, 0);

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["pruned"], report.pruned);
}
