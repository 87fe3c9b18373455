//! Integration test: structured run log contract.
//!
//! Validates that:
//! 1. LogEmitter writes JSONL that passes validation.
//! 2. The validator reports every broken line with its line number.
//! 3. ArtifactIndex digests match the files on disk.
//!
//! Run: cargo test -p fakesmp-harness --test structured_log_test

use fakesmp_harness::structured_log::{
    ArtifactIndex, LogEmitter, LogEntry, LogLevel, Outcome, sha256_hex, validate_log_file,
};

fn scratch_dir(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("fakesmp_log_test_{name}"));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn emitter_file_round_trip_validates() {
    let dir = scratch_dir("emit");
    let path = dir.join("run.jsonl");
    {
        let mut emitter = LogEmitter::to_file(&path, "run-7").unwrap();
        emitter.emit("run", LogLevel::Info, "run_start").unwrap();
        emitter
            .emit_entry(
                LogEntry::new("", LogLevel::Error, "violation")
                    .with_scenario("grace-period")
                    .with_cpu(3)
                    .with_details(serde_json::json!({"severity": "fatal"})),
            )
            .unwrap();
        emitter
            .emit_entry(
                LogEntry::new("", LogLevel::Warn, "scenario_end")
                    .with_scenario("grace-period")
                    .with_machine(4, "unfenced")
                    .with_outcome(Outcome::Fail)
                    .with_violations(1),
            )
            .unwrap();
        emitter.flush().unwrap();
    }

    let (lines, errors) = validate_log_file(&path).unwrap();
    assert_eq!(lines, 3);
    assert!(errors.is_empty(), "{errors:?}");

    let content = std::fs::read_to_string(&path).unwrap();
    let last: serde_json::Value = serde_json::from_str(content.lines().last().unwrap()).unwrap();
    assert_eq!(last["trace_id"], "run-7::grace-period::003");
    assert_eq!(last["run_id"], "run-7");

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn validator_reports_line_numbers() {
    let dir = scratch_dir("invalid");
    let path = dir.join("bad.jsonl");
    let good = LogEntry::new("r::s::001", LogLevel::Info, "scenario_start")
        .to_jsonl()
        .unwrap();
    let content = format!(
        "{good}\n\n{{\"timestamp\":\"t\",\"trace_id\":\"r::s::002\",\"level\":\"loud\",\"event\":\"x\"}}\nnot json\n"
    );
    std::fs::write(&path, content).unwrap();

    let (lines, errors) = validate_log_file(&path).unwrap();
    assert_eq!(lines, 3);
    assert_eq!(errors.len(), 2);
    assert_eq!(errors[0].line_number, 3);
    assert_eq!(errors[0].field, "level");
    assert_eq!(errors[1].line_number, 4);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn artifact_index_hashes_files() {
    let dir = scratch_dir("artifacts");
    let path = dir.join("report.json");
    std::fs::write(&path, b"{\"run_id\":\"r\"}").unwrap();

    let mut index = ArtifactIndex::new("r");
    index.add_file(&path, "report").unwrap();
    let entry = &index.artifacts[0];
    assert_eq!(entry.path, "report.json");
    assert_eq!(entry.kind, "report");
    assert_eq!(entry.size_bytes, Some(14));
    assert_eq!(entry.sha256, sha256_hex(b"{\"run_id\":\"r\"}"));
    assert_eq!(entry.sha256.len(), 64);

    let _ = std::fs::remove_dir_all(&dir);
}
