//! CLI entrypoint for the fakesmp scenario harness.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use fakesmp_harness::structured_log::{ArtifactIndex, LogEmitter, LogLevel, validate_log_file};
use fakesmp_harness::{MachineOverrides, ScenarioKind, ScenarioRunner};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Runs client programs against an emulated SMP machine.
#[derive(Debug, Parser)]
#[command(name = "fakesmp-harness")]
#[command(about = "Scenario harness for the fakesmp emulation layer")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the built-in scenarios.
    List,
    /// Print the machine configuration resolved from the environment.
    Config {
        /// Override the CPU count.
        #[arg(long)]
        cpus: Option<usize>,
    },
    /// Run scenarios and write a report.
    Run {
        /// Scenarios to run (all when omitted).
        #[arg(long = "scenario", value_enum)]
        scenarios: Vec<ScenarioKind>,
        /// Iterations per scenario.
        #[arg(long, default_value_t = 10)]
        iterations: u64,
        /// Override the CPU count.
        #[arg(long)]
        cpus: Option<usize>,
        /// Suppression fencing (`fenced` or `unfenced`).
        #[arg(long)]
        fencing: Option<String>,
        /// Nesting policy (`tolerate` or `report`).
        #[arg(long)]
        nesting: Option<String>,
        /// Directory for report.json, run.jsonl and artifacts.json (if
        /// omitted, the report is printed to stdout).
        #[arg(long)]
        output_dir: Option<PathBuf>,
        /// Run identifier used in trace ids.
        #[arg(long)]
        run_id: Option<String>,
    },
    /// Validate a structured JSONL run log.
    ValidateLog {
        /// Log path.
        #[arg(long)]
        log: PathBuf,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .init();
}

fn default_run_id() -> String {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    format!("run-{secs}")
}

fn write_bundle(
    dir: &Path,
    run_id: &str,
    runner: &ScenarioRunner,
    kinds: &[ScenarioKind],
) -> Result<bool, Box<dyn std::error::Error>> {
    std::fs::create_dir_all(dir)?;
    let log_path = dir.join("run.jsonl");
    let report_path = dir.join("report.json");

    let mut emitter = LogEmitter::to_file(&log_path, run_id)?;
    emitter.emit("run", LogLevel::Info, "run_start")?;
    let report = runner.run_all(run_id, kinds, Some(&mut emitter))?;
    let passed = report.all_passed();
    emitter.emit(
        "run",
        if passed { LogLevel::Info } else { LogLevel::Error },
        "run_end",
    )?;
    emitter.flush()?;
    std::fs::write(&report_path, report.to_json()?)?;

    let mut index = ArtifactIndex::new(run_id);
    index.add_file(&report_path, "report")?;
    index.add_file(&log_path, "log")?;
    std::fs::write(dir.join("artifacts.json"), index.to_json()?)?;
    eprintln!("Wrote run bundle to {}", dir.display());
    Ok(passed)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::List => {
            for kind in ScenarioKind::ALL {
                println!("{:<22} {}", kind.name(), kind.description());
            }
        }
        Command::Config { cpus } => {
            let config = MachineOverrides {
                cpus,
                ..MachineOverrides::default()
            }
            .resolve_env()?;
            let resolved = serde_json::json!({
                "config": config,
                "tree_levels": config.tree_levels()?,
                "stall_timeout_jiffies": config.stall_timeout_jiffies(),
            });
            println!("{}", serde_json::to_string_pretty(&resolved)?);
        }
        Command::Run {
            scenarios,
            iterations,
            cpus,
            fencing,
            nesting,
            output_dir,
            run_id,
        } => {
            let config = MachineOverrides {
                cpus,
                fencing,
                nesting,
            }
            .resolve_env()?;
            let runner = ScenarioRunner::new(config, iterations)?;
            let kinds = if scenarios.is_empty() {
                ScenarioKind::ALL.to_vec()
            } else {
                scenarios
            };
            let run_id = run_id.unwrap_or_else(default_run_id);

            let passed = match output_dir {
                Some(dir) => write_bundle(&dir, &run_id, &runner, &kinds)?,
                None => {
                    let report = runner.run_all(&run_id, &kinds, None)?;
                    println!("{}", report.to_json()?);
                    report.all_passed()
                }
            };
            if !passed {
                return Err(format!("run {run_id} had failing scenarios").into());
            }
        }
        Command::ValidateLog { log } => {
            let (lines, errors) = validate_log_file(&log)?;
            for error in &errors {
                eprintln!("{error}");
            }
            if !errors.is_empty() {
                return Err(format!("{} errors in {lines} lines", errors.len()).into());
            }
            println!("{}: {lines} lines valid", log.display());
        }
    }

    Ok(())
}
