//! CLI entrypoint for the frankenrcu harness.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use frankenrcu_core::rcu::RcuTree;
use frankenrcu_core::{EventSink, NullSink, RcuConfig};
use frankenrcu_harness::event_log::ENGINE_COMPONENT;
use frankenrcu_harness::structured_log::validate_log_file;
use frankenrcu_harness::torture::{self, TortureConfig};
use frankenrcu_harness::{ArtifactIndex, JsonlSink, LogEmitter, LogEntry, LogLevel, Outcome};

/// Inspection and stress tooling for frankenrcu.
#[derive(Debug, Parser)]
#[command(name = "frankenrcu-harness")]
#[command(about = "Torture runs and tree inspection for frankenrcu")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Build a quiescence tree and print its layout.
    Tree {
        /// Cores covered by the tree.
        #[arg(long)]
        cores: usize,
        /// Leaf fanout.
        #[arg(long, default_value_t = 16)]
        fanout: usize,
        /// Print the node table as JSON instead of the level diagram.
        #[arg(long)]
        json: bool,
    },
    /// Run the reader/writer torture and print a JSON report.
    ///
    /// Engine settings start from the FRANKENRCU_* environment variables.
    Torture {
        /// Physical cores: core 0 writes, the rest read.
        #[arg(long, default_value_t = 4)]
        cores: usize,
        /// Versions the writer publishes.
        #[arg(long, default_value_t = 10_000)]
        updates: u64,
        /// Wait synchronously every N updates (0 = never).
        #[arg(long, default_value_t = 16)]
        sync_every: u64,
        /// Microseconds a reader holds each version.
        #[arg(long, default_value_t = 20)]
        read_hold_us: u64,
        /// Override the leaf fanout.
        #[arg(long)]
        fanout: Option<usize>,
        /// Override the callback runner count.
        #[arg(long)]
        runners: Option<usize>,
        /// Cover extra cores in the tree that no thread ever runs on.
        #[arg(long)]
        logical: Option<usize>,
        /// Write engine events as JSONL here.
        #[arg(long)]
        log: Option<PathBuf>,
        /// Report output path (if omitted, prints to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
        /// Write an artifact index covering the log and report.
        #[arg(long)]
        artifact_index: Option<PathBuf>,
    },
    /// Validate a structured JSONL log.
    ValidateLog {
        #[arg(long)]
        log: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Tree { cores, fanout, json } => {
            let tree = RcuTree::build(cores, fanout)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&tree.layout())?);
            } else {
                println!(
                    "{} cores, fanout {}, {} levels, {} nodes",
                    tree.num_cores(),
                    tree.fanout_leaf(),
                    tree.num_levels(),
                    tree.nodes().len()
                );
                println!("{tree}");
            }
        }
        Command::Torture {
            cores,
            updates,
            sync_every,
            read_hold_us,
            fanout,
            runners,
            logical,
            log,
            output,
            artifact_index,
        } => {
            let mut engine = RcuConfig::from_env(cores);
            if let Some(fanout) = fanout {
                engine = engine.with_fanout_leaf(fanout);
            }
            if let Some(runners) = runners {
                engine = engine.with_runner_threads(runners);
            }
            if let Some(logical) = logical {
                engine = engine.with_logical_cores(logical);
            }
            let config = TortureConfig {
                sync_every,
                read_hold: Duration::from_micros(read_hold_us),
                engine,
                ..TortureConfig::new(cores, updates)
            };

            let run_id = format!("torture-{}", std::process::id());
            let sink = match &log {
                Some(path) => Some(Arc::new(JsonlSink::new(LogEmitter::to_file(
                    path,
                    &run_id,
                    ENGINE_COMPONENT,
                )?))),
                None => None,
            };
            let events: Arc<dyn EventSink> = match &sink {
                Some(sink) => Arc::clone(sink) as _,
                None => Arc::new(NullSink),
            };

            let report = torture::run(&config, events)?;
            let body = serde_json::to_string_pretty(&report)?;
            let passed = report.passed();

            if let Some(sink) = &sink {
                let outcome = if passed { Outcome::Pass } else { Outcome::Fail };
                let level = if passed { LogLevel::Info } else { LogLevel::Error };
                sink.emit_entry(
                    LogEntry::new(String::new(), level, "torture_completed")
                        .with_component("torture")
                        .with_duration_us(report.duration_ms.saturating_mul(1_000))
                        .with_outcome(outcome)
                        .with_details(serde_json::to_value(&report)?),
                )?;
                sink.flush()?;
            }

            match &output {
                Some(path) => std::fs::write(path, &body)?,
                None => println!("{body}"),
            }

            if let Some(index_path) = &artifact_index {
                write_index(&run_id, index_path, log.as_deref(), output.as_deref())?;
            }

            if !passed {
                return Err(format!(
                    "torture failed: {} violations, {}/{} versions reclaimed",
                    report.violations, report.reclaimed, report.updates
                )
                .into());
            }
        }
        Command::ValidateLog { log } => {
            let (lines, errors) = validate_log_file(&log)?;
            for e in &errors {
                eprintln!("{e}");
            }
            if !errors.is_empty() {
                return Err(format!("{} errors in {lines} lines", errors.len()).into());
            }
            println!("{lines} lines valid");
        }
    }

    Ok(())
}

fn write_index(
    run_id: &str,
    index_path: &Path,
    log: Option<&Path>,
    report: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut index = ArtifactIndex::new(run_id);
    if let Some(log) = log {
        index.add_file(log, "log")?;
    }
    if let Some(report) = report {
        index.add_file(report, "report")?;
    }
    std::fs::write(index_path, index.to_json()?)?;
    eprintln!(
        "artifact index: {} ({} artifacts)",
        index_path.display(),
        index.artifacts.len()
    );
    Ok(())
}
