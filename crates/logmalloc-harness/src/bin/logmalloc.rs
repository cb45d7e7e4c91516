//! CLI entrypoint for offline trace analysis.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use logmalloc_harness::{HarnessError, LeakReport, SummaryReport, analyze_file};

/// Trace tooling for logmalloc.
#[derive(Debug, Parser)]
#[command(name = "logmalloc")]
#[command(about = "Analyze allocation traces written by the logmalloc interposer")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List blocks still live at the end of a trace.
    Findleak {
        /// Trace file captured from the trace descriptor.
        #[arg(long)]
        trace: PathBuf,
        /// Emit JSON instead of markdown.
        #[arg(long)]
        json: bool,
        /// Exit with status 1 when any block leaked.
        #[arg(long)]
        fail_on_leak: bool,
    },
    /// Per-operation counts, peak usage and final counters.
    Summary {
        #[arg(long)]
        trace: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn run(cli: Cli) -> Result<ExitCode, HarnessError> {
    match cli.command {
        Command::Findleak {
            trace,
            json,
            fail_on_leak,
        } => {
            eprintln!("Replaying {}", trace.display());
            let (raw, replay) = analyze_file(&trace)?;
            let report = LeakReport::new(trace.display().to_string(), &raw, replay);
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report.to_markdown());
            }
            if !report.consistent {
                eprintln!("warning: replayed live bytes disagree with the trace's last total");
            }
            if fail_on_leak && report.has_leaks() {
                return Ok(ExitCode::from(1));
            }
        }
        Command::Summary { trace, json } => {
            let (raw, replay) = analyze_file(&trace)?;
            let summary = SummaryReport::new(trace.display().to_string(), &raw, replay);
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print!("{}", summary.to_markdown());
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    match run(Cli::parse()) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("logmalloc: {err}");
            ExitCode::from(2)
        }
    }
}
