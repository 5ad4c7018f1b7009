use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use lineprof::config::Config;
use lineprof::replay;
use lineprof::report;

/// Execution profiler for procedural language interpreters.
#[derive(Parser)]
#[command(name = "lineprof", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replay a recorded interpreter trace and print the reports.
    Replay {
        /// Path to the JSON trace file.
        #[arg(short, long)]
        trace: PathBuf,

        /// Emit a JSON snapshot instead of text tables.
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level {}", cli.log_level))?;
    fmt().with_env_filter(filter).init();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    match cli.command {
        Command::Replay { trace, json } => {
            let outcome = replay::run_file(&trace, &config)
                .with_context(|| format!("replaying trace {}", trace.display()))?;

            if json {
                let snapshot = report::Snapshot::new(outcome.line_stats, outcome.call_graph);
                println!("{}", snapshot.to_json()?);
            } else {
                let mut stdout = std::io::stdout().lock();
                report::render_line_report(&mut stdout, &outcome.line_stats)?;
                writeln!(stdout)?;
                report::render_callgraph_report(
                    &mut stdout,
                    &outcome.call_graph,
                    Some(&*outcome.catalog),
                )?;
            }
        }
    }

    Ok(())
}
