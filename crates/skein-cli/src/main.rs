//! Skein CLI
//!
//! Drives the coroutine engine from the command line: offload bursts of
//! blocking work, run sleeping coroutines, and print the resolved runtime
//! configuration.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "skein")]
#[command(about = "Skein coroutine runtime driver", long_about = None)]
#[command(version)]
struct Cli {
    /// Runtime configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log scheduler events (same as RUST_LOG=skein=trace)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Spawn coroutines that each offload one blocking task
    Work {
        /// Number of coroutines
        #[arg(short, long, default_value_t = 10)]
        tasks: usize,
        /// Shortest simulated task, in milliseconds
        #[arg(long, default_value_t = 5)]
        min_ms: u64,
        /// Longest simulated task, in milliseconds
        #[arg(long, default_value_t = 50)]
        max_ms: u64,
        /// Per-task timeout in milliseconds (0 = none)
        #[arg(long, default_value_t = 500)]
        timeout_ms: u64,
        /// Override the worker count
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Spawn coroutines that sleep and report when they wake
    Sleep {
        /// Number of coroutines
        #[arg(short, long, default_value_t = 100)]
        coroutines: usize,
        /// Sleep duration in milliseconds
        #[arg(long, default_value_t = 10)]
        ms: u64,
    },

    /// Print the resolved runtime configuration
    Config,
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("skein=trace,skein_engine=trace")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("skein=info,skein_engine=info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Work {
            tasks,
            min_ms,
            max_ms,
            timeout_ms,
            workers,
        } => {
            let config = match workers {
                Some(n) => config.with_workers(n),
                None => config,
            };
            commands::work::execute(
                config,
                commands::work::WorkOptions {
                    tasks,
                    min_ms,
                    max_ms,
                    timeout_ms,
                },
            )
        }
        Commands::Sleep { coroutines, ms } => commands::sleep::execute(config, coroutines, ms),
        Commands::Config => commands::config::execute(&config),
    }
}
