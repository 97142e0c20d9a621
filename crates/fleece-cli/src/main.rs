//! Fleece CLI - benchmark harness for local LLM inference engines
//!
//! Runs a (model × prompt × repeat) matrix against an external engine while
//! sampling GPU telemetry, and summarises the results.

use anyhow::Result;
use clap::{Parser, Subcommand};
use console::style;
use std::path::PathBuf;
use tracing::{debug, info, Level};
use tracing_subscriber::{filter::LevelFilter, EnvFilter, FmtSubscriber};

mod commands;
mod config;
mod utils;

use commands::{run::RunCommand, status::StatusCommand, summarize::SummarizeCommand, Command};

#[derive(Parser)]
#[command(
    name = "fleece",
    version = env!("CARGO_PKG_VERSION"),
    about = "Fleece LLM benchmarking harness",
    long_about = "Benchmarks local LLM inference engines across models, prompts and repeats, \
                  correlating each run with sampled GPU telemetry."
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Quiet output (errors only)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Configuration file path
    #[arg(short, long, global = true, env = "FLEECE_CONFIG")]
    config: Option<PathBuf>,

    /// JSON output format
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a benchmark session
    #[command(name = "run", alias = "r")]
    Run(RunCommand),

    /// Recompute summary statistics from a results table
    #[command(name = "summarize", alias = "sum")]
    Summarize(SummarizeCommand),

    /// Show the planned matrix and which cells a resume would skip
    #[command(name = "status", alias = "st")]
    Status(StatusCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli)?;

    debug!("Fleece CLI v{} starting", env!("CARGO_PKG_VERSION"));

    let config = config::Config::load(cli.config.as_deref())?;
    debug!("Configuration loaded: {:?}", config);

    let result = match cli.command {
        Commands::Run(cmd) => cmd.execute(&config, cli.json).await,
        Commands::Summarize(cmd) => cmd.execute(&config, cli.json).await,
        Commands::Status(cmd) => cmd.execute(&config, cli.json).await,
    };

    match result {
        Ok(_) => {
            if !cli.quiet {
                info!("Command completed successfully");
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("{} {:#}", style("Error:").red().bold(), e);
            std::process::exit(1);
        }
    }
}

fn init_logging(cli: &Cli) -> Result<()> {
    let level = if cli.debug {
        Level::DEBUG
    } else if cli.verbose {
        Level::INFO
    } else if cli.quiet {
        Level::ERROR
    } else {
        Level::WARN
    };

    // RUST_LOG directives take precedence over the flag-derived level
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
