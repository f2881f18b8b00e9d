#![warn(missing_docs)]
//! isocell CLI Library
//!
//! This module provides the CLI infrastructure for test binaries.
//! Use `isocell::run()` (or `isocell_cli::run()`) in your main function to get the
//! full isocell runner over your registered tests. The same binary acts as the
//! worker when the supervisor re-executes it with `--isocell-worker`.
//!
//! # Example
//!
//! ```ignore
//! use isocell::prelude::*;
//!
//! #[isolated(group = "db")]
//! fn migrates_schema() {
//!     assert!(apply_migrations().is_ok());
//! }
//!
//! fn main() {
//!     isocell_cli::run().unwrap();
//! }
//! ```

mod aggregator;
mod config;
mod output;
mod planner;
mod runner;
mod signal;
mod supervisor;

pub use aggregator::*;
pub use config::*;
pub use output::{
    Progress, failure_report, format_plan, status_label, status_line, summary_line, write_json,
};
pub use planner::*;
pub use runner::*;
pub use supervisor::*;

use clap::{Parser, Subcommand};
use isocell_core::{RegistryExecutor, WORKER_FLAG, WorkerMain, collect_items, in_worker};
use regex::Regex;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// isocell CLI arguments
#[derive(Parser, Debug)]
#[command(name = "isocell")]
#[command(author, version, about = "isocell - process-isolated test runner")]
pub struct Cli {
    /// Optional subcommand (List, Run); defaults to Run
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Run only tests whose id matches this regex
    pub filter: Option<String>,

    /// Skip tests whose id contains this substring (repeatable)
    #[arg(long)]
    pub skip: Vec<String>,

    /// Configuration file (default: nearest isocell.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Run every test in a worker process, marked or not
    #[arg(long)]
    pub isolate_all: bool,

    /// Run everything in-process; never spawn a worker
    #[arg(long, conflicts_with = "isolate_all")]
    pub no_isolation: bool,

    /// Group timeout when no test overrides it (e.g. "30s", "2m")
    #[arg(long)]
    pub timeout: Option<String>,

    /// Delay between SIGTERM and SIGKILL for a timed-out worker
    #[arg(long)]
    pub grace: Option<String>,

    /// Treat a worker silent for this long as hung
    #[arg(long)]
    pub hang_timeout: Option<String>,

    /// Number of groups running at the same time
    #[arg(long, short = 'j')]
    pub jobs: Option<usize>,

    /// Group key for isolated tests without an explicit group
    #[arg(long, value_enum)]
    pub grouping: Option<DefaultGrouping>,

    /// Show captured output of passed tests too
    #[arg(long)]
    pub capture_passed: bool,

    /// Stop starting new groups after this many failures
    #[arg(long)]
    pub max_fail: Option<usize>,

    /// Stop after the first failure (same as --max-fail 1)
    #[arg(short = 'x', long)]
    pub exitfirst: bool,

    /// Write the outcome records as JSON to this file
    #[arg(long)]
    pub json: Option<PathBuf>,

    /// Only print failures and the summary
    #[arg(short, long)]
    pub quiet: bool,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Internal: Run as worker process (used by supervisor)
    #[arg(long, hide = true)]
    pub isocell_worker: bool,
}

/// CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List the planned groups without running anything
    List,
    /// Run tests (default)
    Run,
}

/// Run the isocell CLI with the process arguments.
/// This is the main entry point for test binaries.
pub fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    run_with_cli(cli)
}

/// Run the isocell CLI with pre-parsed arguments.
pub fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    // Handle worker mode first (before any other initialization)
    if cli.isocell_worker {
        run_worker();
    }

    init_logging(cli.verbose);

    let config = build_run_config(&cli)?;
    let filter = cli.filter.as_deref().map(Regex::new).transpose()?;
    let items = select(collect_items(), filter.as_ref(), &cli.skip);

    match cli.command {
        Some(Commands::List) => {
            let runner = Runner::new(config, WorkerCommand::current_exe()?);
            print!("{}", format_plan(&runner.plan(&items)));
        }
        Some(Commands::Run) | None => {
            let failed = run_tests(&cli, config, &items)?;
            if failed {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

/// Whether this process was started as an isolated worker
pub fn is_worker_invocation() -> bool {
    in_worker() || std::env::args().any(|arg| arg == WORKER_FLAG)
}

/// Run as a worker process and exit: 0 after a completed group, 2 on a
/// protocol or setup error
pub fn run_worker() -> ! {
    // stderr is the group's worker.log
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("isocell=info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();

    let mut worker = WorkerMain::new();
    match worker.run() {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            tracing::error!(error = %e, "worker failed");
            std::process::exit(2);
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "isocell=debug" } else { "isocell=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Build run settings by layering: isocell.toml defaults → CLI overrides.
pub fn build_run_config(cli: &Cli) -> Result<RunConfig, ConfigError> {
    let file = match &cli.config {
        Some(path) => IsocellConfig::load(path)?,
        None => IsocellConfig::discover()?,
    };
    let mut config = file.resolve()?;

    if let Some(timeout) = &cli.timeout {
        config.default_timeout = cli_duration("--timeout", timeout)?;
        if config.default_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "--timeout must be greater than zero".to_string(),
            ));
        }
    }
    if let Some(grace) = &cli.grace {
        config.grace_period = cli_duration("--grace", grace)?;
    }
    if let Some(hang) = &cli.hang_timeout {
        config.hang_timeout = Some(cli_duration("--hang-timeout", hang)?);
    }
    if let Some(jobs) = cli.jobs {
        config.jobs = jobs.max(1);
    }
    if let Some(grouping) = cli.grouping {
        config.default_grouping = grouping;
    }
    if cli.isolate_all {
        config.isolate_all = true;
        config.disable_isolation = false;
    }
    if cli.no_isolation {
        config.disable_isolation = true;
    }
    if cli.capture_passed {
        config.capture_passed_output = true;
    }
    if cli.exitfirst {
        config.max_fail = Some(1);
    } else if let Some(max_fail) = cli.max_fail {
        config.max_fail = Some(max_fail).filter(|&n| n > 0);
    }

    Ok(config)
}

fn cli_duration(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    IsocellConfig::parse_duration(value).map_err(|reason| ConfigError::Duration {
        field,
        value: value.to_string(),
        reason,
    })
}

/// Run the selected items and print results; returns whether the run failed
fn run_tests(
    cli: &Cli,
    config: RunConfig,
    items: &[isocell_core::TestItem],
) -> anyhow::Result<bool> {
    if items.is_empty() {
        println!("No tests found.");
        return Ok(false);
    }

    signal::install();
    let cancel = CancelToken::with_signals();
    let runner = Runner::new(config, WorkerCommand::current_exe()?);
    let mut executor = RegistryExecutor::new();

    let start = Instant::now();
    let progress = Progress::new(items.len(), cli.quiet);
    let run = runner.run(items, &mut executor, &cancel, &progress)?;
    progress.finish();

    print!("{}", failure_report(&run));
    println!("\n{}\n", summary_line(&run, start.elapsed()));

    if let Some(path) = &cli.json {
        write_json(path, &run)?;
        println!("Outcomes written to: {}", path.display());
    }

    if cancel.is_cancelled() {
        eprintln!("run interrupted; unfinished tests were reported as cancelled");
    }

    Ok(run.has_failures())
}
