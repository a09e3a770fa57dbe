//! CLI command definitions for pqueue-fetcher.
//!
//! This module provides commands for running simulation scenarios through the
//! fetcher pool and for inspecting the effective configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use crate::fetcher::FetcherConfig;
use crate::metrics::{export_metrics, init_metrics};
use crate::simulate::{run_scenario, RunOptions, Scenario, ScenarioReport};

/// Priority-queue fetcher with supervised, deadline-bounded attempts.
#[derive(Parser)]
#[command(name = "pqueue-fetcher")]
#[command(about = "Fetch locations in priority order with per-attempt deadlines")]
#[command(version)]
#[command(
    long_about = "pqueue-fetcher runs a pool of workers that fetch locations in priority order.\n\nAttempts that exceed their deadline are cancelled and requeued with a decayed priority.\n\nExample usage:\n  pqueue-fetcher simulate scenario.yaml --workers 1 --timeout-ms 100"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run a simulation scenario through the fetcher pool.
    #[command(alias = "sim")]
    Simulate(SimulateArgs),

    /// Print the effective configuration as YAML.
    Config(ConfigArgs),
}

/// Options shared by commands that build a fetcher configuration.
#[derive(Parser, Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// YAML configuration file; `FETCHER_*` environment variables otherwise.
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Number of workers.
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Per-attempt deadline in milliseconds.
    #[arg(short = 't', long)]
    pub timeout_ms: Option<u64>,
}

impl ConfigOverrides {
    /// Resolves the configuration: file or environment, then CLI overrides.
    pub fn resolve(&self) -> anyhow::Result<FetcherConfig> {
        let mut config = match &self.config {
            Some(path) => FetcherConfig::from_yaml_file(path)?,
            None => FetcherConfig::from_env()?,
        };

        if let Some(workers) = self.workers {
            config.num_workers = workers;
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.timeout = Duration::from_millis(timeout_ms);
        }

        config.validate()?;
        Ok(config)
    }
}

/// Arguments for `pqueue-fetcher simulate`.
#[derive(Parser, Debug)]
pub struct SimulateArgs {
    /// Scenario file (YAML).
    pub scenario: PathBuf,

    #[command(flatten)]
    pub overrides: ConfigOverrides,

    /// Use a yield point that never observes cancellation.
    #[arg(long)]
    pub no_yield: bool,

    /// Give up if the scenario has not drained after this many seconds.
    #[arg(long, default_value = "60")]
    pub max_wait_secs: u64,

    /// Output JSON report.
    #[arg(short = 'j', long)]
    pub json: bool,

    /// Print Prometheus metrics after the run.
    #[arg(long)]
    pub metrics: bool,
}

/// Arguments for `pqueue-fetcher config`.
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(flatten)]
    pub overrides: ConfigOverrides,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
///
/// For more control over logging initialization, use `parse_cli()` and
/// `run_with_cli()`.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Simulate(args) => run_simulate_command(args).await,
        Commands::Config(args) => run_config_command(args),
    }
}

async fn run_simulate_command(args: SimulateArgs) -> anyhow::Result<()> {
    if !args.scenario.exists() {
        return Err(anyhow::anyhow!(
            "Scenario file does not exist: {}",
            args.scenario.display()
        ));
    }

    let config = args.overrides.resolve()?;
    let scenario = Scenario::from_yaml_file(&args.scenario)?;

    if args.metrics {
        init_metrics()?;
    }

    info!(
        scenario = %args.scenario.display(),
        workers = config.num_workers,
        timeout_ms = config.timeout.as_millis() as u64,
        "Starting simulation"
    );

    let options = RunOptions {
        no_yield: args.no_yield,
        max_wait: Duration::from_secs(args.max_wait_secs),
    };
    let report = run_scenario(&scenario, config, &options).await?;

    if args.json {
        let json = serde_json::to_string_pretty(&report)?;
        println!("{json}");
    } else {
        print_report(&report);
    }

    if args.metrics {
        print!("{}", export_metrics());
    }

    Ok(())
}

fn print_report(report: &ScenarioReport) {
    let stats = &report.stats;

    println!(
        "\n=== Scenario: {} ===",
        report.name.as_deref().unwrap_or("unnamed")
    );
    println!(
        "Results:        {}",
        report
            .results
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("Attempts:       {}", stats.total_attempts);
    println!("Published:      {}", stats.published);
    println!("Interrupted:    {}", stats.requeued_interrupted);
    println!("Rejected:       {}", stats.requeued_rejected);
    println!("Failed:         {}", stats.requeued_failed);
    println!("Dead letters:   {}", stats.dead_lettered);
    println!("Abandoned:      {}", stats.abandoned);
    println!(
        "Avg attempt:    {}ms",
        stats.average_attempt_duration.as_millis()
    );
    println!("Elapsed:        {}ms", report.elapsed_ms);

    for letter in &report.dead_letters {
        println!(
            "  dead letter {} after {} attempts: {}",
            letter.value, letter.attempts, letter.error
        );
    }
}

fn run_config_command(args: ConfigArgs) -> anyhow::Result<()> {
    let config = args.overrides.resolve()?;
    print!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}
