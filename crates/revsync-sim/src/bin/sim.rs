#![forbid(unsafe_code)]

use std::env;
use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Parser;
use revsync_core::resolve_config;
use revsync_sim::{CampaignConfig, replay_seed, run_campaign};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Run deterministic fault-injection campaigns against the mutation queue.
#[derive(Parser, Debug)]
#[command(name = "revsync-sim", version)]
struct Cli {
    /// First seed of the campaign.
    #[arg(long, default_value_t = 0)]
    start: u64,

    /// Number of seeds to run.
    #[arg(long, default_value_t = 100)]
    seeds: u64,

    /// Workload steps per seed.
    #[arg(long, default_value_t = 80)]
    steps: usize,

    /// Transient network fault rate (percent).
    #[arg(long, default_value_t = 15)]
    transient: u8,

    /// Create rejection rate (percent).
    #[arg(long, default_value_t = 5)]
    reject: u8,

    /// Replay one seed instead of running a campaign.
    #[arg(long)]
    replay: Option<u64>,

    /// Project whose `.revsync/config.toml` supplies retry limits and the
    /// temporary id prefix.
    #[arg(long, default_value = ".")]
    project: PathBuf,

    /// Print the report as JSON.
    #[arg(long)]
    json: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("REVSYNC_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "revsync=debug,info"
        } else {
            "revsync=info,warn"
        })
    });

    let format = env::var("REVSYNC_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry.with(fmt::layer().json().with_ansi(false)).init();
        }
        _ => {
            registry.with(fmt::layer().compact()).init();
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let settings = resolve_config(&cli.project)?;
    let mut config = CampaignConfig {
        seed_range: cli.start..cli.start.saturating_add(cli.seeds),
        steps: cli.steps,
        ..CampaignConfig::default()
    }
    .with_settings(&settings);
    config.faults.transient_percent = cli.transient.min(100);
    config.faults.reject_percent = cli.reject.min(100);

    if let Some(seed) = cli.replay {
        let outcome = replay_seed(seed, &config)?;
        if cli.json {
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        } else {
            println!(
                "seed {seed}: enqueued={} completed={} failed={} removed={} reconciled={}",
                outcome.enqueued, outcome.completed, outcome.failed, outcome.removed, outcome.reconciled
            );
            for violation in &outcome.violations {
                println!("  {violation}");
            }
        }
        if !outcome.passed() {
            bail!("seed {seed} violated {} invariants", outcome.violations.len());
        }
        return Ok(());
    }

    let report = run_campaign(&config)?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "campaign complete: seeds={} passed={} operations={} reconciled={} rolled_back={}",
            report.seeds_run, report.seeds_passed, report.operations, report.reconciled, report.rolled_back
        );
        if let Some(seed) = report.first_failure {
            println!("first failing seed: {seed} (replay with --replay {seed})");
        }
    }
    if !report.all_passed() {
        bail!("{} of {} seeds failed", report.failures.len(), report.seeds_run);
    }
    Ok(())
}
