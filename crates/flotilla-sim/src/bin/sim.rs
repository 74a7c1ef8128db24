#![forbid(unsafe_code)]

use std::env;

use anyhow::Result;
use clap::Parser;
use flotilla_sim::SimulationConfig;
use flotilla_sim::campaign::{CampaignConfig, run_campaign, run_seed};
use flotilla_sim::network::FaultConfig;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Run deterministic multi-node replication simulations.
#[derive(Parser, Debug)]
#[command(name = "flotilla-sim", version)]
struct Args {
    /// First seed to run.
    #[arg(long, default_value_t = 0)]
    seed_start: u64,

    /// Number of consecutive seeds.
    #[arg(long, default_value_t = 50)]
    seeds: u64,

    /// Replay one seed and print its full trace as JSON.
    #[arg(long, conflicts_with_all = ["seed_start", "seeds"])]
    replay: Option<u64>,

    #[arg(long, default_value_t = 3)]
    nodes: usize,

    #[arg(long, default_value_t = 20)]
    rounds: u64,

    #[arg(long, default_value_t = 1)]
    fanout: usize,

    /// Disable every network and clock fault.
    #[arg(long)]
    no_faults: bool,

    #[arg(long, default_value_t = 10)]
    drop_percent: u8,

    #[arg(long, default_value_t = 5)]
    partition_percent: u8,

    #[arg(long, default_value_t = 10)]
    reconcile_percent: u8,

    /// Print the campaign report as JSON.
    #[arg(long)]
    json: bool,
}

impl Args {
    fn campaign(&self) -> CampaignConfig {
        let fault = if self.no_faults {
            FaultConfig::none()
        } else {
            FaultConfig {
                drop_rate_percent: self.drop_percent,
                partition_rate_percent: self.partition_percent,
                ..FaultConfig::default()
            }
        };
        CampaignConfig {
            seed_range: self.seed_start..self.seed_start.saturating_add(self.seeds),
            simulation: SimulationConfig {
                node_count: self.nodes,
                rounds: self.rounds,
                fanout: self.fanout,
                reconcile_rate_percent: self.reconcile_percent,
                fault,
                ..SimulationConfig::default()
            },
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("FLOTILLA_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "flotilla_sim=debug,flotilla_cluster=debug,info"
        } else {
            "flotilla_sim=info,warn"
        })
    });

    let format = env::var("FLOTILLA_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());
    let registry = tracing_subscriber::registry().with(filter);
    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let campaign = args.campaign();

    if let Some(seed) = args.replay {
        campaign.simulation.validate()?;
        let run = run_seed(seed, &campaign)?;
        println!("{}", serde_json::to_string_pretty(&run.result.trace)?);
        for violation in &run.oracle.violations {
            eprintln!("{violation}");
        }
        if !run.oracle.passed() {
            std::process::exit(1);
        }
        return Ok(());
    }

    let report = run_campaign(&campaign)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "campaign complete: seeds={} passed={} interesting={} events={}",
            report.seeds_run,
            report.seeds_passed,
            report.interesting_states_reached,
            report.events_emitted
        );
        for failure in &report.failures {
            println!("seed {} failed:", failure.seed);
            for violation in &failure.violations {
                println!("  {violation}");
            }
        }
    }
    if !report.all_passed() {
        std::process::exit(1);
    }
    Ok(())
}
