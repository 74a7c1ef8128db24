//! Many-seed simulation campaigns.
//!
//! Runs one simulation per seed, checks every invariant, and reports the
//! first failing seed so it can be replayed with full trace.

use std::ops::Range;

use anyhow::{Result, bail};
use flotilla_cluster::replica::AdapterRegistry;
use serde::{Deserialize, Serialize};

use crate::network::FaultConfig;
use crate::oracle::{ConvergenceOracle, OracleResult};
use crate::rng::DeterministicRng;
use crate::{SimulationConfig, SimulationResult, Simulator};

/// Salt mixed into the seed for the oracle's own random choices.
const ORACLE_SEED_SALT: u64 = 0x0AC1_E5EE_D000_0001;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignConfig {
    pub seed_range: Range<u64>,
    /// Template for every run; its `seed` is replaced per run.
    pub simulation: SimulationConfig,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            seed_range: 0..50,
            simulation: SimulationConfig::default(),
        }
    }
}

impl CampaignConfig {
    #[must_use]
    pub fn sim_config_for_seed(&self, seed: u64) -> SimulationConfig {
        SimulationConfig {
            seed,
            ..self.simulation.clone()
        }
    }

    /// Same campaign with every fault switched off.
    #[must_use]
    pub fn fault_free(mut self) -> Self {
        self.simulation.fault = FaultConfig::none();
        self
    }

    /// # Errors
    ///
    /// Returns an error if the seed range is empty or the simulation
    /// template is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.seed_range.is_empty() {
            bail!("seed_range must not be empty");
        }
        self.simulation.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedFailure {
    pub seed: u64,
    pub violations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignReport {
    pub seeds_run: usize,
    pub seeds_passed: usize,
    /// Lowest failing seed, for replay.
    pub first_failure: Option<u64>,
    pub failures: Vec<SeedFailure>,
    /// Seeds that hit at least one fault and one conflict.
    pub interesting_states_reached: usize,
    pub events_emitted: usize,
}

impl CampaignReport {
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// One seed's run with its invariant results.
#[derive(Debug, Clone)]
pub struct SeedRun {
    pub result: SimulationResult,
    pub oracle: OracleResult,
}

/// # Errors
///
/// Returns an error if the config is invalid or a simulated store fails.
/// Invariant violations are reported, not returned as errors.
pub fn run_campaign(config: &CampaignConfig) -> Result<CampaignReport> {
    config.validate()?;

    let mut report = CampaignReport {
        seeds_run: 0,
        seeds_passed: 0,
        first_failure: None,
        failures: Vec::new(),
        interesting_states_reached: 0,
        events_emitted: 0,
    };

    for seed in config.seed_range.clone() {
        let run = run_seed(seed, config)?;
        report.seeds_run += 1;
        report.events_emitted += run.result.events_emitted;
        if run.result.interesting_state_reached {
            report.interesting_states_reached += 1;
        }

        if run.oracle.passed() {
            report.seeds_passed += 1;
        } else {
            tracing::warn!(seed, violations = run.oracle.violations.len(), "seed failed");
            report.first_failure.get_or_insert(seed);
            report.failures.push(SeedFailure {
                seed,
                violations: run.oracle.violations.iter().map(ToString::to_string).collect(),
            });
        }
    }

    tracing::info!(
        seeds = report.seeds_run,
        passed = report.seeds_passed,
        interesting = report.interesting_states_reached,
        "campaign finished"
    );
    Ok(report)
}

/// Run and check a single seed.
///
/// # Errors
///
/// Returns an error if the simulation or an oracle check hits a store
/// failure.
pub fn run_seed(seed: u64, config: &CampaignConfig) -> Result<SeedRun> {
    let mut simulator = Simulator::new(config.sim_config_for_seed(seed))?;
    let result = simulator.run()?;

    let mut stores = simulator.into_stores();
    let mut rng = DeterministicRng::new(seed ^ ORACLE_SEED_SALT);
    let oracle = ConvergenceOracle::check_all(&mut stores, &AdapterRegistry::standard(), &mut rng)?;
    Ok(SeedRun { result, oracle })
}
