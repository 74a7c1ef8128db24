use flotilla_sim::campaign::{CampaignConfig, run_seed};
use flotilla_sim::network::FaultConfig;
use flotilla_sim::{SimulationConfig, TraceEventKind};
use proptest::prelude::*;

fn campaign(node_count: usize, fault: FaultConfig) -> CampaignConfig {
    CampaignConfig {
        seed_range: 0..1,
        simulation: SimulationConfig {
            node_count,
            rounds: 10,
            fault,
            ..SimulationConfig::default()
        },
    }
}

proptest! {
    #![proptest_config(proptest::test_runner::Config::with_cases(16))]

    #[test]
    fn any_seed_converges_under_faults(seed in any::<u64>(), nodes in 2_usize..5) {
        let run = run_seed(seed, &campaign(nodes, FaultConfig::default())).expect("simulate");
        prop_assert!(run.oracle.passed(), "seed {seed}: {:?}", run.oracle.violations);
        prop_assert!(run.result.convergence.converged);
    }
}

#[test]
fn heavy_partitions_still_converge() {
    let fault = FaultConfig {
        drop_rate_percent: 50,
        partition_rate_percent: 40,
        max_delay_rounds: 4,
        ..FaultConfig::default()
    };
    for seed in 0..5 {
        let run = run_seed(seed, &campaign(5, fault)).expect("simulate");
        assert!(run.oracle.passed(), "seed {seed}: {:?}", run.oracle.violations);
        assert!(
            run.result
                .trace
                .iter()
                .any(|event| matches!(event.kind, TraceEventKind::Quiesce { .. }))
        );
    }
}

#[test]
fn reconciling_nodes_converge_on_merged_backlog() {
    let mut config = campaign(3, FaultConfig::none());
    config.simulation.rounds = 25;
    config.simulation.reconcile_rate_percent = 60;
    let run = run_seed(21, &config).expect("simulate");
    assert!(run.oracle.passed(), "{:?}", run.oracle.violations);
    assert!(run.result.stats.merges > 0);
}
