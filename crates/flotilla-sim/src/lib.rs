//! flotilla-sim library.
//!
//! Runs several real flotilla nodes (in-memory stores) through rounds of
//! random local writes, scans, reconciles, and fault-injected delta gossip,
//! then heals the network, lets every node pull from every other until
//! nothing new arrives, and hands the stores to the [`oracle`].
//!
//! A run is fully determined by its [`SimulationConfig`], seed included.
//!
//! # Conventions
//!
//! - **Errors**: Use `anyhow::Result` for return types.
//! - **Logging**: Use `tracing` macros (`info!`, `warn!`, `error!`, `debug!`, `trace!`).

pub mod campaign;
pub mod clock;
pub mod network;
pub mod oracle;
pub mod rng;
pub mod workload;

use anyhow::{Context, Result, bail};
use flotilla_cluster::clock::WallClock;
use flotilla_cluster::event::EventLog;
use flotilla_cluster::replica::{AdapterRegistry, apply, scan};
use flotilla_cluster::sync::{self, DeltaRequest, InMemoryTransport};
use flotilla_cluster::{ClusterConfig, PeerConfig, db, reconcile};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::clock::{ClockConfig, SimulatedClock};
use crate::network::{DeltaMessage, FaultConfig, NodeIndex, SimulatedNetwork};
use crate::oracle::{ConvergenceOracle, ConvergenceReport, StoreDump};
use crate::rng::DeterministicRng;
use crate::workload::{Mutation, Workload};

/// Upper bound on all-pairs pull passes after the faulty rounds.
const MAX_QUIESCENCE_PASSES: u64 = 32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub seed: u64,
    pub node_count: usize,
    pub rounds: u64,
    /// Peers each node asks for a delta per round.
    pub fanout: usize,
    /// Most local writes a node makes per round.
    pub max_writes_per_round: u8,
    /// Chance per round that one random node runs the reconciler.
    pub reconcile_rate_percent: u8,
    pub similarity_threshold: f64,
    pub delta_batch_limit: usize,
    pub fault: FaultConfig,
    pub clock: ClockConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            node_count: 3,
            rounds: 20,
            fanout: 1,
            max_writes_per_round: 3,
            reconcile_rate_percent: 10,
            similarity_threshold: 0.8,
            // Small so that `has_more` paging is exercised.
            delta_batch_limit: 8,
            fault: FaultConfig::default(),
            clock: ClockConfig::default(),
        }
    }
}

impl SimulationConfig {
    /// # Errors
    ///
    /// Returns an error if a parameter is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.node_count == 0 {
            bail!("node_count must be > 0");
        }
        if self.rounds == 0 {
            bail!("rounds must be > 0");
        }
        if self.delta_batch_limit == 0 {
            bail!("delta_batch_limit must be > 0");
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            bail!("similarity_threshold must be within [0, 1]");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Trace
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub round: u64,
    pub kind: TraceEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceEventKind {
    Write {
        node: NodeIndex,
        mutation: Mutation,
    },
    Scan {
        node: NodeIndex,
        upserts: usize,
        deletes: usize,
    },
    Reconcile {
        node: NodeIndex,
        merged: usize,
    },
    Send {
        from: NodeIndex,
        to: NodeIndex,
        events: usize,
        dropped: bool,
        duplicated: bool,
        delay_rounds: u8,
    },
    Deliver {
        from: NodeIndex,
        to: NodeIndex,
        applied: usize,
        superseded: usize,
        duplicates: usize,
    },
    Reorder {
        batches: usize,
    },
    Partition {
        node: NodeIndex,
        isolated: bool,
    },
    Freeze {
        node: NodeIndex,
    },
    Unfreeze {
        node: NodeIndex,
    },
    Quiesce {
        passes: u64,
        drained: usize,
    },
}

/// Counts of faults and conflicts seen during a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultStats {
    pub dropped: usize,
    pub duplicated: usize,
    pub reordered: usize,
    pub partitions: usize,
    pub freezes: usize,
    /// Remote events that lost to a newer version of their row.
    pub superseded: usize,
    pub merges: usize,
}

impl FaultStats {
    /// True once the run has hit at least one fault and one conflict.
    #[must_use]
    pub const fn interesting(&self) -> bool {
        let faulted = self.dropped + self.duplicated + self.reordered + self.partitions + self.freezes > 0;
        faulted && self.superseded + self.merges > 0
    }
}

#[derive(Debug, Clone)]
pub struct SimulationResult {
    pub seed: u64,
    pub trace: Vec<TraceEvent>,
    pub dumps: Vec<StoreDump>,
    pub convergence: ConvergenceReport,
    pub events_emitted: usize,
    pub stats: FaultStats,
    pub interesting_state_reached: bool,
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

struct SimNode {
    id: String,
    conn: Connection,
    clock: SimulatedClock,
    workload: Workload,
    frozen_until: Option<u64>,
}

pub struct Simulator {
    config: SimulationConfig,
    rng: DeterministicRng,
    registry: AdapterRegistry,
    network: SimulatedNetwork,
    nodes: Vec<SimNode>,
    trace: Vec<TraceEvent>,
    stats: FaultStats,
    events_emitted: usize,
}

impl Simulator {
    /// # Errors
    ///
    /// Returns an error if the config is invalid or a store cannot be
    /// opened.
    pub fn new(config: SimulationConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = DeterministicRng::new(config.seed);
        let mut nodes = Vec::with_capacity(config.node_count);
        for index in 0..config.node_count {
            nodes.push(SimNode {
                id: format!("node-{index}"),
                conn: db::open_in_memory().context("open simulated store")?,
                clock: SimulatedClock::new(config.clock.assign(&mut rng)),
                workload: Workload::new(index),
                frozen_until: None,
            });
        }
        Ok(Self {
            network: SimulatedNetwork::new(config.fault),
            config,
            rng,
            registry: AdapterRegistry::standard(),
            nodes,
            trace: Vec::new(),
            stats: FaultStats::default(),
            events_emitted: 0,
        })
    }

    /// Run every round, then quiesce and summarize.
    ///
    /// # Errors
    ///
    /// Returns an error if a store operation fails. Invariant violations
    /// are not errors; see [`ConvergenceOracle`].
    pub fn run(&mut self) -> Result<SimulationResult> {
        for round in 0..self.config.rounds {
            self.step(round)?;
        }
        self.quiesce(self.config.rounds)?;

        let dumps = self
            .nodes
            .iter()
            .map(|node| StoreDump::capture(&node.id, &node.conn, &self.registry))
            .collect::<Result<Vec<_>>>()?;
        let convergence = ConvergenceOracle::evaluate(&dumps);
        tracing::info!(
            seed = self.config.seed,
            events = self.events_emitted,
            rows = convergence.row_count,
            converged = convergence.converged,
            "simulation finished"
        );

        Ok(SimulationResult {
            seed: self.config.seed,
            trace: self.trace.clone(),
            dumps,
            convergence,
            events_emitted: self.events_emitted,
            stats: self.stats,
            interesting_state_reached: self.stats.interesting(),
        })
    }

    /// Hand the node stores over for oracle checks.
    #[must_use]
    pub fn into_stores(self) -> Vec<(String, Connection)> {
        self.nodes
            .into_iter()
            .map(|node| (node.id, node.conn))
            .collect()
    }

    fn record(&mut self, round: u64, kind: TraceEventKind) {
        tracing::trace!(round, ?kind, "sim");
        self.trace.push(TraceEvent { round, kind });
    }

    fn step(&mut self, round: u64) -> Result<()> {
        self.inject_faults(round);
        for index in 0..self.nodes.len() {
            self.nodes[index].clock.set_round(round);
            self.local_writes(round, index)?;
        }
        if self.rng.chance(self.config.reconcile_rate_percent) {
            let index = self.rng.index(self.nodes.len());
            self.reconcile_node(round, index)?;
        }
        self.gossip(round)?;
        let delivery = self.network.deliver_ready(round, &mut self.rng);
        if delivery.reordered {
            self.stats.reordered += 1;
            self.record(
                round,
                TraceEventKind::Reorder {
                    batches: delivery.messages.len(),
                },
            );
        }
        for message in delivery.messages {
            self.deliver(round, &message)?;
        }
        Ok(())
    }

    fn inject_faults(&mut self, round: u64) {
        let node_count = self.nodes.len();
        for index in 0..node_count {
            let node = &mut self.nodes[index];
            if node.frozen_until.is_some_and(|until| round >= until) {
                node.frozen_until = None;
                node.clock.unfreeze();
                self.record(round, TraceEventKind::Unfreeze { node: index });
            }
        }

        let fault = self.network.fault_config();
        if self.rng.chance(fault.partition_rate_percent) {
            let node = self.rng.index(node_count);
            let isolated = !self.network.is_isolated(node);
            self.network.set_isolated(node, isolated);
            self.stats.partitions += 1;
            self.record(round, TraceEventKind::Partition { node, isolated });
        }
        if self.rng.chance(fault.freeze_rate_percent) {
            let index = self.rng.index(node_count);
            let node = &mut self.nodes[index];
            if node.frozen_until.is_none() {
                node.clock.set_round(round);
                node.clock.freeze();
                node.frozen_until = Some(round + u64::from(fault.freeze_duration_rounds));
                self.stats.freezes += 1;
                self.record(round, TraceEventKind::Freeze { node: index });
            }
        }
    }

    fn local_writes(&mut self, round: u64, index: NodeIndex) -> Result<()> {
        let writes = self.rng.below(u64::from(self.config.max_writes_per_round) + 1);
        for _ in 0..writes {
            let node = &mut self.nodes[index];
            let now = node.clock.now_millis();
            let mutation = node.workload.step(&node.conn, &mut self.rng, now)?;
            self.record(
                round,
                TraceEventKind::Write {
                    node: index,
                    mutation,
                },
            );
        }
        self.scan_node(round, index)
    }

    fn scan_node(&mut self, round: u64, index: NodeIndex) -> Result<()> {
        let node = &mut self.nodes[index];
        let report = scan(&mut node.conn, &self.registry, &node.id, &node.clock)?;
        if report.total() > 0 {
            self.events_emitted += report.total();
            self.record(
                round,
                TraceEventKind::Scan {
                    node: index,
                    upserts: report.upserts,
                    deletes: report.deletes,
                },
            );
        }
        Ok(())
    }

    fn reconcile_node(&mut self, round: u64, index: NodeIndex) -> Result<()> {
        let node = &mut self.nodes[index];
        node.clock.set_round(round);
        let report = reconcile(&mut node.conn, self.config.similarity_threshold, &node.clock)?;
        self.stats.merges += report.merged;
        self.record(
            round,
            TraceEventKind::Reconcile {
                node: index,
                merged: report.merged,
            },
        );
        // Merges become ordinary events on the next scan.
        self.scan_node(round, index)
    }

    /// Every node asks `fanout` random peers for what it is missing. The
    /// delta is computed now and delivered whenever the network decides.
    fn gossip(&mut self, round: u64) -> Result<()> {
        let node_count = self.nodes.len();
        for to in 0..node_count {
            let mut peers: Vec<NodeIndex> = (0..node_count).filter(|&peer| peer != to).collect();
            self.rng.shuffle(&mut peers);
            peers.truncate(self.config.fanout);

            for from in peers {
                let request = DeltaRequest {
                    requester_id: self.nodes[to].id.clone(),
                    vector: EventLog::new(&self.nodes[to].conn).version_vector()?,
                    limit: self.config.delta_batch_limit,
                };
                let responder = &self.nodes[from];
                let response = sync::serve_delta(
                    &responder.conn,
                    &responder.id,
                    &request,
                    self.config.delta_batch_limit,
                )?;
                if response.events.is_empty() {
                    continue;
                }

                let events = response.events.len();
                let outcome =
                    self.network
                        .send(DeltaMessage { from, to, response }, round, &mut self.rng);
                if outcome.dropped {
                    self.stats.dropped += 1;
                }
                if outcome.duplicated {
                    self.stats.duplicated += 1;
                }
                self.record(
                    round,
                    TraceEventKind::Send {
                        from,
                        to,
                        events,
                        dropped: outcome.dropped,
                        duplicated: outcome.duplicated,
                        delay_rounds: outcome.delay_rounds,
                    },
                );
            }
        }
        Ok(())
    }

    fn deliver(&mut self, round: u64, message: &DeltaMessage) -> Result<()> {
        let node = &mut self.nodes[message.to];
        let report = apply(
            &mut node.conn,
            &self.registry,
            &node.id,
            &message.response.events,
        )?;
        self.stats.superseded += report.superseded;
        self.record(
            round,
            TraceEventKind::Deliver {
                from: message.from,
                to: message.to,
                applied: report.applied,
                superseded: report.superseded,
                duplicates: report.duplicates,
            },
        );
        Ok(())
    }

    /// Heal everything, flush the network, then pull all-pairs through the
    /// regular sync driver until a full pass brings nothing new.
    fn quiesce(&mut self, round: u64) -> Result<()> {
        self.network.heal();
        for node in &mut self.nodes {
            node.clock.set_round(round);
            node.clock.unfreeze();
            node.frozen_until = None;
        }

        let drained = self.network.drain_all();
        let drained_count = drained.len();
        for message in &drained {
            self.deliver(round, message)?;
        }

        let mut passes = 0;
        while passes < MAX_QUIESCENCE_PASSES {
            passes += 1;
            let mut quiet = true;
            for index in 0..self.nodes.len() {
                let report = self.pull_all(index)?;
                self.stats.superseded += report.peers.iter().map(|peer| peer.apply.superseded).sum::<usize>();
                quiet &= report.is_noop();
            }
            if quiet {
                break;
            }
        }
        if passes == MAX_QUIESCENCE_PASSES {
            tracing::warn!(seed = self.config.seed, passes, "quiescence pass limit reached");
        }
        self.record(
            round,
            TraceEventKind::Quiesce {
                passes,
                drained: drained_count,
            },
        );
        Ok(())
    }

    fn pull_all(&mut self, index: NodeIndex) -> Result<sync::SyncReport> {
        let (before, rest) = self.nodes.split_at_mut(index);
        let Some((node, after)) = rest.split_first_mut() else {
            return Ok(sync::SyncReport::default());
        };

        let mut transport = InMemoryTransport::new(self.config.delta_batch_limit);
        let mut peers = Vec::new();
        for peer in before.iter().chain(after.iter()) {
            transport.add_peer(&peer.id, &peer.conn);
            peers.push(PeerConfig {
                id: peer.id.clone(),
                url: String::new(),
            });
        }
        let config = ClusterConfig {
            enabled: true,
            node_id: node.id.clone(),
            peers,
            delta_batch_limit: self.config.delta_batch_limit,
            ..ClusterConfig::default()
        };
        sync::pull_from_peers(&mut node.conn, &self.registry, &config, &transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_config(seed: u64) -> SimulationConfig {
        SimulationConfig {
            seed,
            fault: FaultConfig::none(),
            ..SimulationConfig::default()
        }
    }

    #[test]
    fn invalid_config_is_rejected() {
        for config in [
            SimulationConfig {
                node_count: 0,
                ..SimulationConfig::default()
            },
            SimulationConfig {
                rounds: 0,
                ..SimulationConfig::default()
            },
            SimulationConfig {
                similarity_threshold: 1.5,
                ..SimulationConfig::default()
            },
        ] {
            assert!(Simulator::new(config).is_err());
        }
    }

    #[test]
    fn fault_free_run_converges() -> Result<()> {
        let mut sim = Simulator::new(quiet_config(1))?;
        let result = sim.run()?;
        assert!(result.events_emitted > 0);
        assert!(result.convergence.converged, "{:?}", result.convergence);
        assert!(result.convergence.row_count > 0);
        Ok(())
    }

    #[test]
    fn faulty_run_converges_after_quiescence() -> Result<()> {
        let config = SimulationConfig {
            seed: 17,
            node_count: 4,
            rounds: 30,
            fault: FaultConfig {
                drop_rate_percent: 30,
                partition_rate_percent: 20,
                freeze_rate_percent: 10,
                ..FaultConfig::default()
            },
            ..SimulationConfig::default()
        };
        let mut sim = Simulator::new(config)?;
        let result = sim.run()?;
        assert!(result.convergence.converged, "{:?}", result.convergence);
        assert!(result.stats.dropped > 0);
        Ok(())
    }

    #[test]
    fn same_seed_same_trace() -> Result<()> {
        let first = Simulator::new(SimulationConfig::default())?.run()?;
        let second = Simulator::new(SimulationConfig::default())?.run()?;
        assert_eq!(first.trace, second.trace);
        assert_eq!(first.dumps, second.dumps);
        Ok(())
    }

    #[test]
    fn single_node_needs_no_network() -> Result<()> {
        let config = SimulationConfig {
            node_count: 1,
            ..quiet_config(3)
        };
        let result = Simulator::new(config)?.run()?;
        assert!(result.convergence.converged);
        assert!(
            !result
                .trace
                .iter()
                .any(|event| matches!(event.kind, TraceEventKind::Send { .. }))
        );
        Ok(())
    }
}
