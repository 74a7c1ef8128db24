//! Fault-injecting delivery of delta batches between simulated nodes.

use std::collections::BTreeSet;

use flotilla_cluster::sync::DeltaResponse;
use serde::{Deserialize, Serialize};

use crate::rng::DeterministicRng;

/// Index of a node in the simulation.
pub type NodeIndex = usize;

/// Fault rates for the gossip phase. All percentages are per attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultConfig {
    /// Batches are held back for up to this many rounds.
    pub max_delay_rounds: u8,
    pub drop_rate_percent: u8,
    pub duplicate_rate_percent: u8,
    /// Chance that a round's ready batches are delivered in reverse.
    pub reorder_rate_percent: u8,
    /// Chance per round of isolating or reconnecting a random node.
    pub partition_rate_percent: u8,
    /// Chance per round of freezing a random node's clock.
    pub freeze_rate_percent: u8,
    pub freeze_duration_rounds: u8,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            max_delay_rounds: 2,
            drop_rate_percent: 10,
            duplicate_rate_percent: 5,
            reorder_rate_percent: 10,
            partition_rate_percent: 5,
            freeze_rate_percent: 3,
            freeze_duration_rounds: 3,
        }
    }
}

impl FaultConfig {
    /// No faults at all.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_delay_rounds: 0,
            drop_rate_percent: 0,
            duplicate_rate_percent: 0,
            reorder_rate_percent: 0,
            partition_rate_percent: 0,
            freeze_rate_percent: 0,
            freeze_duration_rounds: 0,
        }
    }
}

/// A delta batch in flight from the node that served it to the node that
/// asked for it.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaMessage {
    pub from: NodeIndex,
    pub to: NodeIndex,
    pub response: DeltaResponse,
}

#[derive(Debug, Clone, PartialEq)]
struct InFlight {
    deliver_at_round: u64,
    message: DeltaMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOutcome {
    pub dropped: bool,
    pub duplicated: bool,
    pub delay_rounds: u8,
}

impl SendOutcome {
    const DROPPED: Self = Self {
        dropped: true,
        duplicated: false,
        delay_rounds: 0,
    };
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub messages: Vec<DeltaMessage>,
    pub reordered: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedNetwork {
    in_flight: Vec<InFlight>,
    isolated: BTreeSet<NodeIndex>,
    fault: FaultConfig,
}

impl SimulatedNetwork {
    #[must_use]
    pub const fn new(fault: FaultConfig) -> Self {
        Self {
            in_flight: Vec::new(),
            isolated: BTreeSet::new(),
            fault,
        }
    }

    #[must_use]
    pub const fn fault_config(&self) -> FaultConfig {
        self.fault
    }

    pub fn set_isolated(&mut self, node: NodeIndex, isolated: bool) {
        if isolated {
            self.isolated.insert(node);
        } else {
            self.isolated.remove(&node);
        }
    }

    #[must_use]
    pub fn is_isolated(&self, node: NodeIndex) -> bool {
        self.isolated.contains(&node)
    }

    /// Reconnect every node.
    pub fn heal(&mut self) {
        self.isolated.clear();
    }

    #[must_use]
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Queue a batch, subject to partitions, drops, duplication and delay.
    pub fn send(
        &mut self,
        message: DeltaMessage,
        round: u64,
        rng: &mut DeterministicRng,
    ) -> SendOutcome {
        if self.is_isolated(message.from) || self.is_isolated(message.to) {
            return SendOutcome::DROPPED;
        }
        if rng.chance(self.fault.drop_rate_percent) {
            return SendOutcome::DROPPED;
        }

        let delay = rng.below(u64::from(self.fault.max_delay_rounds) + 1);
        let delay_rounds = u8::try_from(delay).unwrap_or(self.fault.max_delay_rounds);
        let deliver_at_round = round.saturating_add(delay);

        let duplicated = rng.chance(self.fault.duplicate_rate_percent);
        if duplicated {
            self.in_flight.push(InFlight {
                deliver_at_round,
                message: message.clone(),
            });
        }
        self.in_flight.push(InFlight {
            deliver_at_round,
            message,
        });

        SendOutcome {
            dropped: false,
            duplicated,
            delay_rounds,
        }
    }

    /// Hand over every batch due by `round`.
    ///
    /// Batches addressed to a node isolated since sending are lost.
    pub fn deliver_ready(&mut self, round: u64, rng: &mut DeterministicRng) -> Delivery {
        let (ready, later): (Vec<_>, Vec<_>) = self
            .in_flight
            .drain(..)
            .partition(|pending| pending.deliver_at_round <= round);
        self.in_flight = later;

        let mut messages: Vec<DeltaMessage> = ready
            .into_iter()
            .map(|pending| pending.message)
            .filter(|message| !self.is_isolated(message.to))
            .collect();

        let reordered = messages.len() > 1 && rng.chance(self.fault.reorder_rate_percent);
        if reordered {
            messages.reverse();
        }
        Delivery {
            messages,
            reordered,
        }
    }

    /// Hand over everything still in flight, ignoring delays and partitions.
    pub fn drain_all(&mut self) -> Vec<DeltaMessage> {
        self.in_flight
            .drain(..)
            .map(|pending| pending.message)
            .collect()
    }
}
