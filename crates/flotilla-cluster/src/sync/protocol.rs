//! Version-vector delta pull between nodes.
//!
//! The requesting node sends its [`VersionVector`]; the responder returns
//! the events it has beyond that vector, oldest version first, capped at a
//! batch limit. The requester applies the batch, recomputes its vector, and
//! asks again while the responder reports more.
//!
//! Delivery is at-least-once: a retransmitted batch is absorbed by the
//! applier's event-id dedup, so a lost response only costs a retry on the
//! next tick.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::config::{ClusterConfig, PeerConfig};
use crate::event::{ClusterEvent, EventLog, VersionVector};
use crate::replica::{AdapterRegistry, ApplyReport, apply};
use crate::sync::http::TransportError;

/// Upper bound on request/apply rounds per peer per pull.
pub const MAX_PULL_ROUNDS: usize = 64;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaRequest {
    pub requester_id: String,
    pub vector: VersionVector,
    /// Maximum events wanted; `0` lets the responder pick.
    #[serde(default)]
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaResponse {
    pub responder_id: String,
    pub events: Vec<ClusterEvent>,
    /// The responder holds more events beyond this batch.
    pub has_more: bool,
}

/// Answer a delta request from the local store.
///
/// The effective limit is the requested one clamped to `max_limit`.
///
/// # Errors
///
/// Returns an error if the event log cannot be read.
pub fn serve_delta(
    conn: &Connection,
    responder_id: &str,
    request: &DeltaRequest,
    max_limit: usize,
) -> Result<DeltaResponse> {
    let limit = match request.limit {
        0 => max_limit,
        requested => requested.min(max_limit),
    }
    .max(1);

    let mut events = EventLog::new(conn).delta_since(&request.vector, limit + 1)?;
    let has_more = events.len() > limit;
    events.truncate(limit);

    tracing::debug!(
        requester = %request.requester_id,
        events = events.len(),
        has_more,
        "served delta"
    );
    Ok(DeltaResponse {
        responder_id: responder_id.to_string(),
        events,
        has_more,
    })
}

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// Client side of the peer protocol.
pub trait PeerTransport {
    /// Ask `peer` for the events it has beyond `request.vector`.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the peer cannot be reached, rejects
    /// the request, or answers with something undecodable.
    fn fetch_delta(
        &self,
        peer: &PeerConfig,
        request: &DeltaRequest,
    ) -> Result<DeltaResponse, TransportError>;

    /// Fetch the peer's status document. Its shape belongs to the
    /// coordination layer and is passed through untouched.
    ///
    /// # Errors
    ///
    /// Same conditions as [`PeerTransport::fetch_delta`].
    fn fetch_status(&self, peer: &PeerConfig) -> Result<serde_json::Value, TransportError>;
}

/// Transport that serves deltas straight from other in-process stores.
///
/// Peers registered as unreachable fail every request.
pub struct InMemoryTransport<'a> {
    stores: BTreeMap<String, &'a Connection>,
    unreachable: BTreeSet<String>,
    max_limit: usize,
}

impl<'a> InMemoryTransport<'a> {
    #[must_use]
    pub const fn new(max_limit: usize) -> Self {
        Self {
            stores: BTreeMap::new(),
            unreachable: BTreeSet::new(),
            max_limit,
        }
    }

    pub fn add_peer(&mut self, peer_id: &str, conn: &'a Connection) {
        self.stores.insert(peer_id.to_string(), conn);
    }

    pub fn set_unreachable(&mut self, peer_id: &str, unreachable: bool) {
        if unreachable {
            self.unreachable.insert(peer_id.to_string());
        } else {
            self.unreachable.remove(peer_id);
        }
    }

    fn store(&self, peer: &PeerConfig) -> Result<&'a Connection, TransportError> {
        if self.unreachable.contains(&peer.id) {
            return Err(TransportError::Unreachable {
                peer: peer.id.clone(),
                reason: "partitioned".to_string(),
            });
        }
        self.stores
            .get(&peer.id)
            .copied()
            .ok_or_else(|| TransportError::Unreachable {
                peer: peer.id.clone(),
                reason: "no such peer".to_string(),
            })
    }
}

impl PeerTransport for InMemoryTransport<'_> {
    fn fetch_delta(
        &self,
        peer: &PeerConfig,
        request: &DeltaRequest,
    ) -> Result<DeltaResponse, TransportError> {
        let conn = self.store(peer)?;
        serve_delta(conn, &peer.id, request, self.max_limit).map_err(|err| {
            TransportError::Status {
                peer: peer.id.clone(),
                status: 500,
                detail: format!("{err:#}"),
            }
        })
    }

    fn fetch_status(&self, peer: &PeerConfig) -> Result<serde_json::Value, TransportError> {
        let conn = self.store(peer)?;
        let vector = EventLog::new(conn)
            .version_vector()
            .map_err(|err| TransportError::Status {
                peer: peer.id.clone(),
                status: 500,
                detail: format!("{err:#}"),
            })?;
        Ok(serde_json::json!({ "node_id": peer.id, "vector": vector }))
    }
}

// ---------------------------------------------------------------------------
// Pull driver
// ---------------------------------------------------------------------------

/// What happened with one peer during a pull.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerSyncOutcome {
    pub peer_id: String,
    pub rounds: usize,
    pub received: usize,
    pub apply: ApplyReport,
    /// Set when the peer could not be reached (or rejected us) this cycle.
    pub error: Option<String>,
}

impl PeerSyncOutcome {
    #[must_use]
    pub const fn reachable(&self) -> bool {
        self.error.is_none()
    }
}

/// Summary of one pull across all configured peers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub peers: Vec<PeerSyncOutcome>,
}

impl SyncReport {
    /// Events applied from all peers.
    #[must_use]
    pub fn applied(&self) -> usize {
        self.peers.iter().map(|peer| peer.apply.applied).sum()
    }

    pub fn unreachable(&self) -> impl Iterator<Item = &str> {
        self.peers
            .iter()
            .filter(|peer| !peer.reachable())
            .map(|peer| peer.peer_id.as_str())
    }

    /// Returns `true` if nothing new arrived.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.peers.iter().all(|peer| peer.apply.recorded() == 0)
    }
}

/// Pull and apply every configured peer's delta.
///
/// Peer failures never fail the pull: they are logged, recorded in the
/// report, and retried on the next call. Only local store errors are
/// returned.
///
/// # Errors
///
/// Returns an error if the local store cannot be read or written.
pub fn pull_from_peers(
    conn: &mut Connection,
    registry: &AdapterRegistry,
    config: &ClusterConfig,
    transport: &dyn PeerTransport,
) -> Result<SyncReport> {
    let mut report = SyncReport::default();
    if !config.enabled {
        return Ok(report);
    }

    for peer in &config.peers {
        let outcome = pull_from_peer(conn, registry, config, transport, peer)?;
        report.peers.push(outcome);
    }
    Ok(report)
}

fn pull_from_peer(
    conn: &mut Connection,
    registry: &AdapterRegistry,
    config: &ClusterConfig,
    transport: &dyn PeerTransport,
    peer: &PeerConfig,
) -> Result<PeerSyncOutcome> {
    let mut outcome = PeerSyncOutcome {
        peer_id: peer.id.clone(),
        ..PeerSyncOutcome::default()
    };

    while outcome.rounds < MAX_PULL_ROUNDS {
        let request = DeltaRequest {
            requester_id: config.node_id.clone(),
            vector: EventLog::new(conn).version_vector()?,
            limit: config.delta_batch_limit,
        };

        let response = match transport.fetch_delta(peer, &request) {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(peer = %peer.id, code = err.code().code(), error = %err, "peer unreachable, skipping this cycle");
                outcome.error = Some(err.to_string());
                break;
            }
        };
        outcome.rounds += 1;
        outcome.received += response.events.len();

        let applied = apply(conn, registry, &config.node_id, &response.events)?;
        outcome.apply.absorb(&applied);

        // Nothing new recorded means another round would fetch the same batch.
        if !response.has_more || applied.recorded() == 0 {
            break;
        }
    }

    if outcome.received > 0 {
        tracing::info!(
            peer = %peer.id,
            rounds = outcome.rounds,
            received = outcome.received,
            applied = outcome.apply.applied,
            "pulled delta"
        );
    }
    Ok(outcome)
}
