//! Peer-to-peer delta transfer.
//!
//! The core never listens on a socket. It exposes [`serve_delta`] for the
//! orchestrator's HTTP handlers and pulls from peers through a
//! [`PeerTransport`].

pub mod http;
pub mod protocol;

pub use http::{HttpTransport, TransportError, authorize};
pub use protocol::{
    DeltaRequest, DeltaResponse, InMemoryTransport, MAX_PULL_ROUNDS, PeerSyncOutcome,
    PeerTransport, SyncReport, pull_from_peers, serve_delta,
};
