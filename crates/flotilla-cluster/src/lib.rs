//! flotilla-cluster library.
//!
//! Keeps independent flotilla node stores eventually consistent:
//!
//! - [`replica::scan`] turns local row changes into [`event::ClusterEvent`]s
//! - [`sync`] moves events between nodes by version-vector delta
//! - [`replica::apply`] merges remote events with deterministic
//!   last-writer-wins resolution
//! - [`reconcile`](mod@reconcile) folds near-duplicate stories together
//!
//! [`node::ClusterNode`] ties these together behind the node's store lock.
//!
//! # Conventions
//!
//! - **Errors**: Use `anyhow::Result` for return types where appropriate.
//! - **Logging**: Use `tracing` macros (`info!`, `warn!`, `error!`, `debug!`, `trace!`).

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod event;
pub mod lock;
pub mod model;
pub mod node;
pub mod reconcile;
pub mod replica;
pub mod sync;

pub use config::{ClusterConfig, PeerConfig, load_cluster_config};
pub use error::ErrorCode;
pub use event::{ClusterEvent, ClusterEventVersion, EventOp, Payload, VersionVector};
pub use node::{ClusterNode, TickReport};
pub use reconcile::{ReconcileReport, reconcile};
pub use replica::{AdapterRegistry, ApplyReport, ReplicatedTable, ScanReport, apply, scan};
