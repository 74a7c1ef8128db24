//! The per-node entry point used by the orchestrator's scheduler and HTTP
//! layer.
//!
//! Every operation takes the node's exclusive store lock, opens the store,
//! runs to completion, and releases the lock. Nothing runs in the
//! background; the caller decides when to [`ClusterNode::tick`].

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use rusqlite::Connection;

use crate::clock::{SystemClock, WallClock};
use crate::config::{CONFIG_RELATIVE_PATH, ClusterConfig, NODE_ID_ENV};
use crate::db;
use crate::event::{ClusterEvent, EventLog, VersionVector};
use crate::lock::StoreLock;
use crate::reconcile::{self, ReconcileReport};
use crate::replica::{self, AdapterRegistry, ApplyReport, ScanReport};
use crate::sync::{self, DeltaRequest, DeltaResponse, PeerTransport, SyncReport};

/// Outcome of one scheduler tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Local changes captured before pulling.
    pub captured: ScanReport,
    pub sync: SyncReport,
    /// Local changes captured after pulling (writes made during the pull).
    pub captured_after: ScanReport,
}

pub struct ClusterNode {
    store_path: PathBuf,
    config: ClusterConfig,
    registry: AdapterRegistry,
    clock: Box<dyn WallClock>,
}

impl ClusterNode {
    /// Create a node over the store at `store_path`, creating and migrating
    /// the store if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid, has no node id, or the
    /// store cannot be opened.
    pub fn open(store_path: &Path, config: ClusterConfig) -> Result<Self> {
        config.validate().context("validate cluster config")?;
        if config.node_id.trim().is_empty() {
            bail!("cluster node needs a node_id (set it in {CONFIG_RELATIVE_PATH} or {NODE_ID_ENV})");
        }

        let node = Self {
            store_path: store_path.to_path_buf(),
            config,
            registry: AdapterRegistry::standard(),
            clock: Box::new(SystemClock),
        };
        node.with_store(|_| Ok(()))?;
        Ok(node)
    }

    /// Replace the wall clock used to stamp local events.
    #[must_use]
    pub fn with_clock(mut self, clock: Box<dyn WallClock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the adapter registry.
    #[must_use]
    pub fn with_registry(mut self, registry: AdapterRegistry) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    #[must_use]
    pub const fn config(&self) -> &ClusterConfig {
        &self.config
    }

    #[must_use]
    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    /// Run `f` against the store while holding the node lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be taken within the configured
    /// timeout, the store cannot be opened, or `f` fails.
    pub fn with_store<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let lock_path = StoreLock::path_for_store(&self.store_path);
        let lock = StoreLock::acquire(&lock_path, self.config.lock_timeout())
            .with_context(|| format!("lock store {}", self.store_path.display()))?;
        let mut conn = db::open_store(&self.store_path)?;
        let result = f(&mut conn);
        drop(conn);
        lock.release();
        result
    }

    /// Capture local writes as events.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be locked, read, or written.
    pub fn scan(&self) -> Result<ScanReport> {
        self.with_store(|conn| {
            replica::scan(conn, &self.registry, self.node_id(), self.clock.as_ref())
        })
    }

    /// # Errors
    ///
    /// Returns an error if the store cannot be locked or read.
    pub fn version_vector(&self) -> Result<VersionVector> {
        self.with_store(|conn| EventLog::new(conn).version_vector())
    }

    /// Answer a peer's delta request, capped at the configured batch limit.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be locked or read.
    pub fn export_delta(&self, request: &DeltaRequest) -> Result<DeltaResponse> {
        self.with_store(|conn| {
            sync::serve_delta(conn, self.node_id(), request, self.config.delta_batch_limit)
        })
    }

    /// Apply events pushed to or fetched by this node.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be locked, read, or written.
    pub fn apply_events(&self, events: &[ClusterEvent]) -> Result<ApplyReport> {
        self.with_store(|conn| replica::apply(conn, &self.registry, self.node_id(), events))
    }

    /// Pull from every configured peer.
    ///
    /// # Errors
    ///
    /// Returns an error only for local store failures; unreachable peers
    /// are reported in the [`SyncReport`].
    pub fn pull(&self, transport: &dyn PeerTransport) -> Result<SyncReport> {
        self.with_store(|conn| {
            sync::pull_from_peers(conn, &self.registry, &self.config, transport)
        })
    }

    /// Merge near-duplicate stories at the configured threshold.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be locked, read, or written.
    pub fn reconcile(&self) -> Result<ReconcileReport> {
        self.with_store(|conn| {
            reconcile::reconcile(conn, self.config.similarity_threshold, self.clock.as_ref())
        })
    }

    /// One scheduler cycle: scan, pull from peers, scan again. The lock is
    /// held for the whole cycle.
    ///
    /// # Errors
    ///
    /// Returns an error only for local store failures.
    pub fn tick(&self, transport: &dyn PeerTransport) -> Result<TickReport> {
        self.with_store(|conn| {
            let clock = self.clock.as_ref();
            let captured = replica::scan(conn, &self.registry, self.node_id(), clock)?;
            let sync = sync::pull_from_peers(conn, &self.registry, &self.config, transport)?;
            let captured_after = replica::scan(conn, &self.registry, self.node_id(), clock)?;
            Ok(TickReport {
                captured,
                sync,
                captured_after,
            })
        })
    }
}

impl std::fmt::Debug for ClusterNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterNode")
            .field("node_id", &self.config.node_id)
            .field("store_path", &self.store_path)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::PeerConfig;
    use crate::lock::LockError;
    use std::time::Duration;
    use tempfile::TempDir;

    fn node_config(node_id: &str, peers: &[&str]) -> ClusterConfig {
        ClusterConfig {
            enabled: true,
            node_id: node_id.to_string(),
            peers: peers
                .iter()
                .map(|id| PeerConfig {
                    id: (*id).to_string(),
                    url: String::new(),
                })
                .collect(),
            lock_timeout_ms: 50,
            ..ClusterConfig::default()
        }
    }

    fn open_node(dir: &TempDir, node_id: &str, peers: &[&str]) -> ClusterNode {
        ClusterNode::open(&dir.path().join(format!("{node_id}.db")), node_config(node_id, peers))
            .expect("open node")
            .with_clock(Box::new(ManualClock::new(1_000)))
    }

    #[test]
    fn open_requires_a_node_id() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = ClusterNode::open(&dir.path().join("x.db"), ClusterConfig::default())
            .expect_err("no node id");
        assert!(format!("{err:#}").contains("node_id"));
    }

    #[test]
    fn scan_then_pull_replicates_between_nodes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let a = open_node(&dir, "node-a", &["node-b"]);
        let b = open_node(&dir, "node-b", &["node-a"]);

        a.with_store(|conn| {
            conn.execute("INSERT INTO teams (id, name) VALUES ('t1', 'core')", [])?;
            Ok(())
        })?;
        assert_eq!(a.scan()?.total(), 1);

        let a_conn = db::open_store(a.store_path())?;
        let mut transport = sync::InMemoryTransport::new(100);
        transport.add_peer("node-a", &a_conn);

        let tick = b.tick(&transport)?;
        assert_eq!(tick.sync.applied(), 1);
        assert_eq!(tick.captured_after.total(), 0);
        assert_eq!(b.version_vector()?.get("node-a"), 1);
        Ok(())
    }

    #[test]
    fn export_delta_is_capped_by_batch_limit() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = node_config("node-a", &[]);
        config.delta_batch_limit = 1;
        let a = ClusterNode::open(&dir.path().join("a.db"), config)?;
        a.with_store(|conn| {
            conn.execute_batch(
                "INSERT INTO teams (id, name) VALUES ('t1', 'core');
                 INSERT INTO teams (id, name) VALUES ('t2', 'web');",
            )?;
            Ok(())
        })?;
        a.scan()?;

        let response = a.export_delta(&DeltaRequest {
            requester_id: "node-b".to_string(),
            vector: VersionVector::new(),
            limit: 50,
        })?;
        assert_eq!(response.events.len(), 1);
        assert!(response.has_more);
        assert_eq!(response.responder_id, "node-a");
        Ok(())
    }

    #[test]
    fn held_lock_times_out_operations() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let a = open_node(&dir, "node-a", &[]);
        let _held = StoreLock::acquire(
            &StoreLock::path_for_store(a.store_path()),
            Duration::from_millis(50),
        )?;

        let err = a.scan().expect_err("lock is held");
        assert!(matches!(
            err.downcast_ref::<LockError>(),
            Some(LockError::Timeout { .. })
        ));
        Ok(())
    }
}
