use crate::error::ErrorCode;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Relative location of the cluster config inside a flotilla root.
pub const CONFIG_RELATIVE_PATH: &str = ".flotilla/cluster.toml";

/// Environment variable overriding [`ClusterConfig::node_id`].
pub const NODE_ID_ENV: &str = "FLOTILLA_NODE_ID";

/// Environment variable overriding [`ClusterConfig::auth_token`].
pub const TOKEN_ENV: &str = "FLOTILLA_CLUSTER_TOKEN";

/// Errors produced while loading or validating cluster configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("similarity_threshold must be within 0.0..=1.0, got {0}")]
    ThresholdOutOfRange(f64),

    #[error("cluster is enabled but node_id is empty")]
    MissingNodeId,

    #[error("peer id '{0}' is configured more than once")]
    DuplicatePeer(String),

    #[error("peer '{0}' has the same id as the local node")]
    SelfPeer(String),

    #[error("delta_batch_limit must be greater than zero")]
    ZeroBatchLimit,
}

impl ConfigError {
    /// Machine-readable code associated with this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Read { .. } | Self::Parse { .. } => ErrorCode::ConfigParseError,
            _ => ErrorCode::ConfigInvalid,
        }
    }
}

/// One replication peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: String,
    pub url: String,
}

/// Replication settings for one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub node_id: String,
    /// Externally reachable base URL of this node.
    #[serde(default)]
    pub node_url: Option<String>,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    /// Shared bearer token presented to, and expected from, every peer.
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    #[serde(default = "default_delta_batch_limit")]
    pub delta_batch_limit: usize,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            node_id: String::new(),
            node_url: None,
            peers: Vec::new(),
            auth_token: None,
            request_timeout_ms: default_request_timeout_ms(),
            similarity_threshold: default_similarity_threshold(),
            delta_batch_limit: default_delta_batch_limit(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

impl ClusterConfig {
    /// Per-request timeout for peer transfers.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// How long a core operation waits for the store lock.
    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Check the invariants every other module relies on.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(ConfigError::ThresholdOutOfRange(self.similarity_threshold));
        }
        if self.delta_batch_limit == 0 {
            return Err(ConfigError::ZeroBatchLimit);
        }
        if self.enabled && self.node_id.trim().is_empty() {
            return Err(ConfigError::MissingNodeId);
        }

        let mut seen = HashSet::new();
        for peer in &self.peers {
            if !seen.insert(peer.id.as_str()) {
                return Err(ConfigError::DuplicatePeer(peer.id.clone()));
            }
            if peer.id == self.node_id {
                return Err(ConfigError::SelfPeer(peer.id.clone()));
            }
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self, node_id: Option<String>, token: Option<String>) {
        if let Some(node_id) = node_id.filter(|v| !v.trim().is_empty()) {
            self.node_id = node_id;
        }
        if let Some(token) = token.filter(|v| !v.is_empty()) {
            self.auth_token = Some(token);
        }
    }
}

/// Load `<root>/.flotilla/cluster.toml`, falling back to defaults (cluster
/// disabled) when the file does not exist, then apply env overrides and
/// validate.
///
/// # Errors
///
/// Returns a [`ConfigError`] when the file cannot be read or parsed, or when
/// the resulting config is invalid.
pub fn load_cluster_config(root: &Path) -> Result<ClusterConfig, ConfigError> {
    let path = root.join(CONFIG_RELATIVE_PATH);
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        toml::from_str::<ClusterConfig>(&content)
            .map_err(|source| ConfigError::Parse { path, source })?
    } else {
        ClusterConfig::default()
    };

    config.apply_env_overrides(env::var(NODE_ID_ENV).ok(), env::var(TOKEN_ENV).ok());
    config.validate()?;
    Ok(config)
}

const fn default_request_timeout_ms() -> u64 {
    5_000
}

const fn default_similarity_threshold() -> f64 {
    0.8
}

const fn default_delta_batch_limit() -> usize {
    500
}

const fn default_lock_timeout_ms() -> u64 {
    5_000
}
