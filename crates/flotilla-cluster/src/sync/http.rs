//! HTTP client transport and the shared-token check for the server side.
//!
//! Routes (served by the orchestrator's HTTP layer):
//! - `POST <peer>/cluster/delta` with a [`DeltaRequest`] body
//! - `GET <peer>/cluster/status`
//!
//! Both carry `Authorization: Bearer <auth_token>` when a token is set.

use std::time::Duration;

use crate::config::{ClusterConfig, PeerConfig};
use crate::error::ErrorCode;
use crate::sync::protocol::{DeltaRequest, DeltaResponse, PeerTransport};

/// Why a peer request failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("peer {peer} unreachable: {reason}")]
    Unreachable { peer: String, reason: String },

    #[error("peer {peer} rejected the cluster token")]
    Unauthorized { peer: String },

    #[error("peer {peer} answered HTTP {status}: {detail}")]
    Status {
        peer: String,
        status: u16,
        detail: String,
    },

    #[error("peer {peer} sent an undecodable response: {reason}")]
    Decode { peer: String, reason: String },
}

impl TransportError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Unauthorized { .. } => ErrorCode::PeerUnauthorized,
            Self::Decode { .. } => ErrorCode::PayloadDecodeFailed,
            Self::Unreachable { .. } | Self::Status { .. } => ErrorCode::PeerUnreachable,
        }
    }
}

/// [`PeerTransport`] over HTTP/JSON.
pub struct HttpTransport {
    agent: ureq::Agent,
    token: Option<String>,
}

impl HttpTransport {
    #[must_use]
    pub fn new(token: Option<String>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(timeout)
            .user_agent(concat!("flotilla-cluster/", env!("CARGO_PKG_VERSION")))
            .build();
        Self { agent, token }
    }

    #[must_use]
    pub fn from_config(config: &ClusterConfig) -> Self {
        Self::new(config.auth_token.clone(), config.request_timeout())
    }

    fn authorized(&self, request: ureq::Request) -> ureq::Request {
        match &self.token {
            Some(token) => request.set("Authorization", &format!("Bearer {token}")),
            None => request,
        }
    }
}

fn endpoint(peer: &PeerConfig, route: &str) -> String {
    format!("{}/cluster/{route}", peer.url.trim_end_matches('/'))
}

fn map_ureq_error(peer: &PeerConfig, err: ureq::Error) -> TransportError {
    match err {
        ureq::Error::Status(401 | 403, _) => TransportError::Unauthorized {
            peer: peer.id.clone(),
        },
        ureq::Error::Status(status, response) => TransportError::Status {
            peer: peer.id.clone(),
            status,
            detail: response.status_text().to_string(),
        },
        ureq::Error::Transport(transport) => TransportError::Unreachable {
            peer: peer.id.clone(),
            reason: transport.to_string(),
        },
    }
}

impl PeerTransport for HttpTransport {
    fn fetch_delta(
        &self,
        peer: &PeerConfig,
        request: &DeltaRequest,
    ) -> Result<DeltaResponse, TransportError> {
        let response = self
            .authorized(self.agent.post(&endpoint(peer, "delta")))
            .send_json(request)
            .map_err(|err| map_ureq_error(peer, err))?;
        response
            .into_json::<DeltaResponse>()
            .map_err(|err| TransportError::Decode {
                peer: peer.id.clone(),
                reason: err.to_string(),
            })
    }

    fn fetch_status(&self, peer: &PeerConfig) -> Result<serde_json::Value, TransportError> {
        let response = self
            .authorized(self.agent.get(&endpoint(peer, "status")))
            .call()
            .map_err(|err| map_ureq_error(peer, err))?;
        response
            .into_json::<serde_json::Value>()
            .map_err(|err| TransportError::Decode {
                peer: peer.id.clone(),
                reason: err.to_string(),
            })
    }
}

/// Check a presented credential (raw token or `Bearer <token>` header
/// value) against the configured cluster token.
///
/// With no token configured every request is accepted.
#[must_use]
pub fn authorize(config: &ClusterConfig, presented: Option<&str>) -> bool {
    let Some(expected) = config.auth_token.as_deref() else {
        return true;
    };
    let Some(presented) = presented else {
        return false;
    };
    let presented = presented
        .strip_prefix("Bearer ")
        .unwrap_or(presented)
        .trim();
    constant_time_eq(expected.as_bytes(), presented.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0_u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_token(token: Option<&str>) -> ClusterConfig {
        ClusterConfig {
            auth_token: token.map(str::to_string),
            ..ClusterConfig::default()
        }
    }

    #[test]
    fn no_configured_token_accepts_everything() {
        assert!(authorize(&with_token(None), None));
        assert!(authorize(&with_token(None), Some("anything")));
    }

    #[test]
    fn token_must_match_exactly() {
        let config = with_token(Some("s3cret"));
        assert!(authorize(&config, Some("s3cret")));
        assert!(authorize(&config, Some("Bearer s3cret")));
        assert!(!authorize(&config, Some("Bearer s3cre")));
        assert!(!authorize(&config, Some("S3CRET")));
        assert!(!authorize(&config, None));
    }

    #[test]
    fn endpoint_ignores_trailing_slash() {
        let peer = PeerConfig {
            id: "node-a".to_string(),
            url: "http://10.0.0.2:7400/".to_string(),
        };
        assert_eq!(endpoint(&peer, "delta"), "http://10.0.0.2:7400/cluster/delta");
    }

    #[test]
    fn refused_connection_is_unreachable() {
        // Port 9 (discard) on localhost is closed in test environments.
        let transport = HttpTransport::new(None, Duration::from_millis(200));
        let peer = PeerConfig {
            id: "node-a".to_string(),
            url: "http://127.0.0.1:9".to_string(),
        };
        let err = transport
            .fetch_status(&peer)
            .expect_err("nothing listens there");
        assert_eq!(err.code(), ErrorCode::PeerUnreachable);
    }

    #[test]
    fn error_codes_map_to_peer_codes() {
        let unauthorized = TransportError::Unauthorized {
            peer: "a".to_string(),
        };
        assert_eq!(unauthorized.code().code(), "E5002");
        assert!(unauthorized.to_string().contains("rejected"));
    }
}
