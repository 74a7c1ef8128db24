use std::fmt;

/// Machine-readable error codes for operator- and agent-facing diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigParseError,
    ConfigInvalid,
    StoreOpenFailed,
    MigrationFailed,
    UnknownTable,
    PayloadDecodeFailed,
    MergeAborted,
    PeerUnreachable,
    PeerUnauthorized,
    LockContention,
    LockIoFailed,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::ConfigParseError => "E1001",
            Self::ConfigInvalid => "E1002",
            Self::StoreOpenFailed => "E2001",
            Self::MigrationFailed => "E2002",
            Self::UnknownTable => "E3001",
            Self::PayloadDecodeFailed => "E3002",
            Self::MergeAborted => "E4001",
            Self::PeerUnreachable => "E5001",
            Self::PeerUnauthorized => "E5002",
            Self::LockContention => "E6001",
            Self::LockIoFailed => "E6002",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::ConfigParseError => "Cluster config parse error",
            Self::ConfigInvalid => "Cluster config is invalid",
            Self::StoreOpenFailed => "Store could not be opened",
            Self::MigrationFailed => "Store migration failed",
            Self::UnknownTable => "Event references an unregistered table",
            Self::PayloadDecodeFailed => "Event payload could not be decoded",
            Self::MergeAborted => "Duplicate-story merge rolled back",
            Self::PeerUnreachable => "Peer unreachable",
            Self::PeerUnauthorized => "Peer rejected the cluster token",
            Self::LockContention => "Lock contention",
            Self::LockIoFailed => "Lock file I/O failed",
        }
    }

    /// Optional remediation hint that can be surfaced to operators and agents.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::ConfigParseError => Some("Fix syntax in .flotilla/cluster.toml and retry."),
            Self::ConfigInvalid => {
                Some("Check node_id, peer ids and similarity_threshold (0.0-1.0).")
            }
            Self::StoreOpenFailed => Some("Check the store path and its permissions."),
            Self::MigrationFailed => Some("Back up the store and report a bug with logs."),
            Self::UnknownTable => {
                Some("Upgrade this node; the event was recorded but not applied.")
            }
            Self::PayloadDecodeFailed => None,
            Self::MergeAborted => Some("The pair is retried on the next reconcile pass."),
            Self::PeerUnreachable => Some("The peer is retried on the next tick."),
            Self::PeerUnauthorized => Some("Make auth_token identical on every node."),
            Self::LockContention => {
                Some("Retry after the other process releases the store lock.")
            }
            Self::LockIoFailed => Some("Check disk space and write permissions."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::ErrorCode;
    use std::collections::HashSet;

    const ALL: [ErrorCode; 11] = [
        ErrorCode::ConfigParseError,
        ErrorCode::ConfigInvalid,
        ErrorCode::StoreOpenFailed,
        ErrorCode::MigrationFailed,
        ErrorCode::UnknownTable,
        ErrorCode::PayloadDecodeFailed,
        ErrorCode::MergeAborted,
        ErrorCode::PeerUnreachable,
        ErrorCode::PeerUnauthorized,
        ErrorCode::LockContention,
        ErrorCode::LockIoFailed,
    ];

    #[test]
    fn all_codes_are_unique() {
        let mut seen = HashSet::new();
        for code in ALL {
            assert!(seen.insert(code.code()), "duplicate code {}", code.code());
        }
    }

    #[test]
    fn code_format_is_machine_friendly() {
        for code in ALL {
            let raw = code.code();
            assert_eq!(raw.len(), 5);
            assert!(raw.starts_with('E'));
            assert!(raw.chars().skip(1).all(|c| c.is_ascii_digit()));
            assert!(!code.message().is_empty());
        }
    }

    #[test]
    fn display_matches_code() {
        assert_eq!(ErrorCode::LockContention.to_string(), "E6001");
    }
}
