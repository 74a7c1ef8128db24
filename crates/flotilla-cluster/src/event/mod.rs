//! Replication events.
//!
//! A [`ClusterEvent`] is one immutable row mutation (`upsert` or `delete`)
//! stamped with a [`ClusterEventVersion`]. Its identity is derived from the
//! emitting node and that node's counter, so the same event always carries
//! the same id no matter how many peers relay it.

pub mod log;
pub mod payload;
pub mod version;

pub use self::log::EventLog;
pub use payload::{FieldValue, Payload};
pub use version::{ClusterEventVersion, VersionVector};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of row mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventOp {
    Upsert,
    Delete,
}

impl EventOp {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Upsert => "upsert",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for EventOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown op string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event op '{0}': expected upsert or delete")]
pub struct UnknownEventOp(pub String);

impl FromStr for EventOp {
    type Err = UnknownEventOp;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upsert" => Ok(Self::Upsert),
            "delete" => Ok(Self::Delete),
            _ => Err(UnknownEventOp(s.to_string())),
        }
    }
}

/// One replicated row mutation.
///
/// `table` is kept as a string on the wire so that events for tables this
/// node does not know (written by newer nodes) still decode and can be
/// recorded and relayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterEvent {
    pub event_id: String,
    pub table: String,
    pub row_id: String,
    pub op: EventOp,
    /// Row contents for `upsert`; `None` for `delete`.
    #[serde(default)]
    pub payload: Option<Payload>,
    pub version: ClusterEventVersion,
    pub created_at: String,
}

impl ClusterEvent {
    /// Build an event whose id is derived from its version.
    #[must_use]
    pub fn new(
        table: impl Into<String>,
        row_id: impl Into<String>,
        op: EventOp,
        payload: Option<Payload>,
        version: ClusterEventVersion,
    ) -> Self {
        let created_at = crate::clock::format_millis(version.logical_ts);
        Self {
            event_id: derive_event_id(&version.actor_id, version.actor_counter),
            table: table.into(),
            row_id: row_id.into(),
            op,
            payload,
            version,
            created_at,
        }
    }

    /// Whether the stored id matches the one derived from the version and
    /// the op/payload combination is coherent.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        let id_matches = self.event_id
            == derive_event_id(&self.version.actor_id, self.version.actor_counter);
        let payload_matches = match self.op {
            EventOp::Upsert => self.payload.is_some(),
            EventOp::Delete => true,
        };
        id_matches && payload_matches && self.version.actor_counter > 0
    }
}

impl fmt::Display for ClusterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}/{} @{}",
            self.event_id, self.op, self.table, self.row_id, self.version
        )
    }
}

/// Globally unique event id: `<actor_id>:<actor_counter>`.
///
/// The counter is always the final `:`-separated segment, so ids stay
/// unambiguous even when actor ids contain colons.
#[must_use]
pub fn derive_event_id(actor_id: &str, actor_counter: u64) -> String {
    format!("{actor_id}:{actor_counter}")
}
