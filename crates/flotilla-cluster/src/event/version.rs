//! Event versions and version vectors.
//!
//! # Total order
//!
//! Versions compare lexicographically on `(logical_ts, actor_id,
//! actor_counter)`:
//!
//! 1. **Logical timestamp**: later wall/logical time wins.
//! 2. **Actor id**: simultaneous writes from different nodes are ordered by
//!    node identity.
//! 3. **Actor counter**: two events of the same node at the same timestamp
//!    are ordered by the node's sequence.
//!
//! `(actor_id, actor_counter)` is unique per event, so no two distinct events
//! ever compare equal and every node picks the same winner for a conflict.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Version stamped on every replication event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterEventVersion {
    /// Identifier of the emitting node.
    pub actor_id: String,
    /// Strictly increasing per-node sequence, starting at 1.
    pub actor_counter: u64,
    /// Milliseconds since the Unix epoch at emission (never lower than any
    /// timestamp the emitting node had already seen).
    pub logical_ts: i64,
}

impl ClusterEventVersion {
    #[must_use]
    pub fn new(actor_id: impl Into<String>, actor_counter: u64, logical_ts: i64) -> Self {
        Self {
            actor_id: actor_id.into(),
            actor_counter,
            logical_ts,
        }
    }

    /// Returns `true` if `self` supersedes `current` under the total order.
    #[must_use]
    pub fn supersedes(&self, current: &Self) -> bool {
        self > current
    }
}

impl Ord for ClusterEventVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.logical_ts
            .cmp(&other.logical_ts)
            .then_with(|| self.actor_id.cmp(&other.actor_id))
            .then_with(|| self.actor_counter.cmp(&other.actor_counter))
    }
}

impl PartialOrd for ClusterEventVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ClusterEventVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}#{}",
            self.actor_id, self.logical_ts, self.actor_counter
        )
    }
}

/// Per-actor high-water marks: "everything from node X up to counter N".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionVector(BTreeMap<String, u64>);

impl VersionVector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest counter seen from `actor_id` (0 when nothing was seen).
    #[must_use]
    pub fn get(&self, actor_id: &str) -> u64 {
        self.0.get(actor_id).copied().unwrap_or(0)
    }

    /// Raise the high-water mark for `actor_id` to at least `counter`.
    pub fn observe(&mut self, actor_id: &str, counter: u64) {
        let entry = self.0.entry(actor_id.to_string()).or_insert(0);
        *entry = (*entry).max(counter);
    }

    /// Whether an event with `version` is already covered by this vector.
    #[must_use]
    pub fn covers(&self, version: &ClusterEventVersion) -> bool {
        version.actor_counter <= self.get(&version.actor_id)
    }

    /// Pointwise maximum with `other`.
    pub fn merge(&mut self, other: &Self) {
        for (actor, counter) in &other.0 {
            self.observe(actor, *counter);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(actor, counter)| (actor.as_str(), *counter))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl FromIterator<(String, u64)> for VersionVector {
    fn from_iter<I: IntoIterator<Item = (String, u64)>>(iter: I) -> Self {
        let mut vector = Self::new();
        for (actor, counter) in iter {
            vector.observe(&actor, counter);
        }
        vector
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(actor: &str, counter: u64, ts: i64) -> ClusterEventVersion {
        ClusterEventVersion::new(actor, counter, ts)
    }

    #[test]
    fn timestamp_dominates() {
        assert!(v("a", 9, 200).supersedes(&v("z", 1, 100)));
        assert!(!v("z", 1, 100).supersedes(&v("a", 9, 200)));
    }

    #[test]
    fn actor_breaks_timestamp_ties() {
        assert!(v("node-b", 1, 100).supersedes(&v("node-a", 7, 100)));
        assert!(!v("node-a", 7, 100).supersedes(&v("node-b", 1, 100)));
    }

    #[test]
    fn counter_breaks_same_actor_ties() {
        assert!(v("a", 2, 100).supersedes(&v("a", 1, 100)));
    }

    #[test]
    fn equal_versions_do_not_supersede() {
        assert!(!v("a", 1, 100).supersedes(&v("a", 1, 100)));
        assert_eq!(v("a", 1, 100).cmp(&v("a", 1, 100)), Ordering::Equal);
    }

    #[test]
    fn sort_is_deterministic() {
        let mut versions = vec![v("b", 1, 5), v("a", 2, 5), v("a", 1, 5), v("c", 1, 1)];
        versions.sort();
        assert_eq!(
            versions,
            vec![v("c", 1, 1), v("a", 1, 5), v("a", 2, 5), v("b", 1, 5)]
        );
    }

    #[test]
    fn vector_observe_keeps_maximum() {
        let mut vector = VersionVector::new();
        vector.observe("a", 3);
        vector.observe("a", 1);
        vector.observe("b", 2);
        assert_eq!(vector.get("a"), 3);
        assert_eq!(vector.get("b"), 2);
        assert_eq!(vector.get("missing"), 0);
        assert_eq!(vector.len(), 2);
    }

    #[test]
    fn vector_covers_by_actor_counter() {
        let vector: VersionVector = [("a".to_string(), 3)].into_iter().collect();
        assert!(vector.covers(&v("a", 3, 0)));
        assert!(!vector.covers(&v("a", 4, 0)));
        assert!(!vector.covers(&v("b", 1, 0)));
    }

    #[test]
    fn vector_merge_is_pointwise_max() {
        let mut left: VersionVector = [("a".to_string(), 3), ("b".to_string(), 1)]
            .into_iter()
            .collect();
        let right: VersionVector = [("b".to_string(), 4), ("c".to_string(), 2)]
            .into_iter()
            .collect();
        left.merge(&right);
        assert_eq!(
            left.iter().collect::<Vec<_>>(),
            vec![("a", 3), ("b", 4), ("c", 2)]
        );
    }

    #[test]
    fn vector_serializes_as_plain_map() {
        let vector: VersionVector = [("node-a".to_string(), 7)].into_iter().collect();
        assert_eq!(
            serde_json::to_string(&vector).expect("encode"),
            r#"{"node-a":7}"#
        );
    }
}
