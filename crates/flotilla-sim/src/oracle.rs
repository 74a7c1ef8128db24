//! Invariant checks run against node stores after a simulation.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::{Context, Result};
use flotilla_cluster::db;
use flotilla_cluster::event::{EventLog, Payload, VersionVector};
use flotilla_cluster::replica::{AdapterRegistry, apply};
use rusqlite::Connection;

use crate::rng::DeterministicRng;

/// Full replicated contents of one node: table -> row id -> row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreDump {
    pub node_id: String,
    pub tables: BTreeMap<String, BTreeMap<String, Payload>>,
}

impl StoreDump {
    /// Read every replicated table through its adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if a table cannot be read.
    pub fn capture(node_id: &str, conn: &Connection, registry: &AdapterRegistry) -> Result<Self> {
        let mut tables = BTreeMap::new();
        for adapter in registry.iter() {
            let table = adapter.table();
            let rows = adapter
                .load_all(conn)
                .with_context(|| format!("dump {table} on {node_id}"))?
                .into_iter()
                .map(|snapshot| (snapshot.row_id, snapshot.payload))
                .collect();
            tables.insert(table.to_string(), rows);
        }
        Ok(Self {
            node_id: node_id.to_string(),
            tables,
        })
    }

    #[must_use]
    pub fn row_count(&self) -> usize {
        self.tables.values().map(BTreeMap::len).sum()
    }

    /// Rows that are missing or different in `other`, as `(table, row_id)`.
    fn differences(&self, other: &Self) -> Vec<(String, String)> {
        let mut diffs = Vec::new();
        let empty = BTreeMap::new();
        for (table, rows) in &self.tables {
            let theirs = other.tables.get(table).unwrap_or(&empty);
            for (row_id, payload) in rows {
                if theirs.get(row_id) != Some(payload) {
                    diffs.push((table.clone(), row_id.clone()));
                }
            }
            for row_id in theirs.keys() {
                if !rows.contains_key(row_id) {
                    diffs.push((table.clone(), row_id.clone()));
                }
            }
        }
        diffs
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    /// Two nodes hold different rows after quiescence.
    Divergence {
        node_a: String,
        node_b: String,
        table: String,
        row_id: String,
    },
    /// Re-delivering a node's own log changed something.
    Idempotence {
        node_id: String,
        reapplied: usize,
        recorded: usize,
        rows_changed: bool,
    },
    /// A fresh store fed the log in shuffled batches ended up different.
    Replay { table: String, row_id: String },
    /// Two nodes disagree on which events exist.
    VectorMismatch { node_a: String, node_b: String },
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Divergence {
                node_a,
                node_b,
                table,
                row_id,
            } => write!(f, "Divergence: {node_a} and {node_b} disagree on {table}/{row_id}"),
            Self::Idempotence {
                node_id,
                reapplied,
                recorded,
                rows_changed,
            } => write!(
                f,
                "Idempotence: re-delivering {node_id}'s log recorded {recorded} and applied \
                 {reapplied} events (rows_changed={rows_changed})"
            ),
            Self::Replay { table, row_id } => {
                write!(f, "Replay: shuffled replay differs on {table}/{row_id}")
            }
            Self::VectorMismatch { node_a, node_b } => {
                write!(f, "VectorMismatch: {node_a} and {node_b} saw different events")
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OracleResult {
    pub violations: Vec<InvariantViolation>,
}

impl OracleResult {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    #[must_use]
    fn merge(mut self, other: Self) -> Self {
        self.violations.extend(other.violations);
        self
    }
}

/// Quick summary used in simulation results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvergenceReport {
    pub converged: bool,
    /// Nodes whose dump differs from the first node's.
    pub divergent_nodes: Vec<String>,
    pub row_count: usize,
}

// ---------------------------------------------------------------------------
// Oracle
// ---------------------------------------------------------------------------

/// Checks that replication converged and behaves like a join-semilattice:
///
/// 1. every node holds identical rows and the same version vector
/// 2. re-delivering a full log is a no-op
/// 3. replaying a log into an empty store, shuffled and split into batches,
///    rebuilds the same rows
pub struct ConvergenceOracle;

impl ConvergenceOracle {
    #[must_use]
    pub fn evaluate(dumps: &[StoreDump]) -> ConvergenceReport {
        let Some((first, rest)) = dumps.split_first() else {
            return ConvergenceReport {
                converged: true,
                divergent_nodes: Vec::new(),
                row_count: 0,
            };
        };
        let divergent_nodes: Vec<String> = rest
            .iter()
            .filter(|dump| dump.tables != first.tables)
            .map(|dump| dump.node_id.clone())
            .collect();
        ConvergenceReport {
            converged: divergent_nodes.is_empty(),
            divergent_nodes,
            row_count: first.row_count(),
        }
    }

    /// Compare every node against the first, row by row.
    #[must_use]
    pub fn check_convergence(dumps: &[StoreDump]) -> OracleResult {
        let mut result = OracleResult::default();
        let Some((first, rest)) = dumps.split_first() else {
            return result;
        };
        for other in rest {
            for (table, row_id) in first.differences(other) {
                result.violations.push(InvariantViolation::Divergence {
                    node_a: first.node_id.clone(),
                    node_b: other.node_id.clone(),
                    table,
                    row_id,
                });
            }
        }
        result
    }

    #[must_use]
    pub fn check_vectors(vectors: &[(String, VersionVector)]) -> OracleResult {
        let mut result = OracleResult::default();
        let Some(((first_id, first), rest)) = vectors.split_first() else {
            return result;
        };
        for (node_id, vector) in rest {
            if vector != first {
                result.violations.push(InvariantViolation::VectorMismatch {
                    node_a: first_id.clone(),
                    node_b: node_id.clone(),
                });
            }
        }
        result
    }

    /// Re-deliver the node's entire log to itself.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub fn check_idempotence(
        node_id: &str,
        conn: &mut Connection,
        registry: &AdapterRegistry,
    ) -> Result<OracleResult> {
        let before = StoreDump::capture(node_id, conn, registry)?;
        let events = EventLog::new(conn).delta_since(&VersionVector::new(), usize::MAX)?;
        let report = apply(conn, registry, node_id, &events)?;
        let after = StoreDump::capture(node_id, conn, registry)?;

        let rows_changed = before != after;
        let mut result = OracleResult::default();
        if report.recorded() > 0 || rows_changed {
            result.violations.push(InvariantViolation::Idempotence {
                node_id: node_id.to_string(),
                reapplied: report.applied,
                recorded: report.recorded(),
                rows_changed,
            });
        }
        Ok(result)
    }

    /// Rebuild the node's rows in a fresh store from its log, delivered in
    /// shuffled batches of random size.
    ///
    /// # Errors
    ///
    /// Returns an error if either store cannot be read or written.
    pub fn check_replay(
        node_id: &str,
        conn: &Connection,
        registry: &AdapterRegistry,
        rng: &mut DeterministicRng,
    ) -> Result<OracleResult> {
        let expected = StoreDump::capture(node_id, conn, registry)?;
        let mut events = EventLog::new(conn).delta_since(&VersionVector::new(), usize::MAX)?;
        rng.shuffle(&mut events);

        let mut replica = db::open_in_memory().context("open replay store")?;
        let mut rest = events.as_slice();
        while !rest.is_empty() {
            let take = 1 + rng.index(rest.len().min(16));
            let (batch, tail) = rest.split_at(take);
            apply(&mut replica, registry, "replay", batch)?;
            rest = tail;
        }

        let rebuilt = StoreDump::capture(node_id, &replica, registry)?;
        let violations = expected
            .differences(&rebuilt)
            .into_iter()
            .map(|(table, row_id)| InvariantViolation::Replay { table, row_id })
            .collect();
        Ok(OracleResult { violations })
    }

    /// Run every check. Idempotence and replay use the first store.
    ///
    /// # Errors
    ///
    /// Returns an error if a store cannot be read or written.
    pub fn check_all(
        nodes: &mut [(String, Connection)],
        registry: &AdapterRegistry,
        rng: &mut DeterministicRng,
    ) -> Result<OracleResult> {
        let mut dumps = Vec::with_capacity(nodes.len());
        let mut vectors = Vec::with_capacity(nodes.len());
        for (node_id, conn) in &*nodes {
            dumps.push(StoreDump::capture(node_id, conn, registry)?);
            vectors.push((node_id.clone(), EventLog::new(conn).version_vector()?));
        }

        let mut result = Self::check_convergence(&dumps).merge(Self::check_vectors(&vectors));
        if let Some((node_id, conn)) = nodes.first_mut() {
            result = result.merge(Self::check_replay(node_id, conn, registry, rng)?);
            result = result.merge(Self::check_idempotence(node_id, conn, registry)?);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_cluster::clock::ManualClock;
    use flotilla_cluster::replica::scan;

    fn node(node_id: &str, teams: &[(&str, &str)]) -> (String, Connection) {
        let mut conn = db::open_in_memory().expect("store");
        for (id, name) in teams {
            conn.execute(
                "INSERT INTO teams (id, name) VALUES (?1, ?2)",
                rusqlite::params![id, name],
            )
            .expect("insert team");
        }
        scan(
            &mut conn,
            &AdapterRegistry::standard(),
            node_id,
            &ManualClock::new(1_000),
        )
        .expect("scan");
        (node_id.to_string(), conn)
    }

    fn dump(node: &(String, Connection)) -> StoreDump {
        StoreDump::capture(&node.0, &node.1, &AdapterRegistry::standard()).expect("dump")
    }

    #[test]
    fn identical_rows_converge() {
        let a = node("a", &[("t1", "core")]);
        let b = node("b", &[("t1", "core")]);
        let report = ConvergenceOracle::evaluate(&[dump(&a), dump(&b)]);
        assert!(report.converged);
        assert_eq!(report.row_count, 1);
        assert!(ConvergenceOracle::check_convergence(&[dump(&a), dump(&b)]).passed());
    }

    #[test]
    fn differing_and_missing_rows_are_reported() {
        let a = node("a", &[("t1", "core"), ("t2", "web")]);
        let b = node("b", &[("t1", "platform")]);
        let report = ConvergenceOracle::evaluate(&[dump(&a), dump(&b)]);
        assert_eq!(report.divergent_nodes, vec!["b".to_string()]);

        let result = ConvergenceOracle::check_convergence(&[dump(&a), dump(&b)]);
        assert_eq!(result.violations.len(), 2);
        assert!(result.violations[0].to_string().contains("teams/t1"));
    }

    #[test]
    fn vector_mismatch_is_reported() {
        let a = node("a", &[("t1", "core")]);
        let b = node("b", &[("t1", "core")]);
        let vectors = vec![
            ("a".to_string(), EventLog::new(&a.1).version_vector().expect("vector")),
            ("b".to_string(), EventLog::new(&b.1).version_vector().expect("vector")),
        ];
        let result = ConvergenceOracle::check_vectors(&vectors);
        assert!(!result.passed());
    }

    #[test]
    fn single_node_passes_every_check() -> Result<()> {
        let mut nodes = vec![node("a", &[("t1", "core"), ("t2", "web"), ("t3", "data")])];
        nodes[0].1.execute("UPDATE teams SET name = 'infra' WHERE id = 't2'", [])?;
        nodes[0].1.execute("DELETE FROM teams WHERE id = 't3'", [])?;
        scan(
            &mut nodes[0].1,
            &AdapterRegistry::standard(),
            "a",
            &ManualClock::new(2_000),
        )?;

        let mut rng = DeterministicRng::new(4);
        let result = ConvergenceOracle::check_all(&mut nodes, &AdapterRegistry::standard(), &mut rng)?;
        assert!(result.passed(), "{:?}", result.violations);
        Ok(())
    }
}
