//! Remote event application and conflict resolution.
//!
//! # Resolution rule
//!
//! For each `(table, row_id)` the node remembers the version of the last
//! write that won. An incoming event wins if there is no such version or if
//! it supersedes it under the total order of [`ClusterEventVersion`]. The
//! winner is decided purely by comparison against the best version seen so
//! far, so any permutation or partition of a batch ends in the same rows.
//!
//! # Outcomes
//!
//! | Event                      | Applied | Logged |
//! |----------------------------|---------|--------|
//! | malformed                  | no      | no     |
//! | already in the log         | no      | no     |
//! | unregistered table         | no      | yes    |
//! | loses to the row version   | no      | yes    |
//! | adapter rejects the write  | no      | yes    |
//! | wins                       | yes     | yes    |
//!
//! [`ClusterEventVersion`]: crate::event::ClusterEventVersion

use anyhow::{Context, Result};
use rusqlite::Connection;

use super::adapter::{AdapterRegistry, TableAdapter};
use super::row_hash::RowHashStore;
use super::row_version::RowVersionStore;
use crate::db::with_savepoint;
use crate::error::ErrorCode;
use crate::event::{ClusterEvent, EventLog, EventOp};

/// Per-batch outcome counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Events that won resolution and mutated the store.
    pub applied: usize,
    /// Events that lost to a newer version of the same row.
    pub superseded: usize,
    /// Events already present in the log.
    pub duplicates: usize,
    /// Events for tables without an adapter (recorded, not applied).
    pub unknown_table: usize,
    /// Events whose id does not match their version, or upserts without a
    /// payload (dropped).
    pub malformed: usize,
    /// Winning events the adapter could not write (recorded, not applied).
    pub failed: usize,
}

impl ApplyReport {
    /// Events newly added to the log by this batch.
    #[must_use]
    pub const fn recorded(&self) -> usize {
        self.applied + self.superseded + self.unknown_table + self.failed
    }

    pub fn absorb(&mut self, other: &Self) {
        self.applied += other.applied;
        self.superseded += other.superseded;
        self.duplicates += other.duplicates;
        self.unknown_table += other.unknown_table;
        self.malformed += other.malformed;
        self.failed += other.failed;
    }
}

/// Apply a batch of remote events to the store of `node_id`.
///
/// Events are processed in ascending version order inside one transaction.
/// Each winning write runs in its own savepoint, so an adapter failure
/// rolls back only that event.
///
/// # Errors
///
/// Returns an error if the log or bookkeeping tables cannot be read or
/// written; in that case nothing from the batch is kept.
pub fn apply(
    conn: &mut Connection,
    registry: &AdapterRegistry,
    node_id: &str,
    events: &[ClusterEvent],
) -> Result<ApplyReport> {
    let mut ordered: Vec<&ClusterEvent> = events.iter().collect();
    ordered.sort_by(|a, b| a.version.cmp(&b.version));

    let tx = conn.transaction().context("begin apply transaction")?;
    let mut report = ApplyReport::default();
    {
        let applier = Applier {
            conn: &tx,
            registry,
            log: EventLog::new(&tx),
            hashes: RowHashStore::new(&tx),
            versions: RowVersionStore::new(&tx),
        };
        for event in ordered {
            applier.apply_one(event, &mut report)?;
        }
    }
    tx.commit().context("commit apply transaction")?;

    if report.recorded() > 0 || report.malformed > 0 {
        tracing::info!(
            node_id,
            applied = report.applied,
            superseded = report.superseded,
            duplicates = report.duplicates,
            unknown_table = report.unknown_table,
            malformed = report.malformed,
            failed = report.failed,
            "applied remote events"
        );
    }
    Ok(report)
}

struct Applier<'a> {
    conn: &'a Connection,
    registry: &'a AdapterRegistry,
    log: EventLog<'a>,
    hashes: RowHashStore<'a>,
    versions: RowVersionStore<'a>,
}

impl Applier<'_> {
    fn apply_one(&self, event: &ClusterEvent, report: &mut ApplyReport) -> Result<()> {
        if !event.is_well_formed() {
            tracing::warn!(event_id = %event.event_id, "dropping malformed event");
            report.malformed += 1;
            return Ok(());
        }
        if self.log.contains(&event.event_id)? {
            report.duplicates += 1;
            return Ok(());
        }

        let Some(adapter) = self.registry.get(&event.table) else {
            tracing::info!(
                code = ErrorCode::UnknownTable.code(),
                event = %event,
                "recording event for unknown table"
            );
            self.log.record(event)?;
            report.unknown_table += 1;
            return Ok(());
        };

        let current = self.versions.get(&event.table, &event.row_id)?;
        let wins = current
            .as_ref()
            .is_none_or(|current| event.version.supersedes(current));
        if !wins {
            tracing::debug!(event = %event, "event superseded by row version");
            self.log.record(event)?;
            report.superseded += 1;
            return Ok(());
        }

        match with_savepoint(self.conn, "apply_event", || self.write(adapter, event)) {
            Ok(()) => {
                tracing::debug!(event = %event, "applied event");
                report.applied += 1;
            }
            Err(err) => {
                tracing::warn!(event = %event, error = %format!("{err:#}"), "adapter rejected event");
                report.failed += 1;
            }
        }
        self.log.record(event)?;
        Ok(())
    }

    fn write(&self, adapter: &dyn TableAdapter, event: &ClusterEvent) -> Result<()> {
        let table = event.table.as_str();
        let row_id = event.row_id.as_str();
        match (event.op, event.payload.as_ref()) {
            (EventOp::Upsert, Some(payload)) => {
                let unscanned = self.has_unscanned_change(adapter, table, row_id)?;
                adapter.upsert(self.conn, row_id, payload)?;
                if unscanned {
                    // Keep the stale hash so the next scan still emits the local edit.
                    tracing::debug!(event = %event, "row has unscanned local changes");
                } else {
                    // Hash what is stored: a partial payload leaves other columns alone.
                    match adapter.load(self.conn, row_id)? {
                        Some(stored) => self.hashes.put(table, row_id, &stored.content_hash())?,
                        None => self.hashes.remove(table, row_id)?,
                    }
                }
            }
            (EventOp::Upsert, None) => {
                anyhow::bail!("upsert {} carries no payload", event.event_id);
            }
            (EventOp::Delete, _) => {
                adapter.delete(self.conn, row_id)?;
                self.hashes.remove(table, row_id)?;
            }
        }
        self.versions.put(table, row_id, &event.version)
    }

    /// Whether the stored row differs from what the last scan or apply saw.
    fn has_unscanned_change(
        &self,
        adapter: &dyn TableAdapter,
        table: &str,
        row_id: &str,
    ) -> Result<bool> {
        let seen = self.hashes.get(table, row_id)?;
        Ok(match adapter.load(self.conn, row_id)? {
            Some(stored) => seen.as_deref() != Some(stored.content_hash().as_str()),
            // Deleted locally since the last scan.
            None => seen.is_some(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db;
    use crate::event::{ClusterEventVersion, FieldValue, Payload};
    use crate::replica::scanner::scan;
    use crate::replica::table::ReplicatedTable;

    fn team_event(actor: &str, counter: u64, ts: i64, name: &str) -> ClusterEvent {
        ClusterEvent::new(
            "teams",
            "t1",
            EventOp::Upsert,
            Some(Payload::new().with("id", "t1").with("name", name)),
            ClusterEventVersion::new(actor, counter, ts),
        )
    }

    fn team_name(conn: &Connection) -> Option<String> {
        conn.query_row("SELECT name FROM teams WHERE id = 't1'", [], |row| row.get(0))
            .ok()
    }

    #[test]
    fn newer_version_wins_regardless_of_arrival_order() -> Result<()> {
        let registry = AdapterRegistry::standard();
        let older = team_event("a", 1, 100, "older");
        let newer = team_event("b", 1, 200, "newer");

        for batch in [vec![older.clone(), newer.clone()], vec![newer.clone(), older.clone()]] {
            let mut conn = db::open_in_memory()?;
            apply(&mut conn, &registry, "node-x", &batch)?;
            assert_eq!(team_name(&conn).as_deref(), Some("newer"));
        }

        // Same again, split into two batches in both orders.
        for (first, second) in [(&older, &newer), (&newer, &older)] {
            let mut conn = db::open_in_memory()?;
            apply(&mut conn, &registry, "node-x", std::slice::from_ref(first))?;
            let report = apply(&mut conn, &registry, "node-x", std::slice::from_ref(second))?;
            assert_eq!(team_name(&conn).as_deref(), Some("newer"));
            assert_eq!(report.recorded(), 1);
        }
        Ok(())
    }

    #[test]
    fn reapplying_a_batch_is_a_no_op() -> Result<()> {
        let mut conn = db::open_in_memory()?;
        let registry = AdapterRegistry::standard();
        let batch = vec![team_event("a", 1, 100, "core"), team_event("a", 2, 101, "platform")];

        let first = apply(&mut conn, &registry, "node-x", &batch)?;
        assert_eq!(first.applied, 2);
        let second = apply(&mut conn, &registry, "node-x", &batch)?;
        assert_eq!(second, ApplyReport { duplicates: 2, ..ApplyReport::default() });
        assert_eq!(team_name(&conn).as_deref(), Some("platform"));
        Ok(())
    }

    #[test]
    fn losing_event_is_logged_but_not_applied() -> Result<()> {
        let mut conn = db::open_in_memory()?;
        let registry = AdapterRegistry::standard();
        apply(&mut conn, &registry, "node-x", &[team_event("b", 1, 200, "winner")])?;
        let report = apply(&mut conn, &registry, "node-x", &[team_event("a", 1, 200, "loser")])?;

        assert_eq!(report.superseded, 1);
        assert_eq!(team_name(&conn).as_deref(), Some("winner"));
        assert!(EventLog::new(&conn).contains("a:1")?);
        Ok(())
    }

    #[test]
    fn delete_wins_and_clears_row_hash() -> Result<()> {
        let mut conn = db::open_in_memory()?;
        let registry = AdapterRegistry::standard();
        let delete = ClusterEvent::new(
            "teams",
            "t1",
            EventOp::Delete,
            None,
            ClusterEventVersion::new("b", 1, 300),
        );
        apply(&mut conn, &registry, "node-x", &[team_event("a", 1, 100, "core"), delete])?;

        assert_eq!(team_name(&conn), None);
        assert!(RowHashStore::new(&conn).get("teams", "t1")?.is_none());
        assert_eq!(
            RowVersionStore::new(&conn).get("teams", "t1")?,
            Some(ClusterEventVersion::new("b", 1, 300))
        );
        Ok(())
    }

    #[test]
    fn applied_rows_are_not_re_emitted_by_the_next_scan() -> Result<()> {
        let mut conn = db::open_in_memory()?;
        let registry = AdapterRegistry::standard();
        // Partial payload: the stored row has more columns than the event.
        apply(&mut conn, &registry, "node-x", &[team_event("a", 1, 100, "core")])?;
        let report = scan(&mut conn, &registry, "node-x", &ManualClock::new(150))?;
        assert_eq!(report.total(), 0);
        Ok(())
    }

    #[test]
    fn partial_upsert_keeps_unscanned_local_edit_visible_to_scan() -> Result<()> {
        let mut conn = db::open_in_memory()?;
        let registry = AdapterRegistry::standard();
        conn.execute("INSERT INTO teams (id, name) VALUES ('t1', 'core')", [])?;
        scan(&mut conn, &registry, "node-x", &ManualClock::new(1_000))?;

        conn.execute("UPDATE teams SET description = 'local edit' WHERE id = 't1'", [])?;
        let remote = ClusterEvent::new(
            "teams",
            "t1",
            EventOp::Upsert,
            Some(Payload::new().with("name", "platform")),
            ClusterEventVersion::new("node-a", 1, 5_000),
        );
        assert_eq!(apply(&mut conn, &registry, "node-x", &[remote])?.applied, 1);

        let report = scan(&mut conn, &registry, "node-x", &ManualClock::new(6_000))?;
        assert_eq!(report.upserts, 1);
        let emitted = EventLog::new(&conn).get("node-x:2")?.expect("local edit emitted");
        let payload = emitted.payload.expect("upsert payload");
        assert_eq!(payload.get("description"), Some(&FieldValue::from("local edit")));
        assert_eq!(payload.get("name"), Some(&FieldValue::from("platform")));
        assert!(emitted.version.supersedes(&ClusterEventVersion::new("node-a", 1, 5_000)));
        Ok(())
    }

    #[test]
    fn unscanned_local_insert_survives_partial_upsert() -> Result<()> {
        let mut conn = db::open_in_memory()?;
        let registry = AdapterRegistry::standard();
        conn.execute(
            "INSERT INTO teams (id, name, description) VALUES ('t1', 'core', 'mine')",
            [],
        )?;
        apply(&mut conn, &registry, "node-x", &[team_event("a", 1, 100, "web")])?;

        assert_eq!(scan(&mut conn, &registry, "node-x", &ManualClock::new(200))?.upserts, 1);
        assert_eq!(scan(&mut conn, &registry, "node-x", &ManualClock::new(300))?.total(), 0);
        Ok(())
    }

    #[test]
    fn partial_upsert_after_unscanned_local_delete_is_re_emitted() -> Result<()> {
        let mut conn = db::open_in_memory()?;
        let registry = AdapterRegistry::standard();
        conn.execute(
            "INSERT INTO teams (id, name, description) VALUES ('t1', 'core', 'kept')",
            [],
        )?;
        scan(&mut conn, &registry, "node-x", &ManualClock::new(1_000))?;
        conn.execute("DELETE FROM teams WHERE id = 't1'", [])?;

        apply(&mut conn, &registry, "node-x", &[team_event("node-a", 1, 5_000, "web")])?;
        let report = scan(&mut conn, &registry, "node-x", &ManualClock::new(6_000))?;
        assert_eq!(report, crate::replica::ScanReport { upserts: 1, deletes: 0 });
        Ok(())
    }

    #[test]
    fn missing_fields_do_not_erase_existing_values() -> Result<()> {
        let mut conn = db::open_in_memory()?;
        let registry = AdapterRegistry::standard();
        let full = ClusterEvent::new(
            "requirements",
            "r1",
            EventOp::Upsert,
            Some(
                Payload::new()
                    .with("id", "r1")
                    .with("title", "Auth")
                    .with("auto_plan", true),
            ),
            ClusterEventVersion::new("a", 1, 100),
        );
        let legacy = ClusterEvent::new(
            "requirements",
            "r1",
            EventOp::Upsert,
            Some(Payload::new().with("title", "Auth (renamed)")),
            ClusterEventVersion::new("b", 1, 200),
        );
        apply(&mut conn, &registry, "node-x", &[full, legacy])?;

        let payload = registry
            .get("requirements")
            .expect("adapter")
            .load(&conn, "r1")?
            .expect("row exists");
        assert_eq!(payload.get("title"), Some(&FieldValue::from("Auth (renamed)")));
        assert_eq!(payload.get("auto_plan"), Some(&FieldValue::Bool(true)));
        Ok(())
    }

    #[test]
    fn unknown_table_is_recorded_but_not_applied() -> Result<()> {
        let mut conn = db::open_in_memory()?;
        let registry = AdapterRegistry::standard();
        let event = ClusterEvent::new(
            "sprints",
            "sp1",
            EventOp::Upsert,
            Some(Payload::new().with("name", "Sprint 1")),
            ClusterEventVersion::new("z", 1, 100),
        );
        let report = apply(&mut conn, &registry, "node-x", std::slice::from_ref(&event))?;
        assert_eq!(report.unknown_table, 1);
        assert_eq!(EventLog::new(&conn).version_vector()?.get("z"), 1);

        let again = apply(&mut conn, &registry, "node-x", &[event])?;
        assert_eq!(again.duplicates, 1);
        Ok(())
    }

    #[test]
    fn malformed_event_is_dropped() -> Result<()> {
        let mut conn = db::open_in_memory()?;
        let mut event = team_event("a", 1, 100, "core");
        event.event_id = "a:99".to_string();
        let report = apply(&mut conn, &AdapterRegistry::standard(), "node-x", &[event])?;
        assert_eq!(report.malformed, 1);
        assert!(EventLog::new(&conn).is_empty()?);
        Ok(())
    }

    #[test]
    fn adapter_failure_rolls_back_only_that_event() -> Result<()> {
        let mut conn = db::open_in_memory()?;
        let registry = AdapterRegistry::standard();
        // story_dependencies needs a two-part row id.
        let bad = ClusterEvent::new(
            ReplicatedTable::StoryDependencies.as_str(),
            "s1",
            EventOp::Upsert,
            Some(Payload::new()),
            ClusterEventVersion::new("a", 1, 100),
        );
        let good = team_event("a", 2, 101, "core");
        let report = apply(&mut conn, &registry, "node-x", &[bad, good])?;

        assert_eq!(report.failed, 1);
        assert_eq!(report.applied, 1);
        assert_eq!(team_name(&conn).as_deref(), Some("core"));
        assert!(RowVersionStore::new(&conn).get("story_dependencies", "s1")?.is_none());
        assert!(EventLog::new(&conn).contains("a:1")?);
        Ok(())
    }
}
