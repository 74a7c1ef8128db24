//! Append-only event log and version clock.
//!
//! Every event this node ever emitted or received lives in `cluster_events`.
//! The log is the source of truth for three questions:
//!
//! - "have I seen this exact event before?" ([`EventLog::contains`])
//! - "how far have I got from each node?" ([`EventLog::version_vector`])
//! - "what does a peer at vector V lack?" ([`EventLog::delta_since`])
//!
//! Rows are inserted and never updated or deleted.

use anyhow::{Context, Result};
use rusqlite::{
    Connection, OptionalExtension as _, Row, params, params_from_iter,
    types::{Type, Value as SqlValue},
};

use crate::clock::WallClock;
use crate::event::{ClusterEvent, ClusterEventVersion, EventOp, Payload, VersionVector};

const EVENT_COLUMNS: &str = "event_id, table_name, row_id, op, payload, \
                             actor_id, actor_counter, logical_ts, created_at";

/// Event log view over a store connection.
pub struct EventLog<'conn> {
    conn: &'conn Connection,
}

impl<'conn> EventLog<'conn> {
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    /// Whether an event with `event_id` has already been recorded.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn contains(&self, event_id: &str) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM cluster_events WHERE event_id = ?1)",
                params![event_id],
                |row| row.get(0),
            )
            .context("check event log membership")
    }

    /// Stamp and persist a new local event.
    ///
    /// The counter is one past the highest counter this actor has in the log.
    /// The logical timestamp is the wall clock, raised if necessary to one
    /// past the highest timestamp in the log, so a write made after
    /// observing a remote event always orders after it.
    ///
    /// # Errors
    ///
    /// Returns an error if reading the clock state or inserting fails.
    pub fn append_local(
        &self,
        actor_id: &str,
        clock: &dyn WallClock,
        table: &str,
        row_id: &str,
        op: EventOp,
        payload: Option<Payload>,
    ) -> Result<ClusterEvent> {
        let version = self.next_local_version(actor_id, clock.now_millis())?;
        let event = ClusterEvent::new(table, row_id, op, payload, version);
        self.record(&event)?;
        Ok(event)
    }

    /// Compute the version the next local event of `actor_id` will carry.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be queried.
    pub fn next_local_version(&self, actor_id: &str, now_millis: i64) -> Result<ClusterEventVersion> {
        let (last_counter, last_ts): (Option<i64>, Option<i64>) = self
            .conn
            .query_row(
                "SELECT
                    (SELECT MAX(actor_counter) FROM cluster_events WHERE actor_id = ?1),
                    (SELECT MAX(logical_ts) FROM cluster_events)",
                params![actor_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .context("read local clock state")?;

        let counter = from_sql_counter(last_counter.unwrap_or(0))? + 1;
        let logical_ts = last_ts.map_or(now_millis, |ts| now_millis.max(ts.saturating_add(1)));
        Ok(ClusterEventVersion::new(actor_id, counter, logical_ts))
    }

    /// Persist `event` verbatim. Returns `false` if it was already present.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or inserting fails.
    pub fn record(&self, event: &ClusterEvent) -> Result<bool> {
        let payload_json = event
            .payload
            .as_ref()
            .map(Payload::to_json)
            .transpose()
            .context("encode event payload")?;

        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO cluster_events
                    (event_id, table_name, row_id, op, payload, actor_id, actor_counter, logical_ts, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    event.event_id,
                    event.table,
                    event.row_id,
                    event.op.as_str(),
                    payload_json,
                    event.version.actor_id,
                    to_sql_counter(event.version.actor_counter)?,
                    event.version.logical_ts,
                    event.created_at,
                ],
            )
            .with_context(|| format!("record event {}", event.event_id))?;
        Ok(inserted > 0)
    }

    /// Look up a single event by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query or decoding fails.
    pub fn get(&self, event_id: &str) -> Result<Option<ClusterEvent>> {
        self.conn
            .query_row(
                &format!("SELECT {EVENT_COLUMNS} FROM cluster_events WHERE event_id = ?1"),
                params![event_id],
                event_from_row,
            )
            .optional()
            .with_context(|| format!("load event {event_id}"))
    }

    /// Highest counter recorded per actor, covering both locally emitted and
    /// remotely applied events.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn version_vector(&self) -> Result<VersionVector> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT actor_id, MAX(actor_counter) FROM cluster_events GROUP BY actor_id",
            )
            .context("prepare version vector query")?;
        let rows = stmt
            .query_map([], |row| {
                let actor: String = row.get(0)?;
                let counter: i64 = row.get(1)?;
                Ok((actor, counter))
            })
            .context("query version vector")?;

        let mut vector = VersionVector::new();
        for row in rows {
            let (actor, counter) = row.context("read version vector row")?;
            vector.observe(&actor, from_sql_counter(counter)?);
        }
        Ok(vector)
    }

    /// Events not covered by `vector`, ascending by version, at most `limit`.
    ///
    /// Local timestamps strictly increase with the counter, so for every
    /// actor the returned events are a contiguous run starting right after
    /// the requester's high-water mark. A truncated delta can therefore be
    /// resumed by asking again with the updated vector.
    ///
    /// # Errors
    ///
    /// Returns an error if the query or decoding fails.
    pub fn delta_since(&self, vector: &VersionVector, limit: usize) -> Result<Vec<ClusterEvent>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        // One indexed range per known actor, plus everything from actors the
        // requester has never heard of.
        let mut branches = Vec::with_capacity(vector.len() + 1);
        let mut values: Vec<SqlValue> = Vec::with_capacity(vector.len() * 2 + 1);
        let mut known = Vec::with_capacity(vector.len());
        for (actor, counter) in vector.iter() {
            values.push(SqlValue::Text(actor.to_string()));
            let actor_param = values.len();
            values.push(SqlValue::Integer(i64::try_from(counter).unwrap_or(i64::MAX)));
            branches.push(format!(
                "SELECT {EVENT_COLUMNS} FROM cluster_events
                 WHERE actor_id = ?{actor_param} AND actor_counter > ?{}",
                actor_param + 1
            ));
            known.push(format!("?{actor_param}"));
        }
        if known.is_empty() {
            branches.push(format!("SELECT {EVENT_COLUMNS} FROM cluster_events"));
        } else {
            branches.push(format!(
                "SELECT {EVENT_COLUMNS} FROM cluster_events WHERE actor_id NOT IN ({})",
                known.join(", ")
            ));
        }
        values.push(SqlValue::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
        let sql = format!(
            "{} ORDER BY logical_ts, actor_id, actor_counter LIMIT ?{}",
            branches.join(" UNION ALL "),
            values.len()
        );

        let mut stmt = self.conn.prepare(&sql).context("prepare delta query")?;
        let events = stmt
            .query_map(params_from_iter(values), event_from_row)
            .context("query delta")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("decode delta rows")?;
        Ok(events)
    }

    /// Number of events in the log.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn len(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM cluster_events", [], |row| row.get(0))
            .context("count events")?;
        usize::try_from(count).context("event count out of range")
    }

    /// Whether the log is empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<ClusterEvent> {
    let op_raw: String = row.get(3)?;
    let op = op_raw
        .parse::<EventOp>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;

    let payload_json: Option<String> = row.get(4)?;
    let payload = payload_json
        .as_deref()
        .map(Payload::from_json)
        .transpose()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;

    let counter: i64 = row.get(6)?;
    let actor_counter = u64::try_from(counter)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Integer, Box::new(e)))?;

    Ok(ClusterEvent {
        event_id: row.get(0)?,
        table: row.get(1)?,
        row_id: row.get(2)?,
        op,
        payload,
        version: ClusterEventVersion {
            actor_id: row.get(5)?,
            actor_counter,
            logical_ts: row.get(7)?,
        },
        created_at: row.get(8)?,
    })
}

pub(crate) fn to_sql_counter(counter: u64) -> Result<i64> {
    i64::try_from(counter).with_context(|| format!("actor counter {counter} exceeds i64"))
}

pub(crate) fn from_sql_counter(counter: i64) -> Result<u64> {
    u64::try_from(counter).with_context(|| format!("negative actor counter {counter}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db;

    fn team_payload(name: &str) -> Payload {
        Payload::new().with("id", "t1").with("name", name)
    }

    #[test]
    fn append_assigns_increasing_counters_and_timestamps() -> Result<()> {
        let conn = db::open_in_memory()?;
        let log = EventLog::new(&conn);
        let clock = ManualClock::new(1_000);

        let first = log.append_local("a", &clock, "teams", "t1", EventOp::Upsert, Some(team_payload("x")))?;
        // Wall clock stalls: the logical timestamp still moves forward.
        let second = log.append_local("a", &clock, "teams", "t1", EventOp::Upsert, Some(team_payload("y")))?;

        assert_eq!(first.version, ClusterEventVersion::new("a", 1, 1_000));
        assert_eq!(second.version, ClusterEventVersion::new("a", 2, 1_001));
        assert!(second.version.supersedes(&first.version));
        assert_eq!(log.len()?, 2);
        Ok(())
    }

    #[test]
    fn local_clock_moves_past_observed_remote_timestamps() -> Result<()> {
        let conn = db::open_in_memory()?;
        let log = EventLog::new(&conn);
        let remote = ClusterEvent::new(
            "teams",
            "t1",
            EventOp::Delete,
            None,
            ClusterEventVersion::new("b", 7, 50_000),
        );
        assert!(log.record(&remote)?);

        let clock = ManualClock::new(10);
        let local = log.append_local("a", &clock, "teams", "t1", EventOp::Upsert, Some(team_payload("z")))?;
        assert_eq!(local.version.actor_counter, 1);
        assert_eq!(local.version.logical_ts, 50_001);
        assert!(local.version.supersedes(&remote.version));
        Ok(())
    }

    #[test]
    fn record_is_idempotent_and_contains_detects_it() -> Result<()> {
        let conn = db::open_in_memory()?;
        let log = EventLog::new(&conn);
        let event = ClusterEvent::new(
            "stories",
            "s1",
            EventOp::Upsert,
            Some(Payload::new().with("title", "Add auth")),
            ClusterEventVersion::new("b", 1, 5),
        );

        assert!(!log.contains(&event.event_id)?);
        assert!(log.record(&event)?);
        assert!(!log.record(&event)?);
        assert!(log.contains(&event.event_id)?);
        assert_eq!(log.get(&event.event_id)?, Some(event));
        assert_eq!(log.len()?, 1);
        Ok(())
    }

    #[test]
    fn version_vector_tracks_every_actor() -> Result<()> {
        let conn = db::open_in_memory()?;
        let log = EventLog::new(&conn);
        let clock = ManualClock::new(100);
        for _ in 0..3 {
            log.append_local("a", &clock, "teams", "t1", EventOp::Delete, None)?;
        }
        log.record(&ClusterEvent::new(
            "teams",
            "t2",
            EventOp::Delete,
            None,
            ClusterEventVersion::new("b", 4, 10),
        ))?;

        let vector = log.version_vector()?;
        assert_eq!(vector.get("a"), 3);
        assert_eq!(vector.get("b"), 4);
        Ok(())
    }

    #[test]
    fn delta_skips_covered_events_and_is_ordered() -> Result<()> {
        let conn = db::open_in_memory()?;
        let log = EventLog::new(&conn);
        let clock = ManualClock::new(100);
        for _ in 0..3 {
            log.append_local("a", &clock, "teams", "t1", EventOp::Delete, None)?;
            clock.advance(10);
        }
        log.record(&ClusterEvent::new(
            "teams",
            "t9",
            EventOp::Delete,
            None,
            ClusterEventVersion::new("b", 1, 105),
        ))?;

        let vector: VersionVector = [("a".to_string(), 1)].into_iter().collect();
        let delta = log.delta_since(&vector, 100)?;
        let ids: Vec<&str> = delta.iter().map(|e| e.event_id.as_str()).collect();
        assert_eq!(ids, vec!["b:1", "a:2", "a:3"]);
        Ok(())
    }

    #[test]
    fn delta_limit_yields_resumable_prefix() -> Result<()> {
        let conn = db::open_in_memory()?;
        let log = EventLog::new(&conn);
        let clock = ManualClock::new(100);
        for _ in 0..5 {
            log.append_local("a", &clock, "teams", "t1", EventOp::Delete, None)?;
        }

        let mut vector = VersionVector::new();
        let mut seen = Vec::new();
        loop {
            let page = log.delta_since(&vector, 2)?;
            if page.is_empty() {
                break;
            }
            for event in page {
                vector.observe(&event.version.actor_id, event.version.actor_counter);
                seen.push(event.version.actor_counter);
            }
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
        assert!(log.delta_since(&vector, 0)?.is_empty());
        Ok(())
    }

    #[test]
    fn delta_includes_unknown_actors_and_ignores_foreign_ones() -> Result<()> {
        let conn = db::open_in_memory()?;
        let log = EventLog::new(&conn);
        let clock = ManualClock::new(100);
        for _ in 0..2 {
            log.append_local("a", &clock, "teams", "t1", EventOp::Delete, None)?;
        }
        for counter in 1..=2 {
            log.record(&ClusterEvent::new(
                "teams",
                "t2",
                EventOp::Delete,
                None,
                ClusterEventVersion::new("b", counter, 50),
            ))?;
        }

        // The requester knows a@1 and an actor this log has never seen.
        let vector: VersionVector = [("a".to_string(), 1), ("zed".to_string(), u64::MAX)]
            .into_iter()
            .collect();
        let ids: Vec<String> = log
            .delta_since(&vector, 10)?
            .into_iter()
            .map(|event| event.event_id)
            .collect();
        assert_eq!(ids, vec!["b:1", "b:2", "a:2"]);

        let first: Vec<String> = log
            .delta_since(&vector, 1)?
            .into_iter()
            .map(|event| event.event_id)
            .collect();
        assert_eq!(first, vec!["b:1"]);
        Ok(())
    }
}
