//! Change capture by diffing table contents against the row hash store.
//!
//! Any local write, whichever code path made it, becomes a replication event
//! on the next scan. The scan is a fixed point: with no intervening
//! mutation, a second scan emits nothing.

use anyhow::{Context, Result};
use rusqlite::Connection;

use super::adapter::AdapterRegistry;
use super::row_hash::RowHashStore;
use super::row_version::RowVersionStore;
use crate::clock::WallClock;
use crate::event::{EventLog, EventOp};

/// Events emitted by one scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub upserts: usize,
    pub deletes: usize,
}

impl ScanReport {
    #[must_use]
    pub const fn total(&self) -> usize {
        self.upserts + self.deletes
    }
}

/// Emit one event per changed, new, or vanished row across every registered
/// table, as `node_id`.
///
/// Runs in a single transaction: either every detected change is logged
/// together with its row hash and row version, or nothing is.
///
/// # Errors
///
/// Returns an error if any store read or write fails.
pub fn scan(
    conn: &mut Connection,
    registry: &AdapterRegistry,
    node_id: &str,
    clock: &dyn WallClock,
) -> Result<ScanReport> {
    let tx = conn.transaction().context("begin scan transaction")?;
    let mut report = ScanReport::default();
    {
        let log = EventLog::new(&tx);
        let hashes = RowHashStore::new(&tx);
        let versions = RowVersionStore::new(&tx);

        for adapter in registry.iter() {
            let table = adapter.table().as_str();
            let mut known = hashes.load_table(table)?;

            for row in adapter.load_all(&tx)? {
                let hash = row.payload.content_hash();
                let unchanged = known
                    .remove(&row.row_id)
                    .is_some_and(|previous| previous == hash);
                if unchanged {
                    continue;
                }

                let event = log.append_local(
                    node_id,
                    clock,
                    table,
                    &row.row_id,
                    EventOp::Upsert,
                    Some(row.payload),
                )?;
                hashes.put(table, &row.row_id, &hash)?;
                versions.put(table, &row.row_id, &event.version)?;
                tracing::debug!(event = %event, "captured local upsert");
                report.upserts += 1;
            }

            // Whatever is left was known before and is gone now.
            for row_id in known.into_keys() {
                let event =
                    log.append_local(node_id, clock, table, &row_id, EventOp::Delete, None)?;
                hashes.remove(table, &row_id)?;
                versions.put(table, &row_id, &event.version)?;
                tracing::debug!(event = %event, "captured local delete");
                report.deletes += 1;
            }
        }
    }
    tx.commit().context("commit scan transaction")?;

    if report.total() > 0 {
        tracing::info!(
            node_id,
            upserts = report.upserts,
            deletes = report.deletes,
            "scan emitted events"
        );
    }
    Ok(report)
}
