//! Version of the last winning write per row.

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension as _, params};

use crate::event::ClusterEventVersion;
use crate::event::log::{from_sql_counter, to_sql_counter};

pub struct RowVersionStore<'conn> {
    conn: &'conn Connection,
}

impl<'conn> RowVersionStore<'conn> {
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get(&self, table: &str, row_id: &str) -> Result<Option<ClusterEventVersion>> {
        let raw: Option<(String, i64, i64)> = self
            .conn
            .query_row(
                "SELECT actor_id, actor_counter, logical_ts FROM cluster_row_versions
                 WHERE table_name = ?1 AND row_id = ?2",
                params![table, row_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .with_context(|| format!("load row version {table}/{row_id}"))?;

        raw.map(|(actor_id, counter, logical_ts)| {
            Ok(ClusterEventVersion::new(
                actor_id,
                from_sql_counter(counter)?,
                logical_ts,
            ))
        })
        .transpose()
    }

    /// Record `version` as the winner for the row, whatever was there before.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn put(&self, table: &str, row_id: &str, version: &ClusterEventVersion) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO cluster_row_versions
                    (table_name, row_id, actor_id, actor_counter, logical_ts)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(table_name, row_id) DO UPDATE SET
                    actor_id = excluded.actor_id,
                    actor_counter = excluded.actor_counter,
                    logical_ts = excluded.logical_ts",
                params![
                    table,
                    row_id,
                    version.actor_id,
                    to_sql_counter(version.actor_counter)?,
                    version.logical_ts,
                ],
            )
            .with_context(|| format!("store row version {table}/{row_id}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[test]
    fn put_overwrites_and_get_reads_back() -> Result<()> {
        let conn = db::open_in_memory()?;
        let versions = RowVersionStore::new(&conn);
        assert_eq!(versions.get("stories", "s1")?, None);

        let first = ClusterEventVersion::new("a", 1, 10);
        let second = ClusterEventVersion::new("b", 3, 20);
        versions.put("stories", "s1", &first)?;
        versions.put("stories", "s1", &second)?;
        assert_eq!(versions.get("stories", "s1")?, Some(second));
        assert_eq!(versions.get("teams", "s1")?, None);
        Ok(())
    }
}
