//! Last-seen content hash per replicated row.
//!
//! Node-local bookkeeping for change detection; never sent to peers.

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension as _, params};
use std::collections::BTreeMap;

pub struct RowHashStore<'conn> {
    conn: &'conn Connection,
}

impl<'conn> RowHashStore<'conn> {
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    /// All known `(row_id, hash)` pairs for `table`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn load_table(&self, table: &str) -> Result<BTreeMap<String, String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT row_id, row_hash FROM cluster_row_hashes WHERE table_name = ?1")
            .context("prepare row hash load")?;
        let rows = stmt
            .query_map(params![table], |row| Ok((row.get(0)?, row.get(1)?)))
            .with_context(|| format!("load row hashes for {table}"))?;
        rows.collect::<rusqlite::Result<BTreeMap<_, _>>>()
            .with_context(|| format!("read row hashes for {table}"))
    }

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get(&self, table: &str, row_id: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT row_hash FROM cluster_row_hashes WHERE table_name = ?1 AND row_id = ?2",
                params![table, row_id],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("load row hash {table}/{row_id}"))
    }

    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn put(&self, table: &str, row_id: &str, hash: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO cluster_row_hashes (table_name, row_id, row_hash)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(table_name, row_id) DO UPDATE SET row_hash = excluded.row_hash",
                params![table, row_id, hash],
            )
            .with_context(|| format!("store row hash {table}/{row_id}"))?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn remove(&self, table: &str, row_id: &str) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM cluster_row_hashes WHERE table_name = ?1 AND row_id = ?2",
                params![table, row_id],
            )
            .with_context(|| format!("remove row hash {table}/{row_id}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[test]
    fn put_get_remove() -> Result<()> {
        let conn = db::open_in_memory()?;
        let hashes = RowHashStore::new(&conn);

        assert_eq!(hashes.get("teams", "t1")?, None);
        hashes.put("teams", "t1", "blake3:aa")?;
        hashes.put("teams", "t1", "blake3:bb")?;
        hashes.put("stories", "t1", "blake3:cc")?;
        assert_eq!(hashes.get("teams", "t1")?.as_deref(), Some("blake3:bb"));

        let teams = hashes.load_table("teams")?;
        assert_eq!(teams.len(), 1);

        hashes.remove("teams", "t1")?;
        assert_eq!(hashes.get("teams", "t1")?, None);
        assert_eq!(hashes.get("stories", "t1")?.as_deref(), Some("blake3:cc"));
        Ok(())
    }
}
