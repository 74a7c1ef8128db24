//! SQLite node store utilities.
//!
//! Runtime defaults:
//! - `journal_mode = WAL` so the orchestrator can keep reading while a core
//!   operation writes
//! - `busy_timeout = 5s` to absorb transient lock failures
//! - `foreign_keys` stays OFF: replicated rows may arrive before the rows they
//!   reference

pub mod migrations;
pub mod schema;

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use crate::error::ErrorCode;

/// Busy timeout used for store connections.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Failures opening a node store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{}: open store {}: {source}", ErrorCode::StoreOpenFailed.code(), path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
    #[error("{}: migrate store {}: {source}", ErrorCode::MigrationFailed.code(), path.display())]
    Migration {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
}

impl StoreError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Open { .. } => ErrorCode::StoreOpenFailed,
            Self::Migration { .. } => ErrorCode::MigrationFailed,
        }
    }
}

/// Open (or create) the node store, apply runtime pragmas, and migrate the
/// schema to the latest version.
///
/// # Errors
///
/// Returns an error if opening/configuring/migrating the database fails.
/// Open and migration failures carry a [`StoreError`].
pub fn open_store(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create store directory {}", parent.display()))?;
    }

    let open_failed = |source| StoreError::Open {
        path: path.to_path_buf(),
        source,
    };
    let mut conn = Connection::open(path).map_err(open_failed)?;
    configure_connection(&conn).map_err(open_failed)?;
    migrations::migrate(&mut conn).map_err(|source| StoreError::Migration {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(conn)
}

/// Open a private in-memory store with the full schema.
///
/// # Errors
///
/// Returns an error if migration fails.
pub fn open_in_memory() -> Result<Connection> {
    let mut conn = Connection::open_in_memory().context("open in-memory store")?;
    migrations::migrate(&mut conn).context("apply store migrations")?;
    Ok(conn)
}

/// Run `f` inside a named savepoint on `conn`.
///
/// On `Ok` the savepoint is released; on `Err` every change `f` made is
/// rolled back and the error is returned. Unlike [`Connection::savepoint`]
/// this only needs a shared borrow, so store views borrowing the same
/// connection stay usable inside `f`.
///
/// # Errors
///
/// Returns the error from `f`, or an error if the savepoint itself fails.
pub fn with_savepoint<T>(
    conn: &Connection,
    name: &str,
    f: impl FnOnce() -> Result<T>,
) -> Result<T> {
    conn.execute_batch(&format!("SAVEPOINT {name}"))
        .with_context(|| format!("open savepoint {name}"))?;
    match f() {
        Ok(value) => {
            conn.execute_batch(&format!("RELEASE {name}"))
                .with_context(|| format!("release savepoint {name}"))?;
            Ok(value)
        }
        Err(err) => {
            conn.execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name}"))
                .with_context(|| format!("roll back savepoint {name}"))?;
            Err(err)
        }
    }
}

fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    let _journal_mode: String =
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
    Ok(())
}
