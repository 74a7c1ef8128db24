//! Table adapters: the only place that knows how a replicated table is laid
//! out in the store.
//!
//! An adapter reads every row of its table into a [`Payload`], derives the
//! row id, and writes upserts/deletes back. [`SqlTableAdapter`] covers every
//! fleet table from its static [`TableSchema`]; the [`AdapterRegistry`] is
//! built once and passed by reference to the scanner and applier.
//!
//! Upserts only touch the columns present in the payload. A column missing
//! from the payload keeps its stored value (or the column default for a new
//! row); an explicit null overwrites it.

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, Row, params_from_iter, types::Value as SqlValue};

use super::table::{Column, ColumnKind, ROW_ID_SEPARATOR, ReplicatedTable, TableSchema};
use crate::event::{FieldValue, Payload};

/// One row as projected by an adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct RowSnapshot {
    pub row_id: String,
    pub payload: Payload,
}

/// Read/write access to one replicated table.
pub trait TableAdapter {
    fn table(&self) -> ReplicatedTable;

    /// Row id for a projected payload, or `None` if a key column is missing
    /// or null.
    fn row_id(&self, payload: &Payload) -> Option<String>;

    /// Every row of the table, ordered by row id.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn load_all(&self, conn: &Connection) -> Result<Vec<RowSnapshot>>;

    /// The current payload for `row_id`, if the row exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or `row_id` is malformed.
    fn load(&self, conn: &Connection, row_id: &str) -> Result<Option<Payload>>;

    /// Insert the row or update the columns present in `payload`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write is rejected by the store.
    fn upsert(&self, conn: &Connection, row_id: &str, payload: &Payload) -> Result<()>;

    /// Delete the row. Returns whether a row was removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    fn delete(&self, conn: &Connection, row_id: &str) -> Result<bool>;
}

// ---------------------------------------------------------------------------
// SqlTableAdapter
// ---------------------------------------------------------------------------

/// Schema-driven adapter for a fleet table.
#[derive(Debug, Clone, Copy)]
pub struct SqlTableAdapter {
    table: ReplicatedTable,
    schema: &'static TableSchema,
}

impl SqlTableAdapter {
    #[must_use]
    pub const fn new(table: ReplicatedTable) -> Self {
        Self {
            table,
            schema: table.schema(),
        }
    }

    fn column_list(&self) -> String {
        self.schema
            .columns
            .iter()
            .map(|column| column.name)
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn key_predicate(&self) -> String {
        self.schema
            .key_columns
            .iter()
            .enumerate()
            .map(|(i, key)| format!("{key} = ?{}", i + 1))
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    /// Split a row id into key values, one per key column.
    fn key_values(&self, row_id: &str) -> Result<Vec<String>> {
        let expected = self.schema.key_columns.len();
        let parts: Vec<String> = row_id
            .splitn(expected, ROW_ID_SEPARATOR)
            .map(str::to_string)
            .collect();
        if parts.len() != expected || parts.iter().any(String::is_empty) {
            bail!(
                "row id '{row_id}' does not match the {expected}-part key of {}",
                self.table
            );
        }
        Ok(parts)
    }

    fn project(&self, row: &Row<'_>) -> rusqlite::Result<Payload> {
        let mut payload = Payload::new();
        for (i, column) in self.schema.columns.iter().enumerate() {
            let raw: SqlValue = row.get(i)?;
            payload.insert(column.name, field_from_sql(column.kind, raw));
        }
        Ok(payload)
    }
}

fn field_from_sql(kind: ColumnKind, raw: SqlValue) -> FieldValue {
    match (kind, raw) {
        (_, SqlValue::Null) => FieldValue::Null,
        (ColumnKind::Bool, SqlValue::Integer(i)) => FieldValue::Bool(i != 0),
        (ColumnKind::Real, SqlValue::Integer(i)) => {
            #[allow(clippy::cast_precision_loss)]
            FieldValue::Real(i as f64)
        }
        (_, SqlValue::Integer(i)) => FieldValue::Integer(i),
        (_, SqlValue::Real(f)) => FieldValue::Real(f),
        (_, SqlValue::Text(s)) => FieldValue::Text(s),
        (_, SqlValue::Blob(bytes)) => FieldValue::Text(String::from_utf8_lossy(&bytes).into_owned()),
    }
}

/// Convert a payload value for storage in `column`.
///
/// Integer columns take whole numbers only: an integral real is stored as an
/// integer and anything else is rejected, so readers that decode the column
/// as `i64` never see a value they cannot read.
fn field_to_sql(column: &Column, value: &FieldValue) -> Result<SqlValue> {
    let converted = match (column.kind, value) {
        (ColumnKind::Bool, FieldValue::Integer(i)) => SqlValue::Integer(i64::from(*i != 0)),
        (ColumnKind::Integer, FieldValue::Real(f)) => match whole_number(*f) {
            Some(i) => SqlValue::Integer(i),
            None => bail!("column {} expects an integer, got {f}", column.name),
        },
        (ColumnKind::Integer, FieldValue::Text(text)) => match text.trim().parse::<i64>() {
            Ok(i) => SqlValue::Integer(i),
            Err(_) => bail!("column {} expects an integer, got '{text}'", column.name),
        },
        _ => SqlValue::from(value.clone()),
    };
    Ok(converted)
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::float_cmp
)]
fn whole_number(f: f64) -> Option<i64> {
    (f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64).then_some(f as i64)
}

impl TableAdapter for SqlTableAdapter {
    fn table(&self) -> ReplicatedTable {
        self.table
    }

    fn row_id(&self, payload: &Payload) -> Option<String> {
        let mut parts = Vec::with_capacity(self.schema.key_columns.len());
        for key in self.schema.key_columns {
            let part = match payload.get(key)? {
                FieldValue::Text(s) if !s.is_empty() => s.clone(),
                FieldValue::Integer(i) => i.to_string(),
                _ => return None,
            };
            parts.push(part);
        }
        Some(parts.join(&ROW_ID_SEPARATOR.to_string()))
    }

    fn load_all(&self, conn: &Connection) -> Result<Vec<RowSnapshot>> {
        let order_by = self.schema.key_columns.join(", ");
        let sql = format!(
            "SELECT {} FROM {} ORDER BY {order_by}",
            self.column_list(),
            self.schema.name
        );
        let mut stmt = conn
            .prepare(&sql)
            .with_context(|| format!("prepare scan of {}", self.table))?;
        let rows = stmt
            .query_map([], |row| self.project(row))
            .with_context(|| format!("scan {}", self.table))?;

        let mut snapshots = Vec::new();
        for row in rows {
            let payload = row.with_context(|| format!("read {} row", self.table))?;
            // Rows without a usable key cannot be addressed remotely.
            let Some(row_id) = self.row_id(&payload) else {
                tracing::debug!(table = %self.table, "skipping row with null key");
                continue;
            };
            snapshots.push(RowSnapshot { row_id, payload });
        }
        Ok(snapshots)
    }

    fn load(&self, conn: &Connection, row_id: &str) -> Result<Option<Payload>> {
        let keys = self.key_values(row_id)?;
        let sql = format!(
            "SELECT {} FROM {} WHERE {}",
            self.column_list(),
            self.schema.name,
            self.key_predicate()
        );
        let mut stmt = conn
            .prepare(&sql)
            .with_context(|| format!("prepare load of {}", self.table))?;
        let mut rows = stmt
            .query(params_from_iter(keys.iter()))
            .with_context(|| format!("load {}/{row_id}", self.table))?;
        match rows.next().with_context(|| format!("read {}/{row_id}", self.table))? {
            Some(row) => Ok(Some(self.project(row)?)),
            None => Ok(None),
        }
    }

    fn upsert(&self, conn: &Connection, row_id: &str, payload: &Payload) -> Result<()> {
        let keys = self.key_values(row_id)?;

        // Key values always come from the row id; payload keys are ignored.
        let mut columns: Vec<&str> = self.schema.key_columns.to_vec();
        let mut values: Vec<SqlValue> = keys.into_iter().map(SqlValue::Text).collect();
        let mut updated: Vec<&str> = Vec::new();
        for column in self.schema.columns {
            if self.schema.is_key(column.name) {
                continue;
            }
            if let Some(value) = payload.get(column.name) {
                columns.push(column.name);
                values.push(field_to_sql(column, value)?);
                updated.push(column.name);
            }
        }

        let placeholders = (1..=columns.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let conflict_action = if updated.is_empty() {
            "DO NOTHING".to_string()
        } else {
            let assignments = updated
                .iter()
                .map(|column| format!("{column} = excluded.{column}"))
                .collect::<Vec<_>>()
                .join(", ");
            format!("DO UPDATE SET {assignments}")
        };
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({placeholders}) ON CONFLICT({}) {conflict_action}",
            self.schema.name,
            columns.join(", "),
            self.schema.key_columns.join(", ")
        );

        conn.execute(&sql, params_from_iter(values))
            .with_context(|| format!("upsert {}/{row_id}", self.table))?;
        Ok(())
    }

    fn delete(&self, conn: &Connection, row_id: &str) -> Result<bool> {
        let keys = self.key_values(row_id)?;
        let sql = format!(
            "DELETE FROM {} WHERE {}",
            self.schema.name,
            self.key_predicate()
        );
        let removed = conn
            .execute(&sql, params_from_iter(keys.iter()))
            .with_context(|| format!("delete {}/{row_id}", self.table))?;
        Ok(removed > 0)
    }
}

// ---------------------------------------------------------------------------
// AdapterRegistry
// ---------------------------------------------------------------------------

/// The table-of-adapters handed to the scanner and applier.
///
/// Adapters are kept in registration order; [`AdapterRegistry::standard`]
/// registers parents before children so a full scan emits them in that
/// order.
pub struct AdapterRegistry {
    adapters: Vec<Box<dyn TableAdapter + Send + Sync>>,
}

impl AdapterRegistry {
    /// A registry with no adapters.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            adapters: Vec::new(),
        }
    }

    /// One [`SqlTableAdapter`] per [`ReplicatedTable`].
    #[must_use]
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        for table in ReplicatedTable::ALL {
            registry.register(Box::new(SqlTableAdapter::new(table)));
        }
        registry
    }

    /// Add an adapter, replacing any existing one for the same table.
    pub fn register(&mut self, adapter: Box<dyn TableAdapter + Send + Sync>) {
        let table = adapter.table();
        if let Some(slot) = self.adapters.iter_mut().find(|a| a.table() == table) {
            *slot = adapter;
        } else {
            self.adapters.push(adapter);
        }
    }

    /// Adapter for a wire table name; `None` for tables this node does not
    /// replicate.
    #[must_use]
    pub fn get(&self, table: &str) -> Option<&dyn TableAdapter> {
        let table: ReplicatedTable = table.parse().ok()?;
        self.adapters
            .iter()
            .find(|adapter| adapter.table() == table)
            .map(|adapter| adapter.as_ref() as &dyn TableAdapter)
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn TableAdapter> {
        self.adapters
            .iter()
            .map(|adapter| adapter.as_ref() as &dyn TableAdapter)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.adapters.iter().map(|adapter| adapter.table()))
            .finish()
    }
}
