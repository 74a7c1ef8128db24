//! Row-level replication: table adapters, change capture, and remote apply.

pub mod adapter;
pub mod applier;
pub mod row_hash;
pub mod row_version;
pub mod scanner;
pub mod table;

pub use adapter::{AdapterRegistry, RowSnapshot, SqlTableAdapter, TableAdapter};
pub use applier::{ApplyReport, apply};
pub use row_hash::RowHashStore;
pub use row_version::RowVersionStore;
pub use scanner::{ScanReport, scan};
pub use table::{Column, ColumnKind, ReplicatedTable, TableSchema};
