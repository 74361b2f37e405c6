//! Collaborator traits
//!
//! The DXL layer does not store rows or schema itself. It drives four
//! collaborators through these traits:
//!
//! - [`SchemaManager`]: owns schema snapshots and the schema generation
//! - [`Store`]: owns rows and index trees, produces row collectors
//! - [`RowCollector`]: one lazy, single-pass, finite sequence of rows
//! - [`TransactionService`]: per-session transaction state
//!
//! All collaborators must be safe to call from many session threads at once
//! (requires Send + Sync). A row collector belongs to one cursor and is only
//! ever used by the session owning that cursor.

use crate::error::Result;
use crate::row::{ColumnSelector, NewRow};
use crate::scan::{MessageBuffer, ScanRequest};
use crate::schema::{Ais, IndexDefinition, Table, TableDefinition};
use crate::session::Session;
use crate::types::{GroupId, IndexId, TableId, TableName};
use std::sync::Arc;

/// Schema storage
pub trait SchemaManager: Send + Sync {
    /// Current schema snapshot
    fn ais(&self) -> Arc<Ais>;

    /// Current schema generation
    ///
    /// Bumped by every schema change.
    fn schema_generation(&self) -> u64;

    /// Create a table and its declared indexes
    ///
    /// # Errors
    ///
    /// `DuplicateTableName`, `NoSuchTable` for an unknown parent,
    /// `NoSuchColumn` for unknown key or join columns.
    fn create_table_definition(&self, definition: &TableDefinition) -> Result<TableId>;

    /// Rename a table
    fn rename_table(&self, current: &TableName, new_name: &TableName) -> Result<()>;

    /// Replace the definition of an existing table
    ///
    /// Table id, group and parent join are kept; columns are matched by name.
    fn alter_table_definition(&self, table: &TableName, definition: &TableDefinition) -> Result<()>;

    /// Remove a table definition
    ///
    /// Only leaf tables may be removed.
    fn drop_table_definition(&self, table: &TableName) -> Result<()>;

    /// Add indexes, returning their ids in request order
    fn create_indexes(&self, indexes: &[IndexDefinition]) -> Result<Vec<IndexId>>;

    /// Remove indexes
    fn drop_indexes(&self, indexes: &[IndexId]) -> Result<()>;

    /// Bump the generation without changing the schema
    fn force_new_generation(&self) -> u64;
}

/// Row storage
pub trait Store: Send + Sync {
    /// Create a collector for a scan
    ///
    /// The collector is not opened yet.
    fn new_row_collector(
        &self,
        session: &Session,
        ais: &Ais,
        request: &ScanRequest,
    ) -> Result<Box<dyn RowCollector>>;

    /// Insert a row
    fn write_row(&self, session: &Session, table: &Table, row: &NewRow) -> Result<()>;

    /// Replace `old` by `new`; only columns in `selector` are taken from `new`
    fn update_row(
        &self,
        session: &Session,
        table: &Table,
        old: &NewRow,
        new: &NewRow,
        selector: &ColumnSelector,
    ) -> Result<()>;

    /// Delete a row identified by its primary key
    fn delete_row(&self, session: &Session, table: &Table, row: &NewRow) -> Result<()>;

    /// Build index trees for existing rows
    fn build_indexes(&self, session: &Session, ais: &Ais, indexes: &[IndexId]) -> Result<()>;

    /// Delete index trees
    fn delete_indexes(&self, session: &Session, indexes: &[IndexId]) -> Result<()>;

    /// Remove every tree of the given tables
    fn remove_trees(&self, session: &Session, tables: &[TableId]) -> Result<()>;

    /// Delete every row of every table of a group
    fn truncate_group(&self, session: &Session, ais: &Ais, group: GroupId) -> Result<()>;

    /// Rewrite stored rows after a table definition change
    fn alter_table_rows(&self, session: &Session, old: &Table, new: &Table) -> Result<()>;

    /// Number of rows in a table
    fn row_count(&self, session: &Session, table: TableId) -> Result<u64>;
}

/// Lazy, single-pass source of rows for one scan
pub trait RowCollector: Send {
    /// Position the collector; must be called once before collecting
    fn open(&mut self) -> Result<()>;

    /// Whether another row may be produced
    fn has_more(&self) -> bool;

    /// Produce the next row, `None` when exhausted
    ///
    /// # Errors
    ///
    /// `StorageRollback` when the storage unit of work was rolled back.
    fn collect_next_row(&mut self) -> Result<Option<NewRow>>;

    /// Write the next row frame into `buffer`
    ///
    /// Returns false when no row was written, either because the collector
    /// is exhausted or because the row did not fit. A row that did not fit
    /// is produced again by the next call.
    fn collect_next_row_into(&mut self, buffer: &mut MessageBuffer) -> Result<bool>;

    /// Whether the collector enforces the scan limit itself
    fn checks_limit(&self) -> bool;

    /// Scanned table
    fn table_id(&self) -> TableId;

    /// Scanned index, `None` for the primary key
    fn index_id(&self) -> Option<IndexId>;

    /// Release resources; further calls produce nothing
    fn close(&mut self);
}

/// Transaction state per session
pub trait TransactionService: Send + Sync {
    /// A transaction is open on the session
    fn is_transaction_active(&self, session: &Session) -> bool;

    /// The open transaction is marked rollback-only or already rolled back
    fn is_rollback_pending(&self, session: &Session) -> bool;

    /// Begin a transaction
    fn begin_transaction(&self, session: &Session) -> Result<()>;

    /// Commit the open transaction
    fn commit_transaction(&self, session: &Session) -> Result<()>;

    /// Roll back the open transaction
    fn rollback_transaction(&self, session: &Session) -> Result<()>;

    /// Forget the transaction, committed or not
    fn end_transaction(&self, session: &Session) -> Result<()>;
}
