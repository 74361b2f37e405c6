//! Error types for the DXL layer
//!
//! Every failure surfaced by this layer maps to one named [`DxlError`]
//! variant so that the SQL layer can translate it into a client diagnostic.
//! We use `thiserror` for the `Display` and `Error` implementations.
//!
//! # Categories
//!
//! | Category | Variants | Caller action |
//! |----------|----------|---------------|
//! | Protocol violation | `LockNotHeld`, `WriteLockTaken`, `ProtocolViolation`, `Interrupted` | Integration bug, never retry |
//! | Concurrency conflict | `ConcurrentScanAndUpdate`, `TableDefinitionChanged` | Close and reopen the cursor |
//! | Cursor lifecycle | `CursorIsUnknown`, `CursorIsFinished` | Caller error |
//! | Stale schema | `OldAis` | Refresh generation, retry whole operation |
//! | Scan retry | `ScanRetryAbandoned`, `StorageRollback` | Retry whole operation |
//! | Cleanup | `Aggregate` | Inspect every cause |

use crate::session::LockKind;
use crate::types::{CursorId, GroupId, IndexId, TableId, TableName};
use std::io;
use std::thread::ThreadId;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for DXL operations
pub type Result<T> = std::result::Result<T, DxlError>;

/// Error type for the DXL layer
#[derive(Debug, Error)]
pub enum DxlError {
    // ==================== Protocol violations ====================
    /// A lock release found no matching handle on the session stack
    #[error("no {kind} lock handle recorded for this session")]
    LockNotHeld {
        /// Lock kind that was expected
        kind: LockKind,
    },

    /// The write lock is held by another thread
    ///
    /// DDL writers are expected to be serialized by the caller, so this is
    /// reported immediately instead of blocking.
    #[error("{kind} write lock taken by another thread ({owner:?})")]
    WriteLockTaken {
        /// Lock kind
        kind: LockKind,
        /// Thread currently holding the write lock
        owner: ThreadId,
    },

    /// The hook or lock protocol was not followed
    #[error("protocol violation: {detail}")]
    ProtocolViolation {
        /// What went wrong
        detail: String,
    },

    /// Lock acquisition was interrupted
    #[error("interrupted while acquiring {kind} lock")]
    Interrupted {
        /// Lock kind
        kind: LockKind,
    },

    /// Bounded lock acquisition timed out
    #[error("timed out after {timeout:?} acquiring {kind} lock")]
    LockTimeout {
        /// Lock kind
        kind: LockKind,
        /// Timeout that elapsed
        timeout: Duration,
    },

    // ==================== Concurrency conflicts ====================
    /// Scanned data was modified while the cursor was open
    #[error("concurrent scan and update for cursor {cursor}")]
    ConcurrentScanAndUpdate {
        /// Cursor that was invalidated
        cursor: CursorId,
    },

    /// A scanned table's definition changed while the cursor was open
    #[error("a table's definition has changed for cursor {cursor}")]
    TableDefinitionChanged {
        /// Cursor that was invalidated
        cursor: CursorId,
    },

    // ==================== Cursor lifecycle ====================
    /// No cursor is registered under this id for the session
    #[error("unknown cursor {cursor}")]
    CursorIsUnknown {
        /// Cursor id
        cursor: CursorId,
    },

    /// The cursor has already been scanned to completion
    #[error("cursor {cursor} is finished")]
    CursorIsFinished {
        /// Cursor id
        cursor: CursorId,
    },

    // ==================== Stale schema ====================
    /// Caller supplied an outdated schema generation
    #[error("schema generation {known} is stale, current is {current}")]
    OldAis {
        /// Generation known to the caller
        known: u64,
        /// Current generation
        current: u64,
    },

    // ==================== Scan failures ====================
    /// A storage rollback aborted the scan and no retry was attempted
    #[error("scan of cursor {cursor} abandoned after {retries} retries: {reason}")]
    ScanRetryAbandoned {
        /// Cursor being scanned
        cursor: CursorId,
        /// Retries performed before giving up
        retries: u32,
        /// Rollback reason reported by storage
        reason: String,
    },

    /// Storage rolled back the current unit of work
    #[error("storage rollback: {reason}")]
    StorageRollback {
        /// Reason reported by storage
        reason: String,
    },

    /// The message buffer cannot hold the next row
    #[error("output buffer full")]
    BufferFull,

    /// The output sink rejected a row
    #[error("row output failed: {reason}")]
    RowOutput {
        /// Reason
        reason: String,
    },

    // ==================== Cleanup ====================
    /// More than one failure happened for the same operation
    #[error("{} errors: {}", .causes.len(), join_causes(.causes))]
    Aggregate {
        /// Every failure, in the order it happened
        causes: Vec<DxlError>,
    },

    // ==================== Schema and row conditions ====================
    /// Table does not exist
    #[error("no such table: {table}")]
    NoSuchTable {
        /// Table name or id rendered as text
        table: String,
    },

    /// Group does not exist
    #[error("no such group: {group}")]
    NoSuchGroup {
        /// Group name
        group: TableName,
    },

    /// Index does not exist
    #[error("no such index: {index}")]
    NoSuchIndex {
        /// Index name or id rendered as text
        index: String,
    },

    /// Column does not exist
    #[error("no such column {column} in table {table}")]
    NoSuchColumn {
        /// Table id
        table: TableId,
        /// Column position or name rendered as text
        column: String,
    },

    /// Row to delete or update does not exist
    #[error("no such row in table {table}")]
    NoSuchRow {
        /// Table id
        table: TableId,
    },

    /// A unique index would contain a duplicate
    #[error("duplicate key for index {index} of table {table}")]
    DuplicateKey {
        /// Table id
        table: TableId,
        /// Index id
        index: IndexId,
    },

    /// A table with this name already exists
    #[error("duplicate table name: {table}")]
    DuplicateTableName {
        /// Table name
        table: TableName,
    },

    /// An index with this name already exists on the table or group
    #[error("duplicate index name {index} on {table}")]
    DuplicateIndexName {
        /// Owner name
        table: TableName,
        /// Index name
        index: String,
    },

    /// The table may not be dropped through this interface
    #[error("cannot drop table {table}: {reason}")]
    UnsupportedDrop {
        /// Table name
        table: TableName,
        /// Reason
        reason: String,
    },

    /// Dropping would orphan tables in another schema
    #[error("cannot drop {parent}: child table {child} is in another schema")]
    ForeignConstraint {
        /// Table being dropped
        parent: TableName,
        /// Child outside the schema
        child: TableName,
    },

    /// Primary key indexes cannot be dropped
    #[error("index {index} of {table} is protected")]
    ProtectedIndex {
        /// Table name
        table: TableName,
        /// Index name
        index: String,
    },

    /// Row shape does not match its table definition
    #[error("row does not match definition of table {table}: {reason}")]
    TableDefinitionMismatch {
        /// Table id
        table: TableId,
        /// Reason
        reason: String,
    },

    /// Group-level scan target mismatch
    #[error("table {table} is not in group {group}")]
    NotInGroup {
        /// Table id
        table: TableId,
        /// Group id
        group: GroupId,
    },

    // ==================== System ====================
    /// Generic invalid operation
    #[error("invalid operation: {reason}")]
    InvalidOperation {
        /// Reason
        reason: String,
    },

    /// Storage layer failure
    #[error("storage error: {message}")]
    Storage {
        /// Message
        message: String,
    },

    /// Configuration could not be read or parsed
    #[error("configuration error: {message}")]
    Config {
        /// Message
        message: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Row encoding or decoding failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal invariant broken
    #[error("internal error: {message}")]
    Internal {
        /// Message
        message: String,
    },
}

fn join_causes(causes: &[DxlError]) -> String {
    causes
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl DxlError {
    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        DxlError::Internal {
            message: message.into(),
        }
    }

    /// Create an invalid operation error
    pub fn invalid_operation(reason: impl Into<String>) -> Self {
        DxlError::InvalidOperation {
            reason: reason.into(),
        }
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        DxlError::Storage {
            message: message.into(),
        }
    }

    /// Create a protocol violation
    pub fn protocol(detail: impl Into<String>) -> Self {
        DxlError::ProtocolViolation {
            detail: detail.into(),
        }
    }

    /// Create a storage rollback condition
    pub fn rollback(reason: impl Into<String>) -> Self {
        DxlError::StorageRollback {
            reason: reason.into(),
        }
    }

    /// Combine several failures
    ///
    /// A single failure is returned as is; an empty list yields `None`.
    pub fn aggregate(mut causes: Vec<DxlError>) -> Option<DxlError> {
        match causes.len() {
            0 => None,
            1 => causes.pop(),
            _ => Some(DxlError::Aggregate { causes }),
        }
    }

    /// Every underlying cause, flattening aggregates
    pub fn causes(&self) -> Vec<&DxlError> {
        match self {
            DxlError::Aggregate { causes } => causes.iter().flat_map(|c| c.causes()).collect(),
            other => vec![other],
        }
    }

    /// First cause, used for classification of aggregates
    pub fn primary(&self) -> &DxlError {
        match self {
            DxlError::Aggregate { causes } => causes.first().map(|c| c.primary()).unwrap_or(self),
            other => other,
        }
    }

    /// Integration bug: the operation must not be retried
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.primary(),
            DxlError::LockNotHeld { .. }
                | DxlError::WriteLockTaken { .. }
                | DxlError::ProtocolViolation { .. }
                | DxlError::Interrupted { .. }
                | DxlError::Internal { .. }
        )
    }

    /// A cursor was invalidated by a concurrent change
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(
            self.primary(),
            DxlError::ConcurrentScanAndUpdate { .. } | DxlError::TableDefinitionChanged { .. }
        )
    }

    /// The caller may refresh its state and retry the whole operation
    pub fn is_retryable_by_caller(&self) -> bool {
        self.is_concurrency_conflict()
            || matches!(
                self.primary(),
                DxlError::OldAis { .. }
                    | DxlError::ScanRetryAbandoned { .. }
                    | DxlError::StorageRollback { .. }
                    | DxlError::LockTimeout { .. }
            )
    }

    /// Storage rolled back underneath a scan
    pub fn is_rollback(&self) -> bool {
        matches!(self, DxlError::StorageRollback { .. })
    }

    /// Stable name for the SQL layer
    pub fn error_code(&self) -> &'static str {
        match self {
            DxlError::LockNotHeld { .. } => "LockNotHeld",
            DxlError::WriteLockTaken { .. } => "WriteLockTaken",
            DxlError::ProtocolViolation { .. } => "ProtocolViolation",
            DxlError::Interrupted { .. } => "Interrupted",
            DxlError::LockTimeout { .. } => "LockTimeout",
            DxlError::ConcurrentScanAndUpdate { .. } => "ConcurrentScanAndUpdate",
            DxlError::TableDefinitionChanged { .. } => "TableDefinitionChanged",
            DxlError::CursorIsUnknown { .. } => "CursorIsUnknown",
            DxlError::CursorIsFinished { .. } => "CursorIsFinished",
            DxlError::OldAis { .. } => "OldAis",
            DxlError::ScanRetryAbandoned { .. } => "ScanRetryAbandoned",
            DxlError::StorageRollback { .. } => "StorageRollback",
            DxlError::BufferFull => "BufferFull",
            DxlError::RowOutput { .. } => "RowOutput",
            DxlError::Aggregate { .. } => "Aggregate",
            DxlError::NoSuchTable { .. } => "NoSuchTable",
            DxlError::NoSuchGroup { .. } => "NoSuchGroup",
            DxlError::NoSuchIndex { .. } => "NoSuchIndex",
            DxlError::NoSuchColumn { .. } => "NoSuchColumn",
            DxlError::NoSuchRow { .. } => "NoSuchRow",
            DxlError::DuplicateKey { .. } => "DuplicateKey",
            DxlError::DuplicateTableName { .. } => "DuplicateTableName",
            DxlError::DuplicateIndexName { .. } => "DuplicateIndexName",
            DxlError::UnsupportedDrop { .. } => "UnsupportedDrop",
            DxlError::ForeignConstraint { .. } => "ForeignConstraint",
            DxlError::ProtectedIndex { .. } => "ProtectedIndex",
            DxlError::TableDefinitionMismatch { .. } => "TableDefinitionMismatch",
            DxlError::NotInGroup { .. } => "NotInGroup",
            DxlError::InvalidOperation { .. } => "InvalidOperation",
            DxlError::Storage { .. } => "Storage",
            DxlError::Config { .. } => "Config",
            DxlError::Io(_) => "Io",
            DxlError::Serialization(_) => "Serialization",
            DxlError::Internal { .. } => "Internal",
        }
    }
}

impl From<bincode::Error> for DxlError {
    fn from(e: bincode::Error) -> Self {
        DxlError::Serialization(e.to_string())
    }
}
