//! Core types and traits for the Strata DXL layer
//!
//! This crate defines the foundational types used throughout the layer:
//! - SessionId, TableId, IndexId, GroupId, CursorId: identifiers
//! - Value: column value with a total order
//! - NewRow, RowData, ColumnSet: row representations
//! - Ais and definitions: schema snapshot model
//! - ScanRequest, ScanLimit, MessageBuffer: scan descriptions and output
//! - DxlFunction: operation catalogue with lock classes
//! - Session: per-caller context with typed registry
//! - DxlError: error type hierarchy
//! - Traits: collaborator traits (SchemaManager, Store, RowCollector, TransactionService)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod function;
pub mod row;
pub mod scan;
pub mod schema;
pub mod session;
pub mod traits;
pub mod types;
pub mod value;

pub use error::{DxlError, Result};
pub use function::{DxlFunction, FunctionClass};
pub use row::{ColumnSelector, ColumnSet, NewRow, RowData};
pub use scan::{
    ColumnRequest, FixedCountLimit, MessageBuffer, NoLimit, ScanBound, ScanLimit, ScanRequest,
};
pub use schema::{
    Ais, Column, Group, Index, IndexColumn, IndexDefinition, IndexScope, IndexTarget, Join,
    JoinColumn, Table, TableDefinition,
};
pub use session::{
    AcquireState, HeldLock, InterruptToken, Key, LockKind, LockMode, Session, StackKey,
};
pub use traits::{RowCollector, SchemaManager, Store, TransactionService};
pub use types::{CursorId, GroupId, IndexId, SessionId, TableId, TableName};
pub use value::Value;
