//! Strata DXL - execution control for DDL and DML operations
//!
//! Every operation on the [`DxlService`] runs inside a hook chain that takes
//! the schema (and optionally data) locks, opens a transaction when the
//! session has none, and cleans both up again whatever the outcome. Open scans
//! are tracked per session and invalidated when a concurrent update or schema
//! change makes their results unreliable.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use strata_dxl::{DxlConfig, DxlService, Session, TableDefinition, TableName};
//! use strata_dxl::storage::{MemorySchemaManager, MemoryStore, MemoryTransactionService};
//!
//! let txn = Arc::new(MemoryTransactionService::new());
//! let store = Arc::new(MemoryStore::new(txn.clone()));
//! let dxl = DxlService::start(DxlConfig::default(), Arc::new(MemorySchemaManager::new()), store, txn)?;
//!
//! let mut session = Session::new();
//! let table = dxl.create_table(
//!     &mut session,
//!     &TableDefinition::new(TableName::new("shop", "items")).column("id", false).primary_key(&["id"]),
//! )?;
//! ```
//!
//! # Architecture
//!
//! - `strata-core`: sessions, errors, schema snapshots, rows and collaborator traits
//! - `strata-concurrency`: fair reader/writer locks, lock and transaction hooks, hook chain
//! - `strata-storage`: in-memory schema manager, store and transaction service
//! - `strata-engine`: cursor registry, scan loop, DDL/DML functions and the service

pub use strata_concurrency as concurrency;
pub use strata_engine as engine;
pub use strata_storage as storage;

pub use strata_core::traits;
pub use strata_core::{
    ColumnRequest, ColumnSelector, CursorId, DxlError, DxlFunction, NewRow, Result, RowData, ScanRequest, Session,
    TableDefinition, TableId, TableName, Value,
};
pub use strata_engine::{CursorState, DxlConfig, DxlService, NoScanHooks, RowOutput, ScanHooks};
