//! DXL execution layer
//!
//! This crate ties the lower layers together behind one façade:
//! - DxlService: every DDL/DML operation, wrapped by the hook chain
//! - DdlFunctions / DmlFunctions: the operations themselves
//! - CursorRegistry: open scans of every session, invalidation on change
//! - Scan loop: message-buffer and row-object output with scan limits
//! - DxlConfig: `dxl.toml` configuration
//! - TimingHook: optional per-operation durations
//!
//! Storage, schema and transactions are reached only through the traits in
//! `strata_core::traits`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod cursor;
pub mod ddl;
pub mod dml;
pub mod registry;
pub mod scan;
pub mod service;
pub mod timing;

pub use config::{DxlConfig, CONFIG_FILE_NAME, DEFAULT_SCAN_BUFFER_CAPACITY};
pub use cursor::{Cursor, CursorState, ScanData};
pub use ddl::{index_definition, table_definition, DdlFunctions};
pub use dml::{DmlFunctions, TableStatistics};
pub use registry::CursorRegistry;
pub use scan::{NoScanHooks, RowOutput, ScanHooks, ScanSink, SCAN_RETRY_BUDGET};
pub use service::DxlService;
pub use timing::{OpTiming, TimingHook};
