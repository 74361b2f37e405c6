//! DXL service: the operation façade
//!
//! [`DxlService`] owns the cursor registry, the lock coordinator and the hook
//! chain. Every public operation runs through the chain, so callers never
//! touch locks or transactions themselves.
//!
//! Default chain, outermost first:
//!
//! ```text
//! timing (if trace_timing) → lock → transaction → operation
//! ```

use crate::config::DxlConfig;
use crate::cursor::CursorState;
use crate::ddl::DdlFunctions;
use crate::dml::{DmlFunctions, TableStatistics};
use crate::registry::CursorRegistry;
use crate::scan::{RowOutput, ScanHooks};
use crate::timing::{OpTiming, TimingHook};
use std::sync::Arc;
use std::time::Duration;
use strata_concurrency::{DxlHook, HookChain, LockCoordinator, LockHook, LockStatus, TransactionHook};
use strata_core::error::Result;
use strata_core::function::{DxlFunction, FunctionClass};
use strata_core::row::{ColumnSelector, NewRow, RowData};
use strata_core::scan::{MessageBuffer, ScanRequest};
use strata_core::schema::{Ais, IndexDefinition, Table, TableDefinition};
use strata_core::session::Session;
use strata_core::traits::{SchemaManager, Store, TransactionService};
use strata_core::types::{CursorId, IndexId, TableId, TableName};
use tracing::info;

/// Running DXL service
pub struct DxlService {
    config: DxlConfig,
    chain: HookChain,
    locks: Arc<LockCoordinator>,
    timing: Option<Arc<TimingHook>>,
    cursors: Arc<CursorRegistry>,
    ddl: DdlFunctions,
    dml: Arc<DmlFunctions>,
}

impl DxlService {
    /// Start a service over the given collaborators
    ///
    /// # Errors
    ///
    /// Returns `Config` if the configuration is invalid.
    pub fn start(
        config: DxlConfig,
        schema: Arc<dyn SchemaManager>,
        store: Arc<dyn Store>,
        txn: Arc<dyn TransactionService>,
    ) -> Result<Self> {
        config.validate()?;
        let locks = Arc::new(LockCoordinator::new(config.data_lock_enabled, config.acquire_policy()?));
        let cursors = Arc::new(CursorRegistry::new());
        let dml = Arc::new(DmlFunctions::new(
            Arc::clone(&schema),
            Arc::clone(&store),
            Arc::clone(&cursors),
        ));
        let ddl = DdlFunctions::new(schema, store, Arc::clone(&cursors), Arc::clone(&dml));

        let mut chain = HookChain::new();
        let timing = config.trace_timing.then(|| Arc::new(TimingHook::new()));
        if let Some(timing) = &timing {
            chain.push(Arc::clone(timing) as Arc<dyn DxlHook>);
        }
        chain.push(Arc::new(LockHook::new(Arc::clone(&locks))));
        chain.push(Arc::new(TransactionHook::new(txn)));

        info!(
            target: "strata::dxl",
            data_lock = config.data_lock_enabled,
            acquisition = %config.lock_acquisition,
            hooks = ?chain.names(),
            "DXL service started"
        );
        Ok(Self {
            config,
            chain,
            locks,
            timing,
            cursors,
            ddl,
            dml,
        })
    }

    /// Stop the service, closing every open cursor; returns how many were closed
    pub fn stop(self) -> usize {
        let closed = self.cursors.close_all();
        info!(target: "strata::dxl", closed, "DXL service stopped");
        closed
    }

    /// Active configuration
    pub fn config(&self) -> &DxlConfig {
        &self.config
    }

    /// Append a hook; it runs innermost, after the transaction hook
    pub fn add_hook(&mut self, hook: Arc<dyn DxlHook>) {
        self.chain.push(hook);
    }

    /// Hook names, outermost first
    pub fn hook_names(&self) -> Vec<&'static str> {
        self.chain.names()
    }

    /// Lock holders and waiters
    pub fn lock_status(&self) -> Vec<LockStatus> {
        self.locks.lock_status()
    }

    /// Per-function timings, when `trace_timing` is on
    pub fn timings(&self) -> Option<Vec<(DxlFunction, OpTiming)>> {
        self.timing.as_ref().map(|t| t.snapshot())
    }

    /// Number of open cursors over every session
    pub fn cursor_count(&self) -> usize {
        self.cursors.len()
    }

    /// Message buffer sized for scans
    pub fn new_scan_buffer(&self) -> MessageBuffer {
        MessageBuffer::with_capacity(self.config.scan_buffer_capacity)
    }

    /// Configured timeout for [`get_ais_bounded`](Self::get_ais_bounded)
    pub fn admin_lock_timeout(&self) -> Duration {
        self.config.admin_lock_timeout()
    }

    /// Schema snapshot for administrative callers
    ///
    /// Takes the schema read lock directly with a timeout instead of running
    /// the hook chain, so a stuck DDL writer yields `LockTimeout` rather than
    /// blocking the caller.
    pub fn get_ais_bounded(&self, session: &mut Session, timeout: Duration) -> Result<Arc<Ais>> {
        let plan = self.locks.plan(FunctionClass::DdlRead);
        self.locks.acquire_plan(session, &plan, Some(timeout))?;
        let ais = self.ddl.get_ais();
        self.locks.release_plan(session, &plan)?;
        Ok(ais)
    }

    // ========================================================================
    // DDL
    // ========================================================================

    /// Create a table
    pub fn create_table(&self, session: &mut Session, definition: &TableDefinition) -> Result<TableId> {
        self.chain
            .run(session, DxlFunction::CreateTable, |s| self.ddl.create_table(s, definition))
    }

    /// Rename a table
    pub fn rename_table(&self, session: &mut Session, current: &TableName, new_name: &TableName) -> Result<()> {
        self.chain.run(session, DxlFunction::RenameTable, |s| {
            self.ddl.rename_table(s, current, new_name)
        })
    }

    /// Drop a leaf table; a missing table is ignored
    pub fn drop_table(&self, session: &mut Session, name: &TableName) -> Result<()> {
        self.chain
            .run(session, DxlFunction::DropTable, |s| self.ddl.drop_table(s, name))
    }

    /// Drop every table of a schema
    pub fn drop_schema(&self, session: &mut Session, schema: &str) -> Result<()> {
        self.chain
            .run(session, DxlFunction::DropSchema, |s| self.ddl.drop_schema(s, schema))
    }

    /// Drop a group; a missing group is ignored
    pub fn drop_group(&self, session: &mut Session, name: &TableName) -> Result<()> {
        self.chain
            .run(session, DxlFunction::DropGroup, |s| self.ddl.drop_group(s, name))
    }

    /// Replace a table definition
    pub fn alter_table(&self, session: &mut Session, name: &TableName, definition: &TableDefinition) -> Result<()> {
        self.chain.run(session, DxlFunction::AlterTable, |s| {
            self.ddl.alter_table(s, name, definition)
        })
    }

    /// Create and build indexes
    pub fn create_indexes(&self, session: &mut Session, definitions: &[IndexDefinition]) -> Result<Vec<IndexId>> {
        self.chain.run(session, DxlFunction::CreateIndexes, |s| {
            self.ddl.create_indexes(s, definitions)
        })
    }

    /// Drop secondary indexes of a table
    pub fn drop_table_indexes(&self, session: &mut Session, table: &TableName, names: &[String]) -> Result<()> {
        self.chain.run(session, DxlFunction::DropTableIndexes, |s| {
            self.ddl.drop_table_indexes(s, table, names)
        })
    }

    /// Drop group indexes
    pub fn drop_group_indexes(&self, session: &mut Session, group: &TableName, names: &[String]) -> Result<()> {
        self.chain.run(session, DxlFunction::DropGroupIndexes, |s| {
            self.ddl.drop_group_indexes(s, group, names)
        })
    }

    /// Bump the schema generation
    pub fn force_generation_update(&self, session: &mut Session) -> Result<u64> {
        self.chain.run(session, DxlFunction::ForceGenerationUpdate, |_| {
            Ok(self.ddl.force_generation_update())
        })
    }

    /// Current schema snapshot
    pub fn get_ais(&self, session: &mut Session) -> Result<Arc<Ais>> {
        self.chain.run(session, DxlFunction::GetAis, |_| Ok(self.ddl.get_ais()))
    }

    /// Id of a table
    pub fn get_table_id(&self, session: &mut Session, name: &TableName) -> Result<TableId> {
        self.chain
            .run(session, DxlFunction::GetTableId, |_| self.ddl.get_table_id(name))
    }

    /// Table by id
    pub fn get_table_by_id(&self, session: &mut Session, id: TableId) -> Result<Table> {
        self.chain
            .run(session, DxlFunction::GetTableById, |_| self.ddl.get_table_by_id(id))
    }

    /// Table by name
    pub fn get_table_by_name(&self, session: &mut Session, name: &TableName) -> Result<Table> {
        self.chain
            .run(session, DxlFunction::GetTableByName, |_| self.ddl.get_table_by_name(name))
    }

    /// Name of a table
    pub fn get_table_name(&self, session: &mut Session, id: TableId) -> Result<TableName> {
        self.chain
            .run(session, DxlFunction::GetTableName, |_| self.ddl.get_table_name(id))
    }

    /// JSON definitions of every table and group index
    pub fn get_ddls(&self, session: &mut Session) -> Result<Vec<String>> {
        self.chain.run(session, DxlFunction::GetDdls, |_| self.ddl.get_ddls())
    }

    /// Current schema generation
    pub fn get_generation(&self, session: &mut Session) -> Result<u64> {
        self.chain
            .run(session, DxlFunction::GetSchemaGeneration, |_| Ok(self.ddl.get_generation()))
    }

    // ========================================================================
    // DML
    // ========================================================================

    /// Row count of a table
    pub fn get_table_statistics(&self, session: &mut Session, table: TableId, update_first: bool) -> Result<TableStatistics> {
        self.chain.run(session, DxlFunction::GetTableStatistics, |s| {
            self.dml.get_table_statistics(s, table, update_first)
        })
    }

    /// Open a cursor; fails with `OldAis` unless `known_generation` is current
    pub fn open_cursor(&self, session: &mut Session, known_generation: u64, request: ScanRequest) -> Result<CursorId> {
        self.chain.run(session, DxlFunction::OpenCursor, |s| {
            self.dml.open_cursor(s, known_generation, request)
        })
    }

    /// State of a cursor of this session
    pub fn get_cursor_state(&self, session: &mut Session, id: CursorId) -> Result<CursorState> {
        self.chain
            .run(session, DxlFunction::GetCursorState, |s| Ok(self.dml.get_cursor_state(s, id)))
    }

    /// Scan into a message buffer; returns whether rows remain
    pub fn scan_some(
        &self,
        session: &mut Session,
        id: CursorId,
        buffer: &mut MessageBuffer,
        hooks: &dyn ScanHooks,
    ) -> Result<bool> {
        self.chain
            .run(session, DxlFunction::ScanSome, |s| self.dml.scan_some(s, id, buffer, hooks))
    }

    /// Scan into a row output; returns whether rows remain
    pub fn scan_some_rows(
        &self,
        session: &mut Session,
        id: CursorId,
        output: &mut dyn RowOutput,
        hooks: &dyn ScanHooks,
    ) -> Result<bool> {
        self.chain
            .run(session, DxlFunction::ScanSome, |s| self.dml.scan_some_rows(s, id, output, hooks))
    }

    /// Close a cursor of this session
    pub fn close_cursor(&self, session: &mut Session, id: CursorId) -> Result<()> {
        self.chain
            .run(session, DxlFunction::CloseCursor, |s| self.dml.close_cursor(s, id))
    }

    /// Open cursors of this session
    pub fn get_cursors(&self, session: &mut Session) -> Result<Vec<CursorId>> {
        self.chain
            .run(session, DxlFunction::GetCursors, |s| Ok(self.dml.get_cursors(s)))
    }

    /// Encode a row
    pub fn convert_new_row(&self, session: &mut Session, row: &NewRow) -> Result<RowData> {
        self.chain
            .run(session, DxlFunction::ConvertNewRow, |_| self.dml.convert_new_row(row))
    }

    /// Decode a row
    pub fn convert_row_data(&self, session: &mut Session, data: &RowData) -> Result<NewRow> {
        self.chain
            .run(session, DxlFunction::ConvertRowData, |_| self.dml.convert_row_data(data))
    }

    /// Decode a batch of rows
    pub fn convert_row_datas(&self, session: &mut Session, datas: &[RowData]) -> Result<Vec<NewRow>> {
        self.chain
            .run(session, DxlFunction::ConvertRowDatas, |_| self.dml.convert_row_datas(datas))
    }

    /// Insert a row
    pub fn write_row(&self, session: &mut Session, row: &NewRow) -> Result<()> {
        self.chain
            .run(session, DxlFunction::WriteRow, |s| self.dml.write_row(s, row))
    }

    /// Delete a row
    pub fn delete_row(&self, session: &mut Session, row: &NewRow) -> Result<()> {
        self.chain
            .run(session, DxlFunction::DeleteRow, |s| self.dml.delete_row(s, row))
    }

    /// Update the selected columns of a row
    pub fn update_row(&self, session: &mut Session, old: &NewRow, new: &NewRow, selector: &ColumnSelector) -> Result<()> {
        self.chain.run(session, DxlFunction::UpdateRow, |s| {
            self.dml.update_row(s, old, new, selector)
        })
    }

    /// Remove every row of a table
    pub fn truncate_table(&self, session: &mut Session, table: TableId) -> Result<()> {
        self.chain
            .run(session, DxlFunction::TruncateTable, |s| self.dml.truncate_table(s, table))
    }
}

impl std::fmt::Debug for DxlService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DxlService")
            .field("config", &self.config)
            .field("hooks", &self.chain.names())
            .field("cursors", &self.cursors.len())
            .finish()
    }
}
