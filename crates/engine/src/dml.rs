//! Row operations and cursors
//!
//! These functions run inside the hook chain; they take no locks and begin
//! no transactions themselves. `truncate_table` reuses the cursor functions
//! directly, so it does not re-enter the chain.

use crate::cursor::{Cursor, CursorState, ScanData};
use crate::registry::CursorRegistry;
use crate::scan::{self, NoScanHooks, RowOutput, ScanHooks, ScanSink};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strata_core::error::{DxlError, Result};
use strata_core::row::{ColumnSelector, NewRow, RowData};
use strata_core::scan::{ColumnRequest, MessageBuffer, ScanRequest};
use strata_core::schema::{Ais, Table};
use strata_core::session::Session;
use strata_core::traits::{SchemaManager, Store};
use strata_core::types::{CursorId, TableId};
use tracing::{debug, trace, warn};

/// Table statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStatistics {
    /// Table id
    pub table: TableId,
    /// Stored rows
    pub row_count: u64,
}

pub(crate) fn require_table(ais: &Ais, id: TableId) -> Result<&Table> {
    ais.table(id).ok_or_else(|| DxlError::NoSuchTable {
        table: id.to_string(),
    })
}

/// Positions of the scanned table in the requested index, or its primary key
fn index_positions(ais: &Ais, table: &Table, request: &ScanRequest) -> Result<Vec<usize>> {
    let Some(id) = request.index_id() else {
        return Ok(table.primary_key_positions());
    };
    table
        .index(id)
        .or_else(|| ais.group(table.group).and_then(|g| g.indexes.iter().find(|i| i.id == id)))
        .map(|index| index.positions_for(table.id).collect())
        .ok_or_else(|| DxlError::NoSuchIndex {
            index: id.to_string(),
        })
}

/// Deletes every row handed to it
struct RowDeleter<'a> {
    store: &'a dyn Store,
    session: &'a Session,
    table: &'a Table,
    deleted: u64,
}

impl RowOutput for RowDeleter<'_> {
    fn output(&mut self, row: NewRow) -> Result<()> {
        self.store.delete_row(self.session, self.table, &row)?;
        self.deleted += 1;
        Ok(())
    }
}

/// DML entry points
pub struct DmlFunctions {
    schema: Arc<dyn SchemaManager>,
    store: Arc<dyn Store>,
    cursors: Arc<CursorRegistry>,
}

impl DmlFunctions {
    /// Functions over the given collaborators
    pub fn new(schema: Arc<dyn SchemaManager>, store: Arc<dyn Store>, cursors: Arc<CursorRegistry>) -> Self {
        Self {
            schema,
            store,
            cursors,
        }
    }

    fn check_generation(&self, known: u64) -> Result<()> {
        let current = self.schema.schema_generation();
        if current != known {
            return Err(DxlError::OldAis { known, current });
        }
        Ok(())
    }

    /// Row count of a table
    pub fn get_table_statistics(&self, session: &Session, table: TableId, update_first: bool) -> Result<TableStatistics> {
        trace!(target: "strata::dxl", %table, update_first, "table statistics");
        let ais = self.schema.ais();
        let table = require_table(&ais, table)?;
        let row_count = self.store.row_count(session, table.id)?;
        Ok(TableStatistics {
            table: table.id,
            row_count,
        })
    }

    /// Open a cursor for `request`
    ///
    /// Fails with `OldAis` when `known_generation` is not current, both
    /// before and after the cursor is registered. In the second case the
    /// cursor is closed again.
    pub fn open_cursor(&self, session: &Session, known_generation: u64, request: ScanRequest) -> Result<CursorId> {
        self.check_generation(known_generation)?;
        let ais = self.schema.ais();
        let table = require_table(&ais, request.table_id())?;
        let positions = index_positions(&ais, table, &request)?;

        let mut collector = self.store.new_row_collector(session, &ais, &request)?;
        if let Err(e) = collector.open() {
            collector.close();
            return Err(e);
        }

        let id = self.cursors.next_id(session.id(), table.id);
        let data = ScanData::new(id, Cursor::new(collector, request), ais.generation(), table.group, positions);
        self.cursors.insert(Arc::new(data));

        if let Err(e) = self.check_generation(known_generation) {
            if let Err(close) = self.close_cursor(session, id) {
                warn!(target: "strata::cursor", cursor = %id, error = %close, "close after generation change");
            }
            return Err(e);
        }
        trace!(target: "strata::cursor", cursor = %id, "opened");
        Ok(id)
    }

    /// State of a cursor, `Unknown` when the session has no such cursor
    pub fn get_cursor_state(&self, session: &Session, id: CursorId) -> CursorState {
        self.cursors
            .get(session.id(), id)
            .map_or(CursorState::Unknown, |data| data.cursor().state())
    }

    /// Look up a cursor that may be scanned
    ///
    /// Invalidation states win over a stale generation; a cursor opened at an
    /// older generation is closed.
    fn scannable(&self, session: &Session, id: CursorId) -> Result<Arc<ScanData>> {
        let data = self
            .cursors
            .get(session.id(), id)
            .ok_or(DxlError::CursorIsUnknown { cursor: id })?;
        match data.cursor().state() {
            CursorState::ConcurrentModification => return Err(DxlError::ConcurrentScanAndUpdate { cursor: id }),
            CursorState::DdlModification => return Err(DxlError::TableDefinitionChanged { cursor: id }),
            CursorState::Finished => return Err(DxlError::CursorIsFinished { cursor: id }),
            CursorState::Closed | CursorState::Unknown => return Err(DxlError::CursorIsUnknown { cursor: id }),
            CursorState::Fresh | CursorState::Scanning => {}
        }
        let current = self.schema.schema_generation();
        if data.generation() != current {
            self.close_cursor(session, id)?;
            return Err(DxlError::OldAis {
                known: data.generation(),
                current,
            });
        }
        Ok(data)
    }

    /// Scan into a message buffer; returns whether rows remain
    pub fn scan_some(
        &self,
        session: &Session,
        id: CursorId,
        buffer: &mut MessageBuffer,
        hooks: &dyn ScanHooks,
    ) -> Result<bool> {
        trace!(target: "strata::cursor", cursor = %id, "scanning");
        let data = self.scannable(session, id)?;
        scan::scan_some(&data, &mut ScanSink::Buffer(buffer), hooks)
    }

    /// Scan into a row output; returns whether rows remain
    ///
    /// Rows reach `output` only after the pull completed, projected to the
    /// requested columns. Errors from `output` are reported as `RowOutput`.
    pub fn scan_some_rows(
        &self,
        session: &Session,
        id: CursorId,
        output: &mut dyn RowOutput,
        hooks: &dyn ScanHooks,
    ) -> Result<bool> {
        trace!(target: "strata::cursor", cursor = %id, "scanning rows");
        let data = self.scannable(session, id)?;
        let mut staged = Vec::new();
        let more = scan::scan_some(&data, &mut ScanSink::Rows(&mut staged), hooks)?;

        let projection = if data.scan_all() {
            None
        } else {
            let width = self.schema.ais().table(id.table_id()).map_or(0, Table::column_count);
            Some(data.scan_columns(width).clone())
        };
        for row in staged {
            let row = match &projection {
                Some(columns) => row.project(columns),
                None => row,
            };
            output.output(row).map_err(|e| match e {
                DxlError::RowOutput { .. } => e,
                other => DxlError::RowOutput {
                    reason: other.to_string(),
                },
            })?;
        }
        Ok(more)
    }

    /// Close a cursor and release its collector
    pub fn close_cursor(&self, session: &Session, id: CursorId) -> Result<()> {
        trace!(target: "strata::cursor", cursor = %id, "closing");
        let data = self
            .cursors
            .remove(session.id(), id)
            .ok_or(DxlError::CursorIsUnknown { cursor: id })?;
        data.cursor().close();
        Ok(())
    }

    /// Open cursors of the session
    pub fn get_cursors(&self, session: &Session) -> Vec<CursorId> {
        self.cursors.ids_for_session(session.id())
    }

    /// Encode a row as a frame
    pub fn convert_new_row(&self, row: &NewRow) -> Result<RowData> {
        trace!(target: "strata::dxl", table = %row.table_id(), "converting to RowData");
        let ais = self.schema.ais();
        require_table(&ais, row.table_id())?;
        RowData::encode(row)
    }

    /// Decode a frame
    pub fn convert_row_data(&self, data: &RowData) -> Result<NewRow> {
        trace!(target: "strata::dxl", table = %data.table_id(), "converting to NewRow");
        let ais = self.schema.ais();
        require_table(&ais, data.table_id())?;
        data.decode()
    }

    /// Decode frames, looking each table up once per run of equal ids
    pub fn convert_row_datas(&self, datas: &[RowData]) -> Result<Vec<NewRow>> {
        trace!(target: "strata::dxl", count = datas.len(), "converting RowDatas");
        let ais = self.schema.ais();
        let mut last: Option<TableId> = None;
        let mut rows = Vec::with_capacity(datas.len());
        for data in datas {
            if last != Some(data.table_id()) {
                require_table(&ais, data.table_id())?;
                last = Some(data.table_id());
            }
            rows.push(data.decode()?);
        }
        Ok(rows)
    }

    /// Insert a row
    pub fn write_row(&self, session: &Session, row: &NewRow) -> Result<()> {
        trace!(target: "strata::dxl", table = %row.table_id(), "writing a row");
        let ais = self.schema.ais();
        let table = require_table(&ais, row.table_id())?;
        self.store.write_row(session, table, row)
    }

    /// Delete a row
    pub fn delete_row(&self, session: &Session, row: &NewRow) -> Result<()> {
        trace!(target: "strata::dxl", table = %row.table_id(), "deleting a row");
        let ais = self.schema.ais();
        let table = require_table(&ais, row.table_id())?;
        self.store.delete_row(session, table, row)
    }

    /// Update the selected columns of a row
    ///
    /// Open cursors affected by the change are invalidated first.
    pub fn update_row(&self, session: &Session, old: &NewRow, new: &NewRow, selector: &ColumnSelector) -> Result<()> {
        trace!(target: "strata::dxl", table = %old.table_id(), "updating a row");
        if old.table_id() != new.table_id() {
            return Err(DxlError::invalid_operation(format!(
                "update from table {} to table {}",
                old.table_id(),
                new.table_id()
            )));
        }
        let ais = self.schema.ais();
        let table = require_table(&ais, old.table_id())?;
        self.cursors.mark_updated(&ais, table, old, new, selector);
        self.store.update_row(session, table, old, new, selector)
    }

    /// Remove every row of a table
    ///
    /// When every other table of the group is empty the whole group is
    /// truncated at once. Otherwise the table is scanned and deleted row by
    /// row.
    pub fn truncate_table(&self, session: &Session, table: TableId) -> Result<()> {
        trace!(target: "strata::dxl", %table, "truncating");
        let ais = self.schema.ais();
        let table = require_table(&ais, table)?;

        let mut others_empty = true;
        for other in ais.group_tables(table.group).filter(|t| t.id != table.id) {
            if self.store.row_count(session, other.id)? > 0 {
                others_empty = false;
                break;
            }
        }
        if others_empty {
            debug!(target: "strata::dxl", table = %table.id, group = %table.group, "fast truncate");
            return self.store.truncate_group(session, &ais, table.group);
        }

        // Deletion needs every index column; tables without a key need the whole row
        let columns = if table.primary_key().is_some() {
            ColumnRequest::columns(&table.key_positions())
        } else {
            ColumnRequest::All
        };
        let id = self.open_cursor(session, ais.generation(), ScanRequest::new(table.id).with_columns(columns))?;
        let mut deleter = RowDeleter {
            store: self.store.as_ref(),
            session,
            table,
            deleted: 0,
        };
        let scanned = self.scan_some_rows(session, id, &mut deleter, &NoScanHooks);
        let closed = self.close_cursor(session, id);
        debug!(target: "strata::dxl", table = %table.id, deleted = deleter.deleted, "row by row truncate");
        scanned?;
        closed
    }
}

impl std::fmt::Debug for DmlFunctions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmlFunctions")
            .field("open_cursors", &self.cursors.len())
            .finish()
    }
}
