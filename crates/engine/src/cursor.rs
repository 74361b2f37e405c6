//! Cursors and their registry entries
//!
//! ## State machine
//!
//! ```text
//! Fresh ──► Scanning ──► Finished ──────────────┐
//!   │          │                                 ├──► Closed
//!   └──────────┴──► ConcurrentModification ──────┤
//!   └──────────┴──► DdlModification ─────────────┘
//! ```
//!
//! Only Fresh and Scanning cursors can be invalidated, and the first marker
//! wins. State changes are compare-and-swap on an atomic so invalidation from
//! another session never blocks on a running scan.

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use strata_core::error::{DxlError, Result};
use strata_core::row::ColumnSet;
use strata_core::scan::{ScanLimit, ScanRequest};
use strata_core::traits::RowCollector;
use strata_core::types::{CursorId, GroupId};

/// Cursor lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CursorState {
    /// Opened, not scanned yet
    Fresh,
    /// At least one `scan_some` ran
    Scanning,
    /// Collector exhausted or limit reached
    Finished,
    /// Scanned rows were updated while the cursor was open
    ConcurrentModification,
    /// A scanned table's definition changed while the cursor was open
    DdlModification,
    /// Released
    Closed,
    /// No cursor under this id; reported, never stored
    Unknown,
}

impl CursorState {
    fn to_u8(self) -> u8 {
        match self {
            CursorState::Fresh => 0,
            CursorState::Scanning => 1,
            CursorState::Finished => 2,
            CursorState::ConcurrentModification => 3,
            CursorState::DdlModification => 4,
            CursorState::Closed => 5,
            CursorState::Unknown => 6,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => CursorState::Fresh,
            1 => CursorState::Scanning,
            2 => CursorState::Finished,
            3 => CursorState::ConcurrentModification,
            4 => CursorState::DdlModification,
            5 => CursorState::Closed,
            _ => CursorState::Unknown,
        }
    }

    /// Fresh or Scanning
    pub fn is_active(&self) -> bool {
        matches!(self, CursorState::Fresh | CursorState::Scanning)
    }

    /// Invalidated by an update or a DDL change
    pub fn is_invalidated(&self) -> bool {
        matches!(
            self,
            CursorState::ConcurrentModification | CursorState::DdlModification
        )
    }
}

impl fmt::Display for CursorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CursorState::Fresh => "FRESH",
            CursorState::Scanning => "SCANNING",
            CursorState::Finished => "FINISHED",
            CursorState::ConcurrentModification => "CONCURRENT_MODIFICATION",
            CursorState::DdlModification => "DDL_MODIFICATION",
            CursorState::Closed => "CLOSED",
            CursorState::Unknown => "UNKNOWN_CURSOR",
        };
        f.write_str(s)
    }
}

/// Open scan over one table
pub struct Cursor {
    state: AtomicU8,
    collector: Mutex<Option<Box<dyn RowCollector>>>,
    rows: AtomicU64,
    request: ScanRequest,
}

impl Cursor {
    /// Cursor owning an opened collector
    pub fn new(collector: Box<dyn RowCollector>, request: ScanRequest) -> Self {
        Self {
            state: AtomicU8::new(CursorState::Fresh.to_u8()),
            collector: Mutex::new(Some(collector)),
            rows: AtomicU64::new(0),
            request,
        }
    }

    /// Current state
    pub fn state(&self) -> CursorState {
        CursorState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: CursorState, to: CursorState) -> bool {
        self.state
            .compare_exchange(from.to_u8(), to.to_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Move to `to` if the cursor is Fresh or Scanning; false otherwise
    fn from_active(&self, to: CursorState) -> bool {
        self.transition(CursorState::Fresh, to) || self.transition(CursorState::Scanning, to)
    }

    /// Fresh or Scanning → Scanning
    pub fn set_scanning(&self) -> bool {
        self.from_active(CursorState::Scanning)
    }

    /// Fresh or Scanning → Finished
    pub fn set_finished(&self) -> bool {
        self.from_active(CursorState::Finished)
    }

    /// Mark ConcurrentModification unless already invalidated or done
    pub fn set_scan_modified(&self) -> bool {
        self.from_active(CursorState::ConcurrentModification)
    }

    /// Mark DdlModification unless already invalidated or done
    pub fn set_ddl_modified(&self) -> bool {
        self.from_active(CursorState::DdlModification)
    }

    /// Finished
    pub fn is_finished(&self) -> bool {
        self.state() == CursorState::Finished
    }

    /// Closed
    pub fn is_closed(&self) -> bool {
        self.state() == CursorState::Closed
    }

    /// Rows produced so far over every `scan_some` call
    pub fn rows_scanned(&self) -> u64 {
        self.rows.load(Ordering::Relaxed)
    }

    pub(crate) fn add_rows(&self, count: u64) {
        self.rows.fetch_add(count, Ordering::Relaxed);
    }

    /// Originating request
    pub fn request(&self) -> &ScanRequest {
        &self.request
    }

    /// Limit of the originating request
    pub fn limit(&self) -> &Arc<dyn ScanLimit> {
        self.request.limit()
    }

    /// Run `f` with exclusive access to the collector
    pub fn with_collector<T>(&self, f: impl FnOnce(&mut dyn RowCollector) -> Result<T>) -> Result<T> {
        let mut guard = self.collector.lock();
        let collector = guard
            .as_mut()
            .ok_or_else(|| DxlError::invalid_operation("cursor has no row collector"))?;
        f(collector.as_mut())
    }

    /// Release the collector; idempotent
    pub fn close(&self) {
        self.state
            .store(CursorState::Closed.to_u8(), Ordering::Release);
        if let Some(mut collector) = self.collector.lock().take() {
            collector.close();
        }
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("state", &self.state())
            .field("rows", &self.rows_scanned())
            .field("request", &self.request)
            .finish()
    }
}

/// Registry entry for one cursor
#[derive(Debug)]
pub struct ScanData {
    id: CursorId,
    cursor: Cursor,
    columns: OnceCell<ColumnSet>,
    scan_all: bool,
    generation: u64,
    group: GroupId,
    index_positions: Vec<usize>,
}

impl ScanData {
    /// Entry for a cursor opened at schema `generation`
    ///
    /// `index_positions` are the scanned table's positions in the cursor's
    /// index, or its primary key when no index was requested.
    pub fn new(
        id: CursorId,
        cursor: Cursor,
        generation: u64,
        group: GroupId,
        index_positions: Vec<usize>,
    ) -> Self {
        let scan_all = cursor.request().columns().is_all();
        Self {
            id,
            cursor,
            columns: OnceCell::new(),
            scan_all,
            generation,
            group,
            index_positions,
        }
    }

    /// Cursor id
    pub fn id(&self) -> CursorId {
        self.id
    }

    /// The cursor
    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    /// Requested columns, decoded on first use
    pub fn scan_columns(&self, column_count: usize) -> &ColumnSet {
        self.columns
            .get_or_init(|| self.cursor.request().columns().resolve(column_count))
    }

    /// Request asked for every column
    pub fn scan_all(&self) -> bool {
        self.scan_all
    }

    /// Schema generation the cursor was opened at
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Group of the scanned table
    pub fn group(&self) -> GroupId {
        self.group
    }

    /// Index positions within the scanned table
    pub fn index_positions(&self) -> &[usize] {
        &self.index_positions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::row::NewRow;
    use strata_core::scan::{ColumnRequest, MessageBuffer};
    use strata_core::types::{IndexId, SessionId, TableId};

    #[derive(Debug, Default)]
    struct StubCollector {
        closed: Arc<AtomicU8>,
    }

    impl RowCollector for StubCollector {
        fn open(&mut self) -> Result<()> {
            Ok(())
        }
        fn has_more(&self) -> bool {
            false
        }
        fn collect_next_row(&mut self) -> Result<Option<NewRow>> {
            Ok(None)
        }
        fn collect_next_row_into(&mut self, _buffer: &mut MessageBuffer) -> Result<bool> {
            Ok(false)
        }
        fn checks_limit(&self) -> bool {
            false
        }
        fn table_id(&self) -> TableId {
            TableId(1)
        }
        fn index_id(&self) -> Option<IndexId> {
            None
        }
        fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn cursor() -> (Cursor, Arc<AtomicU8>) {
        let closed = Arc::new(AtomicU8::new(0));
        let collector = StubCollector {
            closed: Arc::clone(&closed),
        };
        (Cursor::new(Box::new(collector), ScanRequest::new(TableId(1))), closed)
    }

    #[test]
    fn test_fresh_to_finished() {
        let (c, _) = cursor();
        assert_eq!(c.state(), CursorState::Fresh);
        assert!(c.set_scanning());
        assert!(c.set_scanning());
        assert!(c.set_finished());
        assert!(!c.set_scanning());
        assert!(c.is_finished());
    }

    #[test]
    fn test_first_invalidation_wins() {
        let (c, _) = cursor();
        assert!(c.set_ddl_modified());
        assert!(!c.set_scan_modified());
        assert_eq!(c.state(), CursorState::DdlModification);
        assert!(!c.set_scanning());
    }

    #[test]
    fn test_terminal_states_are_inert() {
        let (c, _) = cursor();
        c.set_finished();
        assert!(!c.set_scan_modified());
        assert!(!c.set_ddl_modified());
        assert_eq!(c.state(), CursorState::Finished);
    }

    #[test]
    fn test_close_releases_collector_once() {
        let (c, closed) = cursor();
        c.close();
        c.close();
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert!(c.is_closed());
        assert!(c.with_collector(|rc| Ok(rc.has_more())).is_err());
    }

    #[test]
    fn test_scan_columns_resolved_lazily() {
        let collector = StubCollector::default();
        let request = ScanRequest::new(TableId(1)).with_columns(ColumnRequest::columns(&[0, 2]));
        let data = ScanData::new(
            CursorId::new(SessionId::new(1), 1, TableId(1)),
            Cursor::new(Box::new(collector), request),
            3,
            GroupId(1),
            vec![0],
        );
        assert!(!data.scan_all());
        assert_eq!(data.scan_columns(4).iter().collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(data.generation(), 3);

        let all = ScanData::new(
            CursorId::new(SessionId::new(1), 2, TableId(1)),
            Cursor::new(Box::new(StubCollector::default()), ScanRequest::new(TableId(1))),
            3,
            GroupId(1),
            vec![0],
        );
        assert!(all.scan_all());
        assert_eq!(all.scan_columns(3).len(), 3);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(CursorState::ConcurrentModification.to_string(), "CONCURRENT_MODIFICATION");
        assert!(CursorState::DdlModification.is_invalidated());
        assert!(CursorState::Fresh.is_active());
    }
}
