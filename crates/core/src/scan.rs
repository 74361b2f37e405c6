//! Scan requests, limits and output buffers
//!
//! A [`ScanRequest`] is immutable once built. It names the table, the index
//! to scan (primary key when absent), optional start and end bounds, the
//! direction, the requested columns and a [`ScanLimit`].
//!
//! Requested columns are either [`ColumnRequest::All`] or an explicit bitmap.
//! `All` is resolved against the table definition when the cursor is used, so
//! it stays correct whatever the column count.

use crate::error::{DxlError, Result};
use crate::row::{ColumnSet, NewRow, RowData};
use crate::types::{IndexId, TableId};
use std::fmt;
use std::sync::Arc;

// ============================================================================
// Limits
// ============================================================================

/// Early termination policy for a scan
///
/// Consulted before each row is pulled. Implementations must be stateless
/// with respect to a single scan: the row count is supplied by the caller.
pub trait ScanLimit: Send + Sync + fmt::Debug {
    /// True when no further row may be produced
    fn limit_reached(&self, rows_so_far: u64) -> bool;

    /// Plain row count limit, if this policy is one
    ///
    /// Row collectors that check limits natively use this value.
    fn row_count_limit(&self) -> Option<u64> {
        None
    }
}

/// No limit
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLimit;

impl ScanLimit for NoLimit {
    fn limit_reached(&self, _rows_so_far: u64) -> bool {
        false
    }
}

/// Stop after a fixed number of rows
#[derive(Debug, Clone, Copy)]
pub struct FixedCountLimit(pub u64);

impl ScanLimit for FixedCountLimit {
    fn limit_reached(&self, rows_so_far: u64) -> bool {
        rows_so_far >= self.0
    }

    fn row_count_limit(&self) -> Option<u64> {
        Some(self.0)
    }
}

// ============================================================================
// Requests
// ============================================================================

/// Columns a scan returns
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnRequest {
    /// Every column of the table
    All,
    /// Packed column bitmap, see [`ColumnSet::from_bitmap`]
    Bitmap(Vec<u8>),
}

impl ColumnRequest {
    /// Explicit request for the given positions
    pub fn columns(positions: &[usize]) -> Self {
        ColumnRequest::Bitmap(positions.iter().copied().collect::<ColumnSet>().to_bitmap())
    }

    /// True for [`ColumnRequest::All`]
    pub fn is_all(&self) -> bool {
        matches!(self, ColumnRequest::All)
    }

    /// Resolve against a table with `column_count` columns
    pub fn resolve(&self, column_count: usize) -> ColumnSet {
        match self {
            ColumnRequest::All => ColumnSet::all(column_count),
            ColumnRequest::Bitmap(bitmap) => ColumnSet::from_bitmap(bitmap),
        }
    }
}

/// One end of a scan range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanBound {
    /// Bound values, positioned like a table row
    pub row: NewRow,
    /// Positions of `row` that take part in the bound
    pub columns: ColumnSet,
    /// Whether rows equal to the bound are included
    pub inclusive: bool,
}

impl ScanBound {
    /// Inclusive bound
    pub fn inclusive(row: NewRow, columns: ColumnSet) -> Self {
        Self {
            row,
            columns,
            inclusive: true,
        }
    }

    /// Exclusive bound
    pub fn exclusive(row: NewRow, columns: ColumnSet) -> Self {
        Self {
            row,
            columns,
            inclusive: false,
        }
    }
}

/// Immutable description of a scan
#[derive(Clone)]
pub struct ScanRequest {
    table: TableId,
    index: Option<IndexId>,
    start: Option<ScanBound>,
    end: Option<ScanBound>,
    descending: bool,
    columns: ColumnRequest,
    limit: Arc<dyn ScanLimit>,
}

impl ScanRequest {
    /// Full scan of `table`, all columns, no limit
    pub fn new(table: TableId) -> Self {
        Self {
            table,
            index: None,
            start: None,
            end: None,
            descending: false,
            columns: ColumnRequest::All,
            limit: Arc::new(NoLimit),
        }
    }

    /// Scan through `index`
    pub fn with_index(mut self, index: IndexId) -> Self {
        self.index = Some(index);
        self
    }

    /// Lower bound (in index order)
    pub fn with_start(mut self, bound: ScanBound) -> Self {
        self.start = Some(bound);
        self
    }

    /// Upper bound (in index order)
    pub fn with_end(mut self, bound: ScanBound) -> Self {
        self.end = Some(bound);
        self
    }

    /// Produce rows in descending index order
    pub fn descending(mut self) -> Self {
        self.descending = true;
        self
    }

    /// Requested columns
    pub fn with_columns(mut self, columns: ColumnRequest) -> Self {
        self.columns = columns;
        self
    }

    /// Scan limit
    pub fn with_limit(mut self, limit: Arc<dyn ScanLimit>) -> Self {
        self.limit = limit;
        self
    }

    /// Scanned table
    pub fn table_id(&self) -> TableId {
        self.table
    }

    /// Scanned index, `None` for the primary key
    pub fn index_id(&self) -> Option<IndexId> {
        self.index
    }

    /// Lower bound
    pub fn start(&self) -> Option<&ScanBound> {
        self.start.as_ref()
    }

    /// Upper bound
    pub fn end(&self) -> Option<&ScanBound> {
        self.end.as_ref()
    }

    /// Descending order requested
    pub fn is_descending(&self) -> bool {
        self.descending
    }

    /// Requested columns
    pub fn columns(&self) -> &ColumnRequest {
        &self.columns
    }

    /// Scan limit
    pub fn limit(&self) -> &Arc<dyn ScanLimit> {
        &self.limit
    }
}

impl fmt::Debug for ScanRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanRequest")
            .field("table", &self.table)
            .field("index", &self.index)
            .field("start", &self.start)
            .field("end", &self.end)
            .field("descending", &self.descending)
            .field("columns", &self.columns)
            .field("limit", &self.limit)
            .finish()
    }
}

// ============================================================================
// Message buffer
// ============================================================================

/// Capacity-bounded buffer of concatenated row frames
///
/// Grows on demand up to its capacity. A mark taken before a scan lets the
/// scan loop discard partially written output.
#[derive(Debug, Clone)]
pub struct MessageBuffer {
    bytes: Vec<u8>,
    capacity: usize,
    mark: usize,
}

impl MessageBuffer {
    /// Empty buffer holding at most `capacity` bytes
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::new(),
            capacity,
            mark: 0,
        }
    }

    /// Append a frame; false if it does not fit
    pub fn try_append(&mut self, frame: &RowData) -> bool {
        if frame.len() > self.remaining() {
            return false;
        }
        self.bytes.extend_from_slice(frame.as_bytes());
        true
    }

    /// Remember the current position
    pub fn mark(&mut self) {
        self.mark = self.bytes.len();
    }

    /// Drop everything written since the last mark
    pub fn rewind(&mut self) {
        self.bytes.truncate(self.mark);
    }

    /// Bytes still available
    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.bytes.len())
    }

    /// Maximum size
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Written bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Number of written bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Nothing written
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Discard all content
    pub fn clear(&mut self) {
        self.bytes.clear();
        self.mark = 0;
    }

    /// Split the content into frames
    pub fn frames(&self) -> Result<Vec<RowData>> {
        RowData::split_frames(&self.bytes)
    }

    /// Decode every frame
    pub fn rows(&self) -> Result<Vec<NewRow>> {
        self.frames()?.iter().map(RowData::decode).collect()
    }
}

/// Validate a bitmap against a table width
pub fn check_bitmap(table: TableId, columns: &ColumnSet, column_count: usize) -> Result<()> {
    match columns.max() {
        Some(max) if max >= column_count => Err(DxlError::NoSuchColumn {
            table,
            column: max.to_string(),
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn frame(v: i64) -> RowData {
        RowData::encode(&NewRow::from_values(TableId(1), vec![Value::Int(v)])).unwrap()
    }

    #[test]
    fn test_fixed_count_limit() {
        let limit = FixedCountLimit(2);
        assert!(!limit.limit_reached(1));
        assert!(limit.limit_reached(2));
        assert_eq!(limit.row_count_limit(), Some(2));
        assert_eq!(NoLimit.row_count_limit(), None);
        assert!(!NoLimit.limit_reached(u64::MAX));
    }

    #[test]
    fn test_column_request_resolution() {
        assert_eq!(ColumnRequest::All.resolve(3), ColumnSet::all(3));
        let explicit = ColumnRequest::columns(&[0, 1, 2]);
        assert_eq!(explicit.resolve(3), ColumnSet::all(3));
        assert!(!explicit.is_all());
    }

    #[test]
    fn test_request_builder() {
        let req = ScanRequest::new(TableId(2))
            .with_index(IndexId(5))
            .descending()
            .with_columns(ColumnRequest::columns(&[1]))
            .with_limit(Arc::new(FixedCountLimit(10)));
        assert_eq!(req.table_id(), TableId(2));
        assert_eq!(req.index_id(), Some(IndexId(5)));
        assert!(req.is_descending());
        assert_eq!(req.limit().row_count_limit(), Some(10));
        assert!(req.start().is_none());
    }

    #[test]
    fn test_buffer_capacity_and_rewind() {
        let one = frame(1);
        let mut buf = MessageBuffer::with_capacity(one.len() * 2);
        assert!(buf.try_append(&one));
        buf.mark();
        assert!(buf.try_append(&frame(2)));
        assert!(!buf.try_append(&frame(3)));
        assert_eq!(buf.frames().unwrap().len(), 2);

        buf.rewind();
        assert_eq!(buf.rows().unwrap(), vec![NewRow::from_values(TableId(1), vec![Value::Int(1)])]);
        buf.clear();
        assert!(buf.is_empty());
    }

    #[test]
    fn test_check_bitmap() {
        let cols: ColumnSet = [0usize, 4].into_iter().collect();
        assert!(check_bitmap(TableId(1), &cols, 5).is_ok());
        assert!(matches!(
            check_bitmap(TableId(1), &cols, 4),
            Err(DxlError::NoSuchColumn { .. })
        ));
    }
}
