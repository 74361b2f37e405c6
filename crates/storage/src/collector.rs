//! Snapshot row collector
//!
//! Rows are captured, ordered, filtered and projected when the collector is
//! created, so a scan never sees changes made after it started. A collector
//! can be armed to fail with a storage rollback after a number of rows, which
//! is how tests exercise the scan loop's rollback path.

use std::collections::VecDeque;
use strata_core::error::{DxlError, Result};
use strata_core::row::{NewRow, RowData};
use strata_core::scan::MessageBuffer;
use strata_core::traits::RowCollector;
use strata_core::types::{IndexId, TableId};

/// Collector over a row snapshot
#[derive(Debug)]
pub struct MemoryRowCollector {
    table: TableId,
    index: Option<IndexId>,
    rows: VecDeque<NewRow>,
    pending: Option<RowData>,
    checks_limit: bool,
    rollback_after: Option<usize>,
    produced: usize,
    opened: bool,
    closed: bool,
}

impl MemoryRowCollector {
    /// Collector producing `rows` in order
    pub fn new(table: TableId, index: Option<IndexId>, rows: Vec<NewRow>, checks_limit: bool) -> Self {
        Self {
            table,
            index,
            rows: rows.into(),
            pending: None,
            checks_limit,
            rollback_after: None,
            produced: 0,
            opened: false,
            closed: false,
        }
    }

    /// Fail with a storage rollback once `rows` rows were produced
    pub fn fail_after(mut self, rows: usize) -> Self {
        self.rollback_after = Some(rows);
        self
    }

    /// Rows still to produce
    pub fn remaining(&self) -> usize {
        self.rows.len() + usize::from(self.pending.is_some())
    }

    fn next_row(&mut self) -> Result<Option<NewRow>> {
        if !self.opened {
            return Err(DxlError::invalid_operation("row collector used before open"));
        }
        if self.closed {
            return Ok(None);
        }
        if self.rollback_after == Some(self.produced) {
            self.rollback_after = None;
            return Err(DxlError::rollback(format!(
                "scan of table {} rolled back after {} rows",
                self.table, self.produced
            )));
        }
        let row = self.rows.pop_front();
        if row.is_some() {
            self.produced += 1;
        }
        Ok(row)
    }
}

impl RowCollector for MemoryRowCollector {
    fn open(&mut self) -> Result<()> {
        if self.opened {
            return Err(DxlError::invalid_operation("row collector opened twice"));
        }
        self.opened = true;
        Ok(())
    }

    fn has_more(&self) -> bool {
        !self.closed && (self.pending.is_some() || !self.rows.is_empty())
    }

    fn collect_next_row(&mut self) -> Result<Option<NewRow>> {
        if let Some(frame) = self.pending.take() {
            return frame.decode().map(Some);
        }
        self.next_row()
    }

    fn collect_next_row_into(&mut self, buffer: &mut MessageBuffer) -> Result<bool> {
        let frame = match self.pending.take() {
            Some(frame) => frame,
            None => match self.next_row()? {
                Some(row) => RowData::encode(&row)?,
                None => return Ok(false),
            },
        };
        if buffer.try_append(&frame) {
            Ok(true)
        } else {
            self.pending = Some(frame);
            Ok(false)
        }
    }

    fn checks_limit(&self) -> bool {
        self.checks_limit
    }

    fn table_id(&self) -> TableId {
        self.table
    }

    fn index_id(&self) -> Option<IndexId> {
        self.index
    }

    fn close(&mut self) {
        self.closed = true;
        self.rows.clear();
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::value::Value;

    fn rows(n: i64) -> Vec<NewRow> {
        (0..n)
            .map(|i| NewRow::from_values(TableId(1), vec![Value::Int(i), Value::from("x")]))
            .collect()
    }

    #[test]
    fn test_requires_open() {
        let mut c = MemoryRowCollector::new(TableId(1), None, rows(1), false);
        assert!(c.collect_next_row().is_err());
        c.open().unwrap();
        assert!(c.open().is_err());
        assert!(c.collect_next_row().unwrap().is_some());
        assert!(!c.has_more());
        assert!(c.collect_next_row().unwrap().is_none());
    }

    #[test]
    fn test_row_that_does_not_fit_is_kept() {
        let mut c = MemoryRowCollector::new(TableId(1), None, rows(2), false);
        c.open().unwrap();
        let one = RowData::encode(&rows(1)[0]).unwrap().len();
        let mut buf = MessageBuffer::with_capacity(one + one / 2);
        assert!(c.collect_next_row_into(&mut buf).unwrap());
        assert!(!c.collect_next_row_into(&mut buf).unwrap());
        assert!(c.has_more());
        assert_eq!(c.remaining(), 1);

        let mut bigger = MessageBuffer::with_capacity(one * 4);
        assert!(c.collect_next_row_into(&mut bigger).unwrap());
        assert_eq!(bigger.rows().unwrap()[0].get(0), &Value::Int(1));
        assert!(!c.has_more());
    }

    #[test]
    fn test_injected_rollback_fires_once() {
        let mut c = MemoryRowCollector::new(TableId(1), None, rows(3), false).fail_after(1);
        c.open().unwrap();
        assert!(c.collect_next_row().unwrap().is_some());
        assert!(c.collect_next_row().unwrap_err().is_rollback());
        assert!(c.collect_next_row().unwrap().is_some());
    }

    #[test]
    fn test_close_drops_rows() {
        let mut c = MemoryRowCollector::new(TableId(1), Some(IndexId(2)), rows(3), true);
        c.open().unwrap();
        c.close();
        assert!(!c.has_more());
        assert!(c.collect_next_row().unwrap().is_none());
        assert!(c.checks_limit());
        assert_eq!(c.index_id(), Some(IndexId(2)));
    }
}
