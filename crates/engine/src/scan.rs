//! Scan loop
//!
//! Pulls rows from a cursor's collector into one of two sinks:
//!
//! - message buffer: raw row frames appended to a [`MessageBuffer`]; when the
//!   next frame does not fit the call returns with rows still pending
//! - row objects: decoded [`NewRow`]s pushed onto a vector
//!
//! Both consult the request's [`ScanLimit`](strata_core::ScanLimit) before
//! each pull unless the collector enforces the limit itself. The row count
//! given to the limit spans every `scan_some` call on the cursor.
//!
//! A storage rollback during the pull discards everything this call wrote
//! and is reported as `ScanRetryAbandoned`. No retry is attempted. The
//! collector has already consumed the discarded rows, so the cursor is
//! finished: a later `scan_some` fails with `CursorIsFinished` instead of
//! resuming past the gap.

use crate::cursor::{Cursor, ScanData};
use strata_core::error::{DxlError, Result};
use strata_core::row::NewRow;
use strata_core::scan::MessageBuffer;
use strata_core::traits::RowCollector;
use tracing::{trace, warn};

/// Scans retried after a storage rollback before giving up
pub const SCAN_RETRY_BUDGET: u32 = 0;

/// Observation points in the scan loop
///
/// Only used to observe the loop from tests; implementations must not change
/// scan results.
pub trait ScanHooks: Send + Sync {
    /// Top of every loop iteration
    fn loop_start(&self) {}

    /// A row was produced and is about to be recorded
    fn pre_wrote_row(&self) {}

    /// A storage rollback aborted the pull
    fn retry(&self) {}

    /// The call completed without error
    fn finished_well(&self) {}
}

/// Hooks that do nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoScanHooks;

impl ScanHooks for NoScanHooks {}

/// Caller-supplied destination for row objects
pub trait RowOutput {
    /// Accept one row
    fn output(&mut self, row: NewRow) -> Result<()>;
}

impl RowOutput for Vec<NewRow> {
    fn output(&mut self, row: NewRow) -> Result<()> {
        self.push(row);
        Ok(())
    }
}

/// Where a scan writes
pub enum ScanSink<'a> {
    /// Raw row frames
    Buffer(&'a mut MessageBuffer),
    /// Decoded rows
    Rows(&'a mut Vec<NewRow>),
}

impl ScanSink<'_> {
    fn mark(&mut self) -> usize {
        match self {
            ScanSink::Buffer(buffer) => {
                buffer.mark();
                buffer.len()
            }
            ScanSink::Rows(rows) => rows.len(),
        }
    }

    fn rewind(&mut self, mark: usize) {
        match self {
            ScanSink::Buffer(buffer) => buffer.rewind(),
            ScanSink::Rows(rows) => rows.truncate(mark),
        }
    }
}

/// Run one `scan_some` pass over a registered cursor
///
/// Returns whether rows remain. The cursor's state must already have been
/// checked by the caller.
///
/// # Errors
///
/// - `BufferFull` when not even one row fits; the cursor stays usable
/// - `ScanRetryAbandoned` on a storage rollback; the output of this call is
///   discarded and the cursor is finished, since its collector cannot
///   replay the lost rows
pub fn scan_some(data: &ScanData, sink: &mut ScanSink<'_>, hooks: &dyn ScanHooks) -> Result<bool> {
    let cursor = data.cursor();
    let mark = sink.mark();
    let result = cursor.with_collector(|rc| collect(cursor, rc, sink, hooks));

    match result {
        Ok((more, produced)) => {
            cursor.add_rows(produced);
            hooks.finished_well();
            trace!(target: "strata::cursor", cursor = %data.id(), produced, more, "scan_some done");
            Ok(more)
        }
        Err(DxlError::StorageRollback { reason }) => {
            hooks.retry();
            sink.rewind(mark);
            cursor.set_finished();
            warn!(target: "strata::cursor", cursor = %data.id(), %reason, "scan rolled back");
            Err(DxlError::ScanRetryAbandoned {
                cursor: data.id(),
                retries: SCAN_RETRY_BUDGET,
                reason,
            })
        }
        Err(DxlError::BufferFull) => Err(DxlError::BufferFull),
        Err(e) => {
            cursor.set_finished();
            Err(e)
        }
    }
}

/// Returns (rows remain, rows produced)
fn collect(
    cursor: &Cursor,
    rc: &mut dyn RowCollector,
    sink: &mut ScanSink<'_>,
    hooks: &dyn ScanHooks,
) -> Result<(bool, u64)> {
    if cursor.is_closed() {
        return Err(DxlError::invalid_operation("scan of a closed cursor"));
    }
    if !rc.has_more() {
        cursor.set_finished();
        return Ok((false, 0));
    }
    cursor.set_scanning();

    let limit = cursor.limit();
    let native = rc.checks_limit();
    let base = cursor.rows_scanned();
    let limit_reached = |produced: u64| !native && limit.limit_reached(base + produced);

    let mut produced = 0u64;
    let mut done = false;
    match sink {
        ScanSink::Buffer(buffer) => {
            while !done {
                hooks.loop_start();
                if limit_reached(produced) {
                    done = true;
                    break;
                }
                if !rc.collect_next_row_into(buffer)? {
                    if rc.has_more() {
                        if produced == 0 {
                            return Err(DxlError::BufferFull);
                        }
                        return Ok((true, produced));
                    }
                    done = true;
                } else {
                    hooks.pre_wrote_row();
                    produced += 1;
                    done = limit_reached(produced) || !rc.has_more();
                }
            }
        }
        ScanSink::Rows(rows) => {
            while !done {
                hooks.loop_start();
                if limit_reached(produced) {
                    done = true;
                    break;
                }
                match rc.collect_next_row()? {
                    None => done = true,
                    Some(row) => {
                        hooks.pre_wrote_row();
                        rows.push(row);
                        produced += 1;
                    }
                }
            }
        }
    }
    cursor.set_finished();
    Ok((false, produced))
}
