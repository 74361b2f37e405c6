//! In-memory transaction service
//!
//! One entry per session with an open transaction, kept in a `DashMap`.
//! Row changes made inside a transaction register undo closures; rollback
//! runs them newest first. Changes made outside a transaction are not
//! recorded (auto-commit).

use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use strata_core::error::{DxlError, Result};
use strata_core::session::Session;
use strata_core::traits::TransactionService;
use strata_core::types::SessionId;
use tracing::debug;

/// Compensating action for one row change
pub type Undo = Box<dyn FnOnce() + Send + Sync>;

#[derive(Default)]
struct TxnState {
    rollback_pending: bool,
    undo: Vec<Undo>,
}

/// Counters for tests and diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxnStats {
    /// Transactions begun
    pub begun: u64,
    /// Transactions committed
    pub committed: u64,
    /// Transactions rolled back
    pub rolled_back: u64,
}

/// Transaction service keeping state per session
#[derive(Default)]
pub struct MemoryTransactionService {
    txns: DashMap<SessionId, TxnState>,
    begun: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
}

impl MemoryTransactionService {
    /// Create an empty service
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an undo action for the session's open transaction
    ///
    /// Dropped when the session has no open transaction.
    pub fn record_undo(&self, session: SessionId, undo: Undo) {
        if let Some(mut state) = self.txns.get_mut(&session) {
            state.undo.push(undo);
        }
    }

    /// Mark the open transaction rollback-only
    pub fn mark_rollback_only(&self, session: SessionId) {
        if let Some(mut state) = self.txns.get_mut(&session) {
            state.rollback_pending = true;
        }
    }

    /// Number of sessions with an open transaction
    pub fn active_count(&self) -> usize {
        self.txns.len()
    }

    /// Counters
    pub fn stats(&self) -> TxnStats {
        TxnStats {
            begun: self.begun.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            rolled_back: self.rolled_back.load(Ordering::Relaxed),
        }
    }

    fn run_undo(&self, session: SessionId) {
        // Take the log out first; undo actions must not run under the map guard
        let undo = match self.txns.get_mut(&session) {
            Some(mut state) => {
                state.rollback_pending = true;
                std::mem::take(&mut state.undo)
            }
            None => return,
        };
        let count = undo.len();
        for action in undo.into_iter().rev() {
            action();
        }
        self.rolled_back.fetch_add(1, Ordering::Relaxed);
        debug!(target: "strata::txn", %session, undone = count, "rolled back");
    }
}

impl TransactionService for MemoryTransactionService {
    fn is_transaction_active(&self, session: &Session) -> bool {
        self.txns.contains_key(&session.id())
    }

    fn is_rollback_pending(&self, session: &Session) -> bool {
        self.txns
            .get(&session.id())
            .map_or(false, |s| s.rollback_pending)
    }

    fn begin_transaction(&self, session: &Session) -> Result<()> {
        if self.txns.contains_key(&session.id()) {
            return Err(DxlError::invalid_operation(format!(
                "session {} already has an open transaction",
                session.id()
            )));
        }
        self.txns.insert(session.id(), TxnState::default());
        self.begun.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn commit_transaction(&self, session: &Session) -> Result<()> {
        let pending = match self.txns.get(&session.id()) {
            Some(state) => state.rollback_pending,
            None => {
                return Err(DxlError::invalid_operation(format!(
                    "session {} has no open transaction",
                    session.id()
                )))
            }
        };
        if pending {
            self.run_undo(session.id());
            return Err(DxlError::rollback("transaction is marked rollback-only"));
        }
        if let Some(mut state) = self.txns.get_mut(&session.id()) {
            state.undo.clear();
        }
        self.committed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn rollback_transaction(&self, session: &Session) -> Result<()> {
        if !self.txns.contains_key(&session.id()) {
            return Err(DxlError::invalid_operation(format!(
                "session {} has no open transaction",
                session.id()
            )));
        }
        self.run_undo(session.id());
        Ok(())
    }

    fn end_transaction(&self, session: &Session) -> Result<()> {
        self.txns.remove(&session.id());
        Ok(())
    }
}

impl fmt::Debug for MemoryTransactionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTransactionService")
            .field("active", &self.txns.len())
            .field("stats", &self.stats())
            .finish()
    }
}
