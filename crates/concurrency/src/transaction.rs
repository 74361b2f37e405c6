//! Automatic transaction demarcation
//!
//! [`TransactionHook`] opens a transaction around an operation when the
//! session has none, and closes it again afterwards:
//!
//! - enter: no active transaction → begin, push `true`; otherwise push `false`
//! - on_failure: marker `true` and still active → roll back (unless a
//!   rollback is already pending) and end
//! - exit: pop the marker; `true` and still active → commit, then end
//!   whatever the commit outcome
//!
//! Nested operations on the same session therefore run inside the outermost
//! operation's transaction. The marker is popped exactly once per successful
//! enter.

use crate::hook::DxlHook;
use std::fmt;
use std::sync::Arc;
use strata_core::error::{DxlError, Result};
use strata_core::function::DxlFunction;
use strata_core::session::Session;
use strata_core::traits::TransactionService;
use tracing::debug;

/// Hook beginning and ending transactions around operations
pub struct TransactionHook {
    txn: Arc<dyn TransactionService>,
}

impl TransactionHook {
    /// Hook over a transaction service
    pub fn new(txn: Arc<dyn TransactionService>) -> Self {
        Self { txn }
    }
}

fn combine(first: Result<()>, second: Result<()>) -> Result<()> {
    let errors: Vec<DxlError> = [first, second].into_iter().filter_map(|r| r.err()).collect();
    match DxlError::aggregate(errors) {
        None => Ok(()),
        Some(e) => Err(e),
    }
}

impl DxlHook for TransactionHook {
    fn name(&self) -> &'static str {
        "transaction"
    }

    fn enter(&self, session: &mut Session, function: DxlFunction) -> Result<()> {
        if self.txn.is_transaction_active(session) {
            session.push_txn_marker(false);
            return Ok(());
        }
        self.txn.begin_transaction(session)?;
        session.push_txn_marker(true);
        debug!(target: "strata::txn", session = %session.id(), %function, "began transaction");
        Ok(())
    }

    fn on_failure(&self, session: &mut Session, function: DxlFunction, error: &DxlError) -> Result<()> {
        if session.peek_txn_marker() != Some(true) || !self.txn.is_transaction_active(session) {
            return Ok(());
        }
        let rollback = if self.txn.is_rollback_pending(session) {
            Ok(())
        } else {
            self.txn.rollback_transaction(session)
        };
        let end = self.txn.end_transaction(session);
        debug!(target: "strata::txn", session = %session.id(), %function, cause = %error, "rolled back transaction");
        combine(rollback, end)
    }

    fn exit(&self, session: &mut Session, function: DxlFunction, _error: Option<&DxlError>) -> Result<()> {
        let began = session
            .pop_txn_marker()
            .ok_or_else(|| DxlError::protocol("transaction exit without matching enter"))?;
        if !began || !self.txn.is_transaction_active(session) {
            return Ok(());
        }
        let commit = self.txn.commit_transaction(session);
        let end = self.txn.end_transaction(session);
        debug!(target: "strata::txn", session = %session.id(), %function, committed = commit.is_ok(), "ended transaction");
        combine(commit, end)
    }
}

impl fmt::Debug for TransactionHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionHook").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct FakeTxn {
        active: Mutex<bool>,
        rollback_pending: Mutex<bool>,
        fail_commit: bool,
        calls: Mutex<Vec<&'static str>>,
    }

    impl TransactionService for FakeTxn {
        fn is_transaction_active(&self, _s: &Session) -> bool {
            *self.active.lock()
        }
        fn is_rollback_pending(&self, _s: &Session) -> bool {
            *self.rollback_pending.lock()
        }
        fn begin_transaction(&self, _s: &Session) -> Result<()> {
            self.calls.lock().push("begin");
            *self.active.lock() = true;
            Ok(())
        }
        fn commit_transaction(&self, _s: &Session) -> Result<()> {
            self.calls.lock().push("commit");
            if self.fail_commit {
                return Err(DxlError::rollback("commit conflict"));
            }
            Ok(())
        }
        fn rollback_transaction(&self, _s: &Session) -> Result<()> {
            self.calls.lock().push("rollback");
            Ok(())
        }
        fn end_transaction(&self, _s: &Session) -> Result<()> {
            self.calls.lock().push("end");
            *self.active.lock() = false;
            Ok(())
        }
    }

    fn hook(fake: &Arc<FakeTxn>) -> TransactionHook {
        TransactionHook::new(Arc::clone(fake) as Arc<dyn TransactionService>)
    }

    #[test]
    fn test_begins_and_commits_when_none_active() {
        let fake = Arc::new(FakeTxn::default());
        let h = hook(&fake);
        let mut s = Session::new();
        h.enter(&mut s, DxlFunction::WriteRow).unwrap();
        assert_eq!(s.peek_txn_marker(), Some(true));
        h.exit(&mut s, DxlFunction::WriteRow, None).unwrap();
        assert_eq!(*fake.calls.lock(), vec!["begin", "commit", "end"]);
        assert_eq!(s.txn_marker_depth(), 0);
    }

    #[test]
    fn test_nested_operation_reuses_transaction() {
        let fake = Arc::new(FakeTxn::default());
        let h = hook(&fake);
        let mut s = Session::new();
        h.enter(&mut s, DxlFunction::TruncateTable).unwrap();
        h.enter(&mut s, DxlFunction::DeleteRow).unwrap();
        assert_eq!(s.peek_txn_marker(), Some(false));
        h.exit(&mut s, DxlFunction::DeleteRow, None).unwrap();
        assert_eq!(*fake.calls.lock(), vec!["begin"]);
        h.exit(&mut s, DxlFunction::TruncateTable, None).unwrap();
        assert_eq!(*fake.calls.lock(), vec!["begin", "commit", "end"]);
    }

    #[test]
    fn test_failure_rolls_back_and_exit_does_not_commit() {
        let fake = Arc::new(FakeTxn::default());
        let h = hook(&fake);
        let mut s = Session::new();
        h.enter(&mut s, DxlFunction::WriteRow).unwrap();
        let err = DxlError::BufferFull;
        h.on_failure(&mut s, DxlFunction::WriteRow, &err).unwrap();
        h.exit(&mut s, DxlFunction::WriteRow, Some(&err)).unwrap();
        assert_eq!(*fake.calls.lock(), vec!["begin", "rollback", "end"]);
        assert_eq!(s.txn_marker_depth(), 0);
    }

    #[test]
    fn test_pending_rollback_is_not_repeated() {
        let fake = Arc::new(FakeTxn::default());
        let h = hook(&fake);
        let mut s = Session::new();
        h.enter(&mut s, DxlFunction::UpdateRow).unwrap();
        *fake.rollback_pending.lock() = true;
        h.on_failure(&mut s, DxlFunction::UpdateRow, &DxlError::BufferFull).unwrap();
        assert_eq!(*fake.calls.lock(), vec!["begin", "end"]);
    }

    #[test]
    fn test_commit_failure_still_ends() {
        let fake = Arc::new(FakeTxn {
            fail_commit: true,
            ..FakeTxn::default()
        });
        let h = hook(&fake);
        let mut s = Session::new();
        h.enter(&mut s, DxlFunction::WriteRow).unwrap();
        let err = h.exit(&mut s, DxlFunction::WriteRow, None).unwrap_err();
        assert!(err.is_rollback());
        assert_eq!(*fake.calls.lock(), vec!["begin", "commit", "end"]);
        assert!(!*fake.active.lock());
    }

    #[test]
    fn test_exit_without_enter_is_protocol_violation() {
        let fake = Arc::new(FakeTxn::default());
        let h = hook(&fake);
        let mut s = Session::new();
        let err = h.exit(&mut s, DxlFunction::GetAis, None).unwrap_err();
        assert!(err.is_fatal());
    }
}
