//! Hook chain run around every DXL operation
//!
//! ## Protocol
//!
//! ```text
//! enter(h1) .. enter(hN)          stop at the first failure, k hooks entered
//! body                            only if every enter succeeded
//! on_failure(hk) .. on_failure(h1) if an enter or the body failed
//! exit(hk) .. exit(h1)            always, over the entered prefix only
//! ```
//!
//! A hook whose `enter` failed never sees `on_failure` or `exit`; it must
//! undo its own partial work before returning the error.
//!
//! Every cleanup call runs even when an earlier one failed. Errors are
//! combined as follows:
//!
//! - operation failed, no cleanup error: the operation error
//! - operation failed, cleanup errors: `Aggregate` of operation error then cleanup errors
//! - operation succeeded, one cleanup error: that error
//! - operation succeeded, several cleanup errors: `Aggregate` of them
//!
//! While cleanup runs, the number of entered hooks sits in the session's
//! single-slot registry, readable through [`HookChain::entered_hooks`]. A
//! nested run restores the outer count when it returns and the outermost run
//! removes it, so nothing survives between two calls on the same session.

use std::fmt;
use std::sync::Arc;
use strata_core::error::{DxlError, Result};
use strata_core::function::DxlFunction;
use strata_core::session::{Key, Session};
use tracing::{trace, warn};

static ENTERED: Key<usize> = Key::new("hook_chain.entered");

/// Interceptor invoked around DXL operations
pub trait DxlHook: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Called before the operation
    fn enter(&self, session: &mut Session, function: DxlFunction) -> Result<()>;

    /// Called after a failed enter or operation, before `exit`
    fn on_failure(&self, session: &mut Session, function: DxlFunction, error: &DxlError) -> Result<()>;

    /// Called after the operation, with its error if it failed
    fn exit(&self, session: &mut Session, function: DxlFunction, error: Option<&DxlError>) -> Result<()>;
}

/// Ordered list of hooks
#[derive(Clone, Default)]
pub struct HookChain {
    hooks: Vec<Arc<dyn DxlHook>>,
}

impl HookChain {
    /// Empty chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Chain over `hooks`, entered in the given order
    pub fn with_hooks(hooks: Vec<Arc<dyn DxlHook>>) -> Self {
        Self { hooks }
    }

    /// Append a hook; it is entered last and exited first
    pub fn push(&mut self, hook: Arc<dyn DxlHook>) {
        self.hooks.push(hook);
    }

    /// Number of hooks
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// No hooks
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Hook names in enter order
    pub fn names(&self) -> Vec<&'static str> {
        self.hooks.iter().map(|h| h.name()).collect()
    }

    /// Hooks entered by the innermost chain run on `session`
    pub fn entered_hooks(session: &Session) -> Option<usize> {
        session.get(&ENTERED).copied()
    }

    /// Run `body` inside the chain
    pub fn run<T>(
        &self,
        session: &mut Session,
        function: DxlFunction,
        body: impl FnOnce(&mut Session) -> Result<T>,
    ) -> Result<T> {
        trace!(target: "strata::dxl", session = %session.id(), %function, "enter");

        let mut entered = 0;
        let mut enter_result = Ok(());
        for hook in &self.hooks {
            if let Err(e) = hook.enter(session, function) {
                trace!(target: "strata::dxl", hook = hook.name(), %function, error = %e, "enter failed");
                enter_result = Err(e);
                break;
            }
            entered += 1;
        }
        let outer = session.put(&ENTERED, entered);

        let result = enter_result.and_then(|()| body(session));
        let prefix = &self.hooks[..entered];
        let mut cleanup = Vec::new();

        if let Err(err) = &result {
            for hook in prefix.iter().rev() {
                if let Err(e) = hook.on_failure(session, function, err) {
                    warn!(target: "strata::dxl", hook = hook.name(), %function, error = %e, "on_failure failed");
                    cleanup.push(e);
                }
            }
        }
        for hook in prefix.iter().rev() {
            if let Err(e) = hook.exit(session, function, result.as_ref().err()) {
                warn!(target: "strata::dxl", hook = hook.name(), %function, error = %e, "exit failed");
                cleanup.push(e);
            }
        }

        match outer {
            Some(count) => session.put(&ENTERED, count),
            None => session.remove(&ENTERED),
        };
        trace!(target: "strata::dxl", session = %session.id(), %function, ok = result.is_ok(), "exit");

        match result {
            Ok(value) => match DxlError::aggregate(cleanup) {
                None => Ok(value),
                Some(e) => Err(e),
            },
            Err(op) if cleanup.is_empty() => Err(op),
            Err(op) => {
                cleanup.insert(0, op);
                Err(DxlError::Aggregate { causes: cleanup })
            }
        }
    }
}

impl fmt::Debug for HookChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookChain").field("hooks", &self.names()).finish()
    }
}
