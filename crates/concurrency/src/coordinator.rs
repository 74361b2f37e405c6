//! Schema and data lock coordination
//!
//! The [`LockCoordinator`] owns the schema lock and, when enabled, the data
//! lock. Lock modes follow the operation class:
//!
//! | Class | Schema lock | Data lock (optional) |
//! |-------|-------------|----------------------|
//! | DdlWrite | write | - |
//! | DdlRead | read | - |
//! | DmlWrite | read | write |
//! | DmlRead | read | read |
//!
//! Every acquisition records a handle on the session stack *before* it may
//! block, and every release pops one. [`LockHook`] plugs the coordinator into
//! the hook chain.

use crate::hook::DxlHook;
use crate::lock::{Acquisition, FairRwLock, LockStatus};
use smallvec::SmallVec;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use strata_core::error::{DxlError, Result};
use strata_core::function::{DxlFunction, FunctionClass};
use strata_core::session::{AcquireState, LockKind, LockMode, Session};
use tracing::{debug, error, warn};

/// How operation locks wait when contended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcquirePolicy {
    /// Wait until granted
    #[default]
    Blocking,
    /// Wait until granted or the session is interrupted
    Interruptible,
}

/// Lock steps for one operation, in acquisition order
pub type LockPlan = SmallVec<[(LockKind, LockMode); 2]>;

/// Owner of the schema and data locks
#[derive(Debug)]
pub struct LockCoordinator {
    schema: FairRwLock,
    data: Option<FairRwLock>,
    policy: AcquirePolicy,
}

impl LockCoordinator {
    /// Create a coordinator
    pub fn new(data_lock_enabled: bool, policy: AcquirePolicy) -> Self {
        Self {
            schema: FairRwLock::new(LockKind::Schema),
            data: data_lock_enabled.then(|| FairRwLock::new(LockKind::Data)),
            policy,
        }
    }

    /// Whether the data lock is in use
    pub fn data_lock_enabled(&self) -> bool {
        self.data.is_some()
    }

    fn lock(&self, kind: LockKind) -> Result<&FairRwLock> {
        match kind {
            LockKind::Schema => Ok(&self.schema),
            LockKind::Data => self
                .data
                .as_ref()
                .ok_or_else(|| DxlError::protocol("data lock requested but not enabled")),
        }
    }

    /// Locks taken for an operation class
    pub fn plan(&self, class: FunctionClass) -> LockPlan {
        let mut plan = LockPlan::new();
        match class {
            FunctionClass::DdlWrite => plan.push((LockKind::Schema, LockMode::Write)),
            FunctionClass::DdlRead => plan.push((LockKind::Schema, LockMode::Read)),
            FunctionClass::DmlWrite => {
                plan.push((LockKind::Schema, LockMode::Read));
                if self.data.is_some() {
                    plan.push((LockKind::Data, LockMode::Write));
                }
            }
            FunctionClass::DmlRead => {
                plan.push((LockKind::Schema, LockMode::Read));
                if self.data.is_some() {
                    plan.push((LockKind::Data, LockMode::Read));
                }
            }
        }
        plan
    }

    /// Acquire with the configured policy
    pub fn acquire(&self, session: &mut Session, kind: LockKind, mode: LockMode) -> Result<()> {
        let how = match self.policy {
            AcquirePolicy::Blocking => Acquisition::Blocking,
            AcquirePolicy::Interruptible => Acquisition::Interruptible(session.interrupt_token()),
        };
        self.acquire_with(session, kind, mode, how)
    }

    /// Acquire waiting at most `timeout`
    pub fn acquire_with_timeout(
        &self,
        session: &mut Session,
        kind: LockKind,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<()> {
        self.acquire_with(session, kind, mode, Acquisition::Timeout(timeout))
    }

    /// Acquire one lock, recording its handle first
    ///
    /// On failure the pending handle stays on the session stack; the caller
    /// pops it with [`LockCoordinator::release`], which does not unlock a
    /// handle that was never granted.
    pub fn acquire_with(
        &self,
        session: &mut Session,
        kind: LockKind,
        mode: LockMode,
        how: Acquisition,
    ) -> Result<()> {
        let lock = self.lock(kind)?;

        if kind == LockKind::Schema && mode == LockMode::Write {
            if let Some(owner) = lock.write_owner() {
                if owner != thread::current().id() {
                    error!(target: "strata::lock", session = %session.id(), ?owner, "schema write lock taken");
                    return Err(DxlError::WriteLockTaken { kind, owner });
                }
            }
        }

        session.push_lock(kind, mode);
        lock.acquire(mode, &how)?;
        session.mark_acquired(kind);
        debug!(target: "strata::lock", session = %session.id(), %kind, %mode, depth = session.lock_depth(kind), "acquired");
        Ok(())
    }

    /// Pop the newest handle of `kind` and unlock it if it was granted
    pub fn release(&self, session: &mut Session, kind: LockKind) -> Result<()> {
        let handle = session.pop_lock(kind).ok_or_else(|| {
            error!(target: "strata::lock", session = %session.id(), %kind, "release without handle");
            DxlError::LockNotHeld { kind }
        })?;
        if handle.state == AcquireState::Pending {
            debug!(target: "strata::lock", session = %session.id(), %kind, "dropped pending handle");
            return Ok(());
        }
        self.lock(kind)?.release(handle.mode)?;
        debug!(target: "strata::lock", session = %session.id(), %kind, mode = %handle.mode, depth = session.lock_depth(kind), "released");
        Ok(())
    }

    /// Take every lock of `plan`, undoing the ones taken if a step fails
    pub fn acquire_plan(&self, session: &mut Session, plan: &LockPlan, timeout: Option<Duration>) -> Result<()> {
        for (taken, (kind, mode)) in plan.iter().enumerate() {
            let step = match timeout {
                Some(t) => self.acquire_with_timeout(session, *kind, *mode, t),
                None => self.acquire(session, *kind, *mode),
            };
            if let Err(e) = step {
                // The failed step may have pushed a pending handle
                let pushed = session
                    .top_lock(*kind)
                    .map_or(false, |h| h.state == AcquireState::Pending);
                let mut undo: Vec<LockKind> = plan[..taken].iter().map(|(k, _)| *k).collect();
                if pushed {
                    undo.push(*kind);
                }
                for k in undo.into_iter().rev() {
                    if let Err(re) = self.release(session, k) {
                        warn!(target: "strata::lock", session = %session.id(), kind = %k, error = %re, "undo after failed acquire");
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Release every lock of `plan` in reverse order
    pub fn release_plan(&self, session: &mut Session, plan: &LockPlan) -> Result<()> {
        let errors: Vec<DxlError> = plan
            .iter()
            .rev()
            .filter_map(|(kind, _)| self.release(session, *kind).err())
            .collect();
        match DxlError::aggregate(errors) {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Diagnostic snapshot of every lock
    pub fn lock_status(&self) -> Vec<LockStatus> {
        std::iter::once(&self.schema)
            .chain(self.data.as_ref())
            .map(FairRwLock::status)
            .collect()
    }
}

/// Hook taking the locks of each operation
#[derive(Debug)]
pub struct LockHook {
    coordinator: Arc<LockCoordinator>,
}

impl LockHook {
    /// Hook over a shared coordinator
    pub fn new(coordinator: Arc<LockCoordinator>) -> Self {
        Self { coordinator }
    }
}

impl DxlHook for LockHook {
    fn name(&self) -> &'static str {
        "lock"
    }

    fn enter(&self, session: &mut Session, function: DxlFunction) -> Result<()> {
        let plan = self.coordinator.plan(function.class());
        self.coordinator.acquire_plan(session, &plan, None)
    }

    fn on_failure(&self, _session: &mut Session, _function: DxlFunction, _error: &DxlError) -> Result<()> {
        Ok(())
    }

    fn exit(&self, session: &mut Session, function: DxlFunction, _error: Option<&DxlError>) -> Result<()> {
        let plan = self.coordinator.plan(function.class());
        self.coordinator.release_plan(session, &plan)
    }
}
