//! Per-operation timing
//!
//! [`TimingHook`] pushes the start instant on the session when an operation is
//! entered and pops it on exit, so nested operations are timed independently.
//! Durations are logged at debug level and summed per function.

use dashmap::DashMap;
use serde::Serialize;
use std::time::{Duration, Instant};
use strata_concurrency::DxlHook;
use strata_core::error::{DxlError, Result};
use strata_core::function::DxlFunction;
use strata_core::session::{Session, StackKey};
use tracing::debug;

static STARTED: StackKey<Instant> = StackKey::new("timing.started");

/// Accumulated timings of one function
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OpTiming {
    /// Completed calls
    pub calls: u64,
    /// Calls that returned an error
    pub failures: u64,
    /// Sum of durations
    pub total: Duration,
    /// Longest single call
    pub max: Duration,
}

/// Hook recording operation durations
#[derive(Debug, Default)]
pub struct TimingHook {
    stats: DashMap<DxlFunction, OpTiming>,
}

impl TimingHook {
    /// Hook with empty statistics
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the statistics, ordered by function name
    pub fn snapshot(&self) -> Vec<(DxlFunction, OpTiming)> {
        let mut all: Vec<_> = self.stats.iter().map(|e| (*e.key(), *e.value())).collect();
        all.sort_by_key(|(f, _)| f.name());
        all
    }

    /// Timing of one function
    pub fn timing(&self, function: DxlFunction) -> Option<OpTiming> {
        self.stats.get(&function).map(|t| *t)
    }
}

impl DxlHook for TimingHook {
    fn name(&self) -> &'static str {
        "timing"
    }

    fn enter(&self, session: &mut Session, _function: DxlFunction) -> Result<()> {
        session.push(&STARTED, Instant::now());
        Ok(())
    }

    fn on_failure(&self, _session: &mut Session, _function: DxlFunction, _error: &DxlError) -> Result<()> {
        Ok(())
    }

    fn exit(&self, session: &mut Session, function: DxlFunction, error: Option<&DxlError>) -> Result<()> {
        let started = session
            .pop(&STARTED)
            .ok_or_else(|| DxlError::protocol(format!("timing exit without enter for {}", function)))?;
        let elapsed = started.elapsed();

        let mut entry = self.stats.entry(function).or_default();
        entry.calls += 1;
        if error.is_some() {
            entry.failures += 1;
        }
        entry.total += elapsed;
        entry.max = entry.max.max(elapsed);
        drop(entry);

        debug!(target: "strata::dxl", session = %session.id(), %function, ?elapsed, failed = error.is_some(), "timed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_concurrency::HookChain;
    use std::sync::Arc;

    #[test]
    fn test_nested_calls_timed_separately() {
        let hook = Arc::new(TimingHook::new());
        let chain = HookChain::with_hooks(vec![hook.clone() as Arc<dyn DxlHook>]);
        let mut session = Session::new();

        chain
            .run(&mut session, DxlFunction::DropTable, |s| {
                chain.run(s, DxlFunction::TruncateTable, |_| Ok(()))?;
                assert_eq!(s.stack_depth(&STARTED), 1);
                Ok(())
            })
            .unwrap();
        let _ = chain.run(&mut session, DxlFunction::TruncateTable, |_| -> Result<()> {
            Err(DxlError::invalid_operation("boom"))
        });

        assert_eq!(session.stack_depth(&STARTED), 0);
        let truncate = hook.timing(DxlFunction::TruncateTable).unwrap();
        assert_eq!(truncate.calls, 2);
        assert_eq!(truncate.failures, 1);
        assert!(truncate.max <= truncate.total);
        assert_eq!(hook.snapshot().len(), 2);
    }

    #[test]
    fn test_exit_without_enter_is_a_protocol_error() {
        let hook = TimingHook::new();
        let mut session = Session::new();
        let err = hook.exit(&mut session, DxlFunction::GetAis, None).unwrap_err();
        assert!(err.is_fatal());
    }
}
