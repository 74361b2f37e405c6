//! Concurrency control for the DXL layer
//!
//! This crate implements the interception machinery run around every
//! operation:
//! - FairRwLock: fair reentrant reader/writer lock with per-thread ownership
//! - LockCoordinator / LockHook: schema and data locks chosen by operation class
//! - TransactionHook: automatic begin / commit / rollback
//! - HookChain: ordered hooks with prefix-only cleanup and error aggregation

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod coordinator;
pub mod hook;
pub mod lock;
pub mod transaction;

pub use coordinator::{AcquirePolicy, LockCoordinator, LockHook, LockPlan};
pub use hook::{DxlHook, HookChain};
pub use lock::{Acquisition, FairRwLock, LockStatus};
pub use transaction::TransactionHook;
