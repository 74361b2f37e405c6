//! In-memory storage for the DXL layer
//!
//! This crate implements the collaborator traits from `strata-core`:
//! - MemorySchemaManager: versioned schema catalog publishing `Ais` snapshots
//! - MemoryStore: ordered row maps per table, with unique key checks
//! - MemoryRowCollector: snapshot collector with native row-count limits
//! - MemoryTransactionService: per-session transactions with undo logs
//!
//! Row changes made inside a transaction are undone on rollback. Changes
//! made outside one apply immediately.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod collector;
pub mod schema;
pub mod store;
pub mod transaction;

pub use collector::MemoryRowCollector;
pub use schema::{MemorySchemaManager, PRIMARY_KEY_NAME};
pub use store::{MemoryStore, StoreStats};
pub use transaction::{MemoryTransactionService, TxnStats, Undo};
