//! # ReachLoop Store
//!
//! Persistence backends for outreach records and durable work queues.
//!
//! - [`SqliteRecordStore`] — records as JSON rows with a version column
//! - [`MemoryRecordStore`] — in-process map, same compare-and-set semantics
//! - [`SqliteWorkQueue`] — at-least-once queue with visibility-timeout leases

pub mod memory;
pub mod queue;
pub mod sqlite;

pub use memory::MemoryRecordStore;
pub use queue::SqliteWorkQueue;
pub use sqlite::SqliteRecordStore;

use reachloop_core::error::ReachError;

/// Map a rusqlite error into the store taxonomy.
pub(crate) fn db_err(context: &str, e: rusqlite::Error) -> ReachError {
    ReachError::Store(format!("{context}: {e}"))
}

/// Map a poisoned lock into the store taxonomy.
pub(crate) fn lock_err<T>(e: std::sync::PoisonError<T>) -> ReachError {
    ReachError::Store(format!("Lock: {e}"))
}
