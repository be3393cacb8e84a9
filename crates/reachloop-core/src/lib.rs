//! # ReachLoop Core
//!
//! Shared vocabulary for the outreach pipeline: the record data model,
//! the work item carried by the queues, observability sessions, the
//! collaborator traits (store, queue, action executor), configuration,
//! and the error taxonomy.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::ReachConfig;
pub use error::{ReachError, Result};
pub use types::{
    ActionOutcome, OutreachRecord, QueueKind, RecordStatus, WORK_ITEM_VERSION, WorkItem,
};
