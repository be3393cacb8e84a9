//! # ReachLoop Scheduler
//!
//! The outreach pipeline proper:
//! - [`engine`] — periodic scan, dispatch of due records with claim-before-send
//! - [`consumer`] — connection and message workers over the work queues
//! - [`transitions`] — the record state machine and optimistic updates
//! - [`policy`] — follow-up delays, retry budget, re-arm jitter
//! - [`webhook`] — acceptance signal ingest
//! - [`operator`] — manual create/pause/resume/reset/delete
//! - [`sessions`] — ephemeral per-attempt logs and screenshots
//! - [`queue`] — in-process work queue
//! - [`executor`] — REST client for the automation service
//! - [`runtime`] — wiring and background task lifecycle

pub mod consumer;
pub mod engine;
pub mod executor;
pub mod operator;
pub mod policy;
pub mod queue;
pub mod runtime;
pub mod sessions;
pub mod transitions;
pub mod webhook;

pub use consumer::{BatchReport, Consumer, ItemOutcome};
pub use engine::{Scheduler, TickReport};
pub use executor::HttpActionExecutor;
pub use operator::Operator;
pub use policy::RetryPolicy;
pub use queue::MemoryWorkQueue;
pub use runtime::{Pipeline, PipelineHandle};
pub use sessions::{SessionTracker, SessionView};
pub use webhook::{SHARED_SECRET_HEADER, WebhookIngester};
