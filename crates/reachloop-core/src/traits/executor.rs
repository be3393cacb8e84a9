//! Action executor trait — the opaque automation component.
//!
//! The executor drives an interactive external session (browser or similar).
//! Consumers acquire an [`ActionContext`] per work item, run exactly one
//! action through it, and always `close` it, whatever the outcome.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{ActionOutcome, QueueKind};

/// What to execute against which record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRequest {
    pub record_id: String,
    pub display_name: String,
    pub custom_message: Option<String>,
}

#[async_trait]
pub trait ActionExecutor: Send + Sync {
    fn name(&self) -> &str;

    /// Acquire an isolated execution context tagged with the observability session id.
    async fn open(&self, session_id: &str) -> Result<Box<dyn ActionContext>>;
}

#[async_trait]
pub trait ActionContext: Send {
    /// Run the connection or message action. Business failures come back as
    /// `ActionOutcome { success: false, .. }`; `Err` is reserved for transport faults.
    async fn perform(&mut self, kind: QueueKind, request: &ActionRequest) -> Result<ActionOutcome>;

    /// Capture a screenshot of the current state, if the backend supports it.
    async fn screenshot(&mut self) -> Result<Option<Vec<u8>>>;

    /// Release the context. Called on every exit path.
    async fn close(self: Box<Self>) -> Result<()>;
}
