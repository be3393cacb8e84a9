//! Collaborator traits — the seams between the pipeline and its environment.

pub mod executor;
pub mod queue;
pub mod store;

pub use executor::{ActionContext, ActionExecutor, ActionRequest};
pub use queue::{Delivery, WorkQueue};
pub use store::RecordStore;
