//! # ReachLoop Gateway
//!
//! HTTP surface of the pipeline:
//! - `POST /api/v1/webhook/accepted` — acceptance signal (shared-secret header)
//! - `GET  /api/v1/sessions[/{id}]` — observability sessions
//! - `/api/v1/records...` — operator record management
//! - `GET  /health`

pub mod routes;
pub mod server;

pub use server::{AppState, build_router, start};
