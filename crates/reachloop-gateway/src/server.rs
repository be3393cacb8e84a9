//! HTTP server implementation using Axum.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use reachloop_core::config::GatewayConfig;
use reachloop_scheduler::{Operator, SHARED_SECRET_HEADER, SessionTracker, WebhookIngester};
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub operator: Arc<Operator>,
    /// Also the authority on the shared secret for admin routes.
    pub webhook: Arc<WebhookIngester>,
    pub sessions: SessionTracker,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(operator: Arc<Operator>, webhook: WebhookIngester, sessions: SessionTracker) -> Self {
        Self {
            operator,
            webhook: Arc::new(webhook),
            sessions,
            start_time: std::time::Instant::now(),
        }
    }
}

/// Shared-secret middleware for admin and viewer routes.
async fn require_secret(
    State(state): State<Arc<AppState>>,
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    let provided = req
        .headers()
        .get(SHARED_SECRET_HEADER)
        .and_then(|v| v.to_str().ok());
    match state.webhook.verify(provided) {
        Ok(()) => next.run(req).await,
        Err(e) => {
            tracing::warn!("🔒 Rejected {} {}: {e}", req.method(), req.uri().path());
            (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"ok": false, "error": e.to_string()})),
            )
                .into_response()
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let shared = Arc::new(state);

    // Protected routes — require the shared secret header
    let protected = Router::new()
        .route(
            "/api/v1/records",
            get(super::routes::list_records).post(super::routes::create_record),
        )
        .route(
            "/api/v1/records/{id}",
            get(super::routes::get_record).delete(super::routes::delete_record),
        )
        .route("/api/v1/records/{id}/pause", post(super::routes::pause_record))
        .route("/api/v1/records/{id}/resume", post(super::routes::resume_record))
        .route("/api/v1/records/{id}/reset", post(super::routes::reset_record))
        .route("/api/v1/sessions", get(super::routes::list_sessions))
        .route("/api/v1/sessions/{id}", get(super::routes::get_session))
        .route_layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            require_secret,
        ));

    // Public routes — the webhook checks its own secret so it can answer 401 before parsing
    let public = Router::new()
        .route("/health", get(super::routes::health_check))
        .route("/api/v1/webhook/accepted", post(super::routes::webhook_accepted));

    protected
        .merge(public)
        .layer(
            CorsLayer::new()
                .allow_methods([
                    axum::http::Method::GET,
                    axum::http::Method::POST,
                    axum::http::Method::DELETE,
                    axum::http::Method::OPTIONS,
                ])
                .allow_headers(Any)
                .allow_origin(Any)
                .max_age(std::time::Duration::from_secs(3600)),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

/// Serve until `shutdown` flips to true.
pub async fn start(
    config: &GatewayConfig,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = build_router(state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("🌐 Gateway listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            // Sender dropped counts as shutdown too
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;
    tracing::info!("🌐 Gateway stopped");
    Ok(())
}
