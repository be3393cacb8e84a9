//! API route handlers for the gateway.

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{
    Json,
    extract::{Path, Query, State},
};
use reachloop_core::error::ReachError;
use reachloop_core::types::RecordStatus;
use reachloop_scheduler::SHARED_SECRET_HEADER;
use serde::Deserialize;
use std::sync::Arc;

use super::server::AppState;

/// Map a pipeline error to an HTTP status with a JSON body.
fn error_response(e: &ReachError) -> Response {
    let status = match e {
        ReachError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        ReachError::NotFound(_) => StatusCode::NOT_FOUND,
        ReachError::Conflict { .. } | ReachError::InvalidTransition(_) => StatusCode::CONFLICT,
        ReachError::Store(_)
        | ReachError::Serialization(_)
        | ReachError::Queue(_)
        | ReachError::Executor(_)
        | ReachError::Timeout(_)
        | ReachError::Config(_)
        | ReachError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!("❌ Request failed: {e}");
    }
    (status, Json(serde_json::json!({"ok": false, "error": e.to_string()}))).into_response()
}

fn bad_request(message: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({"ok": false, "error": message})),
    )
        .into_response()
}

/// Health check endpoint.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "reachloop-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

#[derive(Debug, Deserialize)]
struct AcceptedPayload {
    id: String,
}

/// Acceptance webhook. 401 bad/missing secret, 400 malformed body,
/// 404 unknown id, 500 store or queue failure.
pub async fn webhook_accepted(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let provided = headers
        .get(SHARED_SECRET_HEADER)
        .and_then(|v| v.to_str().ok());
    if let Err(e) = state.webhook.verify(provided) {
        tracing::warn!("[webhook] Rejected acceptance signal: {e}");
        return error_response(&e);
    }

    let payload: AcceptedPayload = match serde_json::from_str(&body) {
        Ok(p) => p,
        Err(e) => return bad_request(format!("Invalid JSON: {e}")),
    };
    if payload.id.trim().is_empty() {
        return bad_request("Field 'id' must not be empty".into());
    }

    match state.webhook.accept(payload.id.trim()).await {
        Ok(record) => Json(serde_json::json!({
            "ok": true,
            "id": record.id,
            "status": record.status,
        }))
        .into_response(),
        // Callers only understand 200/400/401/404/500, so a lost CAS race is a 500
        Err(e @ (ReachError::Conflict { .. } | ReachError::InvalidTransition(_))) => {
            tracing::error!("❌ [webhook] Could not mark '{}' accepted: {e}", payload.id.trim());
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"ok": false, "error": e.to_string()})),
            )
                .into_response()
        }
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
}

/// List records, optionally filtered by `?status=`.
pub async fn list_records(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Response {
    let filter = match query.status.as_deref().map(str::parse::<RecordStatus>) {
        None => None,
        Some(Ok(status)) => Some(status),
        Some(Err(e)) => return bad_request(e.to_string()),
    };
    match state.operator.list().await {
        Ok(records) => {
            let records: Vec<_> = records
                .into_iter()
                .filter(|r| filter.is_none_or(|s| r.status == s))
                .collect();
            Json(serde_json::json!({
                "ok": true,
                "count": records.len(),
                "records": records,
            }))
            .into_response()
        }
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRecord {
    id: String,
    display_name: String,
    #[serde(default)]
    custom_message: Option<String>,
}

pub async fn create_record(State(state): State<Arc<AppState>>, body: String) -> Response {
    let req: CreateRecord = match serde_json::from_str(&body) {
        Ok(r) => r,
        Err(e) => return bad_request(format!("Invalid JSON: {e}")),
    };
    if req.id.trim().is_empty() {
        return bad_request("Field 'id' must not be empty".into());
    }
    match state
        .operator
        .create(&req.id, &req.display_name, req.custom_message)
        .await
    {
        Ok(record) => (
            StatusCode::CREATED,
            Json(serde_json::json!({"ok": true, "record": record})),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

pub async fn get_record(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.operator.get(&id).await {
        Ok(record) => Json(serde_json::json!({"ok": true, "record": record})).into_response(),
        Err(e) => error_response(&e),
    }
}

pub async fn delete_record(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.operator.delete(&id).await {
        Ok(true) => Json(serde_json::json!({"ok": true, "deleted": id})).into_response(),
        Ok(false) => error_response(&ReachError::NotFound(id)),
        Err(e) => error_response(&e),
    }
}

pub async fn pause_record(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.operator.pause(&id).await {
        Ok(record) => Json(serde_json::json!({"ok": true, "record": record})).into_response(),
        Err(e) => error_response(&e),
    }
}

pub async fn resume_record(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.operator.resume(&id).await {
        Ok(record) => Json(serde_json::json!({"ok": true, "record": record})).into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
struct ResetRecord {
    status: RecordStatus,
}

/// Manual status override, e.g. to retry a `failed` record.
pub async fn reset_record(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: String,
) -> Response {
    let req: ResetRecord = match serde_json::from_str(&body) {
        Ok(r) => r,
        Err(e) => return bad_request(format!("Invalid JSON: {e}")),
    };
    match state.operator.reset(&id, req.status).await {
        Ok(record) => Json(serde_json::json!({"ok": true, "record": record})).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Session summaries, newest first.
pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let sessions = state.sessions.list();
    Json(serde_json::json!({
        "ok": true,
        "count": sessions.len(),
        "sessions": sessions,
    }))
}

/// Full session with logs and base64 screenshots.
pub async fn get_session(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.sessions.get(&id) {
        Some(session) => Json(serde_json::json!({"ok": true, "session": session.view()})).into_response(),
        None => error_response(&ReachError::NotFound(format!("session {id}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::build_router;
    use axum::Router;
    use axum::body::Body;
    use axum::http::Request;
    use reachloop_core::config::SessionConfig;
    use reachloop_core::traits::{RecordStore, WorkQueue};
    use reachloop_core::types::{OutreachRecord, QueueKind};
    use reachloop_scheduler::{MemoryWorkQueue, Operator, SessionTracker, WebhookIngester};
    use reachloop_store::MemoryRecordStore;
    use std::time::Duration;
    use tower::ServiceExt;

    const SECRET: &str = "hunter2";

    struct Harness {
        store: Arc<MemoryRecordStore>,
        queue: Arc<MemoryWorkQueue>,
        sessions: SessionTracker,
        app: Router,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryRecordStore::new());
        let queue = Arc::new(MemoryWorkQueue::new(QueueKind::Message, Duration::from_secs(60)));
        let sessions = SessionTracker::new(&SessionConfig::default());
        let state = AppState::new(
            Arc::new(Operator::new(store.clone())),
            WebhookIngester::new(store.clone(), queue.clone(), SECRET),
            sessions.clone(),
        );
        Harness {
            store,
            queue,
            sessions,
            app: build_router(state),
        }
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        secret: Option<&str>,
        body: &str,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(secret) = secret {
            builder = builder.header(SHARED_SECRET_HEADER, secret);
        }
        let req = builder.body(Body::from(body.to_string())).unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    async fn seed_invited(store: &MemoryRecordStore, id: &str) {
        let mut r = OutreachRecord::new(id, "Jane Doe");
        r.status = RecordStatus::Invited;
        store.put(&r).await.unwrap();
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let h = harness();
        let (status, json) = call(&h.app, "GET", "/health", None, "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn test_webhook_accepts_and_enqueues() {
        let h = harness();
        seed_invited(&h.store, "jane").await;

        let (status, json) = call(
            &h.app,
            "POST",
            "/api/v1/webhook/accepted",
            Some(SECRET),
            r#"{"id":"jane"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "accepted");
        assert_eq!(h.queue.depth().await.unwrap(), 1);
        assert_eq!(
            h.store.get("jane").await.unwrap().unwrap().status,
            RecordStatus::Accepted
        );
    }

    #[tokio::test]
    async fn test_webhook_bad_secret_is_401_without_mutation() {
        let h = harness();
        seed_invited(&h.store, "jane").await;

        for secret in [None, Some("wrong")] {
            let (status, _) = call(
                &h.app,
                "POST",
                "/api/v1/webhook/accepted",
                secret,
                r#"{"id":"jane"}"#,
            )
            .await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
        }
        assert_eq!(
            h.store.get("jane").await.unwrap().unwrap().status,
            RecordStatus::Invited
        );
        assert_eq!(h.queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_webhook_unknown_id_is_404() {
        let h = harness();
        let (status, _) = call(
            &h.app,
            "POST",
            "/api/v1/webhook/accepted",
            Some(SECRET),
            r#"{"id":"ghost"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(h.queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_webhook_malformed_body_is_400() {
        let h = harness();
        for body in ["not json", r#"{"name":"x"}"#, r#"{"id":""}"#] {
            let (status, _) =
                call(&h.app, "POST", "/api/v1/webhook/accepted", Some(SECRET), body).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "body: {body}");
        }
    }

    /// Store whose writes always lose the version race.
    struct ContendedStore(MemoryRecordStore);

    #[async_trait::async_trait]
    impl RecordStore for ContendedStore {
        fn name(&self) -> &str {
            "contended"
        }

        async fn get(&self, id: &str) -> reachloop_core::error::Result<Option<OutreachRecord>> {
            self.0.get(id).await
        }

        async fn put(&self, record: &OutreachRecord) -> reachloop_core::error::Result<u64> {
            Err(ReachError::Conflict {
                id: record.id.clone(),
                expected: Some(record.version),
                found: Some(record.version + 1),
            })
        }

        async fn list_keys(&self) -> reachloop_core::error::Result<Vec<String>> {
            self.0.list_keys().await
        }

        async fn delete(&self, id: &str) -> reachloop_core::error::Result<bool> {
            self.0.delete(id).await
        }
    }

    #[tokio::test]
    async fn test_webhook_exhausted_conflicts_are_500() {
        let inner = MemoryRecordStore::new();
        seed_invited(&inner, "jane").await;
        let store = Arc::new(ContendedStore(inner));
        let queue = Arc::new(MemoryWorkQueue::new(QueueKind::Message, Duration::from_secs(60)));
        let app = build_router(AppState::new(
            Arc::new(Operator::new(store.clone())),
            WebhookIngester::new(store.clone(), queue.clone(), SECRET),
            SessionTracker::new(&SessionConfig::default()),
        ));

        let (status, json) = call(
            &app,
            "POST",
            "/api/v1/webhook/accepted",
            Some(SECRET),
            r#"{"id":"jane"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["ok"], false);
        assert_eq!(queue.depth().await.unwrap(), 0);
        assert_eq!(
            store.get("jane").await.unwrap().unwrap().status,
            RecordStatus::Invited
        );
    }

    #[tokio::test]
    async fn test_admin_routes_require_secret() {
        let h = harness();
        let (status, _) = call(&h.app, "GET", "/api/v1/records", None, "").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = call(&h.app, "GET", "/api/v1/sessions", Some("nope"), "").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_record_admin_flow() {
        let h = harness();
        let (status, json) = call(
            &h.app,
            "POST",
            "/api/v1/records",
            Some(SECRET),
            r#"{"id":"jane","displayName":"Jane Doe","customMessage":"Hi!"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["record"]["status"], "new");

        let (status, _) = call(
            &h.app,
            "POST",
            "/api/v1/records",
            Some(SECRET),
            r#"{"id":"jane","displayName":"Again"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, json) =
            call(&h.app, "POST", "/api/v1/records/jane/pause", Some(SECRET), "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["record"]["status"], "paused");

        let (_, json) = call(&h.app, "GET", "/api/v1/records?status=paused", Some(SECRET), "").await;
        assert_eq!(json["count"], 1);
        let (_, json) = call(&h.app, "GET", "/api/v1/records?status=new", Some(SECRET), "").await;
        assert_eq!(json["count"], 0);
        let (status, _) =
            call(&h.app, "GET", "/api/v1/records?status=bogus", Some(SECRET), "").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, json) =
            call(&h.app, "POST", "/api/v1/records/jane/resume", Some(SECRET), "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["record"]["status"], "new");

        let (status, _) =
            call(&h.app, "POST", "/api/v1/records/jane/resume", Some(SECRET), "").await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, json) = call(
            &h.app,
            "POST",
            "/api/v1/records/jane/reset",
            Some(SECRET),
            r#"{"status":"accepted"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["record"]["status"], "accepted");

        let (status, _) = call(&h.app, "DELETE", "/api/v1/records/jane", Some(SECRET), "").await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&h.app, "GET", "/api/v1/records/jane", Some(SECRET), "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&h.app, "DELETE", "/api/v1/records/jane", Some(SECRET), "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_session_view() {
        let h = harness();
        let id = h.sessions.create();
        h.sessions.append_log(&id, "clicked connect");
        h.sessions.append_screenshot(&id, "after", vec![1, 2, 3]);
        h.sessions.complete(&id, Some("button missing"));

        let (status, json) = call(&h.app, "GET", "/api/v1/sessions", Some(SECRET), "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["count"], 1);

        let (status, json) = call(
            &h.app,
            "GET",
            &format!("/api/v1/sessions/{id}"),
            Some(SECRET),
            "",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["session"]["status"], "error");
        assert_eq!(json["session"]["screenshots"][0]["imageBase64"], "AQID");

        let (status, _) =
            call(&h.app, "GET", "/api/v1/sessions/unknown", Some(SECRET), "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
