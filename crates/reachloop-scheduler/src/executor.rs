//! HTTP action executor — drives an external automation service over REST.
//!
//! Endpoints (relative to `base_url`):
//! - `POST   /sessions`                      → `{ "id": "<remote session>" }`
//! - `POST   /sessions/{sid}/connect`         → `{ "success": bool, "message": str }`
//! - `POST   /sessions/{sid}/message`         → `{ "success": bool, "message": str }`
//! - `POST   /sessions/{sid}/screenshot`      → `{ "imageBase64": str }` or 204
//! - `DELETE /sessions/{sid}`

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reachloop_core::config::ExecutorConfig;
use reachloop_core::error::{ReachError, Result};
use reachloop_core::traits::{ActionContext, ActionExecutor, ActionRequest};
use reachloop_core::types::{ActionOutcome, QueueKind};
use serde::Deserialize;

const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(300);

#[derive(Debug, Deserialize)]
struct OpenedSession {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScreenshotBody {
    image_base64: String,
}

/// REST client for the automation service.
#[derive(Clone)]
pub struct HttpActionExecutor {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
}

impl HttpActionExecutor {
    pub fn new(config: &ExecutorConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone().filter(|t| !t.is_empty()),
        }
    }
}

fn authorize(req: reqwest::RequestBuilder, token: Option<&str>) -> reqwest::RequestBuilder {
    match token {
        Some(token) => req.bearer_auth(token),
        None => req,
    }
}

fn action_path(kind: QueueKind) -> &'static str {
    match kind {
        QueueKind::Connection => "connect",
        QueueKind::Message => "message",
    }
}

fn decode_screenshot(body: &ScreenshotBody) -> Result<Vec<u8>> {
    BASE64
        .decode(body.image_base64.trim())
        .map_err(|e| ReachError::Executor(format!("bad screenshot encoding: {e}")))
}

async fn error_body(resp: reqwest::Response, what: &str) -> ReachError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    ReachError::Executor(format!("{what} failed {status}: {body}"))
}

#[async_trait]
impl ActionExecutor for HttpActionExecutor {
    fn name(&self) -> &str {
        "http"
    }

    async fn open(&self, session_id: &str) -> Result<Box<dyn ActionContext>> {
        let url = format!("{}/sessions", self.base_url);
        let resp = authorize(self.client.post(&url), self.api_token.as_deref())
            .json(&serde_json::json!({ "sessionId": session_id }))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| ReachError::Executor(format!("open session: {e}")))?;

        if !resp.status().is_success() {
            return Err(error_body(resp, "open session").await);
        }
        let opened: OpenedSession = resp
            .json()
            .await
            .map_err(|e| ReachError::Executor(format!("open session response: {e}")))?;

        tracing::debug!("🌐 Automation session {} opened for {session_id}", opened.id);
        Ok(Box::new(HttpActionContext {
            client: self.client.clone(),
            session_url: format!("{}/sessions/{}", self.base_url, opened.id),
            api_token: self.api_token.clone(),
        }))
    }
}

/// One remote automation session.
struct HttpActionContext {
    client: reqwest::Client,
    session_url: String,
    api_token: Option<String>,
}

#[async_trait]
impl ActionContext for HttpActionContext {
    async fn perform(&mut self, kind: QueueKind, request: &ActionRequest) -> Result<ActionOutcome> {
        let url = format!("{}/{}", self.session_url, action_path(kind));
        let resp = authorize(self.client.post(&url), self.api_token.as_deref())
            .json(&serde_json::json!({
                "recordId": request.record_id,
                "displayName": request.display_name,
                "customMessage": request.custom_message,
            }))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| ReachError::Executor(format!("{kind} action: {e}")))?;

        if !resp.status().is_success() {
            return Err(error_body(resp, &format!("{kind} action")).await);
        }
        resp.json::<ActionOutcome>()
            .await
            .map_err(|e| ReachError::Executor(format!("{kind} action response: {e}")))
    }

    async fn screenshot(&mut self) -> Result<Option<Vec<u8>>> {
        let url = format!("{}/screenshot", self.session_url);
        let resp = authorize(self.client.post(&url), self.api_token.as_deref())
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| ReachError::Executor(format!("screenshot: {e}")))?;

        if resp.status() == reqwest::StatusCode::NO_CONTENT
            || resp.status() == reqwest::StatusCode::NOT_FOUND
        {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(error_body(resp, "screenshot").await);
        }
        let body: ScreenshotBody = resp
            .json()
            .await
            .map_err(|e| ReachError::Executor(format!("screenshot response: {e}")))?;
        decode_screenshot(&body).map(Some)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let resp = authorize(self.client.delete(&self.session_url), self.api_token.as_deref())
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| ReachError::Executor(format!("close session: {e}")))?;
        if resp.status().is_success() || resp.status() == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(error_body(resp, "close session").await)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_normalized() {
        let exec = HttpActionExecutor::new(&ExecutorConfig {
            base_url: "http://automation:9222/".into(),
            api_token: Some(String::new()),
            default_message: None,
        });
        assert_eq!(exec.base_url, "http://automation:9222");
        assert!(exec.api_token.is_none());
        assert_eq!(exec.name(), "http");
    }

    #[test]
    fn test_action_paths() {
        assert_eq!(action_path(QueueKind::Connection), "connect");
        assert_eq!(action_path(QueueKind::Message), "message");
    }

    #[test]
    fn test_outcome_wire_format() {
        let outcome: ActionOutcome =
            serde_json::from_str(r#"{"success":false,"message":"profile private"}"#).unwrap();
        assert_eq!(outcome, ActionOutcome::failed("profile private"));
        let bare: ActionOutcome = serde_json::from_str(r#"{"success":true}"#).unwrap();
        assert!(bare.success);
    }

    #[test]
    fn test_screenshot_decoding() {
        let body: ScreenshotBody = serde_json::from_str(r#"{"imageBase64":"iVBORw=="}"#).unwrap();
        assert_eq!(decode_screenshot(&body).unwrap(), vec![0x89, 0x50, 0x4e, 0x47]);

        let bad = ScreenshotBody {
            image_base64: "***".into(),
        };
        assert!(matches!(decode_screenshot(&bad), Err(ReachError::Executor(_))));
    }

    #[tokio::test]
    async fn test_unreachable_service_is_executor_error() {
        let exec = HttpActionExecutor::new(&ExecutorConfig {
            base_url: "http://127.0.0.1:1".into(),
            api_token: None,
            default_message: None,
        });
        let err = exec.open("session-1").await.err().unwrap();
        assert!(matches!(err, ReachError::Executor(_)));
    }
}
