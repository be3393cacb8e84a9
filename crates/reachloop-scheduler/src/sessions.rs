//! Observability session tracker — ephemeral per-attempt logs and screenshots.
//!
//! One session per dispatched action attempt. Sessions live only in memory:
//! a restart loses them, records keep just a weak `debugSessionId` back-reference.
//!
//! - Screenshots are a bounded FIFO ring: the newest N are kept, older ones dropped.
//! - Appends against an unknown id are silent no-ops (instrumentation is best-effort).
//! - A reaper finalizes sessions still running after the ceiling, and purges
//!   finalized sessions once their retention window has passed.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Duration, Utc};
use reachloop_core::config::SessionConfig;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Completed,
    Error,
}

/// One timestamped log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Screenshot {
    pub timestamp: DateTime<Utc>,
    pub label: String,
    pub image: Vec<u8>,
}

/// Diagnostic bundle for one action attempt.
#[derive(Debug, Clone)]
pub struct ObservabilitySession {
    pub id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub logs: Vec<LogLine>,
    pub screenshots: VecDeque<Screenshot>,
    pub error: Option<String>,
}

impl ObservabilitySession {
    fn new(id: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            start_time: now,
            end_time: None,
            status: SessionStatus::Running,
            logs: Vec::new(),
            screenshots: VecDeque::new(),
            error: None,
        }
    }

    /// JSON-friendly view with base64 screenshots, for external viewers.
    pub fn view(&self) -> SessionView {
        SessionView {
            id: self.id.clone(),
            status: self.status,
            start_time: self.start_time,
            end_time: self.end_time,
            error: self.error.clone(),
            logs: self.logs.clone(),
            screenshots: self
                .screenshots
                .iter()
                .map(|s| ScreenshotView {
                    timestamp: s.timestamp,
                    label: s.label.clone(),
                    image_base64: BASE64.encode(&s.image),
                })
                .collect(),
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            status: self.status,
            start_time: self.start_time,
            end_time: self.end_time,
            log_count: self.logs.len(),
            screenshot_count: self.screenshots.len(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub id: String,
    pub status: SessionStatus,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub logs: Vec<LogLine>,
    pub screenshots: Vec<ScreenshotView>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenshotView {
    pub timestamp: DateTime<Utc>,
    pub label: String,
    pub image_base64: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub status: SessionStatus,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub log_count: usize,
    pub screenshot_count: usize,
}

/// Result of one reaper pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub finalized: usize,
    pub purged: usize,
}

struct TrackerInner {
    sessions: RwLock<HashMap<String, ObservabilitySession>>,
    max_screenshots: usize,
    ceiling: Duration,
    retention: Duration,
    reaper_interval: std::time::Duration,
    shutdown: watch::Sender<bool>,
    reaper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Explicitly owned session registry. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SessionTracker {
    inner: Arc<TrackerInner>,
}

impl SessionTracker {
    pub fn new(config: &SessionConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(TrackerInner {
                sessions: RwLock::new(HashMap::new()),
                max_screenshots: config.max_screenshots.max(1),
                ceiling: Duration::seconds(config.ceiling_secs as i64),
                retention: Duration::seconds(config.retention_secs as i64),
                reaper_interval: std::time::Duration::from_secs(config.reaper_interval_secs.max(1)),
                shutdown,
                reaper: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Start a new running session and return its id.
    pub fn create(&self) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let session = ObservabilitySession::new(id.clone(), Utc::now());
        match self.inner.sessions.write() {
            Ok(mut sessions) => {
                sessions.insert(id.clone(), session);
            }
            Err(e) => tracing::warn!("⚠️ Session map poisoned, session {id} not tracked: {e}"),
        }
        id
    }

    fn with_session<F>(&self, id: &str, f: F)
    where
        F: FnOnce(&mut ObservabilitySession),
    {
        let Ok(mut sessions) = self.inner.sessions.write() else {
            return;
        };
        if let Some(session) = sessions.get_mut(id) {
            f(session);
        }
    }

    /// Append a log line. Unknown id: no-op.
    pub fn append_log(&self, id: &str, message: impl Into<String>) {
        let message = message.into();
        self.with_session(id, |s| {
            s.logs.push(LogLine {
                timestamp: Utc::now(),
                message,
            });
        });
    }

    /// Append a screenshot, evicting the oldest beyond the bound. Unknown id: no-op.
    pub fn append_screenshot(&self, id: &str, label: &str, image: Vec<u8>) {
        let max = self.inner.max_screenshots;
        self.with_session(id, |s| {
            s.screenshots.push_back(Screenshot {
                timestamp: Utc::now(),
                label: label.to_string(),
                image,
            });
            while s.screenshots.len() > max {
                s.screenshots.pop_front();
            }
        });
    }

    /// Finalize a running session; `error` marks it failed and is logged too.
    pub fn complete(&self, id: &str, error: Option<&str>) {
        self.with_session(id, |s| {
            if s.status != SessionStatus::Running {
                return;
            }
            let now = Utc::now();
            s.end_time = Some(now);
            match error {
                Some(msg) => {
                    s.status = SessionStatus::Error;
                    s.error = Some(msg.to_string());
                    s.logs.push(LogLine {
                        timestamp: now,
                        message: format!("error: {msg}"),
                    });
                }
                None => s.status = SessionStatus::Completed,
            }
        });
    }

    pub fn get(&self, id: &str) -> Option<ObservabilitySession> {
        self.inner
            .sessions
            .read()
            .ok()
            .and_then(|sessions| sessions.get(id).cloned())
    }

    /// Summaries, newest first.
    pub fn list(&self) -> Vec<SessionSummary> {
        let Ok(sessions) = self.inner.sessions.read() else {
            return Vec::new();
        };
        let mut out: Vec<SessionSummary> = sessions.values().map(|s| s.summary()).collect();
        out.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        out
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Finalize sessions running past the ceiling; purge finalized ones past retention.
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        let Ok(mut sessions) = self.inner.sessions.write() else {
            return report;
        };

        for session in sessions.values_mut() {
            if session.status == SessionStatus::Running
                && now - session.start_time >= self.inner.ceiling
            {
                session.status = SessionStatus::Completed;
                session.end_time = Some(now);
                session.logs.push(LogLine {
                    timestamp: now,
                    message: "auto-finalized after ceiling".into(),
                });
                report.finalized += 1;
            }
        }

        let retention = self.inner.retention;
        let before = sessions.len();
        sessions.retain(|_, s| match s.end_time {
            Some(end) => now - end < retention,
            None => true,
        });
        report.purged = before - sessions.len();
        report
    }

    /// Start the background reaper. Idempotent.
    pub fn spawn_reaper(&self) {
        let Ok(mut slot) = self.inner.reaper.lock() else {
            return;
        };
        if slot.is_some() {
            return;
        }

        let tracker = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        let every = self.inner.reaper_interval;
        *slot = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let report = tracker.sweep(Utc::now());
                        if report.finalized > 0 || report.purged > 0 {
                            tracing::debug!(
                                "🧹 Sessions: {} auto-finalized, {} purged",
                                report.finalized,
                                report.purged
                            );
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));
    }

    /// Stop the reaper and wait for it to exit.
    pub async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        let handle = self.inner.reaper.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!("⚠️ Session reaper ended abnormally: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(max_screenshots: usize) -> SessionTracker {
        SessionTracker::new(&SessionConfig {
            max_screenshots,
            ceiling_secs: 7200,
            retention_secs: 3600,
            reaper_interval_secs: 1,
        })
    }

    #[test]
    fn test_lifecycle() {
        let t = tracker(5);
        let id = t.create();
        t.append_log(&id, "opening profile");
        t.complete(&id, None);

        let s = t.get(&id).unwrap();
        assert_eq!(s.status, SessionStatus::Completed);
        assert!(s.end_time.is_some());
        assert_eq!(s.logs.len(), 1);
        assert_eq!(s.logs[0].message, "opening profile");
    }

    #[test]
    fn test_error_completion() {
        let t = tracker(5);
        let id = t.create();
        t.complete(&id, Some("timed out"));
        let s = t.get(&id).unwrap();
        assert_eq!(s.status, SessionStatus::Error);
        assert_eq!(s.error.as_deref(), Some("timed out"));
        assert!(s.logs.last().unwrap().message.contains("timed out"));

        // Second completion does not overwrite
        t.complete(&id, None);
        assert_eq!(t.get(&id).unwrap().status, SessionStatus::Error);
    }

    #[test]
    fn test_screenshot_ring_evicts_oldest() {
        let t = tracker(3);
        let id = t.create();
        for i in 0..5u8 {
            t.append_screenshot(&id, &format!("shot-{i}"), vec![i]);
        }
        let s = t.get(&id).unwrap();
        let labels: Vec<_> = s.screenshots.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels, vec!["shot-2", "shot-3", "shot-4"]);
    }

    #[test]
    fn test_unknown_session_is_noop() {
        let t = tracker(3);
        t.append_log("nope", "x");
        t.append_screenshot("nope", "x", vec![1, 2, 3]);
        t.complete("nope", Some("x"));
        assert!(t.get("nope").is_none());
        assert!(t.is_empty());
    }

    #[test]
    fn test_sweep_finalizes_then_purges() {
        let t = tracker(3);
        let id = t.create();
        let start = t.get(&id).unwrap().start_time;

        let report = t.sweep(start + Duration::minutes(30));
        assert_eq!(report, SweepReport::default());

        let at_ceiling = start + Duration::hours(2);
        let report = t.sweep(at_ceiling);
        assert_eq!(report.finalized, 1);
        assert_eq!(t.get(&id).unwrap().status, SessionStatus::Completed);

        let report = t.sweep(at_ceiling + Duration::hours(1));
        assert_eq!(report.purged, 1);
        assert!(t.get(&id).is_none());
    }

    #[test]
    fn test_view_encodes_screenshots() {
        let t = tracker(3);
        let id = t.create();
        t.append_screenshot(&id, "after-click", vec![0xde, 0xad]);
        let view = t.get(&id).unwrap().view();
        assert_eq!(view.screenshots[0].image_base64, "3q0=");
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["status"], "running");
        assert_eq!(json["screenshots"][0]["label"], "after-click");
    }

    #[test]
    fn test_list_newest_first() {
        let t = tracker(3);
        let a = t.create();
        let b = t.create();
        let list = t.list();
        assert_eq!(list.len(), 2);
        assert!(list.iter().any(|s| s.id == a));
        assert!(list.iter().any(|s| s.id == b));
        assert!(list[0].start_time >= list[1].start_time);
    }

    #[tokio::test]
    async fn test_reaper_shutdown() {
        let t = tracker(3);
        t.spawn_reaper();
        t.spawn_reaper();
        t.shutdown().await;
    }
}
