//! ReachLoop configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ReachError, Result};

/// Env var that overrides `gateway.shared_secret`.
pub const SHARED_SECRET_ENV: &str = "REACHLOOP_SHARED_SECRET";

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReachConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
}

impl ReachConfig {
    /// Load config from the default path (~/.reachloop/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ReachError::Config(format!("Failed to read config: {e}")))?;
        Self::parse(&content)
    }

    /// Parse config from TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ReachError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the given path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| ReachError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the ReachLoop home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".reachloop")
    }

    /// Reject configurations that can never work.
    pub fn validate(&self) -> Result<()> {
        // Negative delays would re-arm records into the past
        let non_negative = [
            ("scheduler.jitter_min_minutes", self.scheduler.jitter_min_minutes),
            ("scheduler.jitter_max_minutes", self.scheduler.jitter_max_minutes),
            ("policy.invite_followup_days", self.policy.invite_followup_days),
            ("policy.message_retry_days", self.policy.message_retry_days),
            ("policy.done_dormancy_days", self.policy.done_dormancy_days),
        ];
        for (key, value) in non_negative {
            if value < 0 {
                return Err(ReachError::Config(format!("{key} must not be negative (got {value})")));
            }
        }
        if self.scheduler.jitter_min_minutes > self.scheduler.jitter_max_minutes {
            return Err(ReachError::Config(format!(
                "scheduler.jitter_min_minutes ({}) exceeds jitter_max_minutes ({})",
                self.scheduler.jitter_min_minutes, self.scheduler.jitter_max_minutes
            )));
        }
        if self.scheduler.tick_interval_secs == 0 {
            return Err(ReachError::Config(
                "scheduler.tick_interval_secs must be positive".into(),
            ));
        }
        if self.consumer.batch_size == 0 {
            return Err(ReachError::Config("consumer.batch_size must be positive".into()));
        }
        if self.sessions.max_screenshots == 0 {
            return Err(ReachError::Config(
                "sessions.max_screenshots must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Resolve the webhook shared secret (env wins over file).
    /// A missing secret is a configuration error: the gateway must not start.
    pub fn shared_secret(&self) -> Result<String> {
        let from_env = std::env::var(SHARED_SECRET_ENV).ok();
        resolve_secret(from_env, self.gateway.shared_secret.as_deref())
    }
}

fn resolve_secret(from_env: Option<String>, from_file: Option<&str>) -> Result<String> {
    from_env
        .filter(|s| !s.trim().is_empty())
        .or_else(|| {
            from_file
                .filter(|s| !s.trim().is_empty())
                .map(str::to_string)
        })
        .ok_or_else(|| {
            ReachError::Config(format!(
                "shared secret missing: set gateway.shared_secret or {SHARED_SECRET_ENV}"
            ))
        })
}

/// Scheduler tick configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_jitter_min")]
    pub jitter_min_minutes: i64,
    #[serde(default = "default_jitter_max")]
    pub jitter_max_minutes: i64,
}

fn default_tick_interval() -> u64 { 30 * 60 }
fn default_jitter_min() -> i64 { 25 }
fn default_jitter_max() -> i64 { 35 }

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            jitter_min_minutes: default_jitter_min(),
            jitter_max_minutes: default_jitter_max(),
        }
    }
}

/// Per-transition timing and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Delay after a successful connection request.
    #[serde(default = "default_invite_followup_days")]
    pub invite_followup_days: i64,
    /// Backoff after a failed follow-up message.
    #[serde(default = "default_message_retry_days")]
    pub message_retry_days: i64,
    /// Retries allowed before a message failure becomes terminal.
    #[serde(default = "default_max_message_retries")]
    pub max_message_retries: u32,
    /// Dormancy after the pipeline completes.
    #[serde(default = "default_done_dormancy_days")]
    pub done_dormancy_days: i64,
}

fn default_invite_followup_days() -> i64 { 1 }
fn default_message_retry_days() -> i64 { 3 }
fn default_max_message_retries() -> u32 { 2 }
fn default_done_dormancy_days() -> i64 { 30 }

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            invite_followup_days: default_invite_followup_days(),
            message_retry_days: default_message_retry_days(),
            max_message_retries: default_max_message_retries(),
            done_dormancy_days: default_done_dormancy_days(),
        }
    }
}

/// Queue consumer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Ceiling on a single executor invocation.
    #[serde(default = "default_executor_timeout")]
    pub executor_timeout_secs: u64,
    /// Idle wait between empty receives.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Lease length for durable queues before an unacked message reappears.
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_secs: u64,
}

fn default_batch_size() -> usize { 10 }
fn default_executor_timeout() -> u64 { 180 }
fn default_poll_interval_ms() -> u64 { 1000 }
fn default_visibility_timeout() -> u64 { 600 }

impl ConsumerConfig {
    pub fn executor_timeout(&self) -> Duration {
        Duration::from_secs(self.executor_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            executor_timeout_secs: default_executor_timeout(),
            poll_interval_ms: default_poll_interval_ms(),
            visibility_timeout_secs: default_visibility_timeout(),
        }
    }
}

/// Observability session tracker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_max_screenshots")]
    pub max_screenshots: usize,
    /// Wall-clock ceiling after which a running session is auto-finalized.
    #[serde(default = "default_session_ceiling")]
    pub ceiling_secs: u64,
    /// How long a finalized session stays readable before it is purged.
    #[serde(default = "default_session_retention")]
    pub retention_secs: u64,
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_secs: u64,
}

fn default_max_screenshots() -> usize { 10 }
fn default_session_ceiling() -> u64 { 2 * 60 * 60 }
fn default_session_retention() -> u64 { 60 * 60 }
fn default_reaper_interval() -> u64 { 60 }

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_screenshots: default_max_screenshots(),
            ceiling_secs: default_session_ceiling(),
            retention_secs: default_session_retention(),
            reaper_interval_secs: default_reaper_interval(),
        }
    }
}

/// Gateway (HTTP) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    /// Value expected in the `X-Shared-Secret` header.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_secret: Option<String>,
}

fn default_port() -> u16 { 8787 }
fn default_host() -> String { "127.0.0.1".into() }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            shared_secret: None,
        }
    }
}

/// Record store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// `sqlite` or `memory`.
    #[serde(default = "default_store_backend")]
    pub backend: String,
    #[serde(default = "default_store_path")]
    pub path: String,
}

fn default_store_backend() -> String { "sqlite".into() }
fn default_store_path() -> String { "~/.reachloop/reachloop.db".into() }

impl StoreConfig {
    /// Store path with `~` expanded.
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).to_string())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            path: default_store_path(),
        }
    }
}

/// External automation service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_executor_url")]
    pub base_url: String,
    /// Bearer token for the automation service, if it requires one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
    /// Follow-up text used when a record carries no custom message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_message: Option<String>,
}

fn default_executor_url() -> String { "http://127.0.0.1:9222".into() }

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            base_url: default_executor_url(),
            api_token: None,
            default_message: None,
        }
    }
}
