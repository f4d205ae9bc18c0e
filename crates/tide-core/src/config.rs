//! Coordinator configuration.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{HeartbeatPolicy, TaskKind};
use crate::domain::liveness::{DEFAULT_HEARTBEAT_GRACE_PERIOD, DEFAULT_HEARTBEAT_INTERVAL};
use crate::error::{Result, TideError};

pub const ENV_HEARTBEAT_INTERVAL_MS: &str = "TIDE_HEARTBEAT_INTERVAL_MS";
pub const ENV_HEARTBEAT_GRACE_PERIOD_MS: &str = "TIDE_HEARTBEAT_GRACE_PERIOD_MS";
pub const ENV_IDLE_POLL_INTERVAL_MS: &str = "TIDE_IDLE_POLL_INTERVAL_MS";
pub const ENV_TASK_KINDS: &str = "TIDE_TASK_KINDS";
pub const ENV_DEFAULT_AUTORUN: &str = "TIDE_DEFAULT_AUTORUN";
pub const ENV_REAP_ABANDONED_TASKS: &str = "TIDE_REAP_ABANDONED_TASKS";
pub const ENV_RESULT_CHANNEL_URL: &str = "TIDE_RESULT_CHANNEL_URL";

const DEFAULT_IDLE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Runtime settings for a coordinator process.
///
/// Every field has a default, so an empty JSON object (or an empty
/// environment) is a valid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TideConfig {
    pub heartbeat_interval_ms: u64,
    pub heartbeat_grace_period_ms: u64,

    /// Sleep after a drive pass that found no pending task.
    pub idle_poll_interval_ms: u64,

    /// Kinds this process drives, in drive order. Empty means every
    /// registered kind, in registration order.
    pub task_kinds: Vec<String>,

    pub default_autorun: bool,
    pub reap_abandoned_tasks: bool,

    /// Endpoint of the shared KV + pub/sub service.
    pub result_channel_url: Option<String>,
}

impl Default for TideConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL.as_millis() as u64,
            heartbeat_grace_period_ms: DEFAULT_HEARTBEAT_GRACE_PERIOD.as_millis() as u64,
            idle_poll_interval_ms: DEFAULT_IDLE_POLL_INTERVAL.as_millis() as u64,
            task_kinds: Vec::new(),
            default_autorun: false,
            reap_abandoned_tasks: true,
            result_channel_url: None,
        }
    }
}

impl TideConfig {
    /// Read configuration from `TIDE_*` environment variables.
    ///
    /// Unset variables keep their defaults:
    /// - `TIDE_HEARTBEAT_INTERVAL_MS`, `TIDE_HEARTBEAT_GRACE_PERIOD_MS`,
    ///   `TIDE_IDLE_POLL_INTERVAL_MS`: milliseconds
    /// - `TIDE_TASK_KINDS`: comma separated kind names
    /// - `TIDE_DEFAULT_AUTORUN`, `TIDE_REAP_ABANDONED_TASKS`: `true`/`false`/`1`/`0`
    /// - `TIDE_RESULT_CHANNEL_URL`: KV + pub/sub endpoint
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = parse_var(&lookup, ENV_HEARTBEAT_INTERVAL_MS)? {
            config.heartbeat_interval_ms = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_HEARTBEAT_GRACE_PERIOD_MS)? {
            config.heartbeat_grace_period_ms = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_IDLE_POLL_INTERVAL_MS)? {
            config.idle_poll_interval_ms = v;
        }
        if let Some(raw) = lookup(ENV_TASK_KINDS) {
            config.task_kinds = raw
                .split(',')
                .map(str::trim)
                .filter(|kind| !kind.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(raw) = lookup(ENV_DEFAULT_AUTORUN) {
            config.default_autorun = parse_bool(ENV_DEFAULT_AUTORUN, &raw)?;
        }
        if let Some(raw) = lookup(ENV_REAP_ABANDONED_TASKS) {
            config.reap_abandoned_tasks = parse_bool(ENV_REAP_ABANDONED_TASKS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_RESULT_CHANNEL_URL) {
            let raw = raw.trim();
            if !raw.is_empty() {
                config.result_channel_url = Some(raw.to_string());
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| TideError::Configuration(format!("invalid config JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects zero durations.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_ms == 0 {
            return Err(TideError::Configuration(
                "heartbeat_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.heartbeat_grace_period_ms == 0 {
            return Err(TideError::Configuration(
                "heartbeat_grace_period_ms must be greater than zero".to_string(),
            ));
        }
        if self.idle_poll_interval_ms == 0 {
            return Err(TideError::Configuration(
                "idle_poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat_policy(&self) -> HeartbeatPolicy {
        HeartbeatPolicy::new(
            Duration::from_millis(self.heartbeat_interval_ms),
            Duration::from_millis(self.heartbeat_grace_period_ms),
        )
    }

    pub fn idle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.idle_poll_interval_ms)
    }

    pub fn kinds(&self) -> Vec<TaskKind> {
        self.task_kinds.iter().map(|k| TaskKind::new(k.as_str())).collect()
    }

    /// The required KV + pub/sub endpoint.
    pub fn result_channel_url(&self) -> Result<&str> {
        self.result_channel_url.as_deref().ok_or_else(|| {
            TideError::Configuration(format!("{ENV_RESULT_CHANNEL_URL} not set"))
        })
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| TideError::Configuration(format!("invalid {key} '{raw}': {e}"))),
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(TideError::Configuration(format!(
            "invalid {key} '{raw}': expected true or false"
        ))),
    }
}
