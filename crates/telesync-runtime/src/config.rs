//! `telesync.toml` loading. Every field has a default, so a missing file
//! or a partial one is fine; a file that does not parse is fatal.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use telesync_core::MessageType;

pub const DEFAULT_CONFIG_FILE: &str = "telesync.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub outbound: OutboundConfig,
    pub inbound: InboundConfig,
    pub source: SourceConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboundConfig {
    pub base_url: String,
    pub events_path: String,
    pub consent_path: String,
    pub api_key: Option<String>,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub send_timeout_ms: u64,
    pub db_path: PathBuf,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".into(),
            events_path: "/streams/events".into(),
            consent_path: "/consent/participant".into(),
            api_key: None,
            batch_size: 100,
            flush_interval_ms: 5000,
            send_timeout_ms: 10_000,
            db_path: PathBuf::from("telesync-queue.db"),
        }
    }
}

impl OutboundConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InboundConfig {
    /// WebSocket endpoint. No URL means no subscription.
    pub url: Option<String>,
    pub session_id: String,
    pub message_types: Vec<MessageType>,
    pub api_key: Option<String>,
    pub channel_capacity: usize,
}

impl Default for InboundConfig {
    fn default() -> Self {
        Self {
            url: None,
            session_id: String::new(),
            message_types: MessageType::ALL.to_vec(),
            api_key: None,
            channel_capacity: 256,
        }
    }
}

/// Local producer feeding the outbound queue during `run`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// JSONL file of envelopes to replay. Without one the platform sensor
    /// source is reported unavailable.
    pub replay_path: Option<PathBuf>,
    pub priority: i64,
    pub poll_interval_ms: u64,
    pub poll_batch: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            replay_path: None,
            priority: 0,
            poll_interval_ms: 1000,
            poll_batch: 100,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub filter: Option<String>,
}

impl SyncConfig {
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        toml::from_str(s).context("invalid telesync config")
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    /// An explicit path must exist. Otherwise `telesync.toml` in the
    /// working directory is used when present, defaults when not.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        match explicit {
            Some(path) => Self::from_file(path),
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    Self::from_file(default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn events_url(&self) -> String {
        telesync_queue::endpoint(&self.outbound.base_url, &self.outbound.events_path)
    }

    pub fn consent_url(&self) -> String {
        telesync_queue::endpoint(&self.outbound.base_url, &self.outbound.consent_path)
    }
}
