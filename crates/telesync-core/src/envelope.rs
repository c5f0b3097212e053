//! Outbound event envelope and the durable queue record that carries it.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;
use crate::serde_helpers::flexible_timestamp;

// ─── Stream type & scope ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    Somatic,
    Text,
    Audio,
    Video,
    Meta,
    Task,
}

impl StreamType {
    pub const ALL: [Self; 6] = [
        Self::Somatic,
        Self::Text,
        Self::Audio,
        Self::Video,
        Self::Meta,
        Self::Task,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Somatic => "somatic",
            Self::Text => "text",
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Meta => "meta",
            Self::Task => "task",
        }
    }

    /// Consent scope a participant must grant for this stream.
    pub fn consent_scope(self) -> Scope {
        match self {
            Self::Somatic => Scope::Wearables,
            Self::Text => Scope::Text,
            Self::Audio => Scope::Audio,
            Self::Video => Scope::Video,
            Self::Meta => Scope::Meta,
            Self::Task => Scope::Task,
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Wearables,
    Text,
    Audio,
    Video,
    Task,
    Meta,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Wearables => "wearables",
            Self::Text => "text",
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Task => "task",
            Self::Meta => "meta",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wearables" => Ok(Self::Wearables),
            "text" => Ok(Self::Text),
            "audio" => Ok(Self::Audio),
            "video" => Ok(Self::Video),
            "task" => Ok(Self::Task),
            "meta" => Ok(Self::Meta),
            _ => Err(ValidationError::Envelope(format!("unknown consent scope: {s}"))),
        }
    }
}

// ─── Envelope ─────────────────────────────────────────────────────

/// Capture-quality hints attached by the producing device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventQuality {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling_rate_hz: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_to_noise: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completeness: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_level: Option<f64>,
}

/// One unit of participant data headed for the remote sink.
///
/// `event_id` is the idempotency key for the whole outbound pipeline: the
/// queue upserts on it and the backend de-duplicates on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: String,
    pub participant_id: String,
    pub source: String,
    pub stream_type: StreamType,
    #[serde(with = "flexible_timestamp")]
    pub timestamp_utc: DateTime<Utc>,
    #[serde(default, alias = "local_device_clock", skip_serializing_if = "Option::is_none")]
    pub device_clock: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segments: Option<Vec<String>>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<EventQuality>,
}

impl EventEnvelope {
    /// Build an envelope with a fresh client-generated id.
    pub fn new(
        participant_id: impl Into<String>,
        source: impl Into<String>,
        stream_type: StreamType,
        timestamp_utc: DateTime<Utc>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            participant_id: participant_id.into(),
            source: source.into(),
            stream_type,
            timestamp_utc,
            device_clock: None,
            session_id: None,
            scope: None,
            segments: None,
            payload,
            quality: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// The declared scope, or the scope implied by `stream_type`.
    pub fn effective_scope(&self) -> String {
        self.scope
            .clone()
            .unwrap_or_else(|| self.stream_type.consent_scope().as_str().to_string())
    }

    /// Reject envelopes the backend would refuse outright.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.event_id.trim().is_empty() {
            return Err(ValidationError::Envelope("event_id is empty".into()));
        }
        if self.participant_id.trim().is_empty() {
            return Err(ValidationError::Envelope("participant_id is empty".into()));
        }
        if let Some(quality) = &self.quality {
            for (field, value) in [
                ("quality.completeness", quality.completeness),
                ("quality.battery_level", quality.battery_level),
            ] {
                if let Some(v) = value
                    && !(0.0..=1.0).contains(&v)
                {
                    return Err(ValidationError::OutOfRange { field, value: v });
                }
            }
        }
        Ok(())
    }
}

/// Body of a single outbound delivery request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventBatch {
    pub events: Vec<EventEnvelope>,
}

// ─── Pending record ───────────────────────────────────────────────

/// A not-yet-delivered envelope as held by the durable queue.
///
/// `revision` is assigned by the store and bumped on every upsert of the
/// same id, letting a flush delete exactly the version it delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRecord {
    pub id: String,
    pub payload: String,
    pub priority: i64,
    pub revision: u64,
}

impl PendingRecord {
    pub fn new(id: impl Into<String>, payload: impl Into<String>, priority: i64) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
            priority,
            revision: 0,
        }
    }

    /// Serialize an envelope into a record keyed by its `event_id`.
    pub fn from_envelope(envelope: &EventEnvelope, priority: i64) -> Result<Self, serde_json::Error> {
        Ok(Self::new(
            envelope.event_id.clone(),
            serde_json::to_string(envelope)?,
            priority,
        ))
    }

    pub fn decode(&self) -> Result<EventEnvelope, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }
}
