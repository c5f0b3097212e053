//! Inbound telemetry envelope and the tagged payload union.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::payload::{
    DecisionCyclePayload, MpgDeltaPayload, MufsEventPayload, NoeticStatePayload,
    RogueVariableEventPayload, SomaticStatePayload, SymbolicStatePayload, Validate,
};
use crate::serde_helpers::flexible_timestamp;

pub const PROTOCOL_VERSION: &str = "1";

// ─── Message type & source layer ──────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    SomaticState,
    SymbolicState,
    NoeticState,
    DecisionCycle,
    MpgDelta,
    RogueVariableEvent,
    MufsEvent,
    /// Any value this client does not know. Ignored by the aggregator.
    #[serde(other)]
    Unknown,
}

impl MessageType {
    pub const ALL: [Self; 7] = [
        Self::SomaticState,
        Self::SymbolicState,
        Self::NoeticState,
        Self::DecisionCycle,
        Self::MpgDelta,
        Self::RogueVariableEvent,
        Self::MufsEvent,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SomaticState => "somatic_state",
            Self::SymbolicState => "symbolic_state",
            Self::NoeticState => "noetic_state",
            Self::DecisionCycle => "decision_cycle",
            Self::MpgDelta => "mpg_delta",
            Self::RogueVariableEvent => "rogue_variable_event",
            Self::MufsEvent => "mufs_event",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ValidationError::Envelope(format!("unknown message type: {s}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceLayer {
    Somatic,
    Symbolic,
    Noetic,
    MirrorCore,
    #[serde(rename = "MPG")]
    Mpg,
}

// ─── Envelope ─────────────────────────────────────────────────────

/// Versioned, sequenced wrapper around one typed telemetry payload.
///
/// `sequence` is monotonic per `(session_id, source_layer)` on the producer
/// side; the aggregator uses it to drop stale updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEnvelope<T> {
    #[serde(default = "default_version")]
    pub v: String,
    pub message_type: MessageType,
    #[serde(with = "flexible_timestamp")]
    pub timestamp_utc: DateTime<Utc>,
    pub experiment_id: String,
    pub session_id: String,
    pub subject_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sork_cycle_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_id: Option<String>,
    pub source_layer: SourceLayer,
    pub sequence: u64,
    pub payload: T,
}

fn default_version() -> String {
    PROTOCOL_VERSION.to_string()
}

/// Envelope whose payload has not been checked against its message type.
pub type RawTelemetryEnvelope = TelemetryEnvelope<serde_json::Value>;

/// Envelope whose payload has been decoded and validated.
pub type TypedTelemetry = TelemetryEnvelope<TelemetryPayload>;

impl<T> TelemetryEnvelope<T> {
    /// Split into a payload-less header and the payload.
    pub fn into_parts(self) -> (TelemetryEnvelope<()>, T) {
        let TelemetryEnvelope {
            v,
            message_type,
            timestamp_utc,
            experiment_id,
            session_id,
            subject_id,
            run_id,
            sork_cycle_id,
            decision_id,
            source_layer,
            sequence,
            payload,
        } = self;
        let header = TelemetryEnvelope {
            v,
            message_type,
            timestamp_utc,
            experiment_id,
            session_id,
            subject_id,
            run_id,
            sork_cycle_id,
            decision_id,
            source_layer,
            sequence,
            payload: (),
        };
        (header, payload)
    }

    /// Swap the payload while keeping every header field.
    pub fn map_payload<U>(self, f: impl FnOnce(T) -> U) -> TelemetryEnvelope<U> {
        let (header, payload) = self.into_parts();
        header.with_payload(f(payload))
    }
}

impl TelemetryEnvelope<()> {
    pub fn with_payload<U>(self, payload: U) -> TelemetryEnvelope<U> {
        TelemetryEnvelope {
            v: self.v,
            message_type: self.message_type,
            timestamp_utc: self.timestamp_utc,
            experiment_id: self.experiment_id,
            session_id: self.session_id,
            subject_id: self.subject_id,
            run_id: self.run_id,
            sork_cycle_id: self.sork_cycle_id,
            decision_id: self.decision_id,
            source_layer: self.source_layer,
            sequence: self.sequence,
            payload,
        }
    }
}

impl RawTelemetryEnvelope {
    /// Parse a whole envelope from JSON. Header errors reject the envelope.
    pub fn from_value(value: serde_json::Value) -> Result<Self, ValidationError> {
        serde_json::from_value(value).map_err(|e| ValidationError::Envelope(e.to_string()))
    }

    /// Decode the payload into the variant named by `message_type`.
    ///
    /// Either the whole payload decodes and validates, or nothing does.
    pub fn decode(self) -> Result<TypedTelemetry, ValidationError> {
        let (header, value) = self.into_parts();
        let payload = TelemetryPayload::decode(header.message_type, value)?;
        Ok(header.with_payload(payload))
    }
}

// ─── Payload union ────────────────────────────────────────────────

/// One typed variant per known message type, plus a fallback for
/// message types this client does not recognise.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TelemetryPayload {
    SomaticState(SomaticStatePayload),
    SymbolicState(SymbolicStatePayload),
    NoeticState(NoeticStatePayload),
    DecisionCycle(DecisionCyclePayload),
    MpgDelta(MpgDeltaPayload),
    RogueVariableEvent(RogueVariableEventPayload),
    MufsEvent(MufsEventPayload),
    Unrecognized(serde_json::Value),
}

impl TelemetryPayload {
    pub fn decode(message_type: MessageType, value: serde_json::Value) -> Result<Self, ValidationError> {
        Ok(match message_type {
            MessageType::SomaticState => Self::SomaticState(typed(message_type, value)?),
            MessageType::SymbolicState => Self::SymbolicState(typed(message_type, value)?),
            MessageType::NoeticState => Self::NoeticState(typed(message_type, value)?),
            MessageType::DecisionCycle => Self::DecisionCycle(typed(message_type, value)?),
            MessageType::MpgDelta => Self::MpgDelta(typed(message_type, value)?),
            MessageType::RogueVariableEvent => Self::RogueVariableEvent(typed(message_type, value)?),
            MessageType::MufsEvent => Self::MufsEvent(typed(message_type, value)?),
            MessageType::Unknown => Self::Unrecognized(value),
        })
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Self::SomaticState(_) => MessageType::SomaticState,
            Self::SymbolicState(_) => MessageType::SymbolicState,
            Self::NoeticState(_) => MessageType::NoeticState,
            Self::DecisionCycle(_) => MessageType::DecisionCycle,
            Self::MpgDelta(_) => MessageType::MpgDelta,
            Self::RogueVariableEvent(_) => MessageType::RogueVariableEvent,
            Self::MufsEvent(_) => MessageType::MufsEvent,
            Self::Unrecognized(_) => MessageType::Unknown,
        }
    }
}

fn typed<T: DeserializeOwned + Validate>(
    message_type: MessageType,
    value: serde_json::Value,
) -> Result<T, ValidationError> {
    let payload: T =
        serde_json::from_value(value).map_err(|e| ValidationError::malformed(message_type, e))?;
    payload.validate()?;
    Ok(payload)
}
