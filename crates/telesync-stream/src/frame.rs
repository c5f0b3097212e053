//! Wire frames exchanged over the telemetry subscription socket.
//!
//! Client → server: `{"type":"subscribe","session_id":..,"message_types":[..]}`.
//! Server → client: `event`, `ack` and `error` frames. A frame parses whole
//! into one [`InboundFrame`] or fails; nothing is partially applied.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use telesync_core::{MessageType, RawTelemetryEnvelope, TypedTelemetry, ValidationError};
use thiserror::Error;

/// WebSocket subprotocol requested on connect.
pub const SUBPROTOCOL: &str = "json_v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "subscribe")]
pub struct SubscribeRequest {
    pub session_id: String,
    pub message_types: Vec<MessageType>,
}

impl SubscribeRequest {
    pub fn new(session_id: impl Into<String>, message_types: Vec<MessageType>) -> Self {
        Self {
            session_id: session_id.into(),
            message_types,
        }
    }

    /// Subscribe to every known message type.
    pub fn all(session_id: impl Into<String>) -> Self {
        Self::new(session_id, MessageType::ALL.to_vec())
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Event {
        subscription_id: Option<String>,
        envelope: Box<TypedTelemetry>,
    },
    /// An event whose `message_type` this client does not know.
    UnknownEvent {
        subscription_id: Option<String>,
        message_type: String,
    },
    Ack {
        subscription_id: String,
    },
    Error {
        detail: String,
    },
    /// Frame type this client does not handle.
    Other {
        kind: String,
    },
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not valid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame has no string `type` field")]
    MissingType,

    #[error("{kind} frame is missing `{field}`")]
    MissingField { kind: &'static str, field: &'static str },

    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

pub fn parse_frame(text: &str) -> Result<InboundFrame, FrameError> {
    let mut value: Value = serde_json::from_str(text)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(FrameError::MissingType)?
        .to_string();
    let subscription_id = value
        .get("subscription_id")
        .and_then(Value::as_str)
        .map(str::to_string);

    match kind.as_str() {
        "event" => {
            let data = value
                .get_mut("data")
                .map(Value::take)
                .filter(|d| !d.is_null())
                .ok_or(FrameError::MissingField {
                    kind: "event",
                    field: "data",
                })?;
            let type_name = data
                .get("message_type")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let raw = RawTelemetryEnvelope::from_value(data)?;
            if raw.message_type == MessageType::Unknown {
                return Ok(InboundFrame::UnknownEvent {
                    subscription_id,
                    message_type: type_name,
                });
            }
            Ok(InboundFrame::Event {
                subscription_id,
                envelope: Box::new(raw.decode()?),
            })
        }
        "ack" => Ok(InboundFrame::Ack {
            subscription_id: subscription_id.ok_or(FrameError::MissingField {
                kind: "ack",
                field: "subscription_id",
            })?,
        }),
        "error" => Ok(InboundFrame::Error {
            detail: value
                .get("detail")
                .map(|d| match d {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default(),
        }),
        _ => Ok(InboundFrame::Other { kind }),
    }
}
