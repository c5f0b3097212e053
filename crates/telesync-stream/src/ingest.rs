//! WebSocket subscription that feeds the aggregator service.
//!
//! One connection, one subscription. Frames are forwarded in arrival order
//! with no client-side reordering; stale and duplicate detection happens in
//! the aggregator. Reconnection is the caller's decision: `run` returns when
//! the connection ends and reports why through the closed callback.

use futures_util::{SinkExt, StreamExt};
use http::HeaderValue;
use http::header::SEC_WEBSOCKET_PROTOCOL;
use telesync_core::{MessageType, SyncError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::frame::{FrameError, InboundFrame, SUBPROTOCOL, SubscribeRequest, parse_frame};
use crate::service::AggregatorCommand;

const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid stream request: {0}")]
    Request(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("failed to encode subscribe request: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<IngestError> for SyncError {
    fn from(e: IngestError) -> Self {
        let retryable = matches!(e, IngestError::WebSocket(_));
        SyncError::Transport {
            detail: e.to_string(),
            retryable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestConfig {
    pub url: String,
    pub session_id: String,
    pub message_types: Vec<MessageType>,
    pub api_key: Option<String>,
}

impl IngestConfig {
    pub fn new(url: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            session_id: session_id.into(),
            message_types: MessageType::ALL.to_vec(),
            api_key: None,
        }
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Server sent a close frame or the stream ended.
    Remote,
    Cancelled,
    /// The aggregator service is gone; nothing left to deliver to.
    ReceiverDropped,
    Error(String),
}

/// Per-connection frame counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Text and binary frames received.
    pub frames: u64,
    /// Envelopes forwarded to the aggregator.
    pub delivered: u64,
    /// Frames dropped as unparseable, invalid or for another subscription.
    pub discarded: u64,
    /// Unknown message types and unhandled frame types.
    pub ignored: u64,
}

type ClosedCallback = Box<dyn FnOnce(&CloseReason, &IngestStats) + Send>;

pub struct StreamIngestClient {
    config: IngestConfig,
    tx: mpsc::Sender<AggregatorCommand>,
    cancel: CancellationToken,
    on_closed: Option<ClosedCallback>,
    subscription_id: Option<String>,
    stats: IngestStats,
}

enum Step {
    Continue,
    Close(CloseReason),
}

impl StreamIngestClient {
    pub fn new(
        config: IngestConfig,
        tx: mpsc::Sender<AggregatorCommand>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            tx,
            cancel,
            on_closed: None,
            subscription_id: None,
            stats: IngestStats::default(),
        }
    }

    /// Invoked once when an established connection ends, for any reason.
    #[must_use]
    pub fn on_closed(
        mut self,
        callback: impl FnOnce(&CloseReason, &IngestStats) + Send + 'static,
    ) -> Self {
        self.on_closed = Some(Box::new(callback));
        self
    }

    /// Connect, subscribe and forward frames until the connection ends.
    pub async fn run(mut self) -> Result<IngestStats, IngestError> {
        let request = self.build_request()?;
        let (ws, response) = tokio::select! {
            _ = self.cancel.cancelled() => {
                info!("ingest: cancelled before connect");
                return Ok(self.stats);
            }
            connected = tokio_tungstenite::connect_async(request) => connected?,
        };
        let protocol = response
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        info!(url = %self.config.url, protocol, "ingest: connected");

        let (mut write, mut read) = ws.split();
        let subscribe = SubscribeRequest::new(
            self.config.session_id.clone(),
            self.config.message_types.clone(),
        );
        write.send(Message::Text(subscribe.to_text()?)).await?;
        debug!(
            session_id = %subscribe.session_id,
            types = subscribe.message_types.len(),
            "ingest: subscribe sent"
        );

        let reason = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    break CloseReason::Cancelled;
                }
                msg = read.next() => {
                    let step = match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.stats.frames += 1;
                            self.handle_text(&text).await
                        }
                        Some(Ok(Message::Binary(bytes))) => {
                            self.stats.frames += 1;
                            self.stats.discarded += 1;
                            debug!(len = bytes.len(), "ingest: binary frame discarded");
                            Step::Continue
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            match write.send(Message::Pong(payload)).await {
                                Ok(()) => Step::Continue,
                                Err(e) => Step::Close(CloseReason::Error(e.to_string())),
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            debug!(?frame, "ingest: close frame received");
                            Step::Close(CloseReason::Remote)
                        }
                        Some(Ok(_)) => Step::Continue,
                        Some(Err(e)) => {
                            warn!(error = %e, "ingest: read error");
                            Step::Close(CloseReason::Error(e.to_string()))
                        }
                        None => Step::Close(CloseReason::Remote),
                    };
                    if let Step::Close(reason) = step {
                        break reason;
                    }
                }
            }
        };

        info!(
            ?reason,
            frames = self.stats.frames,
            delivered = self.stats.delivered,
            discarded = self.stats.discarded,
            ignored = self.stats.ignored,
            "ingest: connection closed"
        );
        if let Some(callback) = self.on_closed.take() {
            callback(&reason, &self.stats);
        }
        Ok(self.stats)
    }

    fn build_request(
        &self,
    ) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, IngestError> {
        let mut request = self.config.url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));
        if let Some(key) = &self.config.api_key {
            let value =
                HeaderValue::from_str(key).map_err(|e| IngestError::Request(e.to_string()))?;
            headers.insert(API_KEY_HEADER, value);
        }
        Ok(request)
    }

    async fn handle_text(&mut self, text: &str) -> Step {
        match parse_frame(text) {
            Ok(InboundFrame::Event {
                subscription_id,
                envelope,
            }) => {
                if !self.accepts(subscription_id.as_deref()) {
                    self.stats.discarded += 1;
                    debug!(
                        subscription_id = subscription_id.as_deref().unwrap_or(""),
                        "ingest: event for another subscription discarded"
                    );
                    return Step::Continue;
                }
                let message_type = envelope.message_type;
                let sequence = envelope.sequence;
                if self.tx.send(AggregatorCommand::Envelope(envelope)).await.is_err() {
                    warn!("ingest: aggregator channel closed");
                    return Step::Close(CloseReason::ReceiverDropped);
                }
                self.stats.delivered += 1;
                trace!(%message_type, sequence, "ingest: envelope forwarded");
            }
            Ok(InboundFrame::UnknownEvent { message_type, .. }) => {
                self.stats.ignored += 1;
                trace!(%message_type, "ingest: unknown message type ignored");
            }
            Ok(InboundFrame::Ack { subscription_id }) => {
                info!(subscription_id = %subscription_id, "ingest: subscription acknowledged");
                self.subscription_id = Some(subscription_id);
            }
            Ok(InboundFrame::Error { detail }) => {
                warn!(detail = %detail, "ingest: server reported error");
            }
            Ok(InboundFrame::Other { kind }) => {
                self.stats.ignored += 1;
                trace!(%kind, "ingest: unhandled frame type ignored");
            }
            Err(FrameError::Invalid(e)) => {
                self.stats.discarded += 1;
                warn!(error = %e, "ingest: invalid envelope dropped");
            }
            Err(e) => {
                self.stats.discarded += 1;
                warn!(error = %e, "ingest: unparseable frame dropped");
            }
        }
        Step::Continue
    }

    /// Before the ack every event is accepted; after it only ours are.
    fn accepts(&self, subscription_id: Option<&str>) -> bool {
        match (&self.subscription_id, subscription_id) {
            (Some(ours), Some(theirs)) => ours == theirs,
            _ => true,
        }
    }
}
