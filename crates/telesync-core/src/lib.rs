//! telesync-core: data model and merge engine for client-side telemetry sync.
//!
//! No async and no network. The queue, stream and runtime crates wrap
//! these types with persistence, transport and a single-writer service.

pub mod aggregator;
pub mod envelope;
pub mod error;
pub mod graph;
pub mod overlay;
pub mod payload;
pub mod serde_helpers;
pub mod source;
pub mod telemetry;

pub use aggregator::{AggregatorStats, ApplyOutcome, VisualSnapshot, VisualStateAggregator};
pub use envelope::{EventBatch, EventEnvelope, EventQuality, PendingRecord, Scope, StreamType};
pub use error::{SyncError, ValidationError};
pub use graph::MpgGraphState;
pub use telemetry::{MessageType, RawTelemetryEnvelope, SourceLayer, TelemetryEnvelope, TypedTelemetry};
