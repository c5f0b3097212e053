//! telesync-stream: inbound telemetry subscription and the aggregator service.

pub mod frame;
pub mod ingest;
pub mod service;

pub use frame::{InboundFrame, SUBPROTOCOL, SubscribeRequest, parse_frame};
pub use ingest::{CloseReason, IngestConfig, IngestError, IngestStats, StreamIngestClient};
pub use service::{
    AggregatorCommand, AggregatorHandle, AggregatorService, SharedSnapshot, SnapshotPublished,
};
