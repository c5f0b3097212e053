//! Single-writer service around the visual state aggregator.
//!
//! The service task owns the aggregator. Every mutation arrives as an
//! [`AggregatorCommand`] on one channel, is applied in order, and when it
//! changes state a fresh immutable snapshot is swapped into
//! [`SharedSnapshot`] before the next command is read. Readers clone the
//! inner `Arc` and never see a partially merged state.

use std::sync::Arc;

use telesync_core::{AggregatorStats, MpgGraphState, TypedTelemetry, VisualSnapshot, VisualStateAggregator};
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Latest published snapshot, replaced wholesale on every applied mutation.
pub type SharedSnapshot = Arc<RwLock<Arc<VisualSnapshot>>>;

#[derive(Debug, Clone)]
pub enum AggregatorCommand {
    Envelope(Box<TypedTelemetry>),
    LoadGraph(Box<MpgGraphState>),
    ClearRogue { rogue_id: String },
    ClearMufs { mufs_id: String },
}

impl From<TypedTelemetry> for AggregatorCommand {
    fn from(envelope: TypedTelemetry) -> Self {
        Self::Envelope(Box::new(envelope))
    }
}

/// Sent to subscribers after each snapshot publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotPublished {
    pub version: u64,
}

pub struct AggregatorService {
    aggregator: VisualStateAggregator,
    rx: mpsc::Receiver<AggregatorCommand>,
    shared: SharedSnapshot,
    notify_tx: broadcast::Sender<SnapshotPublished>,
    cancel: CancellationToken,
}

/// Cloneable access to a running [`AggregatorService`].
#[derive(Debug, Clone)]
pub struct AggregatorHandle {
    tx: mpsc::Sender<AggregatorCommand>,
    shared: SharedSnapshot,
    notify_tx: broadcast::Sender<SnapshotPublished>,
}

impl AggregatorService {
    pub fn new(
        aggregator: VisualStateAggregator,
        capacity: usize,
        cancel: CancellationToken,
    ) -> (Self, AggregatorHandle) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (notify_tx, _) = broadcast::channel(capacity.max(16));
        let shared: SharedSnapshot = Arc::new(RwLock::new(Arc::new(aggregator.snapshot())));
        let handle = AggregatorHandle {
            tx,
            shared: shared.clone(),
            notify_tx: notify_tx.clone(),
        };
        let service = Self {
            aggregator,
            rx,
            shared,
            notify_tx,
            cancel,
        };
        (service, handle)
    }

    /// Apply commands until every sender is dropped or the token fires.
    /// Merged state is kept either way; the final counters are returned.
    pub async fn run(mut self) -> AggregatorStats {
        info!("aggregator: service started");
        loop {
            tokio::select! {
                command = self.rx.recv() => {
                    match command {
                        Some(command) => self.handle(command).await,
                        None => {
                            info!("aggregator: command channel closed, shutting down");
                            break;
                        }
                    }
                }
                _ = self.cancel.cancelled() => {
                    info!("aggregator: cancellation requested, shutting down");
                    break;
                }
            }
        }
        self.aggregator.stats()
    }

    async fn handle(&mut self, command: AggregatorCommand) {
        let changed = match command {
            AggregatorCommand::Envelope(envelope) => {
                let (message_type, sequence) = (envelope.message_type, envelope.sequence);
                match self.aggregator.apply(*envelope).into_result(message_type, sequence) {
                    Ok(applied) => applied.is_some(),
                    Err(e) => {
                        trace!(error = %e, "aggregator: envelope not applied");
                        false
                    }
                }
            }
            AggregatorCommand::LoadGraph(graph) => {
                self.aggregator.load_graph_snapshot(*graph);
                true
            }
            AggregatorCommand::ClearRogue { rogue_id } => {
                self.aggregator.clear_rogue_overlay(&rogue_id).is_some()
            }
            AggregatorCommand::ClearMufs { mufs_id } => {
                self.aggregator.clear_mufs_overlay(&mufs_id).is_some()
            }
        };
        if changed {
            self.publish().await;
        }
    }

    async fn publish(&self) {
        let snapshot = Arc::new(self.aggregator.snapshot());
        let version = snapshot.version;
        debug!(
            version,
            nodes = snapshot.graph.nodes.len(),
            rogue = snapshot.overlays.rogue.len(),
            mufs = snapshot.overlays.mufs.len(),
            "aggregator: snapshot published"
        );
        *self.shared.write().await = snapshot;
        // No subscribers is fine.
        let _ = self.notify_tx.send(SnapshotPublished { version });
    }
}

impl AggregatorHandle {
    /// Sender for ingest clients and other producers.
    pub fn sender(&self) -> mpsc::Sender<AggregatorCommand> {
        self.tx.clone()
    }

    pub fn shared(&self) -> SharedSnapshot {
        self.shared.clone()
    }

    pub async fn snapshot(&self) -> Arc<VisualSnapshot> {
        self.shared.read().await.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SnapshotPublished> {
        self.notify_tx.subscribe()
    }

    /// Queue a command. Returns false once the service has stopped.
    pub async fn send(&self, command: AggregatorCommand) -> bool {
        self.tx.send(command).await.is_ok()
    }

    pub async fn load_graph(&self, graph: MpgGraphState) -> bool {
        self.send(AggregatorCommand::LoadGraph(Box::new(graph))).await
    }

    pub async fn clear_rogue(&self, rogue_id: impl Into<String>) -> bool {
        self.send(AggregatorCommand::ClearRogue {
            rogue_id: rogue_id.into(),
        })
        .await
    }

    pub async fn clear_mufs(&self, mufs_id: impl Into<String>) -> bool {
        self.send(AggregatorCommand::ClearMufs {
            mufs_id: mufs_id.into(),
        })
        .await
    }
}
