//! `telesync run`: every long-lived task, wired together until Ctrl-C.
//!
//! Outbound: source pump → queue store → periodic flush. Inbound: stream
//! subscription → aggregator service → snapshot log. Retry scheduling for
//! failed flushes lives here, as the next tick of the flush timer.

use std::sync::Arc;
use std::time::Duration;

use telesync_core::source::{
    JsonlReplaySource, SourceAvailability, SourceError, TelemetrySource, UnavailableSource,
};
use telesync_core::{EventEnvelope, MessageType, PendingRecord, VisualStateAggregator};
use telesync_queue::{
    DeliveryCourier, DeliveryError, DurableQueueStore, HttpSink, RemoteSink, SqliteQueueStore,
    StoreError,
};
use telesync_stream::{AggregatorHandle, AggregatorService, IngestConfig, StreamIngestClient};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{SourceConfig, SyncConfig};

// ─── Building blocks ──────────────────────────────────────────────

pub fn open_store(config: &SyncConfig) -> anyhow::Result<Arc<dyn DurableQueueStore>> {
    let store = SqliteQueueStore::open(&config.outbound.db_path)?;
    Ok(Arc::new(store))
}

pub fn http_client() -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder().build()?)
}

pub fn build_courier(
    config: &SyncConfig,
    store: Arc<dyn DurableQueueStore>,
) -> anyhow::Result<DeliveryCourier<HttpSink>> {
    let sink = HttpSink::new(http_client()?, config.events_url())
        .with_api_key(config.outbound.api_key.clone());
    Ok(DeliveryCourier::new(store, sink, config.outbound.send_timeout()))
}

pub fn open_source(config: &SourceConfig) -> Result<Box<dyn TelemetrySource>, SourceError> {
    match &config.replay_path {
        Some(path) => Ok(Box::new(JsonlReplaySource::open(path)?)),
        None => Ok(Box::new(UnavailableSource::new(
            "wearable",
            "no wearable sensor bridge on this platform",
        ))),
    }
}

fn ingest_config(config: &SyncConfig) -> Option<IngestConfig> {
    let url = config.inbound.url.clone()?;
    let message_types: Vec<MessageType> = config
        .inbound
        .message_types
        .iter()
        .copied()
        .filter(|t| *t != MessageType::Unknown)
        .collect();
    Some(IngestConfig {
        url,
        session_id: config.inbound.session_id.clone(),
        message_types,
        api_key: config.inbound.api_key.clone(),
    })
}

// ─── Outbound ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnqueueSummary {
    pub enqueued: usize,
    pub invalid: usize,
}

/// Validate and upsert envelopes. Invalid ones are skipped and counted.
pub fn enqueue_envelopes(
    store: &dyn DurableQueueStore,
    envelopes: impl IntoIterator<Item = EventEnvelope>,
    priority: i64,
) -> Result<EnqueueSummary, StoreError> {
    let mut summary = EnqueueSummary::default();
    for envelope in envelopes {
        if let Err(e) = envelope.validate() {
            warn!(event_id = %envelope.event_id, error = %e, "pump: invalid envelope skipped");
            summary.invalid += 1;
            continue;
        }
        let record = PendingRecord::from_envelope(&envelope, priority)?;
        store.insert(&record)?;
        summary.enqueued += 1;
    }
    Ok(summary)
}

pub fn pump_once(
    source: &mut dyn TelemetrySource,
    store: &dyn DurableQueueStore,
    config: &SourceConfig,
) -> anyhow::Result<EnqueueSummary> {
    let envelopes = source.poll(config.poll_batch.max(1))?;
    Ok(enqueue_envelopes(store, envelopes, config.priority)?)
}

async fn pump_loop(
    mut source: Box<dyn TelemetrySource>,
    store: Arc<dyn DurableQueueStore>,
    config: SourceConfig,
    cancel: CancellationToken,
) {
    if let SourceAvailability::Unavailable { reason } = source.availability() {
        info!(source = source.name(), reason = %reason, "pump: source unavailable, not polling");
        return;
    }
    let mut ticker = tokio::time::interval(Duration::from_millis(config.poll_interval_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match pump_once(source.as_mut(), store.as_ref(), &config) {
                    Ok(summary) if summary.enqueued > 0 || summary.invalid > 0 => {
                        debug!(
                            source = source.name(),
                            enqueued = summary.enqueued,
                            invalid = summary.invalid,
                            "pump: polled"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => warn!(source = source.name(), error = %e, "pump: poll failed"),
                }
            }
        }
    }
}

/// Flush full batches back to back until the queue has less than one left.
/// Returns the number of envelopes delivered.
pub async fn flush_until_drained<S: RemoteSink>(
    courier: &DeliveryCourier<S>,
    batch_size: usize,
) -> Result<usize, DeliveryError> {
    let batch_size = batch_size.max(1);
    let mut total = 0;
    loop {
        let outcome = courier.flush(batch_size).await?;
        total += outcome.sent;
        // a short batch means nothing decodable is left unclaimed
        if outcome.sent < batch_size {
            return Ok(total);
        }
    }
}

async fn flush_loop<S: RemoteSink>(
    courier: Arc<DeliveryCourier<S>>,
    batch_size: usize,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match flush_until_drained(&courier, batch_size).await {
                    Ok(0) => {}
                    Ok(sent) => debug!(sent, "run: flush tick delivered"),
                    Err(e) => warn!(
                        retryable = e.is_retryable(),
                        error = %e,
                        "run: flush failed, retrying next tick"
                    ),
                }
            }
        }
    }
}

// ─── Inbound ──────────────────────────────────────────────────────

async fn log_snapshots(handle: AggregatorHandle, cancel: CancellationToken) {
    let mut rx = handle.subscribe();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            note = rx.recv() => match note {
                Ok(note) => {
                    let snapshot = handle.snapshot().await;
                    debug!(
                        version = note.version,
                        nodes = snapshot.graph.nodes.len(),
                        hotspots = snapshot.hotspot_node_ids().len(),
                        ghosts = snapshot.ghost_node_ids().len(),
                        "run: snapshot"
                    );
                }
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "run: snapshot log lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }
}

// ─── Entry point ──────────────────────────────────────────────────

pub async fn run_sync(config: SyncConfig) -> anyhow::Result<()> {
    info!(
        db = %config.outbound.db_path.display(),
        events_url = %config.events_url(),
        stream = ?config.inbound.url,
        "run: starting"
    );
    let cancel = CancellationToken::new();

    let store = open_store(&config)?;
    let courier = Arc::new(build_courier(&config, store.clone())?);
    info!(pending = store.len()?, "run: queue opened");

    let (service, handle) = AggregatorService::new(
        VisualStateAggregator::new(),
        config.inbound.channel_capacity,
        cancel.child_token(),
    );
    let service_task = tokio::spawn(service.run());
    let log_task = tokio::spawn(log_snapshots(handle.clone(), cancel.child_token()));

    let ingest_task = ingest_config(&config).map(|ingest| {
        let client = StreamIngestClient::new(ingest, handle.sender(), cancel.child_token())
            .on_closed(|reason, stats| {
                info!(?reason, delivered = stats.delivered, "run: stream closed");
            });
        tokio::spawn(async move {
            if let Err(e) = client.run().await {
                warn!(error = %e, "run: stream subscription failed");
            }
        })
    });
    if ingest_task.is_none() {
        info!("run: no inbound url configured, stream ingest disabled");
    }

    let source = open_source(&config.source)?;
    let pump_task = tokio::spawn(pump_loop(
        source,
        store.clone(),
        config.source.clone(),
        cancel.child_token(),
    ));
    let flush_task = tokio::spawn(flush_loop(
        courier.clone(),
        config.outbound.batch_size,
        config.outbound.flush_interval(),
        cancel.child_token(),
    ));

    tokio::signal::ctrl_c().await?;
    info!("run: received ctrl-c, shutting down");
    cancel.cancel();

    for (name, task) in [("pump", pump_task), ("flush", flush_task), ("snapshot log", log_task)] {
        if let Err(e) = task.await {
            warn!(task = name, error = %e, "run: task panicked");
        }
    }
    if let Some(task) = ingest_task {
        if let Err(e) = task.await {
            warn!(task = "ingest", error = %e, "run: task panicked");
        }
    }
    let stats = service_task.await?;
    info!(
        applied = stats.applied,
        stale = stats.stale,
        duplicate = stats.duplicate,
        ignored = stats.ignored,
        rejected = stats.rejected,
        "run: aggregator stopped"
    );

    match flush_until_drained(&courier, config.outbound.batch_size).await {
        Ok(sent) => info!(sent, pending = store.len()?, "run: final flush"),
        Err(e) => warn!(error = %e, pending = store.len()?, "run: final flush failed, records kept"),
    }
    Ok(())
}
