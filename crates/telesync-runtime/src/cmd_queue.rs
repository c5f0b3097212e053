//! `telesync enqueue`, `telesync flush`, `telesync pending`: one-shot
//! operations on the outbound queue.

use std::path::Path;

use serde_json::{Value, json};
use telesync_core::PendingRecord;
use telesync_core::source::{JsonlReplaySource, TelemetrySource};
use telesync_queue::DurableQueueStore;

use crate::config::SyncConfig;
use crate::run::{EnqueueSummary, build_courier, enqueue_envelopes, open_store};

/// Read every envelope in a JSONL file into the queue.
pub fn enqueue_file(
    store: &dyn DurableQueueStore,
    path: &Path,
    priority: i64,
) -> anyhow::Result<EnqueueSummary> {
    let mut source = JsonlReplaySource::open(path)?;
    let mut total = EnqueueSummary::default();
    while !source.is_exhausted() {
        let envelopes = source.poll(256)?;
        let summary = enqueue_envelopes(store, envelopes, priority)?;
        total.enqueued += summary.enqueued;
        total.invalid += summary.invalid;
    }
    Ok(total)
}

pub fn cmd_enqueue(config: &SyncConfig, path: &Path, priority: i64) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let summary = enqueue_file(store.as_ref(), path, priority)?;
    println!(
        "enqueued {} ({} invalid skipped), {} pending",
        summary.enqueued,
        summary.invalid,
        store.len()?
    );
    Ok(())
}

/// One flush of up to `batch_size` records. A failed send is an error, so
/// the process exits non-zero and the records stay queued.
pub async fn cmd_flush(config: &SyncConfig) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let courier = build_courier(config, store.clone())?;
    let outcome = courier.flush(config.outbound.batch_size).await?;
    println!(
        "sent {}, deleted {}, skipped {} undecodable, {} pending",
        outcome.sent,
        outcome.deleted,
        outcome.skipped_undecodable,
        store.len()?
    );
    Ok(())
}

/// JSON line for one pending record. Payloads that no longer decode are
/// shown raw.
pub(crate) fn pending_line(record: &PendingRecord) -> Value {
    let body = match serde_json::from_str::<Value>(&record.payload) {
        Ok(envelope) => json!({ "envelope": envelope }),
        Err(_) => json!({ "raw": record.payload }),
    };
    let mut line = json!({
        "id": record.id,
        "priority": record.priority,
        "revision": record.revision,
    });
    if let (Some(line), Value::Object(body)) = (line.as_object_mut(), body) {
        line.extend(body);
    }
    line
}

pub fn cmd_pending(config: &SyncConfig, limit: usize) -> anyhow::Result<()> {
    let store = open_store(config)?;
    for record in store.load_oldest(limit)? {
        println!("{}", serde_json::to_string(&pending_line(&record))?);
    }
    Ok(())
}
