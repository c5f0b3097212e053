//! Delivery courier: drains the durable queue into a remote sink.
//!
//! One `flush` is one send. Records are deleted only after the sink
//! confirms acceptance; any failure leaves the store exactly as it was.
//! Retry scheduling belongs to the caller.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use telesync_core::{EventBatch, EventEnvelope, PendingRecord};
use tracing::{debug, info, warn};

use crate::error::{DeliveryError, StoreError};
use crate::store::DurableQueueStore;

/// Remote-send operation invoked once per non-empty flush.
pub trait RemoteSink: Send + Sync {
    fn send(&self, batch: &EventBatch) -> impl Future<Output = Result<(), DeliveryError>> + Send;
}

impl<T: RemoteSink> RemoteSink for Arc<T> {
    fn send(&self, batch: &EventBatch) -> impl Future<Output = Result<(), DeliveryError>> + Send {
        (**self).send(batch)
    }
}

/// Result of a successful flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Envelopes handed to the sink.
    pub sent: usize,
    /// Records removed afterwards. Lower than `sent` when some ids were
    /// re-enqueued while the send was in flight.
    pub deleted: usize,
    /// Records left in place because their payload no longer decodes.
    pub skipped_undecodable: usize,
}

impl FlushOutcome {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.sent == 0
    }
}

pub struct DeliveryCourier<S> {
    store: Arc<dyn DurableQueueStore>,
    sink: S,
    send_timeout: Duration,
    /// Ids held by an in-flight flush. Every record is in at most one batch.
    claimed: Mutex<HashSet<String>>,
}

struct Claimed {
    keys: Vec<(String, u64)>,
    envelopes: Vec<EventEnvelope>,
    skipped_undecodable: usize,
}

/// Releases a batch's claims when the flush ends, however it ends.
struct ClaimGuard<'a> {
    claimed: &'a Mutex<HashSet<String>>,
    ids: Vec<String>,
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        match self.claimed.lock() {
            Ok(mut set) => {
                for id in &self.ids {
                    set.remove(id);
                }
            }
            Err(_) => warn!("courier: claim set poisoned; claims not released"),
        }
    }
}

impl<S: RemoteSink> DeliveryCourier<S> {
    pub fn new(store: Arc<dyn DurableQueueStore>, sink: S, send_timeout: Duration) -> Self {
        Self {
            store,
            sink,
            send_timeout,
            claimed: Mutex::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn DurableQueueStore> {
        &self.store
    }

    /// Serialize and upsert one envelope. Returns the stored revision.
    pub fn enqueue(&self, envelope: &EventEnvelope, priority: i64) -> Result<u64, StoreError> {
        let record = PendingRecord::from_envelope(envelope, priority)?;
        let revision = self.store.insert(&record)?;
        debug!(event_id = %envelope.event_id, priority, revision, "courier: enqueued");
        Ok(revision)
    }

    /// Send up to `batch_size` of the oldest pending records in one request.
    pub async fn flush(&self, batch_size: usize) -> Result<FlushOutcome, DeliveryError> {
        if batch_size == 0 {
            return Ok(FlushOutcome::empty());
        }

        let batch = self.claim(batch_size)?;
        if batch.envelopes.is_empty() {
            return Ok(FlushOutcome {
                skipped_undecodable: batch.skipped_undecodable,
                ..FlushOutcome::empty()
            });
        }
        let _guard = ClaimGuard {
            claimed: &self.claimed,
            ids: batch.keys.iter().map(|(id, _)| id.clone()).collect(),
        };

        let sent = batch.envelopes.len();
        let body = EventBatch {
            events: batch.envelopes,
        };
        let result = match tokio::time::timeout(self.send_timeout, self.sink.send(&body)).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout(self.send_timeout)),
        };
        if let Err(e) = result {
            warn!(
                batch = sent,
                retryable = e.is_retryable(),
                error = %e,
                "courier: send failed; records kept"
            );
            return Err(e);
        }

        let deleted = self.store.delete_exact(&batch.keys)?;
        if deleted < sent {
            debug!(
                sent,
                deleted,
                "courier: records re-enqueued during send were kept"
            );
        }
        info!(sent, deleted, "courier: batch delivered");
        Ok(FlushOutcome {
            sent,
            deleted,
            skipped_undecodable: batch.skipped_undecodable,
        })
    }

    /// Read the next batch and claim it. Holding the claim lock across the
    /// read keeps concurrent flushes from picking the same records.
    /// Undecodable and already-claimed rows do not use up the batch: the
    /// read window widens until `batch_size` records decode or the store
    /// has nothing further to offer.
    fn claim(&self, batch_size: usize) -> Result<Claimed, DeliveryError> {
        let mut claimed = self.claimed.lock().map_err(|_| StoreError::Poisoned)?;
        let mut window = batch_size + claimed.len();
        loop {
            let records = self.store.load_oldest(window)?;
            let end_of_store = records.len() < window;

            let mut batch = Claimed {
                keys: Vec::new(),
                envelopes: Vec::new(),
                skipped_undecodable: 0,
            };
            let mut undecodable = Vec::new();
            for record in records {
                if batch.envelopes.len() == batch_size {
                    break;
                }
                if claimed.contains(&record.id) {
                    continue;
                }
                match record.decode() {
                    Ok(envelope) => {
                        batch.keys.push((record.id, record.revision));
                        batch.envelopes.push(envelope);
                    }
                    Err(e) => {
                        batch.skipped_undecodable += 1;
                        undecodable.push((record.id, e));
                    }
                }
            }

            if batch.envelopes.len() == batch_size || end_of_store {
                for (id, e) in &undecodable {
                    warn!(id = %id, error = %e, "courier: undecodable record skipped");
                }
                for (id, _) in &batch.keys {
                    claimed.insert(id.clone());
                }
                return Ok(batch);
            }
            window = window.saturating_mul(2);
        }
    }
}
