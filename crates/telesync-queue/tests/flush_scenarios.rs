use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use telesync_core::{EventBatch, EventEnvelope, PendingRecord, StreamType};
use telesync_queue::{
    DeliveryCourier, DeliveryError, DurableQueueStore, FlushOutcome, MemoryQueueStore, RemoteSink,
    SqliteQueueStore,
};

// ─── Fixtures ─────────────────────────────────────────────────────

#[derive(Default)]
struct Recorder {
    batches: Mutex<Vec<Vec<String>>>,
}

impl Recorder {
    fn record(&self, batch: &EventBatch) {
        self.batches
            .lock()
            .unwrap()
            .push(batch.events.iter().map(|e| e.event_id.clone()).collect());
    }

    fn batches(&self) -> Vec<Vec<String>> {
        self.batches.lock().unwrap().clone()
    }
}

enum Behaviour {
    Accept,
    Reject(u16),
    Unreachable,
    Delay(Duration),
}

struct ScriptedSink {
    recorder: Arc<Recorder>,
    behaviour: Behaviour,
}

impl RemoteSink for ScriptedSink {
    async fn send(&self, batch: &EventBatch) -> Result<(), DeliveryError> {
        self.recorder.record(batch);
        match self.behaviour {
            Behaviour::Accept => Ok(()),
            Behaviour::Reject(status) => Err(DeliveryError::Rejected {
                status,
                retryable: status >= 500,
            }),
            Behaviour::Unreachable => Err(DeliveryError::Transport("connection refused".into())),
            Behaviour::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }
}

/// Re-enqueues one id while the batch is in flight, then accepts.
struct ReenqueueingSink {
    store: Arc<dyn DurableQueueStore>,
    id: String,
}

impl RemoteSink for ReenqueueingSink {
    async fn send(&self, _batch: &EventBatch) -> Result<(), DeliveryError> {
        self.store
            .insert(&PendingRecord::new(self.id.clone(), payload_for(&self.id), 0))
            .unwrap();
        Ok(())
    }
}

fn envelope(id: &str) -> EventEnvelope {
    let mut env = EventEnvelope::new(
        "participant-1",
        "wristband",
        StreamType::Somatic,
        Utc::now(),
        serde_json::json!({ "hr": 72.0 }),
    );
    env.event_id = id.to_string();
    env
}

fn payload_for(id: &str) -> String {
    serde_json::to_string(&envelope(id)).unwrap()
}

fn courier_with(
    store: Arc<dyn DurableQueueStore>,
    behaviour: Behaviour,
    timeout: Duration,
) -> (DeliveryCourier<ScriptedSink>, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let sink = ScriptedSink {
        recorder: recorder.clone(),
        behaviour,
    };
    (DeliveryCourier::new(store, sink, timeout), recorder)
}

fn sqlite() -> Arc<dyn DurableQueueStore> {
    Arc::new(SqliteQueueStore::open_in_memory().unwrap())
}

fn ids(store: &Arc<dyn DurableQueueStore>) -> Vec<String> {
    store
        .load_oldest(1000)
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect()
}

// ─── Scenarios ────────────────────────────────────────────────────

#[tokio::test]
async fn successful_flush_delivers_everything_and_empties_store() {
    let store = sqlite();
    let (courier, recorder) = courier_with(store.clone(), Behaviour::Accept, Duration::from_secs(5));
    let expected: Vec<String> = (0..25).map(|i| format!("evt-{i:02}")).collect();
    for id in &expected {
        courier.enqueue(&envelope(id), 0).unwrap();
    }

    let outcome = courier.flush(100).await.unwrap();
    assert_eq!(outcome.sent, 25);
    assert_eq!(outcome.deleted, 25);
    assert_eq!(recorder.batches(), vec![expected]);
    assert!(store.is_empty().unwrap());
}

#[tokio::test]
async fn failed_flush_leaves_store_unchanged() {
    for behaviour in [Behaviour::Unreachable, Behaviour::Reject(503), Behaviour::Reject(400)] {
        let store = sqlite();
        let (courier, recorder) = courier_with(store.clone(), behaviour, Duration::from_secs(5));
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            courier.enqueue(&envelope(id), i as i64).unwrap();
        }
        let before = store.load_oldest(100).unwrap();

        assert!(courier.flush(10).await.is_err());
        assert_eq!(recorder.batches().len(), 1);
        assert_eq!(store.load_oldest(100).unwrap(), before);
    }
}

#[tokio::test]
async fn permanent_rejection_is_reported_as_not_retryable() {
    let (courier, _) = courier_with(sqlite(), Behaviour::Reject(422), Duration::from_secs(5));
    courier.enqueue(&envelope("a"), 0).unwrap();
    let err = courier.flush(10).await.unwrap_err();
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn send_timeout_counts_as_failure() {
    let store = sqlite();
    let (courier, _) = courier_with(
        store.clone(),
        Behaviour::Delay(Duration::from_secs(30)),
        Duration::from_millis(50),
    );
    courier.enqueue(&envelope("slow"), 0).unwrap();

    let err = courier.flush(10).await.unwrap_err();
    assert!(matches!(err, DeliveryError::Timeout(_)));
    assert!(err.is_retryable());
    assert_eq!(ids(&store), vec!["slow"]);
}

#[tokio::test]
async fn priority_order_then_noop_on_second_flush() {
    let store = sqlite();
    let (courier, recorder) = courier_with(store.clone(), Behaviour::Accept, Duration::from_secs(5));
    courier.enqueue(&envelope("A"), 1).unwrap();
    courier.enqueue(&envelope("B"), 0).unwrap();

    assert_eq!(ids(&store), vec!["B", "A"]);

    let first = courier.flush(10).await.unwrap();
    assert_eq!(first.sent, 2);
    assert_eq!(recorder.batches(), vec![vec!["B".to_string(), "A".to_string()]]);
    assert!(store.is_empty().unwrap());

    let second = courier.flush(10).await.unwrap();
    assert_eq!(second, FlushOutcome::empty());
    assert_eq!(recorder.batches().len(), 1);
}

#[tokio::test]
async fn empty_queue_never_invokes_sink() {
    let (courier, recorder) = courier_with(sqlite(), Behaviour::Accept, Duration::from_secs(5));
    assert!(courier.flush(10).await.unwrap().is_empty());
    assert!(recorder.batches().is_empty());
}

#[tokio::test]
async fn reenqueue_of_same_id_is_a_single_record() {
    let store = sqlite();
    let (courier, _) = courier_with(store.clone(), Behaviour::Accept, Duration::from_secs(5));
    let env = envelope("dup");
    courier.enqueue(&env, 3).unwrap();
    courier.enqueue(&env, 1).unwrap();

    let pending = store.load_oldest(10).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].priority, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_flushes_never_share_a_record() {
    let store: Arc<dyn DurableQueueStore> = Arc::new(MemoryQueueStore::new());
    let (courier, recorder) = courier_with(
        store.clone(),
        Behaviour::Delay(Duration::from_millis(100)),
        Duration::from_secs(5),
    );
    for i in 0..10 {
        courier.enqueue(&envelope(&format!("evt-{i}")), 0).unwrap();
    }

    let (a, b) = tokio::join!(courier.flush(4), courier.flush(4));
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.sent + b.sent, 8);

    let batches = recorder.batches();
    assert_eq!(batches.len(), 2);
    let first: HashSet<&String> = batches[0].iter().collect();
    let second: HashSet<&String> = batches[1].iter().collect();
    assert!(first.is_disjoint(&second));
    assert_eq!(store.len().unwrap(), 2);
}

#[tokio::test]
async fn upsert_during_flush_survives_delete() {
    let store = sqlite();
    let sink = ReenqueueingSink {
        store: store.clone(),
        id: "a".into(),
    };
    let courier = DeliveryCourier::new(store.clone(), sink, Duration::from_secs(5));
    courier.enqueue(&envelope("a"), 0).unwrap();
    courier.enqueue(&envelope("b"), 0).unwrap();

    let outcome = courier.flush(10).await.unwrap();
    assert_eq!(outcome.sent, 2);
    assert_eq!(outcome.deleted, 1);

    let left = store.load_oldest(10).unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].id, "a");
    assert_eq!(left[0].revision, 1);
}
