// ABOUTME: Integration tests for delivery, ack-batch resync and checkpointing
// ABOUTME: Drives DeliveryManager against MemorySink and a recording store

use std::sync::{Arc, Mutex};
use std::time::Duration;

use cdc_relay::delivery::{BatchOutcome, DeliveryConfig, DeliveryManager};
use cdc_relay::event::{Operation, OutboundMessage, PositionMarker};
use cdc_relay::rate_limit::RateLimiter;
use cdc_relay::sink::MemorySink;
use cdc_relay::tracker::PositionTracker;
use relay_store::{KvStore, KvWrite, MemoryKvStore, StoreError};

/// Store that records every integer write and can fail the first few.
#[derive(Default)]
struct RecordingStore {
    inner: MemoryKvStore,
    int_writes: Mutex<Vec<(String, i64)>>,
    failures_left: Mutex<usize>,
}

impl RecordingStore {
    fn failing(count: usize) -> Self {
        let store = Self::default();
        *store.failures_left.lock().unwrap() = count;
        store
    }

    fn writes_of(&self, key: &str) -> Vec<i64> {
        self.int_writes
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| *v)
            .collect()
    }

    fn maybe_fail(&self) -> Result<(), StoreError> {
        let mut left = self.failures_left.lock().unwrap();
        if *left > 0 {
            *left -= 1;
            return Err(StoreError::Unavailable("injected".into()));
        }
        Ok(())
    }
}

impl KvStore for RecordingStore {
    fn get_string(&self, namespace: &str, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get_string(namespace, key)
    }

    fn put_string(&self, namespace: &str, key: &str, value: &str) -> Result<(), StoreError> {
        self.maybe_fail()?;
        self.inner.put_string(namespace, key, value)
    }

    fn get_int(&self, namespace: &str, key: &str) -> Result<Option<i64>, StoreError> {
        self.inner.get_int(namespace, key)
    }

    fn put_int(&self, namespace: &str, key: &str, value: i64) -> Result<(), StoreError> {
        self.maybe_fail()?;
        self.int_writes
            .lock()
            .unwrap()
            .push((key.to_string(), value));
        self.inner.put_int(namespace, key, value)
    }

    fn put_many(&self, namespace: &str, writes: &[KvWrite<'_>]) -> Result<(), StoreError> {
        self.maybe_fail()?;
        {
            let mut recorded = self.int_writes.lock().unwrap();
            for write in writes {
                if let KvWrite::Int { key, value } = write {
                    recorded.push((key.to_string(), *value));
                }
            }
        }
        self.inner.put_many(namespace, writes)
    }

    fn close(&self) -> Result<(), StoreError> {
        self.inner.close()
    }
}

fn message(n: u64, offset: u64) -> OutboundMessage {
    OutboundMessage {
        event_name: "orders.created".into(),
        payload: format!(r#"{{"id":{n}}}"#).into_bytes(),
        dedup_key: format!("src1-orders-{n}"),
        position: PositionMarker::new("binlog.000001", offset),
        table: "orders".into(),
        operation: Operation::Insert,
    }
}

fn config(batch_size: usize) -> DeliveryConfig {
    DeliveryConfig {
        batch_size,
        ack_timeout: Duration::from_millis(50),
        retry_backoff: Duration::from_millis(1),
        shutdown_timeout: Duration::from_millis(50),
    }
}

fn manager(
    sink: Arc<MemorySink>,
    store: Option<Arc<dyn KvStore>>,
    batch_size: usize,
) -> DeliveryManager {
    DeliveryManager::new(
        "src1",
        sink,
        Arc::new(RateLimiter::unlimited()),
        PositionTracker::new("src1", store, Duration::from_millis(1)),
        config(batch_size),
    )
}

#[tokio::test]
async fn stalled_third_ack_resyncs_rest_of_batch() {
    let sink = Arc::new(MemorySink::new());
    sink.stall_ack(3);
    let mut delivery = manager(sink.clone(), None, 1000);

    let mut outcomes = Vec::new();
    for n in 1..=1000 {
        if let Some(outcome) = delivery.deliver(message(n, n * 10)).await {
            outcomes.push(outcome);
        }
    }

    assert_eq!(
        outcomes,
        vec![BatchOutcome::Resynced {
            failed_at: 2,
            republished: 998
        }]
    );
    assert_eq!(sink.discard_count(), 1);
    let republished = sink.published_sync();
    assert_eq!(republished.len(), 998);
    assert_eq!(republished.first().unwrap().dedup_key, "src1-orders-3");
    assert_eq!(republished.last().unwrap().dedup_key, "src1-orders-1000");
    assert_eq!(delivery.counter(), 0);
    assert_eq!(delivery.pending_acks(), 0);

    // The next batch starts from a clean slate.
    assert_eq!(delivery.deliver(message(1001, 10_010)).await, None);
    assert_eq!(delivery.counter(), 1);
}

#[tokio::test]
async fn persisted_positions_are_non_decreasing() {
    let sink = Arc::new(MemorySink::new());
    let store = Arc::new(RecordingStore::default());
    let mut delivery = manager(sink, Some(store.clone()), 4);

    // Rows of one event share a position; a stale position must not be written.
    for (n, offset) in [(1, 100), (2, 100), (3, 250), (4, 180), (5, 400), (6, 400)] {
        delivery.deliver(message(n, offset)).await;
    }

    let writes = store.writes_of("src1-POS");
    assert_eq!(writes, vec![100, 250, 400]);
    assert!(writes.windows(2).all(|pair| pair[0] <= pair[1]));
}

#[tokio::test]
async fn store_failures_are_retried_until_written() {
    let sink = Arc::new(MemorySink::new());
    let store = Arc::new(RecordingStore::failing(3));
    let mut delivery = manager(sink, Some(store.clone()), 10);

    delivery.deliver(message(1, 77)).await;
    assert_eq!(store.writes_of("src1-POS"), vec![77]);
    assert_eq!(
        store.get_string("source-src1", "src1-POSNAME").unwrap(),
        Some("binlog.000001".into())
    );
}

#[tokio::test]
async fn position_is_written_only_after_publish_handle() {
    let sink = Arc::new(MemorySink::new());
    sink.fail_next_async(2);
    let store = Arc::new(RecordingStore::default());
    let mut delivery = manager(sink.clone(), Some(store.clone()), 10);

    delivery.deliver(message(1, 55)).await;
    assert_eq!(sink.published_async().len(), 1);
    assert_eq!(store.writes_of("src1-POS"), vec![55]);
}

#[tokio::test]
async fn shutdown_closes_the_store() {
    let sink = Arc::new(MemorySink::new());
    let store = Arc::new(MemoryKvStore::new());
    let mut delivery = manager(sink, Some(store.clone()), 10);
    delivery.deliver(message(1, 10)).await;
    delivery.shutdown().await;
    assert!(store.is_closed());
}
