// ABOUTME: Rate-limited asynchronous delivery with batched ack verification
// ABOUTME: Resyncs from the first unacknowledged message and drives checkpointing

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::event::OutboundMessage;
use crate::rate_limit::RateLimiter;
use crate::sink::{MessageSink, PublishHandle, SinkError};
use crate::tracker::PositionTracker;
use crate::utils::stop_requested;

#[derive(Debug, Clone, Copy)]
pub struct DeliveryConfig {
    /// Publishes between ack verifications.
    pub batch_size: usize,
    /// How long each handle is given to acknowledge during verification.
    pub ack_timeout: Duration,
    /// Fixed delay between attempts of a failed submission.
    pub retry_backoff: Duration,
    /// Bound on waiting for in-flight publishes at shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            ack_timeout: Duration::from_secs(30),
            retry_backoff: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

/// Outcome of one ack-batch verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    AllAcked { verified: usize },
    /// The handle at `failed_at` (0-based) failed; it and everything after
    /// it were republished synchronously.
    Resynced { failed_at: usize, republished: usize },
}

/// Publishes one source's messages. Owned by that source's submission loop.
pub struct DeliveryManager {
    source: String,
    sink: Arc<dyn MessageSink>,
    limiter: Arc<RateLimiter>,
    tracker: PositionTracker,
    config: DeliveryConfig,
    ack_batch: Vec<PublishHandle>,
    counter: usize,
    stop: Option<watch::Receiver<bool>>,
}

impl DeliveryManager {
    pub fn new(
        source: impl Into<String>,
        sink: Arc<dyn MessageSink>,
        limiter: Arc<RateLimiter>,
        tracker: PositionTracker,
        config: DeliveryConfig,
    ) -> Self {
        let batch_size = config.batch_size.max(1);
        Self {
            source: source.into(),
            sink,
            limiter,
            tracker,
            config: DeliveryConfig {
                batch_size,
                ..config
            },
            ack_batch: Vec::with_capacity(batch_size),
            counter: 0,
            stop: None,
        }
    }

    /// Gives up on submissions and republishes that are still retrying once
    /// `stop` turns `true`.
    pub fn with_stop_signal(mut self, stop: watch::Receiver<bool>) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.as_ref().is_some_and(|stop| *stop.borrow())
    }

    async fn stopped(&self) {
        match self.stop.clone() {
            Some(stop) => stop_requested(stop).await,
            None => std::future::pending().await,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Publishes since the last verification.
    pub fn counter(&self) -> usize {
        self.counter
    }

    pub fn pending_acks(&self) -> usize {
        self.ack_batch.len()
    }

    pub fn tracker(&self) -> &PositionTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut PositionTracker {
        &mut self.tracker
    }

    /// Publishes `message` and checkpoints its position once it holds a
    /// publish handle. Returns the verification outcome when this publish
    /// completed a batch. A message abandoned because the source is stopping
    /// is neither counted nor checkpointed.
    pub async fn deliver(&mut self, message: OutboundMessage) -> Option<BatchOutcome> {
        let Some(handle) = self.submit(&message).await else {
            tracing::warn!(
                source = %self.source,
                table = %message.table,
                position = %message.position,
                "source stopping; message left undelivered"
            );
            return None;
        };
        self.ack_batch.push(handle);
        self.counter += 1;

        if !message.operation.is_snapshot() {
            self.tracker.commit_position(&message.position).await;
        }

        if self.counter % self.config.batch_size == 0 {
            return Some(self.verify_batch().await);
        }
        None
    }

    async fn submit(&self, message: &OutboundMessage) -> Option<PublishHandle> {
        let mut attempt: u64 = 0;
        loop {
            tokio::select! {
                biased;
                _ = self.stopped() => return None,
                _ = self.limiter.acquire() => {}
            }
            match self.sink.publish_async(message).await {
                Ok(handle) => {
                    tracing::debug!(
                        source = %self.source,
                        table = %message.table,
                        event_name = %message.event_name,
                        position = %message.position,
                        "published"
                    );
                    return Some(handle);
                }
                Err(err) => {
                    attempt += 1;
                    tracing::warn!(
                        source = %self.source,
                        table = %message.table,
                        position = %message.position,
                        attempt,
                        error = %err,
                        "async publish failed, retrying in {:?}",
                        self.config.retry_backoff
                    );
                    tokio::select! {
                        biased;
                        _ = self.stopped() => return None,
                        _ = tokio::time::sleep(self.config.retry_backoff) => {}
                    }
                }
            }
        }
    }

    /// Waits for every outstanding ack in order. On the first failure the
    /// sink's in-flight state is discarded and the rest of the batch is
    /// republished synchronously. The batch is cleared and the counter reset
    /// either way.
    pub async fn verify_batch(&mut self) -> BatchOutcome {
        let mut handles = std::mem::take(&mut self.ack_batch);
        self.counter = 0;

        let mut failed_at = None;
        for (index, handle) in handles.iter_mut().enumerate() {
            if let Err(err) = handle.wait(self.config.ack_timeout).await {
                let message = handle.message();
                tracing::error!(
                    source = %self.source,
                    table = %message.table,
                    position = %message.position,
                    index,
                    error = %err,
                    "publish not acknowledged; resyncing from this message"
                );
                failed_at = Some(index);
                break;
            }
        }

        let Some(failed_at) = failed_at else {
            tracing::debug!(source = %self.source, verified = handles.len(), "ack batch verified");
            return BatchOutcome::AllAcked {
                verified: handles.len(),
            };
        };

        self.sink.discard_in_flight();
        let remaining: Vec<OutboundMessage> = handles
            .into_iter()
            .skip(failed_at)
            .map(PublishHandle::into_message)
            .collect();
        let mut republished = 0;
        for message in &remaining {
            if !self.republish(message).await {
                tracing::error!(
                    source = %self.source,
                    position = %message.position,
                    abandoned = remaining.len() - republished,
                    "source stopping; resync abandoned"
                );
                break;
            }
            republished += 1;
        }
        tracing::info!(
            source = %self.source,
            failed_at,
            republished,
            "ack batch resynced"
        );
        BatchOutcome::Resynced {
            failed_at,
            republished,
        }
    }

    /// Retries until the sink accepts `message`. Returns `false` if the
    /// source began stopping first.
    async fn republish(&self, message: &OutboundMessage) -> bool {
        let mut attempt: u64 = 0;
        loop {
            tokio::select! {
                biased;
                _ = self.stopped() => return false,
                _ = self.limiter.acquire() => {}
            }
            match self.sink.publish(message).await {
                Ok(()) => return true,
                Err(err) => {
                    attempt += 1;
                    tracing::warn!(
                        source = %self.source,
                        position = %message.position,
                        attempt,
                        error = %err,
                        "synchronous republish failed, retrying in {:?}",
                        self.config.retry_backoff
                    );
                }
            }
            tokio::select! {
                biased;
                _ = self.stopped() => return false,
                _ = tokio::time::sleep(self.config.retry_backoff) => {}
            }
        }
    }

    /// Waits for in-flight publishes, then releases the store. A drain
    /// timeout is logged and shutdown continues.
    pub async fn shutdown(&mut self) {
        match self.sink.await_all_complete(self.config.shutdown_timeout).await {
            Ok(()) => tracing::info!(source = %self.source, "in-flight publishes complete"),
            Err(SinkError::DrainTimeout(timeout)) => tracing::warn!(
                source = %self.source,
                "in-flight publishes still pending after {:?}; shutting down anyway",
                timeout
            ),
            Err(err) => tracing::warn!(
                source = %self.source,
                error = %err,
                "failed waiting for in-flight publishes"
            ),
        }
        if !self.ack_batch.is_empty() {
            tracing::warn!(
                source = %self.source,
                unverified = self.ack_batch.len(),
                "shutting down with unverified publishes"
            );
            self.ack_batch.clear();
        }

        if let Err(err) = self.tracker.close() {
            tracing::error!(source = %self.source, error = %err, "failed to close store");
        }
    }
}
