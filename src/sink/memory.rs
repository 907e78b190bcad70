// ABOUTME: In-memory message sink that records everything it is given
// ABOUTME: Can stall acks and fail submissions to exercise delivery resync

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

use super::{MessageSink, PublishHandle, SinkError};
use crate::event::OutboundMessage;

#[derive(Default)]
struct State {
    published_async: Vec<OutboundMessage>,
    published_sync: Vec<OutboundMessage>,
    /// 1-based ordinals of async publishes whose ack is withheld.
    stalled: BTreeSet<usize>,
    held: Vec<oneshot::Sender<Result<(), SinkError>>>,
    fail_async: usize,
    fail_sync: usize,
    discards: usize,
}

/// Sink for tests and dry runs.
#[derive(Default)]
pub struct MemorySink {
    state: Mutex<State>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Withholds the ack of the `ordinal`-th async publish (1-based).
    pub fn stall_ack(&self, ordinal: usize) {
        self.state().stalled.insert(ordinal);
    }

    /// The next `count` async submissions fail with a transport error.
    pub fn fail_next_async(&self, count: usize) {
        self.state().fail_async = count;
    }

    /// The next `count` synchronous publishes fail with a transport error.
    pub fn fail_next_sync(&self, count: usize) {
        self.state().fail_sync = count;
    }

    /// Messages accepted through `publish_async`, in submission order.
    pub fn published_async(&self) -> Vec<OutboundMessage> {
        self.state().published_async.clone()
    }

    /// Messages confirmed through `publish`, in order.
    pub fn published_sync(&self) -> Vec<OutboundMessage> {
        self.state().published_sync.clone()
    }

    /// Every accepted message, async first then sync.
    pub fn all_published(&self) -> Vec<OutboundMessage> {
        let state = self.state();
        state
            .published_async
            .iter()
            .chain(state.published_sync.iter())
            .cloned()
            .collect()
    }

    pub fn discard_count(&self) -> usize {
        self.state().discards
    }

    pub fn held_acks(&self) -> usize {
        self.state().held.len()
    }
}

#[async_trait]
impl MessageSink for MemorySink {
    async fn publish_async(&self, message: &OutboundMessage) -> Result<PublishHandle, SinkError> {
        let mut state = self.state();
        if state.fail_async > 0 {
            state.fail_async -= 1;
            return Err(SinkError::Transport("injected submission failure".into()));
        }

        state.published_async.push(message.clone());
        let ordinal = state.published_async.len();
        let (tx, rx) = oneshot::channel();
        if state.stalled.contains(&ordinal) {
            state.held.push(tx);
        } else {
            let _ = tx.send(Ok(()));
        }
        Ok(PublishHandle::new(message.clone(), rx))
    }

    async fn publish(&self, message: &OutboundMessage) -> Result<(), SinkError> {
        let mut state = self.state();
        if state.fail_sync > 0 {
            state.fail_sync -= 1;
            return Err(SinkError::Transport("injected publish failure".into()));
        }
        state.published_sync.push(message.clone());
        Ok(())
    }

    fn discard_in_flight(&self) {
        let mut state = self.state();
        state.discards += 1;
        state.held.clear();
    }

    async fn await_all_complete(&self, timeout: Duration) -> Result<(), SinkError> {
        if self.held_acks() == 0 {
            return Ok(());
        }
        tokio::time::sleep(timeout).await;
        Err(SinkError::DrainTimeout(timeout))
    }
}
