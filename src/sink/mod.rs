// ABOUTME: Message sink boundary used by the delivery manager
// ABOUTME: Async publish returns a handle whose ack resolves later

pub mod http;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::event::OutboundMessage;

pub use http::{HttpSink, HttpSinkConfig};
pub use memory::MemorySink;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SinkError {
    #[error("no acknowledgement within {0:?}")]
    AckTimeout(Duration),
    #[error("acknowledgement channel dropped before an answer arrived")]
    AckDropped,
    #[error("sink rejected message with status {status}")]
    Rejected { status: u16 },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("timed out waiting for in-flight publishes after {0:?}")]
    DrainTimeout(Duration),
    #[error("sink is closed")]
    Closed,
}

/// Pending acknowledgement for one asynchronously published message.
///
/// Keeps the message so it can be republished if the ack never arrives.
#[derive(Debug)]
pub struct PublishHandle {
    message: OutboundMessage,
    ack: oneshot::Receiver<Result<(), SinkError>>,
}

impl PublishHandle {
    pub fn new(message: OutboundMessage, ack: oneshot::Receiver<Result<(), SinkError>>) -> Self {
        Self { message, ack }
    }

    /// A handle that is already acknowledged.
    pub fn acked(message: OutboundMessage) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Ok(()));
        Self::new(message, rx)
    }

    pub fn message(&self) -> &OutboundMessage {
        &self.message
    }

    pub fn into_message(self) -> OutboundMessage {
        self.message
    }

    /// Waits up to `timeout` for the ack.
    pub async fn wait(&mut self, timeout: Duration) -> Result<(), SinkError> {
        match tokio::time::timeout(timeout, &mut self.ack).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(SinkError::AckDropped),
            Err(_) => Err(SinkError::AckTimeout(timeout)),
        }
    }
}

/// Message bus transport.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Submits `message` and returns as soon as the sink has accepted it for
    /// delivery. An error here means the submission itself failed.
    async fn publish_async(&self, message: &OutboundMessage) -> Result<PublishHandle, SinkError>;

    /// Publishes `message` and waits for the sink to confirm it.
    async fn publish(&self, message: &OutboundMessage) -> Result<(), SinkError>;

    /// Drops every in-flight asynchronous publish; their handles resolve
    /// as failed or never resolve.
    fn discard_in_flight(&self);

    /// Waits until every in-flight asynchronous publish has finished.
    async fn await_all_complete(&self, timeout: Duration) -> Result<(), SinkError>;
}
