// ABOUTME: HTTP message sink posting each event to {base_url}/{event_name}
// ABOUTME: In-flight posts run in a JoinSet so they can be aborted or drained

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use tokio::sync::oneshot;
use tokio::task::JoinSet;

use super::{MessageSink, PublishHandle, SinkError};
use crate::event::OutboundMessage;

pub const DEFAULT_DEDUP_HEADER: &str = "Idempotency-Key";

#[derive(Debug, Clone)]
pub struct HttpSinkConfig {
    pub base_url: String,
    pub dedup_header: String,
    pub request_timeout: Duration,
    pub client_name: String,
}

impl HttpSinkConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            dedup_header: DEFAULT_DEDUP_HEADER.to_string(),
            request_timeout: Duration::from_secs(30),
            client_name: crate::utils::client_name(),
        }
    }
}

pub struct HttpSink {
    client: Client,
    base_url: String,
    dedup_header: String,
    in_flight: Mutex<JoinSet<()>>,
    closed: AtomicBool,
}

impl HttpSink {
    pub fn new(config: HttpSinkConfig) -> Result<Self> {
        url::Url::parse(&config.base_url)
            .with_context(|| format!("Invalid sink URL '{}'", config.base_url))?;
        let client = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.client_name.clone())
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            dedup_header: config.dedup_header,
            in_flight: Mutex::new(JoinSet::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn endpoint(&self, event_name: &str) -> String {
        format!("{}/{}", self.base_url, event_name)
    }

    /// Marks the sink closed; later publishes fail with [`SinkError::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn request(&self, message: &OutboundMessage) -> reqwest::RequestBuilder {
        self.client
            .post(self.endpoint(&message.event_name))
            .header(CONTENT_TYPE, "application/json")
            .header(self.dedup_header.as_str(), message.dedup_key.as_str())
            .body(message.payload.clone())
    }

    fn ensure_open(&self) -> Result<(), SinkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SinkError::Closed);
        }
        Ok(())
    }
}

async fn send(request: reqwest::RequestBuilder) -> Result<(), SinkError> {
    let response = request
        .send()
        .await
        .map_err(|err| SinkError::Transport(err.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        return Err(SinkError::Rejected {
            status: status.as_u16(),
        });
    }
    Ok(())
}

#[async_trait]
impl MessageSink for HttpSink {
    async fn publish_async(&self, message: &OutboundMessage) -> Result<PublishHandle, SinkError> {
        self.ensure_open()?;
        let request = self.request(message);
        let (ack_tx, ack_rx) = oneshot::channel();

        {
            let mut tasks = self.tasks();
            // Reap finished posts so the set only holds what is actually in flight.
            while tasks.try_join_next().is_some() {}
            tasks.spawn(async move {
                let _ = ack_tx.send(send(request).await);
            });
        }

        tracing::trace!(
            event_name = %message.event_name,
            dedup_key = %message.dedup_key,
            "submitted async publish"
        );
        Ok(PublishHandle::new(message.clone(), ack_rx))
    }

    async fn publish(&self, message: &OutboundMessage) -> Result<(), SinkError> {
        self.ensure_open()?;
        send(self.request(message)).await
    }

    fn discard_in_flight(&self) {
        let count = {
            let mut tasks = self.tasks();
            let count = tasks.len();
            tasks.abort_all();
            count
        };
        tracing::debug!(count, "discarded in-flight publishes");
    }

    async fn await_all_complete(&self, timeout: Duration) -> Result<(), SinkError> {
        let mut tasks = std::mem::take(&mut *self.tasks());
        let drain = async {
            while let Some(result) = tasks.join_next().await {
                if let Err(err) = result {
                    if !err.is_cancelled() {
                        tracing::error!(error = %err, "in-flight publish task failed");
                    }
                }
            }
        };
        tokio::time::timeout(timeout, drain)
            .await
            .map_err(|_| SinkError::DrainTimeout(timeout))
    }
}
