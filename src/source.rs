// ABOUTME: Owns one database source end to end: snapshot, live stream and delivery
// ABOUTME: Wires stream -> normalizer -> pipeline -> submission loop and tears it down

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use relay_store::KvStore;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::{RelaySettings, SourceInfo};
use crate::delivery::{DeliveryConfig, DeliveryManager};
use crate::event::PositionMarker;
use crate::normalizer::Normalizer;
use crate::pipeline::{PipelineItem, RouteTable, TransformPipeline, Transformed, Transformer};
use crate::rate_limit::RateLimiter;
use crate::sink::MessageSink;
use crate::stream::{BulkScanner, ChangeStream, RowEventHandler, RowMutation};
use crate::tracker::PositionTracker;
use crate::utils::stop_requested;

/// Capacity of the queue between the stream handler and the pipeline.
pub const INCOMING_QUEUE: usize = 16;

/// External collaborators of one source.
pub struct SourceDeps {
    pub stream: Arc<dyn ChangeStream>,
    pub scanner: Arc<dyn BulkScanner>,
    pub sink: Arc<dyn MessageSink>,
    pub store: Option<Arc<dyn KvStore>>,
}

struct Running {
    worker: JoinHandle<()>,
    receiver_task: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
    submission: JoinHandle<DeliveryManager>,
}

pub struct SourceOrchestrator {
    name: String,
    info: SourceInfo,
    settings: RelaySettings,
    deps: SourceDeps,
    limiter: Arc<RateLimiter>,
    stop: watch::Sender<bool>,
    running: Option<Running>,
}

impl SourceOrchestrator {
    pub fn new(
        name: impl Into<String>,
        info: SourceInfo,
        settings: RelaySettings,
        deps: SourceDeps,
    ) -> Result<Self> {
        let name = name.into();
        info.validate(&name)?;
        let limiter = RateLimiter::new(settings.rate_limit, settings.rate_burst)
            .with_context(|| format!("Invalid rate limit for source '{}'", name))?;
        let (stop, _) = watch::channel(false);

        Ok(Self {
            name,
            info,
            settings,
            deps,
            limiter: Arc::new(limiter),
            stop,
            running: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Loads state, wires the delivery stages and spawns the worker that
    /// runs pending snapshot loads and then follows the live stream.
    /// Returns once the worker is spawned.
    pub async fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Ok(());
        }
        self.stop.send_replace(false);

        let mut tracker = PositionTracker::new(
            self.name.clone(),
            self.deps.store.clone(),
            self.settings.retry_backoff,
        );
        let state = tracker
            .load_state(self.info.tables.keys().map(String::as_str))
            .with_context(|| format!("Failed to load state for source '{}'", self.name))?;

        // Captured before any scan so changes made during the snapshot are streamed.
        let start_position = match &state.last_position {
            Some(position) => position.clone(),
            None => self
                .deps
                .stream
                .current_position()
                .await
                .with_context(|| format!("Failed to read current position of '{}'", self.name))?,
        };
        tracing::info!(
            source = %self.name,
            position = %start_position,
            resumed = state.last_position.is_some(),
            "starting source"
        );

        let mut pending_tables = Vec::new();
        if self.info.initial_load {
            for table in self.info.tables.keys() {
                if state.is_snapshot_complete(table) {
                    tracing::info!(source = %self.name, table = %table, "snapshot already complete; skipping");
                } else {
                    pending_tables.push(table.clone());
                }
            }
        }

        let committed = tracker.subscribe();
        let delivery = DeliveryManager::new(
            self.name.clone(),
            Arc::clone(&self.deps.sink),
            Arc::clone(&self.limiter),
            tracker,
            DeliveryConfig {
                batch_size: self.settings.publish_batch_size,
                ack_timeout: self.settings.ack_timeout,
                retry_backoff: self.settings.retry_backoff,
                shutdown_timeout: self.settings.shutdown_timeout,
            },
        )
        .with_stop_signal(self.stop.subscribe());

        let transformer = Transformer::new(
            self.name.clone(),
            RouteTable::from_tables(&self.info.tables),
        );
        let (pipeline, output, dispatcher) =
            TransformPipeline::spawn(self.settings.pipeline, transformer);
        let submission = tokio::spawn(run_submission(delivery, output, self.stop.subscribe()));

        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_QUEUE);
        let receiver_task = tokio::spawn(run_receiver(incoming_rx, pipeline));

        let snapshot = SnapshotLoader {
            source: self.name.clone(),
            tables: pending_tables,
            scanner: Arc::clone(&self.deps.scanner),
            stop: self.stop.subscribe(),
        };
        let stream = StreamWorker {
            source: self.name.clone(),
            stream: Arc::clone(&self.deps.stream),
            start: start_position,
            committed,
            reconnect_interval: self.settings.reconnect_interval,
            stop: self.stop.subscribe(),
        };
        let handler = StreamHandler {
            normalizer: Normalizer::new(self.name.clone()),
            incoming: incoming_tx,
        };
        let worker = tokio::spawn(run_source(snapshot, stream, handler));

        self.running = Some(Running {
            worker,
            receiver_task,
            dispatcher,
            submission,
        });
        Ok(())
    }

    /// Stops the worker, lets every stage drain and releases the store.
    /// Items still queued when the stop arrives are skipped; their positions
    /// were never committed.
    pub async fn shutdown(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        tracing::info!(source = %self.name, "stopping source");
        self.stop.send_replace(true);

        let Running {
            worker,
            receiver_task,
            dispatcher,
            submission,
        } = running;

        // The worker owns the last event sender; once it exits each stage
        // sees its input close in turn.
        if let Err(err) = worker.await {
            tracing::error!(source = %self.name, error = %err, "source worker failed");
        }
        if let Err(err) = receiver_task.await {
            tracing::error!(source = %self.name, error = %err, "receiver task failed");
        }
        if let Err(err) = dispatcher.await {
            tracing::error!(source = %self.name, error = %err, "pipeline dispatcher failed");
        }
        match submission.await {
            Ok(mut delivery) => delivery.shutdown().await,
            Err(err) => {
                tracing::error!(source = %self.name, error = %err, "submission task failed");
                if let Some(store) = &self.deps.store {
                    if let Err(err) = store.close() {
                        tracing::error!(source = %self.name, error = %err, "failed to close store");
                    }
                }
            }
        }
        tracing::info!(source = %self.name, "source stopped");
    }
}

/// Snapshot loads first, then the live stream.
async fn run_source(snapshot: SnapshotLoader, stream: StreamWorker, handler: StreamHandler) {
    let progress = snapshot.run(&handler.incoming).await;
    match progress {
        Ok(SnapshotProgress::Finished) => stream.run(handler).await,
        Ok(SnapshotProgress::Stopped) => {
            tracing::info!(source = %snapshot.source, "snapshot interrupted by shutdown");
        }
        Err(err) => tracing::error!(
            source = %snapshot.source,
            error = %format!("{err:#}"),
            "snapshot load failed; source halted until restart"
        ),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SnapshotProgress {
    Finished,
    Stopped,
}

struct SnapshotLoader {
    source: String,
    tables: Vec<String>,
    scanner: Arc<dyn BulkScanner>,
    stop: watch::Receiver<bool>,
}

impl SnapshotLoader {
    fn is_stopping(&self) -> bool {
        *self.stop.borrow()
    }

    /// Queues every row of each pending table followed by its completion
    /// marker. A table interrupted by shutdown gets no marker.
    async fn run(&self, incoming: &mpsc::Sender<PipelineItem>) -> Result<SnapshotProgress> {
        let mut normalizer = Normalizer::new(self.source.clone());
        for table in &self.tables {
            let scan = tokio::select! {
                biased;
                _ = stop_requested(self.stop.clone()) => return Ok(SnapshotProgress::Stopped),
                scan = self.scanner.scan(table) => scan,
            };
            let mut rows =
                scan.with_context(|| format!("Failed to start snapshot of {}.{}", self.source, table))?;

            let mut count: u64 = 0;
            loop {
                if self.is_stopping() {
                    return Ok(SnapshotProgress::Stopped);
                }
                let row = tokio::select! {
                    biased;
                    _ = stop_requested(self.stop.clone()) => return Ok(SnapshotProgress::Stopped),
                    row = rows.next() => row,
                };
                let Some(row) = row else {
                    break;
                };
                let row =
                    row.with_context(|| format!("Snapshot of {}.{} failed", self.source, table))?;
                let event = normalizer.normalize_snapshot_row(table, row);
                if !self.send(incoming, PipelineItem::Event(event)).await? {
                    return Ok(SnapshotProgress::Stopped);
                }
                count += 1;
            }

            let marker = PipelineItem::SnapshotComplete {
                table: table.clone(),
            };
            if !self.send(incoming, marker).await? {
                return Ok(SnapshotProgress::Stopped);
            }
            tracing::info!(source = %self.source, table = %table, rows = count, "snapshot rows queued");
        }
        Ok(SnapshotProgress::Finished)
    }

    /// `Ok(false)` when shutdown arrived while the queue was full.
    async fn send(&self, incoming: &mpsc::Sender<PipelineItem>, item: PipelineItem) -> Result<bool> {
        tokio::select! {
            biased;
            _ = stop_requested(self.stop.clone()) => Ok(false),
            sent = incoming.send(item) => sent
                .map(|_| true)
                .map_err(|_| anyhow!("event queue closed during snapshot")),
        }
    }
}

/// Single consumer of the pipeline output; the only writer of delivery state.
async fn run_submission(
    mut delivery: DeliveryManager,
    mut output: mpsc::Receiver<Transformed>,
    stop: watch::Receiver<bool>,
) -> DeliveryManager {
    let mut skipped: u64 = 0;
    while let Some(item) = output.recv().await {
        let stopping = *stop.borrow();
        if stopping {
            skipped += 1;
            continue;
        }
        match item {
            Transformed::Message(message) => {
                delivery.deliver(message).await;
            }
            Transformed::SnapshotComplete { table } => {
                delivery.tracker_mut().mark_snapshot_complete(&table).await;
            }
        }
    }
    if skipped > 0 {
        tracing::warn!(
            source = delivery.source(),
            skipped,
            "source stopping; queued items left for replay"
        );
    }
    delivery
}

async fn run_receiver(mut incoming: mpsc::Receiver<PipelineItem>, pipeline: TransformPipeline) {
    while let Some(item) = incoming.recv().await {
        if let Err(err) = pipeline.push(item).await {
            tracing::error!(error = %err, "dropping event queue");
            break;
        }
    }
}

struct StreamHandler {
    normalizer: Normalizer,
    incoming: mpsc::Sender<PipelineItem>,
}

#[async_trait]
impl RowEventHandler for StreamHandler {
    async fn on_row_mutation(&mut self, mutation: RowMutation) -> Result<()> {
        let table = mutation.table.clone();
        let position = mutation.position.clone();
        let events = self.normalizer.normalize(mutation).map_err(|err| {
            tracing::error!(
                source = self.normalizer.source(),
                table = %table,
                position = %position,
                error = %err,
                "malformed row event"
            );
            err
        })?;

        for event in events {
            self.incoming
                .send(PipelineItem::Event(event))
                .await
                .map_err(|_| anyhow!("event queue closed"))?;
        }
        Ok(())
    }

    async fn on_rotate(&mut self, next: &PositionMarker) -> Result<()> {
        tracing::debug!(source = self.normalizer.source(), position = %next, "binlog rotated");
        Ok(())
    }
}

struct StreamWorker {
    source: String,
    stream: Arc<dyn ChangeStream>,
    start: PositionMarker,
    committed: watch::Receiver<Option<PositionMarker>>,
    reconnect_interval: Duration,
    stop: watch::Receiver<bool>,
}

impl StreamWorker {
    fn resume_position(&self) -> PositionMarker {
        self.committed
            .borrow()
            .clone()
            .unwrap_or_else(|| self.start.clone())
    }

    fn is_stopping(&self) -> bool {
        *self.stop.borrow()
    }

    async fn run(self, mut handler: StreamHandler) {
        loop {
            if self.is_stopping() {
                break;
            }
            let from = self.resume_position();
            tracing::info!(source = %self.source, position = %from, "subscribing to change stream");

            tokio::select! {
                biased;
                _ = stop_requested(self.stop.clone()) => break,
                result = self.stream.subscribe(from, &mut handler) => match result {
                    Ok(()) => tracing::warn!(source = %self.source, "change stream disconnected"),
                    Err(err) => tracing::error!(
                        source = %self.source,
                        error = %format!("{err:#}"),
                        "change stream failed"
                    ),
                },
            }

            tokio::select! {
                biased;
                _ = stop_requested(self.stop.clone()) => break,
                _ = tokio::time::sleep(self.reconnect_interval) => {}
            }
        }
        tracing::debug!(source = %self.source, "stream worker exiting");
    }
}
