// ABOUTME: Parallel transform stage between the normalizer and the delivery loop
// ABOUTME: Chunks events in arrival order, transforms chunks on a worker pool, drains in order

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use crate::config::TableConfig;
use crate::event::{ChangeEvent, Operation, OutboundMessage};

/// Delay between attempts to push into a full input queue.
pub const PUSH_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Per-table operation to event-name routing.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    tables: HashMap<String, TableRoutes>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableRoutes {
    pub snapshot: Option<String>,
    pub create: Option<String>,
    pub update: Option<String>,
    pub delete: Option<String>,
}

impl TableRoutes {
    fn for_operation(&self, operation: Operation) -> Option<&str> {
        match operation {
            Operation::Insert => self.create.as_deref(),
            Operation::Update => self.update.as_deref(),
            Operation::Delete => self.delete.as_deref(),
            Operation::SnapshotInsert => self.snapshot.as_deref(),
        }
    }
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tables<'a>(tables: impl IntoIterator<Item = (&'a String, &'a TableConfig)>) -> Self {
        let non_empty = |name: &str| (!name.trim().is_empty()).then(|| name.to_string());
        let tables = tables
            .into_iter()
            .map(|(table, config)| {
                let events = &config.events;
                (
                    table.clone(),
                    TableRoutes {
                        snapshot: non_empty(&events.snapshot),
                        create: non_empty(&events.create),
                        update: non_empty(&events.update),
                        delete: non_empty(&events.delete),
                    },
                )
            })
            .collect();
        Self { tables }
    }

    pub fn insert(&mut self, table: impl Into<String>, routes: TableRoutes) {
        self.tables.insert(table.into(), routes);
    }

    /// Event name for (table, operation), or `None` when the event is not routed.
    pub fn resolve(&self, table: &str, operation: Operation) -> Option<&str> {
        self.tables
            .get(table)
            .and_then(|routes| routes.for_operation(operation))
    }

    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }
}

/// Unit of work entering the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineItem {
    Event(ChangeEvent),
    /// Every snapshot row of `table` has been pushed ahead of this marker.
    SnapshotComplete { table: String },
}

/// Unit of work leaving the pipeline, in input order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transformed {
    Message(OutboundMessage),
    SnapshotComplete { table: String },
}

/// Resolves routes and builds payloads. Pure and cheap to share across workers.
#[derive(Debug, Clone)]
pub struct Transformer {
    source: String,
    routes: RouteTable,
}

impl Transformer {
    pub fn new(source: impl Into<String>, routes: RouteTable) -> Self {
        Self {
            source: source.into(),
            routes,
        }
    }

    /// Returns `None` for unrouted events and for events whose payload
    /// cannot be serialized; both are dropped.
    pub fn transform(&self, item: PipelineItem) -> Option<Transformed> {
        let event = match item {
            PipelineItem::Event(event) => event,
            PipelineItem::SnapshotComplete { table } => {
                return Some(Transformed::SnapshotComplete { table })
            }
        };

        let Some(event_name) = self.routes.resolve(&event.table, event.operation) else {
            tracing::trace!(
                source = %self.source,
                table = %event.table,
                operation = %event.operation,
                "no route configured; dropping event"
            );
            return None;
        };

        let payload = match event.payload() {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(
                    source = %self.source,
                    table = %event.table,
                    position = %event.position,
                    error = %err,
                    "failed to serialize payload; dropping event"
                );
                return None;
            }
        };

        Some(Transformed::Message(OutboundMessage {
            event_name: event_name.to_string(),
            payload,
            dedup_key: event.dedup_key,
            position: event.position,
            table: event.table,
            operation: event.operation,
        }))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    /// Capacity of the bounded input queue.
    pub buffer_size: usize,
    /// Maximum number of items transformed together.
    pub chunk_size: usize,
    /// Number of parallel workers a chunk is split across.
    pub workers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_size: 2048,
            chunk_size: 128,
            workers: 16,
        }
    }
}

/// Input side of a running pipeline.
#[derive(Clone)]
pub struct TransformPipeline {
    input: mpsc::Sender<PipelineItem>,
}

impl TransformPipeline {
    /// Starts the dispatcher task. Returns the input handle, the ordered
    /// output queue, and the dispatcher's join handle. The dispatcher exits
    /// once every input handle is dropped and the queue is drained.
    pub fn spawn(
        config: PipelineConfig,
        transformer: Transformer,
    ) -> (Self, mpsc::Receiver<Transformed>, JoinHandle<()>) {
        let buffer = config.buffer_size.max(1);
        let (input_tx, input_rx) = mpsc::channel(buffer);
        let (output_tx, output_rx) = mpsc::channel(buffer);
        let handle = tokio::spawn(run_dispatcher(
            config,
            Arc::new(transformer),
            input_rx,
            output_tx,
        ));
        (Self { input: input_tx }, output_rx, handle)
    }

    /// Pushes one item, retrying every [`PUSH_RETRY_DELAY`] while the input
    /// queue is full. Fails only once the pipeline has shut down.
    pub async fn push(&self, item: PipelineItem) -> Result<()> {
        let mut item = item;
        loop {
            match self.input.try_send(item) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(returned)) => {
                    tracing::trace!("pipeline input full, retry ...");
                    item = returned;
                    tokio::time::sleep(PUSH_RETRY_DELAY).await;
                }
                Err(TrySendError::Closed(_)) => {
                    return Err(anyhow!("transform pipeline has shut down"));
                }
            }
        }
    }
}

async fn run_dispatcher(
    config: PipelineConfig,
    transformer: Arc<Transformer>,
    mut input: mpsc::Receiver<PipelineItem>,
    output: mpsc::Sender<Transformed>,
) {
    let chunk_size = config.chunk_size.max(1);
    let workers = config.workers.max(1);

    while let Some(first) = input.recv().await {
        let mut chunk = Vec::with_capacity(chunk_size);
        chunk.push(first);
        // Take what is already queued; a partial chunk goes out as soon as the queue runs dry.
        while chunk.len() < chunk_size {
            match input.try_recv() {
                Ok(item) => chunk.push(item),
                Err(_) => break,
            }
        }

        for transformed in transform_chunk(chunk, workers, &transformer).await {
            if output.send(transformed).await.is_err() {
                tracing::debug!("pipeline output closed; dispatcher exiting");
                return;
            }
        }
    }
    tracing::debug!("pipeline input closed; dispatcher exiting");
}

/// Splits `chunk` into contiguous slices, transforms each slice on the
/// blocking pool, and concatenates the results in slice order.
async fn transform_chunk(
    chunk: Vec<PipelineItem>,
    workers: usize,
    transformer: &Arc<Transformer>,
) -> Vec<Transformed> {
    let slice_len = chunk.len().div_ceil(workers).max(1);
    let mut slices: Vec<Vec<PipelineItem>> = Vec::with_capacity(workers);
    let mut items = chunk.into_iter().peekable();
    while items.peek().is_some() {
        slices.push(items.by_ref().take(slice_len).collect());
    }

    let tasks = slices.into_iter().map(|slice| {
        let transformer = Arc::clone(transformer);
        tokio::task::spawn_blocking(move || {
            slice
                .into_iter()
                .filter_map(|item| transformer.transform(item))
                .collect::<Vec<_>>()
        })
    });

    let mut out = Vec::new();
    for result in futures::future::join_all(tasks).await {
        match result {
            Ok(transformed) => out.extend(transformed),
            Err(err) => tracing::error!(error = %err, "transform worker failed"),
        }
    }
    out
}
