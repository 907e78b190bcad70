// ABOUTME: Boundary traits for the replication stream and the snapshot bulk scan
// ABOUTME: Raw row types arrive here before the normalizer gives them canonical form

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime};
use futures::stream::BoxStream;

use crate::event::PositionMarker;

/// Column value as decoded by a database client, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Decimal(String),
    Text(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    /// Zone-less DATETIME; the server session runs in UTC.
    DateTime(NaiveDateTime),
    Timestamp(DateTime<FixedOffset>),
    /// TIME columns, already rendered as `[-]HH:MM:SS[.ffffff]`.
    Time(String),
    Json(serde_json::Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowAction {
    Insert,
    Update,
    Delete,
}

/// One rows event from the replication stream.
///
/// For [`RowAction::Update`], `rows` holds before/after images as sequential
/// entries: index `2k` is a before-image and `2k + 1` its after-image.
#[derive(Debug, Clone, PartialEq)]
pub struct RowMutation {
    pub action: RowAction,
    pub table: String,
    pub columns: Vec<String>,
    /// Indices into `columns` that form the primary key.
    pub primary_key: Vec<usize>,
    pub rows: Vec<Vec<RawValue>>,
    pub position: PositionMarker,
}

/// Callbacks invoked by a [`ChangeStream`] while subscribed.
///
/// Only `on_row_mutation` matters to the relay; the other notifications exist
/// because stream clients report them and default to doing nothing.
#[async_trait]
pub trait RowEventHandler: Send {
    async fn on_row_mutation(&mut self, mutation: RowMutation) -> Result<()>;

    async fn on_rotate(&mut self, _next: &PositionMarker) -> Result<()> {
        Ok(())
    }

    async fn on_table_changed(&mut self, _schema: &str, _table: &str) -> Result<()> {
        Ok(())
    }

    async fn on_position_synced(&mut self, _position: &PositionMarker) -> Result<()> {
        Ok(())
    }
}

/// Replication-log client for one database source.
#[async_trait]
pub trait ChangeStream: Send + Sync {
    /// Streams changes starting at `from`, calling `handler` for each row
    /// event. Returns when the connection drops or the handler fails.
    async fn subscribe(&self, from: PositionMarker, handler: &mut dyn RowEventHandler)
        -> Result<()>;

    /// The source's current tip.
    async fn current_position(&self) -> Result<PositionMarker>;
}

/// Field name to raw value map for one scanned row.
pub type ScanRow = BTreeMap<String, RawValue>;

/// Full-table reader used once per table for the snapshot load.
#[async_trait]
pub trait BulkScanner: Send + Sync {
    async fn scan(&self, table: &str) -> Result<BoxStream<'static, Result<ScanRow>>>;
}
