// ABOUTME: Binlog change stream over the MySQL replication protocol
// ABOUTME: Decodes rows events into RowMutations stamped with binlog coordinates

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use mysql_async::binlog::events::{EventData, RowsEventData};
use mysql_async::binlog::row::BinlogRow;
use mysql_async::binlog::value::BinlogValue;
use mysql_async::{BinlogStreamRequest, Conn, Opts, Pool};

use super::{convert_value, current_binlog_position, MetadataCache, TableMeta};
use crate::event::PositionMarker;
use crate::stream::{ChangeStream, RawValue, RowAction, RowEventHandler, RowMutation};

pub struct MySqlBinlogStream {
    opts: Opts,
    pool: Pool,
    database: String,
    server_id: u32,
    metadata: Arc<MetadataCache>,
}

impl MySqlBinlogStream {
    /// `server_id` must be unique among the replicas of the source server.
    pub fn new(opts: Opts, pool: Pool, database: impl Into<String>, server_id: u32) -> Self {
        let database = database.into();
        Self {
            metadata: Arc::new(MetadataCache::new(pool.clone(), database.clone())),
            opts,
            pool,
            database,
            server_id,
        }
    }

    pub fn server_id(&self) -> u32 {
        self.server_id
    }

    async fn table_meta(&self, table: &str, column_count: usize) -> Result<Arc<TableMeta>> {
        let meta = self.metadata.get(table).await?;
        if meta.columns.len() == column_count {
            return Ok(meta);
        }
        // The table changed shape since it was cached.
        tracing::info!(
            database = %self.database,
            table = %table,
            "column count changed; reloading table metadata"
        );
        self.metadata.invalidate(table);
        self.metadata.get(table).await
    }
}

/// Last binlog coordinate at which no transaction was open.
///
/// Rows are stamped with this instead of their own event position, so a
/// checkpoint never lands inside a transaction and resuming always starts
/// ahead of the table map events the rows depend on.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SyncedPosition {
    file: String,
    synced: PositionMarker,
}

impl SyncedPosition {
    fn new(from: &PositionMarker) -> Self {
        Self {
            file: from.stream_name.clone(),
            synced: from.clone(),
        }
    }

    fn current(&self) -> &PositionMarker {
        &self.synced
    }

    fn rotate(&mut self, file: String, offset: u64) -> &PositionMarker {
        self.synced = PositionMarker::new(file.clone(), offset);
        self.file = file;
        &self.synced
    }

    /// A transaction ended at `log_pos` in the current file.
    fn commit(&mut self, log_pos: u64) -> &PositionMarker {
        self.synced = PositionMarker::new(self.file.clone(), log_pos);
        &self.synced
    }
}

/// Non-transactional engines end a statement group with a `COMMIT` query
/// event instead of an XID event.
fn is_commit_query(query: &str) -> bool {
    query.trim().eq_ignore_ascii_case("COMMIT")
}

fn action_of(rows: &RowsEventData<'_>) -> RowAction {
    match rows {
        RowsEventData::WriteRowsEventV1(_) | RowsEventData::WriteRowsEvent(_) => RowAction::Insert,
        RowsEventData::DeleteRowsEventV1(_) | RowsEventData::DeleteRowsEvent(_) => {
            RowAction::Delete
        }
        _ => RowAction::Update,
    }
}

fn convert_row(mut row: BinlogRow, meta: &TableMeta) -> Vec<RawValue> {
    meta.kinds
        .iter()
        .enumerate()
        .map(|(index, kind)| match row.take(index) {
            Some(BinlogValue::Value(value)) => convert_value(value, *kind),
            Some(BinlogValue::Jsonb(jsonb)) => match serde_json::Value::try_from(jsonb) {
                Ok(json) => RawValue::Json(json),
                Err(_) => RawValue::Null,
            },
            // Partial JSON updates and columns missing from a minimal row image.
            _ => RawValue::Null,
        })
        .collect()
}

#[async_trait]
impl ChangeStream for MySqlBinlogStream {
    async fn subscribe(
        &self,
        from: PositionMarker,
        handler: &mut dyn RowEventHandler,
    ) -> Result<()> {
        let conn = Conn::new(self.opts.clone())
            .await
            .context("Failed to open replication connection")?;
        let request = BinlogStreamRequest::new(self.server_id)
            .with_filename(from.stream_name.as_bytes())
            .with_pos(from.offset);
        let mut stream = conn
            .get_binlog_stream(request)
            .await
            .with_context(|| format!("Failed to start binlog stream at {}", from))?;
        tracing::info!(
            database = %self.database,
            server_id = self.server_id,
            position = %from,
            "binlog stream started"
        );

        let mut position = SyncedPosition::new(&from);
        while let Some(event) = stream.next().await {
            let event = event.context("Failed to read binlog event")?;
            let log_pos = u64::from(event.header().log_pos());
            let data = event.read_data().context("Failed to decode binlog event")?;

            let rows = match data {
                Some(EventData::RotateEvent(rotate)) => {
                    let next = position
                        .rotate(rotate.name().into_owned(), rotate.position())
                        .clone();
                    handler.on_rotate(&next).await?;
                    continue;
                }
                Some(EventData::TableMapEvent(tme)) => {
                    let schema = tme.database_name().into_owned();
                    let table = tme.table_name().into_owned();
                    handler.on_table_changed(&schema, &table).await?;
                    continue;
                }
                Some(EventData::RowsEvent(rows)) => rows,
                Some(EventData::XidEvent(_)) => {
                    let synced = position.commit(log_pos).clone();
                    handler.on_position_synced(&synced).await?;
                    continue;
                }
                Some(EventData::QueryEvent(query)) if is_commit_query(&query.query()) => {
                    let synced = position.commit(log_pos).clone();
                    handler.on_position_synced(&synced).await?;
                    continue;
                }
                _ => continue,
            };

            let table_id = rows.table_id();
            let Some(tme) = stream.get_tme(table_id) else {
                tracing::warn!(table_id, "rows event without a table map; skipping");
                continue;
            };
            if tme.database_name() != self.database {
                continue;
            }
            let table = tme.table_name().into_owned();
            let column_count = tme.columns_count() as usize;

            let meta = self.table_meta(&table, column_count).await?;
            let Some(tme) = stream.get_tme(table_id) else {
                continue;
            };

            let mut images = Vec::new();
            for pair in rows.rows(tme) {
                let (before, after) =
                    pair.with_context(|| format!("Failed to decode row of {}", table))?;
                // Updates yield (before, after); inserts and deletes fill one side.
                images.extend(before.map(|row| convert_row(row, &meta)));
                images.extend(after.map(|row| convert_row(row, &meta)));
            }

            handler
                .on_row_mutation(RowMutation {
                    action: action_of(&rows),
                    table,
                    columns: meta.columns.clone(),
                    primary_key: meta.primary_key.clone(),
                    rows: images,
                    position: position.current().clone(),
                })
                .await?;
        }

        tracing::warn!(database = %self.database, "binlog stream ended");
        Ok(())
    }

    async fn current_position(&self) -> Result<PositionMarker> {
        current_binlog_position(&self.pool).await
    }
}
