// ABOUTME: Full-table bulk scan used for the one-time snapshot load
// ABOUTME: Streams SELECT * rows through a bounded channel as field->value maps

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use mysql_async::prelude::*;
use mysql_async::{Pool, Row, Value};
use tokio::sync::mpsc;

use super::{convert_value, current_binlog_position, ColumnKind};
use crate::event::PositionMarker;
use crate::stream::{BulkScanner, ScanRow};
use crate::utils::quote_mysql_ident;

/// Rows buffered between the reading task and the consumer.
const SCAN_BUFFER: usize = 256;

pub struct MySqlSnapshot {
    pool: Pool,
    database: String,
}

impl MySqlSnapshot {
    pub fn new(pool: Pool, database: impl Into<String>) -> Self {
        Self {
            pool,
            database: database.into(),
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub async fn current_position(&self) -> Result<PositionMarker> {
        current_binlog_position(&self.pool).await
    }
}

#[async_trait]
impl BulkScanner for MySqlSnapshot {
    async fn scan(&self, table: &str) -> Result<BoxStream<'static, Result<ScanRow>>> {
        let (tx, rx) = mpsc::channel(SCAN_BUFFER);
        let pool = self.pool.clone();
        let database = self.database.clone();
        let table = table.to_string();

        tokio::spawn(async move {
            if let Err(err) = read_table(&pool, &database, &table, &tx).await {
                let _ = tx.send(Err(err)).await;
            }
        });

        let rows = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|row| (row, rx))
        });
        Ok(rows.boxed())
    }
}

async fn read_table(
    pool: &Pool,
    database: &str,
    table: &str,
    tx: &mpsc::Sender<Result<ScanRow>>,
) -> Result<()> {
    let mut conn = pool
        .get_conn()
        .await
        .context("Failed to get snapshot connection")?;
    let query = format!(
        "SELECT * FROM {}.{}",
        quote_mysql_ident(database),
        quote_mysql_ident(table)
    );
    tracing::info!(database = %database, table = %table, "starting snapshot scan");

    // Binary protocol keeps column types, so numbers stay numbers.
    let mut result = conn
        .exec_iter(query, ())
        .await
        .with_context(|| format!("Failed to scan {}.{}", database, table))?;
    let Some(mut rows) = result.stream::<Row>().await? else {
        return Ok(());
    };

    let mut layout: Option<Vec<(String, ColumnKind)>> = None;
    let mut count: u64 = 0;
    while let Some(row) = rows.next().await {
        let mut row = row.with_context(|| format!("Failed to read row of {}.{}", database, table))?;
        let layout = layout.get_or_insert_with(|| {
            row.columns_ref()
                .iter()
                .map(|column| {
                    (
                        column.name_str().into_owned(),
                        ColumnKind::from_column_type(column.column_type()),
                    )
                })
                .collect()
        });

        let mut scanned = ScanRow::new();
        for (index, (name, kind)) in layout.iter().enumerate() {
            let value = row.take::<Value, _>(index).unwrap_or(Value::NULL);
            scanned.insert(name.clone(), convert_value(value, *kind));
        }
        if tx.send(Ok(scanned)).await.is_err() {
            tracing::debug!(table = %table, "snapshot consumer went away; stopping scan");
            return Ok(());
        }
        count += 1;
    }

    tracing::info!(database = %database, table = %table, rows = count, "snapshot scan finished");
    Ok(())
}
