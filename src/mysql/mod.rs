// ABOUTME: MySQL adapters for the change stream and the snapshot bulk scan
// ABOUTME: Connection options, table metadata, value conversion and the source connector

pub mod binlog;
pub mod snapshot;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use mysql_async::consts::ColumnType;
use mysql_async::prelude::*;
use mysql_async::{Opts, OptsBuilder, Pool, Row, Value};
use relay_store::{KvStore, SqliteKvStore};

use crate::config::SourceInfo;
use crate::event::PositionMarker;
use crate::manager::Connector;
use crate::sink::{HttpSink, HttpSinkConfig};
use crate::source::SourceDeps;
use crate::stream::RawValue;

pub use binlog::MySqlBinlogStream;
pub use snapshot::MySqlSnapshot;

/// Connection options for one source. Every session runs in UTC so zone-less
/// temporal values can be read as UTC.
pub fn connection_opts(info: &SourceInfo) -> OptsBuilder {
    OptsBuilder::default()
        .ip_or_hostname(info.host.clone())
        .tcp_port(info.port)
        .user(Some(info.username.clone()))
        .pass(Some(info.password.clone()))
        .db_name(Some(info.dbname.clone()))
        .init(vec!["SET time_zone = '+00:00'"])
}

/// How a column's values need to be interpreted beyond their wire form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Date,
    DateTime,
    Timestamp,
    Time,
    Decimal,
    Json,
    Other,
}

impl ColumnKind {
    /// From `INFORMATION_SCHEMA.COLUMNS.DATA_TYPE`.
    pub fn from_data_type(data_type: &str) -> Self {
        match data_type.to_ascii_lowercase().as_str() {
            "date" => ColumnKind::Date,
            "datetime" => ColumnKind::DateTime,
            "timestamp" => ColumnKind::Timestamp,
            "time" => ColumnKind::Time,
            "decimal" | "numeric" => ColumnKind::Decimal,
            "json" => ColumnKind::Json,
            _ => ColumnKind::Other,
        }
    }

    /// From a result-set column type.
    pub fn from_column_type(column_type: ColumnType) -> Self {
        match column_type {
            ColumnType::MYSQL_TYPE_DATE | ColumnType::MYSQL_TYPE_NEWDATE => ColumnKind::Date,
            ColumnType::MYSQL_TYPE_DATETIME | ColumnType::MYSQL_TYPE_DATETIME2 => {
                ColumnKind::DateTime
            }
            ColumnType::MYSQL_TYPE_TIMESTAMP | ColumnType::MYSQL_TYPE_TIMESTAMP2 => {
                ColumnKind::Timestamp
            }
            ColumnType::MYSQL_TYPE_TIME | ColumnType::MYSQL_TYPE_TIME2 => ColumnKind::Time,
            ColumnType::MYSQL_TYPE_DECIMAL | ColumnType::MYSQL_TYPE_NEWDECIMAL => {
                ColumnKind::Decimal
            }
            ColumnType::MYSQL_TYPE_JSON => ColumnKind::Json,
            _ => ColumnKind::Other,
        }
    }
}

/// Converts a decoded MySQL value into a [`RawValue`].
pub fn convert_value(value: Value, kind: ColumnKind) -> RawValue {
    match value {
        Value::NULL => RawValue::Null,
        Value::Int(v) if kind == ColumnKind::Timestamp => epoch_seconds(v as f64),
        Value::Int(v) => RawValue::Int(v),
        Value::UInt(v) => RawValue::UInt(v),
        Value::Float(v) => RawValue::Float(f64::from(v)),
        Value::Double(v) => RawValue::Float(v),
        Value::Date(year, month, day, hour, minute, second, micros) => {
            let Some(date) = NaiveDate::from_ymd_opt(year.into(), month.into(), day.into())
            else {
                // Zero dates have no calendar equivalent.
                return RawValue::Text(format!(
                    "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}"
                ));
            };
            if kind == ColumnKind::Date {
                return RawValue::Date(date);
            }
            let time = NaiveTime::from_hms_micro_opt(
                hour.into(),
                minute.into(),
                second.into(),
                micros,
            )
            .unwrap_or_default();
            RawValue::DateTime(NaiveDateTime::new(date, time))
        }
        Value::Time(negative, days, hours, minutes, seconds, micros) => {
            let sign = if negative { "-" } else { "" };
            let hours = days * 24 + u32::from(hours);
            let mut text = format!("{sign}{hours:02}:{minutes:02}:{seconds:02}");
            if micros > 0 {
                text.push_str(&format!(".{micros:06}"));
            }
            RawValue::Time(text)
        }
        Value::Bytes(bytes) => match kind {
            ColumnKind::Decimal => RawValue::Decimal(String::from_utf8_lossy(&bytes).into_owned()),
            ColumnKind::Json => match serde_json::from_slice(&bytes) {
                Ok(json) => RawValue::Json(json),
                Err(_) => RawValue::Bytes(bytes),
            },
            ColumnKind::Timestamp => {
                let text = String::from_utf8_lossy(&bytes);
                match text.parse::<f64>() {
                    Ok(seconds) => epoch_seconds(seconds),
                    Err(_) => RawValue::Text(text.into_owned()),
                }
            }
            _ => RawValue::Bytes(bytes),
        },
    }
}

fn epoch_seconds(seconds: f64) -> RawValue {
    let whole = seconds.trunc() as i64;
    let nanos = ((seconds - seconds.trunc()) * 1e9).round() as u32;
    match DateTime::from_timestamp(whole, nanos) {
        Some(utc) => RawValue::Timestamp(utc.fixed_offset()),
        None => RawValue::Text(seconds.to_string()),
    }
}

/// Column layout of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMeta {
    pub columns: Vec<String>,
    pub kinds: Vec<ColumnKind>,
    /// Indices into `columns`, in key order.
    pub primary_key: Vec<usize>,
}

/// Per-table metadata looked up from INFORMATION_SCHEMA and cached.
pub struct MetadataCache {
    pool: Pool,
    database: String,
    tables: Mutex<HashMap<String, Arc<TableMeta>>>,
}

impl MetadataCache {
    pub fn new(pool: Pool, database: impl Into<String>) -> Self {
        Self {
            pool,
            database: database.into(),
            tables: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, table: &str) -> Option<Arc<TableMeta>> {
        self.tables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(table)
            .cloned()
    }

    pub fn invalidate(&self, table: &str) {
        self.tables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(table);
    }

    pub async fn get(&self, table: &str) -> Result<Arc<TableMeta>> {
        if let Some(meta) = self.cached(table) {
            return Ok(meta);
        }

        let meta = Arc::new(self.fetch(table).await?);
        self.tables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(table.to_string(), Arc::clone(&meta));
        Ok(meta)
    }

    async fn fetch(&self, table: &str) -> Result<TableMeta> {
        let mut conn = self
            .pool
            .get_conn()
            .await
            .context("Failed to get metadata connection")?;

        let columns: Vec<(String, String)> = conn
            .exec(
                r"SELECT COLUMN_NAME, DATA_TYPE
                  FROM INFORMATION_SCHEMA.COLUMNS
                  WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
                  ORDER BY ORDINAL_POSITION",
                (self.database.as_str(), table),
            )
            .await
            .with_context(|| format!("Failed to read columns of {}.{}", self.database, table))?;
        if columns.is_empty() {
            bail!("Table {}.{} has no visible columns", self.database, table);
        }

        let key_columns: Vec<String> = conn
            .exec(
                r"SELECT COLUMN_NAME
                  FROM INFORMATION_SCHEMA.KEY_COLUMN_USAGE
                  WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? AND CONSTRAINT_NAME = 'PRIMARY'
                  ORDER BY ORDINAL_POSITION",
                (self.database.as_str(), table),
            )
            .await
            .with_context(|| format!("Failed to read primary key of {}.{}", self.database, table))?;

        let (names, kinds): (Vec<String>, Vec<ColumnKind>) = columns
            .into_iter()
            .map(|(name, data_type)| (name, ColumnKind::from_data_type(&data_type)))
            .unzip();
        let primary_key = key_columns
            .iter()
            .filter_map(|key| names.iter().position(|name| name == key))
            .collect();

        tracing::debug!(database = %self.database, table = %table, "loaded table metadata");
        Ok(TableMeta {
            columns: names,
            kinds,
            primary_key,
        })
    }
}

/// The server's current binlog coordinates.
pub async fn current_binlog_position(pool: &Pool) -> Result<PositionMarker> {
    let mut conn = pool
        .get_conn()
        .await
        .context("Failed to connect for binlog position")?;

    // SHOW BINARY LOG STATUS exists from MySQL 8.2; older servers only know SHOW MASTER STATUS.
    let row: Option<Row> = match conn.query_first("SHOW BINARY LOG STATUS").await {
        Ok(row) => row,
        Err(_) => conn
            .query_first("SHOW MASTER STATUS")
            .await
            .context("Failed to query binlog position")?,
    };

    let Some(row) = row else {
        bail!("Binary logging appears to be disabled: no binlog status returned");
    };
    let file: String = row
        .get_opt::<String, _>(0)
        .and_then(|value| value.ok())
        .unwrap_or_default();
    let offset: u64 = row
        .get_opt::<u64, _>(1)
        .and_then(|value| value.ok())
        .unwrap_or(4);
    if file.is_empty() {
        bail!("Binlog status returned an empty file name; binary logging may be disabled");
    }

    Ok(PositionMarker::new(file, offset))
}

/// Connects sources to MySQL, an HTTP sink and a per-source SQLite store.
pub struct MySqlConnector {
    server_id_base: u32,
    next_server_offset: AtomicU32,
    sink: HttpSinkConfig,
    store_dir: Option<PathBuf>,
}

impl MySqlConnector {
    pub fn new(server_id_base: u32, sink: HttpSinkConfig, store_dir: Option<PathBuf>) -> Self {
        Self {
            server_id_base,
            next_server_offset: AtomicU32::new(0),
            sink,
            store_dir,
        }
    }

    fn open_store(&self, name: &str) -> Result<Option<Arc<dyn KvStore>>> {
        let Some(dir) = &self.store_dir else {
            return Ok(None);
        };
        let path = dir.join(format!("{name}.db"));
        let store = SqliteKvStore::open(&path)
            .with_context(|| format!("Failed to open store {}", path.display()))?;
        Ok(Some(Arc::new(store)))
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    async fn connect(&self, name: &str, info: &SourceInfo) -> Result<SourceDeps> {
        let opts: Opts = connection_opts(info).into();
        let pool = Pool::new(opts.clone());
        let server_id = self.server_id_base + self.next_server_offset.fetch_add(1, Ordering::SeqCst);

        let stream = MySqlBinlogStream::new(opts, pool.clone(), info.dbname.clone(), server_id);
        let scanner = MySqlSnapshot::new(pool, info.dbname.clone());
        let sink = HttpSink::new(self.sink.clone())?;
        let store = self.open_store(name)?;

        tracing::info!(
            source = %name,
            host = %info.host,
            port = info.port,
            database = %info.dbname,
            server_id,
            "connected source"
        );
        Ok(SourceDeps {
            stream: Arc::new(stream),
            scanner: Arc::new(scanner),
            sink: Arc::new(sink),
            store,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_types_map_to_kinds() {
        assert_eq!(ColumnKind::from_data_type("DATETIME"), ColumnKind::DateTime);
        assert_eq!(ColumnKind::from_data_type("decimal"), ColumnKind::Decimal);
        assert_eq!(ColumnKind::from_data_type("varchar"), ColumnKind::Other);
        assert_eq!(
            ColumnKind::from_column_type(ColumnType::MYSQL_TYPE_NEWDECIMAL),
            ColumnKind::Decimal
        );
    }

    #[test]
    fn temporal_values_follow_column_kind() {
        let value = Value::Date(2024, 3, 1, 12, 30, 0, 0);
        assert_eq!(
            convert_value(value.clone(), ColumnKind::Date),
            RawValue::Date(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap())
        );
        let RawValue::DateTime(dt) = convert_value(value, ColumnKind::DateTime) else {
            panic!("expected datetime");
        };
        assert_eq!(dt.to_string(), "2024-03-01 12:30:00");

        let RawValue::Timestamp(ts) = convert_value(
            Value::Bytes(b"1709296200.5".to_vec()),
            ColumnKind::Timestamp,
        ) else {
            panic!("expected timestamp");
        };
        assert_eq!(ts.timestamp(), 1_709_296_200);
        assert_eq!(ts.timestamp_subsec_millis(), 500);

        assert_eq!(
            convert_value(Value::Time(true, 1, 2, 3, 4, 0), ColumnKind::Time),
            RawValue::Time("-26:03:04".into())
        );
    }

    #[test]
    fn zero_dates_become_text() {
        assert_eq!(
            convert_value(Value::Date(0, 0, 0, 0, 0, 0, 0), ColumnKind::DateTime),
            RawValue::Text("0000-00-00 00:00:00".into())
        );
    }

    #[test]
    fn bytes_follow_column_kind() {
        assert_eq!(
            convert_value(Value::Bytes(b"9.50".to_vec()), ColumnKind::Decimal),
            RawValue::Decimal("9.50".into())
        );
        assert_eq!(
            convert_value(Value::Bytes(br#"{"a":1}"#.to_vec()), ColumnKind::Json),
            RawValue::Json(serde_json::json!({"a": 1}))
        );
        assert_eq!(
            convert_value(Value::Bytes(b"abc".to_vec()), ColumnKind::Other),
            RawValue::Bytes(b"abc".to_vec())
        );
    }
}
