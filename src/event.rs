// ABOUTME: Canonical change-event model shared by every pipeline stage
// ABOUTME: Defines Value, PositionMarker, ChangeEvent and OutboundMessage

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::ser::Error as _;
use serde::{Serialize, Serializer};

/// Row operation carried by a [`ChangeEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Insert,
    Update,
    Delete,
    SnapshotInsert,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::SnapshotInsert => "snapshot",
        }
    }

    pub fn is_snapshot(&self) -> bool {
        matches!(self, Operation::SnapshotInsert)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One column value after normalization.
///
/// Blobs have already been decoded to text and temporal values shifted to
/// UTC by the time a `Value` exists, so serialization never has to care about
/// where a row came from.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    /// Exact numeric kept as its textual form to avoid float rounding.
    Decimal(String),
    Text(String),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::UInt(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Decimal(v) | Value::Text(v) => f.write_str(v),
            Value::Date(v) => write!(f, "{}", v.format("%Y-%m-%d")),
            Value::Timestamp(v) => f.write_str(&v.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            Value::Json(v) => write!(f, "{v}"),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(v) => serializer.serialize_bool(*v),
            Value::Int(v) => serializer.serialize_i64(*v),
            Value::UInt(v) => serializer.serialize_u64(*v),
            Value::Float(v) if v.is_finite() => serializer.serialize_f64(*v),
            Value::Float(v) => Err(S::Error::custom(format!(
                "non-finite float {v} cannot be represented in JSON"
            ))),
            Value::Decimal(v) | Value::Text(v) => serializer.serialize_str(v),
            Value::Date(v) => serializer.collect_str(&v.format("%Y-%m-%d")),
            Value::Timestamp(v) => {
                serializer.serialize_str(&v.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            Value::Json(v) => v.serialize(serializer),
        }
    }
}

/// Field name to value map for one row image.
pub type Row = BTreeMap<String, Value>;

/// Opaque, source-local cursor into the change stream.
///
/// For a binlog source `stream_name` is the binlog file and `offset` the byte
/// position within it. Names order by basename, then by the numeric sequence
/// after the last `.`, so `binlog.999999` sorts before `binlog.1000000`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct PositionMarker {
    pub stream_name: String,
    pub offset: u64,
}

impl PositionMarker {
    pub fn new(stream_name: impl Into<String>, offset: u64) -> Self {
        Self {
            stream_name: stream_name.into(),
            offset,
        }
    }

    /// A marker that has never been assigned by a stream.
    pub fn is_unset(&self) -> bool {
        self.stream_name.is_empty() && self.offset == 0
    }
}

/// `(basename, sequence, full name)`; names without a numeric extension have
/// no sequence and sort first within their basename.
fn stream_sort_key(name: &str) -> (&str, Option<u64>, &str) {
    match name.rsplit_once('.') {
        Some((base, ext)) => match ext.parse::<u64>() {
            Ok(sequence) => (base, Some(sequence), name),
            Err(_) => (base, None, name),
        },
        None => (name, None, name),
    }
}

impl Ord for PositionMarker {
    fn cmp(&self, other: &Self) -> Ordering {
        stream_sort_key(&self.stream_name)
            .cmp(&stream_sort_key(&other.stream_name))
            .then(self.offset.cmp(&other.offset))
    }
}

impl PartialOrd for PositionMarker {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for PositionMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.stream_name, self.offset)
    }
}

/// Canonical representation of one row mutation or one snapshot row.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub operation: Operation,
    pub table: String,
    pub before: Row,
    pub after: Row,
    pub position: PositionMarker,
    pub dedup_key: String,
    /// Set when the primary key could not be read and `dedup_key` is a
    /// random token. Redelivery of such an event is not collapsed downstream.
    pub degraded_idempotency: bool,
}

impl ChangeEvent {
    /// JSON payload: the before-image overlaid with the after-image.
    pub fn payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut merged: BTreeMap<&str, &Value> = BTreeMap::new();
        for (field, value) in self.before.iter().chain(self.after.iter()) {
            merged.insert(field.as_str(), value);
        }
        serde_json::to_vec(&merged)
    }
}

/// A routed, serialized event ready for the message sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub event_name: String,
    pub payload: Vec<u8>,
    pub dedup_key: String,
    pub position: PositionMarker,
    pub table: String,
    pub operation: Operation,
}

impl OutboundMessage {
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn positions_order_by_stream_then_offset() {
        let a = PositionMarker::new("binlog.000001", 900);
        let b = PositionMarker::new("binlog.000002", 4);
        let c = PositionMarker::new("binlog.000002", 120);
        assert!(a < b);
        assert!(b < c);
        assert!(PositionMarker::default().is_unset());
    }

    #[test]
    fn sequence_rollover_keeps_moving_forward() {
        let last_six_digit = PositionMarker::new("mysql-bin.999999", 4_000);
        let first_seven_digit = PositionMarker::new("mysql-bin.1000000", 4);
        assert!(last_six_digit < first_seven_digit);
        assert!(PositionMarker::new("mysql-bin.000009", 4) < PositionMarker::new("mysql-bin.10", 4));
        // Same number, different padding: still distinct and consistently ordered.
        let padded = PositionMarker::new("mysql-bin.01", 4);
        let bare = PositionMarker::new("mysql-bin.1", 4);
        assert_ne!(padded, bare);
        assert_ne!(padded.cmp(&bare), Ordering::Equal);
    }

    #[test]
    fn payload_overlays_after_on_before() {
        let mut before = Row::new();
        before.insert("id".into(), Value::Int(1));
        before.insert("status".into(), Value::Text("new".into()));
        let mut after = Row::new();
        after.insert("id".into(), Value::Int(1));
        after.insert("status".into(), Value::Text("paid".into()));
        let event = ChangeEvent {
            operation: Operation::Update,
            table: "orders".into(),
            before,
            after,
            position: PositionMarker::new("binlog.000001", 10),
            dedup_key: "src1-orders-1".into(),
            degraded_idempotency: false,
        };
        let payload = event.payload().unwrap();
        assert_eq!(payload, br#"{"id":1,"status":"paid"}"#.to_vec());
    }

    #[test]
    fn timestamps_serialize_as_utc_rfc3339() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        let json = serde_json::to_string(&Value::Timestamp(ts)).unwrap();
        assert_eq!(json, r#""2024-03-01T12:30:00Z""#);
    }

    #[test]
    fn non_finite_floats_fail_serialization() {
        assert!(serde_json::to_vec(&Value::Float(f64::NAN)).is_err());
        assert_eq!(serde_json::to_string(&Value::Float(9.5)).unwrap(), "9.5");
    }
}
