// ABOUTME: Converts raw row mutations and snapshot rows into canonical ChangeEvents
// ABOUTME: Pairs update images, normalizes values and stamps positions and dedup keys

use std::collections::HashMap;

use chrono::{TimeZone, Utc};

use crate::dedup::DedupKeys;
use crate::event::{ChangeEvent, Operation, PositionMarker, Row, Value};
use crate::stream::{RawValue, RowAction, RowMutation, ScanRow};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("update on {table} carried {rows} row images; before/after images must pair up")]
    UnpairedUpdate { table: String, rows: usize },
    #[error("row {index} on {table} has {width} values but the table has {columns} columns")]
    RowWidthMismatch {
        table: String,
        index: usize,
        width: usize,
        columns: usize,
    },
}

/// Maps one raw column value to its canonical form.
pub fn normalize_value(raw: RawValue) -> Value {
    match raw {
        RawValue::Null => Value::Null,
        RawValue::Bool(v) => Value::Bool(v),
        RawValue::Int(v) => Value::Int(v),
        RawValue::UInt(v) => Value::UInt(v),
        RawValue::Float(v) => Value::Float(v),
        RawValue::Decimal(v) => Value::Decimal(v),
        RawValue::Text(v) => Value::Text(v),
        RawValue::Bytes(bytes) => Value::Text(match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
        }),
        RawValue::Date(v) => Value::Date(v),
        RawValue::DateTime(v) => Value::Timestamp(Utc.from_utc_datetime(&v)),
        RawValue::Timestamp(v) => Value::Timestamp(v.with_timezone(&Utc)),
        RawValue::Time(v) => Value::Text(v),
        RawValue::Json(v) => Value::Json(v),
    }
}

/// Per-source normalizer. Holds the snapshot row counters, so one instance
/// must see every snapshot row of a table.
#[derive(Debug)]
pub struct Normalizer {
    keys: DedupKeys,
    snapshot_counters: HashMap<String, u64>,
}

impl Normalizer {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            keys: DedupKeys::new(source),
            snapshot_counters: HashMap::new(),
        }
    }

    pub fn source(&self) -> &str {
        self.keys.source()
    }

    /// Converts one rows event into change events, in row order.
    pub fn normalize(&self, mutation: RowMutation) -> Result<Vec<ChangeEvent>, NormalizeError> {
        let RowMutation {
            action,
            table,
            columns,
            primary_key,
            rows,
            position,
        } = mutation;

        for (index, row) in rows.iter().enumerate() {
            if row.len() != columns.len() {
                return Err(NormalizeError::RowWidthMismatch {
                    table,
                    index,
                    width: row.len(),
                    columns: columns.len(),
                });
            }
        }

        if action == RowAction::Update && rows.len() % 2 != 0 {
            return Err(NormalizeError::UnpairedUpdate {
                table,
                rows: rows.len(),
            });
        }

        let mut images = rows.into_iter().map(|row| to_row(&columns, row));
        let mut events = Vec::new();
        loop {
            let (operation, before, after) = match action {
                RowAction::Insert => match images.next() {
                    Some(after) => (Operation::Insert, Row::new(), after),
                    None => break,
                },
                RowAction::Delete => match images.next() {
                    Some(before) => (Operation::Delete, before, Row::new()),
                    None => break,
                },
                RowAction::Update => match (images.next(), images.next()) {
                    (Some(before), Some(after)) => (Operation::Update, before, after),
                    _ => break,
                },
            };

            // Deletes only carry a before-image; everything else keys on the after-image.
            let keyed = if operation == Operation::Delete {
                &before
            } else {
                &after
            };
            let dedup = self
                .keys
                .for_row(&table, key_values(&columns, &primary_key, keyed));
            if dedup.is_degraded() {
                tracing::warn!(
                    source = self.source(),
                    table = %table,
                    position = %position,
                    "primary key unavailable; dedup key degraded to a random token"
                );
            }
            let degraded_idempotency = dedup.is_degraded();
            events.push(ChangeEvent {
                operation,
                table: table.clone(),
                before,
                after,
                position: position.clone(),
                dedup_key: dedup.into_string(),
                degraded_idempotency,
            });
        }

        Ok(events)
    }

    /// Converts one scanned row into a snapshot event. The position is a
    /// per-table counter starting at 1 and never reaches the checkpoint.
    pub fn normalize_snapshot_row(&mut self, table: &str, row: ScanRow) -> ChangeEvent {
        let counter = self
            .snapshot_counters
            .entry(table.to_string())
            .or_insert(0);
        *counter += 1;
        let counter = *counter;

        ChangeEvent {
            operation: Operation::SnapshotInsert,
            table: table.to_string(),
            before: Row::new(),
            after: row
                .into_iter()
                .map(|(field, raw)| (field, normalize_value(raw)))
                .collect(),
            position: PositionMarker::new(table, counter),
            dedup_key: self.keys.for_snapshot(table, counter),
            degraded_idempotency: false,
        }
    }
}

fn to_row(columns: &[String], values: Vec<RawValue>) -> Row {
    columns
        .iter()
        .cloned()
        .zip(values.into_iter().map(normalize_value))
        .collect()
}

fn key_values<'a>(
    columns: &[String],
    primary_key: &[usize],
    row: &'a Row,
) -> Option<Vec<&'a Value>> {
    if primary_key.is_empty() {
        return None;
    }
    primary_key
        .iter()
        .map(|&idx| columns.get(idx).and_then(|name| row.get(name)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, NaiveDate};

    fn columns() -> Vec<String> {
        vec!["id".into(), "total".into()]
    }

    fn mutation(action: RowAction, rows: Vec<Vec<RawValue>>) -> RowMutation {
        RowMutation {
            action,
            table: "orders".into(),
            columns: columns(),
            primary_key: vec![0],
            rows,
            position: PositionMarker::new("binlog.000001", 420),
        }
    }

    #[test]
    fn insert_populates_after_only() {
        let normalizer = Normalizer::new("src1");
        let events = normalizer
            .normalize(mutation(
                RowAction::Insert,
                vec![vec![RawValue::Int(1), RawValue::Float(9.5)]],
            ))
            .unwrap();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.operation, Operation::Insert);
        assert!(event.before.is_empty());
        assert_eq!(event.after.get("total"), Some(&Value::Float(9.5)));
        assert_eq!(event.dedup_key, "src1-orders-1");
        assert_eq!(event.position, PositionMarker::new("binlog.000001", 420));
    }

    #[test]
    fn update_pairs_even_and_odd_rows() {
        let normalizer = Normalizer::new("src1");
        let events = normalizer
            .normalize(mutation(
                RowAction::Update,
                vec![
                    vec![RawValue::Int(1), RawValue::Float(1.0)],
                    vec![RawValue::Int(1), RawValue::Float(2.0)],
                    vec![RawValue::Int(2), RawValue::Float(3.0)],
                    vec![RawValue::Int(2), RawValue::Float(4.0)],
                ],
            ))
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].operation, Operation::Update);
        assert_eq!(events[0].before.get("total"), Some(&Value::Float(1.0)));
        assert_eq!(events[0].after.get("total"), Some(&Value::Float(2.0)));
        assert_eq!(events[1].before.get("total"), Some(&Value::Float(3.0)));
        assert_eq!(events[1].after.get("total"), Some(&Value::Float(4.0)));
        assert_eq!(events[1].dedup_key, "src1-orders-2");
    }

    #[test]
    fn odd_update_row_count_is_an_error() {
        let normalizer = Normalizer::new("src1");
        let err = normalizer
            .normalize(mutation(
                RowAction::Update,
                vec![
                    vec![RawValue::Int(1), RawValue::Float(1.0)],
                    vec![RawValue::Int(1), RawValue::Float(2.0)],
                    vec![RawValue::Int(2), RawValue::Float(3.0)],
                ],
            ))
            .unwrap_err();
        assert_eq!(
            err,
            NormalizeError::UnpairedUpdate {
                table: "orders".into(),
                rows: 3
            }
        );
    }

    #[test]
    fn row_width_mismatch_is_an_error() {
        let normalizer = Normalizer::new("src1");
        let err = normalizer
            .normalize(mutation(RowAction::Insert, vec![vec![RawValue::Int(1)]]))
            .unwrap_err();
        assert!(matches!(err, NormalizeError::RowWidthMismatch { width: 1, .. }));
    }

    #[test]
    fn delete_keys_on_before_image() {
        let normalizer = Normalizer::new("src1");
        let events = normalizer
            .normalize(mutation(
                RowAction::Delete,
                vec![vec![RawValue::Int(9), RawValue::Null]],
            ))
            .unwrap();
        assert!(events[0].after.is_empty());
        assert_eq!(events[0].before.get("total"), Some(&Value::Null));
        assert_eq!(events[0].dedup_key, "src1-orders-9");
    }

    #[test]
    fn missing_primary_key_degrades_idempotency() {
        let normalizer = Normalizer::new("src1");
        let mut m = mutation(
            RowAction::Insert,
            vec![vec![RawValue::Int(1), RawValue::Float(9.5)]],
        );
        m.primary_key.clear();
        let events = normalizer.normalize(m).unwrap();
        assert!(events[0].degraded_idempotency);
        assert!(!events[0].dedup_key.starts_with("src1-orders"));
    }

    #[test]
    fn blobs_become_text_and_times_become_utc() {
        assert_eq!(
            normalize_value(RawValue::Bytes(b"hello".to_vec())),
            Value::Text("hello".into())
        );
        assert_eq!(
            normalize_value(RawValue::Bytes(vec![0x66, 0xff])),
            Value::Text("f\u{fffd}".into())
        );

        let local = FixedOffset::east_opt(8 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 1, 1, 8, 0, 0)
            .unwrap();
        let expected = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(
            normalize_value(RawValue::Timestamp(local)),
            Value::Timestamp(expected)
        );

        let naive = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert_eq!(
            normalize_value(RawValue::DateTime(naive)),
            Value::Timestamp(expected)
        );
    }

    #[test]
    fn snapshot_rows_count_per_table() {
        let mut normalizer = Normalizer::new("src1");
        let mut row = ScanRow::new();
        row.insert("id".into(), RawValue::Int(5));

        let first = normalizer.normalize_snapshot_row("orders", row.clone());
        let second = normalizer.normalize_snapshot_row("orders", row.clone());
        let other = normalizer.normalize_snapshot_row("customers", row);

        assert_eq!(first.operation, Operation::SnapshotInsert);
        assert_eq!(first.dedup_key, "src1-orders-1-snapshot");
        assert_eq!(second.dedup_key, "src1-orders-2-snapshot");
        assert_eq!(second.position, PositionMarker::new("orders", 2));
        assert_eq!(other.dedup_key, "src1-customers-1-snapshot");
    }
}
