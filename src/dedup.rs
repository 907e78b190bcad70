// ABOUTME: Idempotency keys attached to every outbound message
// ABOUTME: Stable keys from primary-key values, counter keys for snapshot rows

use crate::event::Value;

const SEPARATOR: &str = "-";

/// Derives dedup keys for one source.
#[derive(Debug, Clone)]
pub struct DedupKeys {
    source: String,
}

/// Result of key derivation for a streamed row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupKey {
    /// Derived from the primary key; identical on every redelivery.
    Stable(String),
    /// Random token used when the primary key could not be read.
    Degraded(String),
}

impl DedupKey {
    pub fn is_degraded(&self) -> bool {
        matches!(self, DedupKey::Degraded(_))
    }

    pub fn into_string(self) -> String {
        match self {
            DedupKey::Stable(key) | DedupKey::Degraded(key) => key,
        }
    }
}

impl DedupKeys {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// `{source}-{table}-{pk1}-{pk2}...`, or `None` when no key can be formed.
    pub fn from_primary_key(&self, table: &str, key_values: &[&Value]) -> Option<String> {
        if key_values.is_empty() || key_values.iter().any(|v| v.is_null()) {
            return None;
        }
        let joined = key_values
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(SEPARATOR);
        Some(format!("{}-{}-{}", self.source, table, joined))
    }

    /// Like [`DedupKeys::from_primary_key`] but falls back to a random token.
    pub fn for_row(&self, table: &str, key_values: Option<Vec<&Value>>) -> DedupKey {
        match key_values.and_then(|values| self.from_primary_key(table, &values)) {
            Some(key) => DedupKey::Stable(key),
            None => DedupKey::Degraded(uuid::Uuid::new_v4().to_string()),
        }
    }

    /// `{source}-{table}-{n}-snapshot` for the n-th scanned row of a table.
    pub fn for_snapshot(&self, table: &str, counter: u64) -> String {
        format!("{}-{}-{}-snapshot", self.source, table, counter)
    }
}
