// ABOUTME: Durable checkpoint of the streaming position and snapshot progress
// ABOUTME: Writes {source}-POS / {source}-POSNAME and per-table initialload flags

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use relay_store::{KvStore, KvWrite, StoreError};
use tokio::sync::watch;

use crate::event::PositionMarker;
use crate::utils::retry_until_ok;

/// What a source resumes from after a restart.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceState {
    pub last_position: Option<PositionMarker>,
    pub snapshot_completed: BTreeMap<String, bool>,
}

impl SourceState {
    pub fn is_snapshot_complete(&self, table: &str) -> bool {
        self.snapshot_completed.get(table).copied().unwrap_or(false)
    }
}

/// Owned by the submission loop; the only writer of a source's checkpoint.
pub struct PositionTracker {
    source: String,
    namespace: String,
    store: Option<Arc<dyn KvStore>>,
    retry_backoff: Duration,
    last_committed: Option<PositionMarker>,
    committed: watch::Sender<Option<PositionMarker>>,
}

impl PositionTracker {
    pub fn new(
        source: impl Into<String>,
        store: Option<Arc<dyn KvStore>>,
        retry_backoff: Duration,
    ) -> Self {
        let source = source.into();
        let (committed, _) = watch::channel(None);
        Self {
            namespace: format!("source-{source}"),
            source,
            store,
            retry_backoff,
            last_committed: None,
            committed,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn has_store(&self) -> bool {
        self.store.is_some()
    }

    fn pos_key(&self) -> String {
        format!("{}-POS", self.source)
    }

    fn pos_name_key(&self) -> String {
        format!("{}-POSNAME", self.source)
    }

    fn initial_load_key(&self, table: &str) -> String {
        format!("{}-{}-initialload", self.source, table)
    }

    /// Receives every committed position. The stream worker resubscribes
    /// from the latest value after a disconnect.
    pub fn subscribe(&self) -> watch::Receiver<Option<PositionMarker>> {
        self.committed.subscribe()
    }

    pub fn last_committed(&self) -> Option<&PositionMarker> {
        self.last_committed.as_ref()
    }

    /// Reads the stored checkpoint and the snapshot flag of each table.
    pub fn load_state<'a>(
        &mut self,
        tables: impl IntoIterator<Item = &'a str>,
    ) -> Result<SourceState> {
        let Some(store) = self.store.clone() else {
            return Ok(SourceState::default());
        };

        let name = store
            .get_string(&self.namespace, &self.pos_name_key())
            .with_context(|| format!("Failed to read position name for source '{}'", self.source))?;
        let offset = store
            .get_int(&self.namespace, &self.pos_key())
            .with_context(|| format!("Failed to read position for source '{}'", self.source))?;
        let last_position = match (name, offset) {
            (Some(name), Some(offset)) => {
                let marker = PositionMarker::new(name, u64::try_from(offset).unwrap_or(0));
                (!marker.is_unset()).then_some(marker)
            }
            _ => None,
        };

        let mut snapshot_completed = BTreeMap::new();
        for table in tables {
            let flag = store
                .get_int(&self.namespace, &self.initial_load_key(table))
                .with_context(|| {
                    format!(
                        "Failed to read snapshot state of {}.{}",
                        self.source, table
                    )
                })?;
            snapshot_completed.insert(table.to_string(), flag == Some(1));
        }

        if let Some(position) = &last_position {
            tracing::info!(source = %self.source, position = %position, "loaded checkpoint");
        }
        self.last_committed = last_position.clone();
        self.committed.send_replace(last_position.clone());

        Ok(SourceState {
            last_position,
            snapshot_completed,
        })
    }

    /// Persists `position` unless it is behind the last committed one.
    /// Store failures are retried until the write lands.
    pub async fn commit_position(&mut self, position: &PositionMarker) {
        if position.is_unset() {
            return;
        }
        if let Some(last) = &self.last_committed {
            if position <= last {
                return;
            }
        }

        if let Some(store) = self.store.clone() {
            let namespace = self.namespace.as_str();
            let pos_name_key = self.pos_name_key();
            let pos_key = self.pos_key();
            let offset = i64::try_from(position.offset).unwrap_or(i64::MAX);
            // Name and offset land together or not at all.
            let writes = [
                KvWrite::Text {
                    key: &pos_name_key,
                    value: &position.stream_name,
                },
                KvWrite::Int {
                    key: &pos_key,
                    value: offset,
                },
            ];
            retry_until_ok("persist position", self.retry_backoff, || {
                let result = store.put_many(namespace, &writes);
                async move { result }
            })
            .await;
        }

        tracing::trace!(source = %self.source, position = %position, "committed position");
        self.last_committed = Some(position.clone());
        self.committed.send_replace(Some(position.clone()));
    }

    /// Records that every snapshot row of `table` has been handed to the sink.
    pub async fn mark_snapshot_complete(&mut self, table: &str) {
        if let Some(store) = self.store.clone() {
            let namespace = self.namespace.as_str();
            let key = self.initial_load_key(table);
            retry_until_ok("persist snapshot state", self.retry_backoff, || {
                let result = store.put_int(namespace, &key, 1);
                async move { result }
            })
            .await;
        }
        tracing::info!(source = %self.source, table = %table, "snapshot load complete");
    }

    /// Releases the store handle.
    pub fn close(&self) -> Result<(), StoreError> {
        match &self.store {
            Some(store) => store.close(),
            None => Ok(()),
        }
    }
}
