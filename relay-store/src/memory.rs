use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::kv::{KvStore, KvWrite, StoreError};

#[derive(Debug, Clone, Default)]
struct Entry {
    text: Option<String>,
    int: Option<i64>,
}

/// In-process [`KvStore`]. Nothing survives the process; meant for tests and
/// for running a relay with checkpointing disabled on disk.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<(String, String), Entry>>,
    closed: AtomicBool,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn update(
        &self,
        namespace: &str,
        key: &str,
        f: impl FnOnce(&mut Entry),
    ) -> Result<(), StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        f(entries
            .entry((namespace.to_string(), key.to_string()))
            .or_default());
        Ok(())
    }

    fn read(&self, namespace: &str, key: &str) -> Result<Option<Entry>, StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        let entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(entries
            .get(&(namespace.to_string(), key.to_string()))
            .cloned())
    }
}

impl KvStore for MemoryKvStore {
    fn get_string(&self, namespace: &str, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.read(namespace, key)?.and_then(|e| e.text))
    }

    fn put_string(&self, namespace: &str, key: &str, value: &str) -> Result<(), StoreError> {
        self.update(namespace, key, |e| e.text = Some(value.to_string()))
    }

    fn get_int(&self, namespace: &str, key: &str) -> Result<Option<i64>, StoreError> {
        Ok(self.read(namespace, key)?.and_then(|e| e.int))
    }

    fn put_int(&self, namespace: &str, key: &str, value: i64) -> Result<(), StoreError> {
        self.update(namespace, key, |e| e.int = Some(value))
    }

    fn put_many(&self, namespace: &str, writes: &[KvWrite<'_>]) -> Result<(), StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        for write in writes {
            let entry = entries
                .entry((namespace.to_string(), write.key().to_string()))
                .or_default();
            match write {
                KvWrite::Text { value, .. } => entry.text = Some(value.to_string()),
                KvWrite::Int { value, .. } => entry.int = Some(*value),
            }
        }
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_store_rejects_access() {
        let store = MemoryKvStore::new();
        store.put_string("ns", "name", "binlog.000001").unwrap();
        store.close().unwrap();
        assert!(matches!(store.get_string("ns", "name"), Err(StoreError::Closed)));
        assert!(matches!(store.put_int("ns", "pos", 4), Err(StoreError::Closed)));
    }
}
