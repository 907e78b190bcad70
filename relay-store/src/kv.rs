use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    namespace     TEXT NOT NULL,
    key           TEXT NOT NULL,
    text_value    TEXT,
    int_value     INTEGER,
    updated_at    TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (namespace, key)
);
"#;

const UPSERT_TEXT: &str = "INSERT INTO kv(namespace, key, text_value, updated_at)
     VALUES (?1, ?2, ?3, CURRENT_TIMESTAMP)
     ON CONFLICT(namespace, key) DO UPDATE SET
        text_value = excluded.text_value,
        updated_at = CURRENT_TIMESTAMP";

const UPSERT_INT: &str = "INSERT INTO kv(namespace, key, int_value, updated_at)
     VALUES (?1, ?2, ?3, CURRENT_TIMESTAMP)
     ON CONFLICT(namespace, key) DO UPDATE SET
        int_value = excluded.int_value,
        updated_at = CURRENT_TIMESTAMP";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to prepare store directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store has been closed")]
    Closed,
    #[error("store lock poisoned")]
    Poisoned,
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// One typed write in a [`KvStore::put_many`] group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvWrite<'a> {
    Text { key: &'a str, value: &'a str },
    Int { key: &'a str, value: i64 },
}

impl KvWrite<'_> {
    pub fn key(&self) -> &str {
        match self {
            KvWrite::Text { key, .. } | KvWrite::Int { key, .. } => key,
        }
    }
}

/// Namespaced key-value storage with typed string and integer values.
///
/// Each relay source reads and writes under its own namespace, so no
/// cross-namespace locking is required by callers.
pub trait KvStore: Send + Sync {
    fn get_string(&self, namespace: &str, key: &str) -> Result<Option<String>, StoreError>;
    fn put_string(&self, namespace: &str, key: &str, value: &str) -> Result<(), StoreError>;
    fn get_int(&self, namespace: &str, key: &str) -> Result<Option<i64>, StoreError>;
    fn put_int(&self, namespace: &str, key: &str, value: i64) -> Result<(), StoreError>;
    /// Applies every write or none of them.
    fn put_many(&self, namespace: &str, writes: &[KvWrite<'_>]) -> Result<(), StoreError>;
    /// Releases the underlying handle. Later calls return [`StoreError::Closed`].
    fn close(&self) -> Result<(), StoreError>;
}

pub struct SqliteKvStore {
    path: PathBuf,
    conn: Mutex<Connection>,
    closed: AtomicBool,
}

impl SqliteKvStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
                #[cfg(unix)]
                set_owner_perms(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "wal")?;
        conn.pragma_update(None, "synchronous", "normal").ok();
        conn.execute_batch(SCHEMA)?;
        tracing::debug!(path = %path.display(), "opened kv store");
        Ok(Self {
            path: path.to_path_buf(),
            conn: Mutex::new(conn),
            closed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    ) -> Result<T, StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        f(&conn).map_err(Into::into)
    }
}

impl KvStore for SqliteKvStore {
    fn get_string(&self, namespace: &str, key: &str) -> Result<Option<String>, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT text_value FROM kv WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()
            .map(Option::flatten)
        })
    }

    fn put_string(&self, namespace: &str, key: &str, value: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(UPSERT_TEXT, params![namespace, key, value])
                .map(|_| ())
        })
    }

    fn get_int(&self, namespace: &str, key: &str) -> Result<Option<i64>, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT int_value FROM kv WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()
            .map(Option::flatten)
        })
    }

    fn put_int(&self, namespace: &str, key: &str, value: i64) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(UPSERT_INT, params![namespace, key, value])
                .map(|_| ())
        })
    }

    fn put_many(&self, namespace: &str, writes: &[KvWrite<'_>]) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            // Rolled back on drop if any write fails.
            let tx = conn.unchecked_transaction()?;
            for write in writes {
                match write {
                    KvWrite::Text { key, value } => {
                        tx.execute(UPSERT_TEXT, params![namespace, key, value])?
                    }
                    KvWrite::Int { key, value } => {
                        tx.execute(UPSERT_INT, params![namespace, key, value])?
                    }
                };
            }
            tx.commit()
        })
    }

    fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        // Truncate the WAL into the main database file.
        conn.pragma_update(None, "wal_checkpoint", "TRUNCATE").ok();
        tracing::debug!(path = %self.path.display(), "closed kv store");
        Ok(())
    }
}

#[cfg(unix)]
fn set_owner_perms(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    let metadata = fs::metadata(path).map_err(io_err)?;
    let mut perms = metadata.permissions();
    perms.set_mode(0o700);
    fs::set_permissions(path, perms).map_err(io_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn string_and_int_values_share_a_key() {
        let dir = tempdir().unwrap();
        let store = SqliteKvStore::open(dir.path().join("kv.db")).unwrap();

        store.put_string("ns", "k", "hello").unwrap();
        store.put_int("ns", "k", 7).unwrap();

        assert_eq!(store.get_string("ns", "k").unwrap().as_deref(), Some("hello"));
        assert_eq!(store.get_int("ns", "k").unwrap(), Some(7));
    }

    #[test]
    fn namespaces_are_isolated() {
        let dir = tempdir().unwrap();
        let store = SqliteKvStore::open(dir.path().join("kv.db")).unwrap();

        store.put_int("a", "pos", 1).unwrap();
        store.put_int("b", "pos", 2).unwrap();

        assert_eq!(store.get_int("a", "pos").unwrap(), Some(1));
        assert_eq!(store.get_int("b", "pos").unwrap(), Some(2));
        assert_eq!(store.get_int("c", "pos").unwrap(), None);
    }

    #[test]
    fn put_many_writes_text_and_int_together() {
        let dir = tempdir().unwrap();
        let store = SqliteKvStore::open(dir.path().join("kv.db")).unwrap();

        store
            .put_many(
                "ns",
                &[
                    KvWrite::Text {
                        key: "name",
                        value: "binlog.000002",
                    },
                    KvWrite::Int {
                        key: "pos",
                        value: 120,
                    },
                ],
            )
            .unwrap();

        assert_eq!(
            store.get_string("ns", "name").unwrap().as_deref(),
            Some("binlog.000002")
        );
        assert_eq!(store.get_int("ns", "pos").unwrap(), Some(120));
    }
}
