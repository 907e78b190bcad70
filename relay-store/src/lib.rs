pub mod kv;
pub mod memory;

pub use kv::{KvStore, KvWrite, SqliteKvStore, StoreError};
pub use memory::MemoryKvStore;
