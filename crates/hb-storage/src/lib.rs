use thiserror::Error;

pub mod eviction;
pub mod layer;
pub mod layout;
pub mod queue;
pub mod quota;
pub mod sqlite;
pub mod store;

pub use eviction::{EvictionCandidate, EvictionReport};
pub use layer::{StorageLayer, StoredIn, WriteAck};
pub use quota::{QuotaCache, QuotaLevel, QuotaSnapshot, QuotaWarning};
pub use sqlite::SqliteStore;
pub use store::{EntryMeta, KvStore, MemoryStore, StoreUsage};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{store} quota exceeded: {requested} bytes requested, {available} available")]
    QuotaExceeded {
        store: String,
        requested: u64,
        available: u64,
    },
    #[error("{store} unavailable: {reason}")]
    Unavailable { store: String, reason: String },
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("storage layer is closed")]
    Closed,
}

impl StorageError {
    /// Transient failures are worth retrying; a full store or bad data is not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::Unavailable { .. } | StorageError::Sqlite(_)
        )
    }

    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, StorageError::QuotaExceeded { .. })
    }
}

/// Bytes an entry costs against a quota: key plus serialized value.
pub fn entry_size(key: &str, value: &serde_json::Value) -> u64 {
    let value_len = serde_json::to_string(value)
        .map(|encoded| encoded.len())
        .unwrap_or(0);
    (key.len() + value_len) as u64
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
