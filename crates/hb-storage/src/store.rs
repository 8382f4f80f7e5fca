use crate::{entry_size, now_ms, StorageError};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreUsage {
    pub used_bytes: u64,
    /// Zero when the store has no ceiling.
    pub total_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMeta {
    pub key: String,
    pub size_bytes: u64,
    pub updated_at_ms: i64,
}

/// A key/value store the resilience layer can sit in front of. Calls are
/// synchronous; batching and retries live in the layer.
pub trait KvStore: Send + Sync {
    fn name(&self) -> &str;

    /// Missing keys are absent from the result.
    fn get(&self, keys: &[String]) -> Result<BTreeMap<String, Value>, StorageError>;

    /// All-or-nothing: a rejected set leaves the store unchanged.
    fn set(&self, entries: &BTreeMap<String, Value>) -> Result<(), StorageError>;

    fn remove(&self, keys: &[String]) -> Result<(), StorageError>;

    fn entries(&self) -> Result<Vec<EntryMeta>, StorageError>;

    fn usage(&self) -> Result<StoreUsage, StorageError>;
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: Value,
    size_bytes: u64,
    updated_at_ms: i64,
}

pub struct MemoryStore {
    name: String,
    quota_bytes: Option<u64>,
    entries: Mutex<BTreeMap<String, MemoryEntry>>,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            quota_bytes: None,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_quota(name: impl Into<String>, quota_bytes: u64) -> Self {
        Self {
            quota_bytes: Some(quota_bytes),
            ..Self::new(name)
        }
    }

    /// Inserts with an explicit timestamp, bypassing the quota. Lets callers
    /// seed aged data.
    pub fn insert_at(&self, key: impl Into<String>, value: Value, updated_at_ms: i64) {
        let key = key.into();
        let size_bytes = entry_size(&key, &value);
        self.lock().insert(
            key,
            MemoryEntry {
                value,
                size_bytes,
                updated_at_ms,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, MemoryEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl KvStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, keys: &[String]) -> Result<BTreeMap<String, Value>, StorageError> {
        let entries = self.lock();
        Ok(keys
            .iter()
            .filter_map(|key| {
                entries
                    .get(key)
                    .map(|entry| (key.clone(), entry.value.clone()))
            })
            .collect())
    }

    fn set(&self, entries: &BTreeMap<String, Value>) -> Result<(), StorageError> {
        let mut current = self.lock();
        let now = now_ms();
        let sized = entries
            .iter()
            .map(|(key, value)| (key, value, entry_size(key, value)))
            .collect::<Vec<_>>();

        if let Some(quota) = self.quota_bytes {
            let used: u64 = current.values().map(|entry| entry.size_bytes).sum();
            let replaced: u64 = entries
                .keys()
                .filter_map(|key| current.get(key).map(|entry| entry.size_bytes))
                .sum();
            let requested: u64 = sized.iter().map(|(_, _, size)| size).sum();
            let projected = used - replaced + requested;
            if projected > quota {
                return Err(StorageError::QuotaExceeded {
                    store: self.name.clone(),
                    requested,
                    available: quota.saturating_sub(used - replaced),
                });
            }
        }

        for (key, value, size_bytes) in sized {
            current.insert(
                key.clone(),
                MemoryEntry {
                    value: value.clone(),
                    size_bytes,
                    updated_at_ms: now,
                },
            );
        }
        Ok(())
    }

    fn remove(&self, keys: &[String]) -> Result<(), StorageError> {
        let mut current = self.lock();
        for key in keys {
            current.remove(key);
        }
        Ok(())
    }

    fn entries(&self) -> Result<Vec<EntryMeta>, StorageError> {
        Ok(self
            .lock()
            .iter()
            .map(|(key, entry)| EntryMeta {
                key: key.clone(),
                size_bytes: entry.size_bytes,
                updated_at_ms: entry.updated_at_ms,
            })
            .collect())
    }

    fn usage(&self) -> Result<StoreUsage, StorageError> {
        let used_bytes = self.lock().values().map(|entry| entry.size_bytes).sum();
        Ok(StoreUsage {
            used_bytes,
            total_bytes: self.quota_bytes.unwrap_or(0),
        })
    }
}
