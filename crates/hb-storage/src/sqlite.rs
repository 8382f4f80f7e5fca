use crate::store::{EntryMeta, KvStore, StoreUsage};
use crate::{entry_size, now_ms, StorageError};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

pub const KV_SCHEMA_VERSION: i64 = 1;

/// Durable primary store backed by SQLite, with a byte ceiling enforced on
/// every `set` the way the host enforces its storage quota.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    quota_bytes: u64,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>, quota_bytes: u64) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
            quota_bytes,
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory(quota_bytes: u64) -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
            quota_bytes,
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn quota_bytes(&self) -> u64 {
        self.quota_bytes
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .lock()
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > KV_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: KV_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let conn = self.lock();
            conn.execute_batch(include_str!("../migrations/0001_kv_schema.sql"))?;
            conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
        }

        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl KvStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn get(&self, keys: &[String]) -> Result<BTreeMap<String, Value>, StorageError> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached("SELECT value_json FROM kv_entries WHERE key = ?1")?;
        let mut found = BTreeMap::new();
        for key in keys {
            let raw: Option<String> = stmt
                .query_row(params![key], |row| row.get(0))
                .optional()?;
            if let Some(raw) = raw {
                let value = serde_json::from_str(&raw)
                    .map_err(|err| StorageError::Serialization(err.to_string()))?;
                found.insert(key.clone(), value);
            }
        }
        Ok(found)
    }

    fn set(&self, entries: &BTreeMap<String, Value>) -> Result<(), StorageError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let used: i64 = tx.query_row(
            "SELECT COALESCE(SUM(size_bytes), 0) FROM kv_entries",
            [],
            |row| row.get(0),
        )?;
        let mut replaced: i64 = 0;
        let mut requested: u64 = 0;
        let mut encoded = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let existing: Option<i64> = tx
                .query_row(
                    "SELECT size_bytes FROM kv_entries WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            replaced += existing.unwrap_or(0);
            let value_json = serde_json::to_string(value)
                .map_err(|err| StorageError::Serialization(err.to_string()))?;
            let size = entry_size(key, value);
            requested += size;
            encoded.push((key, value_json, size));
        }

        let baseline = (used - replaced).max(0) as u64;
        if baseline + requested > self.quota_bytes {
            return Err(StorageError::QuotaExceeded {
                store: self.name().to_string(),
                requested,
                available: self.quota_bytes.saturating_sub(baseline),
            });
        }

        let now = now_ms();
        for (key, value_json, size) in encoded {
            tx.execute(
                "
                INSERT INTO kv_entries (key, value_json, size_bytes, updated_at_ms)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(key) DO UPDATE SET
                    value_json=excluded.value_json,
                    size_bytes=excluded.size_bytes,
                    updated_at_ms=excluded.updated_at_ms
                ",
                params![key, value_json, size as i64, now],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn remove(&self, keys: &[String]) -> Result<(), StorageError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        for key in keys {
            tx.execute("DELETE FROM kv_entries WHERE key = ?1", params![key])?;
        }
        tx.commit()?;
        Ok(())
    }

    fn entries(&self) -> Result<Vec<EntryMeta>, StorageError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT key, size_bytes, updated_at_ms FROM kv_entries ORDER BY size_bytes DESC, updated_at_ms ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let size: i64 = row.get(1)?;
            Ok(EntryMeta {
                key: row.get(0)?,
                size_bytes: size.max(0) as u64,
                updated_at_ms: row.get(2)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn usage(&self) -> Result<StoreUsage, StorageError> {
        let used: i64 = self.lock().query_row(
            "SELECT COALESCE(SUM(size_bytes), 0) FROM kv_entries",
            [],
            |row| row.get(0),
        )?;
        Ok(StoreUsage {
            used_bytes: used.max(0) as u64,
            total_bytes: self.quota_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn migration_creates_kv_table() {
        let store = SqliteStore::open_in_memory(1024).expect("open");
        assert_eq!(store.schema_version().expect("version"), KV_SCHEMA_VERSION);
        store.migrate().expect("migrate is idempotent");
    }

    #[test]
    fn values_survive_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("hoverboard.db");
        {
            let store = SqliteStore::open(&path, 4096).expect("open");
            let mut entries = BTreeMap::new();
            entries.insert(
                "recentTags".to_string(),
                json!({"tags": ["rust"], "timestamp": 1, "count": 1}),
            );
            store.set(&entries).expect("set");
        }
        let reopened = SqliteStore::open(&path, 4096).expect("reopen");
        let found = reopened
            .get(&["recentTags".to_string()])
            .expect("get");
        assert_eq!(found["recentTags"]["tags"][0], "rust");
    }

    #[test]
    fn set_over_quota_is_rejected_without_partial_writes() {
        let store = SqliteStore::open_in_memory(20).expect("open");
        let mut small = BTreeMap::new();
        small.insert("a".to_string(), json!("0123456789"));
        store.set(&small).expect("13 bytes fit");

        let mut big = BTreeMap::new();
        big.insert("b".to_string(), json!("x"));
        big.insert("c".to_string(), json!("0123456789"));
        let err = store.set(&big).expect_err("over quota");
        assert!(err.is_quota_exceeded());
        assert!(store
            .get(&["b".to_string()])
            .expect("get")
            .is_empty());

        let usage = store.usage().expect("usage");
        assert_eq!(usage.used_bytes, 13);
        assert_eq!(usage.total_bytes, 20);
    }

    #[test]
    fn entries_report_sizes_and_removal_frees_space() {
        let store = SqliteStore::open_in_memory(1024).expect("open");
        let mut entries = BTreeMap::new();
        entries.insert("small".to_string(), json!(1));
        entries.insert("large".to_string(), json!("a much longer value"));
        store.set(&entries).expect("set");

        let meta = store.entries().expect("entries");
        assert_eq!(meta[0].key, "large");
        assert_eq!(meta[1].key, "small");

        store.remove(&["large".to_string()]).expect("remove");
        assert_eq!(store.usage().expect("usage").used_bytes, 6);
    }
}
