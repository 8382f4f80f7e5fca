use crate::eviction::{select_candidates, EvictionReport};
use crate::queue::{coalesce, Batch, OpKind, OpPayload, OpQueue, OpResult, PendingValue, PushOutcome};
use crate::quota::{QuotaCache, QuotaLevel, QuotaSnapshot, QuotaWarning};
use crate::store::{KvStore, MemoryStore};
use crate::{now_ms, StorageError};
use hb_core::config::{FallbackStrategy, StorageConfig};
use hb_core::retry::RetryPolicy;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredIn {
    Primary,
    Secondary,
    /// Held only in this process; lost on restart.
    Memory,
}

impl StoredIn {
    pub fn as_str(self) -> &'static str {
        match self {
            StoredIn::Primary => "primary",
            StoredIn::Secondary => "secondary",
            StoredIn::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteAck {
    pub stored_in: StoredIn,
    pub warning: Option<QuotaWarning>,
}

struct LayerState {
    queue: OpQueue,
    quota: QuotaCache,
    fallback: HashMap<String, FallbackStrategy>,
    /// Latest value of each key drained but not yet applied, tagged with
    /// the index of the batch that carries it.
    in_flight: HashMap<String, (usize, PendingValue)>,
}

struct LayerInner {
    config: StorageConfig,
    retry: RetryPolicy,
    primary: Arc<dyn KvStore>,
    secondary: Option<Arc<dyn KvStore>>,
    memory: MemoryStore,
    state: Mutex<LayerState>,
    flush_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

/// Cloning shares the same queue and state.
#[derive(Clone)]
pub struct StorageLayer {
    inner: Arc<LayerInner>,
}

impl StorageLayer {
    pub fn new(
        primary: Arc<dyn KvStore>,
        secondary: Option<Arc<dyn KvStore>>,
        config: StorageConfig,
        retry: RetryPolicy,
    ) -> Self {
        let state = LayerState {
            queue: OpQueue::new(config.batch_size),
            quota: QuotaCache::new(config.cache_ttl()),
            fallback: HashMap::new(),
            in_flight: HashMap::new(),
        };
        Self {
            inner: Arc::new(LayerInner {
                config,
                retry,
                primary,
                secondary,
                memory: MemoryStore::new("memory"),
                state: Mutex::new(state),
                flush_lock: tokio::sync::Mutex::new(()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.inner.config
    }

    pub fn memory_fallback(&self) -> &MemoryStore {
        &self.inner.memory
    }

    pub fn fallback_location(&self, key: &str) -> Option<FallbackStrategy> {
        self.state().fallback.get(key).copied()
    }

    pub fn pending_len(&self) -> usize {
        self.state().queue.len()
    }

    pub async fn write(&self, entries: BTreeMap<String, Value>) -> Result<WriteAck, StorageError> {
        self.ensure_open()?;
        let warning = self.check_capacity();
        if entries.is_empty() {
            return Ok(WriteAck {
                stored_in: StoredIn::Primary,
                warning,
            });
        }
        match self.enqueue(OpKind::Set, OpPayload::Entries(entries)).await? {
            OpResult::Applied(stored_in) => Ok(WriteAck { stored_in, warning }),
            OpResult::Values(_) => Ok(WriteAck {
                stored_in: StoredIn::Primary,
                warning,
            }),
        }
    }

    pub async fn remove(&self, keys: Vec<String>) -> Result<WriteAck, StorageError> {
        self.ensure_open()?;
        let warning = self.check_capacity();
        if !keys.is_empty() {
            self.enqueue(OpKind::Remove, OpPayload::Keys(keys)).await?;
        }
        Ok(WriteAck {
            stored_in: StoredIn::Primary,
            warning,
        })
    }

    /// Reads straight from the stores, seeing queued writes that have not
    /// flushed yet and values parked in a fallback.
    pub async fn read(&self, keys: &[String]) -> Result<BTreeMap<String, Value>, StorageError> {
        self.ensure_open()?;
        let mut overlay = BTreeMap::new();
        let mut remaining = Vec::new();
        {
            let state = self.state();
            for key in keys {
                let pending = state.queue.pending_value(key).or_else(|| {
                    state
                        .in_flight
                        .get(key)
                        .map(|(_, pending)| pending.clone())
                });
                match pending {
                    Some(pending) => {
                        overlay.insert(key.clone(), pending);
                    }
                    None => remaining.push(key.clone()),
                }
            }
        }

        let mut values = if remaining.is_empty() {
            BTreeMap::new()
        } else {
            let this = self;
            let keys = &remaining;
            self.inner
                .retry
                .run(
                    "storage_read",
                    move |_| async move { this.read_stores(keys) },
                    StorageError::is_transient,
                )
                .await?
        };
        for (key, pending) in overlay {
            if let PendingValue::Set(value) = pending {
                values.insert(key, value);
            }
        }
        Ok(values)
    }

    pub async fn read_batched(
        &self,
        keys: Vec<String>,
    ) -> Result<BTreeMap<String, Value>, StorageError> {
        self.ensure_open()?;
        match self.enqueue(OpKind::Get, OpPayload::Keys(keys)).await? {
            OpResult::Values(values) => Ok(values),
            OpResult::Applied(_) => Ok(BTreeMap::new()),
        }
    }

    pub fn quota(&self, force_refresh: bool) -> QuotaSnapshot {
        self.state()
            .quota
            .measure(self.inner.primary.as_ref(), force_refresh)
    }

    pub fn quota_level(&self, force_refresh: bool) -> QuotaLevel {
        QuotaLevel::classify(self.quota(force_refresh).usage_percent, &self.inner.config)
    }

    pub fn evict(&self) -> EvictionReport {
        let mut state = self.state();
        self.evict_pass(&mut state)
    }

    /// Returns the number of operations applied.
    pub async fn flush(&self) -> usize {
        self.flush_epoch(None).await
    }

    pub async fn close(&self) -> usize {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.flush().await
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    fn state(&self) -> MutexGuard<'_, LayerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_capacity(&self) -> Option<QuotaWarning> {
        let config = &self.inner.config;
        let mut state = self.state();
        let snapshot = state.quota.measure(self.inner.primary.as_ref(), false);
        let level = QuotaLevel::classify(snapshot.usage_percent, config);
        match level {
            QuotaLevel::Normal => None,
            QuotaLevel::Warning => {
                warn!(
                    event = "quota_warning",
                    usage_percent = snapshot.usage_percent,
                    threshold = config.warning_threshold
                );
                Some(QuotaWarning {
                    level,
                    usage_percent: snapshot.usage_percent,
                    evicted: 0,
                })
            }
            QuotaLevel::Cleanup => {
                warn!(
                    event = "quota_cleanup_advised",
                    usage_percent = snapshot.usage_percent,
                    threshold = config.cleanup_threshold
                );
                Some(QuotaWarning {
                    level,
                    usage_percent: snapshot.usage_percent,
                    evicted: 0,
                })
            }
            QuotaLevel::Critical => {
                warn!(
                    event = "quota_critical",
                    usage_percent = snapshot.usage_percent,
                    threshold = config.critical_threshold
                );
                let report = self.evict_pass(&mut state);
                Some(QuotaWarning {
                    level,
                    usage_percent: report.usage_after,
                    evicted: report.removed.len(),
                })
            }
        }
    }

    fn evict_pass(&self, state: &mut LayerState) -> EvictionReport {
        let primary = self.inner.primary.as_ref();
        let before = state.quota.measure(primary, true);
        let entries = match primary.entries() {
            Ok(entries) => entries,
            Err(err) => {
                warn!(event = "eviction_pass", store = primary.name(), error = %err);
                return EvictionReport {
                    usage_before: before.usage_percent,
                    usage_after: before.usage_percent,
                    ..EvictionReport::default()
                };
            }
        };

        let mut busy = state.queue.pending_keys();
        busy.extend(state.in_flight.keys().cloned());
        let candidates = select_candidates(
            &entries,
            &busy,
            &self.inner.config.protected_keys,
            now_ms(),
            self.inner.config.eviction_cap,
        );

        let mut report = EvictionReport {
            usage_before: before.usage_percent,
            ..EvictionReport::default()
        };
        for candidate in candidates {
            match primary.remove(std::slice::from_ref(&candidate.key)) {
                Ok(()) => report.removed.push(candidate),
                Err(err) => {
                    warn!(event = "eviction_remove_failed", key = %candidate.key, error = %err);
                    report.failed.push(candidate.key);
                }
            }
        }
        report.usage_after = state.quota.measure(primary, true).usage_percent;
        info!(
            event = "eviction_pass",
            removed = report.removed.len(),
            failed = report.failed.len(),
            usage_before = report.usage_before,
            usage_after = report.usage_after
        );
        report
    }

    async fn enqueue(&self, kind: OpKind, payload: OpPayload) -> Result<OpResult, StorageError> {
        let (receiver, outcome) = self.state().queue.push(kind, payload);
        match outcome {
            PushOutcome::FlushNow => {
                self.flush().await;
            }
            PushOutcome::ArmIdleTimer(_) | PushOutcome::Queued
                if !self.inner.config.enable_batching =>
            {
                self.flush().await;
            }
            PushOutcome::ArmIdleTimer(epoch) => self.arm_idle_timer(epoch),
            PushOutcome::Queued => {}
        }
        receiver.await.map_err(|_| StorageError::Closed)?
    }

    fn arm_idle_timer(&self, epoch: u64) {
        let weak = Arc::downgrade(&self.inner);
        let idle = self.inner.config.flush_idle();
        tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            if let Some(inner) = weak.upgrade() {
                StorageLayer { inner }.flush_epoch(Some(epoch)).await;
            }
        });
    }

    /// With `expected` set, only flushes if nothing has drained the queue
    /// since that epoch was handed out.
    async fn flush_epoch(&self, expected: Option<u64>) -> usize {
        let _flushing = self.inner.flush_lock.lock().await;
        let (count, batches) = {
            let mut state = self.state();
            if expected.is_some_and(|epoch| epoch != state.queue.epoch()) {
                return 0;
            }
            let ops = state.queue.drain();
            let count = ops.len();
            let batches = coalesce(ops);
            state.in_flight = in_flight_values(&batches);
            (count, batches)
        };
        if count == 0 {
            return 0;
        }

        let calls = batches.len();
        for (index, batch) in batches.into_iter().enumerate() {
            self.apply_batch(batch).await;
            self.state()
                .in_flight
                .retain(|_, (carrier, _)| *carrier != index);
        }

        {
            let mut state = self.state();
            state.in_flight.clear();
            state.quota.invalidate();
        }
        debug!(event = "storage_flush", operations = count, store_calls = calls);
        count
    }

    async fn apply_batch(&self, batch: Batch) {
        match batch.kind {
            OpKind::Get => self.apply_gets(batch).await,
            OpKind::Set => self.apply_sets(batch).await,
            OpKind::Remove => self.apply_removes(batch).await,
        }
    }

    async fn apply_gets(&self, batch: Batch) {
        let merged = self.read_stores(&batch.merged_keys());
        if let Err(err) = &merged {
            warn!(
                event = "storage_flush_failed",
                kind = OpKind::Get.as_str(),
                operations = batch.ops.len(),
                error = %err
            );
        }
        for op in batch.ops {
            let keys = op.payload.keys();
            let result = match &merged {
                Ok(values) => Ok(keys
                    .iter()
                    .filter_map(|key| values.get(key).map(|value| (key.clone(), value.clone())))
                    .collect()),
                Err(_) => {
                    let keys_ref = &keys;
                    self.inner
                        .retry
                        .run(
                            "storage_get",
                            move |_| async move { self.read_stores(keys_ref) },
                            StorageError::is_transient,
                        )
                        .await
                }
            };
            op.complete(result.map(OpResult::Values));
        }
    }

    async fn apply_sets(&self, batch: Batch) {
        let merged = batch.merged_entries();
        let err = match self.inner.primary.set(&merged) {
            Ok(()) => {
                self.drop_fallback_copies(merged.keys());
                for op in batch.ops {
                    op.complete(Ok(OpResult::Applied(StoredIn::Primary)));
                }
                return;
            }
            Err(err) => err,
        };

        warn!(
            event = "storage_flush_failed",
            kind = OpKind::Set.as_str(),
            operations = batch.ops.len(),
            error = %err
        );
        for op in batch.ops {
            let result = match &op.payload {
                OpPayload::Entries(entries) => self.set_with_recovery(entries).await,
                OpPayload::Keys(_) => Ok(StoredIn::Primary),
            };
            op.complete(result.map(OpResult::Applied));
        }
    }

    async fn apply_removes(&self, batch: Batch) {
        let keys = batch.merged_keys();
        let err = match self.inner.primary.remove(&keys) {
            Ok(()) => {
                self.drop_fallback_copies(keys.iter());
                for op in batch.ops {
                    op.complete(Ok(OpResult::Applied(StoredIn::Primary)));
                }
                return;
            }
            Err(err) => err,
        };

        warn!(
            event = "storage_flush_failed",
            kind = OpKind::Remove.as_str(),
            operations = batch.ops.len(),
            error = %err
        );
        for op in batch.ops {
            let keys = op.payload.keys();
            let primary = &self.inner.primary;
            let keys_ref = &keys;
            let result = self
                .inner
                .retry
                .run(
                    "storage_remove",
                    move |_| async move { primary.remove(keys_ref) },
                    StorageError::is_transient,
                )
                .await;
            if result.is_ok() {
                self.drop_fallback_copies(keys.iter());
            }
            op.complete(result.map(|()| OpResult::Applied(StoredIn::Primary)));
        }
    }

    async fn set_with_recovery(
        &self,
        entries: &BTreeMap<String, Value>,
    ) -> Result<StoredIn, StorageError> {
        let primary = &self.inner.primary;
        let attempt = self
            .inner
            .retry
            .run(
                "storage_set",
                move |_| async move { primary.set(entries) },
                StorageError::is_transient,
            )
            .await;

        let err = match attempt {
            Ok(()) => {
                self.drop_fallback_copies(entries.keys());
                return Ok(StoredIn::Primary);
            }
            Err(err) if err.is_quota_exceeded() => {
                let report = self.evict();
                if report.removed.is_empty() {
                    err
                } else {
                    match primary.set(entries) {
                        Ok(()) => {
                            self.drop_fallback_copies(entries.keys());
                            return Ok(StoredIn::Primary);
                        }
                        Err(err) => err,
                    }
                }
            }
            Err(err) => err,
        };
        self.run_fallback_chain(entries, err)
    }

    fn run_fallback_chain(
        &self,
        entries: &BTreeMap<String, Value>,
        primary_err: StorageError,
    ) -> Result<StoredIn, StorageError> {
        for strategy in &self.inner.config.fallback_strategies {
            let (stored_in, result) = match strategy {
                FallbackStrategy::Secondary => match &self.inner.secondary {
                    Some(secondary) => (StoredIn::Secondary, secondary.set(entries)),
                    None => continue,
                },
                FallbackStrategy::Memory => (StoredIn::Memory, self.inner.memory.set(entries)),
                FallbackStrategy::None => break,
            };
            match result {
                Ok(()) => {
                    self.record_fallback(entries.keys(), *strategy);
                    warn!(
                        event = "storage_fallback",
                        strategy = strategy.as_str(),
                        keys = entries.len(),
                        primary_error = %primary_err
                    );
                    return Ok(stored_in);
                }
                Err(err) => {
                    warn!(
                        event = "storage_fallback_failed",
                        strategy = strategy.as_str(),
                        error = %err
                    );
                }
            }
        }
        warn!(
            event = "storage_fallback_failed",
            strategy = "exhausted",
            error = %primary_err
        );
        Err(primary_err)
    }

    fn record_fallback<'a>(&self, keys: impl Iterator<Item = &'a String>, strategy: FallbackStrategy) {
        let mut stale_memory = Vec::new();
        {
            let mut state = self.state();
            for key in keys {
                let previous = state.fallback.insert(key.clone(), strategy);
                if previous == Some(FallbackStrategy::Memory) && strategy != FallbackStrategy::Memory {
                    stale_memory.push(key.clone());
                }
            }
        }
        if !stale_memory.is_empty() {
            let _ = self.inner.memory.remove(&stale_memory);
        }
    }

    fn drop_fallback_copies<'a>(&self, keys: impl Iterator<Item = &'a String>) {
        let mut in_secondary = Vec::new();
        let mut in_memory = Vec::new();
        {
            let mut state = self.state();
            for key in keys {
                match state.fallback.remove(key) {
                    Some(FallbackStrategy::Secondary) => in_secondary.push(key.clone()),
                    Some(FallbackStrategy::Memory) => in_memory.push(key.clone()),
                    _ => {}
                }
            }
        }
        if !in_memory.is_empty() {
            let _ = self.inner.memory.remove(&in_memory);
        }
        if let (false, Some(secondary)) = (in_secondary.is_empty(), &self.inner.secondary) {
            if let Err(err) = secondary.remove(&in_secondary) {
                debug!(event = "fallback_cleanup_failed", store = secondary.name(), error = %err);
            }
        }
    }

    fn read_stores(&self, keys: &[String]) -> Result<BTreeMap<String, Value>, StorageError> {
        let mut from_primary = Vec::new();
        let mut from_secondary = Vec::new();
        let mut from_memory = Vec::new();
        {
            let state = self.state();
            for key in keys {
                match state.fallback.get(key) {
                    Some(FallbackStrategy::Secondary) => from_secondary.push(key.clone()),
                    Some(FallbackStrategy::Memory) => from_memory.push(key.clone()),
                    _ => from_primary.push(key.clone()),
                }
            }
        }

        let mut values = if from_primary.is_empty() {
            BTreeMap::new()
        } else {
            self.inner.primary.get(&from_primary)?
        };
        if let (false, Some(secondary)) = (from_secondary.is_empty(), &self.inner.secondary) {
            values.extend(secondary.get(&from_secondary)?);
        }
        if !from_memory.is_empty() {
            values.extend(self.inner.memory.get(&from_memory)?);
        }
        Ok(values)
    }
}

fn in_flight_values(batches: &[Batch]) -> HashMap<String, (usize, PendingValue)> {
    let mut values = HashMap::new();
    for (index, batch) in batches.iter().enumerate() {
        for op in &batch.ops {
            match (&op.kind, &op.payload) {
                (OpKind::Set, OpPayload::Entries(entries)) => {
                    for (key, value) in entries {
                        values.insert(key.clone(), (index, PendingValue::Set(value.clone())));
                    }
                }
                (OpKind::Remove, OpPayload::Keys(keys)) => {
                    for key in keys {
                        values.insert(key.clone(), (index, PendingValue::Removed));
                    }
                }
                _ => {}
            }
        }
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{EntryMeta, StoreUsage};
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    struct ScriptedStore {
        inner: MemoryStore,
        set_calls: Mutex<Vec<usize>>,
        transient_failures: AtomicU32,
        transient_get_failures: AtomicU32,
        reject_all: bool,
        poison_key: Option<String>,
    }

    impl ScriptedStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new("scripted"),
                set_calls: Mutex::new(Vec::new()),
                transient_failures: AtomicU32::new(0),
                transient_get_failures: AtomicU32::new(0),
                reject_all: false,
                poison_key: None,
            }
        }

        fn set_calls(&self) -> Vec<usize> {
            self.set_calls.lock().expect("calls").clone()
        }
    }

    impl KvStore for ScriptedStore {
        fn name(&self) -> &str {
            "scripted"
        }
        fn get(&self, keys: &[String]) -> Result<BTreeMap<String, Value>, StorageError> {
            let remaining = self.transient_get_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.transient_get_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(StorageError::Unavailable {
                    store: "scripted".to_string(),
                    reason: "busy".to_string(),
                });
            }
            self.inner.get(keys)
        }
        fn set(&self, entries: &BTreeMap<String, Value>) -> Result<(), StorageError> {
            self.set_calls.lock().expect("calls").push(entries.len());
            let quota_error = || StorageError::QuotaExceeded {
                store: "scripted".to_string(),
                requested: 1,
                available: 0,
            };
            if self.reject_all {
                return Err(quota_error());
            }
            if let Some(poison) = &self.poison_key {
                if entries.contains_key(poison) {
                    return Err(quota_error());
                }
            }
            let remaining = self.transient_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.transient_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(StorageError::Unavailable {
                    store: "scripted".to_string(),
                    reason: "busy".to_string(),
                });
            }
            self.inner.set(entries)
        }
        fn remove(&self, keys: &[String]) -> Result<(), StorageError> {
            self.inner.remove(keys)
        }
        fn entries(&self) -> Result<Vec<EntryMeta>, StorageError> {
            self.inner.entries()
        }
        fn usage(&self) -> Result<StoreUsage, StorageError> {
            self.inner.usage()
        }
    }

    fn entry(key: &str, value: Value) -> BTreeMap<String, Value> {
        BTreeMap::from([(key.to_string(), value)])
    }

    fn layer_over(primary: Arc<dyn KvStore>, config: StorageConfig) -> StorageLayer {
        StorageLayer::new(primary, None, config, RetryPolicy::default())
    }

    #[tokio::test(start_paused = true)]
    async fn twelve_concurrent_writes_flush_in_two_store_calls() {
        let store = Arc::new(ScriptedStore::new());
        let layer = layer_over(store.clone(), StorageConfig::default());

        let mut handles = Vec::new();
        for i in 0..12 {
            let layer = layer.clone();
            handles.push(tokio::spawn(async move {
                layer.write(entry(&format!("key{i}"), json!(i))).await
            }));
        }
        for handle in handles {
            let ack = handle.await.expect("join").expect("write");
            assert_eq!(ack.stored_in, StoredIn::Primary);
        }

        assert_eq!(store.set_calls(), vec![10, 2]);
        assert_eq!(store.inner.len(), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_window_flushes_a_partial_batch() {
        let store = Arc::new(ScriptedStore::new());
        let layer = layer_over(store.clone(), StorageConfig::default());

        let writer = {
            let layer = layer.clone();
            tokio::spawn(async move { layer.write(entry("tags", json!(["x"]))).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(layer.pending_len(), 1);
        assert!(store.set_calls().is_empty());

        tokio::time::sleep(Duration::from_millis(100)).await;
        writer.await.expect("join").expect("write");
        assert_eq!(store.set_calls(), vec![1]);
        assert_eq!(layer.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn read_sees_pending_write_then_flushed_value() {
        let store = Arc::new(ScriptedStore::new());
        let layer = layer_over(store.clone(), StorageConfig::default());

        let writer = {
            let layer = layer.clone();
            tokio::spawn(async move { layer.write(entry("recentTags", json!({"count": 1}))).await })
        };
        tokio::task::yield_now().await;

        let pending = layer.read(&["recentTags".to_string()]).await.expect("read");
        assert_eq!(pending["recentTags"], json!({"count": 1}));
        assert!(!store.inner.contains("recentTags"));

        writer.await.expect("join").expect("write");
        let flushed = layer.read(&["recentTags".to_string()]).await.expect("read");
        assert_eq!(flushed["recentTags"], json!({"count": 1}));
        assert!(store.inner.contains("recentTags"));
    }

    #[tokio::test(start_paused = true)]
    async fn read_sees_a_write_while_its_flush_backs_off() {
        let store = Arc::new(ScriptedStore::new());
        store.transient_failures.store(2, Ordering::SeqCst);
        let layer = layer_over(store.clone(), StorageConfig::default());
        let key = ["k".to_string()];

        let writer = {
            let layer = layer.clone();
            tokio::spawn(async move { layer.write(entry("k", json!("v"))).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(layer.read(&key).await.expect("queued")["k"], json!("v"));

        // Coalesced set failed at 100ms; the replay retries at 200ms.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(layer.pending_len(), 0);
        assert!(!store.inner.contains("k"));
        assert_eq!(layer.read(&key).await.expect("in flight")["k"], json!("v"));

        writer.await.expect("join").expect("write");
        assert_eq!(layer.read(&key).await.expect("flushed")["k"], json!("v"));
        assert_eq!(store.set_calls(), vec![1, 1, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_in_flight_value_reads_as_the_latest() {
        let store = Arc::new(ScriptedStore::new());
        store.transient_failures.store(2, Ordering::SeqCst);
        let layer = layer_over(store.clone(), StorageConfig::default());
        let key = ["k".to_string()];

        let writer = {
            let layer = layer.clone();
            tokio::spawn(async move { layer.write(entry("k", json!("v"))).await })
        };
        let remover = {
            let layer = layer.clone();
            tokio::spawn(async move { layer.remove(vec!["k".to_string()]).await })
        };
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(layer.read(&key).await.expect("in flight").is_empty());

        writer.await.expect("join").expect("write");
        remover.await.expect("join").expect("remove");
        assert!(layer.read(&key).await.expect("flushed").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn batched_read_retries_after_the_merged_get_fails() {
        let store = Arc::new(ScriptedStore::new());
        store.inner.set(&entry("a", json!(1))).expect("seed");
        store.transient_get_failures.store(2, Ordering::SeqCst);
        let layer = layer_over(store.clone(), StorageConfig::default());

        let values = layer
            .read_batched(vec!["a".to_string()])
            .await
            .expect("read after retry");
        assert_eq!(values["a"], json!(1));
        assert_eq!(store.transient_get_failures.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unbatched_writes_apply_immediately() {
        let store = Arc::new(ScriptedStore::new());
        let config = StorageConfig {
            enable_batching: false,
            ..StorageConfig::default()
        };
        let layer = layer_over(store.clone(), config);
        layer.write(entry("a", json!(1))).await.expect("write");
        layer.write(entry("b", json!(2))).await.expect("write");
        assert_eq!(store.set_calls(), vec![1, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_coalesced_set_replays_each_operation() {
        let store = Arc::new(ScriptedStore::new());
        store.transient_failures.store(1, Ordering::SeqCst);
        let layer = layer_over(store.clone(), StorageConfig::default());

        let first = {
            let layer = layer.clone();
            tokio::spawn(async move { layer.write(entry("a", json!(1))).await })
        };
        let second = {
            let layer = layer.clone();
            tokio::spawn(async move { layer.write(entry("b", json!(2))).await })
        };
        assert_eq!(first.await.expect("join").expect("a").stored_in, StoredIn::Primary);
        assert_eq!(second.await.expect("join").expect("b").stored_in, StoredIn::Primary);
        assert_eq!(store.set_calls(), vec![2, 1, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn one_bad_key_does_not_block_the_batch() {
        let mut scripted = ScriptedStore::new();
        scripted.poison_key = Some("bad".to_string());
        let store = Arc::new(scripted);
        let config = StorageConfig {
            fallback_strategies: vec![FallbackStrategy::None],
            ..StorageConfig::default()
        };
        let layer = layer_over(store.clone(), config);

        let good = {
            let layer = layer.clone();
            tokio::spawn(async move { layer.write(entry("good", json!(1))).await })
        };
        let bad = {
            let layer = layer.clone();
            tokio::spawn(async move { layer.write(entry("bad", json!(2))).await })
        };
        assert!(good.await.expect("join").is_ok());
        let err = bad.await.expect("join").expect_err("bad key rejected");
        assert!(err.is_quota_exceeded());
        assert!(store.inner.contains("good"));
        assert!(!store.inner.contains("bad"));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_write_falls_through_secondary_to_memory() {
        let mut scripted = ScriptedStore::new();
        scripted.reject_all = true;
        let primary = Arc::new(scripted);
        let secondary: Arc<dyn KvStore> = Arc::new(MemoryStore::with_quota("secondary", 1));
        let config = StorageConfig {
            fallback_strategies: vec![FallbackStrategy::Secondary, FallbackStrategy::Memory],
            ..StorageConfig::default()
        };
        let layer = StorageLayer::new(primary.clone(), Some(secondary), config, RetryPolicy::default());

        let ack = layer.write(entry("tags", json!(["x"]))).await.expect("write");
        assert_eq!(ack.stored_in, StoredIn::Memory);
        assert_eq!(layer.fallback_location("tags"), Some(FallbackStrategy::Memory));

        let found = layer.read(&["tags".to_string()]).await.expect("read");
        assert_eq!(found["tags"], json!(["x"]));
        assert!(!primary.inner.contains("tags"));
        assert!(layer.memory_fallback().contains("tags"));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_chain_returns_the_primary_error() {
        let mut scripted = ScriptedStore::new();
        scripted.reject_all = true;
        let config = StorageConfig {
            fallback_strategies: vec![FallbackStrategy::Secondary, FallbackStrategy::None, FallbackStrategy::Memory],
            ..StorageConfig::default()
        };
        let layer = layer_over(Arc::new(scripted), config);
        let err = layer.write(entry("k", json!(1))).await.expect_err("no fallback left");
        assert!(err.is_quota_exceeded());
        assert!(!layer.memory_fallback().contains("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn primary_success_clears_a_parked_copy() {
        let mut scripted = ScriptedStore::new();
        scripted.poison_key = Some("poison".to_string());
        let store = Arc::new(scripted);
        let layer = layer_over(store.clone(), StorageConfig::default());

        let parked = BTreeMap::from([
            ("poison".to_string(), json!(true)),
            ("k".to_string(), json!("old")),
        ]);
        assert_eq!(layer.write(parked).await.expect("write").stored_in, StoredIn::Memory);
        assert_eq!(layer.fallback_location("k"), Some(FallbackStrategy::Memory));

        layer.write(entry("k", json!("new"))).await.expect("write");
        assert_eq!(layer.fallback_location("k"), None);
        assert!(!layer.memory_fallback().contains("k"));
        let found = layer.read(&["k".to_string()]).await.expect("read");
        assert_eq!(found["k"], json!("new"));
    }

    #[tokio::test(start_paused = true)]
    async fn usage_at_exactly_critical_triggers_eviction() {
        let primary = Arc::new(MemoryStore::with_quota("primary", 100));
        // 9 + 65 + 21 = 95 bytes of a 100 byte quota.
        primary.insert_at("settings", json!(1), 0);
        primary.insert_at("big", json!("x".repeat(60)), 10);
        primary.insert_at("mid", json!("y".repeat(16)), 20);
        let layer = layer_over(primary.clone(), StorageConfig::default());

        let ack = layer.write(entry("n", json!(1))).await.expect("write");
        let warning = ack.warning.expect("critical signal");
        assert_eq!(warning.level, QuotaLevel::Critical);
        assert_eq!(warning.evicted, 2);
        assert!(primary.contains("settings"));
        assert!(!primary.contains("big"));
        assert!(!primary.contains("mid"));
        assert!(primary.contains("n"));
    }

    #[tokio::test(start_paused = true)]
    async fn warning_level_proceeds_without_evicting() {
        let primary = Arc::new(MemoryStore::with_quota("primary", 100));
        // 3 + 82 = 85 bytes.
        primary.insert_at("big", json!("x".repeat(80)), 0);
        let layer = layer_over(primary.clone(), StorageConfig::default());

        let ack = layer.write(entry("n", json!(1))).await.expect("write");
        let warning = ack.warning.expect("warning signal");
        assert_eq!(warning.level, QuotaLevel::Warning);
        assert_eq!(warning.evicted, 0);
        assert!(primary.contains("big"));
        assert_eq!(ack.stored_in, StoredIn::Primary);
    }

    #[tokio::test(start_paused = true)]
    async fn remove_and_batched_read_go_through_the_queue() {
        let store = Arc::new(ScriptedStore::new());
        let layer = layer_over(store.clone(), StorageConfig::default());
        layer
            .write(BTreeMap::from([
                ("a".to_string(), json!(1)),
                ("b".to_string(), json!(2)),
            ]))
            .await
            .expect("write");

        layer.remove(vec!["a".to_string()]).await.expect("remove");
        let values = layer
            .read_batched(vec!["a".to_string(), "b".to_string()])
            .await
            .expect("read");
        assert_eq!(values.len(), 1);
        assert_eq!(values["b"], json!(2));
    }

    #[tokio::test(start_paused = true)]
    async fn closed_layer_rejects_new_work() {
        let layer = layer_over(Arc::new(ScriptedStore::new()), StorageConfig::default());
        layer.close().await;
        let err = layer.write(entry("a", json!(1))).await.expect_err("closed");
        assert!(matches!(err, StorageError::Closed));
    }
}
