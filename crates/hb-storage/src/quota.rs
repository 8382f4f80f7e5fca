use crate::store::{KvStore, StoreUsage};
use hb_core::config::StorageConfig;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuotaSnapshot {
    pub used_bytes: u64,
    pub total_bytes: u64,
    pub usage_percent: f64,
    pub captured_at: Instant,
}

impl QuotaSnapshot {
    pub fn from_usage(usage: StoreUsage, captured_at: Instant) -> Self {
        let usage_percent = if usage.total_bytes == 0 {
            0.0
        } else {
            usage.used_bytes as f64 * 100.0 / usage.total_bytes as f64
        };
        Self {
            used_bytes: usage.used_bytes,
            total_bytes: usage.total_bytes,
            usage_percent,
            captured_at,
        }
    }

    pub fn available_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.used_bytes)
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.captured_at)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QuotaLevel {
    Normal,
    Warning,
    /// Past the cleanup threshold: still only a warning, but eviction is near.
    Cleanup,
    Critical,
}

impl QuotaLevel {
    pub fn classify(usage_percent: f64, config: &StorageConfig) -> Self {
        if usage_percent >= config.critical_threshold {
            QuotaLevel::Critical
        } else if usage_percent >= config.cleanup_threshold {
            QuotaLevel::Cleanup
        } else if usage_percent >= config.warning_threshold {
            QuotaLevel::Warning
        } else {
            QuotaLevel::Normal
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QuotaLevel::Normal => "normal",
            QuotaLevel::Warning => "warning",
            QuotaLevel::Cleanup => "cleanup",
            QuotaLevel::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuotaWarning {
    pub level: QuotaLevel,
    pub usage_percent: f64,
    pub evicted: usize,
}

#[derive(Debug)]
pub struct QuotaCache {
    ttl: Duration,
    snapshot: Option<QuotaSnapshot>,
}

impl QuotaCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            snapshot: None,
        }
    }

    pub fn fresh(&self, now: Instant) -> Option<QuotaSnapshot> {
        self.snapshot
            .filter(|snapshot| snapshot.age(now) <= self.ttl)
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        self.fresh(now).is_none()
    }

    pub fn invalidate(&mut self) {
        self.snapshot = None;
    }

    /// Re-measures when stale or forced. A failed measurement is recorded as
    /// zero usage so it never blocks a write.
    pub fn measure(&mut self, store: &dyn KvStore, force_refresh: bool) -> QuotaSnapshot {
        let now = Instant::now();
        if !force_refresh {
            if let Some(snapshot) = self.fresh(now) {
                return snapshot;
            }
        }

        let snapshot = match store.usage() {
            Ok(usage) => QuotaSnapshot::from_usage(usage, now),
            Err(err) => {
                warn!(event = "quota_measure_failed", store = store.name(), error = %err);
                QuotaSnapshot::from_usage(
                    StoreUsage {
                        used_bytes: 0,
                        total_bytes: 0,
                    },
                    now,
                )
            }
        };
        debug!(
            event = "quota_measured",
            store = store.name(),
            used_bytes = snapshot.used_bytes,
            total_bytes = snapshot.total_bytes,
            usage_percent = snapshot.usage_percent
        );
        self.snapshot = Some(snapshot);
        snapshot
    }
}
