use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse failed: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("config encode failed: {0}")]
    Encode(#[from] toml::ser::Error),
    #[error("invalid config: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HoverboardConfig {
    pub retry: RetryPolicy,
    pub messaging: MessagingConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Budget for requests to the background controller.
    pub request_timeout_ms: u64,
    /// Budget for requests to a document agent; reset after every injection step.
    pub tab_timeout_ms: u64,
    pub injection_settle_ms: u64,
    pub fallback_settle_ms: u64,
    pub inbox_capacity: usize,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            tab_timeout_ms: 2_000,
            injection_settle_ms: 1_000,
            fallback_settle_ms: 500,
            inbox_capacity: 64,
        }
    }
}

impl MessagingConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn tab_timeout(&self) -> Duration {
        Duration::from_millis(self.tab_timeout_ms)
    }

    pub fn injection_settle(&self) -> Duration {
        Duration::from_millis(self.injection_settle_ms)
    }

    pub fn fallback_settle(&self) -> Duration {
        Duration::from_millis(self.fallback_settle_ms)
    }
}

/// Where a rejected primary write goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategy {
    Secondary,
    Memory,
    /// Stop here and surface the primary error.
    None,
}

impl FallbackStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            FallbackStrategy::Secondary => "secondary",
            FallbackStrategy::Memory => "memory",
            FallbackStrategy::None => "none",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub warning_threshold: f64,
    pub cleanup_threshold: f64,
    pub critical_threshold: f64,
    pub cache_ttl_ms: u64,
    pub batch_size: usize,
    pub flush_idle_ms: u64,
    pub eviction_cap: usize,
    pub enable_batching: bool,
    pub fallback_strategies: Vec<FallbackStrategy>,
    pub protected_keys: Vec<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            warning_threshold: 80.0,
            cleanup_threshold: 90.0,
            critical_threshold: 95.0,
            cache_ttl_ms: 30_000,
            batch_size: 10,
            flush_idle_ms: 100,
            eviction_cap: 5,
            enable_batching: true,
            fallback_strategies: vec![
                FallbackStrategy::Secondary,
                FallbackStrategy::Memory,
                FallbackStrategy::None,
            ],
            protected_keys: vec!["settings".to_string(), "authToken".to_string()],
        }
    }
}

impl StorageConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn flush_idle(&self) -> Duration {
        Duration::from_millis(self.flush_idle_ms)
    }
}

impl HoverboardConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: HoverboardConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let retry = &self.retry;
        if retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts must be > 0"));
        }
        if retry.base_delay_ms == 0 {
            return Err(invalid("retry.base_delay_ms must be > 0"));
        }
        if retry.max_delay_ms < retry.base_delay_ms {
            return Err(invalid("retry.max_delay_ms must be >= retry.base_delay_ms"));
        }
        if !(retry.backoff_multiplier >= 1.0) {
            return Err(invalid("retry.backoff_multiplier must be >= 1"));
        }

        let messaging = &self.messaging;
        if messaging.request_timeout_ms == 0 || messaging.tab_timeout_ms == 0 {
            return Err(invalid("messaging timeouts must be > 0"));
        }
        if messaging.inbox_capacity == 0 {
            return Err(invalid("messaging.inbox_capacity must be > 0"));
        }

        let storage = &self.storage;
        for (name, value) in [
            ("warning_threshold", storage.warning_threshold),
            ("cleanup_threshold", storage.cleanup_threshold),
            ("critical_threshold", storage.critical_threshold),
        ] {
            if !(value > 0.0 && value <= 100.0) {
                return Err(invalid(&format!("storage.{name} must be in (0, 100]")));
            }
        }
        if storage.warning_threshold > storage.cleanup_threshold
            || storage.cleanup_threshold > storage.critical_threshold
        {
            return Err(invalid(
                "storage thresholds must satisfy warning <= cleanup <= critical",
            ));
        }
        if storage.batch_size == 0 {
            return Err(invalid("storage.batch_size must be > 0"));
        }
        if storage.eviction_cap == 0 {
            return Err(invalid("storage.eviction_cap must be > 0"));
        }
        if storage.cache_ttl_ms == 0 {
            return Err(invalid("storage.cache_ttl_ms must be > 0"));
        }
        if storage.fallback_strategies.is_empty() {
            return Err(invalid("storage.fallback_strategies must not be empty"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Validation(message.to_string())
}
