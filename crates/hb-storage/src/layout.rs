//! Logical keys in the durable store and the records kept under them.

use crate::layer::{StorageLayer, WriteAck};
use crate::StorageError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const SETTINGS_KEY: &str = "settings";
pub const AUTH_TOKEN_KEY: &str = "authToken";
pub const INHIBIT_URLS_KEY: &str = "inhibitUrls";
pub const RECENT_TAGS_KEY: &str = "recentTags";

pub const RECENT_TAGS_MAX: usize = 32;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecentTags {
    pub tags: Vec<String>,
    /// Milliseconds since the epoch of the last update.
    pub timestamp: i64,
    pub count: usize,
}

impl RecentTags {
    /// Prepends each space-separated part of `input`, most recent first.
    /// Returns false when nothing usable was given.
    pub fn add(&mut self, input: &str, max: usize, now_ms: i64) -> bool {
        let parts = input
            .split_whitespace()
            .map(str::to_string)
            .collect::<Vec<_>>();
        if parts.is_empty() {
            return false;
        }

        let mut merged = Vec::with_capacity(parts.len() + self.tags.len());
        for tag in parts.into_iter().chain(self.tags.drain(..)) {
            if !merged.contains(&tag) {
                merged.push(tag);
            }
        }
        merged.truncate(max);
        self.tags = merged;
        self.timestamp = now_ms;
        self.count = self.tags.len();
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InhibitList {
    urls: Vec<String>,
}

impl InhibitList {
    pub fn parse(raw: &str) -> Self {
        Self {
            urls: raw
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    pub fn add(&mut self, url: &str) -> bool {
        let normalized = strip_scheme(url.trim());
        if normalized.is_empty() || self.urls.iter().any(|u| u == normalized) {
            return false;
        }
        self.urls.push(normalized.to_string());
        true
    }

    pub fn remove(&mut self, url: &str) -> bool {
        let normalized = strip_scheme(url.trim());
        let before = self.urls.len();
        self.urls.retain(|u| u != normalized);
        self.urls.len() != before
    }

    /// Matches in both directions so `example.com` blocks
    /// `https://example.com/page` and vice versa.
    pub fn is_inhibited(&self, url: &str) -> bool {
        let normalized = strip_scheme(url.trim());
        if normalized.is_empty() {
            return false;
        }
        self.urls
            .iter()
            .any(|u| normalized.contains(u.as_str()) || u.contains(normalized))
    }

    pub fn to_stored(&self) -> String {
        self.urls.join("\n")
    }
}

fn strip_scheme(url: &str) -> &str {
    url.strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url)
}

pub async fn load_recent_tags(layer: &StorageLayer) -> Result<RecentTags, StorageError> {
    let values = layer.read(&[RECENT_TAGS_KEY.to_string()]).await?;
    Ok(values
        .get(RECENT_TAGS_KEY)
        .and_then(|value| serde_json::from_value(value.clone()).ok())
        .unwrap_or_default())
}

pub async fn add_recent_tag(
    layer: &StorageLayer,
    input: &str,
    now_ms: i64,
) -> Result<(RecentTags, Option<WriteAck>), StorageError> {
    let mut recent = load_recent_tags(layer).await?;
    if !recent.add(input, RECENT_TAGS_MAX, now_ms) {
        return Ok((recent, None));
    }
    let value = serde_json::to_value(&recent)
        .map_err(|err| StorageError::Serialization(err.to_string()))?;
    let ack = layer
        .write(BTreeMap::from([(RECENT_TAGS_KEY.to_string(), value)]))
        .await?;
    Ok((recent, Some(ack)))
}

pub async fn load_inhibit_list(layer: &StorageLayer) -> Result<InhibitList, StorageError> {
    let values = layer.read(&[INHIBIT_URLS_KEY.to_string()]).await?;
    Ok(values
        .get(INHIBIT_URLS_KEY)
        .and_then(Value::as_str)
        .map(InhibitList::parse)
        .unwrap_or_default())
}

pub async fn save_inhibit_list(
    layer: &StorageLayer,
    list: &InhibitList,
) -> Result<WriteAck, StorageError> {
    layer
        .write(BTreeMap::from([(
            INHIBIT_URLS_KEY.to_string(),
            Value::String(list.to_stored()),
        )]))
        .await
}
