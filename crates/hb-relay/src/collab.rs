//! Contracts for the collaborators this layer consumes but does not own.

use async_trait::async_trait;
use hb_core::{BookmarkRecord, ContextId};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct CollaboratorError(pub String);

#[async_trait]
pub trait BookmarkBackend: Send + Sync {
    async fn fetch_bookmark(&self, url: &str) -> Result<Option<BookmarkRecord>, CollaboratorError>;

    async fn save_bookmark(&self, record: &BookmarkRecord) -> Result<(), CollaboratorError>;

    async fn delete_bookmark(&self, url: &str) -> Result<(), CollaboratorError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenContext {
    pub context: ContextId,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InjectionMode {
    /// The full agent bundle.
    Primary,
    /// A reduced bundle tried once after the primary fails.
    Fallback,
}

impl InjectionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            InjectionMode::Primary => "primary",
            InjectionMode::Fallback => "fallback",
        }
    }
}

/// The host's view of open documents.
#[async_trait]
pub trait ContextRegistry: Send + Sync {
    async fn list_open_contexts(&self) -> Vec<OpenContext>;

    async fn inject(&self, context: &ContextId, mode: InjectionMode) -> Result<(), CollaboratorError>;

    async fn url_of(&self, context: &ContextId) -> Option<String> {
        self.list_open_contexts()
            .await
            .into_iter()
            .find(|open| open.context == *context)
            .map(|open| open.url)
    }
}

/// Redraws a surface after its local view changed.
pub trait SurfaceRenderer: Send + Sync {
    fn redraw(&self, record: &BookmarkRecord);
}

/// Backend kept entirely in memory, for local runs and simulation.
#[derive(Default)]
pub struct InMemoryBackend {
    records: RwLock<HashMap<String, BookmarkRecord>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, record: BookmarkRecord) {
        self.records.write().await.insert(record.url.clone(), record);
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl BookmarkBackend for InMemoryBackend {
    async fn fetch_bookmark(&self, url: &str) -> Result<Option<BookmarkRecord>, CollaboratorError> {
        Ok(self.records.read().await.get(url).cloned())
    }

    async fn save_bookmark(&self, record: &BookmarkRecord) -> Result<(), CollaboratorError> {
        if record.url.trim().is_empty() {
            return Err(CollaboratorError("bookmark url is empty".to_string()));
        }
        self.records
            .write()
            .await
            .insert(record.url.clone(), record.clone());
        Ok(())
    }

    async fn delete_bookmark(&self, url: &str) -> Result<(), CollaboratorError> {
        self.records.write().await.remove(url);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_backend_round_trips_records() {
        let backend = InMemoryBackend::new();
        let mut record = BookmarkRecord::new("https://example.com");
        record.add_tag("rust");
        backend.save_bookmark(&record).await.expect("save");

        let fetched = backend
            .fetch_bookmark("https://example.com")
            .await
            .expect("fetch")
            .expect("present");
        assert_eq!(fetched.tags, vec!["rust"]);

        backend.delete_bookmark("https://example.com").await.expect("delete");
        assert_eq!(backend.len().await, 0);
        assert!(backend
            .save_bookmark(&BookmarkRecord::new(" "))
            .await
            .is_err());
    }
}
