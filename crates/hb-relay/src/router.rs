use crate::broadcast::BroadcastSynchronizer;
use crate::client::MessagingClient;
use crate::collab::{BookmarkBackend, ContextRegistry};
use crate::endpoint::{HandlerError, MessageHandler};
use async_trait::async_trait;
use hb_core::sync::SyncEvent;
use hb_core::wire::{Envelope, MessageType};
use hb_core::{BookmarkRecord, ContextId};
use hb_storage::layout::{add_recent_tag, load_inhibit_list, load_recent_tags, save_inhibit_list};
use hb_storage::{StorageLayer, WriteAck};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

/// Message handler of the background context. Owns persistence: bookmark
/// mutations go to the backend, local state to the storage layer.
pub struct BackgroundRouter {
    backend: Arc<dyn BookmarkBackend>,
    storage: StorageLayer,
    client: Arc<MessagingClient>,
    broadcaster: Arc<BroadcastSynchronizer>,
    registry: Option<Arc<dyn ContextRegistry>>,
}

impl BackgroundRouter {
    pub fn new(
        backend: Arc<dyn BookmarkBackend>,
        storage: StorageLayer,
        client: Arc<MessagingClient>,
        broadcaster: Arc<BroadcastSynchronizer>,
    ) -> Self {
        Self {
            backend,
            storage,
            client,
            broadcaster,
            registry: None,
        }
    }

    /// Resolves the page url of a document that asks without naming one.
    pub fn with_registry(mut self, registry: Arc<dyn ContextRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn storage(&self) -> &StorageLayer {
        &self.storage
    }

    async fn current_bookmark(&self, envelope: &Envelope) -> Result<Value, HandlerError> {
        let url = match envelope.data_str("url") {
            Some(url) => url.to_string(),
            None => self.origin_url(&envelope.origin).await?,
        };
        let record = self.fetch_or_new(&url).await?;
        let inhibited = load_inhibit_list(&self.storage)
            .await
            .map_err(storage_error)?
            .is_inhibited(&url);
        let mut value = to_value(&record)?;
        value["inhibited"] = Value::Bool(inhibited);
        Ok(value)
    }

    async fn origin_url(&self, origin: &ContextId) -> Result<String, HandlerError> {
        let Some(registry) = &self.registry else {
            return Err(HandlerError::new("url is required"));
        };
        if !origin.is_document() {
            return Err(HandlerError::new("url is required"));
        }
        registry
            .url_of(origin)
            .await
            .ok_or_else(|| HandlerError::new(format!("{origin} has no known url")))
    }

    async fn fetch_or_new(&self, url: &str) -> Result<BookmarkRecord, HandlerError> {
        Ok(self
            .backend
            .fetch_bookmark(url)
            .await
            .map_err(|err| HandlerError::new(err.0))?
            .unwrap_or_else(|| BookmarkRecord::new(url)))
    }

    /// Saves `after`, then publishes the difference when a document agent
    /// asked for it. Other initiators publish their own changes.
    async fn commit(
        &self,
        origin: ContextId,
        before: &BookmarkRecord,
        after: BookmarkRecord,
    ) -> Result<Value, HandlerError> {
        self.backend
            .save_bookmark(&after)
            .await
            .map_err(|err| HandlerError::new(err.0))?;

        let event = SyncEvent::between(before, &after, origin);
        let mut value = to_value(&after)?;
        if origin.is_document() && !event.changed_fields.is_empty() {
            let report = self.broadcaster.publish(&event).await;
            value["broadcast"] = report.to_value();
        }
        Ok(value)
    }

    async fn save_bookmark(&self, envelope: &Envelope) -> Result<Value, HandlerError> {
        let after: BookmarkRecord =
            serde_json::from_value(Value::Object(envelope.data.clone()))
                .map_err(|err| HandlerError::new(format!("invalid bookmark: {err}")))?;
        let before = self.fetch_or_new(&after.url).await?;
        self.commit(envelope.origin, &before, after).await
    }

    async fn save_tag(&self, envelope: &Envelope) -> Result<Value, HandlerError> {
        let (url, value) = url_and_value(envelope)?;
        let before = self.fetch_or_new(url).await?;
        let mut after = before.clone();
        for tag in value.split_whitespace() {
            after.add_tag(tag);
        }
        let mut reply = self.commit(envelope.origin, &before, after).await?;

        let (_, ack) = add_recent_tag(&self.storage, value, now_ms())
            .await
            .map_err(storage_error)?;
        if let Some(ack) = ack {
            reply["storage"] = ack_value(&ack);
        }
        Ok(reply)
    }

    async fn delete_tag(&self, envelope: &Envelope) -> Result<Value, HandlerError> {
        let (url, value) = url_and_value(envelope)?;
        let before = self.fetch_or_new(url).await?;
        let mut after = before.clone();
        for tag in value.split_whitespace() {
            after.remove_tag(tag);
        }
        self.commit(envelope.origin, &before, after).await
    }

    async fn inhibit_url(&self, envelope: &Envelope) -> Result<Value, HandlerError> {
        let url = required(envelope, "url")?;
        let mut list = load_inhibit_list(&self.storage)
            .await
            .map_err(storage_error)?;
        let added = list.add(url);
        let mut reply = json!({"inhibited": true, "added": added, "urls": list.urls()});
        if added {
            let ack = save_inhibit_list(&self.storage, &list)
                .await
                .map_err(storage_error)?;
            reply["storage"] = ack_value(&ack);
        }
        Ok(reply)
    }
}

#[async_trait]
impl MessageHandler for BackgroundRouter {
    async fn handle(&self, envelope: Envelope) -> Result<Value, HandlerError> {
        debug!(
            event = "router_request",
            msg_type = envelope.msg_type.as_str(),
            origin = %envelope.origin
        );
        match envelope.msg_type {
            MessageType::Ping => Ok(json!({"pong": true, "context": ContextId::Background.to_string()})),
            MessageType::GetTabId => envelope
                .origin
                .document_id()
                .map(|id| json!({"tabId": id}))
                .ok_or_else(|| HandlerError::new(format!("{} is not a document", envelope.origin))),
            MessageType::GetCurrentBookmark => self.current_bookmark(&envelope).await,
            MessageType::GetTagsForUrl => {
                let url = required(&envelope, "url")?;
                let tags = self
                    .backend
                    .fetch_bookmark(url)
                    .await
                    .map_err(|err| HandlerError::new(err.0))?
                    .map(|record| record.tags)
                    .unwrap_or_default();
                Ok(json!({"tags": tags}))
            }
            MessageType::SaveBookmark => self.save_bookmark(&envelope).await,
            MessageType::DeleteBookmark => {
                let url = required(&envelope, "url")?;
                self.backend
                    .delete_bookmark(url)
                    .await
                    .map_err(|err| HandlerError::new(err.0))?;
                info!(event = "bookmark_deleted", url = %url, origin = %envelope.origin);
                Ok(json!({"deleted": true, "url": url}))
            }
            MessageType::SaveTag => self.save_tag(&envelope).await,
            MessageType::DeleteTag => self.delete_tag(&envelope).await,
            MessageType::GetUserRecentTags => {
                let recent = load_recent_tags(&self.storage)
                    .await
                    .map_err(storage_error)?;
                to_value(&recent)
            }
            MessageType::AddTagToRecent => {
                let value = required(&envelope, "value")?;
                let (recent, _) = add_recent_tag(&self.storage, value, now_ms())
                    .await
                    .map_err(storage_error)?;
                to_value(&recent)
            }
            MessageType::InhibitUrl => self.inhibit_url(&envelope).await,
            MessageType::ContentScriptReady => {
                if !envelope.origin.is_document() {
                    return Err(HandlerError::new("only document agents signal readiness"));
                }
                let state = self.client.mark_ready(&envelope.origin);
                Ok(json!({"state": state.as_str()}))
            }
            MessageType::BookmarkUpdated | MessageType::TagUpdated | MessageType::RefreshData => {
                Ok(json!({"acknowledged": true}))
            }
        }
    }
}

fn required<'a>(envelope: &'a Envelope, field: &str) -> Result<&'a str, HandlerError> {
    envelope
        .data_str(field)
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| HandlerError::new(format!("{field} is required")))
}

fn url_and_value(envelope: &Envelope) -> Result<(&str, &str), HandlerError> {
    Ok((required(envelope, "url")?, required(envelope, "value")?))
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, HandlerError> {
    serde_json::to_value(value).map_err(|err| HandlerError::new(err.to_string()))
}

fn storage_error(err: hb_storage::StorageError) -> HandlerError {
    HandlerError::new(format!("storage: {err}"))
}

fn ack_value(ack: &WriteAck) -> Value {
    let mut value = json!({"storedIn": ack.stored_in.as_str()});
    if let Some(warning) = &ack.warning {
        value["quota"] = json!({
            "level": warning.level.as_str(),
            "usagePercent": warning.usage_percent,
            "evicted": warning.evicted,
        });
    }
    value
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
