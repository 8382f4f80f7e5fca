use crate::broadcast::{BroadcastReport, BroadcastSynchronizer};
use crate::client::MessagingClient;
use crate::view::LocalView;
use crate::{DeliveryFailure, SendError};
use hb_core::sync::{ChangedFields, SyncEvent};
use hb_core::wire::MessageType;
use hb_core::{BookmarkRecord, ContextId};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ActionError {
    #[error(transparent)]
    Send(#[from] SendError),
    #[error("unexpected reply to {msg_type}: {reason}")]
    InvalidReply {
        msg_type: MessageType,
        reason: String,
    },
    #[error("{0}")]
    InvalidInput(String),
}

impl ActionError {
    /// Short text fit for the control surface's status line.
    pub fn user_message(&self) -> String {
        match self {
            ActionError::Send(SendError::Timeout { .. }) => {
                "The extension did not respond in time. Please try again.".to_string()
            }
            ActionError::Send(SendError::Delivery {
                reason: DeliveryFailure::NotInjectable,
                ..
            }) => "Bookmarking is not available on this page.".to_string(),
            ActionError::Send(SendError::Delivery { .. }) => {
                "Could not reach the extension. Reload the page and try again.".to_string()
            }
            ActionError::Send(SendError::Rejected { message, .. }) => {
                format!("Could not save the bookmark: {message}")
            }
            ActionError::Send(SendError::Malformed { .. }) | ActionError::InvalidReply { .. } => {
                "Something went wrong talking to the extension.".to_string()
            }
            ActionError::InvalidInput(message) => message.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub record: BookmarkRecord,
    pub report: BroadcastReport,
}

/// Control-surface side of a mutation: persist through the background,
/// update the local view, then publish the change to everyone else.
pub struct ForegroundActions {
    client: Arc<MessagingClient>,
    broadcaster: Arc<BroadcastSynchronizer>,
    view: Arc<LocalView>,
}

impl ForegroundActions {
    pub fn new(
        client: Arc<MessagingClient>,
        broadcaster: Arc<BroadcastSynchronizer>,
        view: Arc<LocalView>,
    ) -> Self {
        Self {
            client,
            broadcaster,
            view,
        }
    }

    pub fn view(&self) -> &Arc<LocalView> {
        &self.view
    }

    pub async fn add_tag(&self, url: &str, tag: &str) -> Result<ActionOutcome, ActionError> {
        let tag = non_blank(tag, "Enter a tag first.")?;
        let record = self.tag_request(MessageType::SaveTag, url, tag).await?;
        let changed = ChangedFields::tags(record.tags.clone());
        self.finish("add_tag", record, changed).await
    }

    pub async fn remove_tag(&self, url: &str, tag: &str) -> Result<ActionOutcome, ActionError> {
        let tag = non_blank(tag, "Choose a tag to remove.")?;
        let record = self.tag_request(MessageType::DeleteTag, url, tag).await?;
        let changed = ChangedFields::tags(record.tags.clone());
        self.finish("remove_tag", record, changed).await
    }

    pub async fn set_shared(&self, url: &str, shared: bool) -> Result<ActionOutcome, ActionError> {
        let mut record = self.load(url).await?;
        record.shared = shared;
        let saved = self.save(record).await?;
        let changed = ChangedFields {
            shared: Some(saved.shared),
            ..ChangedFields::default()
        };
        self.finish("set_shared", saved, changed).await
    }

    pub async fn set_toread(&self, url: &str, toread: bool) -> Result<ActionOutcome, ActionError> {
        let mut record = self.load(url).await?;
        record.toread = toread;
        let saved = self.save(record).await?;
        let changed = ChangedFields {
            toread: Some(saved.toread),
            ..ChangedFields::default()
        };
        self.finish("set_toread", saved, changed).await
    }

    async fn tag_request(
        &self,
        msg_type: MessageType,
        url: &str,
        tag: &str,
    ) -> Result<BookmarkRecord, ActionError> {
        let url = non_blank(url, "No page is selected.")?;
        let mut data = Map::new();
        data.insert("url".to_string(), json!(url));
        data.insert("value".to_string(), json!(tag));
        let reply = self.client.send(&ContextId::Background, msg_type, data).await?;
        parse_record(msg_type, reply)
    }

    /// The shown record when it is the one asked for, else the background's.
    async fn load(&self, url: &str) -> Result<BookmarkRecord, ActionError> {
        let url = non_blank(url, "No page is selected.")?;
        if let Some(record) = self.view.current_for(url) {
            return Ok(record);
        }
        let mut data = Map::new();
        data.insert("url".to_string(), json!(url));
        let reply = self
            .client
            .send(&ContextId::Background, MessageType::GetCurrentBookmark, data)
            .await?;
        parse_record(MessageType::GetCurrentBookmark, reply)
    }

    async fn save(&self, record: BookmarkRecord) -> Result<BookmarkRecord, ActionError> {
        let Value::Object(data) = serde_json::to_value(&record).map_err(|err| {
            ActionError::InvalidInput(format!("bookmark cannot be encoded: {err}"))
        })?
        else {
            return Err(ActionError::InvalidInput(
                "bookmark cannot be encoded".to_string(),
            ));
        };
        let reply = self
            .client
            .send(&ContextId::Background, MessageType::SaveBookmark, data)
            .await?;
        parse_record(MessageType::SaveBookmark, reply)
    }

    async fn finish(
        &self,
        action: &'static str,
        record: BookmarkRecord,
        changed: ChangedFields,
    ) -> Result<ActionOutcome, ActionError> {
        self.view.show(record.clone());
        let event = SyncEvent::new(record.url.clone(), changed, self.client.origin());
        let report = self.broadcaster.publish(&event).await;
        if report.failed_count() > 0 {
            warn!(
                event = "action_partially_synced",
                action,
                url = %record.url,
                failed = report.failed_count()
            );
        }
        info!(event = "action_complete", action, url = %record.url);
        Ok(ActionOutcome { record, report })
    }
}

fn non_blank<'a>(input: &'a str, message: &str) -> Result<&'a str, ActionError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ActionError::InvalidInput(message.to_string()));
    }
    Ok(trimmed)
}

fn parse_record(msg_type: MessageType, reply: Value) -> Result<BookmarkRecord, ActionError> {
    serde_json::from_value(reply).map_err(|err| ActionError::InvalidReply {
        msg_type,
        reason: err.to_string(),
    })
}
