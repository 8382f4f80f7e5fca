use crate::wire::MessageType;
use crate::{BookmarkRecord, ContextId};
use serde::{Deserialize, Serialize};

/// The fields a confirmed local write touched. Absent fields are unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangedFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toread: Option<bool>,
}

impl ChangedFields {
    pub fn tags(tags: Vec<String>) -> Self {
        Self {
            tags: Some(tags),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_none() && self.shared.is_none() && self.toread.is_none()
    }

    pub fn only_tags(&self) -> bool {
        self.tags.is_some() && self.shared.is_none() && self.toread.is_none()
    }

    /// Returns whether the record actually changed.
    pub fn apply_to(&self, record: &mut BookmarkRecord) -> bool {
        let before = record.clone();
        if let Some(tags) = &self.tags {
            record.tags = tags.clone();
        }
        if let Some(shared) = self.shared {
            record.shared = shared;
        }
        if let Some(toread) = self.toread {
            record.toread = toread;
        }
        *record != before
    }
}

/// One confirmed state change, built at write time and handed to the
/// broadcast synchronizer. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncEvent {
    pub subject_url: String,
    pub changed_fields: ChangedFields,
    pub source_context: ContextId,
}

impl SyncEvent {
    pub fn new(
        subject_url: impl Into<String>,
        changed_fields: ChangedFields,
        source_context: ContextId,
    ) -> Self {
        Self {
            subject_url: subject_url.into(),
            changed_fields,
            source_context,
        }
    }

    /// Builds the event describing the difference between two snapshots of
    /// the same bookmark.
    pub fn between(before: &BookmarkRecord, after: &BookmarkRecord, source: ContextId) -> Self {
        let mut changed = ChangedFields::default();
        if before.tags != after.tags {
            changed.tags = Some(after.tags.clone());
        }
        if before.shared != after.shared {
            changed.shared = Some(after.shared);
        }
        if before.toread != after.toread {
            changed.toread = Some(after.toread);
        }
        Self::new(after.url.clone(), changed, source)
    }

    pub fn message_type(&self) -> MessageType {
        if self.changed_fields.only_tags() {
            MessageType::TagUpdated
        } else {
            MessageType::BookmarkUpdated
        }
    }
}
