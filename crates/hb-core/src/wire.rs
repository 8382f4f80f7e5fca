use crate::ContextId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

pub const CURRENT_PROTOCOL_VERSION: u16 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn generate() -> Self {
        Self(format!("msg_{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The closed vocabulary shared by every context. Adding a message means
/// adding a variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "getTabId")]
    GetTabId,
    #[serde(rename = "getCurrentBookmark")]
    GetCurrentBookmark,
    #[serde(rename = "getTagsForUrl")]
    GetTagsForUrl,
    #[serde(rename = "saveBookmark")]
    SaveBookmark,
    #[serde(rename = "deleteBookmark")]
    DeleteBookmark,
    #[serde(rename = "saveTag")]
    SaveTag,
    #[serde(rename = "deleteTag")]
    DeleteTag,
    #[serde(rename = "getUserRecentTags")]
    GetUserRecentTags,
    #[serde(rename = "addTagToRecent")]
    AddTagToRecent,
    #[serde(rename = "inhibitUrl")]
    InhibitUrl,
    #[serde(rename = "refreshData")]
    RefreshData,
    #[serde(rename = "bookmarkUpdated")]
    BookmarkUpdated,
    #[serde(rename = "tagUpdated")]
    TagUpdated,
    #[serde(rename = "contentScriptReady")]
    ContentScriptReady,
}

impl MessageType {
    pub const ALL: [MessageType; 15] = [
        MessageType::Ping,
        MessageType::GetTabId,
        MessageType::GetCurrentBookmark,
        MessageType::GetTagsForUrl,
        MessageType::SaveBookmark,
        MessageType::DeleteBookmark,
        MessageType::SaveTag,
        MessageType::DeleteTag,
        MessageType::GetUserRecentTags,
        MessageType::AddTagToRecent,
        MessageType::InhibitUrl,
        MessageType::RefreshData,
        MessageType::BookmarkUpdated,
        MessageType::TagUpdated,
        MessageType::ContentScriptReady,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Ping => "ping",
            MessageType::GetTabId => "getTabId",
            MessageType::GetCurrentBookmark => "getCurrentBookmark",
            MessageType::GetTagsForUrl => "getTagsForUrl",
            MessageType::SaveBookmark => "saveBookmark",
            MessageType::DeleteBookmark => "deleteBookmark",
            MessageType::SaveTag => "saveTag",
            MessageType::DeleteTag => "deleteTag",
            MessageType::GetUserRecentTags => "getUserRecentTags",
            MessageType::AddTagToRecent => "addTagToRecent",
            MessageType::InhibitUrl => "inhibitUrl",
            MessageType::RefreshData => "refreshData",
            MessageType::BookmarkUpdated => "bookmarkUpdated",
            MessageType::TagUpdated => "tagUpdated",
            MessageType::ContentScriptReady => "contentScriptReady",
        }
    }

    /// Sync notifications carry a `SyncEvent` payload.
    pub fn is_sync_notification(self) -> bool {
        matches!(self, MessageType::BookmarkUpdated | MessageType::TagUpdated)
    }

    fn required_data_fields(self) -> &'static [&'static str] {
        match self {
            MessageType::GetTagsForUrl
            | MessageType::DeleteBookmark
            | MessageType::SaveBookmark => &["url"],
            MessageType::SaveTag | MessageType::DeleteTag => &["url", "value"],
            MessageType::AddTagToRecent => &["value"],
            MessageType::InhibitUrl => &["url"],
            _ => &[],
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = MalformedMessage;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        MessageType::ALL
            .into_iter()
            .find(|candidate| candidate.as_str() == input)
            .ok_or_else(|| MalformedMessage::UnknownType(input.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedMessage {
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("field '{field}' is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("unknown message type '{0}'")]
    UnknownType(String),
    #[error("{msg_type} data is invalid: {reason}")]
    InvalidData { msg_type: MessageType, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub version: u16,
    pub request_id: CorrelationId,
    pub msg_type: MessageType,
    pub data: Map<String, Value>,
    pub origin: ContextId,
    pub issued_at: DateTime<Utc>,
}

impl Envelope {
    pub fn new(msg_type: MessageType, data: Map<String, Value>, origin: ContextId) -> Self {
        Self {
            version: CURRENT_PROTOCOL_VERSION,
            request_id: CorrelationId::generate(),
            msg_type,
            data,
            origin,
            issued_at: Utc::now(),
        }
    }

    /// A copy with a fresh correlation id, used when a request is re-issued.
    pub fn reissue(&self) -> Self {
        Self {
            request_id: CorrelationId::generate(),
            issued_at: Utc::now(),
            ..self.clone()
        }
    }

    pub fn data_str(&self, field: &str) -> Option<&str> {
        self.data.get(field).and_then(Value::as_str)
    }

    pub fn to_value(&self) -> Value {
        json!({
            "version": self.version,
            "type": self.msg_type.as_str(),
            "data": Value::Object(self.data.clone()),
            "requestId": self.request_id.as_str(),
            "origin": self.origin.to_string(),
            "issuedAt": self.issued_at.to_rfc3339(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    pub request_id: CorrelationId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Reply {
    pub fn ok(request_id: CorrelationId, data: Value) -> Self {
        Self {
            request_id,
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(request_id: CorrelationId, error: impl Into<String>) -> Self {
        Self {
            request_id,
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    pub fn to_value(&self) -> Value {
        let mut value = json!({
            "requestId": self.request_id.as_str(),
            "success": self.success,
        });
        if let Some(data) = &self.data {
            value["data"] = data.clone();
        }
        if let Some(error) = &self.error {
            value["error"] = Value::String(error.clone());
        }
        value
    }
}

pub fn decode_envelope(raw: &Value) -> Result<Envelope, MalformedMessage> {
    let object = raw.as_object().ok_or(MalformedMessage::NotAnObject)?;

    let msg_type = match object.get("type") {
        None | Some(Value::Null) => return Err(MalformedMessage::MissingField("type")),
        Some(Value::String(raw_type)) => raw_type.parse::<MessageType>()?,
        Some(_) => {
            return Err(MalformedMessage::InvalidField {
                field: "type",
                reason: "expected a string".to_string(),
            })
        }
    };

    let data = match object.get("data") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(_) => {
            return Err(MalformedMessage::InvalidField {
                field: "data",
                reason: "expected an object".to_string(),
            })
        }
    };

    let request_id = required_str(object, "requestId")?;
    let origin = required_str(object, "origin")?
        .parse::<ContextId>()
        .map_err(|reason| MalformedMessage::InvalidField {
            field: "origin",
            reason,
        })?;

    let issued_at = match object.get("issuedAt").and_then(Value::as_str) {
        Some(raw_ts) => DateTime::parse_from_rfc3339(raw_ts)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|err| MalformedMessage::InvalidField {
                field: "issuedAt",
                reason: err.to_string(),
            })?,
        None => Utc::now(),
    };

    let version = object
        .get("version")
        .and_then(Value::as_u64)
        .and_then(|v| u16::try_from(v).ok())
        .unwrap_or(CURRENT_PROTOCOL_VERSION);

    validate_data(msg_type, &data)?;

    Ok(Envelope {
        version,
        request_id: CorrelationId(request_id.to_string()),
        msg_type,
        data,
        origin,
        issued_at,
    })
}

pub fn decode_reply(raw: &Value) -> Result<Reply, MalformedMessage> {
    let object = raw.as_object().ok_or(MalformedMessage::NotAnObject)?;
    required_str(object, "requestId")?;
    match object.get("success") {
        Some(Value::Bool(_)) => {}
        Some(_) => {
            return Err(MalformedMessage::InvalidField {
                field: "success",
                reason: "expected a boolean".to_string(),
            })
        }
        None => return Err(MalformedMessage::MissingField("success")),
    }
    serde_json::from_value(raw.clone()).map_err(|err| MalformedMessage::InvalidField {
        field: "reply",
        reason: err.to_string(),
    })
}

fn required_str<'a>(
    object: &'a Map<String, Value>,
    field: &'static str,
) -> Result<&'a str, MalformedMessage> {
    match object.get(field) {
        Some(Value::String(value)) if !value.trim().is_empty() => Ok(value.as_str()),
        Some(Value::String(_)) => Err(MalformedMessage::InvalidField {
            field,
            reason: "must not be empty".to_string(),
        }),
        Some(_) => Err(MalformedMessage::InvalidField {
            field,
            reason: "expected a string".to_string(),
        }),
        None => Err(MalformedMessage::MissingField(field)),
    }
}

fn validate_data(msg_type: MessageType, data: &Map<String, Value>) -> Result<(), MalformedMessage> {
    for field in msg_type.required_data_fields() {
        match data.get(*field) {
            Some(Value::String(value)) if !value.trim().is_empty() => {}
            Some(_) => {
                return Err(MalformedMessage::InvalidData {
                    msg_type,
                    reason: format!("'{field}' must be a non-empty string"),
                })
            }
            None => {
                return Err(MalformedMessage::InvalidData {
                    msg_type,
                    reason: format!("missing '{field}'"),
                })
            }
        }
    }
    if msg_type == MessageType::SaveBookmark {
        if let Some(tags) = data.get("tags") {
            if !(tags.is_string() || tags.is_array()) {
                return Err(MalformedMessage::InvalidData {
                    msg_type,
                    reason: "'tags' must be a string or an array".to_string(),
                });
            }
        }
    }
    Ok(())
}
