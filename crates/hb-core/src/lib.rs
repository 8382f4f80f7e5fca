use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

pub mod config;
pub mod retry;
pub mod sync;
pub mod wire;

/// An isolated execution context. Contexts never share memory; everything
/// crossing between them goes through the wire types in [`wire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ContextId {
    Background,
    ControlSurface,
    Document(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextKind {
    Background,
    ControlSurface,
    DocumentAgent,
}

impl ContextId {
    pub fn kind(&self) -> ContextKind {
        match self {
            ContextId::Background => ContextKind::Background,
            ContextId::ControlSurface => ContextKind::ControlSurface,
            ContextId::Document(_) => ContextKind::DocumentAgent,
        }
    }

    pub fn is_document(&self) -> bool {
        matches!(self, ContextId::Document(_))
    }

    pub fn document_id(&self) -> Option<u64> {
        match self {
            ContextId::Document(id) => Some(*id),
            _ => None,
        }
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextId::Background => f.write_str("background"),
            ContextId::ControlSurface => f.write_str("control_surface"),
            ContextId::Document(id) => write!(f, "document:{id}"),
        }
    }
}

impl FromStr for ContextId {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "background" => Ok(ContextId::Background),
            "control_surface" | "control-surface" | "popup" => Ok(ContextId::ControlSurface),
            other => {
                let Some(raw_id) = other.strip_prefix("document:") else {
                    return Err(format!("Unknown context: {input}"));
                };
                raw_id
                    .parse::<u64>()
                    .map(ContextId::Document)
                    .map_err(|err| format!("invalid document id '{raw_id}': {err}"))
            }
        }
    }
}

impl Serialize for ContextId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ContextId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A bookmark as the backend and every surface see it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BookmarkRecord {
    pub url: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub extended: String,
    #[serde(default, deserialize_with = "deserialize_tags")]
    pub tags: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub shared: bool,
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub toread: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
}

impl BookmarkRecord {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            shared: true,
            ..Self::default()
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|existing| existing == tag)
    }

    /// Returns `false` when the tag was blank or already present.
    pub fn add_tag(&mut self, tag: &str) -> bool {
        let tag = tag.trim();
        if tag.is_empty() || self.has_tag(tag) {
            return false;
        }
        self.tags.push(tag.to_string());
        true
    }

    pub fn remove_tag(&mut self, tag: &str) -> bool {
        let before = self.tags.len();
        self.tags.retain(|existing| existing != tag.trim());
        self.tags.len() != before
    }
}

/// Tags arrive either as a space separated string or as an array.
fn deserialize_tags<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val: serde_json::Value = serde_json::Value::deserialize(deserializer)?;
    let mut tags = Vec::new();
    match val {
        serde_json::Value::Null => {}
        serde_json::Value::String(s) => {
            tags.extend(s.split_whitespace().map(str::to_string));
        }
        serde_json::Value::Array(items) => {
            for item in items {
                if let Some(s) = item.as_str() {
                    let s = s.trim();
                    if !s.is_empty() {
                        tags.push(s.to_string());
                    }
                }
            }
        }
        _ => return Err(serde::de::Error::custom("expected string or array for tags")),
    }
    let mut seen = std::collections::HashSet::new();
    tags.retain(|tag| seen.insert(tag.clone()));
    Ok(tags)
}

/// The backend reports flags as booleans, 0/1 or "yes"/"no".
fn deserialize_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let val: serde_json::Value = serde_json::Value::deserialize(deserializer)?;
    match val {
        serde_json::Value::Null => Ok(false),
        serde_json::Value::Bool(b) => Ok(b),
        serde_json::Value::Number(n) => Ok(n.as_i64().unwrap_or(0) != 0),
        serde_json::Value::String(s) => match s.trim().to_lowercase().as_str() {
            "yes" | "true" | "1" => Ok(true),
            "no" | "false" | "0" | "" => Ok(false),
            other => Err(serde::de::Error::custom(format!("invalid flag: {other}"))),
        },
        _ => Err(serde::de::Error::custom("expected bool, number or string")),
    }
}
