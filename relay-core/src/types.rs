//! Conversation data types.

use relay_common::util::mask_secret;
use std::fmt;

/// Stable identity of one chat conversation (the Telegram chat id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationId(i64);

impl ConversationId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn get(self) -> i64 {
        self.0
    }

    /// Partition key under which this conversation's rows are stored.
    pub fn partition_key(self) -> String {
        self.0.to_string()
    }
}

impl From<i64> for ConversationId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Model,
}

impl Role {
    /// Convert to string representation for storage and the Gemini API.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Model => "model",
        }
    }

    /// Parse from string representation. Unknown roles yield `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "model" => Some(Self::Model),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One piece of a turn's content.
///
/// Images are kept only as a reference and caption; their bytes are never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentPart {
    Text(String),
    ImagePlaceholder {
        reference: String,
        caption: Option<String>,
    },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn image(reference: impl Into<String>, caption: Option<String>) -> Self {
        Self::ImagePlaceholder {
            reference: reference.into(),
            caption,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::ImagePlaceholder { .. } => None,
        }
    }

    /// Text form used when replaying history to a model that cannot see the image.
    pub fn replay_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::ImagePlaceholder {
                reference,
                caption: Some(caption),
            } => format!("[Image: {reference}] (Caption: {caption})"),
            Self::ImagePlaceholder {
                reference,
                caption: None,
            } => format!("[Image: {reference}]"),
        }
    }
}

/// One message unit in a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub parts: Vec<ContentPart>,
}

impl Turn {
    pub fn new(role: Role, parts: Vec<ContentPart>) -> Self {
        Self { role, parts }
    }

    pub fn user(parts: Vec<ContentPart>) -> Self {
        Self::new(Role::User, parts)
    }

    pub fn model(parts: Vec<ContentPart>) -> Self {
        Self::new(Role::Model, parts)
    }

    /// All text parts joined together.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(ContentPart::as_text)
            .collect::<Vec<_>>()
            .join("")
    }
}

/// A stored turn together with its position in the conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedTurn {
    pub index: i64,
    pub turn: Turn,
}

/// Per-conversation configuration.
#[derive(Clone, PartialEq, Eq)]
pub struct ConversationSettings {
    /// The conversation's own Gemini API key, if it supplied one.
    pub credential_override: Option<String>,
    pub selected_model: String,
    /// Requests served on the shared default key.
    pub default_credential_usage_count: u64,
}

impl ConversationSettings {
    /// Settings of a conversation that never changed anything.
    pub fn defaults(default_model: impl Into<String>) -> Self {
        Self {
            credential_override: None,
            selected_model: default_model.into(),
            default_credential_usage_count: 0,
        }
    }

    pub fn has_override(&self) -> bool {
        self.credential_override.is_some()
    }

    /// Masked form of the override for display.
    pub fn masked_override(&self) -> Option<String> {
        self.credential_override.as_deref().map(mask_secret)
    }
}

impl fmt::Debug for ConversationSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversationSettings")
            .field("credential_override", &self.masked_override())
            .field("selected_model", &self.selected_model)
            .field(
                "default_credential_usage_count",
                &self.default_credential_usage_count,
            )
            .finish()
    }
}

/// A partial change to [`ConversationSettings`]. Unset fields are left alone.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SettingsUpdate {
    /// `Some(None)` clears the override.
    pub credential_override: Option<Option<String>>,
    pub selected_model: Option<String>,
    pub usage_count: Option<u64>,
}

impl SettingsUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn credential(mut self, key: impl Into<String>) -> Self {
        self.credential_override = Some(Some(key.into()));
        self
    }

    pub fn clear_credential(mut self) -> Self {
        self.credential_override = Some(None);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.selected_model = Some(model.into());
        self
    }

    pub fn usage_count(mut self, count: u64) -> Self {
        self.usage_count = Some(count);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.credential_override.is_none()
            && self.selected_model.is_none()
            && self.usage_count.is_none()
    }
}

impl fmt::Debug for SettingsUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let credential = self
            .credential_override
            .as_ref()
            .map(|c| c.as_deref().map(mask_secret));
        f.debug_struct("SettingsUpdate")
            .field("credential_override", &credential)
            .field("selected_model", &self.selected_model)
            .field("usage_count", &self.usage_count)
            .finish()
    }
}
