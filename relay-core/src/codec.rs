//! Turn and settings codec.
//!
//! A stored turn record looks like:
//!
//! ```json
//! {"role": "user", "parts": [
//!     {"type": "text", "text": "what is this?"},
//!     {"type": "image", "reference": "image/jpeg", "caption": "my garden"}
//! ]}
//! ```
//!
//! A settings record holds `gemini_api_key`, `selected_model` and
//! `message_count`, each optional.

use crate::types::{ContentPart, ConversationSettings, Role, SettingsUpdate, Turn};
use relay_common::{Error, Result};
use serde::Deserialize;
use serde_json::{Map, Value};

pub const FIELD_API_KEY: &str = "gemini_api_key";
pub const FIELD_MODEL: &str = "selected_model";
pub const FIELD_MESSAGE_COUNT: &str = "message_count";

#[derive(Debug, Deserialize)]
struct TurnRecord {
    role: String,
    parts: Vec<PartRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum PartRecord {
    Text {
        text: String,
    },
    Image {
        #[serde(alias = "mime_type")]
        reference: String,
        #[serde(default)]
        caption: Option<String>,
    },
}

impl From<PartRecord> for ContentPart {
    fn from(part: PartRecord) -> Self {
        match part {
            PartRecord::Text { text } => Self::Text(text),
            PartRecord::Image { reference, caption } => Self::ImagePlaceholder { reference, caption },
        }
    }
}

/// Encode a turn into its stored record.
pub fn encode_turn(turn: &Turn) -> Value {
    let parts: Vec<Value> = turn
        .parts
        .iter()
        .map(|part| match part {
            ContentPart::Text(text) => serde_json::json!({ "type": "text", "text": text }),
            ContentPart::ImagePlaceholder { reference, caption } => {
                let mut obj = Map::new();
                obj.insert("type".into(), Value::from("image"));
                obj.insert("reference".into(), Value::from(reference.clone()));
                if let Some(caption) = caption {
                    obj.insert("caption".into(), Value::from(caption.clone()));
                }
                Value::Object(obj)
            }
        })
        .collect();
    serde_json::json!({ "role": turn.role.as_str(), "parts": parts })
}

/// Decode a stored record into a turn.
///
/// Fails with [`Error::MalformedRecord`] on an unknown role, an unknown part
/// type, missing fields or an empty part list.
pub fn decode_turn(record: &Value) -> Result<Turn> {
    let raw: TurnRecord = serde_json::from_value(record.clone())
        .map_err(|e| Error::MalformedRecord(format!("turn record: {e}")))?;

    let role = Role::parse(&raw.role)
        .ok_or_else(|| Error::MalformedRecord(format!("unknown role '{}'", raw.role)))?;
    if raw.parts.is_empty() {
        return Err(Error::MalformedRecord("turn has no parts".into()));
    }

    Ok(Turn {
        role,
        parts: raw.parts.into_iter().map(ContentPart::from).collect(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct SettingsRecord {
    #[serde(default)]
    gemini_api_key: Option<String>,
    #[serde(default)]
    selected_model: Option<String>,
    #[serde(default)]
    message_count: Option<i64>,
}

/// Decode a settings record, filling absent fields with defaults.
pub fn decode_settings(record: &Value, default_model: &str) -> Result<ConversationSettings> {
    let raw: SettingsRecord = serde_json::from_value(record.clone())
        .map_err(|e| Error::MalformedRecord(format!("settings record: {e}")))?;

    let count = raw.message_count.unwrap_or(0);
    let count = u64::try_from(count)
        .map_err(|_| Error::MalformedRecord(format!("negative message count {count}")))?;

    Ok(ConversationSettings {
        credential_override: raw.gemini_api_key.filter(|k| !k.is_empty()),
        selected_model: raw
            .selected_model
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| default_model.to_string()),
        default_credential_usage_count: count,
    })
}

/// Encode complete settings as a stored record.
pub fn encode_settings(settings: &ConversationSettings) -> Value {
    let mut obj = Map::new();
    if let Some(key) = &settings.credential_override {
        obj.insert(FIELD_API_KEY.into(), Value::from(key.clone()));
    }
    obj.insert(FIELD_MODEL.into(), Value::from(settings.selected_model.clone()));
    obj.insert(
        FIELD_MESSAGE_COUNT.into(),
        Value::from(settings.default_credential_usage_count),
    );
    Value::Object(obj)
}

/// Build the merge patch for a partial settings update. A `null` value
/// removes the field.
pub fn settings_patch(update: &SettingsUpdate) -> Map<String, Value> {
    let mut patch = Map::new();
    if let Some(credential) = &update.credential_override {
        let value = credential.clone().map(Value::from).unwrap_or(Value::Null);
        patch.insert(FIELD_API_KEY.into(), value);
    }
    if let Some(model) = &update.selected_model {
        patch.insert(FIELD_MODEL.into(), Value::from(model.clone()));
    }
    if let Some(count) = update.usage_count {
        patch.insert(FIELD_MESSAGE_COUNT.into(), Value::from(count));
    }
    patch
}
