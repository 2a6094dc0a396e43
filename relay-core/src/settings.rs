//! Per-conversation settings.

use crate::codec::{decode_settings, encode_settings, settings_patch, FIELD_MESSAGE_COUNT};
use crate::types::{ConversationId, ConversationSettings, SettingsUpdate};
use relay_common::{Error, Result};
use relay_store::{RowKey, RowStore};
use std::sync::Arc;
use tracing::{debug, warn};

pub const SETTINGS_TABLE: &str = "user_settings";

/// Settings store with read-with-default semantics: a conversation that has
/// never changed anything reads as defaults and has no stored row.
#[derive(Clone)]
pub struct SettingsStore {
    store: Arc<dyn RowStore>,
    default_model: String,
}

impl SettingsStore {
    pub fn new(store: Arc<dyn RowStore>, default_model: impl Into<String>) -> Self {
        Self {
            store,
            default_model: default_model.into(),
        }
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    pub fn defaults(&self) -> ConversationSettings {
        ConversationSettings::defaults(self.default_model.clone())
    }

    fn key(id: ConversationId) -> RowKey {
        RowKey::single(id.partition_key())
    }

    /// Current settings. Never writes. An unreadable row reads as defaults.
    pub async fn get(&self, id: ConversationId) -> Result<ConversationSettings> {
        let Some(record) = self.store.get_row(SETTINGS_TABLE, &Self::key(id)).await? else {
            return Ok(self.defaults());
        };
        match decode_settings(&record, &self.default_model) {
            Ok(settings) => Ok(settings),
            Err(e) => {
                warn!(conversation = %id, error = %e, "Unreadable settings row, using defaults");
                Ok(self.defaults())
            }
        }
    }

    /// Apply a partial update and return the resulting settings.
    pub async fn upsert(
        &self,
        id: ConversationId,
        update: &SettingsUpdate,
    ) -> Result<ConversationSettings> {
        if update.is_empty() {
            return self.get(id).await;
        }
        let settings = match self.merge(id, update).await {
            Err(e) if is_malformed(&e) => {
                self.replace_unreadable(id, &e).await?;
                self.merge(id, update).await?
            }
            other => other?,
        };
        debug!(conversation = %id, ?update, "Updated settings");
        Ok(settings)
    }

    async fn merge(
        &self,
        id: ConversationId,
        update: &SettingsUpdate,
    ) -> Result<ConversationSettings> {
        let merged = self
            .store
            .merge_row(SETTINGS_TABLE, &Self::key(id), settings_patch(update))
            .await?;
        decode_settings(&merged, &self.default_model)
    }

    /// Atomically add one to the default-credential usage counter and return
    /// the new value.
    pub async fn increment_usage(&self, id: ConversationId) -> Result<u64> {
        match self.increment_once(id).await {
            Err(e) if is_malformed(&e) => {
                self.replace_unreadable(id, &e).await?;
                self.increment_once(id).await
            }
            other => other,
        }
    }

    async fn increment_once(&self, id: ConversationId) -> Result<u64> {
        let count = self
            .store
            .increment_field(SETTINGS_TABLE, &Self::key(id), FIELD_MESSAGE_COUNT, 1)
            .await?;
        u64::try_from(count)
            .map_err(|_| Error::MalformedRecord(format!("negative message count {count}")))
    }

    /// Put the conversation back to default settings.
    pub async fn reset(&self, id: ConversationId) -> Result<()> {
        self.store
            .put_row(SETTINGS_TABLE, &Self::key(id), encode_settings(&self.defaults()))
            .await?;
        debug!(conversation = %id, "Reset settings");
        Ok(())
    }

    /// Overwrite a row that `get` already reads as defaults, so writes can
    /// proceed from the same starting point.
    async fn replace_unreadable(&self, id: ConversationId, cause: &Error) -> Result<()> {
        warn!(conversation = %id, error = %cause, "Replacing unreadable settings row");
        self.reset(id).await
    }
}

fn is_malformed(err: &Error) -> bool {
    matches!(err.root(), Error::MalformedRecord(_))
}
