//! The conversation facade used by request handlers.

use crate::history::HistoryStore;
use crate::policy::{Authorization, UsagePolicy};
use crate::settings::SettingsStore;
use crate::types::{ContentPart, ConversationId, ConversationSettings, SettingsUpdate, Turn};
use relay_common::{Config, Error, Result, ResultExt};
use relay_store::RowStore;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Everything a handler needs to call the model for one request.
#[derive(Debug, Clone)]
pub struct PreparedContext {
    /// `None` when the request is denied.
    pub credential: Option<String>,
    pub model: String,
    /// Prior turns, oldest first. The new user turn is not included.
    pub history: Vec<Turn>,
    pub authorization: Authorization,
    pub settings: ConversationSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialChange {
    Cleared,
    /// The conversation had no override to clear.
    AlreadyDefault,
    /// No shared key is configured, so the override is kept.
    NoDefaultAvailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelChange {
    Changed,
    AlreadySelected,
}

/// Request-scoped view over the history and settings stores.
///
/// Holds no conversation state of its own; it is cheap to clone and share.
#[derive(Clone)]
pub struct ConversationSession {
    history: HistoryStore,
    settings: SettingsStore,
    policy: UsagePolicy,
    /// Zero keeps every turn.
    max_history_turns: usize,
}

impl ConversationSession {
    pub fn new(
        store: Arc<dyn RowStore>,
        policy: UsagePolicy,
        default_model: impl Into<String>,
        max_history_turns: usize,
    ) -> Self {
        Self {
            history: HistoryStore::new(store.clone()),
            settings: SettingsStore::new(store, default_model),
            policy,
            max_history_turns,
        }
    }

    pub fn from_config(store: Arc<dyn RowStore>, config: &Config) -> Self {
        let policy = UsagePolicy::new(
            config.gemini.default_api_key.clone(),
            config.usage.default_key_message_limit,
        );
        Self::new(
            store,
            policy,
            config.gemini.default_model.clone(),
            config.history.max_turns,
        )
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn policy(&self) -> &UsagePolicy {
        &self.policy
    }

    /// Gather credential, model and prior turns for a new user message.
    ///
    /// Nothing is written: the user turn is stored by [`commit_exchange`]
    /// once a reply exists.
    ///
    /// [`commit_exchange`]: Self::commit_exchange
    pub async fn prepare_context(
        &self,
        id: ConversationId,
        new_user_parts: &[ContentPart],
    ) -> Result<PreparedContext> {
        if new_user_parts.is_empty() {
            return Err(Error::InvalidInput("message has no content".into()));
        }

        let settings = self
            .settings
            .get(id)
            .await
            .context("load conversation settings")?;
        let authorization = self.policy.decide(&settings);
        let credential = self
            .policy
            .credential_for(&settings, authorization)
            .map(String::from);

        let turns = if self.max_history_turns == 0 {
            self.history.load_all(id).await
        } else {
            self.history.load_recent(id, self.max_history_turns).await
        }
        .context("load conversation history")?;

        debug!(
            conversation = %id,
            model = %settings.selected_model,
            turns = turns.len(),
            ?authorization,
            "Prepared context"
        );

        Ok(PreparedContext {
            credential,
            model: settings.selected_model.clone(),
            history: turns.into_iter().map(|t| t.turn).collect(),
            authorization,
            settings,
        })
    }

    /// Store a user turn and the model's reply, then trim.
    ///
    /// The user turn is written first, so a failure in between leaves a
    /// trailing unanswered user turn and never a reply without its question.
    pub async fn commit_exchange(
        &self,
        id: ConversationId,
        user_parts: Vec<ContentPart>,
        model_parts: Vec<ContentPart>,
    ) -> Result<()> {
        if user_parts.is_empty() || model_parts.is_empty() {
            return Err(Error::InvalidInput("an exchange needs both a user and a model turn".into()));
        }

        self.history.append(id, &Turn::user(user_parts)).await?;
        self.history.append(id, &Turn::model(model_parts)).await?;

        if self.max_history_turns > 0 {
            self.history
                .trim(id, self.max_history_turns)
                .await
                .context("trim conversation history")?;
        }
        Ok(())
    }

    /// Count one served request against the default-key quota, if the
    /// request was served on the default key. Returns the new count.
    pub async fn record_default_usage(
        &self,
        id: ConversationId,
        authorization: &Authorization,
    ) -> Result<Option<u64>> {
        if !authorization.uses_default() {
            return Ok(None);
        }
        let count = self.settings.increment_usage(id).await?;
        debug!(conversation = %id, count, "Recorded default key usage");
        Ok(Some(count))
    }

    /// Clear history and restore default settings.
    ///
    /// Both halves are attempted even if the first fails; the first error is
    /// returned.
    pub async fn reset_conversation(&self, id: ConversationId) -> Result<()> {
        let cleared = self.history.clear(id).await.context("clear history");
        let reset = self.settings.reset(id).await.context("reset settings");

        match (cleared, reset) {
            (Ok(_), Ok(())) => {
                info!(conversation = %id, "Conversation reset");
                Ok(())
            }
            (Err(e), other) => {
                if let Err(second) = other {
                    warn!(conversation = %id, error = %second, "Settings reset also failed");
                }
                Err(e)
            }
            (Ok(_), Err(e)) => Err(e),
        }
    }

    pub async fn current_settings(&self, id: ConversationId) -> Result<ConversationSettings> {
        self.settings.get(id).await
    }

    /// Store the conversation's own key. Starts a fresh history and quota.
    pub async fn set_credential(
        &self,
        id: ConversationId,
        key: &str,
    ) -> Result<ConversationSettings> {
        let key = key.trim();
        if key.is_empty() {
            return Err(Error::InvalidInput("API key cannot be empty".into()));
        }

        let update = SettingsUpdate::new().credential(key).usage_count(0);
        let settings = self.settings.upsert(id, &update).await?;
        self.history.clear(id).await?;
        info!(conversation = %id, "Custom API key set");
        Ok(settings)
    }

    /// Go back to the shared key.
    pub async fn clear_credential(&self, id: ConversationId) -> Result<CredentialChange> {
        let settings = self.settings.get(id).await?;
        if !settings.has_override() {
            return Ok(CredentialChange::AlreadyDefault);
        }
        if !self.policy.has_default_credential() {
            return Ok(CredentialChange::NoDefaultAvailable);
        }

        let update = SettingsUpdate::new().clear_credential().usage_count(0);
        self.settings.upsert(id, &update).await?;
        self.history.clear(id).await?;
        info!(conversation = %id, "Custom API key cleared");
        Ok(CredentialChange::Cleared)
    }

    /// Switch models. A change starts a fresh history and quota.
    pub async fn select_model(&self, id: ConversationId, model: &str) -> Result<ModelChange> {
        let model = model.trim();
        if model.is_empty() {
            return Err(Error::InvalidInput("model name cannot be empty".into()));
        }

        let settings = self.settings.get(id).await?;
        if settings.selected_model == model {
            return Ok(ModelChange::AlreadySelected);
        }

        let update = SettingsUpdate::new().model(model).usage_count(0);
        self.settings.upsert(id, &update).await?;
        self.history.clear(id).await?;
        info!(conversation = %id, model, "Model selected");
        Ok(ModelChange::Changed)
    }
}
