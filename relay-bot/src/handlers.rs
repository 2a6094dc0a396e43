//! Update handling: commands, the API key dialogue and the chat flow.
//!
//! A [`BotHandler`] owns no conversation state. Everything durable lives
//! behind the [`ConversationSession`]; the only in-process state is the set
//! of chats that were asked for an API key and have not answered yet.

use crate::channels::{
    CallbackQuery, InboundContent, InboundEvent, InboundMessage, InlineButton, ParseMode,
    Transport,
};
use crate::format::{self, OutgoingItem};
use crate::providers::{
    GenerationError, GenerationErrorKind, GenerationRequest, Generator, InputPart,
};
use dashmap::DashSet;
use relay_common::util::truncate_with_ellipsis;
use relay_common::{Error, Result};
use relay_core::{
    Authorization, ContentPart, ConversationId, ConversationSession, ConversationSettings,
    CredentialChange, DenialReason, ModelChange,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn, Instrument};

/// Callback data prefix of the model selection keyboard.
pub const SET_MODEL_PREFIX: &str = "set_model:";

/// Telegram rejects callback data longer than this.
const MAX_CALLBACK_DATA_BYTES: usize = 64;
const MAX_BUTTON_LABEL_CHARS: usize = 30;

const LOADING_CAPTION: &str = "Working my magic... please wait a moment. ✨";
const RATE_LIMIT_DOCS: &str = "https://ai.google.dev/gemini-api/docs/rate-limits";

// ============================================================================
// Reply Texts
// ============================================================================

const WELCOME_TEXT: &str = "Hello! I'm a bot powered by Google Gemini...\n\n\
You can chat with me by sending text or photos (with captions).\n\
I remember our conversation history (up to model limits).\n\n\
Available commands:\n\
/start or /help - Show this message.\n\
/reset - Clear the chat history and restore default settings.\n\
/set_api_key - Set your personal Gemini API key.\n\
/clear_api_key - Use the bot's default API key (if available).\n\
/list_models - List models available with your current API key.\n\
/select_model - Choose a model using buttons.\n\
/current_settings - Show your active API key status and model.\n\n\
Note: If you set a new API key or model, your chat history will be reset.";

const SET_KEY_INSTRUCTIONS: &str = "Okay, please send me your Google Gemini API key now.\n\
You can get your API key from Google AI Studio:\n\
1. Go to [https://aistudio.google.com/app/apikey](https://aistudio.google.com/app/apikey)\n\
2. Create a new API key (or use an existing one).\n\
3. Copy the key and paste it into a reply message here.\n\
_(Your API key is used only for your conversations. Setting a new key resets chat history and message count.)_\n\
Send `/cancel` to abort.";

const NO_KEY_TEXT: &str = "AI service not available. The bot's default API key is missing, and you haven't set your own.\n\n\
Please use `/set_api_key` to provide your key.";
const DB_UNAVAILABLE_TEXT: &str = "Database service is not available. Please try again later.";
const SETTINGS_FETCH_FAILED_TEXT: &str = "Error fetching your settings from the database.";
const UNKNOWN_COMMAND_TEXT: &str = "Unknown command. Use /help to see available commands.";
const UNSUPPORTED_CONTENT_TEXT: &str = "Sorry, I can currently only process text and photos.";
const IMAGE_ERROR_TEXT: &str = "Sorry, I encountered an error processing the image.";
const UNEXPECTED_AI_ERROR_TEXT: &str = "An unexpected internal error occurred during AI interaction.";
const CLIENT_ERROR_SUFFIX: &str = "\n\nUse a different model by using /select_model command.";
const CONTEXT_LIMIT_HINT: &str = "\n\nYour conversation history might be too long for the model. \
Try using `/reset` to start a new chat.";
const MODELS_FETCH_FAILED_TEXT: &str = "Could not fetch available models with your current API key. \
Please check your key using /current_settings or try setting it again with /set_api_key.";
const NO_MODELS_TEXT: &str = "No generative models found with your current API key.";

fn limit_reached_text(limit: u64) -> String {
    format!(
        "You have reached the {limit}-message limit for users without a custom API key.\n\n\
Please set your own API key using `/set_api_key` to continue chatting without limits."
    )
}

fn one_remaining_text() -> String {
    "You have 1 message remaining with the default API key.\n\n\
Please use `/set_api_key` to provide your own Gemini API key to send more messages after this one."
        .to_string()
}

fn final_message_text(limit: u64) -> String {
    format!(
        "This is your {limit}th and final message using the default API key.\n\n\
To send more messages, please use `/set_api_key` to provide your own Gemini API key."
    )
}

/// User-facing text for a denied request.
pub fn denial_text(reason: DenialReason) -> String {
    match reason {
        DenialReason::NoCredential => NO_KEY_TEXT.to_string(),
        DenialReason::QuotaExhausted { limit, .. } => limit_reached_text(limit),
    }
}

/// User-facing text for a failed generation.
pub fn generation_error_text(err: &GenerationError) -> String {
    let code = err
        .status_code
        .map_or_else(|| "N/A".to_string(), |c| c.to_string());

    match &err.kind {
        GenerationErrorKind::ModelNotFound => format!(
            "The selected model `{}` is not available or supported for conversations with your API key.\n\n\
Please use `/select_model` to choose a different model.",
            err.model
        ),
        GenerationErrorKind::QuotaExceeded { help } => {
            let (description, url) = help
                .as_ref()
                .map(|h| (h.description.as_str(), h.url.as_str()))
                .unwrap_or(("Learn more about Gemini API quotas", RATE_LIMIT_DOCS));
            format!(
                "Your request failed due to a quota limit being reached for the selected model (`{}`).\n\n\
[{description}]({url}){CLIENT_ERROR_SUFFIX}",
                err.model
            )
        }
        GenerationErrorKind::Blocked { reasons } => {
            let mut text = String::from("Your input was blocked by safety filters.");
            if !reasons.is_empty() {
                text.push_str(&format!(" Reason(s): {}", reasons.join(", ")));
            }
            if err.mentions_context_limit() {
                text.push_str(CONTEXT_LIMIT_HINT);
            }
            text.push_str(CLIENT_ERROR_SUFFIX);
            text
        }
        GenerationErrorKind::BadRequest => {
            let mut text = format!("Bad request to the AI model. Message: {}", err.message);
            if err.mentions_context_limit() {
                text.push_str(CONTEXT_LIMIT_HINT);
            }
            text.push_str(CLIENT_ERROR_SUFFIX);
            text
        }
        GenerationErrorKind::PermissionDenied => format!(
            "An AI communication error occurred (Code: {code}). \
Check your key using /current_settings or set a new one with /set_api_key.{CLIENT_ERROR_SUFFIX}"
        ),
        GenerationErrorKind::Server => format!(
            "The AI service encountered a server error (Code: {code}). Please try again later."
        ),
        GenerationErrorKind::Transport => UNEXPECTED_AI_ERROR_TEXT.to_string(),
    }
}

/// Text for a store failure, by what was being attempted.
fn store_error_text(err: &Error, fallback: &str) -> String {
    match err.root() {
        Error::StoreUnavailable(_) => DB_UNAVAILABLE_TEXT.to_string(),
        Error::Conflict(_) => {
            "Another message from this chat was being saved at the same time. Please send your message again."
                .to_string()
        }
        _ => fallback.to_string(),
    }
}

/// MIME type for a downloaded photo, by file extension.
pub fn mime_for_path(file_path: &str) -> &'static str {
    let ext = file_path
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => "image/jpeg",
    }
}

/// Split `/command@bot args` into the bare command and its argument text.
fn parse_command(text: &str) -> Option<(&str, &str)> {
    let rest = text.strip_prefix('/')?;
    let (head, args) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
    let command = head.split('@').next().unwrap_or(head);
    Some((command, args.trim()))
}

// ============================================================================
// Handler
// ============================================================================

/// What the user asked the model about.
enum UserInput {
    Text(String),
    Photo {
        file_id: String,
        caption: Option<String>,
    },
}

pub struct BotHandler {
    session: ConversationSession,
    generator: Arc<dyn Generator>,
    transport: Arc<dyn Transport>,
    /// Chats whose next text message is an API key.
    awaiting_key: DashSet<i64>,
    loading_animation: Option<String>,
}

impl BotHandler {
    pub fn new(
        session: ConversationSession,
        generator: Arc<dyn Generator>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            session,
            generator,
            transport,
            awaiting_key: DashSet::new(),
            loading_animation: None,
        }
    }

    /// Show this animation while a reply is generated.
    pub fn with_loading_animation(mut self, file_id: Option<String>) -> Self {
        self.loading_animation = file_id.filter(|id| !id.is_empty());
        self
    }

    pub fn session(&self) -> &ConversationSession {
        &self.session
    }

    pub fn is_awaiting_key(&self, chat_id: i64) -> bool {
        self.awaiting_key.contains(&chat_id)
    }

    /// Handle one update inside its own trace span.
    pub async fn handle(&self, event: InboundEvent) -> Result<()> {
        let trace_id = relay_common::logging::generate_trace_id();
        let span = relay_common::channel_span!(self.transport.name(), trace_id, event.chat_id());
        async {
            let result = match event {
                InboundEvent::Message(message) => self.handle_message(message).await,
                InboundEvent::Callback(callback) => self.handle_callback(callback).await,
            };
            if let Err(e) = &result {
                error!(error = %e, "Update handling failed");
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn handle_message(&self, message: InboundMessage) -> Result<()> {
        let chat_id = message.chat_id;
        match message.content {
            InboundContent::Text(text) => {
                if let Some((command, args)) = parse_command(&text) {
                    return self.handle_command(chat_id, command, args).await;
                }
                if self.awaiting_key.remove(&chat_id).is_some() {
                    return self.receive_api_key(chat_id, &text).await;
                }
                self.handle_chat(chat_id, UserInput::Text(text)).await
            }
            InboundContent::Photo { file_id, caption } => {
                self.handle_chat(chat_id, UserInput::Photo { file_id, caption })
                    .await
            }
            InboundContent::Unsupported { kind } => {
                warn!(kind = %kind, "Unsupported content");
                self.reply(chat_id, UNSUPPORTED_CONTENT_TEXT).await
            }
        }
    }

    async fn handle_command(&self, chat_id: i64, command: &str, _args: &str) -> Result<()> {
        info!(command, "Command received");
        match command {
            "start" | "help" => self.reply(chat_id, WELCOME_TEXT).await,
            "reset" => self.cmd_reset(chat_id).await,
            "set_api_key" => {
                self.awaiting_key.insert(chat_id);
                self.reply(chat_id, SET_KEY_INSTRUCTIONS).await
            }
            "cancel" => {
                let text = if self.awaiting_key.remove(&chat_id).is_some() {
                    "Operation cancelled (Set API key)."
                } else {
                    "No active operation to cancel."
                };
                self.reply(chat_id, text).await
            }
            "clear_api_key" => self.cmd_clear_api_key(chat_id).await,
            "list_models" => self.cmd_list_models(chat_id).await,
            "select_model" => self.cmd_select_model(chat_id).await,
            "current_settings" => self.cmd_current_settings(chat_id).await,
            _ => self.reply(chat_id, UNKNOWN_COMMAND_TEXT).await,
        }
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    async fn cmd_reset(&self, chat_id: i64) -> Result<()> {
        match self.session.reset_conversation(ConversationId::new(chat_id)).await {
            Ok(()) => {
                self.reply(
                    chat_id,
                    "Chat history cleared. Your API key, model and message count are back to the defaults.",
                )
                .await
            }
            Err(e) => {
                error!(error = %e, "Reset failed");
                let text = store_error_text(&e, "Failed to reset your conversation in the database.");
                self.reply(chat_id, &text).await
            }
        }
    }

    async fn receive_api_key(&self, chat_id: i64, text: &str) -> Result<()> {
        let key = text.trim();
        if key.is_empty() {
            return self.reply(chat_id, "API key cannot be empty.").await;
        }

        if let Err(e) = self.generator.validate_credential(key).await {
            warn!(error = %e, "API key validation failed");
            let reply = match e.kind {
                GenerationErrorKind::PermissionDenied => {
                    "Failed to validate API key: Permission Denied. Check if the key is correct and enabled for the Gemini API."
                        .to_string()
                }
                _ => format!(
                    "Failed to set API key: Could not connect to the AI service with this key. Error: {}\n\n\
Try `/set_api_key` again or `/cancel`.",
                    e.message
                ),
            };
            return self.reply(chat_id, &reply).await;
        }

        match self.session.set_credential(ConversationId::new(chat_id), key).await {
            Ok(_) => {
                self.reply(
                    chat_id,
                    "Your Gemini API key has been set successfully! Your chat history has been reset.",
                )
                .await
            }
            Err(e) => {
                error!(error = %e, "Saving API key failed");
                let text = store_error_text(&e, "Failed to save your API key to the database.");
                self.reply(chat_id, &text).await
            }
        }
    }

    async fn cmd_clear_api_key(&self, chat_id: i64) -> Result<()> {
        let text = match self.session.clear_credential(ConversationId::new(chat_id)).await {
            Ok(CredentialChange::Cleared) => {
                "Cleared your custom API key. Using the bot's default key now. Your chat history has been reset."
                    .to_string()
            }
            Ok(CredentialChange::AlreadyDefault) => {
                "You are already using the bot's default API key.".to_string()
            }
            Ok(CredentialChange::NoDefaultAvailable) => {
                "The bot does not have a default API key configured. You must provide your own via `/set_api_key`."
                    .to_string()
            }
            Err(e) => {
                error!(error = %e, "Clearing API key failed");
                store_error_text(&e, "Failed to clear your custom API key in the database.")
            }
        };
        self.reply(chat_id, &text).await
    }

    /// The key to list models with: the conversation's own, else the shared one.
    async fn listing_credential(&self, chat_id: i64) -> Result<Option<String>> {
        let settings = match self.session.current_settings(ConversationId::new(chat_id)).await {
            Ok(settings) => settings,
            Err(e) => {
                error!(error = %e, "Loading settings failed");
                let text = store_error_text(&e, SETTINGS_FETCH_FAILED_TEXT);
                self.reply(chat_id, &text).await?;
                return Ok(None);
            }
        };

        let policy = self.session.policy();
        let credential = settings
            .credential_override
            .clone()
            .or_else(|| {
                policy
                    .credential_for(&settings, Authorization::UseDefaultCredential)
                    .map(String::from)
            });
        if credential.is_none() {
            self.reply(chat_id, NO_KEY_TEXT).await?;
        }
        Ok(credential)
    }

    async fn cmd_list_models(&self, chat_id: i64) -> Result<()> {
        let Some(credential) = self.listing_credential(chat_id).await? else {
            return Ok(());
        };
        self.reply(chat_id, "Fetching available models (this might take a moment)...")
            .await?;

        let models = match self.generator.list_models(&credential).await {
            Ok(models) => models,
            Err(e) => {
                warn!(error = %e, "Listing models failed");
                return self.reply(chat_id, MODELS_FETCH_FAILED_TEXT).await;
            }
        };
        if models.is_empty() {
            return self.reply(chat_id, NO_MODELS_TEXT).await;
        }

        let mut text = String::from("Available Models (may vary based on API key/region):\n\n");
        for model in &models {
            text.push_str(&format!("💬 **Model name**: `{}`\n", model.short_name()));
            if let Some(description) = model.description.as_deref().filter(|d| !d.is_empty()) {
                text.push_str(&format!("📝 **Description**: {description}\n"));
            }
            if let Some(limit) = model.input_token_limit {
                text.push_str(&format!("⬇️ **Input Tokens**: {limit}\n"));
            }
            if let Some(limit) = model.output_token_limit {
                text.push_str(&format!("⬆️ **Output Tokens**: {limit}\n"));
            }
            text.push('\n');
        }
        text.push_str("Use /select_model to choose one.");

        self.send_rendered(chat_id, &text).await;
        info!(count = models.len(), "Listed models");
        Ok(())
    }

    async fn cmd_select_model(&self, chat_id: i64) -> Result<()> {
        let Some(credential) = self.listing_credential(chat_id).await? else {
            return Ok(());
        };

        let models = match self.generator.list_models(&credential).await {
            Ok(models) => models,
            Err(e) => {
                warn!(error = %e, "Listing models failed");
                return self.reply(chat_id, MODELS_FETCH_FAILED_TEXT).await;
            }
        };
        if models.is_empty() {
            return self.reply(chat_id, NO_MODELS_TEXT).await;
        }

        let buttons: Vec<Vec<InlineButton>> = models
            .iter()
            .filter_map(|model| {
                let data = format!("{SET_MODEL_PREFIX}{}", model.name);
                if data.len() > MAX_CALLBACK_DATA_BYTES {
                    warn!(model = %model.name, "Callback data too long, skipping button");
                    return None;
                }
                let label = model_button_label(model.short_name());
                Some(vec![InlineButton::new(label, data)])
            })
            .collect();

        if buttons.is_empty() {
            return self
                .reply(chat_id, "No models available to display as buttons.")
                .await;
        }

        self.transport
            .send_with_inline_keyboard(chat_id, "Please select a model:", buttons)
            .await?;
        Ok(())
    }

    async fn cmd_current_settings(&self, chat_id: i64) -> Result<()> {
        match self.session.current_settings(ConversationId::new(chat_id)).await {
            Ok(settings) => {
                let text = self.settings_text(&settings);
                self.reply(chat_id, &text).await
            }
            Err(e) => {
                error!(error = %e, "Loading settings failed");
                let text = store_error_text(&e, SETTINGS_FETCH_FAILED_TEXT);
                self.reply(chat_id, &text).await
            }
        }
    }

    fn settings_text(&self, settings: &ConversationSettings) -> String {
        let policy = self.session.policy();
        let key_status = match settings.masked_override() {
            Some(masked) => format!("Using your custom API key: `{masked}`"),
            None if policy.has_default_credential() => "Using bot's default API key".to_string(),
            None => "No API key available. Bot's default is missing, and you haven't set your own.\n\
Please use `/set_api_key` to provide your key."
                .to_string(),
        };

        let mut text = format!(
            "**Your Current Settings**:\nAPI Key: {key_status}\nModel: `{}`\n",
            settings.selected_model
        );
        if !settings.has_override() && policy.ceiling() > 0 {
            let used = settings.default_credential_usage_count;
            text.push_str(&format!(
                "Messages Used (Default Key): {used} / {}\n",
                policy.ceiling()
            ));
            if used >= policy.ceiling() {
                text.push_str("  (Limit reached. Use `/set_api_key` for unlimited messages.)\n");
            }
        }
        text
    }

    // ------------------------------------------------------------------------
    // Model Selection Callback
    // ------------------------------------------------------------------------

    async fn handle_callback(&self, callback: CallbackQuery) -> Result<()> {
        let Some(model) = callback
            .data
            .strip_prefix(SET_MODEL_PREFIX)
            .filter(|m| !m.is_empty())
        else {
            warn!(data = %callback.data, "Unknown callback data");
            self.transport
                .answer_callback_query(&callback.id, Some("Error: Invalid selection data."))
                .await?;
            return Ok(());
        };

        let ack = format!("Setting model to {model}...");
        if let Err(e) = self
            .transport
            .answer_callback_query(&callback.id, Some(&ack))
            .await
        {
            warn!(error = %e, "Answering callback query failed");
        }

        let text = match self
            .session
            .select_model(ConversationId::new(callback.chat_id), model)
            .await
        {
            Ok(ModelChange::AlreadySelected) => format!("Model is already set to `{model}`."),
            Ok(ModelChange::Changed) => {
                format!("Model set to `{model}` successfully! Your chat history has been reset.")
            }
            Err(e) => {
                error!(error = %e, "Selecting model failed");
                store_error_text(&e, "Failed to set the model in the database.")
            }
        };

        self.transport
            .edit_message_text(
                callback.chat_id,
                callback.message_id,
                &format::to_telegram_html(&text),
                ParseMode::Html,
            )
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Chat Flow
    // ------------------------------------------------------------------------

    async fn handle_chat(&self, chat_id: i64, input: UserInput) -> Result<()> {
        let id = ConversationId::new(chat_id);

        // Photos are described by file id until the download reveals their type.
        let pending_parts = match &input {
            UserInput::Text(text) => vec![ContentPart::text(text.clone())],
            UserInput::Photo { file_id, caption } => {
                vec![ContentPart::image(file_id.clone(), caption.clone())]
            }
        };

        let context = match self.session.prepare_context(id, &pending_parts).await {
            Ok(context) => context,
            Err(e) => {
                error!(error = %e, "Preparing context failed");
                let text = store_error_text(&e, SETTINGS_FETCH_FAILED_TEXT);
                return self.reply(chat_id, &text).await;
            }
        };

        let credential = match (context.authorization, context.credential.clone()) {
            (Authorization::Denied(reason), _) => {
                info!(%reason, "Request denied");
                return self.reply(chat_id, &denial_text(reason)).await;
            }
            (_, Some(credential)) => credential,
            (_, None) => return self.reply(chat_id, NO_KEY_TEXT).await,
        };

        let loading = self.show_loading(chat_id).await;

        let (user_parts, input_parts) = match input {
            UserInput::Text(text) => (
                vec![ContentPart::text(text.clone())],
                vec![InputPart::Text(text)],
            ),
            UserInput::Photo { file_id, caption } => {
                match self.transport.download_file(&file_id).await {
                    Ok(file) => {
                        let mime_type = mime_for_path(&file.file_path);
                        let mut input = Vec::new();
                        if let Some(caption) = &caption {
                            input.push(InputPart::Text(caption.clone()));
                        }
                        input.push(InputPart::Image {
                            mime_type: mime_type.to_string(),
                            data: file.bytes,
                        });
                        (vec![ContentPart::image(mime_type, caption)], input)
                    }
                    Err(e) => {
                        error!(error = %e, "Photo download failed");
                        self.hide_loading(chat_id, loading).await;
                        return self.reply(chat_id, IMAGE_ERROR_TEXT).await;
                    }
                }
            }
        };

        let request = GenerationRequest {
            model: context.model.clone(),
            credential,
            history: context.history,
            input: input_parts,
        };
        debug!(?request, "Generating reply");

        let reply_parts = match self.generator.generate(request).await {
            Ok(parts) => parts,
            Err(e) => {
                warn!(error = %e, kind = ?e.kind, "Generation failed");
                self.hide_loading(chat_id, loading).await;
                return self.reply(chat_id, &generation_error_text(&e)).await;
            }
        };

        let reply_text = reply_parts
            .iter()
            .map(ContentPart::replay_text)
            .collect::<Vec<_>>()
            .join("\n");

        // A generated reply counts against the quota whether or not it is stored.
        let committed = self
            .session
            .commit_exchange(id, user_parts, reply_parts)
            .await;
        if let Err(e) = &committed {
            error!(error = %e, "Saving exchange failed");
        }

        let usage = match self
            .session
            .record_default_usage(id, &context.authorization)
            .await
        {
            Ok(count) => count,
            Err(e) => {
                error!(error = %e, "Recording default key usage failed");
                None
            }
        };

        self.send_rendered(chat_id, &reply_text).await;
        self.hide_loading(chat_id, loading).await;

        if let Err(e) = committed {
            let text = store_error_text(&e, "This exchange could not be saved to your chat history.");
            self.reply(chat_id, &text).await?;
        }

        if let Some(count) = usage {
            self.warn_about_quota(chat_id, count).await?;
        }
        Ok(())
    }

    async fn warn_about_quota(&self, chat_id: i64, count: u64) -> Result<()> {
        let limit = self.session.policy().ceiling();
        if limit == 0 {
            return Ok(());
        }
        match limit.saturating_sub(count) {
            1 => self.reply(chat_id, &one_remaining_text()).await,
            0 => self.reply(chat_id, &final_message_text(limit)).await,
            _ => Ok(()),
        }
    }

    async fn show_loading(&self, chat_id: i64) -> Option<i64> {
        let file_id = self.loading_animation.as_deref()?;
        match self
            .transport
            .send_animation(chat_id, file_id, Some(LOADING_CAPTION))
            .await
        {
            Ok(message_id) => Some(message_id),
            Err(e) => {
                warn!(error = %e, "Sending loading animation failed");
                None
            }
        }
    }

    async fn hide_loading(&self, chat_id: i64, message_id: Option<i64>) {
        let Some(message_id) = message_id else { return };
        if let Err(e) = self.transport.delete_message(chat_id, message_id).await {
            warn!(error = %e, "Deleting loading animation failed");
        }
    }

    // ------------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------------

    /// Send a short Markdown reply as one HTML message.
    async fn reply(&self, chat_id: i64, markdown: &str) -> Result<()> {
        let html = format::to_telegram_html(markdown);
        self.transport
            .send_text(chat_id, &html, ParseMode::Html)
            .await?;
        Ok(())
    }

    /// Send a Markdown reply of any length. A failed item is reported in
    /// its place and the rest are still sent.
    async fn send_rendered(&self, chat_id: i64, markdown: &str) {
        for item in format::render_reply(markdown) {
            let sent = match &item {
                OutgoingItem::Text { html } => self
                    .transport
                    .send_text(chat_id, html, ParseMode::Html)
                    .await
                    .map(|_| ()),
                OutgoingItem::File { file_name, bytes } => {
                    self.transport
                        .send_document(chat_id, bytes.clone(), file_name, None)
                        .await
                }
                OutgoingItem::Diagram { url, source } => {
                    match self.transport.send_photo_url(chat_id, url, None).await {
                        Ok(()) => Ok(()),
                        Err(e) => {
                            warn!(error = %e, "Diagram render failed, sending source");
                            let html = format!("<pre>{}</pre>", format::escape_html(source));
                            self.transport
                                .send_text(chat_id, &html, ParseMode::Html)
                                .await
                                .map(|_| ())
                        }
                    }
                }
            };

            if let Err(e) = sent {
                error!(error = %e, "Sending reply part failed");
                let notice = format!("⚠️ Error processing part of the message: {e}");
                if let Err(e) = self
                    .transport
                    .send_text(chat_id, &notice, ParseMode::Plain)
                    .await
                {
                    error!(error = %e, "Sending failure notice failed");
                }
            }
        }
    }
}

fn model_button_label(name: &str) -> String {
    if name.chars().count() > MAX_BUTTON_LABEL_CHARS {
        truncate_with_ellipsis(name, MAX_BUTTON_LABEL_CHARS - 3)
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::HelpLink;
    use test_case::test_case;

    #[test_case("/start", Some(("start", "")))]
    #[test_case("/select_model@gemini_bot", Some(("select_model", "")))]
    #[test_case("/set_api_key  abc ", Some(("set_api_key", "abc")))]
    #[test_case("hello", None)]
    fn command_parsing(text: &str, expected: Option<(&str, &str)>) {
        assert_eq!(parse_command(text), expected);
    }

    #[test_case("photos/file_1.PNG", "image/png")]
    #[test_case("photos/file_2.gif", "image/gif")]
    #[test_case("photos/file_3.webp", "image/webp")]
    #[test_case("photos/file_4.jpg", "image/jpeg")]
    #[test_case("photos/file_5", "image/jpeg")]
    fn photo_mime_types(path: &str, mime: &str) {
        assert_eq!(mime_for_path(path), mime);
    }

    #[test]
    fn long_labels_are_truncated() {
        assert_eq!(model_button_label("gemini-1.5-pro"), "gemini-1.5-pro");
        let label = model_button_label("gemini-2.0-flash-preview-image-generation");
        assert_eq!(label.chars().count(), 30);
        assert!(label.ends_with("..."));
    }

    #[test]
    fn quota_error_carries_help_link() {
        let err = GenerationError::new(
            GenerationErrorKind::QuotaExceeded {
                help: Some(HelpLink {
                    description: "Quota docs".into(),
                    url: "https://example.com/q".into(),
                }),
            },
            "models/gemini-pro",
            "quota",
        )
        .with_status(429);
        let text = generation_error_text(&err);
        assert!(text.starts_with(
            "Your request failed due to a quota limit being reached for the selected model (`models/gemini-pro`)."
        ));
        assert!(text.contains("[Quota docs](https://example.com/q)"));
        assert!(text.ends_with(CLIENT_ERROR_SUFFIX));
    }

    #[test]
    fn quota_error_defaults_to_rate_limit_docs() {
        let err = GenerationError::new(
            GenerationErrorKind::QuotaExceeded { help: None },
            "m",
            "quota",
        );
        assert!(generation_error_text(&err).contains(RATE_LIMIT_DOCS));
    }

    #[test]
    fn blocked_error_lists_reasons_and_context_hint() {
        let err = GenerationError::new(
            GenerationErrorKind::Blocked {
                reasons: vec!["HARM_CATEGORY_HARASSMENT".into(), "too long".into()],
            },
            "m",
            "input CONTEXT too large",
        );
        let text = generation_error_text(&err);
        assert!(text.starts_with(
            "Your input was blocked by safety filters. Reason(s): HARM_CATEGORY_HARASSMENT, too long"
        ));
        assert!(text.contains("/reset"));
    }

    #[test]
    fn server_error_shows_code() {
        let err = GenerationError::new(GenerationErrorKind::Server, "m", "boom").with_status(503);
        assert_eq!(
            generation_error_text(&err),
            "The AI service encountered a server error (Code: 503). Please try again later."
        );
        let err = GenerationError::new(GenerationErrorKind::Server, "m", "boom");
        assert!(generation_error_text(&err).contains("(Code: N/A)"));
    }

    #[test]
    fn model_not_found_names_model() {
        let err = GenerationError::new(GenerationErrorKind::ModelNotFound, "models/x", "nf");
        assert!(generation_error_text(&err).contains("`models/x` is not available"));
    }

    #[test]
    fn denial_texts() {
        assert!(denial_text(DenialReason::NoCredential).starts_with("AI service not available."));
        assert!(denial_text(DenialReason::QuotaExhausted { used: 5, limit: 5 })
            .starts_with("You have reached the 5-message limit"));
    }

    #[test]
    fn store_errors_map_to_texts() {
        let err = Error::StoreUnavailable("down".into()).with_context("load");
        assert_eq!(store_error_text(&err, "x"), DB_UNAVAILABLE_TEXT);
        let err = Error::Conflict("turn 4".into());
        assert!(store_error_text(&err, "x").contains("send your message again"));
        let err = Error::MalformedRecord("bad".into());
        assert_eq!(store_error_text(&err, "fallback"), "fallback");
    }
}
