//! Telegram channel adapter.
//!
//! Provides the `TelegramChannel` implementation for receiving and sending messages
//! through the Telegram Bot API. Updates arrive either through [`listen`]
//! (long polling) or through the webhook route; both go through
//! [`TelegramChannel::accept_update`].
//!
//! [`listen`]: TelegramChannel::listen

use crate::channels::traits::{
    CallbackQuery, ChannelError, ChannelResult, DownloadedFile, InboundContent, InboundEvent,
    InboundMessage, InlineButton, ParseMode, Transport,
};
use crate::format;
use async_trait::async_trait;
use relay_common::TelegramConfig;
use reqwest::multipart::{Form, Part};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;

const DEFAULT_API_BASE: &str = "https://api.telegram.org";
const POLL_TIMEOUT_SECS: u64 = 30;
const POLL_BACKOFF: Duration = Duration::from_secs(5);

/// Content kinds we recognise but do not process.
const UNSUPPORTED_KINDS: &[&str] = &[
    "sticker",
    "voice",
    "video",
    "video_note",
    "document",
    "audio",
    "animation",
    "location",
    "contact",
    "poll",
];

/// Telegram channel over the Bot API.
pub struct TelegramChannel {
    bot_token: String,
    api_base: String,
    allowed_users: Vec<String>,
    client: reqwest::Client,
}

impl TelegramChannel {
    /// Create a new Telegram channel.
    pub fn new(bot_token: String, allowed_users: Vec<String>) -> Self {
        Self {
            bot_token,
            api_base: DEFAULT_API_BASE.to_string(),
            allowed_users,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 15))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    /// Point the channel at a different Bot API server.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn from_config(config: &TelegramConfig) -> relay_common::Result<Self> {
        let token = config
            .bot_token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| relay_common::Error::Config("telegram.bot_token is not set".into()))?;
        Ok(Self::new(token, config.allowed_users.clone()).with_api_base(config.api_base.clone()))
    }

    /// Whether `token` is this bot's token. Used to authenticate webhook calls.
    pub fn token_matches(&self, token: &str) -> bool {
        !token.is_empty() && token == self.bot_token
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_base, self.bot_token)
    }

    fn file_url(&self, file_path: &str) -> String {
        format!("{}/file/bot{}/{file_path}", self.api_base, self.bot_token)
    }

    fn is_user_allowed(&self, identity: &str) -> bool {
        self.allowed_users.iter().any(|u| u == "*" || u == identity)
    }

    fn is_any_user_allowed<'a, I>(&self, identities: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        identities.into_iter().any(|id| self.is_user_allowed(id))
    }

    /// Call a JSON Bot API method and return its `result`.
    async fn call(&self, method: &str, body: &Value) -> ChannelResult<Value> {
        let resp = self
            .client
            .post(self.api_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| ChannelError::Connection(e.without_url().to_string()))?;
        read_envelope(method, resp).await
    }

    async fn call_multipart(&self, method: &str, form: Form) -> ChannelResult<Value> {
        let resp = self
            .client
            .post(self.api_url(method))
            .multipart(form)
            .send()
            .await
            .map_err(|e| ChannelError::Connection(e.without_url().to_string()))?;
        read_envelope(method, resp).await
    }

    /// Parse a raw update without applying access control.
    pub fn parse_update(update: &Value) -> Option<InboundEvent> {
        if let Some(callback) = update.get("callback_query") {
            return parse_callback_query(callback).map(InboundEvent::Callback);
        }

        let message = update.get("message")?;
        let chat_id = message.get("chat")?.get("id")?.as_i64()?;
        let message_id = message.get("message_id").and_then(Value::as_i64).unwrap_or_default();
        let from = message.get("from");
        let user_id = from.and_then(|f| f.get("id")).and_then(Value::as_i64);
        let username = from
            .and_then(|f| f.get("username"))
            .and_then(Value::as_str)
            .map(String::from);

        let content = if let Some(text) = message.get("text").and_then(Value::as_str) {
            InboundContent::Text(text.to_string())
        } else if let Some(sizes) = message.get("photo").and_then(Value::as_array) {
            let largest = sizes.iter().max_by_key(|s| {
                let w = s.get("width").and_then(Value::as_u64).unwrap_or(0);
                let h = s.get("height").and_then(Value::as_u64).unwrap_or(0);
                w * h
            })?;
            InboundContent::Photo {
                file_id: largest.get("file_id")?.as_str()?.to_string(),
                caption: message
                    .get("caption")
                    .and_then(Value::as_str)
                    .filter(|c| !c.trim().is_empty())
                    .map(String::from),
            }
        } else {
            let kind = UNSUPPORTED_KINDS
                .iter()
                .find(|k| message.get(**k).is_some())
                .copied()
                .unwrap_or("unknown");
            InboundContent::Unsupported {
                kind: kind.to_string(),
            }
        };

        Some(InboundEvent::Message(InboundMessage {
            chat_id,
            message_id,
            user_id,
            username,
            content,
        }))
    }

    /// Parse an update and drop it if the sender is not allowed.
    pub fn accept_update(&self, update: &Value) -> Option<InboundEvent> {
        let event = Self::parse_update(update)?;
        let (user_id, username) = match &event {
            InboundEvent::Message(m) => (m.user_id, m.username.as_deref()),
            InboundEvent::Callback(c) => (Some(c.from_user_id), c.from_username.as_deref()),
        };
        let user_id = user_id.map(|id| id.to_string());

        let mut identities = Vec::new();
        if let Some(name) = username {
            identities.push(name);
        }
        if let Some(id) = user_id.as_deref() {
            identities.push(id);
        }
        if identities.is_empty() {
            identities.push("unknown");
        }

        if self.is_any_user_allowed(identities.iter().copied()) {
            Some(event)
        } else {
            tracing::warn!(
                username = username.unwrap_or("unknown"),
                chat_id = event.chat_id(),
                "Telegram: ignoring update from unauthorized user"
            );
            None
        }
    }

    /// Register `url` as the webhook endpoint.
    pub async fn set_webhook(&self, url: &str) -> ChannelResult<()> {
        self.call(
            "setWebhook",
            &json!({ "url": url, "allowed_updates": ["message", "callback_query"] }),
        )
        .await?;
        tracing::info!("Telegram webhook registered");
        Ok(())
    }

    pub async fn delete_webhook(&self) -> ChannelResult<()> {
        self.call("deleteWebhook", &json!({})).await.map(|_| ())
    }

    /// Long-poll `getUpdates` and forward accepted events to `tx`.
    ///
    /// Returns once the receiving side is dropped.
    pub async fn listen(&self, tx: mpsc::Sender<InboundEvent>) -> ChannelResult<()> {
        if let Err(e) = self.delete_webhook().await {
            tracing::warn!("Telegram deleteWebhook failed before polling: {e}");
        }

        let mut offset: i64 = 0;
        tracing::info!("Telegram channel listening for messages...");

        loop {
            let body = json!({
                "offset": offset,
                "timeout": POLL_TIMEOUT_SECS,
                "allowed_updates": ["message", "callback_query"]
            });

            let updates = match self.call("getUpdates", &body).await {
                Ok(result) => result,
                Err(e) => {
                    tracing::warn!("Telegram poll error: {e}");
                    tokio::time::sleep(POLL_BACKOFF).await;
                    continue;
                }
            };

            let Some(updates) = updates.as_array() else {
                tracing::warn!("Telegram getUpdates returned a non-array result");
                tokio::time::sleep(POLL_BACKOFF).await;
                continue;
            };

            for update in updates {
                if let Some(uid) = update.get("update_id").and_then(Value::as_i64) {
                    offset = uid + 1;
                }
                let Some(event) = self.accept_update(update) else {
                    continue;
                };
                if tx.send(event).await.is_err() {
                    tracing::info!("Telegram listener stopped: receiver closed");
                    return Ok(());
                }
            }
        }
    }

    async fn send_message_body(&self, body: &Value) -> ChannelResult<i64> {
        let result = self.call("sendMessage", body).await?;
        message_id_of(&result)
    }
}

/// Read a Bot API response envelope: `{"ok": bool, "result": .., "description": ..}`.
async fn read_envelope(method: &str, resp: reqwest::Response) -> ChannelResult<Value> {
    let status = resp.status();
    let data: Value = resp.json().await.unwrap_or(Value::Null);

    if status.is_success() && data.get("ok").and_then(Value::as_bool).unwrap_or(false) {
        return Ok(data.get("result").cloned().unwrap_or(Value::Null));
    }

    let description = data
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or("no description")
        .to_string();

    Err(match status.as_u16() {
        401 | 403 => ChannelError::Auth(format!("{method}: {description}")),
        429 => ChannelError::RateLimited {
            retry_after_secs: data
                .get("parameters")
                .and_then(|p| p.get("retry_after"))
                .and_then(Value::as_u64)
                .unwrap_or(1),
        },
        400 => ChannelError::InvalidMessage(format!("{method}: {description}")),
        _ => ChannelError::SendFailed(format!("{method} ({status}): {description}")),
    })
}

fn message_id_of(result: &Value) -> ChannelResult<i64> {
    result
        .get("message_id")
        .and_then(Value::as_i64)
        .ok_or_else(|| ChannelError::SendFailed("Missing message_id in response".into()))
}

fn is_parse_error(err: &ChannelError) -> bool {
    matches!(err, ChannelError::InvalidMessage(d) if d.contains("parse entities"))
}

fn parse_callback_query(callback: &Value) -> Option<CallbackQuery> {
    let id = callback.get("id")?.as_str()?.to_string();
    let data = callback.get("data")?.as_str()?.to_string();

    let from = callback.get("from")?;
    let from_user_id = from.get("id")?.as_i64()?;
    let from_username = from.get("username").and_then(Value::as_str).map(String::from);

    let message = callback.get("message")?;
    let chat_id = message.get("chat")?.get("id")?.as_i64()?;
    let message_id = message.get("message_id")?.as_i64()?;

    Some(CallbackQuery {
        id,
        chat_id,
        message_id,
        from_user_id,
        from_username,
        data,
    })
}

#[async_trait]
impl Transport for TelegramChannel {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn send_text(&self, chat_id: i64, text: &str, mode: ParseMode) -> ChannelResult<i64> {
        let body = match mode {
            ParseMode::Html => json!({ "chat_id": chat_id, "text": text, "parse_mode": "HTML" }),
            ParseMode::Plain => json!({ "chat_id": chat_id, "text": text }),
        };

        match self.send_message_body(&body).await {
            Err(e) if mode == ParseMode::Html && is_parse_error(&e) => {
                tracing::warn!("Telegram HTML parsing failed, retrying without parse_mode: {e}");
                let plain = format::html_to_plain(text);
                self.send_message_body(&json!({ "chat_id": chat_id, "text": plain }))
                    .await
            }
            other => other,
        }
    }

    async fn send_document(
        &self,
        chat_id: i64,
        bytes: Vec<u8>,
        file_name: &str,
        caption: Option<&str>,
    ) -> ChannelResult<()> {
        let part = Part::bytes(bytes).file_name(file_name.to_string());
        let mut form = Form::new()
            .text("chat_id", chat_id.to_string())
            .part("document", part);
        if let Some(cap) = caption {
            form = form.text("caption", cap.to_string());
        }

        self.call_multipart("sendDocument", form).await?;
        tracing::info!("Telegram document sent to {chat_id}: {file_name}");
        Ok(())
    }

    async fn send_photo_url(&self, chat_id: i64, url: &str, caption: Option<&str>) -> ChannelResult<()> {
        let mut body = json!({ "chat_id": chat_id, "photo": url });
        if let Some(cap) = caption {
            body["caption"] = Value::String(cap.to_string());
        }
        self.call("sendPhoto", &body).await.map(|_| ())
    }

    async fn send_animation(
        &self,
        chat_id: i64,
        file_id: &str,
        caption: Option<&str>,
    ) -> ChannelResult<i64> {
        let mut body = json!({ "chat_id": chat_id, "animation": file_id });
        if let Some(cap) = caption {
            body["caption"] = Value::String(cap.to_string());
        }
        let result = self.call("sendAnimation", &body).await?;
        message_id_of(&result)
    }

    async fn send_with_inline_keyboard(
        &self,
        chat_id: i64,
        text: &str,
        buttons: Vec<Vec<InlineButton>>,
    ) -> ChannelResult<i64> {
        let keyboard: Vec<Vec<Value>> = buttons
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .map(|btn| json!({ "text": btn.text, "callback_data": btn.callback_data }))
                    .collect()
            })
            .collect();

        let body = json!({
            "chat_id": chat_id,
            "text": text,
            "reply_markup": { "inline_keyboard": keyboard }
        });
        self.send_message_body(&body).await
    }

    async fn edit_message_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        mode: ParseMode,
    ) -> ChannelResult<()> {
        let mut body = json!({ "chat_id": chat_id, "message_id": message_id, "text": text });
        if mode == ParseMode::Html {
            body["parse_mode"] = Value::String("HTML".into());
        }

        match self.call("editMessageText", &body).await {
            Ok(_) => Ok(()),
            Err(ChannelError::InvalidMessage(d)) if d.contains("message is not modified") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> ChannelResult<()> {
        self.call(
            "deleteMessage",
            &json!({ "chat_id": chat_id, "message_id": message_id }),
        )
        .await
        .map(|_| ())
    }

    async fn answer_callback_query(&self, callback_id: &str, text: Option<&str>) -> ChannelResult<()> {
        let mut body = json!({ "callback_query_id": callback_id, "show_alert": false });
        if let Some(t) = text {
            body["text"] = Value::String(t.to_string());
        }
        self.call("answerCallbackQuery", &body).await.map(|_| ())
    }

    async fn download_file(&self, file_id: &str) -> ChannelResult<DownloadedFile> {
        let result = self.call("getFile", &json!({ "file_id": file_id })).await?;
        let file_path = result
            .get("file_path")
            .and_then(Value::as_str)
            .ok_or_else(|| ChannelError::InvalidMessage("Missing file_path in getFile response".into()))?
            .to_string();

        let resp = self
            .client
            .get(self.file_url(&file_path))
            .send()
            .await
            .map_err(|e| ChannelError::Connection(e.without_url().to_string()))?;
        if !resp.status().is_success() {
            return Err(ChannelError::SendFailed(format!(
                "Failed to download file from Telegram: {}",
                resp.status()
            )));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| ChannelError::Connection(e.without_url().to_string()))?;
        Ok(DownloadedFile {
            bytes: bytes.to_vec(),
            file_path,
        })
    }

    async fn health_check(&self) -> ChannelResult<()> {
        match self.call("getMe", &json!({})).await {
            Ok(_) => Ok(()),
            Err(ChannelError::Auth(e)) => Err(ChannelError::Auth(e)),
            Err(_) => Err(ChannelError::NotReady),
        }
    }
}
