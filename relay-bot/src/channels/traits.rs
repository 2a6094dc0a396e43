//! Transport abstraction for chat platforms.

use async_trait::async_trait;

/// Result type for channel operations.
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Channel error type.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Rate limited: retry after {retry_after_secs} seconds")]
    RateLimited { retry_after_secs: u64 },

    #[error("Message send failed: {0}")]
    SendFailed(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Channel not ready")]
    NotReady,
}

impl From<ChannelError> for relay_common::Error {
    fn from(err: ChannelError) -> Self {
        relay_common::Error::External(err.to_string())
    }
}

/// How message text is interpreted by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    Html,
    Plain,
}

/// A single inline keyboard button.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineButton {
    pub text: String,
    pub callback_data: String,
}

impl InlineButton {
    pub fn new(text: impl Into<String>, callback_data: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            callback_data: callback_data.into(),
        }
    }
}

/// A file fetched from the platform.
#[derive(Debug, Clone)]
pub struct DownloadedFile {
    pub bytes: Vec<u8>,
    /// Platform-side path, used to guess the file type.
    pub file_path: String,
}

/// What a user sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundContent {
    Text(String),
    Photo {
        /// The largest available size.
        file_id: String,
        caption: Option<String>,
    },
    /// Stickers, voice notes, documents and anything else the relay ignores.
    Unsupported { kind: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub chat_id: i64,
    pub message_id: i64,
    pub user_id: Option<i64>,
    pub username: Option<String>,
    pub content: InboundContent,
}

/// Callback query received when a user clicks an inline button.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackQuery {
    pub id: String,
    pub chat_id: i64,
    pub message_id: i64,
    pub from_user_id: i64,
    pub from_username: Option<String>,
    pub data: String,
}

/// One update delivered by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Message(InboundMessage),
    Callback(CallbackQuery),
}

impl InboundEvent {
    pub fn chat_id(&self) -> i64 {
        match self {
            Self::Message(m) => m.chat_id,
            Self::Callback(c) => c.chat_id,
        }
    }
}

/// Outbound operations the request handler needs from a chat platform.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Get the channel name.
    fn name(&self) -> &'static str;

    /// Send one message and return its id. Text longer than the platform
    /// limit is rejected by the platform, so callers chunk first.
    async fn send_text(&self, chat_id: i64, text: &str, mode: ParseMode) -> ChannelResult<i64>;

    async fn send_document(
        &self,
        chat_id: i64,
        bytes: Vec<u8>,
        file_name: &str,
        caption: Option<&str>,
    ) -> ChannelResult<()>;

    async fn send_photo_url(&self, chat_id: i64, url: &str, caption: Option<&str>) -> ChannelResult<()>;

    async fn send_animation(
        &self,
        chat_id: i64,
        file_id: &str,
        caption: Option<&str>,
    ) -> ChannelResult<i64>;

    async fn send_with_inline_keyboard(
        &self,
        chat_id: i64,
        text: &str,
        buttons: Vec<Vec<InlineButton>>,
    ) -> ChannelResult<i64>;

    async fn edit_message_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        mode: ParseMode,
    ) -> ChannelResult<()>;

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> ChannelResult<()>;

    /// Acknowledge a button click.
    async fn answer_callback_query(&self, callback_id: &str, text: Option<&str>) -> ChannelResult<()>;

    async fn download_file(&self, file_id: &str) -> ChannelResult<DownloadedFile>;

    /// Check if the channel is healthy.
    async fn health_check(&self) -> ChannelResult<()>;
}
