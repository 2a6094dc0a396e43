//! Configuration management for the relay.
//!
//! The relay reads a single configuration file at `~/.gemini-relay/config.json`.
//!
//! # Configuration Priority
//!
//! 1. Environment variables
//! 2. Explicit config file values
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `BOT_MODE` → mode (`webhook` | `polling`)
//! - `BOT_API_KEY` → telegram.bot_token
//! - `LOADING_ANIMATION_FILE_ID` → telegram.loading_animation_file_id
//! - `GEMINI_BOT_DEFAULT_API_KEY` → gemini.default_api_key
//! - `DEFAULT_MODEL_NAME` → gemini.default_model
//! - `MAX_HISTORY_LENGTH_TURNS` → history.max_turns
//! - `DEFAULT_KEY_MESSAGE_LIMIT` → usage.default_key_message_limit
//! - `RELAY_DB_PATH` → storage.path
//! - `RELAY_WEBHOOK_HOST` / `RELAY_WEBHOOK_PORT` / `RELAY_WEBHOOK_URL` → webhook.*
//! - `RELAY_LOG_LEVEL` / `RELAY_LOG_FORMAT` → logging.*

use crate::util::mask_secret;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".gemini-relay"),
        |dirs| dirs.home_dir().join(".gemini-relay"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

// ============================================================================
// Delivery Mode
// ============================================================================

/// How updates reach the bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BotMode {
    /// Telegram pushes updates to an HTTP endpoint.
    #[default]
    Webhook,
    /// The bot long-polls `getUpdates`.
    Polling,
}

impl BotMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::Polling => "polling",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "webhook" => Some(Self::Webhook),
            "polling" | "poll" => Some(Self::Polling),
            _ => None,
        }
    }
}

impl fmt::Display for BotMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Telegram
// ============================================================================

/// Telegram Bot API settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Bot token issued by BotFather.
    #[serde(default)]
    pub bot_token: Option<String>,

    /// Usernames or numeric ids allowed to talk to the bot. `*` allows everyone.
    #[serde(default = "default_allowed_users")]
    pub allowed_users: Vec<String>,

    /// Animation shown while a reply is being generated.
    #[serde(default)]
    pub loading_animation_file_id: Option<String>,

    #[serde(default = "default_telegram_api_base")]
    pub api_base: String,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            allowed_users: default_allowed_users(),
            loading_animation_file_id: None,
            api_base: default_telegram_api_base(),
        }
    }
}

impl fmt::Debug for TelegramConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramConfig")
            .field("bot_token", &self.bot_token.as_deref().map(mask_secret))
            .field("allowed_users", &self.allowed_users)
            .field("loading_animation_file_id", &self.loading_animation_file_id)
            .field("api_base", &self.api_base)
            .finish()
    }
}

fn default_allowed_users() -> Vec<String> {
    vec!["*".into()]
}

fn default_telegram_api_base() -> String {
    "https://api.telegram.org".into()
}

// ============================================================================
// Gemini
// ============================================================================

/// Gemini API settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct GeminiConfig {
    /// Shared credential used when a conversation has not supplied its own.
    #[serde(default)]
    pub default_api_key: Option<String>,

    #[serde(default = "default_model")]
    pub default_model: String,

    #[serde(default = "default_gemini_api_base")]
    pub api_base: String,

    /// Request timeout for generation calls, in seconds.
    #[serde(default = "default_gemini_timeout")]
    pub timeout_secs: u64,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            default_api_key: None,
            default_model: default_model(),
            api_base: default_gemini_api_base(),
            timeout_secs: default_gemini_timeout(),
        }
    }
}

impl fmt::Debug for GeminiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeminiConfig")
            .field("default_api_key", &self.default_api_key.as_deref().map(mask_secret))
            .field("default_model", &self.default_model)
            .field("api_base", &self.api_base)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

fn default_model() -> String {
    "models/gemini-1.5-flash-latest".into()
}

fn default_gemini_api_base() -> String {
    "https://generativelanguage.googleapis.com".into()
}

fn default_gemini_timeout() -> u64 {
    120
}

// ============================================================================
// History & Usage
// ============================================================================

/// Conversation history retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Turns kept per conversation. 0 keeps everything.
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
        }
    }
}

fn default_max_turns() -> usize {
    20
}

/// Shared-credential usage ceiling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageConfig {
    /// Messages a conversation may send on the default key. 0 disables the ceiling.
    #[serde(default = "default_message_limit")]
    pub default_key_message_limit: u64,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            default_key_message_limit: default_message_limit(),
        }
    }
}

fn default_message_limit() -> u64 {
    5
}

// ============================================================================
// Storage
// ============================================================================

/// Which engine backs the row store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    /// Process-local; everything is lost on restart.
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// SQLite database path. `~` is expanded.
    #[serde(default)]
    pub path: Option<String>,
}

impl StorageConfig {
    /// The database path with `~` expanded, defaulting to `relay.db` in the config directory.
    pub fn resolved_path(&self) -> PathBuf {
        match &self.path {
            Some(p) => PathBuf::from(shellexpand::tilde(p).into_owned()),
            None => config_dir().join("relay.db"),
        }
    }
}

// ============================================================================
// Webhook & Logging
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default = "default_webhook_host")]
    pub host: String,

    #[serde(default = "default_webhook_port")]
    pub port: u16,

    /// Public base URL registered with Telegram on startup, if set.
    #[serde(default)]
    pub public_url: Option<String>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            host: default_webhook_host(),
            port: default_webhook_port(),
            public_url: None,
        }
    }
}

fn default_webhook_host() -> String {
    "0.0.0.0".into()
}

fn default_webhook_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// `pretty` or `json`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

// ============================================================================
// Root Configuration
// ============================================================================

/// Root relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub mode: BotMode,

    #[serde(default)]
    pub telegram: TelegramConfig,

    #[serde(default)]
    pub gemini: GeminiConfig,

    #[serde(default)]
    pub history: HistoryConfig,

    #[serde(default)]
    pub usage: UsageConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub webhook: WebhookConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from the default path, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = config_path();
        let mut config = if path.exists() {
            Self::read_file(&path)?
        } else {
            tracing::info!("Config file not found, using defaults");
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a specific path, then apply environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = Self::read_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn read_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// Apply overrides using `lookup` to resolve variable names.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(mode) = lookup("BOT_MODE") {
            match BotMode::parse(&mode) {
                Some(m) => self.mode = m,
                None => tracing::warn!(value = %mode, "Ignoring unknown BOT_MODE"),
            }
        }

        if let Some(token) = lookup("BOT_API_KEY").filter(|v| !v.is_empty()) {
            self.telegram.bot_token = Some(token);
        }
        if let Some(id) = lookup("LOADING_ANIMATION_FILE_ID").filter(|v| !v.is_empty()) {
            self.telegram.loading_animation_file_id = Some(id);
        }

        if let Some(key) = lookup("GEMINI_BOT_DEFAULT_API_KEY").filter(|v| !v.is_empty()) {
            self.gemini.default_api_key = Some(key);
        }
        if let Some(model) = lookup("DEFAULT_MODEL_NAME").filter(|v| !v.is_empty()) {
            self.gemini.default_model = model;
        }

        if let Some(turns) = parse_var(&lookup, "MAX_HISTORY_LENGTH_TURNS") {
            self.history.max_turns = turns;
        }
        if let Some(limit) = parse_var(&lookup, "DEFAULT_KEY_MESSAGE_LIMIT") {
            self.usage.default_key_message_limit = limit;
        }

        if let Some(path) = lookup("RELAY_DB_PATH").filter(|v| !v.is_empty()) {
            self.storage.path = Some(path);
        }

        if let Some(host) = lookup("RELAY_WEBHOOK_HOST").filter(|v| !v.is_empty()) {
            self.webhook.host = host;
        }
        if let Some(port) = parse_var(&lookup, "RELAY_WEBHOOK_PORT") {
            self.webhook.port = port;
        }
        if let Some(url) = lookup("RELAY_WEBHOOK_URL").filter(|v| !v.is_empty()) {
            self.webhook.public_url = Some(url);
        }

        if let Some(level) = lookup("RELAY_LOG_LEVEL").filter(|v| !v.is_empty()) {
            self.logging.level = level;
        }
        if let Some(format) = lookup("RELAY_LOG_FORMAT").filter(|v| !v.is_empty()) {
            self.logging.format = format;
        }
    }

    /// Check the settings the bot cannot start without.
    pub fn validate(&self) -> crate::Result<()> {
        if self.telegram.bot_token.as_deref().map_or(true, str::is_empty) {
            return Err(crate::Error::Config(
                "telegram.bot_token is not set (BOT_API_KEY)".into(),
            ));
        }
        if self.gemini.default_model.trim().is_empty() {
            return Err(crate::Error::Config("gemini.default_model is empty".into()));
        }
        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(crate::Error::Config(format!(
                "logging.format must be 'pretty' or 'json', got '{}'",
                self.logging.format
            )));
        }
        if self.gemini.default_api_key.is_none() {
            tracing::warn!(
                "No default Gemini API key configured; users must supply their own via /set_api_key"
            );
        }
        Ok(())
    }

    /// Serialize with secrets masked, for display.
    pub fn to_masked_json(&self) -> Result<String> {
        let mut masked = self.clone();
        masked.telegram.bot_token = masked.telegram.bot_token.as_deref().map(mask_secret);
        masked.gemini.default_api_key = masked.gemini.default_api_key.as_deref().map(mask_secret);
        Ok(serde_json::to_string_pretty(&masked)?)
    }

    /// The socket address the webhook server binds to.
    pub fn webhook_bind_address(&self) -> String {
        format!("{}:{}", self.webhook.host, self.webhook.port)
    }
}

fn parse_var<F, T>(lookup: &F, name: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "Ignoring unparseable value");
            None
        }
    }
}
