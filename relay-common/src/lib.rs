//! Relay Common - Shared types, utilities, and configuration for the Gemini chat relay.
//!
//! This crate provides:
//! - The error taxonomy shared by the store, core and bot crates
//! - Configuration types, loading and environment overrides
//! - Logging setup and structured logging helpers
//! - Small string utilities (secret masking, truncation)

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod logging;
pub mod util;

pub use config::{
    BotMode, Config, GeminiConfig, HistoryConfig, LoggingConfig, StorageBackend, StorageConfig,
    TelegramConfig, UsageConfig, WebhookConfig,
};
pub use error::{Error, Result, ResultExt};

/// Re-export commonly used types for convenience
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result, ResultExt};
    pub use crate::logging::init_logging;
}
