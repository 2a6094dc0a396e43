//! Gemini Relay Bot - Telegram front end for the Gemini chat relay.
//!
//! This crate provides:
//! - The Telegram transport (Bot API calls, update parsing, long polling)
//! - The Gemini generation backend
//! - Markdown to Telegram HTML rendering
//! - Command and chat handlers
//! - The webhook HTTP server
//!
//! ## Architecture
//!
//! ```text
//! Telegram ─→ webhook route / getUpdates loop ─→ BotHandler ─┬─→ ConversationSession ─→ RowStore
//!                                                            ├─→ Generator (Gemini)
//!    ↑                                                       │
//!    └────────────────── Transport ←── format ←──────────────┘
//! ```

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod channels;
pub mod format;
pub mod handlers;
pub mod providers;
pub mod routes;

pub use channels::{TelegramChannel, Transport};
pub use handlers::BotHandler;
pub use providers::{GeminiProvider, Generator};
pub use routes::{build_router, AppState};

use anyhow::Context;
use relay_common::Config;
use relay_core::ConversationSession;
use relay_store::RowStore;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Updates buffered between the polling loop and the handlers.
const UPDATE_QUEUE_SIZE: usize = 100;

/// Everything a running relay needs, wired from configuration.
pub struct Relay {
    pub handler: Arc<BotHandler>,
    pub channel: Arc<TelegramChannel>,
    pub store: Arc<dyn RowStore>,
}

impl Relay {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        config.validate()?;

        let store = relay_store::create_row_store(&config.storage)?;
        let channel = Arc::new(TelegramChannel::from_config(&config.telegram)?);
        let generator: Arc<dyn Generator> = Arc::new(GeminiProvider::from_config(&config.gemini));
        let session = ConversationSession::from_config(store.clone(), config);

        let handler = BotHandler::new(session, generator, channel.clone())
            .with_loading_animation(config.telegram.loading_animation_file_id.clone());

        tracing::info!(
            store = store.name(),
            model = %config.gemini.default_model,
            history_turns = config.history.max_turns,
            default_key_limit = config.usage.default_key_message_limit,
            "Relay initialized"
        );

        Ok(Self {
            handler: Arc::new(handler),
            channel,
            store,
        })
    }

    fn app_state(&self) -> AppState {
        AppState {
            handler: self.handler.clone(),
            channel: self.channel.clone(),
            store: self.store.clone(),
        }
    }
}

/// Long-poll Telegram and handle each update on its own task until Ctrl-C.
pub async fn run_polling(relay: Relay) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::channel(UPDATE_QUEUE_SIZE);

    let channel = relay.channel.clone();
    let listener = tokio::spawn(async move { channel.listen(tx).await });

    tracing::info!("Polling mode started");

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else {
                    tracing::warn!("Update stream closed");
                    break;
                };
                let handler = relay.handler.clone();
                tokio::spawn(async move {
                    // Errors are logged inside the handler span.
                    let _ = handler.handle(event).await;
                });
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                break;
            }
        }
    }

    listener.abort();
    Ok(())
}

/// Serve the webhook route until Ctrl-C, registering it with Telegram first
/// when a public URL is configured.
pub async fn run_webhook(relay: Relay, config: &Config, bind: &str) -> anyhow::Result<()> {
    let addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("Invalid webhook bind address: {bind}"))?;

    if let Some(base) = config.webhook.public_url.as_deref().filter(|u| !u.is_empty()) {
        let token = config.telegram.bot_token.as_deref().unwrap_or_default();
        let url = format!("{}/webhook/telegram/{token}", base.trim_end_matches('/'));
        relay
            .channel
            .set_webhook(&url)
            .await
            .context("Failed to register the Telegram webhook")?;
    } else {
        tracing::info!("No public URL configured; expecting the webhook to be registered already");
    }

    let router = build_router(relay.app_state());

    tracing::info!("Starting webhook server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await?;

    Ok(())
}
