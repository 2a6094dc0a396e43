//! Gemini Relay - Main entry point.

use anyhow::Result;
use clap::{Parser, Subcommand};
use relay_bot::Relay;
use relay_common::config::{BotMode, Config};
use relay_common::logging::init_logging;
use std::path::PathBuf;

/// Telegram chat relay for Google Gemini.
#[derive(Parser, Debug)]
#[command(name = "gemini-relay")]
#[command(version)]
#[command(about = "Relay Telegram chats to Google Gemini.", long_about = None)]
struct Cli {
    /// Config file (default: ~/.gemini-relay/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run in the mode selected by configuration (BOT_MODE)
    Run,

    /// Long-poll Telegram for updates
    Poll,

    /// Serve the Telegram webhook
    Webhook {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,

        /// Port to bind to
        #[arg(long)]
        port: Option<u16>,
    },

    /// Print the effective configuration with secrets masked
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    if let Commands::Config = cli.command {
        println!("{}", config.to_masked_json()?);
        return Ok(());
    }

    init_logging(&config.logging.level, &config.logging.format);
    tracing::info!("Gemini Relay v{}", env!("CARGO_PKG_VERSION"));

    let mode = match &cli.command {
        Commands::Poll => BotMode::Polling,
        Commands::Webhook { host, port } => {
            if let Some(host) = host {
                config.webhook.host = host.clone();
            }
            if let Some(port) = port {
                config.webhook.port = *port;
            }
            BotMode::Webhook
        }
        Commands::Run | Commands::Config => config.mode,
    };

    let relay = Relay::from_config(&config)?;

    match mode {
        BotMode::Polling => relay_bot::run_polling(relay).await,
        BotMode::Webhook => {
            let bind = config.webhook_bind_address();
            relay_bot::run_webhook(relay, &config, &bind).await
        }
    }
}
