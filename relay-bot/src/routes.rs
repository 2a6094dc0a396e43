//! HTTP routes for webhook delivery.
//!
//! - `POST /webhook/telegram/:token` receives Telegram updates
//! - `GET /health` reports liveness and store health

use crate::channels::TelegramChannel;
use crate::handlers::BotHandler;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use relay_store::RowStore;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;

/// Telegram updates are small; photos arrive as file ids.
const MAX_UPDATE_BYTES: usize = 1024 * 1024;

// ============================================================================
// State
// ============================================================================

/// Shared state for the webhook server.
#[derive(Clone)]
pub struct AppState {
    pub handler: Arc<BotHandler>,
    /// Parses updates and authenticates the webhook path token.
    pub channel: Arc<TelegramChannel>,
    pub store: Arc<dyn RowStore>,
}

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    store: String,
    store_healthy: bool,
}

fn webhook_reply(status: StatusCode, body: Value) -> (StatusCode, Json<Value>) {
    (status, Json(body))
}

// ============================================================================
// Router
// ============================================================================

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/webhook/telegram/:token", post(telegram_webhook))
        .layer(RequestBodyLimitLayer::new(MAX_UPDATE_BYTES))
        .with_state(state)
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        service: "gemini-relay",
        version: env!("CARGO_PKG_VERSION"),
        store: state.store.name().to_string(),
        store_healthy: state.store.health_check().await,
    })
}

/// Handle one Telegram update.
///
/// Anything after authentication and parsing answers 200, since Telegram
/// redelivers on other statuses and a failed update would be retried forever.
async fn telegram_webhook(
    State(state): State<AppState>,
    Path(token): Path<String>,
    body: Bytes,
) -> impl IntoResponse {
    if !state.channel.token_matches(&token) {
        tracing::warn!("Telegram webhook called with an invalid token");
        return webhook_reply(
            StatusCode::UNAUTHORIZED,
            json!({ "ok": false, "error": "invalid token" }),
        );
    }

    if body.is_empty() {
        return webhook_reply(
            StatusCode::BAD_REQUEST,
            json!({ "ok": false, "error": "empty body" }),
        );
    }

    let update: Value = match serde_json::from_slice(&body) {
        Ok(update) => update,
        Err(e) => {
            tracing::warn!("Telegram webhook received malformed JSON: {e}");
            return webhook_reply(
                StatusCode::BAD_REQUEST,
                json!({ "ok": false, "error": "invalid JSON" }),
            );
        }
    };

    let Some(event) = state.channel.accept_update(&update) else {
        tracing::debug!("Telegram update ignored");
        return webhook_reply(StatusCode::OK, json!({ "ok": true, "handled": false }));
    };

    // Failures are logged inside the handler span.
    let handled = state.handler.handle(event).await.is_ok();
    webhook_reply(StatusCode::OK, json!({ "ok": true, "handled": handled }))
}
