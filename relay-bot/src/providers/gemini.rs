//! Google Gemini provider.
//!
//! Talks to the Generative Language REST API. The API key travels in the
//! `x-goog-api-key` header so it never ends up in logged URLs.

use super::{
    curate_models, GenerationError, GenerationErrorKind, GenerationRequest, Generator, HelpLink,
    InputPart, ModelInfo,
};
use async_trait::async_trait;
use base64::Engine;
use relay_common::GeminiConfig;
use relay_core::{ContentPart, Role, Turn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};

const API_KEY_HEADER: &str = "x-goog-api-key";
const HELP_TYPE: &str = "type.googleapis.com/google.rpc.Help";
const BAD_REQUEST_TYPE: &str = "type.googleapis.com/google.rpc.BadRequest";
const MAX_MODEL_PAGES: usize = 10;

pub struct GeminiProvider {
    api_base: String,
    client: Client,
}

// ══════════════════════════════════════════════════════════════════════════════
// API REQUEST/RESPONSE TYPES
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<Content>,
}

#[derive(Debug, Serialize)]
struct Content {
    role: &'static str,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Part {
    Text {
        text: String,
    },
    Inline {
        #[serde(rename = "inlineData")]
        inline_data: Blob,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Blob {
    mime_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponsePart {
    text: Option<String>,
    function_call: Option<FunctionCall>,
    function_response: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListModelsResponse {
    #[serde(default)]
    models: Vec<ApiModel>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiModel {
    name: String,
    display_name: Option<String>,
    description: Option<String>,
    input_token_limit: Option<u64>,
    output_token_limit: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Default, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
    status: Option<String>,
    #[serde(default)]
    details: Vec<Value>,
}

impl From<ApiModel> for ModelInfo {
    fn from(m: ApiModel) -> Self {
        Self {
            name: m.name,
            display_name: m.display_name,
            description: m.description,
            input_token_limit: m.input_token_limit,
            output_token_limit: m.output_token_limit,
        }
    }
}

impl GeminiProvider {
    pub fn new(api_base: impl Into<String>, timeout: Duration) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            client: Client::builder()
                .timeout(timeout)
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    pub fn from_config(config: &GeminiConfig) -> Self {
        Self::new(config.api_base.clone(), Duration::from_secs(config.timeout_secs))
    }

    fn generate_url(&self, model: &str) -> String {
        format!("{}/v1beta/{}:generateContent", self.api_base, normalize_model(model))
    }

    fn models_url(&self) -> String {
        format!("{}/v1beta/models", self.api_base)
    }
}

/// Model ids always carry the `models/` prefix on the wire.
pub(crate) fn normalize_model(model: &str) -> String {
    if model.starts_with("models/") || model.starts_with("tunedModels/") {
        model.to_string()
    } else {
        format!("models/{model}")
    }
}

fn history_content(turn: &Turn) -> Content {
    Content {
        role: turn.role.as_str(),
        parts: turn
            .parts
            .iter()
            .map(|p| Part::Text { text: p.replay_text() })
            .collect(),
    }
}

fn input_content(input: Vec<InputPart>) -> Content {
    let engine = base64::engine::general_purpose::STANDARD;
    Content {
        role: Role::User.as_str(),
        parts: input
            .into_iter()
            .map(|part| match part {
                InputPart::Text(text) => Part::Text { text },
                InputPart::Image { mime_type, data } => Part::Inline {
                    inline_data: Blob {
                        mime_type,
                        data: engine.encode(data),
                    },
                },
            })
            .collect(),
    }
}

/// Map an HTTP failure to an error kind, pulling help links and safety
/// reasons out of the error details.
fn classify_failure(model: &str, status: u16, body: &str) -> GenerationError {
    let api_error = serde_json::from_str::<ErrorEnvelope>(body)
        .map(|e| e.error)
        .unwrap_or_default();
    let message = if api_error.message.is_empty() {
        body.chars().take(300).collect()
    } else {
        api_error.message.clone()
    };

    let kind = match status {
        404 => GenerationErrorKind::ModelNotFound,
        429 => GenerationErrorKind::QuotaExceeded {
            help: help_link(&api_error.details),
        },
        400 if is_blocked(&api_error) => GenerationErrorKind::Blocked {
            reasons: violation_reasons(&api_error.details),
        },
        401 | 403 => GenerationErrorKind::PermissionDenied,
        500..=599 => GenerationErrorKind::Server,
        _ => GenerationErrorKind::BadRequest,
    };

    GenerationError::new(kind, model, message).with_status(status)
}

fn is_blocked(error: &ApiError) -> bool {
    let lower = error.message.to_lowercase();
    error.status.as_deref() == Some("BLOCKED") || lower.contains("blocked") || lower.contains("safety")
}

fn help_link(details: &[Value]) -> Option<HelpLink> {
    details
        .iter()
        .filter(|d| d.get("@type").and_then(Value::as_str) == Some(HELP_TYPE))
        .filter_map(|d| d.get("links").and_then(Value::as_array))
        .flatten()
        .find_map(|link| {
            let description = link.get("description")?.as_str()?;
            let url = link.get("url")?.as_str()?;
            Some(HelpLink {
                description: description.to_string(),
                url: url.to_string(),
            })
        })
}

fn violation_reasons(details: &[Value]) -> Vec<String> {
    details
        .iter()
        .filter(|d| d.get("@type").and_then(Value::as_str) == Some(BAD_REQUEST_TYPE))
        .filter_map(|d| d.get("fieldViolations").and_then(Value::as_array))
        .flatten()
        .filter_map(|v| {
            v.get("description")
                .or_else(|| v.get("field"))
                .and_then(Value::as_str)
                .map(String::from)
        })
        .collect()
}

/// Turn a successful response into reply parts, describing non-text replies.
fn reply_parts(model: &str, response: GenerateContentResponse) -> Result<Vec<ContentPart>, GenerationError> {
    if response.candidates.is_empty() {
        if let Some(reason) = response.prompt_feedback.and_then(|f| f.block_reason) {
            return Err(GenerationError::new(
                GenerationErrorKind::Blocked { reasons: vec![reason.clone()] },
                model,
                format!("prompt blocked: {reason}"),
            ));
        }
        return Ok(vec![ContentPart::text("Could not get a valid response from the model.")]);
    }

    let parts: Vec<&ResponsePart> = response
        .candidates
        .iter()
        .filter_map(|c| c.content.as_ref())
        .flat_map(|c| c.parts.iter())
        .collect();

    let text: String = parts.iter().filter_map(|p| p.text.as_deref()).collect();
    if !text.is_empty() {
        return Ok(vec![ContentPart::text(text)]);
    }

    let calls: Vec<String> = parts
        .iter()
        .filter_map(|p| p.function_call.as_ref())
        .map(|call| {
            let args = call.args.as_ref().map(Value::to_string).unwrap_or_default();
            format!("- `{}`(`{args}`)", call.name)
        })
        .collect();
    if !calls.is_empty() {
        return Ok(vec![ContentPart::text(format!(
            "Model wants to call a function:\n{}",
            calls.join("\n")
        ))]);
    }

    if parts.iter().any(|p| p.function_response.is_some()) {
        return Ok(vec![ContentPart::text("Model received a function response.")]);
    }

    let finish = response
        .candidates
        .iter()
        .find_map(|c| c.finish_reason.as_deref())
        .unwrap_or("UNKNOWN");
    if finish == "SAFETY" {
        return Err(GenerationError::new(
            GenerationErrorKind::Blocked { reasons: vec![] },
            model,
            "response blocked: SAFETY",
        ));
    }
    tracing::warn!(model, finish_reason = finish, "Response had no usable parts");
    Ok(vec![ContentPart::text(
        "Received a non-text response without recognizable parts.",
    )])
}

fn transport_error(model: &str, e: &reqwest::Error) -> GenerationError {
    GenerationError::new(GenerationErrorKind::Transport, model, format!("Request failed: {e}"))
}

#[async_trait]
impl Generator for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn generate(&self, request: GenerationRequest) -> Result<Vec<ContentPart>, GenerationError> {
        let start = Instant::now();
        let model = normalize_model(&request.model);

        let mut contents: Vec<Content> = request.history.iter().map(history_content).collect();
        contents.push(input_content(request.input));
        let body = GenerateContentRequest { contents };

        let response = self
            .client
            .post(self.generate_url(&model))
            .header(API_KEY_HEADER, &request.credential)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(&model, &e))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            let err = classify_failure(&model, status.as_u16(), &error_text);
            tracing::warn!(
                model = %model,
                status = status.as_u16(),
                kind = ?err.kind,
                "Gemini generateContent failed"
            );
            return Err(err);
        }

        let parsed: GenerateContentResponse = response.json().await.map_err(|e| {
            GenerationError::new(
                GenerationErrorKind::Transport,
                &model,
                format!("Failed to parse response: {e}"),
            )
        })?;

        let parts = reply_parts(&model, parsed)?;
        tracing::info!(
            model = %model,
            history_turns = body.contents.len() - 1,
            latency_ms = start.elapsed().as_millis() as u64,
            "Gemini reply received"
        );
        Ok(parts)
    }

    async fn list_models(&self, credential: &str) -> Result<Vec<ModelInfo>, GenerationError> {
        let mut models = Vec::new();
        let mut page_token: Option<String> = None;

        for _ in 0..MAX_MODEL_PAGES {
            let mut query = vec![("pageSize", "1000".to_string())];
            if let Some(token) = &page_token {
                query.push(("pageToken", token.clone()));
            }

            let response = self
                .client
                .get(self.models_url())
                .header(API_KEY_HEADER, credential)
                .query(&query)
                .send()
                .await
                .map_err(|e| transport_error("models", &e))?;

            let status = response.status();
            if !status.is_success() {
                let error_text = response.text().await.unwrap_or_default();
                return Err(classify_failure("models", status.as_u16(), &error_text));
            }

            let page: ListModelsResponse = response.json().await.map_err(|e| {
                GenerationError::new(
                    GenerationErrorKind::Transport,
                    "models",
                    format!("Failed to parse model list: {e}"),
                )
            })?;
            models.extend(page.models.into_iter().map(ModelInfo::from));

            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        let curated = curate_models(models);
        tracing::debug!(count = curated.len(), "Listed models");
        Ok(curated)
    }
}
