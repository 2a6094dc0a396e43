//! Generation backends.
//!
//! The relay talks to models through the [`Generator`] trait so handlers can
//! be exercised without a network.

mod gemini;

pub use gemini::GeminiProvider;

use async_trait::async_trait;
use relay_core::{ContentPart, Turn};
use std::fmt;

// ============================================================================
// Generator Trait
// ============================================================================

/// A model backend the relay can generate replies with.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Get the provider name.
    fn name(&self) -> &str;

    /// Generate the model's reply to `request.input` given prior turns.
    async fn generate(&self, request: GenerationRequest) -> Result<Vec<ContentPart>, GenerationError>;

    /// Models the credential may use, curated for chat.
    async fn list_models(&self, credential: &str) -> Result<Vec<ModelInfo>, GenerationError>;

    /// Check that a credential works before storing it.
    async fn validate_credential(&self, credential: &str) -> Result<(), GenerationError> {
        self.list_models(credential).await.map(|_| ())
    }
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// One content part of the new user message. Unlike stored turns, images
/// carry their bytes here.
#[derive(Clone, PartialEq, Eq)]
pub enum InputPart {
    Text(String),
    Image { mime_type: String, data: Vec<u8> },
}

impl fmt::Debug for InputPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Self::Image { mime_type, data } => f
                .debug_struct("Image")
                .field("mime_type", mime_type)
                .field("bytes", &data.len())
                .finish(),
        }
    }
}

#[derive(Clone)]
pub struct GenerationRequest {
    pub model: String,
    pub credential: String,
    /// Prior turns, oldest first.
    pub history: Vec<Turn>,
    pub input: Vec<InputPart>,
}

impl fmt::Debug for GenerationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationRequest")
            .field("model", &self.model)
            .field("history", &self.history.len())
            .field("input", &self.input)
            .finish_non_exhaustive()
    }
}

/// A model as advertised by the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelInfo {
    /// Full id, e.g. `models/gemini-1.5-pro`.
    pub name: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub input_token_limit: Option<u64>,
    pub output_token_limit: Option<u64>,
}

impl ModelInfo {
    /// The id without its `models/` prefix.
    pub fn short_name(&self) -> &str {
        self.name.strip_prefix("models/").unwrap_or(&self.name)
    }
}

/// Chat models offered for selection.
pub const COMMON_MODELS_TO_SHOW: &[&str] = &[
    "gemini-2.5-flash-preview-04-17",
    "gemini-2.5-pro-preview-05-06",
    "gemini-2.0-flash",
    "gemini-2.0-flash-preview-image-generation",
    "gemini-2.0-flash-lite",
    "gemini-1.5-flash",
    "gemini-1.5-flash-latest",
    "gemini-1.5-flash-8b",
    "gemini-1.5-pro",
    "gemini-1.5-pro-latest",
    "veo-2.0-generate-001",
    "gemini-1.0-pro",
    "gemini-pro",
];

/// Keep curated chat models only, sorted by name.
pub fn curate_models(models: Vec<ModelInfo>) -> Vec<ModelInfo> {
    let mut kept: Vec<ModelInfo> = models
        .into_iter()
        .filter(|m| {
            let lower = m.name.to_lowercase();
            let base = m.name.rsplit('/').next().unwrap_or(&m.name);
            !m.name.is_empty()
                && COMMON_MODELS_TO_SHOW.contains(&base)
                && !lower.contains("embedding")
                && !lower.contains("aqa")
                && !m.name.starts_with("tunedModels/")
        })
        .collect();
    kept.sort_by(|a, b| a.name.cmp(&b.name));
    kept
}

// ============================================================================
// Errors
// ============================================================================

/// A link from the backend's error details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelpLink {
    pub description: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationErrorKind {
    ModelNotFound,
    QuotaExceeded { help: Option<HelpLink> },
    Blocked { reasons: Vec<String> },
    BadRequest,
    PermissionDenied,
    Server,
    Transport,
}

/// Error from a generation backend.
#[derive(Debug, Clone, thiserror::Error)]
#[error("[{model}] {message}")]
pub struct GenerationError {
    pub kind: GenerationErrorKind,
    pub model: String,
    pub message: String,
    pub status_code: Option<u16>,
}

impl GenerationError {
    pub fn new(kind: GenerationErrorKind, model: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            model: model.into(),
            message: message.into(),
            status_code: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    /// Whether the backend complained about the size of the conversation.
    pub fn mentions_context_limit(&self) -> bool {
        let upper = self.message.to_uppercase();
        upper.contains("LENGTH") || upper.contains("CONTEXT") || upper.contains("TOO_LARGE")
    }
}

impl From<GenerationError> for relay_common::Error {
    fn from(err: GenerationError) -> Self {
        relay_common::Error::External(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(name: &str) -> ModelInfo {
        ModelInfo {
            name: name.into(),
            ..ModelInfo::default()
        }
    }

    #[test]
    fn curation_keeps_listed_chat_models_sorted() {
        let curated = curate_models(vec![
            model("models/gemini-1.5-pro"),
            model("models/text-embedding-004"),
            model("models/aqa"),
            model("tunedModels/gemini-1.5-flash"),
            model("models/gemini-1.5-flash"),
            model("models/gemini-exp-1206"),
        ]);
        let names: Vec<&str> = curated.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["models/gemini-1.5-flash", "models/gemini-1.5-pro"]);
    }

    #[test]
    fn short_name_strips_prefix() {
        assert_eq!(model("models/gemini-pro").short_name(), "gemini-pro");
        assert_eq!(model("gemini-pro").short_name(), "gemini-pro");
    }

    #[test]
    fn context_limit_detection() {
        let err = GenerationError::new(
            GenerationErrorKind::Blocked { reasons: vec![] },
            "m",
            "Request payload TOO_LARGE",
        );
        assert!(err.mentions_context_limit());
        let err = GenerationError::new(GenerationErrorKind::BadRequest, "m", "bad field");
        assert!(!err.mentions_context_limit());
    }

    #[test]
    fn input_debug_hides_bytes() {
        let part = InputPart::Image {
            mime_type: "image/png".into(),
            data: vec![0; 2048],
        };
        assert_eq!(format!("{part:?}"), "Image { mime_type: \"image/png\", bytes: 2048 }");
    }
}
