//! Error types for the relay.

use thiserror::Error;

/// Result type alias using the relay error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for relay services.
#[derive(Error, Debug)]
pub enum Error {
    /// The durable store could not be reached or failed mid-operation.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// A stored record could not be decoded.
    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    /// A create-only write hit an existing key.
    #[error("Write conflict: {0}")]
    Conflict(String),

    /// The shared default credential has been used up for this conversation.
    #[error("Default credential quota exhausted ({used}/{limit})")]
    QuotaExhausted { used: u64, limit: u64 },

    /// Neither an override nor a shared default credential is available.
    #[error("No credential available")]
    NoCredential,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input or request
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// External service error
    #[error("External service error: {0}")]
    External(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create an error with additional context.
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, with any context layers peeled off.
    pub fn root(&self) -> &Error {
        match self {
            Self::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether retrying the whole request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self.root(), Self::StoreUnavailable(_) | Self::Conflict(_))
    }

    /// Whether this is an expected condition to report to the user rather than a fault.
    pub fn is_user_facing(&self) -> bool {
        matches!(self.root(), Self::QuotaExhausted { .. } | Self::NoCredential)
    }

    /// Get HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidInput(_) | Self::MalformedRecord(_) => 400,
            Self::NoCredential => 401,
            Self::Conflict(_) => 409,
            Self::QuotaExhausted { .. } => 429,
            Self::StoreUnavailable(_) => 503,
            Self::External(_) => 502,
            Self::WithContext { source, .. } => source.status_code(),
            _ => 500,
        }
    }
}

/// Extension trait for adding context to any error type.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(context))
    }
}
