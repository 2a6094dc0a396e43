//! Tracing setup for the relay binary.
//!
//! Events render either as one JSON object per line for log collectors, or
//! as coloured text for a terminal. HTTP, TLS and SQLite internals stay at
//! `warn` under whatever level is configured, unless `RUST_LOG` is set.

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Dependency targets held at `warn`.
pub const NOISY_MODULES: &[&str] = &[
    "hyper",
    "hyper_util",
    "reqwest",
    "h2",
    "rustls",
    "tower_http",
    "rusqlite",
];

/// How log events are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    /// `json` in any case selects JSON. Anything else is pretty.
    pub fn parse(name: &str) -> Self {
        if name.trim().eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Pretty
        }
    }

    fn layer(self) -> Box<dyn Layer<Registry> + Send + Sync> {
        match self {
            // Span close events carry the update's trace id and timing.
            Self::Json => tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_events(FmtSpan::CLOSE)
                .with_file(true)
                .with_line_number(true)
                .boxed(),
            Self::Pretty => tracing_subscriber::fmt::layer()
                .with_ansi(true)
                .with_file(false)
                .with_line_number(false)
                .boxed(),
        }
    }
}

/// `RUST_LOG` if present, else the base level with [`NOISY_MODULES`] quietened.
fn env_or_default_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(log_level)))
}

fn filter_directives(log_level: &str) -> String {
    std::iter::once(log_level.to_string())
        .chain(NOISY_MODULES.iter().map(|module| format!("{module}=warn")))
        .collect::<Vec<_>>()
        .join(",")
}

/// Install the global subscriber. Later calls leave the first one in place.
pub fn init_logging(log_level: &str, log_format: &str) {
    let format = LogFormat::parse(log_format);
    let installed = tracing_subscriber::registry()
        .with(format.layer())
        .with(env_or_default_filter(log_level))
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(log_level = %log_level, ?format, "Tracing subscriber installed");
    }
}

/// Fresh id for following one update through the relay.
pub fn generate_trace_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Span covering the handling of one inbound chat update.
///
/// ```ignore
/// let span = channel_span!("telegram", trace_id, chat_id, kind = "text");
/// async { /* handle update */ }.instrument(span).await;
/// ```
#[macro_export]
macro_rules! channel_span {
    ($channel:expr, $trace_id:expr, $chat_id:expr) => {
        tracing::info_span!(
            "channel_update",
            channel = $channel,
            trace_id = %$trace_id,
            chat_id = %$chat_id
        )
    };
    ($channel:expr, $trace_id:expr, $chat_id:expr, $($field:tt)*) => {
        tracing::info_span!(
            "channel_update",
            channel = $channel,
            trace_id = %$trace_id,
            chat_id = %$chat_id,
            $($field)*
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("json", LogFormat::Json ; "json")]
    #[test_case(" JSON ", LogFormat::Json ; "json any case")]
    #[test_case("pretty", LogFormat::Pretty ; "pretty")]
    #[test_case("", LogFormat::Pretty ; "empty")]
    fn format_names(name: &str, expected: LogFormat) {
        assert_eq!(LogFormat::parse(name), expected);
    }

    #[test]
    fn directives_start_with_base_level() {
        let directives = filter_directives("debug");
        let mut parts = directives.split(',');
        assert_eq!(parts.next(), Some("debug"));
        let quiet: Vec<&str> = parts.collect();
        assert_eq!(quiet.len(), NOISY_MODULES.len());
        assert!(quiet.contains(&"rusqlite=warn"));
        assert!(quiet.contains(&"hyper=warn"));
    }

    #[test]
    fn trace_ids_are_unique_uuids() {
        let first = generate_trace_id();
        assert_ne!(first, generate_trace_id());
        assert!(uuid::Uuid::parse_str(&first).is_ok());
    }

    #[test]
    fn channel_span_accepts_extra_fields() {
        let span = crate::channel_span!("telegram", "trace-1", 42, kind = "text");
        let _enter = span.enter();
        let bare = crate::channel_span!("telegram", "trace-2", 7);
        let _bare = bare.enter();
    }
}
