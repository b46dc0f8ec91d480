//! Observability infrastructure for Quire.
//!
//! Structured logging with consistent spans. Every document-level operation
//! runs inside a span carrying the project and document ids so that log lines
//! from the coordinator, the lease manager and the cache can be correlated.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl LogFormat {
    /// Parses a format name (`json` or `pretty`), case-insensitively.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "pretty" | "text" => Some(Self::Pretty),
            _ => None,
        }
    }
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `quire_updater=debug`)
///
/// # Example
///
/// ```rust
/// use quire_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        // try_init: a test harness may already have installed a subscriber.
        let _ = match format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty())
                .try_init(),
        };
    });
}

/// Creates a span for document operations with standard fields.
///
/// # Example
///
/// ```rust
/// use quire_core::observability::doc_span;
///
/// let span = doc_span("apply_update", "project-1", "doc-1");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn doc_span(operation: &str, project_id: &str, doc_id: &str) -> Span {
    tracing::info_span!(
        "doc",
        op = operation,
        project_id = project_id,
        doc_id = doc_id,
    )
}
