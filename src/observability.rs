//! Logging setup and span helpers.
//!
//! Logs always go to stderr so a binary's stdout carries only its JSON
//! report.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per event.
    Json,
    /// Compact human-readable lines.
    #[default]
    Text,
}

/// Install the global subscriber. `RUST_LOG` overrides the default `info`
/// filter. Later calls are no-ops, as are calls after another subscriber has
/// already been installed.
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let installed = match format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .try_init(),
            LogFormat::Text => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .try_init(),
        };
        if installed.is_err() {
            tracing::debug!("global subscriber already installed");
        }
    });
}

/// Span covering one sync run.
#[must_use]
pub fn sync_span(source: &str, root: &str) -> Span {
    tracing::info_span!("sync", source = source, root = root)
}

/// Span covering one validation pass.
#[must_use]
pub fn validate_span(root: &str) -> Span {
    tracing::info_span!("validate", root = root)
}
