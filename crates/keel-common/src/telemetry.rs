//! Logging initialization
//!
//! Structured logging through `tracing-subscriber`: an `EnvFilter` honouring
//! `RUST_LOG`, and either JSON lines (for log shippers) or human-readable text.

use std::str::FromStr;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::Error;

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "info,keel=debug,kube=info,tower=warn,hyper=warn";

/// Log line format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON lines with the current span attached
    #[default]
    Json,
    /// Human-readable text
    Text,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "text" | "pretty" => Ok(Self::Text),
            other => Err(Error::validation(format!(
                "unknown log format '{other}', expected json or text"
            ))),
        }
    }
}

/// Configuration for logging initialization
#[derive(Debug, Clone, Default)]
pub struct TelemetryConfig {
    /// Output format
    pub format: LogFormat,
    /// Filter directives used when `RUST_LOG` is unset (defaults to [`DEFAULT_FILTER`])
    pub default_filter: Option<String>,
}

/// Install the global tracing subscriber.
///
/// # Example
///
/// ```ignore
/// use keel_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
///
/// init_telemetry(TelemetryConfig { format: LogFormat::Json, ..Default::default() })?;
/// ```
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), Error> {
    let default_filter = config.default_filter.as_deref().unwrap_or(DEFAULT_FILTER);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let (json_layer, text_layer) = match config.format {
        LogFormat::Json => (
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true)
                    .with_file(false)
                    .with_line_number(false),
            ),
            None,
        ),
        LogFormat::Text => (None, Some(tracing_subscriber::fmt::layer().with_target(true))),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .map_err(|e| Error::internal_with_context("telemetry", e.to_string()))?;

    Ok(())
}
