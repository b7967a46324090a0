//! Logging setup for chatlink
//!
//! One `tracing` subscriber, configured from the environment:
//!
//! | Variable     | Values                                | Default   |
//! |--------------|---------------------------------------|-----------|
//! | `LOG_LEVEL`  | ERROR, WARN, INFO, DEBUG, TRACE       | INFO      |
//! | `LOG_FORMAT` | json, pretty, compact                 | json      |
//! | `LOG_SPANS`  | true, false (emit span open/close)    | false     |
//! | `RUST_LOG`   | any `EnvFilter` directive string      | unset     |
//!
//! When `RUST_LOG` is set it replaces the level and the dependency quieting.
//! Reconnect decisions are logged at DEBUG inside a `connection` span, so
//! `LOG_FORMAT=compact LOG_LEVEL=DEBUG chatlink run` shows each attempt with
//! its epoch generation.

use std::env;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Dependencies that are noisy below WARN
const QUIET_DEPENDENCIES: &[&str] = &["tokio=warn", "tungstenite=warn", "tokio_tungstenite=warn"];

/// Subscriber output format
#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    /// One JSON object per event
    Json,
    /// Multi-line, colored
    Pretty,
    /// Single-line, colored, no targets
    Compact,
}

impl LogFormat {
    /// Unknown names fall back to JSON
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Parse a `LOG_LEVEL` value, falling back to INFO
pub fn parse_level(s: &str) -> Level {
    match s.to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "INFO" => Level::INFO,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

fn build_filter(level: Level) -> EnvFilter {
    // Allow RUST_LOG to override
    if let Ok(rust_log) = env::var("RUST_LOG") {
        return EnvFilter::new(rust_log);
    }

    QUIET_DEPENDENCIES
        .iter()
        .filter_map(|directive| directive.parse().ok())
        .fold(EnvFilter::new(level.to_string()), EnvFilter::add_directive)
}

fn span_events(include_spans: bool) -> FmtSpan {
    if include_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    }
}

/// Install the global subscriber
///
/// Only the first call in a process takes effect.
pub fn init_logging(level: Level, format: LogFormat, include_spans: bool) {
    let subscriber = tracing_subscriber::registry().with(build_filter(level));

    let result = match format {
        LogFormat::Json => subscriber
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
        LogFormat::Pretty => subscriber
            .with(
                fmt::layer()
                    .pretty()
                    .with_ansi(true)
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
        LogFormat::Compact => subscriber
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
    };

    if result.is_err() {
        tracing::debug!("Global subscriber already installed");
    }
}

/// Install the global subscriber from `LOG_LEVEL`, `LOG_FORMAT` and `LOG_SPANS`
pub fn init_default_logging() {
    let level = parse_level(&env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()));

    let format = env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string());
    let log_format = LogFormat::parse(&format);

    let include_spans = env::var("LOG_SPANS")
        .unwrap_or_else(|_| "false".to_string())
        .to_lowercase()
        == "true";

    init_logging(level, log_format, include_spans);
}

/// Create a connection lifecycle span (open, close, reconnect)
#[macro_export]
macro_rules! connection_span {
    ($($field:tt)*) => {
        tracing::info_span!("connection", $($field)*)
    };
}

/// Create a throttle dispatch span
#[macro_export]
macro_rules! throttle_span {
    ($($field:tt)*) => {
        tracing::info_span!("throttle", $($field)*)
    };
}

pub use {connection_span, throttle_span};
