//! Observability for the connection manager
//!
//! Structured logging through `tracing` and a process-wide metrics collector.

pub mod logging;
pub mod metrics;

// Re-export for convenience
pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{metrics, MetricsCollector, MetricsSnapshot};

// Span macros for structured logging
pub use logging::{connection_span, throttle_span};
