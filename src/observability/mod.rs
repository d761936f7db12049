//! Observability: structured logging and per-client messaging metrics

pub mod logging;
pub mod metrics;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};
pub use metrics::{
    ConnectionMetrics, ConsumptionMetrics, LatencySummary, MessagingMetrics, MetricsSnapshot,
    PublishMetrics,
};

// Span macros for structured logging
pub use logging::{broker_span, consumer_span};
