//! Error taxonomy for the swarmq messaging layer
//!
//! Every caller-visible failure maps onto one of the variants below. Broker
//! primitives report [`BrokerError`](crate::transport::BrokerError); each
//! component converts those into a `SwarmError` at its own boundary.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

static SECRET_PAIR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|passwd|token|key|secret)[=:]\s*\S+").expect("valid secret regex")
});

static URI_USERINFO: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(amqps?)://[^/\s:@]+:[^/\s@]+@").expect("valid userinfo regex")
});

const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// Main error type for swarmq operations
#[derive(Debug, Error)]
pub enum SwarmError {
    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Registration error: {message}")]
    Registration { message: String },

    #[error("Unknown agent: {name}")]
    UnknownAgent { name: String },

    #[error("Publish error: {message}")]
    Publish { message: String },

    #[error("Handler error for agent {agent} after {attempts} attempt(s): {message}")]
    Handler {
        agent: String,
        attempts: u32,
        message: String,
    },

    #[error("Queue {queue} still holds {messages} message(s); force deletion to drop them")]
    QueueNotEmpty { queue: String, messages: u32 },

    #[error("Consumer already running for agent {agent}")]
    ConsumerAlreadyRunning { agent: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl SwarmError {
    /// Create connection error
    pub fn connection<S: AsRef<str>>(message: S) -> Self {
        Self::Connection {
            message: sanitize_error_message(message.as_ref()),
        }
    }

    /// Create registration error
    pub fn registration<S: Into<String>>(message: S) -> Self {
        Self::Registration {
            message: message.into(),
        }
    }

    /// Create unknown agent error
    pub fn unknown_agent<S: Into<String>>(name: S) -> Self {
        Self::UnknownAgent { name: name.into() }
    }

    /// Create publish error
    pub fn publish<S: AsRef<str>>(message: S) -> Self {
        Self::Publish {
            message: sanitize_error_message(message.as_ref()),
        }
    }

    /// Create handler error
    pub fn handler<A: Into<String>, S: AsRef<str>>(agent: A, attempts: u32, message: S) -> Self {
        Self::Handler {
            agent: agent.into(),
            attempts,
            message: sanitize_error_message(message.as_ref()),
        }
    }

    /// True for failures the Connection Manager could not recover from
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }
}

/// Redact credentials and truncate long messages before they reach logs or callers
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = SECRET_PAIR.replace_all(message, "${1}=***").to_string();
    sanitized = URI_USERINFO
        .replace_all(&sanitized, "${1}://***:***@")
        .to_string();

    if sanitized.len() > MAX_ERROR_MESSAGE_LEN {
        let suffix = "...[truncated]";
        let mut cut = MAX_ERROR_MESSAGE_LEN - suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], suffix);
    }

    sanitized
}

/// Result type for swarmq operations
pub type SwarmResult<T> = Result<T, SwarmError>;
