//! Broker collaborator interface
//!
//! The messaging layer never talks to a broker library directly. It drives the
//! three traits below, which the AMQP implementation ([`amqp`]) and the
//! in-process [`MemoryBroker`](crate::testing::MemoryBroker) both provide.
//!
//! ```text
//! Broker ──connect──▶ BrokerConnection ──open_channel──▶ BrokerChannel
//! ```

use futures::stream::BoxStream;
use std::sync::Arc;
use thiserror::Error;

pub mod amqp;
pub mod backoff;
pub mod connection;

pub use backoff::{BackoffPolicy, RetryDecision};
pub use connection::{ConnectionManager, ConnectionState};

/// Boxed error used where a collaborator's concrete error type is erased
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Callback fired by a connection when the transport closes underneath it
pub type CloseCallback = Box<dyn Fn(String) + Send + Sync>;

/// Stream of deliveries for one consumer registration
pub type DeliveryStream = BoxStream<'static, Result<RawDelivery, BrokerError>>;

/// Errors reported by broker primitives
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Connection failed")]
    ConnectionFailed(#[source] BoxError),
    #[error("Channel closed: {0}")]
    ChannelClosed(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("Message returned as unroutable: exchange {exchange}, routing key {routing_key}")]
    Unroutable {
        exchange: String,
        routing_key: String,
    },
    #[error("Broker negatively acknowledged the publish")]
    Nacked,
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl BrokerError {
    pub fn connection_failed<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::ConnectionFailed(Box::new(error))
    }

    /// Render the error together with its source chain
    pub fn detail(&self) -> String {
        let mut text = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            text.push_str(": ");
            text.push_str(&cause.to_string());
            source = cause.source();
        }
        text
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Topic,
    Direct,
    Fanout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl ExchangeSpec {
    pub fn durable_topic<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Topic,
            durable: true,
        }
    }
}

/// Queue declaration parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
    /// Exchange that receives messages rejected without requeue
    pub dead_letter_exchange: Option<String>,
}

impl QueueSpec {
    /// Durable, never auto-deleted
    pub fn durable<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            durable: true,
            auto_delete: false,
            dead_letter_exchange: None,
        }
    }

    pub fn with_dead_letter_exchange<S: Into<String>>(mut self, exchange: S) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }
}

/// Passive queue metadata as reported by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    /// Messages ready for delivery
    pub message_count: u32,
    pub consumer_count: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    /// Persist to disk on the broker (delivery mode 2)
    pub persistent: bool,
    /// Ask the broker to return the message if no queue is bound
    pub mandatory: bool,
    pub message_id: Option<String>,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawDelivery {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub redelivered: bool,
    pub payload: Vec<u8>,
}

/// Entry point into a broker
#[async_trait::async_trait]
pub trait Broker: Send + Sync {
    /// Human-readable target for logs; must not contain credentials
    fn describe(&self) -> String;

    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

#[async_trait::async_trait]
pub trait BrokerConnection: Send + Sync {
    fn is_open(&self) -> bool;

    /// Register a callback fired once when the connection closes unexpectedly
    fn on_close(&self, callback: CloseCallback);

    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait::async_trait]
pub trait BrokerChannel: Send + Sync {
    fn is_open(&self) -> bool;

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError>;

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<QueueInfo, BrokerError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Passive declare: report metadata without creating or altering the queue
    async fn inspect_queue(&self, queue: &str) -> Result<QueueInfo, BrokerError>;

    /// Delete a queue, returning the number of messages dropped with it
    async fn delete_queue(&self, queue: &str, if_empty: bool) -> Result<u32, BrokerError>;

    /// Publish and wait for the broker's confirmation
    async fn publish(&self, message: OutboundMessage) -> Result<(), BrokerError>;

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError>;

    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, BrokerError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_durable_queue_spec() {
        let spec = QueueSpec::durable("agent_a_queue");
        assert!(spec.durable);
        assert!(!spec.auto_delete);
        assert_eq!(spec.dead_letter_exchange, None);

        let spec = spec.with_dead_letter_exchange("agent_dead_letter");
        assert_eq!(spec.dead_letter_exchange.as_deref(), Some("agent_dead_letter"));
    }

    #[test]
    fn test_broker_error_detail_includes_source() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let error = BrokerError::connection_failed(io);
        assert_eq!(error.detail(), "Connection failed: refused");
    }

    #[test]
    fn test_broker_error_display() {
        let errors = vec![
            BrokerError::ChannelClosed("gone".to_string()),
            BrokerError::NotFound("queue".to_string()),
            BrokerError::PreconditionFailed("not empty".to_string()),
            BrokerError::Unroutable {
                exchange: "agent_exchange".to_string(),
                routing_key: "agent.x".to_string(),
            },
            BrokerError::Nacked,
            BrokerError::Protocol("frame".to_string()),
        ];

        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }
}
