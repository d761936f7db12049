//! swarmq - reliable messaging between independently defined agents
//!
//! Agents exchange JSON envelopes through durable queues on an AMQP broker.
//! The crate provides the messaging layer only; what an agent does with a
//! message is left to the caller's [`MessageHandler`].
//!
//! # Overview
//!
//! - [`ConnectionManager`]: owns the broker connection, reconnects with backoff
//! - [`AgentRegistry`]: maps agent names onto durable queues and routing keys
//! - [`Publisher`]: confirmed, persistent publishes to an agent's queue
//! - [`ConsumerSupervisor`]: one supervised consumer task per agent with
//!   bounded handler retries and a poison-message policy
//! - [`QueueMonitor`]: passive queue depth and consumer counts
//! - [`SwarmClient`]: one context object owning all of the above
//!
//! # Quick Start
//!
//! ```rust
//! use serde_json::json;
//! use swarmq::{normalize_agent_name, queue_name, routing_key, MessageEnvelope};
//!
//! assert_eq!(normalize_agent_name("  Agent   A "), "agent_a");
//! assert_eq!(queue_name("Agent A"), "agent_agent_a_queue");
//! assert_eq!(routing_key("Agent A"), "agent.agent_a");
//!
//! let envelope = MessageEnvelope::new(json!("hello"))
//!     .with_context_value("k", json!(1))
//!     .routed_to("Agent A");
//! let wire = envelope.to_bytes().unwrap();
//! assert_eq!(MessageEnvelope::from_slice(&wire).unwrap(), envelope);
//! ```

pub mod agent;
pub mod client;
pub mod config;
pub mod error;
pub mod messaging;
pub mod observability;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use agent::{Agent, AgentRegistry, QueueDisposal, RegisteredAgent};
pub use client::{RunResponse, RunStatus, SwarmClient};
pub use config::{ConfigError, SwarmConfig};
pub use error::{SwarmError, SwarmResult};
pub use messaging::{
    ConsumerEvent, ConsumerOptions, ConsumerState, ConsumerSupervisor, Disposition,
    HandlerResult, MessageHandler, PoisonPolicy, PublishReceipt, Publisher, QueueHealth,
    QueueMonitor, QueueStatus, StatusReport,
};
pub use protocol::*;
pub use transport::{BackoffPolicy, BoxError, ConnectionManager, ConnectionState};
