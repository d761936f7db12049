//! Testing utilities
//!
//! An in-process broker for exercising the messaging layer without RabbitMQ.
//!
//! ```
//! use std::sync::Arc;
//! use serde_json::json;
//! use swarmq::testing::MemoryBroker;
//! use swarmq::{Agent, MessageEnvelope, SwarmClient, SwarmConfig};
//!
//! # tokio_test::block_on(async {
//! let broker = MemoryBroker::new();
//! let client = SwarmClient::with_broker(SwarmConfig::default(), Arc::new(broker.clone())).unwrap();
//! client.connect().await.unwrap();
//! client.register(Agent::new("Agent A", "Receiver")).await.unwrap();
//!
//! client
//!     .publish("Agent A", MessageEnvelope::new(json!("hello")))
//!     .await
//!     .unwrap();
//! assert_eq!(broker.queue_depth("agent_agent_a_queue"), Some(1));
//! # client.shutdown().await.unwrap();
//! # });
//! ```

pub mod memory_broker;

pub use memory_broker::{MemoryBroker, MemoryChannel, MemoryConnection};
