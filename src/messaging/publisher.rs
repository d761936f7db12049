//! Publisher: confirmed, persistent delivery to an agent's queue
//!
//! Publishing never retries. A failure is reported to the caller, who decides
//! whether a second attempt is safe.

use crate::agent::AgentRegistry;
use crate::error::{SwarmError, SwarmResult};
use crate::observability::MessagingMetrics;
use crate::protocol::{InboundMessage, MessageEnvelope};
use crate::transport::{BrokerError, ConnectionManager, OutboundMessage};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn, Instrument};
use uuid::Uuid;

const CONTENT_TYPE_JSON: &str = "application/json";

/// What the broker accepted
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishReceipt {
    pub agent: String,
    pub queue_name: String,
    pub routing_key: String,
    pub message_id: String,
}

pub struct Publisher {
    connection: Arc<ConnectionManager>,
    registry: Arc<AgentRegistry>,
    confirm_timeout: Duration,
    metrics: Arc<MessagingMetrics>,
}

impl Publisher {
    pub fn new(
        connection: Arc<ConnectionManager>,
        registry: Arc<AgentRegistry>,
        confirm_timeout: Duration,
        metrics: Arc<MessagingMetrics>,
    ) -> Self {
        Self {
            connection,
            registry,
            confirm_timeout,
            metrics,
        }
    }

    /// Publish `envelope` to the named agent's queue and wait for the broker's
    /// confirmation. `routing` is stamped with the agent's registered name.
    pub async fn publish(
        &self,
        agent_name: &str,
        mut envelope: MessageEnvelope,
    ) -> SwarmResult<PublishReceipt> {
        let agent = self.registry.resolve(agent_name)?;
        envelope.routing = agent.name.clone();
        let payload = envelope.to_bytes()?;

        let receipt = PublishReceipt {
            agent: agent.name,
            queue_name: agent.queue_name,
            routing_key: agent.routing_key,
            message_id: Uuid::new_v4().to_string(),
        };

        let span = crate::broker_span!(
            operation = "publish",
            agent = %receipt.agent,
            message_id = %receipt.message_id
        );
        match self.send(&receipt, payload).instrument(span).await {
            Ok(()) => {
                self.metrics.message_published();
                debug!(
                    "Published message {} to {} via {}",
                    receipt.message_id, receipt.queue_name, receipt.routing_key
                );
                Ok(receipt)
            }
            Err(e) => {
                self.metrics.publish_failed();
                warn!("Publish to agent '{}' failed: {}", receipt.agent, e);
                Err(e)
            }
        }
    }

    /// Answer an inbound message through the sender's queue (its `reply_to`).
    /// The reply carries the original context and names the replying agent as
    /// its own `reply_to`, so the exchange can continue.
    pub async fn reply(
        &self,
        inbound: &InboundMessage,
        content: Value,
    ) -> SwarmResult<PublishReceipt> {
        let target = inbound.envelope.reply_to.as_deref().ok_or_else(|| {
            SwarmError::publish(format!(
                "message {} for agent '{}' has no reply_to",
                inbound.delivery_tag, inbound.agent
            ))
        })?;

        let envelope = MessageEnvelope::new(content)
            .with_context(inbound.context().clone())
            .reply_to(inbound.agent.clone());
        self.publish(target, envelope).await
    }

    async fn send(&self, receipt: &PublishReceipt, payload: Vec<u8>) -> SwarmResult<()> {
        let channel = self.connection.ensure_connected().await?;
        let message = OutboundMessage {
            exchange: self.registry.exchange().to_string(),
            routing_key: receipt.routing_key.clone(),
            payload,
            persistent: true,
            mandatory: true,
            message_id: Some(receipt.message_id.clone()),
            content_type: Some(CONTENT_TYPE_JSON.to_string()),
        };

        match tokio::time::timeout(self.confirm_timeout, channel.publish(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(BrokerError::Unroutable { exchange, routing_key })) => Err(SwarmError::publish(
                format!(
                    "no queue bound for {routing_key} on {exchange}; queue {} does not exist",
                    receipt.queue_name
                ),
            )),
            Ok(Err(e)) => Err(SwarmError::publish(format!(
                "broker rejected message for {}: {}",
                receipt.queue_name,
                e.detail()
            ))),
            Err(_) => Err(SwarmError::publish(format!(
                "no confirmation from broker within {:?} for {}",
                self.confirm_timeout, receipt.queue_name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;
    use crate::testing::MemoryBroker;
    use crate::transport::{BackoffPolicy, Broker, ExchangeSpec};
    use serde_json::json;

    const EXCHANGE: &str = "agent_exchange";

    struct Fixture {
        broker: MemoryBroker,
        registry: Arc<AgentRegistry>,
        publisher: Publisher,
        metrics: Arc<MessagingMetrics>,
    }

    fn fixture() -> Fixture {
        let broker = MemoryBroker::new();
        let metrics = Arc::new(MessagingMetrics::new());
        let connection = ConnectionManager::new(
            Arc::new(broker.clone()),
            BackoffPolicy::immediate(2),
            vec![ExchangeSpec::durable_topic(EXCHANGE)],
            metrics.clone(),
        );
        let registry = Arc::new(AgentRegistry::new(connection.clone(), EXCHANGE, None));
        let publisher = Publisher::new(
            connection,
            registry.clone(),
            Duration::from_secs(1),
            metrics.clone(),
        );
        Fixture {
            broker,
            registry,
            publisher,
            metrics,
        }
    }

    #[tokio::test]
    async fn test_publish_routes_to_agent_queue() {
        let f = fixture();
        f.registry.register(Agent::new("Agent A", "Receiver")).await.unwrap();

        let envelope = MessageEnvelope::new(json!("hello")).with_context_value("k", json!(1));
        let receipt = f.publisher.publish("agent a", envelope).await.unwrap();

        assert_eq!(receipt.agent, "Agent A");
        assert_eq!(receipt.queue_name, "agent_agent_a_queue");
        assert_eq!(f.broker.queue_depth("agent_agent_a_queue"), Some(1));

        let stored = f.broker.ready_payloads("agent_agent_a_queue");
        let decoded = MessageEnvelope::from_slice(&stored[0]).unwrap();
        assert_eq!(decoded.content, json!("hello"));
        assert_eq!(decoded.context["k"], json!(1));
        assert_eq!(decoded.routing, "Agent A");
        assert_eq!(f.metrics.snapshot().publishing.published, 1);
    }

    #[tokio::test]
    async fn test_publish_to_unknown_agent() {
        let f = fixture();
        let result = f
            .publisher
            .publish("Ghost", MessageEnvelope::new(json!(1)))
            .await;
        assert!(matches!(result, Err(SwarmError::UnknownAgent { .. })));
        assert_eq!(f.broker.published_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_fails_when_queue_deleted_behind_our_back() {
        let f = fixture();
        f.registry.register(Agent::new("Agent A", "Receiver")).await.unwrap();

        let connection = f.broker.connect().await.unwrap();
        let channel = connection.open_channel().await.unwrap();
        channel.delete_queue("agent_agent_a_queue", false).await.unwrap();

        let result = f
            .publisher
            .publish("Agent A", MessageEnvelope::new(json!(1)))
            .await;
        assert!(matches!(result, Err(SwarmError::Publish { .. })));
        assert_eq!(f.metrics.snapshot().publishing.failures, 1);
    }

    #[tokio::test]
    async fn test_nacked_publish_is_a_publish_error() {
        let f = fixture();
        f.registry.register(Agent::new("Agent A", "Receiver")).await.unwrap();
        f.broker.fail_publishes(true);

        let result = f
            .publisher
            .publish("Agent A", MessageEnvelope::new(json!(1)))
            .await;
        assert!(matches!(result, Err(SwarmError::Publish { .. })));
        assert_eq!(f.broker.queue_depth("agent_agent_a_queue"), Some(0));
    }

    #[tokio::test]
    async fn test_reply_goes_to_sender_queue() {
        let f = fixture();
        f.registry.register(Agent::new("Agent A", "Sender")).await.unwrap();
        f.registry.register(Agent::new("Agent B", "Receiver")).await.unwrap();

        let inbound = InboundMessage {
            agent: "Agent B".to_string(),
            envelope: MessageEnvelope::new(json!("question"))
                .with_context_value("conversation", json!("c1"))
                .routed_to("Agent B")
                .reply_to("Agent A"),
            delivery_tag: 1,
            redelivered: false,
            received_at: chrono::Utc::now(),
        };

        f.publisher.reply(&inbound, json!("answer")).await.unwrap();

        let stored = f.broker.ready_payloads("agent_agent_a_queue");
        let reply = MessageEnvelope::from_slice(&stored[0]).unwrap();
        assert_eq!(reply.content, json!("answer"));
        assert_eq!(reply.context["conversation"], json!("c1"));
        assert_eq!(reply.reply_to.as_deref(), Some("Agent B"));
    }

    #[tokio::test]
    async fn test_reply_without_reply_to_fails() {
        let f = fixture();
        let inbound = InboundMessage {
            agent: "Agent B".to_string(),
            envelope: MessageEnvelope::new(json!("question")),
            delivery_tag: 7,
            redelivered: false,
            received_at: chrono::Utc::now(),
        };

        assert!(matches!(
            f.publisher.reply(&inbound, json!("answer")).await,
            Err(SwarmError::Publish { .. })
        ));
    }
}
