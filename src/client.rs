//! `SwarmClient`: one messaging context owning every component
//!
//! A process may hold several independent clients; nothing here is global.
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use swarmq::{Agent, InboundMessage, SwarmClient, SwarmConfig};
//!
//! # async fn demo() -> swarmq::SwarmResult<()> {
//! let client = SwarmClient::new(SwarmConfig::default())?;
//! client.connect().await?;
//! client.register(Agent::new("Agent A", "Sender")).await?;
//! client.register(Agent::new("Agent B", "Receiver")).await?;
//!
//! client
//!     .start_consumer(
//!         "Agent B",
//!         Arc::new(|message: InboundMessage| async move {
//!             println!("got {}", message.content());
//!             Ok::<(), swarmq::BoxError>(())
//!         }),
//!     )
//!     .await?;
//!
//! let messages = vec![json!({"role": "user", "content": "I want to talk to agent B."})];
//! client.handoff("Agent A", "Agent B", messages, Default::default()).await?;
//! client.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use crate::agent::{Agent, AgentRegistry, QueueDisposal, RegisteredAgent};
use crate::config::SwarmConfig;
use crate::error::SwarmResult;
use crate::messaging::{
    ConsumerEvent, ConsumerOptions, ConsumerState, ConsumerSupervisor, MessageHandler,
    PublishReceipt, Publisher, QueueMonitor, StatusReport,
};
use crate::observability::{MessagingMetrics, MetricsSnapshot};
use crate::protocol::{InboundMessage, MessageEnvelope};
use crate::transport::amqp::AmqpBroker;
use crate::transport::{Broker, ConnectionManager, ConnectionState, ExchangeSpec};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::info;

/// Outcome of [`SwarmClient::run`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunResponse {
    pub agent: String,
    pub status: RunStatus,
    pub message_count: usize,
    /// Text of the last message sent, empty when none was
    pub final_message: String,
    pub context: Map<String, Value>,
    pub message_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Confirmed by the broker and waiting in the agent's queue
    Queued,
}

pub struct SwarmClient {
    config: SwarmConfig,
    metrics: Arc<MessagingMetrics>,
    connection: Arc<ConnectionManager>,
    registry: Arc<AgentRegistry>,
    publisher: Publisher,
    consumers: ConsumerSupervisor,
    monitor: QueueMonitor,
}

impl SwarmClient {
    /// Client for the RabbitMQ broker named in `config`. Nothing is contacted
    /// until [`Self::connect`].
    pub fn new(config: SwarmConfig) -> SwarmResult<Self> {
        config.validate()?;
        let broker = AmqpBroker::from_config(&config.broker)?;
        Self::with_broker(config, Arc::new(broker))
    }

    /// Client over any broker implementation
    pub fn with_broker(config: SwarmConfig, broker: Arc<dyn Broker>) -> SwarmResult<Self> {
        config.validate()?;
        let metrics = Arc::new(MessagingMetrics::new());
        let connection = ConnectionManager::new(
            broker,
            config.broker.reconnect.clone(),
            vec![ExchangeSpec::durable_topic(&config.exchange.name)],
            metrics.clone(),
        );
        let registry = Arc::new(AgentRegistry::new(
            connection.clone(),
            config.exchange.name.clone(),
            config.dead_letter_exchange().map(str::to_string),
        ));

        Ok(Self {
            publisher: Publisher::new(
                connection.clone(),
                registry.clone(),
                config.confirm_timeout(),
                metrics.clone(),
            ),
            consumers: ConsumerSupervisor::new(
                connection.clone(),
                registry.clone(),
                metrics.clone(),
            ),
            monitor: QueueMonitor::new(connection.clone(), registry.clone()),
            config,
            metrics,
            connection,
            registry,
        })
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.config
    }

    /// Connect and register every agent listed in the configuration
    pub async fn connect(&self) -> SwarmResult<()> {
        self.connection.connect().await?;
        for agent in &self.config.agents {
            self.registry.register(agent.clone()).await?;
        }
        info!(
            "Client connected with {} configured agent(s)",
            self.config.agents.len()
        );
        Ok(())
    }

    pub async fn register(&self, agent: Agent) -> SwarmResult<RegisteredAgent> {
        self.registry.register(agent).await
    }

    pub fn resolve(&self, agent_name: &str) -> SwarmResult<RegisteredAgent> {
        self.registry.resolve(agent_name)
    }

    pub fn agents(&self) -> Vec<RegisteredAgent> {
        self.registry.agents()
    }

    /// Stop the agent's consumer, then remove it from the registry
    pub async fn deregister(&self, agent_name: &str, disposal: QueueDisposal) -> SwarmResult<u32> {
        self.consumers.stop(agent_name).await?;
        self.registry.deregister(agent_name, disposal).await
    }

    pub async fn publish(
        &self,
        agent_name: &str,
        envelope: MessageEnvelope,
    ) -> SwarmResult<PublishReceipt> {
        self.publisher.publish(agent_name, envelope).await
    }

    /// Answer an inbound message through its sender's queue
    pub async fn reply(&self, inbound: &InboundMessage, content: Value) -> SwarmResult<PublishReceipt> {
        self.publisher.reply(inbound, content).await
    }

    /// Send a batch of conversation messages to an agent
    pub async fn run(
        &self,
        agent_name: &str,
        messages: Vec<Value>,
        context: Map<String, Value>,
    ) -> SwarmResult<RunResponse> {
        let message_count = messages.len();
        let final_message = messages.last().map(message_text).unwrap_or_default();

        let envelope = conversation(messages, context.clone());
        let receipt = self.publisher.publish(agent_name, envelope).await?;
        info!(
            "Run for agent '{}' queued {} message(s) as {}",
            receipt.agent, message_count, receipt.message_id
        );

        Ok(RunResponse {
            agent: receipt.agent,
            status: RunStatus::Queued,
            message_count,
            final_message,
            context,
            message_id: receipt.message_id,
        })
    }

    /// Pass a conversation from `sender` to `receiver`. The receiver's
    /// replies go back to the sender's queue.
    pub async fn handoff(
        &self,
        sender: &str,
        receiver: &str,
        messages: Vec<Value>,
        context: Map<String, Value>,
    ) -> SwarmResult<PublishReceipt> {
        let sender = self.registry.resolve(sender)?;
        let envelope = conversation(messages, context).reply_to(sender.name.clone());
        let receipt = self.publisher.publish(receiver, envelope).await?;
        info!("Handoff from '{}' to '{}'", sender.name, receipt.agent);
        Ok(receipt)
    }

    /// Start consuming with the configured consumer options
    pub async fn start_consumer(
        &self,
        agent_name: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> SwarmResult<watch::Receiver<ConsumerState>> {
        self.consumers
            .start(agent_name, handler, self.config.consumer.clone())
            .await
    }

    pub async fn start_consumer_with(
        &self,
        agent_name: &str,
        handler: Arc<dyn MessageHandler>,
        options: ConsumerOptions,
    ) -> SwarmResult<watch::Receiver<ConsumerState>> {
        self.consumers.start(agent_name, handler, options).await
    }

    pub async fn stop_consumer(&self, agent_name: &str) -> SwarmResult<()> {
        self.consumers.stop(agent_name).await
    }

    pub fn consumer_state(&self, agent_name: &str) -> Option<ConsumerState> {
        self.consumers.state(agent_name)
    }

    pub fn consumer_events(&self) -> broadcast::Receiver<ConsumerEvent> {
        self.consumers.events()
    }

    /// Queue snapshot for the named agents, or all registered agents
    pub async fn status(&self, agent_names: Option<&[String]>) -> SwarmResult<StatusReport> {
        self.monitor.status(agent_names).await
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Stop every consumer after its in-flight message, then close the connection
    pub async fn shutdown(&self) -> SwarmResult<()> {
        self.consumers.stop_all().await;
        self.connection.disconnect().await
    }
}

fn conversation(messages: Vec<Value>, context: Map<String, Value>) -> MessageEnvelope {
    let mut content = Map::new();
    content.insert("messages".to_string(), Value::Array(messages));
    MessageEnvelope::new(Value::Object(content)).with_context(context)
}

/// `content` of a chat-style message, or the whole value rendered as text
fn message_text(message: &Value) -> String {
    match message.get("content").unwrap_or(message) {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_text() {
        assert_eq!(message_text(&json!({"role": "user", "content": "hi"})), "hi");
        assert_eq!(message_text(&json!({"content": {"x": 1}})), "{\"x\":1}");
        assert_eq!(message_text(&json!("plain")), "plain");
    }

    #[test]
    fn test_conversation_envelope() {
        let mut context = Map::new();
        context.insert("conversation_id".to_string(), json!("test_123"));
        let envelope = conversation(vec![json!({"role": "user", "content": "hi"})], context);

        assert_eq!(envelope.content["messages"][0]["content"], "hi");
        assert_eq!(envelope.context["conversation_id"], "test_123");
        assert!(envelope.reply_to.is_none());
    }

    #[test]
    fn test_run_status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&RunStatus::Queued).unwrap(), "\"queued\"");
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = SwarmConfig::for_broker("http://localhost:5672");
        assert!(SwarmClient::new(config).is_err());
    }
}
