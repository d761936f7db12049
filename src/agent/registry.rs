//! Agent Registry
//!
//! Maps agent identity onto its queue and routing key and provisions the
//! queue on the broker at registration time. Entries are keyed by normalized
//! name, so two names that normalize alike can never share a queue silently.

use crate::error::{SwarmError, SwarmResult};
use crate::protocol::{
    dead_letter_queue_name, normalize_agent_name, queue_name, routing_key, validate_agent_name,
};
use crate::transport::{BrokerChannel, BrokerError, ConnectionManager, ExchangeSpec, QueueSpec};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

/// Identity unit. `role` is descriptive only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub name: String,
    #[serde(default)]
    pub role: String,
}

impl Agent {
    pub fn new<N: Into<String>, R: Into<String>>(name: N, role: R) -> Self {
        Self {
            name: name.into(),
            role: role.into(),
        }
    }
}

/// A registered agent and the broker resources provisioned for it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegisteredAgent {
    pub name: String,
    pub role: String,
    pub queue_name: String,
    pub routing_key: String,
    /// Present when rejected messages are dead-lettered
    pub dead_letter_queue: Option<String>,
    pub registered_at: DateTime<Utc>,
}

impl RegisteredAgent {
    fn matches(&self, agent: &Agent) -> bool {
        self.name == agent.name && self.role == agent.role
    }
}

/// What `deregister` does with the agent's queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueDisposal {
    /// Remove the mapping only; the queue and its messages stay on the broker
    Keep,
    /// Delete the queue, refusing if it still holds messages
    DeleteIfEmpty,
    /// Delete the queue and its dead-letter queue, dropping any messages
    ForceDelete,
}

pub struct AgentRegistry {
    connection: Arc<ConnectionManager>,
    exchange: String,
    dead_letter_exchange: Option<String>,
    agents: RwLock<HashMap<String, RegisteredAgent>>,
}

impl AgentRegistry {
    /// Queues are bound to `exchange`; with `dead_letter_exchange` set they
    /// also dead-letter rejected messages into a per-agent queue.
    pub fn new<S: Into<String>>(
        connection: Arc<ConnectionManager>,
        exchange: S,
        dead_letter_exchange: Option<String>,
    ) -> Self {
        Self {
            connection,
            exchange: exchange.into(),
            dead_letter_exchange,
            agents: RwLock::new(HashMap::new()),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Declare the agent's durable queue and bind it. Re-registering the same
    /// agent is a no-op; a different agent on the same queue is an error.
    pub async fn register(&self, agent: Agent) -> SwarmResult<RegisteredAgent> {
        validate_agent_name(&agent.name).map_err(|e| {
            SwarmError::registration(format!("invalid agent name '{}': {e}", agent.name))
        })?;
        let key = normalize_agent_name(&agent.name);

        let existing = self.read().get(&key).cloned();
        if let Some(existing) = existing {
            return if existing.matches(&agent) {
                debug!("Agent '{}' already registered", agent.name);
                Ok(existing)
            } else {
                Err(collision(&existing, &agent))
            };
        }

        let registered = RegisteredAgent {
            queue_name: queue_name(&agent.name),
            routing_key: routing_key(&agent.name),
            dead_letter_queue: self
                .dead_letter_exchange
                .as_ref()
                .map(|_| dead_letter_queue_name(&agent.name)),
            name: agent.name.clone(),
            role: agent.role.clone(),
            registered_at: Utc::now(),
        };

        let channel = self.connection.ensure_connected().await?;
        self.provision(channel.as_ref(), &registered).await?;

        let mut agents = self.write();
        if let Some(existing) = agents.get(&key) {
            // Lost a race with a concurrent registration
            return if existing.matches(&agent) {
                Ok(existing.clone())
            } else {
                Err(collision(existing, &agent))
            };
        }
        agents.insert(key, registered.clone());

        info!(
            "Registered agent '{}' ({}) on queue {} with routing key {}",
            registered.name, registered.role, registered.queue_name, registered.routing_key
        );
        Ok(registered)
    }

    async fn provision(
        &self,
        channel: &dyn BrokerChannel,
        agent: &RegisteredAgent,
    ) -> SwarmResult<()> {
        let mut spec = QueueSpec::durable(&agent.queue_name);

        if let (Some(exchange), Some(dead_letter_queue)) =
            (&self.dead_letter_exchange, &agent.dead_letter_queue)
        {
            channel
                .declare_exchange(&ExchangeSpec::durable_topic(exchange))
                .await
                .map_err(|e| provisioning_error(agent, e))?;
            channel
                .declare_queue(&QueueSpec::durable(dead_letter_queue))
                .await
                .map_err(|e| provisioning_error(agent, e))?;
            channel
                .bind_queue(dead_letter_queue, exchange, &agent.routing_key)
                .await
                .map_err(|e| provisioning_error(agent, e))?;
            spec = spec.with_dead_letter_exchange(exchange);
        }

        channel
            .declare_queue(&spec)
            .await
            .map_err(|e| provisioning_error(agent, e))?;
        channel
            .bind_queue(&agent.queue_name, &self.exchange, &agent.routing_key)
            .await
            .map_err(|e| provisioning_error(agent, e))?;
        Ok(())
    }

    /// Look up a registered agent by name (case and whitespace insensitive)
    pub fn resolve(&self, agent_name: &str) -> SwarmResult<RegisteredAgent> {
        self.read()
            .get(&normalize_agent_name(agent_name))
            .cloned()
            .ok_or_else(|| SwarmError::unknown_agent(agent_name))
    }

    pub fn is_registered(&self, agent_name: &str) -> bool {
        self.read()
            .contains_key(&normalize_agent_name(agent_name))
    }

    /// All registered agents, ordered by name
    pub fn agents(&self) -> Vec<RegisteredAgent> {
        let mut agents: Vec<RegisteredAgent> = self.read().values().cloned().collect();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        agents
    }

    pub fn names(&self) -> Vec<String> {
        self.agents().into_iter().map(|a| a.name).collect()
    }

    /// Remove an agent. Returns the number of messages dropped with its queue.
    /// The mapping is kept when queue deletion is refused or fails.
    pub async fn deregister(&self, agent_name: &str, disposal: QueueDisposal) -> SwarmResult<u32> {
        let agent = self.resolve(agent_name)?;

        let dropped = match disposal {
            QueueDisposal::Keep => 0,
            QueueDisposal::DeleteIfEmpty | QueueDisposal::ForceDelete => {
                // Failed deletes close the channel they ran on
                let channel = self.connection.open_channel().await?;
                let result = self.delete_queues(channel.as_ref(), &agent, disposal).await;
                let _ = channel.close().await;
                result?
            }
        };

        self.write().remove(&normalize_agent_name(agent_name));
        info!(
            "Deregistered agent '{}' (queue {}, {:?}, {} message(s) dropped)",
            agent.name, agent.queue_name, disposal, dropped
        );
        Ok(dropped)
    }

    async fn delete_queues(
        &self,
        channel: &dyn BrokerChannel,
        agent: &RegisteredAgent,
        disposal: QueueDisposal,
    ) -> SwarmResult<u32> {
        let force = disposal == QueueDisposal::ForceDelete;

        if !force {
            match channel.inspect_queue(&agent.queue_name).await {
                Ok(info) if info.message_count > 0 => {
                    return Err(SwarmError::QueueNotEmpty {
                        queue: agent.queue_name.clone(),
                        messages: info.message_count,
                    });
                }
                Ok(_) => {}
                Err(BrokerError::NotFound(_)) => {
                    warn!("Queue {} already gone from broker", agent.queue_name);
                    return Ok(0);
                }
                Err(e) => return Err(provisioning_error(agent, e)),
            }
        }

        let dropped = match channel.delete_queue(&agent.queue_name, !force).await {
            Ok(count) => count,
            Err(BrokerError::PreconditionFailed(_)) => {
                return Err(SwarmError::QueueNotEmpty {
                    queue: agent.queue_name.clone(),
                    messages: 0,
                });
            }
            Err(e) => return Err(provisioning_error(agent, e)),
        };

        if force {
            if let Some(dead_letter_queue) = &agent.dead_letter_queue {
                let dead = channel
                    .delete_queue(dead_letter_queue, false)
                    .await
                    .map_err(|e| provisioning_error(agent, e))?;
                return Ok(dropped + dead);
            }
        }
        Ok(dropped)
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, RegisteredAgent>> {
        self.agents.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, RegisteredAgent>> {
        self.agents.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn collision(existing: &RegisteredAgent, agent: &Agent) -> SwarmError {
    SwarmError::registration(format!(
        "agent '{}' ({}) collides with registered agent '{}' ({}) on queue {}",
        agent.name, agent.role, existing.name, existing.role, existing.queue_name
    ))
}

fn provisioning_error(agent: &RegisteredAgent, error: BrokerError) -> SwarmError {
    match error {
        BrokerError::ConnectionFailed(_) | BrokerError::ChannelClosed(_) => {
            SwarmError::connection(format!(
                "lost broker while provisioning queue {}: {}",
                agent.queue_name,
                error.detail()
            ))
        }
        other => SwarmError::registration(format!(
            "broker refused queue {} for agent '{}': {}",
            agent.queue_name,
            agent.name,
            other.detail()
        )),
    }
}
