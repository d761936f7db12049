//! Queue Monitor: passive per-agent queue inspection
//!
//! Inspection never declares, purges or consumes. A lookup that fails for one
//! agent is recorded on that agent's entry and the rest of the report is still
//! produced.

use crate::agent::AgentRegistry;
use crate::error::{SwarmError, SwarmResult};
use crate::transport::{BrokerChannel, BrokerError, ConnectionManager, QueueInfo};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Index;
use std::sync::Arc;
use tracing::{debug, warn};

/// Derived label for a queue snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueHealth {
    /// At least one consumer attached
    Active,
    /// Queue exists, nobody consuming
    Idle,
    /// Lookup failed
    Unknown,
}

impl fmt::Display for QueueHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueHealth::Active => write!(f, "active"),
            QueueHealth::Idle => write!(f, "idle"),
            QueueHealth::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStatus {
    pub queue_name: String,
    pub message_count: u32,
    pub consumer_count: u32,
    pub routing_key: String,
    pub status: QueueHealth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueueStatus {
    fn from_info(info: QueueInfo, routing_key: String) -> Self {
        let status = if info.consumer_count > 0 {
            QueueHealth::Active
        } else {
            QueueHealth::Idle
        };
        Self {
            queue_name: info.name,
            message_count: info.message_count,
            consumer_count: info.consumer_count,
            routing_key,
            status,
            error: None,
        }
    }

    fn unknown(queue_name: String, routing_key: String, error: String) -> Self {
        Self {
            queue_name,
            message_count: 0,
            consumer_count: 0,
            routing_key,
            status: QueueHealth::Unknown,
            error: Some(error),
        }
    }

    pub fn is_known(&self) -> bool {
        self.error.is_none()
    }
}

/// Agent name to queue snapshot, as requested
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct StatusReport {
    queues: BTreeMap<String, QueueStatus>,
}

impl StatusReport {
    pub fn get(&self, agent_name: &str) -> Option<&QueueStatus> {
        self.queues.get(agent_name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &QueueStatus)> {
        self.queues.iter()
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Ready messages across every queue that could be inspected
    pub fn total_messages(&self) -> u64 {
        self.queues
            .values()
            .map(|q| u64::from(q.message_count))
            .sum()
    }

    /// Entries whose lookup failed
    pub fn failures(&self) -> impl Iterator<Item = (&String, &QueueStatus)> {
        self.queues.iter().filter(|(_, q)| !q.is_known())
    }
}

impl Index<&str> for StatusReport {
    type Output = QueueStatus;

    fn index(&self, agent_name: &str) -> &QueueStatus {
        &self.queues[agent_name]
    }
}

pub struct QueueMonitor {
    connection: Arc<ConnectionManager>,
    registry: Arc<AgentRegistry>,
}

impl QueueMonitor {
    pub fn new(connection: Arc<ConnectionManager>, registry: Arc<AgentRegistry>) -> Self {
        Self {
            connection,
            registry,
        }
    }

    /// Snapshot the named agents' queues, or every registered agent's when
    /// `agent_names` is `None`. Fails as a whole only when the first channel
    /// cannot be obtained; per-agent failures, including a failed channel
    /// reopen partway through, land in the report.
    pub async fn status(&self, agent_names: Option<&[String]>) -> SwarmResult<StatusReport> {
        let requested: Vec<String> = match agent_names {
            Some(names) => names.to_vec(),
            None => self.registry.names(),
        };

        let mut report = StatusReport::default();
        if requested.is_empty() {
            return Ok(report);
        }

        // Failed passive declares close the channel they ran on, so the
        // monitor keeps its own instead of borrowing the shared one.
        let mut channel = self.connection.open_channel().await?;

        for name in requested {
            let agent = match self.registry.resolve(&name) {
                Ok(agent) => agent,
                Err(e) => {
                    report.queues.insert(
                        name,
                        QueueStatus::unknown(String::new(), String::new(), e.to_string()),
                    );
                    continue;
                }
            };

            if !channel.is_open() {
                match self.connection.open_channel().await {
                    Ok(reopened) => channel = reopened,
                    Err(e) => {
                        warn!("Could not reopen channel to inspect {}: {}", agent.queue_name, e);
                        report.queues.insert(
                            name,
                            QueueStatus::unknown(agent.queue_name, agent.routing_key, e.to_string()),
                        );
                        continue;
                    }
                }
            }

            let entry = match channel.inspect_queue(&agent.queue_name).await {
                Ok(info) => {
                    debug!(
                        "Queue {}: {} ready, {} consumer(s)",
                        info.name, info.message_count, info.consumer_count
                    );
                    QueueStatus::from_info(info, agent.routing_key)
                }
                Err(e) => {
                    warn!("Could not inspect queue {}: {}", agent.queue_name, e);
                    QueueStatus::unknown(agent.queue_name, agent.routing_key, describe(&e))
                }
            };
            report.queues.insert(name, entry);
        }

        close_quietly(channel.as_ref()).await;
        Ok(report)
    }
}

fn describe(error: &BrokerError) -> String {
    match error {
        BrokerError::NotFound(_) => "queue does not exist on the broker".to_string(),
        other => SwarmError::connection(other.detail()).to_string(),
    }
}

async fn close_quietly(channel: &dyn BrokerChannel) {
    if channel.is_open() {
        let _ = channel.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(messages: u32, consumers: u32) -> QueueInfo {
        QueueInfo {
            name: "agent_agent_a_queue".to_string(),
            message_count: messages,
            consumer_count: consumers,
        }
    }

    #[test]
    fn test_status_label_follows_consumers() {
        let idle = QueueStatus::from_info(info(4, 0), "agent.agent_a".to_string());
        assert_eq!(idle.status, QueueHealth::Idle);
        assert_eq!(idle.message_count, 4);

        let active = QueueStatus::from_info(info(0, 2), "agent.agent_a".to_string());
        assert_eq!(active.status, QueueHealth::Active);
        assert!(active.is_known());
    }

    #[test]
    fn test_report_serializes_as_flat_mapping() {
        let mut report = StatusReport::default();
        report.queues.insert(
            "Agent A".to_string(),
            QueueStatus::from_info(info(3, 1), "agent.agent_a".to_string()),
        );
        report.queues.insert(
            "Ghost".to_string(),
            QueueStatus::unknown(String::new(), String::new(), "Unknown agent: Ghost".to_string()),
        );

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["Agent A"]["message_count"], 3);
        assert_eq!(json["Agent A"]["status"], "active");
        assert!(json["Agent A"].get("error").is_none());
        assert_eq!(json["Ghost"]["status"], "unknown");
        assert_eq!(report.total_messages(), 3);
        assert_eq!(report.failures().count(), 1);
        assert_eq!(report["Agent A"].consumer_count, 1);
    }

    #[test]
    fn test_health_display() {
        assert_eq!(QueueHealth::Idle.to_string(), "idle");
        assert_eq!(QueueHealth::Unknown.to_string(), "unknown");
    }
}
