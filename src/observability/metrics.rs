//! Thread-safe messaging metrics
//!
//! Atomic counters for connection, publish and consumption activity. Each
//! [`SwarmClient`](crate::SwarmClient) owns one collector, so independent
//! clients in one process never share counters.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Default)]
pub struct MessagingMetrics {
    // Connection
    connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    connections_lost: AtomicU64,
    connected_since: AtomicU64,

    // Publishing
    messages_published: AtomicU64,
    publish_failures: AtomicU64,

    // Consumption
    messages_received: AtomicU64,
    messages_acked: AtomicU64,
    handler_retries: AtomicU64,
    handler_failures: AtomicU64,
    poison_messages: AtomicU64,
    dead_lettered: AtomicU64,
    consumer_restarts: AtomicU64,

    // Handler latency per agent, last 1000 samples each
    handler_times: Mutex<HashMap<String, Vec<u64>>>,
}

impl MessagingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.connected.store(true, Ordering::Relaxed);
        self.connected_since
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_lost(&self) {
        self.connections_lost.fetch_add(1, Ordering::Relaxed);
        self.connected.store(false, Ordering::Relaxed);
        self.connected_since.store(0, Ordering::Relaxed);
    }

    pub fn message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_acked(&self) {
        self.messages_acked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handler_retried(&self) {
        self.handler_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handler_failed(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn poison_message(&self) {
        self.poison_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn consumer_restarted(&self) {
        self.consumer_restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handler_time(&self, agent: &str, duration: Duration) {
        if let Ok(mut times) = self.handler_times.lock() {
            let samples = times.entry(agent.to_string()).or_default();
            samples.push(duration.as_millis() as u64);
            if samples.len() > 1000 {
                samples.remove(0);
            }
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let handler_latency = self
            .handler_times
            .lock()
            .map(|times| {
                times
                    .iter()
                    .map(|(agent, samples)| (agent.clone(), LatencySummary::from_samples(samples)))
                    .collect()
            })
            .unwrap_or_default();

        let connected_since = self.connected_since.load(Ordering::Relaxed);

        MetricsSnapshot {
            timestamp: current_timestamp(),
            connection: ConnectionMetrics {
                connected: self.connected.load(Ordering::Relaxed),
                attempts: self.connection_attempts.load(Ordering::Relaxed),
                established: self.connections_established.load(Ordering::Relaxed),
                failures: self.connection_failures.load(Ordering::Relaxed),
                lost: self.connections_lost.load(Ordering::Relaxed),
                uptime_seconds: if connected_since > 0 {
                    current_timestamp().saturating_sub(connected_since)
                } else {
                    0
                },
            },
            publishing: PublishMetrics {
                published: self.messages_published.load(Ordering::Relaxed),
                failures: self.publish_failures.load(Ordering::Relaxed),
            },
            consumption: ConsumptionMetrics {
                received: self.messages_received.load(Ordering::Relaxed),
                acked: self.messages_acked.load(Ordering::Relaxed),
                handler_retries: self.handler_retries.load(Ordering::Relaxed),
                handler_failures: self.handler_failures.load(Ordering::Relaxed),
                poison_messages: self.poison_messages.load(Ordering::Relaxed),
                dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
                consumer_restarts: self.consumer_restarts.load(Ordering::Relaxed),
                handler_latency,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: u64,
    pub connection: ConnectionMetrics,
    pub publishing: PublishMetrics,
    pub consumption: ConsumptionMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionMetrics {
    pub connected: bool,
    pub attempts: u64,
    pub established: u64,
    pub failures: u64,
    pub lost: u64,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishMetrics {
    pub published: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsumptionMetrics {
    pub received: u64,
    pub acked: u64,
    pub handler_retries: u64,
    pub handler_failures: u64,
    pub poison_messages: u64,
    pub dead_lettered: u64,
    pub consumer_restarts: u64,
    pub handler_latency: HashMap<String, LatencySummary>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LatencySummary {
    pub samples: usize,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub max_ms: u64,
}

impl LatencySummary {
    fn from_samples(samples: &[u64]) -> Self {
        if samples.is_empty() {
            return Self {
                samples: 0,
                avg_ms: 0.0,
                p50_ms: 0.0,
                p95_ms: 0.0,
                max_ms: 0,
            };
        }

        let mut sorted = samples.to_vec();
        sorted.sort_unstable();

        Self {
            samples: sorted.len(),
            avg_ms: sorted.iter().sum::<u64>() as f64 / sorted.len() as f64,
            p50_ms: percentile(&sorted, 50.0),
            p95_ms: percentile(&sorted, 95.0),
            max_ms: sorted[sorted.len() - 1],
        }
    }
}

fn percentile(sorted: &[u64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let index = ((pct / 100.0) * (sorted.len() - 1) as f64).round() as usize;
    sorted[index.min(sorted.len() - 1)] as f64
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_counters() {
        let metrics = MessagingMetrics::new();
        metrics.connection_attempt();
        metrics.connection_failed();
        metrics.connection_attempt();
        metrics.connection_established();

        let snapshot = metrics.snapshot();
        assert!(snapshot.connection.connected);
        assert_eq!(snapshot.connection.attempts, 2);
        assert_eq!(snapshot.connection.failures, 1);
        assert_eq!(snapshot.connection.established, 1);

        metrics.connection_lost();
        let snapshot = metrics.snapshot();
        assert!(!snapshot.connection.connected);
        assert_eq!(snapshot.connection.lost, 1);
        assert_eq!(snapshot.connection.uptime_seconds, 0);
    }

    #[test]
    fn test_consumption_counters() {
        let metrics = MessagingMetrics::new();
        metrics.message_received();
        metrics.handler_retried();
        metrics.handler_retried();
        metrics.handler_failed();
        metrics.message_acked();
        metrics.poison_message();
        metrics.message_dead_lettered();

        let consumption = metrics.snapshot().consumption;
        assert_eq!(consumption.received, 1);
        assert_eq!(consumption.handler_retries, 2);
        assert_eq!(consumption.handler_failures, 1);
        assert_eq!(consumption.acked, 1);
        assert_eq!(consumption.poison_messages, 1);
        assert_eq!(consumption.dead_lettered, 1);
    }

    #[test]
    fn test_handler_latency_summary() {
        let metrics = MessagingMetrics::new();
        for ms in [10, 20, 30, 40, 100] {
            metrics.record_handler_time("Agent A", Duration::from_millis(ms));
        }

        let snapshot = metrics.snapshot();
        let summary = &snapshot.consumption.handler_latency["Agent A"];
        assert_eq!(summary.samples, 5);
        assert_eq!(summary.avg_ms, 40.0);
        assert_eq!(summary.p50_ms, 30.0);
        assert_eq!(summary.max_ms, 100);
    }

    #[test]
    fn test_handler_samples_are_bounded() {
        let metrics = MessagingMetrics::new();
        for _ in 0..1_200 {
            metrics.record_handler_time("Agent A", Duration::from_millis(1));
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.consumption.handler_latency["Agent A"].samples, 1000);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = MessagingMetrics::new();
        metrics.message_published();
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["publishing"]["published"], 1);
    }

    #[test]
    fn test_percentile_edges() {
        assert_eq!(percentile(&[], 50.0), 0.0);
        assert_eq!(percentile(&[7], 95.0), 7.0);
    }
}
