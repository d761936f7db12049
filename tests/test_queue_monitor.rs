//! Queue Monitor reports: depth tracking, status labels, partial failures


use serde_json::json;
use std::time::Duration;
use swarmq::testing::MemoryBroker;
use swarmq::transport::Broker;
use swarmq::{Agent, MessageEnvelope, QueueHealth, SwarmClient};
use test_helpers::{connected_client, wait_until, ScriptedHandler};

async fn two_agents() -> (MemoryBroker, SwarmClient) {
    let (broker, client) = connected_client().await;
    client.register(Agent::new("Agent A", "Sender")).await.unwrap();
    client.register(Agent::new("Agent B", "Receiver")).await.unwrap();
    (broker, client)
}

#[tokio::test]
async fn test_message_count_tracks_unconsumed_messages() {
    let (_broker, client) = two_agents().await;

    for n in 0..3 {
        client
            .publish("Agent B", MessageEnvelope::new(json!(n)))
            .await
            .unwrap();
    }

    let report = client.status(None).await.unwrap();
    assert_eq!(report.len(), 2);
    assert_eq!(report["Agent A"].message_count, 0);
    assert_eq!(report["Agent B"].message_count, 3);
    assert_eq!(report["Agent B"].status, QueueHealth::Idle);
    assert_eq!(report.total_messages(), 3);

    let handler = ScriptedHandler::succeeding();
    client.start_consumer("Agent B", handler.clone()).await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || client.metrics().consumption.acked == 3).await);

    let report = client.status(None).await.unwrap();
    assert_eq!(report["Agent B"].message_count, 0);
    assert_eq!(report["Agent B"].consumer_count, 1);
    assert_eq!(report["Agent B"].status, QueueHealth::Active);

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_status_for_selected_agents_only() {
    let (_broker, client) = two_agents().await;

    let requested = vec!["Agent B".to_string()];
    let report = client.status(Some(requested.as_slice())).await.unwrap();

    assert_eq!(report.len(), 1);
    assert!(report.get("Agent A").is_none());
    assert_eq!(report["Agent B"].queue_name, "agent_agent_b_queue");
}

#[tokio::test]
async fn test_missing_queue_does_not_hide_other_agents() {
    let (broker, client) = two_agents().await;
    client
        .publish("Agent B", MessageEnvelope::new(json!("pending")))
        .await
        .unwrap();

    // Delete Agent A's queue out from under the registry
    let connection = broker.connect().await.unwrap();
    let channel = connection.open_channel().await.unwrap();
    channel.delete_queue("agent_agent_a_queue", false).await.unwrap();

    let requested = vec![
        "Agent A".to_string(),
        "Ghost".to_string(),
        "Agent B".to_string(),
    ];
    let report = client.status(Some(requested.as_slice())).await.unwrap();

    assert_eq!(report.len(), 3);
    assert_eq!(report["Agent A"].status, QueueHealth::Unknown);
    assert_eq!(report["Agent A"].queue_name, "agent_agent_a_queue");
    assert!(report["Agent A"].error.is_some());
    assert_eq!(report["Ghost"].status, QueueHealth::Unknown);
    assert!(report["Ghost"]
        .error
        .as_deref()
        .unwrap()
        .contains("Unknown agent"));
    assert_eq!(report["Agent B"].message_count, 1);
    assert!(report["Agent B"].is_known());
    assert_eq!(report.failures().count(), 2);
}

#[tokio::test]
async fn test_channel_reopen_failure_keeps_partial_report() {
    let (broker, client) = two_agents().await;
    client.register(Agent::new("Agent C", "Reviewer")).await.unwrap();
    client
        .publish("Agent C", MessageEnvelope::new(json!("pending")))
        .await
        .unwrap();

    let connection = broker.connect().await.unwrap();
    let channel = connection.open_channel().await.unwrap();
    channel.delete_queue("agent_agent_a_queue", false).await.unwrap();
    connection.close().await.unwrap();

    // The monitor's first channel is the last one the broker will grant;
    // the missing queue closes it and every reopen afterwards fails
    broker.limit_channel_opens(Some(1));
    let requested = vec![
        "Agent A".to_string(),
        "Agent B".to_string(),
        "Agent C".to_string(),
    ];
    let report = client.status(Some(requested.as_slice())).await.unwrap();

    assert_eq!(report.len(), 3);
    assert_eq!(report.failures().count(), 3);
    assert_eq!(report["Agent B"].queue_name, "agent_agent_b_queue");
    assert_eq!(report["Agent B"].routing_key, "agent.agent_b");
    assert!(report["Agent B"]
        .error
        .as_deref()
        .unwrap()
        .contains("failed to open channel"));
    assert_eq!(report["Agent C"].status, QueueHealth::Unknown);

    broker.limit_channel_opens(None);
    let report = client.status(Some(requested.as_slice())).await.unwrap();
    assert!(report["Agent B"].is_known());
    assert_eq!(report["Agent C"].message_count, 1);
    assert!(!report["Agent A"].is_known());
}

#[tokio::test]
async fn test_inspection_has_no_side_effects() {
    let (broker, client) = two_agents().await;
    client
        .publish("Agent A", MessageEnvelope::new(json!("keep me")))
        .await
        .unwrap();

    for _ in 0..3 {
        client.status(None).await.unwrap();
    }

    assert_eq!(broker.queue_depth("agent_agent_a_queue"), Some(1));
    assert_eq!(broker.unacked_count("agent_agent_a_queue"), Some(0));
}

#[tokio::test]
async fn test_report_serializes_to_agent_mapping() {
    let (_broker, client) = two_agents().await;
    client
        .publish("Agent A", MessageEnvelope::new(json!("x")))
        .await
        .unwrap();

    let report = client.status(None).await.unwrap();
    let value = serde_json::to_value(&report).unwrap();

    assert_eq!(
        value["Agent A"],
        json!({
            "queue_name": "agent_agent_a_queue",
            "message_count": 1,
            "consumer_count": 0,
            "routing_key": "agent.agent_a",
            "status": "idle"
        })
    );
}

#[tokio::test]
async fn test_status_with_no_agents_is_empty() {
    let (_broker, client) = connected_client().await;
    let report = client.status(None).await.unwrap();
    assert!(report.is_empty());
    assert_eq!(report.total_messages(), 0);
}
