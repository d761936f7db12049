//! Message envelope carried between agent queues
//!
//! The wire form is a JSON document with `content`, `context` and `routing`
//! fields (plus an optional `reply_to`). Delivery metadata such as the
//! acknowledgment tag is assigned by the broker and lives on
//! [`InboundMessage`], never in the payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Unit of transport between agents
///
/// # Examples
/// ```
/// use swarmq::protocol::MessageEnvelope;
/// use serde_json::json;
///
/// let envelope = MessageEnvelope::new(json!("hello"))
///     .with_context_value("k", json!(1))
///     .routed_to("Agent A");
///
/// let bytes = envelope.to_bytes().unwrap();
/// let decoded = MessageEnvelope::from_slice(&bytes).unwrap();
/// assert_eq!(decoded, envelope);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageEnvelope {
    /// Payload; no schema is enforced by the messaging layer
    pub content: Value,
    /// Auxiliary key-value data, opaque to the messaging layer
    #[serde(default)]
    pub context: Map<String, Value>,
    /// Destination agent identity
    #[serde(default)]
    pub routing: String,
    /// Agent whose queue should receive a reply, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

impl MessageEnvelope {
    pub fn new(content: Value) -> Self {
        Self {
            content,
            context: Map::new(),
            routing: String::new(),
            reply_to: None,
        }
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    pub fn with_context_value<K: Into<String>>(mut self, key: K, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn routed_to<S: Into<String>>(mut self, agent_name: S) -> Self {
        self.routing = agent_name.into();
        self
    }

    pub fn reply_to<S: Into<String>>(mut self, agent_name: S) -> Self {
        self.reply_to = Some(agent_name.into());
        self
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_slice(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

/// An envelope as handed to a consumer handler
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Registered name of the agent whose queue delivered the message
    pub agent: String,
    pub envelope: MessageEnvelope,
    /// Broker-assigned acknowledgment tag
    pub delivery_tag: u64,
    /// Broker flagged this as a redelivery of an unacknowledged message
    pub redelivered: bool,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn content(&self) -> &Value {
        &self.envelope.content
    }

    pub fn context(&self) -> &Map<String, Value> {
        &self.envelope.context
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let envelope = MessageEnvelope::new(json!("hello"))
            .with_context_value("k", json!(1))
            .routed_to("Agent A");

        let value: Value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            value,
            json!({"content": "hello", "context": {"k": 1}, "routing": "Agent A"})
        );
    }

    #[test]
    fn test_parses_reference_document() {
        let payload = br#"{"content":"hello","context":{"k":1},"routing":"Agent A"}"#;
        let envelope = MessageEnvelope::from_slice(payload).unwrap();

        assert_eq!(envelope.content, json!("hello"));
        assert_eq!(envelope.context.get("k"), Some(&json!(1)));
        assert_eq!(envelope.routing, "Agent A");
        assert_eq!(envelope.reply_to, None);
    }

    #[test]
    fn test_context_and_routing_default_when_missing() {
        let envelope = MessageEnvelope::from_slice(br#"{"content":{"messages":[]}}"#).unwrap();
        assert!(envelope.context.is_empty());
        assert!(envelope.routing.is_empty());
    }

    #[test]
    fn test_missing_content_is_rejected() {
        assert!(MessageEnvelope::from_slice(br#"{"context":{}}"#).is_err());
        assert!(MessageEnvelope::from_slice(b"not json").is_err());
    }

    #[test]
    fn test_reply_to_serialized_only_when_set() {
        let plain = serde_json::to_value(MessageEnvelope::new(json!(1))).unwrap();
        assert!(plain.get("reply_to").is_none());

        let replying = serde_json::to_value(MessageEnvelope::new(json!(1)).reply_to("Agent B"))
            .unwrap();
        assert_eq!(replying["reply_to"], json!("Agent B"));
    }
}
