//! Message model shared across the substrate
//!
//! Messages are immutable once sent: the bus clones them into inboxes and
//! the log, and nothing mutates them afterwards.

use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::new_id;

/// Free-form message content.
///
/// The substrate never interprets payloads; typed deserialization happens at
/// call sites.
pub type Payload = serde_json::Map<String, Value>;

/// Convert a `serde_json::Value` into a payload map.
///
/// Non-object values produce an empty map.
pub fn to_payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}

/// Message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Request,
    Response,
    Inform,
    Cfp,
    Broadcast,
    Propose,
    Accept,
    Reject,
}

/// Delivery priority. Lower rank dequeues first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Urgent,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Numeric rank used for inbox ordering (urgent=0 .. low=3).
    #[inline]
    pub fn rank(self) -> u8 {
        match self {
            Priority::Urgent => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }
}

/// A message exchanged between agents.
///
/// `receiver == None` means broadcast to every registered agent except the
/// sender. `correlation_id`, when set, links a response to the request it
/// answers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub id: String,
    pub sender: String,
    pub receiver: Option<String>,
    pub message_type: MessageType,
    pub priority: Priority,
    pub content: Payload,
    pub topic: Option<String>,
    pub correlation_id: Option<String>,
    pub timestamp: SystemTime,
    /// Lifetime after which the message is dropped on receive. `None`
    /// means the message never expires.
    pub ttl: Option<Duration>,
}

impl AgentMessage {
    /// Create a message with default priority and empty content.
    pub fn new(
        sender: impl Into<String>,
        receiver: Option<String>,
        message_type: MessageType,
    ) -> Self {
        Self {
            id: new_id(),
            sender: sender.into(),
            receiver,
            message_type,
            priority: Priority::default(),
            content: Payload::new(),
            topic: None,
            correlation_id: None,
            timestamp: SystemTime::now(),
            ttl: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_content(mut self, content: Payload) -> Self {
        self.content = content;
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Whether this message fans out to all registered agents.
    #[inline]
    pub fn is_broadcast(&self) -> bool {
        self.receiver.is_none()
    }

    /// Whether the message has outlived its TTL.
    ///
    /// Clock skew (a timestamp in the future) counts as not expired.
    pub fn is_expired(&self) -> bool {
        match self.ttl {
            Some(ttl) => self
                .timestamp
                .elapsed()
                .map(|age| age > ttl)
                .unwrap_or(false),
            None => false,
        }
    }
}

/// A topic membership record, returned by `MessageBus::subscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub agent_name: String,
    pub topic: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_priority_ranks() {
        assert_eq!(Priority::Urgent.rank(), 0);
        assert_eq!(Priority::High.rank(), 1);
        assert_eq!(Priority::Normal.rank(), 2);
        assert_eq!(Priority::Low.rank(), 3);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_broadcast_iff_no_receiver() {
        let broadcast = AgentMessage::new("a", None, MessageType::Broadcast);
        assert!(broadcast.is_broadcast());

        let unicast = AgentMessage::new("a", Some("b".into()), MessageType::Inform);
        assert!(!unicast.is_broadcast());
    }

    #[test]
    fn test_expiry() {
        let fresh = AgentMessage::new("a", Some("b".into()), MessageType::Inform)
            .with_ttl(Duration::from_secs(60));
        assert!(!fresh.is_expired());

        let mut stale = AgentMessage::new("a", Some("b".into()), MessageType::Inform)
            .with_ttl(Duration::from_millis(10));
        stale.timestamp = SystemTime::now() - Duration::from_secs(1);
        assert!(stale.is_expired());

        let mut eternal = AgentMessage::new("a", Some("b".into()), MessageType::Inform);
        eternal.timestamp = SystemTime::now() - Duration::from_secs(3600);
        assert!(!eternal.is_expired());
    }

    #[test]
    fn test_to_payload() {
        let map = to_payload(json!({"k": 1}));
        assert_eq!(map.get("k"), Some(&json!(1)));
        assert!(to_payload(json!([1, 2])).is_empty());
    }

    #[test]
    fn test_message_roundtrip() {
        let msg = AgentMessage::new("a", Some("b".into()), MessageType::Request)
            .with_priority(Priority::Urgent)
            .with_content(to_payload(json!({"task": "scan"})))
            .with_ttl(Duration::from_secs(5));

        let encoded = serde_json::to_string(&msg).unwrap();
        let decoded: AgentMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.id, msg.id);
        assert_eq!(decoded.priority, Priority::Urgent);
        assert_eq!(decoded.ttl, Some(Duration::from_secs(5)));
    }
}
