//! Central message bus
//!
//! Per-agent bounded priority inboxes with unicast, broadcast, pub/sub and
//! request/response delivery. Same-priority messages dequeue in insertion
//! order via a monotonically increasing sequence number.
//!
//! The bus is best-effort and in-memory: an unknown recipient or a full
//! inbox makes `send` return `false`, expired messages are dropped on
//! receive, and nothing is retried.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, warn};

use crate::message::{AgentMessage, MessageType, Payload, Subscription};

/// Handler recorded per agent. The bus stores handlers for higher layers to
/// look up; it never invokes them itself.
pub type MessageHandler = Arc<dyn Fn(AgentMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// Bus configuration.
#[derive(Debug, Clone, Copy)]
pub struct BusConfig {
    /// Per-agent inbox capacity.
    pub max_queue_size: usize,
    /// Message log capacity; older entries are evicted silently.
    pub log_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            log_capacity: 1000,
        }
    }
}

/// Enqueue failure, surfaced as `false` from `send`.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("unknown recipient: {0}")]
    UnknownRecipient(String),

    #[error("inbox full: {0}")]
    InboxFull(String),
}

/// Inbox entry ordered by `(priority rank, sequence)`, lowest first.
struct QueuedMessage {
    rank: u8,
    seq: u64,
    message: AgentMessage,
}

impl PartialEq for QueuedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.rank == other.rank && self.seq == other.seq
    }
}

impl Eq for QueuedMessage {}

impl PartialOrd for QueuedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedMessage {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.rank, self.seq).cmp(&(other.rank, other.seq))
    }
}

struct Inbox {
    heap: BinaryHeap<Reverse<QueuedMessage>>,
    notify: Arc<Notify>,
}

impl Inbox {
    fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            notify: Arc::new(Notify::new()),
        }
    }
}

struct BusState {
    inboxes: HashMap<String, Inbox>,
    /// topic -> subscribers in registration order.
    subscriptions: HashMap<String, Vec<String>>,
    handlers: HashMap<String, MessageHandler>,
    log: VecDeque<AgentMessage>,
    /// request id -> waiter for the matching response.
    pending: HashMap<String, oneshot::Sender<AgentMessage>>,
}

/// Central message bus with per-agent priority inboxes.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct MessageBus {
    state: Arc<Mutex<BusState>>,
    config: BusConfig,
    seq: Arc<AtomicU64>,
}

impl MessageBus {
    /// Create a bus with default configuration.
    pub fn new() -> Self {
        Self::with_config(BusConfig::default())
    }

    /// Create a bus with custom configuration.
    pub fn with_config(config: BusConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState {
                inboxes: HashMap::new(),
                subscriptions: HashMap::new(),
                handlers: HashMap::new(),
                log: VecDeque::new(),
                pending: HashMap::new(),
            })),
            config,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Register an agent. Idempotent: an existing inbox is left untouched.
    pub fn register_agent(&self, agent_name: &str) {
        let mut state = self.state.lock();
        if !state.inboxes.contains_key(agent_name) {
            state.inboxes.insert(agent_name.to_string(), Inbox::new());
            debug!("agent registered on bus: {agent_name}");
        }
    }

    /// Remove an agent, its handler, and all its topic subscriptions.
    pub fn unregister_agent(&self, agent_name: &str) {
        let mut state = self.state.lock();
        state.inboxes.remove(agent_name);
        state.handlers.remove(agent_name);
        for subscribers in state.subscriptions.values_mut() {
            subscribers.retain(|name| name != agent_name);
        }
    }

    /// Record a message handler for an agent.
    pub fn set_handler(&self, agent_name: &str, handler: MessageHandler) {
        self.state
            .lock()
            .handlers
            .insert(agent_name.to_string(), handler);
    }

    /// Look up the recorded handler for an agent.
    pub fn handler(&self, agent_name: &str) -> Option<MessageHandler> {
        self.state.lock().handlers.get(agent_name).cloned()
    }

    /// Send a message.
    ///
    /// Unicast goes to the receiver's inbox; a message without a receiver
    /// fans out to every registered agent except the sender. Returns whether
    /// at least one enqueue succeeded. A successfully enqueued message whose
    /// `correlation_id` matches a pending request also completes that
    /// request's waiter.
    pub fn send(&self, message: AgentMessage) -> bool {
        let mut state = self.state.lock();
        if state.log.len() >= self.config.log_capacity {
            state.log.pop_front();
        }
        state.log.push_back(message.clone());

        let Some(receiver) = message.receiver.clone() else {
            return self.fan_out(&mut state, &message);
        };

        match self.enqueue(&mut state, &receiver, message.clone()) {
            Ok(()) => {
                if let Some(correlation_id) = &message.correlation_id {
                    if let Some(waiter) = state.pending.remove(correlation_id) {
                        let _ = waiter.send(message.clone());
                    }
                }
                debug!(
                    "message sent: {} -> {} ({:?})",
                    message.sender, receiver, message.message_type
                );
                true
            }
            Err(err) => {
                warn!("send failed: {err}");
                false
            }
        }
    }

    fn fan_out(&self, state: &mut BusState, message: &AgentMessage) -> bool {
        let recipients: Vec<String> = state
            .inboxes
            .keys()
            .filter(|name| **name != message.sender)
            .cloned()
            .collect();

        let mut sent = false;
        for recipient in recipients {
            match self.enqueue(state, &recipient, message.clone()) {
                Ok(()) => sent = true,
                Err(err) => warn!("broadcast: {err}"),
            }
        }
        sent
    }

    fn enqueue(
        &self,
        state: &mut BusState,
        receiver: &str,
        message: AgentMessage,
    ) -> Result<(), SendError> {
        let inbox = state
            .inboxes
            .get_mut(receiver)
            .ok_or_else(|| SendError::UnknownRecipient(receiver.to_string()))?;
        if inbox.heap.len() >= self.config.max_queue_size {
            return Err(SendError::InboxFull(receiver.to_string()));
        }

        inbox.heap.push(Reverse(QueuedMessage {
            rank: message.priority.rank(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            message,
        }));
        inbox.notify.notify_one();
        Ok(())
    }

    /// Receive the highest-priority message, waiting until one arrives or
    /// the timeout elapses.
    ///
    /// A dequeued message that has outlived its TTL is dropped and `None` is
    /// returned (single attempt). Unknown agents get `None` immediately.
    pub async fn receive(
        &self,
        agent_name: &str,
        timeout: Option<Duration>,
    ) -> Option<AgentMessage> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            let notify = {
                let mut state = self.state.lock();
                let inbox = state.inboxes.get_mut(agent_name)?;
                if let Some(Reverse(entry)) = inbox.heap.pop() {
                    if entry.message.is_expired() {
                        debug!("message expired: {}", entry.message.id);
                        return None;
                    }
                    return Some(entry.message);
                }
                inbox.notify.clone()
            };

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notify.notified())
                        .await
                        .is_err()
                    {
                        return None;
                    }
                }
                None => notify.notified().await,
            }
        }
    }

    /// Dequeue the highest-priority message without waiting.
    pub fn receive_nowait(&self, agent_name: &str) -> Option<AgentMessage> {
        let mut state = self.state.lock();
        let inbox = state.inboxes.get_mut(agent_name)?;
        let Reverse(entry) = inbox.heap.pop()?;
        Some(entry.message)
    }

    /// Send a REQUEST and await the matching RESPONSE.
    ///
    /// The response must carry `correlation_id == request.id`. Returns `None`
    /// on timeout, after discarding the pending waiter.
    pub async fn request(
        &self,
        sender: &str,
        receiver: &str,
        content: Payload,
        timeout: Duration,
    ) -> Option<AgentMessage> {
        let message = AgentMessage::new(sender, Some(receiver.to_string()), MessageType::Request)
            .with_content(content);
        let request_id = message.id.clone();

        let (waiter, response) = oneshot::channel();
        self.state.lock().pending.insert(request_id.clone(), waiter);
        self.send(message);

        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(response)) => Some(response),
            _ => {
                self.state.lock().pending.remove(&request_id);
                None
            }
        }
    }

    /// Subscribe an agent to a topic. Duplicate subscriptions are ignored.
    pub fn subscribe(&self, agent_name: &str, topic: &str) -> Subscription {
        let mut state = self.state.lock();
        let subscribers = state.subscriptions.entry(topic.to_string()).or_default();
        if !subscribers.iter().any(|name| name == agent_name) {
            subscribers.push(agent_name.to_string());
        }
        debug!("subscription: {agent_name} -> {topic}");
        Subscription {
            agent_name: agent_name.to_string(),
            topic: topic.to_string(),
        }
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, agent_name: &str, topic: &str) -> bool {
        let mut state = self.state.lock();
        let Some(subscribers) = state.subscriptions.get_mut(topic) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|name| name != agent_name);
        subscribers.len() < before
    }

    /// Publish an INFORM to every subscriber of a topic except the sender.
    ///
    /// Returns the number of subscribers reached.
    pub fn publish(&self, sender: &str, topic: &str, content: Payload) -> usize {
        let subscribers = self.subscribers(topic);
        let mut count = 0;
        for subscriber in subscribers {
            if subscriber == sender {
                continue;
            }
            let message = AgentMessage::new(sender, Some(subscriber), MessageType::Inform)
                .with_topic(topic)
                .with_content(content.clone());
            if self.send(message) {
                count += 1;
            }
        }
        debug!("publish: {sender} -> {topic} ({count} subscribers)");
        count
    }

    /// Current inbox depth for an agent (0 if unregistered).
    pub fn queue_size(&self, agent_name: &str) -> usize {
        self.state
            .lock()
            .inboxes
            .get(agent_name)
            .map(|inbox| inbox.heap.len())
            .unwrap_or(0)
    }

    /// The most recent `limit` sent messages, oldest first.
    pub fn message_log(&self, limit: usize) -> Vec<AgentMessage> {
        let state = self.state.lock();
        let skip = state.log.len().saturating_sub(limit);
        state.log.iter().skip(skip).cloned().collect()
    }

    /// Subscribers of a topic, in registration order.
    pub fn subscribers(&self, topic: &str) -> Vec<String> {
        self.state
            .lock()
            .subscriptions
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{to_payload, Priority};
    use serde_json::json;
    use std::time::SystemTime;

    fn inform(sender: &str, receiver: &str) -> AgentMessage {
        AgentMessage::new(sender, Some(receiver.to_string()), MessageType::Inform)
    }

    #[tokio::test]
    async fn test_priority_overtake() {
        let bus = MessageBus::new();
        bus.register_agent("b");

        bus.send(
            inform("a", "b")
                .with_priority(Priority::Low)
                .with_content(to_payload(json!({"p": "low"}))),
        );
        bus.send(
            inform("a", "b")
                .with_priority(Priority::Urgent)
                .with_content(to_payload(json!({"p": "urgent"}))),
        );

        let first = bus.receive("b", None).await.unwrap();
        assert_eq!(first.content.get("p"), Some(&json!("urgent")));
        let second = bus.receive("b", None).await.unwrap();
        assert_eq!(second.content.get("p"), Some(&json!("low")));
    }

    #[tokio::test]
    async fn test_fifo_within_priority() {
        let bus = MessageBus::new();
        bus.register_agent("b");

        for i in 0..10 {
            bus.send(inform("a", "b").with_content(to_payload(json!({"i": i}))));
        }
        for i in 0..10 {
            let msg = bus.receive("b", None).await.unwrap();
            assert_eq!(msg.content.get("i"), Some(&json!(i)));
        }
    }

    #[tokio::test]
    async fn test_unknown_recipient() {
        let bus = MessageBus::new();
        assert!(!bus.send(inform("a", "ghost")));
    }

    #[tokio::test]
    async fn test_full_inbox_rejects() {
        let bus = MessageBus::with_config(BusConfig {
            max_queue_size: 2,
            ..BusConfig::default()
        });
        bus.register_agent("b");

        assert!(bus.send(inform("a", "b")));
        assert!(bus.send(inform("a", "b")));
        assert!(!bus.send(inform("a", "b")));
        assert_eq!(bus.queue_size("b"), 2);
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let bus = MessageBus::new();
        bus.register_agent("a");
        bus.register_agent("b");
        bus.register_agent("c");

        assert!(bus.send(AgentMessage::new("a", None, MessageType::Broadcast)));
        assert_eq!(bus.queue_size("a"), 0);
        assert_eq!(bus.queue_size("b"), 1);
        assert_eq!(bus.queue_size("c"), 1);
    }

    #[tokio::test]
    async fn test_broadcast_continues_past_full_inbox() {
        let bus = MessageBus::with_config(BusConfig {
            max_queue_size: 1,
            ..BusConfig::default()
        });
        bus.register_agent("full");
        bus.register_agent("open");
        bus.send(inform("x", "full"));

        // "full" is at capacity but the broadcast still reaches "open".
        assert!(bus.send(AgentMessage::new("a", None, MessageType::Broadcast)));
        assert_eq!(bus.queue_size("full"), 1);
        assert_eq!(bus.queue_size("open"), 1);
    }

    #[tokio::test]
    async fn test_receive_timeout() {
        let bus = MessageBus::new();
        bus.register_agent("b");
        let got = bus.receive("b", Some(Duration::from_millis(20))).await;
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_receive_wakes_on_send() {
        let bus = MessageBus::new();
        bus.register_agent("b");

        let reader = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.receive("b", Some(Duration::from_secs(5))).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        bus.send(inform("a", "b"));

        let got = reader.await.unwrap();
        assert!(got.is_some());
    }

    #[tokio::test]
    async fn test_ttl_expiry_drops_message() {
        let bus = MessageBus::new();
        bus.register_agent("b");

        let mut stale = inform("a", "b").with_ttl(Duration::from_millis(10));
        stale.timestamp = SystemTime::now() - Duration::from_secs(1);
        bus.send(stale);

        // Single attempt: the expired message is dropped and None returned.
        assert!(bus.receive("b", Some(Duration::from_millis(20))).await.is_none());
        assert_eq!(bus.queue_size("b"), 0);
    }

    #[tokio::test]
    async fn test_request_response() {
        let bus = MessageBus::new();
        bus.register_agent("client");
        bus.register_agent("server");

        let server = {
            let bus = bus.clone();
            tokio::spawn(async move {
                let request = bus.receive("server", Some(Duration::from_secs(5))).await.unwrap();
                let response = AgentMessage::new(
                    "server",
                    Some(request.sender.clone()),
                    MessageType::Response,
                )
                .with_correlation_id(request.id.clone())
                .with_content(to_payload(json!({"ok": true})));
                bus.send(response);
            })
        };

        let response = bus
            .request(
                "client",
                "server",
                to_payload(json!({"q": "status"})),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(response.message_type, MessageType::Response);
        assert_eq!(response.content.get("ok"), Some(&json!(true)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_timeout_cleans_up() {
        let bus = MessageBus::new();
        bus.register_agent("client");
        bus.register_agent("server");

        let got = bus
            .request("client", "server", Payload::new(), Duration::from_millis(20))
            .await;
        assert!(got.is_none());
        assert!(bus.state.lock().pending.is_empty());
    }

    #[tokio::test]
    async fn test_pub_sub() {
        let bus = MessageBus::new();
        for name in ["a", "b", "c"] {
            bus.register_agent(name);
        }
        bus.subscribe("a", "alerts");
        bus.subscribe("b", "alerts");
        bus.subscribe("b", "alerts"); // duplicate ignored
        bus.subscribe("c", "other");

        let reached = bus.publish("a", "alerts", to_payload(json!({"level": "red"})));
        assert_eq!(reached, 1); // b only; sender excluded

        let msg = bus.receive("b", None).await.unwrap();
        assert_eq!(msg.topic.as_deref(), Some("alerts"));
        assert_eq!(msg.message_type, MessageType::Inform);
        assert_eq!(bus.subscribers("alerts"), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let bus = MessageBus::new();
        bus.register_agent("a");
        bus.subscribe("a", "alerts");
        assert!(bus.unsubscribe("a", "alerts"));
        assert!(!bus.unsubscribe("a", "alerts"));
        assert!(bus.subscribers("alerts").is_empty());
    }

    #[tokio::test]
    async fn test_unregister_scrubs_subscriptions() {
        let bus = MessageBus::new();
        bus.register_agent("a");
        bus.subscribe("a", "alerts");
        bus.unregister_agent("a");
        assert!(bus.subscribers("alerts").is_empty());
        assert!(bus.receive_nowait("a").is_none());
    }

    #[tokio::test]
    async fn test_message_log_bounded() {
        let bus = MessageBus::with_config(BusConfig {
            log_capacity: 3,
            ..BusConfig::default()
        });
        bus.register_agent("b");
        for i in 0..5 {
            bus.send(inform("a", "b").with_content(to_payload(json!({"i": i}))));
        }
        let log = bus.message_log(10);
        assert_eq!(log.len(), 3);
        assert_eq!(log[0].content.get("i"), Some(&json!(2)));
        assert_eq!(bus.message_log(2).len(), 2);
    }

    #[test]
    fn test_receive_nowait_sync() {
        let bus = MessageBus::new();
        bus.register_agent("b");
        assert!(bus.receive_nowait("b").is_none());
        bus.send(inform("a", "b"));
        assert!(bus.receive_nowait("b").is_some());
    }

    proptest::proptest! {
        /// Any mix of priorities dequeues sorted by rank, FIFO within a
        /// rank.
        #[test]
        fn prop_priority_then_fifo(ranks in proptest::collection::vec(0u8..4, 1..60)) {
            let bus = MessageBus::new();
            bus.register_agent("sink");
            for (i, rank) in ranks.iter().enumerate() {
                let priority = match rank {
                    0 => Priority::Urgent,
                    1 => Priority::High,
                    2 => Priority::Normal,
                    _ => Priority::Low,
                };
                bus.send(
                    inform("src", "sink")
                        .with_priority(priority)
                        .with_content(to_payload(json!({"seq": i}))),
                );
            }

            let mut last: Option<(u8, u64)> = None;
            while let Some(msg) = bus.receive_nowait("sink") {
                let rank = msg.priority.rank();
                let seq = msg.content["seq"].as_u64().unwrap();
                if let Some((prev_rank, prev_seq)) = last {
                    proptest::prop_assert!(rank >= prev_rank);
                    if rank == prev_rank {
                        proptest::prop_assert!(seq > prev_seq);
                    }
                }
                last = Some((rank, seq));
            }
        }
    }
}
