//! Troupe: in-process multi-agent collaboration substrate
//!
//! A fleet of named agents coordinates through six subsystems that share a
//! common namespace of string agent names:
//! - [`MessageBus`] — per-agent priority inboxes, pub/sub, request/response
//! - [`Blackboard`] — namespaced shared state with versioning and watchers
//! - [`SyncBarrier`] / [`MutexLock`] — rendezvous and exclusive access
//! - [`ConsensusBuilder`] — vote sessions with four resolution methods
//! - [`NegotiationManager`] — Contract Net Protocol task auctions
//! - [`TeamManager`] — capability and workload driven team formation
//! - [`WorkflowEngine`] — DAG orchestration through a caller-supplied executor
//!
//! The substrate never runs agent logic itself: agents are opaque names, and
//! task execution is delegated to an [`Executor`] callback. Subsystems do not
//! call each other; they compose through caller code. All failure modes are
//! value-returned (`bool` / `Option`) — the public surface does not panic.
//!
//! # Example
//! ```no_run
//! use troupe::prelude::*;
//!
//! #[tokio::main]
//! async fn main() {
//!     let bus = MessageBus::new();
//!     bus.register_agent("researcher");
//!     bus.register_agent("writer");
//!
//!     let msg = AgentMessage::new("researcher", Some("writer".into()), MessageType::Inform)
//!         .with_priority(Priority::High);
//!     bus.send(msg);
//!
//!     if let Some(received) = bus.receive("writer", None).await {
//!         println!("writer got: {:?}", received.message_type);
//!     }
//! }
//! ```

pub mod barrier;
pub mod blackboard;
pub mod bus;
pub mod consensus;
pub mod lock;
pub mod message;
pub mod negotiation;
pub mod team;
pub mod workflow;

pub mod prelude {
    pub use crate::barrier::*;
    pub use crate::blackboard::*;
    pub use crate::bus::*;
    pub use crate::consensus::*;
    pub use crate::lock::*;
    pub use crate::message::*;
    pub use crate::negotiation::*;
    pub use crate::team::*;
    pub use crate::workflow::*;
}

// Re-exports
pub use barrier::SyncBarrier;
pub use blackboard::{Blackboard, WriteRecord};
pub use bus::{BusConfig, MessageBus, SendError};
pub use consensus::{ConsensusBuilder, ConsensusMethod, ConsensusSession, Vote, VoteType};
pub use lock::MutexLock;
pub use message::{AgentMessage, MessageType, Payload, Priority, Subscription};
pub use negotiation::{Bid, BidStatus, Negotiation, NegotiationManager, NegotiationState};
pub use team::{Team, TeamManager, TeamMember, TeamRole, TeamStatus};
pub use workflow::{
    Executor, NodeKind, WorkflowDefinition, WorkflowEngine, WorkflowNode, WorkflowResult,
    WorkflowStatus,
};

/// Generate a fresh unique identifier.
///
/// Every entity in the substrate (message, bid, session, team, workflow,
/// node) is keyed by one of these; uniqueness holds for the process lifetime.
pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
