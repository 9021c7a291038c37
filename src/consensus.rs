//! Consensus voting
//!
//! Topic-scoped vote sessions resolved by simple majority, unanimity,
//! weighted tallies, or an approval quorum. A resolved session is frozen:
//! further votes are rejected and `resolve` keeps returning the stored
//! result.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::new_id;

/// Resolution method for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusMethod {
    Majority,
    Unanimous,
    Weighted,
    Quorum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteType {
    Approve,
    Reject,
    Abstain,
}

/// One agent's vote within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    pub id: String,
    pub agent_name: String,
    pub vote_type: VoteType,
    pub weight: f64,
    pub reason: String,
}

/// A voting round. Within a session every agent votes at most once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusSession {
    pub id: String,
    pub topic: String,
    pub method: ConsensusMethod,
    /// Participation (and, for the quorum method, approval) threshold.
    pub quorum: f64,
    pub votes: Vec<Vote>,
    pub resolved: bool,
    pub result: Option<VoteType>,
}

/// Vote tallies for a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub topic: String,
    pub method: ConsensusMethod,
    pub total_votes: usize,
    pub approve: usize,
    pub reject: usize,
    pub abstain: usize,
    pub resolved: bool,
    pub result: Option<VoteType>,
}

struct BuilderState {
    sessions: HashMap<String, ConsensusSession>,
    weights: HashMap<String, f64>,
}

/// Creates vote sessions and resolves them.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct ConsensusBuilder {
    state: Arc<Mutex<BuilderState>>,
}

impl ConsensusBuilder {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BuilderState {
                sessions: HashMap::new(),
                weights: HashMap::new(),
            })),
        }
    }

    /// Set an agent's vote weight, clamped to be non-negative.
    ///
    /// Agents without an explicit weight vote with weight 1.0.
    pub fn set_agent_weight(&self, agent_name: &str, weight: f64) {
        self.state
            .lock()
            .weights
            .insert(agent_name.to_string(), weight.max(0.0));
    }

    /// Open a new vote session.
    pub fn create_session(
        &self,
        topic: &str,
        method: ConsensusMethod,
        quorum: f64,
    ) -> ConsensusSession {
        let session = ConsensusSession {
            id: new_id(),
            topic: topic.to_string(),
            method,
            quorum,
            votes: Vec::new(),
            resolved: false,
            result: None,
        };
        self.state
            .lock()
            .sessions
            .insert(session.id.clone(), session.clone());
        info!(
            "consensus session created: {} (method={:?}, topic={})",
            session.id, method, topic
        );
        session
    }

    /// Cast a vote.
    ///
    /// Returns `None` for an unknown or resolved session, or when the agent
    /// has already voted.
    pub fn cast_vote(
        &self,
        session_id: &str,
        agent_name: &str,
        vote_type: VoteType,
        reason: &str,
    ) -> Option<Vote> {
        let mut state = self.state.lock();
        let weight = state.weights.get(agent_name).copied().unwrap_or(1.0);
        let session = state.sessions.get_mut(session_id)?;

        if session.resolved {
            warn!("session already resolved: {session_id}");
            return None;
        }
        if session.votes.iter().any(|v| v.agent_name == agent_name) {
            warn!("agent has already voted: {agent_name}");
            return None;
        }

        let vote = Vote {
            id: new_id(),
            agent_name: agent_name.to_string(),
            vote_type,
            weight,
            reason: reason.to_string(),
        };
        session.votes.push(vote.clone());
        debug!("vote cast: {agent_name} -> {vote_type:?} (weight={weight:.1})");
        Some(vote)
    }

    /// Resolve a session.
    ///
    /// An already-resolved session returns its stored result. With no votes
    /// the session is unresolvable and `None` is returned. When
    /// `total_agents` is supplied and positive, participation below the
    /// session quorum also yields `None`; the session stays open and can be
    /// resolved later.
    pub fn resolve(&self, session_id: &str, total_agents: Option<usize>) -> Option<VoteType> {
        let mut state = self.state.lock();
        let session = state.sessions.get_mut(session_id)?;

        if session.resolved {
            return session.result;
        }
        if session.votes.is_empty() {
            return None;
        }

        if let Some(total) = total_agents {
            if total > 0 {
                let participation = session.votes.len() as f64 / total as f64;
                if participation < session.quorum {
                    warn!(
                        "quorum not met: {:.0}% < {:.0}%",
                        participation * 100.0,
                        session.quorum * 100.0
                    );
                    return None;
                }
            }
        }

        let result = match session.method {
            ConsensusMethod::Majority => resolve_majority(&session.votes),
            ConsensusMethod::Unanimous => resolve_unanimous(&session.votes),
            ConsensusMethod::Weighted => resolve_weighted(&session.votes),
            ConsensusMethod::Quorum => resolve_quorum(&session.votes, session.quorum),
        };

        session.resolved = true;
        session.result = Some(result);
        info!("consensus result: {session_id} -> {result:?}");
        Some(result)
    }

    /// Snapshot of a session.
    pub fn session(&self, session_id: &str) -> Option<ConsensusSession> {
        self.state.lock().sessions.get(session_id).cloned()
    }

    /// Vote tallies for a session.
    pub fn session_summary(&self, session_id: &str) -> Option<SessionSummary> {
        let state = self.state.lock();
        let session = state.sessions.get(session_id)?;
        let count =
            |kind: VoteType| session.votes.iter().filter(|v| v.vote_type == kind).count();
        Some(SessionSummary {
            topic: session.topic.clone(),
            method: session.method,
            total_votes: session.votes.len(),
            approve: count(VoteType::Approve),
            reject: count(VoteType::Reject),
            abstain: count(VoteType::Abstain),
            resolved: session.resolved,
            result: session.result,
        })
    }
}

impl Default for ConsensusBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// More approves than rejects wins; abstains are ignored; ties abstain.
fn resolve_majority(votes: &[Vote]) -> VoteType {
    let approve = votes
        .iter()
        .filter(|v| v.vote_type == VoteType::Approve)
        .count();
    let reject = votes
        .iter()
        .filter(|v| v.vote_type == VoteType::Reject)
        .count();
    match approve.cmp(&reject) {
        std::cmp::Ordering::Greater => VoteType::Approve,
        std::cmp::Ordering::Less => VoteType::Reject,
        std::cmp::Ordering::Equal => VoteType::Abstain,
    }
}

/// Approve only if every non-abstain vote approves. All-abstain abstains.
fn resolve_unanimous(votes: &[Vote]) -> VoteType {
    let mut saw_vote = false;
    for vote in votes {
        match vote.vote_type {
            VoteType::Abstain => continue,
            VoteType::Approve => saw_vote = true,
            VoteType::Reject => return VoteType::Reject,
        }
    }
    if saw_vote {
        VoteType::Approve
    } else {
        VoteType::Abstain
    }
}

/// Higher summed weight wins; abstains are ignored; ties abstain.
fn resolve_weighted(votes: &[Vote]) -> VoteType {
    let approve_weight: f64 = votes
        .iter()
        .filter(|v| v.vote_type == VoteType::Approve)
        .map(|v| v.weight)
        .sum();
    let reject_weight: f64 = votes
        .iter()
        .filter(|v| v.vote_type == VoteType::Reject)
        .map(|v| v.weight)
        .sum();
    if approve_weight > reject_weight {
        VoteType::Approve
    } else if reject_weight > approve_weight {
        VoteType::Reject
    } else {
        VoteType::Abstain
    }
}

/// Approve when the approval ratio of non-abstain votes reaches the quorum.
fn resolve_quorum(votes: &[Vote], quorum: f64) -> VoteType {
    let non_abstain: Vec<&Vote> = votes
        .iter()
        .filter(|v| v.vote_type != VoteType::Abstain)
        .collect();
    if non_abstain.is_empty() {
        return VoteType::Abstain;
    }
    let approve = non_abstain
        .iter()
        .filter(|v| v.vote_type == VoteType::Approve)
        .count();
    if approve as f64 / non_abstain.len() as f64 >= quorum {
        VoteType::Approve
    } else {
        VoteType::Reject
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_majority_approves() {
        let builder = ConsensusBuilder::new();
        let session = builder.create_session("ship it", ConsensusMethod::Majority, 0.5);
        builder.cast_vote(&session.id, "a", VoteType::Approve, "");
        builder.cast_vote(&session.id, "b", VoteType::Approve, "");
        builder.cast_vote(&session.id, "c", VoteType::Reject, "");

        assert_eq!(builder.resolve(&session.id, None), Some(VoteType::Approve));
        // Idempotent: resolving again returns the stored result.
        assert_eq!(builder.resolve(&session.id, None), Some(VoteType::Approve));
    }

    #[test]
    fn test_majority_tie_abstains() {
        let builder = ConsensusBuilder::new();
        let session = builder.create_session("split", ConsensusMethod::Majority, 0.5);
        builder.cast_vote(&session.id, "a", VoteType::Approve, "");
        builder.cast_vote(&session.id, "b", VoteType::Reject, "");
        builder.cast_vote(&session.id, "c", VoteType::Abstain, "");
        assert_eq!(builder.resolve(&session.id, None), Some(VoteType::Abstain));
    }

    #[test]
    fn test_unanimous() {
        let builder = ConsensusBuilder::new();
        let session = builder.create_session("all in", ConsensusMethod::Unanimous, 0.5);
        builder.cast_vote(&session.id, "a", VoteType::Approve, "");
        builder.cast_vote(&session.id, "b", VoteType::Abstain, "");
        builder.cast_vote(&session.id, "c", VoteType::Approve, "");
        assert_eq!(builder.resolve(&session.id, None), Some(VoteType::Approve));

        let spoiled = builder.create_session("one holdout", ConsensusMethod::Unanimous, 0.5);
        builder.cast_vote(&spoiled.id, "a", VoteType::Approve, "");
        builder.cast_vote(&spoiled.id, "b", VoteType::Reject, "too risky");
        assert_eq!(builder.resolve(&spoiled.id, None), Some(VoteType::Reject));

        let empty = builder.create_session("nobody", ConsensusMethod::Unanimous, 0.5);
        builder.cast_vote(&empty.id, "a", VoteType::Abstain, "");
        assert_eq!(builder.resolve(&empty.id, None), Some(VoteType::Abstain));
    }

    #[test]
    fn test_weighted_override() {
        let builder = ConsensusBuilder::new();
        builder.set_agent_weight("senior", 5.0);
        builder.set_agent_weight("junior", 1.0);

        let session = builder.create_session("refactor", ConsensusMethod::Weighted, 0.5);
        builder.cast_vote(&session.id, "senior", VoteType::Reject, "");
        builder.cast_vote(&session.id, "junior", VoteType::Approve, "");
        assert_eq!(builder.resolve(&session.id, None), Some(VoteType::Reject));
    }

    #[test]
    fn test_weighted_tie_abstains() {
        let builder = ConsensusBuilder::new();
        let session = builder.create_session("even", ConsensusMethod::Weighted, 0.5);
        builder.cast_vote(&session.id, "a", VoteType::Approve, "");
        builder.cast_vote(&session.id, "b", VoteType::Reject, "");
        assert_eq!(builder.resolve(&session.id, None), Some(VoteType::Abstain));
    }

    #[test]
    fn test_quorum_method() {
        let builder = ConsensusBuilder::new();
        let session = builder.create_session("supermajority", ConsensusMethod::Quorum, 0.66);
        builder.cast_vote(&session.id, "a", VoteType::Approve, "");
        builder.cast_vote(&session.id, "b", VoteType::Approve, "");
        builder.cast_vote(&session.id, "c", VoteType::Reject, "");
        builder.cast_vote(&session.id, "d", VoteType::Abstain, "");
        // 2/3 non-abstain approvals ≈ 0.67 >= 0.66.
        assert_eq!(builder.resolve(&session.id, None), Some(VoteType::Approve));
    }

    #[test]
    fn test_participation_gate() {
        let builder = ConsensusBuilder::new();
        let session = builder.create_session("needs turnout", ConsensusMethod::Majority, 0.5);
        builder.cast_vote(&session.id, "a", VoteType::Approve, "");

        // 1 of 10 possible voters < 50% participation.
        assert_eq!(builder.resolve(&session.id, Some(10)), None);
        assert!(!builder.session(&session.id).unwrap().resolved);

        // More turnout makes the same session resolvable.
        for name in ["b", "c", "d", "e"] {
            builder.cast_vote(&session.id, name, VoteType::Approve, "");
        }
        assert_eq!(
            builder.resolve(&session.id, Some(10)),
            Some(VoteType::Approve)
        );
    }

    #[test]
    fn test_duplicate_voter_rejected() {
        let builder = ConsensusBuilder::new();
        let session = builder.create_session("once each", ConsensusMethod::Majority, 0.5);
        assert!(builder
            .cast_vote(&session.id, "a", VoteType::Approve, "")
            .is_some());
        assert!(builder
            .cast_vote(&session.id, "a", VoteType::Reject, "changed my mind")
            .is_none());
        assert_eq!(builder.session(&session.id).unwrap().votes.len(), 1);
    }

    #[test]
    fn test_resolved_session_frozen() {
        let builder = ConsensusBuilder::new();
        let session = builder.create_session("done", ConsensusMethod::Majority, 0.5);
        builder.cast_vote(&session.id, "a", VoteType::Approve, "");
        builder.resolve(&session.id, None);
        assert!(builder
            .cast_vote(&session.id, "b", VoteType::Reject, "too late")
            .is_none());
    }

    #[test]
    fn test_empty_and_unknown_sessions() {
        let builder = ConsensusBuilder::new();
        let session = builder.create_session("silence", ConsensusMethod::Majority, 0.5);
        assert_eq!(builder.resolve(&session.id, None), None);
        assert_eq!(builder.resolve("missing", None), None);
        assert!(builder.cast_vote("missing", "a", VoteType::Approve, "").is_none());
    }

    #[test]
    fn test_weight_clamped_non_negative() {
        let builder = ConsensusBuilder::new();
        builder.set_agent_weight("gremlin", -3.0);
        let session = builder.create_session("w", ConsensusMethod::Weighted, 0.5);
        let vote = builder
            .cast_vote(&session.id, "gremlin", VoteType::Approve, "")
            .unwrap();
        assert_eq!(vote.weight, 0.0);
    }

    #[test]
    fn test_session_summary() {
        let builder = ConsensusBuilder::new();
        let session = builder.create_session("tally", ConsensusMethod::Majority, 0.5);
        builder.cast_vote(&session.id, "a", VoteType::Approve, "");
        builder.cast_vote(&session.id, "b", VoteType::Reject, "");
        builder.cast_vote(&session.id, "c", VoteType::Abstain, "");

        let summary = builder.session_summary(&session.id).unwrap();
        assert_eq!(summary.total_votes, 3);
        assert_eq!(summary.approve, 1);
        assert_eq!(summary.reject, 1);
        assert_eq!(summary.abstain, 1);
        assert!(!summary.resolved);
    }

    proptest! {
        /// Voter names are unique within a session no matter how votes are
        /// interleaved.
        #[test]
        fn prop_no_duplicate_voters(names in proptest::collection::vec("[a-e]", 1..30)) {
            let builder = ConsensusBuilder::new();
            let session = builder.create_session("prop", ConsensusMethod::Majority, 0.5);
            for name in &names {
                builder.cast_vote(&session.id, name, VoteType::Approve, "");
            }
            let votes = builder.session(&session.id).unwrap().votes;
            let mut seen: Vec<&str> = votes.iter().map(|v| v.agent_name.as_str()).collect();
            seen.sort_unstable();
            let total = seen.len();
            seen.dedup();
            prop_assert_eq!(seen.len(), total);
        }
    }
}
