//! Contract Net Protocol
//!
//! Task auctions: an initiator opens a call for proposals, eligible agents
//! bid, and a weighted evaluation over capability, price and duration picks
//! the winner.

use std::collections::HashMap as StdHashMap;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::message::Payload;
use crate::new_id;

/// Negotiation lifecycle. Transitions are linear
/// (`Open → Bidding → Awarded|Failed → Completed`); `Cancelled` is reachable
/// from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationState {
    Open,
    Bidding,
    Awarded,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BidStatus {
    Pending,
    Accepted,
    Rejected,
    Withdrawn,
}

/// One agent's offer on a negotiation. Status is mutated only by the
/// negotiation that owns the bid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bid {
    pub id: String,
    pub agent_name: String,
    pub negotiation_id: String,
    pub price: f64,
    /// Self-reported fit for the task, in `[0, 1]`.
    pub capability_score: f64,
    pub estimated_duration: f64,
    pub proposal: Payload,
    pub status: BidStatus,
}

/// A single task auction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Negotiation {
    pub id: String,
    pub task_description: String,
    pub initiator: String,
    pub state: NegotiationState,
    pub required_capabilities: Vec<String>,
    /// Criterion name -> weight used by bid evaluation.
    pub criteria: StdHashMap<String, f64>,
    pub bids: Vec<Bid>,
    pub winner: Option<String>,
    pub deadline_secs: f64,
}

/// Default evaluation criteria: capability 0.5, price 0.3, duration 0.2.
pub fn default_criteria() -> StdHashMap<String, f64> {
    StdHashMap::from([
        ("capability_score".to_string(), 0.5),
        ("price".to_string(), 0.3),
        ("estimated_duration".to_string(), 0.2),
    ])
}

struct CapabilityProfile {
    agent_name: String,
    capabilities: Vec<String>,
}

struct ManagerState {
    negotiations: HashMap<String, Negotiation>,
    /// Registration order is kept so eligibility listings are deterministic.
    capabilities: Vec<CapabilityProfile>,
}

/// Contract Net Protocol negotiation manager.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct NegotiationManager {
    state: Arc<Mutex<ManagerState>>,
}

impl NegotiationManager {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ManagerState {
                negotiations: HashMap::new(),
                capabilities: Vec::new(),
            })),
        }
    }

    /// Record an agent's capabilities, replacing any previous list.
    pub fn register_capabilities(&self, agent_name: &str, capabilities: Vec<String>) {
        let mut state = self.state.lock();
        debug!("capabilities registered: {agent_name} -> {capabilities:?}");
        if let Some(profile) = state
            .capabilities
            .iter_mut()
            .find(|p| p.agent_name == agent_name)
        {
            profile.capabilities = capabilities;
        } else {
            state.capabilities.push(CapabilityProfile {
                agent_name: agent_name.to_string(),
                capabilities,
            });
        }
    }

    /// Open a call for proposals. The negotiation starts accepting bids
    /// immediately.
    pub fn create_cfp(
        &self,
        initiator: &str,
        task_description: &str,
        required_capabilities: Vec<String>,
        criteria: Option<StdHashMap<String, f64>>,
        deadline_secs: f64,
    ) -> Negotiation {
        let negotiation = Negotiation {
            id: new_id(),
            task_description: task_description.to_string(),
            initiator: initiator.to_string(),
            state: NegotiationState::Bidding,
            required_capabilities,
            criteria: criteria.unwrap_or_else(default_criteria),
            bids: Vec::new(),
            winner: None,
            deadline_secs,
        };
        self.state
            .lock()
            .negotiations
            .insert(negotiation.id.clone(), negotiation.clone());
        info!("cfp created: {} (initiator={})", negotiation.id, initiator);
        negotiation
    }

    /// Agents whose capability set covers every required capability.
    ///
    /// An empty requirement matches all registered agents. Results are in
    /// registration order.
    pub fn eligible_agents(&self, required_capabilities: &[String]) -> Vec<String> {
        let state = self.state.lock();
        state
            .capabilities
            .iter()
            .filter(|profile| {
                required_capabilities
                    .iter()
                    .all(|cap| profile.capabilities.contains(cap))
            })
            .map(|profile| profile.agent_name.clone())
            .collect()
    }

    /// Submit a bid. Returns `None` when the negotiation is unknown or no
    /// longer accepting bids.
    pub fn submit_bid(
        &self,
        negotiation_id: &str,
        agent_name: &str,
        price: f64,
        capability_score: f64,
        estimated_duration: f64,
        proposal: Payload,
    ) -> Option<Bid> {
        let mut state = self.state.lock();
        let Some(negotiation) = state.negotiations.get_mut(negotiation_id) else {
            warn!("negotiation not found: {negotiation_id}");
            return None;
        };
        if negotiation.state != NegotiationState::Bidding {
            warn!(
                "negotiation not accepting bids: {negotiation_id} (state={:?})",
                negotiation.state
            );
            return None;
        }

        let bid = Bid {
            id: new_id(),
            agent_name: agent_name.to_string(),
            negotiation_id: negotiation_id.to_string(),
            price,
            capability_score,
            estimated_duration,
            proposal,
            status: BidStatus::Pending,
        };
        negotiation.bids.push(bid.clone());
        info!(
            "bid submitted: {agent_name} -> negotiation {negotiation_id} \
             (score={capability_score:.2}, price={price:.2})"
        );
        Some(bid)
    }

    /// Evaluate pending bids and award the negotiation.
    ///
    /// Each bid is scored as
    /// `w_cap·capability + w_price·(1 − price/max_price) + w_dur·(1 − duration/max_duration)`
    /// with maxima clamped to at least 1.0. The strictly highest score wins;
    /// ties keep the earliest bid. The winner is accepted, every other
    /// pending bid is rejected, and the state moves to `Awarded`. With no
    /// pending bids the negotiation fails and `None` is returned.
    pub fn evaluate_bids(&self, negotiation_id: &str) -> Option<String> {
        let mut state = self.state.lock();
        let negotiation = state.negotiations.get_mut(negotiation_id)?;

        let pending: Vec<usize> = negotiation
            .bids
            .iter()
            .enumerate()
            .filter(|(_, bid)| bid.status == BidStatus::Pending)
            .map(|(i, _)| i)
            .collect();
        if pending.is_empty() {
            negotiation.state = NegotiationState::Failed;
            return None;
        }

        let max_price = pending
            .iter()
            .map(|&i| negotiation.bids[i].price)
            .fold(1.0_f64, f64::max);
        let max_duration = pending
            .iter()
            .map(|&i| negotiation.bids[i].estimated_duration)
            .fold(1.0_f64, f64::max);

        let weight = |name: &str, default: f64| {
            negotiation.criteria.get(name).copied().unwrap_or(default)
        };
        let cap_weight = weight("capability_score", 0.5);
        let price_weight = weight("price", 0.3);
        let duration_weight = weight("estimated_duration", 0.2);

        let mut best_score = -1.0_f64;
        let mut best: Option<usize> = None;
        for &i in &pending {
            let bid = &negotiation.bids[i];
            let score = cap_weight * bid.capability_score
                + price_weight * (1.0 - bid.price / max_price)
                + duration_weight * (1.0 - bid.estimated_duration / max_duration);
            if score > best_score {
                best_score = score;
                best = Some(i);
            }
        }
        let Some(winner_idx) = best else {
            negotiation.state = NegotiationState::Failed;
            return None;
        };

        for &i in &pending {
            negotiation.bids[i].status = if i == winner_idx {
                BidStatus::Accepted
            } else {
                BidStatus::Rejected
            };
        }
        let winner = negotiation.bids[winner_idx].agent_name.clone();
        negotiation.winner = Some(winner.clone());
        negotiation.state = NegotiationState::Awarded;

        info!("negotiation awarded: {negotiation_id} -> {winner} (score={best_score:.3})");
        Some(winner)
    }

    /// Mark an awarded negotiation as completed.
    pub fn complete_negotiation(&self, negotiation_id: &str) -> bool {
        let mut state = self.state.lock();
        let Some(negotiation) = state.negotiations.get_mut(negotiation_id) else {
            return false;
        };
        if negotiation.state == NegotiationState::Awarded {
            negotiation.state = NegotiationState::Completed;
            true
        } else {
            false
        }
    }

    /// Cancel a negotiation from any non-terminal state.
    ///
    /// Still-pending bids are marked withdrawn.
    pub fn cancel_negotiation(&self, negotiation_id: &str) -> bool {
        let mut state = self.state.lock();
        let Some(negotiation) = state.negotiations.get_mut(negotiation_id) else {
            return false;
        };
        if matches!(
            negotiation.state,
            NegotiationState::Completed | NegotiationState::Cancelled
        ) {
            return false;
        }
        negotiation.state = NegotiationState::Cancelled;
        for bid in &mut negotiation.bids {
            if bid.status == BidStatus::Pending {
                bid.status = BidStatus::Withdrawn;
            }
        }
        true
    }

    /// How many negotiations an agent has won (awarded or completed).
    pub fn agent_wins(&self, agent_name: &str) -> usize {
        self.state
            .lock()
            .negotiations
            .values()
            .filter(|n| {
                n.winner.as_deref() == Some(agent_name)
                    && matches!(
                        n.state,
                        NegotiationState::Awarded | NegotiationState::Completed
                    )
            })
            .count()
    }

    /// Negotiations still open or collecting bids.
    pub fn active_negotiations(&self) -> Vec<Negotiation> {
        self.state
            .lock()
            .negotiations
            .values()
            .filter(|n| matches!(n.state, NegotiationState::Open | NegotiationState::Bidding))
            .cloned()
            .collect()
    }

    /// Snapshot of a negotiation.
    pub fn negotiation(&self, negotiation_id: &str) -> Option<Negotiation> {
        self.state.lock().negotiations.get(negotiation_id).cloned()
    }
}

impl Default for NegotiationManager {
    fn default() -> Self {
        Self::new()
    }
}
