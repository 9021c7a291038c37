//! Team formation
//!
//! Teams are assembled from registered agent profiles by capability match
//! and available headroom. The first selected candidate leads; removing the
//! last leader promotes the first remaining member.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::message::Payload;
use crate::new_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamRole {
    Leader,
    Member,
    Specialist,
    Observer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamStatus {
    Forming,
    Active,
    Executing,
    Completed,
    Disbanded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamMember {
    pub agent_name: String,
    pub role: TeamRole,
    pub capabilities: Vec<String>,
    /// Current load in `[0, 1]` at the time the member joined.
    pub workload: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    pub id: String,
    pub name: String,
    pub objective: String,
    pub members: Vec<TeamMember>,
    pub required_capabilities: Vec<String>,
    pub status: TeamStatus,
    pub metadata: Payload,
}

#[derive(Debug, Clone)]
struct AgentProfile {
    agent_name: String,
    capabilities: Vec<String>,
    workload: f64,
}

struct ManagerState {
    teams: HashMap<String, Team>,
    /// Registration order is kept: candidate ties resolve to the agent
    /// registered first.
    profiles: Vec<AgentProfile>,
}

/// Capability and workload driven team manager.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct TeamManager {
    state: Arc<Mutex<ManagerState>>,
}

impl TeamManager {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ManagerState {
                teams: HashMap::new(),
                profiles: Vec::new(),
            })),
        }
    }

    /// Register an agent profile. Workload is clamped to `[0, 1]`;
    /// re-registration replaces the profile in place.
    pub fn register_agent(&self, agent_name: &str, capabilities: Vec<String>, workload: f64) {
        let mut state = self.state.lock();
        let workload = workload.clamp(0.0, 1.0);
        if let Some(profile) = state
            .profiles
            .iter_mut()
            .find(|p| p.agent_name == agent_name)
        {
            profile.capabilities = capabilities;
            profile.workload = workload;
        } else {
            state.profiles.push(AgentProfile {
                agent_name: agent_name.to_string(),
                capabilities,
                workload,
            });
        }
    }

    /// Update an agent's workload (clamped to `[0, 1]`). Unknown agents are
    /// ignored.
    pub fn update_workload(&self, agent_name: &str, workload: f64) {
        let mut state = self.state.lock();
        if let Some(profile) = state
            .profiles
            .iter_mut()
            .find(|p| p.agent_name == agent_name)
        {
            profile.workload = workload.clamp(0.0, 1.0);
        }
    }

    /// Create a team and auto-select up to `max_members` candidates.
    ///
    /// Candidates are scored `0.7·match_ratio + 0.3·(1 − workload)` where
    /// `match_ratio` is the fraction of required capabilities covered (1.0
    /// with no requirements); agents matching none of a non-empty
    /// requirement are skipped. The best-scoring candidate becomes leader.
    /// The team starts `Active` when any members were selected, `Forming`
    /// otherwise.
    pub fn create_team(
        &self,
        name: &str,
        objective: &str,
        required_capabilities: Vec<String>,
        max_members: usize,
        metadata: Payload,
    ) -> Team {
        let mut state = self.state.lock();
        let candidates = find_candidates(&state.profiles, &required_capabilities, max_members);

        let mut team = Team {
            id: new_id(),
            name: name.to_string(),
            objective: objective.to_string(),
            members: Vec::new(),
            required_capabilities,
            status: TeamStatus::Forming,
            metadata,
        };

        for (i, agent_name) in candidates.iter().enumerate() {
            let role = if i == 0 {
                TeamRole::Leader
            } else {
                TeamRole::Member
            };
            team.members.push(member_from_profile(
                &state.profiles,
                agent_name,
                role,
            ));
        }
        if !team.members.is_empty() {
            team.status = TeamStatus::Active;
        }

        state.teams.insert(team.id.clone(), team.clone());
        info!("team created: {} ({} members)", name, team.members.len());
        team
    }

    /// Add an agent to a team. Returns `None` for an unknown team or an
    /// agent that is already a member.
    pub fn add_member(&self, team_id: &str, agent_name: &str, role: TeamRole) -> Option<TeamMember> {
        let mut state = self.state.lock();
        let member = member_from_profile(&state.profiles, agent_name, role);
        let team = state.teams.get_mut(team_id)?;
        if team.members.iter().any(|m| m.agent_name == agent_name) {
            return None;
        }
        team.members.push(member.clone());
        info!("member added: {agent_name} -> team {}", team.name);
        Some(member)
    }

    /// Remove an agent from a team.
    ///
    /// If the removal leaves members but no leader, the first remaining
    /// member is promoted in the same step.
    pub fn remove_member(&self, team_id: &str, agent_name: &str) -> bool {
        let mut state = self.state.lock();
        let Some(team) = state.teams.get_mut(team_id) else {
            return false;
        };

        let before = team.members.len();
        team.members.retain(|m| m.agent_name != agent_name);
        if team.members.len() == before {
            return false;
        }

        if !team.members.iter().any(|m| m.role == TeamRole::Leader) {
            if let Some(next) = team.members.first_mut() {
                next.role = TeamRole::Leader;
            }
        }
        true
    }

    /// Change a member's role. Returns whether the member was found.
    pub fn assign_role(&self, team_id: &str, agent_name: &str, role: TeamRole) -> bool {
        let mut state = self.state.lock();
        let Some(team) = state.teams.get_mut(team_id) else {
            return false;
        };
        match team.members.iter_mut().find(|m| m.agent_name == agent_name) {
            Some(member) => {
                member.role = role;
                true
            }
            None => false,
        }
    }

    /// Disband a team, clearing its member list.
    pub fn disband_team(&self, team_id: &str) -> bool {
        let mut state = self.state.lock();
        let Some(team) = state.teams.get_mut(team_id) else {
            return false;
        };
        team.status = TeamStatus::Disbanded;
        team.members.clear();
        info!("team disbanded: {}", team.name);
        true
    }

    /// Teams (not disbanded) the agent belongs to.
    pub fn agent_teams(&self, agent_name: &str) -> Vec<Team> {
        self.state
            .lock()
            .teams
            .values()
            .filter(|team| {
                team.status != TeamStatus::Disbanded
                    && team.members.iter().any(|m| m.agent_name == agent_name)
            })
            .cloned()
            .collect()
    }

    /// The team's leader, if any.
    pub fn team_leader(&self, team_id: &str) -> Option<String> {
        let state = self.state.lock();
        state
            .teams
            .get(team_id)?
            .members
            .iter()
            .find(|m| m.role == TeamRole::Leader)
            .map(|m| m.agent_name.clone())
    }

    /// Sorted union of every member's capabilities.
    pub fn team_capabilities(&self, team_id: &str) -> Vec<String> {
        let state = self.state.lock();
        let Some(team) = state.teams.get(team_id) else {
            return Vec::new();
        };
        let mut capabilities: Vec<String> = team
            .members
            .iter()
            .flat_map(|m| m.capabilities.iter().cloned())
            .collect();
        capabilities.sort_unstable();
        capabilities.dedup();
        capabilities
    }

    /// Teams currently active or executing.
    pub fn active_teams(&self) -> Vec<Team> {
        self.state
            .lock()
            .teams
            .values()
            .filter(|team| matches!(team.status, TeamStatus::Active | TeamStatus::Executing))
            .cloned()
            .collect()
    }

    /// Snapshot of a team.
    pub fn team(&self, team_id: &str) -> Option<Team> {
        self.state.lock().teams.get(team_id).cloned()
    }
}

impl Default for TeamManager {
    fn default() -> Self {
        Self::new()
    }
}

fn member_from_profile(profiles: &[AgentProfile], agent_name: &str, role: TeamRole) -> TeamMember {
    let profile = profiles.iter().find(|p| p.agent_name == agent_name);
    TeamMember {
        agent_name: agent_name.to_string(),
        role,
        capabilities: profile.map(|p| p.capabilities.clone()).unwrap_or_default(),
        workload: profile.map(|p| p.workload).unwrap_or(0.0),
    }
}

/// Score and rank candidates. The sort is stable, so equal scores keep
/// profile registration order.
fn find_candidates(
    profiles: &[AgentProfile],
    required_capabilities: &[String],
    max_count: usize,
) -> Vec<String> {
    let mut scored: Vec<(f64, &str)> = Vec::new();
    for profile in profiles {
        let matched = required_capabilities
            .iter()
            .filter(|cap| profile.capabilities.contains(cap))
            .count();
        if !required_capabilities.is_empty() && matched == 0 {
            continue;
        }
        let match_ratio = if required_capabilities.is_empty() {
            1.0
        } else {
            matched as f64 / required_capabilities.len() as f64
        };
        let score = 0.7 * match_ratio + 0.3 * (1.0 - profile.workload);
        scored.push((score, &profile.agent_name));
    }
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored
        .into_iter()
        .take(max_count)
        .map(|(_, name)| name.to_string())
        .collect()
}
