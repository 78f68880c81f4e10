//! Per-role update strategies.
//!
//! Each [`AgentRole`] maps to a stateless strategy object implementing
//! [`RoleBehavior`]. The trainer drives every agent through the same calls;
//! the strategy decides which agent capabilities those calls exercise and
//! which reward signal feeds them.

use super::agent::Agent;
use super::network::WeightSnapshot;
use super::training::buffer::Batch;
use super::types::AgentRole;

/// Per-node slices of a batch consumed by local updates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalInputs {
    pub observations: Vec<Vec<f64>>,
    pub next_observations: Vec<Vec<f64>>,
    pub state_actions: Vec<Vec<f64>>,
    pub own_rewards: Vec<f64>,
}

impl LocalInputs {
    /// Extracts the rows seen by `node`.
    pub fn for_node(batch: &Batch, node: usize) -> Self {
        Self {
            observations: batch.observations_of(node),
            next_observations: batch.next_observations_of(node),
            state_actions: batch.state_actions_of(node),
            own_rewards: batch.rewards_of(node),
        }
    }
}

/// Team-level reward information shared by every node in a cycle.
#[derive(Debug, Clone, Copy)]
pub struct RewardContext<'a> {
    /// Mean reward of the cooperative nodes at every time step.
    pub team: &'a [f64],
    /// Apply `team` to every role instead of each agent's own reward.
    pub common_reward: bool,
}

/// Parameters published by one node after its local update.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalUpdate {
    pub critic: WeightSnapshot,
    pub tr: WeightSnapshot,
    /// `None` when the role performed no critic update.
    pub critic_loss: Option<f64>,
    /// `None` when the role performed no TR update.
    pub tr_loss: Option<f64>,
}

/// Source of the advantage signal used by the actor update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorSignal {
    /// Team critic and TR estimate: `TR(sa) + γV(s') - V(s)`.
    TeamEstimate,
    /// Applied reward and the agent's private critic: `r + γV(s') - V(s)`.
    OwnReward,
}

/// Role-specific behavior of an agent during a cycle.
pub trait RoleBehavior: Send + Sync {
    fn role(&self) -> AgentRole;

    /// Whether the node receives and aggregates neighbor snapshots.
    fn joins_consensus(&self) -> bool {
        false
    }

    /// Whether the agent keeps a critic apart from the one it broadcasts.
    fn needs_private_critic(&self) -> bool {
        false
    }

    fn actor_signal(&self) -> ActorSignal {
        ActorSignal::OwnReward
    }

    /// Reward stream used by the agent's own (non-broadcast) updates.
    fn applied_reward<'a>(&self, own: &'a [f64], rewards: RewardContext<'a>) -> &'a [f64] {
        if rewards.common_reward {
            rewards.team
        } else {
            own
        }
    }

    /// Stage I: updates the agent and returns the snapshots it publishes.
    fn local_update(
        &self,
        agent: &mut Agent,
        inputs: &LocalInputs,
        rewards: RewardContext<'_>,
    ) -> LocalUpdate;
}

/// Honest participant running the full consensus protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct CooperativeRole;

impl RoleBehavior for CooperativeRole {
    fn role(&self) -> AgentRole {
        AgentRole::Cooperative
    }

    fn joins_consensus(&self) -> bool {
        true
    }

    fn actor_signal(&self) -> ActorSignal {
        ActorSignal::TeamEstimate
    }

    fn applied_reward<'a>(&self, _own: &'a [f64], rewards: RewardContext<'a>) -> &'a [f64] {
        rewards.team
    }

    fn local_update(
        &self,
        agent: &mut Agent,
        inputs: &LocalInputs,
        rewards: RewardContext<'_>,
    ) -> LocalUpdate {
        let r = self.applied_reward(&inputs.own_rewards, rewards);
        let (tr, tr_loss) = agent.tr_update_local(&inputs.state_actions, r);
        let (critic, critic_loss) =
            agent.critic_update_local(&inputs.observations, &inputs.next_observations, r);
        LocalUpdate {
            critic,
            tr,
            critic_loss: Some(critic_loss),
            tr_loss: Some(tr_loss),
        }
    }
}

/// Honest but selfish: learns from its own reward and ignores the team.
#[derive(Debug, Clone, Copy, Default)]
pub struct GreedyRole;

impl RoleBehavior for GreedyRole {
    fn role(&self) -> AgentRole {
        AgentRole::Greedy
    }

    fn local_update(
        &self,
        agent: &mut Agent,
        inputs: &LocalInputs,
        rewards: RewardContext<'_>,
    ) -> LocalUpdate {
        let r = self.applied_reward(&inputs.own_rewards, rewards);
        let (tr, tr_loss) = agent.tr_update_local(&inputs.state_actions, r);
        let (critic, critic_loss) =
            agent.critic_update_local(&inputs.observations, &inputs.next_observations, r);
        LocalUpdate {
            critic,
            tr,
            critic_loss: Some(critic_loss),
            tr_loss: Some(tr_loss),
        }
    }
}

/// Adversary flipping the sign of the team reward in what it broadcasts.
///
/// Its private critic follows its own reward; the critic and TR it
/// publishes chase `-r_team`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MaliciousRole;

impl RoleBehavior for MaliciousRole {
    fn role(&self) -> AgentRole {
        AgentRole::Malicious
    }

    fn needs_private_critic(&self) -> bool {
        true
    }

    fn local_update(
        &self,
        agent: &mut Agent,
        inputs: &LocalInputs,
        rewards: RewardContext<'_>,
    ) -> LocalUpdate {
        let r = self.applied_reward(&inputs.own_rewards, rewards);
        agent.critic_update_local(&inputs.observations, &inputs.next_observations, r);

        let attack: Vec<f64> = rewards.team.iter().map(|r| -r).collect();
        let (tr, tr_loss) = agent.tr_update_compromised(&inputs.state_actions, &attack);
        let (critic, critic_loss) = agent.critic_update_compromised(
            &inputs.observations,
            &inputs.next_observations,
            &attack,
        );
        LocalUpdate {
            critic,
            tr,
            critic_loss: Some(critic_loss),
            tr_loss: Some(tr_loss),
        }
    }
}

/// Unresponsive node: never trains and keeps broadcasting its initial weights.
#[derive(Debug, Clone, Copy, Default)]
pub struct FaultyRole;

impl RoleBehavior for FaultyRole {
    fn role(&self) -> AgentRole {
        AgentRole::Faulty
    }

    fn local_update(
        &self,
        agent: &mut Agent,
        _inputs: &LocalInputs,
        _rewards: RewardContext<'_>,
    ) -> LocalUpdate {
        LocalUpdate {
            critic: agent.get_critic_weights(),
            tr: agent.get_tr_weights(),
            critic_loss: None,
            tr_loss: None,
        }
    }
}

/// Strategy object of `role`.
pub fn behavior_for(role: AgentRole) -> &'static dyn RoleBehavior {
    match role {
        AgentRole::Cooperative => &CooperativeRole,
        AgentRole::Greedy => &GreedyRole,
        AgentRole::Malicious => &MaliciousRole,
        AgentRole::Faulty => &FaultyRole,
    }
}
