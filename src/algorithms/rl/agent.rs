//! Learning agent with actor, critic and team-average reward approximators.

use std::fmt;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use super::config::TrainingConfig;
use super::network::{
    sample_categorical, NetworkFactory, PolicyFunction, ValueFunction, WeightSnapshot,
};
use super::role::{behavior_for, ActorSignal, RewardContext, RoleBehavior};
use super::training::buffer::{Batch, Observation};
use super::types::AgentRole;
use crate::algorithms::consensus::{hidden_consensus, output_consensus, Aggregator};

/// Input and output sizes of an agent's approximators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentDims {
    /// Width of one observation row.
    pub observation_dim: usize,
    /// Number of agents (length of the joint action).
    pub n_agents: usize,
    /// Number of discrete actions.
    pub n_actions: usize,
}

impl AgentDims {
    /// Width of a TR input: observation row followed by the joint action.
    pub fn state_action_dim(&self) -> usize {
        self.observation_dim + self.n_agents
    }
}

/// Exported parameters of one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentParameters {
    pub node: usize,
    pub role: AgentRole,
    pub actor: WeightSnapshot,
    /// The critic the agent broadcasts.
    pub critic: WeightSnapshot,
    pub tr: WeightSnapshot,
    /// Critic kept apart from the broadcast one (malicious agents only).
    pub private_critic: Option<WeightSnapshot>,
}

/// A single node of the network.
///
/// Owns its approximators exclusively; other nodes only ever see them
/// through exported [`WeightSnapshot`]s. Which capabilities are exercised
/// during a cycle is decided by the agent's [`RoleBehavior`].
pub struct Agent {
    node: usize,
    behavior: &'static dyn RoleBehavior,
    gamma: f64,
    actor: Box<dyn PolicyFunction>,
    critic: Box<dyn ValueFunction>,
    tr: Box<dyn ValueFunction>,
    private_critic: Option<Box<dyn ValueFunction>>,
    rng: StdRng,
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("node", &self.node)
            .field("role", &self.role())
            .field("gamma", &self.gamma)
            .finish_non_exhaustive()
    }
}

impl Agent {
    /// Creates agent `node` with freshly initialized approximators.
    pub fn new(
        node: usize,
        role: AgentRole,
        dims: AgentDims,
        config: &TrainingConfig,
        factory: &mut dyn NetworkFactory,
    ) -> Self {
        let behavior = behavior_for(role);
        let net = &config.network;
        let actor = factory.policy(dims.observation_dim, dims.n_actions, net.actor_lr);
        let critic = factory.value_function(dims.observation_dim, net.critic_lr);
        let tr = factory.value_function(dims.state_action_dim(), net.tr_lr);
        let private_critic = behavior
            .needs_private_critic()
            .then(|| factory.value_function(dims.observation_dim, net.critic_lr));
        let seed = config
            .seed
            .wrapping_add((node as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15));
        Self {
            node,
            behavior,
            gamma: config.gamma,
            actor,
            critic,
            tr,
            private_critic,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn node(&self) -> usize {
        self.node
    }

    pub fn role(&self) -> AgentRole {
        self.behavior.role()
    }

    pub fn behavior(&self) -> &'static dyn RoleBehavior {
        self.behavior
    }

    /// Samples an action from the policy for this agent's observation row.
    pub fn get_action(&mut self, observation: &Observation) -> usize {
        let probs = self.actor.probabilities(&observation[self.node]);
        sample_categorical(&probs, &mut self.rng)
    }

    /// Value of the current observation under the broadcast critic.
    pub fn estimated_return(&self, observation: &Observation) -> f64 {
        self.critic
            .predict(std::slice::from_ref(&observation[self.node]))
            .first()
            .copied()
            .unwrap_or(f64::NAN)
    }

    pub fn get_parameters(&self) -> AgentParameters {
        AgentParameters {
            node: self.node,
            role: self.role(),
            actor: self.actor.snapshot(),
            critic: self.critic.snapshot(),
            tr: self.tr.snapshot(),
            private_critic: self.private_critic.as_ref().map(|c| c.snapshot()),
        }
    }

    /// Critic that evaluates this agent's own returns.
    fn local_critic(&self) -> &dyn ValueFunction {
        self.private_critic.as_deref().unwrap_or(&*self.critic)
    }

    /// TD regression of the local critic toward `r + γV(s')`.
    ///
    /// Returns the updated critic's snapshot and the regression loss.
    pub fn critic_update_local(
        &mut self,
        observations: &[Vec<f64>],
        next_observations: &[Vec<f64>],
        rewards: &[f64],
    ) -> (WeightSnapshot, f64) {
        let gamma = self.gamma;
        let critic = match self.private_critic.as_mut() {
            Some(private) => private,
            None => &mut self.critic,
        };
        let targets = td_targets(&**critic, next_observations, rewards, gamma);
        let loss = critic.fit(observations, &targets);
        (critic.snapshot(), loss)
    }

    /// Regression of the TR approximator toward `rewards`.
    pub fn tr_update_local(
        &mut self,
        state_actions: &[Vec<f64>],
        rewards: &[f64],
    ) -> (WeightSnapshot, f64) {
        let loss = self.tr.fit(state_actions, rewards);
        (self.tr.snapshot(), loss)
    }

    /// TD regression of the broadcast critic toward an adversarial reward.
    pub fn critic_update_compromised(
        &mut self,
        observations: &[Vec<f64>],
        next_observations: &[Vec<f64>],
        adversarial_rewards: &[f64],
    ) -> (WeightSnapshot, f64) {
        let targets = td_targets(
            &*self.critic,
            next_observations,
            adversarial_rewards,
            self.gamma,
        );
        let loss = self.critic.fit(observations, &targets);
        (self.critic.snapshot(), loss)
    }

    /// Regression of the broadcast TR toward an adversarial reward.
    pub fn tr_update_compromised(
        &mut self,
        state_actions: &[Vec<f64>],
        adversarial_rewards: &[f64],
    ) -> (WeightSnapshot, f64) {
        let loss = self.tr.fit(state_actions, adversarial_rewards);
        (self.tr.snapshot(), loss)
    }

    /// Current broadcast critic parameters. Never modifies the agent.
    pub fn get_critic_weights(&self) -> WeightSnapshot {
        self.critic.snapshot()
    }

    /// Current TR parameters. Never modifies the agent.
    pub fn get_tr_weights(&self) -> WeightSnapshot {
        self.tr.snapshot()
    }

    /// Overwrites the critic's hidden layers with the resilient aggregate of
    /// the neighbors' hidden layers.
    pub fn resilient_consensus_critic_hidden(
        &mut self,
        neighbors: &[&WeightSnapshot],
        aggregator: &dyn Aggregator,
    ) {
        let hidden = hidden_consensus(aggregator, neighbors);
        self.critic.load_hidden(&hidden);
    }

    /// Same as [`Agent::resilient_consensus_critic_hidden`] for the TR.
    pub fn resilient_consensus_tr_hidden(
        &mut self,
        neighbors: &[&WeightSnapshot],
        aggregator: &dyn Aggregator,
    ) {
        let hidden = hidden_consensus(aggregator, neighbors);
        self.tr.load_hidden(&hidden);
    }

    /// Per-sample resilient aggregate of the critic outputs obtained with
    /// each neighbor's output layer on top of this agent's hidden layers.
    pub fn resilient_consensus_critic(
        &self,
        observations: &[Vec<f64>],
        neighbors: &[&WeightSnapshot],
        aggregator: &dyn Aggregator,
    ) -> Vec<f64> {
        consensus_estimate(&*self.critic, observations, neighbors, aggregator)
    }

    /// Same as [`Agent::resilient_consensus_critic`] for the TR.
    pub fn resilient_consensus_tr(
        &self,
        state_actions: &[Vec<f64>],
        neighbors: &[&WeightSnapshot],
        aggregator: &dyn Aggregator,
    ) -> Vec<f64> {
        consensus_estimate(&*self.tr, state_actions, neighbors, aggregator)
    }

    /// Moves the critic's output layer toward the aggregated estimate.
    pub fn critic_update_team(&mut self, observations: &[Vec<f64>], estimate: &[f64]) -> f64 {
        self.critic.fit_head(observations, estimate)
    }

    /// Moves the TR's output layer toward the aggregated estimate.
    pub fn tr_update_team(&mut self, state_actions: &[Vec<f64>], estimate: &[f64]) -> f64 {
        self.tr.fit_head(state_actions, estimate)
    }

    /// Policy-gradient step on the most recent cycle.
    ///
    /// The advantage comes from the team critic and TR for cooperative
    /// agents and from the applied reward and local critic otherwise.
    pub fn actor_update(&mut self, recent: &Batch, rewards: RewardContext<'_>) -> f64 {
        let observations = recent.observations_of(self.node);
        let next_observations = recent.next_observations_of(self.node);
        let actions = recent.actions_of(self.node);

        let advantages = match self.behavior.actor_signal() {
            ActorSignal::TeamEstimate => {
                let team_reward = self.tr.predict(&recent.state_actions_of(self.node));
                advantages(
                    &*self.critic,
                    &observations,
                    &next_observations,
                    &team_reward,
                    self.gamma,
                )
            }
            ActorSignal::OwnReward => {
                let own = recent.rewards_of(self.node);
                let r = self.behavior.applied_reward(&own, rewards);
                advantages(
                    self.local_critic(),
                    &observations,
                    &next_observations,
                    r,
                    self.gamma,
                )
            }
        };
        self.actor
            .fit_policy_gradient(&observations, &actions, &advantages)
    }
}

fn td_targets(
    critic: &dyn ValueFunction,
    next_observations: &[Vec<f64>],
    rewards: &[f64],
    gamma: f64,
) -> Vec<f64> {
    critic
        .predict(next_observations)
        .into_iter()
        .zip(rewards)
        .map(|(v, r)| r + gamma * v)
        .collect()
}

fn advantages(
    critic: &dyn ValueFunction,
    observations: &[Vec<f64>],
    next_observations: &[Vec<f64>],
    rewards: &[f64],
    gamma: f64,
) -> Vec<f64> {
    let values = critic.predict(observations);
    td_targets(critic, next_observations, rewards, gamma)
        .into_iter()
        .zip(values)
        .map(|(target, v)| target - v)
        .collect()
}

fn consensus_estimate(
    net: &dyn ValueFunction,
    inputs: &[Vec<f64>],
    neighbors: &[&WeightSnapshot],
    aggregator: &dyn Aggregator,
) -> Vec<f64> {
    let estimates: Vec<Vec<f64>> = neighbors
        .iter()
        .map(|head| net.predict_with_head(inputs, head))
        .collect();
    output_consensus(aggregator, &estimates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::consensus::TrimmedMean;
    use crate::algorithms::rl::network::MlpFactory;
    use crate::algorithms::rl::training::buffer::{ExperienceBuffer, Transition};

    const DIMS: AgentDims = AgentDims {
        observation_dim: 3,
        n_agents: 2,
        n_actions: 4,
    };

    fn config() -> TrainingConfig {
        TrainingConfig {
            gamma: 0.5,
            ..TrainingConfig::default()
        }
    }

    fn agent(node: usize, role: AgentRole, factory: &mut MlpFactory) -> Agent {
        Agent::new(node, role, DIMS, &config(), factory)
    }

    fn batch(n: usize) -> Batch {
        let transitions = (0..n).map(|t| {
            let x = t as f64 / n as f64;
            Transition {
                state: vec![x],
                next_state: vec![x],
                actions: vec![t % 4, (t + 1) % 4],
                rewards: vec![x, 1.0 - x],
                observation: vec![vec![x, 0.5, -x], vec![-x, 0.5, x]],
                next_observation: vec![vec![x, 0.4, -x], vec![-x, 0.4, x]],
            }
        });
        ExperienceBuffer::from_transitions(transitions).as_batch()
    }

    #[test]
    fn actions_are_in_range() {
        let mut factory = MlpFactory::new(vec![8], 4, 1);
        let mut a = agent(1, AgentRole::Greedy, &mut factory);
        let obs = vec![vec![0.1, 0.2, 0.3], vec![0.3, 0.2, 0.1]];
        for _ in 0..50 {
            assert!(a.get_action(&obs) < DIMS.n_actions);
        }
    }

    #[test]
    fn only_malicious_has_private_critic() {
        let mut factory = MlpFactory::new(vec![8], 4, 2);
        for role in AgentRole::all() {
            let params = agent(0, role, &mut factory).get_parameters();
            assert_eq!(params.role, role);
            assert_eq!(params.private_critic.is_some(), role == AgentRole::Malicious);
        }
    }

    #[test]
    fn weight_getters_are_pure() {
        let mut factory = MlpFactory::new(vec![8], 4, 3);
        let a = agent(0, AgentRole::Faulty, &mut factory);
        assert_eq!(a.get_critic_weights(), a.get_critic_weights());
        assert_eq!(a.get_tr_weights(), a.get_tr_weights());
    }

    #[test]
    fn local_updates_return_new_snapshot() {
        let mut factory = MlpFactory::new(vec![8], 4, 4);
        let mut a = agent(0, AgentRole::Greedy, &mut factory);
        let b = batch(16);
        let before = a.get_critic_weights();
        let (after, loss) = a.critic_update_local(
            &b.observations_of(0),
            &b.next_observations_of(0),
            &b.rewards_of(0),
        );
        assert!(loss.is_finite());
        assert_ne!(before, after);
        assert_eq!(after, a.get_critic_weights());

        let (tr, tr_loss) = a.tr_update_local(&b.state_actions_of(0), &b.rewards_of(0));
        assert!(tr_loss.is_finite());
        assert_eq!(tr, a.get_tr_weights());
    }

    #[test]
    fn malicious_local_update_leaves_broadcast_critic() {
        let mut factory = MlpFactory::new(vec![8], 4, 5);
        let mut a = agent(0, AgentRole::Malicious, &mut factory);
        let b = batch(16);
        let broadcast = a.get_critic_weights();
        let (private, _) = a.critic_update_local(
            &b.observations_of(0),
            &b.next_observations_of(0),
            &b.rewards_of(0),
        );
        assert_eq!(a.get_critic_weights(), broadcast);
        assert_eq!(a.get_parameters().private_critic, Some(private));

        let (corrupted, _) = a.critic_update_compromised(
            &b.observations_of(0),
            &b.next_observations_of(0),
            &vec![-1.0; b.len()],
        );
        assert_ne!(corrupted, broadcast);
        assert_eq!(a.get_critic_weights(), corrupted);
    }

    #[test]
    fn hidden_consensus_with_one_neighbor_copies_it() {
        let mut factory = MlpFactory::new(vec![6, 5], 4, 6);
        let mut a = agent(0, AgentRole::Cooperative, &mut factory);
        let neighbor = agent(1, AgentRole::Cooperative, &mut factory);
        let snap = neighbor.get_critic_weights();
        a.resilient_consensus_critic_hidden(&[&snap], &TrimmedMean::new(0));
        let own = a.get_critic_weights();
        let own_hidden: Vec<_> = own.hidden().collect();
        let their_hidden: Vec<_> = snap.hidden().collect();
        assert_eq!(own_hidden, their_hidden);
        assert_ne!(
            own.output().collect::<Vec<_>>(),
            snap.output().collect::<Vec<_>>()
        );
    }

    #[test]
    fn team_update_keeps_hidden_layers() {
        let mut factory = MlpFactory::new(vec![6], 4, 7);
        let mut a = agent(0, AgentRole::Cooperative, &mut factory);
        let neighbor = agent(1, AgentRole::Cooperative, &mut factory);
        let b = batch(12);
        let obs = b.observations_of(0);
        let snap = neighbor.get_critic_weights();
        let agg = TrimmedMean::new(0);

        a.resilient_consensus_critic_hidden(&[&snap], &agg);
        let estimate = a.resilient_consensus_critic(&obs, &[&snap], &agg);
        assert_eq!(estimate.len(), obs.len());
        let before: Vec<_> = a.get_critic_weights().hidden().cloned().collect();
        let loss = a.critic_update_team(&obs, &estimate);
        assert!(loss.is_finite());
        let after: Vec<_> = a.get_critic_weights().hidden().cloned().collect();
        assert_eq!(before, after);
    }

    #[test]
    fn actor_update_runs_for_every_role() {
        let mut factory = MlpFactory::new(vec![8], 4, 8);
        let b = batch(10);
        let team = b.mean_reward(&[0]);
        let rewards = RewardContext {
            team: &team,
            common_reward: false,
        };
        for role in AgentRole::all() {
            let mut a = agent(0, role, &mut factory);
            let before = a.get_parameters().actor;
            let loss = a.actor_update(&b, rewards);
            assert!(loss.is_finite(), "{role}: {loss}");
            assert_ne!(a.get_parameters().actor, before, "{role}");
        }
    }
}
