//! Episode and update-cycle orchestration.
//!
//! Every step is simulated and recorded in the experience buffer. The last
//! step of every `n_ep_fixed`-th episode closes a cycle, which runs
//! `n_epochs` rounds of
//!
//! 1. Stage I: a role-specific local update for every node, then
//! 2. Stage II: resilient consensus for every cooperative node,
//!
//! followed by one actor update per node on the cycle's own transitions and
//! a FIFO trim of the buffer. Each stage completes for all nodes before the
//! next begins.

use std::path::PathBuf;

#[cfg(feature = "parallel")]
use rayon::prelude::*;
use tracing::{debug, info, warn};

use super::buffer::{Batch, ExperienceBuffer, Transition};
use crate::algorithms::consensus::{ConsensusEngine, PublishedWeights, TeamUpdate};
use crate::algorithms::rl::agent::{Agent, AgentDims, AgentParameters};
use crate::algorithms::rl::config::TrainingConfig;
use crate::algorithms::rl::environment::Environment;
use crate::algorithms::rl::metrics::{
    CycleLosses, DiscountedReturns, EpisodeLog, EpisodeSummary, RunRecorder,
};
use crate::algorithms::rl::network::{MlpFactory, NetworkFactory};
use crate::algorithms::rl::role::{LocalInputs, LocalUpdate, RewardContext};
use crate::algorithms::rl::types::cooperative_nodes;
use crate::error::{ConfigError, TrainingError};

/// Result of a full training run.
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    /// Exported parameters of every agent, indexed by node.
    pub parameters: Vec<AgentParameters>,
    /// One row per episode.
    pub summaries: Vec<EpisodeSummary>,
    /// Directory holding the run's log and table, if any was written.
    pub run_dir: Option<PathBuf>,
}

/// Outputs of one consensus epoch.
#[derive(Debug, Clone)]
pub struct EpochReport {
    /// Stage I results, indexed by node.
    pub local: Vec<LocalUpdate>,
    /// Stage II results of the cooperative nodes.
    pub team: Vec<TeamUpdate>,
}

/// Drives agents through episodes and update cycles.
#[derive(Debug)]
pub struct Trainer<E> {
    env: E,
    config: TrainingConfig,
    agents: Vec<Agent>,
    engine: ConsensusEngine,
    buffer: ExperienceBuffer,
    cooperative: Vec<usize>,
    losses: CycleLosses,
}

impl<E: Environment> Trainer<E> {
    /// Creates a trainer with pure-Rust MLP approximators.
    pub fn new(env: E, config: TrainingConfig) -> Result<Self, ConfigError> {
        let mut factory = MlpFactory::new(
            config.network.hidden_layers.clone(),
            config.batch_size,
            config.seed,
        );
        Self::with_factory(env, config, &mut factory)
    }

    /// Creates a trainer whose approximators come from `factory`.
    ///
    /// Fails if `config` does not describe a valid run on `env`.
    pub fn with_factory(
        env: E,
        config: TrainingConfig,
        factory: &mut dyn NetworkFactory,
    ) -> Result<Self, ConfigError> {
        config.validate(env.n_agents())?;
        if config.n_states != env.n_states() {
            return Err(ConfigError::InvalidParameter {
                name: "n_states",
                reason: format!(
                    "{} does not match the environment's {}",
                    config.n_states,
                    env.n_states()
                ),
            });
        }

        let dims = AgentDims {
            observation_dim: env.observation_dim(),
            n_agents: env.n_agents(),
            n_actions: env.n_actions(),
        };
        let agents = config
            .agent_label
            .iter()
            .enumerate()
            .map(|(node, &role)| Agent::new(node, role, dims, &config, factory))
            .collect();
        let engine = ConsensusEngine::trimmed_mean(config.neighbor_graph(), config.byzantine_tolerance);
        let cooperative = cooperative_nodes(&config.agent_label);
        info!(
            n_agents = dims.n_agents,
            n_cooperative = cooperative.len(),
            tolerance = config.byzantine_tolerance,
            "trainer initialized"
        );
        Ok(Self {
            losses: CycleLosses::new(dims.n_agents),
            env,
            config,
            agents,
            engine,
            buffer: ExperienceBuffer::new(),
            cooperative,
        })
    }

    /// Starts from previously collected experience.
    ///
    /// Fails if a transition does not have one entry per agent or an
    /// observation row of the environment's width.
    pub fn with_buffer(mut self, buffer: ExperienceBuffer) -> Result<Self, ConfigError> {
        let n_agents = self.env.n_agents();
        let width = self.env.observation_dim();
        for (t, transition) in buffer.iter().enumerate() {
            let per_agent = [
                ("actions", transition.actions.len()),
                ("rewards", transition.rewards.len()),
                ("observation", transition.observation.len()),
                ("next_observation", transition.next_observation.len()),
            ];
            if let Some((field, len)) = per_agent.iter().find(|(_, len)| *len != n_agents) {
                return Err(ConfigError::InvalidParameter {
                    name: "buffer",
                    reason: format!(
                        "transition {t} has {len} {field} entries, expected {n_agents}"
                    ),
                });
            }
            let rows = transition.observation.iter().chain(&transition.next_observation);
            if let Some(row) = rows.map(Vec::len).find(|&w| w != width) {
                return Err(ConfigError::InvalidParameter {
                    name: "buffer",
                    reason: format!(
                        "transition {t} has an observation row of width {row}, expected {width}"
                    ),
                });
            }
        }
        self.buffer = buffer;
        Ok(self)
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    pub fn buffer(&self) -> &ExperienceBuffer {
        &self.buffer
    }

    pub fn env(&self) -> &E {
        &self.env
    }

    /// Losses of the cycle closed by the latest episode; all `None` if that
    /// episode closed none.
    pub fn losses(&self) -> &CycleLosses {
        &self.losses
    }

    /// Runs `n_episodes` episodes and returns the final parameters together
    /// with the persisted summary table.
    pub fn train(&mut self, mut recorder: RunRecorder) -> Result<TrainingOutcome, TrainingError> {
        for episode in 0..self.config.n_episodes {
            self.run_episode(episode, &mut recorder)?;
        }
        let parameters = self.agents.iter().map(Agent::get_parameters).collect();
        let artifacts = recorder.finish()?;
        Ok(TrainingOutcome {
            parameters,
            summaries: artifacts.summaries,
            run_dir: artifacts.run_dir,
        })
    }

    /// Simulates one episode, updating at its end if it closes a cycle.
    pub fn run_episode(
        &mut self,
        episode: usize,
        recorder: &mut RunRecorder,
    ) -> Result<EpisodeSummary, TrainingError> {
        self.losses = CycleLosses::new(self.agents.len());
        self.env.reset();
        let (mut state, _) = self.env.get_data();
        let mut observation = self.env.get_observations();

        let estimated: Vec<f64> = self
            .agents
            .iter()
            .map(|a| {
                if a.role().is_cooperative() {
                    a.estimated_return(&observation)
                } else {
                    0.0
                }
            })
            .collect();
        let mut returns = DiscountedReturns::new(self.agents.len(), self.config.gamma);

        for step in 1..=self.config.max_ep_len {
            let actions: Vec<usize> = self
                .agents
                .iter_mut()
                .map(|a| a.get_action(&observation))
                .collect();
            self.env.step(&actions);
            let (next_state, rewards) = self.env.get_data();
            let next_observation = self.env.get_observations();
            returns.push(&rewards);

            self.buffer.append(Transition {
                state,
                next_state: next_state.clone(),
                actions,
                rewards,
                observation,
                next_observation: next_observation.clone(),
            });
            if self.config.is_cycle_boundary(episode, step) {
                self.update_cycle();
            }
            state = next_state;
            observation = next_observation;
        }

        let summary =
            EpisodeSummary::from_returns(&self.config.agent_label, returns.returns(), &estimated);
        let cooperative_estimates: Vec<f64> =
            self.cooperative.iter().map(|&i| estimated[i]).collect();
        let line = EpisodeLog {
            episode,
            estimated_returns: &cooperative_estimates,
            true_team_return: summary.true_team_return,
            losses: &self.losses,
        };
        recorder.record(&line, summary)?;
        Ok(summary)
    }

    /// Batched update over the buffer's current contents.
    pub fn update_cycle(&mut self) -> &CycleLosses {
        let batch = self.buffer.as_batch();
        let team = batch.mean_reward(&self.cooperative);
        let rewards = RewardContext {
            team: &team,
            common_reward: self.config.common_reward,
        };
        debug!(transitions = batch.len(), "update cycle started");

        let mut losses = CycleLosses::new(self.agents.len());
        for epoch in 0..self.config.n_epochs {
            let report = self.run_epoch(&batch, rewards);
            for (node, update) in report.local.iter().enumerate() {
                losses.critic[node] = update.critic_loss;
                losses.tr[node] = update.tr_loss;
            }
            debug!(epoch, team_updates = report.team.len(), "consensus epoch done");
        }

        let recent = batch.tail(self.config.cycle_len());
        let recent_team = recent.mean_reward(&self.cooperative);
        let recent_rewards = RewardContext {
            team: &recent_team,
            common_reward: self.config.common_reward,
        };
        for agent in &mut self.agents {
            losses.actor[agent.node()] = Some(agent.actor_update(&recent, recent_rewards));
        }
        debug!(transitions = recent.len(), "actor updates done");

        let dropped = self.buffer.trim(self.config.buffer_size);
        debug!(dropped, retained = self.buffer.len(), "buffer trimmed");

        if losses.has_non_finite() {
            warn!("non-finite loss in update cycle");
        }
        self.losses = losses;
        &self.losses
    }

    /// One consensus epoch: Stage I for every node, then Stage II.
    ///
    /// Stage II only starts once every node's Stage I snapshot is
    /// published, and reads nothing but those snapshots.
    pub fn run_epoch(&mut self, batch: &Batch, rewards: RewardContext<'_>) -> EpochReport {
        let local = local_updates(&mut self.agents, batch, rewards);
        let published = PublishedWeights {
            critic: local.iter().map(|u| u.critic.clone()).collect(),
            tr: local.iter().map(|u| u.tr.clone()).collect(),
        };
        let team = self.engine.run(&mut self.agents, &published, batch);
        EpochReport { local, team }
    }
}

fn local_update(agent: &mut Agent, batch: &Batch, rewards: RewardContext<'_>) -> LocalUpdate {
    let inputs = LocalInputs::for_node(batch, agent.node());
    agent.behavior().local_update(agent, &inputs, rewards)
}

fn local_updates(agents: &mut [Agent], batch: &Batch, rewards: RewardContext<'_>) -> Vec<LocalUpdate> {
    #[cfg(feature = "parallel")]
    {
        agents
            .par_iter_mut()
            .map(|a| local_update(a, batch, rewards))
            .collect()
    }
    #[cfg(not(feature = "parallel"))]
    {
        agents
            .iter_mut()
            .map(|a| local_update(a, batch, rewards))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::rl::environment::GridWorld;
    use crate::algorithms::rl::types::AgentRole::*;

    fn config() -> TrainingConfig {
        let mut config = TrainingConfig {
            agent_label: vec![Cooperative, Cooperative, Cooperative, Greedy],
            in_nodes: vec![vec![0, 1, 2], vec![0, 1, 2], vec![0, 1, 2, 3], vec![]],
            byzantine_tolerance: 1,
            max_ep_len: 5,
            n_episodes: 6,
            n_ep_fixed: 3,
            n_epochs: 2,
            batch_size: 4,
            buffer_size: 7,
            ..TrainingConfig::default()
        };
        config.network.hidden_layers = vec![8];
        config
    }

    fn trainer(config: TrainingConfig) -> Trainer<GridWorld> {
        Trainer::new(GridWorld::new(4, 4, config.n_agents(), 0), config).unwrap()
    }

    #[test]
    fn rejects_mismatched_environment() {
        let config = config();
        let err = Trainer::new(GridWorld::new(4, 4, 3, 0), config.clone()).unwrap_err();
        assert!(matches!(err, ConfigError::LabelCountMismatch { labels: 4, agents: 3 }));

        let bad = TrainingConfig {
            n_states: 3,
            ..config
        };
        let err = Trainer::new(GridWorld::new(4, 4, 4, 0), bad).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidParameter { name: "n_states", .. }));
    }

    #[test]
    fn rejects_insufficient_neighbors_before_training() {
        let mut config = config();
        config.in_nodes[1] = vec![0, 1];
        let err = Trainer::new(GridWorld::new(4, 4, 4, 0), config).unwrap_err();
        assert!(matches!(err, ConfigError::InsufficientNeighbors { node: 1, .. }));
    }

    #[test]
    fn cycle_fires_on_last_step_of_group() {
        let mut t = trainer(config());
        let mut rec = RunRecorder::in_memory();
        let mut lengths = Vec::new();
        for episode in 0..6 {
            t.run_episode(episode, &mut rec).unwrap();
            lengths.push(t.buffer().len());
        }
        // Buffer grows by 5 per episode and is trimmed to 7 after episodes 2 and 5.
        assert_eq!(lengths, vec![5, 10, 7, 12, 17, 7]);
        assert_eq!(rec.summaries().len(), 6);
    }

    #[test]
    fn losses_follow_roles() {
        let mut config = config();
        config.agent_label[3] = Faulty;
        let mut t = trainer(config);
        assert!(t.losses().critic.iter().all(Option::is_none));

        let mut rec = RunRecorder::in_memory();
        for episode in 0..3 {
            t.run_episode(episode, &mut rec).unwrap();
        }
        let losses = t.losses();
        for node in 0..3 {
            assert!(losses.critic[node].is_some());
            assert!(losses.tr[node].is_some());
        }
        assert_eq!(losses.critic[3], None);
        assert_eq!(losses.tr[3], None);
        assert!(losses.actor.iter().all(Option::is_some));
    }

    #[test]
    fn faulty_node_never_changes() {
        let mut config = config();
        config.agent_label[3] = Faulty;
        let mut t = trainer(config);
        let before = t.agents()[3].get_parameters();
        let mut rec = RunRecorder::in_memory();
        for episode in 0..3 {
            t.run_episode(episode, &mut rec).unwrap();
        }
        let after = t.agents()[3].get_parameters();
        assert_eq!(before.critic, after.critic);
        assert_eq!(before.tr, after.tr);
    }

    #[test]
    fn warm_start_buffer_is_kept_for_critics() {
        let mut t = trainer(config());
        let mut rec = RunRecorder::in_memory();
        t.run_episode(0, &mut rec).unwrap();
        let warm = t.buffer().clone();

        let mut config = config();
        config.buffer_size = 100;
        let mut t = trainer(config).with_buffer(warm).unwrap();
        for episode in 0..3 {
            t.run_episode(episode, &mut rec).unwrap();
        }
        assert_eq!(t.buffer().len(), 20);
    }

    #[test]
    fn train_returns_parameters_and_summaries() {
        let mut t = trainer(config());
        let outcome = t.train(RunRecorder::in_memory()).unwrap();
        assert_eq!(outcome.parameters.len(), 4);
        assert_eq!(outcome.summaries.len(), 6);
        assert!(outcome.run_dir.is_none());
        for (node, params) in outcome.parameters.iter().enumerate() {
            assert_eq!(params.node, node);
        }
    }

    #[test]
    fn rejects_mismatched_warm_start_buffer() {
        let mut t = trainer(config());
        let mut rec = RunRecorder::in_memory();
        t.run_episode(0, &mut rec).unwrap();
        let good = t.buffer().clone();

        let mut short = good.iter().cloned().collect::<Vec<_>>();
        short[2].rewards.pop();
        let err = trainer(config())
            .with_buffer(ExperienceBuffer::from_transitions(short))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidParameter { name: "buffer", .. }));

        let mut narrow = good.iter().cloned().collect::<Vec<_>>();
        narrow[0].next_observation[1].push(0.0);
        let err = trainer(config())
            .with_buffer(ExperienceBuffer::from_transitions(narrow))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidParameter { name: "buffer", .. }));

        assert!(trainer(config()).with_buffer(good).is_ok());
    }

    #[test]
    fn episodes_without_a_cycle_report_no_losses() {
        let mut t = trainer(config());
        let mut rec = RunRecorder::in_memory();
        for episode in 0..3 {
            t.run_episode(episode, &mut rec).unwrap();
        }
        assert!(t.losses().actor.iter().all(Option::is_some));

        t.run_episode(3, &mut rec).unwrap();
        let losses = t.losses();
        assert!(losses.critic.iter().all(Option::is_none));
        assert!(losses.tr.iter().all(Option::is_none));
        assert!(losses.actor.iter().all(Option::is_none));
    }

    #[cfg(feature = "rl-nn")]
    #[test]
    fn tch_backend_runs_a_cycle() {
        use crate::algorithms::rl::network::TchFactory;

        let config = config();
        let mut factory = TchFactory::new(
            config.network.hidden_layers.clone(),
            config.batch_size,
            config.seed,
            tch::Device::Cpu,
        );
        let env = GridWorld::new(4, 4, config.n_agents(), 0);
        let mut t = Trainer::with_factory(env, config, &mut factory).unwrap();
        let before = t.agents()[0].get_critic_weights();
        let mut rec = RunRecorder::in_memory();
        for episode in 0..3 {
            t.run_episode(episode, &mut rec).unwrap();
        }
        let losses = t.losses();
        assert!(losses.critic[..3].iter().all(|l| l.is_some_and(f64::is_finite)));
        assert!(losses.actor.iter().all(Option::is_some));
        assert_ne!(t.agents()[0].get_critic_weights(), before);
        assert_eq!(t.buffer().len(), 7);
    }
}
