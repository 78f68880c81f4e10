//! Configuration for resilient consensus training.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::types::{AgentRole, NeighborGraph};
use crate::error::ConfigError;

/// Hyperparameters of the per-agent function approximators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Widths of the hidden layers shared by every role.
    pub hidden_layers: Vec<usize>,
    /// Learning rate of critic updates (local, compromised and team).
    pub critic_lr: f64,
    /// Learning rate of team-average reward updates.
    pub tr_lr: f64,
    /// Learning rate of the actor.
    pub actor_lr: f64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            hidden_layers: vec![32, 32],
            critic_lr: 1e-2,
            tr_lr: 1e-2,
            actor_lr: 1e-3,
        }
    }
}

/// Configuration of a training run.
///
/// Mirrors the enumerated run parameters: the role assignment and
/// communication graph, the episode/cycle geometry, and the buffer and
/// batch sizes used by the batched updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Dimension of a single agent's state (2 for planar positions).
    pub n_states: usize,
    /// Role of each agent, indexed by node.
    pub agent_label: Vec<AgentRole>,
    /// Discount factor γ.
    pub gamma: f64,
    /// `in_nodes[v]` lists the nodes whose snapshots node `v` consumes.
    pub in_nodes: Vec<Vec<usize>>,
    /// Number of Byzantine neighbors tolerated per coordinate (`f`).
    pub byzantine_tolerance: usize,
    /// Steps per episode.
    pub max_ep_len: usize,
    /// Total number of episodes.
    pub n_episodes: usize,
    /// Episodes per update cycle.
    pub n_ep_fixed: usize,
    /// Consensus repetitions per cycle.
    pub n_epochs: usize,
    /// Mini-batch size of approximator updates.
    pub batch_size: usize,
    /// Maximum number of transitions retained after a cycle.
    pub buffer_size: usize,
    /// Apply the team-average reward to every role.
    pub common_reward: bool,
    /// Seed for network initialization and action sampling.
    pub seed: u64,
    /// Approximator hyperparameters.
    pub network: NetworkConfig,
}

impl TrainingConfig {
    /// Loads a configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content =
            fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read(e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Parses a configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Number of agents implied by the role assignment.
    pub fn n_agents(&self) -> usize {
        self.agent_label.len()
    }

    /// Number of transitions collected per cycle.
    pub fn cycle_len(&self) -> usize {
        self.max_ep_len * self.n_ep_fixed
    }

    /// Number of cooperative agents.
    pub fn n_cooperative(&self) -> usize {
        self.agent_label.iter().filter(|r| r.is_cooperative()).count()
    }

    /// Builds the communication graph from `in_nodes`.
    pub fn neighbor_graph(&self) -> NeighborGraph {
        NeighborGraph::from_in_nodes(self.n_agents(), &self.in_nodes)
    }

    /// Whether the last step of `episode` closes an update cycle.
    ///
    /// `step` is 1-based: the cycle fires after the `max_ep_len`-th
    /// transition of the last episode in each group of `n_ep_fixed`.
    pub fn is_cycle_boundary(&self, episode: usize, step: usize) -> bool {
        episode % self.n_ep_fixed == self.n_ep_fixed - 1 && step == self.max_ep_len
    }

    /// Checks the configuration against an environment with `n_agents` agents.
    pub fn validate(&self, n_agents: usize) -> Result<(), ConfigError> {
        if self.agent_label.len() != n_agents {
            return Err(ConfigError::LabelCountMismatch {
                labels: self.agent_label.len(),
                agents: n_agents,
            });
        }
        if self.n_cooperative() == 0 {
            return Err(ConfigError::NoCooperativeAgents);
        }
        if !(0.0..=1.0).contains(&self.gamma) {
            return Err(invalid("gamma", format!("{} is outside [0, 1]", self.gamma)));
        }
        for (name, value) in [
            ("n_states", self.n_states),
            ("max_ep_len", self.max_ep_len),
            ("n_ep_fixed", self.n_ep_fixed),
            ("n_epochs", self.n_epochs),
            ("batch_size", self.batch_size),
            ("buffer_size", self.buffer_size),
        ] {
            if value == 0 {
                return Err(invalid(name, "must be positive".into()));
            }
        }
        if self.network.hidden_layers.iter().any(|&w| w == 0) {
            return Err(invalid("network.hidden_layers", "layer widths must be positive".into()));
        }
        for (name, lr) in [
            ("network.critic_lr", self.network.critic_lr),
            ("network.tr_lr", self.network.tr_lr),
            ("network.actor_lr", self.network.actor_lr),
        ] {
            if !(lr.is_finite() && lr > 0.0) {
                return Err(invalid(name, format!("{} is not a positive learning rate", lr)));
            }
        }

        for (node, neighbors) in self.in_nodes.iter().enumerate() {
            if let Some(&neighbor) = neighbors.iter().find(|&&u| u >= n_agents) {
                return Err(ConfigError::UnknownNeighbor {
                    node,
                    neighbor,
                    n_agents,
                });
            }
        }

        let graph = self.neighbor_graph();
        let f = self.byzantine_tolerance;
        for (node, role) in self.agent_label.iter().enumerate() {
            if !role.is_cooperative() {
                continue;
            }
            let neighbors = graph.in_nodes(node).len();
            if neighbors == 0 {
                return Err(ConfigError::MissingNeighbors(node));
            }
            if neighbors <= 2 * f {
                return Err(ConfigError::InsufficientNeighbors {
                    node,
                    neighbors,
                    tolerance: f,
                });
            }
        }
        Ok(())
    }
}

fn invalid(name: &'static str, reason: String) -> ConfigError {
    ConfigError::InvalidParameter { name, reason }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        use AgentRole::*;
        Self {
            n_states: 2,
            agent_label: vec![Cooperative, Cooperative, Cooperative, Malicious],
            gamma: 0.9,
            in_nodes: vec![
                vec![0, 1, 2, 3],
                vec![0, 1, 2, 3],
                vec![0, 1, 2, 3],
                vec![3],
            ],
            byzantine_tolerance: 1,
            max_ep_len: 20,
            n_episodes: 200,
            n_ep_fixed: 10,
            n_epochs: 10,
            batch_size: 32,
            buffer_size: 2000,
            common_reward: false,
            seed: 0,
            network: NetworkConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use AgentRole::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = TrainingConfig::default();
        assert!(cfg.validate(cfg.n_agents()).is_ok());
        assert_eq!(cfg.cycle_len(), cfg.max_ep_len * cfg.n_ep_fixed);
    }

    #[test]
    fn label_count_must_match_environment() {
        let cfg = TrainingConfig::default();
        assert_eq!(
            cfg.validate(5),
            Err(ConfigError::LabelCountMismatch {
                labels: 4,
                agents: 5
            })
        );
    }

    #[test]
    fn requires_a_cooperative_agent() {
        let cfg = TrainingConfig {
            agent_label: vec![Greedy, Malicious],
            in_nodes: vec![],
            ..TrainingConfig::default()
        };
        assert_eq!(cfg.validate(2), Err(ConfigError::NoCooperativeAgents));
    }

    #[test]
    fn rejects_too_few_neighbors_for_tolerance() {
        let cfg = TrainingConfig {
            agent_label: vec![Cooperative, Cooperative, Faulty],
            in_nodes: vec![vec![0, 1, 2], vec![0, 1]],
            byzantine_tolerance: 1,
            ..TrainingConfig::default()
        };
        assert_eq!(
            cfg.validate(3),
            Err(ConfigError::InsufficientNeighbors {
                node: 1,
                neighbors: 2,
                tolerance: 1
            })
        );
    }

    #[test]
    fn rejects_out_of_range_neighbor() {
        let cfg = TrainingConfig {
            agent_label: vec![Cooperative, Cooperative],
            in_nodes: vec![vec![1], vec![4]],
            byzantine_tolerance: 0,
            ..TrainingConfig::default()
        };
        assert_eq!(
            cfg.validate(2),
            Err(ConfigError::UnknownNeighbor {
                node: 1,
                neighbor: 4,
                n_agents: 2
            })
        );
    }

    #[test]
    fn cooperative_node_needs_neighbors() {
        let cfg = TrainingConfig {
            agent_label: vec![Cooperative, Cooperative],
            in_nodes: vec![vec![1]],
            byzantine_tolerance: 0,
            ..TrainingConfig::default()
        };
        assert_eq!(cfg.validate(2), Err(ConfigError::MissingNeighbors(1)));
    }

    #[test]
    fn rejects_gamma_out_of_range() {
        let cfg = TrainingConfig {
            gamma: 1.5,
            ..TrainingConfig::default()
        };
        assert!(matches!(
            cfg.validate(4),
            Err(ConfigError::InvalidParameter { name: "gamma", .. })
        ));
    }

    #[test]
    fn cycle_boundary_fires_at_last_step_of_group() {
        let cfg = TrainingConfig {
            n_ep_fixed: 3,
            max_ep_len: 5,
            ..TrainingConfig::default()
        };
        let fired: Vec<(usize, usize)> = (0..9)
            .flat_map(|ep| (1..=5).map(move |step| (ep, step)))
            .filter(|&(ep, step)| cfg.is_cycle_boundary(ep, step))
            .collect();
        assert_eq!(fired, vec![(2, 5), (5, 5), (8, 5)]);
    }

    #[test]
    fn parses_toml() {
        let cfg = TrainingConfig::from_toml(
            r#"
            agent_label = ["Cooperative", "Cooperative", "Greedy", "Faulty"]
            in_nodes = [[0, 1, 3], [0, 1, 3]]
            byzantine_tolerance = 1
            max_ep_len = 5
            common_reward = true

            [network]
            hidden_layers = [8]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.agent_label[2], Greedy);
        assert_eq!(cfg.max_ep_len, 5);
        assert!(cfg.common_reward);
        assert_eq!(cfg.network.hidden_layers, vec![8]);
        assert_eq!(cfg.network.actor_lr, NetworkConfig::default().actor_lr);
        assert!(cfg.validate(4).is_ok());
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = TrainingConfig::from_toml("agent_label = [\"Sneaky\"]").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.toml");
        std::fs::write(&path, "n_episodes = 7\n").unwrap();
        let cfg = TrainingConfig::load(&path).unwrap();
        assert_eq!(cfg.n_episodes, 7);

        let missing = TrainingConfig::load(dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Read(_)));
    }
}
