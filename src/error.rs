use thiserror::Error;

/// Configuration problems detected before training starts.
///
/// None of these are recoverable at runtime: the trainer refuses to start
/// when any of them is present.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("agent_label has {labels} entries but the environment has {agents} agents")]
    LabelCountMismatch { labels: usize, agents: usize },

    #[error("at least one Cooperative agent is required")]
    NoCooperativeAgents,

    #[error("cooperative node {0} has no in_nodes entry")]
    MissingNeighbors(usize),

    #[error("node {node} lists in-neighbor {neighbor}, but there are only {n_agents} agents")]
    UnknownNeighbor {
        node: usize,
        neighbor: usize,
        n_agents: usize,
    },

    #[error(
        "cooperative node {node} has {neighbors} in-neighbors, \
         which cannot tolerate {tolerance} Byzantine neighbors (need more than {})",
        2 * .tolerance
    )]
    InsufficientNeighbors {
        node: usize,
        neighbors: usize,
        tolerance: usize,
    },

    #[error("invalid value for `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("failed to read configuration: {0}")]
    Read(String),

    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

/// Errors surfaced by a training run.
#[derive(Debug, Error)]
pub enum TrainingError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("run artifact I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize run summaries: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_neighbors_display() {
        let e = ConfigError::InsufficientNeighbors {
            node: 2,
            neighbors: 2,
            tolerance: 1,
        };
        let s = e.to_string();
        assert!(s.contains("cooperative node 2"));
        assert!(s.contains("need more than 2"));
    }

    #[test]
    fn label_mismatch_display() {
        let e = ConfigError::LabelCountMismatch {
            labels: 3,
            agents: 4,
        };
        assert_eq!(
            e.to_string(),
            "agent_label has 3 entries but the environment has 4 agents"
        );
    }

    #[test]
    fn config_error_converts_into_training_error() {
        let e: TrainingError = ConfigError::NoCooperativeAgents.into();
        assert_eq!(e.to_string(), "at least one Cooperative agent is required");
    }
}
