//! resilient-ac - Byzantine-resilient multi-agent actor-critic
//!
//! Trains decentralized actor-critic agents over a fixed communication
//! graph. Cooperative agents filter the critic and team-reward estimates
//! broadcast by their neighbors with a trimmed mean, which bounds the
//! influence of up to `f` malicious or faulty neighbors.

pub mod algorithms;
pub mod error;
pub mod telemetry;

pub use algorithms::consensus::{Aggregator, ConsensusEngine, TrimmedMean};
pub use algorithms::rl::{
    AgentRole, Environment, EpisodeSummary, GridWorld, RunRecorder, Trainer, TrainingConfig,
    TrainingOutcome,
};
pub use error::{ConfigError, TrainingError};
