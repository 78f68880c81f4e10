//! Resilient consensus actor-critic.
//!
//! Agents learn decentralized policies from a shared experience buffer.
//! Cooperative agents additionally agree on a team critic and a
//! team-average reward (TR) estimate through [`crate::algorithms::consensus`],
//! while greedy, malicious and faulty agents follow their own role
//! strategies.
//!
//! The pure-Rust approximators are always available. The `rl-nn` feature
//! adds libtorch-backed networks; `parallel` runs per-node updates on rayon.

pub mod agent;
pub mod config;
pub mod environment;
pub mod metrics;
pub mod network;
pub mod role;
pub mod training;
pub mod types;

pub use agent::{Agent, AgentDims, AgentParameters};
pub use config::{NetworkConfig, TrainingConfig};
pub use environment::{Environment, GridWorld};
pub use metrics::{EpisodeSummary, RunRecorder};
pub use network::{MlpFactory, NetworkFactory, PolicyFunction, ValueFunction, WeightSnapshot};
pub use role::{behavior_for, RoleBehavior};
pub use training::{ExperienceBuffer, Trainer, TrainingOutcome, Transition};
pub use types::{AgentRole, NeighborGraph};
