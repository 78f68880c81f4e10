//! Byzantine-resilient consensus among cooperative agents.
//!
//! Cooperative nodes agree on their critic and team-average reward
//! approximators in two passes: first on the hidden layers' raw weights,
//! then on the outputs evaluated with every neighbor's final layer. Both
//! passes use an [`Aggregator`] that tolerates a bounded number of arbitrary
//! contributions per coordinate.

pub mod aggregator;
pub mod engine;

pub use aggregator::{Aggregator, TrimmedMean};
pub use engine::{hidden_consensus, output_consensus, ConsensusEngine, PublishedWeights, TeamUpdate};
