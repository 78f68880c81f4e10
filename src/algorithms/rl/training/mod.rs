//! Experience storage and the training loop.

pub mod buffer;
pub mod trainer;

pub use buffer::{Batch, ExperienceBuffer, Observation, Transition};
pub use trainer::{EpochReport, Trainer, TrainingOutcome};
