//! Function approximator contracts.
//!
//! Agents own their critic, team-average reward (TR) and actor
//! approximators only through the [`ValueFunction`] and [`PolicyFunction`]
//! traits, so any backend that can export and import its layers as a
//! [`WeightSnapshot`] can take part in consensus.
//!
//! Two backends are provided:
//! - [`Mlp`]: a small pure-Rust multilayer perceptron (always available).
//! - `TchValueNetwork` / `TchPolicyNetwork`: libtorch-backed networks,
//!   available with the `rl-nn` feature.

pub mod mlp;
#[cfg(feature = "rl-nn")]
pub mod torch;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

pub use mlp::Mlp;
#[cfg(feature = "rl-nn")]
pub use torch::{TchFactory, TchPolicyNetwork, TchValueNetwork};

/// Position of a layer inside an approximator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayerKind {
    /// Shared by every role; subject to hidden-layer consensus.
    Hidden,
    /// Final projection; exchanged only through evaluated outputs.
    Output,
}

/// One named parameter tensor, flattened in row-major order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerWeights {
    pub name: String,
    pub kind: LayerKind,
    pub shape: Vec<usize>,
    pub values: Vec<f64>,
}

impl LayerWeights {
    pub fn new(name: impl Into<String>, kind: LayerKind, shape: Vec<usize>, values: Vec<f64>) -> Self {
        debug_assert_eq!(shape.iter().product::<usize>(), values.len());
        Self {
            name: name.into(),
            kind,
            shape,
            values,
        }
    }

    /// Whether `other` can be aggregated coordinate-wise with this layer.
    pub fn is_compatible(&self, other: &LayerWeights) -> bool {
        self.name == other.name && self.kind == other.kind && self.shape == other.shape
    }
}

/// Exported parameters of a critic or TR approximator.
///
/// Layers are kept in a fixed backend-defined order; two snapshots from
/// approximators with the same architecture are layer-for-layer compatible.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightSnapshot {
    pub layers: Vec<LayerWeights>,
}

impl WeightSnapshot {
    pub fn new(layers: Vec<LayerWeights>) -> Self {
        Self { layers }
    }

    /// Layers shared across roles.
    pub fn hidden(&self) -> impl Iterator<Item = &LayerWeights> {
        self.layers.iter().filter(|l| l.kind == LayerKind::Hidden)
    }

    /// Final-layer parameters.
    pub fn output(&self) -> impl Iterator<Item = &LayerWeights> {
        self.layers.iter().filter(|l| l.kind == LayerKind::Output)
    }

    /// Looks up a layer by name.
    pub fn layer(&self, name: &str) -> Option<&LayerWeights> {
        self.layers.iter().find(|l| l.name == name)
    }

    /// Total number of scalar parameters.
    pub fn n_params(&self) -> usize {
        self.layers.iter().map(|l| l.values.len()).sum()
    }

    /// Whether both snapshots share names, kinds and shapes layer by layer.
    pub fn is_compatible(&self, other: &WeightSnapshot) -> bool {
        self.layers.len() == other.layers.len()
            && self
                .layers
                .iter()
                .zip(&other.layers)
                .all(|(a, b)| a.is_compatible(b))
    }
}

/// Scalar-valued approximator used for critics and TR estimators.
///
/// Inputs are row-major batches: one feature vector per sample.
pub trait ValueFunction: Send {
    /// Evaluates the approximator on every input row.
    fn predict(&self, inputs: &[Vec<f64>]) -> Vec<f64>;

    /// Evaluates this approximator's hidden layers followed by the output
    /// layer taken from `head`.
    fn predict_with_head(&self, inputs: &[Vec<f64>], head: &WeightSnapshot) -> Vec<f64>;

    /// Exports the current parameters. Must not modify any state.
    fn snapshot(&self) -> WeightSnapshot;

    /// Overwrites hidden layers with the given values, matched by name.
    fn load_hidden(&mut self, hidden: &[LayerWeights]);

    /// One pass of mini-batch regression toward `targets` on all layers.
    ///
    /// Returns the mean squared error observed during the pass.
    fn fit(&mut self, inputs: &[Vec<f64>], targets: &[f64]) -> f64;

    /// Same as [`ValueFunction::fit`] but only the output layer moves.
    fn fit_head(&mut self, inputs: &[Vec<f64>], targets: &[f64]) -> f64;
}

/// Discrete stochastic policy.
pub trait PolicyFunction: Send {
    /// Action probabilities for a single input.
    fn probabilities(&self, input: &[f64]) -> Vec<f64>;

    /// One pass of policy-gradient ascent on `advantages`.
    ///
    /// Returns the mean surrogate loss `-log π(a|x) · A`.
    fn fit_policy_gradient(
        &mut self,
        inputs: &[Vec<f64>],
        actions: &[usize],
        advantages: &[f64],
    ) -> f64;

    /// Exports the current parameters.
    fn snapshot(&self) -> WeightSnapshot;
}

/// Builds approximators for newly created agents.
pub trait NetworkFactory {
    fn value_function(&mut self, input_dim: usize, learning_rate: f64) -> Box<dyn ValueFunction>;

    fn policy(
        &mut self,
        input_dim: usize,
        n_actions: usize,
        learning_rate: f64,
    ) -> Box<dyn PolicyFunction>;
}

/// Factory producing pure-Rust [`Mlp`] approximators.
#[derive(Debug)]
pub struct MlpFactory {
    hidden_layers: Vec<usize>,
    batch_size: usize,
    rng: StdRng,
}

impl MlpFactory {
    pub fn new(hidden_layers: Vec<usize>, batch_size: usize, seed: u64) -> Self {
        Self {
            hidden_layers,
            batch_size,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl NetworkFactory for MlpFactory {
    fn value_function(&mut self, input_dim: usize, learning_rate: f64) -> Box<dyn ValueFunction> {
        Box::new(Mlp::new(
            input_dim,
            &self.hidden_layers,
            1,
            learning_rate,
            self.batch_size,
            &mut self.rng,
        ))
    }

    fn policy(
        &mut self,
        input_dim: usize,
        n_actions: usize,
        learning_rate: f64,
    ) -> Box<dyn PolicyFunction> {
        Box::new(Mlp::new(
            input_dim,
            &self.hidden_layers,
            n_actions,
            learning_rate,
            self.batch_size,
            &mut self.rng,
        ))
    }
}

/// Samples an index from a discrete distribution.
///
/// Falls back to the last index when rounding leaves residual mass, and
/// to index 0 when the distribution is not finite.
pub fn sample_categorical<R: rand::Rng + ?Sized>(probs: &[f64], rng: &mut R) -> usize {
    let total: f64 = probs.iter().sum();
    if !total.is_finite() || total <= 0.0 {
        return 0;
    }
    let mut u = rng.gen::<f64>() * total;
    for (i, &p) in probs.iter().enumerate() {
        if u < p {
            return i;
        }
        u -= p;
    }
    probs.len().saturating_sub(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(name: &str, kind: LayerKind, values: Vec<f64>) -> LayerWeights {
        LayerWeights::new(name, kind, vec![values.len()], values)
    }

    #[test]
    fn snapshot_partitions_layers() {
        let snap = WeightSnapshot::new(vec![
            layer("hidden_0.weight", LayerKind::Hidden, vec![1.0, 2.0]),
            layer("hidden_0.bias", LayerKind::Hidden, vec![0.0]),
            layer("output.weight", LayerKind::Output, vec![3.0]),
        ]);
        assert_eq!(snap.hidden().count(), 2);
        assert_eq!(snap.output().count(), 1);
        assert_eq!(snap.n_params(), 4);
        assert!(snap.layer("output.weight").is_some());
    }

    #[test]
    fn compatibility_checks_shapes() {
        let a = WeightSnapshot::new(vec![layer("w", LayerKind::Hidden, vec![1.0, 2.0])]);
        let b = WeightSnapshot::new(vec![layer("w", LayerKind::Hidden, vec![5.0, 6.0])]);
        let c = WeightSnapshot::new(vec![layer("w", LayerKind::Hidden, vec![5.0])]);
        assert!(a.is_compatible(&b));
        assert!(!a.is_compatible(&c));
    }

    #[test]
    fn categorical_sampling_respects_support() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..100 {
            assert_eq!(sample_categorical(&[0.0, 1.0, 0.0], &mut rng), 1);
        }
        assert_eq!(sample_categorical(&[f64::NAN, 1.0], &mut rng), 0);
    }

    #[test]
    fn factory_builds_consensus_compatible_networks() {
        let mut factory = MlpFactory::new(vec![4, 3], 8, 11);
        let a = factory.value_function(5, 0.1);
        let b = factory.value_function(5, 0.1);
        assert!(a.snapshot().is_compatible(&b.snapshot()));
        assert_ne!(a.snapshot(), b.snapshot());
    }
}
