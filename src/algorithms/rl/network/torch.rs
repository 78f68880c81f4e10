//! Neural network approximators using tch-rs (PyTorch bindings).
//!
//! Layers are registered in a [`nn::VarStore`] under `hidden_{i}` and
//! `output`, so exported variable names match the pure-Rust [`super::Mlp`]
//! and snapshots from either backend share one layout. Hidden layers and the
//! output layer live in separate var stores, each with its own SGD
//! optimizer, so team updates can step the output layer alone.
//!
//! This module is only available with the `rl-nn` feature.

use tch::{nn, nn::Module, nn::OptimizerConfig, Device, Kind, TchError, Tensor};
use tracing::error;

use super::{
    LayerKind, LayerWeights, NetworkFactory, PolicyFunction, ValueFunction, WeightSnapshot,
};

struct Optimizers {
    hidden: nn::Optimizer,
    head: nn::Optimizer,
}

impl Optimizers {
    fn sgd(hidden: &nn::VarStore, head: &nn::VarStore, lr: f64) -> Result<Self, TchError> {
        Ok(Self {
            hidden: nn::Sgd::default().build(hidden, lr)?,
            head: nn::Sgd::default().build(head, lr)?,
        })
    }

    fn zero_grad(&mut self) {
        self.hidden.zero_grad();
        self.head.zero_grad();
    }
}

/// Shared MLP body: `input → hidden_* (ReLU) → output`.
struct TchMlp {
    _hidden_vs: nn::VarStore,
    _head_vs: nn::VarStore,
    hidden: Vec<nn::Linear>,
    output: nn::Linear,
    /// `None` if libtorch refused to build the optimizers; fits then
    /// report a NaN loss.
    optimizers: Option<Optimizers>,
    batch_size: usize,
    device: Device,
}

impl TchMlp {
    fn new(
        input_dim: usize,
        hidden_layers: &[usize],
        output_dim: usize,
        learning_rate: f64,
        batch_size: usize,
        device: Device,
    ) -> Self {
        let hidden_vs = nn::VarStore::new(device);
        let head_vs = nn::VarStore::new(device);
        let p = &hidden_vs.root();
        let mut hidden = Vec::with_capacity(hidden_layers.len());
        let mut n_in = input_dim as i64;
        for (i, &width) in hidden_layers.iter().enumerate() {
            hidden.push(nn::linear(
                p / format!("hidden_{i}"),
                n_in,
                width as i64,
                Default::default(),
            ));
            n_in = width as i64;
        }
        let output = nn::linear(
            &head_vs.root() / "output",
            n_in,
            output_dim as i64,
            Default::default(),
        );
        let optimizers = Optimizers::sgd(&hidden_vs, &head_vs, learning_rate)
            .map_err(|e| error!("failed to build SGD optimizers: {e}"))
            .ok();
        Self {
            _hidden_vs: hidden_vs,
            _head_vs: head_vs,
            hidden,
            output,
            optimizers,
            batch_size: batch_size.max(1),
            device,
        }
    }

    fn rows_to_tensor(&self, rows: &[Vec<f64>]) -> Tensor {
        let width = rows.first().map(Vec::len).unwrap_or(0);
        let flat: Vec<f32> = rows.iter().flatten().map(|&v| v as f32).collect();
        Tensor::from_slice(&flat)
            .reshape([rows.len() as i64, width as i64])
            .to_device(self.device)
    }

    fn features(&self, x: &Tensor) -> Tensor {
        self.hidden
            .iter()
            .fold(x.shallow_clone(), |h, layer| layer.forward(&h).relu())
    }

    fn forward(&self, x: &Tensor) -> Tensor {
        self.output.forward(&self.features(x))
    }

    fn named_layers(&self) -> Vec<(String, LayerKind, &nn::Linear)> {
        let mut layers: Vec<_> = self
            .hidden
            .iter()
            .enumerate()
            .map(|(i, l)| (format!("hidden_{i}"), LayerKind::Hidden, l))
            .collect();
        layers.push(("output".to_string(), LayerKind::Output, &self.output));
        layers
    }

    fn snapshot(&self) -> WeightSnapshot {
        let mut layers = Vec::new();
        for (prefix, kind, linear) in self.named_layers() {
            layers.push(export(format!("{prefix}.weight"), kind, &linear.ws));
            if let Some(bs) = &linear.bs {
                layers.push(export(format!("{prefix}.bias"), kind, bs));
            }
        }
        WeightSnapshot::new(layers)
    }

    fn load_hidden(&mut self, hidden: &[LayerWeights]) {
        let device = self.device;
        tch::no_grad(|| {
            for (i, linear) in self.hidden.iter_mut().enumerate() {
                let prefix = format!("hidden_{i}");
                for lw in hidden.iter().filter(|l| l.kind == LayerKind::Hidden) {
                    match lw.name.strip_prefix(&prefix) {
                        Some(".weight") => import(&mut linear.ws, lw, device),
                        Some(".bias") => {
                            if let Some(bs) = linear.bs.as_mut() {
                                import(bs, lw, device);
                            }
                        }
                        _ => {}
                    }
                }
            }
        });
    }

    /// Mini-batch SGD; `loss_fn(outputs, start, end)` builds the batch loss.
    /// With `head_only` the hidden layers are left untouched.
    fn sgd_pass<F>(&mut self, inputs: &[Vec<f64>], n: usize, head_only: bool, loss_fn: F) -> f64
    where
        F: Fn(&Tensor, usize, usize) -> Tensor,
    {
        if n == 0 {
            return 0.0;
        }
        if self.optimizers.is_none() {
            return f64::NAN;
        }
        let mut total = 0.0;
        let mut start = 0;
        while start < n {
            let end = (start + self.batch_size).min(n);
            let x = self.rows_to_tensor(&inputs[start..end]);
            let loss = loss_fn(&self.forward(&x), start, end);
            total += f64::try_from(&loss).unwrap_or(f64::NAN) * (end - start) as f64;

            if let Some(opt) = self.optimizers.as_mut() {
                opt.zero_grad();
                loss.backward();
                opt.head.step();
                if !head_only {
                    opt.hidden.step();
                }
            }
            start = end;
        }
        total / n as f64
    }

    fn regress(&mut self, inputs: &[Vec<f64>], targets: &[f64], head_only: bool) -> f64 {
        let n = inputs.len().min(targets.len());
        let y: Vec<f32> = targets[..n].iter().map(|&t| t as f32).collect();
        let y = Tensor::from_slice(&y).to_device(self.device);
        self.sgd_pass(inputs, n, head_only, |out, start, end| {
            let pred = out.squeeze_dim(-1);
            let target = y.narrow(0, start as i64, (end - start) as i64);
            (pred - target).pow_tensor_scalar(2).mean(Kind::Float)
        })
    }
}

fn export(name: String, kind: LayerKind, t: &Tensor) -> LayerWeights {
    let shape: Vec<usize> = t.size().iter().map(|&d| d as usize).collect();
    LayerWeights::new(name, kind, shape, tensor_to_vec(t))
}

fn import(dst: &mut Tensor, src: &LayerWeights, device: Device) {
    if dst.numel() != src.values.len() {
        return;
    }
    let flat: Vec<f32> = src.values.iter().map(|&v| v as f32).collect();
    let value = Tensor::from_slice(&flat).reshape(dst.size()).to_device(device);
    dst.copy_(&value);
}

fn tensor_to_vec(t: &Tensor) -> Vec<f64> {
    let flat = t
        .detach()
        .to_device(Device::Cpu)
        .to_kind(Kind::Double)
        .flatten(0, -1);
    let n = flat.numel();
    let mut out = vec![0.0; n];
    flat.copy_data(&mut out, n);
    out
}

/// MLP value network (critic or team-average reward estimator).
pub struct TchValueNetwork {
    body: TchMlp,
}

impl TchValueNetwork {
    /// Creates a new value network with a single output.
    pub fn new(
        input_dim: usize,
        hidden_layers: &[usize],
        learning_rate: f64,
        batch_size: usize,
        device: Device,
    ) -> Self {
        Self {
            body: TchMlp::new(input_dim, hidden_layers, 1, learning_rate, batch_size, device),
        }
    }
}

impl ValueFunction for TchValueNetwork {
    fn predict(&self, inputs: &[Vec<f64>]) -> Vec<f64> {
        if inputs.is_empty() {
            return Vec::new();
        }
        tch::no_grad(|| {
            let x = self.body.rows_to_tensor(inputs);
            tensor_to_vec(&self.body.forward(&x))
        })
    }

    fn predict_with_head(&self, inputs: &[Vec<f64>], head: &WeightSnapshot) -> Vec<f64> {
        let (Some(w), Some(b)) = (head.layer("output.weight"), head.layer("output.bias")) else {
            return self.predict(inputs);
        };
        if inputs.is_empty() {
            return Vec::new();
        }
        tch::no_grad(|| {
            let device = self.body.device;
            let to_tensor = |lw: &LayerWeights| {
                let flat: Vec<f32> = lw.values.iter().map(|&v| v as f32).collect();
                let shape: Vec<i64> = lw.shape.iter().map(|&d| d as i64).collect();
                Tensor::from_slice(&flat).reshape(shape).to_device(device)
            };
            let x = self.body.rows_to_tensor(inputs);
            let out = self
                .body
                .features(&x)
                .linear(&to_tensor(w), Some(&to_tensor(b)));
            tensor_to_vec(&out)
        })
    }

    fn snapshot(&self) -> WeightSnapshot {
        self.body.snapshot()
    }

    fn load_hidden(&mut self, hidden: &[LayerWeights]) {
        self.body.load_hidden(hidden);
    }

    fn fit(&mut self, inputs: &[Vec<f64>], targets: &[f64]) -> f64 {
        self.body.regress(inputs, targets, false)
    }

    fn fit_head(&mut self, inputs: &[Vec<f64>], targets: &[f64]) -> f64 {
        self.body.regress(inputs, targets, true)
    }
}

/// MLP actor network producing a softmax distribution over actions.
pub struct TchPolicyNetwork {
    body: TchMlp,
}

impl TchPolicyNetwork {
    /// Creates a new actor network.
    pub fn new(
        input_dim: usize,
        hidden_layers: &[usize],
        n_actions: usize,
        learning_rate: f64,
        batch_size: usize,
        device: Device,
    ) -> Self {
        Self {
            body: TchMlp::new(
                input_dim,
                hidden_layers,
                n_actions,
                learning_rate,
                batch_size,
                device,
            ),
        }
    }
}

impl PolicyFunction for TchPolicyNetwork {
    fn probabilities(&self, input: &[f64]) -> Vec<f64> {
        tch::no_grad(|| {
            let x = self.body.rows_to_tensor(&[input.to_vec()]);
            let probs = self.body.forward(&x).softmax(-1, Kind::Float);
            tensor_to_vec(&probs)
        })
    }

    fn fit_policy_gradient(
        &mut self,
        inputs: &[Vec<f64>],
        actions: &[usize],
        advantages: &[f64],
    ) -> f64 {
        let n = inputs.len().min(actions.len()).min(advantages.len());
        let device = self.body.device;
        let acts: Vec<i64> = actions[..n].iter().map(|&a| a as i64).collect();
        let acts = Tensor::from_slice(&acts).to_device(device);
        let adv: Vec<f32> = advantages[..n].iter().map(|&a| a as f32).collect();
        let adv = Tensor::from_slice(&adv).to_device(device);
        self.body.sgd_pass(inputs, n, false, |out, start, end| {
            let len = (end - start) as i64;
            let log_probs = out.log_softmax(-1, Kind::Float);
            let selected = log_probs
                .gather(-1, &acts.narrow(0, start as i64, len).unsqueeze(-1), false)
                .squeeze_dim(-1);
            -(selected * adv.narrow(0, start as i64, len)).mean(Kind::Float)
        })
    }

    fn snapshot(&self) -> WeightSnapshot {
        self.body.snapshot()
    }
}

/// Factory producing libtorch-backed approximators on one device.
#[derive(Debug, Clone)]
pub struct TchFactory {
    hidden_layers: Vec<usize>,
    batch_size: usize,
    device: Device,
}

impl TchFactory {
    /// Creates a factory and seeds libtorch's global generator.
    pub fn new(hidden_layers: Vec<usize>, batch_size: usize, seed: u64, device: Device) -> Self {
        tch::manual_seed(seed as i64);
        Self {
            hidden_layers,
            batch_size,
            device,
        }
    }
}

impl NetworkFactory for TchFactory {
    fn value_function(&mut self, input_dim: usize, learning_rate: f64) -> Box<dyn ValueFunction> {
        Box::new(TchValueNetwork::new(
            input_dim,
            &self.hidden_layers,
            learning_rate,
            self.batch_size,
            self.device,
        ))
    }

    fn policy(
        &mut self,
        input_dim: usize,
        n_actions: usize,
        learning_rate: f64,
    ) -> Box<dyn PolicyFunction> {
        Box::new(TchPolicyNetwork::new(
            input_dim,
            &self.hidden_layers,
            n_actions,
            learning_rate,
            self.batch_size,
            self.device,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_network_layout_matches_mlp() {
        let net = TchValueNetwork::new(6, &[8, 4], 1e-2, 4, Device::Cpu);
        let snap = net.snapshot();
        let names: Vec<&str> = snap.layers.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "hidden_0.weight",
                "hidden_0.bias",
                "hidden_1.weight",
                "hidden_1.bias",
                "output.weight",
                "output.bias"
            ]
        );
        assert_eq!(snap.layer("hidden_0.weight").unwrap().shape, vec![8, 6]);
    }

    #[test]
    fn predict_shape() {
        let net = TchValueNetwork::new(3, &[4], 1e-2, 4, Device::Cpu);
        let out = net.predict(&[vec![0.0; 3], vec![1.0; 3]]);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn fit_head_keeps_hidden_layers() {
        let mut net = TchValueNetwork::new(3, &[4], 1e-1, 4, Device::Cpu);
        let before = net.snapshot();
        net.fit_head(&[vec![0.5; 3]; 4], &[3.0; 4]);
        let after = net.snapshot();
        assert!(before.hidden().eq(after.hidden()));
        assert_ne!(before.output().collect::<Vec<_>>(), after.output().collect::<Vec<_>>());
    }

    #[test]
    fn load_hidden_round_trips_between_networks() {
        let a = TchValueNetwork::new(3, &[4], 1e-2, 4, Device::Cpu);
        let mut b = TchValueNetwork::new(3, &[4], 1e-2, 4, Device::Cpu);
        let hidden: Vec<LayerWeights> = a.snapshot().hidden().cloned().collect();
        b.load_hidden(&hidden);
        assert!(b.snapshot().hidden().eq(hidden.iter()));
    }

    #[test]
    fn policy_probabilities_are_normalized() {
        let policy = TchPolicyNetwork::new(4, &[8], 5, 1e-3, 4, Device::Cpu);
        let probs = policy.probabilities(&[0.1, 0.2, 0.3, 0.4]);
        assert_eq!(probs.len(), 5);
        assert!((probs.iter().sum::<f64>() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn fit_moves_every_layer() {
        let mut net = TchValueNetwork::new(3, &[8], 1e-1, 4, Device::Cpu);
        let before = net.snapshot();
        let loss = net.fit(&[vec![0.5; 3]; 4], &[3.0; 4]);
        assert!(loss.is_finite());
        let after = net.snapshot();
        assert!(!before.hidden().eq(after.hidden()));
        assert_ne!(before.output().collect::<Vec<_>>(), after.output().collect::<Vec<_>>());
    }
}
