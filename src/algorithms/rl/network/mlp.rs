//! Pure-Rust multilayer perceptron.
//!
//! Architecture: `input → hidden_0 → … → hidden_{L-1} → output` with ReLU
//! hidden activations and a linear output layer, trained with plain
//! mini-batch SGD. The same network serves as a value function (one output)
//! and as a softmax policy (one output per action).

use rand::Rng;

use super::{LayerKind, LayerWeights, PolicyFunction, ValueFunction, WeightSnapshot};

/// Fully connected layer with a row-major `[n_out, n_in]` kernel.
#[derive(Debug, Clone)]
struct Dense {
    weight: Vec<f64>,
    bias: Vec<f64>,
    n_in: usize,
    n_out: usize,
}

impl Dense {
    /// Xavier-uniform initialized layer with zero bias.
    fn xavier<R: Rng + ?Sized>(n_in: usize, n_out: usize, rng: &mut R) -> Self {
        let limit = (6.0 / (n_in + n_out).max(1) as f64).sqrt();
        let weight = (0..n_in * n_out)
            .map(|_| rng.gen_range(-limit..=limit))
            .collect();
        Self {
            weight,
            bias: vec![0.0; n_out],
            n_in,
            n_out,
        }
    }

    fn from_snapshot(snapshot: &WeightSnapshot, prefix: &str) -> Option<Self> {
        let w = snapshot.layer(&format!("{prefix}.weight"))?;
        let b = snapshot.layer(&format!("{prefix}.bias"))?;
        let (n_out, n_in) = match w.shape.as_slice() {
            [o, i] => (*o, *i),
            _ => return None,
        };
        Some(Self {
            weight: w.values.clone(),
            bias: b.values.clone(),
            n_in,
            n_out,
        })
    }

    fn forward(&self, x: &[f64]) -> Vec<f64> {
        (0..self.n_out)
            .map(|o| {
                let row = &self.weight[o * self.n_in..(o + 1) * self.n_in];
                self.bias[o] + row.iter().zip(x).map(|(w, v)| w * v).sum::<f64>()
            })
            .collect()
    }

    /// Backpropagates `delta` (gradient w.r.t. this layer's output) to its input.
    fn backward_input(&self, delta: &[f64]) -> Vec<f64> {
        let mut grad = vec![0.0; self.n_in];
        for (o, d) in delta.iter().enumerate() {
            let row = &self.weight[o * self.n_in..(o + 1) * self.n_in];
            for (g, w) in grad.iter_mut().zip(row) {
                *g += w * d;
            }
        }
        grad
    }

    fn export(&self, prefix: &str, kind: LayerKind) -> [LayerWeights; 2] {
        [
            LayerWeights::new(
                format!("{prefix}.weight"),
                kind,
                vec![self.n_out, self.n_in],
                self.weight.clone(),
            ),
            LayerWeights::new(
                format!("{prefix}.bias"),
                kind,
                vec![self.n_out],
                self.bias.clone(),
            ),
        ]
    }
}

/// Accumulated gradients for one layer.
#[derive(Debug, Clone)]
struct DenseGrad {
    weight: Vec<f64>,
    bias: Vec<f64>,
}

impl DenseGrad {
    fn zeros(layer: &Dense) -> Self {
        Self {
            weight: vec![0.0; layer.weight.len()],
            bias: vec![0.0; layer.bias.len()],
        }
    }

    fn accumulate(&mut self, delta: &[f64], input: &[f64]) {
        let n_in = input.len();
        for (o, d) in delta.iter().enumerate() {
            self.bias[o] += d;
            for (g, x) in self.weight[o * n_in..(o + 1) * n_in].iter_mut().zip(input) {
                *g += d * x;
            }
        }
    }

    fn apply(&self, layer: &mut Dense, step: f64) {
        for (w, g) in layer.weight.iter_mut().zip(&self.weight) {
            *w -= step * g;
        }
        for (b, g) in layer.bias.iter_mut().zip(&self.bias) {
            *b -= step * g;
        }
    }
}

/// Multilayer perceptron with ReLU hidden layers.
#[derive(Debug, Clone)]
pub struct Mlp {
    hidden: Vec<Dense>,
    output: Dense,
    learning_rate: f64,
    batch_size: usize,
}

impl Mlp {
    /// Creates a new network.
    ///
    /// # Arguments
    ///
    /// * `input_dim` - Width of each input row
    /// * `hidden_layers` - Width of each hidden layer
    /// * `output_dim` - 1 for value functions, the action count for policies
    /// * `learning_rate` - SGD step size
    /// * `batch_size` - Mini-batch size used by the fit methods
    pub fn new<R: Rng + ?Sized>(
        input_dim: usize,
        hidden_layers: &[usize],
        output_dim: usize,
        learning_rate: f64,
        batch_size: usize,
        rng: &mut R,
    ) -> Self {
        let mut hidden = Vec::with_capacity(hidden_layers.len());
        let mut n_in = input_dim;
        for &width in hidden_layers {
            hidden.push(Dense::xavier(n_in, width, rng));
            n_in = width;
        }
        Self {
            hidden,
            output: Dense::xavier(n_in, output_dim, rng),
            learning_rate,
            batch_size: batch_size.max(1),
        }
    }

    /// Hidden activations of every layer, starting with the input itself.
    fn trace(&self, x: &[f64]) -> Vec<Vec<f64>> {
        let mut acts = Vec::with_capacity(self.hidden.len() + 1);
        acts.push(x.to_vec());
        for layer in &self.hidden {
            let z = layer.forward(acts.last().map(Vec::as_slice).unwrap_or_default());
            acts.push(z.into_iter().map(|v| v.max(0.0)).collect());
        }
        acts
    }

    fn features(&self, x: &[f64]) -> Vec<f64> {
        self.trace(x).pop().unwrap_or_default()
    }

    /// Raw output-layer values for one input.
    pub fn forward(&self, x: &[f64]) -> Vec<f64> {
        self.output.forward(&self.features(x))
    }

    /// Runs SGD over `n` samples in mini-batches.
    ///
    /// `loss_grad(i, out)` returns the loss of sample `i` and the gradient
    /// of that loss w.r.t. the raw outputs.
    fn sgd_pass<I, F>(&mut self, n: usize, input: I, head_only: bool, loss_grad: F) -> f64
    where
        I: Fn(usize) -> Vec<f64>,
        F: Fn(usize, &[f64]) -> (f64, Vec<f64>),
    {
        if n == 0 {
            return 0.0;
        }
        let mut total_loss = 0.0;
        let mut start = 0;
        while start < n {
            let end = (start + self.batch_size).min(n);
            let mut out_grad = DenseGrad::zeros(&self.output);
            let mut hidden_grads: Vec<DenseGrad> =
                self.hidden.iter().map(DenseGrad::zeros).collect();

            for i in start..end {
                let acts = self.trace(&input(i));
                let features = acts.last().map(Vec::as_slice).unwrap_or_default();
                let out = self.output.forward(features);
                let (loss, g_out) = loss_grad(i, &out);
                total_loss += loss;

                out_grad.accumulate(&g_out, features);
                if head_only {
                    continue;
                }
                let mut delta = self.output.backward_input(&g_out);
                for l in (0..self.hidden.len()).rev() {
                    for (d, a) in delta.iter_mut().zip(&acts[l + 1]) {
                        if *a <= 0.0 {
                            *d = 0.0;
                        }
                    }
                    hidden_grads[l].accumulate(&delta, &acts[l]);
                    delta = self.hidden[l].backward_input(&delta);
                }
            }

            let step = self.learning_rate / (end - start) as f64;
            out_grad.apply(&mut self.output, step);
            if !head_only {
                for (layer, grad) in self.hidden.iter_mut().zip(&hidden_grads) {
                    grad.apply(layer, step);
                }
            }
            start = end;
        }
        total_loss / n as f64
    }

    fn regress(&mut self, inputs: &[Vec<f64>], targets: &[f64], head_only: bool) -> f64 {
        let n = inputs.len().min(targets.len());
        self.sgd_pass(n, |i| inputs[i].clone(), head_only, |i, out| {
            let err = out[0] - targets[i];
            (err * err, vec![2.0 * err])
        })
    }

    fn export(&self) -> WeightSnapshot {
        let mut layers = Vec::with_capacity(2 * (self.hidden.len() + 1));
        for (i, layer) in self.hidden.iter().enumerate() {
            layers.extend(layer.export(&format!("hidden_{i}"), LayerKind::Hidden));
        }
        layers.extend(self.output.export("output", LayerKind::Output));
        WeightSnapshot::new(layers)
    }
}

fn softmax(logits: &[f64]) -> Vec<f64> {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

impl ValueFunction for Mlp {
    fn predict(&self, inputs: &[Vec<f64>]) -> Vec<f64> {
        inputs.iter().map(|x| self.forward(x)[0]).collect()
    }

    fn predict_with_head(&self, inputs: &[Vec<f64>], head: &WeightSnapshot) -> Vec<f64> {
        let Some(output) = Dense::from_snapshot(head, "output") else {
            return self.predict(inputs);
        };
        inputs
            .iter()
            .map(|x| output.forward(&self.features(x))[0])
            .collect()
    }

    fn snapshot(&self) -> WeightSnapshot {
        self.export()
    }

    fn load_hidden(&mut self, hidden: &[LayerWeights]) {
        for (i, layer) in self.hidden.iter_mut().enumerate() {
            let prefix = format!("hidden_{i}");
            for lw in hidden.iter().filter(|l| l.kind == LayerKind::Hidden) {
                let Some(suffix) = lw.name.strip_prefix(&prefix) else {
                    continue;
                };
                let target = match suffix {
                    ".weight" => &mut layer.weight,
                    ".bias" => &mut layer.bias,
                    _ => continue,
                };
                if target.len() == lw.values.len() {
                    target.copy_from_slice(&lw.values);
                }
            }
        }
    }

    fn fit(&mut self, inputs: &[Vec<f64>], targets: &[f64]) -> f64 {
        self.regress(inputs, targets, false)
    }

    fn fit_head(&mut self, inputs: &[Vec<f64>], targets: &[f64]) -> f64 {
        self.regress(inputs, targets, true)
    }
}

impl PolicyFunction for Mlp {
    fn probabilities(&self, input: &[f64]) -> Vec<f64> {
        softmax(&self.forward(input))
    }

    fn fit_policy_gradient(
        &mut self,
        inputs: &[Vec<f64>],
        actions: &[usize],
        advantages: &[f64],
    ) -> f64 {
        let n = inputs.len().min(actions.len()).min(advantages.len());
        self.sgd_pass(n, |i| inputs[i].clone(), false, |i, out| {
            let probs = softmax(out);
            let a = actions[i].min(probs.len() - 1);
            let adv = advantages[i];
            let loss = -probs[a].max(f64::MIN_POSITIVE).ln() * adv;
            // d(-log π(a) · A)/d logits = (π - onehot(a)) · A
            let grad = probs
                .iter()
                .enumerate()
                .map(|(k, p)| (p - if k == a { 1.0 } else { 0.0 }) * adv)
                .collect();
            (loss, grad)
        })
    }

    fn snapshot(&self) -> WeightSnapshot {
        self.export()
    }
}
