//! Feed-forward network substrate: layers, explicit backpropagation, Adam.
//!
//! Everything the learners train is built from [`Mlp`]. The backward pass is
//! hand-derived and returns both parameter gradients and the gradient with
//! respect to the input, which is what lets the team-value loss flow from the
//! mixing network back into every agent network, and what the
//! explanation routine uses for input saliency.

use ndarray::{Array1, Array2};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    Relu,
    Elu,
    Tanh,
    Linear,
}

impl Activation {
    pub(crate) fn apply(self, x: f64) -> f64 {
        match self {
            Activation::Relu => x.max(0.0),
            Activation::Elu => {
                if x > 0.0 {
                    x
                } else {
                    x.exp() - 1.0
                }
            }
            Activation::Tanh => x.tanh(),
            Activation::Linear => x,
        }
    }

    /// Derivative evaluated at the pre-activation value.
    pub(crate) fn derivative(self, z: f64) -> f64 {
        match self {
            Activation::Relu => {
                if z > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::Elu => {
                if z > 0.0 {
                    1.0
                } else {
                    z.exp()
                }
            }
            Activation::Tanh => 1.0 - z.tanh().powi(2),
            Activation::Linear => 1.0,
        }
    }
}

/// One dense layer. Weights are stored input-major: `weights[[i, j]]`
/// connects input `i` to output `j`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Layer {
    pub weights: Array2<f64>,
    pub biases: Array1<f64>,
    pub activation: Activation,
}

impl Layer {
    fn new(input_size: usize, output_size: usize, activation: Activation) -> Self {
        // Xavier initialization
        let scale = (2.0 / (input_size + output_size) as f64).sqrt();
        Self {
            weights: Array2::random((input_size, output_size), Uniform::new(-scale, scale)),
            biases: Array1::zeros(output_size),
            activation,
        }
    }

    fn pre_activation(&self, input: &Array1<f64>) -> Array1<f64> {
        input.dot(&self.weights) + &self.biases
    }
}

/// Gradients for one layer, same shapes as the parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerGrads {
    pub weights: Array2<f64>,
    pub biases: Array1<f64>,
}

impl LayerGrads {
    fn zeros_like(layer: &Layer) -> Self {
        Self {
            weights: Array2::zeros(layer.weights.dim()),
            biases: Array1::zeros(layer.biases.len()),
        }
    }
}

/// Accumulated gradients for a whole network.
#[derive(Debug, Clone)]
pub struct MlpGrads {
    pub layers: Vec<LayerGrads>,
}

impl MlpGrads {
    pub fn accumulate(&mut self, other: &MlpGrads) {
        for (mine, theirs) in self.layers.iter_mut().zip(&other.layers) {
            mine.weights += &theirs.weights;
            mine.biases += &theirs.biases;
        }
    }

    pub fn scale(&mut self, factor: f64) {
        for layer in &mut self.layers {
            layer.weights *= factor;
            layer.biases *= factor;
        }
    }

    pub fn squared_norm(&self) -> f64 {
        self.layers
            .iter()
            .map(|l| {
                l.weights.iter().map(|w| w * w).sum::<f64>()
                    + l.biases.iter().map(|b| b * b).sum::<f64>()
            })
            .sum()
    }

    pub fn is_finite(&self) -> bool {
        self.layers.iter().all(|l| {
            l.weights.iter().all(|w| w.is_finite()) && l.biases.iter().all(|b| b.is_finite())
        })
    }
}

/// Clip the joint gradient of several networks to a maximum global L2 norm.
pub fn clip_global_norm(grads: &mut [&mut MlpGrads], max_norm: f64) -> f64 {
    let total: f64 = grads.iter().map(|g| g.squared_norm()).sum::<f64>().sqrt();
    if total > max_norm && total > 0.0 {
        let factor = max_norm / total;
        for g in grads.iter_mut() {
            g.scale(factor);
        }
    }
    total
}

/// Per-sample forward cache consumed by [`Mlp::backward`].
pub struct MlpCache {
    /// Input to each layer (first entry is the network input).
    inputs: Vec<Array1<f64>>,
    /// Pre-activation values of each layer.
    pre_activations: Vec<Array1<f64>>,
}

/// A plain multilayer perceptron.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mlp {
    layers: Vec<Layer>,
}

impl Mlp {
    /// Build a network from layer sizes. `hidden` activates every layer but
    /// the last, which gets `output`.
    pub fn new(sizes: &[usize], hidden: Activation, output: Activation) -> Self {
        assert!(sizes.len() >= 2, "need at least input and output sizes");
        let layers = (0..sizes.len() - 1)
            .map(|i| {
                let activation = if i == sizes.len() - 2 { output } else { hidden };
                Layer::new(sizes[i], sizes[i + 1], activation)
            })
            .collect();
        Self { layers }
    }

    pub fn input_dim(&self) -> usize {
        self.layers[0].weights.nrows()
    }

    pub fn output_dim(&self) -> usize {
        self.layers[self.layers.len() - 1].weights.ncols()
    }

    pub fn forward(&self, input: &Array1<f64>) -> Array1<f64> {
        let mut out = input.clone();
        for layer in &self.layers {
            out = layer
                .pre_activation(&out)
                .mapv(|z| layer.activation.apply(z));
        }
        out
    }

    pub fn forward_cached(&self, input: &Array1<f64>) -> (Array1<f64>, MlpCache) {
        let mut inputs = Vec::with_capacity(self.layers.len());
        let mut pre_activations = Vec::with_capacity(self.layers.len());
        let mut out = input.clone();
        for layer in &self.layers {
            inputs.push(out.clone());
            let z = layer.pre_activation(&out);
            out = z.mapv(|v| layer.activation.apply(v));
            pre_activations.push(z);
        }
        (out, MlpCache { inputs, pre_activations })
    }

    /// Backpropagate `grad_output` (dL/d output) through the cached forward
    /// pass. Returns parameter gradients and dL/d input.
    pub fn backward(&self, cache: &MlpCache, grad_output: &Array1<f64>) -> (MlpGrads, Array1<f64>) {
        let mut grads: Vec<LayerGrads> = self.layers.iter().map(LayerGrads::zeros_like).collect();
        let mut grad = grad_output.clone();

        for i in (0..self.layers.len()).rev() {
            let layer = &self.layers[i];
            let z = &cache.pre_activations[i];
            let input = &cache.inputs[i];

            // dL/dz = dL/dout * sigma'(z)
            let delta: Array1<f64> = grad
                .iter()
                .zip(z.iter())
                .map(|(&g, &zv)| g * layer.activation.derivative(zv))
                .collect();

            for (j, &x) in input.iter().enumerate() {
                for (k, &d) in delta.iter().enumerate() {
                    grads[i].weights[[j, k]] += x * d;
                }
            }
            grads[i].biases += &delta;

            grad = layer.weights.dot(&delta);
        }

        (MlpGrads { layers: grads }, grad)
    }

    pub fn zero_grads(&self) -> MlpGrads {
        MlpGrads {
            layers: self.layers.iter().map(LayerGrads::zeros_like).collect(),
        }
    }

    /// Hard-copy parameters from another network of identical shape.
    pub fn copy_from(&mut self, other: &Mlp) {
        for (mine, theirs) in self.layers.iter_mut().zip(&other.layers) {
            mine.weights.assign(&theirs.weights);
            mine.biases.assign(&theirs.biases);
        }
    }

    /// Exponential-moving-average update toward another network.
    pub fn soft_update(&mut self, other: &Mlp, tau: f64) {
        for (mine, theirs) in self.layers.iter_mut().zip(&other.layers) {
            mine.weights.zip_mut_with(&theirs.weights, |a, &b| {
                *a = tau * b + (1.0 - tau) * *a;
            });
            mine.biases.zip_mut_with(&theirs.biases, |a, &b| {
                *a = tau * b + (1.0 - tau) * *a;
            });
        }
    }

    fn apply_update(&mut self, i: usize, dw: &Array2<f64>, db: &Array1<f64>) {
        self.layers[i].weights += dw;
        self.layers[i].biases += db;
    }

    fn layer_count(&self) -> usize {
        self.layers.len()
    }
}

/// Adam optimizer state for one network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Adam {
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    t: u64,
    m: Vec<LayerGrads>,
    v: Vec<LayerGrads>,
}

impl Adam {
    pub fn new(network: &Mlp, lr: f64) -> Self {
        let zeros = || network.zero_grads().layers;
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            t: 0,
            m: zeros(),
            v: zeros(),
        }
    }

    /// One descent step. `grads` must come from the same network.
    pub fn step(&mut self, network: &mut Mlp, grads: &MlpGrads) {
        self.t += 1;
        let (beta1, beta2, lr, eps) = (self.beta1, self.beta2, self.lr, self.eps);
        let bc1 = 1.0 - beta1.powi(self.t as i32);
        let bc2 = 1.0 - beta2.powi(self.t as i32);

        for i in 0..network.layer_count() {
            let g = &grads.layers[i];
            let m = &mut self.m[i];
            let v = &mut self.v[i];

            m.weights.zip_mut_with(&g.weights, |mv, &gv| {
                *mv = beta1 * *mv + (1.0 - beta1) * gv;
            });
            v.weights.zip_mut_with(&g.weights, |vv, &gv| {
                *vv = beta2 * *vv + (1.0 - beta2) * gv * gv;
            });
            m.biases.zip_mut_with(&g.biases, |mv, &gv| {
                *mv = beta1 * *mv + (1.0 - beta1) * gv;
            });
            v.biases.zip_mut_with(&g.biases, |vv, &gv| {
                *vv = beta2 * *vv + (1.0 - beta2) * gv * gv;
            });

            let dw = ndarray::Zip::from(&m.weights)
                .and(&v.weights)
                .map_collect(|&mv, &vv| -lr * (mv / bc1) / ((vv / bc2).sqrt() + eps));
            let db = ndarray::Zip::from(&m.biases)
                .and(&v.biases)
                .map_collect(|&mv, &vv| -lr * (mv / bc1) / ((vv / bc2).sqrt() + eps));

            network.apply_update(i, &dw, &db);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn forward_shapes() {
        let net = Mlp::new(&[8, 16, 3], Activation::Relu, Activation::Linear);
        let out = net.forward(&Array1::zeros(8));
        assert_eq!(out.len(), 3);
        assert_eq!(net.input_dim(), 8);
        assert_eq!(net.output_dim(), 3);
    }

    #[test]
    fn backward_matches_finite_differences() {
        let net = Mlp::new(&[4, 6, 2], Activation::Tanh, Activation::Linear);
        let x = array![0.3, -0.5, 0.1, 0.9];

        // Loss = sum of outputs; grad_output = ones.
        let (out, cache) = net.forward_cached(&x);
        let (grads, grad_input) = net.backward(&cache, &Array1::ones(out.len()));

        let eps = 1e-6;
        for j in 0..x.len() {
            let mut xp = x.clone();
            xp[j] += eps;
            let mut xm = x.clone();
            xm[j] -= eps;
            let numeric = (net.forward(&xp).sum() - net.forward(&xm).sum()) / (2.0 * eps);
            assert!(
                (numeric - grad_input[j]).abs() < 1e-5,
                "input grad {j}: numeric {numeric} vs analytic {}",
                grad_input[j]
            );
        }

        // Spot-check one weight gradient numerically.
        let mut perturbed = net.clone();
        perturbed.layers[0].weights[[0, 0]] += eps;
        let up = perturbed.forward(&x).sum();
        perturbed.layers[0].weights[[0, 0]] -= 2.0 * eps;
        let down = perturbed.forward(&x).sum();
        let numeric = (up - down) / (2.0 * eps);
        assert!((numeric - grads.layers[0].weights[[0, 0]]).abs() < 1e-5);
    }

    #[test]
    fn adam_reduces_quadratic_loss() {
        let mut net = Mlp::new(&[2, 8, 1], Activation::Relu, Activation::Linear);
        let mut opt = Adam::new(&net, 1e-2);
        let x = array![0.5, -0.25];
        let target = 1.5;

        let initial = (net.forward(&x)[0] - target).powi(2);
        for _ in 0..200 {
            let (out, cache) = net.forward_cached(&x);
            let grad_out = array![2.0 * (out[0] - target)];
            let (grads, _) = net.backward(&cache, &grad_out);
            opt.step(&mut net, &grads);
        }
        let trained = (net.forward(&x)[0] - target).powi(2);
        assert!(trained < initial * 0.01, "loss {initial} -> {trained}");
    }

    #[test]
    fn clip_bounds_global_norm() {
        let net = Mlp::new(&[3, 3], Activation::Relu, Activation::Linear);
        let mut g1 = net.zero_grads();
        let mut g2 = net.zero_grads();
        for layer in &mut g1.layers {
            layer.weights.fill(3.0);
        }
        for layer in &mut g2.layers {
            layer.weights.fill(4.0);
        }

        clip_global_norm(&mut [&mut g1, &mut g2], 1.0);
        let total = (g1.squared_norm() + g2.squared_norm()).sqrt();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn soft_update_moves_toward_source() {
        let mut target = Mlp::new(&[4, 4], Activation::Relu, Activation::Linear);
        let live = Mlp::new(&[4, 4], Activation::Relu, Activation::Linear);
        target.soft_update(&live, 1.0);
        let x = array![0.1, 0.2, 0.3, 0.4];
        assert_eq!(target.forward(&x), live.forward(&x));
    }
}
