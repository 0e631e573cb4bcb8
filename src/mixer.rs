//! Monotonic mixing network.
//!
//! Combines the per-agent chosen-action values into one team value,
//! conditioned on the global state through small hypernetworks. The weights
//! applied to agent values pass through an absolute-value transform, so the
//! mixed output is non-decreasing in every agent's input — each agent's
//! locally-greedy choice stays consistent with the team optimum.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::constants::MIXER_EMBED_DIM;
use crate::error::{Result, TradingError};
use crate::nn::{Activation, Mlp, MlpCache, MlpGrads};

/// Gradients for every hypernetwork, shaped like [`Mixer`].
pub struct MixerGrads {
    pub hyper_w1: MlpGrads,
    pub hyper_b1: MlpGrads,
    pub hyper_w2: MlpGrads,
    pub hyper_v: MlpGrads,
}

impl MixerGrads {
    pub fn accumulate(&mut self, other: &MixerGrads) {
        self.hyper_w1.accumulate(&other.hyper_w1);
        self.hyper_b1.accumulate(&other.hyper_b1);
        self.hyper_w2.accumulate(&other.hyper_w2);
        self.hyper_v.accumulate(&other.hyper_v);
    }

    pub fn parts_mut(&mut self) -> [&mut MlpGrads; 4] {
        [
            &mut self.hyper_w1,
            &mut self.hyper_b1,
            &mut self.hyper_w2,
            &mut self.hyper_v,
        ]
    }
}

/// Forward cache for one (agent-values, state) pair.
pub struct MixerCache {
    qs: Array1<f64>,
    w1_raw: Array1<f64>,
    w2_raw: Array1<f64>,
    hidden_pre: Array1<f64>,
    hidden: Array1<f64>,
    cache_w1: MlpCache,
    cache_b1: MlpCache,
    cache_w2: MlpCache,
    cache_v: MlpCache,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mixer {
    n_agents: usize,
    embed_dim: usize,
    state_dim: usize,
    /// state → n_agents × embed mixing weights (abs-transformed on use).
    hyper_w1: Mlp,
    /// state → embed hidden bias.
    hyper_b1: Mlp,
    /// state → embed output weights (abs-transformed on use).
    hyper_w2: Mlp,
    /// state → scalar output bias, two layers so the bias can depend
    /// nonlinearly on state.
    hyper_v: Mlp,
}

impl Mixer {
    pub fn new(n_agents: usize, state_dim: usize) -> Self {
        Self::with_embed_dim(n_agents, state_dim, MIXER_EMBED_DIM)
    }

    pub fn with_embed_dim(n_agents: usize, state_dim: usize, embed_dim: usize) -> Self {
        Self {
            n_agents,
            embed_dim,
            state_dim,
            hyper_w1: Mlp::new(
                &[state_dim, n_agents * embed_dim],
                Activation::Linear,
                Activation::Linear,
            ),
            hyper_b1: Mlp::new(&[state_dim, embed_dim], Activation::Linear, Activation::Linear),
            hyper_w2: Mlp::new(&[state_dim, embed_dim], Activation::Linear, Activation::Linear),
            hyper_v: Mlp::new(&[state_dim, embed_dim, 1], Activation::Relu, Activation::Linear),
        }
    }

    pub fn n_agents(&self) -> usize {
        self.n_agents
    }

    pub fn state_dim(&self) -> usize {
        self.state_dim
    }

    fn check_inputs(&self, agent_values: &Array1<f64>, state: &Array1<f64>) -> Result<()> {
        if agent_values.len() != self.n_agents {
            return Err(TradingError::Config(format!(
                "{} agent values for {} agents",
                agent_values.len(),
                self.n_agents
            )));
        }
        if state.len() != self.state_dim {
            return Err(TradingError::Config(format!(
                "state of length {} for mixer state dim {}",
                state.len(),
                self.state_dim
            )));
        }
        Ok(())
    }

    /// Mix one row of per-agent values under one global state.
    pub fn forward(&self, agent_values: &Array1<f64>, state: &Array1<f64>) -> Result<f64> {
        self.check_inputs(agent_values, state)?;
        let w1 = self.hyper_w1.forward(state).mapv(f64::abs);
        let b1 = self.hyper_b1.forward(state);
        let w2 = self.hyper_w2.forward(state).mapv(f64::abs);
        let v = self.hyper_v.forward(state)[0];

        let mut total = v;
        for j in 0..self.embed_dim {
            let mut pre = b1[j];
            for i in 0..self.n_agents {
                pre += agent_values[i] * w1[i * self.embed_dim + j];
            }
            total += Activation::Elu.apply(pre) * w2[j];
        }
        Ok(total)
    }

    /// Batched evaluation — used for the exhaustive 3^N joint-action search
    /// at inference time. No architectural difference from training mode.
    pub fn forward_batch(
        &self,
        agent_values: &Array2<f64>,
        state: &Array1<f64>,
    ) -> Result<Array1<f64>> {
        let mut out = Array1::zeros(agent_values.nrows());
        for (r, row) in agent_values.outer_iter().enumerate() {
            out[r] = self.forward(&row.to_owned(), state)?;
        }
        Ok(out)
    }

    pub fn forward_cached(
        &self,
        agent_values: &Array1<f64>,
        state: &Array1<f64>,
    ) -> Result<(f64, MixerCache)> {
        self.check_inputs(agent_values, state)?;
        let (w1_raw, cache_w1) = self.hyper_w1.forward_cached(state);
        let (b1, cache_b1) = self.hyper_b1.forward_cached(state);
        let (w2_raw, cache_w2) = self.hyper_w2.forward_cached(state);
        let (v, cache_v) = self.hyper_v.forward_cached(state);

        let mut hidden_pre = Array1::zeros(self.embed_dim);
        for j in 0..self.embed_dim {
            let mut pre = b1[j];
            for i in 0..self.n_agents {
                pre += agent_values[i] * w1_raw[i * self.embed_dim + j].abs();
            }
            hidden_pre[j] = pre;
        }
        let hidden = hidden_pre.mapv(|z| Activation::Elu.apply(z));

        let mut total = v[0];
        for j in 0..self.embed_dim {
            total += hidden[j] * w2_raw[j].abs();
        }

        Ok((
            total,
            MixerCache {
                qs: agent_values.clone(),
                w1_raw,
                w2_raw,
                hidden_pre,
                hidden,
                cache_w1,
                cache_b1,
                cache_w2,
                cache_v,
            },
        ))
    }

    /// Backpropagate dL/d(team value). Returns hypernetwork gradients and
    /// dL/d(agent values) — the path that carries the team signal into each
    /// agent network.
    pub fn backward(&self, cache: &MixerCache, grad_output: f64) -> (MixerGrads, Array1<f64>) {
        let sign = |x: f64| {
            if x > 0.0 {
                1.0
            } else if x < 0.0 {
                -1.0
            } else {
                0.0
            }
        };

        // Output layer: total = hidden · |w2| + v
        let (grads_v, _) = self
            .hyper_v
            .backward(&cache.cache_v, &Array1::from(vec![grad_output]));

        let mut grad_w2_raw = Array1::zeros(self.embed_dim);
        let mut grad_hidden = Array1::zeros(self.embed_dim);
        for j in 0..self.embed_dim {
            grad_w2_raw[j] = grad_output * cache.hidden[j] * sign(cache.w2_raw[j]);
            grad_hidden[j] = grad_output * cache.w2_raw[j].abs();
        }
        let (grads_w2, _) = self.hyper_w2.backward(&cache.cache_w2, &grad_w2_raw);

        // Hidden layer: hidden = elu(qs · |w1| + b1)
        let grad_pre: Array1<f64> = grad_hidden
            .iter()
            .zip(cache.hidden_pre.iter())
            .map(|(&g, &z)| g * Activation::Elu.derivative(z))
            .collect();
        let (grads_b1, _) = self.hyper_b1.backward(&cache.cache_b1, &grad_pre);

        let mut grad_w1_raw = Array1::zeros(self.n_agents * self.embed_dim);
        let mut grad_qs = Array1::zeros(self.n_agents);
        for i in 0..self.n_agents {
            for j in 0..self.embed_dim {
                let idx = i * self.embed_dim + j;
                grad_w1_raw[idx] = grad_pre[j] * cache.qs[i] * sign(cache.w1_raw[idx]);
                grad_qs[i] += grad_pre[j] * cache.w1_raw[idx].abs();
            }
        }
        let (grads_w1, _) = self.hyper_w1.backward(&cache.cache_w1, &grad_w1_raw);

        (
            MixerGrads {
                hyper_w1: grads_w1,
                hyper_b1: grads_b1,
                hyper_w2: grads_w2,
                hyper_v: grads_v,
            },
            grad_qs,
        )
    }

    pub fn zero_grads(&self) -> MixerGrads {
        MixerGrads {
            hyper_w1: self.hyper_w1.zero_grads(),
            hyper_b1: self.hyper_b1.zero_grads(),
            hyper_w2: self.hyper_w2.zero_grads(),
            hyper_v: self.hyper_v.zero_grads(),
        }
    }

    pub fn copy_from(&mut self, other: &Mixer) {
        self.hyper_w1.copy_from(&other.hyper_w1);
        self.hyper_b1.copy_from(&other.hyper_b1);
        self.hyper_w2.copy_from(&other.hyper_w2);
        self.hyper_v.copy_from(&other.hyper_v);
    }

    pub fn soft_update(&mut self, other: &Mixer, tau: f64) {
        self.hyper_w1.soft_update(&other.hyper_w1, tau);
        self.hyper_b1.soft_update(&other.hyper_b1, tau);
        self.hyper_w2.soft_update(&other.hyper_w2, tau);
        self.hyper_v.soft_update(&other.hyper_v, tau);
    }

    pub(crate) fn networks_mut(&mut self) -> [&mut Mlp; 4] {
        [
            &mut self.hyper_w1,
            &mut self.hyper_b1,
            &mut self.hyper_w2,
            &mut self.hyper_v,
        ]
    }

    pub(crate) fn networks(&self) -> [&Mlp; 4] {
        [&self.hyper_w1, &self.hyper_b1, &self.hyper_w2, &self.hyper_v]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn state(dim: usize) -> Array1<f64> {
        Array1::from_shape_fn(dim, |i| ((i as f64) * 0.17).cos())
    }

    #[test]
    fn monotone_in_every_agent_value() {
        let mixer = Mixer::with_embed_dim(4, 10, 8);
        let s = state(10);
        let base = array![0.3, -0.2, 0.1, 0.5];
        let low = mixer.forward(&base, &s).unwrap();

        for i in 0..4 {
            for bump in [0.01, 0.5, 2.0] {
                let mut raised = base.clone();
                raised[i] += bump;
                let high = mixer.forward(&raised, &s).unwrap();
                assert!(
                    high >= low - 1e-12,
                    "raising agent {i} by {bump} lowered the mix: {low} -> {high}"
                );
            }
        }
    }

    #[test]
    fn elementwise_dominance_never_lowers_the_mix() {
        let mixer = Mixer::with_embed_dim(3, 6, 8);
        let s = state(6);
        let v = array![-1.0, 0.0, 2.0];
        let v_prime = array![-0.5, 0.3, 2.1];
        let lo = mixer.forward(&v, &s).unwrap();
        let hi = mixer.forward(&v_prime, &s).unwrap();
        assert!(hi >= lo - 1e-12);
    }

    #[test]
    fn cached_forward_matches_plain_forward() {
        let mixer = Mixer::with_embed_dim(4, 10, 8);
        let s = state(10);
        let qs = array![0.1, 0.2, -0.4, 0.9];
        let plain = mixer.forward(&qs, &s).unwrap();
        let (cached, _) = mixer.forward_cached(&qs, &s).unwrap();
        assert!((plain - cached).abs() < 1e-12);
    }

    #[test]
    fn agent_value_gradients_match_finite_differences() {
        let mixer = Mixer::with_embed_dim(4, 10, 8);
        let s = state(10);
        let qs = array![0.3, -0.2, 0.15, 0.8];

        let (_, cache) = mixer.forward_cached(&qs, &s).unwrap();
        let (_, grad_qs) = mixer.backward(&cache, 1.0);

        let eps = 1e-6;
        for i in 0..4 {
            let mut up = qs.clone();
            up[i] += eps;
            let mut down = qs.clone();
            down[i] -= eps;
            let numeric =
                (mixer.forward(&up, &s).unwrap() - mixer.forward(&down, &s).unwrap()) / (2.0 * eps);
            assert!(
                (numeric - grad_qs[i]).abs() < 1e-5,
                "agent {i}: numeric {numeric} vs analytic {}",
                grad_qs[i]
            );
            // Monotonicity shows up as non-negative sensitivities too.
            assert!(grad_qs[i] >= 0.0);
        }
    }

    #[test]
    fn batch_forward_matches_row_by_row() {
        let mixer = Mixer::with_embed_dim(2, 4, 8);
        let s = state(4);
        let rows = Array2::from_shape_fn((9, 2), |(r, c)| (r as f64 - 4.0) * 0.1 + c as f64 * 0.05);
        let batch = mixer.forward_batch(&rows, &s).unwrap();
        for (r, row) in rows.outer_iter().enumerate() {
            let single = mixer.forward(&row.to_owned(), &s).unwrap();
            assert!((batch[r] - single).abs() < 1e-12);
        }
    }

    #[test]
    fn rejects_mismatched_dimensions() {
        let mixer = Mixer::with_embed_dim(4, 10, 8);
        assert!(mixer.forward(&Array1::zeros(3), &state(10)).is_err());
        assert!(mixer.forward(&Array1::zeros(4), &state(9)).is_err());
    }
}
