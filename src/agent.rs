//! Per-agent action-value function: a live/target MLP pair over the agent's
//! observation subspace, epsilon-greedy selection, and a gradient-based
//! attribution routine for inference-time explanations.

use ndarray::Array1;
use ordered_float::OrderedFloat;
use rand::Rng;

use crate::env::TradeAction;
use crate::error::{Result, TradingError};
use crate::nn::{Activation, Mlp, MlpCache, MlpGrads};

const HIDDEN_DIM: usize = 64;

/// Output of [`ValueAgent::explain`]: the greedy action, its q-values, and
/// base-feature importances ranked most influential first.
#[derive(Debug, Clone)]
pub struct Explanation {
    pub action: TradeAction,
    pub q_values: Array1<f64>,
    pub importances: Vec<(String, f64)>,
}

/// One agent's value network and its periodically-synced target copy.
///
/// Exploration is a pure function of (observation, parameters, epsilon, rng);
/// epsilon is always a call argument so schedules live with the caller and
/// evaluation can force it to zero.
#[derive(Debug, Clone)]
pub struct ValueAgent {
    live: Mlp,
    target: Mlp,
}

impl ValueAgent {
    pub fn new(observation_dim: usize) -> Self {
        let live = Mlp::new(
            &[observation_dim, HIDDEN_DIM, HIDDEN_DIM, TradeAction::COUNT],
            Activation::Relu,
            Activation::Linear,
        );
        let target = live.clone();
        Self { live, target }
    }

    pub fn observation_dim(&self) -> usize {
        self.live.input_dim()
    }

    pub fn q_values(&self, observation: &Array1<f64>) -> Array1<f64> {
        self.live.forward(observation)
    }

    pub fn target_q_values(&self, observation: &Array1<f64>) -> Array1<f64> {
        self.target.forward(observation)
    }

    pub fn greedy_action(&self, observation: &Array1<f64>) -> TradeAction {
        Self::argmax(&self.q_values(observation))
    }

    pub fn select_action<R: Rng>(
        &self,
        observation: &Array1<f64>,
        epsilon: f64,
        rng: &mut R,
    ) -> TradeAction {
        if rng.gen::<f64>() < epsilon {
            TradeAction::from_index(rng.gen_range(0..TradeAction::COUNT))
                .expect("index in range by construction")
        } else {
            self.greedy_action(observation)
        }
    }

    fn argmax(q_values: &Array1<f64>) -> TradeAction {
        let index = q_values
            .iter()
            .enumerate()
            .max_by_key(|(_, v)| OrderedFloat(**v))
            .map(|(i, _)| i)
            .unwrap_or(TradeAction::Hold.index());
        TradeAction::from_index(index).unwrap_or(TradeAction::Hold)
    }

    /// Attribute the greedy action's value to the agent's base features.
    ///
    /// Gradient×input saliency: one backward pass seeds the chosen action's
    /// output with 1, and each input's |gradient × value| is summed across
    /// every lagged copy of its base feature in the window. The trailing
    /// position/unrealized-return inputs report under their own names.
    /// Deterministic for fixed parameters and observation.
    pub fn explain(
        &self,
        observation: &Array1<f64>,
        feature_names: &[String],
        window_size: usize,
    ) -> Result<Explanation> {
        let feature_count = feature_names.len();
        if observation.len() != window_size * feature_count + 2 {
            return Err(TradingError::Config(format!(
                "observation of length {} does not match {} features over window {}",
                observation.len(),
                feature_count,
                window_size
            )));
        }

        let (q_values, cache) = self.live.forward_cached(observation);
        let action = Self::argmax(&q_values);

        let mut seed = Array1::zeros(q_values.len());
        seed[action.index()] = 1.0;
        let (_, input_grad) = self.live.backward(&cache, &seed);

        let mut importances: Vec<(String, f64)> = feature_names
            .iter()
            .enumerate()
            .map(|(f, name)| {
                let total: f64 = (0..window_size)
                    .map(|t| {
                        let i = t * feature_count + f;
                        (input_grad[i] * observation[i]).abs()
                    })
                    .sum();
                (name.clone(), total)
            })
            .collect();

        let tail = window_size * feature_count;
        importances.push((
            "position".to_string(),
            (input_grad[tail] * observation[tail]).abs(),
        ));
        importances.push((
            "unrealized_return".to_string(),
            (input_grad[tail + 1] * observation[tail + 1]).abs(),
        ));

        importances.sort_by(|a, b| OrderedFloat(b.1).cmp(&OrderedFloat(a.1)));

        Ok(Explanation {
            action,
            q_values,
            importances,
        })
    }

    // Training plumbing used by the learner.

    pub(crate) fn forward_cached(&self, observation: &Array1<f64>) -> (Array1<f64>, MlpCache) {
        self.live.forward_cached(observation)
    }

    pub(crate) fn backward(
        &self,
        cache: &MlpCache,
        grad_output: &Array1<f64>,
    ) -> (MlpGrads, Array1<f64>) {
        self.live.backward(cache, grad_output)
    }

    pub(crate) fn live(&self) -> &Mlp {
        &self.live
    }

    pub(crate) fn live_mut(&mut self) -> &mut Mlp {
        &mut self.live
    }

    pub(crate) fn load_live(&mut self, network: Mlp) -> Result<()> {
        if network.input_dim() != self.live.input_dim()
            || network.output_dim() != self.live.output_dim()
        {
            return Err(TradingError::Checkpoint(format!(
                "agent network is {}→{}, expected {}→{}",
                network.input_dim(),
                network.output_dim(),
                self.live.input_dim(),
                self.live.output_dim()
            )));
        }
        self.live = network;
        self.sync_target();
        Ok(())
    }

    pub fn sync_target(&mut self) {
        self.target.copy_from(&self.live);
    }

    pub fn soft_sync_target(&mut self, tau: f64) {
        self.target.soft_update(&self.live, tau);
    }
}
