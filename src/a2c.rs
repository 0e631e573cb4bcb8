//! Single-agent advantage actor-critic: one shared network, a per-episode
//! rollout buffer, and a combined policy/value/entropy loss applied in one
//! clipped optimizer step after each episode. Deliberately on-policy — no
//! replay across episodes.

use ndarray::Array1;
use ordered_float::OrderedFloat;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

use crate::constants::{a2c, GAMMA};
use crate::env::TradeAction;
use crate::error::{Result, TradingError};
use crate::nn::{clip_global_norm, Activation, Adam, Mlp, MlpCache};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorCriticConfig {
    pub gamma: f64,
    pub learning_rate: f64,
    pub hidden_dim: usize,
    pub value_loss_coeff: f64,
    pub entropy_coeff: f64,
    pub max_grad_norm: f64,
}

impl Default for ActorCriticConfig {
    fn default() -> Self {
        Self {
            gamma: GAMMA,
            learning_rate: a2c::LR,
            hidden_dim: a2c::HIDDEN_DIM,
            value_loss_coeff: a2c::VALUE_LOSS_COEFF,
            entropy_coeff: a2c::ENTROPY_COEFF,
            max_grad_norm: a2c::MAX_GRAD_NORM,
        }
    }
}

/// Shared trunk with separate actor (logits) and critic (value) heads.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ActorCriticNet {
    trunk: Mlp,
    actor: Mlp,
    critic: Mlp,
}

struct NetCache {
    trunk: MlpCache,
    actor: MlpCache,
    critic: MlpCache,
}

impl ActorCriticNet {
    fn new(state_dim: usize, hidden_dim: usize) -> Self {
        Self {
            trunk: Mlp::new(
                &[state_dim, hidden_dim, hidden_dim],
                Activation::Relu,
                Activation::Relu,
            ),
            actor: Mlp::new(
                &[hidden_dim, TradeAction::COUNT],
                Activation::Linear,
                Activation::Linear,
            ),
            critic: Mlp::new(&[hidden_dim, 1], Activation::Linear, Activation::Linear),
        }
    }

    fn forward(&self, state: &Array1<f64>) -> (Array1<f64>, f64) {
        let features = self.trunk.forward(state);
        (self.actor.forward(&features), self.critic.forward(&features)[0])
    }

    fn forward_cached(&self, state: &Array1<f64>) -> (Array1<f64>, f64, NetCache) {
        let (features, trunk) = self.trunk.forward_cached(state);
        let (logits, actor) = self.actor.forward_cached(&features);
        let (value, critic) = self.critic.forward_cached(&features);
        (
            logits,
            value[0],
            NetCache {
                trunk,
                actor,
                critic,
            },
        )
    }
}

/// Numerically stable softmax.
fn softmax(logits: &Array1<f64>) -> Array1<f64> {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exp = logits.mapv(|l| (l - max).exp());
    let sum = exp.sum();
    exp / sum
}

/// Backward bootstrapped returns: `G_t = r_t + γ·G_{t+1}·(1 − done_t)`,
/// seeded with the critic's estimate for the state after the final step.
fn discounted_returns(rewards: &[f64], dones: &[bool], gamma: f64, bootstrap: f64) -> Vec<f64> {
    let mut returns = vec![0.0; rewards.len()];
    let mut g = bootstrap;
    for t in (0..rewards.len()).rev() {
        let not_done = if dones[t] { 0.0 } else { 1.0 };
        g = rewards[t] + gamma * g * not_done;
        returns[t] = g;
    }
    returns
}

#[derive(Debug, Clone)]
struct RolloutStep {
    state: Array1<f64>,
    action: TradeAction,
    reward: f64,
    next_state: Array1<f64>,
    done: bool,
    /// Stored for interface parity with the collection loop; the update
    /// recomputes both under the current parameters.
    #[allow(dead_code)]
    log_prob: f64,
    #[allow(dead_code)]
    value: f64,
}

/// Loss components of one episode update.
#[derive(Debug, Clone, Copy)]
pub struct A2cLosses {
    pub actor: f64,
    pub critic: f64,
    pub entropy: f64,
}

#[derive(Serialize, Deserialize)]
struct A2cRecord {
    state_dim: usize,
    net: ActorCriticNet,
}

pub struct A2cAgent {
    net: ActorCriticNet,
    trunk_optimizer: Adam,
    actor_optimizer: Adam,
    critic_optimizer: Adam,
    buffer: Vec<RolloutStep>,
    config: ActorCriticConfig,
    state_dim: usize,
}

impl A2cAgent {
    pub fn new(state_dim: usize, config: ActorCriticConfig) -> Result<Self> {
        if state_dim == 0 {
            return Err(TradingError::Config("state dimension must be positive".into()));
        }
        let net = ActorCriticNet::new(state_dim, config.hidden_dim);
        let trunk_optimizer = Adam::new(&net.trunk, config.learning_rate);
        let actor_optimizer = Adam::new(&net.actor, config.learning_rate);
        let critic_optimizer = Adam::new(&net.critic, config.learning_rate);
        Ok(Self {
            net,
            trunk_optimizer,
            actor_optimizer,
            critic_optimizer,
            buffer: Vec::new(),
            config,
            state_dim,
        })
    }

    pub fn state_dim(&self) -> usize {
        self.state_dim
    }

    /// Sample from the policy, or take the argmax when `deterministic`
    /// (evaluation/backtest). Returns the action and its log-probability.
    pub fn act<R: Rng>(
        &self,
        state: &Array1<f64>,
        deterministic: bool,
        rng: &mut R,
    ) -> Result<(TradeAction, f64)> {
        if state.len() != self.state_dim {
            return Err(TradingError::Config(format!(
                "state of length {} for network input {}",
                state.len(),
                self.state_dim
            )));
        }
        let (logits, _) = self.net.forward(state);
        let probs = softmax(&logits);

        let index = if deterministic {
            probs
                .iter()
                .enumerate()
                .max_by_key(|(_, p)| OrderedFloat(**p))
                .map(|(i, _)| i)
                .unwrap_or(TradeAction::Hold.index())
        } else {
            let draw: f64 = rng.gen();
            let mut cumulative = 0.0;
            let mut chosen = TradeAction::COUNT - 1;
            for (i, p) in probs.iter().enumerate() {
                cumulative += p;
                if draw < cumulative {
                    chosen = i;
                    break;
                }
            }
            chosen
        };

        let action = TradeAction::from_index(index).unwrap_or(TradeAction::Hold);
        let log_prob = probs[index].max(1e-12).ln();
        Ok((action, log_prob))
    }

    /// Critic's estimate of the current state value.
    pub fn value(&self, state: &Array1<f64>) -> f64 {
        self.net.forward(state).1
    }

    pub fn remember(
        &mut self,
        state: Array1<f64>,
        action: TradeAction,
        reward: f64,
        next_state: Array1<f64>,
        done: bool,
        log_prob: f64,
        value: f64,
    ) {
        self.buffer.push(RolloutStep {
            state,
            action,
            reward,
            next_state,
            done,
            log_prob,
            value,
        });
    }

    pub fn rollout_len(&self) -> usize {
        self.buffer.len()
    }

    /// Episode-end update over the collected rollout. Returns `None` when
    /// the buffer is empty. The buffer never outlives its episode — this
    /// trainer does not replay across episodes.
    pub fn train_step(&mut self) -> Option<A2cLosses> {
        if self.buffer.is_empty() {
            return None;
        }
        let steps = std::mem::take(&mut self.buffer);
        let t_len = steps.len();
        let t_f = t_len as f64;

        let last = &steps[t_len - 1];
        let bootstrap = self.net.forward(&last.next_state).1;
        let rewards: Vec<f64> = steps.iter().map(|s| s.reward).collect();
        let dones: Vec<bool> = steps.iter().map(|s| s.done).collect();
        let returns = discounted_returns(&rewards, &dones, self.config.gamma, bootstrap);

        // Recompute log-probs and values under the current parameters.
        let mut caches = Vec::with_capacity(t_len);
        let mut probs_all = Vec::with_capacity(t_len);
        let mut values = Vec::with_capacity(t_len);
        for step in &steps {
            let (logits, value, cache) = self.net.forward_cached(&step.state);
            probs_all.push(softmax(&logits));
            values.push(value);
            caches.push(cache);
        }

        // Normalized advantages (detached from the critic's gradient path).
        let advantages: Vec<f64> = returns.iter().zip(&values).map(|(g, v)| g - v).collect();
        let mean = advantages.iter().sum::<f64>() / t_f;
        let std = if t_len > 1 {
            (advantages.iter().map(|a| (a - mean).powi(2)).sum::<f64>() / (t_f - 1.0)).sqrt()
        } else {
            0.0
        };
        let normalized: Vec<f64> = advantages.iter().map(|a| (a - mean) / (std + 1e-8)).collect();

        let mut actor_loss = 0.0;
        let mut critic_loss = 0.0;
        let mut entropy_sum = 0.0;

        let mut trunk_grads = self.net.trunk.zero_grads();
        let mut actor_grads = self.net.actor.zero_grads();
        let mut critic_grads = self.net.critic.zero_grads();

        for t in 0..t_len {
            let probs = &probs_all[t];
            let action_index = steps[t].action.index();
            let log_prob = probs[action_index].max(1e-12).ln();
            let entropy: f64 = -probs.iter().map(|p| p * p.max(1e-12).ln()).sum::<f64>();

            actor_loss += -log_prob * normalized[t];
            entropy_sum += entropy;

            let diff = values[t] - returns[t];
            // Huber with unit threshold, matching a smooth-L1 value loss.
            critic_loss += if diff.abs() < 1.0 {
                0.5 * diff * diff
            } else {
                diff.abs() - 0.5
            };

            // d(actor)/d logits: (A/T)·(p − onehot)
            let mut grad_logits: Array1<f64> = probs.mapv(|p| normalized[t] / t_f * p);
            grad_logits[action_index] -= normalized[t] / t_f;
            // d(−c_H·H̄)/d logits: (c_H/T)·p·(ln p + H)
            for (k, p) in probs.iter().enumerate() {
                grad_logits[k] +=
                    self.config.entropy_coeff / t_f * p * (p.max(1e-12).ln() + entropy);
            }

            let grad_value = self.config.value_loss_coeff / t_f * diff.clamp(-1.0, 1.0);

            let (a_grads, grad_features_a) = self.net.actor.backward(&caches[t].actor, &grad_logits);
            let (c_grads, grad_features_c) = self
                .net
                .critic
                .backward(&caches[t].critic, &Array1::from(vec![grad_value]));
            let (t_grads, _) = self
                .net
                .trunk
                .backward(&caches[t].trunk, &(grad_features_a + grad_features_c));

            actor_grads.accumulate(&a_grads);
            critic_grads.accumulate(&c_grads);
            trunk_grads.accumulate(&t_grads);
        }

        actor_loss /= t_f;
        critic_loss /= t_f;
        let entropy_loss = -entropy_sum / t_f;

        if !(actor_loss.is_finite() && critic_loss.is_finite()) {
            warn!(actor_loss, critic_loss, "non-finite actor-critic loss; skipping update");
            return Some(A2cLosses {
                actor: actor_loss,
                critic: critic_loss,
                entropy: entropy_loss,
            });
        }

        clip_global_norm(
            &mut [&mut trunk_grads, &mut actor_grads, &mut critic_grads],
            self.config.max_grad_norm,
        );
        self.trunk_optimizer.step(&mut self.net.trunk, &trunk_grads);
        self.actor_optimizer.step(&mut self.net.actor, &actor_grads);
        self.critic_optimizer.step(&mut self.net.critic, &critic_grads);

        Some(A2cLosses {
            actor: actor_loss,
            critic: critic_loss,
            entropy: entropy_loss,
        })
    }

    /// Persist the network. Optimizer state stays out of the actor-critic
    /// bundle: the on-policy trainer restarts its moments with each run.
    pub fn save(&self, path: &Path) -> Result<()> {
        let record = A2cRecord {
            state_dim: self.state_dim,
            net: self.net.clone(),
        };
        let bytes = postcard::to_stdvec(&record)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn load(path: &Path, state_dim: usize, config: ActorCriticConfig) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| {
            TradingError::Checkpoint(format!("actor-critic bundle {}: {e}", path.display()))
        })?;
        let record: A2cRecord = postcard::from_bytes(&bytes)?;
        if record.state_dim != state_dim {
            return Err(TradingError::Checkpoint(format!(
                "bundle built for state dim {}, constructed {}",
                record.state_dim, state_dim
            )));
        }
        let mut agent = Self::new(state_dim, config)?;
        agent.net = record.net;
        Ok(agent)
    }
}
