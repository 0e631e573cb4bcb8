//! QMIX learner: joint action selection, end-to-end TD training through the
//! mixing network, target synchronization, joint-action search, and
//! checkpoint persistence.

use chrono::Utc;
use ndarray::{Array1, Array2};
use ordered_float::OrderedFloat;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

use crate::agent::ValueAgent;
use crate::constants::{BATCH_SIZE, GAMMA, LR, MAX_GRAD_NORM, MIXER_EMBED_DIM};
use crate::env::TradeAction;
use crate::error::{Result, TradingError};
use crate::mixer::Mixer;
use crate::nn::{clip_global_norm, Adam, MlpGrads};
use crate::replay::ReplayBuffer;

/// How target copies track the live networks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum TargetSync {
    /// Full copy on every [`QmixLearner::update_target_networks`] call.
    Hard,
    /// Exponential moving average with the given coefficient.
    Soft(f64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnerConfig {
    pub gamma: f64,
    pub learning_rate: f64,
    pub batch_size: usize,
    pub max_grad_norm: f64,
    pub mixer_embed_dim: usize,
    pub target_sync: TargetSync,
}

impl Default for LearnerConfig {
    fn default() -> Self {
        Self {
            gamma: GAMMA,
            learning_rate: LR,
            batch_size: BATCH_SIZE,
            max_grad_norm: MAX_GRAD_NORM,
            mixer_embed_dim: MIXER_EMBED_DIM,
            target_sync: TargetSync::Hard,
        }
    }
}

/// Checkpoint metadata stored alongside the weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub episode: usize,
    pub total_steps: usize,
    pub timestamp: String,
}

impl CheckpointMeta {
    pub fn now(episode: usize, total_steps: usize) -> Self {
        Self {
            episode,
            total_steps,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// The serialized bundle: live weights, optimizer state, and metadata.
/// Target copies are rebuilt from the live weights on load.
#[derive(Serialize, Deserialize)]
struct LearnerRecord {
    observation_dims: Vec<usize>,
    state_dim: usize,
    agents: Vec<crate::nn::Mlp>,
    mixer: Mixer,
    agent_optimizers: Vec<Adam>,
    mixer_optimizers: Vec<Adam>,
    meta: CheckpointMeta,
}

#[derive(Debug)]
pub struct QmixLearner {
    agents: Vec<ValueAgent>,
    mixer: Mixer,
    target_mixer: Mixer,
    agent_optimizers: Vec<Adam>,
    /// One optimizer per mixer hypernetwork, aligned with
    /// [`Mixer::networks_mut`] order; all stepped together.
    mixer_optimizers: Vec<Adam>,
    config: LearnerConfig,
}

impl QmixLearner {
    pub fn new(observation_dims: &[usize], state_dim: usize, config: LearnerConfig) -> Result<Self> {
        if observation_dims.is_empty() {
            return Err(TradingError::Config("need at least one agent".into()));
        }
        if observation_dims.iter().any(|&d| d == 0) || state_dim == 0 {
            return Err(TradingError::Config(
                "observation and state dimensions must be positive".into(),
            ));
        }

        let agents: Vec<ValueAgent> = observation_dims
            .iter()
            .map(|&dim| ValueAgent::new(dim))
            .collect();
        let mixer = Mixer::with_embed_dim(observation_dims.len(), state_dim, config.mixer_embed_dim);
        let target_mixer = mixer.clone();

        let agent_optimizers = agents
            .iter()
            .map(|a| Adam::new(a.live(), config.learning_rate))
            .collect();
        let mixer_optimizers = mixer
            .networks()
            .into_iter()
            .map(|net| Adam::new(net, config.learning_rate))
            .collect();

        Ok(Self {
            agents,
            mixer,
            target_mixer,
            agent_optimizers,
            mixer_optimizers,
            config,
        })
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    pub fn observation_dims(&self) -> Vec<usize> {
        self.agents.iter().map(|a| a.observation_dim()).collect()
    }

    pub fn state_dim(&self) -> usize {
        self.mixer.state_dim()
    }

    pub fn agent(&self, index: usize) -> &ValueAgent {
        &self.agents[index]
    }

    fn check_observations(&self, observations: &[Array1<f64>]) -> Result<()> {
        if observations.len() != self.agents.len() {
            return Err(TradingError::Config(format!(
                "{} observations for {} agents",
                observations.len(),
                self.agents.len()
            )));
        }
        for (i, (obs, agent)) in observations.iter().zip(&self.agents).enumerate() {
            if obs.len() != agent.observation_dim() {
                return Err(TradingError::Config(format!(
                    "agent {i} observation has length {}, expected {}",
                    obs.len(),
                    agent.observation_dim()
                )));
            }
        }
        Ok(())
    }

    /// Epsilon-greedy joint action; each agent decides independently.
    /// Coordination comes only from the mixer's training signal.
    pub fn select_actions<R: Rng>(
        &self,
        observations: &[Array1<f64>],
        epsilon: f64,
        rng: &mut R,
    ) -> Result<Vec<TradeAction>> {
        self.check_observations(observations)?;
        Ok(self
            .agents
            .iter()
            .zip(observations)
            .map(|(agent, obs)| agent.select_action(obs, epsilon, rng))
            .collect())
    }

    /// One TD update over a uniformly sampled batch. Returns `None` when the
    /// store cannot yet fill a batch. A non-finite loss is logged and the
    /// update skipped; parameters and targets are left untouched.
    pub fn train<R: Rng>(&mut self, replay: &ReplayBuffer, rng: &mut R) -> Result<Option<f64>> {
        if replay.len() < self.config.batch_size {
            return Ok(None);
        }
        let batch = replay.sample(self.config.batch_size, rng)?;
        let n_agents = self.agents.len();

        let mut predictions = Vec::with_capacity(batch.len());
        let mut targets = Vec::with_capacity(batch.len());
        let mut agent_caches = Vec::with_capacity(batch.len());
        let mut mixer_caches = Vec::with_capacity(batch.len());

        for transition in &batch {
            self.check_observations(&transition.observations)?;
            if transition.actions.len() != n_agents {
                return Err(TradingError::Config(format!(
                    "transition holds {} actions for {} agents",
                    transition.actions.len(),
                    n_agents
                )));
            }

            // Live chosen-action values, caches kept for the backward pass.
            let mut chosen_values = Array1::zeros(n_agents);
            let mut caches = Vec::with_capacity(n_agents);
            for (i, agent) in self.agents.iter().enumerate() {
                let (q_all, cache) = agent.forward_cached(&transition.observations[i]);
                chosen_values[i] = q_all[transition.actions[i].index()];
                caches.push(cache);
            }

            // Target bootstrap: per-agent next-max through the target mixer.
            let mut next_values = Array1::zeros(n_agents);
            for (i, agent) in self.agents.iter().enumerate() {
                let next_q = agent.target_q_values(&transition.next_observations[i]);
                next_values[i] = next_q
                    .iter()
                    .copied()
                    .fold(f64::NEG_INFINITY, f64::max);
            }

            let (predicted, mixer_cache) =
                self.mixer.forward_cached(&chosen_values, &transition.global_state)?;
            let bootstrap = self
                .target_mixer
                .forward(&next_values, &transition.next_global_state)?;
            let not_done = if transition.done { 0.0 } else { 1.0 };
            let target = transition.reward + self.config.gamma * bootstrap * not_done;

            predictions.push(predicted);
            targets.push(target);
            agent_caches.push(caches);
            mixer_caches.push(mixer_cache);
        }

        let batch_len = batch.len() as f64;
        let loss = predictions
            .iter()
            .zip(&targets)
            .map(|(p, y)| (p - y).powi(2))
            .sum::<f64>()
            / batch_len;

        if !loss.is_finite() {
            warn!(loss, "non-finite TD loss; skipping optimizer step");
            return Ok(Some(loss));
        }

        // Backward: the team error flows through the mixer into every
        // agent's chosen-action output.
        let mut agent_grads: Vec<MlpGrads> =
            self.agents.iter().map(|a| a.live().zero_grads()).collect();
        let mut mixer_grads = self.mixer.zero_grads();

        for (s, transition) in batch.iter().enumerate() {
            let grad_prediction = 2.0 * (predictions[s] - targets[s]) / batch_len;
            let (sample_mixer_grads, grad_values) =
                self.mixer.backward(&mixer_caches[s], grad_prediction);
            mixer_grads.accumulate(&sample_mixer_grads);

            for (i, agent) in self.agents.iter().enumerate() {
                let mut seed = Array1::zeros(TradeAction::COUNT);
                seed[transition.actions[i].index()] = grad_values[i];
                let (grads, _) = agent.backward(&agent_caches[s][i], &seed);
                agent_grads[i].accumulate(&grads);
            }
        }

        let mut clip_targets: Vec<&mut MlpGrads> = agent_grads.iter_mut().collect();
        clip_targets.extend(mixer_grads.parts_mut());
        let grad_norm = clip_global_norm(&mut clip_targets, self.config.max_grad_norm);
        debug!(loss, grad_norm, "qmix train step");

        for ((agent, optimizer), grads) in self
            .agents
            .iter_mut()
            .zip(&mut self.agent_optimizers)
            .zip(&agent_grads)
        {
            optimizer.step(agent.live_mut(), grads);
        }
        let mixer_grad_list = [
            &mixer_grads.hyper_w1,
            &mixer_grads.hyper_b1,
            &mixer_grads.hyper_w2,
            &mixer_grads.hyper_v,
        ];
        for ((optimizer, net), grads) in self
            .mixer_optimizers
            .iter_mut()
            .zip(self.mixer.networks_mut())
            .zip(mixer_grad_list)
        {
            optimizer.step(net, grads);
        }

        Ok(Some(loss))
    }

    /// Sync targets from the live networks — called on a fixed cadence by
    /// the training loop, never from inside `train`.
    pub fn update_target_networks(&mut self) {
        match self.config.target_sync {
            TargetSync::Hard => {
                for agent in &mut self.agents {
                    agent.sync_target();
                }
                self.target_mixer.copy_from(&self.mixer);
            }
            TargetSync::Soft(tau) => {
                for agent in &mut self.agents {
                    agent.soft_sync_target(tau);
                }
                self.target_mixer.soft_update(&self.mixer, tau);
            }
        }
    }

    /// Exhaustively enumerate all `3^N` joint actions and return the one the
    /// live mixer scores highest, with its team value.
    pub fn best_joint_action(
        &self,
        observations: &[Array1<f64>],
        global_state: &Array1<f64>,
    ) -> Result<(Vec<TradeAction>, f64)> {
        self.check_observations(observations)?;
        let n = self.agents.len();
        let q_tables: Vec<Array1<f64>> = self
            .agents
            .iter()
            .zip(observations)
            .map(|(agent, obs)| agent.q_values(obs))
            .collect();

        let combos = TradeAction::COUNT.pow(n as u32);
        let mut rows = Array2::zeros((combos, n));
        for c in 0..combos {
            let mut remainder = c;
            for i in 0..n {
                let action = remainder % TradeAction::COUNT;
                remainder /= TradeAction::COUNT;
                rows[[c, i]] = q_tables[i][action];
            }
        }

        let team_values = self.mixer.forward_batch(&rows, global_state)?;
        let best = team_values
            .iter()
            .enumerate()
            .max_by_key(|(_, v)| OrderedFloat(**v))
            .map(|(i, _)| i)
            .unwrap_or(0);

        let mut remainder = best;
        let mut joint = Vec::with_capacity(n);
        for _ in 0..n {
            let action = remainder % TradeAction::COUNT;
            remainder /= TradeAction::COUNT;
            joint.push(TradeAction::from_index(action).unwrap_or(TradeAction::Hold));
        }
        Ok((joint, team_values[best]))
    }

    /// Mixed team value of one specific joint action.
    pub fn team_value(
        &self,
        observations: &[Array1<f64>],
        global_state: &Array1<f64>,
        actions: &[TradeAction],
    ) -> Result<f64> {
        self.check_observations(observations)?;
        let values: Array1<f64> = self
            .agents
            .iter()
            .zip(observations)
            .zip(actions)
            .map(|((agent, obs), action)| agent.q_values(obs)[action.index()])
            .collect();
        self.mixer.forward(&values, global_state)
    }

    /// Persist live weights, optimizer state, and metadata as one bundle.
    /// Written to a temporary file and renamed so a crash mid-write cannot
    /// leave a torn checkpoint.
    pub fn save(&self, path: &Path, meta: CheckpointMeta) -> Result<()> {
        let record = LearnerRecord {
            observation_dims: self.observation_dims(),
            state_dim: self.state_dim(),
            agents: self.agents.iter().map(|a| a.live().clone()).collect(),
            mixer: self.mixer.clone(),
            agent_optimizers: self.agent_optimizers.clone(),
            mixer_optimizers: self.mixer_optimizers.clone(),
            meta,
        };
        let bytes = postcard::to_stdvec(&record)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Load a bundle into a freshly constructed learner of the given
    /// architecture. Missing files and dimension mismatches fail loudly —
    /// random weights are never silently substituted.
    pub fn load(
        path: &Path,
        observation_dims: &[usize],
        state_dim: usize,
        config: LearnerConfig,
    ) -> Result<(Self, CheckpointMeta)> {
        let bytes = std::fs::read(path).map_err(|e| {
            TradingError::Checkpoint(format!("model bundle {}: {e}", path.display()))
        })?;
        let record: LearnerRecord = postcard::from_bytes(&bytes)?;

        if record.observation_dims != observation_dims || record.state_dim != state_dim {
            return Err(TradingError::Checkpoint(format!(
                "bundle built for obs dims {:?}/state {}, constructed {:?}/{}",
                record.observation_dims, record.state_dim, observation_dims, state_dim
            )));
        }
        if record.agents.len() != observation_dims.len()
            || record.agent_optimizers.len() != observation_dims.len()
            || record.mixer_optimizers.len() != 4
        {
            return Err(TradingError::Checkpoint(
                "bundle component counts do not match the architecture".into(),
            ));
        }

        let mut learner = Self::new(observation_dims, state_dim, config)?;
        for (agent, network) in learner.agents.iter_mut().zip(record.agents) {
            agent.load_live(network)?;
        }
        learner.mixer = record.mixer;
        learner.target_mixer.copy_from(&learner.mixer);
        learner.agent_optimizers = record.agent_optimizers;
        learner.mixer_optimizers = record.mixer_optimizers;

        Ok((learner, record.meta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::Transition;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const OBS_DIMS: [usize; 2] = [6, 6];
    const STATE_DIM: usize = 10;

    fn learner() -> QmixLearner {
        QmixLearner::new(
            &OBS_DIMS,
            STATE_DIM,
            LearnerConfig {
                batch_size: 8,
                learning_rate: 1e-3,
                mixer_embed_dim: 8,
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn obs(tag: f64) -> Vec<Array1<f64>> {
        OBS_DIMS
            .iter()
            .map(|&d| Array1::from_shape_fn(d, |i| ((i as f64 + tag) * 0.2).sin()))
            .collect()
    }

    fn state(tag: f64) -> Array1<f64> {
        Array1::from_shape_fn(STATE_DIM, |i| ((i as f64 - tag) * 0.15).cos())
    }

    fn fill(replay: &mut ReplayBuffer, count: usize) {
        for k in 0..count {
            let t = k as f64;
            replay.add(Transition {
                global_state: state(t),
                observations: obs(t),
                actions: vec![
                    TradeAction::from_index(k % 3).unwrap(),
                    TradeAction::from_index((k + 1) % 3).unwrap(),
                ],
                reward: (t * 0.3).sin(),
                next_global_state: state(t + 1.0),
                next_observations: obs(t + 1.0),
                done: k % 16 == 15,
            });
        }
    }

    #[test]
    fn train_on_empty_store_is_a_noop() {
        let mut l = learner();
        let replay = ReplayBuffer::new(64);
        let before_q: Vec<Array1<f64>> = (0..2).map(|i| l.agent(i).q_values(&obs(0.0)[i])).collect();
        let before_mix = l
            .team_value(&obs(0.0), &state(0.0), &[TradeAction::Buy, TradeAction::Sell])
            .unwrap();

        let mut rng = StdRng::seed_from_u64(1);
        assert!(l.train(&replay, &mut rng).unwrap().is_none());

        for i in 0..2 {
            assert_eq!(l.agent(i).q_values(&obs(0.0)[i]), before_q[i]);
        }
        let after_mix = l
            .team_value(&obs(0.0), &state(0.0), &[TradeAction::Buy, TradeAction::Sell])
            .unwrap();
        assert_eq!(before_mix, after_mix);
    }

    #[test]
    fn training_returns_finite_loss_and_moves_live_networks() {
        let mut l = learner();
        let mut replay = ReplayBuffer::new(64);
        fill(&mut replay, 32);
        let mut rng = StdRng::seed_from_u64(2);

        let before = l.agent(0).q_values(&obs(0.0)[0]);
        let loss = l.train(&replay, &mut rng).unwrap().unwrap();
        assert!(loss.is_finite());
        assert_ne!(l.agent(0).q_values(&obs(0.0)[0]), before);
    }

    #[test]
    fn targets_lag_until_explicit_sync() {
        let mut l = learner();
        let mut replay = ReplayBuffer::new(64);
        fill(&mut replay, 32);
        let mut rng = StdRng::seed_from_u64(3);

        let target_before: Vec<Array1<f64>> = (0..2)
            .map(|i| l.agent(i).target_q_values(&obs(0.0)[i]))
            .collect();

        for _ in 0..5 {
            l.train(&replay, &mut rng).unwrap().unwrap();
        }
        for i in 0..2 {
            assert_eq!(l.agent(i).target_q_values(&obs(0.0)[i]), target_before[i]);
        }

        l.update_target_networks();
        for i in 0..2 {
            assert_eq!(
                l.agent(i).target_q_values(&obs(0.0)[i]),
                l.agent(i).q_values(&obs(0.0)[i])
            );
        }
    }

    #[test]
    fn select_actions_is_deterministic_when_greedy() {
        let l = learner();
        let observations = obs(4.0);
        let mut rng = StdRng::seed_from_u64(9);
        let first = l.select_actions(&observations, 0.0, &mut rng).unwrap();
        for _ in 0..20 {
            assert_eq!(
                l.select_actions(&observations, 0.0, &mut rng).unwrap(),
                first
            );
        }
    }

    #[test]
    fn best_joint_action_dominates_every_enumerated_combo() {
        let l = learner();
        let observations = obs(1.0);
        let s = state(1.0);
        let (joint, best_value) = l.best_joint_action(&observations, &s).unwrap();
        assert_eq!(joint.len(), 2);

        for a0 in 0..TradeAction::COUNT {
            for a1 in 0..TradeAction::COUNT {
                let combo = vec![
                    TradeAction::from_index(a0).unwrap(),
                    TradeAction::from_index(a1).unwrap(),
                ];
                let value = l.team_value(&observations, &s, &combo).unwrap();
                assert!(value <= best_value + 1e-9);
            }
        }
        let claimed = l.team_value(&observations, &s, &joint).unwrap();
        assert!((claimed - best_value).abs() < 1e-9);
    }

    #[test]
    fn checkpoint_round_trip_reproduces_outputs() {
        let mut l = learner();
        let mut replay = ReplayBuffer::new(64);
        fill(&mut replay, 32);
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..3 {
            l.train(&replay, &mut rng).unwrap();
        }

        let path = std::env::temp_dir().join(format!(
            "marl_trading_ckpt_{}.bin",
            std::process::id()
        ));
        l.save(&path, CheckpointMeta::now(7, 321)).unwrap();

        let (restored, meta) =
            QmixLearner::load(&path, &OBS_DIMS, STATE_DIM, LearnerConfig::default()).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(meta.episode, 7);
        assert_eq!(meta.total_steps, 321);
        for i in 0..2 {
            assert_eq!(
                restored.agent(i).q_values(&obs(2.0)[i]),
                l.agent(i).q_values(&obs(2.0)[i])
            );
        }
        let actions = [TradeAction::Buy, TradeAction::Hold];
        assert_eq!(
            restored.team_value(&obs(2.0), &state(2.0), &actions).unwrap(),
            l.team_value(&obs(2.0), &state(2.0), &actions).unwrap()
        );
    }

    #[test]
    fn load_rejects_wrong_architecture() {
        let l = learner();
        let path = std::env::temp_dir().join(format!(
            "marl_trading_ckpt_bad_{}.bin",
            std::process::id()
        ));
        l.save(&path, CheckpointMeta::now(0, 0)).unwrap();

        let err = QmixLearner::load(&path, &[6, 6, 6], 10, LearnerConfig::default()).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert!(matches!(err, TradingError::Checkpoint(_)));
    }

    #[test]
    fn missing_bundle_fails_loudly() {
        let err = QmixLearner::load(
            Path::new("/nonexistent/qmix.bin"),
            &OBS_DIMS,
            STATE_DIM,
            LearnerConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, TradingError::Checkpoint(_)));
    }
}
