//! Training loops: episode orchestration, exploration schedule, replay
//! feeding, target-sync cadence, periodic greedy evaluation, and
//! checkpointing. Interruptible between episodes via an atomic stop flag —
//! optimizer steps are atomic with respect to the loop body, so stopping
//! never leaves half-updated networks.

use rand::Rng;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

use crate::a2c::A2cAgent;
use crate::constants::{exploration, BUFFER_SIZE, NUM_EPISODES, TARGET_UPDATE_FREQ};
use crate::env::single::SingleAssetEnv;
use crate::env::MarketEnv;
use crate::error::Result;
use crate::learner::{CheckpointMeta, QmixLearner};
use crate::replay::ReplayBuffer;

#[derive(Debug, Clone)]
pub struct EpsilonSchedule {
    pub start: f64,
    pub end: f64,
    pub decay_steps: usize,
    /// Steps of pure exploration before annealing begins.
    pub warmup_steps: usize,
}

impl Default for EpsilonSchedule {
    fn default() -> Self {
        Self {
            start: exploration::EPSILON_START,
            end: exploration::EPSILON_END,
            decay_steps: exploration::EPSILON_DECAY_STEPS,
            warmup_steps: exploration::WARMUP_STEPS,
        }
    }
}

impl EpsilonSchedule {
    pub fn at(&self, total_steps: usize) -> f64 {
        if total_steps <= self.warmup_steps {
            return self.start.max(1.0);
        }
        let progressed = (total_steps - self.warmup_steps) as f64 / self.decay_steps as f64;
        (self.start - (self.start - self.end) * progressed).max(self.end)
    }
}

#[derive(Debug, Clone)]
pub struct QmixTrainConfig {
    pub episodes: usize,
    pub buffer_capacity: usize,
    pub epsilon: EpsilonSchedule,
    pub target_update_freq: usize,
    /// Evaluate greedily on the held-out environment every N episodes.
    pub eval_every: Option<usize>,
    /// Save a checkpoint every N episodes.
    pub checkpoint_every: Option<usize>,
    pub checkpoint_path: Option<PathBuf>,
}

impl Default for QmixTrainConfig {
    fn default() -> Self {
        Self {
            episodes: NUM_EPISODES,
            buffer_capacity: BUFFER_SIZE,
            epsilon: EpsilonSchedule::default(),
            target_update_freq: TARGET_UPDATE_FREQ,
            eval_every: Some(20),
            checkpoint_every: None,
            checkpoint_path: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TrainSummary {
    pub episodes_run: usize,
    pub total_steps: usize,
    pub episode_rewards: Vec<f64>,
    pub best_eval_reward: Option<f64>,
    pub interrupted: bool,
}

/// One greedy (ε = 0) episode; returns the summed team reward.
pub fn evaluate<R: Rng>(learner: &QmixLearner, env: &mut MarketEnv, rng: &mut R) -> Result<f64> {
    let (mut observations, _) = env.reset(None);
    let mut total = 0.0;
    loop {
        let actions = learner.select_actions(&observations, 0.0, rng)?;
        let step = env.step(&actions)?;
        total += step.reward;
        observations = step.observations;
        if step.done {
            break;
        }
    }
    Ok(total)
}

/// Off-policy QMIX training over repeated environment episodes.
pub fn train_qmix<R: Rng>(
    learner: &mut QmixLearner,
    env: &mut MarketEnv,
    eval_env: Option<&mut MarketEnv>,
    config: &QmixTrainConfig,
    stop: &AtomicBool,
    rng: &mut R,
) -> Result<TrainSummary> {
    let mut replay = ReplayBuffer::new(config.buffer_capacity);
    let mut summary = TrainSummary::default();
    let mut eval_env = eval_env;

    for episode in 0..config.episodes {
        if stop.load(Ordering::Relaxed) {
            summary.interrupted = true;
            info!(episode, "training interrupted");
            break;
        }

        let (mut observations, mut global_state) = env.reset(None);
        let mut episode_reward = 0.0;

        loop {
            summary.total_steps += 1;
            let epsilon = config.epsilon.at(summary.total_steps);

            let actions = learner.select_actions(&observations, epsilon, rng)?;
            let step = env.step(&actions)?;

            replay.add(crate::replay::Transition {
                global_state,
                observations,
                actions,
                reward: step.reward,
                next_global_state: step.global_state.clone(),
                next_observations: step.observations.clone(),
                done: step.done,
            });

            if summary.total_steps > config.epsilon.warmup_steps {
                if let Some(loss) = learner.train(&replay, rng)? {
                    if !loss.is_finite() {
                        warn!(episode, step = summary.total_steps, "skipped non-finite loss");
                    }
                }
                if summary.total_steps % config.target_update_freq == 0 {
                    learner.update_target_networks();
                }
            }

            episode_reward += step.reward;
            observations = step.observations;
            global_state = step.global_state;
            if step.done {
                break;
            }
        }

        summary.episodes_run = episode + 1;
        summary.episode_rewards.push(episode_reward);
        info!(
            episode = episode + 1,
            epsilon = config.epsilon.at(summary.total_steps),
            episode_reward,
            "episode complete"
        );

        if let (Some(every), Some(eval_env)) = (config.eval_every, eval_env.as_deref_mut()) {
            if (episode + 1) % every == 0 {
                let eval_reward = evaluate(learner, eval_env, rng)?;
                let improved = summary
                    .best_eval_reward
                    .map_or(true, |best| eval_reward > best);
                if improved {
                    summary.best_eval_reward = Some(eval_reward);
                }
                info!(episode = episode + 1, eval_reward, improved, "evaluation");
            }
        }

        if let (Some(every), Some(path)) = (config.checkpoint_every, &config.checkpoint_path) {
            if (episode + 1) % every == 0 {
                learner.save(
                    path,
                    CheckpointMeta::now(episode + 1, summary.total_steps),
                )?;
                info!(episode = episode + 1, path = %path.display(), "checkpoint saved");
            }
        }
    }

    Ok(summary)
}

#[derive(Debug, Clone)]
pub struct A2cTrainConfig {
    pub episodes: usize,
    pub validate_every: usize,
    /// Best-validation model is written here when set.
    pub model_path: Option<PathBuf>,
}

impl Default for A2cTrainConfig {
    fn default() -> Self {
        Self {
            episodes: 300,
            validate_every: 10,
            model_path: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct A2cTrainSummary {
    pub episodes_run: usize,
    pub episode_rewards: Vec<f64>,
    pub validation_rewards: Vec<f64>,
    pub best_validation_reward: Option<f64>,
    pub interrupted: bool,
}

/// One deterministic validation episode.
pub fn validate_a2c<R: Rng>(
    agent: &A2cAgent,
    env: &mut SingleAssetEnv,
    rng: &mut R,
) -> Result<f64> {
    let mut state = env.reset();
    let mut total = 0.0;
    loop {
        let (action, _) = agent.act(&state, true, rng)?;
        let step = env.step(action)?;
        total += step.reward;
        state = step.state;
        if step.done {
            break;
        }
    }
    Ok(total)
}

/// On-policy actor-critic training: collect one full episode, update once,
/// repeat. The rollout buffer never outlives its episode.
pub fn train_a2c<R: Rng>(
    agent: &mut A2cAgent,
    env: &mut SingleAssetEnv,
    val_env: Option<&mut SingleAssetEnv>,
    config: &A2cTrainConfig,
    stop: &AtomicBool,
    rng: &mut R,
) -> Result<A2cTrainSummary> {
    let mut summary = A2cTrainSummary::default();
    let mut val_env = val_env;

    for episode in 0..config.episodes {
        if stop.load(Ordering::Relaxed) {
            summary.interrupted = true;
            info!(episode, "training interrupted");
            break;
        }

        let mut state = env.reset();
        let mut episode_reward = 0.0;

        loop {
            let (action, log_prob) = agent.act(&state, false, rng)?;
            let value = agent.value(&state);
            let step = env.step(action)?;
            agent.remember(
                state,
                action,
                step.reward,
                step.state.clone(),
                step.done,
                log_prob,
                value,
            );
            episode_reward += step.reward;
            state = step.state;
            if step.done {
                break;
            }
        }

        let losses = agent.train_step();
        summary.episodes_run = episode + 1;
        summary.episode_rewards.push(episode_reward);
        match losses {
            Some(losses) => info!(
                episode = episode + 1,
                episode_reward,
                actor_loss = losses.actor,
                critic_loss = losses.critic,
                "a2c episode complete"
            ),
            None => warn!(episode = episode + 1, "empty rollout; update skipped"),
        }

        if let Some(val_env) = val_env.as_deref_mut() {
            if (episode + 1) % config.validate_every == 0 {
                let val_reward = validate_a2c(agent, val_env, rng)?;
                summary.validation_rewards.push(val_reward);
                let improved = summary
                    .best_validation_reward
                    .map_or(true, |best| val_reward > best);
                if improved {
                    summary.best_validation_reward = Some(val_reward);
                    if let Some(path) = &config.model_path {
                        agent.save(path)?;
                        info!(episode = episode + 1, val_reward, "best model saved");
                    }
                }
            }
        }
    }

    Ok(summary)
}
