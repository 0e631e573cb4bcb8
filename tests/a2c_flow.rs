//! End-to-end actor-critic flow: on-policy training over the single-asset
//! environment with validation and best-model persistence.

use std::sync::atomic::AtomicBool;

use marl_trading::env::reward::{CompositeRewardConfig, CompositeRiskAdjusted};
use marl_trading::train::{train_a2c, A2cTrainConfig};
use marl_trading::{A2cAgent, ActorCriticConfig, FeatureTable, SingleAssetEnv, SingleEnvConfig};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::SeedableRng;

const ROWS: usize = 50;
const WINDOW: usize = 4;

fn single_env() -> SingleAssetEnv {
    let names: Vec<String> = (0..3).map(|i| format!("f{i}")).collect();
    let values = Array2::from_shape_fn((ROWS, 3), |(r, c)| ((r + 2 * c) as f64 * 0.21).cos());
    let prices = Array1::from_shape_fn(ROWS, |r| 40.0 * (1.0 + 0.003 * (r as f64 * 0.5).cos()));
    let market = Array1::from_shape_fn(ROWS, |r| 2000.0 * (1.0 + 0.001 * r as f64));
    let table = FeatureTable::new(names, values, prices).unwrap();
    SingleAssetEnv::new(
        table,
        market,
        Box::new(CompositeRiskAdjusted::new(CompositeRewardConfig {
            roll_window: 20,
            ..Default::default()
        })),
        SingleEnvConfig {
            window_size: WINDOW,
            ..Default::default()
        },
    )
    .unwrap()
}

#[test]
fn on_policy_training_validates_and_saves_the_best_model() {
    let mut train_env = single_env();
    let mut val_env = single_env();
    let mut agent = A2cAgent::new(
        train_env.state_dim(),
        ActorCriticConfig {
            learning_rate: 1e-3,
            ..Default::default()
        },
    )
    .unwrap();

    let model_path = std::env::temp_dir().join(format!(
        "marl_trading_a2c_flow_{}.bin",
        std::process::id()
    ));
    let config = A2cTrainConfig {
        episodes: 4,
        validate_every: 2,
        model_path: Some(model_path.clone()),
    };

    let stop = AtomicBool::new(false);
    let mut rng = StdRng::seed_from_u64(41);
    let summary = train_a2c(
        &mut agent,
        &mut train_env,
        Some(&mut val_env),
        &config,
        &stop,
        &mut rng,
    )
    .unwrap();

    assert_eq!(summary.episodes_run, 4);
    assert_eq!(summary.validation_rewards.len(), 2);
    assert!(summary.best_validation_reward.is_some());
    // The rollout buffer never carries over between episodes.
    assert_eq!(agent.rollout_len(), 0);

    let restored = A2cAgent::load(
        &model_path,
        train_env.state_dim(),
        ActorCriticConfig::default(),
    )
    .unwrap();
    std::fs::remove_file(&model_path).ok();

    // The persisted policy acts deterministically like a trained one.
    let state = val_env.reset();
    let (a1, _) = restored.act(&state, true, &mut rng).unwrap();
    let (a2, _) = restored.act(&state, true, &mut rng).unwrap();
    assert_eq!(a1, a2);
}
