//! Default hyperparameters. Everything here is a tunable default picked up
//! by the config structs; nothing reads these at runtime behind the
//! caller's back.

/// Discount factor for TD targets and rollout returns.
pub const GAMMA: f64 = 0.99;
/// Adam learning rate for the QMIX learner.
pub const LR: f64 = 5e-5;
pub const BATCH_SIZE: usize = 64;
pub const BUFFER_SIZE: usize = 50_000;
/// Lookback window, in rows, shared by every agent and the global state.
pub const WINDOW_SIZE: usize = 10;
pub const N_AGENTS: usize = 4;
/// Training steps between target-network syncs.
pub const TARGET_UPDATE_FREQ: usize = 200;
/// EMA coefficient when soft target updates are configured instead.
pub const TAU: f64 = 0.003;
pub const MIXER_EMBED_DIM: usize = 32;
pub const NUM_EPISODES: usize = 500;
pub const MAX_GRAD_NORM: f64 = 10.0;

pub mod exploration {
    pub const EPSILON_START: f64 = 1.0;
    pub const EPSILON_END: f64 = 0.01;
    pub const EPSILON_DECAY_STEPS: usize = 50_000;
    /// Steps of pure random action collection before annealing begins.
    pub const WARMUP_STEPS: usize = 1_000;
}

pub mod trade {
    /// Strongest consensus buys at most this fraction of portfolio value.
    pub const MAX_BUY_FRACTION: f64 = 0.1;
    /// Strongest consensus sells at most this fraction of held shares.
    pub const MAX_SELL_FRACTION: f64 = 0.3;
    /// Minimum absolute vote sum before any trade is realized.
    pub const VOTE_DEADBAND: i32 = 2;
    pub const DEFAULT_CAPITAL: f64 = 10_000_000.0;
}

pub mod reward {
    /// Rolling window for the realized-return volatility estimate.
    pub const VOLATILITY_WINDOW: usize = 20;
    pub const VOLATILITY_EPS: f64 = 1e-6;
    pub const RETURN_WEIGHT: f64 = 1000.0;
    pub const SHARPE_WEIGHT: f64 = 0.5;
    pub const SHARPE_CLIP: f64 = 3.0;
    pub const REWARD_CLIP: f64 = 10.0;
}

pub mod a2c {
    pub const LR: f64 = 1e-3;
    pub const HIDDEN_DIM: usize = 128;
    pub const VALUE_LOSS_COEFF: f64 = 0.5;
    pub const ENTROPY_COEFF: f64 = 0.01;
    pub const MAX_GRAD_NORM: f64 = 0.5;
    pub const TRADE_PENALTY: f64 = 0.001;
}
