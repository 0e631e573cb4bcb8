//! Reward shaping policies.
//!
//! The environments compute the raw step economics (portfolio return,
//! market return, cost-adjusted base reward) and hand them to a pluggable
//! [`RewardPolicy`]; swapping reward designs never touches stepping logic.

use std::collections::VecDeque;

use crate::constants::reward;

/// Raw step economics handed to a policy. `return_pct` is the step's
/// portfolio return relative to initial capital, `market_return` the
/// benchmark's return over the same step, and `base_reward` the unshaped
/// position-times-return (minus trading costs) term.
#[derive(Debug, Clone, Copy)]
pub struct RewardInputs {
    pub return_pct: f64,
    pub market_return: f64,
    pub base_reward: f64,
}

pub trait RewardPolicy: Send {
    /// Clear any rolling state at episode start.
    fn reset(&mut self);
    /// Shape one step's reward. Called exactly once per environment step.
    fn reward(&mut self, inputs: &RewardInputs) -> f64;
}

/// The team-reward shaping used by the multi-agent environment: bounded
/// return term plus a clipped Sharpe-like term over a rolling realized
/// volatility estimate.
#[derive(Debug)]
pub struct SharpeShapedReward {
    window: usize,
    history: VecDeque<f64>,
}

impl SharpeShapedReward {
    pub fn new(window: usize) -> Self {
        let mut policy = Self {
            window,
            history: VecDeque::with_capacity(window),
        };
        policy.reset();
        policy
    }

    fn push(&mut self, value: f64) {
        if self.history.len() == self.window {
            self.history.pop_front();
        }
        self.history.push_back(value);
    }

    fn volatility(&self) -> f64 {
        let n = self.history.len() as f64;
        let mean = self.history.iter().sum::<f64>() / n;
        let var = self
            .history
            .iter()
            .map(|r| (r - mean).powi(2))
            .sum::<f64>()
            / n;
        var.sqrt() + reward::VOLATILITY_EPS
    }
}

impl Default for SharpeShapedReward {
    fn default() -> Self {
        Self::new(reward::VOLATILITY_WINDOW)
    }
}

impl RewardPolicy for SharpeShapedReward {
    fn reset(&mut self) {
        self.history.clear();
        self.history.push_back(0.0);
    }

    fn reward(&mut self, inputs: &RewardInputs) -> f64 {
        self.push(inputs.return_pct);
        let volatility = self.volatility();
        let sharpe = (inputs.return_pct / volatility).clamp(-reward::SHARPE_CLIP, reward::SHARPE_CLIP);
        (inputs.return_pct * reward::RETURN_WEIGHT + sharpe * reward::SHARPE_WEIGHT)
            .clamp(-reward::REWARD_CLIP, reward::REWARD_CLIP)
    }
}

/// No shaping: the base reward straight through.
#[derive(Debug, Default)]
pub struct RawReward;

impl RewardPolicy for RawReward {
    fn reset(&mut self) {}

    fn reward(&mut self, inputs: &RewardInputs) -> f64 {
        inputs.base_reward
    }
}

/// Configuration for [`CompositeRiskAdjusted`]. Weights and scales follow
/// the single-agent variant's tuning.
#[derive(Debug, Clone)]
pub struct CompositeRewardConfig {
    pub roll_window: usize,
    pub risk_free_rate: f64,
    pub w_sortino: f64,
    pub w_downside: f64,
    pub w_excess: f64,
    pub w_treynor: f64,
    pub beta_floor: f64,
    pub scale_sortino: f64,
    pub scale_downside: f64,
    pub scale_excess: f64,
    pub scale_treynor: f64,
    pub clip: f64,
    pub scale_factor: f64,
}

impl Default for CompositeRewardConfig {
    fn default() -> Self {
        Self {
            roll_window: 63,
            risk_free_rate: 0.0,
            w_sortino: 0.35,
            w_downside: 0.25,
            w_excess: 0.20,
            w_treynor: 0.20,
            beta_floor: 0.2,
            scale_sortino: 0.005,
            scale_downside: 0.02,
            scale_excess: 0.005,
            scale_treynor: 0.005,
            clip: 2.0,
            scale_factor: 10.0,
        }
    }
}

/// Base reward plus a tanh-squashed composite of risk-adjusted terms
/// (rolling Sortino-like ratio, downside-deviation penalty, beta-normalized
/// excess return, Treynor-like ratio). The composite only activates once a
/// full rolling window of returns has accumulated.
#[derive(Debug)]
pub struct CompositeRiskAdjusted {
    config: CompositeRewardConfig,
    portfolio_returns: Vec<f64>,
    market_returns: Vec<f64>,
}

impl CompositeRiskAdjusted {
    pub fn new(config: CompositeRewardConfig) -> Self {
        Self {
            config,
            portfolio_returns: Vec::new(),
            market_returns: Vec::new(),
        }
    }

    fn composite(&self) -> f64 {
        let cfg = &self.config;
        let n = cfg.roll_window;
        let port = &self.portfolio_returns[self.portfolio_returns.len() - n..];
        let mkt = &self.market_returns[self.market_returns.len() - n..];

        let mean_r = port.iter().sum::<f64>() / n as f64;

        let downside: Vec<f64> = port.iter().copied().filter(|r| *r < 0.0).collect();
        let downside_std = if downside.len() > 1 {
            let m = downside.iter().sum::<f64>() / downside.len() as f64;
            (downside.iter().map(|r| (r - m).powi(2)).sum::<f64>()
                / (downside.len() - 1) as f64)
                .sqrt()
        } else {
            0.0
        };

        let mkt_mean = mkt.iter().sum::<f64>() / n as f64;
        let var_mkt =
            mkt.iter().map(|r| (r - mkt_mean).powi(2)).sum::<f64>() / (n - 1) as f64;
        let beta = if var_mkt > 0.0 {
            let cov = port
                .iter()
                .zip(mkt)
                .map(|(p, m)| (p - mean_r) * (m - mkt_mean))
                .sum::<f64>()
                / (n - 1) as f64;
            cov / (var_mkt + 1e-8)
        } else {
            0.0
        };
        let abs_beta = if cfg.beta_floor > 0.0 {
            cfg.beta_floor.max(beta.abs())
        } else {
            beta.abs() + 1e-8
        };

        let sortino = if downside_std > 0.0 {
            mean_r / (downside_std + 1e-8)
        } else {
            0.0
        };
        let excess = (mean_r - cfg.risk_free_rate) / (abs_beta + 1e-8);
        let treynor = mean_r / (abs_beta + 1e-8);

        let scaled = cfg.w_sortino * (sortino / cfg.scale_sortino)
            + cfg.w_downside * (-downside_std / cfg.scale_downside)
            + cfg.w_excess * (excess / cfg.scale_excess)
            + cfg.w_treynor * (treynor / cfg.scale_treynor);

        (scaled / cfg.clip).tanh() / cfg.scale_factor
    }
}

impl Default for CompositeRiskAdjusted {
    fn default() -> Self {
        Self::new(CompositeRewardConfig::default())
    }
}

impl RewardPolicy for CompositeRiskAdjusted {
    fn reset(&mut self) {
        self.portfolio_returns.clear();
        self.market_returns.clear();
    }

    fn reward(&mut self, inputs: &RewardInputs) -> f64 {
        self.portfolio_returns.push(inputs.return_pct);
        self.market_returns.push(inputs.market_return);

        if self.portfolio_returns.len() < self.config.roll_window {
            return inputs.base_reward;
        }
        inputs.base_reward + self.composite()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sharpe_shaped_reward_is_bounded() {
        let mut policy = SharpeShapedReward::default();
        policy.reset();
        for i in 0..100 {
            let inputs = RewardInputs {
                return_pct: if i % 2 == 0 { 0.5 } else { -0.5 },
                market_return: 0.0,
                base_reward: 0.0,
            };
            let r = policy.reward(&inputs);
            assert!(r.abs() <= reward::REWARD_CLIP);
        }
    }

    #[test]
    fn sharpe_shaped_reward_handles_zero_volatility() {
        let mut policy = SharpeShapedReward::default();
        policy.reset();
        let inputs = RewardInputs {
            return_pct: 0.0,
            market_return: 0.0,
            base_reward: 0.0,
        };
        let r = policy.reward(&inputs);
        assert!(r.is_finite());
        assert_eq!(r, 0.0);
    }

    #[test]
    fn composite_is_inert_before_window_fills() {
        let mut policy = CompositeRiskAdjusted::new(CompositeRewardConfig {
            roll_window: 10,
            ..Default::default()
        });
        policy.reset();
        let inputs = RewardInputs {
            return_pct: 0.01,
            market_return: 0.005,
            base_reward: 0.01,
        };
        for _ in 0..9 {
            assert_eq!(policy.reward(&inputs), inputs.base_reward);
        }
        // Tenth step activates the composite term.
        let r = policy.reward(&inputs);
        assert!(r.is_finite());
        assert_ne!(r, inputs.base_reward);
    }
}
