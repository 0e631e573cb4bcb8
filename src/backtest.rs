//! Greedy historical replay of a trained learner, producing the per-step
//! series a reporting layer needs — portfolio values, realized PnL, the
//! joint-action history — plus the summary statistics computed from them.

use rand::Rng;
use tracing::info;

use crate::env::{MarketEnv, PortfolioSeed, TradeAction, TradeFill};
use crate::error::Result;
use crate::learner::QmixLearner;

const TRADING_DAYS_PER_YEAR: f64 = 252.0;

#[derive(Debug, Clone)]
pub struct BacktestReport {
    pub initial_capital: f64,
    /// Portfolio value after each step, prefixed with the starting value.
    pub portfolio_values: Vec<f64>,
    /// Mark-to-market PnL of each step.
    pub raw_pnls: Vec<f64>,
    /// Shaped team reward of each step.
    pub rewards: Vec<f64>,
    /// Joint action submitted at each step.
    pub joint_actions: Vec<Vec<TradeAction>>,
    /// Realized trade of each step, if the vote cleared the deadband.
    pub fills: Vec<Option<TradeFill>>,
    pub final_shares: u64,
    pub final_cash: f64,
}

impl BacktestReport {
    pub fn steps(&self) -> usize {
        self.raw_pnls.len()
    }

    pub fn total_pnl(&self) -> f64 {
        self.raw_pnls.iter().sum()
    }

    pub fn total_return(&self) -> f64 {
        let last = *self.portfolio_values.last().unwrap_or(&self.initial_capital);
        (last - self.initial_capital) / self.initial_capital
    }

    fn daily_returns(&self) -> Vec<f64> {
        self.raw_pnls
            .iter()
            .map(|pnl| pnl / self.initial_capital)
            .collect()
    }

    /// Annualized Sharpe ratio of the daily return series.
    pub fn sharpe_ratio(&self) -> f64 {
        let returns = self.daily_returns();
        if returns.is_empty() {
            return 0.0;
        }
        let n = returns.len() as f64;
        let mean = returns.iter().sum::<f64>() / n;
        let std = (returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n).sqrt();
        mean / (std + 1e-9) * TRADING_DAYS_PER_YEAR.sqrt()
    }

    /// Annualized Sortino ratio: downside deviation only.
    pub fn sortino_ratio(&self) -> f64 {
        let returns = self.daily_returns();
        if returns.is_empty() {
            return 0.0;
        }
        let n = returns.len() as f64;
        let mean = returns.iter().sum::<f64>() / n;
        let downside: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
        let downside_std = if downside.is_empty() {
            1e-9
        } else {
            let dm = downside.iter().sum::<f64>() / downside.len() as f64;
            (downside.iter().map(|r| (r - dm).powi(2)).sum::<f64>() / downside.len() as f64)
                .sqrt()
        };
        mean / (downside_std + 1e-9) * TRADING_DAYS_PER_YEAR.sqrt()
    }

    /// Maximum peak-to-trough drawdown of the portfolio-value curve, as a
    /// positive fraction.
    pub fn max_drawdown(&self) -> f64 {
        let mut peak = f64::MIN;
        let mut worst = 0.0_f64;
        for &value in &self.portfolio_values {
            peak = peak.max(value);
            if peak > 0.0 {
                worst = worst.max((peak - value) / peak);
            }
        }
        worst
    }

    /// Fraction of steps with positive realized PnL.
    pub fn win_rate(&self) -> f64 {
        if self.raw_pnls.is_empty() {
            return 0.0;
        }
        self.raw_pnls.iter().filter(|pnl| **pnl > 0.0).count() as f64
            / self.raw_pnls.len() as f64
    }
}

/// Run one full greedy episode (ε = 0) over the environment's span.
pub fn run_backtest<R: Rng>(
    learner: &QmixLearner,
    env: &mut MarketEnv,
    seed: Option<PortfolioSeed>,
    rng: &mut R,
) -> Result<BacktestReport> {
    let (mut observations, _) = env.reset(seed);
    let initial_capital = env.portfolio().capital;

    let mut report = BacktestReport {
        initial_capital,
        portfolio_values: vec![initial_capital],
        raw_pnls: Vec::new(),
        rewards: Vec::new(),
        joint_actions: Vec::new(),
        fills: Vec::new(),
        final_shares: 0,
        final_cash: 0.0,
    };

    loop {
        let actions = learner.select_actions(&observations, 0.0, rng)?;
        let step = env.step(&actions)?;

        report.joint_actions.push(actions);
        report.portfolio_values.push(step.info.portfolio_value);
        report.raw_pnls.push(step.info.raw_pnl);
        report.rewards.push(step.reward);
        report.fills.push(step.info.fill);
        report.final_shares = step.info.shares;
        report.final_cash = step.info.cash;

        observations = step.observations;
        if step.done {
            break;
        }
    }

    info!(
        steps = report.steps(),
        total_pnl = report.total_pnl(),
        sharpe = report.sharpe_ratio(),
        max_drawdown = report.max_drawdown(),
        win_rate = report.win_rate(),
        "backtest complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{MarketEnvConfig, SharpeShapedReward};
    use crate::features::FeatureTable;
    use crate::learner::LearnerConfig;
    use ndarray::{Array1, Array2};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn report(pnls: Vec<f64>, capital: f64) -> BacktestReport {
        let mut values = vec![capital];
        let mut current = capital;
        for pnl in &pnls {
            current += pnl;
            values.push(current);
        }
        BacktestReport {
            initial_capital: capital,
            portfolio_values: values,
            raw_pnls: pnls,
            rewards: Vec::new(),
            joint_actions: Vec::new(),
            fills: Vec::new(),
            final_shares: 0,
            final_cash: capital,
        }
    }

    #[test]
    fn drawdown_finds_worst_peak_to_trough() {
        let r = report(vec![100.0, -150.0, 50.0, -25.0], 1000.0);
        // Peak 1100 -> trough 950: 150/1100.
        assert!((r.max_drawdown() - 150.0 / 1100.0).abs() < 1e-12);
    }

    #[test]
    fn win_rate_counts_positive_days() {
        let r = report(vec![10.0, -5.0, 0.0, 20.0], 1000.0);
        assert!((r.win_rate() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn sharpe_is_zero_for_flat_series_and_positive_for_gains() {
        let flat = report(vec![0.0; 10], 1000.0);
        assert_eq!(flat.sharpe_ratio(), 0.0);
        let gains = report(vec![1.0, 2.0, 1.5, 1.0, 2.5], 1000.0);
        assert!(gains.sharpe_ratio() > 0.0);
        assert!(gains.sortino_ratio() > 0.0);
    }

    #[test]
    fn backtest_covers_the_full_span() {
        let rows = 30;
        let names: Vec<String> = (0..4).map(|i| format!("f{i}")).collect();
        let values = Array2::from_shape_fn((rows, 4), |(r, c)| ((r + c) as f64 * 0.07).sin());
        let prices = Array1::from_shape_fn(rows, |r| 100.0 + (r as f64 * 0.2).cos());
        let table = FeatureTable::new(names, values, prices).unwrap();
        let assignments: Vec<Vec<String>> = (0..4).map(|i| vec![format!("f{i}")]).collect();
        let mut env = MarketEnv::new(
            table,
            assignments,
            Box::new(SharpeShapedReward::default()),
            MarketEnvConfig {
                window_size: 5,
                ..Default::default()
            },
        )
        .unwrap();

        let learner = QmixLearner::new(
            &env.observation_dims(),
            env.state_dim(),
            LearnerConfig {
                mixer_embed_dim: 8,
                ..Default::default()
            },
        )
        .unwrap();

        let mut rng = StdRng::seed_from_u64(4);
        let report = run_backtest(&learner, &mut env, None, &mut rng).unwrap();

        assert_eq!(report.steps(), env.max_steps());
        assert_eq!(report.portfolio_values.len(), report.steps() + 1);
        assert_eq!(report.joint_actions.len(), report.steps());
        assert!(report.portfolio_values.iter().all(|v| v.is_finite()));
    }
}
