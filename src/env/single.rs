//! Single-agent environment: one signed position over one asset, with a
//! benchmark series for the risk-adjusted reward terms. The simplified
//! counterpart of [`MarketEnv`](super::MarketEnv) used by the actor-critic
//! trainer.

use ndarray::{s, Array1};

use crate::constants::{a2c, WINDOW_SIZE};
use crate::env::reward::{RewardInputs, RewardPolicy};
use crate::env::TradeAction;
use crate::error::{Result, TradingError};
use crate::features::FeatureTable;

#[derive(Debug, Clone)]
pub struct SingleEnvConfig {
    pub window_size: usize,
    /// Cost charged per unit of position change.
    pub trade_penalty: f64,
    /// Mark-to-market accrual (default) or realized-only: with the latter,
    /// the base reward books a position's compounded return only on the step
    /// that closes or flips it.
    pub mark_to_market: bool,
}

impl Default for SingleEnvConfig {
    fn default() -> Self {
        Self {
            window_size: WINDOW_SIZE,
            trade_penalty: a2c::TRADE_PENALTY,
            mark_to_market: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SingleStepInfo {
    pub base_reward: f64,
    pub portfolio_return: f64,
    pub asset_return: f64,
    pub equity: f64,
    pub buyhold_equity: f64,
}

#[derive(Debug)]
pub struct SingleStep {
    pub state: Array1<f64>,
    pub reward: f64,
    pub done: bool,
    pub info: SingleStepInfo,
}

/// One-asset environment with a signed position in {−1, 0, +1}.
pub struct SingleAssetEnv {
    table: FeatureTable,
    asset_returns: Array1<f64>,
    market_returns: Array1<f64>,
    config: SingleEnvConfig,
    reward_policy: Box<dyn RewardPolicy>,
    current_step: usize,
    position: f64,
    /// Compounded return of the currently open position (realized-only mode).
    open_return: f64,
    equity: f64,
    buyhold_equity: f64,
    equity_curve: Vec<f64>,
    buyhold_curve: Vec<f64>,
    done: bool,
}

impl SingleAssetEnv {
    /// `market` is the benchmark index series, parallel to the table rows.
    pub fn new(
        table: FeatureTable,
        market: Array1<f64>,
        reward_policy: Box<dyn RewardPolicy>,
        config: SingleEnvConfig,
    ) -> Result<Self> {
        if config.window_size == 0 {
            return Err(TradingError::Config("window size must be positive".into()));
        }
        if table.len() < config.window_size + 1 {
            return Err(TradingError::Config(format!(
                "table has {} rows, need more than window {}",
                table.len(),
                config.window_size
            )));
        }
        if market.len() != table.len() {
            return Err(TradingError::Data(format!(
                "benchmark series has {} rows for {} feature rows",
                market.len(),
                table.len()
            )));
        }
        if market.iter().any(|v| !v.is_finite()) {
            return Err(TradingError::Data(
                "benchmark series contains non-finite values".into(),
            ));
        }

        let returns_of = |series: &Array1<f64>| {
            let mut out = Array1::zeros(series.len());
            for i in 1..series.len() {
                out[i] = if series[i - 1].abs() > f64::EPSILON {
                    series[i] / series[i - 1] - 1.0
                } else {
                    0.0
                };
            }
            out
        };
        let asset_returns = returns_of(table.prices());
        let market_returns = returns_of(&market);

        Ok(Self {
            table,
            asset_returns,
            market_returns,
            config,
            reward_policy,
            current_step: 0,
            position: 0.0,
            open_return: 0.0,
            equity: 1.0,
            buyhold_equity: 1.0,
            equity_curve: Vec::new(),
            buyhold_curve: Vec::new(),
            done: true,
        })
    }

    /// Window of features plus the position flag.
    pub fn state_dim(&self) -> usize {
        self.config.window_size * self.table.feature_count() + 1
    }

    /// Steps available per episode.
    pub fn max_steps(&self) -> usize {
        self.table.len() - self.config.window_size
    }

    pub fn equity_curve(&self) -> &[f64] {
        &self.equity_curve
    }

    pub fn buyhold_curve(&self) -> &[f64] {
        &self.buyhold_curve
    }

    fn state(&self) -> Array1<f64> {
        let window = self.config.window_size;
        let rows = self
            .table
            .values()
            .slice(s![self.current_step + 1 - window..self.current_step + 1, ..]);
        let mut state = Vec::with_capacity(self.state_dim());
        for row in rows.outer_iter() {
            state.extend(row.iter().copied());
        }
        state.push(self.position);
        Array1::from(state)
    }

    pub fn reset(&mut self) -> Array1<f64> {
        self.current_step = self.config.window_size - 1;
        self.position = 0.0;
        self.open_return = 0.0;
        self.equity = 1.0;
        self.buyhold_equity = 1.0;
        self.equity_curve = vec![1.0];
        self.buyhold_curve = vec![1.0];
        self.done = false;
        self.reward_policy.reset();
        self.state()
    }

    pub fn step(&mut self, action: TradeAction) -> Result<SingleStep> {
        if self.done {
            return Err(TradingError::EpisodeOver);
        }

        let prev_position = self.position;
        let new_position = match action {
            TradeAction::Buy => 1.0,
            TradeAction::Sell => -1.0,
            TradeAction::Hold => prev_position,
        };
        let position_change = (new_position - prev_position).abs();
        let trade_cost = self.config.trade_penalty * position_change;

        let next_step = self.current_step + 1;
        let asset_return = self.asset_returns[next_step];
        let market_return = self.market_returns[next_step];

        let portfolio_return = new_position * asset_return;
        self.equity *= 1.0 + portfolio_return;
        self.buyhold_equity *= 1.0 + asset_return;

        let accrued = if self.config.mark_to_market {
            portfolio_return
        } else {
            // Book the open position's compounded return when it closes.
            let realized = if position_change > 0.0 && prev_position != 0.0 {
                self.open_return
            } else {
                0.0
            };
            if position_change > 0.0 {
                self.open_return = 0.0;
            }
            self.open_return = (1.0 + self.open_return) * (1.0 + portfolio_return) - 1.0;
            realized
        };
        let base_reward = accrued - trade_cost;

        let reward = self.reward_policy.reward(&RewardInputs {
            return_pct: portfolio_return,
            market_return,
            base_reward,
        });

        self.position = new_position;
        self.current_step = next_step;
        self.done = self.current_step >= self.table.len() - 1;

        self.equity_curve.push(self.equity);
        self.buyhold_curve.push(self.buyhold_equity);

        Ok(SingleStep {
            state: self.state(),
            reward,
            done: self.done,
            info: SingleStepInfo {
                base_reward,
                portfolio_return,
                asset_return,
                equity: self.equity,
                buyhold_equity: self.buyhold_equity,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::reward::RawReward;
    use ndarray::Array2;

    fn env(rows: usize) -> SingleAssetEnv {
        let names: Vec<String> = (0..3).map(|i| format!("f{i}")).collect();
        let values = Array2::from_shape_fn((rows, 3), |(r, c)| (r as f64 + c as f64) * 0.01);
        let prices = Array1::from_shape_fn(rows, |r| 50.0 * (1.0 + 0.01 * r as f64));
        let market = Array1::from_shape_fn(rows, |r| 100.0 * (1.0 + 0.005 * r as f64));
        let table = FeatureTable::new(names, values, prices).unwrap();
        SingleAssetEnv::new(
            table,
            market,
            Box::new(RawReward),
            SingleEnvConfig {
                window_size: 4,
                trade_penalty: 0.001,
                mark_to_market: true,
            },
        )
        .unwrap()
    }

    #[test]
    fn state_has_window_plus_position() {
        let mut e = env(30);
        let state = e.reset();
        assert_eq!(state.len(), 4 * 3 + 1);
        assert_eq!(state[state.len() - 1], 0.0);
    }

    #[test]
    fn long_position_earns_asset_return_minus_cost() {
        let mut e = env(30);
        e.reset();
        let step = e.step(TradeAction::Buy).unwrap();
        let expected = step.info.asset_return - 0.001;
        assert!((step.reward - expected).abs() < 1e-12);
        assert!(step.info.asset_return > 0.0);
    }

    #[test]
    fn short_position_inverts_the_return() {
        let mut e = env(30);
        e.reset();
        let step = e.step(TradeAction::Sell).unwrap();
        assert!((step.info.portfolio_return + step.info.asset_return).abs() < 1e-12);
    }

    #[test]
    fn hold_keeps_the_position() {
        let mut e = env(30);
        e.reset();
        e.step(TradeAction::Buy).unwrap();
        let step = e.step(TradeAction::Hold).unwrap();
        // No position change, so no trading cost.
        assert!((step.reward - step.info.asset_return).abs() < 1e-12);
    }

    #[test]
    fn episode_ends_at_data_boundary_then_errors() {
        let mut e = env(12);
        e.reset();
        let mut steps = 0;
        loop {
            let step = e.step(TradeAction::Hold).unwrap();
            steps += 1;
            if step.done {
                break;
            }
        }
        assert_eq!(steps, e.max_steps());
        assert!(matches!(
            e.step(TradeAction::Hold),
            Err(TradingError::EpisodeOver)
        ));
    }

    #[test]
    fn realized_only_mode_books_on_close() {
        let names = vec!["f".to_string()];
        let rows = 20;
        let values = Array2::from_shape_fn((rows, 1), |(r, _)| r as f64 * 0.1);
        let prices = Array1::from_shape_fn(rows, |r| 10.0 + r as f64);
        let market = prices.clone();
        let table = FeatureTable::new(names, values, prices).unwrap();
        let mut e = SingleAssetEnv::new(
            table,
            market,
            Box::new(RawReward),
            SingleEnvConfig {
                window_size: 3,
                trade_penalty: 0.0,
                mark_to_market: false,
            },
        )
        .unwrap();
        e.reset();
        let open = e.step(TradeAction::Buy).unwrap();
        assert_eq!(open.info.base_reward, 0.0);
        let hold = e.step(TradeAction::Hold).unwrap();
        assert_eq!(hold.info.base_reward, 0.0);
        let close = e.step(TradeAction::Sell).unwrap();
        assert!(close.info.base_reward > 0.0);
    }
}
