//! Discrete-time trading environments.
//!
//! [`MarketEnv`] is the multi-agent simulator: every agent votes Buy/Hold/
//! Sell each step, the votes aggregate into at most one realized trade on a
//! shared book, and all agents receive one team reward. The single-agent
//! variant lives in [`single`].

pub mod portfolio;
pub mod reward;
pub mod single;

use enum_map::Enum;
use ndarray::{s, Array1};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::{trade, WINDOW_SIZE};
use crate::error::{Result, TradingError};
use crate::features::FeatureTable;

pub use portfolio::{Portfolio, PortfolioSeed, SharedPosition};
pub use reward::{RewardInputs, RewardPolicy, SharpeShapedReward};

/// One agent's discrete decision for a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Enum, Serialize, Deserialize)]
pub enum TradeAction {
    Buy,
    Hold,
    Sell,
}

impl TradeAction {
    pub const COUNT: usize = <TradeAction as Enum>::LENGTH;

    pub fn index(self) -> usize {
        self.into_usize()
    }

    pub fn from_index(index: usize) -> Option<Self> {
        (index < Self::COUNT).then(|| Self::from_usize(index))
    }

    /// Contribution to the joint vote sum.
    pub fn vote(self) -> i32 {
        match self {
            TradeAction::Buy => 1,
            TradeAction::Hold => 0,
            TradeAction::Sell => -1,
        }
    }
}

/// A trade actually executed against the shared book.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TradeFill {
    pub side: TradeAction,
    pub shares: u64,
    pub price: f64,
}

/// Step byproducts the reporting layer needs; nothing here feeds learning.
#[derive(Debug, Clone)]
pub struct StepInfo {
    pub raw_pnl: f64,
    pub portfolio_value: f64,
    pub shares: u64,
    pub cash: f64,
    pub vote_sum: i32,
    pub signal_strength: f64,
    pub fill: Option<TradeFill>,
}

/// Result of one environment step.
#[derive(Debug)]
pub struct Step {
    pub observations: Vec<Array1<f64>>,
    pub global_state: Array1<f64>,
    pub reward: f64,
    pub done: bool,
    pub info: StepInfo,
}

#[derive(Debug, Clone)]
pub struct MarketEnvConfig {
    pub window_size: usize,
    pub max_buy_fraction: f64,
    pub max_sell_fraction: f64,
    pub vote_deadband: i32,
    pub default_capital: f64,
}

impl Default for MarketEnvConfig {
    fn default() -> Self {
        Self {
            window_size: WINDOW_SIZE,
            max_buy_fraction: trade::MAX_BUY_FRACTION,
            max_sell_fraction: trade::MAX_SELL_FRACTION,
            vote_deadband: trade::VOTE_DEADBAND,
            default_capital: trade::DEFAULT_CAPITAL,
        }
    }
}

/// Multi-agent voting environment over a pre-scaled feature/price table.
///
/// Each agent observes a fixed subset of the feature columns over the
/// lookback window plus the shared (position, unrealized-return) pair; the
/// global state is the full feature window plus every agent's pair. The
/// subsets are fixed for the lifetime of the instance.
pub struct MarketEnv {
    table: FeatureTable,
    agent_columns: Vec<Vec<usize>>,
    agent_features: Vec<Vec<String>>,
    config: MarketEnvConfig,
    reward_policy: Box<dyn RewardPolicy>,
    portfolio: Portfolio,
    position: SharedPosition,
    current_step: usize,
    max_steps: usize,
    done: bool,
}

impl std::fmt::Debug for MarketEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketEnv")
            .field("agent_columns", &self.agent_columns)
            .field("agent_features", &self.agent_features)
            .field("config", &self.config)
            .field("current_step", &self.current_step)
            .field("max_steps", &self.max_steps)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl MarketEnv {
    pub fn new(
        table: FeatureTable,
        agent_features: Vec<Vec<String>>,
        reward_policy: Box<dyn RewardPolicy>,
        config: MarketEnvConfig,
    ) -> Result<Self> {
        if agent_features.is_empty() {
            return Err(TradingError::Config("need at least one agent".into()));
        }
        if config.window_size == 0 {
            return Err(TradingError::Config("window size must be positive".into()));
        }
        if table.len() < config.window_size + 2 {
            return Err(TradingError::Config(format!(
                "table has {} rows, need at least {} for window {}",
                table.len(),
                config.window_size + 2,
                config.window_size
            )));
        }

        let mut agent_columns = Vec::with_capacity(agent_features.len());
        for names in &agent_features {
            if names.is_empty() {
                return Err(TradingError::Config(
                    "agent feature subset is empty".into(),
                ));
            }
            agent_columns.push(table.resolve_columns(names)?);
        }

        let max_steps = table.len() - config.window_size - 1;
        let default_capital = config.default_capital;
        Ok(Self {
            table,
            agent_columns,
            agent_features,
            config,
            reward_policy,
            portfolio: Portfolio::reset(default_capital, None, 0.0),
            position: SharedPosition::flat(),
            current_step: 0,
            max_steps,
            done: true,
        })
    }

    pub fn agent_count(&self) -> usize {
        self.agent_columns.len()
    }

    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    pub fn window_size(&self) -> usize {
        self.config.window_size
    }

    /// Per-agent observation lengths: window × subset size + the
    /// (position, unrealized-return) pair.
    pub fn observation_dims(&self) -> Vec<usize> {
        self.agent_columns
            .iter()
            .map(|cols| self.config.window_size * cols.len() + 2)
            .collect()
    }

    /// Global state length: window × all features + one pair per agent.
    pub fn state_dim(&self) -> usize {
        self.config.window_size * self.table.feature_count() + 2 * self.agent_count()
    }

    pub fn agent_feature_names(&self, agent: usize) -> &[String] {
        &self.agent_features[agent]
    }

    pub fn portfolio(&self) -> &Portfolio {
        &self.portfolio
    }

    fn current_price(&self) -> f64 {
        self.table.price(self.current_step + self.config.window_size - 1)
    }

    fn observe(&self) -> (Vec<Array1<f64>>, Array1<f64>) {
        let window = self.config.window_size;
        let rows = self
            .table
            .values()
            .slice(s![self.current_step..self.current_step + window, ..]);
        let price = self.current_price();

        let pos_signal = self.position.signal as f64;
        let unrealized = self.position.unrealized_return(price);

        let mut observations = Vec::with_capacity(self.agent_count());
        for cols in &self.agent_columns {
            let mut obs = Vec::with_capacity(window * cols.len() + 2);
            for row in rows.outer_iter() {
                for &c in cols {
                    obs.push(row[c]);
                }
            }
            obs.push(pos_signal);
            obs.push(unrealized);
            observations.push(Array1::from(obs));
        }

        let mut state = Vec::with_capacity(self.state_dim());
        for row in rows.outer_iter() {
            state.extend(row.iter().copied());
        }
        for _ in 0..self.agent_count() {
            state.push(pos_signal);
            state.push(unrealized);
        }

        (observations, Array1::from(state))
    }

    /// Begin a new episode, optionally seeded with existing holdings.
    /// Returns the first observations and global state.
    pub fn reset(&mut self, seed: Option<PortfolioSeed>) -> (Vec<Array1<f64>>, Array1<f64>) {
        self.current_step = 0;
        self.done = false;
        self.position = SharedPosition::flat();
        let price = self.current_price();
        self.portfolio = Portfolio::reset(self.config.default_capital, seed, price);
        if self.portfolio.shares > 0 {
            self.position = SharedPosition::opened(price);
        }
        self.reward_policy.reset();
        self.observe()
    }

    /// Advance one step under the joint action.
    ///
    /// Votes sum to `vote_sum ∈ [−N, N]`; a trade is realized only past the
    /// deadband, sized linearly by `|vote_sum| / N` and saturating at full
    /// consensus. Stepping a terminated episode is a caller bug and errors.
    pub fn step(&mut self, actions: &[TradeAction]) -> Result<Step> {
        if self.done {
            return Err(TradingError::EpisodeOver);
        }
        if actions.len() != self.agent_count() {
            return Err(TradingError::Config(format!(
                "joint action has {} entries for {} agents",
                actions.len(),
                self.agent_count()
            )));
        }

        let old_price = self.current_price();
        self.current_step += 1;
        let new_price = self.current_price();

        let vote_sum: i32 = actions.iter().map(|a| a.vote()).sum();
        let n = self.agent_count() as f64;

        let (realized, signal_strength) = if vote_sum >= self.config.vote_deadband {
            (Some(TradeAction::Buy), vote_sum as f64 / n)
        } else if vote_sum <= -self.config.vote_deadband {
            (Some(TradeAction::Sell), vote_sum.unsigned_abs() as f64 / n)
        } else {
            (None, 0.0)
        };

        let old_value = self.portfolio.value(old_price);
        let mut fill = None;

        match realized {
            Some(TradeAction::Buy) => {
                let buy_amount = old_value * signal_strength * self.config.max_buy_fraction;
                if buy_amount > new_price && buy_amount <= self.portfolio.cash {
                    let bought = (buy_amount / new_price) as u64;
                    let held_before = self.portfolio.shares;
                    let cost = bought as f64 * new_price;
                    self.portfolio.shares += bought;
                    self.portfolio.cash -= cost;
                    self.position.add_lot(held_before, bought, new_price);
                    fill = Some(TradeFill {
                        side: TradeAction::Buy,
                        shares: bought,
                        price: new_price,
                    });
                }
            }
            Some(TradeAction::Sell) => {
                if self.portfolio.shares > 0 {
                    let sold = (self.portfolio.shares as f64
                        * signal_strength
                        * self.config.max_sell_fraction) as u64;
                    if sold > 0 {
                        self.portfolio.shares -= sold;
                        self.portfolio.cash += sold as f64 * new_price;
                        if self.portfolio.shares == 0 {
                            self.position = SharedPosition::flat();
                        }
                        fill = Some(TradeFill {
                            side: TradeAction::Sell,
                            shares: sold,
                            price: new_price,
                        });
                    }
                }
            }
            _ => {}
        }

        let new_value = self.portfolio.value(new_price);
        let raw_pnl = new_value - old_value;
        let return_pct = if self.portfolio.capital > 1e-6 {
            raw_pnl / self.portfolio.capital
        } else {
            0.0
        };
        let market_return = if old_price.abs() > f64::EPSILON {
            (new_price - old_price) / old_price
        } else {
            0.0
        };

        let reward = self.reward_policy.reward(&RewardInputs {
            return_pct,
            market_return,
            base_reward: return_pct,
        });

        self.done = self.current_step >= self.max_steps;
        let (observations, global_state) = self.observe();

        debug!(
            step = self.current_step,
            vote_sum,
            reward,
            portfolio_value = new_value,
            "env step"
        );

        Ok(Step {
            observations,
            global_state,
            reward,
            done: self.done,
            info: StepInfo {
                raw_pnl,
                portfolio_value: new_value,
                shares: self.portfolio.shares,
                cash: self.portfolio.cash,
                vote_sum,
                signal_strength,
                fill,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn synthetic_table(rows: usize) -> FeatureTable {
        let names: Vec<String> = (0..4).map(|i| format!("f{i}")).collect();
        let values =
            Array2::from_shape_fn((rows, 4), |(r, c)| ((r * 4 + c) as f64 * 0.01).sin());
        let prices = Array1::from_shape_fn(rows, |r| 100.0 + (r as f64 * 0.3).sin());
        FeatureTable::new(names, values, prices).unwrap()
    }

    fn four_agent_env(rows: usize) -> MarketEnv {
        let assignments = vec![
            vec!["f0".into()],
            vec!["f1".into()],
            vec!["f2".into()],
            vec!["f3".into()],
        ];
        MarketEnv::new(
            synthetic_table(rows),
            assignments,
            Box::new(SharpeShapedReward::default()),
            MarketEnvConfig {
                window_size: 5,
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn dimensions_follow_assignments() {
        let env = four_agent_env(40);
        assert_eq!(env.observation_dims(), vec![7, 7, 7, 7]);
        assert_eq!(env.state_dim(), 5 * 4 + 8);
        assert_eq!(env.max_steps(), 40 - 5 - 1);
    }

    #[test]
    fn unknown_column_fails_at_construction() {
        let err = MarketEnv::new(
            synthetic_table(40),
            vec![vec!["nope".into()]],
            Box::new(SharpeShapedReward::default()),
            MarketEnvConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, TradingError::Config(_)));
    }

    #[test]
    fn deadband_vote_executes_no_trade() {
        let mut env = four_agent_env(40);
        env.reset(Some(PortfolioSeed {
            capital: 1_000_000.0,
            shares: 100,
        }));
        // {Buy, Buy, Hold, Sell} -> vote_sum = +1, inside the deadband.
        let step = env
            .step(&[
                TradeAction::Buy,
                TradeAction::Buy,
                TradeAction::Hold,
                TradeAction::Sell,
            ])
            .unwrap();
        assert_eq!(step.info.vote_sum, 1);
        assert!(step.info.fill.is_none());
        assert_eq!(step.info.shares, 100);
        // Value change is pure mark-to-market on the held shares.
        let expected_pnl = 100.0 * (env.current_price() - env.table.price(4));
        assert!((step.info.raw_pnl - expected_pnl).abs() < 1e-9);
    }

    #[test]
    fn full_consensus_sell_liquidates_max_fraction() {
        let mut env = four_agent_env(40);
        env.reset(Some(PortfolioSeed {
            capital: 1_000_000.0,
            shares: 1000,
        }));
        let step = env.step(&[TradeAction::Sell; 4]).unwrap();
        assert_eq!(step.info.vote_sum, -4);
        assert!((step.info.signal_strength - 1.0).abs() < 1e-12);
        let fill = step.info.fill.expect("consensus sell must fill");
        assert_eq!(fill.side, TradeAction::Sell);
        assert_eq!(fill.shares, 300); // 30% of 1000 at saturation
        assert_eq!(step.info.shares, 700);
    }

    #[test]
    fn buy_size_is_monotone_in_vote_sum() {
        let mut bought = Vec::new();
        for buyers in 2..=4usize {
            let mut env = four_agent_env(40);
            env.reset(None);
            let mut actions = vec![TradeAction::Hold; 4];
            for a in actions.iter_mut().take(buyers) {
                *a = TradeAction::Buy;
            }
            let step = env.step(&actions).unwrap();
            let fill = step.info.fill.expect("past-deadband buy must fill");
            bought.push(fill.shares);
        }
        assert!(bought[0] < bought[1] && bought[1] < bought[2]);
    }

    #[test]
    fn sub_deadband_votes_never_trade() {
        for votes in [-1i32, 0, 1] {
            let mut env = four_agent_env(40);
            env.reset(Some(PortfolioSeed {
                capital: 1_000_000.0,
                shares: 500,
            }));
            let actions = match votes {
                -1 => vec![
                    TradeAction::Sell,
                    TradeAction::Hold,
                    TradeAction::Hold,
                    TradeAction::Hold,
                ],
                0 => vec![TradeAction::Hold; 4],
                _ => vec![
                    TradeAction::Buy,
                    TradeAction::Hold,
                    TradeAction::Hold,
                    TradeAction::Hold,
                ],
            };
            let step = env.step(&actions).unwrap();
            assert!(step.info.fill.is_none(), "vote_sum {votes} traded");
        }
    }

    #[test]
    fn terminates_exactly_at_max_steps_then_errors() {
        let mut env = four_agent_env(20);
        env.reset(None);
        let max_steps = env.max_steps();
        for i in 0..max_steps {
            let step = env.step(&[TradeAction::Hold; 4]).unwrap();
            assert_eq!(step.done, i + 1 == max_steps);
        }
        assert!(matches!(
            env.step(&[TradeAction::Hold; 4]),
            Err(TradingError::EpisodeOver)
        ));
    }

    #[test]
    fn reset_reopens_a_finished_episode() {
        let mut env = four_agent_env(20);
        env.reset(None);
        for _ in 0..env.max_steps() {
            env.step(&[TradeAction::Hold; 4]).unwrap();
        }
        env.reset(None);
        assert!(env.step(&[TradeAction::Hold; 4]).is_ok());
    }
}
