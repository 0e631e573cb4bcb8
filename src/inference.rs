//! Inference handle for serving recommendations.
//!
//! A [`Predictor`] is constructed once at process start from persisted model
//! and scaler bundles, then passed explicitly to every call site — lifecycle
//! (load once, reuse, reload deliberately) is the caller's dependency, not
//! ambient global state. The serving layer maps the returned signal and
//! attributions onto its own schema; nothing here formats text or speaks
//! HTTP.

use hashbrown::HashMap;
use ndarray::Array1;
use ordered_float::OrderedFloat;
use std::path::Path;

use crate::env::TradeAction;
use crate::error::{Result, TradingError};
use crate::features::StandardScaler;
use crate::learner::{LearnerConfig, QmixLearner};

/// Discrete recommendation label derived from the joint vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    StrongBuy,
    Buy,
    Hold,
    Sell,
    StrongSell,
}

impl Signal {
    /// Vote-sum thresholds carried over from the decision rules the vote
    /// aggregation was tuned against: ±3 marks strong conviction.
    pub fn from_vote_sum(vote_sum: i32) -> Self {
        if vote_sum >= 3 {
            Signal::StrongBuy
        } else if vote_sum > 0 {
            Signal::Buy
        } else if vote_sum == 0 {
            Signal::Hold
        } else if vote_sum > -3 {
            Signal::Sell
        } else {
            Signal::StrongSell
        }
    }
}

/// Everything the handle needs to rebuild the trained architecture.
#[derive(Debug, Clone)]
pub struct PredictorSpec {
    /// Full feature ordering the model was trained against.
    pub feature_names: Vec<String>,
    /// Per-agent feature-name subsets, same as at training time.
    pub agent_features: Vec<Vec<String>>,
    pub window_size: usize,
    pub learner_config: LearnerConfig,
}

/// A single recommendation with its explanation inputs.
#[derive(Debug, Clone)]
pub struct Recommendation {
    pub signal: Signal,
    pub vote_sum: i32,
    /// Each agent's independent greedy action.
    pub joint_action: Vec<TradeAction>,
    /// The single best coordinated action under the mixer, over all 3^N
    /// joint combinations, and its team value.
    pub best_joint_action: Vec<TradeAction>,
    pub team_value: f64,
    /// Merged per-feature importances across agents, strongest first.
    pub attributions: Vec<(String, f64)>,
}

pub struct Predictor {
    learner: QmixLearner,
    scaler: StandardScaler,
    feature_names: Vec<String>,
    agent_features: Vec<Vec<String>>,
    agent_columns: Vec<Vec<usize>>,
    window_size: usize,
}

impl Predictor {
    /// Load the model and scaler bundles and validate them against the
    /// declared architecture. Both loads fail loudly; there is no
    /// random-weight fallback.
    pub fn open(model_path: &Path, scaler_path: &Path, spec: PredictorSpec) -> Result<Self> {
        if spec.window_size == 0 {
            return Err(TradingError::Config("window size must be positive".into()));
        }
        let scaler = StandardScaler::load(scaler_path)?;
        if scaler.feature_count() != spec.feature_names.len() {
            return Err(TradingError::Config(format!(
                "scaler fitted on {} features, spec declares {}",
                scaler.feature_count(),
                spec.feature_names.len()
            )));
        }

        let name_index: HashMap<&str, usize> = spec
            .feature_names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();
        let mut agent_columns = Vec::with_capacity(spec.agent_features.len());
        for names in &spec.agent_features {
            let mut columns = Vec::with_capacity(names.len());
            for name in names {
                let column = name_index.get(name.as_str()).copied().ok_or_else(|| {
                    TradingError::Config(format!("unknown feature column {name:?}"))
                })?;
                columns.push(column);
            }
            agent_columns.push(columns);
        }
        drop(name_index);

        let observation_dims: Vec<usize> = agent_columns
            .iter()
            .map(|cols| spec.window_size * cols.len() + 2)
            .collect();
        let state_dim =
            spec.window_size * spec.feature_names.len() + 2 * spec.agent_features.len();

        let (learner, _) = QmixLearner::load(
            model_path,
            &observation_dims,
            state_dim,
            spec.learner_config,
        )?;

        Ok(Self {
            learner,
            scaler,
            feature_names: spec.feature_names,
            agent_features: spec.agent_features,
            agent_columns,
            window_size: spec.window_size,
        })
    }

    /// Produce a recommendation from one feature snapshot.
    ///
    /// The snapshot must cover every training feature — a missing key is a
    /// data error, never silently defaulted, since a fabricated Hold is
    /// worse than an explicit failure. The single snapshot is tiled across
    /// the lookback window (the latest values stand in for the whole
    /// window) with a flat position, exactly the layout the networks were
    /// trained on.
    pub fn predict(
        &self,
        snapshot: &HashMap<String, f64>,
        top_k: usize,
    ) -> Result<Recommendation> {
        let mut row = Array1::zeros(self.feature_names.len());
        for (i, name) in self.feature_names.iter().enumerate() {
            let value = snapshot.get(name).copied().ok_or_else(|| {
                TradingError::Data(format!("snapshot is missing feature {name:?}"))
            })?;
            if !value.is_finite() {
                return Err(TradingError::Data(format!(
                    "snapshot value for {name:?} is not finite"
                )));
            }
            row[i] = value;
        }
        let scaled = self.scaler.transform_row(&row)?;

        let observations: Vec<Array1<f64>> = self
            .agent_columns
            .iter()
            .map(|cols| {
                let mut obs = Vec::with_capacity(self.window_size * cols.len() + 2);
                for _ in 0..self.window_size {
                    for &c in cols {
                        obs.push(scaled[c]);
                    }
                }
                obs.push(0.0); // flat position
                obs.push(0.0); // no unrealized return
                Array1::from(obs)
            })
            .collect();

        let mut global_state =
            Vec::with_capacity(self.window_size * scaled.len() + 2 * self.agent_columns.len());
        for _ in 0..self.window_size {
            global_state.extend(scaled.iter().copied());
        }
        global_state.extend(std::iter::repeat(0.0).take(2 * self.agent_columns.len()));
        let global_state = Array1::from(global_state);

        // Greedy per-agent actions and the coordinated best joint action.
        let joint_action: Vec<TradeAction> = observations
            .iter()
            .enumerate()
            .map(|(i, obs)| self.learner.agent(i).greedy_action(obs))
            .collect();
        let vote_sum: i32 = joint_action.iter().map(|a| a.vote()).sum();
        let (best_joint_action, team_value) =
            self.learner.best_joint_action(&observations, &global_state)?;

        // Merge per-agent attributions by base feature.
        let mut merged: HashMap<String, f64> = HashMap::new();
        for (i, obs) in observations.iter().enumerate() {
            let explanation =
                self.learner
                    .agent(i)
                    .explain(obs, &self.agent_features[i], self.window_size)?;
            for (name, importance) in explanation.importances {
                *merged.entry(name).or_insert(0.0) += importance;
            }
        }
        let mut attributions: Vec<(String, f64)> = merged.into_iter().collect();
        attributions.sort_by(|a, b| OrderedFloat(b.1).cmp(&OrderedFloat(a.1)));
        attributions.truncate(top_k);

        Ok(Recommendation {
            signal: Signal::from_vote_sum(vote_sum),
            vote_sum,
            joint_action,
            best_joint_action,
            team_value,
            attributions,
        })
    }
}
