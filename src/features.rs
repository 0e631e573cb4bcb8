//! Boundary types for the feature pipeline: the validated feature/price
//! table the environments consume, and the fit-once standardization scaler
//! reused verbatim at validation, backtest, and inference time.

use hashbrown::HashMap;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TradingError};

/// A time-indexed table of numeric features plus a parallel price series.
///
/// The upstream pipeline guarantees no gaps and a fixed column ordering;
/// both are enforced here so every later dimension check can assume them.
#[derive(Debug, Clone)]
pub struct FeatureTable {
    names: Vec<String>,
    values: Array2<f64>,
    prices: Array1<f64>,
    index: HashMap<String, usize>,
}

impl FeatureTable {
    pub fn new(names: Vec<String>, values: Array2<f64>, prices: Array1<f64>) -> Result<Self> {
        if values.nrows() == 0 {
            return Err(TradingError::Data("feature table is empty".into()));
        }
        if names.len() != values.ncols() {
            return Err(TradingError::Data(format!(
                "{} column names for {} columns",
                names.len(),
                values.ncols()
            )));
        }
        if prices.len() != values.nrows() {
            return Err(TradingError::Data(format!(
                "{} prices for {} feature rows",
                prices.len(),
                values.nrows()
            )));
        }
        if values.iter().any(|v| !v.is_finite()) || prices.iter().any(|p| !p.is_finite()) {
            return Err(TradingError::Data(
                "feature table contains non-finite values".into(),
            ));
        }

        let mut index = HashMap::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            if index.insert(name.clone(), i).is_some() {
                return Err(TradingError::Data(format!("duplicate column {name:?}")));
            }
        }

        Ok(Self {
            names,
            values,
            prices,
            index,
        })
    }

    pub fn len(&self) -> usize {
        self.values.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.values.nrows() == 0
    }

    pub fn feature_count(&self) -> usize {
        self.values.ncols()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    pub fn price(&self, row: usize) -> f64 {
        self.prices[row]
    }

    pub fn prices(&self) -> &Array1<f64> {
        &self.prices
    }

    /// Resolve column names to indices. Unknown names are a configuration
    /// error: the per-agent assignment references columns that the pipeline
    /// never produced.
    pub fn resolve_columns(&self, names: &[String]) -> Result<Vec<usize>> {
        names
            .iter()
            .map(|name| {
                self.index.get(name).copied().ok_or_else(|| {
                    TradingError::Config(format!("unknown feature column {name:?}"))
                })
            })
            .collect()
    }

    /// Keep the rows `[start, end)`, e.g. for a train/test split.
    pub fn slice_rows(&self, start: usize, end: usize) -> Result<Self> {
        if start >= end || end > self.len() {
            return Err(TradingError::Data(format!(
                "invalid row range {start}..{end} for {} rows",
                self.len()
            )));
        }
        Self::new(
            self.names.clone(),
            self.values.slice(ndarray::s![start..end, ..]).to_owned(),
            self.prices.slice(ndarray::s![start..end]).to_owned(),
        )
    }
}

/// Per-column standardization fitted once on the training split.
///
/// `transform` is the only way scaled data is produced afterwards; there is
/// deliberately no refit-on-transform path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardScaler {
    means: Array1<f64>,
    stds: Array1<f64>,
}

impl StandardScaler {
    pub fn fit(values: &Array2<f64>) -> Result<Self> {
        if values.nrows() == 0 {
            return Err(TradingError::Data("cannot fit scaler on empty data".into()));
        }
        let n = values.nrows() as f64;
        let means = values.sum_axis(ndarray::Axis(0)) / n;
        let mut stds = Array1::zeros(values.ncols());
        for j in 0..values.ncols() {
            let var = values
                .column(j)
                .iter()
                .map(|v| (v - means[j]).powi(2))
                .sum::<f64>()
                / n;
            // Floor keeps constant columns from dividing by zero.
            stds[j] = var.sqrt().max(1e-8);
        }
        Ok(Self { means, stds })
    }

    pub fn feature_count(&self) -> usize {
        self.means.len()
    }

    pub fn transform(&self, table: &FeatureTable) -> Result<FeatureTable> {
        if table.feature_count() != self.means.len() {
            return Err(TradingError::Config(format!(
                "scaler fitted on {} columns, table has {}",
                self.means.len(),
                table.feature_count()
            )));
        }
        let mut values = table.values.clone();
        for j in 0..values.ncols() {
            let mean = self.means[j];
            let std = self.stds[j];
            values.column_mut(j).mapv_inplace(|v| (v - mean) / std);
        }
        FeatureTable::new(table.names.clone(), values, table.prices.clone())
    }

    pub fn transform_row(&self, row: &Array1<f64>) -> Result<Array1<f64>> {
        if row.len() != self.means.len() {
            return Err(TradingError::Config(format!(
                "scaler fitted on {} columns, row has {}",
                self.means.len(),
                row.len()
            )));
        }
        Ok((row - &self.means) / &self.stds)
    }

    pub fn save(&self, path: &std::path::Path) -> Result<()> {
        let bytes = postcard::to_stdvec(self)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    pub fn load(path: &std::path::Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| {
            TradingError::Checkpoint(format!("scaler bundle {}: {e}", path.display()))
        })?;
        Ok(postcard::from_bytes(&bytes)?)
    }
}
