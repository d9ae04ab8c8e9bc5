//! Forecasting Model Set
//!
//! Four independently trained per-region forecasters behind one contract:
//! - `fit` consumes an ordered weekly series for one region
//! - `predict(steps)` returns point, lower and upper arrays of length `steps`,
//!   clipped at zero, without mutating the trained state
//!
//! Predicting before fitting is a `ModelNotFitted` error. A fitted model
//! serializes to bytes that `load_forecaster` turns back into the same model.

pub mod boosted;
pub mod decomposition;
pub mod ensemble;
pub mod history;
pub mod holidays;
pub mod metrics;
pub mod sarima;
pub mod sequence;

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::config::ForecastConfig;
use crate::error::{DewsError, Result};
use crate::series::RegionSeries;
use crate::signal::ForecastPoint;

pub use boosted::BoostedForecaster;
pub use decomposition::DecompositionForecaster;
pub use ensemble::EnsembleForecaster;
pub use sarima::SarimaForecaster;
pub use sequence::SequenceForecaster;

/// Name of the synthetic ensemble pseudo-model in forecast outputs
pub const ENSEMBLE_NAME: &str = "ensemble";

/// The four forecaster families
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// Seasonal ARIMA with automatic order selection
    Sarima,
    /// Piecewise trend with multiplicative seasonality and holidays
    Decomposition,
    /// Stacked recurrent network over a fixed lookback window
    Lstm,
    /// Gradient-boosted trees over lag, rolling and calendar features
    Gbt,
}

impl ModelKind {
    pub const ALL: [ModelKind; 4] = [Self::Sarima, Self::Decomposition, Self::Lstm, Self::Gbt];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Sarima => "sarima",
            Self::Decomposition => "decomposition",
            Self::Lstm => "lstm",
            Self::Gbt => "gbt",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Point forecast with its band, all values non-negative
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastOutput {
    pub point: Vec<f64>,
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
}

impl ForecastOutput {
    /// Build from raw model output, clipping negatives to zero.
    pub fn new(point: Vec<f64>, lower: Vec<f64>, upper: Vec<f64>) -> Self {
        let clip = |v: Vec<f64>| v.into_iter().map(|x| x.max(0.0)).collect();
        Self {
            point: clip(point),
            lower: clip(lower),
            upper: clip(upper),
        }
    }

    /// Band of `point * (1 -/+ fraction)`.
    pub fn with_relative_band(point: Vec<f64>, fraction: f64) -> Self {
        let lower = point.iter().map(|p| p * (1.0 - fraction)).collect();
        let upper = point.iter().map(|p| p * (1.0 + fraction)).collect();
        Self::new(point, lower, upper)
    }

    pub fn zeros(steps: usize) -> Self {
        Self {
            point: vec![0.0; steps],
            lower: vec![0.0; steps],
            upper: vec![0.0; steps],
        }
    }

    pub fn len(&self) -> usize {
        self.point.len()
    }

    pub fn is_empty(&self) -> bool {
        self.point.is_empty()
    }

    /// Flatten into one `ForecastPoint` per target week.
    pub fn to_points(&self, region: &str, model_name: &str, dates: &[NaiveDate]) -> Vec<ForecastPoint> {
        dates
            .iter()
            .enumerate()
            .map(|(i, date)| ForecastPoint {
                region: region.to_string(),
                target_week_date: *date,
                model_name: model_name.to_string(),
                point_estimate: self.point[i],
                lower_bound: self.lower[i],
                upper_bound: self.upper[i],
            })
            .collect()
    }
}

/// Uniform contract for every forecaster
pub trait Forecaster: Send + Sync {
    fn kind(&self) -> ModelKind;

    fn is_fitted(&self) -> bool;

    fn fit(&mut self, series: &RegionSeries) -> Result<()>;

    /// Forecast `steps` weeks past the end of the training series.
    fn predict(&self, steps: usize) -> Result<ForecastOutput>;

    /// Serialized model state (hyperparameters, parameters, history tail)
    fn to_bytes(&self) -> Result<Vec<u8>>;
}

/// Build an unfitted forecaster of the given kind.
pub fn build_forecaster(kind: ModelKind, config: &ForecastConfig) -> Box<dyn Forecaster> {
    match kind {
        ModelKind::Sarima => Box::new(SarimaForecaster::new(config.sarima.clone())),
        ModelKind::Decomposition => {
            Box::new(DecompositionForecaster::new(config.decomposition.clone()))
        }
        ModelKind::Lstm => Box::new(SequenceForecaster::new(config.lstm.clone())),
        ModelKind::Gbt => Box::new(BoostedForecaster::new(config.gbt.clone())),
    }
}

/// Rebuild a forecaster from bytes produced by [`Forecaster::to_bytes`].
pub fn load_forecaster(kind: ModelKind, bytes: &[u8]) -> Result<Box<dyn Forecaster>> {
    Ok(match kind {
        ModelKind::Sarima => Box::new(decode::<SarimaForecaster>(bytes)?),
        ModelKind::Decomposition => Box::new(decode::<DecompositionForecaster>(bytes)?),
        ModelKind::Lstm => Box::new(decode::<SequenceForecaster>(bytes)?),
        ModelKind::Gbt => Box::new(decode::<BoostedForecaster>(bytes)?),
    })
}

pub(crate) fn encode<T: Serialize>(model: &T) -> Result<Vec<u8>> {
    bincode::serialize(model).map_err(|e| DewsError::Serialization(e.to_string()))
}

pub(crate) fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| DewsError::Deserialization(e.to_string()))
}

pub(crate) fn not_fitted(kind: ModelKind) -> DewsError {
    DewsError::ModelNotFitted(kind.name().to_string())
}
