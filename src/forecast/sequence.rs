//! Recurrent sequence forecaster.
//!
//! Min-max scales the series, trains a stacked LSTM on sliding windows of
//! `lookback` weeks and forecasts recursively: each prediction is appended to
//! the window that produces the next one. The band is a fixed fraction of
//! the point estimate.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::history::slide_window;
use super::{ForecastOutput, Forecaster, ModelKind, encode, not_fitted};
use crate::algo::{LstmNetwork, LstmParams, MinMaxScaler};
use crate::error::{DewsError, Result};
use crate::series::RegionSeries;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceConfig {
    /// Weeks of history per training window
    pub lookback: usize,
    /// Relative half-width of the band
    pub band: f64,
    pub hidden: usize,
    pub layers: usize,
    pub dropout: f64,
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub patience: usize,
    pub clip_norm: f64,
    pub seed: u64,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        let net = LstmParams::default();
        Self {
            lookback: 52,
            band: 0.15,
            hidden: net.hidden,
            layers: net.layers,
            dropout: net.dropout,
            epochs: net.epochs,
            batch_size: net.batch_size,
            learning_rate: net.learning_rate,
            patience: net.patience,
            clip_norm: net.clip_norm,
            seed: net.seed,
        }
    }
}

impl SequenceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.lookback == 0 || self.hidden == 0 || self.layers == 0 {
            return Err(DewsError::InvalidConfig(
                "lstm lookback, hidden and layers must be positive".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(DewsError::InvalidConfig(format!(
                "lstm dropout must lie in [0, 1), got {}",
                self.dropout
            )));
        }
        if !(0.0..1.0).contains(&self.band) {
            return Err(DewsError::InvalidConfig(format!(
                "lstm band must lie in [0, 1), got {}",
                self.band
            )));
        }
        if self.learning_rate <= 0.0 || self.batch_size == 0 {
            return Err(DewsError::InvalidConfig(
                "lstm learning_rate and batch_size must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn network_params(&self) -> LstmParams {
        LstmParams {
            hidden: self.hidden,
            layers: self.layers,
            dropout: self.dropout,
            epochs: self.epochs,
            batch_size: self.batch_size,
            learning_rate: self.learning_rate,
            patience: self.patience,
            clip_norm: self.clip_norm,
            seed: self.seed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SequenceFit {
    network: LstmNetwork,
    scaler: MinMaxScaler,
    /// Last `lookback` scaled values of the training series
    window: Vec<f64>,
}

/// Sliding (window, next value) pairs.
fn training_windows(scaled: &[f64], lookback: usize) -> (Vec<Vec<f64>>, Vec<f64>) {
    scaled
        .windows(lookback + 1)
        .map(|w| (w[..lookback].to_vec(), w[lookback]))
        .unzip()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceForecaster {
    config: SequenceConfig,
    fitted: Option<SequenceFit>,
}

impl SequenceForecaster {
    pub fn new(config: SequenceConfig) -> Self {
        Self {
            config,
            fitted: None,
        }
    }
}

impl Forecaster for SequenceForecaster {
    fn kind(&self) -> ModelKind {
        ModelKind::Lstm
    }

    fn is_fitted(&self) -> bool {
        self.fitted.is_some()
    }

    fn fit(&mut self, series: &RegionSeries) -> Result<()> {
        self.config.validate()?;
        let lookback = self.config.lookback;
        if series.len() <= lookback {
            return Err(DewsError::insufficient(
                series.region(),
                "lstm",
                series.len(),
                lookback + 1,
            ));
        }

        let scaler = MinMaxScaler::fit(series.values());
        let scaled: Vec<f64> = series.values().iter().map(|v| scaler.transform(*v)).collect();
        let (windows, targets) = training_windows(&scaled, lookback);

        let params = self.config.network_params();
        let mut network = LstmNetwork::new(params.hidden, params.layers, params.seed);
        let report = network.fit(&windows, &targets, &params)?;
        debug!(
            region = %series.region(),
            samples = windows.len(),
            epochs = report.epochs_run,
            loss = report.best_loss,
            "lstm trained"
        );

        self.fitted = Some(SequenceFit {
            network,
            scaler,
            window: scaled[scaled.len() - lookback..].to_vec(),
        });
        Ok(())
    }

    fn predict(&self, steps: usize) -> Result<ForecastOutput> {
        let fit = self.fitted.as_ref().ok_or_else(|| not_fitted(ModelKind::Lstm))?;

        let mut window = fit.window.clone();
        let mut point = Vec::with_capacity(steps);
        for _ in 0..steps {
            let next = fit.network.predict(&window);
            point.push(fit.scaler.inverse(next));
            window = slide_window(&window, next);
        }
        Ok(ForecastOutput::with_relative_band(point, self.config.band))
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        encode(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};

    fn small_config() -> SequenceConfig {
        SequenceConfig {
            lookback: 8,
            hidden: 6,
            layers: 1,
            dropout: 0.0,
            epochs: 5,
            batch_size: 8,
            learning_rate: 0.01,
            ..Default::default()
        }
    }

    fn series(values: &[f64]) -> RegionSeries {
        let start = NaiveDate::from_ymd_opt(2021, 1, 4).unwrap();
        let points = values
            .iter()
            .enumerate()
            .map(|(i, v)| (start + Duration::weeks(i as i64), *v))
            .collect();
        RegionSeries::new("LIMA", points).unwrap()
    }

    #[test]
    fn test_training_windows() {
        let (x, y) = training_windows(&[0.0, 1.0, 2.0, 3.0], 2);
        assert_eq!(x, vec![vec![0.0, 1.0], vec![1.0, 2.0]]);
        assert_eq!(y, vec![2.0, 3.0]);
    }

    #[test]
    fn test_short_series_is_insufficient() {
        let mut model = SequenceForecaster::new(small_config());
        let err = model.fit(&series(&[1.0; 8])).unwrap_err();
        assert!(matches!(err, DewsError::InsufficientData { rows: 8, required: 9, .. }));
        assert!(!model.is_fitted());
    }

    #[test]
    fn test_band_and_purity() {
        let values: Vec<f64> = (0..60).map(|i| 50.0 + 20.0 * ((i as f64) * 0.5).sin()).collect();
        let mut model = SequenceForecaster::new(small_config());
        model.fit(&series(&values)).unwrap();

        let first = model.predict(10).unwrap();
        let second = model.predict(10).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 10);
        for i in 0..10 {
            assert!((first.lower[i] - first.point[i] * 0.85).abs() < 1e-9);
            assert!((first.upper[i] - first.point[i] * 1.15).abs() < 1e-9);
        }
    }

    #[test]
    fn test_constant_series_forecasts_constant() {
        // Zero range scales everything to 0 and inverts back to the constant
        let mut model = SequenceForecaster::new(small_config());
        model.fit(&series(&[30.0; 20])).unwrap();
        let fit = model.fitted.as_ref().unwrap();
        assert!(fit.window.iter().all(|v| *v == 0.0));
        let out = model.predict(4).unwrap();
        assert!(out.point.iter().all(|p| (*p - 30.0).abs() < 1e-9));
    }
}
