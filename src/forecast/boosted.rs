//! Gradient-boosted tree forecaster over lag, rolling and calendar features.
//!
//! Key features:
//! - Lags and rolling mean/std are computed from weeks strictly before the
//!   target week, so a training row never sees its own value
//! - Calendar features: ISO week, month, quarter, plus a linear trend index
//! - Recursive multi-step prediction over a pure copy of the history tail

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::history::{WeeklyHistory, extend_history};
use super::{ForecastOutput, Forecaster, ModelKind, encode, not_fitted};
use crate::algo::{GradientBoostedTrees, TreeParams};
use crate::error::{DewsError, Result};
use crate::series::{RegionSeries, mean, sample_std};

/// Training rows required beyond the feature warm-up
const MIN_TRAIN_ROWS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoostedConfig {
    pub lags: Vec<usize>,
    pub windows: Vec<usize>,
    pub n_estimators: usize,
    pub max_depth: usize,
    pub learning_rate: f64,
    pub lambda: f64,
    pub min_child_weight: f64,
    /// Relative half-width of the band
    pub band: f64,
}

impl Default for BoostedConfig {
    fn default() -> Self {
        let trees = TreeParams::default();
        Self {
            lags: vec![1, 2, 4, 8, 12, 26, 52],
            windows: vec![4, 12, 26, 52],
            n_estimators: trees.n_estimators,
            max_depth: trees.max_depth,
            learning_rate: trees.learning_rate,
            lambda: trees.lambda,
            min_child_weight: trees.min_child_weight,
            band: 0.20,
        }
    }
}

impl BoostedConfig {
    pub fn validate(&self) -> Result<()> {
        if self.lags.iter().chain(&self.windows).any(|w| *w == 0) {
            return Err(DewsError::InvalidConfig("gbt lags and windows must be positive".into()));
        }
        if self.n_estimators == 0 || self.learning_rate <= 0.0 {
            return Err(DewsError::InvalidConfig(
                "gbt n_estimators and learning_rate must be positive".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.band) {
            return Err(DewsError::InvalidConfig(format!(
                "gbt band must lie in [0, 1), got {}",
                self.band
            )));
        }
        Ok(())
    }

    pub fn tree_params(&self) -> TreeParams {
        TreeParams {
            n_estimators: self.n_estimators,
            max_depth: self.max_depth,
            learning_rate: self.learning_rate,
            lambda: self.lambda,
            min_child_weight: self.min_child_weight,
        }
    }

    /// Weeks of history a feature row needs.
    pub fn warm_up(&self) -> usize {
        self.lags
            .iter()
            .chain(&self.windows)
            .copied()
            .max()
            .unwrap_or(1)
    }

    pub fn feature_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lags.iter().map(|l| format!("lag_{l}")).collect();
        for w in &self.windows {
            names.push(format!("rolling_mean_{w}"));
            names.push(format!("rolling_std_{w}"));
        }
        names.extend(["week_of_year", "month", "quarter", "trend"].map(String::from));
        names
    }

    /// One (features, target) pair per week after the warm-up.
    fn training_rows(&self, values: &[f64], dates: &[NaiveDate]) -> (Vec<Vec<f64>>, Vec<f64>) {
        (self.warm_up()..values.len())
            .map(|t| (self.feature_row(&values[..t], dates[t], t), values[t]))
            .unzip()
    }

    /// Feature row for the week `date` at series position `index`.
    ///
    /// `prior` ends with the week immediately before `date` and holds at
    /// least `warm_up()` values. Lags and rolling windows are taken from
    /// `prior` alone: the window for week t covers t-w..t-1 and never the
    /// week being predicted.
    fn feature_row(&self, prior: &[f64], date: NaiveDate, index: usize) -> Vec<f64> {
        let n = prior.len();
        let mut row = Vec::with_capacity(self.lags.len() + 2 * self.windows.len() + 4);
        row.extend(self.lags.iter().map(|l| prior[n - l]));
        for w in &self.windows {
            let window = &prior[n - w..];
            row.push(mean(window));
            row.push(sample_std(window));
        }
        row.push(date.iso_week().week() as f64);
        row.push(date.month() as f64);
        row.push(date.month0().div_euclid(3) as f64 + 1.0);
        row.push(index as f64);
        row
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct BoostedFit {
    model: GradientBoostedTrees,
    history: WeeklyHistory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoostedForecaster {
    config: BoostedConfig,
    fitted: Option<BoostedFit>,
}

impl BoostedForecaster {
    pub fn new(config: BoostedConfig) -> Self {
        Self {
            config,
            fitted: None,
        }
    }
}

impl Forecaster for BoostedForecaster {
    fn kind(&self) -> ModelKind {
        ModelKind::Gbt
    }

    fn is_fitted(&self) -> bool {
        self.fitted.is_some()
    }

    fn fit(&mut self, series: &RegionSeries) -> Result<()> {
        self.config.validate()?;
        let warm_up = self.config.warm_up();
        let required = warm_up + MIN_TRAIN_ROWS;
        if series.len() < required {
            return Err(DewsError::insufficient(series.region(), "gbt", series.len(), required));
        }

        let values = series.values();
        let (rows, targets) = self.config.training_rows(values, series.dates());

        let model = GradientBoostedTrees::fit(&rows, &targets, &self.config.tree_params())?;
        debug!(
            region = %series.region(),
            rows = rows.len(),
            trees = model.n_trees(),
            "gbt trained"
        );

        let last_date = series
            .last_date()
            .ok_or_else(|| DewsError::insufficient(series.region(), "gbt", 0, required))?;
        self.fitted = Some(BoostedFit {
            model,
            history: WeeklyHistory::new(values, last_date, warm_up),
        });
        Ok(())
    }

    fn predict(&self, steps: usize) -> Result<ForecastOutput> {
        let fit = self.fitted.as_ref().ok_or_else(|| not_fitted(ModelKind::Gbt))?;

        let mut history = fit.history.clone();
        let mut point = Vec::with_capacity(steps);
        for _ in 0..steps {
            let row = self
                .config
                .feature_row(history.values(), history.next_date(), history.next_index());
            let value = fit.model.predict(&row);
            point.push(value);
            history = extend_history(&history, value);
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
    use crate::forecast::load_forecaster;
    use chrono::Duration;

    fn series(weeks: usize) -> RegionSeries {
        let start = NaiveDate::from_ymd_opt(2019, 1, 7).unwrap();
        let points = (0..weeks)
            .map(|i| {
                let season = (std::f64::consts::TAU * i as f64 / 52.0).sin();
                (start + Duration::weeks(i as i64), 80.0 + 30.0 * season)
            })
            .collect();
        RegionSeries::new("TUMBES", points).unwrap()
    }

    #[test]
    fn test_feature_row_uses_prior_weeks_only() {
        let config = BoostedConfig {
            lags: vec![1, 3],
            windows: vec![2],
            ..Default::default()
        };
        let prior = [1.0, 2.0, 3.0, 4.0];
        let date = NaiveDate::from_ymd_opt(2024, 5, 6).unwrap();
        let row = config.feature_row(&prior, date, 4);

        assert_eq!(row[0], 4.0);
        assert_eq!(row[1], 2.0);
        assert!((row[2] - 3.5).abs() < 1e-12);
        assert!((row[3] - 0.5f64.sqrt()).abs() < 1e-12);
        assert_eq!(&row[4..], &[19.0, 5.0, 2.0, 4.0]);
        assert_eq!(row.len(), config.feature_names().len());
    }

    #[test]
    fn test_target_week_not_in_its_features() {
        let config = BoostedConfig {
            lags: vec![1, 2],
            windows: vec![3],
            ..Default::default()
        };
        let start = NaiveDate::from_ymd_opt(2023, 1, 2).unwrap();
        let dates: Vec<NaiveDate> = (0..8).map(|w| start + Duration::weeks(w)).collect();
        let mut values = vec![5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0, 12.0];
        let (rows, targets) = config.training_rows(&values, &dates);
        assert_eq!(rows.len(), 8 - config.warm_up());

        // Spike the week at position 5; its own row must not move
        values[5] = 500.0;
        let (spiked, spiked_targets) = config.training_rows(&values, &dates);
        let i = 5 - config.warm_up();
        assert_eq!(spiked[i], rows[i]);
        assert_eq!(spiked_targets[i], 500.0);
        assert_ne!(targets[i], spiked_targets[i]);
        // Rolling mean of week 5 is weeks 2..=4
        assert!((rows[i][2] - 8.0).abs() < 1e-12);
        // The following week sees it through lag 1
        assert_eq!(spiked[i + 1][0], 500.0);
    }

    #[test]
    fn test_warm_up_gate() {
        let mut model = BoostedForecaster::new(BoostedConfig::default());
        let err = model.fit(&series(60)).unwrap_err();
        assert!(matches!(err, DewsError::InsufficientData { required: 62, .. }));
    }

    #[test]
    fn test_forecast_tracks_season_and_reloads() {
        let mut model = BoostedForecaster::new(BoostedConfig::default());
        model.fit(&series(208)).unwrap();
        let out = model.predict(26).unwrap();
        assert_eq!(out.len(), 26);
        assert!(out.point.iter().all(|p| (30.0..=130.0).contains(p)));
        for i in 0..26 {
            assert!((out.upper[i] - out.point[i] * 1.2).abs() < 1e-9);
        }

        let restored = load_forecaster(ModelKind::Gbt, &model.to_bytes().unwrap()).unwrap();
        assert_eq!(restored.predict(26).unwrap(), out);
        assert_eq!(model.predict(26).unwrap(), out);
    }
}
