//! Trend/Seasonality Decomposition Forecaster
//!
//! Models the series as
//!
//! ```text
//! y(t) = g(t) * (1 + s(t) + h(t)) + noise
//! ```
//!
//! Key features:
//! - g: piecewise-linear trend with changepoints spread over the first part of
//!   the history, rate changes shrunk towards zero
//! - s: yearly (365.25 d) and weekly (7 d) Fourier terms
//! - h: national holiday indicators, one column per day offset in the window
//! - MAP-style fit by alternating weighted ridge regressions
//! - Interval by simulation: future rate changes drawn at the historical
//!   changepoint frequency plus observation noise, seeded for repeatability

use std::collections::HashSet;

use chrono::{Duration, NaiveDate};
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Exp, Normal};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::history::future_weeks;
use super::holidays::holidays_between;
use super::{ForecastOutput, Forecaster, ModelKind, encode, not_fitted};
use crate::algo::optim::ridge_solve;
use crate::algo::quantile;
use crate::error::{DewsError, Result};
use crate::series::RegionSeries;

const YEAR_DAYS: f64 = 365.25;
const WEEK_DAYS: f64 = 7.0;
/// Prior scale of trend intercept and base rate
const TREND_PRIOR_SCALE: f64 = 5.0;

/// Shortest series the model will attempt
pub const MIN_OBSERVATIONS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecompositionConfig {
    pub n_changepoints: usize,
    /// Fraction of the history eligible for changepoints
    pub changepoint_range: f64,
    pub changepoint_prior_scale: f64,
    pub seasonality_prior_scale: f64,
    pub holidays_prior_scale: f64,
    pub yearly_order: usize,
    pub weekly_order: usize,
    /// Days before a holiday that carry its effect (non-positive)
    pub holiday_lower_window: i64,
    /// Days after a holiday that carry its effect
    pub holiday_upper_window: i64,
    pub interval_width: f64,
    pub uncertainty_samples: usize,
    /// Alternating trend/seasonality passes
    pub iterations: usize,
    pub seed: u64,
}

impl Default for DecompositionConfig {
    fn default() -> Self {
        Self {
            n_changepoints: 25,
            changepoint_range: 0.8,
            changepoint_prior_scale: 0.05,
            seasonality_prior_scale: 10.0,
            holidays_prior_scale: 10.0,
            yearly_order: 10,
            weekly_order: 3,
            holiday_lower_window: -1,
            holiday_upper_window: 1,
            interval_width: 0.95,
            uncertainty_samples: 1000,
            iterations: 10,
            seed: 42,
        }
    }
}

impl DecompositionConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.interval_width > 0.0 && self.interval_width < 1.0) {
            return Err(DewsError::InvalidConfig(format!(
                "interval_width must lie in (0, 1), got {}",
                self.interval_width
            )));
        }
        if !(self.changepoint_range > 0.0 && self.changepoint_range <= 1.0) {
            return Err(DewsError::InvalidConfig(format!(
                "changepoint_range must lie in (0, 1], got {}",
                self.changepoint_range
            )));
        }
        if self.holiday_lower_window > 0 || self.holiday_upper_window < 0 {
            return Err(DewsError::InvalidConfig(
                "holiday window must contain the holiday itself".into(),
            ));
        }
        let scales = [
            self.changepoint_prior_scale,
            self.seasonality_prior_scale,
            self.holidays_prior_scale,
        ];
        if scales.iter().any(|s| *s <= 0.0) {
            return Err(DewsError::InvalidConfig("prior scales must be positive".into()));
        }
        Ok(())
    }

    fn holiday_offsets(&self) -> impl Iterator<Item = i64> {
        self.holiday_lower_window..=self.holiday_upper_window
    }

    fn seasonal_width(&self) -> usize {
        2 * self.yearly_order + 2 * self.weekly_order + self.holiday_offsets().count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct DecompositionFit {
    start: NaiveDate,
    last_date: NaiveDate,
    /// Days between first and last observation
    t_span: f64,
    y_scale: f64,
    /// Changepoint locations in scaled time
    changepoints: Vec<f64>,
    /// Intercept, base rate, then one rate change per changepoint
    trend: Vec<f64>,
    /// Seasonal then holiday coefficients
    beta: Vec<f64>,
    /// Residual standard deviation in scaled units
    sigma: f64,
}

fn epoch_days(date: NaiveDate) -> f64 {
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default();
    (date - epoch).num_days() as f64
}

fn fourier_terms(days: f64, period: f64, order: usize, out: &mut Vec<f64>) {
    for n in 1..=order {
        let x = std::f64::consts::TAU * n as f64 * days / period;
        out.push(x.sin());
        out.push(x.cos());
    }
}

fn holiday_set(config: &DecompositionConfig, first: NaiveDate, last: NaiveDate) -> HashSet<NaiveDate> {
    let from = first - Duration::days(config.holiday_upper_window);
    let to = last - Duration::days(config.holiday_lower_window);
    holidays_between(from, to).into_iter().collect()
}

/// Seasonal and holiday regressors for one date.
fn seasonal_row(config: &DecompositionConfig, date: NaiveDate, holidays: &HashSet<NaiveDate>) -> Vec<f64> {
    let days = epoch_days(date);
    let mut row = Vec::with_capacity(config.seasonal_width());
    fourier_terms(days, YEAR_DAYS, config.yearly_order, &mut row);
    fourier_terms(days, WEEK_DAYS, config.weekly_order, &mut row);
    for offset in config.holiday_offsets() {
        let hit = holidays.contains(&(date - Duration::days(offset)));
        row.push(if hit { 1.0 } else { 0.0 });
    }
    row
}

fn trend_row(t: f64, changepoints: &[f64]) -> Vec<f64> {
    let mut row = Vec::with_capacity(2 + changepoints.len());
    row.push(1.0);
    row.push(t);
    row.extend(changepoints.iter().map(|c| (t - c).max(0.0)));
    row
}

fn to_matrix(rows: &[Vec<f64>], width: usize) -> DMatrix<f64> {
    DMatrix::from_fn(rows.len(), width, |i, j| rows[i][j])
}

fn scale_rows(matrix: &DMatrix<f64>, factors: &DVector<f64>) -> DMatrix<f64> {
    let mut scaled = matrix.clone();
    for (mut row, f) in scaled.row_iter_mut().zip(factors.iter()) {
        row *= *f;
    }
    scaled
}

impl DecompositionFit {
    fn scaled_time(&self, date: NaiveDate) -> f64 {
        (date - self.start).num_days() as f64 / self.t_span
    }

    fn trend_at(&self, t: f64) -> f64 {
        trend_row(t, &self.changepoints)
            .iter()
            .zip(&self.trend)
            .map(|(x, b)| x * b)
            .sum()
    }

    fn multiplier(&self, row: &[f64]) -> f64 {
        1.0 + row.iter().zip(&self.beta).map(|(x, b)| x * b).sum::<f64>()
    }
}

fn fit_decomposition(config: &DecompositionConfig, series: &RegionSeries) -> Result<DecompositionFit> {
    let dates = series.dates();
    let n = series.len();
    let (Some(start), Some(last_date)) = (series.first_date(), series.last_date()) else {
        return Err(DewsError::insufficient(series.region(), "decomposition", 0, MIN_OBSERVATIONS));
    };

    let y_scale = series
        .values()
        .iter()
        .fold(0.0f64, |m, v| m.max(v.abs()))
        .max(1.0);
    let ys = DVector::from_iterator(n, series.values().iter().map(|v| v / y_scale));
    let t_span = ((last_date - start).num_days() as f64).max(1.0);
    let ts: Vec<f64> = dates
        .iter()
        .map(|d| (*d - start).num_days() as f64 / t_span)
        .collect();

    let hist = ((n as f64 * config.changepoint_range).floor() as usize).max(1);
    let n_cp = config.n_changepoints.min(hist.saturating_sub(1));
    let changepoints: Vec<f64> = (1..=n_cp)
        .map(|j| {
            let idx = (j as f64 * (hist - 1) as f64 / n_cp as f64).round() as usize;
            ts[idx]
        })
        .collect();

    let trend_width = 2 + changepoints.len();
    let trend_design = to_matrix(
        &ts.iter().map(|t| trend_row(*t, &changepoints)).collect::<Vec<_>>(),
        trend_width,
    );
    let holidays = holiday_set(config, start, last_date);
    let seasonal_width = config.seasonal_width();
    let seasonal_design = to_matrix(
        &dates
            .iter()
            .map(|d| seasonal_row(config, *d, &holidays))
            .collect::<Vec<_>>(),
        seasonal_width,
    );
    let n_fourier = 2 * (config.yearly_order + config.weekly_order);

    let mut sigma2 = {
        let mean = ys.mean();
        (ys.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64).max(1e-4)
    };
    let trend_penalty = |sigma2: f64| {
        DVector::from_fn(trend_width, |k, _| {
            let scale = if k < 2 { TREND_PRIOR_SCALE } else { config.changepoint_prior_scale };
            sigma2 / (scale * scale)
        })
    };
    let seasonal_penalty = |sigma2: f64| {
        DVector::from_fn(seasonal_width, |k, _| {
            let scale = if k < n_fourier {
                config.seasonality_prior_scale
            } else {
                config.holidays_prior_scale
            };
            sigma2 / (scale * scale)
        })
    };
    let diverged = || DewsError::convergence("decomposition", "singular normal equations");

    let mut theta = ridge_solve(&trend_design, &ys, None, &trend_penalty(sigma2)).ok_or_else(diverged)?;
    let mut beta = DVector::zeros(seasonal_width);

    for _ in 0..config.iterations.max(1) {
        let g = &trend_design * &theta;
        let weighted = scale_rows(&seasonal_design, &g);
        beta = ridge_solve(&weighted, &(&ys - &g), None, &seasonal_penalty(sigma2)).ok_or_else(diverged)?;

        let multiplier = &seasonal_design * &beta + DVector::from_element(n, 1.0);
        let scaled_trend = scale_rows(&trend_design, &multiplier);
        theta = ridge_solve(&scaled_trend, &ys, None, &trend_penalty(sigma2)).ok_or_else(diverged)?;

        let fitted = (&trend_design * &theta).component_mul(&multiplier);
        sigma2 = ((&ys - fitted).norm_squared() / n as f64).max(1e-10);
    }

    debug!(
        region = %series.region(),
        changepoints = changepoints.len(),
        sigma = sigma2.sqrt(),
        "decomposition fitted"
    );

    Ok(DecompositionFit {
        start,
        last_date,
        t_span,
        y_scale,
        changepoints,
        trend: theta.iter().copied().collect(),
        beta: beta.iter().copied().collect(),
        sigma: sigma2.sqrt(),
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecompositionForecaster {
    config: DecompositionConfig,
    fitted: Option<DecompositionFit>,
}

impl DecompositionForecaster {
    pub fn new(config: DecompositionConfig) -> Self {
        Self {
            config,
            fitted: None,
        }
    }

    fn simulate_band(
        &self,
        fit: &DecompositionFit,
        times: &[f64],
        multipliers: &[f64],
    ) -> Result<(Vec<f64>, Vec<f64>)> {
        let steps = times.len();
        let samples = self.config.uncertainty_samples;
        let mut rng = StdRng::seed_from_u64(self.config.seed);

        let deltas = &fit.trend[2..];
        let laplace_scale = deltas.iter().map(|d| d.abs()).sum::<f64>() / deltas.len().max(1) as f64 + 1e-8;
        let exp = Exp::new(1.0 / laplace_scale)
            .map_err(|e| DewsError::convergence("decomposition", e.to_string()))?;
        let noise = Normal::new(0.0, fit.sigma)
            .map_err(|e| DewsError::convergence("decomposition", e.to_string()))?;
        // Historical changepoint rate per unit of scaled time
        let rate = fit.changepoints.len() as f64;

        let mut draws = vec![Vec::with_capacity(samples); steps];
        for _ in 0..samples {
            let mut prev_t = 1.0;
            let mut slope_shift = 0.0;
            let mut offset_shift = 0.0;
            for (i, (t, mult)) in times.iter().zip(multipliers).enumerate() {
                let p_change = (rate * (t - prev_t)).clamp(0.0, 1.0);
                if rng.random_bool(p_change) {
                    let delta = exp.sample(&mut rng) - exp.sample(&mut rng);
                    slope_shift += delta;
                    offset_shift -= delta * prev_t;
                }
                prev_t = *t;
                let trend = fit.trend_at(*t) + slope_shift * t + offset_shift;
                let value = (trend * mult + noise.sample(&mut rng)) * fit.y_scale;
                draws[i].push(value);
            }
        }

        let lo_q = (1.0 - self.config.interval_width) / 2.0;
        let hi_q = 1.0 - lo_q;
        let lower = draws.iter().map(|d| quantile(d, lo_q)).collect();
        let upper = draws.iter().map(|d| quantile(d, hi_q)).collect();
        Ok((lower, upper))
    }
}

impl Forecaster for DecompositionForecaster {
    fn kind(&self) -> ModelKind {
        ModelKind::Decomposition
    }

    fn is_fitted(&self) -> bool {
        self.fitted.is_some()
    }

    fn fit(&mut self, series: &RegionSeries) -> Result<()> {
        self.config.validate()?;
        if series.len() < MIN_OBSERVATIONS {
            return Err(DewsError::insufficient(
                series.region(),
                "decomposition",
                series.len(),
                MIN_OBSERVATIONS,
            ));
        }
        self.fitted = Some(fit_decomposition(&self.config, series)?);
        Ok(())
    }

    fn predict(&self, steps: usize) -> Result<ForecastOutput> {
        let fit = self
            .fitted
            .as_ref()
            .ok_or_else(|| not_fitted(ModelKind::Decomposition))?;
        if steps == 0 {
            return Ok(ForecastOutput::zeros(0));
        }

        let dates = future_weeks(fit.last_date, steps);
        let holidays = holiday_set(&self.config, dates[0], dates[steps - 1]);
        let times: Vec<f64> = dates.iter().map(|d| fit.scaled_time(*d)).collect();
        let multipliers: Vec<f64> = dates
            .iter()
            .map(|d| fit.multiplier(&seasonal_row(&self.config, *d, &holidays)))
            .collect();
        let point: Vec<f64> = times
            .iter()
            .zip(&multipliers)
            .map(|(t, m)| fit.trend_at(*t) * m * fit.y_scale)
            .collect();

        let (lower, upper) = if self.config.uncertainty_samples == 0 {
            (point.clone(), point.clone())
        } else {
            let (lower, upper) = self.simulate_band(fit, &times, &multipliers)?;
            // A sparse draw can leave the point outside its band
            let lower: Vec<f64> = lower.iter().zip(&point).map(|(l, p)| l.min(*p)).collect();
            let upper: Vec<f64> = upper.iter().zip(&point).map(|(u, p)| u.max(*p)).collect();
            (lower, upper)
        };
        Ok(ForecastOutput::new(point, lower, upper))
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        encode(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forecast::load_forecaster;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn truth(start: NaiveDate, i: usize) -> f64 {
        let d = start + Duration::weeks(i as i64);
        let trend = 100.0 + 0.2 * i as f64;
        let season = 0.3 * (std::f64::consts::TAU * epoch_days(d) / YEAR_DAYS).sin();
        trend * (1.0 + season)
    }

    fn series(weeks: usize) -> RegionSeries {
        let start = date(2018, 1, 1);
        let points = (0..weeks)
            .map(|i| (start + Duration::weeks(i as i64), truth(start, i)))
            .collect();
        RegionSeries::new("PIURA", points).unwrap()
    }

    #[test]
    fn test_recovers_multiplicative_season() {
        let weeks = 209;
        let mut model = DecompositionForecaster::new(DecompositionConfig::default());
        model.fit(&series(weeks)).unwrap();
        let out = model.predict(52).unwrap();

        let start = date(2018, 1, 1);
        let mape: f64 = (0..52)
            .map(|h| {
                let actual = truth(start, weeks + h);
                ((out.point[h] - actual) / actual).abs()
            })
            .sum::<f64>()
            / 52.0;
        assert!(mape < 0.10, "mape {mape}");
    }

    #[test]
    fn test_band_contains_point_and_is_repeatable() {
        let mut model = DecompositionForecaster::new(DecompositionConfig {
            uncertainty_samples: 300,
            ..Default::default()
        });
        model.fit(&series(160)).unwrap();
        let out = model.predict(20).unwrap();
        for i in 0..20 {
            assert!(out.lower[i] <= out.point[i] && out.point[i] <= out.upper[i], "step {i}");
        }
        assert_eq!(model.predict(20).unwrap(), out);
    }

    #[test]
    fn test_holiday_columns_follow_window() {
        let config = DecompositionConfig::default();
        let holidays = holiday_set(&config, date(2024, 7, 1), date(2024, 8, 31));
        let width = 2 * (config.yearly_order + config.weekly_order);

        // Offsets -1, 0, +1: the day before, the holiday, the day after
        let before = seasonal_row(&config, date(2024, 7, 27), &holidays);
        assert_eq!(&before[width..], &[1.0, 0.0, 0.0]);
        let on = seasonal_row(&config, date(2024, 8, 30), &holidays);
        assert_eq!(&on[width..], &[0.0, 1.0, 0.0]);
        let after = seasonal_row(&config, date(2024, 8, 31), &holidays);
        assert_eq!(&after[width..], &[0.0, 0.0, 1.0]);
        let plain = seasonal_row(&config, date(2024, 8, 12), &holidays);
        assert_eq!(&plain[width..], &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_round_trip_through_bytes() {
        let mut model = DecompositionForecaster::new(DecompositionConfig {
            uncertainty_samples: 100,
            ..Default::default()
        });
        model.fit(&series(120)).unwrap();
        let bytes = model.to_bytes().unwrap();
        let restored = load_forecaster(ModelKind::Decomposition, &bytes).unwrap();
        assert_eq!(restored.predict(12).unwrap(), model.predict(12).unwrap());
    }
}
