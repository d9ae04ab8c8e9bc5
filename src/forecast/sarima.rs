//! Seasonal ARIMA with automatic order selection.
//!
//! Key features:
//! - Differencing orders picked from autocorrelation (lag 1 for `d`, lag `s`
//!   for `D`) before the ARMA search
//! - Stepwise AIC search over (p, q, P, Q) in the bounded space, starting
//!   from the usual seed models and walking to improving neighbours
//! - Conditional-sum-of-squares fit by Levenberg-Marquardt; non-stationary or
//!   non-invertible fits are rejected
//! - Prediction intervals from the psi-weights of the integrated model
//!
//! The fitted state keeps only the raw and residual tails needed to run the
//! recursion forward, so prediction never touches the training series.

use std::collections::HashSet;
use std::fmt;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use tracing::debug;

use super::{ForecastOutput, Forecaster, ModelKind, encode, not_fitted};
use crate::algo::optim::fit_least_squares;
use crate::error::{DewsError, Result};
use crate::series::RegionSeries;

/// Shortest series the model will attempt
pub const MIN_OBSERVATIONS: usize = 20;

const DIFFERENCING_ACF: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SarimaConfig {
    pub max_p: usize,
    pub max_q: usize,
    pub max_seasonal_p: usize,
    pub max_seasonal_q: usize,
    pub max_d: usize,
    pub max_seasonal_d: usize,
    /// Seasonal period in weeks
    pub period: usize,
    /// Interval coverage
    pub confidence: f64,
    /// Upper bound on candidate models evaluated by the stepwise search
    pub max_models: usize,
}

impl Default for SarimaConfig {
    fn default() -> Self {
        Self {
            max_p: 3,
            max_q: 3,
            max_seasonal_p: 2,
            max_seasonal_q: 2,
            max_d: 2,
            max_seasonal_d: 1,
            period: 52,
            confidence: 0.95,
            max_models: 30,
        }
    }
}

/// (p, d, q)(P, D, Q)[s]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SarimaOrder {
    pub p: usize,
    pub d: usize,
    pub q: usize,
    pub seasonal_p: usize,
    pub seasonal_d: usize,
    pub seasonal_q: usize,
    pub period: usize,
}

impl SarimaOrder {
    fn with_mean(&self) -> bool {
        self.d + self.seasonal_d == 0
    }

    fn n_params(&self) -> usize {
        self.p + self.q + self.seasonal_p + self.seasonal_q + usize::from(self.with_mean())
    }
}

impl fmt::Display for SarimaOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({},{},{})({},{},{})[{}]",
            self.p, self.d, self.q, self.seasonal_p, self.seasonal_d, self.seasonal_q, self.period
        )
    }
}

/// Fitted coefficients plus the tails needed to forecast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SarimaFit {
    pub order: SarimaOrder,
    pub ar: Vec<f64>,
    pub ma: Vec<f64>,
    pub seasonal_ar: Vec<f64>,
    pub seasonal_ma: Vec<f64>,
    pub mean: f64,
    pub sigma2: f64,
    pub aic: f64,
    raw_tail: Vec<f64>,
    resid_tail: Vec<f64>,
}

impl SarimaFit {
    fn ar_polynomial(&self) -> Vec<f64> {
        poly_mul(
            &lag_polynomial(&self.ar, 1, -1.0),
            &lag_polynomial(&self.seasonal_ar, self.order.period, -1.0),
        )
    }

    fn ma_polynomial(&self) -> Vec<f64> {
        poly_mul(
            &lag_polynomial(&self.ma, 1, 1.0),
            &lag_polynomial(&self.seasonal_ma, self.order.period, 1.0),
        )
    }

    /// AR polynomial of the integrated model, differencing included
    fn integrated_ar(&self) -> Vec<f64> {
        poly_mul(&self.ar_polynomial(), &difference_polynomial(&self.order))
    }

    pub fn forecast(&self, steps: usize, confidence: f64) -> Result<ForecastOutput> {
        let full_ar = self.integrated_ar();
        let ma_poly = self.ma_polynomial();
        let ar_terms = nonzero_terms(&full_ar);
        let ma_terms = nonzero_terms(&ma_poly);

        let mut y: Vec<f64> = self.raw_tail.iter().map(|v| v - self.mean).collect();
        let mut e = self.resid_tail.clone();
        let mut point = Vec::with_capacity(steps);
        for _ in 0..steps {
            let (t, te) = (y.len(), e.len());
            let mut v = 0.0;
            for (k, c) in &ar_terms {
                v -= c * y[t - k];
            }
            for (m, c) in &ma_terms {
                v += c * e[te - m];
            }
            y.push(v);
            e.push(0.0);
            point.push(v + self.mean);
        }

        let psi = psi_weights(&full_ar, &ma_poly, steps);
        let normal = Normal::new(0.0, 1.0)
            .map_err(|e| DewsError::convergence("sarima", e.to_string()))?;
        let z = normal.inverse_cdf(0.5 + confidence / 2.0);

        let mut cumulative = 0.0;
        let mut lower = Vec::with_capacity(steps);
        let mut upper = Vec::with_capacity(steps);
        for (h, p) in point.iter().enumerate() {
            cumulative += psi[h] * psi[h];
            let half = z * (self.sigma2 * cumulative).sqrt();
            lower.push(p - half);
            upper.push(p + half);
        }

        Ok(ForecastOutput::new(point, lower, upper))
    }
}

/// 1 + sign * sum(c_i B^(lag * i))
fn lag_polynomial(coefs: &[f64], lag: usize, sign: f64) -> Vec<f64> {
    let mut poly = vec![0.0; coefs.len() * lag + 1];
    poly[0] = 1.0;
    for (i, c) in coefs.iter().enumerate() {
        poly[(i + 1) * lag] = sign * c;
    }
    poly
}

fn poly_mul(a: &[f64], b: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; a.len() + b.len() - 1];
    for (i, x) in a.iter().enumerate() {
        if *x == 0.0 {
            continue;
        }
        for (j, y) in b.iter().enumerate() {
            out[i + j] += x * y;
        }
    }
    out
}

/// (1 - B)^d (1 - B^s)^D
fn difference_polynomial(order: &SarimaOrder) -> Vec<f64> {
    let mut poly = vec![1.0];
    for _ in 0..order.d {
        poly = poly_mul(&poly, &[1.0, -1.0]);
    }
    for _ in 0..order.seasonal_d {
        poly = poly_mul(&poly, &lag_polynomial(&[1.0], order.period, -1.0));
    }
    poly
}

/// Non-zero coefficients past the leading 1, as (lag, coefficient)
fn nonzero_terms(poly: &[f64]) -> Vec<(usize, f64)> {
    poly.iter()
        .enumerate()
        .skip(1)
        .filter(|(_, c)| **c != 0.0)
        .map(|(k, c)| (k, *c))
        .collect()
}

fn psi_weights(full_ar: &[f64], ma_poly: &[f64], count: usize) -> Vec<f64> {
    let mut psi = Vec::with_capacity(count);
    for j in 0..count {
        if j == 0 {
            psi.push(1.0);
            continue;
        }
        let mut v = ma_poly.get(j).copied().unwrap_or(0.0);
        for k in 1..=j.min(full_ar.len() - 1) {
            v -= full_ar[k] * psi[j - k];
        }
        psi.push(v);
    }
    psi
}

fn diff(values: &[f64], lag: usize) -> Vec<f64> {
    if values.len() <= lag {
        return Vec::new();
    }
    (lag..values.len()).map(|t| values[t] - values[t - lag]).collect()
}

pub fn autocorrelation(values: &[f64], lag: usize) -> f64 {
    let n = values.len();
    if lag == 0 || n <= lag {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    let denom: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
    if denom <= f64::EPSILON {
        return 0.0;
    }
    let num: f64 = (lag..n)
        .map(|t| (values[t] - mean) * (values[t - lag] - mean))
        .sum();
    num / denom
}

/// Difference until the lag-1 autocorrelation drops below threshold.
pub fn choose_d(values: &[f64], max_d: usize) -> usize {
    let mut x = values.to_vec();
    let mut d = 0;
    while d < max_d && x.len() > 2 && autocorrelation(&x, 1) > DIFFERENCING_ACF {
        x = diff(&x, 1);
        d += 1;
    }
    d
}

fn choose_seasonal_d(values: &[f64], d: usize, period: usize, max_seasonal_d: usize) -> usize {
    if max_seasonal_d == 0 || period < 2 {
        return 0;
    }
    let mut x = values.to_vec();
    for _ in 0..d {
        x = diff(&x, 1);
    }
    if x.len() >= 2 * period + 10 && autocorrelation(&x, period) > DIFFERENCING_ACF {
        1
    } else {
        0
    }
}

/// Polynomial 1 - sum(c_i z^i) has all roots outside the unit circle.
fn is_stationary(coefs: &[f64]) -> bool {
    let p = coefs.len();
    if p == 0 {
        return true;
    }
    let companion = DMatrix::from_fn(p, p, |i, j| {
        if i == 0 {
            coefs[j]
        } else if i == j + 1 {
            1.0
        } else {
            0.0
        }
    });
    companion
        .complex_eigenvalues()
        .iter()
        .all(|ev| ev.norm() < 1.0)
}

fn is_invertible(coefs: &[f64]) -> bool {
    let negated: Vec<f64> = coefs.iter().map(|c| -c).collect();
    is_stationary(&negated)
}

fn apply_difference(values: &[f64], order: &SarimaOrder) -> Vec<f64> {
    let mut w = values.to_vec();
    for _ in 0..order.d {
        w = diff(&w, 1);
    }
    for _ in 0..order.seasonal_d {
        w = diff(&w, order.period);
    }
    w
}

struct Split<'a> {
    ar: &'a [f64],
    ma: &'a [f64],
    seasonal_ar: &'a [f64],
    seasonal_ma: &'a [f64],
    mean: f64,
}

fn split_params<'a>(params: &'a [f64], order: &SarimaOrder) -> Split<'a> {
    let (ar, rest) = params.split_at(order.p);
    let (ma, rest) = rest.split_at(order.q);
    let (seasonal_ar, rest) = rest.split_at(order.seasonal_p);
    let (seasonal_ma, rest) = rest.split_at(order.seasonal_q);
    Split {
        ar,
        ma,
        seasonal_ar,
        seasonal_ma,
        mean: rest.first().copied().unwrap_or(0.0),
    }
}

fn css_residuals(w: &[f64], order: &SarimaOrder, params: &[f64]) -> Vec<f64> {
    let s = split_params(params, order);
    let ar_poly = poly_mul(
        &lag_polynomial(s.ar, 1, -1.0),
        &lag_polynomial(s.seasonal_ar, order.period, -1.0),
    );
    let ma_poly = poly_mul(
        &lag_polynomial(s.ma, 1, 1.0),
        &lag_polynomial(s.seasonal_ma, order.period, 1.0),
    );
    let ar_terms = nonzero_terms(&ar_poly);
    let ma_terms = nonzero_terms(&ma_poly);
    let start = ar_poly.len() - 1;

    let n = w.len().saturating_sub(start);
    let mut e = vec![0.0; n];
    for idx in 0..n {
        let t = idx + start;
        let mut v = w[t] - s.mean;
        for (k, c) in &ar_terms {
            v += c * (w[t - k] - s.mean);
        }
        for (m, c) in &ma_terms {
            if idx >= *m {
                v -= c * e[idx - m];
            }
        }
        e[idx] = v;
    }
    e
}

/// Fit one fixed order by conditional sum of squares.
///
/// Returns `None` when the series is too short for the order, the optimiser
/// fails, or the fit is non-stationary / non-invertible.
pub fn fit_order(values: &[f64], order: SarimaOrder) -> Option<SarimaFit> {
    let w = apply_difference(values, &order);
    let start = order.p + order.seasonal_p * order.period;
    let n_params = order.n_params();
    let n_eff = w.len().checked_sub(start)?;
    if n_eff < n_params + 10 {
        return None;
    }

    let mut initial = vec![0.0; n_params];
    if order.with_mean() {
        initial[n_params - 1] = w.iter().sum::<f64>() / w.len() as f64;
    }
    let fit = fit_least_squares(&initial, |p| Some(css_residuals(&w, &order, p)))?;
    let s = split_params(&fit.params, &order);
    if !(is_stationary(s.ar)
        && is_stationary(s.seasonal_ar)
        && is_invertible(s.ma)
        && is_invertible(s.seasonal_ma))
    {
        return None;
    }

    let residuals = css_residuals(&w, &order, &fit.params);
    let sse = fit.sse.max(1e-12);
    let sigma2 = sse / n_eff as f64;
    let aic = n_eff as f64 * sigma2.ln() + 2.0 * (n_params + 1) as f64;

    let mut model = SarimaFit {
        order,
        ar: s.ar.to_vec(),
        ma: s.ma.to_vec(),
        seasonal_ar: s.seasonal_ar.to_vec(),
        seasonal_ma: s.seasonal_ma.to_vec(),
        mean: s.mean,
        sigma2,
        aic,
        raw_tail: Vec::new(),
        resid_tail: Vec::new(),
    };

    let ar_len = model.integrated_ar().len() - 1;
    let ma_len = model.ma_polynomial().len() - 1;
    model.raw_tail = values[values.len().saturating_sub(ar_len)..].to_vec();
    let mut resid_tail = vec![0.0; ma_len.saturating_sub(residuals.len())];
    resid_tail.extend_from_slice(&residuals[residuals.len().saturating_sub(ma_len)..]);
    model.resid_tail = resid_tail;

    Some(model)
}

/// Stepwise AIC search over the ARMA orders for fixed differencing.
pub fn auto_fit(values: &[f64], config: &SarimaConfig) -> Result<SarimaFit> {
    let d = choose_d(values, config.max_d);
    let seasonal_d = choose_seasonal_d(values, d, config.period, config.max_seasonal_d);
    let seasonal = config.period >= 2;

    let make = |p: usize, q: usize, sp: usize, sq: usize| SarimaOrder {
        p: p.min(config.max_p),
        d,
        q: q.min(config.max_q),
        seasonal_p: if seasonal { sp.min(config.max_seasonal_p) } else { 0 },
        seasonal_d,
        seasonal_q: if seasonal { sq.min(config.max_seasonal_q) } else { 0 },
        period: config.period.max(1),
    };

    let mut visited: HashSet<SarimaOrder> = HashSet::new();
    let mut best: Option<SarimaFit> = None;
    let mut evaluated = 0;

    let mut consider = |order: SarimaOrder, best: &mut Option<SarimaFit>| -> bool {
        if evaluated >= config.max_models || !visited.insert(order) {
            return false;
        }
        evaluated += 1;
        let Some(fit) = fit_order(values, order) else {
            return false;
        };
        debug!(order = %order, aic = fit.aic, "sarima candidate");
        if best.as_ref().is_none_or(|b| fit.aic < b.aic) {
            *best = Some(fit);
            true
        } else {
            false
        }
    };

    for (p, q, sp, sq) in [(2, 2, 1, 1), (0, 0, 0, 0), (1, 0, 1, 0), (0, 1, 0, 1)] {
        consider(make(p, q, sp, sq), &mut best);
    }

    loop {
        let Some(current) = best.as_ref().map(|b| b.order) else {
            break;
        };
        let mut improved = false;
        for (dp, dq, dsp, dsq) in [
            (1, 0, 0, 0),
            (-1, 0, 0, 0),
            (0, 1, 0, 0),
            (0, -1, 0, 0),
            (0, 0, 1, 0),
            (0, 0, -1, 0),
            (0, 0, 0, 1),
            (0, 0, 0, -1),
            (1, 1, 0, 0),
            (-1, -1, 0, 0),
            (0, 0, 1, 1),
            (0, 0, -1, -1),
        ] {
            let step = |v: usize, delta: i32| v.checked_add_signed(delta as isize);
            let (Some(p), Some(q), Some(sp), Some(sq)) = (
                step(current.p, dp),
                step(current.q, dq),
                step(current.seasonal_p, dsp),
                step(current.seasonal_q, dsq),
            ) else {
                continue;
            };
            if p > config.max_p
                || q > config.max_q
                || sp > config.max_seasonal_p
                || sq > config.max_seasonal_q
            {
                continue;
            }
            if consider(make(p, q, sp, sq), &mut best) {
                improved = true;
                break;
            }
        }
        if !improved {
            break;
        }
    }

    best.ok_or_else(|| DewsError::convergence("sarima", "no candidate order could be fitted"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SarimaForecaster {
    config: SarimaConfig,
    fitted: Option<SarimaFit>,
}

impl SarimaForecaster {
    pub fn new(config: SarimaConfig) -> Self {
        Self {
            config,
            fitted: None,
        }
    }

    pub fn fitted(&self) -> Option<&SarimaFit> {
        self.fitted.as_ref()
    }
}

impl Forecaster for SarimaForecaster {
    fn kind(&self) -> ModelKind {
        ModelKind::Sarima
    }

    fn is_fitted(&self) -> bool {
        self.fitted.is_some()
    }

    fn fit(&mut self, series: &RegionSeries) -> Result<()> {
        if series.len() < MIN_OBSERVATIONS {
            return Err(DewsError::insufficient(
                series.region(),
                "sarima",
                series.len(),
                MIN_OBSERVATIONS,
            ));
        }
        let fit = auto_fit(series.values(), &self.config)?;
        debug!(region = %series.region(), order = %fit.order, aic = fit.aic, "sarima order selected");
        self.fitted = Some(fit);
        Ok(())
    }

    fn predict(&self, steps: usize) -> Result<ForecastOutput> {
        let fit = self.fitted.as_ref().ok_or_else(|| not_fitted(ModelKind::Sarima))?;
        fit.forecast(steps, self.config.confidence)
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        encode(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal as NormalDist};

    fn ar1(n: usize, phi: f64, mean: f64, seed: u64) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let noise = NormalDist::new(0.0, 1.0).unwrap();
        let mut x = 0.0;
        (0..n)
            .map(|_| {
                x = phi * x + noise.sample(&mut rng);
                mean + x
            })
            .collect()
    }

    fn seasonal_series(weeks: usize) -> RegionSeries {
        let mut rng = StdRng::seed_from_u64(17);
        let noise = NormalDist::new(0.0, 3.0).unwrap();
        let start = NaiveDate::from_ymd_opt(2018, 1, 1).unwrap();
        let points = (0..weeks)
            .map(|i| {
                let season = 30.0 * (i as f64 * std::f64::consts::TAU / 52.0).sin();
                let v = (80.0 + season + noise.sample(&mut rng)).max(0.0);
                (start + Duration::weeks(i as i64), v.round())
            })
            .collect();
        RegionSeries::new("LORETO", points).unwrap()
    }

    fn order(p: usize, d: usize, q: usize) -> SarimaOrder {
        SarimaOrder {
            p,
            d,
            q,
            seasonal_p: 0,
            seasonal_d: 0,
            seasonal_q: 0,
            period: 52,
        }
    }

    #[test]
    fn test_polynomial_product() {
        let poly = poly_mul(&lag_polynomial(&[0.5], 1, -1.0), &lag_polynomial(&[0.3], 2, -1.0));
        let expected = [1.0, -0.5, -0.3, 0.15];
        for (a, b) in poly.iter().zip(expected) {
            assert!((a - b).abs() < 1e-12);
        }
        assert_eq!(difference_polynomial(&order(0, 2, 0)), vec![1.0, -2.0, 1.0]);
    }

    #[test]
    fn test_stationarity_check() {
        assert!(is_stationary(&[0.5]));
        assert!(!is_stationary(&[1.2]));
        assert!(is_stationary(&[1.5, -0.6]));
        assert!(!is_stationary(&[0.5, 0.6]));
        assert!(is_invertible(&[-0.8]));
    }

    #[test]
    fn test_ar1_coefficient_recovered() {
        let values = ar1(600, 0.6, 10.0, 1);
        let fit = fit_order(&values, order(1, 0, 0)).unwrap();
        assert!((fit.ar[0] - 0.6).abs() < 0.1, "phi {}", fit.ar[0]);
        assert!((fit.mean - 10.0).abs() < 0.5, "mean {}", fit.mean);
        assert!((fit.sigma2 - 1.0).abs() < 0.2, "sigma2 {}", fit.sigma2);
    }

    #[test]
    fn test_ar1_forecast_reverts_and_widens() {
        let values = ar1(600, 0.6, 10.0, 2);
        let fit = fit_order(&values, order(1, 0, 0)).unwrap();
        let out = fit.forecast(40, 0.95).unwrap();
        assert!((out.point[39] - fit.mean).abs() < 1e-3);
        let widths: Vec<f64> = out.upper.iter().zip(&out.lower).map(|(u, l)| u - l).collect();
        assert!(widths.windows(2).all(|w| w[1] >= w[0] - 1e-12));
        // One-step half width is z * sigma
        assert!((widths[0] / 2.0 - 1.959_964 * fit.sigma2.sqrt()).abs() < 1e-3);
    }

    #[test]
    fn test_random_walk_is_differenced() {
        let mut rng = StdRng::seed_from_u64(3);
        let noise = NormalDist::new(0.0, 1.0).unwrap();
        let mut level = 0.0;
        let walk: Vec<f64> = (0..300)
            .map(|_| {
                level += noise.sample(&mut rng);
                level
            })
            .collect();
        assert_eq!(choose_d(&walk, 2), 1);
        assert_eq!(choose_d(&ar1(300, 0.1, 0.0, 4), 2), 0);
    }

    #[test]
    fn test_fit_predict_contract() {
        let series = seasonal_series(260);
        let mut model = SarimaForecaster::new(SarimaConfig::default());
        model.fit(&series).unwrap();

        let out = model.predict(52).unwrap();
        assert_eq!(out.len(), 52);
        for i in 0..52 {
            assert!(out.lower[i] >= 0.0);
            assert!(out.lower[i] <= out.point[i] && out.point[i] <= out.upper[i]);
        }
        // Predicting is idempotent
        assert_eq!(model.predict(52).unwrap(), out);
    }

    #[test]
    fn test_short_series_rejected() {
        let series = seasonal_series(10);
        let mut model = SarimaForecaster::new(SarimaConfig::default());
        let err = model.fit(&series).unwrap_err();
        assert!(err.is_contained());
    }
}
