//! Holdout backtest metrics.
//!
//! A forecaster is trained on all but the last `test_weeks` of a series and
//! scored on the held-out tail.

use serde::{Deserialize, Serialize};

use super::{ModelKind, build_forecaster};
use crate::config::ForecastConfig;
use crate::error::Result;
use crate::series::RegionSeries;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForecastMetrics {
    pub mae: f64,
    pub rmse: f64,
    /// Percent; weeks with zero actual cases are left out. NaN if none remain.
    pub mape: f64,
}

pub fn evaluate(actual: &[f64], predicted: &[f64]) -> ForecastMetrics {
    let n = actual.len().min(predicted.len());
    if n == 0 {
        return ForecastMetrics {
            mae: f64::NAN,
            rmse: f64::NAN,
            mape: f64::NAN,
        };
    }
    let pairs = || actual.iter().zip(predicted).take(n);
    let mae = pairs().map(|(a, p)| (a - p).abs()).sum::<f64>() / n as f64;
    let rmse = (pairs().map(|(a, p)| (a - p).powi(2)).sum::<f64>() / n as f64).sqrt();

    let nonzero: Vec<f64> = pairs()
        .filter(|(a, _)| **a != 0.0)
        .map(|(a, p)| ((a - p) / a).abs())
        .collect();
    let mape = if nonzero.is_empty() {
        f64::NAN
    } else {
        100.0 * nonzero.iter().sum::<f64>() / nonzero.len() as f64
    };

    ForecastMetrics { mae, rmse, mape }
}

/// Train `kind` on the head of `series` and score it on the last `test_weeks`.
pub fn backtest(
    kind: ModelKind,
    config: &ForecastConfig,
    series: &RegionSeries,
    test_weeks: usize,
) -> Result<ForecastMetrics> {
    let (train, test) = series.split_tail(test_weeks)?;
    let mut model = build_forecaster(kind, config);
    model.fit(&train)?;
    let output = model.predict(test.len())?;
    Ok(evaluate(test.values(), &output.point))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_values() {
        let m = evaluate(&[10.0, 20.0, 0.0], &[12.0, 16.0, 3.0]);
        assert!((m.mae - 3.0).abs() < 1e-12);
        assert!((m.rmse - (29.0f64 / 3.0).sqrt()).abs() < 1e-12);
        // Zero-actual week excluded: (20% + 20%) / 2
        assert!((m.mape - 20.0).abs() < 1e-12);
    }

    #[test]
    fn test_metrics_empty() {
        assert!(evaluate(&[], &[]).mae.is_nan());
        assert!(evaluate(&[0.0], &[1.0]).mape.is_nan());
    }
}
