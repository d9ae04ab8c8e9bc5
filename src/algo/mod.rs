//! Numeric building blocks shared by the detectors and forecasters.

pub mod gbt;
pub mod isolation_forest;
pub mod lof;
pub mod lstm;
pub mod ocsvm;
pub mod optim;
pub mod scaler;

pub use gbt::{GradientBoostedTrees, TreeParams};
pub use isolation_forest::IsolationForest;
pub use lof::LocalOutlierFactor;
pub use lstm::{LstmNetwork, LstmParams, TrainReport};
pub use ocsvm::OneClassSvm;
pub use scaler::{MinMaxScaler, StandardScaler};

/// Linear-interpolation quantile (numpy's default), `q` in [0, 1].
///
/// Non-finite values sort last via `total_cmp`. Returns NaN on empty input.
pub fn quantile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    quantile_sorted(&sorted, q)
}

/// Same as [`quantile`] for already-sorted input.
pub fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

#[inline]
pub fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantile_interpolates() {
        let values = [4.0, 1.0, 3.0, 2.0];
        assert_eq!(quantile(&values, 0.0), 1.0);
        assert_eq!(quantile(&values, 1.0), 4.0);
        assert!((quantile(&values, 0.5) - 2.5).abs() < 1e-12);
        assert!((quantile(&values, 0.95) - 3.85).abs() < 1e-12);
        assert!(quantile(&[], 0.5).is_nan());
    }

    #[test]
    fn test_squared_distance() {
        assert_eq!(squared_distance(&[0.0, 0.0], &[3.0, 4.0]), 25.0);
    }
}
