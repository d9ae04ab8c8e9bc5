//! Feature scalers.
//!
//! `StandardScaler` centres each column to zero mean and unit variance
//! (population variance). `MinMaxScaler` maps a scalar series into [0, 1]
//! and back.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    means: Vec<f64>,
    scales: Vec<f64>,
}

impl StandardScaler {
    /// Fit per-column mean and standard deviation.
    ///
    /// Constant columns get scale 1 so they map to 0 instead of NaN.
    pub fn fit(rows: &[Vec<f64>]) -> Self {
        let width = rows.first().map_or(0, |r| r.len());
        let n = rows.len().max(1) as f64;

        let mut means = vec![0.0; width];
        for row in rows {
            for (m, v) in means.iter_mut().zip(row) {
                *m += v;
            }
        }
        means.iter_mut().for_each(|m| *m /= n);

        let mut scales = vec![0.0; width];
        for row in rows {
            for ((s, v), m) in scales.iter_mut().zip(row).zip(&means) {
                *s += (v - m).powi(2);
            }
        }
        for s in scales.iter_mut() {
            *s = (*s / n).sqrt();
            if *s <= f64::EPSILON {
                *s = 1.0;
            }
        }

        Self { means, scales }
    }

    pub fn transform_row(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .zip(self.means.iter().zip(&self.scales))
            .map(|(v, (m, s))| (v - m) / s)
            .collect()
    }

    pub fn transform(&self, rows: &[Vec<f64>]) -> Vec<Vec<f64>> {
        rows.iter().map(|r| self.transform_row(r)).collect()
    }

    pub fn width(&self) -> usize {
        self.means.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MinMaxScaler {
    min: f64,
    max: f64,
}

impl MinMaxScaler {
    pub fn fit(values: &[f64]) -> Self {
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if min.is_finite() && max.is_finite() {
            Self { min, max }
        } else {
            Self { min: 0.0, max: 1.0 }
        }
    }

    fn range(&self) -> f64 {
        self.max - self.min
    }

    /// A constant training series maps everything to 0.
    pub fn transform(&self, value: f64) -> f64 {
        let range = self.range();
        if range <= f64::EPSILON {
            0.0
        } else {
            (value - self.min) / range
        }
    }

    pub fn inverse(&self, scaled: f64) -> f64 {
        scaled * self.range() + self.min
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_scaler_zero_mean_unit_variance() {
        let rows = vec![vec![1.0, 10.0], vec![3.0, 10.0], vec![5.0, 10.0]];
        let scaler = StandardScaler::fit(&rows);
        let out = scaler.transform(&rows);
        let col0: Vec<f64> = out.iter().map(|r| r[0]).collect();
        assert!((col0.iter().sum::<f64>()).abs() < 1e-12);
        let var = col0.iter().map(|v| v * v).sum::<f64>() / 3.0;
        assert!((var - 1.0).abs() < 1e-12);
        // Constant column maps to zero
        assert!(out.iter().all(|r| r[1] == 0.0));
    }

    #[test]
    fn test_minmax_round_trip() {
        let scaler = MinMaxScaler::fit(&[10.0, 20.0, 30.0]);
        assert_eq!(scaler.transform(10.0), 0.0);
        assert_eq!(scaler.transform(30.0), 1.0);
        assert!((scaler.inverse(scaler.transform(17.0)) - 17.0).abs() < 1e-12);

        let flat = MinMaxScaler::fit(&[5.0, 5.0]);
        assert_eq!(flat.transform(5.0), 0.0);
        assert_eq!(flat.inverse(0.0), 5.0);
    }
}
