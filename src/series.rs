//! Weekly case series and feature views.
//!
//! The upstream feature pipeline hands over one row per region/week. This
//! module groups those rows into per-region views:
//! - `RegionSeries`: ordered, unique-dated case counts (forecasting view)
//! - `FeatureMatrix`: ordered engineered-feature rows (anomaly view)

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{DewsError, Result};

/// One region/week as produced by the feature pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeeklyObservation {
    pub region: String,
    pub week_start_date: NaiveDate,
    pub case_count: u32,
    /// Missing values are carried as NaN
    pub engineered_features: BTreeMap<String, f64>,
}

/// Ordered weekly case counts for one region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionSeries {
    region: String,
    dates: Vec<NaiveDate>,
    cases: Vec<f64>,
}

impl RegionSeries {
    /// Build a series, sorting by date.
    ///
    /// Fails with `Schema` if a week appears twice or a count is negative.
    pub fn new(region: impl Into<String>, mut points: Vec<(NaiveDate, f64)>) -> Result<Self> {
        let region = region.into();
        points.sort_by_key(|(date, _)| *date);

        for pair in points.windows(2) {
            if pair[0].0 == pair[1].0 {
                return Err(DewsError::Schema(format!(
                    "duplicate week {} for region {}",
                    pair[0].0, region
                )));
            }
        }
        if let Some((date, value)) = points.iter().find(|(_, v)| !v.is_finite() || *v < 0.0) {
            return Err(DewsError::Schema(format!(
                "invalid case count {} on {} for region {}",
                value, date, region
            )));
        }

        let (dates, cases) = points.into_iter().unzip();
        Ok(Self {
            region,
            dates,
            cases,
        })
    }

    /// Group observations by region into series.
    pub fn from_observations(
        observations: &[WeeklyObservation],
    ) -> Result<BTreeMap<String, RegionSeries>> {
        let mut grouped: BTreeMap<String, Vec<(NaiveDate, f64)>> = BTreeMap::new();
        for obs in observations {
            grouped
                .entry(obs.region.clone())
                .or_default()
                .push((obs.week_start_date, obs.case_count as f64));
        }
        grouped
            .into_iter()
            .map(|(region, points)| Ok((region.clone(), RegionSeries::new(region, points)?)))
            .collect()
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn values(&self) -> &[f64] {
        &self.cases
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    pub fn first_date(&self) -> Option<NaiveDate> {
        self.dates.first().copied()
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.dates.last().copied()
    }

    /// All-time mean case count
    pub fn mean(&self) -> f64 {
        mean(&self.cases)
    }

    /// Split into (head, tail) with `tail_len` weeks in the tail.
    pub fn split_tail(&self, tail_len: usize) -> Result<(RegionSeries, RegionSeries)> {
        if tail_len >= self.len() {
            return Err(DewsError::insufficient(
                &self.region,
                "holdout split",
                self.len(),
                tail_len + 1,
            ));
        }
        let cut = self.len() - tail_len;
        let head = Self {
            region: self.region.clone(),
            dates: self.dates[..cut].to_vec(),
            cases: self.cases[..cut].to_vec(),
        };
        let tail = Self {
            region: self.region.clone(),
            dates: self.dates[cut..].to_vec(),
            cases: self.cases[cut..].to_vec(),
        };
        Ok((head, tail))
    }
}

/// Engineered feature rows for one region, in date order
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    pub feature_names: Vec<String>,
    pub dates: Vec<NaiveDate>,
    pub rows: Vec<Vec<f64>>,
}

impl FeatureMatrix {
    /// Extract `feature_names` for one region, in date order.
    ///
    /// Absent keys become NaN so that `drop_incomplete` can remove the row.
    pub fn from_observations(
        observations: &[WeeklyObservation],
        region: &str,
        feature_names: &[String],
    ) -> Self {
        let mut selected: Vec<&WeeklyObservation> =
            observations.iter().filter(|o| o.region == region).collect();
        selected.sort_by_key(|o| o.week_start_date);

        let dates = selected.iter().map(|o| o.week_start_date).collect();
        let rows = selected
            .iter()
            .map(|o| {
                feature_names
                    .iter()
                    .map(|name| {
                        o.engineered_features
                            .get(name)
                            .copied()
                            .unwrap_or(f64::NAN)
                    })
                    .collect()
            })
            .collect();

        Self {
            feature_names: feature_names.to_vec(),
            dates,
            rows,
        }
    }

    /// Remove rows with any non-finite value. Returns the number dropped.
    pub fn drop_incomplete(&mut self) -> usize {
        let before = self.rows.len();
        let keep: Vec<bool> = self
            .rows
            .iter()
            .map(|row| row.iter().all(|v| v.is_finite()))
            .collect();

        let mut keep_iter = keep.iter();
        self.rows.retain(|_| *keep_iter.next().unwrap_or(&false));
        let mut keep_iter = keep.iter();
        self.dates.retain(|_| *keep_iter.next().unwrap_or(&false));

        before - self.rows.len()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn width(&self) -> usize {
        self.feature_names.len()
    }
}

/// Names of the engineered features present across observations.
///
/// The case count is not a feature.
pub fn feature_names(observations: &[WeeklyObservation]) -> Vec<String> {
    let names: BTreeSet<&String> = observations
        .iter()
        .flat_map(|o| o.engineered_features.keys())
        .collect();
    names.into_iter().cloned().collect()
}

/// Trailing baseline for each position, computed over the `window` values
/// strictly before it. `None` where no prior value exists.
///
/// The standard deviation is the sample deviation (n - 1); with a single
/// prior value it is 0.
pub fn shifted_rolling_stats(values: &[f64], window: usize) -> Vec<Option<(f64, f64)>> {
    let window = window.max(1);
    (0..values.len())
        .map(|i| {
            if i == 0 {
                return None;
            }
            let start = i.saturating_sub(window);
            let slice = &values[start..i];
            Some((mean(slice), sample_std(slice)))
        })
        .collect()
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (n - 1 denominator); 0 for fewer than 2 values.
pub fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let ss: f64 = values.iter().map(|v| (v - m).powi(2)).sum();
    (ss / (values.len() - 1) as f64).sqrt()
}
