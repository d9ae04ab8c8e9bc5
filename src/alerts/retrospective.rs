//! Retrospective alerts.
//!
//! Two signals per observed week, the more severe wins:
//! - statistical: z-score of the count against the trailing window of the
//!   weeks strictly before it
//! - anomaly: number of agreeing outlier detectors (1 maps to MEDIUM)

use std::cmp::Reverse;
use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate};
use tracing::debug;

use crate::config::RetrospectiveConfig;
use crate::error::Result;
use crate::series::{RegionSeries, shifted_rolling_stats};
use crate::signal::{RetrospectiveAlert, RiskLevel};

/// Standard score of `value`; 0 when the deviation is 0 or the result is
/// not finite.
pub fn z_score(value: f64, mean: f64, stddev: f64) -> f64 {
    if stddev == 0.0 {
        return 0.0;
    }
    let z = (value - mean) / stddev;
    if z.is_finite() { z } else { 0.0 }
}

#[derive(Debug, Clone)]
pub struct RetrospectiveClassifier {
    config: RetrospectiveConfig,
}

impl RetrospectiveClassifier {
    pub fn new(config: RetrospectiveConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn statistical_level(&self, z: f64) -> RiskLevel {
        let c = &self.config;
        if z >= c.critical {
            RiskLevel::Critical
        } else if z >= c.high {
            RiskLevel::High
        } else if z >= c.medium {
            RiskLevel::Medium
        } else if z >= c.low {
            RiskLevel::Low
        } else {
            RiskLevel::Normal
        }
    }

    /// Classify one observation against its baseline.
    pub fn classify(
        &self,
        region: &str,
        week_start_date: NaiveDate,
        case_count: u32,
        historical_mean: f64,
        historical_stddev: f64,
        consensus_count: u8,
    ) -> RetrospectiveAlert {
        let value = case_count as f64;
        let z = z_score(value, historical_mean, historical_stddev);
        let statistical_level = self.statistical_level(z);
        let anomaly_level = RiskLevel::from_consensus(consensus_count);
        let pct_deviation = if historical_mean == 0.0 {
            0.0
        } else {
            100.0 * (value - historical_mean) / historical_mean
        };

        RetrospectiveAlert {
            region: region.to_string(),
            week_start_date,
            case_count,
            historical_mean,
            historical_stddev,
            z_score: z,
            statistical_level,
            anomaly_consensus_count: consensus_count,
            anomaly_level,
            final_level: statistical_level.max(anomaly_level),
            pct_deviation,
        }
    }

    /// One alert per week that has at least one prior week.
    ///
    /// Weeks missing from `consensus` count as zero agreeing detectors.
    pub fn classify_series(
        &self,
        series: &RegionSeries,
        consensus: &BTreeMap<NaiveDate, u8>,
    ) -> Vec<RetrospectiveAlert> {
        let baselines = shifted_rolling_stats(series.values(), self.config.window_weeks);
        let alerts: Vec<RetrospectiveAlert> = series
            .dates()
            .iter()
            .zip(series.values())
            .zip(baselines)
            .filter_map(|((date, value), baseline)| {
                let (mean, std) = baseline?;
                let count = consensus.get(date).copied().unwrap_or(0);
                Some(self.classify(series.region(), *date, value.round() as u32, mean, std, count))
            })
            .collect();
        debug!(region = %series.region(), alerts = alerts.len(), "retrospective alerts classified");
        alerts
    }

    /// Alerts at or above the minimum level within the trailing window,
    /// measured back from the latest week present in `alerts`.
    ///
    /// Most severe first, newest first within a level.
    pub fn filter_active(&self, alerts: &[RetrospectiveAlert]) -> Vec<RetrospectiveAlert> {
        let Some(latest) = alerts.iter().map(|a| a.week_start_date).max() else {
            return Vec::new();
        };
        let cutoff = latest - Duration::weeks(self.config.active_window_weeks);

        let mut active: Vec<RetrospectiveAlert> = alerts
            .iter()
            .filter(|a| a.final_level >= self.config.active_min_level && a.week_start_date >= cutoff)
            .cloned()
            .collect();
        active.sort_by_key(|a| (Reverse(a.final_level), Reverse(a.week_start_date)));
        active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> RetrospectiveClassifier {
        RetrospectiveClassifier::new(RetrospectiveConfig::default()).unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_z_score_guards() {
        assert_eq!(z_score(10.0, 5.0, 0.0), 0.0);
        assert_eq!(z_score(10.0, 5.0, f64::NAN), 0.0);
        assert_eq!(z_score(95.0, 50.0, 5.0), 9.0);
    }

    #[test]
    fn test_threshold_boundaries_inclusive() {
        let c = classifier();
        assert_eq!(c.statistical_level(1.49), RiskLevel::Normal);
        assert_eq!(c.statistical_level(1.5), RiskLevel::Low);
        assert_eq!(c.statistical_level(2.0), RiskLevel::Medium);
        assert_eq!(c.statistical_level(2.5), RiskLevel::High);
        assert_eq!(c.statistical_level(3.0), RiskLevel::Critical);
        assert_eq!(c.statistical_level(-4.0), RiskLevel::Normal);
    }

    #[test]
    fn test_final_level_is_max() {
        let c = classifier();
        for count in 0..=3u8 {
            for cases in [50u32, 60, 62, 64, 70] {
                let alert = c.classify("ICA", date(2024, 1, 1), cases, 50.0, 5.0, count);
                assert_eq!(alert.final_level, alert.statistical_level.max(alert.anomaly_level));
            }
        }
    }

    #[test]
    fn test_anomaly_dominates_normal_statistics() {
        let alert = classifier().classify("ICA", date(2024, 1, 1), 50, 50.0, 5.0, 2);
        assert_eq!(alert.statistical_level, RiskLevel::Normal);
        assert_eq!(alert.final_level, RiskLevel::High);
        assert_eq!(alert.pct_deviation, 0.0);
    }

    #[test]
    fn test_series_skips_first_week_and_excludes_current() {
        let start = date(2024, 1, 1);
        let points = [10.0, 10.0, 10.0, 40.0]
            .iter()
            .enumerate()
            .map(|(i, v)| (start + Duration::weeks(i as i64), *v))
            .collect();
        let series = RegionSeries::new("LORETO", points).unwrap();
        let alerts = classifier().classify_series(&series, &BTreeMap::new());

        assert_eq!(alerts.len(), 3);
        assert_eq!(alerts[0].historical_stddev, 0.0);
        assert_eq!(alerts[0].z_score, 0.0);
        // Baseline for the spike is the three prior weeks only
        assert_eq!(alerts[2].historical_mean, 10.0);
        assert_eq!(alerts[2].pct_deviation, 300.0);
    }

    #[test]
    fn test_filter_active_window_and_order() {
        let c = classifier();
        let mk = |week: i64, level_cases: u32| {
            c.classify("PIURA", date(2024, 1, 1) + Duration::weeks(week), level_cases, 50.0, 5.0, 0)
        };
        let alerts = vec![
            mk(0, 100),  // critical but too old
            mk(6, 61),   // medium
            mk(8, 100),  // critical
            mk(9, 61),   // medium
            mk(10, 52),  // normal
            mk(10, 63),  // high
        ];
        let active = c.filter_active(&alerts);
        let got: Vec<(RiskLevel, i64)> = active
            .iter()
            .map(|a| (a.final_level, (a.week_start_date - date(2024, 1, 1)).num_weeks()))
            .collect();
        assert_eq!(
            got,
            vec![
                (RiskLevel::Critical, 8),
                (RiskLevel::High, 10),
                (RiskLevel::Medium, 9),
                (RiskLevel::Medium, 6),
            ]
        );
        assert!(c.filter_active(&[]).is_empty());
    }
}
