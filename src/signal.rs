//! Risk Levels and Alert Records
//!
//! This module defines the ordered severity scales and the flat records the
//! pipeline emits for downstream consumers (dashboard, reporting).
//!
//! Two independent scales exist:
//! - `RiskLevel` for retrospective alerts (observed case counts)
//! - `PredictiveLevel` for predictive alerts (ensemble forecasts)
//!
//! Both are totally ordered by severity. They are never compared with each other.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Retrospective severity levels
#[repr(u8)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    #[default]
    Normal = 0,
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
}

impl RiskLevel {
    pub const ALL: [RiskLevel; 5] = [
        Self::Normal,
        Self::Low,
        Self::Medium,
        Self::High,
        Self::Critical,
    ];

    /// Map the number of agreeing outlier detectors to a level.
    ///
    /// A single detector maps to MEDIUM, never LOW.
    pub fn from_consensus(count: u8) -> Self {
        match count {
            0 => Self::Normal,
            1 => Self::Medium,
            2 => Self::High,
            _ => Self::Critical,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

/// Predictive severity levels
#[repr(u8)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PredictiveLevel {
    #[default]
    Normal = 0,
    Surveillance = 1,
    Preparation = 2,
    EarlyAlert = 3,
    Critical = 4,
}

impl PredictiveLevel {
    pub const ALL: [PredictiveLevel; 5] = [
        Self::Normal,
        Self::Surveillance,
        Self::Preparation,
        Self::EarlyAlert,
        Self::Critical,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Surveillance => "SURVEILLANCE",
            Self::Preparation => "PREPARATION",
            Self::EarlyAlert => "EARLY_ALERT",
            Self::Critical => "CRITICAL",
        }
    }
}

/// Per-observation output of the three outlier detectors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AnomalyVerdict {
    pub isolation_forest_flag: bool,
    pub local_outlier_flag: bool,
    pub one_class_svm_flag: bool,
    /// True when at least two of the three detectors agree
    pub consensus_flag: bool,
}

impl AnomalyVerdict {
    pub fn new(isolation_forest: bool, local_outlier: bool, one_class_svm: bool) -> Self {
        let count = isolation_forest as u8 + local_outlier as u8 + one_class_svm as u8;
        Self {
            isolation_forest_flag: isolation_forest,
            local_outlier_flag: local_outlier,
            one_class_svm_flag: one_class_svm,
            consensus_flag: count >= 2,
        }
    }

    /// Number of detectors that flagged the observation (0..=3)
    pub fn consensus_count(&self) -> u8 {
        self.isolation_forest_flag as u8
            + self.local_outlier_flag as u8
            + self.one_class_svm_flag as u8
    }
}

/// Retrospective alert for one observed region/week
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrospectiveAlert {
    pub region: String,
    pub week_start_date: NaiveDate,
    pub case_count: u32,
    /// Mean over the trailing window, current week excluded
    pub historical_mean: f64,
    pub historical_stddev: f64,
    pub z_score: f64,
    pub statistical_level: RiskLevel,
    pub anomaly_consensus_count: u8,
    pub anomaly_level: RiskLevel,
    /// max(statistical_level, anomaly_level)
    pub final_level: RiskLevel,
    /// Deviation from the historical mean, in percent
    pub pct_deviation: f64,
}

/// One forecast value for a (region, week, model) triple
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub region: String,
    pub target_week_date: NaiveDate,
    pub model_name: String,
    pub point_estimate: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
}

/// Forward-looking alert derived from the ensemble forecast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictiveAlert {
    pub region: String,
    pub target_week_date: NaiveDate,
    pub forecast_case_count: f64,
    /// All-time mean case count for the region
    pub historical_mean: f64,
    /// Fractional increase over the historical mean (1.2 = +120%)
    pub pct_increase: f64,
    pub predictive_level: PredictiveLevel,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub uncertainty_range: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consensus_exhaustive() {
        for mask in 0u8..8 {
            let a = mask & 1 != 0;
            let b = mask & 2 != 0;
            let c = mask & 4 != 0;
            let verdict = AnomalyVerdict::new(a, b, c);
            let count = a as u8 + b as u8 + c as u8;
            assert_eq!(verdict.consensus_count(), count);
            assert_eq!(verdict.consensus_flag, count >= 2, "mask {mask:03b}");
        }
    }

    #[test]
    fn test_consensus_mapping_skips_low() {
        assert_eq!(RiskLevel::from_consensus(0), RiskLevel::Normal);
        assert_eq!(RiskLevel::from_consensus(1), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_consensus(2), RiskLevel::High);
        assert_eq!(RiskLevel::from_consensus(3), RiskLevel::Critical);
    }

    #[test]
    fn test_levels_are_ordered() {
        assert!(RiskLevel::Normal < RiskLevel::Low);
        assert!(RiskLevel::High < RiskLevel::Critical);
        assert!(PredictiveLevel::Preparation < PredictiveLevel::EarlyAlert);
        assert_eq!(
            RiskLevel::Medium.max(RiskLevel::High),
            RiskLevel::High
        );
    }

    #[test]
    fn test_level_serialization() {
        let json = serde_json::to_string(&PredictiveLevel::EarlyAlert).unwrap();
        assert_eq!(json, "\"EARLY_ALERT\"");
        let level: RiskLevel = serde_json::from_str("\"MEDIUM\"").unwrap();
        assert_eq!(level, RiskLevel::Medium);
    }
}
