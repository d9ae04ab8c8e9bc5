//! Predictive alerts from the ensemble forecast.
//!
//! The baseline is the all-time mean of the region's observed series, not a
//! trailing window. Thresholds are strict (`>`).

use std::cmp::Reverse;
use std::collections::BTreeMap;

use chrono::Months;
use serde::Serialize;
use tracing::info;

use crate::alerts::report::predictive_distribution;
use crate::config::PredictiveThresholds;
use crate::error::Result;
use crate::forecast::ENSEMBLE_NAME;
use crate::signal::{ForecastPoint, PredictiveAlert, PredictiveLevel};

/// Fractional change of `forecast` over `historical_mean`; 0 when the mean is 0.
pub fn pct_increase(forecast: f64, historical_mean: f64) -> f64 {
    if historical_mean == 0.0 {
        0.0
    } else {
        (forecast - historical_mean) / historical_mean
    }
}

#[derive(Debug, Clone)]
pub struct PredictiveClassifier {
    thresholds: PredictiveThresholds,
}

impl PredictiveClassifier {
    pub fn new(thresholds: PredictiveThresholds) -> Result<Self> {
        thresholds.validate()?;
        Ok(Self { thresholds })
    }

    pub fn level(&self, pct: f64) -> PredictiveLevel {
        let t = &self.thresholds;
        if pct > t.critical {
            PredictiveLevel::Critical
        } else if pct > t.early_alert {
            PredictiveLevel::EarlyAlert
        } else if pct > t.preparation {
            PredictiveLevel::Preparation
        } else if pct > t.surveillance {
            PredictiveLevel::Surveillance
        } else {
            PredictiveLevel::Normal
        }
    }

    pub fn classify(&self, point: &ForecastPoint, historical_mean: f64) -> PredictiveAlert {
        let pct = pct_increase(point.point_estimate, historical_mean);
        PredictiveAlert {
            region: point.region.clone(),
            target_week_date: point.target_week_date,
            forecast_case_count: point.point_estimate,
            historical_mean,
            pct_increase: pct,
            predictive_level: self.level(pct),
            lower_bound: point.lower_bound,
            upper_bound: point.upper_bound,
            uncertainty_range: point.upper_bound - point.lower_bound,
        }
    }

    /// Alerts for the ensemble rows of `forecasts`.
    ///
    /// A region without a known mean is compared against its own forecast.
    pub fn classify_forecasts(
        &self,
        forecasts: &[ForecastPoint],
        historical_means: &BTreeMap<String, f64>,
    ) -> Vec<PredictiveAlert> {
        let alerts: Vec<PredictiveAlert> = forecasts
            .iter()
            .filter(|p| p.model_name == ENSEMBLE_NAME)
            .map(|p| {
                let mean = historical_means
                    .get(&p.region)
                    .copied()
                    .unwrap_or(p.point_estimate);
                self.classify(p, mean)
            })
            .collect();

        for share in predictive_distribution(&alerts) {
            info!(level = %share.level, count = share.count, share = share.percentage, "predictive alert distribution");
        }
        alerts
    }

    /// Alerts whose level is in `levels`, dated no later than the configured
    /// number of months after the earliest date in `alerts`.
    ///
    /// Most severe first, earliest first within a level.
    pub fn filter_critical(&self, alerts: &[PredictiveAlert], levels: &[PredictiveLevel]) -> Vec<PredictiveAlert> {
        let Some(start) = alerts.iter().map(|a| a.target_week_date).min() else {
            return Vec::new();
        };
        let horizon = start
            .checked_add_months(Months::new(self.thresholds.horizon_months))
            .unwrap_or(start);

        let mut critical: Vec<PredictiveAlert> = alerts
            .iter()
            .filter(|a| levels.contains(&a.predictive_level) && a.target_week_date <= horizon)
            .cloned()
            .collect();
        critical.sort_by_key(|a| (Reverse(a.predictive_level), a.target_week_date));
        critical
    }
}

/// Levels kept by the critical filter by default
pub const CRITICAL_LEVELS: [PredictiveLevel; 2] = [PredictiveLevel::EarlyAlert, PredictiveLevel::Critical];

/// Response plan for a predictive level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Recommendation {
    pub priority: &'static str,
    pub anticipation: &'static str,
    pub actions: &'static [&'static str],
}

pub fn recommendations(level: PredictiveLevel) -> Recommendation {
    match level {
        PredictiveLevel::Normal => Recommendation {
            priority: "Low",
            anticipation: "N/A",
            actions: &[
                "Maintain routine epidemiological surveillance",
                "Continue standard prevention campaigns",
                "Monitor entomological indicators",
            ],
        },
        PredictiveLevel::Surveillance => Recommendation {
            priority: "Medium",
            anticipation: "3-6 months",
            actions: &[
                "Intensify epidemiological surveillance",
                "Reinforce breeding-site elimination campaigns",
                "Stock up on medical supplies",
                "Train health personnel",
            ],
        },
        PredictiveLevel::Preparation => Recommendation {
            priority: "High",
            anticipation: "2-4 months",
            actions: &[
                "Activate the contingency plan",
                "Carry out preventive fumigation in risk areas",
                "Increase the stock of diagnostic tests",
                "Coordinate with hospitals to expand capacity",
                "Step up public communication campaigns",
            ],
        },
        PredictiveLevel::EarlyAlert => Recommendation {
            priority: "Very High",
            anticipation: "1-3 months",
            actions: &[
                "Implement the full contingency plan",
                "Mass fumigation in identified areas",
                "Mobilize health brigades",
                "Set up temporary care centres",
                "Declare a regional health alert",
                "Coordinate with local and national authorities",
            ],
        },
        PredictiveLevel::Critical => Recommendation {
            priority: "Critical",
            anticipation: "0-2 months",
            actions: &[
                "Declare a health emergency",
                "Mobilize all resources",
                "Establish an epidemiological cordon",
                "Activate field hospitals",
                "Request national and international support",
                "Immediate targeted fumigation",
                "Crisis communication to the population",
            ],
        },
    }
}
