//! Region summaries and level distributions for the reporting consumers.

use std::cmp::Reverse;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::signal::{PredictiveAlert, PredictiveLevel, RetrospectiveAlert, RiskLevel};

/// Retrospective alert summary for one region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionReport {
    pub region: String,
    pub total_weeks: usize,
    pub critical_alerts: usize,
    pub high_alerts: usize,
    pub medium_alerts: usize,
    pub low_alerts: usize,
    pub mean_cases: f64,
    pub max_cases: u32,
    pub mean_z_score: f64,
    pub max_z_score: f64,
}

/// Count and percentage of alerts at one level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelShare {
    pub level: String,
    pub count: usize,
    pub percentage: f64,
}

/// Per-region summary, regions with the most critical weeks first.
pub fn region_report(alerts: &[RetrospectiveAlert]) -> Vec<RegionReport> {
    let mut by_region: BTreeMap<&str, Vec<&RetrospectiveAlert>> = BTreeMap::new();
    for alert in alerts {
        by_region.entry(alert.region.as_str()).or_default().push(alert);
    }

    let mut reports: Vec<RegionReport> = by_region
        .into_iter()
        .map(|(region, rows)| {
            let n = rows.len() as f64;
            let count = |level: RiskLevel| rows.iter().filter(|a| a.final_level == level).count();
            RegionReport {
                region: region.to_string(),
                total_weeks: rows.len(),
                critical_alerts: count(RiskLevel::Critical),
                high_alerts: count(RiskLevel::High),
                medium_alerts: count(RiskLevel::Medium),
                low_alerts: count(RiskLevel::Low),
                mean_cases: rows.iter().map(|a| a.case_count as f64).sum::<f64>() / n,
                max_cases: rows.iter().map(|a| a.case_count).max().unwrap_or(0),
                mean_z_score: rows.iter().map(|a| a.z_score).sum::<f64>() / n,
                max_z_score: rows.iter().map(|a| a.z_score).fold(f64::NEG_INFINITY, f64::max),
            }
        })
        .collect();
    reports.sort_by_key(|r| Reverse(r.critical_alerts));
    reports
}

fn shares(names: &[&'static str], counts: Vec<usize>) -> Vec<LevelShare> {
    let total: usize = counts.iter().sum();
    names
        .iter()
        .zip(counts)
        .filter(|(_, count)| *count > 0)
        .map(|(name, count)| LevelShare {
            level: name.to_string(),
            count,
            percentage: 100.0 * count as f64 / total as f64,
        })
        .collect()
}

/// Distribution of retrospective final levels, most severe first.
pub fn level_distribution(alerts: &[RetrospectiveAlert]) -> Vec<LevelShare> {
    let levels: Vec<RiskLevel> = RiskLevel::ALL.iter().rev().copied().collect();
    let names: Vec<&'static str> = levels.iter().map(|l| l.name()).collect();
    let counts = levels
        .iter()
        .map(|l| alerts.iter().filter(|a| a.final_level == *l).count())
        .collect();
    shares(&names, counts)
}

/// Distribution of predictive levels, most severe first.
pub fn predictive_distribution(alerts: &[PredictiveAlert]) -> Vec<LevelShare> {
    let levels: Vec<PredictiveLevel> = PredictiveLevel::ALL.iter().rev().copied().collect();
    let names: Vec<&'static str> = levels.iter().map(|l| l.name()).collect();
    let counts = levels
        .iter()
        .map(|l| alerts.iter().filter(|a| a.predictive_level == *l).count())
        .collect();
    shares(&names, counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::RetrospectiveClassifier;
    use crate::config::RetrospectiveConfig;
    use chrono::{Duration, NaiveDate};

    fn alerts() -> Vec<RetrospectiveAlert> {
        let c = RetrospectiveClassifier::new(RetrospectiveConfig::default()).unwrap();
        let d = |w| NaiveDate::from_ymd_opt(2023, 1, 2).unwrap() + Duration::weeks(w);
        vec![
            c.classify("AMAZONAS", d(0), 50, 50.0, 5.0, 0),
            c.classify("AMAZONAS", d(1), 70, 50.0, 5.0, 0),
            c.classify("PIURA", d(0), 100, 50.0, 5.0, 0),
            c.classify("PIURA", d(1), 90, 50.0, 5.0, 0),
            c.classify("PIURA", d(2), 60, 50.0, 5.0, 0),
        ]
    }

    #[test]
    fn test_region_report_sorted_by_critical() {
        let report = region_report(&alerts());
        assert_eq!(report[0].region, "PIURA");
        assert_eq!(report[0].critical_alerts, 2);
        assert_eq!(report[0].max_cases, 100);
        assert!((report[0].max_z_score - 10.0).abs() < 1e-12);
        assert!((report[0].mean_cases - 250.0 / 3.0).abs() < 1e-9);

        assert_eq!(report[1].region, "AMAZONAS");
        assert_eq!(report[1].total_weeks, 2);
        assert!((report[1].mean_z_score - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_level_distribution_percentages() {
        let dist = level_distribution(&alerts());
        let levels: Vec<&str> = dist.iter().map(|s| s.level.as_str()).collect();
        assert_eq!(levels, vec!["CRITICAL", "MEDIUM", "NORMAL"]);
        assert_eq!(dist[0].count, 3);
        assert!((dist[0].percentage - 60.0).abs() < 1e-9);
        let total: f64 = dist.iter().map(|s| s.percentage).sum();
        assert!((total - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_inputs() {
        assert!(region_report(&[]).is_empty());
        assert!(predictive_distribution(&[]).is_empty());
    }
}
