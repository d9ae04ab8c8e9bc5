//! Pipeline Configuration
//!
//! Thresholds, weights and region lists are explicit structs handed to each
//! component at construction. Every section has serde defaults so a partial
//! JSON file only overrides what it names.
//!
//! Invariants checked by `validate()`:
//! - threshold ladders are strictly increasing
//! - ensemble weights sum to 1.0 (within 1e-9)
//! - contamination lies in (0, 0.5]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DewsError, Result};
use crate::forecast::ModelKind;
use crate::forecast::boosted::BoostedConfig;
use crate::forecast::decomposition::DecompositionConfig;
use crate::forecast::sarima::SarimaConfig;
use crate::forecast::sequence::SequenceConfig;
use crate::signal::RiskLevel;

/// Tolerance for the ensemble weight sum
pub const WEIGHT_TOLERANCE: f64 = 1e-9;

/// Top-level configuration for one pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Regions under surveillance
    pub regions: Vec<String>,
    pub paths: PathsConfig,
    /// Worker threads for region-parallel stages
    pub workers: usize,
    pub anomaly: AnomalyConfig,
    pub retrospective: RetrospectiveConfig,
    pub predictive: PredictiveThresholds,
    pub forecast: ForecastConfig,
    pub ensemble: EnsembleConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            regions: ["LORETO", "PIURA", "UCAYALI", "SAN MARTIN", "JUNIN"]
                .iter()
                .map(|r| r.to_string())
                .collect(),
            paths: PathsConfig::default(),
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            anomaly: AnomalyConfig::default(),
            retrospective: RetrospectiveConfig::default(),
            predictive: PredictiveThresholds::default(),
            forecast: ForecastConfig::default(),
            ensemble: EnsembleConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load from a JSON file and validate.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| DewsError::InvalidConfig(format!("{}: {}", path.as_ref().display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.regions.is_empty() {
            return Err(DewsError::InvalidConfig("no regions configured".into()));
        }
        if self.workers == 0 {
            return Err(DewsError::InvalidConfig("workers must be at least 1".into()));
        }
        self.anomaly.validate()?;
        self.retrospective.validate()?;
        self.predictive.validate()?;
        self.forecast.validate()?;
        self.ensemble.validate()?;
        Ok(())
    }
}

/// Input and output locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Clean weekly series (`departamento,fecha,casos`)
    pub series_csv: PathBuf,
    /// Feature-augmented series
    pub features_csv: PathBuf,
    pub output_dir: PathBuf,
    pub artifact_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            series_csv: PathBuf::from("data/processed/dengue_clean.csv"),
            features_csv: PathBuf::from("data/processed/dengue_features.csv"),
            output_dir: PathBuf::from("data/predictions"),
            artifact_dir: PathBuf::from("models"),
        }
    }
}

/// Outlier detector settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    /// Expected anomaly fraction; also the one-class SVM `nu`
    pub contamination: f64,
    pub n_estimators: usize,
    pub n_neighbors: usize,
    /// Rows required after dropping incomplete ones
    pub min_rows: usize,
    pub seed: u64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            contamination: 0.05,
            n_estimators: 100,
            n_neighbors: 20,
            min_rows: 50,
            seed: 42,
        }
    }
}

impl AnomalyConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.contamination > 0.0 && self.contamination <= 0.5) {
            return Err(DewsError::InvalidConfig(format!(
                "contamination must lie in (0, 0.5], got {}",
                self.contamination
            )));
        }
        if self.n_estimators == 0 || self.n_neighbors == 0 {
            return Err(DewsError::InvalidConfig(
                "n_estimators and n_neighbors must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// z-score thresholds and active-alert filter for retrospective alerts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrospectiveConfig {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
    /// Trailing baseline length in weeks
    pub window_weeks: usize,
    pub active_window_weeks: i64,
    pub active_min_level: RiskLevel,
}

impl Default for RetrospectiveConfig {
    fn default() -> Self {
        Self {
            low: 1.5,
            medium: 2.0,
            high: 2.5,
            critical: 3.0,
            window_weeks: 52,
            active_window_weeks: 4,
            active_min_level: RiskLevel::Medium,
        }
    }
}

impl RetrospectiveConfig {
    pub fn validate(&self) -> Result<()> {
        check_increasing("retrospective", &[self.low, self.medium, self.high, self.critical])?;
        if self.window_weeks == 0 {
            return Err(DewsError::InvalidConfig("window_weeks must be positive".into()));
        }
        if self.active_window_weeks < 0 {
            return Err(DewsError::InvalidConfig(
                "active_window_weeks must not be negative".into(),
            ));
        }
        Ok(())
    }
}

/// Fractional-increase thresholds for predictive alerts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictiveThresholds {
    pub surveillance: f64,
    pub preparation: f64,
    pub early_alert: f64,
    pub critical: f64,
    /// Critical-alert filter horizon
    pub horizon_months: u32,
}

impl Default for PredictiveThresholds {
    fn default() -> Self {
        Self {
            surveillance: 0.10,
            preparation: 0.30,
            early_alert: 0.60,
            critical: 1.00,
            horizon_months: 12,
        }
    }
}

impl PredictiveThresholds {
    pub fn validate(&self) -> Result<()> {
        check_increasing(
            "predictive",
            &[self.surveillance, self.preparation, self.early_alert, self.critical],
        )
    }
}

/// Forecast horizon and per-model hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForecastConfig {
    pub horizon_weeks: usize,
    /// Regions with fewer observations are not forecast
    pub min_history_weeks: usize,
    /// Holdout length for backtest metrics; 0 disables the backtest
    pub backtest_weeks: usize,
    pub sarima: SarimaConfig,
    pub decomposition: DecompositionConfig,
    pub lstm: SequenceConfig,
    pub gbt: BoostedConfig,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            horizon_weeks: 156,
            min_history_weeks: 100,
            backtest_weeks: 0,
            sarima: SarimaConfig::default(),
            decomposition: DecompositionConfig::default(),
            lstm: SequenceConfig::default(),
            gbt: BoostedConfig::default(),
        }
    }
}

impl ForecastConfig {
    pub fn validate(&self) -> Result<()> {
        if self.horizon_weeks == 0 {
            return Err(DewsError::InvalidConfig("horizon_weeks must be positive".into()));
        }
        self.decomposition.validate()?;
        self.lstm.validate()?;
        self.gbt.validate()?;
        Ok(())
    }
}

/// Combination weights for the ensemble forecaster
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    pub weights: BTreeMap<ModelKind, f64>,
    /// Rescale the weights of the present models to 1.0 when some are missing
    pub renormalize_missing: bool,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        let weights = [
            (ModelKind::Sarima, 0.25),
            (ModelKind::Decomposition, 0.30),
            (ModelKind::Lstm, 0.25),
            (ModelKind::Gbt, 0.20),
        ]
        .into_iter()
        .collect();
        Self {
            weights,
            renormalize_missing: false,
        }
    }
}

impl EnsembleConfig {
    pub fn validate(&self) -> Result<()> {
        if self.weights.is_empty() {
            return Err(DewsError::InvalidConfig("ensemble has no weights".into()));
        }
        if let Some((kind, w)) = self.weights.iter().find(|(_, w)| !w.is_finite() || **w < 0.0) {
            return Err(DewsError::InvalidConfig(format!(
                "weight for {} must be a non-negative number, got {}",
                kind.name(),
                w
            )));
        }
        let total: f64 = self.weights.values().sum();
        if (total - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(DewsError::InvalidConfig(format!(
                "ensemble weights must sum to 1.0, got {}",
                total
            )));
        }
        Ok(())
    }
}

fn check_increasing(name: &str, ladder: &[f64]) -> Result<()> {
    let ordered = ladder.iter().all(|t| t.is_finite()) && ladder.windows(2).all(|w| w[0] < w[1]);
    if !ordered {
        return Err(DewsError::InvalidConfig(format!(
            "{} thresholds must be strictly increasing: {:?}",
            name, ladder
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.regions.len(), 5);
        assert_eq!(config.ensemble.weights[&ModelKind::Decomposition], 0.30);
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let mut ensemble = EnsembleConfig::default();
        ensemble.weights.insert(ModelKind::Gbt, 0.10);
        assert!(matches!(ensemble.validate(), Err(DewsError::InvalidConfig(_))));
    }

    #[test]
    fn test_thresholds_must_increase() {
        let retro = RetrospectiveConfig {
            medium: 1.0,
            ..Default::default()
        };
        assert!(retro.validate().is_err());

        let predictive = PredictiveThresholds {
            critical: 0.6,
            ..Default::default()
        };
        assert!(predictive.validate().is_err());
    }

    #[test]
    fn test_contamination_range() {
        let mut anomaly = AnomalyConfig::default();
        anomaly.contamination = 0.0;
        assert!(anomaly.validate().is_err());
        anomaly.contamination = 0.6;
        assert!(anomaly.validate().is_err());
        anomaly.contamination = 0.5;
        assert!(anomaly.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let json = r#"{
            "regions": ["LORETO"],
            "ensemble": { "renormalize_missing": true },
            "retrospective": { "window_weeks": 26 }
        }"#;
        let config: PipelineConfig = serde_json::from_str(json).unwrap();
        config.validate().unwrap();
        assert_eq!(config.regions, vec!["LORETO".to_string()]);
        assert!(config.ensemble.renormalize_missing);
        assert_eq!(config.ensemble.weights.len(), 4);
        assert_eq!(config.retrospective.window_weeks, 26);
        assert_eq!(config.retrospective.critical, 3.0);
        assert_eq!(config.forecast.horizon_weeks, 156);
    }
}
