//! Consensus Anomaly Detector
//!
//! Per region, three unsupervised outlier detectors are trained on the same
//! engineered feature rows, each behind its own standardizer:
//! - Isolation forest (tree partitioning), seeded and built in parallel
//! - Local outlier factor in novelty mode (density ratio)
//! - One-class SVM with an RBF kernel and `nu = contamination` (boundary)
//!
//! An observation is a consensus anomaly when at least two detectors agree.
//! The ordered feature-name list is fixed by the first training call and
//! every later train/score call must present exactly the same list.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::algo::{IsolationForest, LocalOutlierFactor, OneClassSvm, StandardScaler};
use crate::checkpoint::{ArtifactEnvelope, ArtifactKind};
use crate::config::AnomalyConfig;
use crate::error::{DewsError, Result};
use crate::series::FeatureMatrix;
use crate::signal::AnomalyVerdict;

const MODEL_NAME: &str = "anomaly_detector";

/// Scalers and models for one region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RegionDetector {
    forest_scaler: StandardScaler,
    forest: IsolationForest,
    lof_scaler: StandardScaler,
    lof: LocalOutlierFactor,
    svm_scaler: StandardScaler,
    svm: OneClassSvm,
    trained_rows: usize,
}

impl RegionDetector {
    fn fit(rows: &[Vec<f64>], config: &AnomalyConfig) -> Result<Self> {
        let forest_scaler = StandardScaler::fit(rows);
        let forest = IsolationForest::fit(
            &forest_scaler.transform(rows),
            config.n_estimators,
            config.contamination,
            config.seed,
        )?;

        let lof_scaler = StandardScaler::fit(rows);
        let lof = LocalOutlierFactor::fit(&lof_scaler.transform(rows), config.n_neighbors, config.contamination)?;

        let svm_scaler = StandardScaler::fit(rows);
        let svm = OneClassSvm::fit(&svm_scaler.transform(rows), config.contamination)?;

        Ok(Self {
            forest_scaler,
            forest,
            lof_scaler,
            lof,
            svm_scaler,
            svm,
            trained_rows: rows.len(),
        })
    }

    fn verdict(&self, row: &[f64]) -> AnomalyVerdict {
        AnomalyVerdict::new(
            self.forest.is_outlier(&self.forest_scaler.transform_row(row)),
            self.lof.is_outlier(&self.lof_scaler.transform_row(row)),
            self.svm.is_outlier(&self.svm_scaler.transform_row(row)),
        )
    }
}

/// Trained detectors for one region, not yet registered
#[derive(Debug, Clone)]
pub struct RegionFit {
    region: String,
    feature_names: Vec<String>,
    detector: RegionDetector,
    dropped: usize,
}

impl RegionFit {
    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyDetector {
    config: AnomalyConfig,
    feature_names: Vec<String>,
    regions: BTreeMap<String, RegionDetector>,
}

impl AnomalyDetector {
    pub fn new(config: AnomalyConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            feature_names: Vec::new(),
            regions: BTreeMap::new(),
        })
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn regions(&self) -> impl Iterator<Item = &str> {
        self.regions.keys().map(String::as_str)
    }

    pub fn is_trained(&self, region: &str) -> bool {
        self.regions.contains_key(region)
    }

    /// Rows the region's detectors were fitted on.
    pub fn trained_rows(&self, region: &str) -> Option<usize> {
        self.regions.get(region).map(|d| d.trained_rows)
    }

    /// Detector with the feature list fixed up front.
    pub fn with_features(config: AnomalyConfig, feature_names: Vec<String>) -> Result<Self> {
        let mut detector = Self::new(config)?;
        detector.feature_names = feature_names;
        Ok(detector)
    }

    fn check_features(&self, matrix: &FeatureMatrix) -> Result<()> {
        if !self.feature_names.is_empty() && matrix.feature_names != self.feature_names {
            return Err(DewsError::FeatureMismatch {
                expected: self.feature_names.clone(),
                found: matrix.feature_names.clone(),
            });
        }
        Ok(())
    }

    /// Fit the three detectors for `region` without registering them.
    ///
    /// Rows with missing features are dropped first.
    pub fn fit_region(&self, region: &str, matrix: &FeatureMatrix) -> Result<RegionFit> {
        self.check_features(matrix)?;

        let mut complete = matrix.clone();
        let dropped = complete.drop_incomplete();
        if complete.len() < self.config.min_rows {
            return Err(DewsError::insufficient(
                region,
                MODEL_NAME,
                complete.len(),
                self.config.min_rows,
            ));
        }

        let detector = RegionDetector::fit(&complete.rows, &self.config)?;
        info!(
            region = %region,
            rows = complete.len(),
            dropped,
            support_vectors = detector.svm.support_count(),
            "anomaly detector trained"
        );
        Ok(RegionFit {
            region: region.to_string(),
            feature_names: matrix.feature_names.clone(),
            detector,
            dropped,
        })
    }

    /// Register a fit, replacing any earlier one for the same region.
    pub fn insert(&mut self, fit: RegionFit) -> Result<()> {
        if self.feature_names.is_empty() {
            self.feature_names = fit.feature_names;
        } else if fit.feature_names != self.feature_names {
            return Err(DewsError::FeatureMismatch {
                expected: self.feature_names.clone(),
                found: fit.feature_names,
            });
        }
        self.regions.insert(fit.region, fit.detector);
        Ok(())
    }

    /// Train and register the detectors for `region`. Returns the number of
    /// incomplete rows dropped.
    pub fn train(&mut self, region: &str, matrix: &FeatureMatrix) -> Result<usize> {
        let fit = self.fit_region(region, matrix)?;
        let dropped = fit.dropped;
        self.insert(fit)?;
        Ok(dropped)
    }

    /// Flag each row of `matrix` with the three detectors and their consensus.
    ///
    /// Rows must be complete; drop incomplete rows before scoring.
    pub fn score(&self, region: &str, matrix: &FeatureMatrix) -> Result<Vec<(NaiveDate, AnomalyVerdict)>> {
        let detector = self
            .regions
            .get(region)
            .ok_or_else(|| DewsError::ModelNotFitted(format!("{MODEL_NAME}/{region}")))?;
        if matrix.feature_names != self.feature_names {
            return Err(DewsError::FeatureMismatch {
                expected: self.feature_names.clone(),
                found: matrix.feature_names.clone(),
            });
        }
        if let Some(pos) = matrix.rows.iter().position(|r| r.iter().any(|v| !v.is_finite())) {
            return Err(DewsError::Schema(format!(
                "missing feature value for {} on {}",
                region, matrix.dates[pos]
            )));
        }

        let verdicts: Vec<(NaiveDate, AnomalyVerdict)> = matrix
            .dates
            .iter()
            .zip(&matrix.rows)
            .map(|(date, row)| (*date, detector.verdict(row)))
            .collect();
        debug!(
            region = %region,
            rows = verdicts.len(),
            consensus = verdicts.iter().filter(|(_, v)| v.consensus_flag).count(),
            "anomaly scoring complete"
        );
        Ok(verdicts)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| DewsError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| DewsError::Deserialization(e.to_string()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        ArtifactEnvelope::seal(ArtifactKind::AnomalyDetector, "", self.to_bytes()?).write(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let payload = ArtifactEnvelope::read(path)?.open(ArtifactKind::AnomalyDetector)?;
        Self::from_bytes(&payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn names() -> Vec<String> {
        vec!["casos_lag_1".into(), "casos_rolling_mean_4".into()]
    }

    /// Tight cluster with a far outlier as the last row.
    fn matrix(n: usize) -> FeatureMatrix {
        let mut rng = StdRng::seed_from_u64(3);
        let start = NaiveDate::from_ymd_opt(2020, 1, 6).unwrap();
        let mut rows: Vec<Vec<f64>> = (0..n - 1)
            .map(|_| vec![50.0 + rng.random_range(-5.0..5.0), 50.0 + rng.random_range(-5.0..5.0)])
            .collect();
        rows.push(vec![400.0, 380.0]);
        FeatureMatrix {
            feature_names: names(),
            dates: (0..n).map(|i| start + Duration::weeks(i as i64)).collect(),
            rows,
        }
    }

    #[test]
    fn test_far_point_is_consensus_anomaly() {
        let mut detector = AnomalyDetector::new(AnomalyConfig::default()).unwrap();
        assert_eq!(detector.train("PIURA", &matrix(120)).unwrap(), 0);
        assert_eq!(detector.trained_rows("PIURA"), Some(120));

        let verdicts = detector.score("PIURA", &matrix(120)).unwrap();
        assert_eq!(verdicts.len(), 120);
        let (_, last) = verdicts[119];
        assert!(last.consensus_flag);
        let flagged = verdicts.iter().filter(|(_, v)| v.consensus_flag).count();
        assert!(flagged < 30, "{flagged} consensus anomalies");
    }

    #[test]
    fn test_incomplete_rows_dropped_before_gate() {
        let mut m = matrix(55);
        for row in m.rows.iter_mut().take(10) {
            row[0] = f64::NAN;
        }
        let mut detector = AnomalyDetector::new(AnomalyConfig::default()).unwrap();
        let err = detector.train("TUMBES", &m).unwrap_err();
        assert!(matches!(err, DewsError::InsufficientData { rows: 45, required: 50, .. }));
    }

    #[test]
    fn test_feature_mismatch_and_unknown_region() {
        let mut detector = AnomalyDetector::new(AnomalyConfig::default()).unwrap();
        detector.train("PIURA", &matrix(80)).unwrap();

        let mut other = matrix(80);
        other.feature_names.reverse();
        assert!(matches!(detector.score("PIURA", &other), Err(DewsError::FeatureMismatch { .. })));
        assert!(matches!(detector.train("ICA", &other), Err(DewsError::FeatureMismatch { .. })));
        assert!(matches!(detector.score("LORETO", &matrix(80)), Err(DewsError::ModelNotFitted(_))));
    }

    #[test]
    fn test_save_load_reproduces_scores() {
        let mut detector = AnomalyDetector::new(AnomalyConfig::default()).unwrap();
        detector.train("PIURA", &matrix(90)).unwrap();
        let before = detector.score("PIURA", &matrix(90)).unwrap();

        let path = std::env::temp_dir().join(format!("dews-anomaly-{}.bin", uuid::Uuid::new_v4()));
        detector.save(&path).unwrap();
        let restored = AnomalyDetector::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(restored.feature_names(), detector.feature_names());
        assert_eq!(restored.score("PIURA", &matrix(90)).unwrap(), before);
    }
}
