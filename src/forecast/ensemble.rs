//! Weighted ensemble over the per-region forecasters.
//!
//! The ensemble holds shared references to fitted models and owns the
//! combination weights. Models that are absent or unfitted are skipped at
//! predict time and their weight is dropped: the combined forecast under-sums
//! unless `renormalize_missing` is set.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use super::{ForecastOutput, Forecaster, ModelKind};
use crate::config::EnsembleConfig;
use crate::error::{DewsError, Result};

/// Per-model outputs next to their combination
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndividualPredictions {
    pub members: BTreeMap<ModelKind, ForecastOutput>,
    pub ensemble: ForecastOutput,
}

pub struct EnsembleForecaster {
    region: String,
    config: EnsembleConfig,
    models: BTreeMap<ModelKind, Arc<dyn Forecaster>>,
}

impl EnsembleForecaster {
    /// Fails with `InvalidConfig` unless the weights sum to 1.0.
    pub fn new(region: impl Into<String>, config: EnsembleConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            region: region.into(),
            config,
            models: BTreeMap::new(),
        })
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Register a model under its kind; kinds without a weight are rejected.
    pub fn add_model(&mut self, kind: ModelKind, model: Arc<dyn Forecaster>) -> Result<()> {
        if !self.config.weights.contains_key(&kind) {
            return Err(DewsError::InvalidConfig(format!(
                "no ensemble weight configured for {kind}"
            )));
        }
        self.models.insert(kind, model);
        Ok(())
    }

    pub fn model_count(&self) -> usize {
        self.models.len()
    }

    fn member_outputs(&self, steps: usize) -> Result<BTreeMap<ModelKind, ForecastOutput>> {
        let mut outputs = BTreeMap::new();
        for (kind, model) in &self.models {
            if !model.is_fitted() {
                warn!(region = %self.region, model = %kind, "skipping unfitted ensemble member");
                continue;
            }
            outputs.insert(*kind, model.predict(steps)?);
        }
        Ok(outputs)
    }

    fn combine(&self, outputs: &BTreeMap<ModelKind, ForecastOutput>, steps: usize) -> Result<ForecastOutput> {
        if outputs.is_empty() {
            return Err(DewsError::EmptyEnsemble(self.region.clone()));
        }

        let present: f64 = outputs.keys().map(|k| self.config.weights[k]).sum();
        let scale = if self.config.renormalize_missing && present > 0.0 {
            1.0 / present
        } else {
            1.0
        };
        if outputs.len() < self.config.weights.len() {
            debug!(
                region = %self.region,
                members = outputs.len(),
                weight = present,
                renormalized = self.config.renormalize_missing,
                "ensemble combining partial model set"
            );
        }

        let mut combined = ForecastOutput::zeros(steps);
        for (kind, output) in outputs {
            let w = self.config.weights[kind] * scale;
            for i in 0..steps {
                combined.point[i] += w * output.point[i];
                combined.lower[i] += w * output.lower[i];
                combined.upper[i] += w * output.upper[i];
            }
        }
        Ok(combined)
    }

    /// Weighted sum of the members' point, lower and upper arrays.
    pub fn predict(&self, steps: usize) -> Result<ForecastOutput> {
        let outputs = self.member_outputs(steps)?;
        self.combine(&outputs, steps)
    }

    pub fn get_individual_predictions(&self, steps: usize) -> Result<IndividualPredictions> {
        let members = self.member_outputs(steps)?;
        let ensemble = self.combine(&members, steps)?;
        Ok(IndividualPredictions { members, ensemble })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::RegionSeries;

    struct Constant {
        kind: ModelKind,
        value: f64,
        fitted: bool,
    }

    impl Forecaster for Constant {
        fn kind(&self) -> ModelKind {
            self.kind
        }

        fn is_fitted(&self) -> bool {
            self.fitted
        }

        fn fit(&mut self, _series: &RegionSeries) -> Result<()> {
            self.fitted = true;
            Ok(())
        }

        fn predict(&self, steps: usize) -> Result<ForecastOutput> {
            Ok(ForecastOutput::with_relative_band(vec![self.value; steps], 0.1))
        }

        fn to_bytes(&self) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    fn constant(kind: ModelKind, value: f64) -> Arc<dyn Forecaster> {
        Arc::new(Constant {
            kind,
            value,
            fitted: true,
        })
    }

    #[test]
    fn test_missing_models_under_sum() {
        let mut ensemble = EnsembleForecaster::new("CUSCO", EnsembleConfig::default()).unwrap();
        ensemble.add_model(ModelKind::Sarima, constant(ModelKind::Sarima, 100.0)).unwrap();
        ensemble
            .add_model(ModelKind::Decomposition, constant(ModelKind::Decomposition, 100.0))
            .unwrap();

        let out = ensemble.predict(3).unwrap();
        assert_eq!(out.len(), 3);
        for p in &out.point {
            assert!((p - 55.0).abs() < 1e-9);
        }
        assert!((out.lower[0] - 49.5).abs() < 1e-9);
    }

    #[test]
    fn test_renormalize_missing_opt_in() {
        let config = EnsembleConfig {
            renormalize_missing: true,
            ..Default::default()
        };
        let mut ensemble = EnsembleForecaster::new("CUSCO", config).unwrap();
        ensemble.add_model(ModelKind::Sarima, constant(ModelKind::Sarima, 100.0)).unwrap();
        ensemble
            .add_model(ModelKind::Decomposition, constant(ModelKind::Decomposition, 100.0))
            .unwrap();
        assert!((ensemble.predict(1).unwrap().point[0] - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_unfitted_members_skipped() {
        let mut ensemble = EnsembleForecaster::new("ICA", EnsembleConfig::default()).unwrap();
        ensemble.add_model(ModelKind::Gbt, constant(ModelKind::Gbt, 50.0)).unwrap();
        ensemble
            .add_model(
                ModelKind::Lstm,
                Arc::new(Constant {
                    kind: ModelKind::Lstm,
                    value: 1000.0,
                    fitted: false,
                }),
            )
            .unwrap();

        let all = ensemble.get_individual_predictions(2).unwrap();
        assert_eq!(all.members.len(), 1);
        assert!((all.ensemble.point[1] - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_ensemble_and_bad_weights() {
        let ensemble = EnsembleForecaster::new("ICA", EnsembleConfig::default()).unwrap();
        assert!(matches!(ensemble.predict(4), Err(DewsError::EmptyEnsemble(r)) if r == "ICA"));

        let mut config = EnsembleConfig::default();
        config.weights.insert(ModelKind::Sarima, 0.15);
        assert!(EnsembleForecaster::new("ICA", config).is_err());
    }

    #[test]
    fn test_unweighted_kind_rejected() {
        let mut config = EnsembleConfig::default();
        config.weights.remove(&ModelKind::Gbt);
        config.weights.insert(ModelKind::Lstm, 0.45);
        let mut ensemble = EnsembleForecaster::new("ICA", config).unwrap();
        assert!(ensemble.add_model(ModelKind::Gbt, constant(ModelKind::Gbt, 1.0)).is_err());
    }
}
