//! Batch Pipeline
//!
//! Runs the stages strictly forward:
//!
//! ```text
//! series ─┬─> anomaly detectors ─> retrospective alerts
//!         └─> forecasters ─> ensemble ─> predictive alerts
//! ```
//!
//! Key features:
//! - Region-parallel stages on a scoped worker pool fed by a bounded
//!   crossbeam job queue; each job owns one region's models
//! - Per-(region, model) failures that `DewsError::is_contained` accepts are
//!   logged and skipped; anything else aborts the run
//! - One `{region}_{model}.bin` artifact per trained forecaster, so the
//!   predict-only path can run without retraining
//! - Every log line of a run carries its uuid through the `run` span

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use chrono::NaiveDate;
use crossbeam_channel::bounded;
use serde::Serialize;
use tracing::{Span, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::alerts::predictive::CRITICAL_LEVELS;
use crate::alerts::{PredictiveClassifier, RetrospectiveClassifier, level_distribution, region_report};
use crate::anomaly::AnomalyDetector;
use crate::checkpoint::{ANOMALY_ARTIFACT, ArtifactEnvelope, ArtifactKind, artifact_path};
use crate::config::PipelineConfig;
use crate::error::{DewsError, Result};
use crate::forecast::history::future_weeks;
use crate::forecast::metrics::backtest;
use crate::forecast::{ENSEMBLE_NAME, EnsembleForecaster, Forecaster, ModelKind, build_forecaster, load_forecaster};
use crate::series::{FeatureMatrix, RegionSeries, WeeklyObservation, feature_names};
use crate::signal::{ForecastPoint, PredictiveAlert, RetrospectiveAlert};
use crate::table;

/// Fitted forecasters of one region
pub struct RegionModels {
    pub region: String,
    pub last_date: NaiveDate,
    pub models: BTreeMap<ModelKind, Arc<dyn Forecaster>>,
}

/// Per-region anomaly consensus counts by week
pub type ConsensusCounts = BTreeMap<String, BTreeMap<NaiveDate, u8>>;

/// Counts reported at the end of a run
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub regions: usize,
    pub anomaly_regions: usize,
    pub retrospective_alerts: usize,
    pub active_alerts: usize,
    pub forecast_regions: usize,
    pub forecast_rows: usize,
    pub skipped_models: usize,
    pub predictive_alerts: usize,
    pub critical_predictive_alerts: usize,
}

/// Run `work` over `jobs` on `workers` named threads; results keep job order.
fn run_parallel<J, R, F>(workers: usize, jobs: Vec<J>, work: F) -> Result<Vec<R>>
where
    J: Send,
    R: Send,
    F: Fn(J) -> R + Sync,
{
    let n = jobs.len();
    if n == 0 {
        return Ok(Vec::new());
    }
    let (job_tx, job_rx) = bounded::<(usize, J)>(n);
    let (out_tx, out_rx) = bounded::<(usize, R)>(n);
    for job in jobs.into_iter().enumerate() {
        if job_tx.send(job).is_err() {
            break;
        }
    }
    drop(job_tx);

    let span = Span::current();
    thread::scope(|scope| -> std::io::Result<()> {
        for id in 0..workers.clamp(1, n) {
            let rx = job_rx.clone();
            let tx = out_tx.clone();
            let work = &work;
            let span = span.clone();
            thread::Builder::new()
                .name(format!("dews-worker-{}", id))
                .spawn_scoped(scope, move || {
                    let _guard = span.enter();
                    while let Ok((index, job)) = rx.recv() {
                        if tx.send((index, work(job))).is_err() {
                            break;
                        }
                    }
                    debug!(worker = id, "worker drained");
                })?;
        }
        Ok(())
    })?;
    drop(out_tx);

    let mut results: Vec<(usize, R)> = out_rx.iter().collect();
    if results.len() != n {
        return Err(DewsError::Io(std::io::Error::other(format!(
            "{} of {} jobs completed",
            results.len(),
            n
        ))));
    }
    results.sort_by_key(|(index, _)| *index);
    Ok(results.into_iter().map(|(_, r)| r).collect())
}

/// Log and drop a contained failure; pass anything else through.
fn contain<T>(result: Result<T>, region: &str, stage: &str) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_contained() => {
            warn!(region = %region, stage, error = %e, "skipping after contained failure");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    run_id: Uuid,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            run_id: Uuid::new_v4(),
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Keep only the regions under surveillance.
    fn select<'a, T>(&self, items: impl IntoIterator<Item = (&'a String, T)>) -> Vec<(&'a String, T)> {
        items
            .into_iter()
            .filter(|(region, _)| self.config.regions.contains(region))
            .collect()
    }

    /// Train anomaly detectors for every region with enough complete rows.
    pub fn train_anomaly(&self, observations: &[WeeklyObservation]) -> Result<AnomalyDetector> {
        let names = feature_names(observations);
        let mut detector = AnomalyDetector::with_features(self.config.anomaly.clone(), names.clone())?;

        let mut regions: Vec<String> = observations.iter().map(|o| o.region.clone()).collect();
        regions.sort();
        regions.dedup();
        let regions: Vec<String> = self
            .select(regions.iter().map(|r| (r, ())))
            .into_iter()
            .map(|(r, _)| r.clone())
            .collect();

        let fits = run_parallel(self.config.workers, regions, |region| {
            let matrix = FeatureMatrix::from_observations(observations, &region, &names);
            let fit = detector.fit_region(&region, &matrix);
            (region, fit)
        })?;
        for (region, fit) in fits {
            if let Some(fit) = contain(fit, &region, "anomaly")? {
                detector.insert(fit)?;
            }
        }
        Ok(detector)
    }

    /// Consensus counts for the complete rows of every trained region.
    pub fn score_anomalies(
        &self,
        detector: &AnomalyDetector,
        observations: &[WeeklyObservation],
    ) -> Result<ConsensusCounts> {
        let mut counts = ConsensusCounts::new();
        let regions: Vec<String> = detector.regions().map(str::to_string).collect();
        for region in regions {
            let mut matrix = FeatureMatrix::from_observations(observations, &region, detector.feature_names());
            matrix.drop_incomplete();
            let verdicts = detector.score(&region, &matrix)?;
            counts.insert(
                region,
                verdicts.into_iter().map(|(d, v)| (d, v.consensus_count())).collect(),
            );
        }
        Ok(counts)
    }

    pub fn retrospective_alerts(
        &self,
        series: &BTreeMap<String, RegionSeries>,
        consensus: &ConsensusCounts,
    ) -> Result<Vec<RetrospectiveAlert>> {
        let classifier = RetrospectiveClassifier::new(self.config.retrospective.clone())?;
        let empty = BTreeMap::new();
        let alerts: Vec<RetrospectiveAlert> = self
            .select(series.iter())
            .into_iter()
            .flat_map(|(region, s)| classifier.classify_series(s, consensus.get(region).unwrap_or(&empty)))
            .collect();
        for share in level_distribution(&alerts) {
            info!(level = %share.level, count = share.count, share = share.percentage, "retrospective alert distribution");
        }
        Ok(alerts)
    }

    fn fit_region(&self, series: &RegionSeries) -> Result<RegionModels> {
        let forecast = &self.config.forecast;
        let mut models = BTreeMap::new();
        for kind in ModelKind::ALL {
            let mut model = build_forecaster(kind, forecast);
            let fitted = model.fit(series).map_err(|e| {
                if !e.is_contained() {
                    error!(region = %series.region(), model = %kind, error = %e, "forecaster failed");
                }
                e
            });
            if contain(fitted, series.region(), kind.name())?.is_some() {
                models.insert(kind, Arc::from(model));
            }
        }

        if forecast.backtest_weeks > 0 {
            for kind in models.keys() {
                let metrics = backtest(*kind, forecast, series, forecast.backtest_weeks);
                if let Some(m) = contain(metrics, series.region(), "backtest")? {
                    info!(
                        region = %series.region(),
                        model = %kind,
                        mae = m.mae,
                        rmse = m.rmse,
                        mape = m.mape,
                        "holdout backtest"
                    );
                }
            }
        }

        let last_date = series
            .last_date()
            .ok_or_else(|| DewsError::insufficient(series.region(), "forecast", 0, 1))?;
        Ok(RegionModels {
            region: series.region().to_string(),
            last_date,
            models,
        })
    }

    /// Fit all four forecasters for every region with enough history.
    pub fn train_forecasters(&self, series: &BTreeMap<String, RegionSeries>) -> Result<Vec<RegionModels>> {
        let min_history = self.config.forecast.min_history_weeks;
        let eligible: Vec<&RegionSeries> = self
            .select(series.iter())
            .into_iter()
            .filter_map(|(region, s)| {
                if s.len() < min_history {
                    warn!(region = %region, weeks = s.len(), required = min_history, "not enough history to forecast");
                    None
                } else {
                    Some(s)
                }
            })
            .collect();

        let results = run_parallel(self.config.workers, eligible, |s| self.fit_region(s))?;
        let trained: Vec<RegionModels> = results.into_iter().collect::<Result<_>>()?;
        for region in &trained {
            info!(region = %region.region, models = region.models.len(), "forecasters trained");
        }
        Ok(trained)
    }

    pub fn save_forecasters(&self, trained: &[RegionModels], dir: &Path) -> Result<()> {
        for region in trained {
            for (kind, model) in &region.models {
                let envelope =
                    ArtifactEnvelope::seal(ArtifactKind::Forecaster(*kind), region.region.clone(), model.to_bytes()?);
                envelope.write(&artifact_path(dir, &region.region, *kind))?;
            }
        }
        Ok(())
    }

    /// Load whatever artifacts exist for the selected regions. Missing
    /// artifacts drop that model from the region.
    pub fn load_forecasters(&self, series: &BTreeMap<String, RegionSeries>, dir: &Path) -> Result<Vec<RegionModels>> {
        let mut loaded = Vec::new();
        for (region, s) in self.select(series.iter()) {
            let Some(last_date) = s.last_date() else {
                continue;
            };
            let mut models = BTreeMap::new();
            for kind in ModelKind::ALL {
                let kind_tag = ArtifactKind::Forecaster(kind);
                match ArtifactEnvelope::read(&artifact_path(dir, region, kind)) {
                    Ok(envelope) => {
                        let model = load_forecaster(kind, &envelope.open(kind_tag)?)?;
                        models.insert(kind, Arc::from(model));
                    }
                    Err(DewsError::MissingArtifact(path)) => {
                        debug!(region = %region, model = %kind, path = %path.display(), "no artifact");
                    }
                    Err(e) => return Err(e),
                }
            }
            if models.is_empty() {
                warn!(region = %region, "no forecaster artifacts found");
                continue;
            }
            loaded.push(RegionModels {
                region: region.clone(),
                last_date,
                models,
            });
        }
        Ok(loaded)
    }

    /// Member and ensemble forecast points for every region.
    pub fn forecast(&self, trained: &[RegionModels]) -> Result<Vec<ForecastPoint>> {
        let steps = self.config.forecast.horizon_weeks;
        let mut points = Vec::new();
        for region in trained {
            let mut ensemble = EnsembleForecaster::new(region.region.clone(), self.config.ensemble.clone())?;
            for (kind, model) in &region.models {
                ensemble.add_model(*kind, Arc::clone(model))?;
            }
            let predictions = match ensemble.get_individual_predictions(steps) {
                Ok(p) => p,
                Err(DewsError::EmptyEnsemble(r)) => {
                    warn!(region = %r, "no fitted forecasters; region not forecast");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let dates = future_weeks(region.last_date, steps);
            for (kind, output) in &predictions.members {
                points.extend(output.to_points(&region.region, kind.name(), &dates));
            }
            points.extend(predictions.ensemble.to_points(&region.region, ENSEMBLE_NAME, &dates));
        }
        Ok(points)
    }

    pub fn predictive_alerts(
        &self,
        forecasts: &[ForecastPoint],
        series: &BTreeMap<String, RegionSeries>,
    ) -> Result<Vec<PredictiveAlert>> {
        let classifier = PredictiveClassifier::new(self.config.predictive.clone())?;
        let means: BTreeMap<String, f64> = series.iter().map(|(r, s)| (r.clone(), s.mean())).collect();
        Ok(classifier.classify_forecasts(forecasts, &means))
    }

    fn load_observations(&self) -> Result<Option<Vec<WeeklyObservation>>> {
        let path = &self.config.paths.features_csv;
        if !path.exists() {
            warn!(path = %path.display(), "feature table not found; anomaly stage skipped");
            return Ok(None);
        }
        table::read_features_csv(path).map(Some)
    }

    /// Forecast from saved artifacts and derive predictive alerts.
    fn predict_stage(
        &self,
        trained: &[RegionModels],
        series: &BTreeMap<String, RegionSeries>,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let out = &self.config.paths.output_dir;
        let forecasts = self.forecast(trained)?;
        table::write_forecasts(&out.join("forecasts.csv"), &forecasts)?;

        let alerts = self.predictive_alerts(&forecasts, series)?;
        let classifier = PredictiveClassifier::new(self.config.predictive.clone())?;
        let critical = classifier.filter_critical(&alerts, &CRITICAL_LEVELS);
        table::write_records(&out.join("predictive_alerts.csv"), &alerts)?;
        table::write_records(&out.join("critical_predictive_alerts.csv"), &critical)?;

        summary.forecast_regions = trained.len();
        summary.forecast_rows = forecasts.iter().filter(|p| p.model_name == ENSEMBLE_NAME).count();
        summary.predictive_alerts = alerts.len();
        summary.critical_predictive_alerts = critical.len();
        Ok(())
    }

    /// Full batch: train everything, persist artifacts, write every table.
    pub fn run(&self) -> Result<RunSummary> {
        let span = info_span!("run", run_id = %self.run_id);
        let _guard = span.enter();
        let paths = &self.config.paths;
        info!(series = %paths.series_csv.display(), workers = self.config.workers, "pipeline started");

        let series = table::read_series_csv(&paths.series_csv)?;
        let mut summary = RunSummary {
            run_id: self.run_id.to_string(),
            regions: series.len(),
            ..Default::default()
        };

        let consensus = match self.load_observations()? {
            Some(observations) => {
                let detector = self.train_anomaly(&observations)?;
                detector.save(&paths.artifact_dir.join(ANOMALY_ARTIFACT))?;
                summary.anomaly_regions = detector.regions().count();
                self.score_anomalies(&detector, &observations)?
            }
            None => ConsensusCounts::new(),
        };

        let retrospective = self.retrospective_alerts(&series, &consensus)?;
        let classifier = RetrospectiveClassifier::new(self.config.retrospective.clone())?;
        let active = classifier.filter_active(&retrospective);
        table::write_records(&paths.output_dir.join("retrospective_alerts.csv"), &retrospective)?;
        table::write_records(&paths.output_dir.join("active_alerts.csv"), &active)?;
        table::write_records(&paths.output_dir.join("alert_report.csv"), &region_report(&retrospective))?;
        summary.retrospective_alerts = retrospective.len();
        summary.active_alerts = active.len();

        let trained = self.train_forecasters(&series)?;
        self.save_forecasters(&trained, &paths.artifact_dir)?;
        summary.skipped_models = trained
            .iter()
            .map(|r| ModelKind::ALL.len() - r.models.len())
            .sum();
        self.predict_stage(&trained, &series, &mut summary)?;

        info!(
            retrospective = summary.retrospective_alerts,
            active = summary.active_alerts,
            predictive = summary.predictive_alerts,
            critical = summary.critical_predictive_alerts,
            "pipeline finished"
        );
        Ok(summary)
    }

    /// Forecast and alert from previously saved artifacts, without training.
    pub fn predict_from_artifacts(&self) -> Result<RunSummary> {
        let span = info_span!("predict", run_id = %self.run_id);
        let _guard = span.enter();
        let paths = &self.config.paths;

        let series = table::read_series_csv(&paths.series_csv)?;
        let trained = self.load_forecasters(&series, &paths.artifact_dir)?;
        let mut summary = RunSummary {
            run_id: self.run_id.to_string(),
            regions: series.len(),
            ..Default::default()
        };
        self.predict_stage(&trained, &series, &mut summary)?;
        info!(
            regions = summary.forecast_regions,
            predictive = summary.predictive_alerts,
            "prediction from artifacts finished"
        );
        Ok(summary)
    }
}
