//! Dengue early-warning pipeline.
//!
//! Weekly case counts per region go in; two kinds of risk alerts come out:
//! - retrospective: was this observed week abnormal? (z-score against a
//!   trailing baseline plus a three-detector outlier consensus)
//! - predictive: will an upcoming week be abnormal? (weighted ensemble of four
//!   forecasters against the region's historical mean)
//!
//! [`pipeline::Pipeline`] runs the stages in batch; every stage is also usable
//! on its own.

pub mod alerts;
pub mod algo;
pub mod anomaly;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod forecast;
pub mod pipeline;
pub mod series;
pub mod signal;
pub mod table;

pub use anomaly::AnomalyDetector;
pub use config::PipelineConfig;
pub use error::{DewsError, Result};
pub use pipeline::{Pipeline, RunSummary};
pub use series::{RegionSeries, WeeklyObservation};
pub use signal::{ForecastPoint, PredictiveAlert, PredictiveLevel, RetrospectiveAlert, RiskLevel};
