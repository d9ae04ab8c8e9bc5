//! Alert Classification
//!
//! Turns model outputs into tiered risk alerts:
//! - `retrospective`: observed counts vs. a trailing baseline, combined with
//!   the anomaly consensus
//! - `predictive`: ensemble forecasts vs. the all-time regional mean, with a
//!   static recommendation table
//! - `report`: per-region summaries and level distributions

pub mod predictive;
pub mod report;
pub mod retrospective;

pub use predictive::{PredictiveClassifier, Recommendation, recommendations};
pub use report::{LevelShare, RegionReport, level_distribution, predictive_distribution, region_report};
pub use retrospective::{RetrospectiveClassifier, z_score};
