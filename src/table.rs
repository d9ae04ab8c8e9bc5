//! Flat CSV inputs and outputs.
//!
//! Inputs come from the upstream preprocessing stage:
//! - clean series: `departamento,fecha,casos`
//! - feature series: the same columns plus numeric feature columns, where an
//!   empty cell is a missing value
//!
//! Outputs are the tables read by the dashboard. The forecast table is wide:
//! one row per (region, week), with `point_<model>`, `lower_<model>` and
//! `upper_<model>` for every model and the ensemble.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::NaiveDate;
use csv::StringRecord;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{DewsError, Result};
use crate::forecast::{ENSEMBLE_NAME, ModelKind};
use crate::series::{RegionSeries, WeeklyObservation};
use crate::signal::ForecastPoint;

pub const REGION_COLUMN: &str = "departamento";
pub const DATE_COLUMN: &str = "fecha";
pub const CASES_COLUMN: &str = "casos";

#[derive(Debug, Deserialize)]
struct SeriesRow {
    departamento: String,
    fecha: NaiveDate,
    casos: f64,
}

fn column_index(headers: &StringRecord, name: &str, path: &Path) -> Result<usize> {
    headers.iter().position(|h| h.trim() == name).ok_or_else(|| {
        DewsError::Schema(format!("{} is missing required column {}", path.display(), name))
    })
}

fn require_columns(headers: &StringRecord, names: &[&str], path: &Path) -> Result<()> {
    for name in names {
        column_index(headers, name, path)?;
    }
    Ok(())
}

fn parse_date(value: &str, path: &Path) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|e| DewsError::Schema(format!("{}: bad date {:?}: {}", path.display(), value, e)))
}

/// Empty cells are missing values.
fn parse_number(value: &str, column: &str, path: &Path) -> Result<f64> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(f64::NAN);
    }
    value.parse::<f64>().map_err(|e| {
        DewsError::Schema(format!("{}: bad value {:?} in {}: {}", path.display(), value, column, e))
    })
}

/// Read the clean weekly series, grouped by region.
pub fn read_series_csv(path: &Path) -> Result<BTreeMap<String, RegionSeries>> {
    let mut reader = csv::Reader::from_path(path)?;
    require_columns(reader.headers()?, &[REGION_COLUMN, DATE_COLUMN, CASES_COLUMN], path)?;

    let mut grouped: BTreeMap<String, Vec<(NaiveDate, f64)>> = BTreeMap::new();
    for row in reader.deserialize::<SeriesRow>() {
        let row = row?;
        grouped.entry(row.departamento).or_default().push((row.fecha, row.casos));
    }

    let series = grouped
        .into_iter()
        .map(|(region, points)| Ok((region.clone(), RegionSeries::new(region, points)?)))
        .collect::<Result<BTreeMap<_, _>>>()?;
    debug!(path = %path.display(), regions = series.len(), "series loaded");
    Ok(series)
}

/// Read the feature-augmented series. Every column besides region, date and
/// cases is a feature.
pub fn read_features_csv(path: &Path) -> Result<Vec<WeeklyObservation>> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();
    let region_idx = column_index(&headers, REGION_COLUMN, path)?;
    let date_idx = column_index(&headers, DATE_COLUMN, path)?;
    let cases_idx = column_index(&headers, CASES_COLUMN, path)?;
    let feature_columns: Vec<(usize, String)> = headers
        .iter()
        .enumerate()
        .filter(|(i, _)| ![region_idx, date_idx, cases_idx].contains(i))
        .map(|(i, name)| (i, name.trim().to_string()))
        .collect();

    let mut observations = Vec::new();
    for record in reader.records() {
        let record = record?;
        let field = |i: usize| record.get(i).unwrap_or("");
        let cases = parse_number(field(cases_idx), CASES_COLUMN, path)?;
        if !cases.is_finite() || cases < 0.0 {
            return Err(DewsError::Schema(format!(
                "{}: invalid case count {:?}",
                path.display(),
                field(cases_idx)
            )));
        }

        let mut engineered_features = BTreeMap::new();
        for (i, name) in &feature_columns {
            engineered_features.insert(name.clone(), parse_number(field(*i), name, path)?);
        }
        observations.push(WeeklyObservation {
            region: field(region_idx).trim().to_string(),
            week_start_date: parse_date(field(date_idx), path)?,
            case_count: cases.round() as u32,
            engineered_features,
        });
    }
    debug!(
        path = %path.display(),
        rows = observations.len(),
        features = feature_columns.len(),
        "features loaded"
    );
    Ok(observations)
}

/// Write serializable records with a header row.
pub fn write_records<T: Serialize>(path: &Path, records: &[T]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    debug!(path = %path.display(), rows = records.len(), "table written");
    Ok(())
}

/// Model column order of the forecast table.
pub fn forecast_models() -> Vec<&'static str> {
    ModelKind::ALL
        .iter()
        .map(|k| k.name())
        .chain(std::iter::once(ENSEMBLE_NAME))
        .collect()
}

fn forecast_header() -> Vec<String> {
    let mut header = vec!["region".to_string(), "target_week_date".to_string()];
    for model in forecast_models() {
        header.push(format!("point_{model}"));
        header.push(format!("lower_{model}"));
        header.push(format!("upper_{model}"));
    }
    header
}

/// Write forecast points in wide form. Models without a value for a week
/// leave their cells empty.
pub fn write_forecasts(path: &Path, points: &[ForecastPoint]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let models = forecast_models();
    let mut rows: BTreeMap<(&str, NaiveDate), Vec<Option<&ForecastPoint>>> = BTreeMap::new();
    for point in points {
        let Some(slot) = models.iter().position(|m| *m == point.model_name) else {
            warn!(model = %point.model_name, "dropping forecast for unknown model");
            continue;
        };
        let row = rows
            .entry((point.region.as_str(), point.target_week_date))
            .or_insert_with(|| vec![None; models.len()]);
        row[slot] = Some(point);
    }

    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(forecast_header())?;
    for ((region, date), slots) in &rows {
        let mut record = vec![region.to_string(), date.to_string()];
        for slot in slots {
            match slot {
                Some(p) => {
                    record.push(p.point_estimate.to_string());
                    record.push(p.lower_bound.to_string());
                    record.push(p.upper_bound.to_string());
                }
                None => record.extend(std::iter::repeat_n(String::new(), 3)),
            }
        }
        writer.write_record(&record)?;
    }
    writer.flush()?;
    debug!(path = %path.display(), rows = rows.len(), "forecast table written");
    Ok(())
}

/// Read a forecast table written by [`write_forecasts`].
///
/// An absent file is not an error: downstream stages report no data.
pub fn read_forecasts(path: &Path) -> Result<Option<Vec<ForecastPoint>>> {
    if !path.exists() {
        warn!(path = %path.display(), "forecast table not found");
        return Ok(None);
    }

    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();
    let region_idx = column_index(&headers, "region", path)?;
    let date_idx = column_index(&headers, "target_week_date", path)?;
    let mut columns = Vec::new();
    for model in forecast_models() {
        let point = column_index(&headers, &format!("point_{model}"), path)?;
        let lower = column_index(&headers, &format!("lower_{model}"), path)?;
        let upper = column_index(&headers, &format!("upper_{model}"), path)?;
        columns.push((model, point, lower, upper));
    }

    let mut points = Vec::new();
    for record in reader.records() {
        let record = record?;
        let field = |i: usize| record.get(i).unwrap_or("");
        let region = field(region_idx).to_string();
        let date = parse_date(field(date_idx), path)?;
        for (model, p, l, u) in &columns {
            let point = parse_number(field(*p), model, path)?;
            if point.is_nan() {
                continue;
            }
            points.push(ForecastPoint {
                region: region.clone(),
                target_week_date: date,
                model_name: model.to_string(),
                point_estimate: point,
                lower_bound: parse_number(field(*l), model, path)?,
                upper_bound: parse_number(field(*u), model, path)?,
            });
        }
    }
    Ok(Some(points))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("dews-table-{}", uuid::Uuid::new_v4()))
            .join(name)
    }

    fn write(path: &Path, body: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    #[test]
    fn test_series_grouped_and_sorted() {
        let path = temp_path("series.csv");
        write(
            &path,
            "departamento,fecha,casos\nPIURA,2024-01-08,12\nICA,2024-01-01,3\nPIURA,2024-01-01,10\n",
        );
        let series = read_series_csv(&path).unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series["PIURA"].values(), &[10.0, 12.0]);
    }

    #[test]
    fn test_missing_column_is_schema_error() {
        let path = temp_path("series.csv");
        write(&path, "region,fecha,casos\nPIURA,2024-01-08,12\n");
        assert!(matches!(read_series_csv(&path), Err(DewsError::Schema(_))));
    }

    #[test]
    fn test_features_empty_cell_is_missing() {
        let path = temp_path("features.csv");
        write(
            &path,
            "departamento,fecha,casos,casos_lag_1,mes_sin\nICA,2024-01-01,3,,0.5\nICA,2024-01-08,4,3,0.6\n",
        );
        let obs = read_features_csv(&path).unwrap();
        assert_eq!(obs.len(), 2);
        assert!(obs[0].engineered_features["casos_lag_1"].is_nan());
        assert_eq!(obs[1].engineered_features["casos_lag_1"], 3.0);
        assert_eq!(obs[1].case_count, 4);
    }

    #[test]
    fn test_forecast_table_round_trip() {
        let path = temp_path("forecasts.csv");
        let date = NaiveDate::from_ymd_opt(2025, 3, 3).unwrap();
        let mk = |model: &str, v: f64| ForecastPoint {
            region: "TUMBES".into(),
            target_week_date: date,
            model_name: model.into(),
            point_estimate: v,
            lower_bound: v - 1.0,
            upper_bound: v + 1.0,
        };
        let points = vec![mk("gbt", 20.0), mk(ENSEMBLE_NAME, 4.0), mk("sarima", 12.5)];
        write_forecasts(&path, &points).unwrap();

        let header = fs::read_to_string(&path).unwrap();
        assert!(header.starts_with("region,target_week_date,point_sarima,lower_sarima,upper_sarima,"));
        assert!(header.lines().next().unwrap().ends_with("point_ensemble,lower_ensemble,upper_ensemble"));

        let read = read_forecasts(&path).unwrap().unwrap();
        let models: Vec<&str> = read.iter().map(|p| p.model_name.as_str()).collect();
        assert_eq!(models, vec!["sarima", "gbt", "ensemble"]);
        assert_eq!(read[0], points[2]);
    }

    #[test]
    fn test_absent_forecast_table_degrades() {
        assert!(read_forecasts(&temp_path("missing.csv")).unwrap().is_none());
    }
}
