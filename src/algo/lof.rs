//! Local Outlier Factor in novelty mode.
//!
//! The training set is kept as the reference population. A query point is
//! compared against the local reachability density of its k nearest training
//! neighbours; ratios well above 1 mark sparse regions.
//!
//! Reference: "LOF: Identifying Density-Based Local Outliers"
//! (Breunig et al., SIGMOD 2000)

use serde::{Deserialize, Serialize};

use super::{quantile, squared_distance};
use crate::error::{DewsError, Result};

const LRD_EPS: f64 = 1e-10;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LocalOutlierFactor {
    k: usize,
    points: Vec<Vec<f64>>,
    /// Distance to the k-th neighbour of each training point
    k_distance: Vec<f64>,
    /// Local reachability density of each training point
    lrd: Vec<f64>,
    /// LOF values strictly above this are outliers
    threshold: f64,
}

impl LocalOutlierFactor {
    pub fn fit(rows: &[Vec<f64>], n_neighbors: usize, contamination: f64) -> Result<Self> {
        if rows.len() < 2 {
            return Err(DewsError::convergence(
                "local_outlier_factor",
                "need at least two training points",
            ));
        }
        let k = n_neighbors.min(rows.len() - 1).max(1);

        // Neighbours of training points exclude the point itself
        let neighbours: Vec<Vec<(usize, f64)>> = (0..rows.len())
            .map(|i| nearest(rows, &rows[i], k, Some(i)))
            .collect();
        let k_distance: Vec<f64> = neighbours
            .iter()
            .map(|nb| nb.last().map_or(0.0, |(_, d)| *d))
            .collect();
        let lrd: Vec<f64> = neighbours
            .iter()
            .map(|nb| local_reachability(nb, &k_distance))
            .collect();

        let mut model = Self {
            k,
            points: rows.to_vec(),
            k_distance,
            lrd,
            threshold: f64::INFINITY,
        };

        let train_lof: Vec<f64> = neighbours
            .iter()
            .enumerate()
            .map(|(i, nb)| model.ratio(nb, model.lrd[i]))
            .collect();
        model.threshold = quantile(&train_lof, 1.0 - contamination);
        Ok(model)
    }

    fn ratio(&self, neighbours: &[(usize, f64)], own_lrd: f64) -> f64 {
        let mean_lrd =
            neighbours.iter().map(|(j, _)| self.lrd[*j]).sum::<f64>() / neighbours.len() as f64;
        mean_lrd / own_lrd
    }

    /// LOF of an unseen point against the training population.
    pub fn score(&self, point: &[f64]) -> f64 {
        let neighbours = nearest(&self.points, point, self.k, None);
        let own_lrd = local_reachability(&neighbours, &self.k_distance);
        self.ratio(&neighbours, own_lrd)
    }

    pub fn is_outlier(&self, point: &[f64]) -> bool {
        self.score(point) > self.threshold
    }
}

/// k nearest points as (index, euclidean distance), closest first.
fn nearest(points: &[Vec<f64>], query: &[f64], k: usize, skip: Option<usize>) -> Vec<(usize, f64)> {
    let mut dists: Vec<(usize, f64)> = points
        .iter()
        .enumerate()
        .filter(|(j, _)| Some(*j) != skip)
        .map(|(j, p)| (j, squared_distance(p, query).sqrt()))
        .collect();
    dists.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
    dists.truncate(k);
    dists
}

fn local_reachability(neighbours: &[(usize, f64)], k_distance: &[f64]) -> f64 {
    let reach: f64 = neighbours
        .iter()
        .map(|(j, d)| d.max(k_distance[*j]))
        .sum::<f64>()
        / neighbours.len() as f64;
    1.0 / (reach + LRD_EPS)
}
