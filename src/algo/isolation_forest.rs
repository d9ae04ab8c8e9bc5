//! Isolation Forest for Batch Outlier Detection
//!
//! Outliers are isolated by fewer random axis-aligned cuts than inliers, so
//! their expected path length over a forest of random trees is short.
//!
//! Key features:
//! - Subsampled trees (psi = min(256, n)) with depth limit ceil(log2 psi)
//! - Trees built in parallel, tree `i` seeded with `seed + i` so the forest
//!   does not depend on thread scheduling
//! - Decision threshold fixed at training time from the contamination fraction
//!
//! Reference: "Isolation Forest" (Liu, Ting, Zhou, ICDM 2008)

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::quantile;
use crate::error::{DewsError, Result};

const MAX_SAMPLES: usize = 256;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
enum INode {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        size: usize,
    },
}

/// One isolation tree stored as a flat node arena, root at index 0
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
struct ITree {
    nodes: Vec<INode>,
}

impl ITree {
    fn build(rows: &[Vec<f64>], sample: &[usize], max_depth: usize, rng: &mut StdRng) -> Self {
        let mut tree = Self { nodes: Vec::new() };
        tree.grow(rows, sample.to_vec(), 0, max_depth, rng);
        tree
    }

    fn grow(
        &mut self,
        rows: &[Vec<f64>],
        idx: Vec<usize>,
        depth: usize,
        max_depth: usize,
        rng: &mut StdRng,
    ) -> usize {
        let slot = self.nodes.len();
        self.nodes.push(INode::Leaf { size: idx.len() });
        if depth >= max_depth || idx.len() <= 1 {
            return slot;
        }

        // Only features that still vary inside this node can split it
        let width = rows[idx[0]].len();
        let mut candidates = Vec::with_capacity(width);
        for f in 0..width {
            let (lo, hi) = idx.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &i| {
                (lo.min(rows[i][f]), hi.max(rows[i][f]))
            });
            if hi > lo {
                candidates.push((f, lo, hi));
            }
        }
        if candidates.is_empty() {
            return slot;
        }

        let (feature, lo, hi) = candidates[rng.random_range(0..candidates.len())];
        let threshold = rng.random_range(lo..hi);
        let (left_idx, right_idx): (Vec<usize>, Vec<usize>) =
            idx.into_iter().partition(|&i| rows[i][feature] < threshold);

        let left = self.grow(rows, left_idx, depth + 1, max_depth, rng);
        let right = self.grow(rows, right_idx, depth + 1, max_depth, rng);
        self.nodes[slot] = INode::Split {
            feature,
            threshold,
            left,
            right,
        };
        slot
    }

    fn path_length(&self, point: &[f64]) -> f64 {
        let mut node = 0;
        let mut depth = 0.0;
        loop {
            match &self.nodes[node] {
                INode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    node = if point[*feature] < *threshold { *left } else { *right };
                    depth += 1.0;
                }
                INode::Leaf { size } => return depth + average_path_length(*size),
            }
        }
    }
}

/// Average path length of an unsuccessful BST search over `n` points.
pub fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            let harmonic = (n - 1.0).ln() + 0.577_215_664_901_532_9;
            2.0 * harmonic - 2.0 * (n - 1.0) / n
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct IsolationForest {
    trees: Vec<ITree>,
    sample_size: usize,
    /// Scores strictly above this are outliers
    threshold: f64,
}

impl IsolationForest {
    pub fn fit(
        rows: &[Vec<f64>],
        n_estimators: usize,
        contamination: f64,
        seed: u64,
    ) -> Result<Self> {
        if rows.is_empty() || n_estimators == 0 {
            return Err(DewsError::convergence(
                "isolation_forest",
                "empty training set or forest",
            ));
        }

        let sample_size = rows.len().min(MAX_SAMPLES);
        let max_depth = (sample_size as f64).log2().ceil().max(1.0) as usize;

        let trees: Vec<ITree> = (0..n_estimators)
            .into_par_iter()
            .map(|i| {
                let mut rng = StdRng::seed_from_u64(seed.wrapping_add(i as u64));
                let sample = rand::seq::index::sample(&mut rng, rows.len(), sample_size).into_vec();
                ITree::build(rows, &sample, max_depth, &mut rng)
            })
            .collect();

        let mut forest = Self {
            trees,
            sample_size,
            threshold: f64::INFINITY,
        };
        let train_scores = forest.score_samples(rows);
        forest.threshold = quantile(&train_scores, 1.0 - contamination);
        Ok(forest)
    }

    /// Anomaly score in (0, 1]; higher is more anomalous.
    pub fn score(&self, point: &[f64]) -> f64 {
        let mean_depth = self
            .trees
            .iter()
            .map(|t| t.path_length(point))
            .sum::<f64>()
            / self.trees.len() as f64;
        let norm = average_path_length(self.sample_size);
        if norm <= 0.0 {
            return 0.5;
        }
        2f64.powf(-mean_depth / norm)
    }

    pub fn score_samples(&self, rows: &[Vec<f64>]) -> Vec<f64> {
        rows.par_iter().map(|r| self.score(r)).collect()
    }

    pub fn is_outlier(&self, point: &[f64]) -> bool {
        self.score(point) > self.threshold
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_distr::{Distribution, Normal};

    fn cluster(n: usize, seed: u64) -> Vec<Vec<f64>> {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        (0..n)
            .map(|_| vec![normal.sample(&mut rng), normal.sample(&mut rng)])
            .collect()
    }

    #[test]
    fn test_average_path_length() {
        assert_eq!(average_path_length(1), 0.0);
        assert_eq!(average_path_length(2), 1.0);
        assert!(average_path_length(256) > average_path_length(16));
    }

    #[test]
    fn test_far_point_is_outlier() {
        let rows = cluster(300, 7);
        let forest = IsolationForest::fit(&rows, 100, 0.05, 42).unwrap();
        assert!(forest.is_outlier(&[12.0, -12.0]));
        assert!(!forest.is_outlier(&[0.0, 0.0]));
        assert!(forest.score(&[12.0, -12.0]) > forest.score(&[0.1, 0.1]));
    }

    #[test]
    fn test_contamination_fraction_on_training_data() {
        let rows = cluster(400, 3);
        let forest = IsolationForest::fit(&rows, 100, 0.05, 42).unwrap();
        let flagged = rows.iter().filter(|r| forest.is_outlier(r)).count();
        assert!(flagged <= 21, "flagged {flagged}");
        assert!(flagged >= 10, "flagged {flagged}");
    }

    #[test]
    fn test_fixed_seed_is_deterministic() {
        let rows = cluster(200, 11);
        let a = IsolationForest::fit(&rows, 50, 0.05, 42).unwrap();
        let b = IsolationForest::fit(&rows, 50, 0.05, 42).unwrap();
        assert_eq!(a, b);
    }
}
