//! Gradient-boosted regression trees (squared loss).
//!
//! Second-order boosting with exact greedy split search:
//! - split gain = G_L^2/(H_L+lambda) + G_R^2/(H_R+lambda) - G^2/(H+lambda)
//! - leaf weight = -G / (H + lambda), shrunk by the learning rate
//! - children must carry at least `min_child_weight` hessian mass
//!
//! For squared loss every hessian is 1, so the hessian mass is the row count.

use serde::{Deserialize, Serialize};

use crate::error::{DewsError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeParams {
    pub n_estimators: usize,
    pub max_depth: usize,
    pub learning_rate: f64,
    /// L2 penalty on leaf weights
    pub lambda: f64,
    pub min_child_weight: f64,
}

impl Default for TreeParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_depth: 5,
            learning_rate: 0.1,
            lambda: 1.0,
            min_child_weight: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum TreeNode {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        value: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RegressionTree {
    nodes: Vec<TreeNode>,
}

impl RegressionTree {
    fn predict(&self, row: &[f64]) -> f64 {
        let mut node = 0;
        loop {
            match &self.nodes[node] {
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => node = if row[*feature] < *threshold { *left } else { *right },
                TreeNode::Leaf { value } => return *value,
            }
        }
    }
}

struct TreeBuilder<'a> {
    rows: &'a [Vec<f64>],
    grad: &'a [f64],
    params: &'a TreeParams,
    nodes: Vec<TreeNode>,
}

struct SplitCandidate {
    gain: f64,
    feature: usize,
    threshold: f64,
}

impl TreeBuilder<'_> {
    fn leaf_weight(&self, g: f64, h: f64) -> f64 {
        -g / (h + self.params.lambda) * self.params.learning_rate
    }

    fn score(&self, g: f64, h: f64) -> f64 {
        g * g / (h + self.params.lambda)
    }

    fn grow(&mut self, idx: Vec<usize>, depth: usize) -> usize {
        let g: f64 = idx.iter().map(|&i| self.grad[i]).sum();
        let h = idx.len() as f64;
        let slot = self.nodes.len();
        self.nodes.push(TreeNode::Leaf {
            value: self.leaf_weight(g, h),
        });
        if depth >= self.params.max_depth || h < 2.0 * self.params.min_child_weight {
            return slot;
        }

        let Some(best) = self.best_split(&idx, g, h) else {
            return slot;
        };
        let (left_idx, right_idx): (Vec<usize>, Vec<usize>) = idx
            .into_iter()
            .partition(|&i| self.rows[i][best.feature] < best.threshold);

        let left = self.grow(left_idx, depth + 1);
        let right = self.grow(right_idx, depth + 1);
        self.nodes[slot] = TreeNode::Split {
            feature: best.feature,
            threshold: best.threshold,
            left,
            right,
        };
        slot
    }

    fn best_split(&self, idx: &[usize], g: f64, h: f64) -> Option<SplitCandidate> {
        let parent = self.score(g, h);
        let width = self.rows[idx[0]].len();
        let mut best: Option<SplitCandidate> = None;
        let mut order = idx.to_vec();

        for feature in 0..width {
            order.sort_by(|a, b| self.rows[*a][feature].total_cmp(&self.rows[*b][feature]));
            let mut g_left = 0.0;
            for (pos, pair) in order.windows(2).enumerate() {
                g_left += self.grad[pair[0]];
                let h_left = (pos + 1) as f64;
                let h_right = h - h_left;
                let (x_here, x_next) = (self.rows[pair[0]][feature], self.rows[pair[1]][feature]);
                if x_next <= x_here
                    || h_left < self.params.min_child_weight
                    || h_right < self.params.min_child_weight
                {
                    continue;
                }
                let gain = self.score(g_left, h_left) + self.score(g - g_left, h_right) - parent;
                if gain > 1e-12 && best.as_ref().is_none_or(|b| gain > b.gain) {
                    best = Some(SplitCandidate {
                        gain,
                        feature,
                        threshold: (x_here + x_next) / 2.0,
                    });
                }
            }
        }
        best
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradientBoostedTrees {
    base_score: f64,
    trees: Vec<RegressionTree>,
    n_features: usize,
}

impl GradientBoostedTrees {
    pub fn fit(rows: &[Vec<f64>], targets: &[f64], params: &TreeParams) -> Result<Self> {
        if rows.is_empty() || rows.len() != targets.len() {
            return Err(DewsError::convergence(
                "gbt",
                format!("{} rows for {} targets", rows.len(), targets.len()),
            ));
        }
        let n_features = rows[0].len();
        let base_score = targets.iter().sum::<f64>() / targets.len() as f64;
        let mut prediction = vec![base_score; rows.len()];
        let mut trees = Vec::with_capacity(params.n_estimators);

        for _ in 0..params.n_estimators {
            let grad: Vec<f64> = prediction.iter().zip(targets).map(|(p, y)| p - y).collect();
            let mut builder = TreeBuilder {
                rows,
                grad: &grad,
                params,
                nodes: Vec::new(),
            };
            builder.grow((0..rows.len()).collect(), 0);
            let tree = RegressionTree {
                nodes: builder.nodes,
            };
            for (p, row) in prediction.iter_mut().zip(rows) {
                *p += tree.predict(row);
            }
            trees.push(tree);
        }

        Ok(Self {
            base_score,
            trees,
            n_features,
        })
    }

    pub fn predict(&self, row: &[f64]) -> f64 {
        self.base_score + self.trees.iter().map(|t| t.predict(row)).sum::<f64>()
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_learns_step_function() {
        let rows: Vec<Vec<f64>> = (0..100).map(|i| vec![i as f64]).collect();
        let targets: Vec<f64> = (0..100).map(|i| if i < 50 { 10.0 } else { 30.0 }).collect();
        let model = GradientBoostedTrees::fit(&rows, &targets, &TreeParams::default()).unwrap();
        assert!((model.predict(&[10.0]) - 10.0).abs() < 0.5);
        assert!((model.predict(&[90.0]) - 30.0).abs() < 0.5);
        assert_eq!(model.n_trees(), 100);
    }

    #[test]
    fn test_uses_informative_feature() {
        let rows: Vec<Vec<f64>> = (0..200)
            .map(|i| vec![(i % 7) as f64, (i % 2) as f64])
            .collect();
        let targets: Vec<f64> = rows.iter().map(|r| 5.0 * r[1]).collect();
        let model = GradientBoostedTrees::fit(&rows, &targets, &TreeParams::default()).unwrap();
        assert!((model.predict(&[3.0, 1.0]) - 5.0).abs() < 0.1);
        assert!(model.predict(&[3.0, 0.0]).abs() < 0.1);
    }

    #[test]
    fn test_constant_target_gives_base_score() {
        let rows: Vec<Vec<f64>> = (0..20).map(|i| vec![i as f64]).collect();
        let model = GradientBoostedTrees::fit(&rows, &[4.0; 20], &TreeParams::default()).unwrap();
        assert!((model.predict(&[100.0]) - 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_mismatched_lengths_rejected() {
        let rows = vec![vec![1.0], vec![2.0]];
        assert!(GradientBoostedTrees::fit(&rows, &[1.0], &TreeParams::default()).is_err());
    }
}
