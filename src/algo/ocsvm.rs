//! One-Class SVM with an RBF kernel.
//!
//! Solves the Schölkopf dual
//!
//! ```text
//! min 0.5 * a'Qa   s.t.  0 <= a_i <= 1,  sum(a) = nu * l
//! ```
//!
//! with sequential minimal optimisation over maximal violating pairs. Only the
//! support vectors (a_i > 0) are kept after training.
//!
//! Reference: "Estimating the Support of a High-Dimensional Distribution"
//! (Schölkopf et al., Neural Computation 2001)

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::squared_distance;
use crate::error::{DewsError, Result};

const TOLERANCE: f64 = 1e-3;
const TAU: f64 = 1e-12;
const MAX_ITER: usize = 1_000_000;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OneClassSvm {
    gamma: f64,
    support: Vec<Vec<f64>>,
    coef: Vec<f64>,
    rho: f64,
}

impl OneClassSvm {
    /// Train on standardized rows. `gamma` defaults to 1 / n_features,
    /// which matches the variance-scaled heuristic for unit-variance input.
    pub fn fit(rows: &[Vec<f64>], nu: f64) -> Result<Self> {
        let l = rows.len();
        if l == 0 {
            return Err(DewsError::convergence("one_class_svm", "empty training set"));
        }
        if !(nu > 0.0 && nu <= 1.0) {
            return Err(DewsError::convergence(
                "one_class_svm",
                format!("nu must lie in (0, 1], got {}", nu),
            ));
        }
        let width = rows[0].len().max(1);
        let gamma = 1.0 / width as f64;

        let q: Vec<Vec<f64>> = rows
            .iter()
            .map(|a| rows.iter().map(|b| rbf(gamma, a, b)).collect())
            .collect();

        // Feasible start: the first floor(nu * l) multipliers at the bound
        let total = nu * l as f64;
        let full = (total.floor() as usize).min(l);
        let mut alpha = vec![0.0; l];
        alpha[..full].iter_mut().for_each(|a| *a = 1.0);
        if full < l {
            alpha[full] = total - full as f64;
        }

        let mut grad: Vec<f64> = (0..l)
            .map(|i| (0..l).map(|j| q[i][j] * alpha[j]).sum())
            .collect();

        let mut iterations = 0;
        while iterations < MAX_ITER {
            let mut i = usize::MAX;
            let mut g_max = f64::NEG_INFINITY;
            let mut j = usize::MAX;
            let mut g_min = f64::INFINITY;
            for t in 0..l {
                if alpha[t] < 1.0 && -grad[t] > g_max {
                    g_max = -grad[t];
                    i = t;
                }
                if alpha[t] > 0.0 && -grad[t] < g_min {
                    g_min = -grad[t];
                    j = t;
                }
            }
            if i == usize::MAX || j == usize::MAX || g_max - g_min < TOLERANCE {
                break;
            }

            let eta = (q[i][i] + q[j][j] - 2.0 * q[i][j]).max(TAU);
            let step = ((grad[j] - grad[i]) / eta).min(1.0 - alpha[i]).min(alpha[j]);
            if step <= 0.0 {
                break;
            }
            alpha[i] += step;
            alpha[j] -= step;
            for (t, g) in grad.iter_mut().enumerate() {
                *g += (q[t][i] - q[t][j]) * step;
            }
            iterations += 1;
        }
        debug!(iterations, support = alpha.iter().filter(|a| **a > 0.0).count(), "one-class svm trained");

        let rho = compute_rho(&alpha, &grad);
        let (support, coef) = rows
            .iter()
            .zip(&alpha)
            .filter(|(_, a)| **a > 0.0)
            .map(|(r, a)| (r.clone(), *a))
            .unzip();

        Ok(Self {
            gamma,
            support,
            coef,
            rho,
        })
    }

    /// Signed distance to the boundary; non-positive means outside.
    pub fn decision(&self, point: &[f64]) -> f64 {
        self.support
            .iter()
            .zip(&self.coef)
            .map(|(sv, a)| a * rbf(self.gamma, sv, point))
            .sum::<f64>()
            - self.rho
    }

    pub fn is_outlier(&self, point: &[f64]) -> bool {
        self.decision(point) <= 0.0
    }

    pub fn support_count(&self) -> usize {
        self.support.len()
    }
}

#[inline]
fn rbf(gamma: f64, a: &[f64], b: &[f64]) -> f64 {
    (-gamma * squared_distance(a, b)).exp()
}

fn compute_rho(alpha: &[f64], grad: &[f64]) -> f64 {
    let mut ub = f64::INFINITY;
    let mut lb = f64::NEG_INFINITY;
    let mut free_sum = 0.0;
    let mut free = 0usize;
    for (a, g) in alpha.iter().zip(grad) {
        if *a >= 1.0 {
            lb = lb.max(*g);
        } else if *a <= 0.0 {
            ub = ub.min(*g);
        } else {
            free_sum += g;
            free += 1;
        }
    }
    if free > 0 {
        free_sum / free as f64
    } else {
        (ub + lb) / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};

    fn cluster(n: usize) -> Vec<Vec<f64>> {
        let mut rng = StdRng::seed_from_u64(5);
        let normal = Normal::new(0.0, 1.0).unwrap();
        (0..n)
            .map(|_| vec![normal.sample(&mut rng), normal.sample(&mut rng)])
            .collect()
    }

    #[test]
    fn test_boundary_separates_far_points() {
        let rows = cluster(200);
        let svm = OneClassSvm::fit(&rows, 0.05).unwrap();
        assert!(svm.decision(&[0.0, 0.0]) > 0.0);
        assert!(svm.is_outlier(&[8.0, 8.0]));
        assert!(!svm.is_outlier(&[0.0, 0.0]));
    }

    #[test]
    fn test_multipliers_sum_to_nu_l() {
        let rows = cluster(100);
        let svm = OneClassSvm::fit(&rows, 0.1).unwrap();
        let total: f64 = svm.coef.iter().sum();
        assert!((total - 10.0).abs() < 1e-9);
        assert!(svm.coef.iter().all(|a| *a > 0.0 && *a <= 1.0));
        assert!(svm.support_count() >= 10);
    }

    #[test]
    fn test_training_outlier_fraction_tracks_nu() {
        let rows = cluster(200);
        let svm = OneClassSvm::fit(&rows, 0.05).unwrap();
        let flagged = rows.iter().filter(|r| svm.is_outlier(r)).count();
        // nu bounds the outlier fraction from above, up to the stopping tolerance
        assert!(flagged <= 30, "flagged {flagged}");
    }

    #[test]
    fn test_deterministic() {
        let rows = cluster(80);
        assert_eq!(
            OneClassSvm::fit(&rows, 0.05).unwrap(),
            OneClassSvm::fit(&rows, 0.05).unwrap()
        );
    }
}
