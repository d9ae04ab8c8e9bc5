//! Least-squares solvers.
//!
//! - `fit_least_squares`: Levenberg-Marquardt over an arbitrary residual
//!   closure with a central-difference Jacobian
//! - `ridge_solve`: weighted ridge regression via Cholesky, LU as fallback

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::{DMatrix, DVector, Dyn, OMatrix, OVector, Owned};

/// Outcome of a nonlinear least-squares fit
#[derive(Debug, Clone)]
pub struct LeastSquaresFit {
    pub params: Vec<f64>,
    /// Sum of squared residuals at `params`
    pub sse: f64,
    pub converged: bool,
    pub evaluations: usize,
}

struct ResidualProblem<F> {
    params: OVector<f64, Dyn>,
    residual_fn: F,
}

impl<F> ResidualProblem<F>
where
    F: Fn(&[f64]) -> Option<Vec<f64>>,
{
    fn eval(&self, params: &[f64]) -> Option<Vec<f64>> {
        (self.residual_fn)(params).filter(|r| r.iter().all(|v| v.is_finite()))
    }
}

impl<F> LeastSquaresProblem<f64, Dyn, Dyn> for ResidualProblem<F>
where
    F: Fn(&[f64]) -> Option<Vec<f64>>,
{
    type ParameterStorage = Owned<f64, Dyn>;
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;

    fn set_params(&mut self, p: &OVector<f64, Dyn>) {
        self.params.copy_from(p);
    }

    fn params(&self) -> OVector<f64, Dyn> {
        self.params.clone()
    }

    fn residuals(&self) -> Option<OVector<f64, Dyn>> {
        self.eval(self.params.as_slice())
            .map(OVector::<f64, Dyn>::from_vec)
    }

    fn jacobian(&self) -> Option<OMatrix<f64, Dyn, Dyn>> {
        let base = self.params.as_slice().to_vec();
        let n_params = base.len();
        let mut columns = Vec::with_capacity(n_params);
        for k in 0..n_params {
            let h = 1e-6 * base[k].abs().max(1.0);
            let mut up = base.clone();
            let mut down = base.clone();
            up[k] += h;
            down[k] -= h;
            let r_up = self.eval(&up)?;
            let r_down = self.eval(&down)?;
            columns.push(
                r_up.iter()
                    .zip(&r_down)
                    .map(|(a, b)| (a - b) / (2.0 * h))
                    .collect::<Vec<f64>>(),
            );
        }
        let n_res = columns.first().map_or(0, |c| c.len());
        Some(OMatrix::<f64, Dyn, Dyn>::from_fn(n_res, n_params, |i, k| {
            columns[k][i]
        }))
    }
}

/// Minimise the sum of squares of `residual_fn` starting from `initial`.
///
/// `residual_fn` returns `None` (or non-finite values) where the parameters
/// are outside the admissible region. Returns `None` if the starting point
/// itself is inadmissible.
pub fn fit_least_squares<F>(initial: &[f64], residual_fn: F) -> Option<LeastSquaresFit>
where
    F: Fn(&[f64]) -> Option<Vec<f64>>,
{
    let problem = ResidualProblem {
        params: OVector::<f64, Dyn>::from_vec(initial.to_vec()),
        residual_fn,
    };
    problem.eval(initial)?;

    let (solved, report) = LevenbergMarquardt::new().minimize(problem);
    let params = solved.params.as_slice().to_vec();
    let residuals = solved.eval(&params)?;
    Some(LeastSquaresFit {
        sse: residuals.iter().map(|r| r * r).sum(),
        params,
        converged: report.termination.was_successful(),
        evaluations: report.number_of_evaluations,
    })
}

/// Solve min sum_i w_i (y_i - x_i . beta)^2 + sum_k penalty_k beta_k^2.
pub fn ridge_solve(
    design: &DMatrix<f64>,
    target: &DVector<f64>,
    weights: Option<&DVector<f64>>,
    penalty: &DVector<f64>,
) -> Option<DVector<f64>> {
    let weighted = match weights {
        Some(w) => {
            let mut scaled = design.clone();
            for (mut row, wi) in scaled.row_iter_mut().zip(w.iter()) {
                row *= *wi;
            }
            scaled
        }
        None => design.clone(),
    };
    let mut gram = weighted.transpose() * design;
    for (k, p) in penalty.iter().enumerate() {
        gram[(k, k)] += p;
    }
    let rhs = weighted.transpose() * target;

    let beta = match gram.clone().cholesky() {
        Some(chol) => Some(chol.solve(&rhs)),
        None => gram.lu().solve(&rhs),
    };
    beta.filter(|b| b.iter().all(|v| v.is_finite()))
}
