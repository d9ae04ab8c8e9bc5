//! Stacked LSTM regressor for univariate windows.
//!
//! Architecture: `layers` LSTM layers of `hidden` units (relu cell and output
//! activations, sigmoid gates, gate order i, f, g, o), dropout after every
//! layer, and a single linear output unit. Only the last hidden state of the
//! top layer feeds the output.
//!
//! Training:
//! - full backpropagation through time, mean squared error
//! - Adam with global-norm gradient clipping
//! - per-sample gradients of a mini-batch computed in parallel, summed in
//!   batch order so results do not depend on scheduling
//! - early stopping on the epoch training loss, best weights restored

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DewsError, Result};

const ADAM_BETA1: f64 = 0.9;
const ADAM_BETA2: f64 = 0.999;
const ADAM_EPS: f64 = 1e-7;

/// Training hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LstmParams {
    pub hidden: usize,
    pub layers: usize,
    pub dropout: f64,
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    /// Epochs without improvement before stopping
    pub patience: usize,
    pub clip_norm: f64,
    pub seed: u64,
}

impl Default for LstmParams {
    fn default() -> Self {
        Self {
            hidden: 50,
            layers: 2,
            dropout: 0.2,
            epochs: 30,
            batch_size: 32,
            learning_rate: 1e-3,
            patience: 3,
            clip_norm: 5.0,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainReport {
    pub epochs_run: usize,
    pub best_loss: f64,
    pub first_loss: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct LstmLayer {
    input: usize,
    hidden: usize,
    /// 4H x input, row-major
    w: Vec<f64>,
    /// 4H x H, row-major
    u: Vec<f64>,
    b: Vec<f64>,
}

struct StepCache {
    x: Vec<f64>,
    h_prev: Vec<f64>,
    c_prev: Vec<f64>,
    /// Activated gates i, f, g, o
    gates: Vec<f64>,
    c: Vec<f64>,
    h: Vec<f64>,
}

#[inline]
fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

#[inline]
fn relu(x: f64) -> f64 {
    x.max(0.0)
}

#[inline]
fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn glorot(rng: &mut StdRng, fan_in: usize, fan_out: usize, len: usize) -> Vec<f64> {
    let limit = (6.0 / (fan_in + fan_out) as f64).sqrt();
    (0..len).map(|_| rng.random_range(-limit..limit)).collect()
}

impl LstmLayer {
    fn new(input: usize, hidden: usize, rng: &mut StdRng) -> Self {
        let w = glorot(rng, input, 4 * hidden, 4 * hidden * input);
        let u = glorot(rng, hidden, 4 * hidden, 4 * hidden * hidden);
        let mut b = vec![0.0; 4 * hidden];
        // Forget gate starts open
        b[hidden..2 * hidden].fill(1.0);
        Self {
            input,
            hidden,
            w,
            u,
            b,
        }
    }

    fn zeros_like(&self) -> Self {
        Self {
            input: self.input,
            hidden: self.hidden,
            w: vec![0.0; self.w.len()],
            u: vec![0.0; self.u.len()],
            b: vec![0.0; self.b.len()],
        }
    }

    fn step(&self, x: &[f64], h_prev: &[f64], c_prev: &[f64]) -> StepCache {
        let hd = self.hidden;
        let mut z = self.b.clone();
        for (r, zr) in z.iter_mut().enumerate() {
            *zr += dot(&self.w[r * self.input..(r + 1) * self.input], x)
                + dot(&self.u[r * hd..(r + 1) * hd], h_prev);
        }

        let mut gates = vec![0.0; 4 * hd];
        let mut c = vec![0.0; hd];
        let mut h = vec![0.0; hd];
        for k in 0..hd {
            let i = sigmoid(z[k]);
            let f = sigmoid(z[hd + k]);
            let g = relu(z[2 * hd + k]);
            let o = sigmoid(z[3 * hd + k]);
            c[k] = f * c_prev[k] + i * g;
            h[k] = o * relu(c[k]);
            gates[k] = i;
            gates[hd + k] = f;
            gates[2 * hd + k] = g;
            gates[3 * hd + k] = o;
        }

        StepCache {
            x: x.to_vec(),
            h_prev: h_prev.to_vec(),
            c_prev: c_prev.to_vec(),
            gates,
            c,
            h,
        }
    }

    fn forward(&self, inputs: &[Vec<f64>]) -> Vec<StepCache> {
        let mut h = vec![0.0; self.hidden];
        let mut c = vec![0.0; self.hidden];
        let mut caches = Vec::with_capacity(inputs.len());
        for x in inputs {
            let step = self.step(x, &h, &c);
            h.clone_from(&step.h);
            c.clone_from(&step.c);
            caches.push(step);
        }
        caches
    }

    /// Backpropagate external hidden-state gradients through time.
    /// Accumulates parameter gradients into `grad`; returns input gradients.
    fn backward(&self, caches: &[StepCache], dh_ext: &[Vec<f64>], grad: &mut LstmLayer) -> Vec<Vec<f64>> {
        let hd = self.hidden;
        let mut dh_next = vec![0.0; hd];
        let mut dc_next = vec![0.0; hd];
        let mut dxs = vec![vec![0.0; self.input]; caches.len()];
        let mut dz = vec![0.0; 4 * hd];

        for t in (0..caches.len()).rev() {
            let s = &caches[t];
            for k in 0..hd {
                let dh = dh_ext[t][k] + dh_next[k];
                let (i, f, g, o) = (
                    s.gates[k],
                    s.gates[hd + k],
                    s.gates[2 * hd + k],
                    s.gates[3 * hd + k],
                );
                let c_active = if s.c[k] > 0.0 { 1.0 } else { 0.0 };
                let dc = dh * o * c_active + dc_next[k];

                dz[k] = dc * g * i * (1.0 - i);
                dz[hd + k] = dc * s.c_prev[k] * f * (1.0 - f);
                dz[2 * hd + k] = if g > 0.0 { dc * i } else { 0.0 };
                dz[3 * hd + k] = dh * relu(s.c[k]) * o * (1.0 - o);
                dc_next[k] = dc * f;
            }

            dh_next.fill(0.0);
            for (r, &d) in dz.iter().enumerate() {
                if d == 0.0 {
                    continue;
                }
                grad.b[r] += d;
                let w_row = r * self.input;
                for (col, x) in s.x.iter().enumerate() {
                    grad.w[w_row + col] += d * x;
                    dxs[t][col] += self.w[w_row + col] * d;
                }
                let u_row = r * hd;
                for (col, hp) in s.h_prev.iter().enumerate() {
                    grad.u[u_row + col] += d * hp;
                    dh_next[col] += self.u[u_row + col] * d;
                }
            }
        }
        dxs
    }

    fn params(&self) -> impl Iterator<Item = &f64> {
        self.w.iter().chain(self.u.iter()).chain(self.b.iter())
    }

    fn params_mut(&mut self) -> impl Iterator<Item = &mut f64> {
        self.w
            .iter_mut()
            .chain(self.u.iter_mut())
            .chain(self.b.iter_mut())
    }
}

/// Dropout masks for one sample: per layer, per timestep, per unit.
/// The top layer only carries a mask for its final state.
type Masks = Vec<Vec<Vec<f64>>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LstmNetwork {
    layers: Vec<LstmLayer>,
    dense_w: Vec<f64>,
    dense_b: f64,
}

impl LstmNetwork {
    pub fn new(hidden: usize, layers: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let layers: Vec<LstmLayer> = (0..layers.max(1))
            .map(|l| LstmLayer::new(if l == 0 { 1 } else { hidden }, hidden, &mut rng))
            .collect();
        let dense_w = glorot(&mut rng, hidden, 1, hidden);
        Self {
            layers,
            dense_w,
            dense_b: 0.0,
        }
    }

    fn zeros_like(&self) -> Self {
        Self {
            layers: self.layers.iter().map(LstmLayer::zeros_like).collect(),
            dense_w: vec![0.0; self.dense_w.len()],
            dense_b: 0.0,
        }
    }

    fn params(&self) -> impl Iterator<Item = &f64> {
        self.layers
            .iter()
            .flat_map(|l| l.params())
            .chain(self.dense_w.iter())
            .chain(std::iter::once(&self.dense_b))
    }

    fn params_mut(&mut self) -> impl Iterator<Item = &mut f64> {
        self.layers
            .iter_mut()
            .flat_map(|l| l.params_mut())
            .chain(self.dense_w.iter_mut())
            .chain(std::iter::once(&mut self.dense_b))
    }

    fn add_assign(&mut self, other: &LstmNetwork) {
        for (p, q) in self.params_mut().zip(other.params()) {
            *p += q;
        }
    }

    fn param_count(&self) -> usize {
        self.params().count()
    }

    /// Predict the value following `window` (inference mode, no dropout).
    pub fn predict(&self, window: &[f64]) -> f64 {
        let mut seq: Vec<Vec<f64>> = window.iter().map(|v| vec![*v]).collect();
        for layer in &self.layers {
            seq = layer.forward(&seq).into_iter().map(|s| s.h).collect();
        }
        let last = seq.last().map_or(0.0, |h| dot(&self.dense_w, h));
        last + self.dense_b
    }

    fn sample_masks(&self, steps: usize, dropout: f64, rng: &mut StdRng) -> Masks {
        let keep = 1.0 - dropout;
        let last = self.layers.len() - 1;
        self.layers
            .iter()
            .enumerate()
            .map(|(l, layer)| {
                let rows = if l == last { 1 } else { steps };
                (0..rows)
                    .map(|_| {
                        (0..layer.hidden)
                            .map(|_| {
                                if dropout <= 0.0 {
                                    1.0
                                } else if rng.random::<f64>() < dropout {
                                    0.0
                                } else {
                                    1.0 / keep
                                }
                            })
                            .collect()
                    })
                    .collect()
            })
            .collect()
    }

    /// Squared error and its gradient (scaled by `scale`) for one sample.
    fn sample_gradient(&self, window: &[f64], target: f64, masks: &Masks, scale: f64) -> (LstmNetwork, f64) {
        let last = self.layers.len() - 1;
        let mut grad = self.zeros_like();

        let mut seq: Vec<Vec<f64>> = window.iter().map(|v| vec![*v]).collect();
        let mut caches = Vec::with_capacity(self.layers.len());
        for (l, layer) in self.layers.iter().enumerate() {
            let layer_caches = layer.forward(&seq);
            if l < last {
                seq = layer_caches
                    .iter()
                    .zip(&masks[l])
                    .map(|(s, m)| s.h.iter().zip(m).map(|(h, k)| h * k).collect())
                    .collect();
            }
            caches.push(layer_caches);
        }

        let top_h = caches[last]
            .last()
            .map(|s| s.h.clone())
            .unwrap_or_else(|| vec![0.0; self.dense_w.len()]);
        let dropped: Vec<f64> = top_h.iter().zip(&masks[last][0]).map(|(h, k)| h * k).collect();
        let y = dot(&self.dense_w, &dropped) + self.dense_b;
        let err = y - target;
        let dy = 2.0 * err * scale;

        for (gw, h) in grad.dense_w.iter_mut().zip(&dropped) {
            *gw = dy * h;
        }
        grad.dense_b = dy;

        let steps = window.len();
        let mut dh_ext = vec![vec![0.0; self.layers[last].hidden]; steps];
        if let Some(final_dh) = dh_ext.last_mut() {
            for ((d, w), k) in final_dh.iter_mut().zip(&self.dense_w).zip(&masks[last][0]) {
                *d = w * dy * k;
            }
        }

        for l in (0..self.layers.len()).rev() {
            let dxs = self.layers[l].backward(&caches[l], &dh_ext, &mut grad.layers[l]);
            if l > 0 {
                dh_ext = dxs
                    .iter()
                    .zip(&masks[l - 1])
                    .map(|(dx, m)| dx.iter().zip(m).map(|(d, k)| d * k).collect())
                    .collect();
            }
        }

        (grad, err * err)
    }

    /// Train on (window, target) pairs with mini-batch Adam and early stopping.
    pub fn fit(&mut self, windows: &[Vec<f64>], targets: &[f64], params: &LstmParams) -> Result<TrainReport> {
        if windows.is_empty() || windows.len() != targets.len() {
            return Err(DewsError::convergence(
                "lstm",
                format!("{} windows for {} targets", windows.len(), targets.len()),
            ));
        }

        let mut rng = StdRng::seed_from_u64(params.seed);
        let mut adam = Adam::new(self.param_count());
        let mut order: Vec<usize> = (0..windows.len()).collect();
        let steps = windows[0].len();

        let mut best = self.clone();
        let mut best_loss = f64::INFINITY;
        let mut first_loss = f64::NAN;
        let mut wait = 0;
        let mut epochs_run = 0;

        for epoch in 0..params.epochs {
            order.shuffle(&mut rng);
            let mut epoch_loss = 0.0;

            for batch in order.chunks(params.batch_size.max(1)) {
                let masks: Vec<Masks> = batch
                    .iter()
                    .map(|_| self.sample_masks(steps, params.dropout, &mut rng))
                    .collect();
                let scale = 1.0 / batch.len() as f64;
                let parts: Vec<(LstmNetwork, f64)> = batch
                    .par_iter()
                    .zip(masks.par_iter())
                    .map(|(&i, m)| self.sample_gradient(&windows[i], targets[i], m, scale))
                    .collect();

                let mut grad = self.zeros_like();
                for (g, loss) in &parts {
                    grad.add_assign(g);
                    epoch_loss += loss;
                }
                clip_global_norm(&mut grad, params.clip_norm);
                adam.step(self, &grad, params.learning_rate);
            }

            epoch_loss /= windows.len() as f64;
            epochs_run = epoch + 1;
            if !epoch_loss.is_finite() {
                return Err(DewsError::convergence(
                    "lstm",
                    format!("training loss diverged at epoch {}", epochs_run),
                ));
            }
            if epoch == 0 {
                first_loss = epoch_loss;
            }
            debug!(epoch = epochs_run, loss = epoch_loss, "lstm epoch");

            if epoch_loss < best_loss {
                best_loss = epoch_loss;
                best = self.clone();
                wait = 0;
            } else {
                wait += 1;
                if wait >= params.patience {
                    break;
                }
            }
        }

        *self = best;
        Ok(TrainReport {
            epochs_run,
            best_loss,
            first_loss,
        })
    }
}

fn clip_global_norm(grad: &mut LstmNetwork, max_norm: f64) {
    if max_norm <= 0.0 {
        return;
    }
    let norm = grad.params().map(|g| g * g).sum::<f64>().sqrt();
    if norm > max_norm {
        let factor = max_norm / norm;
        grad.params_mut().for_each(|g| *g *= factor);
    }
}

struct Adam {
    m: Vec<f64>,
    v: Vec<f64>,
    t: i32,
}

impl Adam {
    fn new(len: usize) -> Self {
        Self {
            m: vec![0.0; len],
            v: vec![0.0; len],
            t: 0,
        }
    }

    fn step(&mut self, net: &mut LstmNetwork, grad: &LstmNetwork, lr: f64) {
        self.t += 1;
        let lr_t = lr * (1.0 - ADAM_BETA2.powi(self.t)).sqrt() / (1.0 - ADAM_BETA1.powi(self.t));
        for (((p, g), m), v) in net
            .params_mut()
            .zip(grad.params())
            .zip(self.m.iter_mut())
            .zip(self.v.iter_mut())
        {
            *m = ADAM_BETA1 * *m + (1.0 - ADAM_BETA1) * g;
            *v = ADAM_BETA2 * *v + (1.0 - ADAM_BETA2) * g * g;
            *p -= lr_t * *m / (v.sqrt() + ADAM_EPS);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_dropout_masks(net: &LstmNetwork, steps: usize) -> Masks {
        let mut rng = StdRng::seed_from_u64(0);
        net.sample_masks(steps, 0.0, &mut rng)
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let net = LstmNetwork::new(3, 2, 9);
        let window = [0.2, 0.7, 0.4, 0.9];
        let target = 0.3;
        let masks = no_dropout_masks(&net, window.len());
        let (grad, _) = net.sample_gradient(&window, target, &masks, 1.0);
        let analytic: Vec<f64> = grad.params().copied().collect();

        let loss = |n: &LstmNetwork| (n.predict(&window) - target).powi(2);
        let h = 1e-6;
        for k in (0..net.param_count()).step_by(7) {
            let mut up = net.clone();
            let mut down = net.clone();
            if let Some(p) = up.params_mut().nth(k) {
                *p += h;
            }
            if let Some(p) = down.params_mut().nth(k) {
                *p -= h;
            }
            let numeric = (loss(&up) - loss(&down)) / (2.0 * h);
            let tol = 1e-5 + 1e-3 * numeric.abs();
            assert!(
                (numeric - analytic[k]).abs() < tol,
                "param {k}: numeric {numeric} analytic {}",
                analytic[k]
            );
        }
    }

    #[test]
    fn test_training_reduces_loss() {
        let series: Vec<f64> = (0..120)
            .map(|i| 0.5 + 0.4 * (i as f64 * std::f64::consts::TAU / 12.0).sin())
            .collect();
        let lookback = 6;
        let windows: Vec<Vec<f64>> = (0..series.len() - lookback)
            .map(|i| series[i..i + lookback].to_vec())
            .collect();
        let targets: Vec<f64> = (lookback..series.len()).map(|i| series[i]).collect();

        let params = LstmParams {
            hidden: 8,
            epochs: 20,
            dropout: 0.0,
            learning_rate: 1e-2,
            ..Default::default()
        };
        let mut net = LstmNetwork::new(params.hidden, params.layers, params.seed);
        let report = net.fit(&windows, &targets, &params).unwrap();
        assert!(report.epochs_run >= 1);
        assert!(report.best_loss < report.first_loss);
    }

    #[test]
    fn test_early_stopping_monitors_training_loss() {
        // Three windows leave nothing to hold out; every window is trained on
        let windows = vec![vec![0.1, 0.2], vec![0.2, 0.3], vec![0.3, 0.4]];
        let targets = vec![0.3, 0.4, 0.5];
        let params = LstmParams {
            hidden: 4,
            layers: 1,
            epochs: 30,
            patience: 2,
            dropout: 0.0,
            batch_size: 3,
            ..Default::default()
        };
        let mut net = LstmNetwork::new(params.hidden, params.layers, params.seed);
        let report = net.fit(&windows, &targets, &params).unwrap();
        assert!(report.epochs_run >= 1 && report.epochs_run <= params.epochs);
        assert!(report.best_loss <= report.first_loss);
        assert!(report.best_loss.is_finite());
    }

    #[test]
    fn test_fixed_seed_is_deterministic() {
        let windows: Vec<Vec<f64>> = (0..40).map(|i| vec![i as f64 / 40.0; 4]).collect();
        let targets: Vec<f64> = (0..40).map(|i| i as f64 / 40.0).collect();
        let params = LstmParams {
            hidden: 4,
            epochs: 3,
            ..Default::default()
        };
        let mut a = LstmNetwork::new(4, 2, 1);
        let mut b = LstmNetwork::new(4, 2, 1);
        a.fit(&windows, &targets, &params).unwrap();
        b.fit(&windows, &targets, &params).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.predict(&[0.5; 4]), b.predict(&[0.5; 4]));
    }
}
