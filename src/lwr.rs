//! Per-signature fallback regressor.
//!
//! A small nonparametric model trained on every observation sharing one
//! signature, used when classification lands in the noise mode: predictions
//! are a distance-kernel weighted average over the `k` nearest stored
//! inputs. Not persisted; rebuilt on load by replaying stored observations.

use nalgebra::DVector;

/// Locally weighted fallback regressor.
#[derive(Debug, Clone)]
pub struct Lwr {
    k: usize,
    xs: Vec<DVector<f64>>,
    ys: Vec<f64>,
}

impl Lwr {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            xs: Vec::new(),
            ys: Vec::new(),
        }
    }

    /// Record one training pair.
    pub fn learn(&mut self, x: DVector<f64>, y: f64) {
        self.xs.push(x);
        self.ys.push(y);
    }

    pub fn len(&self) -> usize {
        self.xs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.xs.is_empty()
    }

    /// Kernel-weighted average of the `k` nearest neighbors' targets, or
    /// `None` with fewer than two stored points.
    pub fn predict(&self, x: &DVector<f64>) -> Option<f64> {
        if self.xs.len() < 2 {
            return None;
        }

        let mut dists: Vec<(f64, usize)> = self
            .xs
            .iter()
            .enumerate()
            .map(|(i, xi)| ((xi - x).norm(), i))
            .collect();
        dists.sort_by(|a, b| a.0.total_cmp(&b.0));
        dists.truncate(self.k);

        // An exact hit dominates everything else.
        if dists[0].0 == 0.0 {
            return Some(self.ys[dists[0].1]);
        }

        let scale = dists.iter().map(|(d, _)| d).sum::<f64>() / dists.len() as f64;
        let mut wsum = 0.0;
        let mut acc = 0.0;
        for (d, i) in &dists {
            let w = (-d / scale).exp();
            wsum += w;
            acc += w * self.ys[*i];
        }
        Some(acc / wsum)
    }
}
