//! Linear regression service: ordinary, ridge-regularized, and
//! forward-stepwise least squares over `nalgebra`.
//!
//! The stepwise variant is what mode fitting uses by default: it produces
//! exactly-zero coefficients for columns that do not help, which is what
//! lets a mode reduce its signature to the objects with real influence.
//! Rank deficiency is a recoverable [`RegressError`], never a panic.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{ModelResult, RegressError};
use crate::params;

/// Regression algorithm selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Algo {
    Ols,
    Ridge,
    Forward,
}

/// A fitted linear map `y = coefs . x + intercept`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearFit {
    pub coefs: DVector<f64>,
    pub intercept: f64,
}

impl LinearFit {
    /// A constant predictor with no inputs.
    pub fn constant(intercept: f64) -> Self {
        Self {
            coefs: DVector::zeros(0),
            intercept,
        }
    }

    pub fn predict(&self, x: &DVector<f64>) -> f64 {
        self.coefs.dot(x) + self.intercept
    }
}

/// Indices of columns whose values actually vary (spread above `tol`).
pub fn nonuniform_cols(x: &DMatrix<f64>, tol: f64) -> Vec<usize> {
    (0..x.ncols())
        .filter(|&j| {
            let col = x.column(j);
            let (mut lo, mut hi) = (f64::INFINITY, f64::NEG_INFINITY);
            for &v in col.iter() {
                lo = lo.min(v);
                hi = hi.max(v);
            }
            hi - lo > tol
        })
        .collect()
}

/// Fit `y = X b + intercept` with the chosen algorithm.
///
/// Static columns are excluded from the solve and receive zero
/// coefficients, so the returned vector always has `X.ncols()` entries.
pub fn fit(algo: Algo, x: &DMatrix<f64>, y: &DVector<f64>) -> ModelResult<LinearFit> {
    if x.nrows() == 0 || y.is_empty() {
        return Err(RegressError::Empty.into());
    }
    debug_assert_eq!(x.nrows(), y.len());

    let active = nonuniform_cols(x, params::SAME_THRESH);
    if active.is_empty() {
        return Ok(LinearFit::constant(y.mean()));
    }
    if x.nrows() < 2 {
        return Err(RegressError::RankDeficient {
            rows: x.nrows(),
            cols: active.len(),
        }
        .into());
    }

    match algo {
        Algo::Ols => fit_centered(x, y, &active, 0.0),
        Algo::Ridge => fit_centered(x, y, &active, params::RIDGE_LAMBDA),
        Algo::Forward => fit_forward(x, y, &active),
    }
}

/// Least squares with no intercept term, as used on design matrices that
/// already carry an explicit ones column (subset discovery).
pub fn fit_through(x: &DMatrix<f64>, y: &DVector<f64>) -> ModelResult<DVector<f64>> {
    if x.nrows() == 0 {
        return Err(RegressError::Empty.into());
    }
    let svd = x.clone().svd(true, true);
    let sol = svd
        .solve(y, 1.0e-12)
        .map_err(|_| RegressError::NoConvergence)?;
    Ok(DVector::from_column_slice(sol.as_slice()))
}

/// Absolute residuals of `y - X b` for a through-origin fit.
pub fn residuals_through(x: &DMatrix<f64>, y: &DVector<f64>, b: &DVector<f64>) -> DVector<f64> {
    (y - x * b).abs()
}

fn fit_centered(
    x: &DMatrix<f64>,
    y: &DVector<f64>,
    active: &[usize],
    lambda: f64,
) -> ModelResult<LinearFit> {
    let n = x.nrows();
    let k = active.len();

    let mut xc = DMatrix::zeros(n, k);
    let mut means = vec![0.0; k];
    for (jj, &j) in active.iter().enumerate() {
        let m = x.column(j).mean();
        means[jj] = m;
        for i in 0..n {
            xc[(i, jj)] = x[(i, j)] - m;
        }
    }
    let ym = y.mean();
    let yc = y.map(|v| v - ym);

    let b = if lambda > 0.0 {
        // (XᵀX + λI) b = Xᵀy, always positive definite for λ > 0.
        let xtx = xc.transpose() * &xc + DMatrix::identity(k, k) * lambda;
        let xty = xc.transpose() * &yc;
        xtx.cholesky()
            .ok_or(RegressError::RankDeficient { rows: n, cols: k })?
            .solve(&xty)
    } else {
        let svd = xc.clone().svd(true, true);
        let sol = svd
            .solve(&yc, 1.0e-12)
            .map_err(|_| RegressError::NoConvergence)?;
        DVector::from_column_slice(sol.as_slice())
    };

    let mut coefs = DVector::zeros(x.ncols());
    let mut intercept = ym;
    for (jj, &j) in active.iter().enumerate() {
        coefs[j] = b[jj];
        intercept -= b[jj] * means[jj];
    }
    Ok(LinearFit { coefs, intercept })
}

/// Greedy forward selection: repeatedly add the column that most reduces
/// the residual sum of squares, stopping when the gain is negligible or the
/// fit is already below the model error threshold.
fn fit_forward(x: &DMatrix<f64>, y: &DVector<f64>, active: &[usize]) -> ModelResult<LinearFit> {
    const REL_GAIN: f64 = 1.0e-6;

    let n = x.nrows();
    let ym = y.mean();
    let mut best_sse: f64 = y.iter().map(|v| (v - ym) * (v - ym)).sum();
    let mut selected: Vec<usize> = Vec::new();
    let mut best_fit = LinearFit::constant(ym);
    let mut remaining: Vec<usize> = active.to_vec();

    // Never select more columns than the data can support.
    let max_cols = n.saturating_sub(1).min(active.len());

    while selected.len() < max_cols {
        if (best_sse / n as f64).sqrt() < params::MODEL_ERROR_THRESH {
            break;
        }
        let mut round_best: Option<(usize, f64, LinearFit)> = None;
        for (ri, &cand) in remaining.iter().enumerate() {
            let mut cols = selected.clone();
            cols.push(cand);
            let Ok(fit) = fit_centered(x, y, &cols, 0.0) else {
                continue;
            };
            let sse: f64 = (0..n)
                .map(|i| {
                    let mut pred = fit.intercept;
                    for &j in &cols {
                        pred += fit.coefs[j] * x[(i, j)];
                    }
                    let r = y[i] - pred;
                    r * r
                })
                .sum();
            if round_best.as_ref().is_none_or(|(_, s, _)| sse < *s) {
                round_best = Some((ri, sse, fit));
            }
        }
        let Some((ri, sse, fit)) = round_best else {
            break;
        };
        if best_sse - sse <= best_sse * REL_GAIN {
            break;
        }
        selected.push(remaining.remove(ri));
        best_sse = sse;
        best_fit = fit;
    }

    Ok(best_fit)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn design(rows: &[&[f64]]) -> DMatrix<f64> {
        DMatrix::from_row_slice(rows.len(), rows[0].len(), &rows.concat())
    }

    #[test]
    fn ols_recovers_exact_line() {
        let x = design(&[&[0.0], &[1.0], &[2.0], &[3.0]]);
        let y = DVector::from_vec(vec![1.0, 3.0, 5.0, 7.0]);
        let fit = fit(Algo::Ols, &x, &y).unwrap();
        assert!((fit.coefs[0] - 2.0).abs() < 1e-9);
        assert!((fit.intercept - 1.0).abs() < 1e-9);
    }

    #[test]
    fn static_columns_get_zero_coefficients() {
        let x = design(&[&[0.0, 5.0], &[1.0, 5.0], &[2.0, 5.0], &[3.0, 5.0]]);
        let y = DVector::from_vec(vec![0.0, 2.0, 4.0, 6.0]);
        let fit = fit(Algo::Ols, &x, &y).unwrap();
        assert!((fit.coefs[0] - 2.0).abs() < 1e-9);
        assert_eq!(fit.coefs[1], 0.0);
    }

    #[test]
    fn all_static_columns_give_constant_model() {
        let x = design(&[&[5.0], &[5.0], &[5.0]]);
        let y = DVector::from_vec(vec![2.0, 2.0, 2.0]);
        let fit = fit(Algo::Ols, &x, &y).unwrap();
        assert!(fit.coefs.iter().all(|&c| c == 0.0));
        assert!((fit.intercept - 2.0).abs() < 1e-12);
    }

    #[test]
    fn forward_excludes_irrelevant_columns() {
        // y depends only on column 0; column 1 varies but is irrelevant.
        let rows: Vec<Vec<f64>> = (0..40)
            .map(|i| {
                let a = i as f64 * 0.1;
                let b = ((i * 7919) % 13) as f64; // decorrelated junk
                vec![a, b]
            })
            .collect();
        let refs: Vec<&[f64]> = rows.iter().map(|r| r.as_slice()).collect();
        let x = design(&refs);
        let y = DVector::from_iterator(40, (0..40).map(|i| 3.0 * (i as f64 * 0.1) + 0.5));
        let fit = fit(Algo::Forward, &x, &y).unwrap();
        assert!((fit.coefs[0] - 3.0).abs() < 1e-6, "coefs = {:?}", fit.coefs);
        assert_eq!(fit.coefs[1], 0.0);
        assert!((fit.intercept - 0.5).abs() < 1e-6);
    }

    #[test]
    fn forward_fit_is_exact_on_minimal_windows() {
        // Two rows determine slope and intercept exactly; candidate fits
        // must solve them without shrinkage so every collinear row later
        // passes the inlier cut.
        let x = design(&[&[1.0], &[2.0]]);
        let y = DVector::from_vec(vec![1.0, 4.0]);
        let fit = fit(Algo::Forward, &x, &y).unwrap();
        assert!((fit.coefs[0] - 3.0).abs() < 1e-9, "coefs = {:?}", fit.coefs);
        assert!((fit.intercept + 2.0).abs() < 1e-9, "intercept = {}", fit.intercept);
    }

    #[test]
    fn empty_design_is_an_error() {
        let x = DMatrix::zeros(0, 1);
        let y = DVector::zeros(0);
        assert!(fit(Algo::Ols, &x, &y).is_err());
    }

    #[test]
    fn single_row_with_varying_column_is_rank_deficient() {
        // One row cannot pin both slope and intercept.
        let x = design(&[&[1.0], &[2.0]]);
        let y = DVector::from_vec(vec![1.0, 2.0]);
        assert!(fit(Algo::Ols, &x, &y).is_ok());
        let x1 = DMatrix::from_row_slice(1, 1, &[1.0]);
        let y1 = DVector::from_vec(vec![1.0]);
        // A single row is constant in every column, so it degenerates to a
        // constant model rather than a failure.
        let f = fit(Algo::Ols, &x1, &y1).unwrap();
        assert_eq!(f.coefs.iter().filter(|&&c| c != 0.0).count(), 0);
    }

    #[test]
    fn through_origin_fit() {
        // Augmented ones column carries the intercept.
        let x = design(&[&[0.0, 1.0], &[1.0, 1.0], &[2.0, 1.0]]);
        let y = DVector::from_vec(vec![1.0, 3.0, 5.0]);
        let b = fit_through(&x, &y).unwrap();
        assert!((b[0] - 2.0).abs() < 1e-9);
        assert!((b[1] - 1.0).abs() < 1e-9);
        let r = residuals_through(&x, &y, &b);
        assert!(r.max() < 1e-9);
    }
}
