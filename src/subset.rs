//! Linear-subset discovery over noise data.
//!
//! Given the accumulated noise observations of one signature, the discovery
//! loop looks for a large subset with a clear linear relationship. Two
//! seeding strategies feed the outer loop: a contiguous-block seed, which
//! works when data from one regime arrives in runs, and a reweighting
//! mini-EM, which recovers interleaved regimes. Candidate subsets are
//! validated on a held-out split before they are accepted.

use std::collections::BTreeSet;

use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand::seq::index::sample;
use tracing::trace;

use crate::config::LearnerConfig;
use crate::error::{ModelError, ModelResult, RegressError};
use crate::params;
use crate::regress::{self, Algo, LinearFit};

fn row_pred(fit: &LinearFit, x: &DMatrix<f64>, i: usize) -> f64 {
    let mut p = fit.intercept;
    for j in 0..x.ncols() {
        p += fit.coefs[j] * x[(i, j)];
    }
    p
}

fn pick_rows(x: &DMatrix<f64>, y: &DVector<f64>, rows: &[usize]) -> (DMatrix<f64>, DVector<f64>) {
    let mut xs = DMatrix::zeros(rows.len(), x.ncols());
    let mut ys = DVector::zeros(rows.len());
    for (k, &i) in rows.iter().enumerate() {
        xs.set_row(k, &x.row(i));
        ys[k] = y[i];
    }
    (xs, ys)
}

/// Residual kernel: small errors get large weights, capped to keep exact
/// fits finite.
fn kernel_weights(errors: &DVector<f64>) -> DVector<f64> {
    errors.map(|e| {
        if e <= 0.0 {
            params::KERNEL_WEIGHT_CAP
        } else {
            e.powf(-params::KERNEL_DECAY_POW)
                .min(params::KERNEL_WEIGHT_CAP)
        }
    })
}

/// Seed from a random contiguous block: fit a stepwise model to the block
/// and keep every row it explains.
pub fn block_seed(
    x: &DMatrix<f64>,
    y: &DVector<f64>,
    cfg: &LearnerConfig,
    rng: &mut impl Rng,
) -> ModelResult<Vec<usize>> {
    let ndata = x.nrows();
    let rank = x.ncols() + 1;
    if ndata <= rank {
        return Ok(Vec::new());
    }
    let start = rng.gen_range(0..ndata - rank);
    let rows: Vec<usize> = (start..start + rank).collect();
    let (xb, yb) = pick_rows(x, y, &rows);
    let fit = match regress::fit(Algo::Forward, &xb, &yb) {
        Ok(fit) => fit,
        Err(ModelError::Regress(
            RegressError::RankDeficient { .. } | RegressError::NoConvergence,
        )) => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut subset = Vec::new();
    for i in 0..ndata {
        if (y[i] - row_pred(&fit, x, i)).abs() < cfg.model_error_thresh {
            subset.push(i);
        }
    }
    Ok(subset)
}

/// Seed by iterative reweighting: start from random rows, refit with
/// residual-kernel weights until the residuals stop moving, keep the rows
/// the final model explains. Recovers a regime even when its rows are
/// interleaved with other data.
pub fn mini_em(
    x: &DMatrix<f64>,
    y: &DVector<f64>,
    cfg: &LearnerConfig,
    rng: &mut impl Rng,
) -> ModelResult<Vec<usize>> {
    let ndata = x.nrows();
    let xcols = x.ncols();
    if ndata == 0 {
        return Ok(Vec::new());
    }

    let nseed = (xcols + 1).min(ndata);
    let mut w = DVector::zeros(ndata);
    for i in sample(rng, ndata, nseed) {
        w[i] = 1.0;
    }

    let mut error = DVector::zeros(ndata);
    for iter in 0..cfg.mini_em_max_iters {
        // Row-weighted least squares through the (already augmented) design.
        let mut xc = x.clone();
        let mut yc = y.clone();
        for i in 0..ndata {
            for j in 0..xcols {
                xc[(i, j)] *= w[i];
            }
            yc[i] *= w[i];
        }
        let coefs = match regress::fit_through(&xc, &yc) {
            Ok(c) => c,
            Err(ModelError::Regress(
                RegressError::RankDeficient { .. } | RegressError::NoConvergence,
            )) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let old_error = error;
        error = regress::residuals_through(x, y, &coefs);
        if iter > 0 && (&error - &old_error).norm() / (ndata as f64) < cfg.same_thresh {
            break;
        }
        w = kernel_weights(&error);
    }

    Ok((0..ndata)
        .filter(|&i| error[i] < cfg.model_error_thresh)
        .collect())
}

/// Search for the largest linear subset of the given rows.
///
/// Returns row indices into `x`. Accepted subsets must survive held-out
/// validation; each attempted subset is removed from the pool so later
/// iterations look at fresh data. Short-circuits as soon as a subset
/// reaches `new_mode_thresh`.
pub fn find_linear_subset(
    x: &DMatrix<f64>,
    y: &DVector<f64>,
    cfg: &LearnerConfig,
    rng: &mut impl Rng,
) -> ModelResult<Vec<usize>> {
    // Drop static columns and fold the intercept into the design.
    let active = regress::nonuniform_cols(x, cfg.same_thresh);
    let ndata = x.nrows();
    let mut xc = DMatrix::zeros(ndata, active.len() + 1);
    for i in 0..ndata {
        for (jj, &j) in active.iter().enumerate() {
            xc[(i, jj)] = x[(i, j)];
        }
        xc[(i, active.len())] = 1.0;
    }
    let xcols = xc.ncols();
    if ndata < xcols * 2 {
        return Ok(Vec::new());
    }

    let mut cur_x = xc;
    let mut cur_y = y.clone();
    let mut ungrouped: Vec<usize> = (0..ndata).collect();
    let mut best: Vec<usize> = Vec::new();

    for iter in 0..cfg.subset_max_iters {
        let subset = if iter == 0 {
            block_seed(&cur_x, &cur_y, cfg, rng)?
        } else {
            mini_em(&cur_x, &cur_y, cfg, rng)?
        };
        if subset.len() < xcols * 2 {
            continue;
        }

        // Held-out validation of the candidate.
        let ntest = (subset.len() as f64 * cfg.subset_test_ratio) as usize;
        let test_picks: BTreeSet<usize> = sample(rng, subset.len(), ntest).into_iter().collect();
        let mut train = Vec::new();
        let mut test = Vec::new();
        for (k, &i) in subset.iter().enumerate() {
            if test_picks.contains(&k) {
                test.push(i);
            } else {
                train.push(i);
            }
        }
        let (xtr, ytr) = pick_rows(&cur_x, &cur_y, &train);
        let fit = match regress::fit(Algo::Forward, &xtr, &ytr) {
            Ok(fit) => fit,
            Err(ModelError::Regress(
                RegressError::RankDeficient { .. } | RegressError::NoConvergence,
            )) => continue,
            Err(e) => return Err(e),
        };
        let (xte, yte) = pick_rows(&cur_x, &cur_y, &test);
        let test_norm: f64 = (0..test.len())
            .map(|i| {
                let r = yte[i] - row_pred(&fit, &xte, i);
                r * r
            })
            .sum::<f64>()
            .sqrt();
        if !test.is_empty() && test_norm / test.len() as f64 > cfg.model_error_thresh {
            trace!(size = subset.len(), "candidate subset failed held-out validation");
            continue;
        }

        if subset.len() > best.len() {
            best = subset.iter().map(|&i| ungrouped[i]).collect();
            if best.len() >= cfg.new_mode_thresh {
                return Ok(best);
            }
        }

        // Attempted rows are unlikely to fit any other regime; drop them
        // from the pool.
        let keep: Vec<usize> = {
            let taken: BTreeSet<usize> = subset.iter().copied().collect();
            (0..ungrouped.len()).filter(|i| !taken.contains(i)).collect()
        };
        let (nx, ny) = pick_rows(&cur_x, &cur_y, &keep);
        cur_x = nx;
        cur_y = ny;
        ungrouped = keep.iter().map(|&i| ungrouped[i]).collect();
        if ungrouped.len() < cfg.new_mode_thresh {
            break;
        }
    }
    Ok(best)
}

/// Largest group of rows sharing an identical target value. Used to seed a
/// constant model before linear discovery runs.
pub fn largest_const_subset(ys: &[(usize, f64)]) -> Vec<usize> {
    use std::collections::HashMap;
    let mut groups: HashMap<u64, Vec<usize>> = HashMap::new();
    for &(i, y) in ys {
        groups.entry(y.to_bits()).or_default().push(i);
    }
    groups
        .into_values()
        .max_by_key(|g| (g.len(), std::cmp::Reverse(g[0])))
        .unwrap_or_default()
}
