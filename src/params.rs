//! Tuned numeric constants.
//!
//! These are the defaults baked into [`LearnerConfig`](crate::config);
//! tests and embedders override them through the config rather than here.

/// Gaussian variance used when scoring prediction residuals.
pub const MEASURE_VAR: f64 = 1e-8;

/// Regularization strength for ridge regression.
pub const RIDGE_LAMBDA: f64 = 1e-8;

/// Maximum absolute error for a row to count as an inlier of a linear model.
pub const MODEL_ERROR_THRESH: f64 = 1e-5;

/// Tolerance below which two floating point values are treated as equal.
pub const SAME_THRESH: f64 = 1e-15;

/// Constant likelihood reported by the noise mode.
pub const PNOISE: f64 = 1e-4;

/// Outlier mass reserved when scoring residuals.
pub const EPSILON: f64 = 1e-3;

/// Noise observations required before mode discovery triggers.
pub const NEW_MODE_THRESH: usize = 200;

/// Outer iteration budget for linear-subset discovery.
pub const SUBSET_MAX_ITERS: usize = 10;

/// Iteration cap for the iterative-reweighting inner loop.
pub const MINI_EM_MAX_ITERS: usize = 10;

/// Held-out fraction for validating a candidate inlier subset.
pub const SUBSET_TEST_RATIO: f64 = 0.5;

/// Minimum inlier fraction for accepting a mode unification.
pub const UNIFY_INLIER_RATIO: f64 = 0.9;

/// Membership size at or below which a mode is degenerate and removed.
pub const DEGENERATE_SIZE: usize = 2;

/// Neighbors consulted by the per-signature fallback regressor.
pub const LWR_K: usize = 20;

/// Training fraction per class for numeric fallback classifiers.
pub const NUMERIC_TRAIN_RATIO: f64 = 0.75;

/// Cap on residual-kernel weights, keeping exact fits finite.
pub const KERNEL_WEIGHT_CAP: f64 = 1e9;

/// Decay exponent of the residual kernel.
pub const KERNEL_DECAY_POW: f64 = 3.0;
