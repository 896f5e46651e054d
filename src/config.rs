//! Configuration for the learning engine.

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ModelResult};
use crate::params;
use crate::regress::Algo;

/// Configuration for a [`Learner`](crate::learner::Learner).
///
/// Defaults come from [`params`]; tests typically lower `new_mode_thresh`
/// to keep data volumes small.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnerConfig {
    /// Gaussian variance used when scoring residuals.
    pub measure_var: f64,
    /// Maximum acceptable absolute error for an inlier of a linear model.
    pub model_error_thresh: f64,
    /// Equality tolerance for floating point comparisons.
    pub same_thresh: f64,
    /// Constant likelihood reported by the noise mode.
    pub pnoise: f64,
    /// Outlier mass reserved when scoring residuals.
    pub epsilon: f64,
    /// Noise observations required before mode discovery triggers.
    pub new_mode_thresh: usize,
    /// Outer iteration budget for linear-subset discovery.
    pub subset_max_iters: usize,
    /// Iteration cap for the iterative-reweighting inner loop.
    pub mini_em_max_iters: usize,
    /// Held-out fraction for validating a candidate inlier subset.
    pub subset_test_ratio: f64,
    /// Minimum inlier fraction for accepting a mode unification.
    pub unify_inlier_ratio: f64,
    /// Membership size at or below which a mode is degenerate.
    pub degenerate_size: usize,
    /// Neighbors consulted by the per-signature fallback regressor.
    pub lwr_k: usize,
    /// Training fraction per class for numeric fallback classifiers.
    pub numeric_train_ratio: f64,
    /// Regression algorithm used for mode fitting.
    pub regression: Algo,
    /// Seed for the controller-owned RNG; fixed seeds make discovery
    /// reproducible.
    pub seed: u64,
    /// Master switch for the EM iteration; `run` is a no-op when false.
    pub use_em: bool,
    /// Invoke the relational clause learner when rebuilding classifiers.
    pub use_foil: bool,
    /// Train numeric fallback classifiers on residual sets.
    pub use_numeric: bool,
}

impl Default for LearnerConfig {
    fn default() -> Self {
        Self {
            measure_var: params::MEASURE_VAR,
            model_error_thresh: params::MODEL_ERROR_THRESH,
            same_thresh: params::SAME_THRESH,
            pnoise: params::PNOISE,
            epsilon: params::EPSILON,
            new_mode_thresh: params::NEW_MODE_THRESH,
            subset_max_iters: params::SUBSET_MAX_ITERS,
            mini_em_max_iters: params::MINI_EM_MAX_ITERS,
            subset_test_ratio: params::SUBSET_TEST_RATIO,
            unify_inlier_ratio: params::UNIFY_INLIER_RATIO,
            degenerate_size: params::DEGENERATE_SIZE,
            lwr_k: params::LWR_K,
            numeric_train_ratio: params::NUMERIC_TRAIN_RATIO,
            regression: Algo::Forward,
            seed: 0,
            use_em: true,
            use_foil: true,
            use_numeric: true,
        }
    }
}

impl LearnerConfig {
    /// Validate field ranges. Called by `Learner::new`.
    pub fn validate(&self) -> ModelResult<()> {
        if self.measure_var <= 0.0 {
            return Err(invalid("measure_var must be > 0"));
        }
        if self.model_error_thresh <= 0.0 {
            return Err(invalid("model_error_thresh must be > 0"));
        }
        if !(0.0..1.0).contains(&self.pnoise) || self.pnoise <= 0.0 {
            return Err(invalid("pnoise must be in (0, 1)"));
        }
        if !(0.0..1.0).contains(&self.epsilon) {
            return Err(invalid("epsilon must be in [0, 1)"));
        }
        if self.new_mode_thresh <= self.degenerate_size {
            return Err(invalid("new_mode_thresh must exceed degenerate_size"));
        }
        if self.subset_max_iters == 0 || self.mini_em_max_iters == 0 {
            return Err(invalid("iteration budgets must be > 0"));
        }
        if !(0.0..1.0).contains(&self.subset_test_ratio) || self.subset_test_ratio <= 0.0 {
            return Err(invalid("subset_test_ratio must be in (0, 1)"));
        }
        if !(0.0..=1.0).contains(&self.unify_inlier_ratio) {
            return Err(invalid("unify_inlier_ratio must be in [0, 1]"));
        }
        if !(0.0..1.0).contains(&self.numeric_train_ratio) || self.numeric_train_ratio <= 0.0 {
            return Err(invalid("numeric_train_ratio must be in (0, 1)"));
        }
        if self.lwr_k == 0 {
            return Err(invalid("lwr_k must be > 0"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> crate::error::ModelError {
    ConfigError::Invalid {
        message: message.into(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        LearnerConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_measure_var_rejected() {
        let cfg = LearnerConfig {
            measure_var: 0.0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn threshold_below_degenerate_size_rejected() {
        let cfg = LearnerConfig {
            new_mode_thresh: 2,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn config_round_trips_through_serde() {
        let cfg = LearnerConfig {
            new_mode_thresh: 25,
            seed: 7,
            ..Default::default()
        };
        let bytes = bincode::serialize(&cfg).unwrap();
        let back: LearnerConfig = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.new_mode_thresh, 25);
        assert_eq!(back.seed, 7);
    }
}
