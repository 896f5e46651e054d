//! Rich diagnostic error types for the linmodes engine.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]`
//! derives, providing error codes and help text. Recoverable conditions
//! (rank-deficient regressions, exhausted searches) are modeled as values,
//! not panics: a failed refit leaves the previous coefficients in place and
//! a fruitless search is an ordinary `None`.

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the linmodes engine.
///
/// Each variant wraps a subsystem-specific error, preserving the full
/// diagnostic chain (error codes, help text) through to the user.
#[derive(Debug, Error, Diagnostic)]
pub enum ModelError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Relation(#[from] RelationError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Regress(#[from] RegressError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Data errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum DataError {
    #[error("input dimension mismatch: signature expects {expected}, got {actual}")]
    #[diagnostic(
        code(linmodes::data::dim_mismatch),
        help(
            "The input vector must have exactly one value per property named \
             in the signature. Check that the scene producer and the property \
             vector agree on object ordering."
        )
    )]
    DimMismatch { expected: usize, actual: usize },

    #[error("target object index {target} out of range for signature of {len} objects")]
    #[diagnostic(
        code(linmodes::data::bad_target),
        help("The target must index one of the signature's entries.")
    )]
    TargetOutOfRange { target: usize, len: usize },

    #[error("mode index {mode} out of range ({len} modes)")]
    #[diagnostic(
        code(linmodes::data::bad_mode),
        help(
            "Mode 0 is the noise mode; learned modes follow. Mode indices \
             shift when degenerate modes are removed."
        )
    )]
    ModeOutOfRange { mode: usize, len: usize },
}

// ---------------------------------------------------------------------------
// Relation errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum RelationError {
    #[error("tuple arity mismatch for relation: expected {expected}, got {actual}")]
    #[diagnostic(
        code(linmodes::relation::arity_mismatch),
        help(
            "All tuples in a relation share one fixed arity, and the first \
             position is always the time index. Re-check the fact producer."
        )
    )]
    ArityMismatch { expected: usize, actual: usize },

    #[error("pattern of length {pattern} does not fit relation of arity {arity}")]
    #[diagnostic(
        code(linmodes::relation::bad_pattern),
        help("A match pattern may be at most as long as the relation's arity.")
    )]
    PatternTooLong { pattern: usize, arity: usize },

    #[error("no relation named {name:?} in the table")]
    #[diagnostic(
        code(linmodes::relation::unknown),
        help("Relations appear in the table after the first tick that asserts them.")
    )]
    Unknown { name: String },
}

// ---------------------------------------------------------------------------
// Regression errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum RegressError {
    #[error("cannot fit a linear model to an empty design matrix")]
    #[diagnostic(
        code(linmodes::regress::empty),
        help("At least one row of training data is required.")
    )]
    Empty,

    #[error("design matrix is rank deficient ({rows} rows, {cols} columns)")]
    #[diagnostic(
        code(linmodes::regress::rank_deficient),
        help(
            "The regression could not determine a unique solution. This is \
             recoverable: the caller keeps its previous coefficients and \
             retries after more data arrives."
        )
    )]
    RankDeficient { rows: usize, cols: usize },

    #[error("SVD failed to converge while solving the least-squares system")]
    #[diagnostic(
        code(linmodes::regress::no_convergence),
        help("Treat this like a rank-deficient fit: abort the current refit and retry later.")
    )]
    NoConvergence,
}

// ---------------------------------------------------------------------------
// Config errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("invalid configuration: {message}")]
    #[diagnostic(
        code(linmodes::config::invalid),
        help("Check the LearnerConfig fields. {message}")
    )]
    Invalid { message: String },
}

// ---------------------------------------------------------------------------
// Store errors (persistence)
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("I/O error: {source}")]
    #[diagnostic(
        code(linmodes::store::io),
        help(
            "A filesystem operation failed. Check that the target path exists, \
             has correct permissions, and that the disk is not full."
        )
    )]
    Io {
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {message}")]
    #[diagnostic(
        code(linmodes::store::serde),
        help(
            "Failed to serialize or deserialize engine state. This usually \
             means the stored format has changed between versions."
        )
    )]
    Serialization { message: String },
}

impl From<std::io::Error> for StoreError {
    fn from(source: std::io::Error) -> Self {
        StoreError::Io { source }
    }
}

/// Convenience alias for functions returning linmodes results.
pub type ModelResult<T> = std::result::Result<T, ModelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_error_converts_to_model_error() {
        let err = DataError::DimMismatch {
            expected: 4,
            actual: 3,
        };
        let model: ModelError = err.into();
        assert!(matches!(
            model,
            ModelError::Data(DataError::DimMismatch { .. })
        ));
    }

    #[test]
    fn regress_error_converts_to_model_error() {
        let err = RegressError::RankDeficient { rows: 2, cols: 5 };
        let model: ModelError = err.into();
        assert!(matches!(
            model,
            ModelError::Regress(RegressError::RankDeficient { .. })
        ));
    }

    #[test]
    fn error_display_messages_are_descriptive() {
        let err = DataError::DimMismatch {
            expected: 4,
            actual: 3,
        };
        let msg = format!("{err}");
        assert!(msg.contains('4'));
        assert!(msg.contains('3'));
    }
}
