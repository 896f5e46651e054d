//! Contract for the numeric binary classifier used as a fallback when
//! relational clauses misclassify part of a mode pair.
//!
//! The discriminant algorithm itself lives outside the engine; the engine
//! owns the training protocol (row selection, train/validation split,
//! baseline acceptance) and delegates the actual fitting through
//! [`NumericTrainer`]. Trained models are not persisted; on load they are
//! retrained from the persisted residual relations.

use nalgebra::DVector;

/// A trained binary classifier over full input vectors.
///
/// `classify` returns `true` when the row looks like the positive class,
/// which by the ensemble's convention is the first mode of the pair.
pub trait NumericModel {
    fn classify(&self, x: &DVector<f64>) -> bool;
}

/// Fits a [`NumericModel`] from labeled rows, or declines (`None`) when the
/// data is too thin or the classes are inseparable.
pub trait NumericTrainer {
    fn train(&mut self, rows: &[DVector<f64>], labels: &[bool]) -> Option<Box<dyn NumericModel>>;
}

/// Default collaborator: never produces a model, so pair votes fall through
/// to clauses and default votes.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoNumeric;

impl NumericTrainer for NoNumeric {
    fn train(&mut self, _rows: &[DVector<f64>], _labels: &[bool]) -> Option<Box<dyn NumericModel>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_numeric_declines() {
        let mut trainer = NoNumeric;
        let rows = vec![DVector::from_vec(vec![1.0]), DVector::from_vec(vec![2.0])];
        assert!(trainer.train(&rows, &[true, false]).is_none());
    }
}
