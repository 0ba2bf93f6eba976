//! Core traits: label sources and trained classifiers

use crate::core::{Prediction, Result, SVMError, SvmModel};

/// Read-only source of binary labels
pub trait LabelSource {
    /// Number of labelled examples
    fn len(&self) -> usize;

    /// Label of example `i`
    fn label(&self, i: usize) -> f64;

    /// Check if the source is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Collect and check the labels; every label must be -1 or +1
    fn to_labels(&self) -> Result<Vec<f64>> {
        if self.is_empty() {
            return Err(SVMError::EmptyDataset);
        }
        (0..self.len())
            .map(|i| {
                let y = self.label(i);
                if y == 1.0 || y == -1.0 {
                    Ok(y)
                } else {
                    Err(SVMError::InvalidLabel(y))
                }
            })
            .collect()
    }
}

impl LabelSource for [f64] {
    fn len(&self) -> usize {
        <[f64]>::len(self)
    }

    fn label(&self, i: usize) -> f64 {
        self[i]
    }
}

impl LabelSource for Vec<f64> {
    fn len(&self) -> usize {
        self.as_slice().len()
    }

    fn label(&self, i: usize) -> f64 {
        self[i]
    }
}

/// Trained kernel classifier
pub trait Classifier: Send + Sync {
    /// Decision value given `k(sv_index, x)` for each support vector index
    fn decision_value(&self, kernel_column: &dyn Fn(usize) -> f64) -> f64;

    /// Predict label and decision value
    fn predict(&self, kernel_column: &dyn Fn(usize) -> f64) -> Prediction {
        let value = self.decision_value(kernel_column);
        Prediction::new(if value >= 0.0 { 1.0 } else { -1.0 }, value)
    }

    /// Get the number of support vectors
    fn n_support_vectors(&self) -> usize;

    /// Get the bias term
    fn bias(&self) -> f64;
}

impl Classifier for SvmModel {
    fn decision_value(&self, kernel_column: &dyn Fn(usize) -> f64) -> f64 {
        SvmModel::decision_value(self, kernel_column)
    }

    fn n_support_vectors(&self) -> usize {
        self.support_vectors.len()
    }

    fn bias(&self) -> f64 {
        self.bias
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_validated() {
        let labels = vec![1.0, -1.0, 1.0];
        assert_eq!(labels.to_labels().unwrap(), labels);

        let bad = vec![1.0, 0.0];
        assert!(matches!(bad.to_labels(), Err(SVMError::InvalidLabel(y)) if y == 0.0));

        let empty: Vec<f64> = Vec::new();
        assert!(matches!(empty.to_labels(), Err(SVMError::EmptyDataset)));
    }

    #[test]
    fn test_slice_label_source() {
        let labels = [1.0, -1.0];
        let source: &[f64] = &labels;
        assert_eq!(LabelSource::len(source), 2);
        assert_eq!(source.label(1), -1.0);
    }
}
