//! RBF (Radial Basis Function) kernel implementation
//!
//! The RBF kernel is defined as: K(x, y) = exp(-γ * ||x - y||²)
//! where γ (gamma) is a hyperparameter that controls the kernel width.

use crate::core::{Result, SVMError, SparseVector};
use crate::kernel::linear::dot_product_sparse;
use crate::kernel::KernelOracle;

/// RBF kernel over a fixed set of sparse examples
///
/// Squared norms are computed once at construction, so each evaluation is a
/// single sparse dot product: ||x - y||² = ||x||² + ||y||² - 2 x^T y.
#[derive(Debug, Clone)]
pub struct RbfKernel {
    features: Vec<SparseVector>,
    norms_sq: Vec<f64>,
    gamma: f64,
}

impl RbfKernel {
    /// Create an RBF kernel with the given gamma
    pub fn new(features: Vec<SparseVector>, gamma: f64) -> Result<Self> {
        if !(gamma.is_finite() && gamma > 0.0) {
            return Err(SVMError::InvalidParameter(format!(
                "Gamma must be positive, got: {gamma}"
            )));
        }
        if features.is_empty() {
            return Err(SVMError::MissingKernel(
                "RBF kernel needs at least one example".to_string(),
            ));
        }
        let norms_sq = features.iter().map(SparseVector::norm_squared).collect();
        Ok(Self {
            features,
            norms_sq,
            gamma,
        })
    }

    /// Create an RBF kernel with gamma = 1.0 / n_features
    pub fn with_auto_gamma(features: Vec<SparseVector>) -> Result<Self> {
        let n_features = features.iter().map(SparseVector::dim).max().unwrap_or(0);
        Self::new(features, 1.0 / n_features.max(1) as f64)
    }

    /// Get the gamma parameter
    pub fn gamma(&self) -> f64 {
        self.gamma
    }
}

impl KernelOracle for RbfKernel {
    fn num_examples(&self) -> usize {
        self.features.len()
    }

    fn evaluate(&self, i: usize, j: usize) -> f64 {
        let dot = dot_product_sparse(&self.features[i], &self.features[j]);
        // Rounding can push the distance slightly below zero
        let squared_distance = (self.norms_sq[i] + self.norms_sq[j] - 2.0 * dot).max(0.0);
        (-self.gamma * squared_distance).exp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn points() -> Vec<SparseVector> {
        vec![
            SparseVector::new(vec![0, 1], vec![1.0, 2.0]),
            SparseVector::new(vec![0, 1], vec![3.0, 4.0]),
            SparseVector::new(vec![0, 2], vec![1.0, 1.0]),
            SparseVector::empty(),
        ]
    }

    #[test]
    fn test_rbf_kernel_values() {
        let kernel = RbfKernel::new(points(), 0.5).unwrap();

        // Identical vectors give exactly 1
        assert_relative_eq!(kernel.evaluate(0, 0), 1.0);

        // ||(1,2) - (3,4)||² = 8
        assert_relative_eq!(kernel.evaluate(0, 1), (-0.5f64 * 8.0).exp(), epsilon = 1e-12);

        // ||(1,2,0) - (1,0,1)||² = 5
        assert_relative_eq!(kernel.evaluate(0, 2), (-2.5f64).exp(), epsilon = 1e-12);

        // Distance to the origin is the squared norm
        assert_relative_eq!(kernel.evaluate(1, 3), (-0.5f64 * 25.0).exp(), epsilon = 1e-12);
    }

    #[test]
    fn test_rbf_kernel_symmetric_and_bounded() {
        let kernel = RbfKernel::new(points(), 0.1).unwrap();
        for i in 0..4 {
            for j in 0..4 {
                let v = kernel.evaluate(i, j);
                assert_relative_eq!(v, kernel.evaluate(j, i), epsilon = 1e-15);
                assert!(v > 0.0 && v <= 1.0);
            }
        }
    }

    #[test]
    fn test_rbf_kernel_invalid_gamma() {
        assert!(RbfKernel::new(points(), 0.0).is_err());
        assert!(RbfKernel::new(points(), -0.5).is_err());
    }

    #[test]
    fn test_rbf_auto_gamma() {
        let kernel = RbfKernel::with_auto_gamma(points()).unwrap();
        assert_relative_eq!(kernel.gamma(), 1.0 / 3.0);
        assert!(!kernel.capabilities().linadd);
    }
}
