//! Precomputed kernel matrix

use crate::core::{Result, SVMError};
use crate::kernel::KernelOracle;

/// Kernel backed by a dense, precomputed n x n matrix
///
/// Lookups are as cheap as a cache hit, so the engine skips its row cache.
#[derive(Debug, Clone)]
pub struct CustomKernel {
    n: usize,
    matrix: Vec<f64>,
}

impl CustomKernel {
    /// Create from a row-major n x n matrix
    pub fn new(n: usize, matrix: Vec<f64>) -> Result<Self> {
        if n == 0 {
            return Err(SVMError::EmptyDataset);
        }
        if matrix.len() != n * n {
            return Err(SVMError::DimensionMismatch {
                expected: n * n,
                actual: matrix.len(),
            });
        }
        if matrix.iter().any(|v| !v.is_finite()) {
            return Err(SVMError::InvalidDataset(
                "kernel matrix contains non-finite values".to_string(),
            ));
        }
        Ok(Self { n, matrix })
    }

    /// Create from nested rows
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self> {
        let n = rows.len();
        let mut matrix = Vec::with_capacity(n * n);
        for row in rows {
            if row.len() != n {
                return Err(SVMError::DimensionMismatch {
                    expected: n,
                    actual: row.len(),
                });
            }
            matrix.extend_from_slice(row);
        }
        Self::new(n, matrix)
    }

    /// Tabulate `f(i, j)` for all pairs
    pub fn from_fn<F: Fn(usize, usize) -> f64>(n: usize, f: F) -> Result<Self> {
        let matrix = (0..n * n).map(|p| f(p / n, p % n)).collect();
        Self::new(n, matrix)
    }
}

impl KernelOracle for CustomKernel {
    fn num_examples(&self) -> usize {
        self.n
    }

    fn evaluate(&self, i: usize, j: usize) -> f64 {
        self.matrix[i * self.n + j]
    }

    fn is_precomputed(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_custom_kernel_lookup() {
        let kernel = CustomKernel::from_rows(&[vec![1.0, 0.5], vec![0.5, 2.0]]).unwrap();
        assert_eq!(kernel.num_examples(), 2);
        assert_eq!(kernel.evaluate(0, 1), 0.5);
        assert_eq!(kernel.evaluate(1, 1), 2.0);
        assert!(kernel.capabilities().precomputed);
    }

    #[test]
    fn test_custom_kernel_from_fn() {
        let kernel = CustomKernel::from_fn(3, |i, j| (i * j) as f64).unwrap();
        assert_eq!(kernel.evaluate(2, 2), 4.0);
        assert_eq!(kernel.evaluate(1, 2), 2.0);
    }

    #[test]
    fn test_custom_kernel_shape_checked() {
        assert!(matches!(
            CustomKernel::from_rows(&[vec![1.0, 0.0], vec![0.0]]),
            Err(SVMError::DimensionMismatch { expected: 2, actual: 1 })
        ));
        assert!(matches!(
            CustomKernel::new(0, Vec::new()),
            Err(SVMError::EmptyDataset)
        ));
        assert!(CustomKernel::new(1, vec![f64::NAN]).is_err());
    }
}
