//! Weighted combination of sub-kernels: K(i, j) = sum_d beta_d K_d(i, j)

use crate::core::{Result, SVMError};
use crate::kernel::{KernelOracle, LinaddKernel, SubkernelWeights};

/// Weighted sum of kernels defined over the same examples
pub struct CombinedKernel {
    kernels: Vec<Box<dyn KernelOracle>>,
    weights: Vec<f64>,
    n: usize,
    linadd: bool,
}

impl CombinedKernel {
    /// Combine kernels with unit weights
    pub fn new(kernels: Vec<Box<dyn KernelOracle>>) -> Result<Self> {
        let weights = vec![1.0; kernels.len()];
        Self::with_weights(kernels, weights)
    }

    /// Combine kernels with the given initial weights
    pub fn with_weights(kernels: Vec<Box<dyn KernelOracle>>, weights: Vec<f64>) -> Result<Self> {
        let first = kernels.first().ok_or_else(|| {
            SVMError::MissingKernel("combined kernel has no sub-kernels".to_string())
        })?;
        let n = first.num_examples();
        if let Some(k) = kernels.iter().find(|k| k.num_examples() != n) {
            return Err(SVMError::DimensionMismatch {
                expected: n,
                actual: k.num_examples(),
            });
        }
        if weights.len() != kernels.len() {
            return Err(SVMError::DimensionMismatch {
                expected: kernels.len(),
                actual: weights.len(),
            });
        }
        if weights.iter().any(|&w| !(w.is_finite() && w >= 0.0)) {
            return Err(SVMError::InvalidParameter(
                "sub-kernel weights must be finite and non-negative".to_string(),
            ));
        }
        let linadd = kernels.iter().all(|k| k.linadd().is_some());
        Ok(Self {
            kernels,
            weights,
            n,
            linadd,
        })
    }

    pub fn kernels(&self) -> &[Box<dyn KernelOracle>] {
        &self.kernels
    }
}

impl KernelOracle for CombinedKernel {
    fn num_examples(&self) -> usize {
        self.n
    }

    fn evaluate(&self, i: usize, j: usize) -> f64 {
        self.kernels
            .iter()
            .zip(&self.weights)
            .filter(|(_, &w)| w != 0.0)
            .map(|(k, &w)| w * k.evaluate(i, j))
            .sum()
    }

    fn linadd(&self) -> Option<&dyn LinaddKernel> {
        if self.linadd {
            Some(self)
        } else {
            None
        }
    }

    fn linadd_mut(&mut self) -> Option<&mut dyn LinaddKernel> {
        if self.linadd {
            Some(self)
        } else {
            None
        }
    }

    fn subkernels(&self) -> Option<&dyn SubkernelWeights> {
        Some(self)
    }

    fn subkernels_mut(&mut self) -> Option<&mut dyn SubkernelWeights> {
        Some(self)
    }
}

// Sub-kernel normals are accumulated unweighted; the mixing weights are
// applied when dotting.
impl LinaddKernel for CombinedKernel {
    fn clear_normal(&mut self) {
        for k in &mut self.kernels {
            if let Some(l) = k.linadd_mut() {
                l.clear_normal();
            }
        }
    }

    fn add_to_normal(&mut self, i: usize, weight: f64) {
        for k in &mut self.kernels {
            if let Some(l) = k.linadd_mut() {
                l.add_to_normal(i, weight);
            }
        }
    }

    fn optimized_dot(&self, j: usize) -> f64 {
        self.kernels
            .iter()
            .zip(&self.weights)
            .filter(|(_, &w)| w != 0.0)
            .filter_map(|(k, &w)| k.linadd().map(|l| w * l.optimized_dot(j)))
            .sum()
    }

    fn optimized_dot_by_subkernel(&self, j: usize, out: &mut [f64]) {
        for (o, k) in out.iter_mut().zip(&self.kernels) {
            *o = k.linadd().map_or(0.0, |l| l.optimized_dot(j));
        }
    }
}

impl SubkernelWeights for CombinedKernel {
    fn num_subkernels(&self) -> usize {
        self.kernels.len()
    }

    fn weights(&self) -> &[f64] {
        &self.weights
    }

    fn set_weights(&mut self, beta: &[f64]) {
        for (w, &b) in self.weights.iter_mut().zip(beta) {
            *w = b;
        }
    }

    fn evaluate_subkernel(&self, d: usize, i: usize, j: usize) -> f64 {
        self.kernels[d].evaluate(i, j)
    }
}
