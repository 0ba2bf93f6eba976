//! Linear kernel implementation

use crate::core::{Result, SVMError, SparseVector};
use crate::kernel::{KernelOracle, LinaddKernel};

/// Linear kernel over a fixed set of sparse examples: K(x_i, x_j) = x_i^T x_j
///
/// Offers the accumulated-normal fast path: the normal `w = sum_i c_i x_i` is
/// kept as a dense vector, so `optimized_dot(j)` costs `nnz(x_j)`. Batch
/// evaluation builds a private normal of the same kind and leaves the shared
/// one alone.
#[derive(Debug, Clone)]
pub struct LinearKernel {
    features: Vec<SparseVector>,
    normal: Vec<f64>,
}

impl LinearKernel {
    /// Create a linear kernel over the given examples
    pub fn new(features: Vec<SparseVector>) -> Result<Self> {
        if features.is_empty() {
            return Err(SVMError::MissingKernel(
                "linear kernel needs at least one example".to_string(),
            ));
        }
        let dim = features.iter().map(SparseVector::dim).max().unwrap_or(0);
        Ok(Self {
            features,
            normal: vec![0.0; dim],
        })
    }

    /// Create a linear kernel from dense rows
    pub fn from_dense(rows: &[Vec<f64>]) -> Result<Self> {
        Self::new(rows.iter().map(|r| SparseVector::from_dense(r)).collect())
    }

    pub fn features(&self) -> &[SparseVector] {
        &self.features
    }

    /// Current normal vector
    pub fn normal(&self) -> &[f64] {
        &self.normal
    }
}

impl KernelOracle for LinearKernel {
    fn num_examples(&self) -> usize {
        self.features.len()
    }

    fn evaluate(&self, i: usize, j: usize) -> f64 {
        dot_product_sparse(&self.features[i], &self.features[j])
    }

    fn batch_evaluate(
        &self,
        targets: &[usize],
        sources: &[usize],
        weights: &[f64],
        out: &mut [f64],
    ) {
        let mut normal = vec![0.0; self.normal.len()];
        for (&i, &w) in sources.iter().zip(weights) {
            let x = &self.features[i];
            for (&idx, &v) in x.indices.iter().zip(&x.values) {
                normal[idx] += w * v;
            }
        }
        for (o, &t) in out.iter_mut().zip(targets) {
            *o = dot_dense(&normal, &self.features[t]);
        }
    }

    fn has_batch_evaluation(&self) -> bool {
        true
    }

    fn linadd(&self) -> Option<&dyn LinaddKernel> {
        Some(self)
    }

    fn linadd_mut(&mut self) -> Option<&mut dyn LinaddKernel> {
        Some(self)
    }
}

impl LinaddKernel for LinearKernel {
    fn clear_normal(&mut self) {
        self.normal.fill(0.0);
    }

    fn add_to_normal(&mut self, i: usize, weight: f64) {
        let x = &self.features[i];
        for (&idx, &v) in x.indices.iter().zip(&x.values) {
            self.normal[idx] += weight * v;
        }
    }

    fn optimized_dot(&self, j: usize) -> f64 {
        dot_dense(&self.normal, &self.features[j])
    }
}

fn dot_dense(dense: &[f64], x: &SparseVector) -> f64 {
    x.indices
        .iter()
        .zip(&x.values)
        .map(|(&idx, &v)| dense[idx] * v)
        .sum()
}

/// Compute dot product between two sparse vectors
///
/// Since both vectors have sorted indices, we can compute this efficiently
/// using a merge-like algorithm in O(nnz(x) + nnz(y)) time.
pub(crate) fn dot_product_sparse(x: &SparseVector, y: &SparseVector) -> f64 {
    let mut result = 0.0;
    let mut i = 0;
    let mut j = 0;

    while i < x.indices.len() && j < y.indices.len() {
        let x_idx = x.indices[i];
        let y_idx = y.indices[j];

        if x_idx == y_idx {
            result += x.values[i] * y.values[j];
            i += 1;
            j += 1;
        } else if x_idx < y_idx {
            i += 1;
        } else {
            j += 1;
        }
    }

    result
}
