//! Kernel oracle trait and its optional capabilities
//!
//! The engine only sees kernels through [`KernelOracle`]: a pure function
//! `k(i, j)` over training example indices. Faster code paths are offered
//! through capability accessors returning `Option`, which the engine queries
//! once via [`KernelOracle::capabilities`] when training starts.

/// Kernel over training example indices
pub trait KernelOracle: Send + Sync {
    /// Number of training examples the kernel is defined over
    fn num_examples(&self) -> usize;

    /// Compute k(i, j)
    fn evaluate(&self, i: usize, j: usize) -> f64;

    /// Compute `out[t] = sum_k weights[k] * k(sources[k], targets[t])`
    fn batch_evaluate(
        &self,
        targets: &[usize],
        sources: &[usize],
        weights: &[f64],
        out: &mut [f64],
    ) {
        for (o, &t) in out.iter_mut().zip(targets) {
            *o = sources
                .iter()
                .zip(weights)
                .map(|(&s, &w)| w * self.evaluate(s, t))
                .sum();
        }
    }

    /// Whether `batch_evaluate` is faster than repeated `evaluate` calls
    fn has_batch_evaluation(&self) -> bool {
        false
    }

    /// Kernel values come from a stored matrix, so caching rows gains nothing
    fn is_precomputed(&self) -> bool {
        false
    }

    /// Accumulated-normal fast path
    fn linadd(&self) -> Option<&dyn LinaddKernel> {
        None
    }

    fn linadd_mut(&mut self) -> Option<&mut dyn LinaddKernel> {
        None
    }

    /// Weighted sub-kernels for multiple kernel learning
    fn subkernels(&self) -> Option<&dyn SubkernelWeights> {
        None
    }

    fn subkernels_mut(&mut self) -> Option<&mut dyn SubkernelWeights> {
        None
    }

    /// Snapshot of the optional capabilities
    fn capabilities(&self) -> KernelCapabilities {
        KernelCapabilities {
            linadd: self.linadd().is_some(),
            batch_evaluation: self.has_batch_evaluation(),
            precomputed: self.is_precomputed(),
            subkernels: self.subkernels().map_or(1, |s| s.num_subkernels()),
        }
    }
}

/// Kernels admitting an explicit additive representation
///
/// `add_to_normal(i, w)` accumulates `w * phi(x_i)` into a normal vector;
/// `optimized_dot(j)` then returns `<normal, phi(x_j)>` without touching any
/// other example.
pub trait LinaddKernel: Send + Sync {
    fn clear_normal(&mut self);

    fn add_to_normal(&mut self, i: usize, weight: f64);

    fn optimized_dot(&self, j: usize) -> f64;

    /// Per-sub-kernel dots against the normal, unweighted by the mixing weights
    fn optimized_dot_by_subkernel(&self, j: usize, out: &mut [f64]) {
        out.fill(0.0);
        if let Some(first) = out.first_mut() {
            *first = self.optimized_dot(j);
        }
    }
}

/// Weighted sum of sub-kernels
pub trait SubkernelWeights: Send + Sync {
    fn num_subkernels(&self) -> usize;

    fn weights(&self) -> &[f64];

    fn set_weights(&mut self, beta: &[f64]);

    /// Compute k_d(i, j) for sub-kernel `d`, without its weight
    fn evaluate_subkernel(&self, d: usize, i: usize, j: usize) -> f64;

    /// Fill `out[d] = sum_k weights[k] * k_d(sources[k], j)` for every sub-kernel
    fn contribution(&self, j: usize, sources: &[usize], weights: &[f64], out: &mut [f64]) {
        for (d, o) in out.iter_mut().enumerate() {
            *o = sources
                .iter()
                .zip(weights)
                .map(|(&s, &w)| w * self.evaluate_subkernel(d, s, j))
                .sum();
        }
    }
}

/// Capabilities of a kernel, resolved once per training run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelCapabilities {
    pub linadd: bool,
    pub batch_evaluation: bool,
    pub precomputed: bool,
    pub subkernels: usize,
}

impl<K: KernelOracle + ?Sized> KernelOracle for Box<K> {
    fn num_examples(&self) -> usize {
        (**self).num_examples()
    }

    fn evaluate(&self, i: usize, j: usize) -> f64 {
        (**self).evaluate(i, j)
    }

    fn batch_evaluate(
        &self,
        targets: &[usize],
        sources: &[usize],
        weights: &[f64],
        out: &mut [f64],
    ) {
        (**self).batch_evaluate(targets, sources, weights, out)
    }

    fn has_batch_evaluation(&self) -> bool {
        (**self).has_batch_evaluation()
    }

    fn is_precomputed(&self) -> bool {
        (**self).is_precomputed()
    }

    fn linadd(&self) -> Option<&dyn LinaddKernel> {
        (**self).linadd()
    }

    fn linadd_mut(&mut self) -> Option<&mut dyn LinaddKernel> {
        (**self).linadd_mut()
    }

    fn subkernels(&self) -> Option<&dyn SubkernelWeights> {
        (**self).subkernels()
    }

    fn subkernels_mut(&mut self) -> Option<&mut dyn SubkernelWeights> {
        (**self).subkernels_mut()
    }
}
