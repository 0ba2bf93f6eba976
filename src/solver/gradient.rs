//! Incremental maintenance of the linear component `lin[j] = sum_i a_i y_i k(i, j)`

use crate::cache::KernelCache;
use crate::kernel::KernelOracle;
use crate::parallel::Parallelism;
use crate::solver::problem::Problem;

/// How gradient entries are brought up to date
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradientMode {
    /// One kernel row per changed variable
    Rows,
    /// Accumulated normal vector plus one optimized dot per target
    Linadd {
        /// Refresh inactive examples through `batch_evaluate`
        batch: bool,
    },
}

/// Inputs of one incremental update
pub struct UpdateContext<'a, K: KernelOracle + ?Sized> {
    pub kernel: &'a mut K,
    /// Rows of the working set are expected to be resident when present
    pub cache: Option<&'a KernelCache>,
    pub problem: &'a Problem,
    pub working: &'a [usize],
    pub alpha: &'a [f64],
    pub alpha_old: &'a [f64],
    /// Entries of `lin` to update
    pub targets: &'a [usize],
}

/// Applies alpha changes to `lin[]`, partitioning the targets across workers
#[derive(Debug, Clone, Copy)]
pub struct GradientUpdater {
    mode: GradientMode,
    parallelism: Parallelism,
}

impl GradientUpdater {
    pub fn new(mode: GradientMode, parallelism: Parallelism) -> Self {
        Self { mode, parallelism }
    }

    pub fn mode(&self) -> GradientMode {
        self.mode
    }

    pub fn parallelism(&self) -> Parallelism {
        self.parallelism
    }

    /// Add the effect of `alpha - alpha_old` over the working set to `lin[targets]`
    ///
    /// Returns the number of working-set variables that changed.
    pub fn update<K: KernelOracle + ?Sized>(
        &self,
        ctx: UpdateContext<'_, K>,
        lin: &mut [f64],
    ) -> usize {
        let UpdateContext {
            kernel,
            cache,
            problem,
            working,
            alpha,
            alpha_old,
            targets,
        } = ctx;

        let (sources, weights): (Vec<usize>, Vec<f64>) = working
            .iter()
            .filter(|&&i| alpha[i] != alpha_old[i])
            .map(|&i| (i, (alpha[i] - alpha_old[i]) * problem.label(i)))
            .unzip();
        if sources.is_empty() {
            return 0;
        }

        let mut delta = vec![0.0; targets.len()];
        self.accumulate(kernel, cache, &sources, &weights, targets, &mut delta);
        for (&j, &d) in targets.iter().zip(&delta) {
            lin[j] += d;
        }
        sources.len()
    }

    /// Compute `lin[targets]` from scratch for the current alpha
    pub fn recompute<K: KernelOracle + ?Sized>(
        &self,
        kernel: &mut K,
        problem: &Problem,
        alpha: &[f64],
        targets: &[usize],
        lin: &mut [f64],
    ) {
        let (sources, weights): (Vec<usize>, Vec<f64>) = (0..alpha.len())
            .filter(|&i| alpha[i] != 0.0)
            .map(|i| (i, alpha[i] * problem.label(i)))
            .unzip();
        let mut fresh = vec![0.0; targets.len()];
        if !sources.is_empty() {
            self.accumulate(kernel, None, &sources, &weights, targets, &mut fresh);
        }
        for (&j, &v) in targets.iter().zip(&fresh) {
            lin[j] = v;
        }
    }

    /// `lin[i] = sum_d beta_d W[i][d]` from per-sub-kernel contributions
    pub fn combine_contributions(&self, contributions: &[f64], beta: &[f64], lin: &mut [f64]) {
        let d = beta.len();
        self.parallelism.for_each_partition(lin, |offset, part| {
            for (k, l) in part.iter_mut().enumerate() {
                let row = &contributions[(offset + k) * d..(offset + k + 1) * d];
                *l = row.iter().zip(beta).map(|(w, b)| w * b).sum();
            }
        });
    }

    /// `out[t] = sum_k weights[k] k(sources[k], targets[t])`
    fn accumulate<K: KernelOracle + ?Sized>(
        &self,
        kernel: &mut K,
        cache: Option<&KernelCache>,
        sources: &[usize],
        weights: &[f64],
        targets: &[usize],
        out: &mut [f64],
    ) {
        if let GradientMode::Linadd { .. } = self.mode {
            if let Some(linadd) = kernel.linadd_mut() {
                linadd.clear_normal();
                for (&i, &w) in sources.iter().zip(weights) {
                    linadd.add_to_normal(i, w);
                }
                let linadd = &*linadd;
                self.parallelism.for_each_partition(out, |offset, part| {
                    for (k, o) in part.iter_mut().enumerate() {
                        *o = linadd.optimized_dot(targets[offset + k]);
                    }
                });
                return;
            }
        }

        let kernel = &*kernel;
        self.parallelism.for_each_partition(out, |offset, part| {
            for (k, o) in part.iter_mut().enumerate() {
                let j = targets[offset + k];
                *o = sources
                    .iter()
                    .zip(weights)
                    .map(|(&i, &w)| {
                        w * cache
                            .and_then(|c| c.peek(i, j))
                            .unwrap_or_else(|| kernel.evaluate(i, j))
                    })
                    .sum();
            }
        });
    }
}
