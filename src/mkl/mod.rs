//! Multiple kernel learning
//!
//! Nested fixed-point iteration: the decomposition engine runs to its own
//! optimum under fixed sub-kernel weights, then the coordinator measures
//! each sub-kernel's share of the margin, asks the weight solver for new
//! weights, rebuilds `lin[]` from the per-kernel contributions and hands
//! control back to the engine. The outer loop stops once the relative gap
//! `|1 - rho / objective|` drops below `MklConfig::epsilon`.

pub mod weights;

pub use self::weights::{
    direct_weights, normalize_weights, prune_rows, LpSolution, RowId, RowStatus, SimplexWeightLp,
    WeightLp,
};

use log::{debug, error, info, warn};

use crate::core::{MklConfig, MklSummary, Result, SVMError, WeightSolverKind};
use crate::kernel::KernelOracle;
use crate::solver::{DecompositionEngine, EngineOutcome, GradientMode, GradientUpdater};

/// Relative gap between the LP bound and the current objective
fn relative_gap(rho: f64, objective: f64) -> f64 {
    if objective.abs() > f64::EPSILON {
        (1.0 - rho / objective).abs()
    } else {
        (objective - rho).abs()
    }
}

/// Outer re-weighting loop around a [`DecompositionEngine`]
pub struct MklCoordinator {
    config: MklConfig,
    solver: WeightSolverKind,
    lp: Box<dyn WeightLp>,
    beta: Vec<f64>,
    rho: f64,
    w_gap: f64,
    iterations: usize,
    fallback: bool,
    /// Row-major `n x D` matrix `W[i][d] = sum_j a_j y_j k_d(j, i)`
    contributions: Vec<f64>,
}

impl MklCoordinator {
    pub fn new(config: MklConfig) -> Self {
        Self {
            solver: config.effective_solver(),
            config,
            lp: Box::new(SimplexWeightLp::new()),
            beta: Vec::new(),
            rho: 0.0,
            w_gap: 1.0,
            iterations: 0,
            fallback: false,
            contributions: Vec::new(),
        }
    }

    /// Use another cutting-plane LP implementation
    pub fn with_weight_lp(mut self, lp: Box<dyn WeightLp>) -> Self {
        self.lp = lp;
        self
    }

    pub fn beta(&self) -> &[f64] {
        &self.beta
    }

    pub fn w_gap(&self) -> f64 {
        self.w_gap
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// The weight solver failed and the run finished with fixed weights
    pub fn fell_back(&self) -> bool {
        self.fallback
    }

    pub fn summary(&self) -> MklSummary {
        MklSummary {
            beta: self.beta.clone(),
            w_gap: self.w_gap,
            iterations: self.iterations,
            fallback: self.fallback,
        }
    }

    /// Alternate inner optimisation and weight updates until the gap closes
    pub fn train<K: KernelOracle + ?Sized>(
        &mut self,
        engine: &mut DecompositionEngine<'_, K>,
    ) -> Result<EngineOutcome> {
        let (d, initial) = {
            let sub = engine.kernel().subkernels().ok_or_else(|| {
                SVMError::MissingKernel(
                    "multiple kernel learning needs a kernel with sub-kernels".to_string(),
                )
            })?;
            (sub.num_subkernels(), sub.weights().to_vec())
        };

        if d <= 1 {
            info!("Single sub-kernel, training with fixed weight 1");
            self.reweight(engine, &[1.0], true);
            self.w_gap = 0.0;
            return Ok(engine.optimize());
        }

        let start = normalize_weights(&initial, self.config.norm);
        info!(
            "MKL over {} sub-kernels (norm {}, {:?} weight solver)",
            d, self.config.norm, self.solver
        );
        debug!("initial beta = {:?}", start);
        self.reweight(engine, &start, true);

        loop {
            let outcome = engine.optimize();
            if !outcome.reason.is_converged() {
                warn!(
                    "MKL stops early: inner optimization ended with {:?}",
                    outcome.reason
                );
                return Ok(outcome);
            }
            if engine.cancellation_token().is_cancelled() || engine.deadline_passed() {
                warn!("MKL stops early after {} iterations", self.iterations);
                return Ok(outcome);
            }

            self.compute_contributions(engine, d);
            let (suma, sumw) = self.sums(engine, d);
            let objective =
                -suma + self.beta.iter().zip(&sumw).map(|(b, s)| b * s).sum::<f64>();

            // The previous bound may already be tight against the new objective
            if self.solver == WeightSolverKind::CuttingPlane
                && self.lp.num_rows() > 0
                && relative_gap(self.rho, objective) < self.config.epsilon
            {
                self.w_gap = relative_gap(self.rho, objective);
                info!(
                    "MKL converged after {} iterations (w_gap = {:.6})",
                    self.iterations, self.w_gap
                );
                return Ok(outcome);
            }

            self.iterations += 1;
            let (beta, rho) = match self.solver {
                WeightSolverKind::Direct => {
                    direct_weights(&self.beta, &sumw, suma, self.config.norm)
                }
                _ => match self.cutting_plane_step(&sumw, suma, d) {
                    Ok(step) => step,
                    Err(e) => {
                        error!(
                            "Weight solver failed ({}), keeping weights {:?}",
                            e, self.beta
                        );
                        self.fallback = true;
                        return Ok(outcome);
                    }
                },
            };
            self.rho = rho;
            self.w_gap = relative_gap(rho, objective);
            debug!(
                "MKL iteration {}: objective = {:.8}, rho = {:.8}, w_gap = {:.6}, beta = {:?}",
                self.iterations, objective, rho, self.w_gap, beta
            );

            self.reweight(engine, &beta, false);

            if self.w_gap < self.config.epsilon || self.iterations >= self.config.max_iterations {
                if self.w_gap < self.config.epsilon {
                    info!(
                        "MKL converged after {} iterations (w_gap = {:.6})",
                        self.iterations, self.w_gap
                    );
                } else {
                    warn!(
                        "MKL iteration limit reached (w_gap = {:.6})",
                        self.w_gap
                    );
                }
                return Ok(engine.optimize());
            }
        }
    }

    /// Add the current cut, solve, and prune one inactive cut if over budget
    fn cutting_plane_step(&mut self, sumw: &[f64], suma: f64, d: usize) -> Result<(Vec<f64>, f64)> {
        self.lp.add_row(sumw, suma);
        let solution = self.lp.solve()?;
        if let Some(id) = prune_rows(
            self.lp.as_mut(),
            &solution,
            self.config.row_budget_factor * d,
        ) {
            debug!("Removed inactive cut {} ({} left)", id, self.lp.num_rows());
        }
        Ok((solution.beta, -solution.theta))
    }

    /// Fill `W[i][d]` for every example from the current alpha
    fn compute_contributions<K: KernelOracle + ?Sized>(
        &mut self,
        engine: &mut DecompositionEngine<'_, K>,
        d: usize,
    ) {
        let n = engine.problem().len();
        let problem = engine.problem();
        let (sources, weights): (Vec<usize>, Vec<f64>) = engine
            .alpha()
            .iter()
            .enumerate()
            .filter(|(_, &a)| a != 0.0)
            .map(|(i, &a)| (i, a * problem.label(i)))
            .unzip();
        let parallelism = engine.parallelism();
        let linadd = matches!(engine.gradient_mode(), GradientMode::Linadd { .. });

        self.contributions.clear();
        self.contributions.resize(n * d, 0.0);
        let mut rows: Vec<&mut [f64]> = self.contributions.chunks_mut(d).collect();
        let kernel = engine.kernel_mut();

        if linadd {
            if let Some(normal) = kernel.linadd_mut() {
                normal.clear_normal();
                for (&i, &w) in sources.iter().zip(&weights) {
                    normal.add_to_normal(i, w);
                }
                let normal = &*normal;
                parallelism.for_each_partition(&mut rows, |offset, part| {
                    for (k, row) in part.iter_mut().enumerate() {
                        normal.optimized_dot_by_subkernel(offset + k, row);
                    }
                });
                return;
            }
        }
        if let Some(sub) = kernel.subkernels() {
            parallelism.for_each_partition(&mut rows, |offset, part| {
                for (k, row) in part.iter_mut().enumerate() {
                    sub.contribution(offset + k, &sources, &weights, row);
                }
            });
        }
    }

    /// `suma = sum_i a_i`, `sumw_d = 1/2 sum_i a_i y_i W[i][d]`
    fn sums<K: KernelOracle + ?Sized>(
        &self,
        engine: &DecompositionEngine<'_, K>,
        d: usize,
    ) -> (f64, Vec<f64>) {
        let problem = engine.problem();
        let alpha = engine.alpha();
        let suma = alpha.iter().sum();
        let mut sumw = vec![0.0; d];
        for (i, &a) in alpha.iter().enumerate() {
            if a == 0.0 {
                continue;
            }
            let ay = a * problem.label(i);
            let row = &self.contributions[i * d..(i + 1) * d];
            for (s, w) in sumw.iter_mut().zip(row) {
                *s += 0.5 * ay * w;
            }
        }
        (suma, sumw)
    }

    /// Install `beta` on the kernel and rebuild `lin[]` under it
    fn reweight<K: KernelOracle + ?Sized>(
        &mut self,
        engine: &mut DecompositionEngine<'_, K>,
        beta: &[f64],
        refresh: bool,
    ) {
        self.beta = beta.to_vec();
        if let Some(sub) = engine.kernel_mut().subkernels_mut() {
            sub.set_weights(beta);
        }
        if engine.alpha().iter().all(|&a| a == 0.0) {
            return;
        }
        if refresh {
            self.compute_contributions(engine, beta.len());
        }
        let mut lin = vec![0.0; engine.problem().len()];
        GradientUpdater::new(engine.gradient_mode(), engine.parallelism()).combine_contributions(
            &self.contributions,
            beta,
            &mut lin,
        );
        engine.rebase_gradient(&lin);
    }
}
