//! Decomposition engine
//!
//! Drives the iterate-to-convergence loop: pick a working set, solve the
//! sub-problem on it, fold the alpha changes into `lin[]`, update the model
//! and check the KKT conditions. Shrinking, the adaptive tolerance schedule
//! and the stall watchdog run on top of that loop.

use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, info, trace, warn};

use crate::cache::KernelCache;
use crate::core::{
    CancellationToken, LabelSource, Result, SVMError, SupportVector, SvmModel, TerminationReason,
    TrainingConfig, TrainingSummary,
};
use crate::kernel::KernelOracle;
use crate::parallel::{Parallelism, MIN_ITEMS_PER_THREAD};
use crate::solver::gradient::{GradientMode, GradientUpdater, UpdateContext};
use crate::solver::optimality::{self, OptimalityMonitor, StallAction};
use crate::solver::problem::Problem;
use crate::solver::qp::{PairwiseQpSolver, QpSolver};
use crate::solver::selection::{SelectionContext, WorkingSetSelector};
use crate::solver::shrinking::{Reactivation, ReactivationContext, ShrinkOutcome, ShrinkState};
use crate::solver::subproblem::{ModelState, QpBridge, SubproblemBuilder, SubproblemContext};

/// Result of one `optimize` call
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineOutcome {
    /// Iterations of this call
    pub iterations: usize,
    pub reason: TerminationReason,
    pub max_violation: f64,
    pub misclassified: usize,
}

/// Owns alpha, `lin[]`, the active set and the kernel cache for one training run
pub struct DecompositionEngine<'k, K: KernelOracle + ?Sized> {
    kernel: &'k mut K,
    config: TrainingConfig,
    problem: Problem,
    alpha: Vec<f64>,
    lin: Vec<f64>,
    cache: Option<KernelCache>,
    shrink: ShrinkState,
    selector: WorkingSetSelector,
    model: ModelState,
    builder: SubproblemBuilder,
    bridge: QpBridge,
    updater: GradientUpdater,
    mode: GradientMode,
    parallelism: Parallelism,
    qpsize: usize,
    cancel: CancellationToken,
    started: Instant,
    deadline: Option<Instant>,
    total_iterations: usize,
    last_outcome: Option<EngineOutcome>,
}

impl<'k, K: KernelOracle + ?Sized> DecompositionEngine<'k, K> {
    /// Validate inputs and set up the all-zero starting point
    pub fn new<L: LabelSource + ?Sized>(
        kernel: &'k mut K,
        labels: &L,
        config: &TrainingConfig,
    ) -> Result<Self> {
        config.validate()?;
        let problem = Problem::new(labels, config)?;
        let n = problem.len();
        if kernel.num_examples() != n {
            return Err(SVMError::DimensionMismatch {
                expected: n,
                actual: kernel.num_examples(),
            });
        }

        let caps = kernel.capabilities();
        let mode = if config.linadd_enabled && caps.linadd {
            GradientMode::Linadd {
                batch: config.batch_computation_enabled,
            }
        } else {
            GradientMode::Rows
        };
        let cache = match mode {
            GradientMode::Rows if !caps.precomputed => Some(KernelCache::new(n, config.cache_size)),
            _ => None,
        };
        let qpsize = if config.mkl.is_some() {
            config.qpsize.min(config.qpsize_max)
        } else {
            config.qpsize
        };

        debug!("examples = {}", n);
        debug!("qpsize = {}", qpsize);
        debug!("epsilon = {:e}", config.epsilon);
        debug!("kernel capabilities = {:?}", caps);
        debug!("gradient mode = {:?}", mode);
        debug!("use kernel cache = {}", cache.is_some());

        let alpha = vec![0.0; n];
        let lin = vec![0.0; n];
        let started = Instant::now();
        Ok(Self {
            kernel,
            shrink: ShrinkState::new(&alpha, &lin, config.max_history),
            selector: WorkingSetSelector::new(n),
            model: ModelState::new(&problem, &alpha, config.epsilon_a),
            builder: SubproblemBuilder::new(),
            bridge: QpBridge::new(Box::new(PairwiseQpSolver::new())),
            updater: GradientUpdater::new(mode, Parallelism::Sequential),
            mode,
            parallelism: Parallelism::Sequential,
            qpsize,
            cancel: CancellationToken::new(),
            started,
            deadline: config
                .max_train_time
                .map(|t| started + Duration::from_secs_f64(t)),
            total_iterations: 0,
            last_outcome: None,
            config: config.clone(),
            problem,
            alpha,
            lin,
            cache,
        })
    }

    /// Replace the built-in QP primitive
    pub fn with_qp_solver(mut self, solver: Box<dyn QpSolver>) -> Self {
        self.bridge = QpBridge::new(solver);
        self
    }

    pub fn with_parallelism(mut self, parallelism: Parallelism) -> Self {
        self.parallelism =
            parallelism.correct_for_workload(self.problem.len(), MIN_ITEMS_PER_THREAD);
        self.updater = GradientUpdater::new(self.mode, self.parallelism);
        self
    }

    /// Poll `token` once per iteration
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Start from the given alpha values, clipped into `[0, C_i]`
    pub fn warm_start(&mut self, alpha: &[f64]) -> Result<()> {
        let n = self.problem.len();
        if alpha.len() != n {
            return Err(SVMError::DimensionMismatch {
                expected: n,
                actual: alpha.len(),
            });
        }
        if let Some(bad) = alpha.iter().find(|a| !a.is_finite()) {
            return Err(SVMError::InvalidParameter(format!(
                "initial alpha must be finite, got {bad}"
            )));
        }
        let start: Vec<f64> = (0..n)
            .map(|i| alpha[i].abs().min(self.problem.cost(i)))
            .collect();
        debug!(
            "Computing starting state from {} support vectors",
            start.iter().filter(|&&a| a > 0.0).count()
        );

        if let Some(cache) = self.cache.as_mut() {
            let kernel = &*self.kernel;
            let free = (0..n).filter(|&i| start[i] > 0.0 && start[i] < self.problem.cost(i));
            let bounded = (0..n).filter(|&i| start[i] == self.problem.cost(i));
            for i in free.chain(bounded) {
                if !cache.space_available() {
                    break;
                }
                cache.cache_row(i, kernel);
            }
        }

        let all: Vec<usize> = (0..n).collect();
        let zeros = vec![0.0; n];
        self.alpha = start;
        self.lin.fill(0.0);
        self.updater
            .recompute(&mut *self.kernel, &self.problem, &self.alpha, &all, &mut self.lin);
        self.model = ModelState::new(&self.problem, &zeros, self.config.epsilon_a);
        self.model.update(
            &self.problem,
            &self.alpha,
            &zeros,
            &self.lin,
            &all,
            &all,
            self.config.epsilon_a,
            self.config.bias_enabled,
            0.0,
        );
        self.shrink.reset(&self.alpha, &self.lin);
        self.selector.clear();
        Ok(())
    }

    /// Run the decomposition loop until convergence or a stop condition
    pub fn optimize(&mut self) -> EngineOutcome {
        let n = self.problem.len();
        let linadd = matches!(self.mode, GradientMode::Linadd { .. });
        let epsilon_a = self.config.epsilon_a;
        let new_vars = self.config.effective_new_vars();
        let mut monitor = OptimalityMonitor::new(
            n,
            self.config.epsilon,
            linadd,
            self.config.stall_iterations,
            self.config.max_stall_relaxations,
        );
        let mut alpha_old = self.alpha.clone();
        let mut active = self.shrink.active_indices();
        let mut retrain = true;
        let mut reason = TerminationReason::Converged;
        let mut misclassified = 0;
        let mut iteration = 1usize;
        let mut completed = 0usize;
        self.selector.clear();

        while iteration < 3 || retrain {
            if self.cancel.is_cancelled() {
                info!("Training cancelled after {} iterations", iteration - 1);
                reason = TerminationReason::Cancelled;
                break;
            }
            if let Some(cache) = self.cache.as_mut() {
                cache.set_time(iteration as u64);
            }

            let qpsize = self.qpsize;
            let new_vars = new_vars.min(qpsize);
            self.selector.rotate(qpsize, new_vars);
            let free_slots = qpsize.saturating_sub(self.selector.len());
            {
                let ctx = SelectionContext {
                    problem: &self.problem,
                    alpha: &self.alpha,
                    lin: &self.lin,
                    active: &active,
                    epsilon_a,
                };
                if iteration % self.config.random_selection_period != 0 {
                    let mut from_cache = 0;
                    if let Some(cache) = self.cache.as_ref() {
                        if new_vars.min(free_slots) >= 4 {
                            from_cache = self.selector.select_steepest(
                                &ctx,
                                free_slots.min(new_vars) / 2,
                                Some(cache),
                            );
                        }
                    }
                    self.selector.select_steepest(
                        &ctx,
                        (free_slots - from_cache).min(new_vars - from_cache),
                        None,
                    );
                } else {
                    self.selector
                        .select_random(&ctx, free_slots.min(new_vars), iteration);
                }
            }
            let working = self.selector.working_set().to_vec();
            trace!("Iteration {}: {} variables chosen", iteration, working.len());

            let mut noshrink = !self.config.shrinking;
            if self.selector.note_round() {
                debug!("Working set empty for two consecutive rounds");
                if self.shrink.num_inactive() == 0
                    || !self.recheck_inactive(&mut monitor, iteration)
                {
                    break;
                }
                active = self.shrink.active_indices();
                self.selector.clear();
                noshrink = true;
            }

            if !working.is_empty() {
                self.step(&working, &active, &mut alpha_old, &mut monitor);
            }

            let check = monitor.check(
                &self.problem,
                &self.alpha,
                &self.lin,
                self.model.bias(),
                &active,
                iteration,
                epsilon_a,
            );
            retrain = check.retrain;
            misclassified = check.misclassified;

            if monitor.watchdog(iteration) == StallAction::Stop {
                reason = TerminationReason::Stalled;
                break;
            }

            if !retrain && self.shrink.num_inactive() > 0 {
                retrain = self.recheck_inactive(&mut monitor, iteration);
                active = self.shrink.active_indices();
                noshrink = true;
            }

            let tightened = !retrain;
            retrain = monitor.tighten(retrain);
            if tightened && retrain {
                noshrink = true;
            }
            trace!(
                "{} SV ({} at upper bound), max violation {:.6}",
                self.model.support_vectors(),
                self.model.at_upper_bound(),
                monitor.max_violation()
            );

            if iteration % self.config.shrink_period == 0 && !noshrink {
                self.shrink_problem(&mut monitor, iteration);
                active = self.shrink.active_indices();
            }

            completed += 1;
            self.total_iterations += 1;
            if self
                .config
                .max_iterations
                .is_some_and(|max| self.total_iterations >= max)
            {
                warn!("Iteration limit reached");
                reason = TerminationReason::MaxIterations;
                break;
            }
            if self.deadline.is_some_and(|d| Instant::now() >= d) {
                warn!("Training time limit reached");
                reason = TerminationReason::TimeLimit;
                break;
            }
            iteration += 1;
        }

        if self.shrink.num_inactive() > 0 {
            debug!("Reactivating {} inactive examples", self.shrink.num_inactive());
            self.reactivate(&mut monitor, true);
        }

        let all: Vec<usize> = (0..n).collect();
        let max_violation = if reason == TerminationReason::Cancelled {
            optimality::max_violation(
                &self.problem,
                &self.alpha,
                &self.lin,
                self.model.bias(),
                &all,
                epsilon_a,
            )
        } else {
            monitor.max_violation()
        };
        if self.shrink.num_inactive() == 0 {
            misclassified = all
                .iter()
                .filter(|&&i| self.problem.distance(i, self.lin[i], self.model.bias()) <= 0.0)
                .count();
        }

        info!(
            "Optimization finished ({} misclassified, maxdiff={:.8})",
            misclassified, max_violation
        );
        info!("obj = {:.16}, rho = {:.16}", self.objective(), self.model.bias());
        if max_violation > self.config.epsilon {
            warn!(
                "maximum violation ({:.6}) exceeds epsilon ({:.6}) due to numerical difficulties",
                max_violation, self.config.epsilon
            );
        }
        info!(
            "Number of SV: {} (including {} at upper bound)",
            self.model.support_vectors(),
            self.model.at_upper_bound()
        );

        let outcome = EngineOutcome {
            iterations: completed,
            reason,
            max_violation,
            misclassified,
        };
        self.last_outcome = Some(outcome);
        outcome
    }

    /// One atomic sub-step: solve on `working`, then update gradient and model
    fn step(
        &mut self,
        working: &[usize],
        active: &[usize],
        alpha_old: &mut [f64],
        monitor: &mut OptimalityMonitor,
    ) {
        if let Some(cache) = self.cache.as_mut() {
            for &i in working {
                cache.lock(i);
                cache.cache_row(i, &*self.kernel);
            }
        }

        let qp = self.builder.build(SubproblemContext {
            kernel: &*self.kernel,
            cache: self.cache.as_mut(),
            problem: &self.problem,
            alpha: &self.alpha,
            lin: &self.lin,
            working,
            bias_enabled: self.config.bias_enabled,
        });
        let step = self.bridge.solve(&qp, monitor.target());
        if step.diverged && self.qpsize > 2 {
            self.qpsize -= 1;
            warn!("Reducing working set size to {}", self.qpsize);
        }
        if step.relax_target {
            monitor.relax_target();
        }
        for (&i, &a) in working.iter().zip(&step.alpha) {
            self.alpha[i] = a;
        }

        self.updater.update(
            UpdateContext {
                kernel: &mut *self.kernel,
                cache: self.cache.as_ref(),
                problem: &self.problem,
                working,
                alpha: &self.alpha,
                alpha_old,
                targets: active,
            },
            &mut self.lin,
        );
        self.model.update(
            &self.problem,
            &self.alpha,
            alpha_old,
            &self.lin,
            working,
            active,
            self.config.epsilon_a,
            self.config.bias_enabled,
            step.offset,
        );
        for &i in working {
            alpha_old[i] = self.alpha[i];
        }

        if let Some(cache) = self.cache.as_mut() {
            for &i in working {
                cache.unlock(i);
            }
        }
    }

    fn reactivate(&mut self, monitor: &mut OptimalityMonitor, force_all: bool) -> Reactivation {
        let result = self.shrink.reactivate(
            ReactivationContext {
                kernel: &mut *self.kernel,
                cache: self.cache.as_mut(),
                problem: &self.problem,
                alpha: &self.alpha,
                lin: &mut self.lin,
                bias: self.model.bias(),
                epsilon_a: self.config.epsilon_a,
                epsilon_shrink: monitor.epsilon_shrink(),
                mode: self.mode,
                parallelism: self.parallelism,
            },
            force_all,
        );
        monitor.set_max_violation(result.max_violation);
        result
    }

    /// Bring shrunk examples up to date and re-test every KKT condition
    ///
    /// Returns true when the largest violation calls for more optimization.
    fn recheck_inactive(&mut self, monitor: &mut OptimalityMonitor, iteration: usize) -> bool {
        debug!("Reactivating inactive examples");
        let result = self.reactivate(monitor, false);
        monitor.reset_watchdog(iteration);
        if result.max_violation > monitor.epsilon_crit() {
            info!(
                "Restarting: max violation {:.6} exceeds {:.6} after reactivation",
                result.max_violation,
                monitor.epsilon_crit()
            );
            return true;
        }
        false
    }

    fn shrink_problem(&mut self, monitor: &mut OptimalityMonitor, iteration: usize) {
        let keep_history = matches!(self.mode, GradientMode::Rows);
        let outcome = self.shrink.shrink(
            &self.alpha,
            monitor.last_suboptimal_at(),
            iteration,
            self.config.iter_to_shrink,
            self.shrink.min_shrink_count(),
            keep_history,
        );
        match outcome {
            ShrinkOutcome::Shrunk(_) => {
                let active = self.shrink.num_active();
                if let Some(cache) = self.cache.as_mut() {
                    let releasable = cache.num_columns().saturating_sub(active);
                    if self.model.support_vectors() > cache.max_rows()
                        && releasable > (active / 10).max(500)
                    {
                        cache.shrink(self.shrink.active_mask());
                    }
                }
            }
            ShrinkOutcome::HistoryFull => {
                debug!("Shrink history full, reactivating all examples");
                self.reactivate(monitor, true);
            }
            ShrinkOutcome::TooFew | ShrinkOutcome::WouldStrand => {}
        }
    }

    pub fn problem(&self) -> &Problem {
        &self.problem
    }

    pub fn alpha(&self) -> &[f64] {
        &self.alpha
    }

    /// `lin[j] = sum_i a_i y_i k(i, j)`
    pub fn lin(&self) -> &[f64] {
        &self.lin
    }

    /// Offset b with `dist_i = (lin_i - b) y_i`
    pub fn bias(&self) -> f64 {
        self.model.bias()
    }

    pub fn active_indices(&self) -> Vec<usize> {
        self.shrink.active_indices()
    }

    pub fn kernel(&self) -> &K {
        &*self.kernel
    }

    pub fn kernel_mut(&mut self) -> &mut K {
        &mut *self.kernel
    }

    pub fn parallelism(&self) -> Parallelism {
        self.parallelism
    }

    pub fn gradient_mode(&self) -> GradientMode {
        self.mode
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Iterations over all `optimize` calls
    pub fn total_iterations(&self) -> usize {
        self.total_iterations
    }

    /// Wall-clock budget is used up
    pub fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// `sum_i eps_i a_i + 1/2 a_i y_i lin_i`
    pub fn objective(&self) -> f64 {
        self.problem.objective(&self.alpha, &self.lin)
    }

    /// Replace `lin[]` after the kernel changed underneath the engine
    ///
    /// Drops cached rows, reactivates everything, forgets the working set and
    /// recomputes b from the new gradient.
    pub fn rebase_gradient(&mut self, lin: &[f64]) {
        self.lin.copy_from_slice(lin);
        if let Some(cache) = self.cache.as_mut() {
            cache.clear();
        }
        self.shrink.reset(&self.alpha, &self.lin);
        self.selector.clear();
        let all: Vec<usize> = (0..self.problem.len()).collect();
        self.model.recount(&self.problem, &self.alpha, self.config.epsilon_a);
        self.model.recompute_bias(
            &self.problem,
            &self.alpha,
            &self.lin,
            &all,
            self.config.epsilon_a,
            self.config.bias_enabled,
        );
    }

    /// Snapshot of the trained model
    pub fn model(&self) -> SvmModel {
        let support_vectors = self
            .alpha
            .iter()
            .enumerate()
            .filter(|(_, &a)| a > 0.0)
            .map(|(index, &a)| SupportVector {
                index,
                coefficient: a * self.problem.label(index),
            })
            .collect();
        SvmModel {
            support_vectors,
            bias: -self.model.bias(),
            subkernel_weights: self.kernel.subkernels().map(|s| s.weights().to_vec()),
            trained_at: Utc::now(),
        }
    }

    /// Summary of the latest `optimize` call
    pub fn summary(&self) -> TrainingSummary {
        let outcome = self.last_outcome.unwrap_or(EngineOutcome {
            iterations: 0,
            reason: TerminationReason::Converged,
            max_violation: 0.0,
            misclassified: 0,
        });
        let at_upper_bound = (0..self.problem.len())
            .filter(|&i| {
                self.alpha[i] > 0.0 && self.alpha[i] >= self.problem.cost(i) - self.config.epsilon_a
            })
            .count();
        TrainingSummary {
            iterations: self.total_iterations,
            reason: outcome.reason,
            max_violation: outcome.max_violation,
            objective: self.objective(),
            support_vectors: self.alpha.iter().filter(|&&a| a > 0.0).count(),
            at_upper_bound,
            misclassified: outcome.misclassified,
            elapsed_seconds: self.started.elapsed().as_secs_f64(),
            mkl: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SparseVector;
    use crate::kernel::{CustomKernel, LinearKernel, RbfKernel};
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// RBF kernel that cancels `token` once `limit` evaluations have been made
    struct TrippingKernel {
        inner: RbfKernel,
        evaluations: AtomicUsize,
        limit: usize,
        token: CancellationToken,
    }

    impl KernelOracle for TrippingKernel {
        fn num_examples(&self) -> usize {
            self.inner.num_examples()
        }

        fn evaluate(&self, i: usize, j: usize) -> f64 {
            if self.evaluations.fetch_add(1, Ordering::SeqCst) + 1 >= self.limit {
                self.token.cancel();
            }
            self.inner.evaluate(i, j)
        }
    }

    fn blobs(n: usize, seed: u64, spread: f64) -> (Vec<SparseVector>, Vec<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut features = Vec::with_capacity(n);
        let mut labels = Vec::with_capacity(n);
        for i in 0..n {
            let y = if i % 2 == 0 { 1.0 } else { -1.0 };
            let x = [
                y + rng.gen_range(-spread..spread),
                y + rng.gen_range(-spread..spread),
            ];
            features.push(SparseVector::from_dense(&x));
            labels.push(y);
        }
        (features, labels)
    }

    fn assert_consistent<K: KernelOracle + ?Sized>(engine: &DecompositionEngine<'_, K>) {
        let problem = engine.problem();
        let alpha = engine.alpha();
        for (i, &a) in alpha.iter().enumerate() {
            assert!(a >= 0.0 && a <= problem.cost(i), "alpha[{i}] = {a}");
        }
        let balance: f64 = alpha.iter().zip(problem.labels()).map(|(a, y)| a * y).sum();
        assert!(balance.abs() < 1e-8, "equality violated by {balance}");
        for j in 0..alpha.len() {
            let fresh: f64 = (0..alpha.len())
                .map(|i| alpha[i] * problem.label(i) * engine.kernel().evaluate(i, j))
                .sum();
            assert_relative_eq!(engine.lin()[j], fresh, epsilon = 1e-7);
        }
    }

    #[test]
    fn test_engine_converges_with_rows() {
        let (features, labels) = blobs(60, 7, 0.8);
        let mut kernel = RbfKernel::new(features, 0.5).unwrap();
        let config = TrainingConfig {
            qpsize: 10,
            ..TrainingConfig::default()
        };
        let mut engine = DecompositionEngine::new(&mut kernel, &labels, &config).unwrap();
        let outcome = engine.optimize();
        assert_eq!(outcome.reason, TerminationReason::Converged);
        assert!(outcome.max_violation <= config.epsilon + 1e-12);
        assert_consistent(&engine);
        assert!(engine.summary().support_vectors > 0);
    }

    #[test]
    fn test_engine_converges_with_linadd() {
        let (features, labels) = blobs(80, 11, 1.2);
        let mut kernel = LinearKernel::new(features).unwrap();
        let mut engine =
            DecompositionEngine::new(&mut kernel, &labels, &TrainingConfig::default()).unwrap();
        let outcome = engine.optimize();
        assert_eq!(outcome.reason, TerminationReason::Converged);
        assert_consistent(&engine);
    }

    #[test]
    fn test_linadd_shrinking_agrees_with_plain_run() {
        let (features, labels) = blobs(400, 21, 1.5);
        let plain_config = TrainingConfig {
            shrinking: false,
            ..TrainingConfig::default()
        };
        let mut k0 = LinearKernel::new(features.clone()).unwrap();
        let mut plain = DecompositionEngine::new(&mut k0, &labels, &plain_config).unwrap();
        plain.optimize();
        let plain_obj = plain.objective();

        for batch in [true, false] {
            let config = TrainingConfig {
                iter_to_shrink: 2,
                shrink_period: 2,
                batch_computation_enabled: batch,
                ..TrainingConfig::default()
            };
            let mut kernel = LinearKernel::new(features.clone()).unwrap();
            let mut engine = DecompositionEngine::new(&mut kernel, &labels, &config).unwrap();
            assert_eq!(engine.gradient_mode(), GradientMode::Linadd { batch });
            let outcome = engine.optimize();
            assert!(outcome.reason.is_converged());
            assert_eq!(engine.active_indices().len(), 400);
            assert_consistent(&engine);
            assert!((engine.objective() - plain_obj).abs() < 1e-2 * plain_obj.abs().max(1.0));
        }
    }

    #[test]
    fn test_shrinking_and_small_cache_agree_with_plain_run() {
        let (features, labels) = blobs(300, 3, 1.5);
        let plain_config = TrainingConfig {
            shrinking: false,
            qpsize: 12,
            ..TrainingConfig::default()
        };
        let shrink_config = TrainingConfig {
            iter_to_shrink: 2,
            qpsize: 12,
            cache_size: 20 * 300 * 8,
            ..TrainingConfig::default()
        };

        let mut k1 = RbfKernel::new(features.clone(), 0.3).unwrap();
        let mut plain = DecompositionEngine::new(&mut k1, &labels, &plain_config).unwrap();
        plain.optimize();
        let plain_obj = plain.objective();

        let mut k2 = RbfKernel::new(features, 0.3).unwrap();
        let mut shrunk = DecompositionEngine::new(&mut k2, &labels, &shrink_config).unwrap();
        let outcome = shrunk.optimize();
        assert!(outcome.reason.is_converged());
        assert!(shrunk.active_indices().len() == 300);
        assert_consistent(&shrunk);
        assert!((shrunk.objective() - plain_obj).abs() < 1e-2 * plain_obj.abs().max(1.0));
    }

    #[test]
    fn test_without_bias() {
        let (features, labels) = blobs(40, 5, 0.5);
        let mut kernel = CustomKernel::from_fn(40, |i, j| {
            let (x, z) = (&features[i], &features[j]);
            x.get(0) * z.get(0) + x.get(1) * z.get(1) + 1.0
        })
        .unwrap();
        let config = TrainingConfig {
            bias_enabled: false,
            ..TrainingConfig::default()
        };
        let mut engine = DecompositionEngine::new(&mut kernel, &labels, &config).unwrap();
        let outcome = engine.optimize();
        assert!(outcome.reason.is_converged());
        assert_eq!(engine.bias(), 0.0);
        assert_eq!(outcome.misclassified, 0);
    }

    #[test]
    fn test_warm_start_from_solution() {
        let (features, labels) = blobs(50, 9, 0.9);
        let mut kernel = RbfKernel::new(features, 1.0).unwrap();
        let config = TrainingConfig::default();
        let solution = {
            let mut engine = DecompositionEngine::new(&mut kernel, &labels, &config).unwrap();
            engine.optimize();
            engine.alpha().to_vec()
        };

        let mut engine = DecompositionEngine::new(&mut kernel, &labels, &config).unwrap();
        engine.warm_start(&solution).unwrap();
        let updater = GradientUpdater::new(GradientMode::Rows, Parallelism::Sequential);
        let mut expected = vec![0.0; 50];
        let all: Vec<usize> = (0..50).collect();
        updater.recompute(
            engine.kernel_mut(),
            &config_problem(&labels),
            &solution,
            &all,
            &mut expected,
        );
        for j in 0..50 {
            assert_relative_eq!(engine.lin()[j], expected[j], epsilon = 1e-9);
        }
        let outcome = engine.optimize();
        assert!(outcome.reason.is_converged());
        assert!(outcome.iterations <= 10);
    }

    fn config_problem(labels: &[f64]) -> Problem {
        Problem::new(labels, &TrainingConfig::default()).unwrap()
    }

    #[test]
    fn test_warm_start_rejects_wrong_length() {
        let mut kernel = CustomKernel::from_fn(2, |i, j| if i == j { 1.0 } else { 0.0 }).unwrap();
        let labels = vec![1.0, -1.0];
        let mut engine =
            DecompositionEngine::new(&mut kernel, &labels, &TrainingConfig::default()).unwrap();
        assert!(engine.warm_start(&[0.5]).is_err());
        assert!(engine.warm_start(&[f64::NAN, 0.0]).is_err());
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let mut kernel = CustomKernel::from_fn(3, |_, _| 1.0).unwrap();
        let labels = vec![1.0, -1.0];
        let result = DecompositionEngine::new(&mut kernel, &labels, &TrainingConfig::default());
        assert!(matches!(result, Err(SVMError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_cancelled_before_start() {
        let (features, labels) = blobs(20, 1, 0.5);
        let mut kernel = RbfKernel::new(features, 1.0).unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let mut engine = DecompositionEngine::new(&mut kernel, &labels, &TrainingConfig::default())
            .unwrap()
            .with_cancellation(token);
        let outcome = engine.optimize();
        assert_eq!(outcome.reason, TerminationReason::Cancelled);
        assert!(engine.alpha().iter().all(|&a| a == 0.0));
    }

    #[test]
    fn test_cancellation_mid_run_keeps_gradient_consistent() {
        let (features, labels) = blobs(200, 17, 2.0);
        let token = CancellationToken::new();
        let mut kernel = TrippingKernel {
            inner: RbfKernel::new(features, 0.5).unwrap(),
            evaluations: AtomicUsize::new(0),
            limit: 2_000,
            token: token.clone(),
        };
        let config = TrainingConfig {
            qpsize: 4,
            iter_to_shrink: 1,
            shrink_period: 1,
            ..TrainingConfig::default()
        };
        let mut engine = DecompositionEngine::new(&mut kernel, &labels, &config)
            .unwrap()
            .with_cancellation(token);
        let outcome = engine.optimize();

        assert_eq!(outcome.reason, TerminationReason::Cancelled);
        assert!(engine.alpha().iter().any(|&a| a > 0.0));
        assert_eq!(engine.active_indices().len(), 200);
        assert_consistent(&engine);
    }

    #[test]
    fn test_recheck_wakes_violating_examples() {
        let (features, labels) = blobs(20, 4, 0.5);
        let mut kernel = RbfKernel::new(features, 1.0).unwrap();
        let config = TrainingConfig::default();
        let mut engine = DecompositionEngine::new(&mut kernel, &labels, &config).unwrap();
        let mut monitor = OptimalityMonitor::new(
            20,
            config.epsilon,
            false,
            config.stall_iterations,
            config.max_stall_relaxations,
        );

        // At alpha = 0 every margin is violated
        let alpha = engine.alpha().to_vec();
        let last: Vec<usize> = (0..20).map(|i| if i < 10 { 0 } else { 9 }).collect();
        let outcome = engine.shrink.shrink(&alpha, &last, 10, 5, 1, true);
        assert_eq!(outcome, ShrinkOutcome::Shrunk(10));
        assert!(engine.recheck_inactive(&mut monitor, 10));
        assert!(engine.shrink.num_inactive() < 10);

        // After convergence, shrinking the examples at zero hides no violation
        engine.optimize();
        let alpha = engine.alpha().to_vec();
        let last: Vec<usize> = alpha.iter().map(|&a| if a == 0.0 { 0 } else { 9 }).collect();
        let outcome = engine.shrink.shrink(&alpha, &last, 10, 5, 1, true);
        assert!(matches!(outcome, ShrinkOutcome::Shrunk(_)));
        assert!(!engine.recheck_inactive(&mut monitor, 10));
        assert_consistent(&engine);
    }

    #[test]
    fn test_iteration_limit() {
        let (features, labels) = blobs(200, 2, 2.0);
        let mut kernel = RbfKernel::new(features, 0.5).unwrap();
        let config = TrainingConfig {
            qpsize: 4,
            max_iterations: Some(3),
            ..TrainingConfig::default()
        };
        let mut engine = DecompositionEngine::new(&mut kernel, &labels, &config).unwrap();
        let outcome = engine.optimize();
        assert_eq!(outcome.reason, TerminationReason::MaxIterations);
        assert_eq!(engine.total_iterations(), 3);
        assert_consistent(&engine);
    }
}
