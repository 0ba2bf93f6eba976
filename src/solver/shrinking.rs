//! Shrinking heuristic: active set tracking
//!
//! Implements the shrinking strategy from Section 4 of the SVMlight paper
//! "Making Large-Scale SVM Learning Practical" by Thorsten Joachims.
//!
//! Variables that stayed at a bound for `iter_to_shrink` iterations are moved
//! out of the active set. Their gradient entries then go stale; reactivation
//! brings them up to date again, either from the accumulated normal vector or
//! by replaying the alpha snapshots taken at each shrink event, and re-tests
//! their optimality.

use log::debug;

use crate::cache::{fetch_row, KernelCache};
use crate::kernel::KernelOracle;
use crate::parallel::Parallelism;
use crate::solver::gradient::GradientMode;
use crate::solver::problem::{Problem, MARGIN_TARGET};

/// Result of a shrink attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShrinkOutcome {
    /// This many examples were deactivated
    Shrunk(usize),
    /// Fewer candidates than the minimum batch
    TooFew,
    /// Every active example qualified; shrinking would leave nothing to optimize
    WouldStrand,
    /// No room left for another alpha snapshot
    HistoryFull,
}

/// Result of a reactivation pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reactivation {
    /// Largest KKT violation over all examples
    pub max_violation: f64,
    /// Examples moved back into the active set
    pub reactivated: usize,
}

/// Everything a reactivation pass reads or refreshes
pub struct ReactivationContext<'a, K: KernelOracle + ?Sized> {
    pub kernel: &'a mut K,
    pub cache: Option<&'a mut KernelCache>,
    pub problem: &'a Problem,
    pub alpha: &'a [f64],
    pub lin: &'a mut [f64],
    pub bias: f64,
    pub epsilon_a: f64,
    pub epsilon_shrink: f64,
    pub mode: GradientMode,
    pub parallelism: Parallelism,
}

/// Active/inactive partition plus the state needed to refresh stale gradients
#[derive(Debug, Clone)]
pub struct ShrinkState {
    active: Vec<bool>,
    /// Shrink event number at which an example was deactivated
    inactive_since: Vec<usize>,
    /// Alpha snapshot per shrink event (row path only)
    history: Vec<Option<Vec<f64>>>,
    deactnum: usize,
    max_history: usize,
    /// Alpha and gradient at the last refresh (linadd path only)
    last_a: Vec<f64>,
    last_lin: Vec<f64>,
}

impl ShrinkState {
    /// All examples active; `alpha` and `lin` describe the starting point
    pub fn new(alpha: &[f64], lin: &[f64], max_history: usize) -> Self {
        let n = alpha.len();
        Self {
            active: vec![true; n],
            inactive_since: vec![0; n],
            history: Vec::new(),
            deactnum: 0,
            max_history,
            last_a: alpha.to_vec(),
            last_lin: lin.to_vec(),
        }
    }

    /// Reactivate everything and forget the history
    pub fn reset(&mut self, alpha: &[f64], lin: &[f64]) {
        self.active.fill(true);
        self.inactive_since.fill(0);
        self.history.clear();
        self.deactnum = 0;
        self.last_a.copy_from_slice(alpha);
        self.last_lin.copy_from_slice(lin);
    }

    #[inline]
    pub fn is_active(&self, i: usize) -> bool {
        self.active[i]
    }

    pub fn active_mask(&self) -> &[bool] {
        &self.active
    }

    /// Indices of active examples, ascending
    pub fn active_indices(&self) -> Vec<usize> {
        (0..self.active.len()).filter(|&i| self.active[i]).collect()
    }

    pub fn num_active(&self) -> usize {
        self.active.iter().filter(|&&a| a).count()
    }

    pub fn num_inactive(&self) -> usize {
        self.active.len() - self.num_active()
    }

    /// Stored alpha snapshots
    pub fn history_len(&self) -> usize {
        self.history.iter().filter(|h| h.is_some()).count()
    }

    /// Smallest batch worth shrinking: max(active/10, total/500, 100)
    pub fn min_shrink_count(&self) -> usize {
        let total = self.active.len();
        (self.num_active() / 10).max((total / 500).max(100))
    }

    /// Deactivate examples that have been at a bound for longer than `iter_to_shrink`
    ///
    /// `last_suboptimal_at[i]` is the last iteration at which example `i` was
    /// free or close to violating its constraint. With `keep_history` an alpha
    /// snapshot is stored so the row path can replay deltas on reactivation.
    pub fn shrink(
        &mut self,
        alpha: &[f64],
        last_suboptimal_at: &[usize],
        iteration: usize,
        iter_to_shrink: usize,
        min_count: usize,
        keep_history: bool,
    ) -> ShrinkOutcome {
        let eligible = |i: usize| iteration.saturating_sub(last_suboptimal_at[i]) > iter_to_shrink;
        let active = self.num_active();
        let candidates = (0..self.active.len())
            .filter(|&i| self.active[i] && eligible(i))
            .count();

        if candidates < min_count {
            return ShrinkOutcome::TooFew;
        }
        if candidates >= active {
            return ShrinkOutcome::WouldStrand;
        }
        if keep_history && self.deactnum >= self.max_history {
            return ShrinkOutcome::HistoryFull;
        }

        if keep_history {
            if self.history.len() <= self.deactnum {
                self.history.resize(self.deactnum + 1, None);
            }
            self.history[self.deactnum] = Some(alpha.to_vec());
        }
        for i in 0..self.active.len() {
            if self.active[i] && eligible(i) {
                self.active[i] = false;
                self.inactive_since[i] = self.deactnum;
            }
        }
        if keep_history {
            self.deactnum += 1;
        }
        debug!(
            "Shrinking: {} of {} active examples deactivated",
            candidates, active
        );
        ShrinkOutcome::Shrunk(candidates)
    }

    /// Refresh stale gradients of inactive examples and re-test their KKT conditions
    ///
    /// With `force_all` every example ends up active and the history is
    /// discarded.
    pub fn reactivate<K: KernelOracle + ?Sized>(
        &mut self,
        ctx: ReactivationContext<'_, K>,
        force_all: bool,
    ) -> Reactivation {
        let ReactivationContext {
            kernel,
            cache,
            problem,
            alpha,
            lin,
            bias,
            epsilon_a,
            epsilon_shrink,
            mode,
            parallelism,
        } = ctx;

        match mode {
            GradientMode::Linadd { batch } => {
                self.refresh_from_normal(kernel, problem, alpha, lin, batch, parallelism)
            }
            GradientMode::Rows => self.replay_history(kernel, cache, problem, alpha, lin),
        }

        let since = self.deactnum.saturating_sub(1);
        let mut max_violation = 0.0f64;
        let mut reactivated = 0;
        for i in 0..self.active.len() {
            self.inactive_since[i] = since;
            let a = alpha[i];
            let c = problem.cost(i);
            let dist = problem.distance(i, lin[i], bias);
            max_violation = max_violation.max(problem.violation(i, a, dist, epsilon_a));

            let wake = force_all
                || (a > epsilon_a && a < c - epsilon_a)
                || (a <= epsilon_a && dist < MARGIN_TARGET + epsilon_shrink)
                || (a >= c - epsilon_a && dist > MARGIN_TARGET - epsilon_shrink);
            if wake && !self.active[i] {
                self.active[i] = true;
                reactivated += 1;
            }
        }

        if force_all {
            self.history.clear();
            self.deactnum = 0;
        } else if self.deactnum > 0 && matches!(mode, GradientMode::Rows) {
            // Only the newest snapshot is still referenced
            let newest = self.deactnum - 1;
            for slot in self.history.iter_mut().take(newest) {
                *slot = None;
            }
            self.history[newest] = Some(alpha.to_vec());
        }

        debug!(
            "Reactivation: {} examples back in the active set, max violation {:.6}",
            reactivated, max_violation
        );
        Reactivation {
            max_violation,
            reactivated,
        }
    }

    fn refresh_from_normal<K: KernelOracle + ?Sized>(
        &mut self,
        kernel: &mut K,
        problem: &Problem,
        alpha: &[f64],
        lin: &mut [f64],
        batch: bool,
        parallelism: Parallelism,
    ) {
        let n = alpha.len();
        let changed: Vec<usize> = (0..n).filter(|&i| alpha[i] != self.last_a[i]).collect();
        if changed.is_empty() {
            return;
        }
        let weights: Vec<f64> = changed
            .iter()
            .map(|&i| (alpha[i] - self.last_a[i]) * problem.label(i))
            .collect();
        let inactive: Vec<usize> = (0..n).filter(|&i| !self.active[i]).collect();
        let mut dest = vec![0.0; inactive.len()];

        let use_batch = batch && kernel.has_batch_evaluation();
        match kernel.linadd_mut() {
            Some(linadd) if !use_batch => {
                linadd.clear_normal();
                for (&i, &w) in changed.iter().zip(&weights) {
                    linadd.add_to_normal(i, w);
                }
                let linadd = &*linadd;
                parallelism.for_each_partition(&mut dest, |offset, part| {
                    for (k, d) in part.iter_mut().enumerate() {
                        *d = linadd.optimized_dot(inactive[offset + k]);
                    }
                });
            }
            _ => {
                let kernel = &*kernel;
                parallelism.for_each_partition(&mut dest, |offset, part| {
                    let targets = &inactive[offset..offset + part.len()];
                    kernel.batch_evaluate(targets, &changed, &weights, part);
                });
            }
        }

        for (&j, &d) in inactive.iter().zip(&dest) {
            lin[j] = self.last_lin[j] + d;
        }
        for &i in &changed {
            self.last_a[i] = alpha[i];
        }
        self.last_lin.copy_from_slice(lin);
    }

    fn replay_history<K: KernelOracle + ?Sized>(
        &mut self,
        kernel: &K,
        mut cache: Option<&mut KernelCache>,
        problem: &Problem,
        alpha: &[f64],
        lin: &mut [f64],
    ) {
        let n = alpha.len();
        let mut row = Vec::new();
        for t in (0..self.deactnum).rev() {
            let Some(Some(a_old)) = self.history.get(t) else {
                break;
            };
            let group: Vec<usize> = (0..n)
                .filter(|&j| !self.active[j] && self.inactive_since[j] == t)
                .collect();
            if group.is_empty() {
                continue;
            }
            row.resize(group.len(), 0.0);
            for i in (0..n).filter(|&i| alpha[i] != a_old[i]) {
                fetch_row(cache.as_deref_mut(), kernel, i, &group, &mut row);
                let delta = (alpha[i] - a_old[i]) * problem.label(i);
                for (&j, &k) in group.iter().zip(&row) {
                    lin[j] += delta * k;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{SparseVector, TrainingConfig};
    use crate::kernel::{CustomKernel, LinearKernel};

    fn setup() -> (CustomKernel, Problem) {
        let kernel = CustomKernel::from_fn(6, |i, j| {
            let (a, b) = (i as f64, j as f64);
            1.0 + 0.1 * a * b + if i == j { 1.0 } else { 0.0 }
        })
        .unwrap();
        let problem = Problem::new(
            &vec![1.0, -1.0, 1.0, -1.0, 1.0, -1.0],
            &TrainingConfig::default(),
        )
        .unwrap();
        (kernel, problem)
    }

    fn full_gradient<K: KernelOracle>(kernel: &K, problem: &Problem, alpha: &[f64]) -> Vec<f64> {
        (0..alpha.len())
            .map(|j| {
                (0..alpha.len())
                    .map(|i| alpha[i] * problem.label(i) * kernel.evaluate(i, j))
                    .sum()
            })
            .collect()
    }

    #[test]
    fn test_shrink_respects_minimum_and_age() {
        let alpha = vec![0.0; 6];
        let lin = vec![0.0; 6];
        let mut state = ShrinkState::new(&alpha, &lin, 10);
        let last = [0, 0, 0, 95, 95, 95];

        assert_eq!(state.shrink(&alpha, &last, 100, 50, 4, true), ShrinkOutcome::TooFew);
        assert_eq!(state.num_active(), 6);

        assert_eq!(state.shrink(&alpha, &last, 100, 50, 3, true), ShrinkOutcome::Shrunk(3));
        assert_eq!(state.active_indices(), vec![3, 4, 5]);
        assert_eq!(state.history_len(), 1);

        let stale = [0; 6];
        assert_eq!(state.shrink(&alpha, &stale, 100, 50, 1, true), ShrinkOutcome::WouldStrand);
    }

    #[test]
    fn test_history_bounded() {
        let alpha = vec![0.0; 6];
        let lin = vec![0.0; 6];
        let mut state = ShrinkState::new(&alpha, &lin, 1);
        let first = [0, 9, 9, 9, 9, 9];
        let second = [0, 0, 9, 9, 9, 9];
        assert_eq!(state.shrink(&alpha, &first, 10, 5, 1, true), ShrinkOutcome::Shrunk(1));
        assert_eq!(state.shrink(&alpha, &second, 10, 5, 1, true), ShrinkOutcome::HistoryFull);
        // The linadd path keeps no history and is never full
        assert_eq!(state.shrink(&alpha, &second, 10, 5, 1, false), ShrinkOutcome::Shrunk(1));
    }

    #[test]
    fn test_min_shrink_count() {
        let state = ShrinkState::new(&vec![0.0; 1000], &vec![0.0; 1000], 10);
        assert_eq!(state.min_shrink_count(), 100);
        let big = ShrinkState::new(&vec![0.0; 100_000], &vec![0.0; 100_000], 10);
        assert_eq!(big.min_shrink_count(), 10_000);
    }

    #[test]
    fn test_replay_restores_gradient() {
        let (mut kernel, problem) = setup();
        let mut alpha = vec![0.2, 0.2, 0.0, 0.0, 0.5, 0.5];
        let mut lin = full_gradient(&kernel, &problem, &alpha);
        let mut state = ShrinkState::new(&alpha, &lin, 10);

        let last = [9, 9, 0, 0, 9, 9];
        assert_eq!(state.shrink(&alpha, &last, 10, 5, 1, true), ShrinkOutcome::Shrunk(2));

        // Move the active variables and update only active gradients
        let old = alpha.clone();
        alpha[0] = 0.7;
        alpha[5] = 1.0;
        for j in state.active_indices() {
            for i in [0, 5] {
                lin[j] += (alpha[i] - old[i]) * problem.label(i) * kernel.evaluate(i, j);
            }
        }

        let result = state.reactivate(
            ReactivationContext {
                kernel: &mut kernel,
                cache: None,
                problem: &problem,
                alpha: &alpha,
                lin: &mut lin,
                bias: 0.0,
                epsilon_a: 1e-15,
                epsilon_shrink: 2.0,
                mode: GradientMode::Rows,
                parallelism: Parallelism::Sequential,
            },
            false,
        );
        let expected = full_gradient(&kernel, &problem, &alpha);
        for j in 0..6 {
            assert!((lin[j] - expected[j]).abs() < 1e-12);
        }
        assert!(result.reactivated <= 2);
        assert_eq!(state.history_len(), 1);
    }

    #[test]
    fn test_linadd_refresh_restores_gradient() {
        let (_, problem) = setup();
        let features: Vec<SparseVector> = (0..6)
            .map(|i| SparseVector::from_dense(&[1.0 + i as f64, 0.5 * i as f64 - 1.0]))
            .collect();

        for batch in [true, false] {
            let mut kernel = LinearKernel::new(features.clone()).unwrap();
            let mut alpha = vec![0.2, 0.2, 0.0, 0.0, 0.5, 0.5];
            let mut lin = full_gradient(&kernel, &problem, &alpha);
            let mut state = ShrinkState::new(&alpha, &lin, 10);

            let last = [9, 9, 0, 0, 9, 9];
            assert_eq!(state.shrink(&alpha, &last, 10, 5, 1, false), ShrinkOutcome::Shrunk(2));
            assert_eq!(state.history_len(), 0);

            let old = alpha.clone();
            alpha[0] = 0.7;
            alpha[5] = 1.0;
            for j in state.active_indices() {
                for i in [0, 5] {
                    lin[j] += (alpha[i] - old[i]) * problem.label(i) * kernel.evaluate(i, j);
                }
            }

            state.reactivate(
                ReactivationContext {
                    kernel: &mut kernel,
                    cache: None,
                    problem: &problem,
                    alpha: &alpha,
                    lin: &mut lin,
                    bias: 0.0,
                    epsilon_a: 1e-15,
                    epsilon_shrink: 2.0,
                    mode: GradientMode::Linadd { batch },
                    parallelism: Parallelism::Parallel(2),
                },
                false,
            );
            let expected = full_gradient(&kernel, &problem, &alpha);
            for j in 0..6 {
                assert!((lin[j] - expected[j]).abs() < 1e-12, "batch = {batch}, j = {j}");
            }
            // Batch evaluation builds its own normal; the other path reuses the kernel's
            assert_eq!(kernel.normal().iter().all(|&v| v == 0.0), batch);

            // A second pass with nothing changed is a no-op
            let settled = lin.clone();
            state.reactivate(
                ReactivationContext {
                    kernel: &mut kernel,
                    cache: None,
                    problem: &problem,
                    alpha: &alpha,
                    lin: &mut lin,
                    bias: 0.0,
                    epsilon_a: 1e-15,
                    epsilon_shrink: 2.0,
                    mode: GradientMode::Linadd { batch },
                    parallelism: Parallelism::Sequential,
                },
                true,
            );
            assert_eq!(lin, settled);
            assert_eq!(state.num_inactive(), 0);
        }
    }

    #[test]
    fn test_round_trip_without_alpha_change() {
        let (mut kernel, problem) = setup();
        let alpha = vec![0.0, 0.0, 1.0, 1.0, 0.3, 0.3];
        let mut lin = full_gradient(&kernel, &problem, &alpha);
        let reference = lin.clone();
        let mut state = ShrinkState::new(&alpha, &lin, 10);

        let bias = 0.0;
        let violations: Vec<f64> = (0..6)
            .map(|i| problem.violation(i, alpha[i], problem.distance(i, lin[i], bias), 1e-15))
            .collect();

        state.shrink(&alpha, &[0, 0, 0, 0, 9, 9], 10, 5, 1, true);
        let mut cache = KernelCache::with_row_capacity(6, 2);
        state.reactivate(
            ReactivationContext {
                kernel: &mut kernel,
                cache: Some(&mut cache),
                problem: &problem,
                alpha: &alpha,
                lin: &mut lin,
                bias,
                epsilon_a: 1e-15,
                epsilon_shrink: 0.0,
                mode: GradientMode::Rows,
                parallelism: Parallelism::Sequential,
            },
            false,
        );
        assert_eq!(lin, reference);
        for i in 0..6 {
            let v = problem.violation(i, alpha[i], problem.distance(i, lin[i], bias), 1e-15);
            assert_eq!(v, violations[i]);
        }
    }

    #[test]
    fn test_forced_reactivation_clears_history() {
        let (mut kernel, problem) = setup();
        let alpha = vec![0.0; 6];
        let mut lin = vec![0.0; 6];
        let mut state = ShrinkState::new(&alpha, &lin, 10);
        state.shrink(&alpha, &[0, 0, 0, 9, 9, 9], 10, 5, 1, true);
        assert_eq!(state.num_inactive(), 3);

        let result = state.reactivate(
            ReactivationContext {
                kernel: &mut kernel,
                cache: None,
                problem: &problem,
                alpha: &alpha,
                lin: &mut lin,
                bias: 0.0,
                epsilon_a: 1e-15,
                epsilon_shrink: 0.0,
                mode: GradientMode::Rows,
                parallelism: Parallelism::Sequential,
            },
            true,
        );
        assert_eq!(result.reactivated, 3);
        assert_eq!(state.num_inactive(), 0);
        assert_eq!(state.history_len(), 0);
        // All at zero with lin = 0: every margin is violated by 1
        assert_eq!(result.max_violation, 1.0);
    }
}
