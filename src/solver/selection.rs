//! Working set selection
//!
//! Two policies fill the free slots of the working set, half from each side
//! of the margin:
//! - steepest feasible direction: rank by `y_i (eps_i + y_i lin_i)`
//! - pseudo-random rotation: rank by `(i + iteration) mod n`, used every
//!   `random_selection_period` iterations to break cycles
//!
//! Variables stay in the working set for a bounded number of consecutive
//! rounds and are then rotated out.

use crate::cache::KernelCache;
use crate::solver::problem::Problem;

/// Read-only view used for ranking candidates
pub struct SelectionContext<'a> {
    pub problem: &'a Problem,
    pub alpha: &'a [f64],
    pub lin: &'a [f64],
    pub active: &'a [usize],
    pub epsilon_a: f64,
}

/// Working set plus the per-variable round counter
#[derive(Debug, Clone)]
pub struct WorkingSetSelector {
    /// Consecutive rounds in the working set, 0 when outside
    chosen: Vec<usize>,
    working: Vec<usize>,
    empty_rounds: usize,
}

impl WorkingSetSelector {
    pub fn new(num_examples: usize) -> Self {
        Self {
            chosen: vec![0; num_examples],
            working: Vec::new(),
            empty_rounds: 0,
        }
    }

    /// Current working set
    pub fn working_set(&self) -> &[usize] {
        &self.working
    }

    pub fn len(&self) -> usize {
        self.working.len()
    }

    pub fn is_empty(&self) -> bool {
        self.working.is_empty()
    }

    pub fn is_chosen(&self, i: usize) -> bool {
        self.chosen[i] > 0
    }

    /// Forget the working set
    pub fn clear(&mut self) {
        self.chosen.fill(0);
        self.working.clear();
        self.empty_rounds = 0;
    }

    /// Drop members that have served `qpsize / min(qpsize, new_vars)` rounds
    ///
    /// Returns the number of members kept.
    pub fn rotate(&mut self, qpsize: usize, new_vars: usize) -> usize {
        let limit = qpsize / new_vars.min(qpsize).max(1);
        let chosen = &mut self.chosen;
        self.working.retain(|&j| {
            if chosen[j] >= limit {
                chosen[j] = 0;
                false
            } else {
                chosen[j] += 1;
                true
            }
        });
        self.working.len()
    }

    /// Add up to `count` variables by steepest feasible direction
    ///
    /// With `cached_only`, candidates are restricted to rows resident in the cache.
    pub fn select_steepest(
        &mut self,
        ctx: &SelectionContext<'_>,
        count: usize,
        cached_only: Option<&KernelCache>,
    ) -> usize {
        let criterion = |j: usize| ctx.problem.selection_criterion(j, ctx.lin[j]);
        let half = count / 2;
        let first = self.fill_side(ctx, -1.0, half, cached_only, criterion);
        let second = self.fill_side(ctx, 1.0, (count - first).min(half), cached_only, |j| {
            -criterion(j)
        });
        first + second
    }

    /// Add up to `count` variables by the rotating pseudo-random key
    pub fn select_random(
        &mut self,
        ctx: &SelectionContext<'_>,
        count: usize,
        iteration: usize,
    ) -> usize {
        let n = ctx.alpha.len().max(1);
        let key = |j: usize| ((j + iteration) % n) as f64;
        let half = count / 2;
        let first = self.fill_side(ctx, -1.0, half, None, key);
        let second = self.fill_side(ctx, 1.0, (count - first).min(half), None, key);
        first + second
    }

    /// Record the outcome of a round; true once the working set has been
    /// empty for two consecutive rounds
    pub fn note_round(&mut self) -> bool {
        if self.working.is_empty() {
            self.empty_rounds += 1;
        } else {
            self.empty_rounds = 0;
        }
        self.empty_rounds >= 2
    }

    fn fill_side<F: Fn(usize) -> f64>(
        &mut self,
        ctx: &SelectionContext<'_>,
        side: f64,
        limit: usize,
        cached_only: Option<&KernelCache>,
        score: F,
    ) -> usize {
        if limit == 0 {
            return 0;
        }
        let mut keys = Vec::new();
        let mut scores = Vec::new();
        for &j in ctx.active {
            if self.chosen[j] > 0 {
                continue;
            }
            let s = side * ctx.problem.label(j);
            let a = ctx.alpha[j];
            let at_upper = a >= ctx.problem.cost(j) - ctx.epsilon_a;
            if (a <= ctx.epsilon_a && s < 0.0) || (at_upper && s > 0.0) {
                continue;
            }
            if cached_only.is_some_and(|c| !c.contains(j)) {
                continue;
            }
            keys.push(j);
            scores.push(score(j));
        }

        let picked = select_top_n(&scores, limit);
        for &p in &picked {
            let j = keys[p];
            self.chosen[j] = 1;
            self.working.push(j);
        }
        picked.len()
    }
}

/// Positions of the `n` largest values, largest first; ties keep input order
pub fn select_top_n(values: &[f64], n: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[b].total_cmp(&values[a]));
    order.truncate(n);
    order
}
