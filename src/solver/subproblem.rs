//! Working-set sub-problem construction and the bridge to the QP primitive

use log::{debug, warn};

use crate::cache::{fetch_row, KernelCache};
use crate::kernel::KernelOracle;
use crate::solver::problem::{Problem, LINEAR_TERM, MARGIN_TARGET};
use crate::solver::qp::{derive_offset, EqualityConstraint, QpProblem, QpSolver};

/// Starting precision requested from the QP primitive
pub const DEFAULT_QP_PRECISION: f64 = 1e-14;

/// Objective regressions tolerated before the KKT target is relaxed
pub const MAX_PRECISION_VIOLATIONS: usize = 5000;

/// Inputs for building the sub-problem of one working set
pub struct SubproblemContext<'a, K: KernelOracle + ?Sized> {
    pub kernel: &'a K,
    pub cache: Option<&'a mut KernelCache>,
    pub problem: &'a Problem,
    pub alpha: &'a [f64],
    pub lin: &'a [f64],
    pub working: &'a [usize],
    pub bias_enabled: bool,
}

/// Builds the dense QP restricted to the working set
#[derive(Debug, Default)]
pub struct SubproblemBuilder {
    row: Vec<f64>,
}

impl SubproblemBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// H[a][b] = y_a y_b k(a, b), g0[a] = eps_a + y_a (lin_a - sum_{b in W} k(a, b) a_b y_b)
    pub fn build<K: KernelOracle + ?Sized>(&mut self, ctx: SubproblemContext<'_, K>) -> QpProblem {
        let SubproblemContext {
            kernel,
            mut cache,
            problem,
            alpha,
            lin,
            working,
            bias_enabled,
        } = ctx;
        let q = working.len();
        let mut hessian = vec![0.0; q * q];
        let mut linear = vec![0.0; q];
        self.row.resize(q, 0.0);

        for (a, &i) in working.iter().enumerate() {
            fetch_row(cache.as_deref_mut(), kernel, i, working, &mut self.row);
            let yi = problem.label(i);
            let mut g = lin[i];
            for (b, &j) in working.iter().enumerate() {
                let k = self.row[b];
                let yj = problem.label(j);
                g -= k * alpha[j] * yj;
                hessian[a * q + b] = yi * yj * k;
            }
            linear[a] = LINEAR_TERM + g * yi;
        }

        let equality = bias_enabled.then(|| {
            let total: f64 = alpha.iter().zip(problem.labels()).map(|(a, y)| a * y).sum();
            let inside: f64 = working.iter().map(|&i| alpha[i] * problem.label(i)).sum();
            EqualityConstraint {
                coefficients: working.iter().map(|&i| problem.label(i)).collect(),
                rhs: -(total - inside),
            }
        });

        QpProblem {
            hessian,
            linear,
            equality,
            lower: vec![0.0; q],
            upper: working.iter().map(|&i| problem.cost(i)).collect(),
            x_init: working.iter().map(|&i| alpha[i]).collect(),
        }
    }
}

/// What the engine gets back from one sub-problem solve
#[derive(Debug, Clone, PartialEq)]
pub struct QpStep {
    /// New values for the working-set variables
    pub alpha: Vec<f64>,
    /// Offset b of the decision surface
    pub offset: f64,
    /// The primitive returned non-finite values; `alpha` is the start point
    pub diverged: bool,
    /// Too many non-improving steps: the KKT target should be relaxed
    pub relax_target: bool,
}

/// Calls the QP primitive and repairs its answer
pub struct QpBridge {
    solver: Box<dyn QpSolver>,
    precision: f64,
    precision_violations: usize,
}

impl QpBridge {
    pub fn new(solver: Box<dyn QpSolver>) -> Self {
        Self {
            solver,
            precision: DEFAULT_QP_PRECISION,
            precision_violations: 0,
        }
    }

    pub fn precision(&self) -> f64 {
        self.precision
    }

    pub fn precision_violations(&self) -> usize {
        self.precision_violations
    }

    /// Solve the sub-problem; `epsilon_crit` is the current KKT tolerance
    pub fn solve(&mut self, qp: &QpProblem, epsilon_crit: f64) -> QpStep {
        let solution = self.solver.solve(qp, self.precision);
        if !solution.converged {
            debug!(
                "QP primitive stopped early after {} iterations on {} variables",
                solution.iterations,
                qp.len()
            );
        }

        let finite = solution.primal.len() == qp.len()
            && solution.primal.iter().all(|v| v.is_finite())
            && solution.offset.map_or(true, f64::is_finite);
        if !finite {
            warn!("QP primitive returned non-finite values; keeping the previous point");
            return QpStep {
                alpha: qp.x_init.clone(),
                offset: 0.0,
                diverged: true,
                relax_target: false,
            };
        }

        let mut x = solution.primal;
        let gradient = qp.gradient(&x);
        let offset = match (solution.offset, &qp.equality) {
            (_, None) => 0.0,
            (Some(b), Some(_)) => b,
            (None, Some(_)) => derive_offset(qp, &x, &gradient),
        };

        // Variables the primitive left short of a bound they should sit on
        let mut epsilon_loqo = 1e-10;
        for i in 0..x.len() {
            let sign = qp.equality.as_ref().map_or(0.0, |eq| eq.coefficients[i]);
            let dist = gradient[i] - offset * sign + MARGIN_TARGET;
            if x[i] < qp.upper[i] - epsilon_loqo && dist < MARGIN_TARGET - epsilon_crit {
                epsilon_loqo = (qp.upper[i] - x[i]) * 2.0;
            } else if x[i] > qp.lower[i] + epsilon_loqo && dist > MARGIN_TARGET + epsilon_crit {
                epsilon_loqo = (x[i] - qp.lower[i]) * 2.0;
            }
        }
        for i in 0..x.len() {
            if x[i] <= qp.lower[i] + epsilon_loqo {
                x[i] = qp.lower[i];
            } else if x[i] >= qp.upper[i] - epsilon_loqo {
                x[i] = qp.upper[i];
            }
        }

        let mut relax_target = false;
        if qp.objective(&x) >= qp.objective(&qp.x_init) {
            self.precision /= 100.0;
            self.precision_violations += 1;
            if self.precision_violations > MAX_PRECISION_VIOLATIONS {
                self.precision_violations = 0;
                relax_target = true;
            }
        }

        QpStep {
            alpha: x,
            offset,
            diverged: false,
            relax_target,
        }
    }
}

/// Support-vector bookkeeping and the offset b, maintained from the working set
#[derive(Debug, Clone, PartialEq)]
pub struct ModelState {
    b: f64,
    support_vectors: usize,
    at_upper_bound: usize,
}

impl ModelState {
    /// Count support vectors of a starting point
    pub fn new(problem: &Problem, alpha: &[f64], epsilon_a: f64) -> Self {
        let support_vectors = alpha.iter().filter(|&&a| a > 0.0).count();
        let at_upper_bound = (0..alpha.len())
            .filter(|&i| alpha[i] >= problem.cost(i) - epsilon_a)
            .count();
        Self {
            b: 0.0,
            support_vectors,
            at_upper_bound,
        }
    }

    /// Offset with `dist_i = (lin_i - b) y_i`
    pub fn bias(&self) -> f64 {
        self.b
    }

    pub fn set_bias(&mut self, b: f64) {
        self.b = b;
    }

    pub fn support_vectors(&self) -> usize {
        self.support_vectors
    }

    pub fn at_upper_bound(&self) -> usize {
        self.at_upper_bound
    }

    /// Apply the changes of one sub-step
    ///
    /// `b` comes from the first free working-set variable; if there is none and
    /// every support vector sits at its upper bound, from the midpoint of the
    /// range allowed by the active examples; otherwise `qp_offset` stands.
    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &mut self,
        problem: &Problem,
        alpha: &[f64],
        alpha_old: &[f64],
        lin: &[f64],
        working: &[usize],
        active: &[usize],
        epsilon_a: f64,
        bias_enabled: bool,
        qp_offset: f64,
    ) {
        self.b = if bias_enabled { qp_offset } else { 0.0 };
        let mut b_set = !bias_enabled;

        for &i in working {
            let (old, new) = (alpha_old[i], alpha[i]);
            if old > 0.0 && new == 0.0 {
                self.support_vectors -= 1;
            } else if old == 0.0 && new > 0.0 {
                self.support_vectors += 1;
            }

            let ex_c = problem.cost(i) - epsilon_a;
            if old >= ex_c && new < ex_c {
                self.at_upper_bound -= 1;
            } else if old < ex_c && new >= ex_c {
                self.at_upper_bound += 1;
            }

            if !b_set && new > epsilon_a && new < ex_c {
                self.b = lin[i] - problem.label(i);
                b_set = true;
            }
        }

        if !b_set && self.support_vectors == self.at_upper_bound {
            if let Some(b) = bias_range_midpoint(problem, alpha, lin, active, epsilon_a) {
                self.b = b;
            }
        }
    }

    /// Recompute `b` from scratch over `indices`: mean over free variables, or
    /// the midpoint of the feasible range when none is free
    pub fn recompute_bias(
        &mut self,
        problem: &Problem,
        alpha: &[f64],
        lin: &[f64],
        indices: &[usize],
        epsilon_a: f64,
        bias_enabled: bool,
    ) {
        if !bias_enabled {
            self.b = 0.0;
            return;
        }
        let free: Vec<f64> = indices
            .iter()
            .filter(|&&i| alpha[i] > epsilon_a && alpha[i] < problem.cost(i) - epsilon_a)
            .map(|&i| lin[i] - problem.label(i))
            .collect();
        if !free.is_empty() {
            self.b = free.iter().sum::<f64>() / free.len() as f64;
        } else if let Some(b) = bias_range_midpoint(problem, alpha, lin, indices, epsilon_a) {
            self.b = b;
        }
    }

    /// Recount support vectors after a wholesale alpha change
    pub fn recount(&mut self, problem: &Problem, alpha: &[f64], epsilon_a: f64) {
        let b = self.b;
        *self = Self::new(problem, alpha, epsilon_a);
        self.b = b;
    }
}

/// Midpoint of the interval of `b` values consistent with bounded variables
fn bias_range_midpoint(
    problem: &Problem,
    alpha: &[f64],
    lin: &[f64],
    indices: &[usize],
    epsilon_a: f64,
) -> Option<f64> {
    let mut low: Option<f64> = None;
    let mut high: Option<f64> = None;
    for &i in indices {
        let y = problem.label(i);
        let value = y - lin[i];
        let below_upper = alpha[i] < problem.cost(i) - epsilon_a;
        if below_upper == (y > 0.0) {
            low = Some(low.map_or(value, |l: f64| l.max(value)));
        } else {
            high = Some(high.map_or(value, |h: f64| h.min(value)));
        }
    }
    let neg_b = match (low, high) {
        (Some(l), Some(h)) => (l + h) / 2.0,
        (Some(l), None) => l,
        (None, Some(h)) => h,
        (None, None) => return None,
    };
    Some(-neg_b)
}
