//! Dense QP primitive for working-set sub-problems
//!
//! The engine hands each sub-problem to a [`QpSolver`]:
//!
//! ```text
//! minimize    1/2 x^T H x + g^T x
//! subject to  lower <= x <= upper
//!             sum_i a_i x_i = rhs      (optional, a_i = ±1)
//! ```
//!
//! [`PairwiseQpSolver`] is the built-in implementation: maximal violating
//! pair updates when the equality row is present, greedy coordinate descent
//! otherwise.

/// Curvature floor for non positive definite directions
const TAU: f64 = 1e-12;

/// Tolerance for deciding that a variable sits on a bound
const BOUND_EPS: f64 = 1e-12;

/// Equality row `sum_i coefficients[i] * x_i = rhs`
#[derive(Debug, Clone, PartialEq)]
pub struct EqualityConstraint {
    pub coefficients: Vec<f64>,
    pub rhs: f64,
}

/// Dense box-constrained QP
#[derive(Debug, Clone, PartialEq)]
pub struct QpProblem {
    /// Row-major n x n symmetric matrix
    pub hessian: Vec<f64>,
    pub linear: Vec<f64>,
    pub equality: Option<EqualityConstraint>,
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
    /// Feasible starting point
    pub x_init: Vec<f64>,
}

impl QpProblem {
    pub fn len(&self) -> usize {
        self.linear.len()
    }

    pub fn is_empty(&self) -> bool {
        self.linear.is_empty()
    }

    #[inline]
    pub fn h(&self, i: usize, j: usize) -> f64 {
        self.hessian[i * self.len() + j]
    }

    /// Gradient H x + g
    pub fn gradient(&self, x: &[f64]) -> Vec<f64> {
        let n = self.len();
        (0..n)
            .map(|i| {
                self.linear[i]
                    + self.hessian[i * n..(i + 1) * n]
                        .iter()
                        .zip(x)
                        .map(|(h, x)| h * x)
                        .sum::<f64>()
            })
            .collect()
    }

    /// Objective 1/2 x^T H x + g^T x
    pub fn objective(&self, x: &[f64]) -> f64 {
        let n = self.len();
        (0..n)
            .map(|i| {
                let hx: f64 = self.hessian[i * n..(i + 1) * n]
                    .iter()
                    .zip(x)
                    .map(|(h, x)| h * x)
                    .sum();
                x[i] * (0.5 * hx + self.linear[i])
            })
            .sum()
    }
}

/// Result of a QP solve
#[derive(Debug, Clone, PartialEq)]
pub struct QpSolution {
    pub primal: Vec<f64>,
    /// Multiplier of the equality row, when the solver can provide it
    pub offset: Option<f64>,
    /// Whether the requested precision was reached
    pub converged: bool,
    pub iterations: usize,
}

/// Dense QP primitive
pub trait QpSolver: Send {
    /// Solve to the given precision; may return an approximate answer
    fn solve(&mut self, problem: &QpProblem, precision: f64) -> QpSolution;
}

/// Maximal violating pair solver for small dense problems
#[derive(Debug, Clone)]
pub struct PairwiseQpSolver {
    /// Iteration budget per variable
    pub iterations_per_variable: usize,
    /// Smallest optimality gap the solver will aim for
    pub tolerance_floor: f64,
}

impl Default for PairwiseQpSolver {
    fn default() -> Self {
        Self {
            iterations_per_variable: 1000,
            tolerance_floor: 1e-10,
        }
    }
}

impl PairwiseQpSolver {
    pub fn new() -> Self {
        Self::default()
    }

    fn solve_with_equality(
        &self,
        problem: &QpProblem,
        signs: &[f64],
        x: &mut [f64],
        g: &mut [f64],
        tol: f64,
        max_iter: usize,
    ) -> (bool, usize) {
        let n = problem.len();
        let (l, u) = (&problem.lower, &problem.upper);

        for iter in 0..max_iter {
            let mut up: Option<usize> = None;
            let mut low: Option<usize> = None;
            let mut gmax = f64::NEG_INFINITY;
            let mut gmin = f64::INFINITY;
            for t in 0..n {
                let v = -signs[t] * g[t];
                let (can_up, can_down) = if signs[t] > 0.0 {
                    (x[t] < u[t], x[t] > l[t])
                } else {
                    (x[t] > l[t], x[t] < u[t])
                };
                if can_up && v > gmax {
                    gmax = v;
                    up = Some(t);
                }
                if can_down && v < gmin {
                    gmin = v;
                    low = Some(t);
                }
            }
            let (Some(i), Some(j)) = (up, low) else {
                return (true, iter);
            };
            if gmax - gmin <= tol {
                return (true, iter);
            }

            // Move x_i by +s_i t and x_j by -s_j t, keeping the equality row
            let (si, sj) = (signs[i], signs[j]);
            let curvature = problem.h(i, i) + problem.h(j, j) - 2.0 * si * sj * problem.h(i, j);
            let slope = si * g[i] - sj * g[j];
            let room_i = if si > 0.0 { u[i] - x[i] } else { x[i] - l[i] };
            let room_j = if sj > 0.0 { x[j] - l[j] } else { u[j] - x[j] };
            let step = (-slope / curvature.max(TAU)).min(room_i).min(room_j);
            if !(step > 0.0) {
                return (false, iter);
            }

            let old_i = x[i];
            let old_j = x[j];
            x[i] = if step >= room_i {
                if si > 0.0 { u[i] } else { l[i] }
            } else {
                old_i + si * step
            };
            x[j] = if step >= room_j {
                if sj > 0.0 { l[j] } else { u[j] }
            } else {
                old_j - sj * step
            };

            let dxi = x[i] - old_i;
            let dxj = x[j] - old_j;
            for (k, gk) in g.iter_mut().enumerate() {
                *gk += problem.h(k, i) * dxi + problem.h(k, j) * dxj;
            }
        }
        (false, max_iter)
    }

    fn solve_box_only(
        &self,
        problem: &QpProblem,
        x: &mut [f64],
        g: &mut [f64],
        tol: f64,
        max_iter: usize,
    ) -> (bool, usize) {
        let (l, u) = (&problem.lower, &problem.upper);

        for iter in 0..max_iter {
            let mut best: Option<usize> = None;
            let mut worst = tol;
            for (t, &gt) in g.iter().enumerate() {
                let violation = if gt < 0.0 && x[t] < u[t] {
                    -gt
                } else if gt > 0.0 && x[t] > l[t] {
                    gt
                } else {
                    0.0
                };
                if violation > worst {
                    worst = violation;
                    best = Some(t);
                }
            }
            let Some(k) = best else {
                return (true, iter);
            };

            let old = x[k];
            x[k] = (old - g[k] / problem.h(k, k).max(TAU)).clamp(l[k], u[k]);
            let dx = x[k] - old;
            if dx == 0.0 {
                return (false, iter);
            }
            for (t, gt) in g.iter_mut().enumerate() {
                *gt += problem.h(t, k) * dx;
            }
        }
        (false, max_iter)
    }
}

impl QpSolver for PairwiseQpSolver {
    fn solve(&mut self, problem: &QpProblem, precision: f64) -> QpSolution {
        let n = problem.len();
        let mut x: Vec<f64> = problem
            .x_init
            .iter()
            .zip(problem.lower.iter().zip(&problem.upper))
            .map(|(&v, (&l, &u))| v.clamp(l, u))
            .collect();
        if n == 0 {
            return QpSolution {
                primal: x,
                offset: None,
                converged: true,
                iterations: 0,
            };
        }

        let mut g = problem.gradient(&x);
        let tol = precision.max(self.tolerance_floor);
        let max_iter = self.iterations_per_variable.saturating_mul(n).max(100);

        let (converged, iterations, offset) = match &problem.equality {
            Some(eq) => {
                let signs: Vec<f64> = eq
                    .coefficients
                    .iter()
                    .map(|&a| if a >= 0.0 { 1.0 } else { -1.0 })
                    .collect();
                let (converged, iterations) =
                    self.solve_with_equality(problem, &signs, &mut x, &mut g, tol, max_iter);
                let offset = derive_offset(problem, &x, &g);
                (converged, iterations, Some(offset))
            }
            None => {
                let (converged, iterations) =
                    self.solve_box_only(problem, &mut x, &mut g, tol, max_iter);
                (converged, iterations, None)
            }
        };

        QpSolution {
            primal: x,
            offset,
            converged,
            iterations,
        }
    }
}

/// Multiplier of the equality row at `x`
///
/// Averages `a_i * G_i` over free variables; without free variables, takes
/// the midpoint of the interval allowed by the bounded ones. Returns 0 when
/// the problem has no equality row.
pub fn derive_offset(problem: &QpProblem, x: &[f64], gradient: &[f64]) -> f64 {
    let Some(eq) = &problem.equality else {
        return 0.0;
    };
    let mut upper = f64::INFINITY;
    let mut lower = f64::NEG_INFINITY;
    let mut free_sum = 0.0;
    let mut free_count = 0usize;

    for i in 0..problem.len() {
        let s = if eq.coefficients[i] >= 0.0 { 1.0 } else { -1.0 };
        let yg = s * gradient[i];
        let at_upper = x[i] >= problem.upper[i] - BOUND_EPS;
        let at_lower = x[i] <= problem.lower[i] + BOUND_EPS;
        if at_upper {
            if s < 0.0 {
                upper = upper.min(yg);
            } else {
                lower = lower.max(yg);
            }
        } else if at_lower {
            if s > 0.0 {
                upper = upper.min(yg);
            } else {
                lower = lower.max(yg);
            }
        } else {
            free_sum += yg;
            free_count += 1;
        }
    }

    if free_count > 0 {
        free_sum / free_count as f64
    } else if upper.is_finite() && lower.is_finite() {
        (upper + lower) / 2.0
    } else if upper.is_finite() {
        upper
    } else if lower.is_finite() {
        lower
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn problem(
        hessian: Vec<f64>,
        linear: Vec<f64>,
        equality: Option<(Vec<f64>, f64)>,
        upper: f64,
        x_init: Vec<f64>,
    ) -> QpProblem {
        let n = linear.len();
        QpProblem {
            hessian,
            linear,
            equality: equality.map(|(coefficients, rhs)| EqualityConstraint { coefficients, rhs }),
            lower: vec![0.0; n],
            upper: vec![upper; n],
            x_init,
        }
    }

    #[test]
    fn test_pair_with_equality_interior() {
        // y = (+1, -1), identity kernel: x1 = x2 = t, objective t^2 - 2t
        let qp = problem(
            vec![1.0, 0.0, 0.0, 1.0],
            vec![-1.0, -1.0],
            Some((vec![1.0, -1.0], 0.0)),
            10.0,
            vec![0.0, 0.0],
        );
        let sol = PairwiseQpSolver::new().solve(&qp, 1e-12);
        assert!(sol.converged);
        assert_relative_eq!(sol.primal[0], 1.0, epsilon = 1e-9);
        assert_relative_eq!(sol.primal[1], 1.0, epsilon = 1e-9);
        assert_relative_eq!(sol.offset.unwrap(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_pair_with_equality_at_bounds() {
        let qp = problem(
            vec![1.0, 0.0, 0.0, 1.0],
            vec![-1.0, -1.0],
            Some((vec![1.0, -1.0], 0.0)),
            0.5,
            vec![0.0, 0.0],
        );
        let sol = PairwiseQpSolver::new().solve(&qp, 1e-12);
        assert!(sol.converged);
        assert_eq!(sol.primal, vec![0.5, 0.5]);
        // Both at the upper bound: offset from the midpoint of [-0.5, 0.5]
        assert_relative_eq!(sol.offset.unwrap(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_equality_rhs_preserved() {
        let qp = problem(
            vec![1.0, 0.0, 0.0, 1.0],
            vec![0.0, 0.0],
            Some((vec![1.0, 1.0], 1.0)),
            5.0,
            vec![1.0, 0.0],
        );
        let sol = PairwiseQpSolver::new().solve(&qp, 1e-12);
        assert!(sol.converged);
        assert_relative_eq!(sol.primal[0], 0.5, epsilon = 1e-9);
        assert_relative_eq!(sol.primal[0] + sol.primal[1], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_box_only_coordinate_descent() {
        let qp = problem(
            vec![2.0, 0.0, 0.0, 2.0],
            vec![-2.0, 4.0],
            None,
            5.0,
            vec![3.0, 3.0],
        );
        let sol = PairwiseQpSolver::new().solve(&qp, 1e-12);
        assert!(sol.converged);
        assert!(sol.offset.is_none());
        assert_relative_eq!(sol.primal[0], 1.0, epsilon = 1e-9);
        assert_eq!(sol.primal[1], 0.0);
        assert_relative_eq!(qp.objective(&sol.primal), -1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_single_feasible_point() {
        let qp = problem(
            vec![1.0, 0.9, 0.9, 1.0],
            vec![-1.0, -1.0],
            Some((vec![1.0, 1.0], 0.0)),
            1.0,
            vec![0.0, 0.0],
        );
        // The only feasible point is the origin
        let sol = PairwiseQpSolver::new().solve(&qp, 1e-12);
        assert!(sol.converged);
        assert_eq!(sol.primal, vec![0.0, 0.0]);
    }

    #[test]
    fn test_empty_problem() {
        let qp = problem(Vec::new(), Vec::new(), None, 1.0, Vec::new());
        let sol = PairwiseQpSolver::new().solve(&qp, 1e-10);
        assert!(sol.converged && sol.primal.is_empty());
    }

    #[test]
    fn test_gradient_and_objective() {
        let qp = problem(
            vec![2.0, 1.0, 1.0, 3.0],
            vec![1.0, -1.0],
            None,
            1.0,
            vec![0.0, 0.0],
        );
        assert_eq!(qp.gradient(&[1.0, 1.0]), vec![4.0, 3.0]);
        assert_relative_eq!(qp.objective(&[1.0, 1.0]), 3.5);
    }
}
