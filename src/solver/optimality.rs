//! KKT checks and the adaptive tolerance schedule

use log::{debug, warn};

use crate::solver::problem::{Problem, MARGIN_TARGET};

/// Outcome of one KKT pass over the active examples
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KktCheck {
    pub max_violation: f64,
    /// Active examples on the wrong side of the surface
    pub misclassified: usize,
    /// The worst violation exceeds the current critical tolerance
    pub retrain: bool,
}

/// What the stall watchdog decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallAction {
    Continue,
    /// The target tolerance was loosened one notch
    Relaxed,
    /// No relaxations left
    Stop,
}

/// Largest KKT violation over `indices`
pub fn max_violation(
    problem: &Problem,
    alpha: &[f64],
    lin: &[f64],
    b: f64,
    indices: &[usize],
    epsilon_a: f64,
) -> f64 {
    indices
        .iter()
        .map(|&i| problem.violation(i, alpha[i], problem.distance(i, lin[i], b), epsilon_a))
        .fold(0.0, f64::max)
}

/// Tracks `epsilon_crit`, the shrink epsilon and per-example shrink eligibility
#[derive(Debug, Clone)]
pub struct OptimalityMonitor {
    target: f64,
    epsilon_crit: f64,
    epsilon_shrink: f64,
    linadd: bool,
    max_violation: f64,
    last_suboptimal_at: Vec<usize>,
    best_violation: f64,
    best_iteration: usize,
    stall_iterations: usize,
    relaxations: usize,
    max_relaxations: usize,
}

impl OptimalityMonitor {
    /// With linadd the critical tolerance starts loose at 2.0
    pub fn new(
        num_examples: usize,
        target: f64,
        linadd: bool,
        stall_iterations: usize,
        max_relaxations: usize,
    ) -> Self {
        Self {
            target,
            epsilon_crit: if linadd { 2.0 } else { target },
            epsilon_shrink: 2.0,
            linadd,
            max_violation: 1.0,
            last_suboptimal_at: vec![1; num_examples],
            best_violation: f64::INFINITY,
            best_iteration: 1,
            stall_iterations,
            relaxations: 0,
            max_relaxations,
        }
    }

    /// Current, possibly relaxed, target tolerance
    pub fn target(&self) -> f64 {
        self.target
    }

    pub fn epsilon_crit(&self) -> f64 {
        self.epsilon_crit
    }

    pub fn epsilon_shrink(&self) -> f64 {
        self.epsilon_shrink
    }

    /// Worst violation seen by the latest check or reactivation
    pub fn max_violation(&self) -> f64 {
        self.max_violation
    }

    pub fn set_max_violation(&mut self, value: f64) {
        self.max_violation = value;
    }

    /// Last iteration each example was free or near its margin
    pub fn last_suboptimal_at(&self) -> &[usize] {
        &self.last_suboptimal_at
    }

    pub fn relaxations(&self) -> usize {
        self.relaxations
    }

    /// Test the active examples and refresh shrink eligibility
    #[allow(clippy::too_many_arguments)]
    pub fn check(
        &mut self,
        problem: &Problem,
        alpha: &[f64],
        lin: &[f64],
        b: f64,
        active: &[usize],
        iteration: usize,
        epsilon_a: f64,
    ) -> KktCheck {
        self.epsilon_shrink = if self.linadd {
            self.target - self.epsilon_crit
        } else {
            0.7 * self.epsilon_shrink + 0.3 * self.max_violation
        };

        let mut worst = 0.0f64;
        let mut misclassified = 0;
        for &i in active {
            let a = alpha[i];
            let dist = problem.distance(i, lin[i], b);
            let ex_c = problem.cost(i) - epsilon_a;
            if dist <= 0.0 {
                misclassified += 1;
            }
            worst = worst.max(problem.violation(i, a, dist, epsilon_a));

            let suboptimal = (a > epsilon_a && a < ex_c)
                || (a <= epsilon_a && dist < MARGIN_TARGET + self.epsilon_shrink)
                || (a >= ex_c && dist > MARGIN_TARGET - self.epsilon_shrink);
            if suboptimal {
                self.last_suboptimal_at[i] = iteration;
            }
        }

        self.max_violation = worst;
        KktCheck {
            max_violation: worst,
            misclassified,
            retrain: worst > self.epsilon_crit,
        }
    }

    /// Tighten `epsilon_crit` after a pass; returns whether another pass is needed
    ///
    /// A clean pass pulls `epsilon_crit` down to the observed violation and, while
    /// still above the target, divides it by four and asks for another pass.
    pub fn tighten(&mut self, retrain: bool) -> bool {
        let mut retrain = retrain;
        if !retrain && self.epsilon_crit > self.max_violation {
            self.epsilon_crit = self.max_violation;
        }
        if !retrain && self.epsilon_crit > self.target {
            self.epsilon_crit /= 4.0;
            retrain = true;
            debug!("Tightening KKT tolerance to {:.6}", self.epsilon_crit.max(self.target));
        }
        if self.epsilon_crit < self.target {
            self.epsilon_crit = self.target;
        }
        retrain
    }

    /// Loosen the target ten-fold
    pub fn relax_target(&mut self) {
        self.target *= 10.0;
        self.epsilon_crit = self.epsilon_crit.max(self.target);
        warn!("Relaxing KKT tolerance to {:.6}", self.target);
    }

    /// Start the stall window over at `iteration`
    pub fn reset_watchdog(&mut self, iteration: usize) {
        self.best_violation = self.max_violation;
        self.best_iteration = iteration;
    }

    /// Record progress and react to a long stretch without improvement
    pub fn watchdog(&mut self, iteration: usize) -> StallAction {
        if self.max_violation < self.best_violation {
            self.best_violation = self.max_violation;
            self.best_iteration = iteration;
        }
        if iteration <= self.best_iteration + self.stall_iterations {
            return StallAction::Continue;
        }
        if self.relaxations >= self.max_relaxations {
            warn!(
                "No progress for {} iterations (max violation {:.6}), stopping",
                self.stall_iterations, self.best_violation
            );
            return StallAction::Stop;
        }
        self.relaxations += 1;
        warn!(
            "No progress for {} iterations (max violation {:.6})",
            self.stall_iterations, self.best_violation
        );
        self.relax_target();
        self.best_iteration = iteration;
        StallAction::Relaxed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TrainingConfig;

    fn problem() -> Problem {
        Problem::new(&vec![1.0, -1.0, 1.0, -1.0], &TrainingConfig::default()).unwrap()
    }

    #[test]
    fn test_check_is_idempotent() {
        let problem = problem();
        let alpha = [0.5, 0.5, 0.0, 1.0];
        let lin = [1.1, -0.7, 0.4, 0.2];
        let active = [0, 1, 2, 3];
        let mut monitor = OptimalityMonitor::new(4, 1e-3, false, 100, 3);

        let first = monitor.check(&problem, &alpha, &lin, 0.1, &active, 5, 1e-15);
        let second = monitor.check(&problem, &alpha, &lin, 0.1, &active, 6, 1e-15);
        assert_eq!(first.max_violation, second.max_violation);
        assert_eq!(first.misclassified, second.misclassified);
        assert_eq!(
            first.max_violation,
            max_violation(&problem, &alpha, &lin, 0.1, &active, 1e-15)
        );
    }

    #[test]
    fn test_check_counts_and_marks() {
        let problem = problem();
        // 0 free, 1 at zero far outside the margin, 2 at zero inside it
        let alpha = [0.5, 0.0, 0.0, 0.0];
        let lin = [1.0, -5.0, -0.5, -1.0];
        let mut monitor = OptimalityMonitor::new(4, 1e-3, false, 100, 3);
        let check = monitor.check(&problem, &alpha, &lin, 0.0, &[0, 1, 2], 7, 1e-15);

        assert_eq!(check.misclassified, 1);
        assert!((check.max_violation - 1.5).abs() < 1e-12);
        assert!(check.retrain);
        // Shrink epsilon moved to 0.7 * 2 + 0.3 * 1
        assert!((monitor.epsilon_shrink() - 1.7).abs() < 1e-12);
        assert_eq!(monitor.last_suboptimal_at()[0], 7);
        assert_eq!(monitor.last_suboptimal_at()[1], 1);
        assert_eq!(monitor.last_suboptimal_at()[2], 7);
        assert_eq!(monitor.last_suboptimal_at()[3], 1);
    }

    #[test]
    fn test_linadd_schedule() {
        let mut monitor = OptimalityMonitor::new(1, 1e-3, true, 100, 3);
        assert_eq!(monitor.epsilon_crit(), 2.0);

        monitor.set_max_violation(0.5);
        assert!(monitor.tighten(false));
        assert_eq!(monitor.epsilon_crit(), 0.125);

        // Below the target: clamp and stop asking for passes
        monitor.set_max_violation(1e-4);
        assert!(!monitor.tighten(false));
        assert_eq!(monitor.epsilon_crit(), 1e-3);
        assert!(monitor.tighten(true));
    }

    #[test]
    fn test_watchdog_relaxes_then_stops() {
        let mut monitor = OptimalityMonitor::new(1, 1e-3, false, 10, 1);
        monitor.set_max_violation(0.5);
        assert_eq!(monitor.watchdog(1), StallAction::Continue);
        assert_eq!(monitor.watchdog(11), StallAction::Continue);
        assert_eq!(monitor.watchdog(12), StallAction::Relaxed);
        assert!((monitor.target() - 1e-2).abs() < 1e-15);
        assert_eq!(monitor.watchdog(20), StallAction::Continue);
        assert_eq!(monitor.watchdog(23), StallAction::Stop);
    }
}
