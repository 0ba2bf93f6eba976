//! Labels, per-example cost bounds and margin arithmetic

use crate::core::{LabelSource, Result, TrainingConfig};

/// Linear term of the dual objective for every example
pub const LINEAR_TERM: f64 = -1.0;

/// Signed margin distance of an example satisfying its constraint exactly
pub const MARGIN_TARGET: f64 = -LINEAR_TERM;

/// Binary classification dual: labels and box bounds
#[derive(Debug, Clone)]
pub struct Problem {
    labels: Vec<f64>,
    cost: Vec<f64>,
}

impl Problem {
    /// Validate labels and assign class-balanced costs
    pub fn new<L: LabelSource + ?Sized>(labels: &L, config: &TrainingConfig) -> Result<Self> {
        let labels = labels.to_labels()?;
        let cost = labels.iter().map(|&y| config.cost_for(y)).collect();
        Ok(Self { labels, cost })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    #[inline]
    pub fn label(&self, i: usize) -> f64 {
        self.labels[i]
    }

    #[inline]
    pub fn cost(&self, i: usize) -> f64 {
        self.cost[i]
    }

    pub fn labels(&self) -> &[f64] {
        &self.labels
    }

    /// Signed distance from the separating surface, (lin_i - b) y_i
    #[inline]
    pub fn distance(&self, i: usize, lin: f64, b: f64) -> f64 {
        (lin - b) * self.labels[i]
    }

    /// Steepest-direction ranking value y_i (eps_i + y_i lin_i)
    #[inline]
    pub fn selection_criterion(&self, i: usize, lin: f64) -> f64 {
        let y = self.labels[i];
        y * (LINEAR_TERM + y * lin)
    }

    /// KKT violation of example `i` given its signed distance
    #[inline]
    pub fn violation(&self, i: usize, alpha: f64, dist: f64, epsilon_a: f64) -> f64 {
        if alpha > epsilon_a && dist > MARGIN_TARGET {
            dist - MARGIN_TARGET
        } else if alpha < self.cost[i] - epsilon_a && dist < MARGIN_TARGET {
            MARGIN_TARGET - dist
        } else {
            0.0
        }
    }

    /// Dual objective sum_i eps_i a_i + 1/2 a_i y_i lin_i
    pub fn objective(&self, alpha: &[f64], lin: &[f64]) -> f64 {
        alpha
            .iter()
            .zip(lin)
            .zip(&self.labels)
            .map(|((&a, &l), &y)| LINEAR_TERM * a + 0.5 * a * y * l)
            .sum()
    }
}
