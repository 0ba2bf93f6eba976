//! Sub-kernel weight updates
//!
//! Two ways to turn the per-kernel quadratic terms `sumw` and the alpha sum
//! `suma` into new weights:
//! - a cutting-plane LP over the simplex (norm 1), one cut per outer step:
//!   minimise `theta` subject to `theta >= suma_t - sum_d beta_d sumw_t[d]`
//! - the closed-form L_p update for any norm `p >= 1`

use crate::core::{Result, SVMError};

/// Identifier of a cut inside a [`WeightLp`]
pub type RowId = usize;

/// State of one cut at the optimum
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RowStatus {
    pub id: RowId,
    /// Normalised dual value; zero for cuts that do not bind
    pub dual: f64,
    /// `theta - (rhs - coefficients . beta)`, never negative
    pub slack: f64,
}

/// Optimum of the cutting-plane LP
#[derive(Debug, Clone, PartialEq)]
pub struct LpSolution {
    pub beta: Vec<f64>,
    pub theta: f64,
    pub rows: Vec<RowStatus>,
}

/// Weight LP primitive: `min theta` over `beta` in the simplex subject to
/// `theta >= rhs_t - coefficients_t . beta` for every cut `t`
pub trait WeightLp: Send {
    fn add_row(&mut self, coefficients: &[f64], rhs: f64) -> RowId;

    fn solve(&mut self) -> Result<LpSolution>;

    fn remove_row(&mut self, id: RowId);

    fn num_rows(&self) -> usize;
}

const PIVOT_EPS: f64 = 1e-12;
const SAME_COLUMN_EPS: f64 = 1e-12;

struct Cut {
    id: RowId,
    coefficients: Vec<f64>,
    rhs: f64,
}

/// Dense simplex solution of the cutting-plane LP
///
/// The LP is a matrix game between the cuts and the sub-kernels with payoff
/// `rhs_t - coefficients_t[d]`; the simplex runs with Bland's rule on the
/// shifted, strictly positive payoff matrix. Sub-kernels with identical
/// columns share their weight equally.
#[derive(Default)]
pub struct SimplexWeightLp {
    cuts: Vec<Cut>,
    next_id: RowId,
}

impl SimplexWeightLp {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WeightLp for SimplexWeightLp {
    fn add_row(&mut self, coefficients: &[f64], rhs: f64) -> RowId {
        let id = self.next_id;
        self.next_id += 1;
        self.cuts.push(Cut {
            id,
            coefficients: coefficients.to_vec(),
            rhs,
        });
        id
    }

    fn solve(&mut self) -> Result<LpSolution> {
        let first = self
            .cuts
            .first()
            .ok_or_else(|| SVMError::WeightSolverFailed("no cuts to solve".to_string()))?;
        let d = first.coefficients.len();
        if d == 0 {
            return Err(SVMError::WeightSolverFailed("no sub-kernels".to_string()));
        }
        for cut in &self.cuts {
            if cut.coefficients.len() != d {
                return Err(SVMError::DimensionMismatch {
                    expected: d,
                    actual: cut.coefficients.len(),
                });
            }
            if !cut.rhs.is_finite() || cut.coefficients.iter().any(|c| !c.is_finite()) {
                return Err(SVMError::WeightSolverFailed(
                    "cut has non-finite coefficients".to_string(),
                ));
            }
        }

        let payoff: Vec<Vec<f64>> = self
            .cuts
            .iter()
            .map(|cut| cut.coefficients.iter().map(|c| cut.rhs - c).collect())
            .collect();

        // Group identical sub-kernel columns
        let mut groups: Vec<Vec<usize>> = Vec::new();
        for g in 0..d {
            let same = groups.iter_mut().find(|group| {
                let h = group[0];
                payoff.iter().all(|row| {
                    (row[g] - row[h]).abs() <= SAME_COLUMN_EPS * (1.0 + row[h].abs())
                })
            });
            match same {
                Some(group) => group.push(g),
                None => groups.push(vec![g]),
            }
        }

        let reduced: Vec<Vec<f64>> = payoff
            .iter()
            .map(|row| groups.iter().map(|group| row[group[0]]).collect())
            .collect();
        let smallest = reduced
            .iter()
            .flatten()
            .fold(f64::INFINITY, |m, &v| m.min(v));
        let shift = 1.0 - smallest;
        let shifted: Vec<Vec<f64>> = reduced
            .iter()
            .map(|row| row.iter().map(|v| v + shift).collect())
            .collect();

        let game = solve_packing_lp(&shifted)?;
        let beta_reduced: Vec<f64> = game.primal.iter().map(|u| u / game.value).collect();
        let theta = 1.0 / game.value - shift;

        let mut beta = vec![0.0; d];
        for (group, &b) in groups.iter().zip(&beta_reduced) {
            let share = b / group.len() as f64;
            for &g in group {
                beta[g] = share;
            }
        }

        let dual_sum: f64 = game.dual.iter().sum();
        let rows = self
            .cuts
            .iter()
            .zip(&game.dual)
            .map(|(cut, &y)| {
                let bound = cut.rhs
                    - cut
                        .coefficients
                        .iter()
                        .zip(&beta)
                        .map(|(c, b)| c * b)
                        .sum::<f64>();
                RowStatus {
                    id: cut.id,
                    dual: if dual_sum > 0.0 { y / dual_sum } else { 0.0 },
                    slack: (theta - bound).max(0.0),
                }
            })
            .collect();

        Ok(LpSolution { beta, theta, rows })
    }

    fn remove_row(&mut self, id: RowId) {
        self.cuts.retain(|cut| cut.id != id);
    }

    fn num_rows(&self) -> usize {
        self.cuts.len()
    }
}

struct PackingSolution {
    primal: Vec<f64>,
    dual: Vec<f64>,
    value: f64,
}

/// `max 1'u` subject to `A u <= 1`, `u >= 0`, for strictly positive `A`
fn solve_packing_lp(a: &[Vec<f64>]) -> Result<PackingSolution> {
    let m = a.len();
    let n = a.first().map_or(0, Vec::len);
    let width = n + m + 1;
    let rhs = width - 1;

    let mut tableau: Vec<Vec<f64>> = a
        .iter()
        .enumerate()
        .map(|(i, row)| {
            let mut t = vec![0.0; width];
            t[..n].copy_from_slice(row);
            t[n + i] = 1.0;
            t[rhs] = 1.0;
            t
        })
        .collect();
    let mut objective = vec![0.0; width];
    objective[..n].fill(-1.0);
    let mut basis: Vec<usize> = (n..n + m).collect();

    let max_pivots = 50 * (n + m).max(1);
    let mut optimal = false;
    for _ in 0..max_pivots {
        let Some(col) = (0..rhs).find(|&j| objective[j] < -PIVOT_EPS) else {
            optimal = true;
            break;
        };

        let mut pivot: Option<(usize, f64)> = None;
        for i in 0..m {
            let coeff = tableau[i][col];
            if coeff <= PIVOT_EPS {
                continue;
            }
            let ratio = tableau[i][rhs] / coeff;
            pivot = match pivot {
                Some((p, best))
                    if ratio > best + PIVOT_EPS
                        || ((ratio - best).abs() <= PIVOT_EPS && basis[i] > basis[p]) =>
                {
                    Some((p, best))
                }
                _ => Some((i, ratio)),
            };
        }
        let Some((row, _)) = pivot else {
            return Err(SVMError::WeightSolverFailed("weight LP is unbounded".to_string()));
        };

        let p = tableau[row][col];
        for v in tableau[row].iter_mut() {
            *v /= p;
        }
        let pivot_row = tableau[row].clone();
        for (i, t) in tableau.iter_mut().enumerate() {
            if i == row {
                continue;
            }
            let factor = t[col];
            if factor != 0.0 {
                for (v, pv) in t.iter_mut().zip(&pivot_row) {
                    *v -= factor * pv;
                }
            }
        }
        let factor = objective[col];
        for (v, pv) in objective.iter_mut().zip(&pivot_row) {
            *v -= factor * pv;
        }
        basis[row] = col;
    }
    if !optimal {
        return Err(SVMError::WeightSolverFailed(format!(
            "weight LP did not converge within {max_pivots} pivots"
        )));
    }

    let mut primal = vec![0.0; n];
    for (i, &b) in basis.iter().enumerate() {
        if b < n {
            primal[b] = tableau[i][rhs].max(0.0);
        }
    }
    let value: f64 = primal.iter().sum();
    if !(value.is_finite() && value > 0.0) {
        return Err(SVMError::WeightSolverFailed(format!(
            "weight LP returned value {value}"
        )));
    }
    let dual = (0..m).map(|i| objective[n + i].max(0.0)).collect();
    Ok(PackingSolution {
        primal,
        dual,
        value,
    })
}

/// Remove one non-binding cut once the LP carries more than `budget` cuts
/// or more than twice the binding ones; returns the removed id
pub fn prune_rows(lp: &mut dyn WeightLp, solution: &LpSolution, budget: usize) -> Option<RowId> {
    let active = solution.rows.iter().filter(|r| r.dual > PIVOT_EPS).count();
    if lp.num_rows() <= budget.max(2 * active) {
        return None;
    }
    let victim = solution
        .rows
        .iter()
        .filter(|r| r.dual <= PIVOT_EPS)
        .max_by(|a, b| a.slack.total_cmp(&b.slack))?;
    lp.remove_row(victim.id);
    Some(victim.id)
}

/// Scale `beta` to unit p-norm; all-zero input becomes uniform
pub fn normalize_weights(beta: &[f64], norm: f64) -> Vec<f64> {
    let z: f64 = beta.iter().map(|b| b.abs().powf(norm)).sum::<f64>().powf(1.0 / norm);
    if z > 0.0 && z.is_finite() {
        beta.iter().map(|b| b.abs() / z).collect()
    } else {
        let d = beta.len().max(1) as f64;
        vec![d.powf(-1.0 / norm); beta.len()]
    }
}

/// Closed-form L_p step; returns the new weights and the objective under them
pub fn direct_weights(old_beta: &[f64], sumw: &[f64], suma: f64, norm: f64) -> (Vec<f64>, f64) {
    let mut beta: Vec<f64> = sumw
        .iter()
        .zip(old_beta)
        .map(|(&s, &b)| {
            if s >= 0.0 && b >= 0.0 {
                (s * b * b / norm).powf(1.0 / (norm + 1.0))
            } else {
                0.0
            }
        })
        .collect();
    beta = normalize_weights(&beta, norm);

    // Regularise by 1% of the RMS step, then renormalise
    let pre: f64 = old_beta.iter().zip(&beta).map(|(o, b)| (o - b).powi(2)).sum();
    let r = (pre / norm).sqrt() * 0.01;
    for b in beta.iter_mut() {
        *b += r;
    }
    beta = normalize_weights(&beta, norm);
    for b in beta.iter_mut() {
        *b = b.min(1.0);
    }

    let objective = -suma + sumw.iter().zip(&beta).map(|(s, b)| s * b).sum::<f64>();
    (beta, objective)
}
