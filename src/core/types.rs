//! Core type definitions: configuration, models and training summaries

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{Result, SVMError};

/// Prediction result containing label and decision value
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    /// Predicted class label (+1 or -1)
    pub label: f64,
    /// Raw decision function value
    pub decision_value: f64,
}

impl Prediction {
    /// Create a new prediction
    pub fn new(label: f64, decision_value: f64) -> Self {
        Self {
            label,
            decision_value,
        }
    }

    /// Get confidence as absolute value of decision value
    pub fn confidence(&self) -> f64 {
        self.decision_value.abs()
    }
}

/// Sparse vector representation with sorted indices
#[derive(Clone, Debug, PartialEq)]
pub struct SparseVector {
    /// Sorted indices of non-zero elements
    pub indices: Vec<usize>,
    /// Values corresponding to indices
    pub values: Vec<f64>,
}

impl SparseVector {
    /// Create a new sparse vector, ensuring indices are sorted
    pub fn new(indices: Vec<usize>, values: Vec<f64>) -> Self {
        assert_eq!(
            indices.len(),
            values.len(),
            "Indices and values must have same length"
        );

        let mut pairs: Vec<_> = indices.into_iter().zip(values).collect();
        pairs.sort_by_key(|&(idx, _)| idx);

        let (indices, values): (Vec<_>, Vec<_>) = pairs.into_iter().unzip();
        Self { indices, values }
    }

    /// Create an empty sparse vector
    pub fn empty() -> Self {
        Self {
            indices: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Build a sparse vector from a dense slice, skipping zeros
    pub fn from_dense(values: &[f64]) -> Self {
        let (indices, values) = values
            .iter()
            .enumerate()
            .filter(|(_, &v)| v != 0.0)
            .map(|(i, &v)| (i, v))
            .unzip();
        Self { indices, values }
    }

    /// Get the value at a specific index (0 if not present)
    pub fn get(&self, index: usize) -> f64 {
        match self.indices.binary_search(&index) {
            Ok(pos) => self.values[pos],
            Err(_) => 0.0,
        }
    }

    /// Compute squared L2 norm
    pub fn norm_squared(&self) -> f64 {
        self.values.iter().map(|&v| v * v).sum()
    }

    /// Largest feature index plus one (0 for an empty vector)
    pub fn dim(&self) -> usize {
        self.indices.last().map_or(0, |&i| i + 1)
    }

    /// Number of non-zero elements
    pub fn nnz(&self) -> usize {
        self.indices.len()
    }

    /// Check if vector is empty
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// How the MKL layer re-weights its sub-kernels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WeightSolverKind {
    /// Cutting-plane LP for norm 1, closed form otherwise
    Auto,
    /// Cutting-plane LP over the simplex (norm 1 only)
    CuttingPlane,
    /// Closed-form L_p update (any norm >= 1)
    Direct,
}

/// Multiple kernel learning parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MklConfig {
    /// Norm p of the weight constraint ||beta||_p = 1
    pub norm: f64,
    /// Tolerance on the relative weight gap |1 - rho / objective|
    pub epsilon: f64,
    /// Upper bound on outer re-weighting steps
    pub max_iterations: usize,
    /// Weight update method
    pub solver: WeightSolverKind,
    /// Cuts kept per sub-kernel before inactive ones are pruned
    pub row_budget_factor: usize,
}

impl Default for MklConfig {
    fn default() -> Self {
        Self {
            norm: 1.0,
            epsilon: 1e-2,
            max_iterations: 1000,
            solver: WeightSolverKind::Auto,
            row_budget_factor: 50,
        }
    }
}

impl MklConfig {
    /// Resolve `Auto` against the configured norm
    pub fn effective_solver(&self) -> WeightSolverKind {
        match self.solver {
            WeightSolverKind::Auto if self.norm == 1.0 => WeightSolverKind::CuttingPlane,
            WeightSolverKind::Auto => WeightSolverKind::Direct,
            other => other,
        }
    }
}

/// Configuration for the decomposition engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Cost bound for negative examples
    pub c1: f64,
    /// Cost bound for positive examples
    pub c2: f64,
    /// Target KKT tolerance
    pub epsilon: f64,
    /// Distance below which a dual variable counts as being at a bound
    pub epsilon_a: f64,
    /// Working set size
    pub qpsize: usize,
    /// Ceiling for the working set size when MKL is enabled
    pub qpsize_max: usize,
    /// Variables entering the working set per iteration (`None` = qpsize - 1)
    pub new_vars_in_qp: Option<usize>,
    /// Iterations at a bound before a variable may be shrunk
    pub iter_to_shrink: usize,
    /// Iterations between shrinking attempts
    pub shrink_period: usize,
    /// Enable the shrinking heuristic
    pub shrinking: bool,
    /// Solve with the equality constraint (bias term)
    pub bias_enabled: bool,
    /// Use the accumulated-normal fast path when the kernel offers it
    pub linadd_enabled: bool,
    /// Use batch evaluation for reactivation when the kernel offers it
    pub batch_computation_enabled: bool,
    /// Kernel cache size in bytes
    pub cache_size: usize,
    /// Wall-clock budget in seconds
    pub max_train_time: Option<f64>,
    /// Maximum number of stored shrink snapshots
    pub max_history: usize,
    /// Iterations without improvement before the tolerance is relaxed
    pub stall_iterations: usize,
    /// Tolerance relaxations allowed before training stops as stalled
    pub max_stall_relaxations: usize,
    /// Hard limit on outer iterations
    pub max_iterations: Option<usize>,
    /// Every n-th iteration selects the working set pseudo-randomly
    pub random_selection_period: usize,
    /// Worker threads (0 = rayon default, 1 = sequential)
    pub num_threads: usize,
    /// Multiple kernel learning
    pub mkl: Option<MklConfig>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            c1: 1.0,
            c2: 1.0,
            epsilon: 0.001,
            epsilon_a: 1e-15,
            qpsize: 41,
            qpsize_max: 1000,
            new_vars_in_qp: None,
            iter_to_shrink: 100,
            shrink_period: 10,
            shrinking: true,
            bias_enabled: true,
            linadd_enabled: true,
            batch_computation_enabled: true,
            cache_size: 100_000_000, // 100MB
            max_train_time: None,
            max_history: 50_000,
            stall_iterations: 100_000,
            max_stall_relaxations: 3,
            max_iterations: None,
            random_selection_period: 101,
            num_threads: 0,
            mkl: None,
        }
    }
}

impl TrainingConfig {
    /// Parse a configuration from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Number of variables that may enter the working set per iteration
    pub fn effective_new_vars(&self) -> usize {
        self.new_vars_in_qp
            .unwrap_or_else(|| self.qpsize.saturating_sub(1))
            .clamp(2, self.qpsize.max(2))
    }

    /// Cost bound for an example with the given label
    pub fn cost_for(&self, label: f64) -> f64 {
        if label > 0.0 {
            self.c2
        } else {
            self.c1
        }
    }

    /// Check parameter ranges
    pub fn validate(&self) -> Result<()> {
        let positive = |name: &str, v: f64| {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(SVMError::InvalidParameter(format!(
                    "{name} must be positive and finite, got {v}"
                )))
            }
        };
        positive("c1", self.c1)?;
        positive("c2", self.c2)?;
        positive("epsilon", self.epsilon)?;

        if !(self.epsilon_a >= 0.0 && self.epsilon_a < self.epsilon) {
            return Err(SVMError::InvalidParameter(format!(
                "epsilon_a must lie in [0, epsilon), got {}",
                self.epsilon_a
            )));
        }
        if self.qpsize < 2 {
            return Err(SVMError::InvalidParameter(format!(
                "qpsize must be at least 2, got {}",
                self.qpsize
            )));
        }
        if self.qpsize_max < self.qpsize {
            return Err(SVMError::InvalidParameter(format!(
                "qpsize_max ({}) must not be smaller than qpsize ({})",
                self.qpsize_max, self.qpsize
            )));
        }
        for (name, value) in [
            ("iter_to_shrink", self.iter_to_shrink),
            ("shrink_period", self.shrink_period),
            ("max_history", self.max_history),
            ("stall_iterations", self.stall_iterations),
        ] {
            if value == 0 {
                return Err(SVMError::InvalidParameter(format!(
                    "{name} must be at least 1"
                )));
            }
        }
        if self.random_selection_period < 2 {
            return Err(SVMError::InvalidParameter(format!(
                "random_selection_period must be at least 2, got {}",
                self.random_selection_period
            )));
        }
        if let Some(t) = self.max_train_time {
            positive("max_train_time", t)?;
        }
        if let Some(mkl) = &self.mkl {
            if !(mkl.norm.is_finite() && mkl.norm >= 1.0) {
                return Err(SVMError::InvalidParameter(format!(
                    "MKL norm must be >= 1, got {}",
                    mkl.norm
                )));
            }
            positive("mkl.epsilon", mkl.epsilon)?;
            if mkl.solver == WeightSolverKind::CuttingPlane && mkl.norm != 1.0 {
                return Err(SVMError::InvalidParameter(
                    "cutting-plane weight solver requires norm 1".to_string(),
                ));
            }
            if mkl.row_budget_factor == 0 {
                return Err(SVMError::InvalidParameter(
                    "mkl.row_budget_factor must be at least 1".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// One support vector of a trained model
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SupportVector {
    /// Training example index
    pub index: usize,
    /// Scaled dual weight alpha_i * y_i
    pub coefficient: f64,
}

/// Trained classifier: f(x) = sum_i coef_i k(x_i, x) + bias
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SvmModel {
    pub support_vectors: Vec<SupportVector>,
    pub bias: f64,
    /// Sub-kernel weights the model was trained with (MKL only)
    pub subkernel_weights: Option<Vec<f64>>,
    pub trained_at: DateTime<Utc>,
}

impl SvmModel {
    /// Decision value given a kernel column `k(sv_index, x)`
    pub fn decision_value<F: Fn(usize) -> f64>(&self, kernel_column: F) -> f64 {
        self.support_vectors
            .iter()
            .map(|sv| sv.coefficient * kernel_column(sv.index))
            .sum::<f64>()
            + self.bias
    }

    /// Classify through a kernel column
    pub fn classify<F: Fn(usize) -> f64>(&self, kernel_column: F) -> Prediction {
        let value = self.decision_value(kernel_column);
        Prediction::new(if value >= 0.0 { 1.0 } else { -1.0 }, value)
    }
}

/// Why the engine stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationReason {
    Converged,
    Cancelled,
    TimeLimit,
    MaxIterations,
    Stalled,
}

impl TerminationReason {
    /// Whether the returned model is optimal within the requested tolerance
    pub fn is_converged(&self) -> bool {
        matches!(self, TerminationReason::Converged)
    }
}

/// Outcome of the outer MKL loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MklSummary {
    /// Final sub-kernel weights
    pub beta: Vec<f64>,
    /// Final relative weight gap
    pub w_gap: f64,
    /// Outer re-weighting steps performed
    pub iterations: usize,
    /// The weight solver failed and training finished with fixed weights
    pub fallback: bool,
}

/// Diagnostics reported alongside a trained model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub iterations: usize,
    pub reason: TerminationReason,
    pub max_violation: f64,
    pub objective: f64,
    pub support_vectors: usize,
    pub at_upper_bound: usize,
    pub misclassified: usize,
    pub elapsed_seconds: f64,
    pub mkl: Option<MklSummary>,
}

/// Cooperative cancellation flag shared between a caller and a training run
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request the training run to stop after its current step
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear a previous request
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sparse_vector_creation() {
        let sv = SparseVector::new(vec![2, 0, 4], vec![2.0, 1.0, 3.0]);
        assert_eq!(sv.indices, vec![0, 2, 4]);
        assert_eq!(sv.values, vec![1.0, 2.0, 3.0]);
        assert_eq!(sv.dim(), 5);
    }

    #[test]
    fn test_sparse_vector_from_dense() {
        let sv = SparseVector::from_dense(&[0.0, 1.5, 0.0, -2.0]);
        assert_eq!(sv.indices, vec![1, 3]);
        assert_eq!(sv.get(3), -2.0);
        assert_eq!(sv.get(0), 0.0);
        assert_eq!(sv.norm_squared(), 6.25);
    }

    #[test]
    #[should_panic(expected = "Indices and values must have same length")]
    fn test_sparse_vector_length_mismatch() {
        SparseVector::new(vec![0, 1], vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_config_default_is_valid() {
        let config = TrainingConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.qpsize, 41);
        assert_eq!(config.effective_new_vars(), 40);
        assert_eq!(config.random_selection_period, 101);
    }

    #[test]
    fn test_config_from_json_partial() {
        let config =
            TrainingConfig::from_json(r#"{"c1": 0.5, "c2": 2.0, "qpsize": 10}"#).unwrap();
        assert_eq!(config.c1, 0.5);
        assert_eq!(config.cost_for(1.0), 2.0);
        assert_eq!(config.cost_for(-1.0), 0.5);
        let uneven = TrainingConfig {
            c1: 0.3,
            c2: 0.7,
            ..TrainingConfig::default()
        };
        assert_eq!(uneven.cost_for(1.0), 0.7);
        assert_eq!(config.qpsize, 10);
        assert_eq!(config.epsilon, 0.001);
    }

    #[test]
    fn test_config_from_json_rejects_bad_values() {
        assert!(matches!(
            TrainingConfig::from_json(r#"{"qpsize": 1}"#),
            Err(SVMError::InvalidParameter(_))
        ));
        assert!(matches!(
            TrainingConfig::from_json("{not json"),
            Err(SVMError::ConfigParse(_))
        ));
    }

    #[test]
    fn test_mkl_config_validation() {
        let mut config = TrainingConfig::default();
        config.mkl = Some(MklConfig {
            norm: 2.0,
            solver: WeightSolverKind::CuttingPlane,
            ..MklConfig::default()
        });
        assert!(config.validate().is_err());

        config.mkl = Some(MklConfig {
            norm: 2.0,
            ..MklConfig::default()
        });
        assert!(config.validate().is_ok());
        assert_eq!(
            config.mkl.as_ref().unwrap().effective_solver(),
            WeightSolverKind::Direct
        );
        assert_eq!(
            MklConfig::default().effective_solver(),
            WeightSolverKind::CuttingPlane
        );
    }

    #[test]
    fn test_model_decision_value() {
        let model = SvmModel {
            support_vectors: vec![
                SupportVector {
                    index: 0,
                    coefficient: 0.5,
                },
                SupportVector {
                    index: 3,
                    coefficient: -0.25,
                },
            ],
            bias: 0.1,
            subkernel_weights: None,
            trained_at: Utc::now(),
        };
        let column = |i: usize| i as f64 + 1.0;
        assert!((model.decision_value(column) - (0.5 - 1.0 + 0.1)).abs() < 1e-12);
        assert_eq!(model.classify(column).label, -1.0);
    }

    #[test]
    fn test_model_serde() {
        let model = SvmModel {
            support_vectors: vec![SupportVector {
                index: 2,
                coefficient: 1.0,
            }],
            bias: -0.5,
            subkernel_weights: Some(vec![0.5, 0.5]),
            trained_at: Utc::now(),
        };
        let json = serde_json::to_string(&model).unwrap();
        let back: SvmModel = serde_json::from_str(&json).unwrap();
        assert_eq!(back.support_vectors, model.support_vectors);
        assert_eq!(back.subkernel_weights, model.subkernel_weights);
    }

    #[test]
    fn test_cancellation_token_shared() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
        token.reset();
        assert!(!clone.is_cancelled());
    }
}
