//! High-level API for training with the decomposition solver
//!
//! This module wraps the engine, the MKL coordinator and the worker pool
//! behind a builder.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use mklight::api::SVMLight;
//! use mklight::kernel::RbfKernel;
//! use mklight::SparseVector;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let features = vec![
//!     SparseVector::from_dense(&[1.0, 1.0]),
//!     SparseVector::from_dense(&[-1.0, -1.0]),
//! ];
//! let labels = vec![1.0, -1.0];
//!
//! let mut svm = SVMLight::new(RbfKernel::new(features, 0.5)?)
//!     .with_c(1.0)
//!     .with_epsilon(0.001);
//! let output = svm.train(&labels)?;
//! println!("{} support vectors", output.model.support_vectors.len());
//! # Ok(())
//! # }
//! ```

use log::info;

use crate::core::{
    CancellationToken, Classifier, LabelSource, MklConfig, Result, SvmModel, TrainingConfig,
    TrainingSummary,
};
use crate::kernel::KernelOracle;
use crate::mkl::{MklCoordinator, WeightLp};
use crate::parallel::run_with_threads;
use crate::solver::{DecompositionEngine, QpSolver};

/// SVM-light trainer with builder pattern
pub struct SVMLight<K: KernelOracle> {
    kernel: K,
    config: TrainingConfig,
    qp_solver: Option<Box<dyn QpSolver>>,
    weight_lp: Option<Box<dyn WeightLp>>,
    initial_alpha: Option<Vec<f64>>,
    cancel: CancellationToken,
}

impl<K: KernelOracle> SVMLight<K> {
    /// Create a trainer over `kernel` with default parameters
    pub fn new(kernel: K) -> Self {
        Self {
            kernel,
            config: TrainingConfig::default(),
            qp_solver: None,
            weight_lp: None,
            initial_alpha: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the whole configuration
    pub fn with_config(mut self, config: TrainingConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the cost bound C for both classes
    pub fn with_c(mut self, c: f64) -> Self {
        self.config.c1 = c;
        self.config.c2 = c;
        self
    }

    /// Set separate cost bounds for negative and positive examples
    pub fn with_class_costs(mut self, negative: f64, positive: f64) -> Self {
        self.config.c1 = negative;
        self.config.c2 = positive;
        self
    }

    /// Set the KKT tolerance
    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.config.epsilon = epsilon;
        self
    }

    /// Set the working-set size
    pub fn with_qpsize(mut self, qpsize: usize) -> Self {
        self.config.qpsize = qpsize;
        self
    }

    /// Set kernel cache size in bytes
    pub fn with_cache_size(mut self, cache_size: usize) -> Self {
        self.config.cache_size = cache_size;
        self
    }

    pub fn with_shrinking(mut self, shrinking: bool) -> Self {
        self.config.shrinking = shrinking;
        self
    }

    pub fn with_bias(mut self, bias: bool) -> Self {
        self.config.bias_enabled = bias;
        self
    }

    pub fn with_linadd(mut self, linadd: bool) -> Self {
        self.config.linadd_enabled = linadd;
        self
    }

    /// Stop after `seconds` of wall-clock time
    pub fn with_max_train_time(mut self, seconds: f64) -> Self {
        self.config.max_train_time = Some(seconds);
        self
    }

    /// Worker threads: 0 uses the rayon default, 1 runs sequentially
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.config.num_threads = threads;
        self
    }

    /// Learn the sub-kernel weights as well
    pub fn with_mkl(mut self, mkl: MklConfig) -> Self {
        self.config.mkl = Some(mkl);
        self
    }

    /// QP primitive for the next training run
    pub fn with_qp_solver(mut self, solver: Box<dyn QpSolver>) -> Self {
        self.qp_solver = Some(solver);
        self
    }

    /// Cutting-plane LP for the next MKL run
    pub fn with_weight_lp(mut self, lp: Box<dyn WeightLp>) -> Self {
        self.weight_lp = Some(lp);
        self
    }

    /// Start from the given alpha values instead of zero
    pub fn with_initial_alpha(mut self, alpha: Vec<f64>) -> Self {
        self.initial_alpha = Some(alpha);
        self
    }

    /// Share an existing cancellation token with the run
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Token that stops a running `train` call from another thread
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn into_kernel(self) -> K {
        self.kernel
    }

    /// Train on the kernel's examples with the given labels
    ///
    /// Custom QP and weight-LP primitives are consumed by the run.
    pub fn train<L: LabelSource + ?Sized>(&mut self, labels: &L) -> Result<TrainingOutput> {
        let labels = labels.to_labels()?;
        self.config.validate()?;

        let config = self.config.clone();
        let qp_solver = self.qp_solver.take();
        let weight_lp = self.weight_lp.take();
        let initial_alpha = self.initial_alpha.clone();
        let cancel = self.cancel.clone();
        let kernel = &mut self.kernel;

        run_with_threads(config.num_threads, move |parallelism| {
            let mut engine = DecompositionEngine::new(kernel, &labels, &config)?
                .with_parallelism(parallelism)
                .with_cancellation(cancel);
            if let Some(solver) = qp_solver {
                engine = engine.with_qp_solver(solver);
            }
            if let Some(alpha) = initial_alpha {
                engine.warm_start(&alpha)?;
            }

            let mkl = match &config.mkl {
                Some(mkl_config) => {
                    let mut coordinator = MklCoordinator::new(mkl_config.clone());
                    if let Some(lp) = weight_lp {
                        coordinator = coordinator.with_weight_lp(lp);
                    }
                    coordinator.train(&mut engine)?;
                    Some(coordinator.summary())
                }
                None => {
                    engine.optimize();
                    None
                }
            };

            let mut summary = engine.summary();
            summary.mkl = mkl;
            info!(
                "Training finished: {:?} after {} iterations in {:.3}s",
                summary.reason, summary.iterations, summary.elapsed_seconds
            );
            Ok(TrainingOutput {
                model: engine.model(),
                summary,
            })
        })?
    }
}

/// Trained model together with the run's diagnostics
#[derive(Debug, Clone)]
pub struct TrainingOutput {
    pub model: SvmModel,
    pub summary: TrainingSummary,
}

impl TrainingOutput {
    /// Confusion counts of the model on the training examples
    pub fn evaluate<K: KernelOracle + ?Sized>(
        &self,
        kernel: &K,
        labels: &[f64],
    ) -> EvaluationMetrics {
        let mut metrics = EvaluationMetrics::default();
        for (j, &actual) in labels.iter().enumerate() {
            let pred = self.model.predict(&|i| kernel.evaluate(i, j));
            match (pred.label > 0.0, actual > 0.0) {
                (true, true) => metrics.true_positives += 1,
                (false, false) => metrics.true_negatives += 1,
                (true, false) => metrics.false_positives += 1,
                (false, true) => metrics.false_negatives += 1,
            }
        }
        metrics
    }
}

/// Detailed evaluation metrics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvaluationMetrics {
    pub true_positives: usize,
    pub true_negatives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
}

impl EvaluationMetrics {
    /// (TP + TN) / total
    pub fn accuracy(&self) -> f64 {
        let total =
            self.true_positives + self.true_negatives + self.false_positives + self.false_negatives;
        if total == 0 {
            0.0
        } else {
            (self.true_positives + self.true_negatives) as f64 / total as f64
        }
    }

    /// TP / (TP + FP)
    pub fn precision(&self) -> f64 {
        let denominator = self.true_positives + self.false_positives;
        if denominator == 0 {
            0.0
        } else {
            self.true_positives as f64 / denominator as f64
        }
    }

    /// TP / (TP + FN)
    pub fn recall(&self) -> f64 {
        let denominator = self.true_positives + self.false_negatives;
        if denominator == 0 {
            0.0
        } else {
            self.true_positives as f64 / denominator as f64
        }
    }

    pub fn f1_score(&self) -> f64 {
        let p = self.precision();
        let r = self.recall();
        if p + r == 0.0 {
            0.0
        } else {
            2.0 * (p * r) / (p + r)
        }
    }
}
