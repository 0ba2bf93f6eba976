//! Decomposition solver for kernel support vector machines
//!
//! Based on "Making Large-Scale SVM Learning Practical" by Thorsten Joachims,
//! with multiple kernel learning layered on top of the inner solver.

pub mod api;
pub mod cache;
pub mod core;
pub mod kernel;
pub mod mkl;
pub mod parallel;
pub mod solver;

// Re-export main types for convenience
pub use crate::api::{EvaluationMetrics, SVMLight, TrainingOutput};
pub use crate::cache::{CacheStats, KernelCache};
pub use crate::core::error::{Result, SVMError};
pub use crate::core::traits::*;
pub use crate::core::types::*;
pub use crate::kernel::{CombinedKernel, CustomKernel, KernelOracle, LinearKernel, RbfKernel};
pub use crate::mkl::{MklCoordinator, SimplexWeightLp, WeightLp};
pub use crate::parallel::Parallelism;
pub use crate::solver::{DecompositionEngine, EngineOutcome, PairwiseQpSolver, QpSolver};

// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
