//! SVM-light decomposition solver
//!
//! Implements the decomposition algorithm described in "Making Large-Scale
//! SVM Learning Practical" by Thorsten Joachims: working sets of `qpsize`
//! variables, shrinking of the active set, and incremental gradient updates.

pub mod engine;
pub mod gradient;
pub mod optimality;
pub mod problem;
pub mod qp;
pub mod selection;
pub mod shrinking;
pub mod subproblem;

pub use self::engine::{DecompositionEngine, EngineOutcome};
pub use self::gradient::{GradientMode, GradientUpdater};
pub use self::optimality::{KktCheck, OptimalityMonitor, StallAction};
pub use self::problem::Problem;
pub use self::qp::{EqualityConstraint, PairwiseQpSolver, QpProblem, QpSolution, QpSolver};
pub use self::selection::WorkingSetSelector;
pub use self::shrinking::{ShrinkOutcome, ShrinkState};
pub use self::subproblem::{ModelState, QpBridge, QpStep, SubproblemBuilder};
