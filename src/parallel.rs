//! Fork/join helpers for the embarrassingly parallel inner steps
//!
//! Parallel sections split an index range into contiguous partitions, run one
//! task per partition and join before returning. No worker outlives the call.

use rayon::prelude::*;
use rayon::ThreadPoolBuilder;

use crate::core::{Result, SVMError};

/// Fewer items than this per worker are not worth a fork.
pub const MIN_ITEMS_PER_THREAD: usize = 256;

/// Parallelism hint; callers self-correct for small workloads
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Parallelism {
    /// No forking
    #[default]
    Sequential,
    /// Up to `n` partitions
    Parallel(usize),
}

impl Parallelism {
    /// `0` uses rayon's current thread count, `1` is sequential
    pub fn from_threads(n_threads: usize) -> Self {
        match n_threads {
            0 => Self::Parallel(rayon::current_num_threads()),
            1 => Self::Sequential,
            n => Self::Parallel(n),
        }
    }

    pub fn n_threads(self) -> usize {
        match self {
            Self::Sequential => 1,
            Self::Parallel(n) => n.max(1),
        }
    }

    /// Downgrade to fewer partitions (or none) when the workload is small
    pub fn correct_for_workload(self, n_items: usize, min_items_per_thread: usize) -> Self {
        match self {
            Self::Sequential => Self::Sequential,
            Self::Parallel(n) => {
                let effective = n.min(n_items / min_items_per_thread.max(1)).max(1);
                if effective <= 1 {
                    Self::Sequential
                } else {
                    Self::Parallel(effective)
                }
            }
        }
    }

    /// Run `f(offset, chunk)` over a static partition of `out`
    ///
    /// `offset` is the position of `chunk[0]` inside `out`. Returns after
    /// every partition has completed.
    pub fn for_each_partition<T, F>(self, out: &mut [T], f: F)
    where
        T: Send,
        F: Fn(usize, &mut [T]) + Sync + Send,
    {
        match self.correct_for_workload(out.len(), MIN_ITEMS_PER_THREAD) {
            Self::Sequential => f(0, out),
            Self::Parallel(n) => {
                let chunk = out.len().div_ceil(n);
                out.par_chunks_mut(chunk)
                    .enumerate()
                    .for_each(|(k, part)| f(k * chunk, part));
            }
        }
    }
}

/// Run `f` inside a dedicated pool of `n_threads` workers
///
/// `0` runs on the global pool; `1` runs on the calling thread.
pub fn run_with_threads<R, F>(n_threads: usize, f: F) -> Result<R>
where
    R: Send,
    F: FnOnce(Parallelism) -> R + Send,
{
    match n_threads {
        0 => Ok(f(Parallelism::from_threads(0))),
        1 => Ok(f(Parallelism::Sequential)),
        n => {
            let pool = ThreadPoolBuilder::new()
                .num_threads(n)
                .build()
                .map_err(|e| SVMError::ThreadPool(e.to_string()))?;
            Ok(pool.install(|| f(Parallelism::Parallel(n))))
        }
    }
}
