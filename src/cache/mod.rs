//! Kernel row cache
//!
//! Keeps full kernel rows `k(i, ·)` for recently used examples inside a fixed
//! memory budget. Rows are stored compactly over the currently cached columns,
//! so shrinking the active set frees room for more rows. Rows in use by the
//! running sub-step are locked and never evicted; eviction otherwise takes the
//! least recently touched row.

use std::mem::size_of;

use lru::LruCache;

use crate::kernel::KernelOracle;

struct CacheRow {
    values: Vec<f64>,
    last_touch: u64,
}

/// LRU cache of kernel rows with locking
pub struct KernelCache {
    rows: LruCache<usize, CacheRow>,
    locked: Vec<bool>,
    /// Example index -> position inside a cached row
    column_pos: Vec<Option<usize>>,
    /// Position inside a cached row -> example index
    columns: Vec<usize>,
    buffer_bytes: usize,
    max_rows: usize,
    time: u64,
    hits: u64,
    misses: u64,
    uncached: u64,
}

impl KernelCache {
    /// Create a cache over `num_examples` examples with a budget in bytes
    pub fn new(num_examples: usize, buffer_bytes: usize) -> Self {
        let mut cache = Self {
            rows: LruCache::unbounded(),
            locked: vec![false; num_examples],
            column_pos: Vec::new(),
            columns: Vec::new(),
            buffer_bytes,
            max_rows: 0,
            time: 0,
            hits: 0,
            misses: 0,
            uncached: 0,
        };
        cache.reset_columns();
        cache
    }

    /// Create a cache holding at most `rows` full rows
    pub fn with_row_capacity(num_examples: usize, rows: usize) -> Self {
        Self::new(num_examples, rows * num_examples * size_of::<f64>())
    }

    fn reset_columns(&mut self) {
        let n = self.locked.len();
        self.columns = (0..n).collect();
        self.column_pos = (0..n).map(Some).collect();
        self.max_rows = self.row_capacity();
    }

    fn row_capacity(&self) -> usize {
        if self.columns.is_empty() {
            return 0;
        }
        (self.buffer_bytes / (size_of::<f64>() * self.columns.len())).min(self.locked.len())
    }

    /// Set the clock used to stamp touched rows
    pub fn set_time(&mut self, time: u64) {
        self.time = time;
    }

    /// Whether row `i` is resident
    pub fn contains(&self, i: usize) -> bool {
        self.rows.contains(&i)
    }

    /// Mark row `i` as freshly used
    pub fn touch(&mut self, i: usize) {
        let time = self.time;
        if let Some(row) = self.rows.get_mut(&i) {
            row.last_touch = time;
        }
    }

    /// Iteration at which row `i` was last used
    pub fn last_touch(&self, i: usize) -> Option<u64> {
        self.rows.peek(&i).map(|row| row.last_touch)
    }

    /// Protect row `i` from eviction
    pub fn lock(&mut self, i: usize) {
        self.locked[i] = true;
    }

    pub fn unlock(&mut self, i: usize) {
        self.locked[i] = false;
    }

    pub fn unlock_all(&mut self) {
        self.locked.fill(false);
    }

    pub fn is_locked(&self, i: usize) -> bool {
        self.locked[i]
    }

    /// Whether another row fits without evicting
    pub fn space_available(&self) -> bool {
        self.rows.len() < self.max_rows
    }

    /// Number of resident rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Maximum number of resident rows under the current column count
    pub fn max_rows(&self) -> usize {
        self.max_rows
    }

    /// Number of columns stored per row
    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    /// Read a cached value without changing recency
    pub fn peek(&self, i: usize, j: usize) -> Option<f64> {
        let pos = self.column_pos[j]?;
        self.rows.peek(&i).map(|row| row.values[pos])
    }

    fn evict_one(&mut self) -> bool {
        let locked = &self.locked;
        let victim = self
            .rows
            .iter()
            .rev()
            .find(|(&k, _)| !locked[k])
            .map(|(&k, _)| k);
        match victim {
            Some(k) => {
                self.rows.pop(&k);
                true
            }
            None => false,
        }
    }

    /// Make row `i` resident, evicting if needed; false if no slot can be freed
    pub fn cache_row<K: KernelOracle + ?Sized>(&mut self, i: usize, kernel: &K) -> bool {
        if self.rows.contains(&i) {
            self.hits += 1;
            self.touch(i);
            return true;
        }
        self.misses += 1;
        if self.max_rows == 0 {
            return false;
        }
        while self.rows.len() >= self.max_rows {
            if !self.evict_one() {
                return false;
            }
        }

        let values = self
            .columns
            .iter()
            .map(|&j| self.peek(j, i).unwrap_or_else(|| kernel.evaluate(i, j)))
            .collect();
        self.rows.put(
            i,
            CacheRow {
                values,
                last_touch: self.time,
            },
        );
        true
    }

    /// Fill `out[t] = k(i, targets[t])`, caching row `i` when possible
    ///
    /// When every resident row is locked the values are computed directly and
    /// nothing is cached.
    pub fn fill_row<K: KernelOracle + ?Sized>(
        &mut self,
        i: usize,
        kernel: &K,
        targets: &[usize],
        out: &mut [f64],
    ) {
        if self.cache_row(i, kernel) {
            if let Some(row) = self.rows.peek(&i) {
                for (o, &j) in out.iter_mut().zip(targets) {
                    *o = match self.column_pos[j] {
                        Some(pos) => row.values[pos],
                        None => kernel.evaluate(i, j),
                    };
                }
                return;
            }
        }
        self.uncached += 1;
        for (o, &j) in out.iter_mut().zip(targets) {
            *o = kernel.evaluate(i, j);
        }
    }

    /// Full row `k(i, 0..n)`
    pub fn get_or_compute<K: KernelOracle + ?Sized>(&mut self, i: usize, kernel: &K) -> Vec<f64> {
        let targets: Vec<usize> = (0..self.locked.len()).collect();
        let mut row = vec![0.0; targets.len()];
        self.fill_row(i, kernel, &targets, &mut row);
        row
    }

    /// Drop rows and columns of inactive examples
    pub fn shrink(&mut self, active: &[bool]) {
        let locked = &self.locked;
        let stale: Vec<usize> = self
            .rows
            .iter()
            .map(|(&k, _)| k)
            .filter(|&k| !active[k] && !locked[k])
            .collect();
        for k in &stale {
            self.rows.pop(k);
        }

        let keep: Vec<usize> = (0..self.columns.len())
            .filter(|&pos| active[self.columns[pos]])
            .collect();
        if keep.len() == self.columns.len() {
            return;
        }
        for (_, row) in self.rows.iter_mut() {
            row.values = keep.iter().map(|&pos| row.values[pos]).collect();
        }
        self.columns = keep.iter().map(|&pos| self.columns[pos]).collect();
        self.column_pos.fill(None);
        for (pos, &j) in self.columns.iter().enumerate() {
            self.column_pos[j] = Some(pos);
        }
        self.max_rows = self.row_capacity();
        log::debug!(
            "Kernel cache shrunk to {} columns, room for {} rows ({} dropped)",
            self.columns.len(),
            self.max_rows,
            stale.len()
        );
    }

    /// Discard every row and restore all columns
    pub fn clear(&mut self) {
        self.rows.clear();
        self.reset_columns();
    }

    /// Get cache hit rate
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            uncached: self.uncached,
            capacity: self.max_rows,
            size: self.rows.len(),
        }
    }
}

/// Fill `out[t] = k(i, targets[t])` through the cache when there is one
pub fn fetch_row<K: KernelOracle + ?Sized>(
    cache: Option<&mut KernelCache>,
    kernel: &K,
    i: usize,
    targets: &[usize],
    out: &mut [f64],
) {
    match cache {
        Some(cache) => cache.fill_row(i, kernel, targets, out),
        None => {
            for (o, &j) in out.iter_mut().zip(targets) {
                *o = kernel.evaluate(i, j);
            }
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Rows served without caching because nothing could be evicted
    pub uncached: u64,
    pub capacity: usize,
    pub size: usize,
}
