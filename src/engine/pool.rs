// src/engine/pool.rs
//
// Global thread pool for batch compression.
//
// One lazily-built pool is shared by every batch; creating a pool per call
// costs far more than the work it schedules for small batches. Changes to
// the environment after the first batch have no effect.

use rayon::ThreadPool;
use std::sync::OnceLock;

/// Maximum allowed concurrency value for `BatchOptions`
pub const MAX_CONCURRENCY: usize = 1024;

/// Minimum number of rayon threads to ensure at least some parallelism
const MIN_RAYON_THREADS: usize = 1;

static GLOBAL_THREAD_POOL: OnceLock<Option<ThreadPool>> = OnceLock::new();

/// Shared batch pool, or `None` if the OS refused to spawn threads (callers
/// then fall back to rayon's global pool).
pub fn get_pool() -> Option<&'static ThreadPool> {
    GLOBAL_THREAD_POOL
        .get_or_init(|| {
            let num_threads = detected_parallelism();
            match rayon::ThreadPoolBuilder::new()
                .num_threads(num_threads)
                .thread_name(|i| format!("squeeze-image-{i}"))
                .build()
            {
                Ok(pool) => Some(pool),
                Err(e) => {
                    tracing::warn!(num_threads, error = %e, "failed to build batch thread pool");
                    None
                }
            }
        })
        .as_ref()
}

/// CPU parallelism honoring cgroup quotas.
pub fn detected_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(MIN_RAYON_THREADS)
        .max(MIN_RAYON_THREADS)
}

/// Resolve a requested concurrency: 0 means auto, values are capped at
/// `MAX_CONCURRENCY`.
pub fn effective_concurrency(requested: usize) -> usize {
    match requested {
        0 => detected_parallelism(),
        n => n.min(MAX_CONCURRENCY),
    }
}
