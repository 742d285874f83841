// src/engine/pool.rs
//
// Global thread pool for transcode workers.
//
// A single global pool is shared by every Scheduler instance instead of
// creating a pool per batch:
//
// 1. Zero allocation overhead per batch
// 2. Threads are reused across operations
// 3. Predictable thread count based on CPU cores
//
// Thread count:
// - std::thread::available_parallelism() respects cgroup/CPU quota
// - BATCHPRESS_THREADS overrides detection when set
// - Fallback is MIN_POOL_THREADS when detection fails
//
// The pool is initialized lazily on first use; changes to the environment
// after initialization have no effect.

use rayon::ThreadPool;
use std::sync::OnceLock;

/// Minimum number of pool threads to ensure at least some parallelism
const MIN_POOL_THREADS: usize = 1;

static GLOBAL_THREAD_POOL: OnceLock<ThreadPool> = OnceLock::new();

pub fn get_pool() -> &'static ThreadPool {
    GLOBAL_THREAD_POOL.get_or_init(|| {
        let num_threads = configured_threads().unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(MIN_POOL_THREADS)
        });

        rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads.max(MIN_POOL_THREADS))
            .thread_name(|i| format!("batchpress-worker-{i}"))
            .build()
            .unwrap_or_else(|e| {
                // Fallback: minimal pool if the preferred configuration fails
                rayon::ThreadPoolBuilder::new()
                    .num_threads(MIN_POOL_THREADS)
                    .build()
                    .unwrap_or_else(|fallback_err| {
                        panic!(
                            "failed to create fallback thread pool ({MIN_POOL_THREADS} threads) \
                             after {e}: {fallback_err}"
                        )
                    })
            })
    })
}

fn configured_threads() -> Option<usize> {
    std::env::var("BATCHPRESS_THREADS")
        .ok()
        .and_then(|raw| raw.parse::<usize>().ok())
        .filter(|&n| n > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_is_shared_and_nonempty() {
        let a = get_pool() as *const ThreadPool;
        let b = get_pool() as *const ThreadPool;
        assert_eq!(a, b);
        assert!(get_pool().current_num_threads() >= MIN_POOL_THREADS);
    }
}
