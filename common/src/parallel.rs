//! Fixed-size worker pools.
//!
//! Each parallel stage spins up `worker_count` workers on a dedicated rayon pool
//! and lets them pull work units from a shared [`WorkCounter`]. Running with a
//! single worker executes inline on the calling thread.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Number of workers for a stage: one per physical core, or one when
/// disabled.
///
/// Falls back to the logical CPU count when the physical count is unknown.
pub fn worker_count(enable_multi_thread: bool) -> usize {
    if enable_multi_thread {
        physical_cores()
    } else {
        1
    }
}

fn physical_cores() -> usize {
    static CORES: OnceLock<usize> = OnceLock::new();
    *CORES.get_or_init(|| {
        sysinfo::System::new()
            .physical_core_count()
            .unwrap_or_else(rayon::current_num_threads)
            .max(1)
    })
}

/// Runs `f(worker_index)` once on each of `workers` threads.
///
/// Results are returned in worker-index order.
///
/// # Panics
///
/// Panics if `workers` is 0.
pub fn broadcast_workers<R, F>(workers: usize, f: F) -> Result<Vec<R>, rayon::ThreadPoolBuildError>
where
    R: Send,
    F: Fn(usize) -> R + Sync,
{
    assert!(workers > 0, "workers must be > 0");

    if workers == 1 {
        return Ok(vec![f(0)]);
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|idx| format!("tiepoints-worker-{idx}"))
        .build()?;

    Ok(pool.broadcast(|ctx| f(ctx.index())))
}

/// Hands out unit indices `0..total` exactly once across workers.
#[derive(Debug)]
pub struct WorkCounter {
    next: AtomicUsize,
    total: usize,
}

impl WorkCounter {
    pub fn new(total: usize) -> Self {
        Self {
            next: AtomicUsize::new(0),
            total,
        }
    }

    /// Next unit to process, or `None` when exhausted.
    pub fn next_unit(&self) -> Option<usize> {
        let unit = self.next.fetch_add(1, Ordering::AcqRel);
        (unit < self.total).then_some(unit)
    }
}
