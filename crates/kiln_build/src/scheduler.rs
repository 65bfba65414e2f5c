//! Bounded worker pool.

use std::sync::atomic::{AtomicBool, Ordering};

use rayon::prelude::*;

use crate::error::BuildError;

/// Outcome of one job submitted to [`WorkerPool::run`].
#[derive(Debug)]
pub enum JobResult<R, E> {
    /// The job ran.
    Done(Result<R, E>),
    /// The job was never started because the pool stopped after a failure.
    Skipped,
}

/// A fixed-size pool of build workers.
///
/// With `fail_fast`, the first failed job stops the pool: jobs already
/// running finish, jobs not yet started are skipped. A stopped pool stays
/// stopped for the rest of the pass.
pub struct WorkerPool {
    pool: rayon::ThreadPool,
    jobs: usize,
    fail_fast: bool,
    stop: AtomicBool,
}

impl WorkerPool {
    /// Creates a pool with `jobs` worker threads (at least one).
    pub fn new(jobs: usize, fail_fast: bool) -> Result<Self, BuildError> {
        let jobs = jobs.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(jobs)
            .thread_name(|i| format!("kiln-worker-{i}"))
            .build()
            .map_err(|e| BuildError::Pool {
                reason: e.to_string(),
            })?;
        Ok(Self {
            pool,
            jobs,
            fail_fast,
            stop: AtomicBool::new(false),
        })
    }

    /// Number of worker threads.
    pub fn jobs(&self) -> usize {
        self.jobs
    }

    /// Whether a failure stops the pool.
    pub fn fail_fast(&self) -> bool {
        self.fail_fast
    }

    /// Returns `true` once the pool has stopped accepting work.
    pub fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Stops the pool if it runs in fail-fast mode.
    pub fn note_failure(&self) {
        if self.fail_fast {
            self.stop.store(true, Ordering::SeqCst);
        }
    }

    /// Runs `job` on every item, in parallel. Results are in item order.
    pub fn run<T, R, E, F>(&self, items: &[T], job: F) -> Vec<JobResult<R, E>>
    where
        T: Sync,
        R: Send,
        E: Send,
        F: Fn(&T) -> Result<R, E> + Sync,
    {
        self.pool.install(|| {
            items
                .par_iter()
                .map(|item| {
                    if self.stopped() {
                        return JobResult::Skipped;
                    }
                    let result = job(item);
                    if result.is_err() {
                        self.note_failure();
                    }
                    JobResult::Done(result)
                })
                .collect()
        })
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("jobs", &self.jobs)
            .field("fail_fast", &self.fail_fast)
            .field("stopped", &self.stopped())
            .finish()
    }
}
