//! Static chunked fan-out of frame jobs over a fixed worker pool.

use rayon::prelude::*;
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("failed to build worker pool: {0}")]
    PoolBuild(#[from] rayon::ThreadPoolBuildError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SchedulerOptions {
    pub workers: usize,
    /// Chunk-size multiplier per worker.
    pub queue_per_worker: usize,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_per_worker: 1,
        }
    }
}

impl SchedulerOptions {
    /// `max(total / workers · queue_per_worker, 1)`.
    pub fn chunk_size(&self, total: usize) -> usize {
        (total / self.workers.max(1) * self.queue_per_worker).max(1)
    }
}

/// Runs a per-item job over contiguous chunks on a dedicated pool. There is
/// no cancellation: the first failing chunk fails the run, chunks already in
/// flight finish, and no further chunks start.
pub struct FrameScheduler {
    options: SchedulerOptions,
    pool: rayon::ThreadPool,
}

impl FrameScheduler {
    pub fn new(options: SchedulerOptions) -> Result<Self, SchedulerError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.workers.max(1))
            .thread_name(|i| format!("faceless-worker-{i}"))
            .build()?;
        Ok(Self { options, pool })
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    pub fn run<T, E, F>(&self, items: &[T], job: F) -> Result<(), E>
    where
        T: Sync,
        E: Send,
        F: Fn(&T) -> Result<(), E> + Sync,
    {
        if items.is_empty() {
            return Ok(());
        }
        let chunk_size = self.options.chunk_size(items.len());
        tracing::debug!(
            total = items.len(),
            chunk_size,
            workers = self.options.workers,
            "scheduling frames"
        );
        self.pool.install(|| {
            items
                .par_chunks(chunk_size)
                .try_for_each(|chunk| chunk.iter().try_for_each(&job))
        })
    }
}
