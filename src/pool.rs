//! Worker pool for bulk per-file work.
//!
//! Work items are independent; results are written back by slot index, so
//! output order always matches input order regardless of completion order.

use std::sync::Arc;

use tokio::runtime::{Builder, Runtime};
use tokio::task::JoinSet;

use crate::error::{Error, Result};

/// Worker count for a scaling factor applied to the available CPUs.
pub fn num_threads(scaling: f32) -> usize {
    let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
    let scaled = (cpus as f32 * scaling).round() as usize;
    scaled.max(1)
}

/// A fixed-size pool of blocking worker threads.
#[derive(Debug)]
pub struct WorkerPool {
    runtime: Runtime,
    threads: usize,
}

impl WorkerPool {
    /// Start a pool with `threads` workers.
    pub fn new(threads: usize) -> Result<Self> {
        let threads = threads.max(1);
        let runtime = Builder::new_multi_thread()
            .worker_threads(threads)
            .max_blocking_threads(threads)
            .thread_name("swupd-worker")
            .build()
            .map_err(|e| Error::Worker(format!("failed to start {threads} workers: {e}")))?;
        Ok(Self { runtime, threads })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Run `f` over every item, returning results in input order.
    pub fn map<T, R, F>(&self, items: Vec<T>, f: F) -> Result<Vec<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> R + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let count = items.len();
        self.runtime.block_on(async move {
            let mut set = JoinSet::new();
            for (slot, item) in items.into_iter().enumerate() {
                let f = Arc::clone(&f);
                set.spawn_blocking(move || (slot, f(item)));
            }

            let mut results: Vec<Option<R>> = std::iter::repeat_with(|| None).take(count).collect();
            while let Some(joined) = set.join_next().await {
                let (slot, result) = joined.map_err(|e| Error::Worker(e.to_string()))?;
                results[slot] = Some(result);
            }
            results
                .into_iter()
                .map(|r| r.ok_or_else(|| Error::Worker("worker result missing".to_string())))
                .collect::<Result<Vec<R>>>()
        })
    }

    /// Like [`map`](Self::map) for fallible work; the first error wins.
    pub fn try_map<T, R, F>(&self, items: Vec<T>, f: F) -> Result<Vec<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> Result<R> + Send + Sync + 'static,
    {
        self.map(items, f)?.into_iter().collect()
    }
}
