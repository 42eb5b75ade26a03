//! Concurrent batch processing
//!
//! Splits a sequence into fixed-size batches and runs several batches at a
//! time. Each batch is its own tokio task holding a semaphore permit, so
//! batches run in parallel on a multi-threaded runtime; items inside a batch
//! are processed one after another.

use std::future::Future;
use std::panic;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::available_parallelism;

/// Batcher configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatcherConfig {
    /// Items per batch (at least 1)
    pub batch_size: usize,

    /// Batches allowed to run at the same time (at least 1)
    pub max_concurrent_batches: usize,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_concurrent_batches: available_parallelism(),
        }
    }
}

impl BatcherConfig {
    /// Create a configuration, clamping both values to at least 1
    pub fn new(batch_size: usize, max_concurrent_batches: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            max_concurrent_batches: max_concurrent_batches.max(1),
        }
    }

    /// Set the batch size
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Set the number of simultaneous batches
    pub fn with_max_concurrent_batches(mut self, max: usize) -> Self {
        self.max_concurrent_batches = max.max(1);
        self
    }
}

/// Split `items` into consecutive batches of `batch_size` (the last may be shorter)
///
/// Concatenating the batches gives back the original sequence.
pub fn partition<T>(items: impl IntoIterator<Item = T>, batch_size: usize) -> Vec<Vec<T>> {
    let batch_size = batch_size.max(1);
    let mut batches = Vec::new();
    let mut current = Vec::with_capacity(batch_size);

    for item in items {
        current.push(item);
        if current.len() == batch_size {
            batches.push(std::mem::replace(&mut current, Vec::with_capacity(batch_size)));
        }
    }

    if !current.is_empty() {
        batches.push(current);
    }

    batches
}

/// Runs batches concurrently, items within a batch sequentially
///
/// Stateless between calls; one instance can serve many invocations.
///
/// # Example
///
/// ```
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// use taskyard::ConcurrentBatcher;
///
/// let batcher = ConcurrentBatcher::new(3, 2);
/// let batches = batcher
///     .process_batches(1..=7, |n| async move { Ok::<_, String>(n * 10) })
///     .await
///     .unwrap();
///
/// assert_eq!(batches, vec![vec![10, 20, 30], vec![40, 50, 60], vec![70]]);
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct ConcurrentBatcher {
    config: BatcherConfig,
}

impl ConcurrentBatcher {
    /// Create a batcher; both values are clamped to at least 1
    pub fn new(batch_size: usize, max_concurrent_batches: usize) -> Self {
        Self::from_config(BatcherConfig::new(batch_size, max_concurrent_batches))
    }

    /// Create a batcher from a configuration
    pub fn from_config(config: BatcherConfig) -> Self {
        Self {
            config: BatcherConfig::new(config.batch_size, config.max_concurrent_batches),
        }
    }

    /// Items per batch
    pub fn batch_size(&self) -> usize {
        self.config.batch_size
    }

    /// Batches allowed in flight
    pub fn max_concurrent_batches(&self) -> usize {
        self.config.max_concurrent_batches
    }

    /// Process every item and return the results grouped by batch, in input order
    ///
    /// Must be awaited inside a tokio runtime: each batch is spawned as a task.
    pub async fn process_batches<T, R, E, F, Fut>(
        &self,
        items: impl IntoIterator<Item = T>,
        per_item: F,
    ) -> Result<Vec<Vec<R>>, E>
    where
        T: Send + 'static,
        R: Send + 'static,
        E: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        self.process_batches_with(items, per_item, |_: &[R]| Ok(()))
            .await
    }

    /// Like [`process_batches`](Self::process_batches), invoking
    /// `on_batch_complete` with each batch's results once its items finish
    ///
    /// The first error from `per_item` or `on_batch_complete` is returned and
    /// the remaining batch tasks are aborted at their next suspension point.
    /// A panic inside a batch is resumed on the caller.
    pub async fn process_batches_with<T, R, E, F, Fut, C>(
        &self,
        items: impl IntoIterator<Item = T>,
        per_item: F,
        on_batch_complete: C,
    ) -> Result<Vec<Vec<R>>, E>
    where
        T: Send + 'static,
        R: Send + 'static,
        E: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        C: Fn(&[R]) -> Result<(), E> + Send + Sync + 'static,
    {
        let batches = partition(items, self.config.batch_size);
        let batch_count = batches.len();
        if batch_count == 0 {
            return Ok(Vec::new());
        }

        debug!(
            batch_count,
            batch_size = self.config.batch_size,
            max_concurrent_batches = self.config.max_concurrent_batches,
            "Processing batches"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_batches));
        let per_item = Arc::new(per_item);
        let on_batch_complete = Arc::new(on_batch_complete);
        let mut in_flight = JoinSet::new();

        for (index, batch) in batches.into_iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let per_item = Arc::clone(&per_item);
            let on_batch_complete = Arc::clone(&on_batch_complete);

            in_flight.spawn(async move {
                // Held until the batch finishes
                let _permit = semaphore.acquire_owned().await.ok();

                let mut results = Vec::with_capacity(batch.len());
                for item in batch {
                    results.push(per_item(item).await?);
                }

                on_batch_complete(&results)?;
                Ok::<_, E>((index, results))
            });
        }

        let mut ordered: Vec<Option<Vec<R>>> = (0..batch_count).map(|_| None).collect();
        while let Some(joined) = in_flight.join_next().await {
            match joined {
                Ok(Ok((index, results))) => ordered[index] = Some(results),
                Ok(Err(err)) => {
                    in_flight.abort_all();
                    return Err(err);
                }
                Err(join_error) if join_error.is_panic() => {
                    in_flight.abort_all();
                    panic::resume_unwind(join_error.into_panic());
                }
                Err(join_error) => {
                    warn!(error = %join_error, "Batch task cancelled before completing");
                }
            }
        }

        debug!(batch_count, "All batches completed");
        Ok(ordered.into_iter().flatten().collect())
    }

    /// Side-effect-only variant: process every item, keep no results
    pub async fn for_each_batch<T, E, F, Fut>(
        &self,
        items: impl IntoIterator<Item = T>,
        per_item: F,
    ) -> Result<(), E>
    where
        T: Send + 'static,
        E: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        self.process_batches(items, per_item).await.map(|_| ())
    }
}
