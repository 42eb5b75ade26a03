//! Bounded worker pool
//!
//! Admission gate with a concurrency ceiling. Each admitted item runs on a
//! freshly bound [`CancellableWorker`]; items beyond the ceiling wait in a FIFO
//! queue and are admitted, oldest first, as running items complete.

use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use super::cancellable::{
    deadline_after, panic_message, CancellableWorker, WorkerError, WorkerOptions,
};
use super::token::CancellationToken;
use crate::config::{available_parallelism, duration_millis};
use crate::report;

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    /// Maximum number of simultaneously active workers
    pub max_workers: usize,

    /// Sleep between checks in [`BoundedWorkerPool::wait_all`]
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Prefix for worker thread names (`<prefix>-<n>`)
    pub worker_name_prefix: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: available_parallelism(),
            poll_interval: Duration::from_millis(10),
            worker_name_prefix: "taskyard-pool".to_string(),
        }
    }
}

impl WorkerPoolConfig {
    /// Create a configuration sized to the host's logical core count
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the concurrency ceiling (at least 1)
    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.max_workers = max.max(1);
        self
    }

    /// Set the `wait_all` poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Set the worker thread name prefix
    pub fn with_worker_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.worker_name_prefix = prefix.into();
        self
    }
}

/// Point-in-time pool statistics
///
/// Advisory only: the fields are read together under the pool lock, but the
/// pool may change immediately afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Concurrency ceiling
    pub max_workers: usize,
    /// Workers currently executing
    pub active: usize,
    /// Items waiting for admission
    pub queued: usize,
    /// Workers created since the pool was built
    pub total_created: u64,
}

/// Summary of [`BoundedWorkerPool::stop_all`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStopReport {
    /// Queued items that were dropped without running
    pub discarded: usize,
    /// Active workers that exited within the timeout
    pub stopped: usize,
    /// Active workers still executing when the timeout elapsed
    pub unconfirmed: usize,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    /// `wait_all` gave up before the pool drained
    #[error("timed out after {waited:?} waiting for workers ({active} active, {queued} queued)")]
    Timeout {
        waited: Duration,
        active: usize,
        queued: usize,
    },

    /// Binding a worker failed
    #[error("worker error: {0}")]
    Worker(#[from] WorkerError),
}

type Job = Box<dyn FnOnce(CancellationToken) + Send + 'static>;

struct PoolState {
    queue: VecDeque<Job>,
    active: HashMap<u64, CancellableWorker>,
    next_id: u64,
    total_created: u64,
}

struct PoolShared {
    config: WorkerPoolConfig,
    state: Mutex<PoolState>,
}

/// Runs the admission chain when a worker's body returns or unwinds
struct CompletionGuard {
    pool: Weak<PoolShared>,
    id: u64,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if let Some(shared) = self.pool.upgrade() {
            PoolShared::complete(&shared, self.id);
        }
    }
}

impl PoolShared {
    /// Bind `job` to a new worker; the caller holds the state lock
    fn admit(shared: &Arc<Self>, state: &mut PoolState, job: Job) -> Result<(), WorkerError> {
        let id = state.next_id;
        state.next_id += 1;

        let name = format!("{}-{}", shared.config.worker_name_prefix, id);
        let worker = CancellableWorker::new(WorkerOptions::new().with_name(name.clone()));
        let pool = Arc::downgrade(shared);

        worker.start_with_cancellation(move |token| {
            let _completion = CompletionGuard { pool, id };
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| job(token))) {
                let message = format!("pool work panicked: {}", panic_message(payload.as_ref()));
                report::reporter().report_message(&message, &name);
                panic::resume_unwind(payload);
            }
        })?;

        state.active.insert(id, worker);
        state.total_created += 1;
        debug!(worker_id = id, active = state.active.len(), "Work admitted");
        Ok(())
    }

    /// Retire worker `id` and admit the oldest queued item
    fn complete(shared: &Arc<Self>, id: u64) {
        let mut state = shared.state.lock();

        // Workers detached by stop_all never trigger admission
        if state.active.remove(&id).is_none() {
            return;
        }

        while let Some(next) = state.queue.pop_front() {
            match Self::admit(shared, &mut state, next) {
                Ok(()) => break,
                Err(err) => {
                    error!(error = %err, "Failed to admit queued work");
                    report::reporter().report_error(&err, "bounded worker pool");
                }
            }
        }
    }
}

/// Thread-per-task pool with a hard concurrency ceiling
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use taskyard::worker::{BoundedWorkerPool, WorkerPoolConfig};
///
/// let pool = BoundedWorkerPool::new(WorkerPoolConfig::new().with_max_workers(2));
///
/// for i in 0..5 {
///     pool.submit(move || {
///         std::thread::sleep(Duration::from_millis(5));
///         let _ = i;
///     })
///     .unwrap();
/// }
///
/// pool.wait_all(Duration::from_secs(5)).unwrap();
/// assert_eq!(pool.stats().total_created, 5);
/// ```
pub struct BoundedWorkerPool {
    shared: Arc<PoolShared>,
}

impl Default for BoundedWorkerPool {
    fn default() -> Self {
        Self::new(WorkerPoolConfig::default())
    }
}

impl BoundedWorkerPool {
    /// Create a pool
    pub fn new(config: WorkerPoolConfig) -> Self {
        let config = WorkerPoolConfig {
            max_workers: config.max_workers.max(1),
            ..config
        };

        Self {
            shared: Arc::new(PoolShared {
                config,
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    active: HashMap::new(),
                    next_id: 1,
                    total_created: 0,
                }),
            }),
        }
    }

    /// Create a pool with the given ceiling and default settings otherwise
    pub fn with_max_workers(max_workers: usize) -> Self {
        Self::new(WorkerPoolConfig::default().with_max_workers(max_workers))
    }

    /// Submit work that ignores cancellation
    pub fn submit<F>(&self, work: F) -> Result<(), WorkerPoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit_cancellable(move |_token| work())
    }

    /// Submit work that polls the cancellation signal
    ///
    /// Runs immediately if the pool is below its ceiling, otherwise queues.
    /// Never blocks on other work.
    pub fn submit_cancellable<F>(&self, work: F) -> Result<(), WorkerPoolError>
    where
        F: FnOnce(CancellationToken) + Send + 'static,
    {
        let job: Job = Box::new(work);
        let mut state = self.shared.state.lock();

        if state.active.len() < self.shared.config.max_workers {
            PoolShared::admit(&self.shared, &mut state, job)?;
        } else {
            state.queue.push_back(job);
            debug!(queued = state.queue.len(), "Pool at capacity, work queued");
        }

        Ok(())
    }

    /// Block until no work is active or queued
    pub fn wait_all(&self, timeout: Duration) -> Result<(), WorkerPoolError> {
        let started = Instant::now();

        loop {
            let (active, queued) = self.counts();
            if active == 0 && queued == 0 {
                return Ok(());
            }

            let waited = started.elapsed();
            if waited >= timeout {
                return Err(WorkerPoolError::Timeout {
                    waited,
                    active,
                    queued,
                });
            }

            thread::sleep(self.shared.config.poll_interval.min(timeout - waited));
        }
    }

    /// Async variant of [`wait_all`](Self::wait_all); suspends instead of blocking
    pub async fn wait_all_async(&self, timeout: Duration) -> Result<(), WorkerPoolError> {
        let started = Instant::now();

        loop {
            let (active, queued) = self.counts();
            if active == 0 && queued == 0 {
                return Ok(());
            }

            let waited = started.elapsed();
            if waited >= timeout {
                return Err(WorkerPoolError::Timeout {
                    waited,
                    active,
                    queued,
                });
            }

            tokio::time::sleep(self.shared.config.poll_interval.min(timeout - waited)).await;
        }
    }

    /// Discard queued work and ask every active worker to stop
    ///
    /// Queue and active set are detached under the pool lock; the stop requests
    /// and the wait (one shared deadline) happen outside it so finishing
    /// workers are never blocked on the lock.
    #[instrument(skip(self))]
    pub fn stop_all(&self, timeout: Duration) -> PoolStopReport {
        let (discarded, workers) = {
            let mut state = self.shared.state.lock();
            let discarded = state.queue.len();
            state.queue.clear();
            let workers: Vec<CancellableWorker> =
                state.active.drain().map(|(_, worker)| worker).collect();
            (discarded, workers)
        };

        info!(
            discarded,
            active = workers.len(),
            "Stopping worker pool"
        );

        for worker in &workers {
            worker.signal_stop();
        }

        let deadline = deadline_after(timeout);
        let mut report = PoolStopReport {
            discarded,
            ..Default::default()
        };

        for worker in &workers {
            let remaining = deadline
                .map(|deadline| deadline.saturating_duration_since(Instant::now()))
                .unwrap_or(timeout);

            if worker.wait_for_exit(remaining) {
                report.stopped += 1;
            } else {
                report.unconfirmed += 1;
            }
        }

        if report.unconfirmed > 0 {
            warn!(
                unconfirmed = report.unconfirmed,
                "Some workers did not confirm stop within timeout"
            );
        }

        report
    }

    /// Snapshot of pool counters
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            max_workers: self.shared.config.max_workers,
            active: state.active.len(),
            queued: state.queue.len(),
            total_created: state.total_created,
        }
    }

    /// Concurrency ceiling
    pub fn max_workers(&self) -> usize {
        self.shared.config.max_workers
    }

    /// Pool configuration
    pub fn config(&self) -> &WorkerPoolConfig {
        &self.shared.config
    }

    fn counts(&self) -> (usize, usize) {
        let state = self.shared.state.lock();
        (state.active.len(), state.queue.len())
    }
}

impl Drop for BoundedWorkerPool {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.queue.clear();
        for (_, worker) in state.active.drain() {
            worker.signal_stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[test]
    fn test_default_config() {
        let config = WorkerPoolConfig::default();
        assert!(config.max_workers >= 1);
        assert_eq!(config.poll_interval, Duration::from_millis(10));
        assert_eq!(config.worker_name_prefix, "taskyard-pool");
    }

    #[test]
    fn test_config_builder_clamps() {
        let config = WorkerPoolConfig::new()
            .with_max_workers(0)
            .with_poll_interval(Duration::ZERO)
            .with_worker_name_prefix("io");

        assert_eq!(config.max_workers, 1);
        assert_eq!(config.poll_interval, Duration::from_millis(1));
        assert_eq!(config.worker_name_prefix, "io");
    }

    #[test]
    fn test_config_serialization() {
        let config = WorkerPoolConfig::new().with_max_workers(3);
        let json = serde_json::to_string(&config).unwrap();
        let parsed: WorkerPoolConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_submit_runs_work() {
        let pool = BoundedWorkerPool::with_max_workers(2);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let counter = counter.clone();
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.wait_all(Duration::from_secs(5)).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 10);

        let stats = pool.stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.total_created, 10);
        assert_eq!(stats.max_workers, 2);
    }

    #[test]
    fn test_work_beyond_ceiling_is_queued() {
        let pool = BoundedWorkerPool::with_max_workers(1);

        pool.submit_cancellable(|token| {
            token.sleep(Duration::from_secs(10));
        })
        .unwrap();
        pool.submit(|| {}).unwrap();
        pool.submit(|| {}).unwrap();

        let stats = pool.stats();
        assert_eq!(stats.active, 1);
        assert_eq!(stats.queued, 2);

        pool.stop_all(Duration::from_secs(5));
    }

    #[test]
    fn test_wait_all_times_out() {
        let pool = BoundedWorkerPool::with_max_workers(1);
        pool.submit_cancellable(|token| {
            token.sleep(Duration::from_secs(10));
        })
        .unwrap();

        let err = pool.wait_all(Duration::from_millis(30)).unwrap_err();
        match err {
            WorkerPoolError::Timeout { active, .. } => assert_eq!(active, 1),
            other => panic!("unexpected error: {other}"),
        }

        pool.stop_all(Duration::from_secs(5));
    }

    #[test]
    fn test_stop_all_discards_queue_and_stops_active() {
        let pool = BoundedWorkerPool::with_max_workers(2);
        let ran_queued = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            pool.submit_cancellable(|token| {
                token.sleep(Duration::from_secs(10));
            })
            .unwrap();
        }
        for _ in 0..3 {
            let ran_queued = ran_queued.clone();
            pool.submit(move || {
                ran_queued.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        let report = pool.stop_all(Duration::from_secs(5));

        assert_eq!(report.discarded, 3);
        assert_eq!(report.stopped, 2);
        assert_eq!(report.unconfirmed, 0);

        thread::sleep(Duration::from_millis(50));
        assert_eq!(ran_queued.load(Ordering::SeqCst), 0);
        assert_eq!(pool.stats().active, 0);
    }

    #[test]
    fn test_panicking_work_does_not_stall_queue() {
        let pool = BoundedWorkerPool::with_max_workers(1);
        let counter = Arc::new(AtomicUsize::new(0));

        pool.submit(|| panic!("work failed")).unwrap();
        for _ in 0..3 {
            let counter = counter.clone();
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.wait_all(Duration::from_secs(5)).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_pool_reusable_after_stop_all() {
        let pool = BoundedWorkerPool::with_max_workers(1);
        pool.stop_all(Duration::from_millis(10));

        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        pool.submit(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        pool.wait_all(Duration::from_secs(5)).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_all_reports_unconfirmed() {
        let pool = BoundedWorkerPool::with_max_workers(1);

        // Ignores its token, so the stop request cannot be honoured in time
        pool.submit(|| thread::sleep(Duration::from_millis(300)))
            .unwrap();

        let report = pool.stop_all(Duration::from_millis(20));

        assert_eq!(report.discarded, 0);
        assert_eq!(report.stopped, 0);
        assert_eq!(report.unconfirmed, 1);
        assert_eq!(pool.stats().active, 0);
    }

    #[test]
    fn test_drop_discards_queue_and_signals_without_blocking() {
        let pool = BoundedWorkerPool::with_max_workers(1);
        let observed_cancel = Arc::new(AtomicBool::new(false));
        let ran_queued = Arc::new(AtomicUsize::new(0));

        let observed = observed_cancel.clone();
        pool.submit_cancellable(move |token| {
            if token.sleep(Duration::from_secs(10)) {
                observed.store(true, Ordering::SeqCst);
            }
        })
        .unwrap();
        for _ in 0..3 {
            let ran_queued = ran_queued.clone();
            pool.submit(move || {
                ran_queued.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        assert_eq!(pool.stats().queued, 3);

        let started = Instant::now();
        drop(pool);
        assert!(started.elapsed() < Duration::from_secs(1));

        let deadline = Instant::now() + Duration::from_secs(5);
        while !observed_cancel.load(Ordering::SeqCst) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        assert!(observed_cancel.load(Ordering::SeqCst));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(ran_queued.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_wait_all_async() {
        let pool = BoundedWorkerPool::with_max_workers(2);
        for _ in 0..4 {
            pool.submit(|| thread::sleep(Duration::from_millis(10)))
                .unwrap();
        }

        pool.wait_all_async(Duration::from_secs(5)).await.unwrap();
        assert_eq!(pool.stats().total_created, 4);
    }
}
