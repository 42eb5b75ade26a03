//! # Taskyard
//!
//! In-process concurrency coordination for a single host: cancellable thread
//! workers, a bounded worker pool, a timer scheduler, a concurrent batcher and
//! retry with exponential backoff.
//!
//! ## Features
//!
//! - **Cooperative cancellation**: workers observe a [`CancellationToken`] and exit voluntarily
//! - **Bounded admission**: a FIFO pool never runs more than `max_workers` items at once
//! - **Timers**: one-shot and repeating callbacks addressed by integer handles
//! - **Batching**: fixed-size batches run concurrently under a semaphore
//! - **Retries**: exponential backoff, blocking and async
//! - **Error sink**: fire-and-forget failures go to one process-wide [`report::ErrorReporter`]
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Caller                                 │
//! └──────┬──────────────────┬──────────────────┬────────────────┘
//!        │ submit           │ schedule         │ process / retry
//!        ▼                  ▼                  ▼
//! ┌──────────────┐  ┌──────────────────┐  ┌────────────────────┐
//! │ BoundedWorker│  │  TimerScheduler  │  │ ConcurrentBatcher  │
//! │     Pool     │  │ (tokio tasks)    │  │ RetryPolicy        │
//! └──┬────────┬──┘  └────────┬─────────┘  └────────────────────┘
//!    │        │ panics       │ panics
//!    ▼        ▼              ▼
//! ┌───────────┐ ┌─────────────────────────────┐
//! │Cancellable│ │   report::reporter()        │
//! │  Worker   │ │ (TracingReporter default)   │
//! └───────────┘ └─────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use std::time::Duration;
//! use taskyard::prelude::*;
//!
//! let pool = BoundedWorkerPool::with_max_workers(2);
//! for n in 0..4 {
//!     pool.submit(move || {
//!         let _ = n * 2;
//!     })
//!     .unwrap();
//! }
//! pool.wait_all(Duration::from_secs(5)).unwrap();
//!
//! let value = RetryPolicy::exponential()
//!     .with_initial_interval(Duration::from_millis(1))
//!     .execute(|| Ok::<_, String>(42))
//!     .unwrap();
//! assert_eq!(value, 42);
//! ```

pub mod batch;
pub mod config;
pub mod reliability;
pub mod report;
pub mod scheduler;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::batch::{BatcherConfig, ConcurrentBatcher};
    pub use crate::config::ToolkitConfig;
    pub use crate::reliability::{
        execute_with_retry, execute_with_retry_async, execute_with_retry_async_when,
        execute_with_retry_when, RetryPolicy,
    };
    pub use crate::reliability::{call_with_timeout, with_timeout, TimeoutError};
    pub use crate::report::{install_reporter, reporter, ErrorReporter};
    pub use crate::scheduler::{SchedulerError, TimerHandle, TimerScheduler};
    pub use crate::worker::{
        BoundedWorkerPool, CancellableWorker, CancellationToken, StopOutcome, WorkerError,
        WorkerOptions, WorkerPoolConfig, WorkerPoolError,
    };
}

// Re-export key types at crate root
pub use batch::{partition, BatcherConfig, ConcurrentBatcher};
pub use config::ToolkitConfig;
pub use reliability::{RetryPolicy, TimeoutError};
pub use scheduler::{SchedulerError, TimerHandle, TimerScheduler};
pub use worker::{
    BoundedWorkerPool, CancellableWorker, CancellationToken, StopOutcome, WorkerError,
    WorkerOptions, WorkerPoolConfig, WorkerPoolError,
};
