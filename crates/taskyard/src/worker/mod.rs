//! Thread workers with cooperative cancellation
//!
//! This module provides:
//! - [`CancellationToken`] - Shared stop signal with interruptible sleep
//! - [`CancellableWorker`] - One OS thread at a time, stoppable on request
//! - [`BoundedWorkerPool`] - FIFO queue drained by at most `max_workers` workers
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    BoundedWorkerPool                         │
//! │                                                              │
//! │  submit() ──► ┌──────────────────────────────┐               │
//! │               │   FIFO queue (pending work)  │               │
//! │               └──────────────┬───────────────┘               │
//! │                              │ admit while active < max      │
//! │                              ▼                               │
//! │  ┌────────────────────────────────────────────────────┐      │
//! │  │  Active set: CancellableWorker per item            │      │
//! │  │  [worker 1] [worker 2] ... [worker N]              │      │
//! │  └────────────────────────────────────────────────────┘      │
//! │          │ on exit (completion guard)                        │
//! │          └──► remove from active set, admit next item        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Cancellation is cooperative: stopping a worker raises its token and waits
//! for the body to observe it. Bodies that never check the token keep running.

mod cancellable;
mod pool;
mod token;

pub use cancellable::{
    CancellableWorker, StopOutcome, WorkerError, WorkerOptions, WorkerPriority, WorkerState,
};
pub use pool::{BoundedWorkerPool, PoolStats, PoolStopReport, WorkerPoolConfig, WorkerPoolError};
pub use token::CancellationToken;

pub(crate) use cancellable::panic_message;
