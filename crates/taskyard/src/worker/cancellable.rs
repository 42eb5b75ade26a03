//! Cancellable worker bound to a single OS thread
//!
//! A [`CancellableWorker`] owns at most one live thread at a time. Stopping is
//! cooperative: the worker raises its [`CancellationToken`], unparks the thread,
//! and waits a bounded amount of time for the body to exit on its own.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, Thread, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::token::CancellationToken;
use crate::report;

/// Granularity of the termination poll in [`CancellableWorker::request_stop`]
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(10);

static NEXT_WORKER_NUMBER: AtomicU64 = AtomicU64::new(1);

/// Worker errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// A previous body is still executing on this worker
    #[error("worker '{0}' is already running")]
    AlreadyRunning(String),

    /// The OS refused to create a thread
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// The body panicked; surfaced by [`CancellableWorker::join`]
    #[error("worker body panicked: {0}")]
    Panicked(String),
}

/// Scheduling hint recorded on a worker
///
/// Rust threads carry no portable priority, so this is advisory only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPriority {
    Lowest,
    BelowNormal,
    #[default]
    Normal,
    AboveNormal,
    Highest,
}

/// Logical lifecycle state of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// No body is executing
    Idle,
    /// A body is executing and no stop was requested
    Running,
    /// Stop was requested; the thread may still be alive
    StopRequested,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::StopRequested => write!(f, "stop_requested"),
        }
    }
}

/// Result of [`CancellableWorker::request_stop`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Nothing was running, nothing was done
    NotRunning,
    /// The body observed the signal and the thread exited within the timeout
    Stopped,
    /// The timeout elapsed with the body still executing
    Unconfirmed,
}

/// Options used when creating a worker
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerOptions {
    /// Thread name (generated if not provided)
    pub name: Option<String>,

    /// Priority hint
    pub priority: WorkerPriority,

    /// Background hint
    ///
    /// Threads never keep the process alive in Rust; the flag is recorded for
    /// callers that mirror foreground/background bookkeeping.
    pub background: bool,
}

impl WorkerOptions {
    /// Create default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the thread name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the priority hint
    pub fn with_priority(mut self, priority: WorkerPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the background hint
    pub fn with_background(mut self, background: bool) -> Self {
        self.background = background;
        self
    }
}

struct Slot {
    state: WorkerState,
    alive: bool,
    handle: Option<JoinHandle<()>>,
    token: Option<CancellationToken>,
    thread: Option<Thread>,
    priority: WorkerPriority,
    background: bool,
}

struct Shared {
    name: String,
    slot: Mutex<Slot>,
    exited: Condvar,
}

/// Resets the slot when the body returns or unwinds
struct ExitGuard {
    shared: Arc<Shared>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let mut slot = self.shared.slot.lock();
        slot.alive = false;
        slot.state = WorkerState::Idle;
        slot.token = None;
        slot.thread = None;
        self.shared.exited.notify_all();
    }
}

/// A worker that runs one body at a time on its own thread
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use taskyard::worker::{CancellableWorker, StopOutcome, WorkerOptions};
///
/// let worker = CancellableWorker::new(WorkerOptions::new().with_name("ticker"));
///
/// worker
///     .start_with_cancellation(|token| {
///         while !token.is_cancelled() {
///             token.sleep(Duration::from_millis(5));
///         }
///     })
///     .unwrap();
///
/// assert!(worker.is_running());
/// assert_eq!(worker.request_stop(Duration::from_secs(1)), StopOutcome::Stopped);
/// assert!(!worker.is_running());
/// ```
pub struct CancellableWorker {
    shared: Arc<Shared>,
}

impl Default for CancellableWorker {
    fn default() -> Self {
        Self::new(WorkerOptions::default())
    }
}

impl fmt::Debug for CancellableWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.shared.slot.lock();
        f.debug_struct("CancellableWorker")
            .field("name", &self.shared.name)
            .field("state", &slot.state)
            .field("alive", &slot.alive)
            .field("priority", &slot.priority)
            .field("background", &slot.background)
            .finish()
    }
}

impl CancellableWorker {
    /// Create an idle worker
    pub fn new(options: WorkerOptions) -> Self {
        let name = options.name.unwrap_or_else(|| {
            format!("worker-{}", NEXT_WORKER_NUMBER.fetch_add(1, Ordering::Relaxed))
        });

        Self {
            shared: Arc::new(Shared {
                name,
                slot: Mutex::new(Slot {
                    state: WorkerState::Idle,
                    alive: false,
                    handle: None,
                    token: None,
                    thread: None,
                    priority: options.priority,
                    background: options.background,
                }),
                exited: Condvar::new(),
            }),
        }
    }

    /// Start `body` on a fresh thread
    ///
    /// The body receives no cancellation signal; [`request_stop`](Self::request_stop)
    /// can only unpark it.
    pub fn start<F>(&self, body: F) -> Result<(), WorkerError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.start_with_cancellation(move |_token| body())
    }

    /// Start `body` on a fresh thread, handing it the cancellation signal to poll
    pub fn start_with_cancellation<F>(&self, body: F) -> Result<(), WorkerError>
    where
        F: FnOnce(CancellationToken) + Send + 'static,
    {
        let mut slot = self.shared.slot.lock();
        if slot.alive {
            return Err(WorkerError::AlreadyRunning(self.shared.name.clone()));
        }

        // Reap the previous run; it has already released the slot
        if let Some(previous) = slot.handle.take() {
            if let Err(payload) = previous.join() {
                let message = panic_message(payload.as_ref());
                warn!(worker = %self.shared.name, panic = %message, "Previous worker run panicked");
                report::reporter().report_message(
                    &format!("previous worker run panicked: {message}"),
                    &self.shared.name,
                );
            }
        }

        let token = CancellationToken::new();
        let body_token = token.clone();
        let shared = Arc::clone(&self.shared);

        let handle = thread::Builder::new()
            .name(self.shared.name.clone())
            .spawn(move || {
                let _exit = ExitGuard { shared };
                body(body_token);
            })?;

        slot.thread = Some(handle.thread().clone());
        slot.handle = Some(handle);
        slot.token = Some(token);
        slot.alive = true;
        slot.state = WorkerState::Running;

        debug!(worker = %self.shared.name, "Worker started");
        Ok(())
    }

    /// Wait up to `timeout` for the current thread to terminate
    ///
    /// Returns `Ok(true)` if it terminated in time (or nothing was ever started)
    /// and `Ok(false)` on timeout. A body that panicked yields
    /// [`WorkerError::Panicked`] once.
    pub fn join(&self, timeout: Duration) -> Result<bool, WorkerError> {
        let deadline = deadline_after(timeout);
        let mut slot = self.shared.slot.lock();

        if !self.wait_while_alive(&mut slot, deadline) {
            return Ok(false);
        }

        let handle = slot.handle.take();
        drop(slot);

        if let Some(handle) = handle {
            if let Err(payload) = handle.join() {
                return Err(WorkerError::Panicked(panic_message(payload.as_ref())));
            }
        }

        Ok(true)
    }

    /// Ask the running body to stop and wait up to `timeout` for it to exit
    ///
    /// The worker is logically non-running as soon as this returns, even when
    /// the outcome is [`StopOutcome::Unconfirmed`]. In that case the thread may
    /// still be executing and [`is_alive`](Self::is_alive) keeps reporting it.
    pub fn request_stop(&self, timeout: Duration) -> StopOutcome {
        if !self.signal_stop() {
            return StopOutcome::NotRunning;
        }

        if self.wait_for_exit(timeout) {
            debug!(worker = %self.shared.name, "Worker stopped");
            StopOutcome::Stopped
        } else {
            warn!(
                worker = %self.shared.name,
                timeout_ms = timeout.as_millis() as u64,
                "Worker did not confirm stop within timeout"
            );
            StopOutcome::Unconfirmed
        }
    }

    /// Raise the signal and nudge the thread without waiting
    ///
    /// Returns `false` if the worker was not running.
    pub(crate) fn signal_stop(&self) -> bool {
        let mut slot = self.shared.slot.lock();
        if slot.state != WorkerState::Running {
            return false;
        }

        slot.state = WorkerState::StopRequested;
        if let Some(token) = &slot.token {
            token.cancel();
        }
        if let Some(thread) = &slot.thread {
            thread.unpark();
        }

        true
    }

    /// Poll in short increments until the thread exits or `timeout` elapses
    pub(crate) fn wait_for_exit(&self, timeout: Duration) -> bool {
        let deadline = deadline_after(timeout);
        let mut slot = self.shared.slot.lock();

        loop {
            if !slot.alive {
                return true;
            }

            let step = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    STOP_POLL_INTERVAL.min(deadline - now)
                }
                None => STOP_POLL_INTERVAL,
            };

            self.shared.exited.wait_for(&mut slot, step);
        }
    }

    fn wait_while_alive(&self, slot: &mut MutexGuard<'_, Slot>, deadline: Option<Instant>) -> bool {
        while slot.alive {
            match deadline {
                Some(deadline) => {
                    if self.shared.exited.wait_until(slot, deadline).timed_out() {
                        return !slot.alive;
                    }
                }
                None => self.shared.exited.wait(slot),
            }
        }
        true
    }

    /// Logical state
    pub fn state(&self) -> WorkerState {
        self.shared.slot.lock().state
    }

    /// True while a body runs and no stop was requested
    pub fn is_running(&self) -> bool {
        self.state() == WorkerState::Running
    }

    /// True while the underlying thread has not finished, regardless of stop requests
    pub fn is_alive(&self) -> bool {
        self.shared.slot.lock().alive
    }

    /// Identifier of the live thread, if any
    pub fn current_id(&self) -> Option<ThreadId> {
        self.shared.slot.lock().thread.as_ref().map(Thread::id)
    }

    /// Thread name used for every run of this worker
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Record a priority hint
    pub fn set_priority(&self, priority: WorkerPriority) {
        self.shared.slot.lock().priority = priority;
    }

    /// Recorded priority hint
    pub fn priority(&self) -> WorkerPriority {
        self.shared.slot.lock().priority
    }

    /// Record the background hint
    pub fn set_background(&self, background: bool) {
        self.shared.slot.lock().background = background;
    }

    /// Recorded background hint
    pub fn is_background(&self) -> bool {
        self.shared.slot.lock().background
    }
}

/// `None` means wait forever (the addition overflowed)
pub(crate) fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
