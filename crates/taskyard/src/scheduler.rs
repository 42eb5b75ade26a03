//! Timer scheduler
//!
//! Maps integer handles to one-shot and repeating timers. Each timer is a
//! tokio task; callbacks run on the runtime's blocking pool so slow or
//! blocking callbacks never stall the timer wheel.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::report;
use crate::worker::panic_message;

/// Scheduler errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    /// The scheduler was disposed
    #[error("timer scheduler has been disposed")]
    Disposed,

    /// No tokio runtime is available to drive timers
    #[error("no tokio runtime available to drive timers")]
    NoRuntime,

    /// Repeating timers need a non-zero interval
    #[error("repeating timer interval must be greater than zero")]
    ZeroInterval,
}

/// Opaque identifier of a scheduled timer
///
/// Handles are never reused by the scheduler that issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

impl TimerHandle {
    /// Raw handle value
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

struct TimerTable {
    entries: HashMap<TimerHandle, JoinHandle<()>>,
    next_handle: u64,
    disposed: bool,
}

struct SchedulerInner {
    timers: Mutex<TimerTable>,
}

impl SchedulerInner {
    fn remove(&self, handle: TimerHandle) {
        self.timers.lock().entries.remove(&handle);
    }
}

/// Schedules callbacks after a delay, once or at a fixed interval
///
/// # Example
///
/// ```
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
/// use std::time::Duration;
/// use taskyard::TimerScheduler;
///
/// let scheduler = TimerScheduler::new().unwrap();
/// let fired = Arc::new(AtomicUsize::new(0));
///
/// let counter = fired.clone();
/// let handle = scheduler
///     .schedule_once(
///         move || {
///             counter.fetch_add(1, Ordering::SeqCst);
///         },
///         Duration::from_millis(5),
///     )
///     .unwrap();
///
/// tokio::time::sleep(Duration::from_millis(100)).await;
/// assert_eq!(fired.load(Ordering::SeqCst), 1);
/// assert!(!scheduler.cancel(handle));
/// # }
/// ```
pub struct TimerScheduler {
    runtime: Handle,
    inner: Arc<SchedulerInner>,
}

impl TimerScheduler {
    /// Create a scheduler driven by the current tokio runtime
    pub fn new() -> Result<Self, SchedulerError> {
        let runtime = Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;
        Ok(Self::with_handle(runtime))
    }

    /// Create a scheduler driven by an explicit runtime
    pub fn with_handle(runtime: Handle) -> Self {
        Self {
            runtime,
            inner: Arc::new(SchedulerInner {
                timers: Mutex::new(TimerTable {
                    entries: HashMap::new(),
                    next_handle: 1,
                    disposed: false,
                }),
            }),
        }
    }

    /// Fire `action` once after `delay`; the entry removes itself afterwards
    pub fn schedule_once<F>(&self, action: F, delay: Duration) -> Result<TimerHandle, SchedulerError>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = self.spawn_timer(|handle, inner| async move {
            tokio::time::sleep(delay).await;
            let outcome = tokio::task::spawn_blocking(action).await;

            if let Some(inner) = inner.upgrade() {
                inner.remove(handle);
            }
            if let Err(e) = outcome {
                report_callback_failure(handle, e);
            }
        })?;

        debug!(%handle, delay_ms = delay.as_millis() as u64, "Scheduled one-shot timer");
        Ok(handle)
    }

    /// Fire `action` every `interval` until cancelled
    pub fn schedule_repeating<F>(
        &self,
        action: F,
        interval: Duration,
    ) -> Result<TimerHandle, SchedulerError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.schedule_with_delay(action, interval, interval)
    }

    /// Fire `action` first after `delay`, then every `interval` until cancelled
    ///
    /// Firings never overlap: the next tick is measured after the previous
    /// callback returns if it overran the interval. A panicking callback stops
    /// the timer.
    pub fn schedule_with_delay<F>(
        &self,
        action: F,
        delay: Duration,
        interval: Duration,
    ) -> Result<TimerHandle, SchedulerError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        if interval.is_zero() {
            return Err(SchedulerError::ZeroInterval);
        }

        let action = Arc::new(action);
        let handle = self.spawn_timer(|handle, inner| async move {
            let start = Instant::now().checked_add(delay).unwrap_or_else(far_future);
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                let action = action.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || action()).await {
                    if let Some(inner) = inner.upgrade() {
                        inner.remove(handle);
                    }
                    report_callback_failure(handle, e);
                    break;
                }
            }
        })?;

        debug!(
            %handle,
            delay_ms = delay.as_millis() as u64,
            interval_ms = interval.as_millis() as u64,
            "Scheduled repeating timer"
        );
        Ok(handle)
    }

    /// Cancel a timer; returns whether it was still scheduled
    ///
    /// A callback already running finishes; no further firings happen.
    pub fn cancel(&self, handle: TimerHandle) -> bool {
        let removed = self.inner.timers.lock().entries.remove(&handle);
        match removed {
            Some(task) => {
                task.abort();
                debug!(%handle, "Cancelled timer");
                true
            }
            None => false,
        }
    }

    /// Cancel every outstanding timer, returning how many were cancelled
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<_> = self.inner.timers.lock().entries.drain().collect();
        let count = drained.len();
        for (_, task) in drained {
            task.abort();
        }
        if count > 0 {
            debug!(count, "Cancelled all timers");
        }
        count
    }

    /// Whether `handle` is still scheduled
    pub fn is_scheduled(&self, handle: TimerHandle) -> bool {
        self.inner.timers.lock().entries.contains_key(&handle)
    }

    /// Number of outstanding timers
    pub fn len(&self) -> usize {
        self.inner.timers.lock().entries.len()
    }

    /// Whether no timers are outstanding
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether [`dispose`](Self::dispose) has been called
    pub fn is_disposed(&self) -> bool {
        self.inner.timers.lock().disposed
    }

    /// Cancel all timers and refuse further scheduling; safe to call repeatedly
    pub fn dispose(&self) {
        let drained: Vec<_> = {
            let mut table = self.inner.timers.lock();
            if table.disposed {
                return;
            }
            table.disposed = true;
            table.entries.drain().collect()
        };

        let count = drained.len();
        for (_, task) in drained {
            task.abort();
        }
        info!(cancelled = count, "Timer scheduler disposed");
    }

    /// Allocate a handle and spawn the timer task under the table lock, so a
    /// task that finishes immediately still finds its own entry to remove
    fn spawn_timer<Fut>(
        &self,
        make_task: impl FnOnce(TimerHandle, Weak<SchedulerInner>) -> Fut,
    ) -> Result<TimerHandle, SchedulerError>
    where
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut table = self.inner.timers.lock();
        if table.disposed {
            return Err(SchedulerError::Disposed);
        }

        let handle = TimerHandle(table.next_handle);
        table.next_handle += 1;

        let task = self
            .runtime
            .spawn(make_task(handle, Arc::downgrade(&self.inner)));
        table.entries.insert(handle, task);
        Ok(handle)
    }
}

impl fmt::Debug for TimerScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.inner.timers.lock();
        f.debug_struct("TimerScheduler")
            .field("timers", &table.entries.len())
            .field("next_handle", &table.next_handle)
            .field("disposed", &table.disposed)
            .finish()
    }
}

impl Drop for TimerScheduler {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Stand-in for first-fire instants too far out to represent (about 30 years)
fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400 * 365 * 30)
}

fn report_callback_failure(handle: TimerHandle, error: JoinError) {
    if error.is_panic() {
        let message = format!(
            "timer callback panicked: {}",
            panic_message(error.into_panic().as_ref())
        );
        report::reporter().report_message(&message, &handle.to_string());
    } else {
        debug!(%handle, "Timer callback cancelled by runtime shutdown");
    }
}
