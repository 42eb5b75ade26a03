//! Passive timeouts
//!
//! Both helpers bound how long the caller waits. Neither aborts the work: on
//! timeout it keeps running in the background and its result is discarded.

use std::future::Future;
use std::panic;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use tracing::debug;

/// Timeout-related errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimeoutError {
    /// The caller stopped waiting; the work may still be running
    #[error("operation did not complete within {0:?}")]
    Elapsed(Duration),

    /// The work was cancelled before it produced a result (runtime shutdown)
    #[error("operation was cancelled before completing")]
    Cancelled,

    /// The thread for a blocking call could not be spawned
    #[error("failed to spawn thread for timed call: {0}")]
    Spawn(String),
}

/// Wait at most `timeout` for `future`, which runs as its own tokio task
///
/// A panic inside the future is resumed on the caller.
///
/// # Example
///
/// ```
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// use std::time::Duration;
/// use taskyard::reliability::{with_timeout, TimeoutError};
///
/// let fast = with_timeout(async { 7 }, Duration::from_secs(1)).await;
/// assert_eq!(fast, Ok(7));
///
/// let slow = with_timeout(
///     tokio::time::sleep(Duration::from_secs(60)),
///     Duration::from_millis(5),
/// )
/// .await;
/// assert_eq!(slow, Err(TimeoutError::Elapsed(Duration::from_millis(5))));
/// # }
/// ```
pub async fn with_timeout<F>(future: F, timeout: Duration) -> Result<F::Output, TimeoutError>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let mut task = tokio::spawn(future);

    match tokio::time::timeout(timeout, &mut task).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(join_error)) => {
            if join_error.is_panic() {
                panic::resume_unwind(join_error.into_panic());
            }
            Err(TimeoutError::Cancelled)
        }
        Err(_) => {
            debug!(
                timeout_ms = timeout.as_millis() as u64,
                "Timed out waiting; task continues in background"
            );
            Err(TimeoutError::Elapsed(timeout))
        }
    }
}

/// Run blocking `work` on a new thread and wait at most `timeout` for its result
///
/// A panic inside `work` is resumed on the caller.
pub fn call_with_timeout<T, F>(work: F, timeout: Duration) -> Result<T, TimeoutError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel(1);

    let handle = thread::Builder::new()
        .name("taskyard-timed-call".to_string())
        .spawn(move || {
            // The receiver may be gone after a timeout
            let _ = tx.send(work());
        })
        .map_err(|e| TimeoutError::Spawn(e.to_string()))?;

    match rx.recv_timeout(timeout) {
        Ok(value) => Ok(value),
        Err(RecvTimeoutError::Timeout) => {
            debug!(
                timeout_ms = timeout.as_millis() as u64,
                "Timed out waiting; thread continues in background"
            );
            Err(TimeoutError::Elapsed(timeout))
        }
        Err(RecvTimeoutError::Disconnected) => match handle.join() {
            Err(payload) => panic::resume_unwind(payload),
            Ok(()) => Err(TimeoutError::Cancelled),
        },
    }
}
