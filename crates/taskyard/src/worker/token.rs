//! Cooperative cancellation signal shared between a worker's owner and its body

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct TokenInner {
    cancelled: AtomicBool,
    /// Guards the condvar; the flag itself lives in `cancelled`
    lock: Mutex<()>,
    wake: Condvar,
    notify: Notify,
}

/// Cancellation signal passed to cancellable work
///
/// Cancellation is cooperative: raising the signal never stops a body by
/// force. The body polls [`is_cancelled`](Self::is_cancelled), or blocks in
/// [`sleep`](Self::sleep) / [`cancelled`](Self::cancelled), which wake up as
/// soon as the signal is raised.
///
/// Clones share the same underlying signal.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use taskyard::CancellationToken;
///
/// let token = CancellationToken::new();
/// let body_token = token.clone();
///
/// let handle = std::thread::spawn(move || {
///     let mut ticks = 0;
///     while !body_token.is_cancelled() {
///         ticks += 1;
///         body_token.sleep(Duration::from_millis(5));
///     }
///     ticks
/// });
///
/// std::thread::sleep(Duration::from_millis(20));
/// token.cancel();
/// assert!(handle.join().unwrap() > 0);
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl CancellationToken {
    /// Create a new, un-cancelled token
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal and wake every sleeper
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }

        // Take the lock so a sleeper between its check and its wait cannot miss the wakeup
        drop(self.inner.lock.lock());
        self.inner.wake.notify_all();
        self.inner.notify.notify_waiters();
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Block the calling thread for up to `duration`, returning early on cancellation
    ///
    /// Returns `true` if the token was cancelled (before or during the sleep).
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now().checked_add(duration);
        let mut guard = self.inner.lock.lock();

        while !self.is_cancelled() {
            match deadline {
                Some(deadline) => {
                    if self.inner.wake.wait_until(&mut guard, deadline).timed_out() {
                        return self.is_cancelled();
                    }
                }
                None => self.inner.wake.wait(&mut guard),
            }
        }

        true
    }

    /// Resolve once cancellation is requested
    ///
    /// Useful inside `tokio::select!` from async bodies.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}
