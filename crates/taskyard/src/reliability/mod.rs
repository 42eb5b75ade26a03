//! Reliability patterns
//!
//! This module provides:
//! - [`RetryPolicy`] - Retry with exponential backoff, blocking and async
//! - [`with_timeout`] / [`call_with_timeout`] - Passive timeouts that bound the
//!   caller's wait without aborting the work

mod retry;
mod timeout;

pub use retry::{
    execute_with_retry, execute_with_retry_async, execute_with_retry_async_when,
    execute_with_retry_when, RetryPolicy,
};
pub use timeout::{call_with_timeout, with_timeout, TimeoutError};
