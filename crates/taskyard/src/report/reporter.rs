//! Error reporter trait definition

use std::error::Error;

/// Sink for failures that have no caller to propagate to
///
/// Implementations must be `Send + Sync`: reports arrive from worker threads
/// and runtime threads concurrently.
pub trait ErrorReporter: Send + Sync {
    /// Report an error raised while running `context`
    fn report_error(&self, error: &(dyn Error + 'static), context: &str);

    /// Report a free-form failure description
    fn report_message(&self, message: &str, context: &str);
}

/// Render an error and its `source()` chain as `outer: inner: root`
pub(crate) fn error_chain(error: &(dyn Error + 'static)) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}
