//! Tracing adapter

use std::error::Error;

use super::reporter::{error_chain, ErrorReporter};

/// Reporter that writes through `tracing`
///
/// Output ends up wherever the application's subscriber sends it (usually the
/// console). Nothing is printed if no subscriber is installed.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl TracingReporter {
    /// Create a new tracing reporter
    pub fn new() -> Self {
        Self
    }
}

impl ErrorReporter for TracingReporter {
    fn report_error(&self, error: &(dyn Error + 'static), context: &str) {
        tracing::error!(context, error = %error_chain(error), "Unhandled error");
    }

    fn report_message(&self, message: &str, context: &str) {
        tracing::warn!(context, "{}", message);
    }
}
