//! No-operation reporter

use std::error::Error;

use super::reporter::ErrorReporter;

/// A reporter that discards every report
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpReporter;

impl ErrorReporter for NoOpReporter {
    #[inline]
    fn report_error(&self, _error: &(dyn Error + 'static), _context: &str) {}

    #[inline]
    fn report_message(&self, _message: &str, _context: &str) {}
}
