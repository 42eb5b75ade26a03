//! In-memory reporter

use std::error::Error;

use parking_lot::Mutex;

use super::reporter::{error_chain, ErrorReporter};

/// One captured report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    /// Rendered error chain or message
    pub message: String,
    /// Context label supplied by the reporting component
    pub context: String,
}

/// Reporter that keeps every report in memory
///
/// # Example
///
/// ```
/// use taskyard::report::{ErrorReporter, RecordingReporter};
///
/// let reporter = RecordingReporter::new();
/// reporter.report_message("flush skipped", "exporter");
///
/// let reports = reporter.reports();
/// assert_eq!(reports[0].context, "exporter");
/// ```
#[derive(Debug, Default)]
pub struct RecordingReporter {
    reports: Mutex<Vec<Report>>,
}

impl RecordingReporter {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything reported so far
    pub fn reports(&self) -> Vec<Report> {
        self.reports.lock().clone()
    }

    /// Number of reports so far
    pub fn len(&self) -> usize {
        self.reports.lock().len()
    }

    /// True if nothing was reported
    pub fn is_empty(&self) -> bool {
        self.reports.lock().is_empty()
    }

    /// Drop all captured reports
    pub fn clear(&self) {
        self.reports.lock().clear();
    }

    fn push(&self, message: String, context: &str) {
        self.reports.lock().push(Report {
            message,
            context: context.to_string(),
        });
    }
}

impl ErrorReporter for RecordingReporter {
    fn report_error(&self, error: &(dyn Error + 'static), context: &str) {
        self.push(error_chain(error), context);
    }

    fn report_message(&self, message: &str, context: &str) {
        self.push(message.to_string(), context);
    }
}
