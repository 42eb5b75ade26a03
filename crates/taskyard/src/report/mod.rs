//! Process-wide error reporting sink
//!
//! Fire-and-forget paths (pool work, timer callbacks) cannot return errors to
//! whoever submitted them. They hand failures to a single [`ErrorReporter`]
//! instead, which the embedding application may replace once at startup.
//!
//! # Architecture
//!
//! - [`ErrorReporter`]: the interface every internal component reports through
//! - [`TracingReporter`]: default, forwards to the `tracing` crate
//! - [`NoOpReporter`]: discards everything
//! - [`RecordingReporter`]: keeps reports in memory, for tests and diagnostics
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//! use taskyard::report::{self, NoOpReporter};
//!
//! // At process start, before any pool or scheduler is used
//! let _ = report::install_reporter(Arc::new(NoOpReporter));
//!
//! report::reporter().report_message("cache warmup skipped", "startup");
//! ```

mod noop;
mod recording;
mod reporter;
mod tracing_reporter;

use std::sync::{Arc, OnceLock};

pub use noop::NoOpReporter;
pub use recording::{RecordingReporter, Report};
pub use reporter::ErrorReporter;
pub use tracing_reporter::TracingReporter;

static REPORTER: OnceLock<Arc<dyn ErrorReporter>> = OnceLock::new();

/// Errors from installing a reporter
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReporterError {
    /// A reporter was installed already, or the default was put in place by a first use
    #[error("an error reporter is already installed")]
    AlreadyInstalled,
}

/// Install the process-wide reporter
///
/// Succeeds exactly once, and only before the first call to [`reporter`].
pub fn install_reporter(reporter: Arc<dyn ErrorReporter>) -> Result<(), ReporterError> {
    REPORTER
        .set(reporter)
        .map_err(|_| ReporterError::AlreadyInstalled)
}

/// The process-wide reporter; installs [`TracingReporter`] on first use if none was set
pub fn reporter() -> &'static dyn ErrorReporter {
    REPORTER
        .get_or_init(|| Arc::new(TracingReporter::new()))
        .as_ref()
}
