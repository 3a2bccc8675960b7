//! Delivery of the final run report.

use miette::Diagnostic;
use tracing::{error, info};

use crate::orchestrator::RunReport;

#[derive(Debug, thiserror::Error, Diagnostic)]
#[error("Could not deliver the run report: {message}")]
#[diagnostic(code(weir::notify::delivery))]
pub struct NotifyError {
    pub message: String,
}

/// Receives the report of every finished run.
///
/// Implementations deliver it wherever operators look, e.g. mail or chat.
/// A delivery failure is logged by the caller and never changes the outcome
/// of the run.
pub trait Notifier {
    fn notify(&self, job: &str, report: &RunReport) -> Result<(), NotifyError>;
}

/// Writes the report through `tracing`.
#[derive(Debug, Default)]
pub struct LoggingNotifier;

impl Notifier for LoggingNotifier {
    fn notify(&self, job: &str, report: &RunReport) -> Result<(), NotifyError> {
        if report.succeeded() {
            info!("📨 Report for job '{job}'\n{report}");
        } else {
            error!("📨 Report for job '{job}'\n{report}");
        }
        Ok(())
    }
}

/// Hands `report` to `notifier`, logging instead of failing when delivery
/// does not work out
pub fn deliver(notifier: &dyn Notifier, job: &str, report: &RunReport) {
    if let Err(err) = notifier.notify(job, report) {
        error!("{err}");
    }
}
