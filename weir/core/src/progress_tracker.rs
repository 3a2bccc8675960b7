use tracing::{info, instrument, warn};
use weir_schemas::ProgressEvent;

/// Receives progress events while the orchestrator works through a run.
///
/// Implement this trait to surface run progress somewhere other than the log,
/// for instance to collect events in a test or forward them to a scheduler.
///
/// # Examples
///
/// ```rust
/// use std::sync::Mutex;
/// use weir_core::progress_tracker::ProgressTracker;
/// use weir_schemas::ProgressEvent;
///
/// #[derive(Default)]
/// struct FailureCounter {
///     failures: Mutex<u32>,
/// }
///
/// impl ProgressTracker for FailureCounter {
///     fn on_progress(&self, event: ProgressEvent) {
///         if let ProgressEvent::TaskAttemptFailed { .. } = event {
///             *self.failures.lock().unwrap() += 1;
///         }
///     }
/// }
/// ```
pub trait ProgressTracker: Send + Sync {
    /// Called for every event, in the order the events happen
    fn on_progress(&self, event: ProgressEvent);
}

/// Logs progress events through `tracing`.
#[derive(Debug)]
pub struct LoggingProgressTracker;

impl ProgressTracker for LoggingProgressTracker {
    #[instrument(skip_all)]
    fn on_progress(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::RunStarted { tasks } => {
                info!("🚀 Run started ({tasks} tasks)");
            }
            ProgressEvent::TaskStarted { name, attempt } => {
                if attempt > 1 {
                    info!("🔁 Retrying task: {name} (attempt {attempt})");
                } else {
                    info!("⚙️  Running task: {name}");
                }
            }
            ProgressEvent::TaskAttemptFailed {
                name,
                attempt,
                max_attempts,
                error,
                will_retry,
            } => {
                warn!(
                    "⚠️  Task {name} failed (attempt {attempt}/{max_attempts}, retrying: {will_retry}): {error}"
                );
            }
            ProgressEvent::TaskSucceeded {
                name,
                attempts,
                duration_ms,
            } => {
                info!(
                    "✅ Completed task: {name} (attempts: {attempts}, took: {:.2}s)",
                    duration_ms as f64 / 1000.0
                );
            }
            ProgressEvent::TaskFailed {
                name,
                attempts,
                error,
            } => {
                warn!("❌ Task {name} failed after {attempts} attempts: {error}");
            }
            ProgressEvent::TaskSkipped { name, reason } => {
                info!("⏭️  Skipped task: {name} ({reason})");
            }
            ProgressEvent::RunCompleted {
                success,
                duration_ms,
            } => {
                let seconds = duration_ms as f64 / 1000.0;
                if success {
                    info!("🎉 Run completed (total time: {seconds:.2}s)");
                } else {
                    warn!("💥 Run failed (total time: {seconds:.2}s)");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_logging_tracker_logs_events() {
        let tracker = LoggingProgressTracker;

        tracker.on_progress(ProgressEvent::TaskStarted {
            name: "extract".into(),
            attempt: 2,
        });
        tracker.on_progress(ProgressEvent::TaskSkipped {
            name: "load".into(),
            reason: "disabled".into(),
        });

        assert!(logs_contain("Retrying task: extract (attempt 2)"));
        assert!(logs_contain("Skipped task: load (disabled)"));
    }
}
