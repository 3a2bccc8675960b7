//! Progress event types for tracking a run

use serde::{Deserialize, Serialize};

/// Progress events emitted while the orchestrator works through a task list
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// Run started
    RunStarted {
        /// Number of tasks in the list
        tasks: usize,
    },
    /// An attempt of a task is about to start
    TaskStarted {
        /// Name of the task
        name: String,
        /// 1-based attempt number
        attempt: u32,
    },
    /// An attempt of a task failed
    TaskAttemptFailed {
        /// Name of the task
        name: String,
        /// 1-based attempt number
        attempt: u32,
        /// Total attempts the task is allowed
        max_attempts: u32,
        /// Rendered error of the attempt
        error: String,
        /// Whether another attempt follows
        will_retry: bool,
    },
    /// A task succeeded
    TaskSucceeded {
        /// Name of the task
        name: String,
        /// Attempts it took
        attempts: u32,
        /// Duration across all attempts
        duration_ms: u64,
    },
    /// A task exhausted its attempts
    TaskFailed {
        /// Name of the task
        name: String,
        /// Attempts made
        attempts: u32,
        /// Rendered last error
        error: String,
    },
    /// A task was not executed
    TaskSkipped {
        /// Name of the task
        name: String,
        /// Why it was skipped
        reason: String,
    },
    /// Run finished
    RunCompleted {
        /// Overall outcome
        success: bool,
        /// Total duration of the run
        duration_ms: u64,
    },
}
