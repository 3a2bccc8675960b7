//! Shared serde helper functions for default values.
//!
//! Every `#[serde(default = "...")]` in this crate points here so that the
//! deserialized defaults and the builder defaults stay identical.

use crate::tasks::{steps, TaskDefinition};

// =============================================================================
// Default value functions
// =============================================================================

/// Default value for boolean fields that should be true
pub fn default_true() -> bool {
    true
}

/// Default script version recorded on every audit row
pub fn default_version() -> String {
    "1.0".to_string()
}

/// Window cap applied when a job does not configure one
pub fn default_max_window_days() -> u32 {
    365
}

/// Default semicolon delimiter for staged batch files
pub fn default_semicolon() -> char {
    ';'
}

/// Default schema holding the audit table
pub fn default_audit_schema() -> String {
    "audit".to_string()
}

/// Default audit table name
pub fn default_audit_table() -> String {
    "etl_runs".to_string()
}

/// Name of the column carrying the run id on every loaded row
pub fn default_run_key() -> String {
    "etl_runs_key".to_string()
}

/// SQL type used for columns declared without one
pub fn default_data_type() -> String {
    "VARCHAR".to_string()
}

/// Fixed pause between retry attempts
pub fn default_backoff_secs() -> u64 {
    5
}

/// The four built-in steps, each gated on the previous one
pub fn default_tasks() -> Vec<TaskDefinition> {
    let mut previous: Option<&str> = None;

    [
        (steps::OPEN_RUN, "Compute the load window and open the audit record"),
        (steps::EXTRACT, "Extract the window from the source"),
        (steps::LOAD, "Stage and merge the batch into the target table"),
        (steps::CLOSE_RUN, "Close the audit record"),
    ]
    .into_iter()
    .map(|(name, description)| {
        let task = TaskDefinition {
            name: name.to_string(),
            description: description.to_string(),
            enabled: true,
            retries: 0,
            depends_on: previous.map(str::to_string),
        };
        previous = Some(name);
        task
    })
    .collect()
}
