//! Declarative task definitions.
//!
//! A job lists the steps it runs in order. Each definition names one of the
//! built-in steps and carries the gating and retry settings the orchestrator
//! applies to it.

use bon::Builder;
use serde::{Deserialize, Serialize};

use crate::serde_helpers::default_true;

/// Names of the built-in steps a job can list
pub mod steps {
    /// Compute the window and insert the IN_PROGRESS audit record
    pub const OPEN_RUN: &str = "open_run";
    /// Pull the window out of the source into a staging batch
    pub const EXTRACT: &str = "extract";
    /// Stage and merge the batch into the target table
    pub const LOAD: &str = "load";
    /// Finalize the audit record as COMPLETE
    pub const CLOSE_RUN: &str = "close_run";

    /// All built-in step names in their natural order
    pub const ALL: [&str; 4] = [OPEN_RUN, EXTRACT, LOAD, CLOSE_RUN];
}

/// A single step of a job.
///
/// # Examples
///
/// ```
/// use weir_schemas::TaskDefinition;
///
/// let task = TaskDefinition::builder()
///     .name("load".to_string())
///     .retries(2)
///     .depends_on("extract".to_string())
///     .build();
///
/// assert!(task.enabled);
/// assert_eq!(task.description, "");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[serde(rename_all = "snake_case")]
pub struct TaskDefinition {
    /// Unique name within the job, used as the dependency key
    pub name: String,

    /// Free text shown in the run report
    #[serde(default)]
    #[builder(default)]
    pub description: String,

    /// Disabled tasks are recorded as skipped and never executed
    #[serde(default = "default_true")]
    #[builder(default = true)]
    pub enabled: bool,

    /// Additional attempts after the first failure, 0 runs the task once
    #[serde(default, alias = "max_retries")]
    #[builder(default)]
    pub retries: u32,

    /// Name of a prior task that must have succeeded in the same run
    #[serde(default)]
    pub depends_on: Option<String>,
}
