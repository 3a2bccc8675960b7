//! # Weir Schemas
//!
//! Configuration types shared by the weir crates: the job document, the
//! target table descriptor, task definitions and progress events. Keeping
//! them in a dependency-light crate lets backends and the CLI share them
//! without pulling in the execution engine.

use bon::Builder;
use serde::{Deserialize, Serialize};

pub mod connection;
pub mod extract;
pub mod progress;
pub mod run;
pub mod target;
pub mod tasks;

mod serde_helpers;

pub use connection::ConnectionConfig;
pub use extract::{ExtractSettings, ExtractSettingsBuilder};
pub use progress::ProgressEvent;
pub use run::{
    AuditSettings, AuditSettingsBuilder, LoadMode, RetryPolicy, RetrySettings,
    RetrySettingsBuilder, RunStatus, WindowSettings, WindowSettingsBuilder,
};
pub use target::{Column, ColumnBuilder, TargetTable, TargetTableBuilder};
pub use tasks::{steps, TaskDefinition, TaskDefinitionBuilder};

use serde_helpers::{default_tasks, default_version};

/// Definition of a weir ETL job.
///
/// A job describes one target table, where its data comes from and the
/// ordered steps that move one window of data per run. Most settings have
/// defaults so a minimal job only names its target, its connection and its
/// extract query.
///
/// # Examples
///
/// ```
/// use weir_schemas::{Column, ExtractSettings, Job, TargetTable};
///
/// let job = Job::builder()
///     .name("orders".to_string())
///     .target(
///         TargetTable::builder()
///             .schema("main".to_string())
///             .name("orders".to_string())
///             .columns(vec![Column::builder().name("order_id".to_string()).build()])
///             .unique_key(vec!["order_id".to_string()])
///             .build(),
///     )
///     .extract(ExtractSettings::builder().query("SELECT 1 AS order_id".to_string()).build())
///     .build();
///
/// assert_eq!(job.version, "1.0");
/// assert_eq!(job.tasks.len(), 4);
/// assert_eq!(job.tasks[1].depends_on.as_deref(), Some("open_run"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[serde(rename_all = "snake_case")]
pub struct Job {
    /// Job name, used in logs and the run report
    pub name: String,

    /// Version recorded on every audit row
    #[serde(default = "default_version", alias = "script_version")]
    #[builder(default = default_version())]
    pub version: String,

    /// Free text shown in the run report
    #[serde(default)]
    #[builder(default)]
    pub description: String,

    /// Environment recorded on every audit row, falls back to `WEIR_ENVIRONMENT`
    #[serde(default)]
    pub environment: Option<String>,

    /// Informational list of source identifiers
    #[serde(default)]
    #[builder(default)]
    pub sources: Vec<String>,

    /// Informational name of the target database
    #[serde(default)]
    #[builder(default)]
    pub target_database: String,

    /// Table the job loads into
    pub target: TargetTable,

    /// Target database, also holds the audit table
    #[serde(default)]
    #[builder(default)]
    pub connection: ConnectionConfig,

    /// Source database, defaults to the target connection
    #[serde(default)]
    pub source_connection: Option<ConnectionConfig>,

    /// Window sizing
    #[serde(default)]
    #[builder(default)]
    pub window: WindowSettings,

    /// Audit table location
    #[serde(default)]
    #[builder(default)]
    pub audit: AuditSettings,

    /// Extraction settings
    pub extract: ExtractSettings,

    /// Retry behaviour
    #[serde(default)]
    #[builder(default)]
    pub retry: RetrySettings,

    /// Ordered steps of a run
    #[serde(default = "default_tasks")]
    #[builder(default = default_tasks())]
    pub tasks: Vec<TaskDefinition>,
}
