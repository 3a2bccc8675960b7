//! Run level settings: load mode, window sizing, audit location and retries.

use std::fmt;
use std::str::FromStr;

use bon::Builder;
use serde::{Deserialize, Serialize};

use crate::serde_helpers::{
    default_audit_schema, default_audit_table, default_backoff_secs, default_max_window_days,
};

/// How the start of the load window is anchored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    /// Anchored on an explicit start date or the previous high-water mark,
    /// window may extend into the future
    #[serde(alias = "F", alias = "FULL")]
    Full,
    /// Continues from the previous high-water mark, capped at "now"
    #[default]
    #[serde(alias = "I", alias = "INCREMENTAL")]
    Incremental,
}

impl LoadMode {
    /// One letter code persisted in the audit table
    pub fn code(&self) -> &'static str {
        match self {
            LoadMode::Full => "F",
            LoadMode::Incremental => "I",
        }
    }
}

impl fmt::Display for LoadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadMode::Full => write!(f, "FULL"),
            LoadMode::Incremental => write!(f, "INCREMENTAL"),
        }
    }
}

impl FromStr for LoadMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "F" | "FULL" => Ok(LoadMode::Full),
            "I" | "INCREMENTAL" => Ok(LoadMode::Incremental),
            other => Err(format!("unknown load mode '{other}'")),
        }
    }
}

/// Lifecycle status of an audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Opened, not yet finalized
    InProgress,
    /// Finalized after a successful load
    Complete,
    /// Finalized after a failure
    Error,
}

impl RunStatus {
    /// Text persisted in the audit table
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::InProgress => "In Progress",
            RunStatus::Complete => "Complete",
            RunStatus::Error => "Error",
        }
    }

    /// Whether the status can no longer change
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::InProgress)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "In Progress" => Ok(RunStatus::InProgress),
            "Complete" => Ok(RunStatus::Complete),
            "Error" => Ok(RunStatus::Error),
            other => Err(format!("unknown run status '{other}'")),
        }
    }
}

/// Window sizing for a job.
///
/// # Examples
///
/// ```
/// use weir_schemas::{LoadMode, WindowSettings};
///
/// let settings = WindowSettings::default();
/// assert_eq!(settings.load_mode, LoadMode::Incremental);
/// assert_eq!(settings.max_window_days, 365);
/// assert!(!settings.increment_by_one_day);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[serde(rename_all = "snake_case")]
pub struct WindowSettings {
    /// Load mode used when the command line does not override it
    #[serde(default)]
    #[builder(default)]
    pub load_mode: LoadMode,

    /// Upper bound on the window length in days
    #[serde(default = "default_max_window_days")]
    #[builder(default = default_max_window_days())]
    pub max_window_days: u32,

    /// Start incremental windows one day after the previous mark
    #[serde(default)]
    #[builder(default)]
    pub increment_by_one_day: bool,

    /// Replaces the built-in previous high-water mark lookup.
    /// Must return a single timestamp column, may return no row.
    #[serde(default)]
    pub previous_mark_query: Option<String>,
}

impl Default for WindowSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Where the audit table lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[serde(rename_all = "snake_case")]
pub struct AuditSettings {
    /// Schema created on demand to hold the audit table
    #[serde(default = "default_audit_schema")]
    #[builder(default = default_audit_schema())]
    pub schema: String,

    /// Audit table name
    #[serde(default = "default_audit_table")]
    #[builder(default = default_audit_table())]
    pub table: String,
}

impl AuditSettings {
    /// `schema.table`
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Which task failures the orchestrator retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Retry only failures classified as transient
    #[default]
    Transient,
    /// Retry every failure until the attempts run out
    Always,
}

/// Retry behaviour shared by all tasks of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[serde(rename_all = "snake_case")]
pub struct RetrySettings {
    /// Fixed pause between attempts of the same task
    #[serde(default = "default_backoff_secs")]
    #[builder(default = default_backoff_secs())]
    pub backoff_secs: u64,

    /// Which failures are retried
    #[serde(default)]
    #[builder(default)]
    pub policy: RetryPolicy,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self::builder().build()
    }
}
