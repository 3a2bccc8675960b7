//! Run audit records.
//!
//! Every run owns exactly one row in the audit table. [`AuditManager::open`]
//! computes the run's window and inserts the row as `In Progress`,
//! [`AuditManager::close`] finalizes it once as `Complete` or `Error`. The
//! observed dates of a complete run become the high-water mark of the next.

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde::Serialize;
use tracing::{info, instrument, warn};
use weir_schemas::{AuditSettings, Job, LoadMode, RunStatus};

use crate::batch::ObservedRange;
use crate::error::ErrorKind;
use crate::executor::{Connector, ExecuteOptions, ExecutorError, QueryExecutor, Rows, Value};
use crate::window::{WatermarkCalculator, WindowError, WindowRequest, WindowState};

/// Environment variable consulted when a job does not name its environment
pub const ENVIRONMENT_VAR: &str = "WEIR_ENVIRONMENT";

const DEFAULT_ENVIRONMENT: &str = "dev";

const RECORD_COLUMNS: &str = "run_id, load_mode, sources, target_database, target_table, \
     window_start, window_end, observed_min_date, observed_max_date, started_at, ended_at, \
     environment, status, script_version, record_count, previous_high_water_mark, \
     created_at, modified_at";

#[derive(Debug, thiserror::Error, Diagnostic)]
pub enum AuditError {
    #[error("Could not open a session for the audit table")]
    #[diagnostic(code(weir::audit::connect))]
    Connect(#[source] ExecutorError),

    #[error("Audit table operation '{operation}' failed")]
    #[diagnostic(code(weir::audit::statement))]
    Statement {
        operation: &'static str,
        #[source]
        source: ExecutorError,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Window(#[from] WindowError),

    #[error("No run has been opened")]
    #[diagnostic(
        code(weir::audit::not_opened),
        help("`open` must succeed before a run can be closed")
    )]
    NotOpened,

    #[error("Run {run_id} is already open")]
    #[diagnostic(code(weir::audit::already_opened))]
    AlreadyOpened { run_id: i64 },

    #[error("Run {run_id} is already closed")]
    #[diagnostic(code(weir::audit::already_closed))]
    AlreadyClosed { run_id: i64 },

    #[error("A run cannot be closed with status '{0}'")]
    #[diagnostic(code(weir::audit::invalid_status))]
    InvalidStatus(RunStatus),

    #[error("The audit insert did not return a run id")]
    #[diagnostic(code(weir::audit::no_run_id))]
    NoRunIdReturned,

    #[error("Cannot decode audit column '{column}' from '{value}'")]
    #[diagnostic(code(weir::audit::decode))]
    RecordDecode { column: &'static str, value: String },
}

impl AuditError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AuditError::Connect(source) | AuditError::Statement { source, .. } => source.kind(),
            AuditError::Window(source) => source.kind(),
            AuditError::NotOpened
            | AuditError::AlreadyOpened { .. }
            | AuditError::AlreadyClosed { .. }
            | AuditError::InvalidStatus(_) => ErrorKind::Etl,
            AuditError::NoRunIdReturned | AuditError::RecordDecode { .. } => {
                ErrorKind::ExternalService
            }
        }
    }
}

/// One row of the audit table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunAuditRecord {
    pub run_id: i64,
    pub load_mode: LoadMode,
    pub sources: String,
    pub target_database: Option<String>,
    pub target_table: String,
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
    pub observed_min_date: Option<DateTime<Utc>>,
    pub observed_max_date: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub environment: Option<String>,
    pub status: RunStatus,
    pub script_version: Option<String>,
    pub record_count: Option<i64>,
    pub previous_high_water_mark: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
}

impl RunAuditRecord {
    fn decode(rows: &Rows, row: usize) -> Result<Self, AuditError> {
        let cell = |column: &'static str| rows.get(row, column).unwrap_or(&Value::Null);

        let text = |column: &'static str| match cell(column) {
            Value::Null => None,
            value => value.to_text(),
        };

        let timestamp = |column: &'static str| -> Result<Option<DateTime<Utc>>, AuditError> {
            match cell(column) {
                Value::Null => Ok(None),
                value => value.as_timestamp().map(Some).ok_or_else(|| {
                    AuditError::RecordDecode {
                        column,
                        value: value.to_string(),
                    }
                }),
            }
        };

        let integer = |column: &'static str| -> Result<Option<i64>, AuditError> {
            match cell(column) {
                Value::Null => Ok(None),
                value => value.as_i64().map(Some).ok_or_else(|| AuditError::RecordDecode {
                    column,
                    value: value.to_string(),
                }),
            }
        };

        let required = |column: &'static str| {
            text(column).ok_or(AuditError::RecordDecode {
                column,
                value: "NULL".into(),
            })
        };

        let load_mode = required("load_mode")?;
        let status = required("status")?;

        Ok(Self {
            run_id: integer("run_id")?.ok_or(AuditError::RecordDecode {
                column: "run_id",
                value: "NULL".into(),
            })?,
            load_mode: load_mode.parse().map_err(|_| AuditError::RecordDecode {
                column: "load_mode",
                value: load_mode.clone(),
            })?,
            sources: text("sources").unwrap_or_default(),
            target_database: text("target_database"),
            target_table: required("target_table")?,
            window_start: timestamp("window_start")?,
            window_end: timestamp("window_end")?,
            observed_min_date: timestamp("observed_min_date")?,
            observed_max_date: timestamp("observed_max_date")?,
            started_at: timestamp("started_at")?,
            ended_at: timestamp("ended_at")?,
            environment: text("environment"),
            status: status.parse().map_err(|_| AuditError::RecordDecode {
                column: "status",
                value: status.clone(),
            })?,
            script_version: text("script_version"),
            record_count: integer("record_count")?,
            previous_high_water_mark: timestamp("previous_high_water_mark")?,
            created_at: timestamp("created_at")?,
            modified_at: timestamp("modified_at")?,
        })
    }
}

/// The descriptive columns of every audit row a job writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDescriptor {
    pub sources: Vec<String>,
    pub target_database: String,
    /// Qualified target table, the key of the run history
    pub target_table: String,
    pub environment: String,
    pub script_version: String,
}

impl RunDescriptor {
    pub fn from_job(job: &Job) -> Self {
        let environment = job
            .environment
            .clone()
            .or_else(|| std::env::var(ENVIRONMENT_VAR).ok())
            .filter(|env| !env.is_empty())
            .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string());

        Self {
            sources: job.sources.clone(),
            target_database: job.target_database.clone(),
            target_table: job.target.qualified_name(),
            environment,
            script_version: job.version.clone(),
        }
    }
}

/// A run whose audit row was inserted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedRun {
    pub run_id: i64,
    pub window: WindowState,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug)]
enum AuditState {
    Pending,
    Open(OpenedRun),
    Closed(OpenedRun),
}

/// Opens and closes the audit record of a single run.
///
/// Each operation uses its own short-lived session from the connector.
pub struct AuditManager {
    connector: Box<dyn Connector>,
    settings: AuditSettings,
    descriptor: RunDescriptor,
    previous_mark_query: Option<String>,
    state: AuditState,
}

impl std::fmt::Debug for AuditManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditManager")
            .field("settings", &self.settings)
            .field("descriptor", &self.descriptor)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl AuditManager {
    pub fn new(
        connector: Box<dyn Connector>,
        settings: AuditSettings,
        descriptor: RunDescriptor,
    ) -> Self {
        Self {
            connector,
            settings,
            descriptor,
            previous_mark_query: None,
            state: AuditState::Pending,
        }
    }

    pub fn from_job(job: &Job, connector: Box<dyn Connector>) -> Self {
        let mut manager = Self::new(connector, job.audit.clone(), RunDescriptor::from_job(job));
        manager.previous_mark_query = job.window.previous_mark_query.clone();
        manager
    }

    /// Replaces the built-in previous high-water mark lookup.
    ///
    /// The query runs without bind parameters and must return at most one row
    /// with the mark in its first column.
    pub fn with_previous_mark_query(mut self, query: impl Into<String>) -> Self {
        self.previous_mark_query = Some(query.into());
        self
    }

    pub fn descriptor(&self) -> &RunDescriptor {
        &self.descriptor
    }

    /// Observed max date of the most recent complete run of the same target
    pub fn default_previous_mark_query(&self) -> String {
        let table = self.settings.qualified_name();
        format!(
            "SELECT observed_max_date FROM {table} WHERE run_id = \
             (SELECT max(run_id) FROM {table} WHERE target_table = ? AND status = '{}')",
            RunStatus::Complete.as_str()
        )
    }

    fn calculator(&self) -> WatermarkCalculator {
        match &self.previous_mark_query {
            Some(query) => WatermarkCalculator::new(query.clone(), vec![]),
            None => WatermarkCalculator::new(
                self.default_previous_mark_query(),
                vec![Value::from(self.descriptor.target_table.as_str())],
            ),
        }
    }

    /// The open run, if any
    pub fn current(&self) -> Option<&OpenedRun> {
        match &self.state {
            AuditState::Open(run) => Some(run),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, AuditState::Closed(_))
    }

    pub fn open(&mut self, request: &WindowRequest) -> Result<OpenedRun, AuditError> {
        self.open_at(request, Utc::now())
    }

    /// Creates the audit table when missing, computes the window and inserts
    /// the `In Progress` record. Returns the store-assigned run id.
    #[instrument(skip_all, fields(target = %self.descriptor.target_table), err)]
    pub fn open_at(
        &mut self,
        request: &WindowRequest,
        now: DateTime<Utc>,
    ) -> Result<OpenedRun, AuditError> {
        match &self.state {
            AuditState::Pending => {}
            AuditState::Open(run) => return Err(AuditError::AlreadyOpened { run_id: run.run_id }),
            AuditState::Closed(run) => {
                return Err(AuditError::AlreadyClosed { run_id: run.run_id })
            }
        }

        let mut session = self.connector.connect().map_err(AuditError::Connect)?;
        self.ensure_table(session.as_mut())?;
        self.warn_stale_runs(session.as_mut())?;

        let window = self.calculator().calculate_at(session.as_mut(), request, now)?;
        let run_id = self.insert(session.as_mut(), &window, now)?;

        info!(
            run_id,
            window_start = %window.window.start(),
            window_end = %window.window.end(),
            "Opened {} run",
            request.load_mode
        );

        let run = OpenedRun {
            run_id,
            window,
            started_at: now,
        };
        self.state = AuditState::Open(run.clone());

        Ok(run)
    }

    /// The window a run opened at `now` would get, without recording anything
    pub fn preview_at(
        &self,
        request: &WindowRequest,
        now: DateTime<Utc>,
    ) -> Result<WindowState, AuditError> {
        let mut session = self.connector.connect().map_err(AuditError::Connect)?;
        self.ensure_table(session.as_mut())?;

        let window = self.calculator().calculate_at(session.as_mut(), request, now)?;
        session.rollback().map_err(|source| AuditError::Statement {
            operation: "end preview",
            source,
        })?;
        Ok(window)
    }

    fn ensure_table(&self, session: &mut dyn QueryExecutor) -> Result<(), AuditError> {
        for statement in session.dialect().audit_ddl(&self.settings) {
            session
                .execute(&statement, &[], ExecuteOptions::COMMIT)
                .map_err(|source| AuditError::Statement {
                    operation: "create audit table",
                    source,
                })?;
        }
        Ok(())
    }

    fn warn_stale_runs(&self, session: &mut dyn QueryExecutor) -> Result<(), AuditError> {
        let sql = format!(
            "SELECT run_id, started_at FROM {} WHERE target_table = ? AND status = ? ORDER BY run_id",
            self.settings.qualified_name()
        );
        let params = [
            Value::from(self.descriptor.target_table.as_str()),
            Value::from(RunStatus::InProgress.as_str()),
        ];

        let stale = session
            .query(&sql, &params)
            .map_err(|source| AuditError::Statement {
                operation: "look up unfinished runs",
                source,
            })?;

        for row in &stale.rows {
            let run_id = row.first().cloned().unwrap_or(Value::Null);
            let started_at = row.get(1).cloned().unwrap_or(Value::Null);
            warn!(
                %run_id,
                %started_at,
                "Run of {} was never finalized and stays 'In Progress'",
                self.descriptor.target_table
            );
        }

        Ok(())
    }

    fn insert(
        &self,
        session: &mut dyn QueryExecutor,
        window: &WindowState,
        now: DateTime<Utc>,
    ) -> Result<i64, AuditError> {
        let sql = format!(
            "INSERT INTO {} (load_mode, sources, target_database, target_table, window_start, \
             window_end, started_at, environment, status, script_version, record_count, \
             previous_high_water_mark, created_at, modified_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING run_id",
            self.settings.qualified_name()
        );
        let params = [
            Value::from(window.request.load_mode.code()),
            Value::from(self.descriptor.sources.join(",")),
            Value::from(self.descriptor.target_database.as_str()),
            Value::from(self.descriptor.target_table.as_str()),
            Value::from(window.window.start()),
            Value::from(window.window.end()),
            Value::from(now),
            Value::from(self.descriptor.environment.as_str()),
            Value::from(RunStatus::InProgress.as_str()),
            Value::from(self.descriptor.script_version.as_str()),
            Value::Int(0),
            Value::from(window.previous_high_water_mark),
            Value::from(now),
            Value::from(now),
        ];

        let rows = session
            .execute(&sql, &params, ExecuteOptions::RETURNING)
            .map_err(|source| AuditError::Statement {
                operation: "insert run",
                source,
            })?
            .unwrap_or_default();

        rows.first_value()
            .and_then(Value::as_i64)
            .ok_or(AuditError::NoRunIdReturned)
    }

    pub fn close(
        &mut self,
        status: RunStatus,
        record_count: u64,
        observed: Option<ObservedRange>,
    ) -> Result<(), AuditError> {
        self.close_at(status, record_count, observed, Utc::now())
    }

    /// Finalizes the open run with one committed update.
    ///
    /// Without an observed range both observed dates are set to the window
    /// start, so the next incremental run starts where this one did. A range
    /// is clamped into the window before it is written.
    #[instrument(skip_all, fields(status = %status), err)]
    pub fn close_at(
        &mut self,
        status: RunStatus,
        record_count: u64,
        observed: Option<ObservedRange>,
        now: DateTime<Utc>,
    ) -> Result<(), AuditError> {
        let run = match &self.state {
            AuditState::Pending => return Err(AuditError::NotOpened),
            AuditState::Closed(run) => {
                return Err(AuditError::AlreadyClosed { run_id: run.run_id })
            }
            AuditState::Open(run) => run.clone(),
        };

        if !status.is_terminal() {
            return Err(AuditError::InvalidStatus(status));
        }

        let window = run.window.window;
        let (observed_min, observed_max) = match observed {
            Some(range) => {
                let clamped = range.clamp_to(&window);
                if clamped != range {
                    warn!(
                        observed_min = %range.min(),
                        observed_max = %range.max(),
                        "Observed dates fall outside the window and were clamped"
                    );
                }
                (clamped.min(), clamped.max())
            }
            None => (window.start(), window.start()),
        };

        let sql = format!(
            "UPDATE {} SET status = ?, record_count = ?, observed_min_date = ?, \
             observed_max_date = ?, ended_at = ?, modified_at = ? WHERE run_id = ?",
            self.settings.qualified_name()
        );
        let params = [
            Value::from(status.as_str()),
            Value::Int(i64::try_from(record_count).unwrap_or(i64::MAX)),
            Value::from(observed_min),
            Value::from(observed_max),
            Value::from(now),
            Value::from(now),
            Value::Int(run.run_id),
        ];

        let mut session = self.connector.connect().map_err(AuditError::Connect)?;
        session
            .execute(&sql, &params, ExecuteOptions::COMMIT)
            .map_err(|source| AuditError::Statement {
                operation: "close run",
                source,
            })?;

        info!(
            run_id = run.run_id,
            record_count,
            %observed_min,
            %observed_max,
            "Closed run as '{status}'"
        );
        self.state = AuditState::Closed(run);

        Ok(())
    }

    /// Reads a persisted record back
    #[instrument(skip(self), err)]
    pub fn fetch(&self, run_id: i64) -> Result<Option<RunAuditRecord>, AuditError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM {} WHERE run_id = ?",
            self.settings.qualified_name()
        );

        let mut session = self.connector.connect().map_err(AuditError::Connect)?;
        let rows = session
            .query(&sql, &[Value::Int(run_id)])
            .map_err(|source| AuditError::Statement {
                operation: "fetch run",
                source,
            })?;

        if rows.is_empty() {
            return Ok(None);
        }
        RunAuditRecord::decode(&rows, 0).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weir_schemas::{Column, ExtractSettings, TargetTable};

    fn job(environment: Option<&str>) -> Job {
        Job::builder()
            .name("orders".to_string())
            .maybe_environment(environment.map(str::to_string))
            .sources(vec!["crm".to_string(), "erp".to_string()])
            .target(
                TargetTable::builder()
                    .schema("sales".to_string())
                    .name("orders".to_string())
                    .columns(vec![Column::builder().name("order_id".to_string()).build()])
                    .unique_key(vec!["order_id".to_string()])
                    .build(),
            )
            .extract(ExtractSettings::builder().query("SELECT 1".to_string()).build())
            .build()
    }

    #[test]
    fn test_descriptor_from_job() {
        let descriptor = RunDescriptor::from_job(&job(Some("prod")));

        assert_eq!(descriptor.target_table, "sales.orders");
        assert_eq!(descriptor.environment, "prod");
        assert_eq!(descriptor.script_version, "1.0");
        assert_eq!(descriptor.sources, vec!["crm", "erp"]);
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(AuditError::NotOpened.kind(), ErrorKind::Etl);
        assert_eq!(AuditError::AlreadyClosed { run_id: 1 }.kind(), ErrorKind::Etl);
        assert_eq!(
            AuditError::Window(WindowError::IncrementalWithoutHistory).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            AuditError::Connect(ExecutorError::Connection {
                backend: "odbc",
                message: "timeout".into(),
                transient: true,
            })
            .kind(),
            ErrorKind::Retryable
        );
    }
}
