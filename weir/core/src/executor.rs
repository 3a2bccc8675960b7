//! The query execution contract shared by every component that talks to a
//! database, and the value types crossing it.
//!
//! Backends live in their own crates (`weir-duckdb`, `weir-odbc`) and only
//! need to implement [`QueryExecutor`] and, to hand out sessions,
//! [`Connector`].

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use miette::Diagnostic;

use crate::batch::StagingBatch;
use crate::error::ErrorKind;
use crate::sql::Dialect;

/// Formats accepted when a timestamp arrives as text
const TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S%.f",
];

/// Errors surfaced by a backend.
///
/// Backends decide whether a failure is transient; everything else in weir
/// only looks at [`ExecutorError::is_transient`].
#[derive(Debug, thiserror::Error, Diagnostic)]
pub enum ExecutorError {
    #[error("Could not connect to {backend}: {message}")]
    #[diagnostic(
        code(weir::executor::connection),
        help("Check the connection settings of the job and that the database is reachable")
    )]
    Connection {
        backend: &'static str,
        message: String,
        transient: bool,
    },

    #[error("Statement failed: {message}")]
    #[diagnostic(code(weir::executor::statement))]
    Statement { message: String, transient: bool },

    #[error("Bulk load into '{table}' failed: {message}")]
    #[diagnostic(code(weir::executor::bulk_load))]
    BulkLoad { table: String, message: String },

    #[error("Cannot convert value: {0}")]
    #[diagnostic(code(weir::executor::conversion))]
    Conversion(String),
}

impl ExecutorError {
    /// Permanent statement failure
    pub fn statement(message: impl fmt::Display) -> Self {
        ExecutorError::Statement {
            message: message.to_string(),
            transient: false,
        }
    }

    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            ExecutorError::Connection { transient, .. }
            | ExecutorError::Statement { transient, .. } => *transient,
            ExecutorError::BulkLoad { .. } | ExecutorError::Conversion(_) => false,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        if self.is_transient() {
            ErrorKind::Retryable
        } else {
            ErrorKind::ExternalService
        }
    }
}

/// A single value crossing the executor boundary, both as bind parameter and
/// as result cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Timestamp view of the value, parsing text cells as returned by
    /// text-only drivers
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(ts) => Some(*ts),
            Value::Text(s) => parse_timestamp(s),
            _ => None,
        }
    }

    /// Text rendering used for staged batches, `None` for NULL
    pub fn to_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Bool(v) => Some(v.to_string()),
            Value::Int(v) => Some(v.to_string()),
            Value::Float(v) => Some(v.to_string()),
            Value::Text(v) => Some(v.clone()),
            Value::Timestamp(ts) => Some(format_timestamp(ts)),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_text() {
            Some(text) => f.write_str(&text),
            None => f.write_str("NULL"),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Renders a timestamp the way every supported backend accepts it as text
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

/// Parses a timestamp in any of the textual shapes databases and CSV exports
/// commonly produce. Values without an offset are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%d %H:%M:%S%.f%:z"] {
        if let Ok(ts) = DateTime::parse_from_str(raw, format) {
            return Some(ts.with_timezone(&Utc));
        }
    }

    TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .map(|naive| naive.and_utc())
}

/// Tabular result of a statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Rows {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// First cell of the first row
    pub fn first_value(&self) -> Option<&Value> {
        self.rows.first().and_then(|row| row.first())
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }

    /// Cell of `row` in column `name`
    pub fn get(&self, row: usize, name: &str) -> Option<&Value> {
        let idx = self.column_index(name)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }
}

/// What the caller expects from [`QueryExecutor::execute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Collect and return the result set
    pub want_results: bool,
    /// Commit the session's transaction once the statement succeeded
    pub commit: bool,
}

impl ExecuteOptions {
    /// Read-only query, never commits
    pub const QUERY: Self = Self {
        want_results: true,
        commit: false,
    };

    /// Statement inside the current transaction
    pub const STATEMENT: Self = Self {
        want_results: false,
        commit: false,
    };

    /// Statement committed on success
    pub const COMMIT: Self = Self {
        want_results: false,
        commit: true,
    };

    /// Data modification with a result set, e.g. `INSERT ... RETURNING`
    pub const RETURNING: Self = Self {
        want_results: true,
        commit: true,
    };
}

/// A possibly schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub schema: Option<String>,
    pub name: String,
}

impl TableRef {
    pub fn new(schema: Option<String>, name: impl Into<String>) -> Self {
        Self {
            schema,
            name: name.into(),
        }
    }

    pub fn qualified(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{schema}.{}", self.name),
            None => self.name.clone(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.qualified())
    }
}

/// A database session.
///
/// Statements run inside an implicit transaction that is only committed when
/// the caller asks for it, either through [`ExecuteOptions::commit`] or
/// [`QueryExecutor::commit`]. Backend errors are always returned, never
/// swallowed.
pub trait QueryExecutor {
    /// SQL dialect spoken by the session
    fn dialect(&self) -> Dialect;

    /// Executes one statement with positional `?` parameters.
    ///
    /// Returns `Some(rows)` when `options.want_results` is set.
    fn execute(
        &mut self,
        statement: &str,
        params: &[Value],
        options: ExecuteOptions,
    ) -> Result<Option<Rows>, ExecutorError>;

    /// Loads every row of `batch` into `table` with the backend's bulk path,
    /// inside the current transaction. Returns the number of rows loaded.
    fn bulk_load(&mut self, table: &TableRef, batch: &StagingBatch) -> Result<u64, ExecutorError>;

    /// Commits the current transaction, a no-op when none is open
    fn commit(&mut self) -> Result<(), ExecutorError>;

    /// Rolls the current transaction back, a no-op when none is open
    fn rollback(&mut self) -> Result<(), ExecutorError>;

    /// Runs a read-only query
    fn query(&mut self, statement: &str, params: &[Value]) -> Result<Rows, ExecutorError> {
        Ok(self
            .execute(statement, params, ExecuteOptions::QUERY)?
            .unwrap_or_default())
    }
}

impl<E: QueryExecutor + ?Sized> QueryExecutor for Box<E> {
    fn dialect(&self) -> Dialect {
        (**self).dialect()
    }

    fn execute(
        &mut self,
        statement: &str,
        params: &[Value],
        options: ExecuteOptions,
    ) -> Result<Option<Rows>, ExecutorError> {
        (**self).execute(statement, params, options)
    }

    fn bulk_load(&mut self, table: &TableRef, batch: &StagingBatch) -> Result<u64, ExecutorError> {
        (**self).bulk_load(table, batch)
    }

    fn commit(&mut self) -> Result<(), ExecutorError> {
        (**self).commit()
    }

    fn rollback(&mut self) -> Result<(), ExecutorError> {
        (**self).rollback()
    }
}

/// Hands out sessions against one database.
pub trait Connector {
    fn connect(&self) -> Result<Box<dyn QueryExecutor>, ExecutorError>;
}

impl<C: Connector + ?Sized> Connector for Box<C> {
    fn connect(&self) -> Result<Box<dyn QueryExecutor>, ExecutorError> {
        (**self).connect()
    }
}

impl<C: Connector + ?Sized> Connector for std::rc::Rc<C> {
    fn connect(&self) -> Result<Box<dyn QueryExecutor>, ExecutorError> {
        (**self).connect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    #[rstest]
    #[case("2026-01-02 03:04:05")]
    #[case("2026-01-02 03:04:05.000000")]
    #[case("2026-01-02T03:04:05Z")]
    #[case("2026-01-02 03:04:05+00")]
    #[case("2026-01-02 04:04:05+01:00")]
    #[case("2026-01-02T03:04:05")]
    fn test_parse_timestamp_shapes(#[case] raw: &str) {
        let expected = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(parse_timestamp(raw), Some(expected));
    }

    #[test]
    fn test_parse_date_only_is_midnight_utc() {
        let expected = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        assert_eq!(parse_timestamp("2026-03-01"), Some(expected));
        assert_eq!(parse_timestamp("not a date"), None);
    }

    #[test]
    fn test_value_text_rendering() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();

        assert_eq!(Value::Null.to_text(), None);
        assert_eq!(Value::Int(42).to_text().as_deref(), Some("42"));
        assert_eq!(
            Value::Timestamp(ts).to_text().as_deref(),
            Some("2026-01-02 03:04:05.000000")
        );
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::Text("7".into()).as_i64(), Some(7));
        assert_eq!(Value::Text("2026-01-02 03:04:05".into()).as_timestamp(), Some(ts));
    }

    #[test]
    fn test_transient_errors_are_retryable() {
        let transient = ExecutorError::Connection {
            backend: "odbc",
            message: "connection reset".into(),
            transient: true,
        };
        let permanent = ExecutorError::statement("duplicate key");

        assert_eq!(transient.kind(), ErrorKind::Retryable);
        assert_eq!(permanent.kind(), ErrorKind::ExternalService);
    }
}
