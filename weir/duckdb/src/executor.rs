use chrono::{DateTime, Utc};
use duckdb::types::{TimeUnit, Value as DuckValue, ValueRef};
use duckdb::Connection;
use tracing::debug;
use weir_core::batch::StagingBatch;
use weir_core::executor::{ExecuteOptions, ExecutorError, QueryExecutor, Rows, TableRef, Value};
use weir_core::sql::Dialect;

use crate::error::DuckDbError;

/// Rows per multi-row `INSERT` while bulk loading
const INSERT_CHUNK_ROWS: usize = 500;

/// One session on a DuckDB database.
///
/// DuckDB runs in autocommit mode, so the session opens an explicit
/// transaction before the first statement and keeps it until
/// [`QueryExecutor::commit`] or [`QueryExecutor::rollback`].
pub struct DuckDbExecutor {
    connection: Connection,
    in_transaction: bool,
}

impl std::fmt::Debug for DuckDbExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuckDbExecutor")
            .field("in_transaction", &self.in_transaction)
            .finish_non_exhaustive()
    }
}

impl DuckDbExecutor {
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            in_transaction: false,
        }
    }

    fn begin(&mut self) -> Result<(), DuckDbError> {
        if !self.in_transaction {
            self.connection.execute_batch("BEGIN TRANSACTION")?;
            self.in_transaction = true;
        }
        Ok(())
    }

    fn end(&mut self, statement: &str) -> Result<(), DuckDbError> {
        if self.in_transaction {
            self.in_transaction = false;
            self.connection.execute_batch(statement)?;
        }
        Ok(())
    }

    fn run(
        &mut self,
        statement: &str,
        params: &[Value],
        want_results: bool,
    ) -> Result<Option<Rows>, DuckDbError> {
        self.begin()?;

        let values = params.iter().map(to_duck_value).collect::<Vec<_>>();
        let mut stmt = self.connection.prepare(statement)?;

        if !want_results {
            let affected = stmt.execute(duckdb::params_from_iter(values.iter()))?;
            debug!("{affected} rows affected");
            return Ok(None);
        }

        let mut rows = stmt.query(duckdb::params_from_iter(values.iter()))?;
        let columns = rows
            .as_ref()
            .map(|stmt| stmt.column_names())
            .unwrap_or_default();

        let mut result = Vec::new();
        while let Some(row) = rows.next()? {
            let cells = (0..columns.len())
                .map(|idx| row.get_ref(idx).map(from_value_ref))
                .collect::<Result<Vec<_>, _>>()?;
            result.push(cells);
        }

        Ok(Some(Rows::new(columns, result)))
    }

    fn insert_rows(&mut self, table: &TableRef, batch: &StagingBatch) -> Result<u64, DuckDbError> {
        self.begin()?;

        let column_list = batch.columns().join(", ");
        let row_placeholders = format!("({})", vec!["?"; batch.columns().len()].join(", "));
        let mut inserted = 0u64;

        for chunk in batch.rows().chunks(INSERT_CHUNK_ROWS) {
            let sql = format!(
                "INSERT INTO {table} ({column_list}) VALUES {}",
                vec![row_placeholders.as_str(); chunk.len()].join(", ")
            );

            let mut stmt = self.connection.prepare(&sql)?;
            let mut param_idx = 1usize;
            for row in chunk {
                for cell in row {
                    stmt.raw_bind_parameter(param_idx, cell.as_deref())?;
                    param_idx += 1;
                }
            }

            let rows = stmt.raw_execute()?;
            inserted += u64::try_from(rows).unwrap_or(0);
        }

        Ok(inserted)
    }
}

impl QueryExecutor for DuckDbExecutor {
    fn dialect(&self) -> Dialect {
        Dialect::DuckDb
    }

    fn execute(
        &mut self,
        statement: &str,
        params: &[Value],
        options: ExecuteOptions,
    ) -> Result<Option<Rows>, ExecutorError> {
        debug!("Executing: {statement}");
        let rows = self.run(statement, params, options.want_results)?;

        if options.commit {
            self.end("COMMIT")?;
        }
        Ok(rows)
    }

    fn bulk_load(&mut self, table: &TableRef, batch: &StagingBatch) -> Result<u64, ExecutorError> {
        if batch.is_empty() {
            return Ok(0);
        }

        self.insert_rows(table, batch)
            .map_err(|err| ExecutorError::BulkLoad {
                table: table.qualified(),
                message: err.to_string(),
            })
    }

    fn commit(&mut self) -> Result<(), ExecutorError> {
        Ok(self.end("COMMIT")?)
    }

    fn rollback(&mut self) -> Result<(), ExecutorError> {
        Ok(self.end("ROLLBACK")?)
    }
}

/// Timestamps are bound at microsecond precision, DuckDB's `TIMESTAMP`
fn to_duck_value(value: &Value) -> DuckValue {
    match value {
        Value::Null => DuckValue::Null,
        Value::Bool(v) => DuckValue::Boolean(*v),
        Value::Int(v) => DuckValue::BigInt(*v),
        Value::Float(v) => DuckValue::Double(*v),
        Value::Text(v) => DuckValue::Text(v.clone()),
        Value::Timestamp(ts) => DuckValue::Timestamp(TimeUnit::Microsecond, ts.timestamp_micros()),
    }
}

fn timestamp(unit: TimeUnit, value: i64) -> Option<DateTime<Utc>> {
    match unit {
        TimeUnit::Second => DateTime::from_timestamp(value, 0),
        TimeUnit::Millisecond => DateTime::from_timestamp_millis(value),
        TimeUnit::Microsecond => DateTime::from_timestamp_micros(value),
        TimeUnit::Nanosecond => Some(DateTime::from_timestamp_nanos(value)),
    }
}

/// Maps a result cell onto weir's value type. Types without a counterpart
/// (intervals, nested types) come back as their debug text.
fn from_value_ref(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Boolean(v) => Value::Bool(v),
        ValueRef::TinyInt(v) => Value::Int(v.into()),
        ValueRef::SmallInt(v) => Value::Int(v.into()),
        ValueRef::Int(v) => Value::Int(v.into()),
        ValueRef::BigInt(v) => Value::Int(v),
        ValueRef::UTinyInt(v) => Value::Int(v.into()),
        ValueRef::USmallInt(v) => Value::Int(v.into()),
        ValueRef::UInt(v) => Value::Int(v.into()),
        ValueRef::UBigInt(v) => i64::try_from(v)
            .map(Value::Int)
            .unwrap_or_else(|_| Value::Text(v.to_string())),
        ValueRef::HugeInt(v) => i64::try_from(v)
            .map(Value::Int)
            .unwrap_or_else(|_| Value::Text(v.to_string())),
        ValueRef::Float(v) => Value::Float(v.into()),
        ValueRef::Double(v) => Value::Float(v),
        ValueRef::Decimal(v) => Value::Text(v.to_string()),
        ValueRef::Text(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Timestamp(unit, v) => timestamp(unit, v)
            .map(Value::Timestamp)
            .unwrap_or(Value::Null),
        ValueRef::Date32(days) => DateTime::from_timestamp(i64::from(days) * 86_400, 0)
            .map(Value::Timestamp)
            .unwrap_or(Value::Null),
        other => Value::Text(format!("{other:?}")),
    }
}
