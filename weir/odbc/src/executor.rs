use arrow_odbc::odbc_api::buffers::TextRowSet;
use arrow_odbc::odbc_api::parameter::InputParameter;
use arrow_odbc::odbc_api::{Bit, Connection, Cursor, IntoParameter, ResultSetMetadata};
use tracing::debug;
use weir_core::batch::StagingBatch;
use weir_core::executor::{
    format_timestamp, ExecuteOptions, ExecutorError, QueryExecutor, Rows, TableRef, Value,
};
use weir_core::sql::Dialect;

use crate::error::OdbcError;

/// Rows fetched per round trip
const FETCH_BATCH_SIZE: usize = 1000;
/// Upper bound for text cells of a result set
const MAX_TEXT_LENGTH: usize = 8192;
/// Rows sent per bulk insert round trip
const INSERT_BATCH_SIZE: usize = 1000;

/// One ODBC connection with autocommit switched off.
///
/// Results are fetched as text; [`Value`] parses numbers and timestamps back
/// out of it on demand.
pub struct OdbcExecutor {
    connection: Connection<'static>,
    dialect: Dialect,
}

impl std::fmt::Debug for OdbcExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OdbcExecutor")
            .field("dialect", &self.dialect)
            .finish_non_exhaustive()
    }
}

impl OdbcExecutor {
    pub fn new(connection: Connection<'static>, dialect: Dialect) -> Result<Self, OdbcError> {
        connection.set_autocommit(false)?;
        Ok(Self {
            connection,
            dialect,
        })
    }

    fn run(
        &mut self,
        statement: &str,
        params: &[Value],
        want_results: bool,
    ) -> Result<Option<Rows>, OdbcError> {
        let params = params.iter().map(to_parameter).collect::<Vec<_>>();
        let mut prepared = self.connection.prepare(statement)?;
        let cursor = prepared.execute(params.as_slice())?;

        if !want_results {
            return Ok(None);
        }

        let mut cursor = cursor.ok_or(OdbcError::NoResultSet)?;
        let columns = cursor
            .column_names()?
            .collect::<Result<Vec<String>, _>>()?;

        let buffer = TextRowSet::for_cursor(FETCH_BATCH_SIZE, &mut cursor, Some(MAX_TEXT_LENGTH))?;
        let mut row_set_cursor = cursor.bind_buffer(buffer)?;

        let mut rows = Vec::new();
        while let Some(batch) = row_set_cursor.fetch()? {
            for row in 0..batch.num_rows() {
                let cells = (0..batch.num_cols())
                    .map(|col| match batch.at(col, row) {
                        Some(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
                        None => Value::Null,
                    })
                    .collect();
                rows.push(cells);
            }
        }

        Ok(Some(Rows::new(columns, rows)))
    }

    fn insert_rows(&mut self, table: &TableRef, batch: &StagingBatch) -> Result<u64, OdbcError> {
        let columns = batch.columns();
        let sql = format!(
            "INSERT INTO {table} ({}) VALUES ({})",
            columns.join(", "),
            vec!["?"; columns.len()].join(", ")
        );

        // text buffers need room for the longest cell of each column
        let max_str_lens = (0..columns.len()).map(|idx| {
            batch
                .rows()
                .iter()
                .filter_map(|row| row[idx].as_ref().map(String::len))
                .max()
                .unwrap_or(0)
                .max(1)
        });

        let capacity = batch.len().min(INSERT_BATCH_SIZE);
        let prepared = self.connection.prepare(&sql)?;
        let mut inserter = prepared.into_text_inserter(capacity, max_str_lens)?;

        let mut inserted = 0u64;
        for chunk in batch.rows().chunks(capacity) {
            for row in chunk {
                inserter.append(row.iter().map(|cell| cell.as_deref().map(str::as_bytes)))?;
            }
            inserter.execute()?;
            inserted += chunk.len() as u64;
            inserter.clear();
        }

        Ok(inserted)
    }
}

impl QueryExecutor for OdbcExecutor {
    fn dialect(&self) -> Dialect {
        self.dialect
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
            self.commit()?;
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
        self.connection.commit().map_err(OdbcError::from)?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), ExecutorError> {
        self.connection.rollback().map_err(OdbcError::from)?;
        Ok(())
    }
}

/// Timestamps travel as text with an explicit UTC offset
fn to_parameter(value: &Value) -> Box<dyn InputParameter> {
    match value {
        Value::Null => Box::new(None::<String>.into_parameter()),
        Value::Bool(v) => Box::new(Bit::from_bool(*v)),
        Value::Int(v) => Box::new(*v),
        Value::Float(v) => Box::new(*v),
        Value::Text(v) => Box::new(v.clone().into_parameter()),
        Value::Timestamp(ts) => Box::new(format!("{}+00", format_timestamp(ts)).into_parameter()),
    }
}
