//! Pulling one window of source data into a staging batch.

use std::path::PathBuf;

use tracing::{info, instrument, warn};
use weir_schemas::{ExtractSettings, Job, TargetTable};

use crate::batch::{BatchError, ObservedRange, StagingBatch};
use crate::executor::Connector;
use crate::sql::Dialect;
use crate::window::Window;

/// Placeholder replaced by the window start literal
pub const WINDOW_START: &str = "{window_start}";
/// Placeholder replaced by the window end literal
pub const WINDOW_END: &str = "{window_end}";

/// Result of extracting one window.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    /// Extracted rows, with the run key column set to the run id
    pub batch: StagingBatch,
    /// Date range covered by the configured date columns
    pub observed: Option<ObservedRange>,
    /// Batch file, when the job writes one
    pub file: Option<PathBuf>,
}

/// Produces the batch of one run.
pub trait Extractor {
    fn extract(&mut self, window: &Window, run_id: i64) -> crate::Result<Extraction>;
}

/// Runs the job's extract query against the source database.
pub struct SqlExtractor {
    connector: Box<dyn Connector>,
    target: TargetTable,
    settings: ExtractSettings,
}

impl std::fmt::Debug for SqlExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlExtractor")
            .field("target", &self.target.qualified_name())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl SqlExtractor {
    pub fn new(connector: Box<dyn Connector>, target: TargetTable, settings: ExtractSettings) -> Self {
        Self {
            connector,
            target,
            settings,
        }
    }

    pub fn from_job(job: &Job, connector: Box<dyn Connector>) -> Self {
        Self::new(connector, job.target.clone(), job.extract.clone())
    }

    /// The extract query with both window placeholders replaced by literals
    pub fn render_query(&self, dialect: Dialect, window: &Window) -> String {
        self.settings
            .query
            .replace(WINDOW_START, &dialect.timestamp_literal(&window.start()))
            .replace(WINDOW_END, &dialect.timestamp_literal(&window.end()))
    }

    fn write_file(&self, batch: &StagingBatch, run_id: i64) -> Result<Option<PathBuf>, BatchError> {
        let Some(dir) = &self.settings.output_dir else {
            return Ok(None);
        };

        std::fs::create_dir_all(dir).map_err(|source| BatchError::Io {
            path: dir.clone(),
            source,
        })?;

        let path = dir.join(format!(
            "{}_{}_{run_id}.csv",
            self.target.schema, self.target.name
        ));
        batch.write_delimited(&path, self.settings.delimiter)?;

        Ok(Some(path))
    }
}

impl Extractor for SqlExtractor {
    #[instrument(skip_all, fields(run_id = run_id), err)]
    fn extract(&mut self, window: &Window, run_id: i64) -> crate::Result<Extraction> {
        let mut session = self.connector.connect()?;
        let query = self.render_query(session.dialect(), window);

        let rows = session.query(&query, &[])?;
        let mut batch = StagingBatch::from_rows(&rows);
        batch.set_column(&self.target.run_key, Some(run_id.to_string()));

        let observed = batch.observed_range(&self.settings.date_columns)?;
        if let Some(range) = observed {
            if range.min() < window.start() || range.max() > window.end() {
                warn!(
                    observed_min = %range.min(),
                    observed_max = %range.max(),
                    "Extracted rows reach outside the window"
                );
            }
        }

        let file = self.write_file(&batch, run_id)?;
        info!("Extracted {} rows", batch.len());

        Ok(Extraction {
            batch,
            observed,
            file,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecuteOptions, ExecutorError, QueryExecutor, Rows, TableRef, Value};
    use chrono::{TimeZone, Utc};
    use std::cell::RefCell;
    use std::rc::Rc;
    use weir_schemas::Column;

    /// Serves a fixed result and remembers the statements it saw
    struct FixedSource {
        rows: Rows,
        seen: Rc<RefCell<Vec<String>>>,
    }

    impl QueryExecutor for FixedSource {
        fn dialect(&self) -> Dialect {
            Dialect::DuckDb
        }

        fn execute(
            &mut self,
            statement: &str,
            _params: &[Value],
            _options: ExecuteOptions,
        ) -> Result<Option<Rows>, ExecutorError> {
            self.seen.borrow_mut().push(statement.to_string());
            Ok(Some(self.rows.clone()))
        }

        fn bulk_load(&mut self, _: &TableRef, _: &StagingBatch) -> Result<u64, ExecutorError> {
            Ok(0)
        }

        fn commit(&mut self) -> Result<(), ExecutorError> {
            Ok(())
        }

        fn rollback(&mut self) -> Result<(), ExecutorError> {
            Ok(())
        }
    }

    struct FixedConnector {
        rows: Rows,
        seen: Rc<RefCell<Vec<String>>>,
    }

    impl Connector for FixedConnector {
        fn connect(&self) -> Result<Box<dyn QueryExecutor>, ExecutorError> {
            Ok(Box::new(FixedSource {
                rows: self.rows.clone(),
                seen: self.seen.clone(),
            }))
        }
    }

    fn day(d: u32) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, d, 0, 0, 0).unwrap()
    }

    fn sql_extractor(rows: Rows, output_dir: Option<PathBuf>) -> (SqlExtractor, Rc<RefCell<Vec<String>>>) {
        let seen = Rc::new(RefCell::new(vec![]));
        let target = TargetTable::builder()
            .schema("sales".to_string())
            .name("orders".to_string())
            .columns(vec![
                Column::builder().name("order_id".to_string()).build(),
                Column::builder().name("updated_at".to_string()).build(),
            ])
            .unique_key(vec!["order_id".to_string()])
            .build();
        let settings = ExtractSettings::builder()
            .query(
                "SELECT * FROM src WHERE updated_at >= {window_start} AND updated_at < {window_end}"
                    .to_string(),
            )
            .date_columns(vec!["updated_at".to_string()])
            .maybe_output_dir(output_dir)
            .build();

        let connector = FixedConnector {
            rows,
            seen: seen.clone(),
        };
        (SqlExtractor::new(Box::new(connector), target, settings), seen)
    }

    fn orders() -> Rows {
        Rows::new(
            vec!["order_id".into(), "updated_at".into()],
            vec![
                vec![Value::Int(1), Value::Timestamp(day(3))],
                vec![Value::Int(2), Value::Timestamp(day(5))],
            ],
        )
    }

    #[test]
    fn test_extract_renders_window_and_stamps_run_key() {
        let (mut extractor, seen) = sql_extractor(orders(), None);
        let window = Window::new(day(2), day(9)).unwrap();

        let extraction = extractor.extract(&window, 42).unwrap();

        assert_eq!(
            seen.borrow()[0],
            "SELECT * FROM src WHERE updated_at >= TIMESTAMP '2026-01-02 00:00:00.000000' \
             AND updated_at < TIMESTAMP '2026-01-09 00:00:00.000000'"
        );
        assert_eq!(extraction.batch.columns()[0], "etl_runs_key");
        assert!(extraction
            .batch
            .rows()
            .iter()
            .all(|row| row[0].as_deref() == Some("42")));

        let observed = extraction.observed.unwrap();
        assert_eq!((observed.min(), observed.max()), (day(3), day(5)));
        assert!(extraction.file.is_none());
    }

    #[test]
    fn test_extract_writes_batch_file() {
        let dir = tempfile::tempdir().unwrap();
        let (mut extractor, _) = sql_extractor(orders(), Some(dir.path().join("out")));
        let window = Window::new(day(2), day(9)).unwrap();

        let extraction = extractor.extract(&window, 7).unwrap();

        let file = extraction.file.unwrap();
        assert!(file.ends_with("sales_orders_7.csv"));

        let reread = StagingBatch::read_delimited(&file, ';').unwrap().unwrap();
        assert_eq!(reread, extraction.batch);
    }

    #[test]
    fn test_empty_extract_has_no_observed_range() {
        let (mut extractor, _) = sql_extractor(
            Rows::new(vec!["order_id".into(), "updated_at".into()], vec![]),
            None,
        );
        let window = Window::new(day(2), day(9)).unwrap();

        let extraction = extractor.extract(&window, 1).unwrap();

        assert!(extraction.batch.is_empty());
        assert!(extraction.observed.is_none());
    }

    #[test]
    fn test_null_date_is_data_validation_error() {
        let rows = Rows::new(
            vec!["order_id".into(), "updated_at".into()],
            vec![vec![Value::Int(1), Value::Null]],
        );
        let (mut extractor, _) = sql_extractor(rows, None);
        let window = Window::new(day(2), day(9)).unwrap();

        let err = extractor.extract(&window, 1).unwrap_err();

        assert_eq!(err.kind(), crate::error::ErrorKind::DataValidation);
    }
}
