//! Stage-and-merge loading.
//!
//! A batch is bulk loaded into a staging copy of the target table and merged
//! from there with a single `MERGE`, all inside one transaction on one
//! session. Either every row of the batch lands in the target or none does.

use std::path::Path;

use miette::Diagnostic;
use tracing::{debug, error, info, instrument};
use weir_schemas::TargetTable;

use crate::batch::{BatchError, StagingBatch};
use crate::error::ErrorKind;
use crate::executor::{ExecuteOptions, ExecutorError, QueryExecutor};
use crate::sql::MergeClauses;

#[derive(Debug, thiserror::Error, Diagnostic)]
pub enum LoadError {
    #[error("Batch column '{column}' is not a column of {table}")]
    #[diagnostic(
        code(weir::loader::unknown_column),
        help("Batch columns must be the run key or one of the target's configured columns")
    )]
    UnknownColumn { table: String, column: String },

    #[error("Batch for {table} lacks the key column '{column}'")]
    #[diagnostic(code(weir::loader::missing_key))]
    MissingKeyColumn { table: String, column: String },

    #[error("Load step '{step}' into {table} failed, transaction rolled back")]
    #[diagnostic(code(weir::loader::step))]
    Step {
        step: &'static str,
        table: String,
        #[source]
        source: ExecutorError,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Batch(#[from] BatchError),
}

impl LoadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LoadError::UnknownColumn { .. } | LoadError::MissingKeyColumn { .. } => {
                ErrorKind::Configuration
            }
            LoadError::Step { source, .. } => source.kind(),
            LoadError::Batch(source) => source.kind(),
        }
    }
}

/// What a call to [`StageAndMergeLoader::load`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Nothing to load, no statement was issued
    Skipped,
    /// The batch was merged, `rows` staged rows
    Merged { rows: u64 },
}

impl LoadOutcome {
    pub fn rows(&self) -> u64 {
        match self {
            LoadOutcome::Skipped => 0,
            LoadOutcome::Merged { rows } => *rows,
        }
    }
}

/// Loads batches into one target table.
#[derive(Debug, Clone)]
pub struct StageAndMergeLoader {
    target: TargetTable,
}

impl StageAndMergeLoader {
    pub fn new(target: TargetTable) -> Self {
        Self { target }
    }

    pub fn target(&self) -> &TargetTable {
        &self.target
    }

    /// Stages `batch` and merges it into the target, committing once.
    ///
    /// An empty batch issues no statement at all. On any failure the
    /// transaction is rolled back and the failing step is reported.
    #[instrument(skip_all, fields(target = %self.target.qualified_name(), rows = batch.len()), err)]
    pub fn load(
        &self,
        executor: &mut dyn QueryExecutor,
        batch: &StagingBatch,
    ) -> Result<LoadOutcome, LoadError> {
        if batch.is_empty() {
            info!("Empty batch, nothing to load");
            return Ok(LoadOutcome::Skipped);
        }

        self.check_columns(batch)?;

        let result = self.stage_and_merge(executor, batch);

        match result {
            Ok(rows) => {
                executor.commit().map_err(|source| self.step_error("commit", source))?;
                info!("Merged {rows} rows");
                Ok(LoadOutcome::Merged { rows })
            }
            Err(err) => {
                error!("ROLLBACK transaction: {err:?}");
                if let Err(rollback) = executor.rollback() {
                    error!("Rollback failed: {rollback}");
                }
                Err(err)
            }
        }
    }

    /// Reads a delimited batch file and loads it; a missing file loads nothing
    #[instrument(skip_all, fields(path = %path.as_ref().display()), err)]
    pub fn load_file<P: AsRef<Path>>(
        &self,
        executor: &mut dyn QueryExecutor,
        path: P,
        delimiter: char,
    ) -> Result<LoadOutcome, LoadError> {
        match StagingBatch::read_delimited(path, delimiter)? {
            Some(batch) => self.load(executor, &batch),
            None => {
                info!("No batch file, nothing to load");
                Ok(LoadOutcome::Skipped)
            }
        }
    }

    fn stage_and_merge(
        &self,
        executor: &mut dyn QueryExecutor,
        batch: &StagingBatch,
    ) -> Result<u64, LoadError> {
        let dialect = executor.dialect();
        let (staging, create_staging) = dialect.create_staging_table(&self.target);

        debug!("Creating staging table {staging}");
        executor
            .execute(&create_staging, &[], ExecuteOptions::STATEMENT)
            .map_err(|source| self.step_error("create staging table", source))?;

        let rows = executor
            .bulk_load(&staging, batch)
            .map_err(|source| self.step_error("bulk load", source))?;
        debug!("Staged {rows} rows into {staging}");

        let merge = MergeClauses::for_target(&self.target, dialect)
            .merge_statement(&self.target.qualified_name(), &staging.qualified());
        debug!("Merge statement: {merge}");
        executor
            .execute(&merge, &[], ExecuteOptions::STATEMENT)
            .map_err(|source| self.step_error("merge", source))?;

        executor
            .execute(&format!("DROP TABLE {staging}"), &[], ExecuteOptions::STATEMENT)
            .map_err(|source| self.step_error("drop staging table", source))?;

        Ok(rows)
    }

    fn check_columns(&self, batch: &StagingBatch) -> Result<(), LoadError> {
        let table = self.target.qualified_name();

        if let Some(column) = batch.columns().iter().find(|c| {
            !c.eq_ignore_ascii_case(&self.target.run_key) && self.target.column(c).is_none()
        }) {
            return Err(LoadError::UnknownColumn {
                table,
                column: column.clone(),
            });
        }

        if let Some(key) = self
            .target
            .unique_key
            .iter()
            .find(|k| batch.column_index(k).is_none())
        {
            return Err(LoadError::MissingKeyColumn {
                table,
                column: key.clone(),
            });
        }

        Ok(())
    }

    fn step_error(&self, step: &'static str, source: ExecutorError) -> LoadError {
        LoadError::Step {
            step,
            table: self.target.qualified_name(),
            source,
        }
    }
}
