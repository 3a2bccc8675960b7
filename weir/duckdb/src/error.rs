use thiserror::Error;
use weir_core::executor::ExecutorError;

pub(crate) const BACKEND: &str = "duckdb";

/// Failures of the DuckDB backend before they cross into weir.
#[derive(Error, Debug)]
pub enum DuckDbError {
    #[error(transparent)]
    DuckDb(#[from] duckdb::Error),
}

impl DuckDbError {
    /// Write-write conflicts between concurrent transactions go away on retry
    pub fn is_transient(&self) -> bool {
        match self {
            DuckDbError::DuckDb(err) => is_conflict(&err.to_string()),
        }
    }

    pub(crate) fn into_connection_error(self) -> ExecutorError {
        ExecutorError::Connection {
            backend: BACKEND,
            transient: self.is_transient(),
            message: self.to_string(),
        }
    }
}

impl From<DuckDbError> for ExecutorError {
    fn from(err: DuckDbError) -> Self {
        ExecutorError::Statement {
            transient: err.is_transient(),
            message: err.to_string(),
        }
    }
}

pub(crate) fn is_conflict(message: &str) -> bool {
    message.contains("Conflict on") || message.contains("write-write conflict")
}
