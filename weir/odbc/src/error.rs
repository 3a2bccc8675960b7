use thiserror::Error;
use weir_core::executor::ExecutorError;

pub(crate) const BACKEND: &str = "odbc";

/// SQLSTATE values worth retrying besides the connection class `08`
const TRANSIENT_STATES: [&str; 4] = ["HYT00", "HYT01", "40001", "40P01"];

/// Error types for ODBC operations.
///
/// IMPORTANT: This type never includes connection strings or other sensitive
/// information in error messages to prevent password leakage.
#[derive(Error, Debug)]
pub enum OdbcError {
    #[error(transparent)]
    OdbcApi(#[from] arrow_odbc::odbc_api::Error),

    #[error("Statement did not produce a result set")]
    NoResultSet,
}

impl OdbcError {
    /// Five character SQLSTATE reported by the driver, if any
    pub fn sqlstate(&self) -> Option<String> {
        match self {
            OdbcError::OdbcApi(arrow_odbc::odbc_api::Error::Diagnostics { record, .. }) => {
                Some(record.state.as_str().to_string())
            }
            _ => None,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.sqlstate()
            .is_some_and(|state| is_transient_sqlstate(&state))
    }

    pub(crate) fn into_connection_error(self) -> ExecutorError {
        ExecutorError::Connection {
            backend: BACKEND,
            transient: self.is_transient(),
            message: self.to_string(),
        }
    }
}

impl From<OdbcError> for ExecutorError {
    fn from(err: OdbcError) -> Self {
        ExecutorError::Statement {
            transient: err.is_transient(),
            message: err.to_string(),
        }
    }
}

/// Connection exceptions, timeouts, serialization failures and deadlocks
pub fn is_transient_sqlstate(state: &str) -> bool {
    state.starts_with("08") || TRANSIENT_STATES.contains(&state)
}
