//! # Weir ODBC
//!
//! ODBC backend for weir using the [odbc-api](https://docs.rs/odbc-api)
//! re-export of [arrow-odbc](https://docs.rs/arrow-odbc). Statements are
//! written in the PostgreSQL dialect.
//!
//! ```rust,ignore
//! use weir_core::executor::{Connector, QueryExecutor};
//! use weir_odbc::OdbcConnector;
//!
//! let connection_string: &str = "\
//!     Driver={PostgreSQL Unicode};\
//!     Server=localhost;\
//!     UID=postgres;\
//!     PWD=postgres;\
//! ";
//!
//! let connector = OdbcConnector::new(connection_string);
//! let mut session = connector.connect()?;
//! let rows = session.query("SELECT count(*) FROM sales.orders", &[])?;
//! ```

use std::sync::OnceLock;

use arrow_odbc::odbc_api::{ConnectionOptions, Environment};
use tracing::debug;
use weir_core::executor::{Connector, ExecutorError, QueryExecutor};
use weir_core::sql::Dialect;

pub mod error;
pub mod executor;

pub use error::OdbcError;
pub use executor::OdbcExecutor;

static ENVIRONMENT: OnceLock<Environment> = OnceLock::new();

/// The process wide ODBC environment, created on first use
fn environment() -> Result<&'static Environment, OdbcError> {
    if let Some(environment) = ENVIRONMENT.get() {
        return Ok(environment);
    }
    let environment = Environment::new()?;
    Ok(ENVIRONMENT.get_or_init(|| environment))
}

/// Opens a new ODBC connection for every session.
///
/// The connection string is never logged nor included in errors.
#[derive(Clone)]
pub struct OdbcConnector {
    connection_string: String,
    login_timeout_sec: Option<u32>,
}

impl std::fmt::Debug for OdbcConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OdbcConnector")
            .field("login_timeout_sec", &self.login_timeout_sec)
            .finish_non_exhaustive()
    }
}

impl OdbcConnector {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            login_timeout_sec: None,
        }
    }

    pub fn with_login_timeout(mut self, seconds: u32) -> Self {
        self.login_timeout_sec = Some(seconds);
        self
    }
}

impl Connector for OdbcConnector {
    fn connect(&self) -> Result<Box<dyn QueryExecutor>, ExecutorError> {
        let options = ConnectionOptions {
            login_timeout_sec: self.login_timeout_sec,
            ..Default::default()
        };

        let connection = environment()
            .and_then(|env| {
                Ok(env.connect_with_connection_string(&self.connection_string, options)?)
            })
            .map_err(OdbcError::into_connection_error)?;
        debug!("Opened ODBC connection");

        let executor = OdbcExecutor::new(connection, Dialect::Postgres)
            .map_err(OdbcError::into_connection_error)?;
        Ok(Box::new(executor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_hides_connection_string() {
        let connector = OdbcConnector::new("Driver={PostgreSQL Unicode};UID=etl;PWD=hunter2;")
            .with_login_timeout(5);

        let rendered = format!("{connector:?}");

        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("login_timeout_sec: Some(5)"));
    }
}
