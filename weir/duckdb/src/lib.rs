//! # Weir DuckDB
//!
//! Embedded [DuckDB](https://duckdb.org) backend for weir, built on the
//! [duckdb](https://docs.rs/duckdb) crate.
//!
//! ```rust,no_run
//! use weir_core::executor::{Connector, QueryExecutor};
//! use weir_duckdb::DuckDbConnector;
//!
//! let connector = DuckDbConnector::open("warehouse.duckdb").unwrap();
//! let mut session = connector.connect().unwrap();
//! let rows = session.query("SELECT 42 AS answer", &[]).unwrap();
//! assert_eq!(rows.len(), 1);
//! ```

use std::path::Path;

use duckdb::Connection;
use tracing::debug;
use weir_core::executor::{Connector, ExecutorError, QueryExecutor};

pub mod error;
pub mod executor;

pub use error::DuckDbError;
pub use executor::DuckDbExecutor;

/// Hands out sessions on one DuckDB database.
///
/// Every session is its own connection on the same database instance, so
/// sessions see each other's committed work, including that of an in-memory
/// database.
pub struct DuckDbConnector {
    connection: Connection,
    location: String,
}

impl std::fmt::Debug for DuckDbConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuckDbConnector")
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

impl DuckDbConnector {
    /// Opens (or creates) the database file at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ExecutorError> {
        let location = path.as_ref().display().to_string();
        let connection = Connection::open(path)
            .map_err(|err| DuckDbError::from(err).into_connection_error())?;

        debug!("Opened DuckDB database {location}");
        Ok(Self {
            connection,
            location,
        })
    }

    /// A fresh in-memory database
    pub fn in_memory() -> Result<Self, ExecutorError> {
        let connection = Connection::open_in_memory()
            .map_err(|err| DuckDbError::from(err).into_connection_error())?;

        Ok(Self {
            connection,
            location: ":memory:".to_string(),
        })
    }

    /// File database when `path` is set, in-memory otherwise
    pub fn from_path(path: Option<&str>) -> Result<Self, ExecutorError> {
        match path {
            Some(path) => Self::open(path),
            None => Self::in_memory(),
        }
    }

    pub fn location(&self) -> &str {
        &self.location
    }
}

impl Connector for DuckDbConnector {
    fn connect(&self) -> Result<Box<dyn QueryExecutor>, ExecutorError> {
        let connection = self
            .connection
            .try_clone()
            .map_err(|err| DuckDbError::from(err).into_connection_error())?;

        Ok(Box::new(DuckDbExecutor::new(connection)))
    }
}
