//! Connection settings for the target and source databases.

use serde::{Deserialize, Serialize};

/// A database reachable by one of the weir backends.
///
/// Connection strings commonly carry credentials; pass them in as template
/// parameters rather than writing them into the job file.
///
/// # Examples
///
/// ```
/// use weir_schemas::ConnectionConfig;
///
/// let yaml = "type: duck_db\npath: ./warehouse.duckdb\n";
/// let config: ConnectionConfig = serde_yml::from_str(yaml).unwrap();
/// assert_eq!(config, ConnectionConfig::DuckDb { path: Some("./warehouse.duckdb".into()) });
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionConfig {
    /// Embedded DuckDB database, in memory when no path is set
    #[serde(alias = "duckdb")]
    DuckDb {
        /// Database file
        #[serde(default)]
        path: Option<String>,
    },
    /// Any database with an ODBC driver
    Odbc {
        /// ODBC connection string
        connection_string: String,
    },
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig::DuckDb { path: None }
    }
}
