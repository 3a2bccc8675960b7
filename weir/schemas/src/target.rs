//! Target table descriptors.
//!
//! The descriptor is the single source of truth for everything the loader
//! generates: the ordered column list of the staging batch, the natural key
//! used to match rows and the bookkeeping columns stamped on every merge.

use bon::Builder;
use serde::{Deserialize, Serialize};

use crate::serde_helpers::{default_data_type, default_run_key, default_true};

/// A column of the target table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[serde(rename_all = "snake_case")]
pub struct Column {
    /// Column name as it appears in the target table and the staged batch
    pub name: String,

    /// SQL type used when the target table is created by weir
    #[serde(default = "default_data_type", alias = "type")]
    #[builder(default = default_data_type())]
    pub data_type: String,

    /// Whether the column accepts NULL
    #[serde(default = "default_true")]
    #[builder(default = true)]
    pub nullable: bool,
}

/// The relational table a job loads into.
///
/// # Examples
///
/// ```
/// use weir_schemas::{Column, TargetTable};
///
/// let target = TargetTable::builder()
///     .schema("sales".to_string())
///     .name("orders".to_string())
///     .columns(vec![
///         Column::builder().name("order_id".to_string()).data_type("BIGINT".to_string()).build(),
///         Column::builder().name("amount".to_string()).data_type("DOUBLE".to_string()).build(),
///     ])
///     .unique_key(vec!["order_id".to_string()])
///     .build();
///
/// assert_eq!(target.qualified_name(), "sales.orders");
/// assert_eq!(target.run_key, "etl_runs_key");
/// assert_eq!(target.non_key_columns().count(), 1);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[serde(rename_all = "snake_case")]
pub struct TargetTable {
    /// Schema (namespace) of the table
    pub schema: String,

    /// Unqualified table name
    #[serde(alias = "table")]
    pub name: String,

    /// Business columns in load order, excluding the run key and timestamps
    pub columns: Vec<Column>,

    /// Subset of `columns` identifying a row, used as the merge predicate
    pub unique_key: Vec<String>,

    /// Column holding the id of the run that last wrote the row
    #[serde(default = "default_run_key")]
    #[builder(default = default_run_key())]
    pub run_key: String,
}

impl TargetTable {
    /// `schema.name`, as stored in the audit table
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    /// Looks up a business column by name, ignoring ASCII case
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Whether `name` is part of the natural key, ignoring ASCII case
    pub fn is_key(&self, name: &str) -> bool {
        self.unique_key.iter().any(|k| k.eq_ignore_ascii_case(name))
    }

    /// Business columns that are updated when a staged row matches
    pub fn non_key_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| !self.is_key(&c.name))
    }

    /// Column names of a staged batch: the run key followed by the business columns
    pub fn staged_columns(&self) -> Vec<String> {
        std::iter::once(self.run_key.clone())
            .chain(self.columns.iter().map(|c| c.name.clone()))
            .collect()
    }
}
