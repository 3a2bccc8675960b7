//! SQL text generation.
//!
//! Every statement weir issues is produced here from a typed descriptor
//! ([`TargetTable`], [`AuditSettings`]) so that column lists cannot drift
//! between the DDL, the staging table and the merge.

use chrono::{DateTime, Utc};
use weir_schemas::{AuditSettings, TargetTable};

use crate::executor::{format_timestamp, TableRef};

/// Prefix of staging table names
const STAGING_PREFIX: &str = "temp_";

/// SQL dialect of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// PostgreSQL and compatible servers, usually reached over ODBC
    Postgres,
    /// Embedded DuckDB
    DuckDb,
}

impl Dialect {
    /// Column type for timestamps written by weir
    pub fn timestamp_type(&self) -> &'static str {
        match self {
            Dialect::Postgres => "TIMESTAMPTZ",
            Dialect::DuckDb => "TIMESTAMP",
        }
    }

    /// Expression for the current instant, matching [`Dialect::timestamp_type`]
    pub fn current_timestamp(&self) -> &'static str {
        match self {
            Dialect::Postgres => "CURRENT_TIMESTAMP",
            Dialect::DuckDb => "CAST(now() AS TIMESTAMP)",
        }
    }

    /// Literal usable in both dialects for an instant
    pub fn timestamp_literal(&self, ts: &DateTime<Utc>) -> String {
        match self {
            Dialect::Postgres => format!("TIMESTAMPTZ '{}+00'", format_timestamp(ts)),
            Dialect::DuckDb => format!("TIMESTAMP '{}'", format_timestamp(ts)),
        }
    }

    /// Staging table for `target` and the statement creating it.
    ///
    /// Postgres gets a session temp table copying constraints, indexes and
    /// defaults. DuckDB cannot bulk append into temp tables, so it gets a
    /// regular table in the target schema. Created inside the load
    /// transaction, it disappears on rollback.
    pub fn create_staging_table(&self, target: &TargetTable) -> (TableRef, String) {
        let staging_name = format!("{STAGING_PREFIX}{}", target.name);

        match self {
            Dialect::Postgres => {
                let sql = format!(
                    "CREATE TEMP TABLE {staging_name} (LIKE {} INCLUDING CONSTRAINTS INCLUDING INDEXES INCLUDING DEFAULTS)",
                    target.qualified_name()
                );
                (TableRef::new(None, staging_name), sql)
            }
            Dialect::DuckDb => {
                let staging = TableRef::new(Some(target.schema.clone()), staging_name);
                let sql = format!(
                    "CREATE TABLE {staging} AS SELECT * FROM {} LIMIT 0",
                    target.qualified_name()
                );
                (staging, sql)
            }
        }
    }

    /// `CREATE TABLE IF NOT EXISTS` for a target table, with the run key and
    /// bookkeeping columns weir maintains
    pub fn create_target_table(&self, target: &TargetTable) -> Vec<String> {
        let ts = self.timestamp_type();
        let mut columns = vec![format!("{} BIGINT", target.run_key)];

        columns.extend(target.columns.iter().map(|c| {
            let null = if c.nullable { "" } else { " NOT NULL" };
            format!("{} {}{null}", c.name, c.data_type)
        }));
        columns.push(format!("created_at {ts}"));
        columns.push(format!("modified_at {ts}"));
        columns.push(format!("UNIQUE ({})", target.unique_key.join(", ")));

        vec![
            format!("CREATE SCHEMA IF NOT EXISTS {}", target.schema),
            format!(
                "CREATE TABLE IF NOT EXISTS {} ({})",
                target.qualified_name(),
                columns.join(", ")
            ),
        ]
    }

    /// Idempotent DDL for the audit schema and table
    pub fn audit_ddl(&self, audit: &AuditSettings) -> Vec<String> {
        let ts = self.timestamp_type();
        let table = audit.qualified_name();

        let mut statements = vec![format!("CREATE SCHEMA IF NOT EXISTS {}", audit.schema)];

        let run_id = match self {
            Dialect::Postgres => "run_id BIGSERIAL PRIMARY KEY".to_string(),
            Dialect::DuckDb => {
                let sequence = format!("{table}_run_id_seq");
                statements.push(format!("CREATE SEQUENCE IF NOT EXISTS {sequence}"));
                format!("run_id BIGINT PRIMARY KEY DEFAULT nextval('{sequence}')")
            }
        };

        statements.push(format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
             {run_id}, \
             load_mode VARCHAR(1) NOT NULL, \
             sources VARCHAR, \
             target_database VARCHAR, \
             target_table VARCHAR NOT NULL, \
             window_start {ts}, \
             window_end {ts}, \
             observed_min_date {ts}, \
             observed_max_date {ts}, \
             started_at {ts}, \
             ended_at {ts}, \
             environment VARCHAR, \
             status VARCHAR NOT NULL, \
             script_version VARCHAR, \
             record_count BIGINT, \
             previous_high_water_mark {ts}, \
             created_at {ts}, \
             modified_at {ts})"
        ));

        statements
    }
}

/// The four fragments of a merge statement, derived from a target descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeClauses {
    /// `t.k = s.k AND ...` over the unique key
    pub match_predicate: String,
    /// `SET` list for matched rows
    pub update_assignment: String,
    /// Column list of the insert branch
    pub insert_column_list: String,
    /// Value list of the insert branch
    pub insert_value_list: String,
}

impl MergeClauses {
    /// Builds the fragments for `target`.
    ///
    /// Matched rows get their non-key columns, the run key and `modified_at`
    /// refreshed. New rows get `created_at` and `modified_at` stamped.
    pub fn for_target(target: &TargetTable, dialect: Dialect) -> Self {
        let now = dialect.current_timestamp();
        let run_key = &target.run_key;

        let match_predicate = target
            .unique_key
            .iter()
            .map(|k| format!("t.{k} = s.{k}"))
            .collect::<Vec<_>>()
            .join(" AND ");

        let update_assignment = std::iter::once(format!("{run_key} = s.{run_key}"))
            .chain(
                target
                    .non_key_columns()
                    .map(|c| format!("{name} = s.{name}", name = c.name)),
            )
            .chain(std::iter::once(format!("modified_at = {now}")))
            .collect::<Vec<_>>()
            .join(", ");

        let business = target.columns.iter().map(|c| c.name.as_str());

        let insert_column_list = std::iter::once(run_key.as_str())
            .chain(business.clone())
            .chain(["created_at", "modified_at"])
            .collect::<Vec<_>>()
            .join(", ");

        let insert_value_list = std::iter::once(format!("s.{run_key}"))
            .chain(business.map(|c| format!("s.{c}")))
            .chain([now.to_string(), now.to_string()])
            .collect::<Vec<_>>()
            .join(", ");

        Self {
            match_predicate,
            update_assignment,
            insert_column_list,
            insert_value_list,
        }
    }

    /// The complete `MERGE` of `staging` into `target`
    pub fn merge_statement(&self, target: &str, staging: &str) -> String {
        format!(
            "MERGE INTO {target} AS t USING {staging} AS s ON {} \
             WHEN MATCHED THEN UPDATE SET {} \
             WHEN NOT MATCHED THEN INSERT ({}) VALUES ({})",
            self.match_predicate,
            self.update_assignment,
            self.insert_column_list,
            self.insert_value_list
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weir_schemas::Column;

    fn orders() -> TargetTable {
        TargetTable::builder()
            .schema("sales".to_string())
            .name("orders".to_string())
            .columns(vec![
                Column::builder().name("region".to_string()).build(),
                Column::builder().name("order_id".to_string()).build(),
                Column::builder().name("amount".to_string()).build(),
            ])
            .unique_key(vec!["region".to_string(), "order_id".to_string()])
            .build()
    }

    #[test]
    fn test_merge_clauses_from_descriptor() {
        let clauses = MergeClauses::for_target(&orders(), Dialect::Postgres);

        assert_eq!(
            clauses.match_predicate,
            "t.region = s.region AND t.order_id = s.order_id"
        );
        assert_eq!(
            clauses.update_assignment,
            "etl_runs_key = s.etl_runs_key, amount = s.amount, modified_at = CURRENT_TIMESTAMP"
        );
        assert_eq!(
            clauses.insert_column_list,
            "etl_runs_key, region, order_id, amount, created_at, modified_at"
        );
        assert_eq!(
            clauses.insert_value_list,
            "s.etl_runs_key, s.region, s.order_id, s.amount, CURRENT_TIMESTAMP, CURRENT_TIMESTAMP"
        );
    }

    #[test]
    fn test_merge_statement_shape() {
        let clauses = MergeClauses::for_target(&orders(), Dialect::DuckDb);
        let sql = clauses.merge_statement("sales.orders", "sales.temp_orders");

        assert!(sql.starts_with("MERGE INTO sales.orders AS t USING sales.temp_orders AS s ON t.region"));
        assert!(sql.contains("WHEN MATCHED THEN UPDATE SET etl_runs_key = s.etl_runs_key"));
        assert!(sql.contains("WHEN NOT MATCHED THEN INSERT (etl_runs_key, region"));
        assert!(sql.ends_with("CAST(now() AS TIMESTAMP), CAST(now() AS TIMESTAMP))"));
    }

    #[test]
    fn test_staging_table_per_dialect() {
        let (pg_table, pg_sql) = Dialect::Postgres.create_staging_table(&orders());
        assert_eq!(pg_table.qualified(), "temp_orders");
        assert_eq!(
            pg_sql,
            "CREATE TEMP TABLE temp_orders (LIKE sales.orders INCLUDING CONSTRAINTS INCLUDING INDEXES INCLUDING DEFAULTS)"
        );

        let (duck_table, duck_sql) = Dialect::DuckDb.create_staging_table(&orders());
        assert_eq!(duck_table.qualified(), "sales.temp_orders");
        assert_eq!(
            duck_sql,
            "CREATE TABLE sales.temp_orders AS SELECT * FROM sales.orders LIMIT 0"
        );
    }

    #[test]
    fn test_audit_ddl_is_idempotent_per_dialect() {
        let settings = AuditSettings::default();

        let pg = Dialect::Postgres.audit_ddl(&settings);
        assert_eq!(pg.len(), 2);
        assert!(pg[1].contains("run_id BIGSERIAL PRIMARY KEY"));
        assert!(pg[1].contains("window_start TIMESTAMPTZ"));

        let duck = Dialect::DuckDb.audit_ddl(&settings);
        assert_eq!(duck.len(), 3);
        assert_eq!(duck[1], "CREATE SEQUENCE IF NOT EXISTS audit.etl_runs_run_id_seq");
        assert!(duck.iter().all(|s| s.contains("IF NOT EXISTS")));
    }
}
