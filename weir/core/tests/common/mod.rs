//! Shared fixtures for the weir-core integration tests: an `orders` job, a
//! DuckDB source table and small query helpers.

#![allow(dead_code)]

use std::rc::Rc;

use chrono::{DateTime, TimeZone, Utc};
use weir_core::executor::{Connector, ExecuteOptions, QueryExecutor, Rows, Value};
use weir_core::sql::Dialect;
use weir_duckdb::DuckDbConnector;
use weir_schemas::{
    Column, ExtractSettings, Job, RetrySettings, TargetTable, WindowSettings,
};

pub const EXTRACT_QUERY: &str = "SELECT order_id, customer, amount, updated_at FROM src.orders \
     WHERE updated_at >= {window_start} AND updated_at < {window_end}";

/// Midnight UTC of a day in January 2026
pub fn jan(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, day, 0, 0, 0).unwrap()
}

pub fn orders_target() -> TargetTable {
    let column = |name: &str, data_type: &str, nullable: bool| {
        Column::builder()
            .name(name.to_string())
            .data_type(data_type.to_string())
            .nullable(nullable)
            .build()
    };

    TargetTable::builder()
        .schema("sales".to_string())
        .name("orders".to_string())
        .columns(vec![
            column("order_id", "BIGINT", false),
            column("customer", "VARCHAR", true),
            column("amount", "DOUBLE", false),
            column("updated_at", "TIMESTAMP", true),
        ])
        .unique_key(vec!["order_id".to_string()])
        .build()
}

pub fn orders_job(window: WindowSettings) -> Job {
    Job::builder()
        .name("orders".to_string())
        .version("2.1".to_string())
        .environment("test".to_string())
        .sources(vec!["src.orders".to_string()])
        .target_database("warehouse".to_string())
        .target(orders_target())
        .extract(
            ExtractSettings::builder()
                .query(EXTRACT_QUERY.to_string())
                .date_columns(vec!["updated_at".to_string()])
                .build(),
        )
        .window(window)
        .retry(RetrySettings::builder().backoff_secs(0).build())
        .build()
}

pub fn connector() -> Rc<dyn Connector> {
    Rc::new(DuckDbConnector::in_memory().unwrap())
}

pub fn execute(connector: &dyn Connector, statement: &str) {
    let mut session = connector.connect().unwrap();
    session
        .execute(statement, &[], ExecuteOptions::COMMIT)
        .unwrap();
}

pub fn query(connector: &dyn Connector, statement: &str) -> Rows {
    let mut session = connector.connect().unwrap();
    session.query(statement, &[]).unwrap()
}

pub fn count(connector: &dyn Connector, table: &str) -> i64 {
    query(connector, &format!("SELECT count(*) FROM {table}"))
        .first_value()
        .and_then(Value::as_i64)
        .unwrap()
}

pub fn create_target(connector: &dyn Connector) {
    for statement in Dialect::DuckDb.create_target_table(&orders_target()) {
        execute(connector, &statement);
    }
}

/// Source table with three orders updated on January 3rd, 5th and 20th
pub fn create_source(connector: &dyn Connector) {
    execute(connector, "CREATE SCHEMA src");
    execute(
        connector,
        "CREATE TABLE src.orders (order_id BIGINT, customer VARCHAR, amount DOUBLE, updated_at TIMESTAMP)",
    );
    execute(
        connector,
        "INSERT INTO src.orders VALUES \
         (1, 'ada', 10.0, TIMESTAMP '2026-01-03 08:00:00'), \
         (2, 'bob', 20.0, TIMESTAMP '2026-01-05 12:30:00'), \
         (3, 'cyd', 30.0, TIMESTAMP '2026-01-20 00:00:00')",
    );
}
