//! End-to-end tests of windows, auditing and stage-and-merge loading against
//! an in-memory DuckDB database.

mod common;

use common::*;
use weir_core::audit::AuditManager;
use weir_core::batch::{ObservedRange, StagingBatch};
use weir_core::executor::{Connector, ExecuteOptions, QueryExecutor, Value};
use weir_core::loader::{LoadError, LoadOutcome, StageAndMergeLoader};
use weir_core::orchestrator::TaskStatus;
use weir_core::run::EtlRun;
use weir_core::sql::Dialect;
use weir_core::window::{WindowOverride, WindowRequest};
use weir_core::ErrorKind;
use weir_schemas::{LoadMode, RunStatus, WindowSettings};

fn staged(run_id: i64, rows: &[(i64, &str, Option<f64>)]) -> StagingBatch {
    StagingBatch::with_rows(
        vec![
            "etl_runs_key".into(),
            "order_id".into(),
            "customer".into(),
            "amount".into(),
        ],
        rows.iter()
            .map(|(id, customer, amount)| {
                vec![
                    Some(run_id.to_string()),
                    Some(id.to_string()),
                    Some(customer.to_string()),
                    amount.map(|a| a.to_string()),
                ]
            })
            .collect(),
    )
    .unwrap()
}

fn full_request(start: &str, mode: &str) -> WindowRequest {
    WindowOverride::parse(Some(start), Some(mode))
        .unwrap()
        .apply(&WindowSettings::default())
        .unwrap()
}

#[test]
fn test_merge_inserts_new_and_updates_matched_rows() {
    let connector = connector();
    create_target(&connector);
    let loader = StageAndMergeLoader::new(orders_target());

    let mut session = connector.connect().unwrap();
    let first = loader
        .load(session.as_mut(), &staged(1, &[(1, "ada", Some(10.0)), (2, "bob", Some(20.0))]))
        .unwrap();
    assert_eq!(first, LoadOutcome::Merged { rows: 2 });

    let before = query(
        &connector,
        "SELECT created_at FROM sales.orders WHERE order_id = 2",
    );

    let second = loader
        .load(session.as_mut(), &staged(2, &[(2, "bob", Some(25.0)), (3, "cyd", Some(30.0))]))
        .unwrap();
    assert_eq!(second.rows(), 2);

    let rows = query(
        &connector,
        "SELECT order_id, etl_runs_key, amount FROM sales.orders ORDER BY order_id",
    );
    assert_eq!(
        rows.rows,
        vec![
            vec![Value::Int(1), Value::Int(1), Value::Float(10.0)],
            vec![Value::Int(2), Value::Int(2), Value::Float(25.0)],
            vec![Value::Int(3), Value::Int(2), Value::Float(30.0)],
        ]
    );

    let after = query(
        &connector,
        "SELECT created_at, modified_at >= created_at FROM sales.orders WHERE order_id = 2",
    );
    assert_eq!(after.rows[0][0], before.rows[0][0]);
    assert_eq!(after.rows[0][1], Value::Bool(true));
    assert_eq!(count(&connector, "sales.orders"), 3);
}

#[test]
fn test_empty_batch_touches_nothing() {
    let connector = connector();
    let loader = StageAndMergeLoader::new(orders_target());
    let mut session = connector.connect().unwrap();

    // The target does not even exist: any statement would fail.
    let outcome = loader.load(session.as_mut(), &staged(1, &[])).unwrap();

    assert_eq!(outcome, LoadOutcome::Skipped);
}

#[test]
fn test_failed_merge_leaves_target_untouched() {
    let connector = connector();
    create_target(&connector);
    let loader = StageAndMergeLoader::new(orders_target());

    let mut session = connector.connect().unwrap();
    loader
        .load(session.as_mut(), &staged(1, &[(1, "ada", Some(10.0))]))
        .unwrap();

    // amount is NOT NULL in the target but not in the staging copy
    let err = loader
        .load(
            session.as_mut(),
            &staged(2, &[(1, "ada", Some(99.0)), (2, "bob", None)]),
        )
        .unwrap_err();

    assert!(matches!(err, LoadError::Step { step: "merge", .. }));
    assert_eq!(err.kind(), ErrorKind::ExternalService);

    let rows = query(&connector, "SELECT etl_runs_key, amount FROM sales.orders");
    assert_eq!(rows.rows, vec![vec![Value::Int(1), Value::Float(10.0)]]);

    let staging = query(
        &connector,
        "SELECT count(*) FROM information_schema.tables WHERE table_name = 'temp_orders'",
    );
    assert_eq!(staging.first_value(), Some(&Value::Int(0)));

    // the session is usable again after the rollback
    let retried = loader
        .load(session.as_mut(), &staged(3, &[(2, "bob", Some(20.0))]))
        .unwrap();
    assert_eq!(retried.rows(), 1);
}

#[test]
fn test_audit_open_and_close_clamps_observed_dates() {
    let connector = connector();
    let job = orders_job(WindowSettings::default());
    let mut audit = AuditManager::from_job(&job, Box::new(connector.clone()));

    let request = full_request("2026-01-01", "mode=F10");
    let opened = audit.open_at(&request, jan(31)).unwrap();
    assert_eq!(opened.window.window.start(), jan(1));
    assert_eq!(opened.window.window.end(), jan(11));

    let in_progress = audit.fetch(opened.run_id).unwrap().unwrap();
    assert_eq!(in_progress.status, RunStatus::InProgress);
    assert_eq!(in_progress.record_count, Some(0));
    assert_eq!(in_progress.observed_max_date, None);

    let observed = ObservedRange::new(
        jan(1) - chrono::Duration::days(7),
        jan(20),
    )
    .unwrap();
    audit
        .close_at(RunStatus::Complete, 5, Some(observed), jan(31))
        .unwrap();

    let record = audit.fetch(opened.run_id).unwrap().unwrap();
    assert_eq!(record.status, RunStatus::Complete);
    assert_eq!(record.load_mode, LoadMode::Full);
    assert_eq!(record.record_count, Some(5));
    assert_eq!(record.observed_min_date, Some(jan(1)));
    assert_eq!(record.observed_max_date, Some(jan(11)));
    assert_eq!(record.window_start, Some(jan(1)));
    assert_eq!(record.window_end, Some(jan(11)));
    assert_eq!(record.started_at, Some(jan(31)));
    assert_eq!(record.ended_at, Some(jan(31)));
    assert_eq!(record.target_table, "sales.orders");
    assert_eq!(record.environment.as_deref(), Some("test"));
    assert_eq!(record.script_version.as_deref(), Some("2.1"));
    assert_eq!(record.sources, "src.orders");
    assert_eq!(record.previous_high_water_mark, None);

    let closed_again = audit.close_at(RunStatus::Error, 0, None, jan(31));
    assert!(closed_again.is_err());
}

#[test]
fn test_incremental_window_follows_previous_run() {
    let connector = connector();
    let job = orders_job(WindowSettings::default());

    let mut first = AuditManager::from_job(&job, Box::new(connector.clone()));
    first
        .open_at(&full_request("2026-01-01", "F10"), jan(31))
        .unwrap();
    first
        .close_at(RunStatus::Complete, 1, None, jan(31))
        .unwrap();

    // a failed run does not move the mark
    let mut failed = AuditManager::from_job(&job, Box::new(connector.clone()));
    failed
        .open_at(&full_request("2026-01-15", "F5"), jan(31))
        .unwrap();
    failed
        .close_at(RunStatus::Error, 0, None, jan(31))
        .unwrap();

    let incremental = WindowRequest {
        load_mode: LoadMode::Incremental,
        max_window_days: 7,
        forced_start: None,
        increment_by_one_day: false,
    };
    let mut second = AuditManager::from_job(&job, Box::new(connector.clone()));
    let opened = second.open_at(&incremental, jan(31)).unwrap();

    // the first run had no observed dates and recorded its window start
    assert_eq!(opened.window.previous_high_water_mark, Some(jan(1)));
    assert_eq!(opened.window.window.start(), jan(1));
    assert_eq!(opened.window.window.end(), jan(8));
    assert_eq!(opened.run_id, 3);
}

#[test]
fn test_incremental_window_without_history_is_configuration_error() {
    let connector = connector();
    let job = orders_job(WindowSettings::default());
    let mut audit = AuditManager::from_job(&job, Box::new(connector.clone()));

    let err = audit
        .open_at(&WindowRequest::from(&job.window), jan(31))
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(audit.current().is_none());
}

#[test]
fn test_window_capped_by_now_after_one_day_increment() {
    let connector = connector();
    let job = orders_job(WindowSettings::default());

    let mut session = connector.connect().unwrap();
    for statement in Dialect::DuckDb.audit_ddl(&job.audit) {
        session
            .execute(&statement, &[], ExecuteOptions::COMMIT)
            .unwrap();
    }
    session
        .execute(
            "INSERT INTO audit.etl_runs (load_mode, target_table, status, observed_max_date) \
             VALUES ('I', 'sales.orders', 'Complete', ?)",
            &[Value::Timestamp(jan(1))],
            ExecuteOptions::COMMIT,
        )
        .unwrap();

    let request = WindowRequest {
        load_mode: LoadMode::Incremental,
        max_window_days: 30,
        forced_start: None,
        increment_by_one_day: true,
    };
    let mut audit = AuditManager::from_job(&job, Box::new(connector.clone()));
    let opened = audit.open_at(&request, jan(10)).unwrap();

    assert_eq!(opened.window.window.start(), jan(2));
    assert_eq!(opened.window.window.end(), jan(10));
}

#[test]
fn test_full_then_incremental_run() {
    let connector = connector();
    create_source(&connector);
    create_target(&connector);

    let job = orders_job(WindowSettings::default());
    let request = full_request("2026-01-01", "mode=F10");
    let mut run = EtlRun::new(job.clone(), request, connector.clone(), connector.clone())
        .with_fixed_time(jan(31));

    let report = run.execute(None).unwrap();
    assert!(report.succeeded(), "{report}");
    let run_id = run.run_id().unwrap();

    let loaded = query(
        &connector,
        "SELECT order_id, etl_runs_key, customer FROM sales.orders ORDER BY order_id",
    );
    assert_eq!(
        loaded.rows,
        vec![
            vec![Value::Int(1), Value::Int(run_id), Value::Text("ada".into())],
            vec![Value::Int(2), Value::Int(run_id), Value::Text("bob".into())],
        ]
    );

    let record = run.audit().fetch(run_id).unwrap().unwrap();
    assert_eq!(record.status, RunStatus::Complete);
    assert_eq!(record.record_count, Some(2));
    assert_eq!(
        record.observed_min_date,
        Some(jan(3) + chrono::Duration::hours(8))
    );
    assert_eq!(
        record.observed_max_date,
        Some(jan(5) + chrono::Duration::hours(12) + chrono::Duration::minutes(30))
    );

    // the next run picks up at the observed max and reaches the 20th
    execute(
        &connector,
        "UPDATE src.orders SET amount = 21.0, updated_at = TIMESTAMP '2026-01-06 00:00:00' WHERE order_id = 2",
    );
    let mut next = EtlRun::new(
        job.clone(),
        WindowRequest::from(&job.window),
        connector.clone(),
        connector.clone(),
    )
    .with_fixed_time(jan(31));

    let report = next.execute(None).unwrap();
    assert!(report.succeeded(), "{report}");
    let next_id = next.run_id().unwrap();
    assert!(next_id > run_id);

    let window = &next.opened().unwrap().window.window;
    assert_eq!(window.start(), jan(5) + chrono::Duration::hours(12) + chrono::Duration::minutes(30));
    assert_eq!(window.end(), jan(31));

    let merged = query(
        &connector,
        "SELECT order_id, etl_runs_key, amount FROM sales.orders ORDER BY order_id",
    );
    assert_eq!(
        merged.rows,
        vec![
            vec![Value::Int(1), Value::Int(run_id), Value::Float(10.0)],
            vec![Value::Int(2), Value::Int(next_id), Value::Float(21.0)],
            vec![Value::Int(3), Value::Int(next_id), Value::Float(30.0)],
        ]
    );

    let record = next.audit().fetch(next_id).unwrap().unwrap();
    assert_eq!(record.load_mode, LoadMode::Incremental);
    assert_eq!(record.record_count, Some(2));
    assert_eq!(record.observed_max_date, Some(jan(20)));
}

#[test]
fn test_failed_load_marks_run_as_error() {
    let connector = connector();
    create_source(&connector);
    // no target table: staging it fails

    let job = orders_job(WindowSettings::default());
    let mut run = EtlRun::new(
        job,
        full_request("2026-01-01", "F10"),
        connector.clone(),
        connector.clone(),
    )
    .with_fixed_time(jan(31));

    let report = run.execute(None).unwrap();

    assert!(!report.succeeded());
    assert_eq!(report.error().map(|e| e.task()), Some("load"));
    assert!(matches!(
        report.record("close_run").map(|r| &r.status),
        Some(TaskStatus::Skipped(_))
    ));

    // the error record keeps what the extract step saw
    let record = run.audit().fetch(run.run_id().unwrap()).unwrap().unwrap();
    assert_eq!(record.status, RunStatus::Error);
    assert_eq!(record.record_count, Some(2));
    assert_eq!(
        record.observed_min_date,
        Some(jan(3) + chrono::Duration::hours(8))
    );
    assert_eq!(
        record.observed_max_date,
        Some(jan(5) + chrono::Duration::hours(12) + chrono::Duration::minutes(30))
    );
    assert!(run.audit().is_closed());
}

#[test]
fn test_run_with_several_date_columns() {
    let connector = connector();
    execute(&connector, "CREATE SCHEMA src");
    // ordered Jan 1 to 3, shipped Jan 5 to 7
    execute(
        &connector,
        "CREATE TABLE src.orders AS SELECT * FROM (VALUES \
         (1, 'ada', 10.0, TIMESTAMP '2026-01-01 00:00:00', TIMESTAMP '2026-01-05 00:00:00'), \
         (2, 'bob', 20.0, TIMESTAMP '2026-01-03 00:00:00', TIMESTAMP '2026-01-07 00:00:00')) \
         AS o(order_id, customer, amount, updated_at, shipped_at)",
    );

    let mut job = orders_job(WindowSettings::default());
    job.target.columns.push(
        weir_schemas::Column::builder()
            .name("shipped_at".to_string())
            .data_type("TIMESTAMP".to_string())
            .build(),
    );
    job.extract.query = "SELECT order_id, customer, amount, updated_at, shipped_at FROM src.orders \
         WHERE updated_at >= {window_start} AND updated_at < {window_end}"
        .to_string();
    job.extract.date_columns = vec!["updated_at".to_string(), "shipped_at".to_string()];
    for statement in Dialect::DuckDb.create_target_table(&job.target) {
        execute(&connector, &statement);
    }

    let mut run = EtlRun::new(
        job,
        full_request("2026-01-01", "F10"),
        connector.clone(),
        connector.clone(),
    )
    .with_fixed_time(jan(31));

    let report = run.execute(None).unwrap();
    assert!(report.succeeded(), "{report}");

    let record = run.audit().fetch(run.run_id().unwrap()).unwrap().unwrap();
    assert_eq!(record.record_count, Some(2));
    assert_eq!(record.observed_min_date, Some(jan(1)));
    assert_eq!(record.observed_max_date, Some(jan(7)));
}

#[test]
fn test_batch_file_is_loaded_and_removed() {
    let dir = tempfile::tempdir().unwrap();
    let batches = dir.path().join("batches");
    let connector = connector();
    create_source(&connector);
    create_target(&connector);

    let mut job = orders_job(WindowSettings::default());
    job.extract.output_dir = Some(batches.clone());
    let mut run = EtlRun::new(
        job,
        full_request("2026-01-01", "F10"),
        connector.clone(),
        connector.clone(),
    )
    .with_fixed_time(jan(31));

    let report = run.execute(None).unwrap();

    assert!(report.succeeded(), "{report}");
    assert_eq!(count(&connector, "sales.orders"), 2);
    assert_eq!(std::fs::read_dir(&batches).unwrap().count(), 0);
}

#[test]
fn test_batch_file_is_kept_when_asked() {
    let dir = tempfile::tempdir().unwrap();
    let batches = dir.path().join("batches");
    let connector = connector();
    create_source(&connector);
    create_target(&connector);

    let mut job = orders_job(WindowSettings::default());
    job.extract.output_dir = Some(batches.clone());
    job.extract.delete_output = false;
    let mut run = EtlRun::new(
        job,
        full_request("2026-01-01", "F10"),
        connector.clone(),
        connector.clone(),
    )
    .with_fixed_time(jan(31));

    let report = run.execute(None).unwrap();
    assert!(report.succeeded(), "{report}");

    let file = batches.join(format!("sales_orders_{}.csv", run.run_id().unwrap()));
    let kept = StagingBatch::read_delimited(&file, ';').unwrap().unwrap();
    assert_eq!(kept.len(), 2);
    assert_eq!(count(&connector, "sales.orders"), 2);
}

#[test]
fn test_preview_records_nothing() {
    let connector = connector();
    let job = orders_job(WindowSettings::default());
    let audit = AuditManager::from_job(&job, Box::new(connector.clone()));

    let preview = audit
        .preview_at(&full_request("2026-01-01", "F3"), jan(31))
        .unwrap();

    assert_eq!(preview.window.start(), jan(1));
    assert_eq!(preview.window.end(), jan(4));
    assert_eq!(count(&connector, "audit.etl_runs"), 0);
    assert!(audit.current().is_none());
}
