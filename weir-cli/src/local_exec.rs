use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    rc::Rc,
    sync::Arc,
};

use miette::Result;
use tracing::{debug, info};
use weir_core::notify::deliver;
use weir_core::prelude::*;
use weir_core::window::WindowOverride;
use weir_duckdb::DuckDbConnector;
use weir_schemas::ConnectionConfig;

fn load_job(file: &Path, params: HashMap<String, String>) -> Result<Job> {
    let format = format_from_path(file);
    debug!("Parsing job file {} as {format}", file.display());
    Ok(Job::from_file(file, format, params)?)
}

fn connector(config: &ConnectionConfig) -> Result<Rc<dyn Connector>> {
    match config {
        ConnectionConfig::DuckDb { path } => {
            Ok(Rc::new(DuckDbConnector::from_path(path.as_deref())?))
        }
        #[cfg(feature = "odbc")]
        ConnectionConfig::Odbc { connection_string } => {
            Ok(Rc::new(weir_odbc::OdbcConnector::new(connection_string.as_str())))
        }
        #[cfg(not(feature = "odbc"))]
        ConnectionConfig::Odbc { .. } => Err(miette::miette!(
            help = "Reinstall with: cargo install weir-cli --features odbc",
            "ODBC support is not enabled in this build of weir-cli"
        )),
    }
}

/// Target and source connectors; the source falls back to the target
fn connectors(job: &Job) -> Result<(Rc<dyn Connector>, Rc<dyn Connector>)> {
    let target = connector(&job.connection)?;
    let source = match &job.source_connection {
        Some(config) => connector(config)?,
        None => target.clone(),
    };
    Ok((target, source))
}

fn create_target_table(job: &Job, target: &dyn Connector) -> Result<()> {
    let mut session = target.connect()?;
    for statement in session.dialect().create_target_table(&job.target) {
        session.execute(&statement, &[], ExecuteOptions::COMMIT)?;
    }
    info!("Ensured target table {}", job.target.qualified_name());
    Ok(())
}

/// Runs the job once and returns the report, whether the run succeeded or not
pub fn run_job(job: Job, window: &WindowOverride, create_target: bool) -> Result<RunReport> {
    let request = window.apply(&job.window)?;
    let (target, source) = connectors(&job)?;

    if create_target {
        create_target_table(&job, target.as_ref())?;
    }

    info!("Running job '{}' ({} mode)", job.name, request.load_mode);
    let mut run = EtlRun::new(job, request, target, source);
    let report = run.execute(Some(Arc::new(LoggingProgressTracker)))?;

    deliver(&LoggingNotifier, &run.job().name, &report);
    Ok(report)
}

pub fn run(
    file: PathBuf,
    params: HashMap<String, String>,
    window: WindowOverride,
    create_target: bool,
) -> Result<()> {
    info!("Running job from file: {}", file.display());
    let job = load_job(&file, params)?;

    let report = run_job(job, &window, create_target)?;
    Ok(report.into_result()?)
}

/// Computes the window the next run would get
pub fn preview_job(job: &Job, window: &WindowOverride) -> Result<WindowState> {
    let request = window.apply(&job.window)?;
    let (target, _) = connectors(job)?;

    let audit = AuditManager::from_job(job, Box::new(target));
    Ok(audit.preview_at(&request, chrono::Utc::now())?)
}

pub fn preview(
    file: PathBuf,
    params: HashMap<String, String>,
    window: WindowOverride,
) -> Result<()> {
    let job = load_job(&file, params)?;
    let state = preview_job(&job, &window)?;

    let mark = state
        .previous_high_water_mark
        .map(|mark| mark.to_rfc3339())
        .unwrap_or_else(|| "none".to_string());

    println!("job:                      {}", job.name);
    println!("target:                   {}", job.target.qualified_name());
    println!("load mode:                {}", state.request.load_mode);
    println!("previous high-water mark: {mark}");
    println!("window start:             {}", state.window.start().to_rfc3339());
    println!("window end:               {}", state.window.end().to_rfc3339());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use weir_core::orchestrator::TaskStatus;

    fn job_file(dir: &Path) -> PathBuf {
        let path = dir.join("orders.yml");
        let job = r#"
name: orders
target:
  schema: sales
  name: orders
  columns:
    - name: order_id
      data_type: BIGINT
      nullable: false
    - name: updated_at
      data_type: TIMESTAMP
  unique_key: [order_id]
connection:
  type: duck_db
  path: ${database}
extract:
  query: >-
    SELECT * FROM (VALUES (1, TIMESTAMP '2026-01-03 00:00:00'), (2, TIMESTAMP '2026-01-04 00:00:00'))
    AS src(order_id, updated_at)
    WHERE updated_at >= {window_start} AND updated_at < {window_end}
  date_columns: [updated_at]
retry:
  backoff_secs: 0
"#;
        std::fs::write(&path, job).unwrap();
        path
    }

    fn params(dir: &Path) -> HashMap<String, String> {
        HashMap::from([(
            "database".to_string(),
            dir.join("warehouse.duckdb").display().to_string(),
        )])
    }

    #[test]
    fn test_run_job_with_created_target() {
        let dir = tempfile::tempdir().unwrap();
        let job = load_job(&job_file(dir.path()), params(dir.path())).unwrap();
        let window = WindowOverride::parse(Some("2026-01-01"), Some("mode=F10")).unwrap();

        let report = run_job(job.clone(), &window, true).unwrap();

        assert!(report.succeeded());
        assert!(report
            .records
            .iter()
            .all(|record| record.status == TaskStatus::Succeeded));

        // the next incremental run continues at the observed max
        let preview = preview_job(&job, &WindowOverride::default()).unwrap();
        assert_eq!(
            preview.previous_high_water_mark.map(|mark| mark.to_rfc3339()),
            Some("2026-01-04T00:00:00+00:00".to_string())
        );
    }

    #[test]
    fn test_first_incremental_run_fails_without_history() {
        let dir = tempfile::tempdir().unwrap();
        let job = load_job(&job_file(dir.path()), params(dir.path())).unwrap();

        let report = run_job(job, &WindowOverride::default(), true).unwrap();

        assert!(!report.succeeded());
        assert_eq!(report.error().map(|e| e.task()), Some("open_run"));
        assert!(report.into_result().is_err());
    }

    #[test]
    fn test_start_date_needs_full_mode() {
        let dir = tempfile::tempdir().unwrap();
        let job = load_job(&job_file(dir.path()), params(dir.path())).unwrap();
        let window = WindowOverride::parse(Some("2026-01-01"), None).unwrap();

        assert!(run_job(job, &window, true).is_err());
    }

    #[test]
    fn test_missing_param_is_reported() {
        let dir = tempfile::tempdir().unwrap();

        let err = load_job(&job_file(dir.path()), HashMap::new()).unwrap_err();

        assert!(err.to_string().contains("database"));
    }

    #[cfg(not(feature = "json"))]
    #[test]
    fn test_json_job_needs_json_feature() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orders.json");
        std::fs::write(&path, r#"{"name": "orders"}"#).unwrap();

        let err = load_job(&path, HashMap::new()).unwrap_err();

        assert!(err.to_string().contains("cannot be read"));
    }
}
