//! One execution of a job: the built-in steps bound to the orchestrator.

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};
use weir_schemas::{steps, Job, RunStatus};

use crate::audit::{AuditError, AuditManager, OpenedRun};
use crate::error::{Error, ErrorKind};
use crate::executor::Connector;
use crate::extract::{Extraction, Extractor, SqlExtractor};
use crate::loader::{LoadOutcome, StageAndMergeLoader};
use crate::orchestrator::{RunReport, Task, TaskOrchestrator};
use crate::progress_tracker::ProgressTracker;
use crate::window::WindowRequest;

/// State shared by the steps of one run.
///
/// Each step reads what the previous ones left behind: `open_run` the
/// window, `extract` the batch, `load` the merge outcome, `close_run` all of
/// them.
pub struct EtlRun {
    job: Job,
    request: WindowRequest,
    audit: AuditManager,
    extractor: Box<dyn Extractor>,
    loader: StageAndMergeLoader,
    target: Rc<dyn Connector>,
    now: Option<DateTime<Utc>>,
    opened: Option<OpenedRun>,
    extraction: Option<Extraction>,
    loaded: Option<LoadOutcome>,
}

impl std::fmt::Debug for EtlRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtlRun")
            .field("job", &self.job.name)
            .field("request", &self.request)
            .field("opened", &self.opened)
            .field("loaded", &self.loaded)
            .finish_non_exhaustive()
    }
}

impl EtlRun {
    /// A run of `job` writing into `target` and reading from `source`
    pub fn new(
        job: Job,
        request: WindowRequest,
        target: Rc<dyn Connector>,
        source: Rc<dyn Connector>,
    ) -> Self {
        let audit = AuditManager::from_job(&job, Box::new(target.clone()));
        let extractor = Box::new(SqlExtractor::from_job(&job, Box::new(source)));
        let loader = StageAndMergeLoader::new(job.target.clone());

        Self {
            job,
            request,
            audit,
            extractor,
            loader,
            target,
            now: None,
            opened: None,
            extraction: None,
            loaded: None,
        }
    }

    pub fn with_extractor(mut self, extractor: Box<dyn Extractor>) -> Self {
        self.extractor = extractor;
        self
    }

    /// Pins "now" for window sizing and audit timestamps
    pub fn with_fixed_time(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn audit(&self) -> &AuditManager {
        &self.audit
    }

    /// Run id, once `open_run` succeeded
    pub fn run_id(&self) -> Option<i64> {
        self.opened.as_ref().map(|run| run.run_id)
    }

    pub fn opened(&self) -> Option<&OpenedRun> {
        self.opened.as_ref()
    }

    fn now(&self) -> DateTime<Utc> {
        self.now.unwrap_or_else(Utc::now)
    }

    /// Computes the window and opens the audit record
    pub fn open_run(&mut self) -> crate::Result<()> {
        let now = self.now();
        let opened = self.audit.open_at(&self.request, now)?;
        self.opened = Some(opened);
        Ok(())
    }

    /// Pulls the run's window out of the source
    pub fn extract(&mut self) -> crate::Result<()> {
        let opened = self.opened.as_ref().ok_or(AuditError::NotOpened)?;

        let extraction = self
            .extractor
            .extract(&opened.window.window, opened.run_id)?;
        self.extraction = Some(extraction);
        Ok(())
    }

    /// Stages and merges the extracted batch into the target, reading it
    /// back from the batch file when the extract step wrote one
    pub fn load(&mut self) -> crate::Result<()> {
        let extraction = self.extraction.as_ref().ok_or_else(|| {
            Error::new(ErrorKind::Etl, "load requires a successful extract")
        })?;

        let settings = &self.job.extract;
        let mut session = self.target.connect()?;
        let outcome = match &extraction.file {
            Some(path) => {
                let outcome = self
                    .loader
                    .load_file(session.as_mut(), path, settings.delimiter)?;
                if settings.delete_output {
                    remove_batch_file(path);
                }
                outcome
            }
            None => self.loader.load(session.as_mut(), &extraction.batch)?,
        };

        self.loaded = Some(outcome);
        Ok(())
    }

    /// Finalizes the audit record as complete
    pub fn close_run(&mut self) -> crate::Result<()> {
        let record_count = self.record_count();
        let observed = self.extraction.as_ref().and_then(|e| e.observed);
        let now = self.now();

        self.audit
            .close_at(RunStatus::Complete, record_count, observed, now)?;
        Ok(())
    }

    fn record_count(&self) -> u64 {
        match (&self.loaded, &self.extraction) {
            (Some(outcome), _) => outcome.rows(),
            (None, Some(extraction)) => extraction.batch.len() as u64,
            (None, None) => 0,
        }
    }

    /// Runs the built-in step called `name`
    pub fn step(&mut self, name: &str) -> crate::Result<()> {
        match name {
            steps::OPEN_RUN => self.open_run(),
            steps::EXTRACT => self.extract(),
            steps::LOAD => self.load(),
            steps::CLOSE_RUN => self.close_run(),
            other => Err(Error::new(
                ErrorKind::Configuration,
                format!("'{other}' is not a built-in step"),
            )),
        }
    }

    /// Settles the audit record once the orchestrator is done.
    ///
    /// A failed run whose record is still open is closed as `Error`, keeping
    /// the row count and observed dates of whatever was extracted. Failing
    /// to do so is logged and leaves the run's own error untouched.
    pub fn finish(&mut self, report: &RunReport) {
        let Some(run) = self.audit.current().cloned() else {
            return;
        };

        if report.succeeded() {
            warn!(
                run_id = run.run_id,
                "Run succeeded without closing its audit record, it stays 'In Progress'"
            );
            return;
        }

        let record_count = self.record_count();
        let observed = self.extraction.as_ref().and_then(|e| e.observed);
        let now = self.now();
        match self
            .audit
            .close_at(RunStatus::Error, record_count, observed, now)
        {
            Ok(()) => info!(run_id = run.run_id, "Marked run as 'Error'"),
            Err(err) => error!(run_id = run.run_id, "Could not mark run as 'Error': {err}"),
        }
    }

    /// Runs the job's task list and settles the audit record.
    ///
    /// The report carries the outcome; `Err` means the task list itself is
    /// invalid and nothing ran.
    #[instrument(skip_all, fields(job = %self.job.name), err)]
    pub fn execute(
        &mut self,
        progress_tracker: Option<Arc<dyn ProgressTracker>>,
    ) -> crate::Result<RunReport> {
        let definitions = self.job.tasks.clone();
        let retry = self.job.retry.clone();

        let report = {
            let shared = RefCell::new(&mut *self);

            let tasks = definitions
                .iter()
                .map(|definition| {
                    let shared = &shared;
                    let name = definition.name.as_str();
                    Task::from_definition(definition, move || shared.borrow_mut().step(name))
                })
                .collect();

            let mut orchestrator = TaskOrchestrator::try_new(tasks)?
                .with_backoff(Duration::from_secs(retry.backoff_secs))
                .with_retry_policy(retry.policy);
            if let Some(tracker) = progress_tracker {
                orchestrator = orchestrator.with_progress_tracker(tracker);
            }

            orchestrator.run()
        };

        self.finish(&report);
        Ok(report)
    }
}

fn remove_batch_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed batch file {}", path.display()),
        Err(err) => warn!("Could not remove batch file {}: {err}", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutorError, QueryExecutor};
    use crate::window::Window;
    use weir_schemas::{Column, ExtractSettings, TargetTable};

    struct Unreachable;

    impl Connector for Unreachable {
        fn connect(&self) -> Result<Box<dyn QueryExecutor>, ExecutorError> {
            Err(ExecutorError::Connection {
                backend: "test",
                message: "no route to host".into(),
                transient: false,
            })
        }
    }

    struct NeverCalled;

    impl Extractor for NeverCalled {
        fn extract(&mut self, _: &Window, _: i64) -> crate::Result<Extraction> {
            panic!("extract must not run")
        }
    }

    fn job() -> Job {
        Job::builder()
            .name("orders".to_string())
            .target(
                TargetTable::builder()
                    .schema("sales".to_string())
                    .name("orders".to_string())
                    .columns(vec![Column::builder().name("order_id".to_string()).build()])
                    .unique_key(vec!["order_id".to_string()])
                    .build(),
            )
            .extract(ExtractSettings::builder().query("SELECT 1".to_string()).build())
            .retry(weir_schemas::RetrySettings::builder().backoff_secs(0).build())
            .build()
    }

    fn run(target: Rc<dyn Connector>) -> EtlRun {
        let job = job();
        let request = WindowRequest::from(&job.window);
        EtlRun::new(job, request, target.clone(), target).with_extractor(Box::new(NeverCalled))
    }

    #[test]
    fn test_steps_out_of_order_are_programming_errors() {
        let mut run = run(Rc::new(Unreachable));

        assert_eq!(run.extract().unwrap_err().kind(), ErrorKind::Etl);
        assert_eq!(run.load().unwrap_err().kind(), ErrorKind::Etl);
        assert_eq!(run.close_run().unwrap_err().kind(), ErrorKind::Etl);
        assert_eq!(run.step("publish").unwrap_err().kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_failed_open_halts_before_extract() {
        let mut run = run(Rc::new(Unreachable));

        let report = run.execute(None).unwrap();

        assert!(!report.succeeded());
        assert_eq!(report.error().map(|e| e.task()), Some("open_run"));
        assert!(run.run_id().is_none());
        assert_eq!(report.records.len(), 4);
    }
}
