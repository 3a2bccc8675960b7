//! # Weir Core
//!
//! The execution engine of weir: watermark windows, run auditing,
//! stage-and-merge loading and sequential task orchestration.
//!
//! Database access goes through the [`executor::QueryExecutor`] trait, so the
//! engine itself is backend agnostic. Backends live in `weir-duckdb` and
//! `weir-odbc`.
//!
//! ## Running a job
//!
//! ```rust,ignore
//! use std::rc::Rc;
//! use weir_core::prelude::*;
//! use weir_duckdb::DuckDbConnector;
//!
//! let job = Job::from_file("orders.yml", TemplateFormat::Yaml, Default::default())?;
//! let connector: Rc<dyn Connector> = Rc::new(DuckDbConnector::open("warehouse.duckdb")?);
//!
//! let mut run = EtlRun::new(job, request, connector.clone(), connector);
//! let report = run.execute(Some(Arc::new(LoggingProgressTracker)))?;
//! ```

pub mod audit;
pub mod batch;
pub mod error;
pub mod executor;
pub mod extract;
pub mod loader;
pub mod notify;
pub mod orchestrator;
pub mod progress_tracker;
pub mod run;
pub mod sql;
pub mod templating;
pub mod window;

pub use error::{Error, ErrorKind, Result};

/// Prelude to import the types needed to define and run a job
pub mod prelude {
    pub use crate::audit::{AuditManager, OpenedRun, RunAuditRecord, RunDescriptor};
    pub use crate::batch::{ObservedRange, StagingBatch};
    pub use crate::executor::{
        Connector, ExecuteOptions, ExecutorError, QueryExecutor, Rows, TableRef, Value,
    };
    pub use crate::extract::{Extraction, Extractor, SqlExtractor};
    pub use crate::loader::{LoadOutcome, StageAndMergeLoader};
    pub use crate::notify::{LoggingNotifier, Notifier};
    pub use crate::orchestrator::{RunReport, Task, TaskOrchestrator, TaskStatus};
    pub use crate::progress_tracker::{LoggingProgressTracker, ProgressTracker};
    pub use crate::run::EtlRun;
    pub use crate::sql::Dialect;
    pub use crate::templating::{format_from_path, TemplateFormat, TemplateLoader};
    pub use crate::window::{
        Window, WindowOverride, WindowRequest, WindowState, WatermarkCalculator,
    };
    pub use crate::{Error, ErrorKind, Result};

    pub use weir_schemas::{Job, LoadMode, ProgressEvent, RunStatus, TargetTable};
}
