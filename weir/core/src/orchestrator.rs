//! Sequential task execution with retries, dependency gating and
//! halt-on-failure.
//!
//! Tasks run strictly in list order. A task that exhausts its attempts, or
//! whose dependency did not succeed, halts the run: every remaining task is
//! recorded as skipped and never executed.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use miette::Diagnostic;
use tracing::{debug, info, info_span};
use weir_schemas::{ProgressEvent, RetryPolicy, TaskDefinition};

use crate::error::{Error, ErrorKind};
use crate::progress_tracker::ProgressTracker;

/// Pause between two attempts of the same task
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(5);

pub type TaskAction<'a> = Box<dyn FnMut() -> crate::Result<()> + 'a>;

#[derive(Debug, thiserror::Error, Diagnostic)]
pub enum OrchestratorError {
    #[error("Task name '{0}' is used more than once")]
    #[diagnostic(code(weir::orchestrator::duplicate_task))]
    DuplicateTask(String),

    #[error("Task '{task}' depends on '{dependency}', which is not an earlier task")]
    #[diagnostic(
        code(weir::orchestrator::unknown_dependency),
        help("`depends_on` must name a task listed before the dependent task")
    )]
    UnknownDependency { task: String, dependency: String },

    #[error("Task '{task}' failed after {attempts} attempt(s)")]
    #[diagnostic(code(weir::orchestrator::halted))]
    Halted {
        task: String,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("Task '{task}' was skipped because its dependency '{dependency}' did not succeed")]
    #[diagnostic(code(weir::orchestrator::dependency_not_met))]
    DependencyNotMet { task: String, dependency: String },
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::DuplicateTask(_) | OrchestratorError::UnknownDependency { .. } => {
                ErrorKind::Configuration
            }
            OrchestratorError::Halted { .. } | OrchestratorError::DependencyNotMet { .. } => {
                ErrorKind::PipelineHalt
            }
        }
    }

    /// Name of the task that stopped the run
    pub fn task(&self) -> &str {
        match self {
            OrchestratorError::DuplicateTask(task)
            | OrchestratorError::UnknownDependency { task, .. }
            | OrchestratorError::Halted { task, .. }
            | OrchestratorError::DependencyNotMet { task, .. } => task,
        }
    }
}

/// A named unit of work.
///
/// # Examples
///
/// ```
/// use weir_core::orchestrator::{Task, TaskOrchestrator};
///
/// let mut extracted = 0;
/// let tasks = vec![
///     Task::new("extract", || {
///         extracted += 1;
///         Ok(())
///     })
///     .with_retries(2),
///     Task::new("load", || Ok(())).with_depends_on("extract"),
/// ];
///
/// let report = TaskOrchestrator::try_new(tasks).unwrap().run();
/// assert!(report.succeeded());
/// assert_eq!(extracted, 1);
/// ```
pub struct Task<'a> {
    name: String,
    description: String,
    enabled: bool,
    max_retries: u32,
    depends_on: Option<String>,
    action: TaskAction<'a>,
}

impl<'a> Task<'a> {
    pub fn new(name: impl Into<String>, action: impl FnMut() -> crate::Result<()> + 'a) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            enabled: true,
            max_retries: 0,
            depends_on: None,
            action: Box::new(action),
        }
    }

    /// Binds `action` to a task definition from a job file
    pub fn from_definition(
        definition: &TaskDefinition,
        action: impl FnMut() -> crate::Result<()> + 'a,
    ) -> Self {
        Self {
            name: definition.name.clone(),
            description: definition.description.clone(),
            enabled: definition.enabled,
            max_retries: definition.retries,
            depends_on: definition.depends_on.clone(),
            action: Box::new(action),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Additional attempts after the first failure
    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_depends_on(mut self, task: impl Into<String>) -> Self {
        self.depends_on = Some(task.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Task<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("enabled", &self.enabled)
            .field("max_retries", &self.max_retries)
            .field("depends_on", &self.depends_on)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    DependencyNotMet { dependency: String },
    /// An earlier task stopped the run
    Halted { after: String },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Disabled => write!(f, "disabled"),
            SkipReason::DependencyNotMet { dependency } => {
                write!(f, "dependency '{dependency}' not met")
            }
            SkipReason::Halted { after } => write!(f, "run halted after '{after}'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Succeeded,
    Failed,
    Skipped(SkipReason),
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Succeeded => write!(f, "SUCCESS"),
            TaskStatus::Failed => write!(f, "FAILED"),
            TaskStatus::Skipped(reason) => write!(f, "SKIPPED ({reason})"),
        }
    }
}

/// Outcome of one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    pub name: String,
    pub description: String,
    pub status: TaskStatus,
    pub attempts: u32,
    /// Rendered error of the last failed attempt
    pub last_error: Option<String>,
    pub duration: Duration,
}

impl TaskRecord {
    fn skipped(task: &Task<'_>, reason: SkipReason) -> Self {
        Self {
            name: task.name.clone(),
            description: task.description.clone(),
            status: TaskStatus::Skipped(reason),
            attempts: 0,
            last_error: None,
            duration: Duration::ZERO,
        }
    }
}

/// Outcome of a whole run.
#[derive(Debug)]
pub struct RunReport {
    pub records: Vec<TaskRecord>,
    /// Why the run stopped, `None` when it succeeded
    pub halt: Option<OrchestratorError>,
    pub duration: Duration,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.halt.is_none()
    }

    pub fn error(&self) -> Option<&OrchestratorError> {
        self.halt.as_ref()
    }

    pub fn record(&self, name: &str) -> Option<&TaskRecord> {
        self.records.iter().find(|r| r.name == name)
    }

    /// `Ok` on success, otherwise the pipeline halt error
    pub fn into_result(self) -> crate::Result<()> {
        match self.halt {
            None => Ok(()),
            Some(err) => Err(err.into()),
        }
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let outcome = if self.succeeded() { "succeeded" } else { "FAILED" };
        writeln!(
            f,
            "Run {outcome} in {:.2}s",
            self.duration.as_secs_f64()
        )?;

        for record in &self.records {
            write!(
                f,
                "  {}: {} ({} attempt(s), {:.2}s)",
                record.name,
                record.status,
                record.attempts,
                record.duration.as_secs_f64()
            )?;
            if !record.description.is_empty() {
                write!(f, " - {}", record.description)?;
            }
            writeln!(f)?;
        }

        if let Some(halt) = &self.halt {
            writeln!(f, "Failed task: {}", halt.task())?;

            let last_error = self
                .record(halt.task())
                .and_then(|r| r.last_error.clone())
                .unwrap_or_else(|| halt.to_string());
            writeln!(f, "Last error: {last_error}")?;

            let skipped = self
                .records
                .iter()
                .filter(|r| matches!(r.status, TaskStatus::Skipped(SkipReason::Halted { .. })))
                .map(|r| r.name.as_str())
                .collect::<Vec<_>>();
            if !skipped.is_empty() {
                writeln!(f, "Skipped as a consequence: {}", skipped.join(", "))?;
            }
        }

        Ok(())
    }
}

/// Runs an ordered list of tasks.
pub struct TaskOrchestrator<'a> {
    tasks: Vec<Task<'a>>,
    backoff: Duration,
    retry_policy: RetryPolicy,
    progress_tracker: Option<Arc<dyn ProgressTracker>>,
}

impl fmt::Debug for TaskOrchestrator<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskOrchestrator")
            .field("tasks", &self.tasks)
            .field("backoff", &self.backoff)
            .field("retry_policy", &self.retry_policy)
            .finish_non_exhaustive()
    }
}

impl<'a> TaskOrchestrator<'a> {
    /// Validates the task list: names are unique and every `depends_on`
    /// names an earlier task
    pub fn try_new(tasks: Vec<Task<'a>>) -> Result<Self, OrchestratorError> {
        let mut seen = HashSet::new();

        for task in &tasks {
            if let Some(dependency) = &task.depends_on {
                if !seen.contains(dependency.as_str()) {
                    return Err(OrchestratorError::UnknownDependency {
                        task: task.name.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
            if !seen.insert(task.name.as_str()) {
                return Err(OrchestratorError::DuplicateTask(task.name.clone()));
            }
        }

        Ok(Self {
            tasks,
            backoff: DEFAULT_BACKOFF,
            retry_policy: RetryPolicy::default(),
            progress_tracker: None,
        })
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_progress_tracker(mut self, tracker: Arc<dyn ProgressTracker>) -> Self {
        self.progress_tracker = Some(tracker);
        self
    }

    /// Runs every task in order and reports the outcome.
    ///
    /// Task errors never escape: they end up in the [`RunReport`].
    pub fn run(self) -> RunReport {
        let TaskOrchestrator {
            tasks,
            backoff,
            retry_policy,
            progress_tracker,
        } = self;

        let emit = |event: ProgressEvent| {
            if let Some(tracker) = &progress_tracker {
                tracker.on_progress(event);
            }
        };

        let started = Instant::now();
        emit(ProgressEvent::RunStarted { tasks: tasks.len() });

        let mut succeeded: HashSet<String> = HashSet::new();
        let mut records = Vec::with_capacity(tasks.len());
        let mut halt: Option<OrchestratorError> = None;

        for mut task in tasks {
            if let Some(halted) = &halt {
                let reason = SkipReason::Halted {
                    after: halted.task().to_string(),
                };
                emit(ProgressEvent::TaskSkipped {
                    name: task.name.clone(),
                    reason: reason.to_string(),
                });
                records.push(TaskRecord::skipped(&task, reason));
                continue;
            }

            if !task.enabled {
                emit(ProgressEvent::TaskSkipped {
                    name: task.name.clone(),
                    reason: SkipReason::Disabled.to_string(),
                });
                records.push(TaskRecord::skipped(&task, SkipReason::Disabled));
                continue;
            }

            if let Some(dependency) = task.depends_on.clone() {
                if !succeeded.contains(&dependency) {
                    let reason = SkipReason::DependencyNotMet {
                        dependency: dependency.clone(),
                    };
                    emit(ProgressEvent::TaskSkipped {
                        name: task.name.clone(),
                        reason: reason.to_string(),
                    });
                    records.push(TaskRecord::skipped(&task, reason));
                    halt = Some(OrchestratorError::DependencyNotMet {
                        task: task.name.clone(),
                        dependency,
                    });
                    continue;
                }
            }

            let span = info_span!("run_task", task = %task.name);
            let _guard = span.enter();

            let max_attempts = task.max_retries.saturating_add(1);
            let task_started = Instant::now();
            let mut attempt = 0;

            loop {
                attempt += 1;
                emit(ProgressEvent::TaskStarted {
                    name: task.name.clone(),
                    attempt,
                });

                let err = match (task.action)() {
                    Ok(()) => {
                        let duration = task_started.elapsed();
                        emit(ProgressEvent::TaskSucceeded {
                            name: task.name.clone(),
                            attempts: attempt,
                            duration_ms: duration.as_millis() as u64,
                        });
                        records.push(TaskRecord {
                            name: task.name.clone(),
                            description: task.description.clone(),
                            status: TaskStatus::Succeeded,
                            attempts: attempt,
                            last_error: None,
                            duration,
                        });
                        succeeded.insert(task.name.clone());
                        break;
                    }
                    Err(err) => err,
                };

                let rendered = render_error(&err);
                let retry_allowed = match retry_policy {
                    RetryPolicy::Transient => err.is_retryable(),
                    RetryPolicy::Always => true,
                };
                let will_retry = retry_allowed && attempt < max_attempts;

                emit(ProgressEvent::TaskAttemptFailed {
                    name: task.name.clone(),
                    attempt,
                    max_attempts,
                    error: rendered.clone(),
                    will_retry,
                });

                if will_retry {
                    debug!("Waiting {backoff:?} before the next attempt");
                    if !backoff.is_zero() {
                        std::thread::sleep(backoff);
                    }
                    continue;
                }

                if !retry_allowed && attempt < max_attempts {
                    info!("{} is not retryable, giving up", err.kind());
                }

                emit(ProgressEvent::TaskFailed {
                    name: task.name.clone(),
                    attempts: attempt,
                    error: rendered.clone(),
                });
                records.push(TaskRecord {
                    name: task.name.clone(),
                    description: task.description.clone(),
                    status: TaskStatus::Failed,
                    attempts: attempt,
                    last_error: Some(rendered),
                    duration: task_started.elapsed(),
                });
                halt = Some(OrchestratorError::Halted {
                    task: task.name.clone(),
                    attempts: attempt,
                    source: Box::new(err),
                });
                break;
            }
        }

        let duration = started.elapsed();
        emit(ProgressEvent::RunCompleted {
            success: halt.is_none(),
            duration_ms: duration.as_millis() as u64,
        });

        RunReport {
            records,
            halt,
            duration,
        }
    }
}

/// `error: cause: cause` over the whole source chain
fn render_error(err: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();

    while let Some(cause) = source {
        let message = cause.to_string();
        if !rendered.ends_with(&message) {
            rendered.push_str(": ");
            rendered.push_str(&message);
        }
        source = cause.source();
    }

    rendered
}
