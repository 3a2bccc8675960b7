use std::fmt;

use miette::Diagnostic;

use crate::{
    audit::AuditError, batch::BatchError, executor::ExecutorError, loader::LoadError,
    orchestrator::OrchestratorError, templating::TemplateError, window::WindowError,
};

pub type Result<T> = core::result::Result<T, Error>;

/// Failure categories shared by every weir error.
///
/// The orchestrator only retries [`ErrorKind::Retryable`] failures unless the
/// job asks it to retry everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Invalid or insufficient job parameters
    Configuration,
    /// Malformed operator input or data that contradicts the run's window
    DataValidation,
    /// The backing store rejected a statement
    ExternalService,
    /// A transient external failure, safe to retry
    Retryable,
    /// A task exhausted its attempts and the run stopped
    PipelineHalt,
    /// Misuse of the weir API
    Etl,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Configuration => "ConfigurationError",
            ErrorKind::DataValidation => "DataValidationError",
            ErrorKind::ExternalService => "ExternalServiceError",
            ErrorKind::Retryable => "RetryableError",
            ErrorKind::PipelineHalt => "PipelineHaltError",
            ErrorKind::Etl => "ETLError",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error, Diagnostic)]
pub enum Error {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Executor(Box<ExecutorError>),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Window(Box<WindowError>),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Batch(Box<BatchError>),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Audit(Box<AuditError>),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Load(Box<LoadError>),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Orchestrator(Box<OrchestratorError>),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Template(Box<TemplateError>),

    /// Failure raised by job specific code
    #[error("{message}")]
    #[diagnostic(code(weir::task))]
    Task { kind: ErrorKind, message: String },
}

impl Error {
    /// Error of an arbitrary kind, for task actions written outside weir
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error::Task {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Executor(e) => e.kind(),
            Error::Window(e) => e.kind(),
            Error::Batch(e) => e.kind(),
            Error::Audit(e) => e.kind(),
            Error::Load(e) => e.kind(),
            Error::Orchestrator(e) => e.kind(),
            Error::Template(e) => e.kind(),
            Error::Task { kind, .. } => *kind,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Retryable
    }
}

impl From<ExecutorError> for Error {
    fn from(error: ExecutorError) -> Self {
        Error::Executor(Box::new(error))
    }
}

impl From<WindowError> for Error {
    fn from(error: WindowError) -> Self {
        Error::Window(Box::new(error))
    }
}

impl From<BatchError> for Error {
    fn from(error: BatchError) -> Self {
        Error::Batch(Box::new(error))
    }
}

impl From<AuditError> for Error {
    fn from(error: AuditError) -> Self {
        Error::Audit(Box::new(error))
    }
}

impl From<LoadError> for Error {
    fn from(error: LoadError) -> Self {
        Error::Load(Box::new(error))
    }
}

impl From<OrchestratorError> for Error {
    fn from(error: OrchestratorError) -> Self {
        Error::Orchestrator(Box::new(error))
    }
}

impl From<TemplateError> for Error {
    fn from(error: TemplateError) -> Self {
        Error::Template(Box::new(error))
    }
}
