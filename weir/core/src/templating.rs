use std::collections::{HashMap, HashSet};
use std::path::Path;
#[cfg(any(feature = "json", feature = "yaml", feature = "toml"))]
use std::sync::Arc;
use std::sync::OnceLock;

#[cfg(any(feature = "json", feature = "yaml", feature = "toml"))]
use miette::{NamedSource, SourceOffset, SourceSpan};
use miette::Diagnostic;
use regex::Regex;
use tracing::debug;
use weir_schemas::{steps, Job};

use crate::error::ErrorKind;

#[derive(Debug, thiserror::Error, Diagnostic)]
pub enum TemplateError {
    #[error("Job file not found: '{file_path}'")]
    #[diagnostic(
        code(weir::template::file_not_found),
        help("Pass the path of an existing job file with -f")
    )]
    NotFound {
        #[source]
        source: std::io::Error,
        file_path: String,
    },

    #[error("Job files in '{0}' format cannot be read")]
    #[diagnostic(
        code(weir::template::unknown_format),
        help(
            "Job formats compiled into this build: {}\n\
             JSON and TOML job files need weir-cli built with `--features json` or `--features toml`",
            Self::available_formats()
        )
    )]
    UnknownFormat(TemplateFormat),

    #[error("Missing template parameters: {0:?}")]
    #[diagnostic(
        code(weir::template::missing_params),
        help(
            "Provide the missing parameters using the -p flag.\n\
              \n\
              Example:\n\
              weir run -f job.yml -p dsn=warehouse -p schema=sales"
        )
    )]
    MissingParams(HashSet<String>),

    #[cfg(feature = "json")]
    #[error("JSON parsing error")]
    #[diagnostic(code(weir::template::json_parse_error))]
    ParseJson {
        #[source_code]
        source_code: Arc<NamedSource<String>>,
        #[label("{}", error)]
        span: SourceSpan,
        #[source]
        error: serde_json::Error,
    },

    #[cfg(feature = "yaml")]
    #[error("YAML parsing error")]
    #[diagnostic(code(weir::template::yaml_parse_error))]
    ParseYaml {
        #[source_code]
        source_code: Arc<NamedSource<String>>,
        #[label("{}", error)]
        span: SourceSpan,
        #[source]
        error: serde_yml::Error,
    },

    #[cfg(feature = "toml")]
    #[error("TOML parsing error")]
    #[diagnostic(code(weir::template::toml_parse_error))]
    ParseToml {
        #[source_code]
        source_code: Arc<NamedSource<String>>,
        #[label("{}", error)]
        span: SourceSpan,
        #[source]
        error: toml::de::Error,
    },

    #[error("Invalid job '{job}': {reason}")]
    #[diagnostic(code(weir::template::invalid_job))]
    InvalidJob { job: String, reason: String },
}

impl TemplateError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Configuration
    }

    fn available_formats() -> String {
        let formats = [
            (cfg!(feature = "yaml"), "yaml (.yml, .yaml)"),
            (cfg!(feature = "json"), "json (.json)"),
            (cfg!(feature = "toml"), "toml (.toml)"),
        ]
        .into_iter()
        .filter_map(|(enabled, name)| enabled.then_some(name))
        .collect::<Vec<_>>();

        if formats.is_empty() {
            "none".to_string()
        } else {
            formats.join(", ")
        }
    }
}

/// Serialization format of a job file, usually inferred from its extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateFormat {
    Json,
    Toml,
    Yaml,
    Unknown(String),
}

impl std::fmt::Display for TemplateFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TemplateFormat::Json => write!(f, "json"),
            TemplateFormat::Toml => write!(f, "toml"),
            TemplateFormat::Yaml => write!(f, "yaml"),
            TemplateFormat::Unknown(format) => write!(f, "{format}"),
        }
    }
}

/// Loads job definitions from files or strings, substituting `${param}`
/// placeholders before parsing.
///
/// Connection strings and other secrets are meant to come in as parameters
/// instead of being written into the job file.
pub trait TemplateLoader: Sized {
    /// Loads a job file. Use [`format_from_path`] to infer the format.
    fn from_file<P: AsRef<Path>>(
        path: P,
        format: TemplateFormat,
        params: HashMap<String, String>,
    ) -> Result<Self, TemplateError>;

    fn from_str<T: AsRef<str>>(
        value: T,
        format: TemplateFormat,
        params: HashMap<String, String>,
    ) -> Result<Self, TemplateError>;

    /// Replaces every `${name}` with its value.
    ///
    /// # Errors
    ///
    /// [`TemplateError::MissingParams`] lists every placeholder left without
    /// a value.
    fn substitute_params(
        raw: &str,
        params: HashMap<String, String>,
    ) -> Result<String, TemplateError> {
        static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
        let placeholder = PLACEHOLDER
            .get_or_init(|| Regex::new(r"\$\{([a-zA-Z0-9_]+)\}").expect("invalid regex"));

        let mut missing = HashSet::new();
        let definition = placeholder.replace_all(raw, |caps: &regex::Captures| {
            match params.get(&caps[1]) {
                Some(value) => value.clone(),
                None => {
                    missing.insert(caps[1].to_string());
                    caps[0].to_string()
                }
            }
        });

        if !missing.is_empty() {
            return Err(TemplateError::MissingParams(missing));
        }

        Ok(definition.into_owned())
    }
}

impl TemplateLoader for Job {
    fn from_file<P: AsRef<Path>>(
        path: P,
        format: TemplateFormat,
        params: HashMap<String, String>,
    ) -> Result<Job, TemplateError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| TemplateError::NotFound {
            source: e,
            file_path: path.display().to_string(),
        })?;
        Self::from_str(contents, format, params)
    }

    fn from_str<T: AsRef<str>>(
        value: T,
        format: TemplateFormat,
        params: HashMap<String, String>,
    ) -> Result<Job, TemplateError> {
        debug!("Parsing job with format: {format:?}");

        #[allow(unused_variables)]
        let definition = Self::substitute_params(value.as_ref(), params)?;

        let job: Job = match format {
            TemplateFormat::Yaml => {
                #[cfg(feature = "yaml")]
                {
                    serde_yml::from_str::<Job>(&definition).map_err(|error| {
                        let offset = match error.location() {
                            Some(location) => SourceOffset::from_location(
                                &definition,
                                location.line(),
                                location.column(),
                            ),
                            None => SourceOffset::from(0),
                        };
                        TemplateError::ParseYaml {
                            source_code: Arc::new(NamedSource::new("job.yml", definition.clone())),
                            span: SourceSpan::new(offset, 1),
                            error,
                        }
                    })?
                }
                #[cfg(not(feature = "yaml"))]
                {
                    return Err(TemplateError::UnknownFormat(TemplateFormat::Yaml));
                }
            }
            TemplateFormat::Json => {
                #[cfg(feature = "json")]
                {
                    serde_json::from_str::<Job>(&definition).map_err(|error| {
                        let offset =
                            SourceOffset::from_location(&definition, error.line(), error.column());
                        TemplateError::ParseJson {
                            source_code: Arc::new(NamedSource::new("job.json", definition.clone())),
                            span: SourceSpan::new(offset, 1),
                            error,
                        }
                    })?
                }
                #[cfg(not(feature = "json"))]
                {
                    return Err(TemplateError::UnknownFormat(TemplateFormat::Json));
                }
            }
            TemplateFormat::Toml => {
                #[cfg(feature = "toml")]
                {
                    toml::from_str::<Job>(&definition).map_err(|error| {
                        let offset = error
                            .span()
                            .map(|span| SourceOffset::from(span.start))
                            .unwrap_or_else(|| SourceOffset::from(0));
                        TemplateError::ParseToml {
                            source_code: Arc::new(NamedSource::new("job.toml", definition.clone())),
                            span: SourceSpan::new(offset, 1),
                            error,
                        }
                    })?
                }
                #[cfg(not(feature = "toml"))]
                {
                    return Err(TemplateError::UnknownFormat(TemplateFormat::Toml));
                }
            }
            fmt @ TemplateFormat::Unknown(_) => return Err(TemplateError::UnknownFormat(fmt)),
        };

        validate_job(&job)?;

        Ok(job)
    }
}

/// Semantic checks serde cannot express
pub fn validate_job(job: &Job) -> Result<(), TemplateError> {
    let invalid = |reason: String| TemplateError::InvalidJob {
        job: job.name.clone(),
        reason,
    };
    let target = &job.target;

    if job.window.max_window_days == 0 {
        return Err(invalid("window.max_window_days must be positive".into()));
    }

    if target.columns.is_empty() {
        return Err(invalid("the target has no columns".into()));
    }

    // column names compare case-insensitively, as unquoted SQL identifiers do
    let mut columns = HashSet::new();
    for column in &target.columns {
        if !columns.insert(column.name.to_ascii_lowercase()) {
            return Err(invalid(format!("column '{}' is listed twice", column.name)));
        }
    }

    if columns.contains(&target.run_key.to_ascii_lowercase()) {
        return Err(invalid(format!(
            "run key '{}' must not be one of the target columns",
            target.run_key
        )));
    }

    if target.unique_key.is_empty() {
        return Err(invalid("the target has no unique key".into()));
    }
    if let Some(key) = target
        .unique_key
        .iter()
        .find(|k| !columns.contains(&k.to_ascii_lowercase()))
    {
        return Err(invalid(format!("unique key column '{key}' is not a target column")));
    }

    if let Some(column) = job
        .extract
        .date_columns
        .iter()
        .find(|c| !columns.contains(&c.to_ascii_lowercase()))
    {
        return Err(invalid(format!("date column '{column}' is not a target column")));
    }

    if !job.extract.delimiter.is_ascii() {
        return Err(invalid(format!(
            "delimiter '{}' is not an ASCII character",
            job.extract.delimiter
        )));
    }

    let mut tasks = HashSet::new();
    for task in &job.tasks {
        if !steps::ALL.contains(&task.name.as_str()) {
            return Err(invalid(format!(
                "unknown task '{}', expected one of {}",
                task.name,
                steps::ALL.join(", ")
            )));
        }
        if let Some(dependency) = &task.depends_on {
            if !tasks.contains(dependency.as_str()) {
                return Err(invalid(format!(
                    "task '{}' depends on '{dependency}', which is not an earlier task",
                    task.name
                )));
            }
        }
        if !tasks.insert(task.name.as_str()) {
            return Err(invalid(format!("task '{}' is listed twice", task.name)));
        }
    }

    Ok(())
}

pub fn format_from_path<P: AsRef<Path>>(path: P) -> TemplateFormat {
    let path = path.as_ref();
    let ext = path.extension().and_then(|s| s.to_str());

    match ext {
        Some("toml") => TemplateFormat::Toml,
        Some("json") => TemplateFormat::Json,
        Some("yml") | Some("yaml") => TemplateFormat::Yaml,
        ext => TemplateFormat::Unknown(ext.unwrap_or("unknown_ext").to_string()),
    }
}
