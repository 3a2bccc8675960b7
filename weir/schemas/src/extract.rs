//! Extraction settings.

use std::path::PathBuf;

use bon::Builder;
use serde::{Deserialize, Serialize};

use crate::serde_helpers::{default_semicolon, default_true};

/// How a job pulls its window out of the source.
///
/// The query may reference `{window_start}` and `{window_end}`, both replaced
/// by quoted timestamp literals before execution.
///
/// # Examples
///
/// ```
/// use weir_schemas::ExtractSettings;
///
/// let extract = ExtractSettings::builder()
///     .query("SELECT * FROM orders WHERE updated_at >= {window_start}".to_string())
///     .date_columns(vec!["updated_at".to_string()])
///     .build();
///
/// assert_eq!(extract.delimiter, ';');
/// assert!(extract.output_dir.is_none());
/// assert!(extract.delete_output);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[serde(rename_all = "snake_case")]
pub struct ExtractSettings {
    /// Source query for one window
    pub query: String,

    /// Columns whose values determine the observed date range of a batch
    #[serde(default)]
    #[builder(default)]
    pub date_columns: Vec<String>,

    /// Field delimiter of staged batch files
    #[serde(default = "default_semicolon")]
    #[builder(default = default_semicolon())]
    pub delimiter: char,

    /// When set, each extracted batch is written to a file in this directory
    /// and the load step reads it back from there
    #[serde(default)]
    pub output_dir: Option<PathBuf>,

    /// Remove the batch file once it was loaded
    #[serde(default = "default_true")]
    #[builder(default = default_true())]
    pub delete_output: bool,
}
