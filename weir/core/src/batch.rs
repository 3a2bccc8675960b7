//! Staged batches: the rows one run extracts and loads.

use std::fs::File;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use tracing::{debug, instrument};

use crate::error::ErrorKind;
use crate::executor::{parse_timestamp, Rows};
use crate::window::Window;

#[derive(Debug, thiserror::Error, Diagnostic)]
pub enum BatchError {
    #[error("Cannot access batch file '{path}'")]
    #[diagnostic(code(weir::batch::io))]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed batch file '{path}'")]
    #[diagnostic(code(weir::batch::csv))]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("Delimiter '{0}' is not a single-byte character")]
    #[diagnostic(
        code(weir::batch::delimiter),
        help("Use an ASCII delimiter such as ';' or ','")
    )]
    InvalidDelimiter(char),

    #[error("Row {row} has {found} values, expected {expected}")]
    #[diagnostic(code(weir::batch::ragged_row))]
    RaggedRow {
        row: usize,
        expected: usize,
        found: usize,
    },

    #[error("Date column '{0}' is not part of the batch")]
    #[diagnostic(
        code(weir::batch::missing_date_column),
        help("Every column listed under extract.date_columns must be returned by the extract query")
    )]
    MissingDateColumn(String),

    #[error("Date column '{column}' is NULL in row {row}")]
    #[diagnostic(code(weir::batch::null_date))]
    NullDate { column: String, row: usize },

    #[error("Date column '{column}' holds '{value}' in row {row}, which is not a timestamp")]
    #[diagnostic(code(weir::batch::invalid_date))]
    InvalidDate {
        column: String,
        row: usize,
        value: String,
    },

    #[error("Observed dates cannot be reconciled: minimum {min} is after maximum {max}")]
    #[diagnostic(
        code(weir::batch::inconsistent_dates),
        help("The date columns of the batch cover disjoint ranges")
    )]
    InconsistentRange {
        min: DateTime<Utc>,
        max: DateTime<Utc>,
    },
}

impl BatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BatchError::Io { .. } | BatchError::Csv { .. } => ErrorKind::ExternalService,
            BatchError::InvalidDelimiter(_) | BatchError::MissingDateColumn(_) => {
                ErrorKind::Configuration
            }
            BatchError::RaggedRow { .. }
            | BatchError::NullDate { .. }
            | BatchError::InvalidDate { .. }
            | BatchError::InconsistentRange { .. } => ErrorKind::DataValidation,
        }
    }
}

/// Date range actually present in a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObservedRange {
    min: DateTime<Utc>,
    max: DateTime<Utc>,
}

impl ObservedRange {
    pub fn new(min: DateTime<Utc>, max: DateTime<Utc>) -> Result<Self, BatchError> {
        if min > max {
            return Err(BatchError::InconsistentRange { min, max });
        }
        Ok(Self { min, max })
    }

    pub fn min(&self) -> DateTime<Utc> {
        self.min
    }

    pub fn max(&self) -> DateTime<Utc> {
        self.max
    }

    /// Pulls both ends into `window`, so a late or skewed row can never move
    /// the high-water mark past what the run requested
    pub fn clamp_to(&self, window: &Window) -> Self {
        Self {
            min: window.clamp(self.min),
            max: window.clamp(self.max),
        }
    }
}

/// Rows of one run, all text, `None` meaning NULL.
///
/// Values stay textual end to end: backends cast them to the staging table's
/// column types during the bulk load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagingBatch {
    columns: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
}

impl StagingBatch {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn with_rows(
        columns: Vec<String>,
        rows: Vec<Vec<Option<String>>>,
    ) -> Result<Self, BatchError> {
        let mut batch = Self::new(columns);
        for row in rows {
            batch.push_row(row)?;
        }
        Ok(batch)
    }

    /// Converts a query result, rendering every cell as text
    pub fn from_rows(rows: &Rows) -> Self {
        Self {
            columns: rows.columns.clone(),
            rows: rows
                .rows
                .iter()
                .map(|row| row.iter().map(|v| v.to_text()).collect())
                .collect(),
        }
    }

    pub fn push_row(&mut self, row: Vec<Option<String>>) -> Result<(), BatchError> {
        if row.len() != self.columns.len() {
            return Err(BatchError::RaggedRow {
                row: self.rows.len() + 1,
                expected: self.columns.len(),
                found: row.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Option<String>>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }

    /// Sets `name` to `value` on every row, adding the column in front when
    /// the batch does not have it yet
    pub fn set_column(&mut self, name: &str, value: Option<String>) {
        match self.column_index(name) {
            Some(idx) => self
                .rows
                .iter_mut()
                .for_each(|row| row[idx] = value.clone()),
            None => {
                self.columns.insert(0, name.to_string());
                self.rows
                    .iter_mut()
                    .for_each(|row| row.insert(0, value.clone()));
            }
        }
    }

    /// Reads a delimited file with a header row. Empty fields become NULL.
    ///
    /// Returns `Ok(None)` when the file does not exist.
    #[instrument(skip_all, fields(path = %path.as_ref().display()), err)]
    pub fn read_delimited<P: AsRef<Path>>(
        path: P,
        delimiter: char,
    ) -> Result<Option<Self>, BatchError> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("No batch file found");
            return Ok(None);
        }

        let csv_error = |source| BatchError::Csv {
            path: path.to_path_buf(),
            source,
        };

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter_byte(delimiter)?)
            .has_headers(true)
            .from_path(path)
            .map_err(csv_error)?;

        let columns = reader
            .headers()
            .map_err(csv_error)?
            .iter()
            .map(str::to_string)
            .collect();

        let mut batch = Self::new(columns);
        for record in reader.records() {
            let record = record.map_err(csv_error)?;
            let row = record
                .iter()
                .map(|field| (!field.is_empty()).then(|| field.to_string()))
                .collect();
            batch.push_row(row)?;
        }

        debug!("Read {} rows", batch.len());
        Ok(Some(batch))
    }

    /// Writes the batch with a header row, NULL as an empty field
    #[instrument(skip_all, fields(path = %path.as_ref().display()), err)]
    pub fn write_delimited<P: AsRef<Path>>(&self, path: P, delimiter: char) -> Result<(), BatchError> {
        let path = path.as_ref();
        let csv_error = |source| BatchError::Csv {
            path: path.to_path_buf(),
            source,
        };

        let file = File::create(path).map_err(|source| BatchError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut writer = csv::WriterBuilder::new()
            .delimiter(delimiter_byte(delimiter)?)
            .from_writer(file);

        writer.write_record(&self.columns).map_err(csv_error)?;
        for row in &self.rows {
            writer
                .write_record(row.iter().map(|v| v.as_deref().unwrap_or("")))
                .map_err(csv_error)?;
        }

        writer.flush().map_err(|source| BatchError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Date range covered by `date_columns`.
    ///
    /// The range runs from the earliest to the latest value found in any of
    /// the columns. Returns `Ok(None)` for an empty batch or when no date
    /// column is configured.
    pub fn observed_range(&self, date_columns: &[String]) -> Result<Option<ObservedRange>, BatchError> {
        if self.is_empty() || date_columns.is_empty() {
            return Ok(None);
        }

        let mut min: Option<DateTime<Utc>> = None;
        let mut max: Option<DateTime<Utc>> = None;

        for column in date_columns {
            let idx = self
                .column_index(column)
                .ok_or_else(|| BatchError::MissingDateColumn(column.clone()))?;

            let (col_min, col_max) = self.column_bounds(column, idx)?;
            min = Some(min.map_or(col_min, |m| m.min(col_min)));
            max = Some(max.map_or(col_max, |m| m.max(col_max)));
        }

        match (min, max) {
            (Some(min), Some(max)) => ObservedRange::new(min, max).map(Some),
            _ => Ok(None),
        }
    }

    fn column_bounds(
        &self,
        column: &str,
        idx: usize,
    ) -> Result<(DateTime<Utc>, DateTime<Utc>), BatchError> {
        let mut bounds: Option<(DateTime<Utc>, DateTime<Utc>)> = None;

        for (pos, row) in self.rows.iter().enumerate() {
            let raw = row[idx].as_deref().ok_or_else(|| BatchError::NullDate {
                column: column.to_string(),
                row: pos + 1,
            })?;
            let ts = parse_timestamp(raw).ok_or_else(|| BatchError::InvalidDate {
                column: column.to_string(),
                row: pos + 1,
                value: raw.to_string(),
            })?;

            bounds = Some(match bounds {
                Some((lo, hi)) => (lo.min(ts), hi.max(ts)),
                None => (ts, ts),
            });
        }

        // callers only get here with at least one row
        bounds.ok_or_else(|| BatchError::MissingDateColumn(column.to_string()))
    }
}

fn delimiter_byte(delimiter: char) -> Result<u8, BatchError> {
    u8::try_from(delimiter)
        .ok()
        .filter(u8::is_ascii)
        .ok_or(BatchError::InvalidDelimiter(delimiter))
}
