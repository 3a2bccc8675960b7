//! Load windows and the watermark calculator.
//!
//! A window is the `[start, end)` range of source data one run may process.
//! It is derived from the load mode, the operator's overrides and the
//! high-water mark left behind by the last complete run of the same target.

use std::sync::OnceLock;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use miette::Diagnostic;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use weir_schemas::{LoadMode, WindowSettings};

use crate::error::ErrorKind;
use crate::executor::{ExecutorError, QueryExecutor, Value};

#[derive(Debug, thiserror::Error, Diagnostic)]
pub enum WindowError {
    #[error("FULL mode requires either a forced start or prior run history")]
    #[diagnostic(
        code(weir::window::no_anchor),
        help("Pass a start date, e.g. `weir run -f job.yml 2026-01-01 mode=F30`")
    )]
    FullWithoutAnchor,

    #[error("INCREMENTAL mode requires a previous complete run, none was found")]
    #[diagnostic(
        code(weir::window::no_history),
        help("The first run of a target must be a FULL load with an explicit start date")
    )]
    IncrementalWithoutHistory,

    #[error("A forced start date is only valid for FULL loads")]
    #[diagnostic(
        code(weir::window::start_without_full),
        help("Add a mode token such as `mode=F30` next to the start date")
    )]
    StartRequiresFullMode,

    #[error("Invalid start date '{input}', expected YYYY-MM-DD")]
    #[diagnostic(code(weir::window::invalid_start))]
    InvalidStartDate {
        input: String,
        #[source]
        source: chrono::ParseError,
    },

    #[error("Invalid mode token '{0}', expected mode=F<days>")]
    #[diagnostic(code(weir::window::invalid_mode), help("Examples: `mode=F30`, `F7`"))]
    InvalidModeToken(String),

    #[error("A window must span at least one day")]
    #[diagnostic(code(weir::window::zero_days))]
    ZeroDays,

    #[error("Window of {days} days starting at {start} is out of range")]
    #[diagnostic(code(weir::window::overflow))]
    Overflow { start: DateTime<Utc>, days: u32 },

    #[error("Previous high-water mark '{0}' is not a timestamp")]
    #[diagnostic(code(weir::window::invalid_mark))]
    InvalidPreviousMark(String),

    #[error("Could not read the previous high-water mark")]
    #[diagnostic(code(weir::window::previous_mark))]
    PreviousMark(#[source] ExecutorError),
}

impl WindowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WindowError::FullWithoutAnchor
            | WindowError::IncrementalWithoutHistory
            | WindowError::StartRequiresFullMode
            | WindowError::ZeroDays => ErrorKind::Configuration,
            WindowError::InvalidStartDate { .. }
            | WindowError::InvalidModeToken(_)
            | WindowError::Overflow { .. }
            | WindowError::InvalidPreviousMark(_) => ErrorKind::DataValidation,
            WindowError::PreviousMark(source) => source.kind(),
        }
    }
}

/// A `[start, end)` time range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Window {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl Window {
    /// `None` when `end` lies before `start`
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Option<Self> {
        (end >= start).then_some(Self { start, end })
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    /// `ts` pulled into `[start, end]`
    pub fn clamp(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        ts.clamp(self.start, self.end)
    }
}

/// Everything needed to size a window, apart from the run history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowRequest {
    pub load_mode: LoadMode,
    pub max_window_days: u32,
    pub forced_start: Option<DateTime<Utc>>,
    pub increment_by_one_day: bool,
}

impl From<&WindowSettings> for WindowRequest {
    fn from(settings: &WindowSettings) -> Self {
        Self {
            load_mode: settings.load_mode,
            max_window_days: settings.max_window_days,
            forced_start: None,
            increment_by_one_day: settings.increment_by_one_day,
        }
    }
}

/// Window of the current run together with the inputs it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowState {
    pub previous_high_water_mark: Option<DateTime<Utc>>,
    pub request: WindowRequest,
    pub window: Window,
}

/// Computes the window for `request` given the previous high-water mark.
///
/// FULL windows start at the forced start, or else at the previous mark, and
/// may reach into the future. INCREMENTAL windows continue from the previous
/// mark and never end after `now`; when the start already lies after `now`
/// the window is empty.
///
/// # Errors
///
/// Returns a configuration error when the mode has nothing to anchor on.
pub fn compute_window(
    previous: Option<DateTime<Utc>>,
    request: &WindowRequest,
    now: DateTime<Utc>,
) -> Result<Window, WindowError> {
    let days = Duration::days(i64::from(request.max_window_days));
    let add_days = |start: DateTime<Utc>| {
        start
            .checked_add_signed(days)
            .ok_or(WindowError::Overflow {
                start,
                days: request.max_window_days,
            })
    };

    match request.load_mode {
        LoadMode::Full => {
            let start = request
                .forced_start
                .or(previous)
                .ok_or(WindowError::FullWithoutAnchor)?;
            let end = add_days(start)?;
            Ok(Window { start, end })
        }
        LoadMode::Incremental => {
            let mark = previous.ok_or(WindowError::IncrementalWithoutHistory)?;
            let start = if request.increment_by_one_day {
                mark.checked_add_signed(Duration::days(1))
                    .ok_or(WindowError::Overflow { start: mark, days: 1 })?
            } else {
                mark
            };

            if start > now {
                warn!(%start, %now, "Window starts in the future, no data expected");
                return Ok(Window { start, end: start });
            }

            let end = add_days(start)?.min(now);
            Ok(Window { start, end })
        }
    }
}

/// Reads the previous high-water mark and sizes the window of a run.
#[derive(Debug, Clone)]
pub struct WatermarkCalculator {
    query: String,
    params: Vec<Value>,
}

impl WatermarkCalculator {
    /// `query` must return at most one row whose first column is the mark
    pub fn new(query: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            query: query.into(),
            params,
        }
    }

    /// Runs the mark query; no row or a NULL cell means no history
    #[instrument(skip_all, err)]
    pub fn previous_high_water_mark(
        &self,
        executor: &mut dyn QueryExecutor,
    ) -> Result<Option<DateTime<Utc>>, WindowError> {
        debug!("Previous mark query: {}", self.query);

        let rows = executor
            .query(&self.query, &self.params)
            .map_err(WindowError::PreviousMark)?;

        match rows.first_value() {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value
                .as_timestamp()
                .map(Some)
                .ok_or_else(|| WindowError::InvalidPreviousMark(value.to_string())),
        }
    }

    pub fn calculate(
        &self,
        executor: &mut dyn QueryExecutor,
        request: &WindowRequest,
    ) -> Result<WindowState, WindowError> {
        self.calculate_at(executor, request, Utc::now())
    }

    /// [`WatermarkCalculator::calculate`] with an explicit "now"
    #[instrument(skip_all, fields(load_mode = %request.load_mode), err)]
    pub fn calculate_at(
        &self,
        executor: &mut dyn QueryExecutor,
        request: &WindowRequest,
        now: DateTime<Utc>,
    ) -> Result<WindowState, WindowError> {
        let previous = self.previous_high_water_mark(executor)?;
        let window = compute_window(previous, request, now)?;

        info!(
            previous_high_water_mark = ?previous,
            window_start = %window.start,
            window_end = %window.end,
            "Computed {} window",
            request.load_mode
        );

        Ok(WindowState {
            previous_high_water_mark: previous,
            request: request.clone(),
            window,
        })
    }
}

/// Operator overrides of the configured window, as given on the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowOverride {
    /// Explicit window start, midnight UTC
    pub forced_start: Option<DateTime<Utc>>,
    /// `Some` selects FULL mode, with a day count when the token carried one
    pub full_mode: Option<Option<u32>>,
}

impl WindowOverride {
    /// Parses an optional `YYYY-MM-DD` start date and an optional `mode=F<N>`
    /// token
    pub fn parse(start: Option<&str>, mode: Option<&str>) -> Result<Self, WindowError> {
        Ok(Self {
            forced_start: start.map(parse_start_date).transpose()?,
            full_mode: mode.map(parse_mode_token).transpose()?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.forced_start.is_none() && self.full_mode.is_none()
    }

    /// The request obtained by laying the overrides over `settings`
    pub fn apply(&self, settings: &WindowSettings) -> Result<WindowRequest, WindowError> {
        let mut request = WindowRequest::from(settings);

        if let Some(days) = self.full_mode {
            request.load_mode = LoadMode::Full;
            request.max_window_days = days.unwrap_or(settings.max_window_days);
        }

        if self.forced_start.is_some() && request.load_mode != LoadMode::Full {
            return Err(WindowError::StartRequiresFullMode);
        }
        request.forced_start = self.forced_start;

        Ok(request)
    }
}

/// `YYYY-MM-DD` as midnight UTC
pub fn parse_start_date(input: &str) -> Result<DateTime<Utc>, WindowError> {
    let date = NaiveDate::parse_from_str(input.trim(), "%Y-%m-%d").map_err(|source| {
        WindowError::InvalidStartDate {
            input: input.to_string(),
            source,
        }
    })?;

    Ok(date.and_time(NaiveTime::MIN).and_utc())
}

/// `mode=F<N>`, `config=F<N>` or a bare `F<N>`; an empty `N` keeps the
/// configured day count
pub fn parse_mode_token(token: &str) -> Result<Option<u32>, WindowError> {
    static MODE_REGEX: OnceLock<Regex> = OnceLock::new();
    let regex = MODE_REGEX.get_or_init(|| {
        Regex::new(r"^(?:(?:mode|config)=)?[Ff](\d*)$").expect("invalid regex")
    });

    let invalid = || WindowError::InvalidModeToken(token.to_string());
    let captures = regex.captures(token.trim()).ok_or_else(invalid)?;

    match captures.get(1).map(|m| m.as_str()).unwrap_or_default() {
        "" => Ok(None),
        digits => {
            let days = digits.parse::<u32>().map_err(|_| invalid())?;
            if days == 0 {
                return Err(WindowError::ZeroDays);
            }
            Ok(Some(days))
        }
    }
}
