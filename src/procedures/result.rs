//! Execution results.
//!
//! An [`ExecutionResult`] is created `Running` when a test starts and finalized exactly once
//! when its procedure returns. It owns everything the procedure measured: named statistics,
//! calibration fits and the raw sample series, so a reporter can plot or re-analyse a run
//! after the engine has moved on.

use super::spec::TestKind;
use crate::calibration::CalibrationFit;
use crate::error::{EolError, ErrorCategory};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

/// Outcome state of one test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestStatus {
    /// Not started
    NotRun,
    /// Procedure in progress
    Running,
    /// Within tolerance
    Pass,
    /// Measured, but outside tolerance
    Fail,
    /// No verdict could be reached
    Error,
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TestStatus::NotRun => "Not Run",
            TestStatus::Running => "Running",
            TestStatus::Pass => "Pass",
            TestStatus::Fail => "Fail",
            TestStatus::Error => "Error",
        };
        f.write_str(s)
    }
}

/// Verdict a procedure returns when it measured something.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Everything within tolerance
    Pass,
    /// Out of tolerance, with the reason
    Fail(String),
}

// =============================================================================
// Result Value
// =============================================================================

/// A value that can be stored in result statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResultValue {
    /// Boolean value
    Bool(bool),
    /// Integer value
    Integer(i64),
    /// Float value
    Float(f64),
    /// String value
    String(String),
}

impl ResultValue {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ResultValue::Float(v) => Some(*v),
            ResultValue::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }
}

impl From<bool> for ResultValue {
    fn from(v: bool) -> Self {
        ResultValue::Bool(v)
    }
}

impl From<i64> for ResultValue {
    fn from(v: i64) -> Self {
        ResultValue::Integer(v)
    }
}

impl From<u64> for ResultValue {
    fn from(v: u64) -> Self {
        ResultValue::Integer(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<usize> for ResultValue {
    fn from(v: usize) -> Self {
        ResultValue::Integer(v as i64)
    }
}

impl From<f64> for ResultValue {
    fn from(v: f64) -> Self {
        ResultValue::Float(v)
    }
}

impl From<String> for ResultValue {
    fn from(v: String) -> Self {
        ResultValue::String(v)
    }
}

impl From<&str> for ResultValue {
    fn from(v: &str) -> Self {
        ResultValue::String(v.to_string())
    }
}

/// A named raw series of (x, y) samples.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleSeries {
    /// Series name (e.g. "sweep", "second_sweep")
    pub name: String,
    /// Independent values
    pub x: Vec<f64>,
    /// Dependent values
    pub y: Vec<f64>,
}

/// Measurements collected while a procedure runs.
#[derive(Debug, Clone, Default)]
pub struct ResultData {
    pub(crate) statistics: BTreeMap<String, ResultValue>,
    pub(crate) fits: BTreeMap<String, CalibrationFit>,
    pub(crate) samples: Vec<SampleSeries>,
    pub(crate) notes: Vec<String>,
}

impl ResultData {
    /// Record a named statistic.
    pub fn stat(&mut self, key: impl Into<String>, value: impl Into<ResultValue>) {
        self.statistics.insert(key.into(), value.into());
    }

    /// Record an optional statistic; `None` is stored as "unavailable".
    pub fn stat_opt(&mut self, key: impl Into<String>, value: Option<f64>) {
        match value {
            Some(v) => self.stat(key, v),
            None => self.stat(key, "unavailable"),
        }
    }

    /// Record a calibration fit.
    pub fn fit(&mut self, key: impl Into<String>, fit: CalibrationFit) {
        self.fits.insert(key.into(), fit);
    }

    /// Keep a raw series.
    pub fn series(&mut self, name: impl Into<String>, x: Vec<f64>, y: Vec<f64>) {
        self.samples.push(SampleSeries {
            name: name.into(),
            x,
            y,
        });
    }

    /// Append a line to the notes.
    pub fn note(&mut self, line: impl Into<String>) {
        self.notes.push(line.into());
    }
}

// =============================================================================
// Execution Result
// =============================================================================

/// Result of running one test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Name of the spec that produced this result
    pub test_name: String,
    /// Procedure kind
    pub kind: TestKind,
    /// Current status
    pub status: TestStatus,
    /// Wall time spent in the procedure
    pub exec_time_s: f64,
    /// Human-readable notes
    #[serde(default)]
    pub notes: String,
    /// Error text when `status == Error`
    #[serde(default)]
    pub error: Option<String>,
    /// Error class when `status == Error`
    #[serde(default)]
    pub error_category: Option<ErrorCategory>,
    /// Variant-specific statistics
    #[serde(default)]
    pub statistics: BTreeMap<String, ResultValue>,
    /// Calibration fits
    #[serde(default)]
    pub fits: BTreeMap<String, CalibrationFit>,
    /// Raw series
    #[serde(default)]
    pub samples: Vec<SampleSeries>,
    /// Start time
    pub started_at: DateTime<Utc>,
}

impl ExecutionResult {
    /// Create a `Running` result.
    pub fn start(test_name: impl Into<String>, kind: TestKind) -> Self {
        Self {
            test_name: test_name.into(),
            kind,
            status: TestStatus::Running,
            exec_time_s: 0.0,
            notes: String::new(),
            error: None,
            error_category: None,
            statistics: BTreeMap::new(),
            fits: BTreeMap::new(),
            samples: Vec::new(),
            started_at: Utc::now(),
        }
    }

    /// Finalize from a procedure outcome and the data it collected.
    ///
    /// Only a `Running` result can be finalized; later calls are ignored.
    pub fn finalize(
        &mut self,
        outcome: Result<Verdict, EolError>,
        data: ResultData,
        exec_time_s: f64,
    ) {
        if self.status != TestStatus::Running {
            warn!(test = %self.test_name, status = %self.status, "Result already finalized");
            return;
        }
        let mut notes = data.notes;
        match outcome {
            Ok(Verdict::Pass) => self.status = TestStatus::Pass,
            Ok(Verdict::Fail(reason)) => {
                self.status = TestStatus::Fail;
                notes.push(reason);
            }
            Err(e) => {
                self.status = TestStatus::Error;
                self.error_category = Some(e.category());
                notes.push(e.to_string());
                self.error = Some(e.to_string());
            }
        }
        self.notes = notes.join("; ");
        self.statistics = data.statistics;
        self.fits = data.fits;
        self.samples = data.samples;
        self.exec_time_s = exec_time_s;
    }

    /// Whether the test passed.
    pub fn passed(&self) -> bool {
        self.status == TestStatus::Pass
    }

    /// Whether the result has left `Running`.
    pub fn is_final(&self) -> bool {
        matches!(
            self.status,
            TestStatus::Pass | TestStatus::Fail | TestStatus::Error
        )
    }

    /// Numeric statistic by key.
    pub fn statistic(&self, key: &str) -> Option<f64> {
        self.statistics.get(key).and_then(ResultValue::as_f64)
    }

    /// One-line summary for logs and the CLI.
    pub fn summary(&self) -> String {
        let mut line = format!(
            "{} [{}] {} in {:.2}s",
            self.test_name, self.kind, self.status, self.exec_time_s
        );
        if !self.notes.is_empty() {
            line.push_str(" - ");
            line.push_str(&self.notes);
        }
        line
    }
}
