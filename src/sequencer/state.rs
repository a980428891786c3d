//! Sequence lifecycle state, run bookkeeping and the final report.

use crate::error::{EolError, EolResult};
use crate::procedures::{ExecutionResult, TestSpec, TestStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use uuid::Uuid;

/// Sequencer lifecycle state.
///
/// ```text
/// Idle ──start──▶ Running ──last test──▶ Completed
///                  │   ▲
///            pause │   │ resume
///                  ▼   │
///                 Paused
///                  │
///   cancel (Running|Paused) ──▶ Cancelling ──next checkpoint──▶ Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequenceState {
    /// No sequence started
    Idle,
    /// Tests are executing
    Running,
    /// Waiting for `resume()` at a test boundary
    Paused,
    /// Cancel requested; no further test will start
    Cancelling,
    /// Stopped by `cancel()`
    Cancelled,
    /// Every test ran
    Completed,
}

impl std::fmt::Display for SequenceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SequenceState::Idle => write!(f, "Idle"),
            SequenceState::Running => write!(f, "Running"),
            SequenceState::Paused => write!(f, "Paused"),
            SequenceState::Cancelling => write!(f, "Cancelling"),
            SequenceState::Cancelled => write!(f, "Cancelled"),
            SequenceState::Completed => write!(f, "Completed"),
        }
    }
}

impl SequenceState {
    /// Check if the state allows starting a new sequence.
    pub fn can_begin(&self) -> bool {
        matches!(
            self,
            SequenceState::Idle | SequenceState::Completed | SequenceState::Cancelled
        )
    }

    /// Check if the state allows pausing.
    pub fn can_pause(&self) -> bool {
        matches!(self, SequenceState::Running)
    }

    /// Check if the state allows resuming.
    pub fn can_resume(&self) -> bool {
        matches!(self, SequenceState::Paused)
    }

    /// Check if the state allows cancelling.
    pub fn can_cancel(&self) -> bool {
        matches!(self, SequenceState::Running | SequenceState::Paused)
    }

    /// Whether a started sequence has ended.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SequenceState::Completed | SequenceState::Cancelled)
    }
}

/// Bookkeeping for one started sequence, owned by the worker.
#[derive(Debug)]
pub struct SequenceRun {
    /// Unique run identifier
    pub run_id: Uuid,
    /// Device under test
    pub dut_uid: i64,
    /// Tests in execution order
    pub tests: Vec<TestSpec>,
    /// Index of the next test to run
    pub current_index: usize,
    /// Results of the tests run so far
    pub results: Vec<ExecutionResult>,
    /// Start time
    pub started_at: DateTime<Utc>,
}

impl SequenceRun {
    /// Begin a run.
    pub fn new(tests: Vec<TestSpec>, dut_uid: i64) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            dut_uid,
            current_index: 0,
            results: Vec::with_capacity(tests.len()),
            tests,
            started_at: Utc::now(),
        }
    }

    /// Total number of tests.
    pub fn total(&self) -> usize {
        self.tests.len()
    }

    /// Next test to run, if any.
    pub fn current(&self) -> Option<&TestSpec> {
        self.tests.get(self.current_index)
    }

    /// Append the result of the current test and advance.
    pub fn record(&mut self, result: ExecutionResult) {
        self.results.push(result);
        self.current_index += 1;
        debug_assert_eq!(self.results.len(), self.current_index);
    }

    /// Wall time since the run started.
    pub fn elapsed_s(&self) -> f64 {
        (Utc::now() - self.started_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

/// Aggregate counts for a finished sequence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SequenceSummary {
    /// Tests in the plan
    pub total: usize,
    /// Tests that passed
    pub passed: usize,
    /// Tests that failed a tolerance
    pub failed: usize,
    /// Tests that could not reach a verdict
    pub errors: usize,
    /// Tests never started
    pub not_run: usize,
    /// Total wall time
    pub elapsed_s: f64,
}

impl SequenceSummary {
    /// Count the outcomes of `results` against a plan of `total` tests.
    pub fn from_results(results: &[ExecutionResult], total: usize, elapsed_s: f64) -> Self {
        let count = |status| results.iter().filter(|r| r.status == status).count();
        Self {
            total,
            passed: count(TestStatus::Pass),
            failed: count(TestStatus::Fail),
            errors: count(TestStatus::Error),
            not_run: total.saturating_sub(results.len()),
            elapsed_s,
        }
    }

    /// Whether every planned test passed.
    pub fn all_passed(&self) -> bool {
        self.total > 0 && self.passed == self.total
    }
}

impl std::fmt::Display for SequenceSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} passed, {} failed, {} errors",
            self.passed, self.failed, self.errors
        )?;
        if self.not_run > 0 {
            write!(f, ", {} not run", self.not_run)?;
        }
        write!(f, " in {:.2} s", self.elapsed_s)
    }
}

/// Everything a finished sequence produced, serializable for export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceReport {
    /// Unique run identifier
    pub run_id: Uuid,
    /// Device under test
    pub dut_uid: i64,
    /// Final state (`Completed` or `Cancelled`)
    pub state: SequenceState,
    /// Per-test results in execution order
    pub results: Vec<ExecutionResult>,
    /// Aggregate counts
    pub summary: SequenceSummary,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// End time
    pub finished_at: DateTime<Utc>,
}

impl SequenceReport {
    /// Close a run in its final state.
    pub fn from_run(run: SequenceRun, state: SequenceState) -> Self {
        let summary = SequenceSummary::from_results(&run.results, run.total(), run.elapsed_s());
        Self {
            run_id: run.run_id,
            dut_uid: run.dut_uid,
            state,
            results: run.results,
            summary,
            started_at: run.started_at,
            finished_at: Utc::now(),
        }
    }

    /// Save the report as pretty-printed JSON, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> EolResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&path, json)?;
        Ok(())
    }

    /// Load a report saved with [`SequenceReport::save`].
    pub fn load<P: AsRef<Path>>(path: P) -> EolResult<Self> {
        let json = fs::read_to_string(&path)?;
        serde_json::from_str(&json).map_err(EolError::from)
    }
}
