//! Events emitted by the sequencer, in order, to every subscriber.

use super::state::SequenceSummary;
use crate::procedures::ExecutionResult;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sequencer progress notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SequenceEvent {
    /// A sequence of `total` tests started
    SequenceStarted {
        /// Run identifier
        run_id: Uuid,
        /// Number of tests
        total: usize,
    },
    /// Test `index` is about to run
    TestStarted {
        /// Zero-based position in the plan
        index: usize,
        /// Test name
        name: String,
    },
    /// Test `index` reached a verdict (Pass or Fail)
    TestFinished {
        /// Zero-based position in the plan
        index: usize,
        /// Whether the verdict was Pass
        success: bool,
        /// Result notes
        notes: String,
        /// Procedure wall time
        exec_time_s: f64,
    },
    /// Test `index` ended without a verdict
    TestFailed {
        /// Zero-based position in the plan
        index: usize,
        /// Error text
        error: String,
        /// Procedure wall time
        exec_time_s: f64,
    },
    /// `current` of `total` tests are done
    SequenceProgress {
        /// Tests completed so far
        current: usize,
        /// Number of tests
        total: usize,
    },
    /// The DUT is not in the mode a test requires; the sequence is paused
    TestModeMismatch {
        /// Test waiting for the mode
        name: String,
        /// Operator-facing explanation
        message: String,
    },
    /// The sequence stopped at a test boundary after `pause()`
    SequencePaused,
    /// The sequence continues after `resume()`
    SequenceResumed,
    /// The sequence stopped after `cancel()`
    SequenceCancelled,
    /// Every test ran
    SequenceFinished {
        /// Per-test results
        results: Vec<ExecutionResult>,
        /// Aggregate counts
        summary: SequenceSummary,
    },
}

impl SequenceEvent {
    /// Result of a finished test, as a `TestFinished` or `TestFailed` event.
    pub fn for_result(index: usize, result: &ExecutionResult) -> Self {
        match &result.error {
            Some(error) => SequenceEvent::TestFailed {
                index,
                error: error.clone(),
                exec_time_s: result.exec_time_s,
            },
            None => SequenceEvent::TestFinished {
                index,
                success: result.passed(),
                notes: result.notes.clone(),
                exec_time_s: result.exec_time_s,
            },
        }
    }

    /// Whether no further event follows for this sequence.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SequenceEvent::SequenceFinished { .. } | SequenceEvent::SequenceCancelled
        )
    }
}

impl std::fmt::Display for SequenceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SequenceEvent::SequenceStarted { run_id, total } => {
                write!(f, "sequence {run_id} started ({total} tests)")
            }
            SequenceEvent::TestStarted { index, name } => write!(f, "[{index}] {name} started"),
            SequenceEvent::TestFinished {
                index,
                success,
                notes,
                exec_time_s,
            } => {
                let verdict = if *success { "PASS" } else { "FAIL" };
                write!(f, "[{index}] {verdict} in {exec_time_s:.2} s")?;
                if !notes.is_empty() {
                    write!(f, " - {notes}")?;
                }
                Ok(())
            }
            SequenceEvent::TestFailed {
                index,
                error,
                exec_time_s,
            } => write!(f, "[{index}] ERROR in {exec_time_s:.2} s - {error}"),
            SequenceEvent::SequenceProgress { current, total } => {
                write!(f, "progress {current}/{total}")
            }
            SequenceEvent::TestModeMismatch { name, message } => {
                write!(f, "{name}: {message}; resume when ready")
            }
            SequenceEvent::SequencePaused => write!(f, "sequence paused"),
            SequenceEvent::SequenceResumed => write!(f, "sequence resumed"),
            SequenceEvent::SequenceCancelled => write!(f, "sequence cancelled"),
            SequenceEvent::SequenceFinished { summary, .. } => {
                write!(f, "sequence finished: {summary}")
            }
        }
    }
}
