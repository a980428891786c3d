//! Test Sequencer: runs an ordered list of tests on one worker task.
//!
//! The sequencer owns the run state machine and is the only caller into the
//! [`TestRunner`]. The runner (and with it the transports) is moved into the worker for the
//! lifetime of a sequence and handed back by [`Sequencer::wait`].
//!
//! # Checkpoints
//!
//! Pause takes effect only between tests. Cancel takes effect between tests and also
//! interrupts any dwell the in-flight procedure is waiting in. Before each test the DUT mode is
//! compared with the test's required mode; a mismatch pauses the sequence and a resume
//! re-checks it.
//!
//! # Usage
//!
//! ```rust,ignore
//! let sequencer = Sequencer::new(runner, SequencerConfig::default());
//! let mut events = sequencer.subscribe();
//! sequencer.start(plan.tests, 1042).await?;
//! while let Some(event) = events.recv().await {
//!     println!("{event}");
//!     if event.is_terminal() {
//!         break;
//!     }
//! }
//! let report = sequencer.wait().await?;
//! ```

pub mod events;
pub mod state;

pub use events::SequenceEvent;
pub use state::{SequenceReport, SequenceRun, SequenceState, SequenceSummary};

use crate::error::{EolError, EolResult};
use crate::procedures::spec::validate_plan;
use crate::procedures::{cancel_pair, CancelHandle, CancelToken, TestRunner, TestSpec};
use crate::transport::{ScopeConfig, SignalRef};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Sequencer options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    /// Signal carrying the DUT's current test mode; the mode precondition is skipped when unset
    pub mode_signal: Option<SignalRef>,
}

/// State shared between the sequencer handle and its worker.
struct Shared {
    state: watch::Sender<SequenceState>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<SequenceEvent>>>,
    config: SequencerConfig,
}

impl Shared {
    fn current(&self) -> SequenceState {
        *self.state.borrow()
    }

    /// Move from `from` to `to`; returns whether the transition happened.
    fn transition(&self, from: impl Fn(SequenceState) -> bool, to: SequenceState) -> bool {
        self.state.send_if_modified(|s| {
            if from(*s) {
                *s = to;
                true
            } else {
                false
            }
        })
    }

    fn emit(&self, event: SequenceEvent) {
        debug!(%event, "Sequence event");
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Block while paused; returns `false` if the sequence was cancelled instead of resumed.
    async fn wait_while_paused(&self) -> bool {
        let mut rx = self.state.subscribe();
        let resumed = rx
            .wait_for(|s| *s != SequenceState::Paused)
            .await
            .map(|s| *s == SequenceState::Running)
            .unwrap_or(false);
        resumed
    }

    /// Test boundary: honour pause and cancel. Returns `false` when the sequence must stop.
    async fn checkpoint(&self) -> bool {
        match self.current() {
            SequenceState::Cancelling => false,
            SequenceState::Paused => {
                info!("Sequence paused");
                self.emit(SequenceEvent::SequencePaused);
                if !self.wait_while_paused().await {
                    return false;
                }
                info!("Sequence resumed");
                self.emit(SequenceEvent::SequenceResumed);
                true
            }
            _ => true,
        }
    }

    /// Hold the sequence until the DUT reports the mode `spec` requires.
    ///
    /// Returns `false` when the sequence was cancelled while waiting.
    async fn await_test_mode(&self, runner: &TestRunner, spec: &TestSpec) -> bool {
        let Some(signal) = &self.config.mode_signal else {
            return true;
        };
        let required = f64::from(spec.test_mode);
        loop {
            let message = match runner.read_mode(signal) {
                Ok(mode) if mode == required => return true,
                Ok(mode) => format!(
                    "DUT reports mode {mode}, test requires mode {}",
                    spec.test_mode
                ),
                Err(e) => format!("{e}; test requires mode {}", spec.test_mode),
            };
            if self.current() == SequenceState::Cancelling {
                return false;
            }
            self.transition(|s| s == SequenceState::Running, SequenceState::Paused);
            warn!(test = %spec.name, %message, "Test mode mismatch");
            self.emit(SequenceEvent::TestModeMismatch {
                name: spec.name.clone(),
                message,
            });
            if !self.wait_while_paused().await {
                return false;
            }
            info!(test = %spec.name, "Re-checking test mode");
            self.emit(SequenceEvent::SequenceResumed);
        }
    }
}

type Worker = JoinHandle<(TestRunner, SequenceReport)>;

/// Drives a [`TestRunner`] through an ordered list of tests.
pub struct Sequencer {
    shared: Arc<Shared>,
    runner: Mutex<Option<TestRunner>>,
    scope_config: Option<ScopeConfig>,
    cancel: Mutex<Option<CancelHandle>>,
    worker: Mutex<Option<Worker>>,
}

impl Sequencer {
    /// Create an idle sequencer that owns `runner`.
    pub fn new(runner: TestRunner, config: SequencerConfig) -> Self {
        let (state, _) = watch::channel(SequenceState::Idle);
        Self {
            shared: Arc::new(Shared {
                state,
                subscribers: Mutex::new(Vec::new()),
                config,
            }),
            runner: Mutex::new(Some(runner)),
            scope_config: None,
            cancel: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    /// Oscilloscope configuration applied at the start of every sequence.
    pub fn with_scope_config(mut self, config: ScopeConfig) -> Self {
        self.scope_config = Some(config);
        self
    }

    /// Receive every event emitted from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SequenceEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.subscribers.lock().push(tx);
        rx
    }

    /// Current state.
    pub fn state(&self) -> SequenceState {
        self.shared.current()
    }

    /// Watch state changes.
    pub fn watch_state(&self) -> watch::Receiver<SequenceState> {
        self.shared.state.subscribe()
    }

    /// Start running `tests` against the DUT `dut_uid` and return the run id.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` if a sequence is active, `tests` is empty or invalid, `dut_uid <= 0`,
    ///   or the previous sequence was not collected with [`Sequencer::wait`]
    /// - `Instrument` if the oscilloscope rejects the configured settings
    pub async fn start(&self, tests: Vec<TestSpec>, dut_uid: i64) -> EolResult<Uuid> {
        let state = self.state();
        if !state.can_begin() {
            return Err(EolError::InvalidInput(format!(
                "cannot start: sequencer is {state}"
            )));
        }
        if dut_uid <= 0 {
            return Err(EolError::InvalidInput(format!(
                "DUT UID must be positive, got {dut_uid}"
            )));
        }
        validate_plan(&tests)?;

        let runner = self.runner.lock().take().ok_or_else(|| {
            EolError::InvalidInput("previous sequence has not been collected".into())
        })?;
        if let Some(config) = &self.scope_config {
            if let Err(errors) = runner.prepare(config).await {
                *self.runner.lock() = Some(runner);
                let reasons: Vec<String> = errors.iter().map(ToString::to_string).collect();
                return Err(EolError::Instrument(format!(
                    "oscilloscope configuration rejected: {}",
                    reasons.join("; ")
                )));
            }
        }

        let (handle, token) = cancel_pair();
        *self.cancel.lock() = Some(handle);
        let run = SequenceRun::new(tests, dut_uid);
        let run_id = run.run_id;
        self.shared.state.send_replace(SequenceState::Running);
        info!(%run_id, dut_uid, total = run.total(), "Sequence started");

        let span = info_span!("sequence", %run_id, dut_uid);
        let worker = tokio::spawn(
            run_sequence(self.shared.clone(), runner, run, token).instrument(span),
        );
        *self.worker.lock() = Some(worker);
        Ok(run_id)
    }

    /// Pause at the next test boundary. No-op unless running.
    pub fn pause(&self) -> bool {
        let paused = self
            .shared
            .transition(|s| s.can_pause(), SequenceState::Paused);
        if paused {
            info!("Pause requested");
        }
        paused
    }

    /// Continue a paused sequence. No-op unless paused.
    pub fn resume(&self) -> bool {
        let resumed = self
            .shared
            .transition(|s| s.can_resume(), SequenceState::Running);
        if resumed {
            info!("Resume requested");
        }
        resumed
    }

    /// Stop the sequence: the in-flight test's waits are interrupted and no further test starts.
    pub fn cancel(&self) -> bool {
        let cancelling = self
            .shared
            .transition(|s| s.can_cancel(), SequenceState::Cancelling);
        if cancelling {
            info!("Cancel requested");
            if let Some(handle) = self.cancel.lock().as_ref() {
                handle.cancel();
            }
        }
        cancelling
    }

    /// Wait for the running sequence to end and return its report.
    pub async fn wait(&self) -> EolResult<SequenceReport> {
        let worker = self
            .worker
            .lock()
            .take()
            .ok_or_else(|| EolError::InvalidInput("no sequence started".into()))?;
        let (runner, report) = worker
            .await
            .map_err(|e| EolError::Internal(format!("sequence worker failed: {e}")))?;
        *self.runner.lock() = Some(runner);
        *self.cancel.lock() = None;
        Ok(report)
    }

    /// Start a sequence and wait for it to end.
    pub async fn run(&self, tests: Vec<TestSpec>, dut_uid: i64) -> EolResult<SequenceReport> {
        self.start(tests, dut_uid).await?;
        self.wait().await
    }
}

impl Drop for Sequencer {
    fn drop(&mut self) {
        if let Some(handle) = self.cancel.lock().take() {
            handle.cancel();
        }
    }
}

async fn run_sequence(
    shared: Arc<Shared>,
    runner: TestRunner,
    mut run: SequenceRun,
    cancel: CancelToken,
) -> (TestRunner, SequenceReport) {
    let total = run.total();
    shared.emit(SequenceEvent::SequenceStarted {
        run_id: run.run_id,
        total,
    });

    let mut cancelled = false;
    while let Some(spec) = run.current().cloned() {
        if !shared.checkpoint().await || !shared.await_test_mode(&runner, &spec).await {
            cancelled = true;
            break;
        }

        let index = run.current_index;
        shared.emit(SequenceEvent::TestStarted {
            index,
            name: spec.name.clone(),
        });
        let result = runner.run_with_cancel(&spec, &cancel).await;
        shared.emit(SequenceEvent::for_result(index, &result));
        run.record(result);
        shared.emit(SequenceEvent::SequenceProgress {
            current: index + 1,
            total,
        });
    }
    if shared.current() == SequenceState::Cancelling {
        cancelled = true;
    }

    let final_state = if cancelled {
        SequenceState::Cancelled
    } else {
        SequenceState::Completed
    };
    let report = SequenceReport::from_run(run, final_state);
    shared.state.send_replace(final_state);
    info!(state = %final_state, summary = %report.summary, "Sequence ended");

    if cancelled {
        shared.emit(SequenceEvent::SequenceCancelled);
    } else {
        shared.emit(SequenceEvent::SequenceFinished {
            results: report.results.clone(),
            summary: report.summary,
        });
    }
    (runner, report)
}
