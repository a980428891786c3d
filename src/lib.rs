//! # EOL Station
//!
//! End-of-line hardware test station engine. A device under test (DUT) is driven over a CAN
//! bus, optionally measured with an oscilloscope, and judged pass/fail against per-test
//! tolerances.
//!
//! ## Crate Structure
//!
//! - **`sequencer`**: runs an ordered test plan on one worker task with pause, resume and
//!   cancel, a DUT test-mode precondition and an ordered event stream.
//! - **`procedures`**: the `TestRunner` and its twelve procedures (actuate, dwell, sample,
//!   evaluate), test specs and results.
//! - **`calibration`**: least squares fit, gain error and adjustment factor.
//! - **`transport`**: the signal and instrument transport traits, a CAN bus built on a raw
//!   frame adapter and a message database, and simulated DUT/oscilloscope implementations.
//! - **`simulation`**: a nominal simulated DUT and oscilloscope built from a test plan.
//! - **`config`**: layered station configuration (`figment`).
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`error`**: the `EolError` taxonomy.
//!
//! ## Data Flow
//!
//! ```text
//! Sequencer ──▶ TestRunner ──▶ SignalTransport / InstrumentTransport
//!     ▲             │
//!     │             ▼
//!  events ◀── ExecutionResult ◀── calibration
//! ```

pub mod calibration;
pub mod config;
pub mod error;
pub mod logging;
pub mod procedures;
pub mod sequencer;
pub mod simulation;
pub mod transport;

pub use error::{EolError, EolResult};
pub use procedures::{ExecutionResult, RunnerTiming, TestPlan, TestRunner, TestSpec, TestStatus};
pub use sequencer::{SequenceEvent, SequenceReport, SequenceState, Sequencer, SequencerConfig};
