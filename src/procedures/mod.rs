//! Test Runner and the twelve test procedures.
//!
//! Every procedure follows the same shape: actuate, dwell, sample, evaluate. They differ in
//! what they command and how they turn samples into a verdict:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │ TestRunner::run(spec)                                                 │
//! │   validate spec ─▶ resolve signals ─▶ dispatch on Actuation ─▶ result │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │ ProcedureContext                                                      │
//! │   write / read / dwell / sample / scope_average   (all cancellable)   │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │ SignalTransport (CAN)            InstrumentTransport (oscilloscope)   │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Outcomes
//!
//! A procedure returns `Ok(Verdict::Pass)`, `Ok(Verdict::Fail(reason))` when it measured a value
//! outside tolerance, or `Err(e)` when it could not reach a verdict. The runner maps these onto
//! `Pass`, `Fail` and `Error` results; an error never turns into a `Fail`.
//!
//! Panics inside a procedure are caught and recorded as `Error` results.
//!
//! # Fresh readings
//!
//! Reads only accept samples decoded after the context's freshness mark. The mark is set when
//! the test starts and moved forward on every command, so a value cached before the actuation
//! never counts as its response. A DUT that stays silent produces an `Error`, not a verdict.

mod analog;
mod dc_bus;
mod digital;
mod fan;
mod output_current;
mod phase_current;
mod pwm;
mod regulation;
pub mod result;
pub mod safety;
pub mod spec;
mod temperature;

pub use result::{ExecutionResult, ResultData, ResultValue, SampleSeries, TestStatus, Verdict};
pub use safety::{cancel_pair, CancelHandle, CancelToken};
pub use spec::{Actuation, TestKind, TestPlan, TestSpec};

use crate::calibration::finite_mean;
use crate::error::{EolError, EolResult};
use crate::transport::{InstrumentTransport, ScopeConfig, SignalRef, SignalTransport};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

// =============================================================================
// Timing
// =============================================================================

/// Fixed waits shared by every procedure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerTiming {
    /// Fixed settle time added after each sweep step's dwell
    pub settle_ms: u64,
    /// Interval between samples inside an acquisition window
    pub sample_interval_ms: u64,
    /// Interval between status polls (fan, regulation)
    pub poll_interval_ms: u64,
}

impl Default for RunnerTiming {
    fn default() -> Self {
        Self {
            settle_ms: 50,
            sample_interval_ms: 20,
            poll_interval_ms: 50,
        }
    }
}

// =============================================================================
// Procedure Context
// =============================================================================

/// A sample source inside an acquisition window.
#[derive(Debug, Clone, Copy)]
pub enum Source<'s> {
    /// Latest value of a CAN signal
    Signal(&'s SignalRef),
    /// Average of one oscilloscope acquisition
    Scope(u8),
}

impl std::fmt::Display for Source<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Source::Signal(s) => write!(f, "{s}"),
            Source::Scope(ch) => write!(f, "scope channel {ch}"),
        }
    }
}

/// Hardware access and result recording for one running procedure.
pub struct ProcedureContext<'a> {
    signals: &'a dyn SignalTransport,
    scope: Option<&'a dyn InstrumentTransport>,
    timing: &'a RunnerTiming,
    cancel: &'a CancelToken,
    fresh_since: Mutex<DateTime<Utc>>,
    /// Statistics, fits, series and notes collected so far
    pub data: ResultData,
}

impl<'a> ProcedureContext<'a> {
    fn new(
        signals: &'a dyn SignalTransport,
        scope: Option<&'a dyn InstrumentTransport>,
        timing: &'a RunnerTiming,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            signals,
            scope,
            timing,
            cancel,
            fresh_since: Mutex::new(Utc::now()),
            data: ResultData::default(),
        }
    }

    /// Oldest decode time a reading may carry.
    pub fn fresh_since(&self) -> DateTime<Utc> {
        *self.fresh_since.lock()
    }

    fn mark_command(&self) {
        *self.fresh_since.lock() = Utc::now();
    }

    /// Runner timing in effect.
    pub fn timing(&self) -> &RunnerTiming {
        self.timing
    }

    /// Command one signal.
    pub async fn write(&self, signal: &SignalRef, value: f64) -> EolResult<()> {
        self.cancel.check()?;
        debug!(%signal, value, "Write");
        self.mark_command();
        self.signals
            .write_signals(signal.message_id, &[(signal.signal.as_str(), value)])
            .await
    }

    /// Command several signals, one frame per message.
    pub async fn write_group(&self, values: &[(&SignalRef, f64)]) -> EolResult<()> {
        self.cancel.check()?;
        let mut order: Vec<u32> = Vec::new();
        let mut by_message: HashMap<u32, Vec<(&str, f64)>> = HashMap::new();
        for (signal, value) in values {
            if !by_message.contains_key(&signal.message_id) {
                order.push(signal.message_id);
            }
            by_message
                .entry(signal.message_id)
                .or_default()
                .push((signal.signal.as_str(), *value));
        }
        self.mark_command();
        for id in order {
            if let Some(group) = by_message.get(&id) {
                self.signals.write_signals(id, group).await?;
            }
        }
        Ok(())
    }

    /// Command a signal back to a safe value, logging instead of failing.
    ///
    /// Runs even after cancellation.
    pub async fn restore(&self, signal: &SignalRef, value: f64) {
        if let Err(e) = self
            .signals
            .write_signals(signal.message_id, &[(signal.signal.as_str(), value)])
            .await
        {
            warn!(%signal, value, error = %e, "Failed to restore output");
        }
    }

    /// Latest fresh value of a signal, or `Timeout` if nothing arrived since the last command.
    pub fn read(&self, signal: &SignalRef) -> EolResult<f64> {
        self.try_read(signal).ok_or_else(|| {
            EolError::Timeout(format!(
                "no value received for {signal} since the last command"
            ))
        })
    }

    /// Latest finite value of a signal decoded at or after the freshness mark.
    pub fn try_read(&self, signal: &SignalRef) -> Option<f64> {
        let since = self.fresh_since();
        self.signals
            .latest_value(signal.message_id, &signal.signal)
            .filter(|s| s.timestamp >= since)
            .map(|s| s.value)
            .filter(|v| v.is_finite())
    }

    /// Cancellable wait.
    pub async fn dwell(&self, ms: u64) -> EolResult<()> {
        self.wait(Duration::from_millis(ms)).await
    }

    /// Cancellable wait with sub-millisecond resolution.
    pub async fn wait(&self, duration: Duration) -> EolResult<()> {
        self.cancel.sleep(duration).await
    }

    /// Dwell plus the fixed settle time.
    pub async fn settle(&self, dwell_ms: u64) -> EolResult<()> {
        self.dwell(dwell_ms.saturating_add(self.timing.settle_ms))
            .await
    }

    /// Connected oscilloscope.
    pub fn scope(&self) -> EolResult<&'a dyn InstrumentTransport> {
        match self.scope {
            Some(scope) if scope.is_connected() => Ok(scope),
            Some(_) => Err(EolError::Unreachable("oscilloscope not connected".into())),
            None => Err(EolError::Unreachable("no oscilloscope configured".into())),
        }
    }

    /// Average of one acquisition, ignoring invalid samples; `None` if every sample is invalid.
    pub async fn scope_mean(&self, channel: u8) -> EolResult<Option<f64>> {
        self.cancel.check()?;
        let samples = self.scope()?.query(channel).await?;
        Ok(finite_mean(&samples))
    }

    /// Average of one acquisition; an acquisition without valid samples is an error.
    pub async fn scope_average(&self, channel: u8) -> EolResult<f64> {
        self.scope_mean(channel).await?.ok_or_else(|| {
            EolError::Instrument(format!("scope channel {channel} returned no valid samples"))
        })
    }

    /// Sample every source repeatedly for `window_ms`, at least once.
    ///
    /// Invalid readings are skipped. Fails if any source produced no valid reading.
    pub async fn sample(
        &self,
        sources: &[Source<'_>],
        window_ms: u64,
    ) -> EolResult<Vec<Vec<f64>>> {
        let mut series: Vec<Vec<f64>> = vec![Vec::new(); sources.len()];
        let deadline = Instant::now() + Duration::from_millis(window_ms);
        let interval = Duration::from_millis(self.timing.sample_interval_ms.max(1));
        loop {
            for (source, values) in sources.iter().zip(series.iter_mut()) {
                let reading = match source {
                    Source::Signal(signal) => self.try_read(signal),
                    Source::Scope(channel) => self.scope_mean(*channel).await?,
                };
                if let Some(v) = reading {
                    values.push(v);
                }
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            self.wait(interval.min(deadline - now)).await?;
        }
        for (source, values) in sources.iter().zip(&series) {
            if values.is_empty() {
                return Err(EolError::Unreachable(format!(
                    "no valid samples from {source} within {window_ms} ms"
                )));
            }
        }
        Ok(series)
    }
}

// =============================================================================
// Test Runner
// =============================================================================

/// Runs one [`TestSpec`] at a time against injected transports.
pub struct TestRunner {
    signals: Arc<dyn SignalTransport>,
    scope: Option<Arc<dyn InstrumentTransport>>,
    timing: RunnerTiming,
}

impl TestRunner {
    /// Runner without an oscilloscope.
    pub fn new(signals: Arc<dyn SignalTransport>) -> Self {
        Self {
            signals,
            scope: None,
            timing: RunnerTiming::default(),
        }
    }

    /// Attach an oscilloscope.
    pub fn with_scope(mut self, scope: Arc<dyn InstrumentTransport>) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Override the fixed waits.
    pub fn with_timing(mut self, timing: RunnerTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Timing in effect.
    pub fn timing(&self) -> &RunnerTiming {
        &self.timing
    }

    /// Signal transport in use.
    pub fn signals(&self) -> &Arc<dyn SignalTransport> {
        &self.signals
    }

    /// Apply an oscilloscope configuration, returning every rejected setting.
    pub async fn prepare(&self, config: &ScopeConfig) -> Result<(), Vec<EolError>> {
        match &self.scope {
            Some(scope) => scope.apply_configuration(config).await,
            None => Err(vec![EolError::Unreachable(
                "no oscilloscope configured".into(),
            )]),
        }
    }

    /// Current DUT mode as reported on `mode_signal`.
    pub fn read_mode(&self, mode_signal: &SignalRef) -> EolResult<f64> {
        self.signals
            .latest_value(mode_signal.message_id, &mode_signal.signal)
            .map(|s| s.value)
            .ok_or_else(|| {
                EolError::Unreachable(format!("no DUT mode received on {mode_signal}"))
            })
    }

    /// Check that every signal of `spec` exists and that its instruments are present.
    pub fn check_signals(&self, spec: &TestSpec) -> EolResult<()> {
        for signal in spec.signal_refs() {
            if self
                .signals
                .find_message_and_signal(signal.message_id, &signal.signal)
                .is_none()
            {
                return Err(EolError::UnknownSignal {
                    message_id: signal.message_id,
                    signal: signal.signal,
                });
            }
        }
        if spec.kind().requires_scope() && self.scope.is_none() {
            return Err(EolError::Unreachable(format!(
                "{} requires an oscilloscope",
                spec.kind()
            )));
        }
        Ok(())
    }

    /// Run one test to completion.
    pub async fn run(&self, spec: &TestSpec) -> ExecutionResult {
        self.run_with_cancel(spec, &CancelToken::never()).await
    }

    /// Run one test, aborting its waits when `cancel` fires.
    ///
    /// Never returns an error: every failure is carried inside the result.
    pub async fn run_with_cancel(&self, spec: &TestSpec, cancel: &CancelToken) -> ExecutionResult {
        let mut result = ExecutionResult::start(&spec.name, spec.kind());
        let started = Instant::now();
        let mut ctx = ProcedureContext::new(
            self.signals.as_ref(),
            self.scope.as_deref(),
            &self.timing,
            cancel,
        );

        let span = info_span!("test", test = %spec.name, kind = %spec.kind());
        let outcome = self.execute(&mut ctx, spec).instrument(span).await;
        let exec_time_s = started.elapsed().as_secs_f64();

        match &outcome {
            Ok(Verdict::Pass) => info!(test = %spec.name, exec_time_s, "Pass"),
            Ok(Verdict::Fail(reason)) => info!(test = %spec.name, exec_time_s, %reason, "Fail"),
            Err(e) => warn!(test = %spec.name, exec_time_s, error = %e, "Error"),
        }
        result.finalize(outcome, ctx.data, exec_time_s);
        result
    }

    async fn execute(
        &self,
        ctx: &mut ProcedureContext<'_>,
        spec: &TestSpec,
    ) -> EolResult<Verdict> {
        spec.validate()?;
        self.check_signals(spec)?;
        safety::catch_panic(&spec.name, dispatch(ctx, spec)).await
    }
}

async fn dispatch(ctx: &mut ProcedureContext<'_>, spec: &TestSpec) -> EolResult<Verdict> {
    match &spec.actuation {
        Actuation::DigitalLogic(p) => digital::run(ctx, spec.feedback()?, p).await,
        Actuation::AnalogSweep(p) => analog::run_sweep(ctx, spec.feedback()?, p).await,
        Actuation::PhaseCurrentCalibration(p) => phase_current::run(ctx, p).await,
        Actuation::AnalogStatic(p) => analog::run_static(ctx, spec.feedback()?, p).await,
        Actuation::PwmSensor(p) => pwm::run(ctx, p).await,
        Actuation::TemperatureValidation(p) => temperature::run(ctx, spec.feedback()?, p).await,
        Actuation::FanControl(p) => fan::run(ctx, p).await,
        Actuation::External5V(p) => analog::run_external_5v(ctx, spec.feedback()?, p).await,
        Actuation::DcBusSensing(p) => dc_bus::run(ctx, spec.feedback()?, p).await,
        Actuation::OutputCurrentCalibration(p) => {
            output_current::run(ctx, spec.feedback()?, p).await
        }
        Actuation::ChargedHvBus(p) => regulation::run(ctx, p, None).await,
        Actuation::ChargerFunctional(p) => {
            regulation::run(
                ctx,
                &p.regulation,
                Some((&p.output_current, p.current_tolerance)),
            )
            .await
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::procedures::spec::{DigitalLogicParams, TemperatureParams};

    fn temperature_spec() -> TestSpec {
        TestSpec::new(
            "Board temperature",
            1,
            Some(SignalRef::new(0x21, "BoardTemp")),
            Actuation::TemperatureValidation(TemperatureParams {
                dwell_ms: 10,
                reference_c: 25.0,
                tolerance_c: 2.0,
            }),
        )
    }

    #[tokio::test]
    async fn invalid_spec_is_an_error_result() {
        let mut spec = temperature_spec();
        spec.test_mode = 9;
        let (runner, _dut) = runner_for(&spec, |d| d);
        let result = runner.run(&spec).await;
        assert_eq!(result.status, TestStatus::Error);
        assert_eq!(
            result.error_category,
            Some(crate::error::ErrorCategory::InvalidInput)
        );
    }

    #[tokio::test]
    async fn unknown_signal_is_an_error_result() {
        let spec = temperature_spec();
        let dut = Arc::new(
            crate::transport::SimulatedDut::from_signals([SignalRef::new(0x21, "Other")])
                .unwrap(),
        );
        let runner = TestRunner::new(dut).with_timing(fast_timing());
        let result = runner.run(&spec).await;
        assert_eq!(result.status, TestStatus::Error);
        assert!(result.notes.contains("BoardTemp"));
    }

    #[tokio::test]
    async fn scope_kinds_need_a_scope() {
        let spec = TestSpec::new(
            "Bus",
            1,
            Some(SignalRef::new(0x21, "BusV")),
            Actuation::DcBusSensing(spec::DcBusParams {
                scope_channel: 1,
                dwell_ms: 5,
                tolerance_v: 1.0,
            }),
        );
        let (runner, _dut) = runner_for(&spec, |d| d);
        let result = runner.run(&spec).await;
        assert_eq!(result.status, TestStatus::Error);
        assert!(result.notes.contains("oscilloscope"));
    }

    #[tokio::test]
    async fn cancelled_run_is_an_error() {
        let spec = TestSpec::new(
            "Relay",
            1,
            Some(SignalRef::new(0x20, "RelayFb")),
            Actuation::DigitalLogic(DigitalLogicParams {
                command: SignalRef::new(0x10, "Relay"),
                low: 0.0,
                high: 1.0,
                dwell_ms: 10_000,
                threshold: None,
            }),
        );
        let (runner, dut) = runner_for(&spec, |d| d);
        let (handle, token) = cancel_pair();
        handle.cancel();

        let result = runner.run_with_cancel(&spec, &token).await;
        assert_eq!(result.status, TestStatus::Error);
        assert_eq!(
            result.error_category,
            Some(crate::error::ErrorCategory::Cancelled)
        );
        assert!(result.exec_time_s < 1.0);
        // Cancelled before the first write.
        assert!(dut.write_log().is_empty());
    }

    #[tokio::test]
    async fn sample_requires_data_from_every_source() {
        let spec = temperature_spec();
        let (runner, dut) = runner_for(&spec, |d| d);
        dut.pin(SignalRef::new(0x21, "BoardTemp"), 24.0);

        let cancel = CancelToken::never();
        let ctx = ProcedureContext::new(runner.signals.as_ref(), None, &runner.timing, &cancel);
        let present = SignalRef::new(0x21, "BoardTemp");
        let absent = SignalRef::new(0x21, "Missing");

        let series = ctx.sample(&[Source::Signal(&present)], 6).await.unwrap();
        assert!(!series[0].is_empty());
        assert!(series[0].iter().all(|v| *v == 24.0));

        let err = ctx
            .sample(&[Source::Signal(&present), Source::Signal(&absent)], 4)
            .await
            .unwrap_err();
        assert!(matches!(err, EolError::Unreachable(_)));
    }

    #[tokio::test]
    async fn readings_older_than_the_last_command_are_ignored() {
        use crate::transport::{CanBus, ChannelAdapter, MessageDatabase};
        use tokio::time::sleep;

        let db = MessageDatabase::from_toml_str(
            r#"
            [[messages]]
            id = 0x20
            name = "DUT_Feedback"
            [[messages.signals]]
            name = "RelayFb"
            start_bit = 0
            length = 1
            "#,
        )
        .unwrap();
        let (adapter, peer) = ChannelAdapter::pair();
        let bus = CanBus::start(Arc::new(adapter), db.clone(), 16);
        let feedback = SignalRef::new(0x20, "RelayFb");
        let frame = db.encode(0x20, [("RelayFb", 1.0)]).unwrap();

        peer.inject(frame.clone()).unwrap();
        for _ in 0..200 {
            if bus.latest_value(0x20, "RelayFb").is_some() {
                break;
            }
            sleep(Duration::from_millis(2)).await;
        }
        assert!(bus.latest_value(0x20, "RelayFb").is_some());
        sleep(Duration::from_millis(2)).await;

        let timing = fast_timing();
        let cancel = CancelToken::never();
        let ctx = ProcedureContext::new(&bus, None, &timing, &cancel);
        assert_eq!(ctx.try_read(&feedback), None);
        assert!(matches!(ctx.read(&feedback), Err(EolError::Timeout(_))));

        peer.inject(frame).unwrap();
        let mut fresh = None;
        for _ in 0..200 {
            fresh = ctx.try_read(&feedback);
            if fresh.is_some() {
                break;
            }
            sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(fresh, Some(1.0));

        sleep(Duration::from_millis(2)).await;
        ctx.mark_command();
        assert_eq!(ctx.try_read(&feedback), None);
    }
}
