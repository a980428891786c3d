//! Test specifications and test plans.
//!
//! A [`TestSpec`] names one test, the DUT mode it requires, an optional feedback signal and a
//! strongly typed [`Actuation`] describing what the procedure commands and how it judges the
//! result. Plans are TOML documents with one `[[tests]]` table per spec:
//!
//! ```toml
//! [[tests]]
//! name = "Relay K1"
//! test_mode = 1
//! feedback_signal = { message_id = 0x20, signal = "RelayFb" }
//!
//! [tests.actuation]
//! kind = "digital_logic"
//! command = { message_id = 0x10, signal = "Relay" }
//! low = 0.0
//! high = 1.0
//! dwell_ms = 100
//! ```

use crate::error::{EolError, EolResult};
use crate::transport::{SignalRef, MAX_SCOPE_CHANNEL};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;

/// Highest DUT test mode.
pub const MAX_TEST_MODE: u8 = 3;

/// Upper bound on points in one sweep.
pub const MAX_SWEEP_POINTS: usize = 10_000;

// =============================================================================
// Test Kind
// =============================================================================

/// The twelve procedure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestKind {
    /// Relay/digital output check
    DigitalLogic,
    /// DAC sweep with linear fit
    AnalogSweep,
    /// Iq sweep comparing scope and CAN phase currents
    PhaseCurrentCalibration,
    /// Averaged feedback vs EOL measurement
    AnalogStatic,
    /// PWM frequency and duty check
    PwmSensor,
    /// Averaged temperature vs reference
    TemperatureValidation,
    /// Fan enable, tach and fault check
    FanControl,
    /// External 5V rail vs EOL measurement
    #[serde(rename = "external_5v")]
    External5V,
    /// Scope bus voltage vs CAN feedback
    DcBusSensing,
    /// Two-sweep current-sense trim calibration
    OutputCurrentCalibration,
    /// HV bus regulation check
    ChargedHvBus,
    /// Charger regulation check with output current
    ChargerFunctional,
}

impl TestKind {
    /// Operator-facing name.
    pub fn display_name(&self) -> &'static str {
        match self {
            TestKind::DigitalLogic => "Digital Logic Test",
            TestKind::AnalogSweep => "Analog Sweep Test",
            TestKind::PhaseCurrentCalibration => "Phase Current Calibration",
            TestKind::AnalogStatic => "Analog Static Test",
            TestKind::PwmSensor => "PWM Sensor Test",
            TestKind::TemperatureValidation => "Temperature Validation Test",
            TestKind::FanControl => "Fan Control Test",
            TestKind::External5V => "External 5V Test",
            TestKind::DcBusSensing => "DC Bus Sensing",
            TestKind::OutputCurrentCalibration => "Output Current Calibration",
            TestKind::ChargedHvBus => "Charged HV Bus Test",
            TestKind::ChargerFunctional => "Charger Functional Test",
        }
    }

    /// Whether specs of this kind must name a feedback signal.
    pub fn requires_feedback(&self) -> bool {
        matches!(
            self,
            TestKind::DigitalLogic
                | TestKind::AnalogSweep
                | TestKind::AnalogStatic
                | TestKind::TemperatureValidation
                | TestKind::External5V
                | TestKind::DcBusSensing
                | TestKind::OutputCurrentCalibration
        )
    }

    /// Whether specs of this kind need an oscilloscope.
    pub fn requires_scope(&self) -> bool {
        matches!(
            self,
            TestKind::PhaseCurrentCalibration
                | TestKind::DcBusSensing
                | TestKind::OutputCurrentCalibration
        )
    }
}

impl fmt::Display for TestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

// =============================================================================
// Actuation Parameters
// =============================================================================

/// Multiplexer selection written before sampling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MuxSelect {
    /// Mux control signal
    pub signal: SignalRef,
    /// Channel value to write
    pub channel: u32,
}

/// Digital Logic parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigitalLogicParams {
    /// Output to drive
    pub command: SignalRef,
    /// Idle value, restored afterwards
    pub low: f64,
    /// Asserted value
    pub high: f64,
    /// Wait after asserting
    pub dwell_ms: u64,
    /// Accepted deviation of the feedback from `high`; exact match if absent
    #[serde(default)]
    pub threshold: Option<f64>,
}

/// Analog Sweep parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalogSweepParams {
    /// DAC command signal
    pub command: SignalRef,
    /// First DAC value
    pub min: f64,
    /// Last DAC value (inclusive)
    pub max: f64,
    /// DAC increment
    pub step: f64,
    /// Wait after each write, before the fixed settle time
    pub dwell_ms: u64,
    /// Expected fitted slope
    #[serde(default)]
    pub expected_gain: Option<f64>,
    /// Accepted gain error in percent
    #[serde(default)]
    pub gain_tolerance_percent: Option<f64>,
    /// Optional mux selection
    #[serde(default)]
    pub mux: Option<MuxSelect>,
}

/// Phase Current Calibration parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseCurrentParams {
    /// Iq reference command
    pub iq_command: SignalRef,
    /// First Iq value
    pub min: f64,
    /// Last Iq value (inclusive)
    pub max: f64,
    /// Iq increment
    pub step: f64,
    /// Wait after each Iq command
    pub ipc_test_duration_ms: u64,
    /// Scope channel probing phase V
    pub phase_v_channel: u8,
    /// Scope channel probing phase W
    pub phase_w_channel: u8,
    /// CAN-reported phase V current
    pub can_phase_v: SignalRef,
    /// CAN-reported phase W current
    pub can_phase_w: SignalRef,
    /// Accepted average gain error per phase in percent; report only if absent
    #[serde(default)]
    pub tolerance_percent: Option<f64>,
}

/// Analog Static parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalogStaticParams {
    /// Independent EOL measurement
    pub eol_signal: SignalRef,
    /// Wait before sampling starts
    pub pre_dwell_ms: u64,
    /// Sampling window
    pub dwell_ms: u64,
    /// Accepted |feedback − EOL| in millivolts
    pub tolerance_mv: f64,
    /// Optional mux selection
    #[serde(default)]
    pub mux: Option<MuxSelect>,
}

/// PWM Sensor parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PwmSensorParams {
    /// Measured frequency signal
    pub frequency: SignalRef,
    /// Measured duty signal
    pub duty: SignalRef,
    /// Sampling window
    pub acquisition_time_ms: u64,
    /// Reference frequency
    pub reference_frequency_hz: f64,
    /// Accepted frequency deviation
    pub frequency_tolerance_hz: f64,
    /// Reference duty
    pub reference_duty_percent: f64,
    /// Accepted duty deviation
    pub duty_tolerance_percent: f64,
}

/// Temperature Validation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureParams {
    /// Sampling window
    pub dwell_ms: u64,
    /// Reference temperature
    pub reference_c: f64,
    /// Accepted deviation
    pub tolerance_c: f64,
}

fn default_enable_value() -> f64 {
    1.0
}

fn default_expected_gain() -> f64 {
    1.0
}

/// Fan Control parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanControlParams {
    /// Fan enable command
    pub enable: SignalRef,
    /// Value that asserts the enable
    #[serde(default = "default_enable_value")]
    pub enable_value: f64,
    /// Tachometer feedback
    pub tach: SignalRef,
    /// Fault flag feedback
    pub fault: SignalRef,
    /// Optional enabled status feedback
    #[serde(default)]
    pub enabled_status: Option<SignalRef>,
    /// Upper bound on the wait for a settled reading
    pub test_timeout_ms: u64,
}

/// External 5V parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct External5VParams {
    /// Optional rail enable command
    #[serde(default)]
    pub enable: Option<SignalRef>,
    /// EOL-side rail measurement
    pub eol_signal: SignalRef,
    /// Wait before sampling starts
    pub pre_dwell_ms: u64,
    /// Sampling window
    pub dwell_ms: u64,
    /// Accepted |feedback − EOL| in millivolts
    pub tolerance_mv: f64,
}

/// DC Bus Sensing parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DcBusParams {
    /// Scope channel probing the bus
    pub scope_channel: u8,
    /// Sampling window
    pub dwell_ms: u64,
    /// Accepted |scope − CAN| in volts
    pub tolerance_v: f64,
}

/// Output Current Calibration parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputCurrentParams {
    /// Current-sense trim command
    pub trim: SignalRef,
    /// Output current setpoint command
    pub setpoint: SignalRef,
    /// Scope channel probing the output current
    pub scope_channel: u8,
    /// First setpoint
    pub min: f64,
    /// Last setpoint (inclusive)
    pub max: f64,
    /// Setpoint increment
    pub step: f64,
    /// Wait after each setpoint, before the fixed settle time
    pub dwell_ms: u64,
    /// Trim applied for the first sweep
    pub initial_trim: f64,
    /// Expected slope of CAN vs scope current
    #[serde(default = "default_expected_gain")]
    pub expected_gain: f64,
    /// Accepted gain error of the second sweep in percent
    pub tolerance_percent: f64,
}

/// Regulation check shared by Charged HV Bus and Charger Functional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegulationParams {
    /// Start command
    pub trigger: SignalRef,
    /// Trim command
    pub trim: SignalRef,
    /// Setpoint command
    pub setpoint: SignalRef,
    /// Trim to apply
    pub trim_value: f64,
    /// Setpoint to apply
    pub setpoint_value: f64,
    /// Observation window
    pub test_time_ms: u64,
    /// DUT state machine signal
    pub dut_state: SignalRef,
    /// State that indicates regulation
    pub expected_state: f64,
    /// PFC power good flag
    pub pfc_power_good: SignalRef,
    /// PCMC success flag
    pub pcmc: SignalRef,
    /// Fault flag
    pub fault: SignalRef,
}

/// Charger Functional parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargerFunctionalParams {
    /// Regulation sequence
    pub regulation: RegulationParams,
    /// Measured output current
    pub output_current: SignalRef,
    /// Accepted |current − setpoint|
    pub current_tolerance: f64,
}

/// Variant-specific parameters, one per [`TestKind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum Actuation {
    DigitalLogic(DigitalLogicParams),
    AnalogSweep(AnalogSweepParams),
    PhaseCurrentCalibration(PhaseCurrentParams),
    AnalogStatic(AnalogStaticParams),
    PwmSensor(PwmSensorParams),
    TemperatureValidation(TemperatureParams),
    FanControl(FanControlParams),
    #[serde(rename = "external_5v")]
    External5V(External5VParams),
    DcBusSensing(DcBusParams),
    OutputCurrentCalibration(OutputCurrentParams),
    ChargedHvBus(RegulationParams),
    ChargerFunctional(ChargerFunctionalParams),
}

impl Actuation {
    /// Kind tag of this actuation.
    pub fn kind(&self) -> TestKind {
        match self {
            Actuation::DigitalLogic(_) => TestKind::DigitalLogic,
            Actuation::AnalogSweep(_) => TestKind::AnalogSweep,
            Actuation::PhaseCurrentCalibration(_) => TestKind::PhaseCurrentCalibration,
            Actuation::AnalogStatic(_) => TestKind::AnalogStatic,
            Actuation::PwmSensor(_) => TestKind::PwmSensor,
            Actuation::TemperatureValidation(_) => TestKind::TemperatureValidation,
            Actuation::FanControl(_) => TestKind::FanControl,
            Actuation::External5V(_) => TestKind::External5V,
            Actuation::DcBusSensing(_) => TestKind::DcBusSensing,
            Actuation::OutputCurrentCalibration(_) => TestKind::OutputCurrentCalibration,
            Actuation::ChargedHvBus(_) => TestKind::ChargedHvBus,
            Actuation::ChargerFunctional(_) => TestKind::ChargerFunctional,
        }
    }
}

// =============================================================================
// Test Spec
// =============================================================================

/// One test of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSpec {
    /// Unique name within the plan
    pub name: String,
    /// DUT mode required before the procedure may run
    pub test_mode: u8,
    /// Feedback signal read back from the DUT
    #[serde(default)]
    pub feedback_signal: Option<SignalRef>,
    /// What to command and how to judge it
    pub actuation: Actuation,
}

impl TestSpec {
    /// Build a spec.
    pub fn new(
        name: impl Into<String>,
        test_mode: u8,
        feedback_signal: Option<SignalRef>,
        actuation: Actuation,
    ) -> Self {
        Self {
            name: name.into(),
            test_mode,
            feedback_signal,
            actuation,
        }
    }

    /// Procedure kind.
    pub fn kind(&self) -> TestKind {
        self.actuation.kind()
    }

    /// Feedback signal, or `InvalidInput` if the spec has none.
    pub fn feedback(&self) -> EolResult<&SignalRef> {
        self.feedback_signal.as_ref().ok_or_else(|| {
            EolError::InvalidInput(format!("test '{}' has no feedback signal", self.name))
        })
    }

    /// Check structure and numeric ranges.
    pub fn validate(&self) -> EolResult<()> {
        let invalid =
            |msg: String| Err(EolError::InvalidInput(format!("test '{}': {msg}", self.name)));

        if self.name.trim().is_empty() {
            return Err(EolError::InvalidInput("test name is empty".into()));
        }
        if self.test_mode > MAX_TEST_MODE {
            return invalid(format!(
                "test mode {} outside 0..={MAX_TEST_MODE}",
                self.test_mode
            ));
        }
        if self.kind().requires_feedback() && self.feedback_signal.is_none() {
            return invalid(format!("{} requires a feedback signal", self.kind()));
        }

        match &self.actuation {
            Actuation::DigitalLogic(p) => {
                check_finite("low", p.low)?;
                check_finite("high", p.high)?;
                if let Some(t) = p.threshold {
                    check_tolerance("threshold", t)?;
                }
            }
            Actuation::AnalogSweep(p) => {
                sweep_points(p.min, p.max, p.step)?;
                match (p.expected_gain, p.gain_tolerance_percent) {
                    (Some(g), Some(t)) => {
                        check_gain("expected_gain", g)?;
                        check_tolerance("gain_tolerance_percent", t)?;
                    }
                    (None, None) => {}
                    _ => {
                        return invalid(
                            "expected_gain and gain_tolerance_percent must be given together"
                                .into(),
                        )
                    }
                }
            }
            Actuation::PhaseCurrentCalibration(p) => {
                sweep_points(p.min, p.max, p.step)?;
                check_channel(p.phase_v_channel)?;
                check_channel(p.phase_w_channel)?;
                if let Some(t) = p.tolerance_percent {
                    check_tolerance("tolerance_percent", t)?;
                }
            }
            Actuation::AnalogStatic(p) => check_tolerance("tolerance_mv", p.tolerance_mv)?,
            Actuation::PwmSensor(p) => {
                check_positive_ms("acquisition_time_ms", p.acquisition_time_ms)?;
                check_finite("reference_frequency_hz", p.reference_frequency_hz)?;
                check_finite("reference_duty_percent", p.reference_duty_percent)?;
                check_tolerance("frequency_tolerance_hz", p.frequency_tolerance_hz)?;
                check_tolerance("duty_tolerance_percent", p.duty_tolerance_percent)?;
            }
            Actuation::TemperatureValidation(p) => {
                check_finite("reference_c", p.reference_c)?;
                check_tolerance("tolerance_c", p.tolerance_c)?;
            }
            Actuation::FanControl(p) => {
                check_positive_ms("test_timeout_ms", p.test_timeout_ms)?;
                check_finite("enable_value", p.enable_value)?;
            }
            Actuation::External5V(p) => check_tolerance("tolerance_mv", p.tolerance_mv)?,
            Actuation::DcBusSensing(p) => {
                check_channel(p.scope_channel)?;
                check_tolerance("tolerance_v", p.tolerance_v)?;
            }
            Actuation::OutputCurrentCalibration(p) => {
                sweep_points(p.min, p.max, p.step)?;
                check_channel(p.scope_channel)?;
                check_finite("initial_trim", p.initial_trim)?;
                check_gain("expected_gain", p.expected_gain)?;
                check_tolerance("tolerance_percent", p.tolerance_percent)?;
            }
            Actuation::ChargedHvBus(p) => check_regulation(p)?,
            Actuation::ChargerFunctional(p) => {
                check_regulation(&p.regulation)?;
                check_tolerance("current_tolerance", p.current_tolerance)?;
            }
        }
        Ok(())
    }

    /// Every signal the spec reads or writes, feedback included.
    pub fn signal_refs(&self) -> Vec<SignalRef> {
        let mut refs: Vec<SignalRef> = self.feedback_signal.iter().cloned().collect();
        let mux = |m: &Option<MuxSelect>| m.iter().map(|m| m.signal.clone()).collect::<Vec<_>>();
        match &self.actuation {
            Actuation::DigitalLogic(p) => refs.push(p.command.clone()),
            Actuation::AnalogSweep(p) => {
                refs.push(p.command.clone());
                refs.extend(mux(&p.mux));
            }
            Actuation::PhaseCurrentCalibration(p) => refs.extend([
                p.iq_command.clone(),
                p.can_phase_v.clone(),
                p.can_phase_w.clone(),
            ]),
            Actuation::AnalogStatic(p) => {
                refs.push(p.eol_signal.clone());
                refs.extend(mux(&p.mux));
            }
            Actuation::PwmSensor(p) => refs.extend([p.frequency.clone(), p.duty.clone()]),
            Actuation::TemperatureValidation(_) | Actuation::DcBusSensing(_) => {}
            Actuation::FanControl(p) => {
                refs.extend([p.enable.clone(), p.tach.clone(), p.fault.clone()]);
                refs.extend(p.enabled_status.iter().cloned());
            }
            Actuation::External5V(p) => {
                refs.push(p.eol_signal.clone());
                refs.extend(p.enable.iter().cloned());
            }
            Actuation::OutputCurrentCalibration(p) => {
                refs.extend([p.trim.clone(), p.setpoint.clone()]);
            }
            Actuation::ChargedHvBus(p) => refs.extend(regulation_refs(p)),
            Actuation::ChargerFunctional(p) => {
                refs.extend(regulation_refs(&p.regulation));
                refs.push(p.output_current.clone());
            }
        }
        refs
    }
}

fn regulation_refs(p: &RegulationParams) -> [SignalRef; 7] {
    [
        p.trigger.clone(),
        p.trim.clone(),
        p.setpoint.clone(),
        p.dut_state.clone(),
        p.pfc_power_good.clone(),
        p.pcmc.clone(),
        p.fault.clone(),
    ]
}

fn check_finite(field: &str, value: f64) -> EolResult<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(EolError::InvalidInput(format!("{field} must be finite")))
    }
}

fn check_gain(field: &str, value: f64) -> EolResult<()> {
    if value.is_finite() && value.abs() >= crate::calibration::EPSILON {
        Ok(())
    } else {
        Err(EolError::InvalidInput(format!(
            "{field} must be finite and non-zero"
        )))
    }
}

fn check_tolerance(field: &str, value: f64) -> EolResult<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(EolError::InvalidInput(format!(
            "{field} must be a non-negative number, got {value}"
        )))
    }
}

fn check_positive_ms(field: &str, value: u64) -> EolResult<()> {
    if value > 0 {
        Ok(())
    } else {
        Err(EolError::InvalidInput(format!("{field} must be positive")))
    }
}

fn check_channel(channel: u8) -> EolResult<()> {
    if (1..=MAX_SCOPE_CHANNEL).contains(&channel) {
        Ok(())
    } else {
        Err(EolError::InvalidInput(format!(
            "scope channel {channel} outside 1..={MAX_SCOPE_CHANNEL}"
        )))
    }
}

fn check_regulation(p: &RegulationParams) -> EolResult<()> {
    check_positive_ms("test_time_ms", p.test_time_ms)?;
    check_finite("trim_value", p.trim_value)?;
    check_finite("setpoint_value", p.setpoint_value)?;
    check_finite("expected_state", p.expected_state)
}

/// Points of an inclusive sweep `min, min + step, ..., <= max`.
///
/// `min == max` yields the single point `min`.
pub fn sweep_points(min: f64, max: f64, step: f64) -> EolResult<Vec<f64>> {
    if !(min.is_finite() && max.is_finite() && step.is_finite()) {
        return Err(EolError::InvalidInput("sweep bounds must be finite".into()));
    }
    if max < min {
        return Err(EolError::InvalidInput(format!(
            "sweep max {max} below min {min}"
        )));
    }
    if step <= 0.0 {
        return Err(EolError::InvalidInput(format!(
            "sweep step {step} must be positive"
        )));
    }
    // Tolerate accumulated rounding on the last point.
    let span = (max - min) / step + 1e-9;
    if span >= MAX_SWEEP_POINTS as f64 {
        return Err(EolError::InvalidInput(format!(
            "sweep has more than {MAX_SWEEP_POINTS} points"
        )));
    }
    let count = span.floor() as usize + 1;
    Ok((0..count).map(|i| min + i as f64 * step).collect())
}

// =============================================================================
// Test Plan
// =============================================================================

/// An ordered list of tests, loaded from TOML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestPlan {
    /// Tests in execution order
    #[serde(default)]
    pub tests: Vec<TestSpec>,
}

impl TestPlan {
    /// Parse and validate a plan.
    pub fn from_toml_str(text: &str) -> EolResult<Self> {
        let plan: TestPlan = toml::from_str(text)?;
        validate_plan(&plan.tests)?;
        Ok(plan)
    }

    /// Load and validate a plan file.
    pub fn load<P: AsRef<Path>>(path: P) -> EolResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Every distinct signal the plan touches, in first-use order.
    pub fn signal_refs(&self) -> Vec<SignalRef> {
        let mut seen = HashSet::new();
        self.tests
            .iter()
            .flat_map(TestSpec::signal_refs)
            .filter(|r| seen.insert(r.clone()))
            .collect()
    }
}

/// Validate every spec and reject empty plans and duplicate names.
pub fn validate_plan(tests: &[TestSpec]) -> EolResult<()> {
    if tests.is_empty() {
        return Err(EolError::InvalidInput("test plan is empty".into()));
    }
    let mut names = HashSet::new();
    for spec in tests {
        spec.validate()?;
        if !names.insert(spec.name.as_str()) {
            return Err(EolError::InvalidInput(format!(
                "duplicate test name '{}'",
                spec.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay() -> TestSpec {
        TestSpec::new(
            "Relay",
            1,
            Some(SignalRef::new(0x20, "RelayFb")),
            Actuation::DigitalLogic(DigitalLogicParams {
                command: SignalRef::new(0x10, "Relay"),
                low: 0.0,
                high: 1.0,
                dwell_ms: 100,
                threshold: None,
            }),
        )
    }

    #[test]
    fn sweep_is_inclusive() {
        assert_eq!(
            sweep_points(0.0, 1000.0, 250.0).unwrap(),
            vec![0.0, 250.0, 500.0, 750.0, 1000.0]
        );
        assert_eq!(sweep_points(0.0, 0.3, 0.1).unwrap().len(), 4);
        assert_eq!(sweep_points(500.0, 500.0, 10.0).unwrap(), vec![500.0]);
        assert_eq!(sweep_points(0.0, 10.0, 4.0).unwrap(), vec![0.0, 4.0, 8.0]);
    }

    #[test]
    fn sweep_rejects_bad_ranges() {
        assert!(sweep_points(0.0, 10.0, 0.0).is_err());
        assert!(sweep_points(0.0, 10.0, -1.0).is_err());
        assert!(sweep_points(10.0, 0.0, 1.0).is_err());
        assert!(sweep_points(0.0, 1e9, 1.0).is_err());
    }

    #[test]
    fn validates_mode_and_feedback() {
        assert!(relay().validate().is_ok());

        let mut spec = relay();
        spec.test_mode = 4;
        assert!(matches!(spec.validate(), Err(EolError::InvalidInput(_))));

        let mut spec = relay();
        spec.feedback_signal = None;
        assert!(spec.validate().is_err());
    }

    #[test]
    fn gain_check_needs_both_fields() {
        let mut spec = TestSpec::new(
            "DAC",
            2,
            Some(SignalRef::new(0x20, "DacFb")),
            Actuation::AnalogSweep(AnalogSweepParams {
                command: SignalRef::new(0x10, "DacCmd"),
                min: 0.0,
                max: 1000.0,
                step: 250.0,
                dwell_ms: 10,
                expected_gain: Some(1.0),
                gain_tolerance_percent: None,
                mux: None,
            }),
        );
        assert!(spec.validate().is_err());
        if let Actuation::AnalogSweep(p) = &mut spec.actuation {
            p.gain_tolerance_percent = Some(5.0);
        }
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn duplicate_names_rejected() {
        assert!(validate_plan(&[relay(), relay()]).is_err());
        assert!(validate_plan(&[]).is_err());
        assert!(validate_plan(&[relay()]).is_ok());
    }

    #[test]
    fn parses_toml_plan() {
        let plan = TestPlan::from_toml_str(
            r#"
            [[tests]]
            name = "Relay K1"
            test_mode = 1
            feedback_signal = { message_id = 0x20, signal = "RelayFb" }

            [tests.actuation]
            kind = "digital_logic"
            command = { message_id = 0x10, signal = "Relay" }
            low = 0.0
            high = 1.0
            dwell_ms = 100

            [[tests]]
            name = "Board temperature"
            test_mode = 1
            feedback_signal = { message_id = 0x21, signal = "BoardTemp" }

            [tests.actuation]
            kind = "temperature_validation"
            dwell_ms = 200
            reference_c = 25.0
            tolerance_c = 3.0

            [[tests]]
            name = "5V rail"
            test_mode = 1
            feedback_signal = { message_id = 0x21, signal = "Rail5V" }

            [tests.actuation]
            kind = "external_5v"
            eol_signal = { message_id = 0x30, signal = "Eol5V" }
            pre_dwell_ms = 10
            dwell_ms = 50
            tolerance_mv = 100.0
            "#,
        )
        .unwrap();

        assert_eq!(plan.tests.len(), 3);
        assert_eq!(plan.tests[0].kind(), TestKind::DigitalLogic);
        assert_eq!(plan.tests[1].kind(), TestKind::TemperatureValidation);
        assert_eq!(plan.tests[2].kind(), TestKind::External5V);
        assert_eq!(plan.signal_refs().len(), 5);
    }

    #[test]
    fn display_names() {
        assert_eq!(TestKind::AnalogStatic.to_string(), "Analog Static Test");
        assert!(TestKind::DcBusSensing.requires_scope());
        assert!(!TestKind::FanControl.requires_feedback());
    }
}
