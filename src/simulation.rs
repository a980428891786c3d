//! Nominal simulated station for a test plan.
//!
//! Builds a [`SimulatedDut`] and [`SimulatedScope`] that answer every test of a plan the way a
//! healthy unit would: feedback follows the commanded values with the expected gain, status
//! signals report success and static readings sit on their references. Used by the CLI's
//! `--simulate` mode and by end-to-end tests, which then perturb individual signals with
//! [`SimulatedDut::pin`].

use crate::error::EolResult;
use crate::procedures::spec::RegulationParams;
use crate::procedures::{Actuation, TestPlan};
use crate::transport::{MessageDatabase, SignalRef, SignalValues, SimulatedDut, SimulatedScope};
use std::sync::Arc;
use tracing::debug;

/// Bus voltage reported on DC bus sensing tests.
pub const NOMINAL_BUS_V: f64 = 400.0;

/// Reading reported on static analog and 5 V tests, in millivolts.
pub const NOMINAL_STATIC_MV: f64 = 5000.0;

/// Fan speed while enabled.
pub const NOMINAL_TACH: f64 = 3000.0;

/// Simulated DUT and oscilloscope wired for `plan`.
pub struct SimulatedStation {
    /// The DUT
    pub dut: Arc<SimulatedDut>,
    /// The oscilloscope probing it
    pub scope: Arc<SimulatedScope>,
}

impl SimulatedStation {
    /// Build a nominal station.
    ///
    /// `database` describes the DUT's messages; when `None`, one is synthesized from the
    /// plan's signals and `mode_signal`.
    pub fn nominal(
        plan: &TestPlan,
        database: Option<MessageDatabase>,
        mode_signal: Option<&SignalRef>,
    ) -> EolResult<Self> {
        let mut dut = match database {
            Some(db) => SimulatedDut::new(db),
            None => SimulatedDut::from_signals(
                plan.signal_refs().into_iter().chain(mode_signal.cloned()),
            )?,
        };
        let mut pins: Vec<(SignalRef, f64)> = Vec::new();
        let mut channels: Vec<(u8, Probe)> = Vec::new();

        for spec in &plan.tests {
            let feedback = spec.feedback_signal.clone();
            match &spec.actuation {
                Actuation::DigitalLogic(p) => {
                    if let Some(fb) = feedback {
                        dut = dut.with_rule(fb, follow(&p.command, 1.0));
                    }
                }
                Actuation::AnalogSweep(p) => {
                    if let Some(fb) = feedback {
                        dut = dut.with_rule(fb, follow(&p.command, p.expected_gain.unwrap_or(1.0)));
                    }
                }
                Actuation::PhaseCurrentCalibration(p) => {
                    dut = dut
                        .with_rule(p.can_phase_v.clone(), follow(&p.iq_command, 1.0))
                        .with_rule(p.can_phase_w.clone(), follow(&p.iq_command, 1.0));
                    channels.push((p.phase_v_channel, Probe::Follow(p.iq_command.clone())));
                    channels.push((p.phase_w_channel, Probe::Follow(p.iq_command.clone())));
                }
                Actuation::AnalogStatic(p) => {
                    pins.extend(feedback.map(|fb| (fb, NOMINAL_STATIC_MV)));
                    pins.push((p.eol_signal.clone(), NOMINAL_STATIC_MV));
                }
                Actuation::PwmSensor(p) => {
                    pins.push((p.frequency.clone(), p.reference_frequency_hz));
                    pins.push((p.duty.clone(), p.reference_duty_percent));
                }
                Actuation::TemperatureValidation(p) => {
                    pins.extend(feedback.map(|fb| (fb, p.reference_c)));
                }
                Actuation::FanControl(p) => {
                    let enable = p.enable.clone();
                    dut = dut
                        .with_rule(p.tach.clone(), move |v| {
                            v.get(enable.message_id, &enable.signal)
                                .map(|en| if en != 0.0 { NOMINAL_TACH } else { 0.0 })
                        })
                        .with_rule(p.fault.clone(), |_| Some(0.0));
                    if let Some(status) = &p.enabled_status {
                        dut = dut.with_rule(status.clone(), follow(&p.enable, 1.0));
                    }
                }
                Actuation::External5V(p) => {
                    pins.extend(feedback.map(|fb| (fb, NOMINAL_STATIC_MV)));
                    pins.push((p.eol_signal.clone(), NOMINAL_STATIC_MV));
                }
                Actuation::DcBusSensing(p) => {
                    pins.extend(feedback.map(|fb| (fb, NOMINAL_BUS_V)));
                    channels.push((p.scope_channel, Probe::Constant(NOMINAL_BUS_V)));
                }
                Actuation::OutputCurrentCalibration(p) => {
                    if let Some(fb) = feedback {
                        let (trim, setpoint) = (p.trim.clone(), p.setpoint.clone());
                        let nominal_trim = p.initial_trim;
                        let gain = p.expected_gain;
                        dut = dut.with_rule(fb, move |v| {
                            let set = v.get(setpoint.message_id, &setpoint.signal)?;
                            let trim = v.get(trim.message_id, &trim.signal)?;
                            let scale = if nominal_trim != 0.0 {
                                trim / nominal_trim
                            } else {
                                1.0
                            };
                            Some(set * gain * scale)
                        });
                    }
                    channels.push((p.scope_channel, Probe::Follow(p.setpoint.clone())));
                }
                Actuation::ChargedHvBus(p) => dut = regulating(dut, p),
                Actuation::ChargerFunctional(p) => {
                    dut = regulating(dut, &p.regulation)
                        .with_rule(p.output_current.clone(), follow(&p.regulation.setpoint, 1.0));
                }
            }
        }

        let dut = Arc::new(dut);
        for (signal, value) in pins {
            dut.pin(signal, value);
        }
        let mut scope = SimulatedScope::new(dut.clone());
        for (channel, probe) in channels {
            debug!(channel, ?probe, "Wiring simulated scope channel");
            scope = match probe {
                Probe::Constant(level) => scope.with_channel(channel, move |_| level),
                Probe::Follow(source) => scope.with_channel(channel, move |v| {
                    v.get(source.message_id, &source.signal).unwrap_or(0.0)
                }),
            };
        }
        Ok(Self {
            dut,
            scope: Arc::new(scope),
        })
    }
}

/// What a simulated scope channel measures.
#[derive(Debug)]
enum Probe {
    Constant(f64),
    Follow(SignalRef),
}

/// Rule: `target = gain × source`.
fn follow(
    source: &SignalRef,
    gain: f64,
) -> impl Fn(&SignalValues<'_>) -> Option<f64> + Send + Sync + 'static {
    let source = source.clone();
    move |v| v.get(source.message_id, &source.signal).map(|x| x * gain)
}

/// Status signals report success while the trigger is raised.
fn regulating(dut: SimulatedDut, p: &RegulationParams) -> SimulatedDut {
    let expected = p.expected_state;
    let (t1, t2, t3) = (p.trigger.clone(), p.trigger.clone(), p.trigger.clone());
    dut.with_rule(p.dut_state.clone(), move |v| {
        raised(v, &t1).map(|on| if on { expected } else { 0.0 })
    })
    .with_rule(p.pfc_power_good.clone(), move |v| {
        raised(v, &t2).map(|on| f64::from(u8::from(on)))
    })
    .with_rule(p.pcmc.clone(), move |v| {
        raised(v, &t3).map(|on| f64::from(u8::from(on)))
    })
    .with_rule(p.fault.clone(), |_| Some(0.0))
}

fn raised(v: &SignalValues<'_>, trigger: &SignalRef) -> Option<bool> {
    v.get(trigger.message_id, &trigger.signal).map(|t| t != 0.0)
}
