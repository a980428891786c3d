//! Phase Current Calibration procedure.
//!
//! For each Iq command the oscilloscope phase averages are taken as reference and the
//! CAN-reported currents as measurement. Per point and per phase:
//!
//! - gain error = `(can − scope) / scope × 100`
//! - correction factor = `scope / can`
//!
//! Points where either side is invalid (NaN, missing, or a zero reference) are left out of the
//! averages instead of counting as zero.

use super::spec::{sweep_points, PhaseCurrentParams};
use super::{ProcedureContext, Verdict};
use crate::calibration::{adjustment_factor, finite_mean, gain_error_percent, within_tolerance};
use crate::error::{EolError, EolResult};
use crate::transport::SignalRef;
use tracing::debug;

#[derive(Debug, Default)]
struct Phase {
    scope: Vec<f64>,
    can: Vec<f64>,
    gain_errors: Vec<f64>,
    corrections: Vec<f64>,
}

impl Phase {
    fn record(&mut self, scope: Option<f64>, can: Option<f64>) {
        let scope = scope.unwrap_or(f64::NAN);
        let can = can.unwrap_or(f64::NAN);
        self.scope.push(scope);
        self.can.push(can);
        self.gain_errors
            .push(gain_error_percent(can, scope).unwrap_or(f64::NAN));
        self.corrections
            .push(adjustment_factor(scope, can).unwrap_or(f64::NAN));
    }
}

async fn measure(
    ctx: &ProcedureContext<'_>,
    p: &PhaseCurrentParams,
    points: &[f64],
    v: &mut Phase,
    w: &mut Phase,
) -> EolResult<()> {
    for &iq in points {
        ctx.write(&p.iq_command, iq).await?;
        ctx.dwell(p.ipc_test_duration_ms).await?;
        let scope_v = ctx.scope_mean(p.phase_v_channel).await?;
        let scope_w = ctx.scope_mean(p.phase_w_channel).await?;
        let can_v = ctx.try_read(&p.can_phase_v);
        let can_w = ctx.try_read(&p.can_phase_w);
        debug!(iq, ?scope_v, ?scope_w, ?can_v, ?can_w, "Phase current point");
        v.record(scope_v, can_v);
        w.record(scope_w, can_w);
    }
    Ok(())
}

fn summarize(ctx: &mut ProcedureContext<'_>, label: &str, phase: &Phase) -> EolResult<f64> {
    let valid = phase.gain_errors.iter().filter(|e| e.is_finite()).count();
    ctx.data.stat(format!("valid_points_{label}"), valid);
    let gain_error = finite_mean(&phase.gain_errors).ok_or_else(|| {
        EolError::DegenerateData(format!("no valid phase {} points", label.to_uppercase()))
    })?;
    let correction = finite_mean(&phase.corrections);
    ctx.data
        .stat(format!("gain_error_{label}_percent"), gain_error);
    ctx.data
        .stat_opt(format!("correction_factor_{label}"), correction);
    Ok(gain_error)
}

pub(crate) async fn run(
    ctx: &mut ProcedureContext<'_>,
    p: &PhaseCurrentParams,
) -> EolResult<Verdict> {
    let points = sweep_points(p.min, p.max, p.step)?;
    ctx.scope()?;

    let mut v = Phase::default();
    let mut w = Phase::default();
    let measured = measure(ctx, p, &points, &mut v, &mut w).await;
    ctx.restore(&p.iq_command, 0.0).await;

    let done = v.scope.len();
    let iq = points[..done].to_vec();
    ctx.data.series("phase_v_scope", iq.clone(), v.scope.clone());
    ctx.data.series("phase_v_can", iq.clone(), v.can.clone());
    ctx.data.series("phase_w_scope", iq.clone(), w.scope.clone());
    ctx.data.series("phase_w_can", iq, w.can.clone());
    measured?;

    let error_v = summarize(ctx, "v", &v)?;
    let error_w = summarize(ctx, "w", &w)?;
    ctx.data.note(format!(
        "gain error V {error_v:.3}%, W {error_w:.3}%"
    ));

    let Some(tolerance) = p.tolerance_percent else {
        return Ok(Verdict::Pass);
    };
    let mut failures = Vec::new();
    if !within_tolerance(error_v, tolerance) {
        failures.push(format!("phase V gain error {error_v:.3}%"));
    }
    if !within_tolerance(error_w, tolerance) {
        failures.push(format!("phase W gain error {error_w:.3}%"));
    }
    if failures.is_empty() {
        Ok(Verdict::Pass)
    } else {
        Ok(Verdict::Fail(format!(
            "{} exceeds ±{tolerance}%",
            failures.join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::runner_with_scope;
    use super::super::{Actuation, TestSpec, TestStatus};
    use super::*;

    fn spec(tolerance: Option<f64>) -> TestSpec {
        TestSpec::new(
            "Phase currents",
            3,
            None,
            Actuation::PhaseCurrentCalibration(PhaseCurrentParams {
                iq_command: SignalRef::new(0x11, "IqRef"),
                min: 10.0,
                max: 40.0,
                step: 10.0,
                ipc_test_duration_ms: 1,
                phase_v_channel: 1,
                phase_w_channel: 2,
                can_phase_v: SignalRef::new(0x25, "IphV"),
                can_phase_w: SignalRef::new(0x25, "IphW"),
                tolerance_percent: tolerance,
            }),
        )
    }

    fn dut(d: crate::transport::SimulatedDut) -> crate::transport::SimulatedDut {
        d.with_rule(SignalRef::new(0x25, "IphV"), |v| {
            v.get(0x11, "IqRef").map(|iq| iq * 1.01)
        })
        .with_rule(SignalRef::new(0x25, "IphW"), |v| {
            v.get(0x11, "IqRef").map(|iq| iq * 0.98)
        })
    }

    #[tokio::test]
    async fn reports_gain_error_per_phase() {
        let spec = spec(Some(5.0));
        let (runner, dut) = runner_with_scope(&spec, dut, |s| {
            s.with_channel(1, |v| v.get(0x11, "IqRef").unwrap_or(0.0))
                .with_channel(2, |v| v.get(0x11, "IqRef").unwrap_or(0.0))
        });
        let result = runner.run(&spec).await;
        assert_eq!(result.status, TestStatus::Pass, "{}", result.notes);
        assert!((result.statistic("gain_error_v_percent").unwrap() - 1.0).abs() < 1e-9);
        assert!((result.statistic("gain_error_w_percent").unwrap() + 2.0).abs() < 1e-9);
        assert_eq!(result.statistic("valid_points_v"), Some(4.0));
        assert_eq!(dut.value(0x11, "IqRef"), Some(0.0));
    }

    #[tokio::test]
    async fn invalid_points_are_excluded() {
        let spec = spec(Some(1.5));
        // Phase V scope drops out at 20 A; that point must not drag the average.
        let (runner, _dut) = runner_with_scope(&spec, dut, |s| {
            s.with_channel(1, |v| match v.get(0x11, "IqRef") {
                Some(iq) if iq == 20.0 => f64::NAN,
                Some(iq) => iq,
                None => 0.0,
            })
            .with_channel(2, |v| v.get(0x11, "IqRef").unwrap_or(0.0))
        });
        let result = runner.run(&spec).await;
        assert_eq!(result.statistic("valid_points_v"), Some(3.0));
        assert!((result.statistic("gain_error_v_percent").unwrap() - 1.0).abs() < 1e-9);
        // Phase W is 2% low, outside 1.5%.
        assert_eq!(result.status, TestStatus::Fail);
        assert!(result.notes.contains("phase W"));
        assert!(!result.notes.contains("phase V gain"));
    }
}
