//! Output Current Calibration procedure.
//!
//! Two sweeps of the current setpoint. The first, at the initial trim, measures the gain of the
//! CAN-reported current against the oscilloscope. The trim is then scaled by
//! `expected_gain / measured_gain` and the second sweep verifies the corrected gain. Only the
//! second sweep decides the verdict.

use super::spec::{sweep_points, OutputCurrentParams};
use super::{ProcedureContext, Verdict};
use crate::calibration::{adjustment_factor, fit, gain_error_percent, within_tolerance, CalibrationFit};
use crate::error::{EolError, EolResult};
use crate::transport::SignalRef;
use tracing::{debug, info};

struct Sweep {
    scope: Vec<f64>,
    can: Vec<f64>,
}

async fn measure(
    ctx: &ProcedureContext<'_>,
    feedback: &SignalRef,
    p: &OutputCurrentParams,
    points: &[f64],
    trim: f64,
    sweep: &mut Sweep,
) -> EolResult<()> {
    ctx.write(&p.trim, trim).await?;
    for &setpoint in points {
        ctx.write(&p.setpoint, setpoint).await?;
        ctx.settle(p.dwell_ms).await?;
        let scope = ctx.scope_average(p.scope_channel).await?;
        let can = ctx.read(feedback)?;
        debug!(trim, setpoint, scope, can, "Output current point");
        sweep.scope.push(scope);
        sweep.can.push(can);
    }
    Ok(())
}

/// Sweep at `trim`, record the series and return the fit of CAN current against scope current.
async fn sweep(
    ctx: &mut ProcedureContext<'_>,
    feedback: &SignalRef,
    p: &OutputCurrentParams,
    points: &[f64],
    trim: f64,
    label: &str,
) -> EolResult<CalibrationFit> {
    let mut sweep = Sweep {
        scope: Vec::with_capacity(points.len()),
        can: Vec::with_capacity(points.len()),
    };
    let measured = measure(ctx, feedback, p, points, trim, &mut sweep).await;
    ctx.restore(&p.setpoint, 0.0).await;
    ctx.data
        .series(label, sweep.scope.clone(), sweep.can.clone());
    measured?;

    let line = fit(&sweep.scope, &sweep.can)?;
    ctx.data.fit(label, line);
    Ok(line)
}

pub(crate) async fn run(
    ctx: &mut ProcedureContext<'_>,
    feedback: &SignalRef,
    p: &OutputCurrentParams,
) -> EolResult<Verdict> {
    let points = sweep_points(p.min, p.max, p.step)?;
    ctx.scope()?;
    ctx.data.stat("initial_trim", p.initial_trim);

    let first = sweep(ctx, feedback, p, &points, p.initial_trim, "first_sweep").await?;
    let first_error = gain_error_percent(first.slope, p.expected_gain);
    ctx.data
        .stat_opt("gain_error_first_percent", first_error);

    let adjustment = adjustment_factor(p.expected_gain, first.slope).ok_or_else(|| {
        EolError::DegenerateData(format!(
            "measured gain {:.6} too small to correct",
            first.slope
        ))
    })?;
    let corrected = p.initial_trim * adjustment;
    ctx.data.stat("adjustment_factor", adjustment);
    ctx.data.stat("corrected_trim", corrected);
    info!(
        gain = first.slope,
        adjustment, corrected, "Applying corrected trim"
    );

    let second = sweep(ctx, feedback, p, &points, corrected, "second_sweep").await?;
    let second_error = gain_error_percent(second.slope, p.expected_gain);
    ctx.data
        .stat_opt("gain_error_second_percent", second_error);

    match second_error {
        Some(e) if within_tolerance(e, p.tolerance_percent) => {
            ctx.data
                .note(format!("trim {corrected:.4} leaves {e:.3}% gain error"));
            Ok(Verdict::Pass)
        }
        Some(e) => Ok(Verdict::Fail(format!(
            "gain error {e:.3}% after trim {corrected:.4} exceeds ±{}%",
            p.tolerance_percent
        ))),
        None => Err(EolError::DegenerateData(
            "corrected gain error unavailable".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::runner_with_scope;
    use super::super::{Actuation, TestSpec, TestStatus};
    use super::*;
    use crate::transport::SimulatedDut;

    fn spec(initial_trim: f64) -> TestSpec {
        TestSpec::new(
            "Output current",
            3,
            Some(SignalRef::new(0x26, "IoutMeas")),
            Actuation::OutputCurrentCalibration(OutputCurrentParams {
                trim: SignalRef::new(0x12, "IoutTrim"),
                setpoint: SignalRef::new(0x12, "IoutSet"),
                scope_channel: 4,
                min: 2.0,
                max: 10.0,
                step: 2.0,
                dwell_ms: 1,
                initial_trim,
                expected_gain: 1.0,
                tolerance_percent: 1.0,
            }),
        )
    }

    /// Reported current scales with the trim; a trim of 125 is exact.
    fn charger(d: SimulatedDut) -> SimulatedDut {
        d.with_rule(SignalRef::new(0x26, "IoutMeas"), |v| {
            let set = v.get(0x12, "IoutSet")?;
            let trim = v.get(0x12, "IoutTrim")?;
            Some(set * trim * 0.008)
        })
    }

    fn scope(s: crate::transport::SimulatedScope) -> crate::transport::SimulatedScope {
        s.with_channel(4, |v| v.get(0x12, "IoutSet").unwrap_or(0.0))
    }

    #[tokio::test]
    async fn corrected_trim_passes_second_sweep() {
        let spec = spec(100.0);
        let (runner, dut) = runner_with_scope(&spec, charger, scope);
        let result = runner.run(&spec).await;

        assert_eq!(result.status, TestStatus::Pass, "{}", result.notes);
        assert!((result.statistic("gain_error_first_percent").unwrap() + 20.0).abs() < 1e-6);
        assert!((result.statistic("adjustment_factor").unwrap() - 1.25).abs() < 1e-9);
        assert!((result.statistic("corrected_trim").unwrap() - 125.0).abs() < 1e-6);
        assert!(result.statistic("gain_error_second_percent").unwrap().abs() < 1e-6);
        assert!(result.fits.contains_key("first_sweep"));
        assert!(result.fits.contains_key("second_sweep"));
        assert_eq!(dut.value(0x12, "IoutSet"), Some(0.0));
        assert_eq!(dut.value(0x12, "IoutTrim"), Some(125.0));
    }

    #[tokio::test]
    async fn dead_output_cannot_be_corrected() {
        let spec = spec(0.0);
        let (runner, _dut) = runner_with_scope(&spec, charger, scope);
        let result = runner.run(&spec).await;
        assert_eq!(result.status, TestStatus::Error);
        assert!(result.notes.contains("too small to correct"));
    }
}
