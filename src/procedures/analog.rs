//! Analog Sweep, Analog Static and External 5V procedures.

use super::spec::{
    sweep_points, AnalogStaticParams, AnalogSweepParams, External5VParams, MuxSelect,
};
use super::{ProcedureContext, Source, Verdict};
use crate::calibration::{self, finite_mean, gain_error_percent, within_tolerance};
use crate::error::{EolError, EolResult};
use crate::transport::SignalRef;
use tracing::debug;

async fn select_mux(ctx: &ProcedureContext<'_>, mux: &Option<MuxSelect>) -> EolResult<()> {
    if let Some(mux) = mux {
        ctx.write(&mux.signal, f64::from(mux.channel)).await?;
        ctx.settle(0).await?;
    }
    Ok(())
}

/// Step the DAC from `min` to `max`, fit feedback against command and check the gain.
pub(crate) async fn run_sweep(
    ctx: &mut ProcedureContext<'_>,
    feedback: &SignalRef,
    p: &AnalogSweepParams,
) -> EolResult<Verdict> {
    let points = sweep_points(p.min, p.max, p.step)?;
    select_mux(ctx, &p.mux).await?;

    let mut commanded = Vec::with_capacity(points.len());
    let mut measured = Vec::with_capacity(points.len());
    let swept: EolResult<()> = async {
        for dac in points {
            ctx.write(&p.command, dac).await?;
            ctx.settle(p.dwell_ms).await?;
            let value = ctx.read(feedback)?;
            debug!(dac, value, "Sweep point");
            commanded.push(dac);
            measured.push(value);
        }
        Ok(())
    }
    .await;
    ctx.restore(&p.command, p.min).await;

    ctx.data.series("sweep", commanded.clone(), measured.clone());
    ctx.data.stat("points", commanded.len());
    swept?;

    let fit = calibration::fit(&commanded, &measured)?;
    ctx.data.fit("sweep", fit);
    ctx.data.stat("gain", fit.slope);
    ctx.data.stat("offset", fit.intercept);
    ctx.data.stat("r_squared", fit.r_squared);
    ctx.data.note(format!(
        "gain {:.4}, offset {:.4}, R² {:.5}",
        fit.slope, fit.intercept, fit.r_squared
    ));

    let (Some(expected), Some(tolerance)) = (p.expected_gain, p.gain_tolerance_percent) else {
        return Ok(Verdict::Pass);
    };
    let gain_error = gain_error_percent(fit.slope, expected);
    ctx.data.stat_opt("gain_error_percent", gain_error);
    let gain_error = gain_error.ok_or_else(|| {
        EolError::DegenerateData(format!("gain error unavailable for expected gain {expected}"))
    })?;

    if within_tolerance(gain_error, tolerance) {
        ctx.data.note(format!("gain error {gain_error:.3}%"));
        Ok(Verdict::Pass)
    } else {
        Ok(Verdict::Fail(format!(
            "gain error {gain_error:.3}% exceeds ±{tolerance}%"
        )))
    }
}

/// Average feedback and EOL measurement over a window and compare them.
async fn compare_averages(
    ctx: &mut ProcedureContext<'_>,
    feedback: &SignalRef,
    eol: &SignalRef,
    pre_dwell_ms: u64,
    dwell_ms: u64,
    tolerance_mv: f64,
) -> EolResult<Verdict> {
    ctx.dwell(pre_dwell_ms).await?;
    let series = ctx
        .sample(&[Source::Signal(feedback), Source::Signal(eol)], dwell_ms)
        .await?;
    let feedback_avg = finite_mean(&series[0])
        .ok_or_else(|| EolError::DegenerateData(format!("no valid samples from {feedback}")))?;
    let eol_avg = finite_mean(&series[1])
        .ok_or_else(|| EolError::DegenerateData(format!("no valid samples from {eol}")))?;
    let difference = feedback_avg - eol_avg;

    ctx.data.stat("feedback_avg_mv", feedback_avg);
    ctx.data.stat("eol_avg_mv", eol_avg);
    ctx.data.stat("difference_mv", difference);
    ctx.data.stat("feedback_samples", series[0].len());
    ctx.data.stat("eol_samples", series[1].len());

    if within_tolerance(difference, tolerance_mv) {
        ctx.data
            .note(format!("DUT {feedback_avg:.1} mV vs EOL {eol_avg:.1} mV"));
        Ok(Verdict::Pass)
    } else {
        Ok(Verdict::Fail(format!(
            "DUT {feedback_avg:.1} mV vs EOL {eol_avg:.1} mV: {:.1} mV apart, limit {tolerance_mv} mV",
            difference.abs()
        )))
    }
}

/// Pre-dwell, then compare averaged feedback against the EOL measurement.
pub(crate) async fn run_static(
    ctx: &mut ProcedureContext<'_>,
    feedback: &SignalRef,
    p: &AnalogStaticParams,
) -> EolResult<Verdict> {
    select_mux(ctx, &p.mux).await?;
    compare_averages(
        ctx,
        feedback,
        &p.eol_signal,
        p.pre_dwell_ms,
        p.dwell_ms,
        p.tolerance_mv,
    )
    .await
}

/// Enable the rail if configured, then compare it against the EOL measurement.
pub(crate) async fn run_external_5v(
    ctx: &mut ProcedureContext<'_>,
    feedback: &SignalRef,
    p: &External5VParams,
) -> EolResult<Verdict> {
    if let Some(enable) = &p.enable {
        ctx.write(enable, 1.0).await?;
    }
    let verdict = compare_averages(
        ctx,
        feedback,
        &p.eol_signal,
        p.pre_dwell_ms,
        p.dwell_ms,
        p.tolerance_mv,
    )
    .await;
    if let Some(enable) = &p.enable {
        ctx.restore(enable, 0.0).await;
    }
    verdict
}

#[cfg(test)]
mod tests {
    use super::super::testing::runner_for;
    use super::super::{Actuation, TestSpec, TestStatus};
    use super::*;

    fn sweep(min: f64, max: f64, expected: Option<f64>, tolerance: Option<f64>) -> TestSpec {
        TestSpec::new(
            "DAC sweep",
            2,
            Some(SignalRef::new(0x20, "DacFb")),
            Actuation::AnalogSweep(AnalogSweepParams {
                command: SignalRef::new(0x10, "DacCmd"),
                min,
                max,
                step: 250.0,
                dwell_ms: 1,
                expected_gain: expected,
                gain_tolerance_percent: tolerance,
                mux: None,
            }),
        )
    }

    async fn run_with_gain(spec: &TestSpec, gain: f64) -> crate::procedures::ExecutionResult {
        let (runner, _dut) = runner_for(spec, |d| {
            d.with_rule(SignalRef::new(0x20, "DacFb"), move |v| {
                v.get(0x10, "DacCmd").map(|x| gain * x)
            })
        });
        runner.run(spec).await
    }

    #[tokio::test]
    async fn sweep_within_gain_tolerance_passes() {
        let spec = sweep(0.0, 1000.0, Some(1.0), Some(5.0));
        let result = run_with_gain(&spec, 1.02).await;
        assert_eq!(result.status, TestStatus::Pass, "{}", result.notes);
        assert!((result.statistic("gain").unwrap() - 1.02).abs() < 1e-9);
        assert!((result.statistic("gain_error_percent").unwrap() - 2.0).abs() < 1e-6);
        assert_eq!(result.samples[0].x, vec![0.0, 250.0, 500.0, 750.0, 1000.0]);
        assert!(result.fits.contains_key("sweep"));
    }

    #[tokio::test]
    async fn sweep_outside_gain_tolerance_fails() {
        let spec = sweep(0.0, 1000.0, Some(1.0), Some(1.0));
        let result = run_with_gain(&spec, 1.02).await;
        assert_eq!(result.status, TestStatus::Fail);
        assert!(result.notes.contains("gain error"));
    }

    #[tokio::test]
    async fn gain_tolerance_boundary_is_inclusive() {
        let spec = sweep(0.0, 1000.0, Some(1.0), Some(50.0));
        let result = run_with_gain(&spec, 1.5).await;
        assert_eq!(result.statistic("gain_error_percent"), Some(50.0));
        assert_eq!(result.status, TestStatus::Pass);
    }

    #[tokio::test]
    async fn repeated_dac_value_is_degenerate() {
        let spec = sweep(500.0, 500.0, None, None);
        let result = run_with_gain(&spec, 1.0).await;
        assert_eq!(result.status, TestStatus::Error);
        assert_eq!(
            result.error_category,
            Some(crate::error::ErrorCategory::Data)
        );
        assert!(result.notes.contains("Degenerate"));
        // Raw samples survive the failed fit.
        assert_eq!(result.samples[0].y, vec![500.0]);
    }

    fn static_spec(tolerance_mv: f64) -> TestSpec {
        TestSpec::new(
            "VREF",
            1,
            Some(SignalRef::new(0x21, "VrefFb")),
            Actuation::AnalogStatic(AnalogStaticParams {
                eol_signal: SignalRef::new(0x30, "EolVref"),
                pre_dwell_ms: 1,
                dwell_ms: 8,
                tolerance_mv,
                mux: Some(MuxSelect {
                    signal: SignalRef::new(0x10, "MuxSel"),
                    channel: 3,
                }),
            }),
        )
    }

    #[tokio::test]
    async fn static_compares_averages() {
        let spec = static_spec(10.0);
        let (runner, dut) = runner_for(&spec, |d| d);
        dut.pin(SignalRef::new(0x21, "VrefFb"), 2500.0);
        dut.pin(SignalRef::new(0x30, "EolVref"), 2495.0);

        let result = runner.run(&spec).await;
        assert_eq!(result.status, TestStatus::Pass, "{}", result.notes);
        assert_eq!(result.statistic("difference_mv"), Some(5.0));
        assert_eq!(dut.value(0x10, "MuxSel"), Some(3.0));

        let spec = static_spec(4.0);
        assert_eq!(runner.run(&spec).await.status, TestStatus::Fail);
    }

    #[tokio::test]
    async fn external_5v_enables_and_disables_rail() {
        let spec = TestSpec::new(
            "5V rail",
            1,
            Some(SignalRef::new(0x21, "Rail5V")),
            Actuation::External5V(External5VParams {
                enable: Some(SignalRef::new(0x10, "En5V")),
                eol_signal: SignalRef::new(0x30, "Eol5V"),
                pre_dwell_ms: 1,
                dwell_ms: 5,
                tolerance_mv: 50.0,
            }),
        );
        let (runner, dut) = runner_for(&spec, |d| {
            d.with_rule(SignalRef::new(0x21, "Rail5V"), |v| {
                v.get(0x10, "En5V").map(|en| en * 5010.0)
            })
            .with_rule(SignalRef::new(0x30, "Eol5V"), |v| {
                v.get(0x10, "En5V").map(|en| en * 4990.0)
            })
        });
        let result = runner.run(&spec).await;
        assert_eq!(result.status, TestStatus::Pass, "{}", result.notes);
        assert_eq!(dut.value(0x10, "En5V"), Some(0.0));
    }
}
