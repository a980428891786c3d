//! PWM Sensor procedure.

use super::spec::PwmSensorParams;
use super::{ProcedureContext, Source, Verdict};
use crate::calibration::{finite_mean, within_tolerance};
use crate::error::{EolError, EolResult};

/// Sample frequency and duty over the acquisition window; both axes must be in tolerance.
pub(crate) async fn run(
    ctx: &mut ProcedureContext<'_>,
    p: &PwmSensorParams,
) -> EolResult<Verdict> {
    let series = ctx
        .sample(
            &[Source::Signal(&p.frequency), Source::Signal(&p.duty)],
            p.acquisition_time_ms,
        )
        .await?;
    let frequency = finite_mean(&series[0])
        .ok_or_else(|| EolError::DegenerateData("no frequency samples".into()))?;
    let duty = finite_mean(&series[1])
        .ok_or_else(|| EolError::DegenerateData("no duty samples".into()))?;

    ctx.data.stat("frequency_hz", frequency);
    ctx.data.stat("duty_percent", duty);
    ctx.data.stat("frequency_samples", series[0].len());
    ctx.data.stat("duty_samples", series[1].len());
    ctx.data.series("frequency", sample_index(&series[0]), series[0].clone());
    ctx.data.series("duty", sample_index(&series[1]), series[1].clone());

    let mut failures = Vec::new();
    if !within_tolerance(frequency - p.reference_frequency_hz, p.frequency_tolerance_hz) {
        failures.push(format!(
            "frequency {frequency:.2} Hz outside {} ± {} Hz",
            p.reference_frequency_hz, p.frequency_tolerance_hz
        ));
    }
    if !within_tolerance(duty - p.reference_duty_percent, p.duty_tolerance_percent) {
        failures.push(format!(
            "duty {duty:.2}% outside {} ± {}%",
            p.reference_duty_percent, p.duty_tolerance_percent
        ));
    }

    if failures.is_empty() {
        ctx.data.note(format!("{frequency:.2} Hz at {duty:.2}% duty"));
        Ok(Verdict::Pass)
    } else {
        Ok(Verdict::Fail(failures.join(", ")))
    }
}

/// Ordinal x axis for a series sampled by one source.
fn sample_index(values: &[f64]) -> Vec<f64> {
    (0..values.len()).map(|i| i as f64).collect()
}
