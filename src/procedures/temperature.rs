//! Temperature Validation procedure.

use super::spec::TemperatureParams;
use super::{ProcedureContext, Source, Verdict};
use crate::calibration::{finite_mean, within_tolerance};
use crate::error::{EolError, EolResult};
use crate::transport::SignalRef;

pub(crate) async fn run(
    ctx: &mut ProcedureContext<'_>,
    feedback: &SignalRef,
    p: &TemperatureParams,
) -> EolResult<Verdict> {
    let series = ctx.sample(&[Source::Signal(feedback)], p.dwell_ms).await?;
    let average = finite_mean(&series[0])
        .ok_or_else(|| EolError::DegenerateData(format!("no samples from {feedback}")))?;
    let deviation = average - p.reference_c;

    ctx.data.stat("average_c", average);
    ctx.data.stat("deviation_c", deviation);
    ctx.data.stat("samples", series[0].len());

    if within_tolerance(deviation, p.tolerance_c) {
        ctx.data.note(format!("{average:.2} °C"));
        Ok(Verdict::Pass)
    } else {
        Ok(Verdict::Fail(format!(
            "{average:.2} °C outside {} ± {} °C",
            p.reference_c, p.tolerance_c
        )))
    }
}
