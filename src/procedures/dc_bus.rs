//! DC Bus Sensing procedure.

use super::spec::DcBusParams;
use super::{ProcedureContext, Source, Verdict};
use crate::calibration::{finite_mean, within_tolerance};
use crate::error::{EolError, EolResult};
use crate::transport::SignalRef;

/// Average the scope channel and the CAN bus voltage over `dwell_ms` and compare them.
pub(crate) async fn run(
    ctx: &mut ProcedureContext<'_>,
    feedback: &SignalRef,
    p: &DcBusParams,
) -> EolResult<Verdict> {
    let series = ctx
        .sample(
            &[Source::Scope(p.scope_channel), Source::Signal(feedback)],
            p.dwell_ms,
        )
        .await?;
    let scope_v = finite_mean(&series[0])
        .ok_or_else(|| EolError::Instrument("no valid bus voltage acquisitions".into()))?;
    let can_v = finite_mean(&series[1])
        .ok_or_else(|| EolError::DegenerateData(format!("no samples from {feedback}")))?;
    let difference = can_v - scope_v;

    ctx.data.stat("scope_v", scope_v);
    ctx.data.stat("can_v", can_v);
    ctx.data.stat("difference_v", difference);
    ctx.data.stat("acquisitions", series[0].len());

    if within_tolerance(difference, p.tolerance_v) {
        ctx.data
            .note(format!("CAN {can_v:.2} V vs scope {scope_v:.2} V"));
        Ok(Verdict::Pass)
    } else {
        Ok(Verdict::Fail(format!(
            "CAN {can_v:.2} V vs scope {scope_v:.2} V exceeds ±{} V",
            p.tolerance_v
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::runner_with_scope;
    use super::super::{Actuation, TestSpec, TestStatus};
    use super::*;

    fn spec() -> TestSpec {
        TestSpec::new(
            "DC bus",
            2,
            Some(SignalRef::new(0x24, "BusVoltage")),
            Actuation::DcBusSensing(DcBusParams {
                scope_channel: 3,
                dwell_ms: 6,
                tolerance_v: 2.0,
            }),
        )
    }

    #[tokio::test]
    async fn matching_bus_voltage_passes() {
        let spec = spec();
        let (runner, dut) = runner_with_scope(&spec, |d| d, |s| s.with_channel(3, |_| 400.0));
        dut.pin(SignalRef::new(0x24, "BusVoltage"), 401.5);
        let result = runner.run(&spec).await;
        assert_eq!(result.status, TestStatus::Pass, "{}", result.notes);
        assert_eq!(result.statistic("scope_v"), Some(400.0));
    }

    #[tokio::test]
    async fn drifted_sense_fails() {
        let spec = spec();
        let (runner, dut) = runner_with_scope(&spec, |d| d, |s| s.with_channel(3, |_| 400.0));
        dut.pin(SignalRef::new(0x24, "BusVoltage"), 395.0);
        assert_eq!(runner.run(&spec).await.status, TestStatus::Fail);
    }

    #[tokio::test]
    async fn invalid_scope_data_is_an_error() {
        let spec = spec();
        let (runner, dut) =
            runner_with_scope(&spec, |d| d, |s| s.with_channel(3, |_| f64::NAN));
        dut.pin(SignalRef::new(0x24, "BusVoltage"), 400.0);
        assert_eq!(runner.run(&spec).await.status, TestStatus::Error);
    }
}
