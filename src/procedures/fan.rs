//! Fan Control procedure.

use super::spec::FanControlParams;
use super::{ProcedureContext, Verdict};
use crate::error::{EolError, EolResult};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct FanReading {
    tach: f64,
    fault: f64,
    enabled: bool,
}

impl FanReading {
    fn healthy(&self) -> bool {
        self.enabled && self.tach != 0.0 && self.fault == 0.0
    }
}

/// Assert the enable and wait up to `test_timeout_ms` for a healthy tach/fault reading.
///
/// A complete but unhealthy reading at the deadline is a `Fail`; no reading at all is a
/// `Timeout` error. The enable is released afterwards.
pub(crate) async fn run(
    ctx: &mut ProcedureContext<'_>,
    p: &FanControlParams,
) -> EolResult<Verdict> {
    ctx.write(&p.enable, p.enable_value).await?;
    let polled = poll(ctx, p).await;
    ctx.restore(&p.enable, 0.0).await;
    let (reading, waited_ms) = polled?;

    let Some(reading) = reading else {
        return Err(EolError::Timeout(format!(
            "no tach/fault feedback within {} ms",
            p.test_timeout_ms
        )));
    };

    ctx.data.stat("tach", reading.tach);
    ctx.data.stat("fault", reading.fault);
    ctx.data.stat("enabled", reading.enabled);
    ctx.data.stat("settle_ms", waited_ms);

    if reading.healthy() {
        ctx.data.note(format!("tach {} after {waited_ms} ms", reading.tach));
        return Ok(Verdict::Pass);
    }
    let mut reasons = Vec::new();
    if !reading.enabled {
        reasons.push("fan not reported enabled".to_string());
    }
    if reading.tach == 0.0 {
        reasons.push("tach reads zero".to_string());
    }
    if reading.fault != 0.0 {
        reasons.push(format!("fault flag {}", reading.fault));
    }
    Ok(Verdict::Fail(format!(
        "{} after {} ms",
        reasons.join(", "),
        p.test_timeout_ms
    )))
}

/// Poll until healthy or the timeout; returns the last complete reading and the time waited.
async fn poll(
    ctx: &ProcedureContext<'_>,
    p: &FanControlParams,
) -> EolResult<(Option<FanReading>, u64)> {
    let started = Instant::now();
    let deadline = started + Duration::from_millis(p.test_timeout_ms);
    let interval = Duration::from_millis(ctx.timing().poll_interval_ms.max(1));
    let mut last = None;
    loop {
        let enabled = match &p.enabled_status {
            Some(status) => ctx.try_read(status).map(|v| v != 0.0),
            None => Some(true),
        };
        if let (Some(tach), Some(fault), Some(enabled)) =
            (ctx.try_read(&p.tach), ctx.try_read(&p.fault), enabled)
        {
            let reading = FanReading {
                tach,
                fault,
                enabled,
            };
            last = Some(reading);
            if reading.healthy() {
                break;
            }
            debug!(tach, fault, enabled, "Fan not settled");
        }
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        ctx.wait(interval.min(deadline - now)).await?;
    }
    let waited_ms = started.elapsed().as_millis().try_into().unwrap_or(u64::MAX);
    Ok((last, waited_ms))
}

#[cfg(test)]
mod tests {
    use super::super::testing::runner_for;
    use super::super::{Actuation, TestSpec, TestStatus};
    use super::*;
    use crate::error::ErrorCategory;
    use crate::transport::SignalRef;

    fn spec() -> TestSpec {
        TestSpec::new(
            "Fan",
            1,
            None,
            Actuation::FanControl(FanControlParams {
                enable: SignalRef::new(0x10, "FanEn"),
                enable_value: 1.0,
                tach: SignalRef::new(0x23, "FanTach"),
                fault: SignalRef::new(0x23, "FanFault"),
                enabled_status: Some(SignalRef::new(0x23, "FanOn")),
                test_timeout_ms: 30,
            }),
        )
    }

    fn healthy_fan(d: crate::transport::SimulatedDut) -> crate::transport::SimulatedDut {
        d.with_rule(SignalRef::new(0x23, "FanOn"), |v| v.get(0x10, "FanEn"))
            .with_rule(SignalRef::new(0x23, "FanTach"), |v| {
                v.get(0x10, "FanEn").map(|en| en * 3200.0)
            })
            .with_rule(SignalRef::new(0x23, "FanFault"), |_| Some(0.0))
    }

    #[tokio::test]
    async fn spinning_fan_passes_and_is_disabled() {
        let spec = spec();
        let (runner, dut) = runner_for(&spec, healthy_fan);
        let result = runner.run(&spec).await;
        assert_eq!(result.status, TestStatus::Pass, "{}", result.notes);
        assert_eq!(result.statistic("tach"), Some(3200.0));
        assert_eq!(dut.value(0x10, "FanEn"), Some(0.0));
    }

    #[tokio::test]
    async fn fault_is_a_fail() {
        let spec = spec();
        let (runner, dut) = runner_for(&spec, healthy_fan);
        dut.pin(SignalRef::new(0x23, "FanFault"), 1.0);
        let result = runner.run(&spec).await;
        assert_eq!(result.status, TestStatus::Fail);
        assert!(result.notes.contains("fault"));
    }

    #[tokio::test]
    async fn silence_is_a_timeout_error() {
        let spec = spec();
        let (runner, _dut) = runner_for(&spec, |d| d);
        let result = runner.run(&spec).await;
        assert_eq!(result.status, TestStatus::Error);
        assert_eq!(result.error_category, Some(ErrorCategory::Hardware));
        assert!(result.notes.contains("Timed out"));
    }
}
