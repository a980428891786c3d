//! Digital Logic procedure.

use super::spec::DigitalLogicParams;
use super::{ProcedureContext, Verdict};
use crate::calibration::within_tolerance;
use crate::error::EolResult;
use crate::transport::SignalRef;

/// Assert `high`, dwell, read the feedback once, then restore `low`.
pub(crate) async fn run(
    ctx: &mut ProcedureContext<'_>,
    feedback: &SignalRef,
    p: &DigitalLogicParams,
) -> EolResult<Verdict> {
    ctx.write(&p.command, p.high).await?;
    let measured = async {
        ctx.dwell(p.dwell_ms).await?;
        ctx.read(feedback)
    }
    .await;
    ctx.restore(&p.command, p.low).await;
    let value = measured?;

    ctx.data.stat("commanded", p.high);
    ctx.data.stat("feedback", value);

    let matched = match p.threshold {
        Some(threshold) => within_tolerance(value - p.high, threshold),
        None => value == p.high,
    };
    if matched {
        ctx.data.note(format!("{feedback} = {value}"));
        Ok(Verdict::Pass)
    } else {
        Ok(Verdict::Fail(format!(
            "{feedback} read {value}, expected {}",
            p.high
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::runner_for;
    use super::super::{Actuation, TestSpec, TestStatus};
    use super::*;

    fn spec(threshold: Option<f64>) -> TestSpec {
        TestSpec::new(
            "Relay",
            1,
            Some(SignalRef::new(0x20, "RelayFb")),
            Actuation::DigitalLogic(DigitalLogicParams {
                command: SignalRef::new(0x10, "Relay"),
                low: 0.0,
                high: 1.0,
                dwell_ms: 5,
                threshold,
            }),
        )
    }

    #[tokio::test]
    async fn follows_command_and_restores_low() {
        let spec = spec(None);
        let (runner, dut) = runner_for(&spec, |d| {
            d.with_rule(SignalRef::new(0x20, "RelayFb"), |v| v.get(0x10, "Relay"))
        });
        let result = runner.run(&spec).await;
        assert_eq!(result.status, TestStatus::Pass, "{}", result.notes);

        let writes: Vec<f64> = dut.write_log().into_iter().map(|(_, v)| v).collect();
        assert_eq!(writes, vec![1.0, 0.0]);
    }

    #[tokio::test]
    async fn stuck_output_fails() {
        let spec = spec(None);
        let (runner, dut) = runner_for(&spec, |d| d);
        dut.pin(SignalRef::new(0x20, "RelayFb"), 0.0);
        let result = runner.run(&spec).await;
        assert_eq!(result.status, TestStatus::Fail);
        assert!(result.notes.contains("expected 1"));
    }

    #[tokio::test]
    async fn threshold_allows_deviation() {
        let spec = spec(Some(0.1));
        let (runner, dut) = runner_for(&spec, |d| d);
        dut.pin(SignalRef::new(0x20, "RelayFb"), 0.95);
        assert_eq!(runner.run(&spec).await.status, TestStatus::Pass);
    }

    #[tokio::test]
    async fn missing_feedback_is_an_error() {
        let spec = spec(None);
        let (runner, dut) = runner_for(&spec, |d| d);
        let result = runner.run(&spec).await;
        assert_eq!(result.status, TestStatus::Error);
        // The output is still restored.
        assert_eq!(dut.value(0x10, "Relay"), Some(0.0));
    }
}
