//! Charged HV Bus and Charger Functional procedures.
//!
//! Both command a trim and setpoint, raise the test trigger and watch the DUT status for the
//! full test time. The charger variant additionally checks the reported output current against
//! the setpoint.

use super::spec::RegulationParams;
use super::{ProcedureContext, Verdict};
use crate::calibration::{finite_mean, within_tolerance};
use crate::error::{EolError, EolResult};
use crate::transport::SignalRef;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct Observation {
    state: Option<f64>,
    pfc_power_good: Option<f64>,
    pcmc: Option<f64>,
    fault_seen: bool,
    currents: Vec<f64>,
    polls: usize,
}

async fn observe(
    ctx: &ProcedureContext<'_>,
    p: &RegulationParams,
    output: Option<&SignalRef>,
) -> EolResult<Observation> {
    let mut seen = Observation::default();
    let deadline = Instant::now() + Duration::from_millis(p.test_time_ms);
    let interval = Duration::from_millis(ctx.timing().poll_interval_ms.max(1));
    loop {
        seen.polls += 1;
        if let Some(state) = ctx.try_read(&p.dut_state) {
            seen.state = Some(state);
        }
        if let Some(pfc) = ctx.try_read(&p.pfc_power_good) {
            seen.pfc_power_good = Some(pfc);
        }
        if let Some(pcmc) = ctx.try_read(&p.pcmc) {
            seen.pcmc = Some(pcmc);
        }
        if ctx.try_read(&p.fault).is_some_and(|f| f != 0.0) {
            seen.fault_seen = true;
        }
        if let Some(current) = output.and_then(|s| ctx.try_read(s)) {
            seen.currents.push(current);
        }
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        ctx.wait(interval.min(deadline - now)).await?;
    }
    Ok(seen)
}

/// Trigger the regulation test and evaluate the DUT status observed over `test_time_ms`.
///
/// `output` is the charger output current signal and its tolerance in amperes.
pub(crate) async fn run(
    ctx: &mut ProcedureContext<'_>,
    p: &RegulationParams,
    output: Option<(&SignalRef, f64)>,
) -> EolResult<Verdict> {
    ctx.write_group(&[(&p.trim, p.trim_value), (&p.setpoint, p.setpoint_value)])
        .await?;
    ctx.write(&p.trigger, 1.0).await?;
    let observed = observe(ctx, p, output.map(|(s, _)| s)).await;
    ctx.restore(&p.trigger, 0.0).await;
    let seen = observed?;

    let Some(state) = seen.state else {
        return Err(EolError::Timeout(format!(
            "no DUT state on {} within {} ms",
            p.dut_state, p.test_time_ms
        )));
    };
    let pfc = seen.pfc_power_good.unwrap_or(0.0);
    let pcmc = seen.pcmc.unwrap_or(0.0);
    ctx.data.stat("dut_state", state);
    ctx.data.stat("pfc_power_good", pfc);
    ctx.data.stat("pcmc", pcmc);
    ctx.data.stat("fault_seen", seen.fault_seen);
    ctx.data.stat("polls", seen.polls);

    let mut failures = Vec::new();
    if state != p.expected_state {
        failures.push(format!("state {state} (expected {})", p.expected_state));
    }
    if pfc == 0.0 {
        failures.push("PFC power not good".to_string());
    }
    if pcmc == 0.0 {
        failures.push("PCMC inactive".to_string());
    }
    if seen.fault_seen {
        failures.push("fault flagged during test".to_string());
    }

    if let Some((signal, tolerance)) = output {
        let current = finite_mean(&seen.currents).ok_or_else(|| {
            EolError::Unreachable(format!("no output current received on {signal}"))
        })?;
        let deviation = current - p.setpoint_value;
        ctx.data.stat("output_current_a", current);
        ctx.data.stat("current_deviation_a", deviation);
        if !within_tolerance(deviation, tolerance) {
            failures.push(format!(
                "output current {current:.3} A outside {} ± {tolerance} A",
                p.setpoint_value
            ));
        }
    }

    if failures.is_empty() {
        ctx.data.note(format!("regulating in state {state}"));
        Ok(Verdict::Pass)
    } else {
        Ok(Verdict::Fail(failures.join(", ")))
    }
}
