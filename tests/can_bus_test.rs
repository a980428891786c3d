//! Integration tests for the CAN bus transport
//!
//! A `ChannelAdapter` loopback stands in for the vendor adapter; a small emulator task plays the
//! DUT by decoding what the station transmits and answering with feedback frames.

use eol_station::error::ErrorCategory;
use eol_station::procedures::spec::DigitalLogicParams;
use eol_station::procedures::Actuation;
use eol_station::transport::{
    CanBus, ChannelAdapter, ChannelPeer, MessageDatabase, SignalRef, SignalTransport,
};
use eol_station::{RunnerTiming, TestRunner, TestSpec, TestStatus};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

const DATABASE: &str = r#"
[[messages]]
id = 0x10
name = "EOL_Command"
dlc = 8

[[messages.signals]]
name = "Relay"
start_bit = 0
length = 1

[[messages.signals]]
name = "DacCmd"
start_bit = 8
length = 16
factor = 0.5
unit = "mV"

[[messages]]
id = 0x20
name = "DUT_Feedback"
dlc = 8

[[messages.signals]]
name = "RelayFb"
start_bit = 0
length = 1

[[messages.signals]]
name = "Counter"
start_bit = 8
length = 16
"#;

fn database() -> MessageDatabase {
    MessageDatabase::from_toml_str(DATABASE).unwrap()
}

fn relay_spec() -> TestSpec {
    TestSpec::new(
        "Relay K1",
        1,
        Some(SignalRef::new(0x20, "RelayFb")),
        Actuation::DigitalLogic(DigitalLogicParams {
            command: SignalRef::new(0x10, "Relay"),
            low: 0.0,
            high: 1.0,
            dwell_ms: 20,
            threshold: None,
        }),
    )
}

fn runner(bus: CanBus) -> TestRunner {
    TestRunner::new(Arc::new(bus)).with_timing(RunnerTiming {
        settle_ms: 1,
        sample_interval_ms: 2,
        poll_interval_ms: 2,
    })
}

/// Echo every commanded relay state back as feedback; returns the commanded states seen.
fn spawn_relay_emulator(mut peer: ChannelPeer) -> Arc<Mutex<Vec<f64>>> {
    let commanded = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&commanded);
    tokio::spawn(async move {
        let db = database();
        while let Some(frame) = peer.transmitted.recv().await {
            let Ok(values) = db.decode(&frame) else {
                continue;
            };
            if let Some((_, relay)) = values.iter().find(|(name, _)| name == "Relay") {
                seen.lock().push(*relay);
                let reply = db.encode(0x20, [("RelayFb", *relay)]).unwrap();
                if peer.inject(reply).is_err() {
                    break;
                }
            }
        }
    });
    commanded
}

async fn wait_for_value(bus: &CanBus, message_id: u32, signal: &str, want: f64) -> bool {
    for _ in 0..200 {
        if bus.latest_value(message_id, signal).map(|s| s.value) == Some(want) {
            return true;
        }
        sleep(Duration::from_millis(2)).await;
    }
    false
}

#[tokio::test]
async fn test_relay_procedure_over_can_loopback() {
    let (adapter, peer) = ChannelAdapter::pair();
    let bus = CanBus::start(Arc::new(adapter), database(), 64);
    let cache = bus.cache();
    let commanded = spawn_relay_emulator(peer);
    let runner = runner(bus);

    let result = runner.run(&relay_spec()).await;
    assert_eq!(result.status, TestStatus::Pass, "{}", result.notes);
    assert_eq!(result.statistic("feedback"), Some(1.0));

    // The restore frame is answered as well.
    let mut restored = false;
    for _ in 0..200 {
        if cache.get(0x20, "RelayFb").map(|s| s.value) == Some(0.0) {
            restored = true;
            break;
        }
        sleep(Duration::from_millis(2)).await;
    }
    assert!(restored, "relay feedback never returned low");
    assert_eq!(*commanded.lock(), vec![1.0, 0.0]);
}

#[tokio::test]
async fn test_scaled_signal_round_trips_through_the_database() {
    let (adapter, mut peer) = ChannelAdapter::pair();
    let bus = CanBus::start(Arc::new(adapter), database(), 64);

    bus.write_signals(0x10, &[("DacCmd", 250.0)]).await.unwrap();
    let frame = peer.transmitted.recv().await.unwrap();
    assert_eq!(frame.id, 0x10);
    assert_eq!(frame.data.len(), 8);
    // 250.0 mV at 0.5 mV/bit
    assert_eq!(u16::from_le_bytes([frame.data[1], frame.data[2]]), 500);

    // Frames for the station's own messages decode into the cache like any other.
    peer.inject(frame).unwrap();
    assert!(wait_for_value(&bus, 0x10, "DacCmd", 250.0).await);
}

#[tokio::test]
async fn test_overflow_keeps_newest_frames() {
    let (adapter, peer) = ChannelAdapter::pair();
    let bus = CanBus::start(Arc::new(adapter), database(), 4);
    let db = database();

    for counter in 0..200 {
        peer.inject(db.encode(0x20, [("Counter", f64::from(counter))]).unwrap())
            .unwrap();
    }

    assert!(wait_for_value(&bus, 0x20, "Counter", 199.0).await);
    assert!(bus.dropped_frames() > 0);
}

#[tokio::test]
async fn test_frames_without_definition_are_ignored() {
    let (adapter, peer) = ChannelAdapter::pair();
    let bus = CanBus::start(Arc::new(adapter), database(), 16);
    let db = database();

    peer.inject(eol_station::transport::CanFrame::new(0x7FF, vec![0xFF; 8]).unwrap())
        .unwrap();
    peer.inject(db.encode(0x20, [("RelayFb", 1.0)]).unwrap())
        .unwrap();

    assert!(wait_for_value(&bus, 0x20, "RelayFb", 1.0).await);
    assert!(bus.latest_value(0x7FF, "Anything").is_none());
    assert_eq!(bus.cache().snapshot().len(), 2);
}

#[tokio::test]
async fn test_silent_dut_is_an_error_not_a_verdict() {
    let (adapter, peer) = ChannelAdapter::pair();
    let bus = CanBus::start(Arc::new(adapter), database(), 16);

    // Feedback from before the test sits in the cache; nothing answers the command.
    peer.inject(database().encode(0x20, [("RelayFb", 1.0)]).unwrap())
        .unwrap();
    assert!(wait_for_value(&bus, 0x20, "RelayFb", 1.0).await);
    sleep(Duration::from_millis(2)).await;
    let runner = runner(bus);

    let result = runner.run(&relay_spec()).await;
    assert_eq!(result.status, TestStatus::Error, "{}", result.notes);
    assert_eq!(result.error_category, Some(ErrorCategory::Hardware));
    assert!(result.notes.contains("RelayFb"), "{}", result.notes);
    assert_eq!(result.statistic("feedback"), None);
    drop(peer);
}

#[tokio::test]
async fn test_disconnected_adapter_fails_the_test_with_hardware_error() {
    let (adapter, peer) = ChannelAdapter::pair();
    let bus = CanBus::start(Arc::new(adapter), database(), 16);
    peer.disconnect();
    let runner = runner(bus);

    let result = runner.run(&relay_spec()).await;
    assert_eq!(result.status, TestStatus::Error);
    assert_eq!(result.error_category, Some(ErrorCategory::Hardware));
    assert!(result.notes.contains("not connected"), "{}", result.notes);
}
