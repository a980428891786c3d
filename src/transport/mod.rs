//! Transport Collaborators
//!
//! The engine talks to hardware only through two small traits, injected at construction:
//!
//! - [`SignalTransport`]: CAN frames and named signals (send, encode/write, latest value)
//! - [`InstrumentTransport`]: an oscilloscope-class instrument (configure, query channel)
//!
//! Concrete pieces live in submodules:
//!
//! - `database`: message/signal definitions with bit-level encode/decode
//! - `cache`: the latest-value signal cache and the bounded drop-oldest frame queue
//! - `can_bus`: a [`SignalTransport`] over a raw [`CanAdapter`] with a reception worker
//! - `mock`: simulated DUT and oscilloscope for tests and dry runs
//!
//! # Thread Safety
//!
//! Both traits require `Send + Sync` and take `&self`; implementations use interior
//! mutability. While a sequence runs, the sequencer worker is the only caller.

pub mod cache;
pub mod can_bus;
pub mod database;
pub mod mock;

pub use cache::{FrameQueue, FrameReceiver, SignalCache};
pub use can_bus::{CanAdapter, CanBus, ChannelAdapter, ChannelPeer};
pub use database::{ByteOrder, MessageDatabase, MessageDef, SignalDef};
pub use mock::{SignalValues, SimulatedDut, SimulatedScope};

use crate::error::{EolError, EolResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum payload of a CAN FD frame.
pub const MAX_FRAME_LEN: usize = 64;

/// Highest oscilloscope channel number accepted in configurations and test specs.
pub const MAX_SCOPE_CHANNEL: u8 = 8;

/// A raw CAN frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanFrame {
    /// Arbitration ID
    pub id: u32,
    /// 29-bit identifier
    #[serde(default)]
    pub extended: bool,
    /// Payload bytes (up to 64 for CAN FD)
    pub data: Vec<u8>,
}

impl CanFrame {
    /// Create a frame, rejecting oversized payloads.
    pub fn new(id: u32, data: Vec<u8>) -> EolResult<Self> {
        if data.len() > MAX_FRAME_LEN {
            return Err(EolError::InvalidInput(format!(
                "frame 0x{id:X} payload of {} bytes exceeds {MAX_FRAME_LEN}",
                data.len()
            )));
        }
        Ok(Self {
            id,
            extended: id > 0x7FF,
            data,
        })
    }
}

/// Reference to one named signal inside one CAN message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignalRef {
    /// Message arbitration ID
    pub message_id: u32,
    /// Signal name as defined in the message database
    pub signal: String,
}

impl SignalRef {
    /// Create a signal reference.
    pub fn new(message_id: u32, signal: impl Into<String>) -> Self {
        Self {
            message_id,
            signal: signal.into(),
        }
    }
}

impl fmt::Display for SignalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X}:{}", self.message_id, self.signal)
    }
}

/// Timestamped snapshot of a decoded signal value.
///
/// Snapshots are copies; the cache never hands out a reference to a value it may overwrite.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalSample {
    /// Physical value after factor/offset scaling
    pub value: f64,
    /// Time the carrying frame was decoded
    pub timestamp: DateTime<Utc>,
}

/// Capability: CAN signal I/O
///
/// # Contract
/// - `send` transmits a raw frame; it fails with `Unreachable` when the adapter is down
/// - `write_signals` encodes physical values into one message and transmits it
/// - `latest_value` returns the most recent decoded value, or `None` if none was received
/// - `find_message_and_signal` resolves a reference against the loaded message database
#[async_trait]
pub trait SignalTransport: Send + Sync {
    /// Transmit a raw frame.
    async fn send(&self, frame: CanFrame) -> EolResult<()>;

    /// Encode `values` into message `message_id` and transmit it.
    ///
    /// Signals of the message not listed in `values` keep their last written value.
    async fn write_signals(&self, message_id: u32, values: &[(&str, f64)]) -> EolResult<()>;

    /// Latest decoded value of `signal` in `message_id`.
    fn latest_value(&self, message_id: u32, signal: &str) -> Option<SignalSample>;

    /// Look up the database definitions of a message and one of its signals.
    fn find_message_and_signal(
        &self,
        message_id: u32,
        signal: &str,
    ) -> Option<(&MessageDef, &SignalDef)>;

    /// Whether the underlying adapter is connected.
    fn is_connected(&self) -> bool {
        true
    }
}

/// One oscilloscope channel setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeChannelConfig {
    /// 1-based channel number
    pub channel: u8,
    /// Operator-facing label (e.g. "Phase V")
    #[serde(default)]
    pub label: String,
    /// Whether the channel is displayed/acquired
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Vertical scale
    pub volts_per_div: f64,
    /// Probe attenuation (1x, 10x, current probe scale)
    #[serde(default = "default_attenuation")]
    pub probe_attenuation: f64,
    /// Vertical offset in volts
    #[serde(default)]
    pub offset_v: f64,
}

fn default_true() -> bool {
    true
}

fn default_attenuation() -> f64 {
    1.0
}

/// Channel and timebase configuration applied to the oscilloscope before a sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeConfig {
    /// Horizontal scale in seconds per division
    pub timebase_s_per_div: f64,
    /// Per-channel settings
    #[serde(default)]
    pub channels: Vec<ScopeChannelConfig>,
}

impl ScopeConfig {
    /// Check channel numbers and scales, returning every problem found.
    pub fn validate(&self) -> Result<(), Vec<EolError>> {
        let mut errors = Vec::new();
        if !(self.timebase_s_per_div > 0.0) {
            errors.push(EolError::InvalidInput(format!(
                "timebase {} s/div must be positive",
                self.timebase_s_per_div
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for ch in &self.channels {
            if ch.channel == 0 || ch.channel > MAX_SCOPE_CHANNEL {
                errors.push(EolError::InvalidInput(format!(
                    "scope channel {} outside 1..={MAX_SCOPE_CHANNEL}",
                    ch.channel
                )));
            }
            if !seen.insert(ch.channel) {
                errors.push(EolError::InvalidInput(format!(
                    "scope channel {} configured twice",
                    ch.channel
                )));
            }
            if !(ch.volts_per_div > 0.0) || !(ch.probe_attenuation > 0.0) {
                errors.push(EolError::InvalidInput(format!(
                    "scope channel {} needs positive volts/div and attenuation",
                    ch.channel
                )));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Capability: oscilloscope-class acquisition
///
/// # Contract
/// - `apply_configuration` returns every rejected setting, not just the first
/// - `query` returns one batch of samples for a 1-based channel, already scaled to
///   physical units
#[async_trait]
pub trait InstrumentTransport: Send + Sync {
    /// Apply a channel/timebase configuration.
    async fn apply_configuration(&self, config: &ScopeConfig) -> Result<(), Vec<EolError>>;

    /// Acquire one batch of samples from `channel`.
    async fn query(&self, channel: u8) -> EolResult<Vec<f64>>;

    /// Whether the instrument session is open.
    fn is_connected(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_rejects_oversized_payload() {
        assert!(CanFrame::new(0x10, vec![0; 8]).is_ok());
        assert!(CanFrame::new(0x10, vec![0; 65]).is_err());
        assert!(CanFrame::new(0x18FF_0001, vec![]).unwrap().extended);
    }

    #[test]
    fn signal_ref_display() {
        assert_eq!(SignalRef::new(0x10, "Relay").to_string(), "0x10:Relay");
    }

    #[test]
    fn scope_config_collects_all_errors() {
        let cfg = ScopeConfig {
            timebase_s_per_div: 0.0,
            channels: vec![
                ScopeChannelConfig {
                    channel: 9,
                    label: "bogus".into(),
                    enabled: true,
                    volts_per_div: 1.0,
                    probe_attenuation: 1.0,
                    offset_v: 0.0,
                },
                ScopeChannelConfig {
                    channel: 1,
                    label: "Phase V".into(),
                    enabled: true,
                    volts_per_div: -1.0,
                    probe_attenuation: 10.0,
                    offset_v: 0.0,
                },
            ],
        };
        let errors = cfg.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }
}
