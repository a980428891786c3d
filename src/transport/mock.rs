//! Simulated DUT and oscilloscope.
//!
//! [`SimulatedDut`] is a [`SignalTransport`] whose feedback signals are computed from the values
//! most recently commanded, through rules registered at construction:
//!
//! ```rust,ignore
//! let dut = SimulatedDut::new(database)
//!     .with_rule(SignalRef::new(0x20, "DacFb"), |v| v.get(0x10, "DacCmd").map(|x| 1.02 * x));
//! ```
//!
//! [`SimulatedScope`] derives per-channel sample batches from the same values, so a procedure
//! that commands the DUT sees consistent CAN and oscilloscope readings.

use super::database::{MessageDatabase, MessageDef, SignalDef};
use super::{
    CanFrame, InstrumentTransport, ScopeConfig, SignalRef, SignalSample, SignalTransport,
};
use crate::error::{EolError, EolResult};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Width of every signal in a synthesized database.
const SYNTHETIC_SIGNAL_BITS: u16 = 16;

/// Read-only view of the simulated signal values, handed to rules.
pub struct SignalValues<'a> {
    values: &'a HashMap<u32, HashMap<String, SignalSample>>,
}

impl SignalValues<'_> {
    /// Current value of a signal, if it was ever written or computed.
    pub fn get(&self, message_id: u32, signal: &str) -> Option<f64> {
        self.values
            .get(&message_id)
            .and_then(|m| m.get(signal))
            .map(|s| s.value)
    }
}

type Rule = Box<dyn Fn(&SignalValues<'_>) -> Option<f64> + Send + Sync>;
type ChannelModel = Box<dyn Fn(&SignalValues<'_>) -> f64 + Send + Sync>;

#[derive(Default)]
struct DutState {
    values: HashMap<u32, HashMap<String, SignalSample>>,
    pinned: HashSet<SignalRef>,
    writes: Vec<(SignalRef, f64)>,
}

impl DutState {
    fn set(&mut self, signal: &SignalRef, value: f64) {
        self.values.entry(signal.message_id).or_default().insert(
            signal.signal.clone(),
            SignalSample {
                value,
                timestamp: Utc::now(),
            },
        );
    }
}

/// Rule-driven stand-in for a device under test.
pub struct SimulatedDut {
    database: MessageDatabase,
    rules: Vec<(SignalRef, Rule)>,
    state: Mutex<DutState>,
    connected: AtomicBool,
}

impl SimulatedDut {
    /// Simulate a DUT speaking the messages in `database`.
    pub fn new(database: MessageDatabase) -> Self {
        Self {
            database,
            rules: Vec::new(),
            state: Mutex::new(DutState::default()),
            connected: AtomicBool::new(true),
        }
    }

    /// Simulate a DUT with a synthesized database covering `signals`.
    ///
    /// Each message gets 16-bit slots in signal order; at most 32 signals fit one message.
    pub fn from_signals<I>(signals: I) -> EolResult<Self>
    where
        I: IntoIterator<Item = SignalRef>,
    {
        let mut by_message: BTreeMap<u32, Vec<String>> = BTreeMap::new();
        for signal in signals {
            let names = by_message.entry(signal.message_id).or_default();
            if !names.contains(&signal.signal) {
                names.push(signal.signal);
            }
        }
        let messages = by_message
            .into_iter()
            .map(|(id, names)| MessageDef {
                id,
                name: format!("SIM_0x{id:X}"),
                dlc: 64,
                signals: names
                    .into_iter()
                    .enumerate()
                    .map(|(slot, name)| SignalDef {
                        name,
                        start_bit: (slot as u16).saturating_mul(SYNTHETIC_SIGNAL_BITS),
                        length: SYNTHETIC_SIGNAL_BITS as u8,
                        byte_order: Default::default(),
                        signed: true,
                        factor: 1.0,
                        offset: 0.0,
                        unit: None,
                    })
                    .collect(),
            })
            .collect();
        Ok(Self::new(MessageDatabase::from_messages(messages)?))
    }

    /// Drive `target` from the current values after every write.
    pub fn with_rule<F>(mut self, target: SignalRef, rule: F) -> Self
    where
        F: Fn(&SignalValues<'_>) -> Option<f64> + Send + Sync + 'static,
    {
        self.rules.push((target, Box::new(rule)));
        self
    }

    /// Force a signal to a fixed value; rules no longer drive it.
    pub fn pin(&self, signal: SignalRef, value: f64) {
        let mut state = self.state.lock();
        state.set(&signal, value);
        state.pinned.insert(signal);
        self.apply_rules(&mut state);
    }

    /// Release a pinned signal back to its rule (or to its last value).
    pub fn unpin(&self, signal: &SignalRef) {
        let mut state = self.state.lock();
        state.pinned.remove(signal);
        self.apply_rules(&mut state);
    }

    /// Simulate a dropped adapter; every later write fails.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Every signal write, in order.
    pub fn write_log(&self) -> Vec<(SignalRef, f64)> {
        self.state.lock().writes.clone()
    }

    /// Current value of a signal.
    pub fn value(&self, message_id: u32, signal: &str) -> Option<f64> {
        self.state
            .lock()
            .values
            .get(&message_id)
            .and_then(|m| m.get(signal))
            .map(|s| s.value)
    }

    pub(crate) fn with_values<R>(&self, f: impl FnOnce(&SignalValues<'_>) -> R) -> R {
        let state = self.state.lock();
        f(&SignalValues {
            values: &state.values,
        })
    }

    fn apply_rules(&self, state: &mut DutState) {
        for (target, rule) in &self.rules {
            if state.pinned.contains(target) {
                continue;
            }
            let computed = rule(&SignalValues {
                values: &state.values,
            });
            if let Some(value) = computed {
                state.set(target, value);
            }
        }
    }

    fn ensure_connected(&self) -> EolResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EolError::Unreachable("simulated DUT disconnected".into()))
        }
    }
}

#[async_trait]
impl SignalTransport for SimulatedDut {
    async fn send(&self, frame: CanFrame) -> EolResult<()> {
        self.ensure_connected()?;
        if !self.database.contains(frame.id) {
            trace!(id = frame.id, "Simulated DUT ignoring unknown frame");
            return Ok(());
        }
        let decoded = self.database.decode(&frame)?;
        let mut state = self.state.lock();
        for (name, value) in decoded {
            let signal = SignalRef::new(frame.id, name);
            state.set(&signal, value);
            state.writes.push((signal, value));
        }
        self.apply_rules(&mut state);
        Ok(())
    }

    async fn write_signals(&self, message_id: u32, values: &[(&str, f64)]) -> EolResult<()> {
        self.ensure_connected()?;
        for (name, _) in values {
            if self.database.find(message_id, name).is_none() {
                return Err(EolError::UnknownSignal {
                    message_id,
                    signal: (*name).to_string(),
                });
            }
        }
        let mut state = self.state.lock();
        for (name, value) in values {
            let signal = SignalRef::new(message_id, *name);
            if !state.pinned.contains(&signal) {
                state.set(&signal, *value);
            }
            state.writes.push((signal, *value));
        }
        self.apply_rules(&mut state);
        debug!(message_id, count = values.len(), "Simulated write");
        Ok(())
    }

    /// The simulated DUT broadcasts its state continuously, so every value reads as just received.
    fn latest_value(&self, message_id: u32, signal: &str) -> Option<SignalSample> {
        self.state
            .lock()
            .values
            .get(&message_id)
            .and_then(|m| m.get(signal))
            .map(|s| SignalSample {
                value: s.value,
                timestamp: Utc::now(),
            })
    }

    fn find_message_and_signal(
        &self,
        message_id: u32,
        signal: &str,
    ) -> Option<(&MessageDef, &SignalDef)> {
        self.database.find(message_id, signal)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Number of samples returned per simulated acquisition.
const SCOPE_BATCH: usize = 16;

/// Oscilloscope whose channels are computed from a [`SimulatedDut`]'s values.
pub struct SimulatedScope {
    dut: Arc<SimulatedDut>,
    channels: HashMap<u8, ChannelModel>,
    applied: Mutex<Option<ScopeConfig>>,
    connected: AtomicBool,
}

impl SimulatedScope {
    /// Scope probing `dut`, with no channels wired.
    pub fn new(dut: Arc<SimulatedDut>) -> Self {
        Self {
            dut,
            channels: HashMap::new(),
            applied: Mutex::new(None),
            connected: AtomicBool::new(true),
        }
    }

    /// Wire `channel` to a function of the DUT's values. A NaN result models an invalid reading.
    pub fn with_channel<F>(mut self, channel: u8, model: F) -> Self
    where
        F: Fn(&SignalValues<'_>) -> f64 + Send + Sync + 'static,
    {
        self.channels.insert(channel, Box::new(model));
        self
    }

    /// Last configuration accepted by `apply_configuration`.
    pub fn applied_configuration(&self) -> Option<ScopeConfig> {
        self.applied.lock().clone()
    }

    /// Simulate a lost instrument session.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl InstrumentTransport for SimulatedScope {
    async fn apply_configuration(&self, config: &ScopeConfig) -> Result<(), Vec<EolError>> {
        if !self.is_connected() {
            return Err(vec![EolError::Unreachable(
                "simulated scope disconnected".into(),
            )]);
        }
        config.validate()?;
        *self.applied.lock() = Some(config.clone());
        Ok(())
    }

    async fn query(&self, channel: u8) -> EolResult<Vec<f64>> {
        if !self.is_connected() {
            return Err(EolError::Unreachable("simulated scope disconnected".into()));
        }
        let model = self
            .channels
            .get(&channel)
            .ok_or_else(|| EolError::Instrument(format!("channel {channel} not wired")))?;
        let level = self.dut.with_values(|values| model(values));
        Ok(vec![level; SCOPE_BATCH])
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
