//! CAN message database.
//!
//! Message and signal layouts are supplied externally (typically exported from a DBC file)
//! and loaded from TOML:
//!
//! ```toml
//! [[messages]]
//! id = 0x10
//! name = "EOL_Command"
//! dlc = 8
//!
//! [[messages.signals]]
//! name = "Relay"
//! start_bit = 0
//! length = 1
//!
//! [[messages.signals]]
//! name = "DacCmd"
//! start_bit = 8
//! length = 16
//! factor = 0.1
//! byte_order = "little_endian"
//! ```
//!
//! Bit numbering follows DBC conventions: Intel (little endian) signals give the position of
//! their least significant bit, Motorola (big endian) signals the position of their most
//! significant bit in the sawtooth layout.

use super::CanFrame;
use crate::error::{EolError, EolResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// Bit layout of a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    /// Intel layout; `start_bit` is the LSB
    #[default]
    LittleEndian,
    /// Motorola layout; `start_bit` is the MSB
    BigEndian,
}

/// Definition of one signal inside a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalDef {
    /// Signal name
    pub name: String,
    /// DBC start bit
    pub start_bit: u16,
    /// Width in bits (1..=64)
    pub length: u8,
    /// Bit layout
    #[serde(default)]
    pub byte_order: ByteOrder,
    /// Two's complement raw value
    #[serde(default)]
    pub signed: bool,
    /// Physical = raw * factor + offset
    #[serde(default = "default_factor")]
    pub factor: f64,
    /// Physical = raw * factor + offset
    #[serde(default)]
    pub offset: f64,
    /// Engineering unit, informational only
    #[serde(default)]
    pub unit: Option<String>,
}

fn default_factor() -> f64 {
    1.0
}

fn default_dlc() -> u8 {
    8
}

/// Definition of one CAN message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDef {
    /// Arbitration ID
    pub id: u32,
    /// Message name
    pub name: String,
    /// Payload length in bytes
    #[serde(default = "default_dlc")]
    pub dlc: u8,
    /// Signals carried by the message
    #[serde(default)]
    pub signals: Vec<SignalDef>,
}

impl MessageDef {
    /// Find a signal by name.
    pub fn signal(&self, name: &str) -> Option<&SignalDef> {
        self.signals.iter().find(|s| s.name == name)
    }
}

#[derive(Deserialize)]
struct DatabaseFile {
    #[serde(default)]
    messages: Vec<MessageDef>,
}

/// Loaded set of message definitions, keyed by arbitration ID.
#[derive(Debug, Clone, Default)]
pub struct MessageDatabase {
    messages: BTreeMap<u32, MessageDef>,
}

impl MessageDatabase {
    /// Build a database, validating every layout.
    pub fn from_messages(messages: Vec<MessageDef>) -> EolResult<Self> {
        let mut map = BTreeMap::new();
        for message in messages {
            validate_message(&message)?;
            let id = message.id;
            if map.insert(id, message).is_some() {
                return Err(EolError::InvalidInput(format!(
                    "message 0x{id:X} defined twice"
                )));
            }
        }
        Ok(Self { messages: map })
    }

    /// Parse a TOML database.
    pub fn from_toml_str(text: &str) -> EolResult<Self> {
        let file: DatabaseFile = toml::from_str(text)?;
        Self::from_messages(file.messages)
    }

    /// Load a TOML database from disk.
    pub fn load<P: AsRef<Path>>(path: P) -> EolResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let db = Self::from_toml_str(&text)?;
        debug!(
            path = %path.as_ref().display(),
            messages = db.messages.len(),
            "Loaded message database"
        );
        Ok(db)
    }

    /// Number of messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether no messages are defined.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Whether a message ID is defined.
    pub fn contains(&self, message_id: u32) -> bool {
        self.messages.contains_key(&message_id)
    }

    /// Message definition by ID.
    pub fn message(&self, message_id: u32) -> Option<&MessageDef> {
        self.messages.get(&message_id)
    }

    /// Message and signal definitions for a reference.
    pub fn find(&self, message_id: u32, signal: &str) -> Option<(&MessageDef, &SignalDef)> {
        let message = self.messages.get(&message_id)?;
        let def = message.signal(signal)?;
        Some((message, def))
    }

    /// Encode physical values into a frame. Signals not listed are zero.
    pub fn encode<'a, I>(&self, message_id: u32, values: I) -> EolResult<CanFrame>
    where
        I: IntoIterator<Item = (&'a str, f64)>,
    {
        let message = self.messages.get(&message_id).ok_or_else(|| {
            EolError::Decode(format!("no definition for message 0x{message_id:X}"))
        })?;
        let mut data = vec![0u8; message.dlc as usize];
        for (name, value) in values {
            let def = message
                .signal(name)
                .ok_or_else(|| EolError::UnknownSignal {
                    message_id,
                    signal: name.to_string(),
                })?;
            let raw = physical_to_raw(def, value)?;
            insert_bits(def, &mut data, raw)?;
        }
        CanFrame::new(message_id, data)
    }

    /// Decode every signal of a frame into physical values.
    pub fn decode(&self, frame: &CanFrame) -> EolResult<Vec<(String, f64)>> {
        let message = self.messages.get(&frame.id).ok_or_else(|| {
            EolError::Decode(format!("no definition for message 0x{:X}", frame.id))
        })?;
        message
            .signals
            .iter()
            .map(|def| {
                let raw = extract_bits(def, &frame.data)?;
                Ok((def.name.clone(), raw_to_physical(def, raw)))
            })
            .collect()
    }
}

fn validate_message(message: &MessageDef) -> EolResult<()> {
    let bits = message.dlc as u32 * 8;
    for def in &message.signals {
        if def.length == 0 || def.length > 64 {
            return Err(EolError::InvalidInput(format!(
                "signal {} in 0x{:X} has invalid length {}",
                def.name, message.id, def.length
            )));
        }
        if def.factor == 0.0 || !def.factor.is_finite() {
            return Err(EolError::InvalidInput(format!(
                "signal {} in 0x{:X} has zero factor",
                def.name, message.id
            )));
        }
        if bit_positions(def).any(|pos| pos as u32 >= bits) {
            return Err(EolError::InvalidInput(format!(
                "signal {} does not fit in the {}-byte payload of 0x{:X}",
                def.name, message.dlc, message.id
            )));
        }
    }
    Ok(())
}

/// Frame bit positions of a signal, most significant raw bit first.
fn bit_positions(def: &SignalDef) -> impl Iterator<Item = u16> + '_ {
    let len = def.length as u16;
    let mut pos = def.start_bit;
    (0..len).map(move |i| match def.byte_order {
        ByteOrder::LittleEndian => def.start_bit.saturating_add(len - 1 - i),
        ByteOrder::BigEndian => {
            let current = pos;
            pos = if pos % 8 == 0 {
                pos.saturating_add(15)
            } else {
                pos - 1
            };
            current
        }
    })
}

fn extract_bits(def: &SignalDef, data: &[u8]) -> EolResult<u64> {
    let mut raw = 0u64;
    for pos in bit_positions(def) {
        let byte = *data.get(pos as usize / 8).ok_or_else(|| {
            EolError::Decode(format!("frame too short for signal {}", def.name))
        })?;
        raw = (raw << 1) | ((byte >> (pos % 8)) & 1) as u64;
    }
    Ok(raw)
}

fn insert_bits(def: &SignalDef, data: &mut [u8], raw: u64) -> EolResult<()> {
    let len = def.length as u32;
    for (i, pos) in bit_positions(def).enumerate() {
        let bit = (raw >> (len - 1 - i as u32)) & 1;
        let byte = data.get_mut(pos as usize / 8).ok_or_else(|| {
            EolError::Decode(format!("frame too short for signal {}", def.name))
        })?;
        let mask = 1u8 << (pos % 8);
        if bit == 1 {
            *byte |= mask;
        } else {
            *byte &= !mask;
        }
    }
    Ok(())
}

fn raw_to_physical(def: &SignalDef, raw: u64) -> f64 {
    let len = def.length as u32;
    let value = if !def.signed {
        raw as f64
    } else if len == 64 {
        raw as i64 as f64
    } else if (raw >> (len - 1)) & 1 == 1 {
        (raw as i64 - (1i64 << len)) as f64
    } else {
        raw as f64
    };
    value * def.factor + def.offset
}

fn physical_to_raw(def: &SignalDef, value: f64) -> EolResult<u64> {
    if !value.is_finite() {
        return Err(EolError::InvalidInput(format!(
            "cannot encode non-finite value into {}",
            def.name
        )));
    }
    let raw = ((value - def.offset) / def.factor).round();
    let len = def.length as i32;
    let (lo, hi) = if def.signed {
        (-(2f64.powi(len - 1)), 2f64.powi(len - 1) - 1.0)
    } else {
        (0.0, 2f64.powi(len) - 1.0)
    };
    if raw < lo || raw > hi {
        return Err(EolError::InvalidInput(format!(
            "value {value} out of range for signal {} ({}..={} raw)",
            def.name, lo, hi
        )));
    }
    let mask = if def.length == 64 {
        u64::MAX
    } else {
        (1u64 << def.length) - 1
    };
    Ok((raw as i64 as u64) & mask)
}
