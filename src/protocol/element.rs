//! Register elements: typed slices of a task's register range bound to channels

use super::converter::{ElementToChannelConverter, apply_bit, extract_bit};
use crate::channel::{Channel, Value, ValueType};
use crate::error::{Result, VoltaicError};
use std::sync::Arc;

/// Raw layout of an element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    UnsignedWord,
    SignedWord,
    /// Big-endian word order
    UnsignedDoubleword,
    SignedDoubleword,
    FloatDoubleword,
    /// One word whose bits drive individual boolean channels
    BitsWord,
    /// Placeholder covering unused registers; decoded and discarded
    Dummy { length: u16 },
}

impl ElementKind {
    /// Number of registers covered
    pub const fn length(self) -> u16 {
        match self {
            Self::UnsignedWord | Self::SignedWord | Self::BitsWord => 1,
            Self::UnsignedDoubleword | Self::SignedDoubleword | Self::FloatDoubleword => 2,
            Self::Dummy { length } => length,
        }
    }

    /// Domain of the decoded raw value
    pub const fn raw_type(self) -> Option<ValueType> {
        match self {
            Self::UnsignedWord | Self::SignedWord | Self::BitsWord => Some(ValueType::Integer),
            Self::UnsignedDoubleword | Self::SignedDoubleword => Some(ValueType::Long),
            Self::FloatDoubleword => Some(ValueType::Float),
            Self::Dummy { .. } => None,
        }
    }

    /// Decode the element's registers into its raw value
    pub fn decode(self, words: &[u16]) -> Result<Option<Value>> {
        if words.len() < usize::from(self.length()) {
            return Err(VoltaicError::communication(format!(
                "{:?} needs {} registers, got {}",
                self,
                self.length(),
                words.len()
            )));
        }
        let value = match self {
            Self::UnsignedWord | Self::BitsWord => Value::Integer(i32::from(words[0])),
            Self::SignedWord => Value::Integer(i32::from(words[0] as i16)),
            Self::UnsignedDoubleword => Value::Long(i64::from(join(words[0], words[1]))),
            Self::SignedDoubleword => Value::Long(i64::from(join(words[0], words[1]) as i32)),
            Self::FloatDoubleword => Value::Float(decode_32bit_float(words[0], words[1])),
            Self::Dummy { .. } => return Ok(None),
        };
        Ok(Some(value))
    }

    /// Encode a raw value into registers; values outside the raw width fail
    pub fn encode(self, value: &Value) -> Result<Vec<u16>> {
        let overflow = || {
            VoltaicError::conversion(format!("value {} does not fit into {:?}", value, self))
        };
        match self {
            Self::UnsignedWord | Self::BitsWord => {
                let v = value.as_i64().ok_or_else(overflow)?;
                Ok(vec![u16::try_from(v).map_err(|_| overflow())?])
            }
            Self::SignedWord => {
                let v = value.as_i64().ok_or_else(overflow)?;
                Ok(vec![i16::try_from(v).map_err(|_| overflow())? as u16])
            }
            Self::UnsignedDoubleword => {
                let v = value.as_i64().ok_or_else(overflow)?;
                Ok(split(u32::try_from(v).map_err(|_| overflow())?).to_vec())
            }
            Self::SignedDoubleword => {
                let v = value.as_i64().ok_or_else(overflow)?;
                Ok(split(i32::try_from(v).map_err(|_| overflow())? as u32).to_vec())
            }
            Self::FloatDoubleword => {
                let v = value.as_f64().ok_or_else(overflow)?;
                Ok(encode_32bit_float(v as f32).to_vec())
            }
            Self::Dummy { .. } => Err(VoltaicError::conversion("dummy elements are never written")),
        }
    }
}

const fn join(high: u16, low: u16) -> u32 {
    ((high as u32) << 16) | low as u32
}

const fn split(v: u32) -> [u16; 2] {
    [(v >> 16) as u16, (v & 0xFFFF) as u16]
}

/// Decode 32-bit float from two 16-bit registers (big-endian)
pub fn decode_32bit_float(high: u16, low: u16) -> f32 {
    f32::from_bits(join(high, low))
}

/// Encode 32-bit float to two 16-bit registers (big-endian)
pub fn encode_32bit_float(value: f32) -> [u16; 2] {
    split(value.to_bits())
}

/// What an element writes its decoded value into
#[derive(Debug, Clone)]
enum Binding {
    None,
    Channel {
        channel: Arc<Channel>,
        converter: ElementToChannelConverter,
    },
    Bits(Vec<(u8, Arc<Channel>)>),
}

/// A register element at a fixed address, bound to its channel(s)
#[derive(Debug, Clone)]
pub struct RegisterElement {
    address: u16,
    kind: ElementKind,
    binding: Binding,
}

impl RegisterElement {
    fn new(address: u16, kind: ElementKind) -> Self {
        Self {
            address,
            kind,
            binding: Binding::None,
        }
    }

    pub fn unsigned_word(address: u16) -> Self {
        Self::new(address, ElementKind::UnsignedWord)
    }

    pub fn signed_word(address: u16) -> Self {
        Self::new(address, ElementKind::SignedWord)
    }

    pub fn unsigned_doubleword(address: u16) -> Self {
        Self::new(address, ElementKind::UnsignedDoubleword)
    }

    pub fn signed_doubleword(address: u16) -> Self {
        Self::new(address, ElementKind::SignedDoubleword)
    }

    pub fn float_doubleword(address: u16) -> Self {
        Self::new(address, ElementKind::FloatDoubleword)
    }

    pub fn bits_word(address: u16) -> Self {
        Self {
            address,
            kind: ElementKind::BitsWord,
            binding: Binding::Bits(Vec::new()),
        }
    }

    /// Placeholder for the inclusive register range `first..=last`
    pub fn dummy(first: u16, last: u16) -> Self {
        let length = last.saturating_sub(first).saturating_add(1);
        Self::new(first, ElementKind::Dummy { length })
    }

    /// Bind to a channel without conversion
    pub fn to(self, channel: &Arc<Channel>) -> Self {
        self.to_converted(channel, ElementToChannelConverter::Direct)
    }

    /// Bind to a channel through a converter
    pub fn to_converted(mut self, channel: &Arc<Channel>, converter: ElementToChannelConverter) -> Self {
        self.binding = Binding::Channel {
            channel: Arc::clone(channel),
            converter,
        };
        self
    }

    /// Map one bit of a bits word to a boolean channel
    pub fn bit(mut self, bit: u8, channel: &Arc<Channel>) -> Self {
        if let Binding::Bits(bits) = &mut self.binding {
            bits.push((bit, Arc::clone(channel)));
        }
        self
    }

    pub const fn address(&self) -> u16 {
        self.address
    }

    pub const fn kind(&self) -> ElementKind {
        self.kind
    }

    pub const fn length(&self) -> u16 {
        self.kind.length()
    }

    /// One past the last covered register
    pub fn end(&self) -> u32 {
        u32::from(self.address) + u32::from(self.length())
    }

    pub const fn is_dummy(&self) -> bool {
        matches!(self.kind, ElementKind::Dummy { .. })
    }

    /// Channels fed by this element
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        match &self.binding {
            Binding::None => Vec::new(),
            Binding::Channel { channel, .. } => vec![Arc::clone(channel)],
            Binding::Bits(bits) => bits.iter().map(|(_, c)| Arc::clone(c)).collect(),
        }
    }

    /// Structural checks run when the element is placed into a task
    pub fn validate(&self) -> Result<()> {
        if self.length() == 0 {
            return Err(VoltaicError::configuration(format!(
                "element at {:#06x} covers no registers",
                self.address
            )));
        }
        if self.end() > u32::from(u16::MAX) + 1 {
            return Err(VoltaicError::configuration(format!(
                "element at {:#06x} exceeds the register address space",
                self.address
            )));
        }
        if let Binding::Bits(bits) = &self.binding {
            let mut seen = 0u32;
            for (bit, channel) in bits {
                if *bit > 15 {
                    return Err(VoltaicError::configuration(format!(
                        "bit {} of word {:#06x} is out of range",
                        bit, self.address
                    )));
                }
                if seen & (1 << bit) != 0 {
                    return Err(VoltaicError::configuration(format!(
                        "bit {} of word {:#06x} mapped twice",
                        bit, self.address
                    )));
                }
                seen |= 1 << bit;
                if channel.doc().value_type != ValueType::Boolean {
                    return Err(VoltaicError::configuration(format!(
                        "bit channel {} must be boolean",
                        channel.address()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Decode this element's registers and stage the result in its channel(s)
    pub fn apply_response(&self, words: &[u16]) -> Result<()> {
        match &self.binding {
            Binding::None => {
                self.kind.decode(words)?;
                Ok(())
            }
            Binding::Channel { channel, converter } => {
                let Some(raw) = self.kind.decode(words)? else {
                    return Ok(());
                };
                let value = converter.element_to_channel(&raw, channel.doc().value_type)?;
                channel.set_next_value(value)
            }
            Binding::Bits(bits) => {
                let word = words.first().copied().ok_or_else(|| {
                    VoltaicError::communication(format!("missing word {:#06x}", self.address))
                })?;
                for (bit, channel) in bits {
                    channel.set_next_value(extract_bit(word, *bit))?;
                }
                Ok(())
            }
        }
    }

    pub fn has_pending_write(&self) -> bool {
        self.channels().iter().any(|c| c.has_pending_write())
    }

    /// Drain pending write values and encode them.
    ///
    /// Returns `None` when nothing is pending. Pending values are consumed
    /// even when encoding fails, so a bad value is never retried. For bits
    /// words the unwritten bits keep their committed values.
    pub fn take_write_words(&self) -> Result<Option<Vec<u16>>> {
        match &self.binding {
            Binding::None => Ok(None),
            Binding::Channel { channel, converter } => {
                let Some(value) = channel.take_next_write_value() else {
                    return Ok(None);
                };
                let raw_type = self.kind.raw_type().ok_or_else(|| {
                    VoltaicError::conversion("dummy elements are never written")
                })?;
                let raw = converter.channel_to_element(&value, raw_type)?;
                self.kind.encode(&raw).map(Some)
            }
            Binding::Bits(bits) => {
                let mut word = 0u16;
                let mut any = false;
                for (bit, channel) in bits {
                    let value = match channel.take_next_write_value() {
                        Some(v) => {
                            any = true;
                            v.as_bool().unwrap_or(false)
                        }
                        None => channel.is_true(),
                    };
                    word = apply_bit(word, *bit, value);
                }
                Ok(any.then(|| vec![word]))
            }
        }
    }
}
