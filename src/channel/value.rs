//! Typed channel values, units and option sets

use crate::error::{Result, VoltaicError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Declared value domain of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Boolean,
    Short,
    Integer,
    Long,
    Float,
    Double,
    String,
}

impl ValueType {
    /// Whether this is one of the integral domains
    pub const fn is_integral(self) -> bool {
        matches!(self, Self::Short | Self::Integer | Self::Long)
    }
}

/// A single channel value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Boolean(bool),
    Short(i16),
    Integer(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
}

impl Value {
    /// The domain this value belongs to
    pub const fn value_type(&self) -> ValueType {
        match self {
            Self::Boolean(_) => ValueType::Boolean,
            Self::Short(_) => ValueType::Short,
            Self::Integer(_) => ValueType::Integer,
            Self::Long(_) => ValueType::Long,
            Self::Float(_) => ValueType::Float,
            Self::Double(_) => ValueType::Double,
            Self::String(_) => ValueType::String,
        }
    }

    /// Integral view of the value; booleans map to 0/1, floats only if integral
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Boolean(b) => Some(i64::from(*b)),
            Self::Short(v) => Some(i64::from(*v)),
            Self::Integer(v) => Some(i64::from(*v)),
            Self::Long(v) => Some(*v),
            Self::Float(v) => integral_f64(f64::from(*v)),
            Self::Double(v) => integral_f64(*v),
            Self::String(_) => None,
        }
    }

    /// Floating point view of any numeric value
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Short(v) => Some(f64::from(*v)),
            Self::Integer(v) => Some(f64::from(*v)),
            Self::Long(v) => Some(*v as f64),
            Self::Float(v) => Some(f64::from(*v)),
            Self::Double(v) => Some(*v),
            Self::Boolean(_) | Self::String(_) => None,
        }
    }

    /// Boolean view; integers 0 and 1 are accepted
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            Self::Short(_) | Self::Integer(_) | Self::Long(_) => match self.as_i64() {
                Some(0) => Some(false),
                Some(1) => Some(true),
                _ => None,
            },
            _ => None,
        }
    }

    /// Losslessly convert into the given domain.
    ///
    /// Integer narrowing is range checked, floats convert to integers only
    /// when they carry no fractional part. Anything else is a conversion
    /// error; nothing is truncated silently.
    pub fn coerce(&self, target: ValueType) -> Result<Self> {
        if self.value_type() == target {
            return Ok(self.clone());
        }
        let mismatch = || {
            VoltaicError::conversion(format!(
                "cannot convert {:?} value {} to {:?}",
                self.value_type(),
                self,
                target
            ))
        };
        match target {
            ValueType::Boolean => self.as_bool().map(Self::Boolean).ok_or_else(mismatch),
            ValueType::Short => {
                let v = self.as_i64().ok_or_else(mismatch)?;
                i16::try_from(v).map(Self::Short).map_err(|_| mismatch())
            }
            ValueType::Integer => {
                let v = self.as_i64().ok_or_else(mismatch)?;
                i32::try_from(v).map(Self::Integer).map_err(|_| mismatch())
            }
            ValueType::Long => self.as_i64().map(Self::Long).ok_or_else(mismatch),
            ValueType::Float => match self {
                Self::Boolean(_) | Self::String(_) => Err(mismatch()),
                _ => self.as_f64().map(|v| Self::Float(v as f32)).ok_or_else(mismatch),
            },
            ValueType::Double => match self {
                Self::Boolean(_) | Self::String(_) => Err(mismatch()),
                _ => self.as_f64().map(Self::Double).ok_or_else(mismatch),
            },
            ValueType::String => Err(mismatch()),
        }
    }

    /// Parse a JSON value into the given domain
    pub fn from_json(json: &serde_json::Value, target: ValueType) -> Result<Self> {
        let raw = match json {
            serde_json::Value::Bool(b) => Self::Boolean(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Long(i)
                } else if let Some(f) = n.as_f64() {
                    Self::Double(f)
                } else {
                    return Err(VoltaicError::conversion(format!(
                        "number {} out of range",
                        n
                    )));
                }
            }
            serde_json::Value::String(s) => Self::String(s.clone()),
            other => {
                return Err(VoltaicError::conversion(format!(
                    "unsupported JSON value {}",
                    other
                )));
            }
        };
        raw.coerce(target)
    }
}

fn integral_f64(v: f64) -> Option<i64> {
    if v.is_finite() && v.fract() == 0.0 && v >= i64::MIN as f64 && v <= i64::MAX as f64 {
        Some(v as i64)
    } else {
        None
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boolean(v) => write!(f, "{}", v),
            Self::Short(v) => write!(f, "{}", v),
            Self::Integer(v) => write!(f, "{}", v),
            Self::Long(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::Double(v) => write!(f, "{}", v),
            Self::String(v) => write!(f, "{}", v),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Self::Short(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Integer(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Long(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Self::Float(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

/// Physical unit of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    None,
    Volt,
    Millivolt,
    Ampere,
    Milliampere,
    Watt,
    VoltAmpere,
    VoltAmpereReactive,
    Percent,
    DegreeCelsius,
    Kiloohm,
    Hertz,
    WattHours,
    AmpereHours,
}

impl Unit {
    /// Display symbol
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Volt => "V",
            Self::Millivolt => "mV",
            Self::Ampere => "A",
            Self::Milliampere => "mA",
            Self::Watt => "W",
            Self::VoltAmpere => "VA",
            Self::VoltAmpereReactive => "var",
            Self::Percent => "%",
            Self::DegreeCelsius => "C",
            Self::Kiloohm => "kOhm",
            Self::Hertz => "Hz",
            Self::WattHours => "Wh",
            Self::AmpereHours => "Ah",
        }
    }
}

/// Option set of an enum-like channel (raw value, display name)
pub type Options = &'static [(i32, &'static str)];

/// Device enums stored in integer channels
pub trait OptionsEnum: Copy + PartialEq + 'static {
    /// All options including the undefined one
    const OPTIONS: Options;

    fn value(self) -> i32;

    fn name(self) -> &'static str;

    fn undefined() -> Self;

    fn all() -> &'static [Self];

    /// Map a raw channel value back to an option; unknown or absent values
    /// map to [`OptionsEnum::undefined`]
    fn from_value(value: Option<&Value>) -> Self {
        let raw = value.and_then(Value::as_i64);
        Self::all()
            .iter()
            .copied()
            .find(|o| raw == Some(i64::from(o.value())))
            .unwrap_or_else(Self::undefined)
    }
}
