//! Element-to-channel conversion
//!
//! Pure transforms between the raw value read from a register element and
//! the value stored in its channel. The scale factor family follows the
//! SunSpec convention: `channel = element * 10^scale_factor`.

use crate::channel::{Value, ValueType};
use crate::error::{Result, VoltaicError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ElementToChannelConverter {
    /// Identity, with lossless type coercion only
    #[default]
    Direct,
    /// `channel = element * 10^n`
    ScaleFactor(i32),
}

pub const SCALE_FACTOR_MINUS_2: ElementToChannelConverter = ElementToChannelConverter::ScaleFactor(-2);
pub const SCALE_FACTOR_MINUS_1: ElementToChannelConverter = ElementToChannelConverter::ScaleFactor(-1);
pub const SCALE_FACTOR_1: ElementToChannelConverter = ElementToChannelConverter::ScaleFactor(1);
pub const SCALE_FACTOR_2: ElementToChannelConverter = ElementToChannelConverter::ScaleFactor(2);
pub const SCALE_FACTOR_3: ElementToChannelConverter = ElementToChannelConverter::ScaleFactor(3);

impl ElementToChannelConverter {
    /// Decode a raw element value into the channel's domain
    pub fn element_to_channel(&self, raw: &Value, target: ValueType) -> Result<Value> {
        match self {
            Self::Direct => raw.coerce(target),
            Self::ScaleFactor(sf) => scale(raw, *sf, target),
        }
    }

    /// Encode a channel value into the element's raw domain
    pub fn channel_to_element(&self, value: &Value, raw_type: ValueType) -> Result<Value> {
        match self {
            Self::Direct => value.coerce(raw_type),
            Self::ScaleFactor(sf) => scale(value, -sf, raw_type),
        }
    }
}

/// Multiply by `10^exponent`, rounding to nearest for integral targets
fn scale(value: &Value, exponent: i32, target: ValueType) -> Result<Value> {
    let unsupported = || {
        VoltaicError::conversion(format!(
            "type {:?} -> {:?} not supported by scale factor converter",
            value.value_type(),
            target
        ))
    };
    if matches!(value, Value::Boolean(_) | Value::String(_))
        || matches!(target, ValueType::Boolean | ValueType::String)
    {
        return Err(unsupported());
    }

    if target.is_integral()
        && let Some(v) = integral(value)
    {
        let scaled = scale_integer(v, exponent)?;
        return Value::Long(scaled).coerce(target);
    }

    let v = value.as_f64().ok_or_else(unsupported)?;
    let scaled = if exponent >= 0 {
        v * 10f64.powi(exponent)
    } else {
        v / 10f64.powi(-exponent)
    };
    if target.is_integral() {
        Value::Double(scaled.round()).coerce(target)
    } else {
        Value::Double(scaled).coerce(target)
    }
}

fn integral(value: &Value) -> Option<i64> {
    match value {
        Value::Short(v) => Some(i64::from(*v)),
        Value::Integer(v) => Some(i64::from(*v)),
        Value::Long(v) => Some(*v),
        _ => None,
    }
}

fn scale_integer(v: i64, exponent: i32) -> Result<i64> {
    let overflow = || VoltaicError::conversion(format!("{} * 10^{} overflows", v, exponent));
    let factor = 10i64
        .checked_pow(exponent.unsigned_abs())
        .ok_or_else(overflow)?;
    if exponent >= 0 {
        v.checked_mul(factor).ok_or_else(overflow)
    } else {
        // round half away from zero
        let q = v / factor;
        let r = v % factor;
        if r.abs() * 2 >= factor {
            Ok(q + v.signum())
        } else {
            Ok(q)
        }
    }
}

/// Value of one bit of a register word
pub fn extract_bit(word: u16, bit: u8) -> bool {
    word & mask(bit) != 0
}

/// Word with one bit set or cleared
pub fn apply_bit(word: u16, bit: u8, value: bool) -> u16 {
    if value {
        word | mask(bit)
    } else {
        word & !mask(bit)
    }
}

fn mask(bit: u8) -> u16 {
    1u16.checked_shl(u32::from(bit)).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_factor_decodes_integers() {
        assert_eq!(
            SCALE_FACTOR_MINUS_1
                .element_to_channel(&Value::Integer(6960), ValueType::Integer)
                .unwrap(),
            Value::Integer(696)
        );
        assert_eq!(
            SCALE_FACTOR_2
                .element_to_channel(&Value::Integer(-15), ValueType::Integer)
                .unwrap(),
            Value::Integer(-1500)
        );
    }

    #[test]
    fn integral_targets_round_to_nearest() {
        let c = SCALE_FACTOR_MINUS_1;
        assert_eq!(
            c.element_to_channel(&Value::Integer(6965), ValueType::Integer).unwrap(),
            Value::Integer(697)
        );
        assert_eq!(
            c.element_to_channel(&Value::Integer(6964), ValueType::Integer).unwrap(),
            Value::Integer(696)
        );
        assert_eq!(
            c.element_to_channel(&Value::Integer(-6965), ValueType::Integer).unwrap(),
            Value::Integer(-697)
        );
    }

    #[test]
    fn scale_factor_to_float_channel() {
        let v = SCALE_FACTOR_MINUS_2
            .element_to_channel(&Value::Integer(9512), ValueType::Double)
            .unwrap();
        assert_eq!(v, Value::Double(95.12));
    }

    #[test]
    fn encode_divides_and_checks_width() {
        assert_eq!(
            SCALE_FACTOR_MINUS_1
                .channel_to_element(&Value::Integer(696), ValueType::Integer)
                .unwrap(),
            Value::Integer(6960)
        );
        assert!(SCALE_FACTOR_3
            .channel_to_element(&Value::Long(i64::MAX), ValueType::Long)
            .is_ok());
        assert!(SCALE_FACTOR_MINUS_2
            .channel_to_element(&Value::Long(i64::MAX / 10), ValueType::Long)
            .is_err());
        assert!(SCALE_FACTOR_MINUS_1
            .channel_to_element(&Value::Long(i64::from(i32::MAX)), ValueType::Integer)
            .is_err());
    }

    #[test]
    fn round_trip_within_rounding() {
        for sf in -2..=3 {
            let c = ElementToChannelConverter::ScaleFactor(sf);
            for x in [-30_000i32, -1234, -1, 0, 1, 7, 999, 32_000] {
                let raw = c.channel_to_element(&Value::Integer(x), ValueType::Long).unwrap();
                let back = c.element_to_channel(&raw, ValueType::Long).unwrap();
                let back = back.as_i64().unwrap();
                let tolerance = if sf > 0 { 10i64.pow(sf as u32) / 2 } else { 0 };
                assert!(
                    (back - i64::from(x)).abs() <= tolerance,
                    "sf={} x={} back={}",
                    sf,
                    x,
                    back
                );
            }
        }
    }

    #[test]
    fn unsupported_combinations_fail() {
        assert!(SCALE_FACTOR_1
            .element_to_channel(&Value::Integer(1), ValueType::Boolean)
            .is_err());
        assert!(SCALE_FACTOR_1
            .element_to_channel(&Value::Boolean(true), ValueType::Integer)
            .is_err());
        assert!(ElementToChannelConverter::Direct
            .element_to_channel(&Value::Integer(70_000), ValueType::Short)
            .is_err());
    }

    #[test]
    fn bit_helpers() {
        assert!(extract_bit(0b100, 2));
        assert!(!extract_bit(0b100, 1));
        assert_eq!(apply_bit(0, 15, true), 0x8000);
        assert_eq!(apply_bit(0xFFFF, 0, false), 0xFFFE);
        assert!(!extract_bit(0xFFFF, 16));
    }
}
