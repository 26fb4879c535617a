//! Interpretation of a record's data payload as 16-bit registers.
//!
//! Each register can be shown in its own format. The 32-bit formats span two
//! registers; the second one is then reported as [`RegisterValue::Reserved`].

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::str::FromStr;
use strum::{EnumIter, IntoEnumIterator};

/// Byte order of a 32-bit value spread over two registers, `A` being the most
/// significant byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, Serialize)]
pub enum WordOrder {
    Abcd,
    Cdab,
    Badc,
    Dcba,
}

impl WordOrder {
    /// Bring four wire bytes into big-endian order.
    pub fn reorder(&self, b: [u8; 4]) -> [u8; 4] {
        match self {
            WordOrder::Abcd => b,
            WordOrder::Cdab => [b[2], b[3], b[0], b[1]],
            WordOrder::Badc => [b[1], b[0], b[3], b[2]],
            WordOrder::Dcba => [b[3], b[2], b[1], b[0]],
        }
    }

    fn tag(&self) -> &'static str {
        match self {
            WordOrder::Abcd => "abcd",
            WordOrder::Cdab => "cdab",
            WordOrder::Badc => "badc",
            WordOrder::Dcba => "dcba",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum ValueFormat {
    #[default]
    Signed,
    Unsigned,
    Hex,
    Binary,
    Float(WordOrder),
    Long(WordOrder),
}

impl ValueFormat {
    /// Whether the format consumes two registers.
    pub fn is_wide(&self) -> bool {
        matches!(self, ValueFormat::Float(_) | ValueFormat::Long(_))
    }

    fn render(&self, bytes: &[u8]) -> String {
        match (self, bytes) {
            (ValueFormat::Signed, &[hi, lo]) => i16::from_be_bytes([hi, lo]).to_string(),
            (ValueFormat::Unsigned, &[hi, lo]) => u16::from_be_bytes([hi, lo]).to_string(),
            (ValueFormat::Hex, &[hi, lo]) => format!("0x{:02X}{:02X}", hi, lo),
            (ValueFormat::Binary, &[hi, lo]) => format!("{:08b} {:08b}", hi, lo),
            (ValueFormat::Float(order), &[a, b, c, d]) => {
                format!("{:.6}", f32::from_be_bytes(order.reorder([a, b, c, d])))
            }
            (ValueFormat::Long(order), &[a, b, c, d]) => {
                i32::from_be_bytes(order.reorder([a, b, c, d])).to_string()
            }
            _ => String::from("?"),
        }
    }
}

impl std::fmt::Display for ValueFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueFormat::Signed => write!(f, "signed"),
            ValueFormat::Unsigned => write!(f, "unsigned"),
            ValueFormat::Hex => write!(f, "hex"),
            ValueFormat::Binary => write!(f, "binary"),
            ValueFormat::Float(order) => write!(f, "float-{}", order.tag()),
            ValueFormat::Long(order) => write!(f, "long-{}", order.tag()),
        }
    }
}

impl FromStr for ValueFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "signed" => return Ok(ValueFormat::Signed),
            "unsigned" => return Ok(ValueFormat::Unsigned),
            "hex" => return Ok(ValueFormat::Hex),
            "binary" => return Ok(ValueFormat::Binary),
            _ => {}
        }
        let (kind, order) = s
            .split_once('-')
            .ok_or_else(|| anyhow!("Unknown value format: {s}"))?;
        let order = WordOrder::iter()
            .find(|o| o.tag() == order)
            .ok_or_else(|| anyhow!("Unknown word order: {order}"))?;
        match kind {
            "float" => Ok(ValueFormat::Float(order)),
            "long" => Ok(ValueFormat::Long(order)),
            _ => Err(anyhow!("Unknown value format: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "text", rename_all = "snake_case")]
pub enum RegisterValue {
    Value(String),
    /// Second half of a 32-bit value started at the previous register.
    Reserved,
    Insufficient,
}

impl std::fmt::Display for RegisterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegisterValue::Value(text) => write!(f, "{text}"),
            RegisterValue::Reserved => write!(f, ".."),
            RegisterValue::Insufficient => write!(f, "?"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegisterReading {
    pub index: usize,
    pub format: ValueFormat,
    pub value: RegisterValue,
}

/// Interpret `data` as registers. `formats[i]` selects the format of register
/// `i`; registers without an entry default to [`ValueFormat::Signed`].
pub fn interpret(data: &[u8], formats: &[ValueFormat]) -> Vec<RegisterReading> {
    let count = data.len() / 2;
    let mut readings = Vec::with_capacity(count);
    let mut reserved = false;

    for index in 0..count {
        if reserved {
            reserved = false;
            readings.push(RegisterReading {
                index,
                format: ValueFormat::Signed,
                value: RegisterValue::Reserved,
            });
            continue;
        }

        let format = formats.get(index).copied().unwrap_or_default();
        let width = if format.is_wide() { 4 } else { 2 };
        let start = index * 2;
        let value = match data.get(start..start + width) {
            Some(bytes) => RegisterValue::Value(format.render(bytes)),
            None => RegisterValue::Insufficient,
        };
        reserved = format.is_wide();
        readings.push(RegisterReading {
            index,
            format,
            value,
        });
    }

    readings
}
