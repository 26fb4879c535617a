//! Display-ready records handed to the presentation layer.

use chrono::{DateTime, Local};
use serde::{Serialize, Serializer};
use std::time::Duration;

use crate::protocol::modbus::{
    to_hex,
    values::{interpret, RegisterReading, ValueFormat},
    CountField, DecodedFrame, MessageKind, EXCEPTION_FLAG,
};

/// Column placeholder for fields that have no meaning for a record.
pub const NOT_APPLICABLE: &str = "-";

/// Stable identity of a record; positions shift as responses are inserted,
/// ids never do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RecordId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimeDisplay {
    /// Wall-clock time the message was seen.
    Absolute { at: DateTime<Local> },
    /// Offset from the request this response answers.
    SinceRequest {
        #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
        elapsed: Duration,
    },
}

fn as_millis<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl std::fmt::Display for TimeDisplay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeDisplay::Absolute { at } => write!(f, "{}", at.format("%H:%M:%S%.3f")),
            TimeDisplay::SinceRequest { elapsed } => write!(f, "+{} ms", elapsed.as_millis()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputRecord {
    pub id: RecordId,
    /// How many times this exact message has been seen.
    pub counter: u32,
    pub time: TimeDisplay,
    pub kind: MessageKind,
    pub address: u8,
    pub function: u8,
    pub first_register: Option<u16>,
    pub count: Option<CountField>,
    pub byte_count_following: Option<u8>,
    pub data: Vec<u8>,
    pub crc: [u8; 2],
    pub crc_valid: bool,
    /// The request a response was correlated with; `None` for requests and
    /// for responses placed without one.
    pub request: Option<RecordId>,
}

impl OutputRecord {
    pub fn from_frame(id: RecordId, kind: MessageKind, frame: &DecodedFrame, time: TimeDisplay) -> Self {
        Self {
            id,
            counter: 1,
            time,
            kind,
            address: frame.address,
            function: frame.function,
            first_register: frame.first_register(),
            count: frame.count(),
            byte_count_following: frame.byte_count_following(),
            data: frame.data().to_vec(),
            crc: frame.received_crc,
            crc_valid: frame.crc_valid,
            request: None,
        }
    }

    pub fn is_exception(&self) -> bool {
        self.function & EXCEPTION_FLAG != 0
    }

    /// Data payload as registers, `formats[i]` applying to register `i`.
    pub fn registers(&self, formats: &[ValueFormat]) -> Vec<RegisterReading> {
        interpret(&self.data, formats)
    }

    /// Column texts in output order, `-` for fields without meaning.
    pub fn columns(&self) -> Vec<String> {
        fn opt<T: ToString>(v: Option<T>) -> String {
            v.map(|v| v.to_string())
                .unwrap_or_else(|| NOT_APPLICABLE.to_string())
        }

        vec![
            self.counter.to_string(),
            self.time.to_string(),
            self.kind.to_string(),
            self.address.to_string(),
            self.function.to_string(),
            opt(self.first_register),
            opt(self.count),
            opt(self.byte_count_following),
            if self.data.is_empty() {
                NOT_APPLICABLE.to_string()
            } else {
                to_hex(&self.data)
            },
            to_hex(&self.crc),
            self.crc_valid.to_string(),
        ]
    }
}

impl std::fmt::Display for OutputRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.columns().join(" | "))
    }
}

/// Visibility predicates applied by consumers of the record stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub crc_ok_only: bool,
    pub errors_only: bool,
}

impl RecordFilter {
    pub fn matches(&self, record: &OutputRecord) -> bool {
        if self.crc_ok_only && !record.crc_valid {
            return false;
        }
        if self.errors_only && !record.is_exception() {
            return false;
        }
        true
    }
}
