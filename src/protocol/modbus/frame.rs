use chrono::{DateTime, Local};
use serde::Serialize;
use std::time::Instant;
use thiserror::Error;

use super::{crc::crc16_modbus_bytes, exception::describe_exception};

/// Address + function + two CRC bytes.
pub const MIN_FRAME_LEN: usize = 4;

pub const EXCEPTION_FLAG: u8 = 0x80;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame too short: {len} bytes, at least {MIN_FRAME_LEN} required")]
    TooShort { len: usize },
}

/// Direction of a message on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Request,
    Response,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::Request => write!(f, "Request"),
            MessageKind::Response => write!(f, "Response"),
        }
    }
}

/// What a single frame tells us about its direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Known(MessageKind),
    /// Write-single request and response are byte-identical, only the
    /// correlator can tell them apart.
    Deferred,
}

/// The family-specific layout of a frame payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameBody {
    Exception {
        code: Option<u8>,
        extra: Vec<u8>,
    },
    ReadRequest {
        start: u16,
        quantity: u16,
        trailing: Vec<u8>,
    },
    ReadResponse {
        byte_count: u8,
        data: Vec<u8>,
    },
    WriteSingle {
        register: u16,
        value: [u8; 2],
    },
    WriteMultipleRequest {
        start: u16,
        quantity: u16,
        byte_count: u8,
        values: Vec<u8>,
    },
    WriteMultipleResponse {
        start: u16,
        quantity: u16,
    },
    /// Unknown function codes and payloads too short for their family.
    Opaque { data: Vec<u8> },
}

/// Register/byte count column, or the exception text in its place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CountField {
    Registers(u16),
    Bytes(u8),
    Exception(&'static str),
}

impl std::fmt::Display for CountField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CountField::Registers(n) => write!(f, "{n}"),
            CountField::Bytes(n) => write!(f, "{n}"),
            CountField::Exception(text) => write!(f, "{text}"),
        }
    }
}

/// `(address, base function)`; groups requests and responses of one family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationKey {
    pub address: u8,
    pub base_function: u8,
}

/// Identity of a response for duplicate detection; excludes counter, time
/// and data payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageSignature {
    pub address: u8,
    pub function: u8,
    pub first_register: Option<u16>,
    pub count: Option<CountField>,
    pub byte_count_following: Option<u8>,
    pub crc: [u8; 2],
}

/// A frame parsed off the wire. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub address: u8,
    pub function: u8,
    pub received_crc: [u8; 2],
    pub crc_valid: bool,
    pub body: FrameBody,
    pub classification: Classification,
    pub received_at: Instant,
    pub captured_at: DateTime<Local>,
    raw: Vec<u8>,
}

impl DecodedFrame {
    /// Parse raw frame bytes. Frames shorter than [`MIN_FRAME_LEN`] are rejected.
    pub fn parse(raw: &[u8], received_at: Instant) -> Result<Self, FrameError> {
        if raw.len() < MIN_FRAME_LEN {
            return Err(FrameError::TooShort { len: raw.len() });
        }

        let address = raw[0];
        let function = raw[1];
        let crc_at = raw.len() - 2;
        let payload = &raw[2..crc_at];
        let received_crc = [raw[crc_at], raw[crc_at + 1]];
        let crc_valid = crc16_modbus_bytes(&raw[..crc_at]) == received_crc;

        let body = parse_body(function, payload);
        let classification = classify(function, &body);

        Ok(Self {
            address,
            function,
            received_crc,
            crc_valid,
            body,
            classification,
            received_at,
            captured_at: Local::now(),
            raw: raw.to_vec(),
        })
    }

    pub fn base_function(&self) -> u8 {
        self.function & !EXCEPTION_FLAG
    }

    pub fn is_exception(&self) -> bool {
        self.function & EXCEPTION_FLAG != 0
    }

    /// Bytes between the function code and the CRC.
    pub fn payload(&self) -> &[u8] {
        &self.raw[2..self.raw.len() - 2]
    }

    /// The complete frame exactly as received.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn correlation_key(&self) -> CorrelationKey {
        CorrelationKey {
            address: self.address,
            base_function: self.base_function(),
        }
    }

    pub fn first_register(&self) -> Option<u16> {
        match &self.body {
            FrameBody::ReadRequest { start, .. }
            | FrameBody::WriteMultipleRequest { start, .. }
            | FrameBody::WriteMultipleResponse { start, .. } => Some(*start),
            FrameBody::WriteSingle { register, .. } => Some(*register),
            _ => None,
        }
    }

    pub fn count(&self) -> Option<CountField> {
        match &self.body {
            FrameBody::Exception { code, .. } => Some(CountField::Exception(describe_exception(*code))),
            FrameBody::ReadRequest { quantity, .. }
            | FrameBody::WriteMultipleRequest { quantity, .. }
            | FrameBody::WriteMultipleResponse { quantity, .. } => {
                Some(CountField::Registers(*quantity))
            }
            FrameBody::ReadResponse { byte_count, .. } => Some(CountField::Bytes(*byte_count)),
            FrameBody::WriteSingle { .. } | FrameBody::Opaque { .. } => None,
        }
    }

    pub fn byte_count_following(&self) -> Option<u8> {
        match &self.body {
            FrameBody::WriteMultipleRequest { byte_count, .. } => Some(*byte_count),
            _ => None,
        }
    }

    /// Value/data slice of the frame.
    pub fn data(&self) -> &[u8] {
        match &self.body {
            FrameBody::Exception { extra, .. } => extra.as_slice(),
            FrameBody::ReadRequest { trailing, .. } => trailing.as_slice(),
            FrameBody::ReadResponse { data, .. } => data.as_slice(),
            FrameBody::WriteSingle { value, .. } => value.as_slice(),
            FrameBody::WriteMultipleRequest { values, .. } => values.as_slice(),
            FrameBody::WriteMultipleResponse { .. } => &[],
            FrameBody::Opaque { data } => data.as_slice(),
        }
    }

    pub fn signature(&self) -> MessageSignature {
        MessageSignature {
            address: self.address,
            function: self.function,
            first_register: self.first_register(),
            count: self.count(),
            byte_count_following: self.byte_count_following(),
            crc: self.received_crc,
        }
    }

    pub fn hex(&self) -> String {
        to_hex(&self.raw)
    }
}

/// Decode a candidate frame; see [`DecodedFrame::parse`].
pub fn decode(raw: &[u8], received_at: Instant) -> Result<DecodedFrame, FrameError> {
    DecodedFrame::parse(raw, received_at)
}

pub fn to_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

fn be16(hi: u8, lo: u8) -> u16 {
    u16::from_be_bytes([hi, lo])
}

fn parse_body(function: u8, payload: &[u8]) -> FrameBody {
    if function & EXCEPTION_FLAG != 0 {
        return FrameBody::Exception {
            code: payload.first().copied(),
            extra: payload.get(1..).unwrap_or_default().to_vec(),
        };
    }

    match function {
        0x01..=0x04 => {
            if !payload.is_empty() && payload.len() == 1 + payload[0] as usize {
                FrameBody::ReadResponse {
                    byte_count: payload[0],
                    data: payload[1..].to_vec(),
                }
            } else if payload.len() >= 4 {
                FrameBody::ReadRequest {
                    start: be16(payload[0], payload[1]),
                    quantity: be16(payload[2], payload[3]),
                    trailing: payload[4..].to_vec(),
                }
            } else {
                FrameBody::Opaque {
                    data: payload.to_vec(),
                }
            }
        }
        0x05 | 0x06 if payload.len() == 4 => FrameBody::WriteSingle {
            register: be16(payload[0], payload[1]),
            value: [payload[2], payload[3]],
        },
        0x0F | 0x10 if payload.len() == 4 => FrameBody::WriteMultipleResponse {
            start: be16(payload[0], payload[1]),
            quantity: be16(payload[2], payload[3]),
        },
        0x0F | 0x10 if payload.len() >= 5 => FrameBody::WriteMultipleRequest {
            start: be16(payload[0], payload[1]),
            quantity: be16(payload[2], payload[3]),
            byte_count: payload[4],
            values: payload[5..].to_vec(),
        },
        _ => FrameBody::Opaque {
            data: payload.to_vec(),
        },
    }
}

fn classify(function: u8, body: &FrameBody) -> Classification {
    if function & EXCEPTION_FLAG != 0 {
        return Classification::Known(MessageKind::Response);
    }
    match (function, body) {
        (0x05 | 0x06, _) => Classification::Deferred,
        (_, FrameBody::ReadResponse { .. } | FrameBody::WriteMultipleResponse { .. }) => {
            Classification::Known(MessageKind::Response)
        }
        _ => Classification::Known(MessageKind::Request),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::modbus::crc::with_crc;

    fn parse(body: &[u8]) -> DecodedFrame {
        DecodedFrame::parse(&with_crc(body), Instant::now()).unwrap()
    }

    #[test]
    fn test_rejects_short_frames() {
        let err = DecodedFrame::parse(&[0x01, 0x03, 0x00], Instant::now()).unwrap_err();
        assert_eq!(err, FrameError::TooShort { len: 3 });
    }

    #[test]
    fn test_read_request_classification() {
        let frame = parse(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]);
        assert!(frame.crc_valid);
        assert_eq!(frame.classification, Classification::Known(MessageKind::Request));
        assert_eq!(frame.first_register(), Some(0));
        assert_eq!(frame.count(), Some(CountField::Registers(1)));
        assert_eq!(frame.byte_count_following(), None);
        assert!(frame.data().is_empty());
    }

    #[test]
    fn test_read_response_classification() {
        let frame = parse(&[0x01, 0x03, 0x02, 0x00, 0x0A]);
        assert_eq!(frame.classification, Classification::Known(MessageKind::Response));
        assert_eq!(frame.first_register(), None);
        assert_eq!(frame.count(), Some(CountField::Bytes(2)));
        assert_eq!(frame.data(), &[0x00, 0x0A]);
    }

    #[test]
    fn test_short_read_payload_is_request() {
        let frame = parse(&[0x11, 0x04, 0x05]);
        assert_eq!(frame.classification, Classification::Known(MessageKind::Request));
        assert_eq!(frame.body, FrameBody::Opaque { data: vec![0x05] });
    }

    #[test]
    fn test_write_single_is_deferred() {
        let frame = parse(&[0x01, 0x06, 0x00, 0x01, 0x00, 0x05]);
        assert_eq!(frame.classification, Classification::Deferred);
        assert_eq!(frame.first_register(), Some(1));
        assert_eq!(frame.count(), None);
        assert_eq!(frame.data(), &[0x00, 0x05]);
    }

    #[test]
    fn test_write_multiple_request_and_response() {
        let req = parse(&[0x01, 0x10, 0x00, 0x10, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02]);
        assert_eq!(req.classification, Classification::Known(MessageKind::Request));
        assert_eq!(req.first_register(), Some(0x10));
        assert_eq!(req.count(), Some(CountField::Registers(2)));
        assert_eq!(req.byte_count_following(), Some(4));
        assert_eq!(req.data(), &[0x00, 0x0A, 0x01, 0x02]);

        let resp = parse(&[0x01, 0x10, 0x00, 0x10, 0x00, 0x02]);
        assert_eq!(resp.classification, Classification::Known(MessageKind::Response));
        assert_eq!(resp.byte_count_following(), None);
        assert!(resp.data().is_empty());
    }

    #[test]
    fn test_exception_frame() {
        let frame = parse(&[0x0A, 0x83, 0x02]);
        assert!(frame.is_exception());
        assert_eq!(frame.base_function(), 0x03);
        assert_eq!(frame.classification, Classification::Known(MessageKind::Response));
        assert_eq!(frame.count(), Some(CountField::Exception("Illegal data address")));
        assert_eq!(
            frame.correlation_key(),
            CorrelationKey {
                address: 0x0A,
                base_function: 0x03
            }
        );
    }

    #[test]
    fn test_crc_mismatch_still_decodes() {
        let mut raw = with_crc(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x0A]);
        raw[7] ^= 0xFF;
        let frame = DecodedFrame::parse(&raw, Instant::now()).unwrap();
        assert!(!frame.crc_valid);
        assert_eq!(frame.received_crc, [0xC5, 0x32]);
        assert_eq!(frame.first_register(), Some(0));
    }

    #[test]
    fn test_recomputed_crc_matches_transmitted() {
        let bodies: [&[u8]; 4] = [
            &[0x01, 0x03, 0x00, 0x00, 0x00, 0x0A],
            &[0x07, 0x01, 0x01, 0x05],
            &[0x02, 0x0F, 0x00, 0x13, 0x00, 0x0A, 0x02, 0xCD, 0x01],
            &[0x09, 0x85, 0x04],
        ];
        for body in bodies {
            let frame = parse(body);
            let mut prefix = vec![frame.address, frame.function];
            prefix.extend_from_slice(frame.payload());
            assert_eq!(crc16_modbus_bytes(&prefix), frame.received_crc);
        }
    }

    #[test]
    fn test_signature_ignores_timing() {
        let raw = with_crc(&[0x01, 0x03, 0x02, 0x00, 0x0A]);
        let a = DecodedFrame::parse(&raw, Instant::now()).unwrap();
        let b = DecodedFrame::parse(&raw, Instant::now()).unwrap();
        assert_eq!(a.signature(), b.signature());
    }
}
