mod crc;
mod exception;
mod frame;
pub mod values;

pub use crc::{crc16_modbus, crc16_modbus_bytes, with_crc};
pub use exception::{describe_exception, ExceptionCode};
pub use frame::{
    decode, to_hex, Classification, CorrelationKey, CountField, DecodedFrame, FrameBody,
    FrameError, MessageKind, MessageSignature, EXCEPTION_FLAG, MIN_FRAME_LEN,
};
