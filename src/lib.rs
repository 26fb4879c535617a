//! rtu-sniff: passive Modbus RTU sniffer
//!
//! The crate listens on a half-duplex serial line without taking part in the
//! conversation. Bytes are split into frames by inter-byte silence, decoded,
//! and correlated into an ordered request/response view. A link parameter
//! scanner detects the line's baud rate, data bits, parity and stop bits by
//! measuring the share of CRC-valid frames.
//!
//! The `api` module exposes the builder and sink traits used by the CLI and by
//! external applications. The `protocol` module holds framing and decoding,
//! `core` holds correlation, the capture pipeline and the scanner.

pub mod api;
#[doc(hidden)]
pub mod boot;
#[doc(hidden)]
pub mod cli;
pub mod core;
pub mod protocol;

pub use api::*;
pub use boot::init_logging;
