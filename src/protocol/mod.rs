pub mod framing;
pub mod link;
pub mod modbus;
pub mod tty;

pub use framing::{CandidateFrame, Frames, FramingOptions, Reassembler};
pub use link::{ByteSource, LinkConfig, Parity, SourceError, SourceFactory, TimedByte};
