use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use strum::EnumIter;
use thiserror::Error;

use serialport::{DataBits, StopBits};

/// Bit-times per character used for RTU timing, independent of the actual
/// data/parity/stop configuration.
pub const BITS_PER_CHARACTER: f64 = 11.0;

#[derive(EnumIter, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    None,
    Even,
    Odd,
}

impl Parity {
    fn letter(&self) -> char {
        match self {
            Parity::None => 'N',
            Parity::Even => 'E',
            Parity::Odd => 'O',
        }
    }
}

impl std::fmt::Display for Parity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Parity::None => write!(f, "none"),
            Parity::Even => write!(f, "even"),
            Parity::Odd => write!(f, "odd"),
        }
    }
}

impl std::str::FromStr for Parity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "n" => Ok(Parity::None),
            "even" | "e" => Ok(Parity::Even),
            "odd" | "o" => Ok(Parity::Odd),
            other => Err(anyhow::anyhow!("Unknown parity: {other}")),
        }
    }
}

impl From<Parity> for serialport::Parity {
    fn from(p: Parity) -> Self {
        match p {
            Parity::None => serialport::Parity::None,
            Parity::Even => serialport::Parity::Even,
            Parity::Odd => serialport::Parity::Odd,
        }
    }
}

/// Electrical parameters of the line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkConfig {
    pub baud: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: u8,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            baud: 9600,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
        }
    }
}

impl LinkConfig {
    pub fn new(baud: u32, data_bits: u8, parity: Parity, stop_bits: u8) -> Self {
        Self {
            baud,
            data_bits,
            parity,
            stop_bits,
        }
    }

    /// Nominal time to transmit one character.
    pub fn character_time(&self) -> Duration {
        Duration::from_secs_f64(BITS_PER_CHARACTER / self.baud.max(1) as f64)
    }

    /// Silence that separates two frames: 3.5 character times.
    pub fn frame_gap(&self) -> Duration {
        self.character_time().mul_f64(3.5)
    }

    /// Silence above which a partially received frame is considered broken
    /// when discard mode is on: 1.5 character times.
    pub fn short_gap(&self) -> Duration {
        self.character_time().mul_f64(1.5)
    }

    pub fn serial_data_bits(&self) -> DataBits {
        match self.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        }
    }

    pub fn serial_stop_bits(&self) -> StopBits {
        match self.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        }
    }

    pub fn apply_builder(&self, b: serialport::SerialPortBuilder) -> serialport::SerialPortBuilder {
        b.baud_rate(self.baud)
            .data_bits(self.serial_data_bits())
            .stop_bits(self.serial_stop_bits())
            .parity(self.parity.into())
    }
}

impl std::fmt::Display for LinkConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}{}{}",
            self.baud,
            self.data_bits,
            self.parity.letter(),
            self.stop_bits
        )
    }
}

/// A received byte and the moment it arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedByte {
    pub byte: u8,
    pub at: Instant,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("byte source closed")]
    Closed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

/// A half-duplex line we only listen to.
///
/// `read_byte` blocks for at most a short poll interval and returns `Ok(None)`
/// when nothing arrived in that time. Any error ends the reading stage.
pub trait ByteSource: Send {
    /// Name of the underlying line; used for exclusive leases.
    fn name(&self) -> &str;

    fn configure(&mut self, config: &LinkConfig) -> Result<(), SourceError>;

    fn open(&mut self) -> Result<(), SourceError>;

    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Drop anything already buffered by the driver.
    fn clear_input(&mut self) -> Result<(), SourceError>;

    fn read_byte(&mut self) -> Result<Option<TimedByte>, SourceError>;
}

impl<S: ByteSource + ?Sized> ByteSource for Box<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn configure(&mut self, config: &LinkConfig) -> Result<(), SourceError> {
        (**self).configure(config)
    }

    fn open(&mut self) -> Result<(), SourceError> {
        (**self).open()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn clear_input(&mut self) -> Result<(), SourceError> {
        (**self).clear_input()
    }

    fn read_byte(&mut self) -> Result<Option<TimedByte>, SourceError> {
        (**self).read_byte()
    }
}

/// Creates fresh, unopened handles to one line.
pub trait SourceFactory {
    type Source: ByteSource;

    /// Name of the line every created handle refers to.
    fn line_name(&self) -> &str;

    fn create(&mut self) -> Result<Self::Source, SourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_gap_at_9600() {
        let cfg = LinkConfig::default();
        let gap = cfg.frame_gap().as_secs_f64();
        assert!((gap - 3.5 * 11.0 / 9600.0).abs() < 1e-9);
        assert!(cfg.short_gap() < cfg.frame_gap());
    }

    #[test]
    fn test_display_and_parity_parse() {
        let cfg = LinkConfig::new(19200, 8, Parity::Even, 1);
        assert_eq!(cfg.to_string(), "19200 8E1");
        assert_eq!("odd".parse::<Parity>().unwrap(), Parity::Odd);
        assert_eq!("N".parse::<Parity>().unwrap(), Parity::None);
        assert!("mark".parse::<Parity>().is_err());
    }

    #[test]
    fn test_config_serialization() {
        let cfg = LinkConfig::new(38400, 7, Parity::Odd, 2);
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains("\"parity\":\"odd\""));
        let back: LinkConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }
}
