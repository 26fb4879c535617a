//! serialport-backed byte source and port listing.

mod ports;

pub use ports::{available_ports_sorted, port_priority, PortEntry};

use std::{
    io::{ErrorKind, Read},
    time::{Duration, Instant},
};

use serialport::{ClearBuffer, SerialPort};

use super::link::{ByteSource, LinkConfig, SourceError, SourceFactory, TimedByte};

/// How long one `read_byte` call may block waiting for data.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(10);

pub struct SerialLine {
    port_name: String,
    config: LinkConfig,
    poll_timeout: Duration,
    handle: Option<Box<dyn SerialPort>>,
}

impl std::fmt::Debug for SerialLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialLine")
            .field("port_name", &self.port_name)
            .field("config", &self.config)
            .field("open", &self.handle.is_some())
            .finish_non_exhaustive()
    }
}

impl SerialLine {
    pub fn new(port_name: impl Into<String>, config: LinkConfig) -> Self {
        Self {
            port_name: port_name.into(),
            config,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            handle: None,
        }
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    fn handle(&mut self) -> Result<&mut Box<dyn SerialPort>, SourceError> {
        self.handle.as_mut().ok_or(SourceError::Closed)
    }
}

impl ByteSource for SerialLine {
    fn name(&self) -> &str {
        &self.port_name
    }

    fn configure(&mut self, config: &LinkConfig) -> Result<(), SourceError> {
        self.config = *config;
        if let Some(handle) = self.handle.as_mut() {
            handle.set_baud_rate(config.baud)?;
            handle.set_data_bits(config.serial_data_bits())?;
            handle.set_parity(config.parity.into())?;
            handle.set_stop_bits(config.serial_stop_bits())?;
            log::debug!("reconfigured {} to {}", self.port_name, config);
        }
        Ok(())
    }

    fn open(&mut self) -> Result<(), SourceError> {
        if self.handle.is_some() {
            return Ok(());
        }
        let builder = serialport::new(&self.port_name, self.config.baud).timeout(self.poll_timeout);
        let builder = self.config.apply_builder(builder);

        #[cfg(unix)]
        let handle: Box<dyn SerialPort> = {
            let mut native = builder.open_native()?;
            native.set_exclusive(true)?;
            Box::new(native)
        };
        #[cfg(not(unix))]
        let handle = builder.open()?;

        log::info!("opened {} at {}", self.port_name, self.config);
        self.handle = Some(handle);
        Ok(())
    }

    fn close(&mut self) {
        if self.handle.take().is_some() {
            log::info!("closed {}", self.port_name);
        }
    }

    fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    fn clear_input(&mut self) -> Result<(), SourceError> {
        self.handle()?.clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn read_byte(&mut self) -> Result<Option<TimedByte>, SourceError> {
        let mut buf = [0u8; 1];
        match self.handle()?.read(&mut buf) {
            Ok(1) => Ok(Some(TimedByte {
                byte: buf[0],
                at: Instant::now(),
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                Ok(None)
            }
            Err(e) => Err(SourceError::Io(e)),
        }
    }
}

impl Drop for SerialLine {
    fn drop(&mut self) {
        self.close();
    }
}

/// Hands out [`SerialLine`]s for one port name.
#[derive(Debug, Clone)]
pub struct SerialLineFactory {
    port_name: String,
    poll_timeout: Duration,
}

impl SerialLineFactory {
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

impl SourceFactory for SerialLineFactory {
    type Source = SerialLine;

    fn line_name(&self) -> &str {
        &self.port_name
    }

    fn create(&mut self) -> Result<SerialLine, SourceError> {
        Ok(SerialLine::new(self.port_name.clone(), LinkConfig::default())
            .with_poll_timeout(self.poll_timeout))
    }
}
