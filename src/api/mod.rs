pub mod traits;

use anyhow::{anyhow, Result};
use std::sync::Arc;

pub use traits::{dispatch_event, LoggingSink, NoOpSink, RecordSink};

pub use crate::core::{
    scan, CaptureControl, CaptureEvent, CaptureOptions, LiveCapture, OutputRecord, RecordEvent,
    RecordFilter, ScanControl, ScanError, ScanOptions, ScanOutcome,
};
pub use crate::protocol::{
    tty::{SerialLine, SerialLineFactory},
    ByteSource, FramingOptions, LinkConfig, Parity,
};

// Re-export CLI default sinks (flume-based and printing implementations)
pub use crate::cli::handlers::{FlumeRecordSink, PrintSink, SinkControl};

/// Builder for configuring and starting a sniffer or a link scan.
///
/// # Example
///
/// ```no_run
/// use rtu_sniff::api::{LinkConfig, LoggingSink, Parity, SnifferBuilder};
/// use std::sync::Arc;
///
/// let sniffer = SnifferBuilder::new()
///     .with_port("/dev/ttyUSB0")
///     .with_link(LinkConfig::new(19200, 8, Parity::Even, 1))
///     .add_sink(Arc::new(LoggingSink))
///     .build()?;
/// sniffer.run();
/// # Ok::<(), anyhow::Error>(())
/// ```
pub struct SnifferBuilder {
    port_name: Option<String>,
    link: LinkConfig,
    capture: CaptureOptions,
    scan: ScanOptions,
    filter: RecordFilter,
    // Sinks are called in the order they were added
    sinks: Vec<Arc<dyn RecordSink>>,
}

impl Default for SnifferBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SnifferBuilder {
    pub fn new() -> Self {
        Self {
            port_name: None,
            link: LinkConfig::default(),
            capture: CaptureOptions::default(),
            scan: ScanOptions::default(),
            filter: RecordFilter::default(),
            sinks: Vec::new(),
        }
    }

    /// Set the serial port name.
    pub fn with_port(mut self, port_name: &str) -> Self {
        self.port_name = Some(port_name.to_string());
        self
    }

    /// Set the line parameters used for live capture.
    pub fn with_link(mut self, link: LinkConfig) -> Self {
        self.link = link;
        self
    }

    /// Framing options apply to both live capture and scanning.
    pub fn with_framing(mut self, framing: FramingOptions) -> Self {
        self.capture.framing = framing.clone();
        self.scan.framing = framing;
        self
    }

    pub fn with_capture_options(mut self, options: CaptureOptions) -> Self {
        self.capture = options;
        self
    }

    pub fn with_scan_options(mut self, options: ScanOptions) -> Self {
        self.scan = options;
        self
    }

    /// Records not matching `filter` are not handed to sinks.
    pub fn with_filter(mut self, filter: RecordFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Add a sink to the chain (can be called multiple times).
    pub fn add_sink(mut self, sink: Arc<dyn RecordSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Open the configured serial port and start capturing.
    pub fn build(self) -> Result<Sniffer> {
        let port_name = self
            .port_name
            .clone()
            .ok_or_else(|| anyhow!("Port name is required. Use with_port()"))?;
        let line = SerialLine::new(port_name, self.link);
        self.build_with_source(line)
    }

    /// Start capturing from any byte source.
    pub fn build_with_source<S: ByteSource + 'static>(self, source: S) -> Result<Sniffer> {
        let capture = LiveCapture::start(source, self.link, self.capture)?;
        Ok(Sniffer {
            capture,
            filter: self.filter,
            sinks: self.sinks,
        })
    }

    /// Run the link parameter scanner on the configured port. Blocks until a
    /// configuration is accepted, the candidates run out, or `control` is
    /// cancelled.
    pub fn scan(&self, control: &ScanControl) -> Result<ScanOutcome> {
        let port_name = self
            .port_name
            .as_deref()
            .ok_or_else(|| anyhow!("Port name is required. Use with_port()"))?;
        let mut factory = SerialLineFactory::new(port_name);
        Ok(scan(&mut factory, &self.scan, control)?)
    }
}

/// A running capture wired to its sinks.
pub struct Sniffer {
    capture: LiveCapture,
    filter: RecordFilter,
    sinks: Vec<Arc<dyn RecordSink>>,
}

impl std::fmt::Debug for Sniffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sniffer")
            .field("capture", &self.capture)
            .field("filter", &self.filter)
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl Sniffer {
    pub fn control(&self) -> CaptureControl {
        self.capture.control()
    }

    /// Deliver events to the sinks until the capture stops. Returns the number
    /// of frames dropped under backpressure.
    ///
    /// Record positions handed to sinks index the filtered output, i.e. only
    /// the records the sinks have seen.
    pub fn run(self) -> u64 {
        let events = self.capture.events();
        let mut view = FilteredView::new(self.filter);
        let mut dropped = 0;
        for event in events.iter() {
            let event = match event {
                CaptureEvent::Record(change) => match view.apply(change) {
                    Some(change) => CaptureEvent::Record(change),
                    None => continue,
                },
                CaptureEvent::Cleared => {
                    view.clear();
                    CaptureEvent::Cleared
                }
                other => other,
            };
            if !dispatch_event(&self.sinks, &event) {
                self.capture.stop();
            }
            if let CaptureEvent::Stopped { dropped_frames } = event {
                dropped = dropped_frames;
                break;
            }
        }
        self.capture.join();
        dropped
    }
}

/// Maps positions in the full output onto positions among the records a
/// filter lets through.
#[derive(Debug)]
struct FilteredView {
    filter: RecordFilter,
    /// Visibility of every record in full output order.
    visible: Vec<bool>,
}

impl FilteredView {
    fn new(filter: RecordFilter) -> Self {
        Self {
            filter,
            visible: Vec::new(),
        }
    }

    fn clear(&mut self) {
        self.visible.clear();
    }

    fn filtered_position(&self, position: usize) -> usize {
        self.visible[..position.min(self.visible.len())]
            .iter()
            .filter(|v| **v)
            .count()
    }

    /// The change as seen through the filter, or `None` if it is hidden.
    fn apply(&mut self, change: RecordEvent) -> Option<RecordEvent> {
        match change {
            RecordEvent::Inserted { position, record } => {
                let shown = self.filter.matches(&record);
                let position = position.min(self.visible.len());
                self.visible.insert(position, shown);
                shown.then(|| RecordEvent::Inserted {
                    position: self.filtered_position(position),
                    record,
                })
            }
            RecordEvent::Updated { position, record } => {
                let shown = self.visible.get(position).copied().unwrap_or(false);
                shown.then(|| RecordEvent::Updated {
                    position: self.filtered_position(position),
                    record,
                })
            }
        }
    }
}
