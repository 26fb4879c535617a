/// Record sink traits - where capture output goes
///
/// A sink receives every capture event that passes the sniffer's filter.
/// Implementations print, forward through channels, store, etc.
///
/// The CLI module provides a printing sink and a flume-based sink.
use anyhow::Result;

use crate::core::CaptureEvent;

/// Trait for consuming capture events
pub trait RecordSink: Send + Sync {
    /// Handle one capture event
    ///
    /// Errors are logged by the caller and do not stop the capture.
    fn handle_event(&self, event: &CaptureEvent) -> Result<()>;

    /// Check if the sink wants more events
    ///
    /// Return false to stop the capture gracefully.
    fn should_continue(&self) -> bool {
        true
    }
}

/// Sink that discards everything (useful for testing)
pub struct NoOpSink;

impl RecordSink for NoOpSink {
    fn handle_event(&self, _event: &CaptureEvent) -> Result<()> {
        Ok(())
    }
}

/// Sink that writes events to the log
pub struct LoggingSink;

impl RecordSink for LoggingSink {
    fn handle_event(&self, event: &CaptureEvent) -> Result<()> {
        match event {
            CaptureEvent::Record(change) => log::info!("record: {}", change.record()),
            CaptureEvent::Cleared => log::info!("session cleared"),
            CaptureEvent::SourceClosed { line, reason } => {
                log::info!("{line} closed: {}", reason.as_deref().unwrap_or("stopped"))
            }
            CaptureEvent::Stopped { dropped_frames } => {
                log::info!("capture stopped ({dropped_frames} frames dropped)")
            }
        }
        Ok(())
    }
}

/// Hand `event` to every sink in order. Returns false once any sink asks to
/// stop.
pub fn dispatch_event(sinks: &[std::sync::Arc<dyn RecordSink>], event: &CaptureEvent) -> bool {
    let mut keep_going = true;
    for sink in sinks {
        if let Err(err) = sink.handle_event(event) {
            log::warn!("record sink failed: {err}");
        }
        keep_going &= sink.should_continue();
    }
    keep_going
}
