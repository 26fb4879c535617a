/// CLI-specific record sinks
///
/// This module provides the default sink implementations: one that forwards
/// events through a flume channel and one that prints them to stdout.
/// These are used by the CLI actions and can also be used by external applications.
use anyhow::Result;
use std::{
    io::Write,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use crate::{
    api::traits::RecordSink,
    core::{CaptureEvent, OutputRecord, RecordEvent},
    protocol::modbus::values::ValueFormat,
};

/// Flume-based sink that forwards every event through a channel
pub struct FlumeRecordSink {
    sender: flume::Sender<CaptureEvent>,
    running: Arc<AtomicBool>,
}

impl FlumeRecordSink {
    /// Create a new flume sink with an unbounded channel
    pub fn new() -> (Self, flume::Receiver<CaptureEvent>) {
        let (sender, receiver) = flume::unbounded();
        let sink = Self {
            sender,
            running: Arc::new(AtomicBool::new(true)),
        };
        (sink, receiver)
    }

    /// Stop the sink (causes should_continue to return false)
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Get a handle to control this sink
    pub fn get_control_handle(&self) -> SinkControl {
        SinkControl {
            running: Arc::clone(&self.running),
        }
    }
}

impl Default for FlumeRecordSink {
    fn default() -> Self {
        Self::new().0
    }
}

impl RecordSink for FlumeRecordSink {
    fn handle_event(&self, event: &CaptureEvent) -> Result<()> {
        self.sender
            .send(event.clone())
            .map_err(|_| anyhow::anyhow!("Failed to send event: receiver dropped"))
    }

    fn should_continue(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Control handle for sinks
///
/// Allows external code to stop the sink gracefully
#[derive(Debug, Clone)]
pub struct SinkControl {
    running: Arc<AtomicBool>,
}

impl SinkControl {
    /// Request the sink to stop
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Check if the sink is still running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Prints records to stdout, one line per insertion or update
pub struct PrintSink {
    json: bool,
    /// Register formats for the data column; empty shows raw bytes only.
    values: Vec<ValueFormat>,
}

impl PrintSink {
    pub fn text() -> Self {
        Self {
            json: false,
            values: Vec::new(),
        }
    }

    /// JSON lines, one serialized event per line
    pub fn json() -> Self {
        Self {
            json: true,
            values: Vec::new(),
        }
    }

    /// Also interpret each record's data as registers in these formats.
    pub fn with_values(mut self, formats: Vec<ValueFormat>) -> Self {
        self.values = formats;
        self
    }

    fn registers_text(&self, record: &OutputRecord) -> String {
        if self.values.is_empty() {
            return String::new();
        }
        let regs: Vec<String> = record
            .registers(&self.values)
            .iter()
            .map(|r| r.value.to_string())
            .collect();
        format!(" | [{}]", regs.join(" "))
    }

    fn render_text(&self, event: &CaptureEvent) -> Option<String> {
        match event {
            CaptureEvent::Record(RecordEvent::Inserted { position, record }) => Some(format!(
                "+ {position:>5} | {record}{}",
                self.registers_text(record)
            )),
            CaptureEvent::Record(RecordEvent::Updated { position, record }) => Some(format!(
                "~ {position:>5} | {record}{}",
                self.registers_text(record)
            )),
            CaptureEvent::Cleared => Some("-- cleared --".to_string()),
            CaptureEvent::SourceClosed { .. } | CaptureEvent::Stopped { .. } => None,
        }
    }

    fn render_json(&self, event: &CaptureEvent) -> Result<String> {
        let mut value = serde_json::to_value(event)?;
        if let CaptureEvent::Record(change) = event {
            if !self.values.is_empty() {
                value["registers"] = serde_json::to_value(change.record().registers(&self.values))?;
            }
        }
        Ok(value.to_string())
    }
}

impl RecordSink for PrintSink {
    fn handle_event(&self, event: &CaptureEvent) -> Result<()> {
        let line = if self.json {
            Some(self.render_json(event)?)
        } else {
            self.render_text(event)
        };
        if let Some(line) = line {
            let mut out = std::io::stdout().lock();
            writeln!(out, "{line}")?;
            out.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::{RecordId, TimeDisplay},
        protocol::modbus::{with_crc, DecodedFrame, MessageKind},
    };
    use std::time::Instant;

    fn event() -> CaptureEvent {
        let frame =
            DecodedFrame::parse(&with_crc(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]), Instant::now())
                .unwrap();
        let record = OutputRecord::from_frame(
            RecordId(7),
            MessageKind::Request,
            &frame,
            TimeDisplay::Absolute {
                at: frame.captured_at,
            },
        );
        CaptureEvent::Record(RecordEvent::Inserted {
            position: 0,
            record,
        })
    }

    #[test]
    fn test_flume_record_sink() {
        let (sink, receiver) = FlumeRecordSink::new();
        let sent = event();
        sink.handle_event(&sent).unwrap();
        assert_eq!(receiver.recv().unwrap(), sent);

        let control = sink.get_control_handle();
        assert!(sink.should_continue());
        control.stop();
        assert!(!control.is_running());
        assert!(!sink.should_continue());
    }

    #[test]
    fn test_text_rendering() {
        let sink = PrintSink::text();
        let line = sink.render_text(&event()).unwrap();
        assert!(line.starts_with("+     0 | 1 | "));
        assert!(line.contains("| Request | 1 | 3 | 0 | 1 | - | - |"));
        assert!(sink
            .render_text(&CaptureEvent::Stopped { dropped_frames: 0 })
            .is_none());
    }

    fn response_event() -> CaptureEvent {
        let frame = DecodedFrame::parse(
            &with_crc(&[0x01, 0x03, 0x06, 0xFF, 0xFE, 0x00, 0x00, 0x3F, 0xC0]),
            Instant::now(),
        )
        .unwrap();
        let record = OutputRecord::from_frame(
            RecordId(2),
            MessageKind::Response,
            &frame,
            TimeDisplay::Absolute {
                at: frame.captured_at,
            },
        );
        CaptureEvent::Record(RecordEvent::Inserted {
            position: 1,
            record,
        })
    }

    #[test]
    fn test_text_register_values() {
        let formats: Vec<ValueFormat> = ["signed", "float-cdab"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        let sink = PrintSink::text().with_values(formats);
        let line = sink.render_text(&response_event()).unwrap();
        assert!(line.ends_with("| [-2 1.500000 ..]"), "{line}");

        let plain = PrintSink::text().render_text(&response_event()).unwrap();
        assert!(!plain.contains('['));
    }

    #[test]
    fn test_json_register_values() {
        let sink = PrintSink::json().with_values(vec![ValueFormat::Unsigned]);
        let json: serde_json::Value =
            serde_json::from_str(&sink.render_json(&response_event()).unwrap()).unwrap();
        assert_eq!(json["registers"][0]["value"]["text"], "65534");
        assert_eq!(json["registers"].as_array().unwrap().len(), 3);

        let plain: serde_json::Value =
            serde_json::from_str(&PrintSink::json().render_json(&event()).unwrap()).unwrap();
        assert!(plain.get("registers").is_none());
    }

    #[test]
    fn test_json_event_shape() {
        let json = serde_json::to_value(event()).unwrap();
        assert_eq!(json["type"], "record");
        assert_eq!(json["body"]["event"], "inserted");
        assert_eq!(json["body"]["position"], 0);
        assert_eq!(json["body"]["record"]["function"], 3);
    }
}
