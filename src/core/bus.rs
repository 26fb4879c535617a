use flume::{Receiver, Sender};
use serde::Serialize;

use super::correlator::RecordEvent;

/// Messages sent from the consumer to the correlation stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureCommand {
    /// Reset the correlation session and the output sequence.
    Clear,
    /// Graceful shutdown: flush pending responses, then stop all stages.
    Stop,
}

/// Messages sent from the correlation stage back to the consumer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum CaptureEvent {
    /// The ordered output changed.
    Record(RecordEvent),
    /// The session was cleared; drop every mirrored record.
    Cleared,
    /// The byte source ended. `reason` is `None` when it was stopped by us.
    SourceClosed { line: String, reason: Option<String> },
    /// All stages finished; no further events follow.
    Stopped { dropped_frames: u64 },
}

/// Holder passed to consumers: the event stream from the capture and the
/// command side into it.
#[derive(Debug, Clone)]
pub struct Bus {
    pub event_rx: Receiver<CaptureEvent>,
    pub command_tx: Sender<CaptureCommand>,
}

impl Bus {
    pub fn new(event_rx: Receiver<CaptureEvent>, command_tx: Sender<CaptureCommand>) -> Self {
        Self {
            event_rx,
            command_tx,
        }
    }

    /// Ask the capture to reset its session. Returns `false` once the
    /// capture is gone.
    pub fn request_clear(&self) -> bool {
        self.command_tx.send(CaptureCommand::Clear).is_ok()
    }
}
