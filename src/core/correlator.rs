//! Request/response pairing over frames sniffed in arrival order.
//!
//! [`CorrelationState`] is owned by exactly one stage. Every call returns the
//! list of changes it made to the ordered output so consumers can mirror it
//! without sharing the state.

use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    time::{Duration, Instant},
};

use crate::protocol::modbus::{
    Classification, CorrelationKey, DecodedFrame, MessageKind, MessageSignature,
};

use super::record::{OutputRecord, RecordId, TimeDisplay};

/// How long the line must stay quiet before pending responses are given up on.
pub const DEFAULT_PENDING_FLUSH_AFTER: Duration = Duration::from_secs(2);

/// A change to the ordered output.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RecordEvent {
    /// `record` now sits at `position`; later records shifted down by one.
    Inserted {
        position: usize,
        record: OutputRecord,
    },
    /// The record at `position` changed in place.
    Updated {
        position: usize,
        record: OutputRecord,
    },
}

impl RecordEvent {
    pub fn record(&self) -> &OutputRecord {
        match self {
            RecordEvent::Inserted { record, .. } | RecordEvent::Updated { record, .. } => record,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct OpenRequest {
    id: RecordId,
    at: Instant,
}

/// Write-single frames awaiting their echo: `(address, base function, payload)`.
type EchoKey = (u8, u8, Vec<u8>);

fn is_write_single(frame: &DecodedFrame) -> bool {
    matches!(frame.function, 0x05 | 0x06)
}

#[derive(Debug, Default)]
pub struct CorrelationState {
    next_id: u64,
    order: Vec<RecordId>,
    records: HashMap<RecordId, OutputRecord>,
    /// Requests by exact frame bytes.
    open_requests: HashMap<Vec<u8>, OpenRequest>,
    /// Write-single requests by echo tuple; their responses are matched here.
    echo_requests: HashMap<EchoKey, OpenRequest>,
    responses: HashMap<MessageSignature, RecordId>,
    pending: BTreeMap<CorrelationKey, Vec<DecodedFrame>>,
    last_request: HashMap<CorrelationKey, OpenRequest>,
    echoes: HashSet<EchoKey>,
    last_message_at: Option<Instant>,
}

impl CorrelationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Responses still waiting for a request.
    pub fn pending_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    /// Output records in display order.
    pub fn records(&self) -> impl Iterator<Item = &OutputRecord> + '_ {
        self.order.iter().filter_map(|id| self.records.get(id))
    }

    pub fn get(&self, id: RecordId) -> Option<&OutputRecord> {
        self.records.get(&id)
    }

    /// Feed one decoded frame.
    pub fn ingest(&mut self, frame: DecodedFrame) -> Vec<RecordEvent> {
        let mut events = Vec::new();
        self.last_message_at = Some(frame.received_at);

        let kind = match frame.classification {
            Classification::Known(kind) => kind,
            Classification::Deferred => self.resolve_echo(&frame),
        };
        log::debug!("{} {}: {}", kind, frame.address, frame.hex());

        match kind {
            MessageKind::Request => self.on_request(frame, &mut events),
            MessageKind::Response => self.on_response(frame, &mut events),
        }
        events
    }

    /// Periodic maintenance: attach pending responses whose request showed up
    /// and, once the line has been quiet for `flush_after`, place the rest
    /// unanchored at the end.
    pub fn sweep(&mut self, now: Instant, flush_after: Duration) -> Vec<RecordEvent> {
        let mut events = Vec::new();
        let ready: Vec<CorrelationKey> = self
            .pending
            .keys()
            .filter(|key| self.last_request.contains_key(*key))
            .copied()
            .collect();
        for key in ready {
            self.drain_pending(key, &mut events);
        }

        let quiet = self
            .last_message_at
            .map_or(true, |last| now.saturating_duration_since(last) >= flush_after);
        if quiet && !self.pending.is_empty() {
            self.flush_into(&mut events);
        }
        events
    }

    /// Place every pending response unanchored, in arrival order.
    pub fn flush_pending(&mut self) -> Vec<RecordEvent> {
        let mut events = Vec::new();
        self.flush_into(&mut events);
        events
    }

    /// Forget everything; the next record starts a fresh session.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    fn echo_key(frame: &DecodedFrame) -> EchoKey {
        (frame.address, frame.base_function(), frame.payload().to_vec())
    }

    fn resolve_echo(&mut self, frame: &DecodedFrame) -> MessageKind {
        let key = Self::echo_key(frame);
        if self.echoes.remove(&key) {
            MessageKind::Response
        } else {
            self.echoes.insert(key);
            MessageKind::Request
        }
    }

    fn on_request(&mut self, frame: DecodedFrame, events: &mut Vec<RecordEvent>) {
        let key = frame.correlation_key();
        let open = match self.open_requests.get(frame.raw()).map(|o| o.id) {
            Some(id) => {
                let time = TimeDisplay::Absolute {
                    at: frame.captured_at,
                };
                self.update(id, events, |record| {
                    record.counter += 1;
                    record.time = time;
                });
                OpenRequest {
                    id,
                    at: frame.received_at,
                }
            }
            None => {
                let id = self.allocate();
                let record = OutputRecord::from_frame(
                    id,
                    MessageKind::Request,
                    &frame,
                    TimeDisplay::Absolute {
                        at: frame.captured_at,
                    },
                );
                self.insert_at(self.order.len(), record, events);
                OpenRequest {
                    id,
                    at: frame.received_at,
                }
            }
        };

        self.open_requests.insert(frame.raw().to_vec(), open);
        if is_write_single(&frame) {
            self.echo_requests.insert(Self::echo_key(&frame), open);
        }
        self.last_request.insert(key, open);
        self.drain_pending(key, events);
    }

    fn on_response(&mut self, frame: DecodedFrame, events: &mut Vec<RecordEvent>) {
        if self.update_known_response(&frame, events) {
            return;
        }
        match self.find_request(&frame) {
            Some(request) => {
                let position = self.anchored_position(request.id);
                let mut record = OutputRecord::from_frame(
                    self.allocate(),
                    MessageKind::Response,
                    &frame,
                    TimeDisplay::SinceRequest {
                        elapsed: frame.received_at.saturating_duration_since(request.at),
                    },
                );
                record.request = Some(request.id);
                self.responses.insert(frame.signature(), record.id);
                self.insert_at(position, record, events);
            }
            None if self.order.is_empty() => self.append_unanchored(&frame, events),
            None => {
                log::debug!("response {} waits for its request", frame.hex());
                self.pending
                    .entry(frame.correlation_key())
                    .or_default()
                    .push(frame);
            }
        }
    }

    /// Dedupe by signature; returns whether an existing record absorbed `frame`.
    fn update_known_response(&mut self, frame: &DecodedFrame, events: &mut Vec<RecordEvent>) -> bool {
        let Some(&id) = self.responses.get(&frame.signature()) else {
            return false;
        };
        let anchor = self.records.get(&id).and_then(|r| r.request);
        let time = match (anchor, self.find_request(frame)) {
            (Some(_), Some(request)) => TimeDisplay::SinceRequest {
                elapsed: frame.received_at.saturating_duration_since(request.at),
            },
            _ => TimeDisplay::Absolute {
                at: frame.captured_at,
            },
        };
        let data = frame.data().to_vec();
        self.update(id, events, |record| {
            record.counter += 1;
            record.time = time;
            record.data = data;
        });
        true
    }

    fn find_request(&self, frame: &DecodedFrame) -> Option<OpenRequest> {
        if is_write_single(frame) {
            self.echo_requests.get(&Self::echo_key(frame)).copied()
        } else {
            self.last_request.get(&frame.correlation_key()).copied()
        }
    }

    /// Directly after the request.
    fn anchored_position(&self, request: RecordId) -> usize {
        self.order
            .iter()
            .rposition(|&id| id == request)
            .map_or(self.order.len(), |start| start + 1)
    }

    fn drain_pending(&mut self, key: CorrelationKey, events: &mut Vec<RecordEvent>) {
        if let Some(frames) = self.pending.remove(&key) {
            for frame in frames {
                self.on_response(frame, events);
            }
        }
    }

    fn flush_into(&mut self, events: &mut Vec<RecordEvent>) {
        let mut frames: Vec<DecodedFrame> = std::mem::take(&mut self.pending)
            .into_values()
            .flatten()
            .collect();
        frames.sort_by_key(|f| f.received_at);
        if !frames.is_empty() {
            log::info!("placing {} unmatched responses", frames.len());
        }
        for frame in frames {
            if !self.update_known_response(&frame, events) {
                self.append_unanchored(&frame, events);
            }
        }
    }

    fn append_unanchored(&mut self, frame: &DecodedFrame, events: &mut Vec<RecordEvent>) {
        let record = OutputRecord::from_frame(
            self.allocate(),
            MessageKind::Response,
            frame,
            TimeDisplay::Absolute {
                at: frame.captured_at,
            },
        );
        self.responses.insert(frame.signature(), record.id);
        self.insert_at(self.order.len(), record, events);
    }

    fn allocate(&mut self) -> RecordId {
        self.next_id += 1;
        RecordId(self.next_id)
    }

    fn insert_at(&mut self, position: usize, record: OutputRecord, events: &mut Vec<RecordEvent>) {
        let position = position.min(self.order.len());
        self.order.insert(position, record.id);
        self.records.insert(record.id, record.clone());
        events.push(RecordEvent::Inserted { position, record });
    }

    fn update<F>(&mut self, id: RecordId, events: &mut Vec<RecordEvent>, change: F)
    where
        F: FnOnce(&mut OutputRecord),
    {
        let Some(record) = self.records.get_mut(&id) else {
            return;
        };
        change(record);
        let record = record.clone();
        if let Some(position) = self.order.iter().position(|&r| r == id) {
            events.push(RecordEvent::Updated { position, record });
        }
    }
}
