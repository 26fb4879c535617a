#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use rtu_sniff::protocol::{
    modbus::with_crc, ByteSource, LinkConfig, SourceError, SourceFactory, TimedByte,
};

/// Spacing of bytes inside a frame; below the frame gap at every standard baud.
pub const BYTE_SPACING: Duration = Duration::from_micros(100);
/// Silence between frames; above the frame gap at every standard baud.
pub const FRAME_SPACING: Duration = Duration::from_millis(100);

/// Lay frames out on a synthetic timeline starting at `base`.
pub fn timeline(frames: &[Vec<u8>], base: Instant) -> VecDeque<TimedByte> {
    let mut at = base;
    let mut out = VecDeque::new();
    for frame in frames {
        for &byte in frame {
            out.push_back(TimedByte { byte, at });
            at += BYTE_SPACING;
        }
        at += FRAME_SPACING;
    }
    out
}

pub fn frame(body: &[u8]) -> Vec<u8> {
    with_crc(body)
}

/// Same frame with the last CRC byte flipped.
pub fn corrupt(mut raw: Vec<u8>) -> Vec<u8> {
    if let Some(last) = raw.last_mut() {
        *last ^= 0xFF;
    }
    raw
}

#[derive(Debug, Default, Clone)]
pub struct HandleCounter {
    current: Arc<AtomicUsize>,
    max: Arc<AtomicUsize>,
    opened: Arc<AtomicUsize>,
}

impl HandleCounter {
    fn open(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        self.opened.fetch_add(1, Ordering::SeqCst);
    }

    fn close(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

/// In-memory line that replays frames on a synthetic timeline.
///
/// After the script runs out it either reports `Closed` or, with
/// `hold_open`, keeps answering "nothing yet" until closed.
pub struct ScriptedLine {
    name: String,
    frames: Vec<Vec<u8>>,
    pending: VecDeque<TimedByte>,
    hold_open: bool,
    open: bool,
    config: Option<LinkConfig>,
    counter: HandleCounter,
}

impl ScriptedLine {
    pub fn new(name: &str, frames: Vec<Vec<u8>>) -> Self {
        Self {
            name: name.to_string(),
            frames,
            pending: VecDeque::new(),
            hold_open: false,
            open: false,
            config: None,
            counter: HandleCounter::default(),
        }
    }

    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    pub fn with_counter(mut self, counter: HandleCounter) -> Self {
        self.counter = counter;
        self
    }
}

impl ByteSource for ScriptedLine {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self, config: &LinkConfig) -> Result<(), SourceError> {
        self.config = Some(*config);
        Ok(())
    }

    fn open(&mut self) -> Result<(), SourceError> {
        if !self.open {
            self.open = true;
            self.counter.open();
            self.pending = timeline(&self.frames, Instant::now());
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.counter.close();
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn clear_input(&mut self) -> Result<(), SourceError> {
        Ok(())
    }

    fn read_byte(&mut self) -> Result<Option<TimedByte>, SourceError> {
        if !self.open {
            return Err(SourceError::Closed);
        }
        match self.pending.pop_front() {
            Some(b) => Ok(Some(b)),
            None if self.hold_open => {
                std::thread::sleep(Duration::from_millis(1));
                Ok(None)
            }
            None => Err(SourceError::Closed),
        }
    }
}

impl Drop for ScriptedLine {
    fn drop(&mut self) {
        self.close();
    }
}

/// Produces lines that carry valid frames only when configured for `target`;
/// every other configuration sees the same traffic with broken CRCs.
pub struct TargetedFactory {
    pub name: String,
    pub target: LinkConfig,
    pub frames: Vec<Vec<u8>>,
    pub counter: HandleCounter,
    pub created: usize,
    hold_open: bool,
}

impl TargetedFactory {
    pub fn new(name: &str, target: LinkConfig, frames: Vec<Vec<u8>>) -> Self {
        Self {
            name: name.to_string(),
            target,
            frames,
            counter: HandleCounter::default(),
            created: 0,
            hold_open: false,
        }
    }

    /// Lines stay open after their traffic, so observations run until
    /// their window ends or the scan is cancelled.
    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }
}

pub struct TargetedLine {
    target: LinkConfig,
    valid: Vec<Vec<u8>>,
    inner: ScriptedLine,
}

impl ByteSource for TargetedLine {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn configure(&mut self, config: &LinkConfig) -> Result<(), SourceError> {
        self.inner.frames = if *config == self.target {
            self.valid.clone()
        } else {
            self.valid.iter().cloned().map(corrupt).collect()
        };
        self.inner.configure(config)
    }

    fn open(&mut self) -> Result<(), SourceError> {
        self.inner.open()
    }

    fn close(&mut self) {
        self.inner.close()
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn clear_input(&mut self) -> Result<(), SourceError> {
        self.inner.clear_input()
    }

    fn read_byte(&mut self) -> Result<Option<TimedByte>, SourceError> {
        self.inner.read_byte()
    }
}

impl SourceFactory for TargetedFactory {
    type Source = TargetedLine;

    fn line_name(&self) -> &str {
        &self.name
    }

    fn create(&mut self) -> Result<TargetedLine, SourceError> {
        self.created += 1;
        let mut inner =
            ScriptedLine::new(&self.name, Vec::new()).with_counter(self.counter.clone());
        if self.hold_open {
            inner = inner.hold_open();
        }
        Ok(TargetedLine {
            target: self.target,
            valid: self.frames.clone(),
            inner,
        })
    }
}
