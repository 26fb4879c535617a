//! Frame boundary recovery from inter-byte silence.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use super::link::{ByteSource, LinkConfig};

/// Upper bound for a buffered frame; Modbus RTU frames never exceed 256 bytes.
const MAX_BUFFERED: usize = 768;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FramingOptions {
    /// Drop the partially assembled buffer when a gap between 1.5 and 3.5
    /// character times is observed.
    #[serde(default)]
    pub discard_on_short_gap: bool,
}

/// Bytes delimited by silence, not yet decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateFrame {
    pub bytes: Vec<u8>,
    /// Arrival time of the last byte.
    pub completed_at: Instant,
}

#[derive(Debug)]
pub struct Reassembler {
    frame_gap: Duration,
    short_gap: Option<Duration>,
    buffer: Vec<u8>,
    last_byte: Option<Instant>,
}

impl Reassembler {
    pub fn new(link: &LinkConfig, options: &FramingOptions) -> Self {
        Self {
            frame_gap: link.frame_gap(),
            short_gap: options.discard_on_short_gap.then(|| link.short_gap()),
            buffer: Vec::with_capacity(256),
            last_byte: None,
        }
    }

    pub fn frame_gap(&self) -> Duration {
        self.frame_gap
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Feed one byte. Returns the previous frame when the silence before this
    /// byte reached the frame gap.
    pub fn push(&mut self, byte: u8, at: Instant) -> Option<CandidateFrame> {
        let mut emitted = None;
        if let Some(last) = self.last_byte {
            let gap = at.saturating_duration_since(last);
            if gap >= self.frame_gap {
                emitted = self.take(last);
            } else if self.short_gap.is_some_and(|short| gap > short) {
                log::debug!(
                    "discarding {} buffered bytes after a {:?} gap",
                    self.buffer.len(),
                    gap
                );
                self.buffer.clear();
            }
        }

        self.buffer.push(byte);
        self.last_byte = Some(at);

        if emitted.is_none() && self.buffer.len() > MAX_BUFFERED {
            log::warn!("frame buffer overflow, forcing a boundary");
            return self.take(at);
        }
        emitted
    }

    /// Emit the buffer if the line has been silent long enough by `now`.
    pub fn poll_idle(&mut self, now: Instant) -> Option<CandidateFrame> {
        let last = self.last_byte?;
        if now.saturating_duration_since(last) >= self.frame_gap {
            self.take(last)
        } else {
            None
        }
    }

    /// Emit whatever is buffered, regardless of timing.
    pub fn flush(&mut self) -> Option<CandidateFrame> {
        let last = self.last_byte?;
        self.take(last)
    }

    fn take(&mut self, completed_at: Instant) -> Option<CandidateFrame> {
        self.last_byte = None;
        if self.buffer.is_empty() {
            return None;
        }
        Some(CandidateFrame {
            bytes: std::mem::take(&mut self.buffer),
            completed_at,
        })
    }
}

/// Lazy sequence of candidate frames read from a source.
///
/// Ends when the source closes or fails; the buffered tail is yielded as the
/// last frame. Not restartable.
pub struct Frames<'a, S: ByteSource + ?Sized> {
    source: &'a mut S,
    reassembler: Reassembler,
    should_stop: Box<dyn Fn() -> bool + Send + 'a>,
    termination: Option<String>,
    done: bool,
}

impl<'a, S: ByteSource + ?Sized> Frames<'a, S> {
    pub fn new(source: &'a mut S, link: &LinkConfig, options: &FramingOptions) -> Self {
        Self {
            source,
            reassembler: Reassembler::new(link, options),
            should_stop: Box::new(|| false),
            termination: None,
            done: false,
        }
    }

    /// Stop reading once `should_stop` returns true; checked between reads.
    pub fn until<F>(mut self, should_stop: F) -> Self
    where
        F: Fn() -> bool + Send + 'a,
    {
        self.should_stop = Box::new(should_stop);
        self
    }

    /// Why the sequence ended, if it ended because of the source.
    pub fn termination(&self) -> Option<&str> {
        self.termination.as_deref()
    }
}

impl<S: ByteSource + ?Sized> Iterator for Frames<'_, S> {
    type Item = CandidateFrame;

    fn next(&mut self) -> Option<CandidateFrame> {
        if self.done {
            return None;
        }
        loop {
            if (self.should_stop)() {
                self.done = true;
                return self.reassembler.flush();
            }
            match self.source.read_byte() {
                Ok(Some(b)) => {
                    if let Some(frame) = self.reassembler.push(b.byte, b.at) {
                        return Some(frame);
                    }
                }
                Ok(None) => {
                    if let Some(frame) = self.reassembler.poll_idle(Instant::now()) {
                        return Some(frame);
                    }
                }
                Err(err) => {
                    log::info!("byte source {} terminated: {}", self.source.name(), err);
                    self.termination = Some(err.to_string());
                    self.done = true;
                    return self.reassembler.flush();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(base: Instant, micros: u64) -> Instant {
        base + Duration::from_micros(micros)
    }

    #[test]
    fn test_no_boundary_below_threshold() {
        let link = LinkConfig::default();
        let mut r = Reassembler::new(&link, &FramingOptions::default());
        let base = Instant::now();
        // 1 ms spacing, threshold is ~4 ms at 9600 baud
        for i in 0..8u64 {
            assert!(r.push(i as u8, at(base, i * 1_000)).is_none());
        }
        assert_eq!(r.buffered(), 8);
    }

    #[test]
    fn test_single_gap_yields_one_frame() {
        let link = LinkConfig::default();
        let mut r = Reassembler::new(&link, &FramingOptions::default());
        let base = Instant::now();
        for i in 0..6u64 {
            assert!(r.push(0x10 + i as u8, at(base, i * 1_000)).is_none());
        }
        let frame = r.push(0xAA, at(base, 5_000 + 10_000)).unwrap();
        assert_eq!(frame.bytes, vec![0x10, 0x11, 0x12, 0x13, 0x14, 0x15]);
        assert_eq!(frame.completed_at, at(base, 5_000));
        assert_eq!(r.buffered(), 1);
    }

    #[test]
    fn test_gap_exactly_at_threshold_is_a_boundary() {
        let link = LinkConfig::default();
        let mut r = Reassembler::new(&link, &FramingOptions::default());
        let base = Instant::now();
        r.push(0x01, base);
        let frame = r.push(0x02, base + r.frame_gap());
        assert_eq!(frame.map(|f| f.bytes), Some(vec![0x01]));
    }

    #[test]
    fn test_idle_poll_and_flush() {
        let link = LinkConfig::default();
        let mut r = Reassembler::new(&link, &FramingOptions::default());
        let base = Instant::now();
        r.push(0x01, base);
        r.push(0x02, at(base, 500));
        assert!(r.poll_idle(at(base, 1_000)).is_none());
        let frame = r.poll_idle(at(base, 50_000)).unwrap();
        assert_eq!(frame.bytes, vec![0x01, 0x02]);
        assert!(r.flush().is_none());

        r.push(0x03, at(base, 60_000));
        assert_eq!(r.flush().map(|f| f.bytes), Some(vec![0x03]));
    }

    #[test]
    fn test_short_gap_discard_is_off_by_default() {
        let link = LinkConfig::default();
        let base = Instant::now();
        let mid_gap = link.short_gap() + (link.frame_gap() - link.short_gap()) / 2;

        let mut keep = Reassembler::new(&link, &FramingOptions::default());
        keep.push(0x01, base);
        keep.push(0x02, base + mid_gap);
        assert_eq!(keep.buffered(), 2);

        let options = FramingOptions {
            discard_on_short_gap: true,
        };
        let mut discard = Reassembler::new(&link, &options);
        discard.push(0x01, base);
        assert!(discard.push(0x02, base + mid_gap).is_none());
        assert_eq!(discard.flush().map(|f| f.bytes), Some(vec![0x02]));
    }
}
