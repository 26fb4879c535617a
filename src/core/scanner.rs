//! Blind detection of a line's electrical parameters.
//!
//! Every candidate [`LinkConfig`] gets a fresh handle from the factory, a short
//! observation window and a CRC-valid ratio. The first candidate that reaches
//! the acceptance ratio wins.

use serde::Serialize;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use strum::IntoEnumIterator;
use thiserror::Error;

use crate::protocol::{
    modbus::{decode, MIN_FRAME_LEN},
    ByteSource, Frames, FramingOptions, LinkConfig, Parity, SourceError, SourceFactory,
};

use super::lease::{LeaseError, LineLease};

/// Tried in this order; the most common rates first.
pub const STANDARD_BAUD_RATES: [u32; 8] = [9600, 19200, 38400, 57600, 115200, 4800, 2400, 1200];
pub const CANDIDATE_DATA_BITS: [u8; 2] = [8, 7];
pub const CANDIDATE_STOP_BITS: [u8; 2] = [1, 2];

/// The full candidate set in scan order.
pub fn candidates() -> Vec<LinkConfig> {
    let mut out = Vec::with_capacity(STANDARD_BAUD_RATES.len() * 2 * 3 * 2);
    for baud in STANDARD_BAUD_RATES {
        for data_bits in CANDIDATE_DATA_BITS {
            for parity in Parity::iter() {
                for stop_bits in CANDIDATE_STOP_BITS {
                    out.push(LinkConfig::new(baud, data_bits, parity, stop_bits));
                }
            }
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanOptions {
    pub observation_window: Duration,
    pub accept_ratio: f64,
    pub framing: FramingOptions,
    pub candidates: Vec<LinkConfig>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            observation_window: Duration::from_secs(2),
            accept_ratio: 0.80,
            framing: FramingOptions::default(),
            candidates: candidates(),
        }
    }
}

/// Frames seen during one observation window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FrameStats {
    pub total: u32,
    pub valid: u32,
}

impl FrameStats {
    pub fn valid_ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.valid as f64 / self.total as f64
        }
    }

    pub fn accepts(&self, ratio: f64) -> bool {
        self.total > 0 && self.valid_ratio() >= ratio
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    Detected {
        config: LinkConfig,
        stats: FrameStats,
        /// Candidates observed, the accepted one included.
        tried: usize,
    },
    Cancelled {
        tried: usize,
    },
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("no configuration accepted after trying {tried} candidates")]
    Exhausted { tried: usize },
    #[error("line {0} is in use")]
    LineBusy(String),
}

impl From<LeaseError> for ScanError {
    fn from(err: LeaseError) -> Self {
        match err {
            LeaseError::Busy(line) => ScanError::LineBusy(line),
        }
    }
}

/// Cooperative cancellation, checked between candidates and between reads.
#[derive(Debug, Clone, Default)]
pub struct ScanControl {
    cancelled: Arc<AtomicBool>,
}

impl ScanControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Try every candidate until one is accepted, the set runs out, or `control`
/// is cancelled. At most one handle from `factory` is open at any time.
pub fn scan<F: SourceFactory>(
    factory: &mut F,
    options: &ScanOptions,
    control: &ScanControl,
) -> Result<ScanOutcome, ScanError> {
    let _lease = LineLease::acquire(factory.line_name())?;
    log::info!(
        "scanning {} over {} candidates",
        factory.line_name(),
        options.candidates.len()
    );

    for (index, config) in options.candidates.iter().enumerate() {
        if control.is_cancelled() {
            return Ok(ScanOutcome::Cancelled { tried: index });
        }

        let stats = match observe(factory, config, options, control) {
            Ok(stats) => stats,
            Err(err) => {
                log::warn!("candidate {config} skipped: {err}");
                continue;
            }
        };

        if control.is_cancelled() {
            return Ok(ScanOutcome::Cancelled { tried: index + 1 });
        }
        log::info!(
            "candidate {config}: {}/{} frames valid",
            stats.valid,
            stats.total
        );
        if stats.accepts(options.accept_ratio) {
            return Ok(ScanOutcome::Detected {
                config: *config,
                stats,
                tried: index + 1,
            });
        }
    }

    Err(ScanError::Exhausted {
        tried: options.candidates.len(),
    })
}

fn observe<F: SourceFactory>(
    factory: &mut F,
    config: &LinkConfig,
    options: &ScanOptions,
    control: &ScanControl,
) -> Result<FrameStats, SourceError> {
    let mut source = factory.create()?;
    source.configure(config)?;
    source.open()?;
    let stats = source
        .clear_input()
        .map(|()| count_frames(&mut source, config, options, control));
    source.close();
    stats
}

fn count_frames<S: ByteSource>(
    source: &mut S,
    config: &LinkConfig,
    options: &ScanOptions,
    control: &ScanControl,
) -> FrameStats {
    let deadline = Instant::now() + options.observation_window;
    let cancel = control.clone();
    let frames = Frames::new(source, config, &options.framing)
        .until(move || cancel.is_cancelled() || Instant::now() >= deadline);

    let mut stats = FrameStats::default();
    for candidate in frames {
        if candidate.bytes.len() < MIN_FRAME_LEN {
            continue;
        }
        stats.total += 1;
        if decode(&candidate.bytes, candidate.completed_at).is_ok_and(|f| f.crc_valid) {
            stats.valid += 1;
        }
    }
    stats
}
