//! Live capture: reader, decode and correlation stages.
//!
//! ```text
//! ByteSource -> [reader + Reassembler] -> candidates (unbounded)
//!            -> [decode]               -> decoded frames (bounded, drop newest)
//!            -> [correlation + sweep]  -> CaptureEvent (unbounded)
//! ```
//!
//! The correlation stage is the only owner of [`CorrelationState`].

use anyhow::Result;
use flume::{Receiver, Sender, TryRecvError, TrySendError};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::protocol::{
    modbus::{decode, DecodedFrame, MIN_FRAME_LEN},
    ByteSource, CandidateFrame, Frames, FramingOptions, LinkConfig,
};

use super::{
    bus::{Bus, CaptureCommand, CaptureEvent},
    correlator::{CorrelationState, DEFAULT_PENDING_FLUSH_AFTER},
    lease::LineLease,
};

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureOptions {
    pub framing: FramingOptions,
    /// Capacity of the decode -> correlation queue.
    pub decoded_queue_capacity: usize,
    pub drain_interval: Duration,
    pub sweep_interval: Duration,
    pub pending_flush_after: Duration,
    /// Drop CRC-invalid frames for this long after start; partial frames
    /// caught mid-transmission show up here.
    pub startup_crc_grace: Option<Duration>,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            framing: FramingOptions::default(),
            decoded_queue_capacity: 1024,
            drain_interval: Duration::from_millis(50),
            sweep_interval: Duration::from_millis(500),
            pending_flush_after: DEFAULT_PENDING_FLUSH_AFTER,
            startup_crc_grace: Some(Duration::from_secs(1)),
        }
    }
}

/// Cloneable handle that can stop or reset a running capture from anywhere,
/// e.g. a Ctrl-C handler.
#[derive(Debug, Clone)]
pub struct CaptureControl {
    running: Arc<AtomicBool>,
    command_tx: Sender<CaptureCommand>,
}

impl CaptureControl {
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            let _ = self.command_tx.send(CaptureCommand::Stop);
        }
    }

    pub fn clear(&self) {
        let _ = self.command_tx.send(CaptureCommand::Clear);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

pub struct LiveCapture {
    line: String,
    link: LinkConfig,
    control: CaptureControl,
    event_rx: Receiver<CaptureEvent>,
    workers: Vec<JoinHandle<()>>,
    _lease: LineLease,
}

impl std::fmt::Debug for LiveCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveCapture")
            .field("line", &self.line)
            .field("link", &self.link)
            .field("running", &self.control.is_running())
            .finish_non_exhaustive()
    }
}

impl LiveCapture {
    /// Configure and open `source`, then spawn the three stages.
    pub fn start<S>(mut source: S, link: LinkConfig, options: CaptureOptions) -> Result<Self>
    where
        S: ByteSource + 'static,
    {
        let line = source.name().to_string();
        let lease = LineLease::acquire(&line)?;
        source.configure(&link)?;
        source.open()?;
        log::info!("capture on {line} started at {link}");

        let running = Arc::new(AtomicBool::new(true));
        let (command_tx, command_rx) = flume::unbounded();
        let (event_tx, event_rx) = flume::unbounded();
        let (candidate_tx, candidate_rx) = flume::unbounded();
        let (decoded_tx, decoded_rx) = flume::bounded(options.decoded_queue_capacity.max(1));
        let (closed_tx, closed_rx) = flume::bounded(1);

        let reader = {
            let running = Arc::clone(&running);
            let framing = options.framing.clone();
            thread::spawn(move || {
                run_reader(source, link, framing, running, candidate_tx, closed_tx)
            })
        };
        let dropped = Arc::new(AtomicU64::new(0));
        let decoder = {
            let dropped = Arc::clone(&dropped);
            thread::spawn(move || run_decoder(candidate_rx, decoded_tx, dropped))
        };
        let correlator = {
            let stage = CorrelationStage {
                line: line.clone(),
                options,
                running: Arc::clone(&running),
                dropped,
            };
            thread::spawn(move || stage.run(decoded_rx, command_rx, closed_rx, event_tx))
        };

        Ok(Self {
            line,
            link,
            control: CaptureControl {
                running,
                command_tx,
            },
            event_rx,
            workers: vec![reader, decoder, correlator],
            _lease: lease,
        })
    }

    pub fn line(&self) -> &str {
        &self.line
    }

    pub fn link(&self) -> LinkConfig {
        self.link
    }

    pub fn control(&self) -> CaptureControl {
        self.control.clone()
    }

    pub fn events(&self) -> Receiver<CaptureEvent> {
        self.event_rx.clone()
    }

    pub fn bus(&self) -> Bus {
        Bus::new(self.event_rx.clone(), self.control.command_tx.clone())
    }

    pub fn stop(&self) {
        self.control.stop();
    }

    /// Stop and wait for every stage to finish. Pending responses are flushed
    /// as events before [`CaptureEvent::Stopped`].
    pub fn join(mut self) {
        self.control.stop();
        self.join_workers();
    }

    fn join_workers(&mut self) {
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::warn!("a capture stage on {} panicked", self.line);
            }
        }
    }
}

impl Drop for LiveCapture {
    fn drop(&mut self) {
        self.control.stop();
        self.join_workers();
    }
}

fn run_reader<S: ByteSource>(
    mut source: S,
    link: LinkConfig,
    framing: FramingOptions,
    running: Arc<AtomicBool>,
    candidate_tx: Sender<CandidateFrame>,
    closed_tx: Sender<Option<String>>,
) {
    let termination = {
        let stop = Arc::clone(&running);
        let mut frames =
            Frames::new(&mut source, &link, &framing).until(move || !stop.load(Ordering::SeqCst));
        for frame in frames.by_ref() {
            if candidate_tx.send(frame).is_err() {
                break;
            }
        }
        frames.termination().map(str::to_string)
    };
    source.close();
    // a source that ends on its own takes the rest of the pipeline with it
    running.store(false, Ordering::SeqCst);
    let _ = closed_tx.send(termination);
}

fn run_decoder(
    candidate_rx: Receiver<CandidateFrame>,
    decoded_tx: Sender<DecodedFrame>,
    dropped: Arc<AtomicU64>,
) {
    for candidate in candidate_rx.iter() {
        if candidate.bytes.len() < MIN_FRAME_LEN {
            log::debug!("discarding {}-byte fragment", candidate.bytes.len());
            continue;
        }
        let frame = match decode(&candidate.bytes, candidate.completed_at) {
            Ok(frame) => frame,
            Err(err) => {
                log::warn!("decode fault: {err}");
                continue;
            }
        };
        match decoded_tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("decoded queue full, dropping {}", frame.hex());
            }
            Err(TrySendError::Disconnected(_)) => break,
        }
    }
}

struct CorrelationStage {
    line: String,
    options: CaptureOptions,
    running: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
}

impl CorrelationStage {
    fn run(
        self,
        decoded_rx: Receiver<DecodedFrame>,
        command_rx: Receiver<CaptureCommand>,
        closed_rx: Receiver<Option<String>>,
        event_tx: Sender<CaptureEvent>,
    ) {
        let started = Instant::now();
        let mut state = CorrelationState::new();
        let mut last_sweep = Instant::now();
        let emit = |event: CaptureEvent| {
            let _ = event_tx.send(event);
        };

        loop {
            while let Ok(command) = command_rx.try_recv() {
                match command {
                    CaptureCommand::Clear => {
                        log::info!("clearing capture session on {}", self.line);
                        state.clear();
                        emit(CaptureEvent::Cleared);
                    }
                    CaptureCommand::Stop => {
                        self.running.store(false, Ordering::SeqCst);
                    }
                }
            }

            let disconnected = loop {
                match decoded_rx.try_recv() {
                    Ok(frame) => {
                        if self.in_crc_grace(&frame, started) {
                            log::debug!("dropping startup frame {}", frame.hex());
                            continue;
                        }
                        for event in state.ingest(frame) {
                            emit(CaptureEvent::Record(event));
                        }
                    }
                    Err(TryRecvError::Empty) => break false,
                    Err(TryRecvError::Disconnected) => break true,
                }
            };

            if disconnected {
                for event in state.flush_pending() {
                    emit(CaptureEvent::Record(event));
                }
                let reason = closed_rx.try_recv().ok().flatten();
                emit(CaptureEvent::SourceClosed {
                    line: self.line.clone(),
                    reason,
                });
                let dropped_frames = self.dropped.load(Ordering::Relaxed);
                log::info!(
                    "capture on {} stopped, {} frames dropped",
                    self.line,
                    dropped_frames
                );
                emit(CaptureEvent::Stopped { dropped_frames });
                return;
            }

            if last_sweep.elapsed() >= self.options.sweep_interval {
                let now = Instant::now();
                for event in state.sweep(now, self.options.pending_flush_after) {
                    emit(CaptureEvent::Record(event));
                }
                last_sweep = now;
            }

            thread::sleep(self.options.drain_interval);
        }
    }

    fn in_crc_grace(&self, frame: &DecodedFrame, started: Instant) -> bool {
        !frame.crc_valid
            && self
                .options
                .startup_crc_grace
                .is_some_and(|grace| frame.received_at.saturating_duration_since(started) < grace)
    }
}
