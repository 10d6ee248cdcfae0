//! Staged recording pipeline
//!
//! A pipeline moves frames off a capture thread through three kinds of stage
//! threads connected by bounded channels:
//!
//! - Intake: `Pipeline::push()` stamps a sequence number and enqueues the frame,
//!   either blocking or dropping (and counting) when the intake is full
//! - Transform: N worker threads run the transform function (compression,
//!   still development, ...) in parallel
//! - Write: a single thread hands results to a [`FrameSink`], either in
//!   sequence order (re-serialized through a reorder buffer) or in completion
//!   order when every output is an independent file
//!
//! `close()` pushes one sentinel per worker and joins every stage, so all
//! accepted frames are on disk when it returns.

pub mod channel;

pub use channel::{BoundedChannel, ChannelError};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

/// Error type for pipeline operations
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Transform failed: {0}")]
    Transform(String),

    #[error("Failed to spawn stage thread: {0}")]
    Spawn(std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// How often a blocked intake push checks that a worker is still draining
const INTAKE_POLL: Duration = Duration::from_millis(50);

/// One captured frame, owned by whichever stage currently holds it
#[derive(Debug, Clone)]
pub struct Frame {
    /// Assigned by the pipeline on successful intake
    pub seq: u64,
    /// Position on the nominal frame grid of the output, set by the producer
    pub slot: u64,
    /// Seconds, relative to the first frame of the source
    pub timestamp: f64,
    pub black_level: u32,
    pub width: u32,
    pub height: u32,
    pub bitcount: u8,
    /// Single-channel pixels, 1 byte per pixel up to 8 bits, 2 (LE) above
    pub pixels: Vec<u8>,
}

impl Frame {
    pub fn new(pixels: Vec<u8>, width: u32, height: u32, bitcount: u8, timestamp: f64, black_level: u32) -> Self {
        Self {
            seq: 0,
            slot: 0,
            timestamp,
            black_level,
            width,
            height,
            bitcount,
            pixels,
        }
    }

    pub fn bytes_per_pixel(&self) -> usize {
        if self.bitcount > 8 { 2 } else { 1 }
    }

    pub fn with_slot(mut self, slot: u64) -> Self {
        self.slot = slot;
        self
    }

    fn tag(&self) -> FrameTag {
        FrameTag {
            seq: self.seq,
            slot: self.slot,
            timestamp: self.timestamp,
        }
    }
}

/// Identity of a frame as seen by the write stage
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameTag {
    pub seq: u64,
    pub slot: u64,
    pub timestamp: f64,
}

/// What `push()` does when the intake is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushMode {
    /// Wait for space; no frame is ever lost
    Blocking,
    /// Reject immediately and count a dropped frame
    DropWhenFull,
}

/// Order in which transformed frames reach the sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOrder {
    /// Strict sequence order (append-only outputs)
    Sequential,
    /// Whatever order the workers finish in (one file per frame)
    Completion,
}

/// Result of a single `push()`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted(u64),
    Dropped,
    Closed,
}

/// Backlog kind reported by `buffers_used`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// Frames waiting for a transform worker
    Encoding,
    /// Transformed frames waiting for the write stage
    Writing,
}

/// Stage layout for one pipeline instance
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Prefix for stage thread names
    pub name: String,
    pub workers: usize,
    pub intake_capacity: usize,
    pub output_capacity: usize,
    pub push_mode: PushMode,
    pub write_order: WriteOrder,
}

/// Final destination of transformed frames, driven by the write stage only
pub trait FrameSink<U>: Send {
    /// Persist one frame and return the number of bytes written
    fn write(&mut self, tag: FrameTag, item: U) -> std::io::Result<u64>;

    /// Slot `seq` failed in the transform stage and will never be written
    fn skip(&mut self, _seq: u64) {}

    /// Called once after the last frame
    fn finish(&mut self) -> std::io::Result<()> {
        Ok(())
    }

    /// Files produced by this sink
    fn outputs(&self) -> Vec<PathBuf>;
}

/// Per-frame transform run on the worker threads
pub type TransformFn<U> = Arc<dyn Fn(Frame) -> Result<U> + Send + Sync>;

/// Counters shared between the producer and the stage threads
#[derive(Debug, Default)]
struct PipelineCounters {
    accepted: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
    written: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

/// Point-in-time copy of the pipeline counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub accepted: u64,
    /// Rejected at intake (queue full)
    pub dropped: u64,
    /// Lost in the transform or write stage
    pub failed: u64,
    pub written: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl PipelineStats {
    /// Every frame that never made it to disk
    pub fn lost(&self) -> u64 {
        self.dropped + self.failed
    }
}

/// What the write stage leaves behind once it exits
#[derive(Debug, Clone, Default)]
pub struct SinkReport {
    pub outputs: Vec<PathBuf>,
    pub error: Option<String>,
}

struct Completed<U> {
    tag: FrameTag,
    item: Option<U>,
}

struct Gate {
    next_seq: u64,
    closed: bool,
}

pub struct Pipeline<U: Send + 'static> {
    name: String,
    intake: BoundedChannel<Frame>,
    output: BoundedChannel<Completed<U>>,
    push_mode: PushMode,
    workers: usize,
    live_workers: Arc<AtomicUsize>,
    gate: Mutex<Gate>,
    counters: Arc<PipelineCounters>,
    reorder_backlog: Arc<AtomicUsize>,
    worker_threads: Mutex<Vec<JoinHandle<()>>>,
    writer_thread: Mutex<Option<JoinHandle<SinkReport>>>,
    report: Mutex<Option<SinkReport>>,
}

impl<U: Send + 'static> Pipeline<U> {
    /// Spawn the stage threads. Fails only if a thread cannot be created, in
    /// which case every thread already started is told to exit.
    pub fn new(config: PipelineConfig, transform: TransformFn<U>, sink: Box<dyn FrameSink<U>>) -> Result<Self> {
        let workers = config.workers.max(1);
        let intake = BoundedChannel::new(config.intake_capacity);
        let output = BoundedChannel::new(config.output_capacity);
        let counters = Arc::new(PipelineCounters::default());
        let reorder_backlog = Arc::new(AtomicUsize::new(0));
        let live_workers = Arc::new(AtomicUsize::new(workers));

        let writer_thread = {
            let output = output.clone();
            let counters = counters.clone();
            let backlog = reorder_backlog.clone();
            let order = config.write_order;
            let name = config.name.clone();
            std::thread::Builder::new()
                .name(format!("{}-write", config.name))
                .spawn(move || write_stage(name, output, sink, order, counters, backlog))
                .map_err(PipelineError::Spawn)?
        };

        let mut worker_threads = Vec::with_capacity(workers);
        for index in 0..workers {
            let intake_rx = intake.clone();
            let exit = WorkerExit {
                live: live_workers.clone(),
                output: output.clone(),
            };
            let transform = transform.clone();
            let counters = counters.clone();
            let name = config.name.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("{}-encode-{}", config.name, index))
                .spawn(move || transform_stage(name, intake_rx, transform, counters, exit));

            match spawned {
                Ok(handle) => worker_threads.push(handle),
                Err(e) => {
                    log::error!("[{}] Failed to spawn worker {}: {}", config.name, index, e);
                    live_workers.store(worker_threads.len(), Ordering::SeqCst);
                    if worker_threads.is_empty() {
                        let _ = output.push_sentinel();
                    }
                    for _ in 0..worker_threads.len() {
                        let _ = intake.push_sentinel();
                    }
                    for handle in worker_threads {
                        let _ = handle.join();
                    }
                    let _ = writer_thread.join();
                    return Err(PipelineError::Spawn(e));
                }
            }
        }

        log::debug!("[{}] Pipeline started with {} workers", config.name, workers);

        Ok(Self {
            name: config.name,
            intake,
            output,
            push_mode: config.push_mode,
            workers,
            live_workers,
            gate: Mutex::new(Gate { next_seq: 0, closed: false }),
            counters,
            reorder_backlog,
            worker_threads: Mutex::new(worker_threads),
            writer_thread: Mutex::new(Some(writer_thread)),
            report: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hand a frame to the intake stage. The sequence number is only consumed
    /// when the frame is accepted, so written sequences stay contiguous.
    pub fn push(&self, mut frame: Frame) -> PushOutcome {
        let mut gate = self.gate.lock();
        if gate.closed {
            return PushOutcome::Closed;
        }

        let seq = gate.next_seq;
        frame.seq = seq;
        let raw_len = frame.pixels.len() as u64;

        let accepted = match self.push_mode {
            PushMode::Blocking => self.intake.push_while(frame, INTAKE_POLL, || self.workers_alive()).is_ok(),
            PushMode::DropWhenFull => self.intake.try_push(frame),
        };

        if accepted {
            gate.next_seq += 1;
            self.counters.accepted.fetch_add(1, Ordering::Relaxed);
            self.counters.bytes_in.fetch_add(raw_len, Ordering::Relaxed);
            PushOutcome::Accepted(seq)
        } else {
            let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped % 100 == 1 {
                log::warn!("[{}] Intake full, {} frames dropped so far", self.name, dropped);
            }
            PushOutcome::Dropped
        }
    }

    /// Backlog of one stage as a 0-100 percentage
    pub fn buffers_used(&self, kind: BufferKind) -> u8 {
        match kind {
            BufferKind::Encoding => self.intake.occupancy_percent(),
            BufferKind::Writing => {
                let in_flight = self.output.len() + self.reorder_backlog.load(Ordering::Relaxed);
                ((in_flight * 100) / self.output.capacity()).min(100) as u8
            }
        }
    }

    pub fn stats(&self) -> PipelineStats {
        let c = &self.counters;
        PipelineStats {
            accepted: c.accepted.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            written: c.written.load(Ordering::Relaxed),
            bytes_in: c.bytes_in.load(Ordering::Relaxed),
            bytes_out: c.bytes_out.load(Ordering::Relaxed),
        }
    }

    fn workers_alive(&self) -> bool {
        self.live_workers.load(Ordering::SeqCst) > 0
    }

    pub fn is_closed(&self) -> bool {
        self.gate.lock().closed
    }

    /// Drain every stage and wait for the threads to exit. Safe to call more
    /// than once; later calls return the first report.
    pub fn close(&self) -> SinkReport {
        {
            let mut gate = self.gate.lock();
            if !gate.closed {
                gate.closed = true;
                for _ in 0..self.workers {
                    if let Err(e) = self.intake.push_sentinel_while(INTAKE_POLL, || self.workers_alive()) {
                        log::warn!("[{}] Intake not drained on close: {}", self.name, e);
                        break;
                    }
                }
            }
        }

        let workers: Vec<_> = self.worker_threads.lock().drain(..).collect();
        for handle in workers {
            if handle.join().is_err() {
                log::error!("[{}] Transform worker panicked", self.name);
            }
        }

        if let Some(handle) = self.writer_thread.lock().take() {
            match handle.join() {
                Ok(report) => *self.report.lock() = Some(report),
                Err(_) => {
                    log::error!("[{}] Write stage panicked", self.name);
                    *self.report.lock() = Some(SinkReport {
                        outputs: Vec::new(),
                        error: Some("write stage panicked".into()),
                    });
                }
            }
        }

        self.report.lock().clone().unwrap_or_default()
    }
}

impl<U: Send + 'static> Drop for Pipeline<U> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Decrements the live-worker count on exit (including unwinding) and lets
/// the last worker out forward the sentinel to the write stage.
struct WorkerExit<U> {
    live: Arc<AtomicUsize>,
    output: BoundedChannel<Completed<U>>,
}

impl<U> Drop for WorkerExit<U> {
    fn drop(&mut self) {
        if self.live.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _ = self.output.push_sentinel();
        }
    }
}

fn transform_stage<U>(
    name: String,
    intake: BoundedChannel<Frame>,
    transform: TransformFn<U>,
    counters: Arc<PipelineCounters>,
    exit: WorkerExit<U>,
) {
    while let Some(frame) = intake.pop_blocking() {
        let tag = frame.tag();
        let item = match transform(frame) {
            Ok(item) => Some(item),
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                log::warn!("[{}] Frame {} lost in transform: {}", name, tag.seq, e);
                None
            }
        };
        if exit.output.push_blocking(Completed { tag, item }).is_err() {
            break;
        }
    }
    drop(exit);
}

fn write_stage<U>(
    name: String,
    output: BoundedChannel<Completed<U>>,
    mut sink: Box<dyn FrameSink<U>>,
    order: WriteOrder,
    counters: Arc<PipelineCounters>,
    backlog: Arc<AtomicUsize>,
) -> SinkReport {
    let mut reorder: BTreeMap<u64, Completed<U>> = BTreeMap::new();
    let mut next_seq = 0u64;

    while let Some(done) = output.pop_blocking() {
        match order {
            WriteOrder::Completion => write_one(&name, sink.as_mut(), done, &counters),
            WriteOrder::Sequential => {
                reorder.insert(done.tag.seq, done);
                while let Some(ready) = reorder.remove(&next_seq) {
                    write_one(&name, sink.as_mut(), ready, &counters);
                    next_seq += 1;
                }
                backlog.store(reorder.len(), Ordering::Relaxed);
            }
        }
    }

    // Only reachable with holes in the sequence, keep what we have in order
    for (_, done) in std::mem::take(&mut reorder) {
        write_one(&name, sink.as_mut(), done, &counters);
    }
    backlog.store(0, Ordering::Relaxed);

    let error = match sink.finish() {
        Ok(()) => None,
        Err(e) => {
            log::error!("[{}] Failed to finalize output: {}", name, e);
            Some(e.to_string())
        }
    };

    log::debug!(
        "[{}] Write stage done: {} written, {} failed",
        name,
        counters.written.load(Ordering::Relaxed),
        counters.failed.load(Ordering::Relaxed)
    );

    SinkReport { outputs: sink.outputs(), error }
}

fn write_one<U>(name: &str, sink: &mut dyn FrameSink<U>, done: Completed<U>, counters: &PipelineCounters) {
    match done.item {
        None => sink.skip(done.tag.seq),
        Some(item) => match sink.write(done.tag, item) {
            Ok(bytes) => {
                counters.written.fetch_add(1, Ordering::Relaxed);
                counters.bytes_out.fetch_add(bytes, Ordering::Relaxed);
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                log::warn!("[{}] Frame {} lost in write: {}", name, done.tag.seq, e);
            }
        },
    }
}
