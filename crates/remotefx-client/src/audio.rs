//! Real-time audio streaming to the remote host.
//!
//! Audio thread → lock-free queues → writer/reader tasks → audio socket.
//!
//! The audio thread never allocates and never blocks: frames come from a
//! pre-allocated pool, travel through `ArrayQueue`s, and the socket work runs
//! on the session runtime. `depth` silent frames are queued up front, so the
//! processed block returned by `read` lags the block passed to `send` by
//! `depth` callbacks.

use crate::codec::{self, FrameReader};
use crate::error::{ClientError, Result};
use crate::protocol::{
    AudioFrameHeader, MidiEvent, MidiEventVec, Precision, TransportInfo, MAX_MIDI_EVENTS,
};
use crossbeam::queue::ArrayQueue;
use parking_lot::{Mutex, MutexGuard};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};

/// Writer wait when no frame is queued, and its bounds. Derived from the
/// block period so a queued block waits at most a fraction of one callback.
const MIN_POLL_INTERVAL: Duration = Duration::from_micros(250);
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(2);
const POLLS_PER_BLOCK: u32 = 4;

/// Called once when a streamer's connection fails.
pub type FailureHook = Arc<dyn Fn(ClientError) + Send + Sync>;

/// Sample type of one of the two streamer precisions.
pub trait Sample: Copy + Default + PartialEq + Send + Sync + std::fmt::Debug + 'static {
    const PRECISION: Precision;

    fn extend_le(self, out: &mut Vec<u8>);

    /// `bytes` holds exactly one sample.
    fn from_le(bytes: &[u8]) -> Self;

    fn streamer(engine: &AudioEngine) -> Option<&AudioStreamer<Self>>;
}

impl Sample for f32 {
    const PRECISION: Precision = Precision::Single;

    fn extend_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }

    fn from_le(bytes: &[u8]) -> Self {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(bytes);
        f32::from_le_bytes(raw)
    }

    fn streamer(engine: &AudioEngine) -> Option<&AudioStreamer<Self>> {
        match engine {
            AudioEngine::Single(s) => Some(s),
            AudioEngine::Double(_) => None,
        }
    }
}

impl Sample for f64 {
    const PRECISION: Precision = Precision::Double;

    fn extend_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }

    fn from_le(bytes: &[u8]) -> Self {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        f64::from_le_bytes(raw)
    }

    fn streamer(engine: &AudioEngine) -> Option<&AudioStreamer<Self>> {
        match engine {
            AudioEngine::Double(s) => Some(s),
            AudioEngine::Single(_) => None,
        }
    }
}

/// Outcome of one real-time call. Anything but `Ok` means the output block
/// was filled with silence (an audible glitch).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Ok,
    /// The audio lock was not acquired within the retry budget.
    Contended,
    /// No processed frame was available.
    Underrun,
    /// No free frame to queue the input block.
    Overrun,
    NotReady,
}

impl StreamStatus {
    pub fn is_ok(self) -> bool {
        self == StreamStatus::Ok
    }
}

#[derive(Debug, Default)]
pub struct AudioStats {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    underruns: AtomicU64,
    overruns: AtomicU64,
    contention: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AudioStatsSnapshot {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub underruns: u64,
    pub overruns: u64,
    pub contention: u64,
}

impl AudioStats {
    pub fn snapshot(&self) -> AudioStatsSnapshot {
        AudioStatsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
            contention: self.contention.load(Ordering::Relaxed),
        }
    }
}

/// Negotiated stream shape.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamLayout {
    pub channels_in: usize,
    pub channels_out: usize,
    pub sample_rate: f64,
    pub block_size: usize,
    pub depth: usize,
}

struct Frame<T> {
    seq: u64,
    samples: usize,
    channels: Vec<Vec<T>>,
    midi: MidiEventVec,
    transport: TransportInfo,
}

impl<T: Sample> Frame<T> {
    fn new(num_channels: usize, block_size: usize) -> Self {
        Self {
            seq: 0,
            samples: block_size,
            channels: (0..num_channels).map(|_| vec![T::default(); block_size]).collect(),
            midi: MidiEventVec::new(),
            transport: TransportInfo::default(),
        }
    }

    fn silence(&mut self, samples: usize) {
        for ch in &mut self.channels {
            ch.fill(T::default());
        }
        self.samples = samples;
        self.midi.clear();
    }
}

type FrameQueue<T> = Arc<ArrayQueue<Box<Frame<T>>>>;

/// Bidirectional audio/MIDI stream for one sample precision.
pub struct AudioStreamer<T: Sample> {
    layout: StreamLayout,
    pool: FrameQueue<T>,
    outbound: FrameQueue<T>,
    inbound: FrameQueue<T>,
    healthy: Arc<AtomicBool>,
    stats: Arc<AudioStats>,
    seq: AtomicU64,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<Supervised>>,
}

impl<T: Sample> AudioStreamer<T> {
    /// Starts the writer and reader tasks on `runtime`.
    pub fn start<R, W>(
        runtime: &Handle,
        reader: FrameReader<R>,
        writer: W,
        layout: StreamLayout,
        stats: Arc<AudioStats>,
        on_failure: FailureHook,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let capacity = layout.depth * 2 + 2;
        let num_channels = layout.channels_in.max(layout.channels_out);
        let pool = Arc::new(ArrayQueue::new(capacity));
        let outbound = Arc::new(ArrayQueue::new(capacity));
        let inbound = Arc::new(ArrayQueue::new(capacity));

        for _ in 0..capacity - layout.depth {
            let _ = pool.push(Box::new(Frame::new(num_channels, layout.block_size)));
        }
        for _ in 0..layout.depth {
            let mut frame = Box::new(Frame::new(num_channels, layout.block_size));
            frame.silence(layout.block_size);
            let _ = inbound.push(frame);
        }

        let healthy = Arc::new(AtomicBool::new(true));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let writer_task = {
            let outbound = Arc::clone(&outbound);
            let pool = Arc::clone(&pool);
            let stats = Arc::clone(&stats);
            let shutdown_rx = shutdown_rx.clone();
            let guard = FailureGuard::new(&healthy, &on_failure, "audio writer");
            Supervised::spawn(
                runtime,
                guard,
                writer_loop(writer, layout, outbound, pool, stats, shutdown_rx),
            )
        };

        let reader_task = {
            let inbound = Arc::clone(&inbound);
            let pool = Arc::clone(&pool);
            let stats = Arc::clone(&stats);
            let guard = FailureGuard::new(&healthy, &on_failure, "audio reader");
            Supervised::spawn(
                runtime,
                guard,
                reader_loop::<T, R>(reader, layout, inbound, pool, stats, shutdown_rx),
            )
        };

        Self {
            layout,
            pool,
            outbound,
            inbound,
            healthy,
            stats,
            seq: AtomicU64::new(0),
            shutdown,
            tasks: Mutex::new(vec![writer_task, reader_task]),
        }
    }

    pub fn layout(&self) -> StreamLayout {
        self.layout
    }

    pub fn is_ok(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// `base_latency` (reported by the server) plus the jitter buffer.
    pub fn latency_samples(&self, base_latency: usize) -> usize {
        base_latency + self.layout.depth * self.layout.block_size
    }

    pub fn stats(&self) -> AudioStatsSnapshot {
        self.stats.snapshot()
    }

    /// Queues one input block (RT-safe, never blocks).
    pub fn send(&self, inputs: &[&[T]], midi: &[MidiEvent], transport: &TransportInfo) -> StreamStatus {
        if !self.is_ok() {
            return StreamStatus::NotReady;
        }
        let Some(mut frame) = self.pool.pop() else {
            self.stats.overruns.fetch_add(1, Ordering::Relaxed);
            return StreamStatus::Overrun;
        };

        let samples = inputs
            .iter()
            .map(|ch| ch.len())
            .max()
            .unwrap_or(self.layout.block_size)
            .min(self.layout.block_size);

        for ch in 0..self.layout.channels_in {
            let dest = &mut frame.channels[ch][..samples];
            match inputs.get(ch) {
                Some(src) => {
                    let n = src.len().min(samples);
                    dest[..n].copy_from_slice(&src[..n]);
                    dest[n..].fill(T::default());
                }
                None => dest.fill(T::default()),
            }
        }

        frame.samples = samples;
        frame.midi.clear();
        frame
            .midi
            .extend_from_slice(&midi[..midi.len().min(MAX_MIDI_EVENTS)]);
        frame.transport = *transport;
        frame.seq = self.seq.fetch_add(1, Ordering::Relaxed);

        if let Err(frame) = self.outbound.push(frame) {
            let _ = self.pool.push(frame);
            self.stats.overruns.fetch_add(1, Ordering::Relaxed);
            return StreamStatus::Overrun;
        }
        StreamStatus::Ok
    }

    /// Fills `outputs` with the oldest processed block (RT-safe, never blocks).
    pub fn read(&self, outputs: &mut [&mut [T]], midi_out: &mut MidiEventVec) -> StreamStatus {
        midi_out.clear();
        let Some(frame) = self.inbound.pop() else {
            fill_silence(outputs);
            self.stats.underruns.fetch_add(1, Ordering::Relaxed);
            return StreamStatus::Underrun;
        };

        for (ch, out) in outputs.iter_mut().enumerate() {
            if ch < self.layout.channels_out {
                let n = out.len().min(frame.samples);
                out[..n].copy_from_slice(&frame.channels[ch][..n]);
                out[n..].fill(T::default());
            } else {
                out.fill(T::default());
            }
        }
        midi_out.extend_from_slice(&frame.midi);

        let _ = self.pool.push(frame);
        StreamStatus::Ok
    }

    /// Signals both tasks to stop and waits up to `wait` for them.
    pub fn stop(&self, runtime: &Handle, wait: Duration) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        if tasks.is_empty() {
            return;
        }
        let workers: Vec<_> = tasks.iter().map(|t| t.worker.clone()).collect();
        let joined = runtime.block_on(async {
            tokio::time::timeout(wait, async {
                for task in tasks {
                    let _ = task.supervisor.await;
                }
            })
            .await
        });
        if joined.is_err() {
            tracing::warn!("audio streamer did not stop within {:?}, aborting", wait);
            for worker in workers {
                worker.abort();
            }
        }
    }
}

impl<T: Sample> Drop for AudioStreamer<T> {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

pub(crate) fn fill_silence<T: Sample>(outputs: &mut [&mut [T]]) {
    for out in outputs.iter_mut() {
        out.fill(T::default());
    }
}

/// Marks the stream unhealthy and reports the error when a task fails.
pub(crate) struct FailureGuard {
    healthy: Arc<AtomicBool>,
    on_failure: FailureHook,
    name: &'static str,
}

impl FailureGuard {
    pub(crate) fn new(healthy: &Arc<AtomicBool>, on_failure: &FailureHook, name: &'static str) -> Self {
        Self {
            healthy: Arc::clone(healthy),
            on_failure: Arc::clone(on_failure),
            name,
        }
    }

    fn finish(self, result: Result<()>) {
        if let Err(e) = result {
            tracing::error!("{} failed: {}", self.name, e);
            if self.healthy.swap(false, Ordering::AcqRel) {
                (self.on_failure)(e);
            }
        }
    }
}

/// A streaming task plus the task that reports how it ended.
///
/// The worker runs as its own task so a panic in it surfaces as a
/// `JoinError` here and is reported like any other failure. Cancellation
/// (abort during stop) is not a failure.
pub(crate) struct Supervised {
    pub(crate) supervisor: JoinHandle<()>,
    pub(crate) worker: AbortHandle,
}

impl Supervised {
    pub(crate) fn spawn<F>(runtime: &Handle, guard: FailureGuard, future: F) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let worker = runtime.spawn(future);
        let abort = worker.abort_handle();
        let supervisor = runtime.spawn(async move {
            match worker.await {
                Ok(result) => guard.finish(result),
                Err(e) if e.is_panic() => {
                    let name = guard.name;
                    guard.finish(Err(ClientError::Protocol(format!("{} panicked", name))));
                }
                Err(_) => {}
            }
        });
        Self {
            supervisor,
            worker: abort,
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.supervisor.is_finished()
    }

    pub(crate) fn abort(&self) {
        self.worker.abort();
        self.supervisor.abort();
    }
}

/// Writer idle wait for one block of `layout`.
fn poll_interval(layout: &StreamLayout) -> Duration {
    let block = Duration::from_secs_f64(layout.block_size as f64 / layout.sample_rate.max(1.0));
    (block / POLLS_PER_BLOCK).clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL)
}

async fn writer_loop<T: Sample, W: AsyncWrite + Unpin>(
    mut writer: W,
    layout: StreamLayout,
    outbound: FrameQueue<T>,
    pool: FrameQueue<T>,
    stats: Arc<AudioStats>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut payload = Vec::new();
    let idle = poll_interval(&layout);
    loop {
        if *shutdown.borrow() {
            return Ok(());
        }
        let mut frame = match outbound.pop() {
            Some(frame) => frame,
            None => {
                tokio::select! {
                    _ = shutdown.changed() => return Ok(()),
                    _ = tokio::time::sleep(idle) => {}
                }
                continue;
            }
        };

        let header = AudioFrameHeader {
            seq: frame.seq,
            precision: T::PRECISION,
            channels: layout.channels_in as u16,
            samples: frame.samples as u32,
            midi: std::mem::take(&mut frame.midi),
            transport: frame.transport,
        };
        let encoded = codec::encode_audio(&header, &frame.channels[..layout.channels_in], &mut payload);
        let _ = pool.push(frame);
        encoded?;

        codec::write_frame(&mut writer, &payload).await?;
        stats.frames_sent.fetch_add(1, Ordering::Relaxed);
    }
}

async fn reader_loop<T: Sample, R: AsyncRead + Unpin>(
    mut reader: FrameReader<R>,
    layout: StreamLayout,
    inbound: FrameQueue<T>,
    pool: FrameQueue<T>,
    stats: Arc<AudioStats>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        if *shutdown.borrow() {
            return Ok(());
        }
        let payload = tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            frame = reader.next_frame() => frame?,
        };
        let (header, body) = codec::decode_audio(&payload)?;
        if header.precision != T::PRECISION {
            return Err(ClientError::Protocol(format!(
                "audio frame {} has precision {:?}, stream is {:?}",
                header.seq,
                header.precision,
                T::PRECISION
            )));
        }

        let Some(mut frame) = pool.pop() else {
            stats.overruns.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("dropping audio frame {}: no free buffer", header.seq);
            continue;
        };

        let samples = (header.samples as usize).min(layout.block_size);
        for ch in 0..layout.channels_out {
            let dest = &mut frame.channels[ch][..];
            let n = codec::read_channel(&header, body, ch, &mut dest[..samples]);
            dest[n..].fill(T::default());
        }
        frame.seq = header.seq;
        frame.samples = samples;
        frame.midi.clear();
        frame
            .midi
            .extend_from_slice(&header.midi[..header.midi.len().min(MAX_MIDI_EVENTS)]);
        frame.transport = header.transport;

        if let Err(frame) = inbound.push(frame) {
            let _ = pool.push(frame);
            stats.overruns.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        stats.frames_received.fetch_add(1, Ordering::Relaxed);
    }
}

/// The active streamer, selected by the negotiated precision.
pub enum AudioEngine {
    Single(AudioStreamer<f32>),
    Double(AudioStreamer<f64>),
}

impl AudioEngine {
    pub fn precision(&self) -> Precision {
        match self {
            AudioEngine::Single(_) => Precision::Single,
            AudioEngine::Double(_) => Precision::Double,
        }
    }

    pub fn is_ok(&self) -> bool {
        match self {
            AudioEngine::Single(s) => s.is_ok(),
            AudioEngine::Double(s) => s.is_ok(),
        }
    }

    pub fn latency_samples(&self, base_latency: usize) -> usize {
        match self {
            AudioEngine::Single(s) => s.latency_samples(base_latency),
            AudioEngine::Double(s) => s.latency_samples(base_latency),
        }
    }

    pub fn stop(&self, runtime: &Handle, wait: Duration) {
        match self {
            AudioEngine::Single(s) => s.stop(runtime, wait),
            AudioEngine::Double(s) => s.stop(runtime, wait),
        }
    }
}

/// Audio-access lock shared by the real-time path and the control path.
///
/// The real-time path only ever uses [`AudioAccess::try_acquire`], which gives
/// up after a fixed number of short retries.
pub struct AudioAccess {
    engine: Mutex<Option<AudioEngine>>,
    retries: AtomicU32,
    retry_interval_us: AtomicU64,
    stats: Arc<AudioStats>,
}

pub struct AudioGuard<'a> {
    guard: MutexGuard<'a, Option<AudioEngine>>,
}

impl AudioAccess {
    pub fn new(retries: u32, retry_interval: Duration) -> Self {
        Self {
            engine: Mutex::new(None),
            retries: AtomicU32::new(retries.max(1)),
            retry_interval_us: AtomicU64::new(retry_interval.as_micros() as u64),
            stats: Arc::new(AudioStats::default()),
        }
    }

    pub fn stats(&self) -> &Arc<AudioStats> {
        &self.stats
    }

    /// Worst-case time `try_acquire` can spend before giving up.
    pub fn retry_budget(&self) -> Duration {
        let retries = self.retries.load(Ordering::Relaxed);
        let interval = Duration::from_micros(self.retry_interval_us.load(Ordering::Relaxed));
        interval * retries.saturating_sub(1)
    }

    /// Bounded-retry acquire for the real-time path.
    pub fn try_acquire(&self) -> Result<AudioGuard<'_>> {
        let retries = self.retries.load(Ordering::Relaxed);
        let interval = Duration::from_micros(self.retry_interval_us.load(Ordering::Relaxed));
        let started = Instant::now();
        for attempt in 1..=retries {
            if let Some(guard) = self.engine.try_lock() {
                return Ok(AudioGuard { guard });
            }
            if attempt < retries {
                std::thread::sleep(interval);
            }
        }
        self.stats.contention.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            "failed to lock audio stream after {} attempts ({:?}), this will cause audio stutter",
            retries,
            started.elapsed()
        );
        Err(ClientError::RealtimeContention { attempts: retries })
    }

    /// Timed acquire for control-path checks that must honor a deadline.
    pub fn acquire_for(&self, timeout: Duration) -> Option<AudioGuard<'_>> {
        self.engine
            .try_lock_for(timeout)
            .map(|guard| AudioGuard { guard })
    }

    /// Blocking acquire. Never call from the real-time path.
    pub fn acquire(&self) -> AudioGuard<'_> {
        AudioGuard {
            guard: self.engine.lock(),
        }
    }
}

impl<'a> AudioGuard<'a> {
    pub fn engine(&self) -> Option<&AudioEngine> {
        self.guard.as_ref()
    }

    pub fn streamer<T: Sample>(&self) -> Option<&AudioStreamer<T>> {
        self.guard.as_ref().and_then(T::streamer)
    }

    pub fn replace(&mut self, engine: Option<AudioEngine>) -> Option<AudioEngine> {
        std::mem::replace(&mut *self.guard, engine)
    }

    pub fn take(&mut self) -> Option<AudioEngine> {
        self.guard.take()
    }

    pub fn is_ok(&self) -> bool {
        self.guard.as_ref().is_some_and(AudioEngine::is_ok)
    }
}
