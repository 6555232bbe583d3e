//! Gap-free playback of streamed speech
//!
//! Buffers are placed back to back on a timeline measured by the output
//! clock. A render thread mixes the timeline into fixed blocks and writes
//! them to the speaker; the clock is the number of frames rendered so far.
//!
//! A device failure on the render thread stops the timeline and is published
//! through [`PlaybackScheduler::watch_fault`]; after that nothing more can be
//! scheduled.
//!
//! The timeline is the single owner of every scheduled source. Sources live
//! in an arena keyed by a monotonic id so that an interrupt and a natural
//! completion racing for the same source both resolve to one removal.

use crate::audio::{AudioError, SpeakerSink};
use crate::audio_decode::PlaybackBuffer;
use crate::config::{ANALYSER_FFT_SIZE, OUTPUT_CHANNELS, OUTPUT_SAMPLE_RATE, RENDER_BLOCK_FRAMES};
use crate::spectrum::{SpectrumAnalyzer, SpectrumTap};
use crate::tdbg;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    #[error("audio output unavailable: {0}")]
    Unavailable(String),
}

impl PlaybackError {
    pub fn user_message(&self) -> String {
        "Audio output is not available. Check your speakers or headphones.".to_string()
    }
}

impl From<AudioError> for PlaybackError {
    fn from(e: AudioError) -> Self {
        PlaybackError::Unavailable(e.to_string())
    }
}

/// Current position of the output timeline, in seconds.
pub trait OutputClock: Send + Sync {
    fn now(&self) -> f64;
}

/// Clock advanced by the render thread, one block at a time.
#[derive(Debug)]
pub struct FrameClock {
    frames: AtomicU64,
    sample_rate: u32,
}

impl FrameClock {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            frames: AtomicU64::new(0),
            sample_rate,
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }

    pub fn advance(&self, frames: u64) {
        self.frames.fetch_add(frames, Ordering::AcqRel);
    }
}

impl OutputClock for FrameClock {
    fn now(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }
}

/// Externally driven clock for headless use.
#[derive(Debug, Default)]
pub struct ManualClock {
    micros: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, seconds: f64) {
        self.micros
            .store((seconds.max(0.0) * 1e6).round() as u64, Ordering::Release);
    }

    pub fn advance(&self, seconds: f64) {
        self.set(self.now() + seconds);
    }
}

impl OutputClock for ManualClock {
    fn now(&self) -> f64 {
        self.micros.load(Ordering::Acquire) as f64 / 1e6
    }
}

pub type SourceId = u64;

/// One buffer placed on the timeline.
#[derive(Debug)]
pub struct ScheduledSource {
    id: SourceId,
    start_at: f64,
    buffer: PlaybackBuffer,
}

impl ScheduledSource {
    pub fn id(&self) -> SourceId {
        self.id
    }

    pub fn start_at(&self) -> f64 {
        self.start_at
    }

    pub fn end_at(&self) -> f64 {
        self.start_at + self.buffer.duration()
    }
}

/// Result of [`PlaybackScheduler::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scheduled {
    pub id: SourceId,
    pub start_at: f64,
    pub end_at: f64,
}

#[derive(Debug, Default)]
struct Timeline {
    sources: BTreeMap<SourceId, ScheduledSource>,
    next_id: SourceId,
    next_start_time: f64,
    /// Bumped by every interrupt so the render side can drop queued output.
    epoch: u64,
}

impl Timeline {
    fn schedule(&mut self, buffer: PlaybackBuffer, clock_now: f64) -> Scheduled {
        let start_at = self.next_start_time.max(clock_now);
        let id = self.next_id;
        self.next_id += 1;

        let source = ScheduledSource {
            id,
            start_at,
            buffer,
        };
        let end_at = source.end_at();
        self.sources.insert(id, source);
        self.next_start_time = end_at;

        Scheduled { id, start_at, end_at }
    }

    fn stop_all(&mut self) -> usize {
        let stopped = self.sources.len();
        self.sources.clear();
        self.next_start_time = 0.0;
        self.epoch += 1;
        stopped
    }

    /// Remove a finished source. Returns false if it was already gone.
    fn complete(&mut self, id: SourceId) -> bool {
        self.sources.remove(&id).is_some()
    }

    /// Drop every source that has fully played by `clock_now`.
    fn reap(&mut self, clock_now: f64) -> usize {
        let finished: Vec<SourceId> = self
            .sources
            .values()
            .filter(|s| s.end_at() <= clock_now)
            .map(|s| s.id)
            .collect();
        finished.iter().filter(|id| self.complete(**id)).count()
    }

    /// Mix the block starting at frame `block_start` into `out`
    /// (interleaved, `channels` wide) and retire sources that end inside it.
    fn render(&mut self, out: &mut [f32], channels: usize, block_start: u64, sample_rate: u32) {
        out.iter_mut().for_each(|s| *s = 0.0);
        let block_frames = (out.len() / channels) as u64;
        let block_end = block_start + block_frames;
        let rate = sample_rate as f64;

        let mut finished = Vec::new();
        for source in self.sources.values() {
            let start_frame = (source.start_at * rate).round() as u64;
            let len = source.buffer.frames() as u64;
            let end_frame = start_frame + len;

            if start_frame < block_end && end_frame > block_start {
                let from = start_frame.max(block_start);
                let to = end_frame.min(block_end);
                mix_into(out, channels, &source.buffer, from - block_start, from - start_frame, to - from);
            }
            if end_frame <= block_end {
                finished.push(source.id);
            }
        }

        for id in finished {
            if self.complete(id) {
                tdbg!("source {} finished", id);
            }
        }
    }
}

fn mix_into(
    out: &mut [f32],
    channels: usize,
    buffer: &PlaybackBuffer,
    out_offset: u64,
    src_offset: u64,
    frames: u64,
) {
    let src_channels = buffer.channel_count() as usize;
    for i in 0..frames as usize {
        let src = src_offset as usize + i;
        let dst = (out_offset as usize + i) * channels;
        if channels == 1 {
            let sum: f32 = (0..src_channels).map(|c| buffer.channel(c)[src]).sum();
            out[dst] += sum / src_channels as f32;
        } else {
            for ch in 0..channels {
                out[dst + ch] += buffer.channel(ch % src_channels)[src];
            }
        }
    }
}

struct RenderThread {
    shutdown: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Schedules decoded speech for contiguous playback.
pub struct PlaybackScheduler {
    timeline: Arc<Mutex<Timeline>>,
    clock: Arc<dyn OutputClock>,
    tap: SpectrumTap,
    render: Option<RenderThread>,
    /// Set once by the render thread when the device fails.
    fault: watch::Receiver<Option<String>>,
    closed: bool,
}

impl PlaybackScheduler {
    /// A scheduler with no output device, driven by an external clock.
    ///
    /// Sources complete once the clock passes their end time.
    pub fn headless(clock: Arc<dyn OutputClock>) -> Self {
        let (_, fault) = watch::channel(None);
        Self {
            timeline: Arc::new(Mutex::new(Timeline::default())),
            clock,
            tap: SpectrumTap::default(),
            render: None,
            fault,
            closed: false,
        }
    }

    /// Open the output device on a dedicated render thread and start the
    /// clock.
    ///
    /// `open` runs on the render thread; its error is returned here.
    pub fn spawn<F>(open: F) -> Result<Self, PlaybackError>
    where
        F: FnOnce() -> Result<Box<dyn SpeakerSink>, AudioError> + Send + 'static,
    {
        let timeline = Arc::new(Mutex::new(Timeline::default()));
        let clock = Arc::new(FrameClock::new(OUTPUT_SAMPLE_RATE));
        let shutdown = Arc::new(AtomicBool::new(false));
        let analyzer = SpectrumAnalyzer::new(ANALYSER_FFT_SIZE);
        let tap = analyzer.tap();
        let (fault_tx, fault) = watch::channel(None);

        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), AudioError>>();

        let handle = {
            let timeline = timeline.clone();
            let clock = clock.clone();
            let shutdown = shutdown.clone();
            std::thread::Builder::new()
                .name("playback-render".to_string())
                .spawn(move || {
                    let sink = match open() {
                        Ok(sink) => {
                            let _ = ready_tx.send(Ok(()));
                            sink
                        }
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    if let Err(e) = run_render_loop(sink, &timeline, &clock, analyzer, &shutdown) {
                        error!("Playback failed: {}", e);
                        let stopped = timeline.lock().stop_all();
                        debug!("{} sources dropped with the device", stopped);
                        fault_tx.send_replace(Some(e.to_string()));
                    }
                })
                .map_err(|e| PlaybackError::Unavailable(e.to_string()))?
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e.into());
            }
            Err(_) => {
                let _ = handle.join();
                return Err(PlaybackError::Unavailable(
                    "render thread exited before opening the device".to_string(),
                ));
            }
        }

        info!("Playback started at {} Hz", OUTPUT_SAMPLE_RATE);
        Ok(Self {
            timeline,
            clock,
            tap,
            render: Some(RenderThread { shutdown, handle }),
            fault,
            closed: false,
        })
    }

    /// Place `buffer` at the end of the timeline, or at the current clock
    /// time if the timeline has already run dry.
    ///
    /// Fails once the scheduler is shut down or the device has failed.
    pub fn enqueue(&self, buffer: PlaybackBuffer) -> Result<Scheduled, PlaybackError> {
        if let Some(e) = self.fault() {
            return Err(e);
        }
        if self.closed {
            return Err(PlaybackError::Unavailable("playback is shut down".to_string()));
        }
        if buffer.sample_rate() != OUTPUT_SAMPLE_RATE {
            warn!(
                "Scheduling {} Hz buffer on a {} Hz output",
                buffer.sample_rate(),
                OUTPUT_SAMPLE_RATE
            );
        }
        let mut timeline = self.timeline.lock();
        let clock_now = self.clock.now();
        if self.render.is_none() {
            timeline.reap(clock_now);
        }
        let scheduled = timeline.schedule(buffer, clock_now);
        debug!(
            "Scheduled source {} at {:.3}s (clock {:.3}s, ends {:.3}s)",
            scheduled.id, scheduled.start_at, clock_now, scheduled.end_at
        );
        Ok(scheduled)
    }

    /// Stop everything immediately and rewind the timeline.
    ///
    /// Returns the number of sources that were cut off.
    pub fn interrupt(&self) -> usize {
        let stopped = self.timeline.lock().stop_all();
        info!("Playback interrupted, {} sources stopped", stopped);
        stopped
    }

    /// Stop playback and release the output device. Safe to call repeatedly.
    pub fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.timeline.lock().stop_all();

        if let Some(render) = self.render.take() {
            render.shutdown.store(true, Ordering::Release);
            if render.handle.join().is_err() {
                error!("Playback render thread panicked");
            }
        }
        info!("Playback shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed
    }

    /// The device failure that stopped playback, if any.
    pub fn fault(&self) -> Option<PlaybackError> {
        self.fault
            .borrow()
            .as_ref()
            .map(|detail| PlaybackError::Unavailable(detail.clone()))
    }

    /// Changes once, to `Some(detail)`, if the output device fails.
    pub fn watch_fault(&self) -> watch::Receiver<Option<String>> {
        self.fault.clone()
    }

    /// Number of sources currently playing or waiting to play.
    pub fn active_sources(&self) -> usize {
        let mut timeline = self.timeline.lock();
        if self.render.is_none() {
            timeline.reap(self.clock.now());
        }
        timeline.sources.len()
    }

    pub fn next_start_time(&self) -> f64 {
        self.timeline.lock().next_start_time
    }

    pub fn clock_now(&self) -> f64 {
        self.clock.now()
    }

    /// Remove a source as naturally finished. Idempotent.
    pub fn complete(&self, id: SourceId) -> bool {
        self.timeline.lock().complete(id)
    }

    pub fn tap(&self) -> SpectrumTap {
        self.tap.clone()
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_render_loop(
    mut sink: Box<dyn SpeakerSink>,
    timeline: &Mutex<Timeline>,
    clock: &FrameClock,
    mut analyzer: SpectrumAnalyzer,
    shutdown: &AtomicBool,
) -> Result<(), AudioError> {
    let channels = OUTPUT_CHANNELS as usize;
    let mut block = vec![0.0f32; RENDER_BLOCK_FRAMES * channels];
    let mut seen_epoch = 0;

    tdbg!("render loop started");
    while !shutdown.load(Ordering::Acquire) {
        let epoch = {
            let mut timeline = timeline.lock();
            timeline.render(&mut block, channels, clock.frames(), OUTPUT_SAMPLE_RATE);
            // Advance under the lock so an enqueue never lands inside a block
            // that has already been mixed.
            clock.advance(RENDER_BLOCK_FRAMES as u64);
            timeline.epoch
        };

        if epoch != seen_epoch {
            seen_epoch = epoch;
            if let Err(e) = sink.flush() {
                warn!("Failed to flush output after interrupt: {}", e);
            }
        }

        analyzer.analyze(&block);

        sink.write_block(&block)?;
    }

    if let Err(e) = sink.flush() {
        debug!("Flush on shutdown failed: {}", e);
    }
    tdbg!("render loop stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::time::Duration;

    fn buffer(seconds: f64) -> PlaybackBuffer {
        PlaybackBuffer::silence(OUTPUT_SAMPLE_RATE, seconds)
    }

    fn headless() -> (Arc<ManualClock>, PlaybackScheduler) {
        let clock = Arc::new(ManualClock::new());
        let scheduler = PlaybackScheduler::headless(clock.clone());
        (clock, scheduler)
    }

    #[test]
    fn test_early_arrival_queues_after_previous() {
        let (clock, scheduler) = headless();

        let b1 = scheduler.enqueue(buffer(1.0)).unwrap();
        assert_abs_diff_eq!(b1.start_at, 0.0);

        clock.set(0.3);
        let b2 = scheduler.enqueue(buffer(0.5)).unwrap();
        assert_abs_diff_eq!(b2.start_at, 1.0);
        assert_abs_diff_eq!(b2.end_at, 1.5);
        assert_abs_diff_eq!(scheduler.next_start_time(), 1.5);
    }

    #[test]
    fn test_late_arrival_starts_now() {
        let (clock, scheduler) = headless();
        scheduler.enqueue(buffer(0.5)).unwrap();

        clock.set(2.0);
        let late = scheduler.enqueue(buffer(0.25)).unwrap();
        assert_abs_diff_eq!(late.start_at, 2.0);
        // The first source finished long ago.
        assert_eq!(scheduler.active_sources(), 1);
    }

    #[test]
    fn test_interrupt_clears_registry_and_clock() {
        let (clock, scheduler) = headless();
        for _ in 0..3 {
            scheduler.enqueue(buffer(1.0)).unwrap();
        }
        assert_eq!(scheduler.active_sources(), 3);
        assert_abs_diff_eq!(scheduler.next_start_time(), 3.0);

        assert_eq!(scheduler.interrupt(), 3);
        assert_eq!(scheduler.active_sources(), 0);
        assert_abs_diff_eq!(scheduler.next_start_time(), 0.0);

        clock.set(0.4);
        let next = scheduler.enqueue(buffer(0.5)).unwrap();
        assert_abs_diff_eq!(next.start_at, 0.4);
    }

    #[test]
    fn test_completion_is_idempotent() {
        let (_clock, scheduler) = headless();
        let s = scheduler.enqueue(buffer(1.0)).unwrap();
        assert!(scheduler.complete(s.id));
        assert!(!scheduler.complete(s.id));
        scheduler.interrupt();
        assert!(!scheduler.complete(s.id));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let (_clock, mut scheduler) = headless();
        scheduler.shutdown();
        scheduler.shutdown();
        assert!(scheduler.is_shut_down());

        let (_clock, mut scheduler) = headless();
        scheduler.enqueue(buffer(1.0)).unwrap();
        scheduler.shutdown();
        assert_eq!(scheduler.active_sources(), 0);
        drop(scheduler);
    }

    #[test]
    fn test_render_is_contiguous() {
        let mut timeline = Timeline::default();
        let rate = 100;
        let ones = PlaybackBuffer::from_planar(rate, vec![vec![1.0; 15]]).unwrap();
        let twos = PlaybackBuffer::from_planar(rate, vec![vec![2.0; 10]]).unwrap();
        timeline.schedule(ones, 0.0);
        timeline.schedule(twos, 0.0);

        let mut out = vec![0.0; 10];
        timeline.render(&mut out, 1, 0, rate);
        assert!(out.iter().all(|&s| s == 1.0));
        assert_eq!(timeline.sources.len(), 2);

        timeline.render(&mut out, 1, 10, rate);
        assert_eq!(&out[..5], &[1.0; 5]);
        assert_eq!(&out[5..], &[2.0; 5]);
        // The first source ended inside this block.
        assert_eq!(timeline.sources.len(), 1);

        timeline.render(&mut out, 1, 20, rate);
        assert_eq!(&out[..5], &[2.0; 5]);
        assert_eq!(&out[5..], &[0.0; 5]);
        assert!(timeline.sources.is_empty());
    }

    #[test]
    fn test_render_downmixes_to_mono() {
        let mut timeline = Timeline::default();
        let stereo = PlaybackBuffer::from_planar(100, vec![vec![1.0; 4], vec![0.0; 4]]).unwrap();
        timeline.schedule(stereo, 0.0);
        let mut out = vec![0.0; 4];
        timeline.render(&mut out, 1, 0, 100);
        assert!(out.iter().all(|&s| s == 0.5));
    }

    struct CountingSink {
        written: Arc<AtomicU64>,
        flushes: Arc<AtomicU64>,
    }

    impl SpeakerSink for CountingSink {
        fn write_block(&mut self, samples: &[f32]) -> Result<(), AudioError> {
            self.written.fetch_add(samples.len() as u64, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(1));
            Ok(())
        }

        fn flush(&mut self) -> Result<(), AudioError> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_spawned_scheduler_renders_and_releases() {
        let written = Arc::new(AtomicU64::new(0));
        let flushes = Arc::new(AtomicU64::new(0));
        let sink = CountingSink {
            written: written.clone(),
            flushes: flushes.clone(),
        };
        let mut scheduler =
            PlaybackScheduler::spawn(move || Ok(Box::new(sink) as Box<dyn SpeakerSink>)).unwrap();

        std::thread::sleep(Duration::from_millis(20));
        assert!(scheduler.clock_now() > 0.0);
        assert!(written.load(Ordering::SeqCst) > 0);

        // Starts at the current render position, never in the past.
        let before = scheduler.clock_now();
        let s = scheduler.enqueue(buffer(10.0)).unwrap();
        assert!(s.start_at >= before);

        scheduler.interrupt();
        assert_eq!(scheduler.active_sources(), 0);

        scheduler.shutdown();
        let after = written.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(written.load(Ordering::SeqCst), after);
        assert!(flushes.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_enqueue_after_shutdown_fails() {
        let (_clock, mut scheduler) = headless();
        scheduler.shutdown();
        assert!(scheduler.enqueue(buffer(0.1)).is_err());
        assert_eq!(scheduler.active_sources(), 0);
        assert!(scheduler.fault().is_none());
    }

    /// Accepts a few blocks, then reports the device gone.
    struct FailingSink {
        writes_left: usize,
    }

    impl SpeakerSink for FailingSink {
        fn write_block(&mut self, _samples: &[f32]) -> Result<(), AudioError> {
            if self.writes_left == 0 {
                return Err(AudioError::Stream("device unplugged".to_string()));
            }
            self.writes_left -= 1;
            Ok(())
        }

        fn flush(&mut self) -> Result<(), AudioError> {
            Ok(())
        }
    }

    #[test]
    fn test_device_failure_is_published() {
        let scheduler = PlaybackScheduler::spawn(|| {
            Ok(Box::new(FailingSink { writes_left: 3 }) as Box<dyn SpeakerSink>)
        })
        .unwrap();
        let mut fault = scheduler.watch_fault();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        runtime.block_on(async {
            tokio::time::timeout(Duration::from_secs(1), fault.wait_for(Option::is_some))
                .await
                .expect("fault should be published")
                .expect("fault channel open");
        });

        let err = scheduler.fault().expect("fault is kept");
        assert!(err.to_string().contains("device unplugged"));
        assert!(err.user_message().contains("Audio output"));

        // Nothing else is accepted and the registry stays empty.
        let frozen = scheduler.clock_now();
        for _ in 0..50 {
            assert!(scheduler.enqueue(buffer(0.01)).is_err());
        }
        assert_eq!(scheduler.active_sources(), 0);
        std::thread::sleep(Duration::from_millis(10));
        assert_abs_diff_eq!(scheduler.clock_now(), frozen);
        assert_abs_diff_eq!(frozen, 4.0 * RENDER_BLOCK_FRAMES as f64 / OUTPUT_SAMPLE_RATE as f64);
    }

    #[test]
    fn test_spawn_reports_open_failure() {
        let result = PlaybackScheduler::spawn(|| Err(AudioError::NoDevicesFound));
        assert!(matches!(result, Err(PlaybackError::Unavailable(_))));
    }
}
