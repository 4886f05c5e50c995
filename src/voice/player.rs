//! Audio pacing: one frame every 20 ms against a fixed start time.
//!
//! Deadlines are computed from `start + n * FRAME_DURATION` rather than
//! from the previous send, so time spent reading and sending never
//! accumulates as drift. Pausing shifts `start` by the paused span.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::{sync::watch, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{Dispatch, debug, instrument::WithSubscriber, warn};

use crate::{
    common::errors::VoiceResult,
    configs::VoiceConfig,
    voice::constants::{FRAME_DURATION, SILENCE_FRAME},
};

/// Producer of encoded 20 ms frames.
#[async_trait]
pub trait AudioSource: Send + 'static {
    /// `Ok(None)` ends the stream. An empty frame is a short read.
    async fn read_frame(&mut self) -> io::Result<Option<Bytes>>;
}

/// Frames pushed through a flume channel; ends when every sender is gone.
pub struct ChannelSource {
    rx: flume::Receiver<Bytes>,
}

impl ChannelSource {
    pub fn new(rx: flume::Receiver<Bytes>) -> Self {
        Self { rx }
    }

    /// A bounded channel with its source end.
    pub fn bounded(capacity: usize) -> (flume::Sender<Bytes>, Self) {
        let (tx, rx) = flume::bounded(capacity);
        (tx, Self::new(rx))
    }
}

#[async_trait]
impl AudioSource for ChannelSource {
    async fn read_frame(&mut self) -> io::Result<Option<Bytes>> {
        Ok(self.rx.recv_async().await.ok())
    }
}

/// Frames from an in-memory iterator.
pub struct IterSource<I> {
    frames: I,
}

impl<I> IterSource<I>
where
    I: Iterator<Item = Bytes> + Send + 'static,
{
    pub fn new(frames: impl IntoIterator<IntoIter = I>) -> Self {
        Self {
            frames: frames.into_iter(),
        }
    }
}

#[async_trait]
impl<I> AudioSource for IterSource<I>
where
    I: Iterator<Item = Bytes> + Send + 'static,
{
    async fn read_frame(&mut self) -> io::Result<Option<Bytes>> {
        Ok(self.frames.next())
    }
}

/// Where paced frames go: the datagram transport plus the speaking flag.
#[async_trait]
pub trait FrameSink: Send + 'static {
    async fn send_frame(&mut self, frame: &[u8]) -> VoiceResult<()>;

    async fn set_speaking(&mut self, speaking: bool) -> VoiceResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingOptions {
    /// Consecutive short reads tolerated before the stream counts as ended.
    pub short_read_tolerance: u32,
    /// Silence frames sent after the last frame, before speaking is cleared.
    pub silence_frames: u32,
}

impl From<&VoiceConfig> for PacingOptions {
    fn from(config: &VoiceConfig) -> Self {
        Self {
            short_read_tolerance: config.short_read_tolerance,
            silence_frames: config.silence_frames_on_stop,
        }
    }
}

impl Default for PacingOptions {
    fn default() -> Self {
        Self::from(&VoiceConfig::default())
    }
}

/// Why playback ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEnd {
    EndOfStream,
    Stopped,
    Failed(String),
}

struct PlaybackControl {
    paused: watch::Sender<bool>,
    skip_frames: AtomicU64,
    position_frames: AtomicU64,
    cancel: CancellationToken,
    done: CancellationToken,
    end: Mutex<Option<PlaybackEnd>>,
}

/// Handle to a running playback. Clones control the same playback.
#[derive(Clone)]
pub struct Playback {
    control: Arc<PlaybackControl>,
    task: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl Playback {
    /// Starts pacing `source` into `sink` on its own task.
    pub fn spawn<S, K>(source: S, sink: K, options: PacingOptions, dispatch: Dispatch) -> Self
    where
        S: AudioSource,
        K: FrameSink,
    {
        let (paused, _) = watch::channel(false);
        let control = Arc::new(PlaybackControl {
            paused,
            skip_frames: AtomicU64::new(0),
            position_frames: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
            end: Mutex::new(None),
        });

        let task_control = control.clone();
        let task = tokio::spawn(
            async move {
                let mut source = source;
                let mut sink = sink;
                let end = pace(&mut source, &mut sink, options, &task_control).await;
                debug!("Playback finished: {:?}", end);
                *task_control.end.lock() = Some(end);
                task_control.done.cancel();
            }
            .with_subscriber(dispatch),
        );

        Self {
            control,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    pub fn pause(&self) {
        self.control.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.control.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.control.paused.borrow()
    }

    /// Reads and discards `duration` worth of frames before the next send.
    pub fn skip(&self, duration: Duration) {
        let frames = duration.as_millis() / FRAME_DURATION.as_millis();
        self.control
            .skip_frames
            .fetch_add(frames as u64, Ordering::Relaxed);
    }

    /// Cooperative stop; trailing silence and the speaking update still go out.
    pub fn stop(&self) {
        self.control.cancel.cancel();
    }

    /// Aborts the task immediately; nothing more is sent.
    pub fn abort(&self) {
        self.control.cancel.cancel();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.control.end.lock().get_or_insert(PlaybackEnd::Stopped);
        self.control.done.cancel();
    }

    /// Position in the stream, counting skipped frames.
    pub fn stream_time(&self) -> Duration {
        FRAME_DURATION * self.control.position_frames.load(Ordering::Relaxed) as u32
    }

    pub fn is_finished(&self) -> bool {
        self.control.done.is_cancelled()
    }

    pub async fn finished(&self) -> PlaybackEnd {
        self.control.done.cancelled().await;
        self.control
            .end
            .lock()
            .clone()
            .unwrap_or(PlaybackEnd::Stopped)
    }
}

async fn pace<S, K>(
    source: &mut S,
    sink: &mut K,
    options: PacingOptions,
    control: &PlaybackControl,
) -> PlaybackEnd
where
    S: AudioSource + ?Sized,
    K: FrameSink + ?Sized,
{
    if let Err(e) = sink.set_speaking(true).await {
        return PlaybackEnd::Failed(e.to_string());
    }

    let mut paused = control.paused.subscribe();
    let mut start = Instant::now();
    let mut sent: u32 = 0;
    let mut short_reads = 0u32;

    let end = 'playback: loop {
        if control.cancel.is_cancelled() {
            break PlaybackEnd::Stopped;
        }

        if *paused.borrow_and_update() {
            let paused_at = Instant::now();
            tokio::select! {
                _ = control.cancel.cancelled() => break PlaybackEnd::Stopped,
                _ = paused.wait_for(|p| !*p) => {}
            }
            start += paused_at.elapsed();
            continue;
        }

        let to_skip = control.skip_frames.swap(0, Ordering::Relaxed);
        for _ in 0..to_skip {
            match source.read_frame().await {
                Ok(Some(_)) => {
                    control.position_frames.fetch_add(1, Ordering::Relaxed);
                }
                Ok(None) => break 'playback PlaybackEnd::EndOfStream,
                Err(e) => break 'playback PlaybackEnd::Failed(e.to_string()),
            }
        }

        let read = tokio::select! {
            biased;
            _ = control.cancel.cancelled() => break PlaybackEnd::Stopped,
            read = source.read_frame() => read,
        };

        let frame = match read {
            Ok(Some(frame)) => frame,
            Ok(None) => break PlaybackEnd::EndOfStream,
            Err(e) => {
                warn!("Audio source failed: {}", e);
                break PlaybackEnd::Failed(e.to_string());
            }
        };

        if frame.is_empty() {
            short_reads += 1;
            if short_reads > options.short_read_tolerance {
                break PlaybackEnd::EndOfStream;
            }
            continue;
        }
        short_reads = 0;

        if let Err(e) = sink.send_frame(&frame).await {
            warn!("Failed to send audio frame: {}", e);
        }
        control.position_frames.fetch_add(1, Ordering::Relaxed);
        sent += 1;

        tokio::select! {
            _ = control.cancel.cancelled() => break PlaybackEnd::Stopped,
            _ = tokio::time::sleep_until(start + FRAME_DURATION * sent) => {}
        }
    };

    for _ in 0..options.silence_frames {
        if let Err(e) = sink.send_frame(&SILENCE_FRAME).await {
            warn!("Failed to send silence frame: {}", e);
            break;
        }
        sent += 1;
        tokio::time::sleep_until(start + FRAME_DURATION * sent).await;
    }

    if let Err(e) = sink.set_speaking(false).await {
        warn!("Failed to clear speaking state: {}", e);
    }
    end
}
