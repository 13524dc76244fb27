//! Audio hardware contract
//!
//! The session only needs three capabilities from the platform: push
//! microphone frames in, schedule buffers out against a play-head clock,
//! and silence everything that is scheduled. Backends implement [`AudioIo`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::frame::AudioFrame;

/// Identifier of a scheduled playback buffer.
pub type BufferId = u64;

/// Frames buffered between the capture thread and the session.
const CAPTURE_QUEUE_DEPTH: usize = 64;

/// Audio hardware errors
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum AudioError {
    #[error("microphone access denied: {0}")]
    PermissionDenied(String),

    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("audio stream error: {0}")]
    Stream(String),
}

/// Decoded audio handed to an output sink with its start offset on the
/// sink's clock.
#[derive(Debug, Clone)]
pub struct PlaybackBuffer {
    pub id: BufferId,
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub playback_rate: f32,
    pub start: Duration,
}

impl PlaybackBuffer {
    /// Wall-clock length of the buffer once the playback rate is applied.
    pub fn duration(&self) -> Duration {
        buffer_duration(self.samples.len(), self.sample_rate, self.playback_rate)
    }
}

/// Length of `len` samples at `sample_rate`, sped up by `playback_rate`.
pub fn buffer_duration(len: usize, sample_rate: u32, playback_rate: f32) -> Duration {
    if sample_rate == 0 || playback_rate <= 0.0 {
        return Duration::ZERO;
    }
    let nanos = len as f64 * 1e9 / (sample_rate as f64 * playback_rate as f64);
    Duration::from_nanos(nanos.round() as u64)
}

/// Output side of the hardware.
///
/// `schedule` must not start the buffer before `buffer.start` and must
/// report the buffer id on the completion channel once it has finished.
/// `cancel_all` silences and drops everything pending; cancelled buffers
/// are not reported.
pub trait OutputSink: Send {
    /// Current position of the sink's clock.
    fn current_time(&self) -> Duration;

    fn schedule(&mut self, buffer: PlaybackBuffer) -> Result<(), AudioError>;

    fn cancel_all(&mut self);
}

/// Platform audio I/O.
#[async_trait]
pub trait AudioIo: Send + Sync + 'static {
    /// Acquire exclusive access to the microphone.
    ///
    /// A failed acquisition leaves nothing open behind it.
    async fn acquire_input(&self) -> Result<CaptureStream, AudioError>;

    /// Open the speaker. Finished buffers are reported on `completions`.
    async fn open_output(
        &self,
        completions: mpsc::UnboundedSender<BufferId>,
    ) -> Result<Box<dyn OutputSink>, AudioError>;
}

/// Microphone frames delivered by a backend. Dropping the stream releases
/// the microphone.
pub struct CaptureStream {
    rx: mpsc::Receiver<AudioFrame>,
    released: Arc<AtomicBool>,
}

impl CaptureStream {
    /// Create a stream and the producer half a backend feeds it from.
    pub fn channel() -> (FrameSender, CaptureStream) {
        let (tx, rx) = mpsc::channel(CAPTURE_QUEUE_DEPTH);
        let released = Arc::new(AtomicBool::new(false));
        (
            FrameSender {
                tx,
                released: released.clone(),
            },
            CaptureStream { rx, released },
        )
    }

    /// Next captured frame, or `None` once the backend stopped.
    pub async fn next_frame(&mut self) -> Option<AudioFrame> {
        self.rx.recv().await
    }

    /// Stop capturing. Safe to call more than once.
    pub fn release(&mut self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            tracing::debug!("Microphone released");
        }
        self.rx.close();
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        self.release();
    }
}

/// Producer half of a [`CaptureStream`], owned by the capture backend.
#[derive(Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<AudioFrame>,
    released: Arc<AtomicBool>,
}

impl FrameSender {
    /// True once the consumer released the microphone.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst) || self.tx.is_closed()
    }

    /// Push a frame from async code. Returns false when the stream is gone.
    pub async fn send(&self, frame: AudioFrame) -> bool {
        !self.is_released() && self.tx.send(frame).await.is_ok()
    }

    /// Push a frame from a backend thread. Returns false when the stream is gone.
    pub fn blocking_send(&self, frame: AudioFrame) -> bool {
        !self.is_released() && self.tx.blocking_send(frame).is_ok()
    }
}
