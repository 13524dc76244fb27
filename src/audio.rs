//! PulseAudio backend
//!
//! Microphone capture runs on its own OS thread reading 20 ms float
//! frames at 16 kHz through PulseAudio's simple API. Playback runs on a
//! second thread that renders scheduled buffers into 10 ms blocks against
//! a clock counted in written frames, so the sink's notion of "now" is
//! exactly what has been handed to the device.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::audio_io::{BufferId, PlaybackBuffer};

#[cfg(feature = "pulse")]
pub use pulse_backend::PulseAudio;

/// Samples per captured frame (20 ms at 16 kHz).
pub const CAPTURE_FRAME_SAMPLES: usize = 320;

/// Frames rendered per playback block (10 ms at 24 kHz).
pub const PLAYBACK_BLOCK_FRAMES: usize = 240;

#[cfg_attr(not(feature = "pulse"), allow(dead_code))]
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Mixes scheduled buffers into a continuous output stream.
#[derive(Debug)]
pub struct Mixer {
    rate: u32,
    frames_rendered: u64,
    queue: VecDeque<PlaybackBuffer>,
}

impl Mixer {
    pub fn new(rate: u32) -> Self {
        Self {
            rate,
            frames_rendered: 0,
            queue: VecDeque::new(),
        }
    }

    /// Output clock: time covered by the frames rendered so far.
    pub fn now(&self) -> Duration {
        if self.rate == 0 {
            return Duration::ZERO;
        }
        let nanos = self.frames_rendered as u128 * 1_000_000_000 / self.rate as u128;
        Duration::from_nanos(nanos as u64)
    }

    pub fn push(&mut self, buffer: PlaybackBuffer) {
        let idx = self.queue.partition_point(|b| b.start <= buffer.start);
        self.queue.insert(idx, buffer);
    }

    /// Drop every pending buffer. Returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let n = self.queue.len();
        self.queue.clear();
        n
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    fn frame_at(&self, at: Duration) -> u64 {
        ((at.as_nanos() * self.rate as u128 + 500_000_000) / 1_000_000_000) as u64
    }

    /// Fill `out` with the next block. Ids of buffers that played to the
    /// end are appended to `finished`.
    pub fn render(&mut self, out: &mut [f32], finished: &mut Vec<BufferId>) {
        for (i, slot) in out.iter_mut().enumerate() {
            let frame = self.frames_rendered + i as u64;
            *slot = 0.0;

            while let Some(head) = self.queue.front() {
                let start = self.frame_at(head.start);
                if frame < start {
                    break;
                }
                let step = head.sample_rate as f64 * head.playback_rate as f64 / self.rate as f64;
                let pos = ((frame - start) as f64 * step) as usize;
                if pos < head.samples.len() {
                    *slot = head.samples[pos];
                    break;
                }
                finished.push(head.id);
                self.queue.pop_front();
            }
        }
        self.frames_rendered += out.len() as u64;
    }
}

#[cfg(feature = "pulse")]
mod pulse_backend {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread::JoinHandle;
    use std::time::Duration;

    use async_trait::async_trait;
    use libpulse_binding::error::{Code, PAErr};
    use libpulse_binding::sample::{Format, Spec};
    use libpulse_binding::stream::Direction;
    use libpulse_simple_binding::Simple;
    use tokio::sync::{mpsc, oneshot};
    use tracing::{debug, error, info, warn};

    use super::{lock, Mixer, CAPTURE_FRAME_SAMPLES, PLAYBACK_BLOCK_FRAMES};
    use crate::audio_io::{
        AudioError, AudioIo, BufferId, CaptureStream, FrameSender, OutputSink, PlaybackBuffer,
    };
    use crate::config::{CAPTURE_SAMPLE_RATE, PLAYBACK_SAMPLE_RATE};
    use crate::frame::AudioFrame;

    /// Audio I/O through the PulseAudio simple API.
    #[derive(Debug, Clone)]
    pub struct PulseAudio {
        app_name: String,
        input_device: Option<String>,
        output_device: Option<String>,
    }

    impl PulseAudio {
        pub fn new(app_name: &str) -> Self {
            Self {
                app_name: app_name.to_string(),
                input_device: None,
                output_device: None,
            }
        }

        pub fn with_devices(mut self, input: Option<String>, output: Option<String>) -> Self {
            self.input_device = input;
            self.output_device = output;
            self
        }
    }

    fn float_spec(rate: u32) -> Spec {
        Spec {
            format: Format::F32le,
            channels: 1,
            rate,
        }
    }

    fn open_error(e: PAErr) -> AudioError {
        if e == PAErr::from(Code::Access) {
            AudioError::PermissionDenied(format!("{}", e))
        } else {
            AudioError::DeviceUnavailable(format!("{}", e))
        }
    }

    #[async_trait]
    impl AudioIo for PulseAudio {
        async fn acquire_input(&self) -> Result<CaptureStream, AudioError> {
            let (frames, stream) = CaptureStream::channel();
            let (ready_tx, ready_rx) = oneshot::channel();
            let app_name = self.app_name.clone();
            let device = self.input_device.clone();

            std::thread::Builder::new()
                .name("livevoice-capture".to_string())
                .spawn(move || run_capture(app_name, device, frames, ready_tx))
                .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?;

            match ready_rx.await {
                Ok(Ok(())) => Ok(stream),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(AudioError::DeviceUnavailable(
                    "capture thread exited".to_string(),
                )),
            }
        }

        async fn open_output(
            &self,
            completions: mpsc::UnboundedSender<BufferId>,
        ) -> Result<Box<dyn OutputSink>, AudioError> {
            let state = Arc::new(Mutex::new(OutputState {
                mixer: Mixer::new(PLAYBACK_SAMPLE_RATE),
                flush: false,
            }));
            let shutdown = Arc::new(AtomicBool::new(false));
            let (ready_tx, ready_rx) = oneshot::channel();

            let thread = {
                let app_name = self.app_name.clone();
                let device = self.output_device.clone();
                let state = state.clone();
                let shutdown = shutdown.clone();
                std::thread::Builder::new()
                    .name("livevoice-playback".to_string())
                    .spawn(move || {
                        run_playback(app_name, device, state, shutdown, completions, ready_tx)
                    })
                    .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?
            };

            match ready_rx.await {
                Ok(Ok(())) => Ok(Box::new(PulseOutput {
                    state,
                    shutdown,
                    thread: Some(thread),
                })),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(AudioError::DeviceUnavailable(
                    "playback thread exited".to_string(),
                )),
            }
        }
    }

    fn run_capture(
        app_name: String,
        device: Option<String>,
        frames: FrameSender,
        ready: oneshot::Sender<Result<(), AudioError>>,
    ) {
        let simple = match Simple::new(
            None,
            &app_name,
            Direction::Record,
            device.as_deref(),
            "microphone",
            &float_spec(CAPTURE_SAMPLE_RATE),
            None,
            None,
        ) {
            Ok(simple) => simple,
            Err(e) => {
                warn!("Failed to open microphone: {}", e);
                let _ = ready.send(Err(open_error(e)));
                return;
            }
        };
        info!(
            "Microphone capture started ({} Hz, {} samples per frame)",
            CAPTURE_SAMPLE_RATE, CAPTURE_FRAME_SAMPLES
        );
        if ready.send(Ok(())).is_err() {
            return;
        }

        let mut bytes = vec![0u8; CAPTURE_FRAME_SAMPLES * 4];
        let mut count: u64 = 0;
        while !frames.is_released() {
            if let Err(e) = simple.read(&mut bytes) {
                error!("Failed to read audio: {}", e);
                break;
            }
            let samples = bytes
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            if !frames.blocking_send(AudioFrame::new(samples)) {
                break;
            }
            count += 1;
        }
        info!("Microphone capture stopped after {} frames", count);
    }

    struct OutputState {
        mixer: Mixer,
        flush: bool,
    }

    struct PulseOutput {
        state: Arc<Mutex<OutputState>>,
        shutdown: Arc<AtomicBool>,
        thread: Option<JoinHandle<()>>,
    }

    impl OutputSink for PulseOutput {
        fn current_time(&self) -> Duration {
            lock(&self.state).mixer.now()
        }

        fn schedule(&mut self, buffer: PlaybackBuffer) -> Result<(), AudioError> {
            if self.thread.as_ref().map_or(true, |t| t.is_finished()) {
                return Err(AudioError::Stream("playback thread stopped".to_string()));
            }
            lock(&self.state).mixer.push(buffer);
            Ok(())
        }

        fn cancel_all(&mut self) {
            let mut state = lock(&self.state);
            let dropped = state.mixer.clear();
            state.flush = true;
            debug!("Cancelled {} pending playback buffers", dropped);
        }
    }

    impl Drop for PulseOutput {
        fn drop(&mut self) {
            self.shutdown.store(true, Ordering::Relaxed);
            let Some(thread) = self.thread.take() else {
                return;
            };
            let join = move || {
                if thread.join().is_err() {
                    error!("Playback thread panicked");
                }
            };
            // Exits after the current block. Joined off the runtime workers.
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn_blocking(join);
                }
                Err(_) => join(),
            }
        }
    }

    fn run_playback(
        app_name: String,
        device: Option<String>,
        state: Arc<Mutex<OutputState>>,
        shutdown: Arc<AtomicBool>,
        completions: mpsc::UnboundedSender<BufferId>,
        ready: oneshot::Sender<Result<(), AudioError>>,
    ) {
        let simple = match Simple::new(
            None,
            &app_name,
            Direction::Playback,
            device.as_deref(),
            "voice playback",
            &float_spec(PLAYBACK_SAMPLE_RATE),
            None,
            None,
        ) {
            Ok(simple) => simple,
            Err(e) => {
                warn!("Failed to open speaker: {}", e);
                let _ = ready.send(Err(open_error(e)));
                return;
            }
        };
        info!("Playback stream opened at {} Hz", PLAYBACK_SAMPLE_RATE);
        if ready.send(Ok(())).is_err() {
            return;
        }

        let mut block = vec![0f32; PLAYBACK_BLOCK_FRAMES];
        let mut bytes = Vec::with_capacity(PLAYBACK_BLOCK_FRAMES * 4);
        let mut finished = Vec::new();

        while !shutdown.load(Ordering::Relaxed) {
            let flush = {
                let mut state = lock(&state);
                state.mixer.render(&mut block, &mut finished);
                std::mem::take(&mut state.flush)
            };
            if flush {
                if let Err(e) = simple.flush() {
                    warn!("Failed to flush playback: {}", e);
                }
            }

            bytes.clear();
            for s in &block {
                bytes.extend_from_slice(&s.to_le_bytes());
            }
            // Blocks until the device has room, pacing the loop in real time.
            if let Err(e) = simple.write(&bytes) {
                error!("Failed to write audio: {}", e);
                break;
            }

            for id in finished.drain(..) {
                let _ = completions.send(id);
            }
        }
        info!("Playback thread stopped");
    }
}
