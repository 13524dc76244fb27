//! In-memory audio hardware and voice service for tests.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use crate::audio_io::{
    AudioError, AudioIo, BufferId, CaptureStream, FrameSender, OutputSink, PlaybackBuffer,
};
use crate::config::SessionConfig;
use crate::frame::AudioFrame;
use crate::gemini::{ApiResponse, ClientMessage, GeminiError, Result};
use crate::gemini_client::{LiveChannel, LiveService};

#[derive(Default)]
struct AudioState {
    now: Duration,
    scheduled: Vec<PlaybackBuffer>,
    cancel_count: usize,
    fail_next_schedule: bool,
    deny_permission: bool,
    hang_output: bool,
    outputs_opened: usize,
    acquisitions: usize,
    frames: Option<FrameSender>,
    completions: Option<mpsc::UnboundedSender<BufferId>>,
}

/// Audio hardware with a manual clock that records every call.
#[derive(Clone, Default)]
pub struct FakeAudio {
    state: Arc<Mutex<AudioState>>,
}

impl FakeAudio {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, AudioState> {
        self.state.lock().unwrap()
    }

    pub fn output_sink(&self, completions: mpsc::UnboundedSender<BufferId>) -> Box<dyn OutputSink> {
        self.lock().completions = Some(completions);
        Box::new(FakeSink {
            state: self.state.clone(),
        })
    }

    pub fn set_time(&self, now: Duration) {
        self.lock().now = now;
    }

    pub fn scheduled(&self) -> Vec<PlaybackBuffer> {
        self.lock().scheduled.clone()
    }

    pub fn scheduled_starts(&self) -> Vec<Duration> {
        self.lock().scheduled.iter().map(|b| b.start).collect()
    }

    pub fn cancel_count(&self) -> usize {
        self.lock().cancel_count
    }

    pub fn fail_next_schedule(&self) {
        self.lock().fail_next_schedule = true;
    }

    pub fn deny_permission(&self) {
        self.lock().deny_permission = true;
    }

    /// Make the next speaker open never finish.
    pub fn hang_output(&self) {
        self.lock().hang_output = true;
    }

    pub fn outputs_opened(&self) -> usize {
        self.lock().outputs_opened
    }

    pub fn acquisitions(&self) -> usize {
        self.lock().acquisitions
    }

    /// True when no capture stream is held.
    pub fn mic_released(&self) -> bool {
        self.lock()
            .frames
            .as_ref()
            .map_or(true, |frames| frames.is_released())
    }

    /// Deliver a microphone frame to the current capture stream.
    pub async fn push_frame(&self, samples: Vec<f32>) -> bool {
        let frames = self.lock().frames.clone();
        match frames {
            Some(frames) => frames.send(AudioFrame::new(samples)).await,
            None => false,
        }
    }
}

#[async_trait]
impl AudioIo for FakeAudio {
    async fn acquire_input(&self) -> std::result::Result<CaptureStream, AudioError> {
        let mut state = self.lock();
        if state.deny_permission {
            return Err(AudioError::PermissionDenied("denied by user".to_string()));
        }
        let (frames, stream) = CaptureStream::channel();
        state.frames = Some(frames);
        state.acquisitions += 1;
        Ok(stream)
    }

    async fn open_output(
        &self,
        completions: mpsc::UnboundedSender<BufferId>,
    ) -> std::result::Result<Box<dyn OutputSink>, AudioError> {
        let hang = {
            let mut state = self.lock();
            state.outputs_opened += 1;
            std::mem::take(&mut state.hang_output)
        };
        if hang {
            std::future::pending::<()>().await;
        }
        Ok(self.output_sink(completions))
    }
}

struct FakeSink {
    state: Arc<Mutex<AudioState>>,
}

impl OutputSink for FakeSink {
    fn current_time(&self) -> Duration {
        self.state.lock().unwrap().now
    }

    fn schedule(&mut self, buffer: PlaybackBuffer) -> std::result::Result<(), AudioError> {
        let mut state = self.state.lock().unwrap();
        if std::mem::take(&mut state.fail_next_schedule) {
            return Err(AudioError::Stream("device lost".to_string()));
        }
        state.scheduled.push(buffer);
        Ok(())
    }

    fn cancel_all(&mut self) {
        self.state.lock().unwrap().cancel_count += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeMode {
    Accept,
    Reject,
    Hang,
    /// Accept once `release_handshake` is called.
    Gated,
}

struct ServiceState {
    mode: HandshakeMode,
    configs: Vec<SessionConfig>,
    inbound: Option<mpsc::Sender<Result<ApiResponse>>>,
    outbound: Option<mpsc::UnboundedReceiver<ClientMessage>>,
}

/// Voice service driven by the test: scripted inbound messages, recorded
/// outbound messages.
#[derive(Clone)]
pub struct FakeService {
    state: Arc<Mutex<ServiceState>>,
    gate: Arc<Notify>,
}

impl FakeService {
    pub fn new() -> Self {
        Self::with_mode(HandshakeMode::Accept)
    }

    pub fn with_mode(mode: HandshakeMode) -> Self {
        Self {
            state: Arc::new(Mutex::new(ServiceState {
                mode,
                configs: Vec::new(),
                inbound: None,
                outbound: None,
            })),
            gate: Arc::new(Notify::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ServiceState> {
        self.state.lock().unwrap()
    }

    /// Let a gated handshake complete.
    pub fn release_handshake(&self) {
        self.gate.notify_one();
    }

    /// True once a handshake handed out a channel.
    pub fn has_channel(&self) -> bool {
        self.lock().inbound.is_some()
    }

    pub fn opened(&self) -> usize {
        self.lock().configs.len()
    }

    pub fn last_config(&self) -> Option<SessionConfig> {
        self.lock().configs.last().cloned()
    }

    /// Send a message to the session as if from the remote side.
    pub async fn push(&self, response: ApiResponse) {
        let inbound = self.lock().inbound.clone();
        if let Some(tx) = inbound {
            let _ = tx.send(Ok(response)).await;
        }
    }

    pub async fn push_error(&self, error: GeminiError) {
        let inbound = self.lock().inbound.clone();
        if let Some(tx) = inbound {
            let _ = tx.send(Err(error)).await;
        }
    }

    /// Hang up from the remote side.
    pub fn close_remote(&self) {
        self.lock().inbound = None;
    }

    /// Messages the session sent so far.
    pub fn take_outbound(&self) -> Vec<ClientMessage> {
        let mut state = self.lock();
        let mut out = Vec::new();
        if let Some(rx) = state.outbound.as_mut() {
            while let Ok(msg) = rx.try_recv() {
                out.push(msg);
            }
        }
        out
    }

    /// Wait until at least `n` outbound messages arrived, giving up after a
    /// second.
    pub async fn wait_for_outbound(&self, n: usize) -> Vec<ClientMessage> {
        let mut out = Vec::new();
        for _ in 0..200 {
            out.extend(self.take_outbound());
            if out.len() >= n {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        out
    }

    /// True once the session dropped every outbound sender. Consumes a
    /// pending message if there is one.
    pub fn outbound_closed(&self) -> bool {
        let mut state = self.lock();
        match state.outbound.as_mut() {
            Some(rx) => matches!(
                rx.try_recv(),
                Err(mpsc::error::TryRecvError::Disconnected)
            ),
            None => true,
        }
    }
}

#[async_trait]
impl LiveService for FakeService {
    async fn open(&self, config: &SessionConfig) -> Result<LiveChannel> {
        let mode = {
            let mut state = self.lock();
            state.configs.push(config.clone());
            state.mode
        };

        match mode {
            HandshakeMode::Reject => Err(GeminiError::SetupNotComplete),
            HandshakeMode::Hang => std::future::pending().await,
            HandshakeMode::Accept | HandshakeMode::Gated => {
                if mode == HandshakeMode::Gated {
                    self.gate.notified().await;
                }
                let (out_tx, out_rx) = mpsc::unbounded_channel();
                let (in_tx, in_rx) = mpsc::channel(32);
                let mut state = self.lock();
                state.inbound = Some(in_tx);
                state.outbound = Some(out_rx);
                Ok(LiveChannel::new(out_tx, in_rx, None, None))
            }
        }
    }
}
