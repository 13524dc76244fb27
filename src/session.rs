//! Voice session lifecycle
//!
//! [`VoiceSession`] is the only entry point the application uses. It
//! guards against concurrent sessions, drives the connect handshake
//! (cancellable by [`VoiceSession::disconnect`]) and, once live, hands the
//! transport, playback scheduler, transcript aggregator and command
//! dispatcher to a single actor task that processes inbound traffic in
//! order and owns teardown.

use std::ops::ControlFlow;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::audio_io::{AudioError, AudioIo, BufferId};
use crate::commands::{CommandDispatcher, CommandRegistry, DispatchOutcome, ToolCallRequest};
use crate::config::SessionConfig;
use crate::events::{ControlSignal, InboundEvent, SessionEvent};
use crate::frame::decode_chunk;
use crate::gemini_client::LiveService;
use crate::playback::PlaybackScheduler;
use crate::transcript::TranscriptAggregator;
use crate::transport::SessionTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Live,
    Closing,
}

/// Errors surfaced to the application.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    #[error("microphone access denied: {0}")]
    PermissionDenied(String),

    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("a voice session is already active")]
    AlreadyActive,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("could not decode audio chunk: {0}")]
    Decode(String),

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("command '{name}' failed: {reason}")]
    CommandFailed { name: String, reason: String },

    #[error("connect cancelled")]
    Cancelled,
}

impl From<AudioError> for SessionError {
    fn from(e: AudioError) -> Self {
        match e {
            AudioError::PermissionDenied(msg) => SessionError::PermissionDenied(msg),
            AudioError::DeviceUnavailable(msg) | AudioError::Stream(msg) => {
                SessionError::DeviceUnavailable(msg)
            }
        }
    }
}

/// State shared between the handle and the actor.
struct Shared {
    events: mpsc::UnboundedSender<SessionEvent>,
    state: watch::Sender<SessionState>,
    input_volume: Arc<watch::Sender<f32>>,
    output_volume: watch::Sender<f32>,
}

impl Shared {
    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!("Session state {:?} -> {:?}", previous, state);
        }
    }

    fn reset_volumes(&self) {
        self.input_volume.send_replace(0.0);
        self.output_volume.send_replace(0.0);
    }
}

struct ActiveSession {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Slots {
    /// Cancels the connect attempt in flight.
    pending: Option<oneshot::Sender<()>>,
    active: Option<ActiveSession>,
}

/// Resets the lifecycle to Idle unless the attempt went live.
struct ConnectAttempt<'a> {
    shared: &'a Shared,
    live: bool,
}

impl Drop for ConnectAttempt<'_> {
    fn drop(&mut self) {
        if !self.live {
            self.shared.reset_volumes();
            self.shared.set_state(SessionState::Idle);
        }
    }
}

/// Handle to the voice session of this application.
pub struct VoiceSession<S, A> {
    service: Arc<S>,
    audio: Arc<A>,
    registry: Arc<CommandRegistry>,
    shared: Arc<Shared>,
    slots: Mutex<Slots>,
}

impl<S, A> VoiceSession<S, A>
where
    S: LiveService,
    A: AudioIo,
{
    /// Create an idle session. Events arrive on the returned receiver.
    pub fn new(
        service: Arc<S>,
        audio: Arc<A>,
        registry: CommandRegistry,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(SessionState::Idle);
        let (input_volume, _) = watch::channel(0.0);
        let (output_volume, _) = watch::channel(0.0);

        let session = Self {
            service,
            audio,
            registry: Arc::new(registry),
            shared: Arc::new(Shared {
                events,
                state,
                input_volume: Arc::new(input_volume),
                output_volume,
            }),
            slots: Mutex::new(Slots::default()),
        };
        (session, events_rx)
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    pub fn is_live(&self) -> bool {
        self.state() == SessionState::Live
    }

    pub fn is_connecting(&self) -> bool {
        self.state() == SessionState::Connecting
    }

    /// Loudness of the latest captured frame.
    pub fn input_volume(&self) -> f32 {
        *self.shared.input_volume.borrow()
    }

    /// Loudness of the latest decoded model audio.
    pub fn output_volume(&self) -> f32 {
        *self.shared.output_volume.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    pub fn watch_input_volume(&self) -> watch::Receiver<f32> {
        self.shared.input_volume.subscribe()
    }

    pub fn watch_output_volume(&self) -> watch::Receiver<f32> {
        self.shared.output_volume.subscribe()
    }

    /// Start a session with `config`.
    ///
    /// Rejected with [`SessionError::AlreadyActive`] while another session
    /// is connecting or live; the existing session is left untouched.
    /// Any other failure leaves the session Idle with nothing held open
    /// and is also reported once as [`SessionEvent::Error`].
    pub async fn connect(&self, config: SessionConfig) -> Result<(), SessionError> {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        {
            let mut slots = self.slots.lock().await;
            let claimed = self.shared.state.send_if_modified(|state| {
                if *state == SessionState::Idle {
                    *state = SessionState::Connecting;
                    true
                } else {
                    false
                }
            });
            if !claimed {
                warn!("Connect rejected: session is {:?}", self.state());
                return Err(SessionError::AlreadyActive);
            }
            slots.pending = Some(cancel_tx);
        }
        info!(
            "Session state Idle -> Connecting (model {}, voice {}, commands {:?})",
            config.model,
            config.voice,
            config.command_names().collect::<Vec<_>>()
        );

        let mut attempt = ConnectAttempt {
            shared: &self.shared,
            live: false,
        };

        let opened = tokio::select! {
            biased;
            _ = cancel_rx => Err(SessionError::Cancelled),
            opened = self.open(&config) => opened,
        };

        let mut slots = self.slots.lock().await;
        let cancelled = slots.pending.take().is_none();

        let (mut transport, mut scheduler, completions) = match opened {
            Ok(parts) => parts,
            Err(SessionError::Cancelled) => {
                info!("Connect cancelled");
                return Err(SessionError::Cancelled);
            }
            Err(e) => {
                drop(slots);
                drop(attempt);
                error!("Connect failed: {}", e);
                self.shared.emit(SessionEvent::Error(e.clone()));
                return Err(e);
            }
        };

        if cancelled {
            info!("Connect cancelled after handshake");
            transport.disconnect().await;
            scheduler.interrupt();
            return Err(SessionError::Cancelled);
        }

        attempt.live = true;
        self.shared.set_state(SessionState::Live);
        self.shared.emit(SessionEvent::ConnectionStateChanged(true));

        let actor = SessionActor {
            transport,
            scheduler,
            completions,
            default_rate: config.playback_sample_rate,
            aggregator: TranscriptAggregator::new(),
            dispatcher: CommandDispatcher::new(&config.commands, self.registry.clone()),
            shared: self.shared.clone(),
        };
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(actor.run(stop_rx));
        slots.active = Some(ActiveSession {
            stop: stop_tx,
            task,
        });
        Ok(())
    }

    async fn open(
        &self,
        config: &SessionConfig,
    ) -> Result<
        (
            SessionTransport,
            PlaybackScheduler,
            mpsc::UnboundedReceiver<BufferId>,
        ),
        SessionError,
    > {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let sink = self.audio.open_output(completions_tx).await?;
        let scheduler = PlaybackScheduler::new(sink, config.playback_rate);

        let mut transport = SessionTransport::new(self.shared.input_volume.clone());
        transport
            .connect(&*self.service, &*self.audio, config)
            .await?;
        Ok((transport, scheduler, completions_rx))
    }

    /// End the session, or abort a connect in progress. Returns once the
    /// session is Idle. Does nothing when already Idle.
    pub async fn disconnect(&self) {
        let (pending, active) = {
            let mut slots = self.slots.lock().await;
            (slots.pending.take(), slots.active.take())
        };

        if let Some(cancel) = pending {
            info!("Cancelling connect in progress");
            let _ = cancel.send(());
        }

        if let Some(active) = active {
            let _ = active.stop.send(());
            if let Err(e) = active.task.await {
                error!("Session task failed: {}", e);
                self.shared.reset_volumes();
                self.shared.set_state(SessionState::Idle);
            }
        }

        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(|s| *s == SessionState::Idle).await;
    }
}

/// Owns all per-session state. Runs until stopped or the connection ends.
struct SessionActor {
    transport: SessionTransport,
    scheduler: PlaybackScheduler,
    completions: mpsc::UnboundedReceiver<BufferId>,
    /// Rate of inbound audio whose mime type names none.
    default_rate: u32,
    aggregator: TranscriptAggregator,
    dispatcher: CommandDispatcher,
    shared: Arc<Shared>,
}

impl SessionActor {
    async fn run(mut self, mut stop: oneshot::Receiver<()>) {
        info!("Session actor started");

        let failure = loop {
            tokio::select! {
                biased;
                _ = &mut stop => {
                    info!("Disconnect requested");
                    break None;
                }
                Some(id) = self.completions.recv() => self.scheduler.on_complete(id),
                event = self.transport.next_event() => {
                    if let ControlFlow::Break(failure) = self.handle(event) {
                        break failure;
                    }
                }
            }
        };

        self.teardown(failure).await;
    }

    fn handle(&mut self, event: InboundEvent) -> ControlFlow<Option<SessionError>> {
        match event {
            InboundEvent::Audio { data, mime_type } => self.on_audio(&data, mime_type.as_deref()),
            InboundEvent::InputFragment(t) => {
                self.aggregator.on_input_fragment(&t.text);
                self.shared.emit(SessionEvent::Transcript {
                    text: t.text,
                    is_final: t.is_final,
                    is_model: false,
                });
            }
            InboundEvent::OutputFragment(t) => {
                self.aggregator.on_output_fragment(&t.text);
                self.shared.emit(SessionEvent::Transcript {
                    text: t.text,
                    is_final: t.is_final,
                    is_model: true,
                });
            }
            InboundEvent::ToolCall(request) => self.on_tool_call(request),
            InboundEvent::Control(ControlSignal::TurnComplete) => {
                if let Some(turn) = self.aggregator.on_turn_complete() {
                    self.shared.emit(SessionEvent::TurnComplete {
                        user_text: turn.user_text,
                        model_text: turn.model_text,
                    });
                }
            }
            InboundEvent::Control(ControlSignal::Interrupted) => {
                info!("User interrupted playback");
                self.scheduler.interrupt();
                self.shared.output_volume.send_replace(0.0);
            }
            InboundEvent::Control(ControlSignal::Closed) => return ControlFlow::Break(None),
            InboundEvent::Control(ControlSignal::Error(e)) => {
                return ControlFlow::Break(Some(SessionError::Transport(e)))
            }
        }
        ControlFlow::Continue(())
    }

    fn on_audio(&mut self, data: &str, mime_type: Option<&str>) {
        let audio = match decode_chunk(data, mime_type, self.default_rate) {
            Ok(audio) => audio,
            Err(e) => {
                warn!("Dropping audio chunk: {}", e);
                self.shared
                    .emit(SessionEvent::Warning(SessionError::Decode(e.to_string())));
                return;
            }
        };
        if audio.samples.is_empty() {
            return;
        }

        self.shared.output_volume.send_replace(audio.loudness());
        if let Err(e) = self.scheduler.enqueue(audio) {
            warn!("Failed to schedule playback: {}", e);
        }
    }

    fn on_tool_call(&mut self, request: ToolCallRequest) {
        let dispatch = self.dispatcher.on_tool_call(request);
        if let Err(e) = self.transport.send_tool_response(dispatch.ack) {
            warn!("Failed to acknowledge tool call {}: {}", dispatch.request.id, e);
        }

        let ToolCallRequest { name, args, .. } = dispatch.request;
        match dispatch.outcome {
            DispatchOutcome::Handled => self.shared.emit(SessionEvent::Command { name, args }),
            DispatchOutcome::Failed(reason) => self
                .shared
                .emit(SessionEvent::Warning(SessionError::CommandFailed { name, reason })),
            DispatchOutcome::Unknown => self
                .shared
                .emit(SessionEvent::Warning(SessionError::UnknownCommand(name))),
        }
    }

    /// Capture and connection go first, then playback and transcripts.
    async fn teardown(mut self, failure: Option<SessionError>) {
        self.shared.set_state(SessionState::Closing);

        self.transport.disconnect().await;
        self.scheduler.interrupt();
        if !self.aggregator.is_empty() {
            debug!("Discarding unfinished turn");
        }
        self.aggregator.clear();
        self.shared.reset_volumes();

        self.shared.set_state(SessionState::Idle);
        self.shared.emit(SessionEvent::ConnectionStateChanged(false));
        if let Some(e) = failure {
            error!("Session ended: {}", e);
            self.shared.emit(SessionEvent::Error(e));
        }
        info!("Session actor stopped");
    }
}
