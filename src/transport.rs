//! Session transport
//!
//! Owns the microphone capture loop and the single connection to the
//! voice service. Outbound audio is encoded and queued frame by frame
//! without waiting on the network; inbound responses are demultiplexed
//! into [`InboundEvent`]s for the session actor.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audio_io::{AudioIo, CaptureStream};
use crate::config::SessionConfig;
use crate::events::{ControlSignal, InboundEvent};
use crate::frame::encode;
use crate::gemini::{ApiResponse, ClientMessage, FunctionResponse, GeminiError};
use crate::gemini_client::{LiveChannel, LiveService};
use crate::session::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Handshaking,
    Open,
    Closing,
}

pub struct SessionTransport {
    state: TransportState,
    channel: Option<LiveChannel>,
    capture: Option<JoinHandle<()>>,
    pending: VecDeque<InboundEvent>,
    input_volume: Arc<watch::Sender<f32>>,
}

impl SessionTransport {
    pub fn new(input_volume: Arc<watch::Sender<f32>>) -> Self {
        Self {
            state: TransportState::Disconnected,
            channel: None,
            capture: None,
            pending: VecDeque::new(),
            input_volume,
        }
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    /// Acquire the microphone, complete the handshake and start streaming
    /// captured audio. Nothing stays open if either step fails.
    pub async fn connect<S, A>(
        &mut self,
        service: &S,
        audio: &A,
        config: &SessionConfig,
    ) -> Result<(), SessionError>
    where
        S: LiveService + ?Sized,
        A: AudioIo + ?Sized,
    {
        if self.state != TransportState::Disconnected {
            return Err(SessionError::AlreadyActive);
        }

        info!("Acquiring microphone");
        let stream = audio.acquire_input().await.map_err(SessionError::from)?;

        self.state = TransportState::Handshaking;
        info!("Opening voice service connection");
        let channel = match service.open(config).await {
            Ok(channel) => channel,
            Err(e) => {
                warn!("Handshake failed: {}", e);
                drop(stream);
                self.state = TransportState::Disconnected;
                return Err(SessionError::HandshakeFailed(e.to_string()));
            }
        };

        let outbound = match channel.sender() {
            Some(outbound) => outbound,
            None => {
                self.state = TransportState::Disconnected;
                return Err(SessionError::HandshakeFailed(
                    "connection closed during setup".to_string(),
                ));
            }
        };

        self.capture = Some(tokio::spawn(run_capture(
            stream,
            outbound,
            config.capture_sample_rate,
            self.input_volume.clone(),
        )));
        self.channel = Some(channel);
        self.state = TransportState::Open;
        info!("Transport open");
        Ok(())
    }

    /// Next inbound event, in receipt order.
    ///
    /// Cancel safe: an event is never lost when the returned future is
    /// dropped before completion.
    pub async fn next_event(&mut self) -> InboundEvent {
        if let Some(event) = self.pending.pop_front() {
            return event;
        }

        loop {
            let channel = match self.channel.as_mut() {
                Some(channel) if self.state == TransportState::Open => channel,
                _ => return InboundEvent::Control(ControlSignal::Closed),
            };

            let response = match channel.recv().await {
                Some(Ok(response)) => response,
                Some(Err(GeminiError::ConnectionClosed)) | None => {
                    info!("Voice service closed the connection");
                    return InboundEvent::Control(ControlSignal::Closed);
                }
                Some(Err(e)) => return InboundEvent::Control(ControlSignal::Error(e.to_string())),
            };

            match response {
                ApiResponse::Audio { data, mime_type } => {
                    return InboundEvent::Audio { data, mime_type }
                }
                ApiResponse::InputTranscription(t) => return InboundEvent::InputFragment(t),
                ApiResponse::OutputTranscription(t) => return InboundEvent::OutputFragment(t),
                ApiResponse::Interrupted => {
                    return InboundEvent::Control(ControlSignal::Interrupted)
                }
                ApiResponse::TurnComplete => {
                    return InboundEvent::Control(ControlSignal::TurnComplete)
                }
                ApiResponse::ToolCall(calls) => {
                    let mut calls = calls.into_iter();
                    if let Some(first) = calls.next() {
                        self.pending.extend(calls.map(InboundEvent::ToolCall));
                        return InboundEvent::ToolCall(first);
                    }
                }
                ApiResponse::ToolCallCancellation(ids) => {
                    info!("Server cancelled tool calls: {:?}", ids);
                }
                ApiResponse::GoAway(time_left) => {
                    warn!("Server is going away (time left: {:?})", time_left);
                }
                ApiResponse::TextResponse(text) => debug!("Ignoring text part: {}", text),
                ApiResponse::GenerationComplete => debug!("Generation complete"),
                ApiResponse::SetupComplete => debug!("Duplicate setup complete"),
            }
        }
    }

    /// Acknowledge a tool call.
    pub fn send_tool_response(&self, response: FunctionResponse) -> Result<(), SessionError> {
        let channel = self
            .channel
            .as_ref()
            .ok_or_else(|| SessionError::Transport("not connected".to_string()))?;
        channel
            .send(ClientMessage::tool_response(response))
            .map_err(|e| SessionError::Transport(e.to_string()))
    }

    /// Stop capture, release the microphone, then close the connection.
    /// Later calls do nothing.
    pub async fn disconnect(&mut self) {
        if self.state == TransportState::Disconnected {
            return;
        }
        self.state = TransportState::Closing;

        if let Some(capture) = self.capture.take() {
            capture.abort();
            let _ = capture.await;
            debug!("Capture loop stopped");
        }
        if let Some(mut channel) = self.channel.take() {
            channel.close().await;
        }
        self.pending.clear();
        self.input_volume.send_replace(0.0);

        self.state = TransportState::Disconnected;
        info!("Transport disconnected");
    }
}

impl Drop for SessionTransport {
    fn drop(&mut self) {
        if let Some(capture) = self.capture.take() {
            capture.abort();
        }
    }
}

/// Encode every captured frame and queue it for sending, in capture order.
/// The microphone is released when this returns or is aborted.
async fn run_capture(
    mut stream: CaptureStream,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    sample_rate: u32,
    input_volume: Arc<watch::Sender<f32>>,
) {
    let mut frames: u64 = 0;
    while let Some(frame) = stream.next_frame().await {
        let (chunk, volume) = encode(&frame);
        input_volume.send_replace(volume);
        if outbound
            .send(ClientMessage::audio(chunk.as_bytes(), sample_rate))
            .is_err()
        {
            debug!("Outbound channel closed, stopping capture");
            break;
        }
        frames += 1;
    }
    stream.release();
    debug!("Capture loop finished after {} frames", frames);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::ToolCallRequest;
    use crate::gemini::Transcript;
    use crate::test_support::{FakeAudio, FakeService, HandshakeMode};
    use base64::Engine;

    fn transport() -> (SessionTransport, watch::Receiver<f32>) {
        let (tx, rx) = watch::channel(0.0);
        (SessionTransport::new(Arc::new(tx)), rx)
    }

    fn audio_payload(msg: &ClientMessage) -> Vec<u8> {
        match msg {
            ClientMessage::RealtimeInput(input) => {
                let blob = &input.audio;
                assert_eq!(blob.mime_type.as_deref(), Some("audio/pcm;rate=16000"));
                base64::engine::general_purpose::STANDARD
                    .decode(&blob.data)
                    .unwrap()
            }
            other => panic!("Unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_frames_sent_in_capture_order() {
        let service = FakeService::new();
        let audio = FakeAudio::new();
        let (mut transport, volume) = transport();

        transport
            .connect(&service, &audio, &SessionConfig::default())
            .await
            .unwrap();
        assert_eq!(transport.state(), TransportState::Open);

        assert!(audio.push_frame(vec![0.5]).await);
        assert!(audio.push_frame(vec![-0.5]).await);
        assert!(audio.push_frame(vec![1.0, -1.0]).await);

        let sent = service.wait_for_outbound(3).await;
        assert_eq!(sent.len(), 3);
        assert_eq!(audio_payload(&sent[0]), vec![0x00, 0x40]);
        assert_eq!(audio_payload(&sent[1]), vec![0x00, 0xC0]);
        assert_eq!(audio_payload(&sent[2]), vec![0xFF, 0x7F, 0x01, 0x80]);
        assert!((*volume.borrow() - 1.0).abs() < 1e-6);

        transport.disconnect().await;
    }

    #[tokio::test]
    async fn test_permission_denied_opens_nothing() {
        let service = FakeService::new();
        let audio = FakeAudio::new();
        audio.deny_permission();
        let (mut transport, _volume) = transport();

        let err = transport
            .connect(&service, &audio, &SessionConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::PermissionDenied(_)));
        assert_eq!(service.opened(), 0);
        assert_eq!(transport.state(), TransportState::Disconnected);
    }

    #[tokio::test]
    async fn test_handshake_failure_releases_microphone() {
        let service = FakeService::with_mode(HandshakeMode::Reject);
        let audio = FakeAudio::new();
        let (mut transport, _volume) = transport();

        let err = transport
            .connect(&service, &audio, &SessionConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::HandshakeFailed(_)));
        assert_eq!(audio.acquisitions(), 1);
        assert!(audio.mic_released());
        assert_eq!(transport.state(), TransportState::Disconnected);
    }

    #[tokio::test]
    async fn test_demultiplexes_in_receipt_order() {
        let service = FakeService::new();
        let audio = FakeAudio::new();
        let (mut transport, _volume) = transport();
        transport
            .connect(&service, &audio, &SessionConfig::default())
            .await
            .unwrap();

        service
            .push(ApiResponse::InputTranscription(Transcript {
                text: "hey".to_string(),
                is_final: false,
            }))
            .await;
        service.push(ApiResponse::GoAway(Some("1s".to_string()))).await;
        service
            .push(ApiResponse::ToolCall(vec![
                ToolCallRequest {
                    id: "a".to_string(),
                    name: "change_voice".to_string(),
                    args: serde_json::json!({"voice_name": "Kore"}),
                },
                ToolCallRequest {
                    id: "b".to_string(),
                    name: "other".to_string(),
                    args: serde_json::Value::Null,
                },
            ]))
            .await;
        service.push(ApiResponse::Interrupted).await;
        service.push(ApiResponse::TurnComplete).await;

        assert!(matches!(transport.next_event().await, InboundEvent::InputFragment(t) if t.text == "hey"));
        assert!(matches!(transport.next_event().await, InboundEvent::ToolCall(r) if r.id == "a"));
        assert!(matches!(transport.next_event().await, InboundEvent::ToolCall(r) if r.id == "b"));
        assert!(matches!(
            transport.next_event().await,
            InboundEvent::Control(ControlSignal::Interrupted)
        ));
        assert!(matches!(
            transport.next_event().await,
            InboundEvent::Control(ControlSignal::TurnComplete)
        ));

        service.close_remote();
        assert!(matches!(
            transport.next_event().await,
            InboundEvent::Control(ControlSignal::Closed)
        ));
    }

    #[tokio::test]
    async fn test_connection_error_is_reported() {
        let service = FakeService::new();
        let audio = FakeAudio::new();
        let (mut transport, _volume) = transport();
        transport
            .connect(&service, &audio, &SessionConfig::default())
            .await
            .unwrap();

        service.push_error(GeminiError::Timeout).await;
        assert!(matches!(
            transport.next_event().await,
            InboundEvent::Control(ControlSignal::Error(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_is_ordered_and_idempotent() {
        let service = FakeService::new();
        let audio = FakeAudio::new();
        let (mut transport, volume) = transport();
        transport
            .connect(&service, &audio, &SessionConfig::default())
            .await
            .unwrap();
        assert!(audio.push_frame(vec![0.25]).await);
        service.wait_for_outbound(1).await;

        transport.disconnect().await;
        transport.disconnect().await;

        assert_eq!(transport.state(), TransportState::Disconnected);
        assert!(audio.mic_released());
        assert!(service.outbound_closed());
        assert_eq!(*volume.borrow(), 0.0);
        assert!(!audio.push_frame(vec![0.25]).await);
        assert!(matches!(
            transport.next_event().await,
            InboundEvent::Control(ControlSignal::Closed)
        ));
        assert!(transport
            .send_tool_response(FunctionResponse {
                id: "x".to_string(),
                name: "y".to_string(),
                response: serde_json::Value::Null,
            })
            .is_err());
    }
}
