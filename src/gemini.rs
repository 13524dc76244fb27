//! Gemini Live API wire protocol
//!
//! Message types exchanged with the Live API over its bidirectional
//! WebSocket, and the translation of raw server messages into
//! [`ApiResponse`] values the session understands.

use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::commands::ToolCallRequest;
use crate::config::SessionConfig;

/// Generation configuration for setup.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Function declarations offered to the model.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub function_declarations: Vec<serde_json::Value>,
}

/// Empty marker object enabling a transcription stream.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct AudioTranscriptionConfig {}

/// Session setup message.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BidiGenerateContentSetup {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<AudioTranscriptionConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<AudioTranscriptionConfig>,
}

impl BidiGenerateContentSetup {
    /// Build the setup message for an audio session: persona, voice,
    /// declared commands and both transcription streams.
    pub fn for_session(config: &SessionConfig) -> Self {
        let declarations: Vec<serde_json::Value> = config
            .commands
            .iter()
            .map(|c| c.function_declaration())
            .collect();

        Self {
            model: config.model.clone(),
            generation_config: Some(GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: Some(SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: config.voice.as_str().to_string(),
                        },
                    },
                }),
            }),
            system_instruction: Some(Content {
                role: None,
                parts: vec![Part {
                    text: Some(config.system_instruction.clone()),
                }],
            }),
            tools: if declarations.is_empty() {
                Vec::new()
            } else {
                vec![Tool {
                    function_declarations: declarations,
                }]
            },
            input_audio_transcription: Some(AudioTranscriptionConfig {}),
            output_audio_transcription: Some(AudioTranscriptionConfig {}),
        }
    }
}

/// Inline media payload, base-64 encoded.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub data: String,
    #[serde(default)]
    pub mime_type: Option<String>,
}

/// A chunk of realtime input
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub audio: Blob,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    pub response: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub function_responses: Vec<FunctionResponse>,
}

/// Message sent from client to server.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(BidiGenerateContentSetup),
    RealtimeInput(RealtimeInput),
    ToolResponse(ToolResponse),
}

impl ClientMessage {
    /// Realtime microphone audio, already encoded as 16-bit PCM.
    pub fn audio(pcm: &[u8], sample_rate: u32) -> Self {
        use base64::Engine;
        ClientMessage::RealtimeInput(RealtimeInput {
            audio: Blob {
                data: base64::engine::general_purpose::STANDARD.encode(pcm),
                mime_type: Some(format!("audio/pcm;rate={}", sample_rate)),
            },
        })
    }

    /// Acknowledge a single function call.
    pub fn tool_response(response: FunctionResponse) -> Self {
        ClientMessage::ToolResponse(ToolResponse {
            function_responses: vec![response],
        })
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(GeminiError::Serialization)
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionFragment {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default, alias = "finished")]
    pub is_final: bool,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ServerPart {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub inline_data: Option<Blob>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<ServerPart>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub input_transcription: Option<TranscriptionFragment>,
    #[serde(default)]
    pub output_transcription: Option<TranscriptionFragment>,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub generation_complete: bool,
    #[serde(default)]
    pub turn_complete: bool,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct FunctionCall {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    #[serde(default)]
    pub function_calls: Vec<FunctionCall>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct ToolCallCancellation {
    #[serde(default)]
    pub ids: Vec<String>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

/// Server -> client message. Exactly one field is normally present.
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub tool_call: Option<ToolCall>,
    #[serde(default)]
    pub tool_call_cancellation: Option<ToolCallCancellation>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
}

/// Error type for Gemini API operations
#[derive(Debug, thiserror::Error)]
pub enum GeminiError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Setup not complete")]
    SetupNotComplete,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Timeout")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, GeminiError>;

/// Transcript fragment from the Gemini API
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub text: String,
    pub is_final: bool,
}

/// Response from the Gemini API
#[derive(Debug, Clone)]
pub enum ApiResponse {
    /// Setup has been completed
    SetupComplete,

    /// Transcription of user input
    InputTranscription(Transcript),

    /// Transcription of the model's speech
    OutputTranscription(Transcript),

    /// Text part of a model turn (only seen with text modality)
    TextResponse(String),

    /// Chunk of synthesized speech, base-64 PCM
    Audio {
        data: String,
        mime_type: Option<String>,
    },

    /// The user started speaking over the model
    Interrupted,

    /// The model finished generating for this turn
    GenerationComplete,

    /// The turn is over
    TurnComplete,

    /// Model is requesting one or more tool calls
    ToolCall(Vec<ToolCallRequest>),

    /// Model has cancelled pending tool calls
    ToolCallCancellation(Vec<String>),

    /// Server will disconnect soon
    GoAway(Option<String>),
}

impl ServerMessage {
    /// Flatten the message into responses, in the order they must be
    /// applied: transcripts, then audio, then interruption and turn
    /// completion.
    pub fn into_responses(self) -> Vec<ApiResponse> {
        let mut out = Vec::new();

        if self.setup_complete.is_some() {
            out.push(ApiResponse::SetupComplete);
        }

        if let Some(content) = self.server_content {
            if let Some(t) = content.input_transcription.and_then(non_empty_transcript) {
                out.push(ApiResponse::InputTranscription(t));
            }
            if let Some(t) = content.output_transcription.and_then(non_empty_transcript) {
                out.push(ApiResponse::OutputTranscription(t));
            }
            if let Some(turn) = content.model_turn {
                for part in turn.parts {
                    if let Some(blob) = part.inline_data {
                        out.push(ApiResponse::Audio {
                            data: blob.data,
                            mime_type: blob.mime_type,
                        });
                    } else if let Some(text) = part.text.filter(|t| !t.is_empty()) {
                        out.push(ApiResponse::TextResponse(text));
                    }
                }
            }
            if content.interrupted {
                out.push(ApiResponse::Interrupted);
            }
            if content.generation_complete {
                out.push(ApiResponse::GenerationComplete);
            }
            if content.turn_complete {
                out.push(ApiResponse::TurnComplete);
            }
        }

        if let Some(call) = self.tool_call {
            let requests: Vec<ToolCallRequest> = call
                .function_calls
                .into_iter()
                .map(|f| ToolCallRequest {
                    id: f.id,
                    name: f.name,
                    args: f.args,
                })
                .collect();
            if !requests.is_empty() {
                out.push(ApiResponse::ToolCall(requests));
            }
        }

        if let Some(cancel) = self.tool_call_cancellation {
            out.push(ApiResponse::ToolCallCancellation(cancel.ids));
        }

        if let Some(go_away) = self.go_away {
            out.push(ApiResponse::GoAway(go_away.time_left));
        }

        out
    }
}

fn non_empty_transcript(fragment: TranscriptionFragment) -> Option<Transcript> {
    let text = fragment.text?;
    if text.is_empty() {
        return None;
    }
    Some(Transcript {
        text,
        is_final: fragment.is_final,
    })
}

/// Parse one text frame from the socket.
pub fn parse_server_message(text: &str) -> Result<Vec<ApiResponse>> {
    let message: ServerMessage = serde_json::from_str(text)?;
    Ok(message.into_responses())
}
