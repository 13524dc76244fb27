use serde_json::Value;

use crate::commands::ToolCallRequest;
use crate::gemini::Transcript;
use crate::session::SessionError;

/// Notifications delivered to the application, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Transcript {
        text: String,
        is_final: bool,
        is_model: bool,
    },
    TurnComplete {
        user_text: String,
        model_text: String,
    },
    ConnectionStateChanged(bool),
    Command {
        name: String,
        args: Value,
    },
    /// Non-fatal problem; the session keeps running.
    Warning(SessionError),
    /// Session-fatal failure, delivered once per failure.
    Error(SessionError),
}

/// Inbound traffic after demultiplexing by the transport.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    Audio {
        data: String,
        mime_type: Option<String>,
    },
    InputFragment(Transcript),
    OutputFragment(Transcript),
    ToolCall(ToolCallRequest),
    Control(ControlSignal),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlSignal {
    TurnComplete,
    Interrupted,
    Closed,
    Error(String),
}
