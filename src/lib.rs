//! livevoice - live duplex voice sessions with the Gemini Live API
//!
//! Captures microphone audio, streams it to the remote voice service and
//! plays the synthesized reply back without gaps, while aggregating
//! transcripts per turn and answering the model's tool calls. Everything
//! is driven through [`VoiceSession`].

#![forbid(unsafe_code)]

/// PulseAudio backend (enabled with the "pulse" feature) and output mixing
pub mod audio;
/// Audio hardware contract
pub mod audio_io;
/// Remote-invocable commands
pub mod commands;
/// Session and application configuration
pub mod config;
pub mod events;
/// Frame encoding and inbound audio decoding
pub mod frame;
/// Gemini Live API wire protocol
pub mod gemini;
/// Gemini Live API connection
pub mod gemini_client;
pub mod playback;
pub mod session;
pub mod transcript;
pub mod transport;
mod ws_writer;

#[cfg(test)]
pub(crate) mod test_support;

pub use audio_io::{AudioError, AudioIo};
pub use commands::{change_voice, CommandRegistry, CommandSpec};
pub use config::{AppConfig, SessionConfig, Voice};
pub use events::SessionEvent;
pub use gemini_client::{GeminiClientConfig, GeminiLive, LiveService};
pub use session::{SessionError, SessionState, VoiceSession};
