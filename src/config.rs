//! Session configuration
//!
//! A [`SessionConfig`] is built once per connect attempt and never mutated
//! while the session runs. Changing the persona, voice or playback rate
//! means tearing the session down and connecting again.

use crate::commands::CommandSpec;
use std::fmt;
use std::str::FromStr;

/// Microphone capture rate expected by the remote service.
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Rate of the synthesized speech the remote service streams back.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

/// Default Live API model
pub const DEFAULT_MODEL: &str = "models/gemini-2.0-flash-live-001";

const DEFAULT_PERSONA: &str = "You are a friendly voice assistant. Keep answers short and conversational.";

const MIN_PLAYBACK_RATE: f32 = 0.5;
const MAX_PLAYBACK_RATE: f32 = 2.0;

/// Prebuilt synthesized voices offered by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Voice {
    #[default]
    Puck,
    Charon,
    Kore,
    Fenrir,
    Aoede,
}

impl Voice {
    pub const ALL: [Voice; 5] = [
        Voice::Puck,
        Voice::Charon,
        Voice::Kore,
        Voice::Fenrir,
        Voice::Aoede,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Puck => "Puck",
            Self::Charon => "Charon",
            Self::Kore => "Kore",
            Self::Fenrir => "Fenrir",
            Self::Aoede => "Aoede",
        }
    }
}

impl fmt::Display for Voice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Voice {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Voice::ALL
            .iter()
            .copied()
            .find(|v| v.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ConfigError::UnknownVoice(s.to_string()))
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("GEMINI_API_KEY is not set")]
    MissingApiKey,

    #[error("unknown voice '{0}'")]
    UnknownVoice(String),

    #[error("invalid playback rate '{0}' (expected a number between 0.5 and 2.0)")]
    InvalidPlaybackRate(String),
}

/// Immutable per-connection settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub model: String,
    pub system_instruction: String,
    pub voice: Voice,
    pub commands: Vec<CommandSpec>,
    pub playback_rate: f32,
    pub capture_sample_rate: u32,
    pub playback_sample_rate: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            system_instruction: DEFAULT_PERSONA.to_string(),
            voice: Voice::default(),
            commands: Vec::new(),
            playback_rate: 1.0,
            capture_sample_rate: CAPTURE_SAMPLE_RATE,
            playback_sample_rate: PLAYBACK_SAMPLE_RATE,
        }
    }
}

impl SessionConfig {
    pub fn with_commands(mut self, commands: Vec<CommandSpec>) -> Self {
        self.commands = commands;
        self
    }

    /// Names of the commands the remote side may invoke.
    pub fn command_names(&self) -> impl Iterator<Item = &str> {
        self.commands.iter().map(|c| c.name.as_str())
    }
}

/// Application settings loaded from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api_key: String,
    pub model: String,
    pub voice: Voice,
    pub playback_rate: f32,
    pub persona: String,
    /// PulseAudio source, default device when unset
    pub input_device: Option<String>,
    /// PulseAudio sink, default device when unset
    pub output_device: Option<String>,
}

impl AppConfig {
    /// Load settings from `GEMINI_API_KEY` and the `LIVEVOICE_*` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key = lookup("GEMINI_API_KEY")
            .filter(|k| !k.is_empty())
            .ok_or(ConfigError::MissingApiKey)?;

        let voice = match lookup("LIVEVOICE_VOICE") {
            Some(v) => v.parse()?,
            None => Voice::default(),
        };

        let playback_rate = match lookup("LIVEVOICE_PLAYBACK_RATE") {
            Some(raw) => parse_playback_rate(&raw)?,
            None => 1.0,
        };

        Ok(Self {
            api_key,
            model: lookup("LIVEVOICE_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            voice,
            playback_rate,
            persona: lookup("LIVEVOICE_PERSONA").unwrap_or_else(|| DEFAULT_PERSONA.to_string()),
            input_device: lookup("LIVEVOICE_INPUT_DEVICE").filter(|d| !d.is_empty()),
            output_device: lookup("LIVEVOICE_OUTPUT_DEVICE").filter(|d| !d.is_empty()),
        })
    }

    /// Snapshot the current settings into a config for one connect attempt.
    pub fn session_config(&self, commands: Vec<CommandSpec>) -> SessionConfig {
        SessionConfig {
            model: self.model.clone(),
            system_instruction: self.persona.clone(),
            voice: self.voice,
            commands,
            playback_rate: self.playback_rate,
            ..Default::default()
        }
    }
}

fn parse_playback_rate(raw: &str) -> Result<f32, ConfigError> {
    let rate: f32 = raw
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidPlaybackRate(raw.to_string()))?;
    if !rate.is_finite() || !(MIN_PLAYBACK_RATE..=MAX_PLAYBACK_RATE).contains(&rate) {
        return Err(ConfigError::InvalidPlaybackRate(raw.to_string()));
    }
    Ok(rate)
}
