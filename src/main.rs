//! livevoice - talk to Gemini Live from the terminal
//!
//! Streams the default microphone to the Live API and plays the spoken
//! reply through PulseAudio. Turns are logged as they complete. The model
//! may switch its own voice through the `change_voice` command, which
//! restarts the session with the new voice.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use livevoice::audio::PulseAudio;
use livevoice::{
    change_voice, AppConfig, CommandRegistry, GeminiLive, SessionEvent, Voice, VoiceSession,
};
use serde_json::Value;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

fn requested_voice(args: &Value) -> Option<Voice> {
    args.get("voice_name")?.as_str()?.parse().ok()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    info!("Starting livevoice");

    let mut app = AppConfig::from_env().context("Failed to load configuration")?;
    let service = Arc::new(GeminiLive::from_api_key(&app.api_key));
    let audio = Arc::new(
        PulseAudio::new("livevoice").with_devices(app.input_device.clone(), app.output_device.clone()),
    );

    let (session, mut events) = VoiceSession::new(service, audio, CommandRegistry::new());
    session
        .connect(app.session_config(vec![change_voice()]))
        .await
        .context("Failed to start voice session")?;
    info!("Live with voice {}. Press Ctrl-C to quit.", app.voice);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Ctrl-C received, shutting down");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    SessionEvent::Transcript { text, is_final, is_model } => {
                        let who = if is_model { "model" } else { "user" };
                        debug!("[{}{}] {}", who, if is_final { ", final" } else { "" }, text);
                    }
                    SessionEvent::TurnComplete { user_text, model_text } => {
                        if !user_text.is_empty() {
                            info!("You: {}", user_text);
                        }
                        if !model_text.is_empty() {
                            info!("Gemini: {}", model_text);
                        }
                    }
                    SessionEvent::ConnectionStateChanged(true) => info!("Connected"),
                    SessionEvent::ConnectionStateChanged(false) => {
                        if !session.is_live() && !session.is_connecting() {
                            info!("Session closed");
                            break;
                        }
                    }
                    SessionEvent::Command { name, args } if name == "change_voice" => {
                        let Some(voice) = requested_voice(&args) else {
                            warn!("change_voice without a usable voice: {}", args);
                            continue;
                        };
                        info!("Switching voice to {}", voice);
                        app.voice = voice;
                        session.disconnect().await;
                        session
                            .connect(app.session_config(vec![change_voice()]))
                            .await
                            .context("Failed to restart voice session")?;
                    }
                    SessionEvent::Command { name, args } => info!("Command {}: {}", name, args),
                    SessionEvent::Warning(e) => warn!("{}", e),
                    SessionEvent::Error(e) => {
                        error!("{}", e);
                        break;
                    }
                }
            }
        }
    }

    session.disconnect().await;
    info!("Goodbye");
    Ok(())
}
