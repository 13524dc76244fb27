//! WebSocket writer task that serializes and sends all outgoing messages
//!
//! This is the single point where outbound messages hit the socket, so
//! frames leave in exactly the order producers queued them and no
//! producer ever waits on the network.

use futures_util::{Sink, SinkExt};
use std::fmt::Display;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info};

use crate::gemini::ClientMessage;

/// Drain `outgoing_rx` onto `sink` until every sender is dropped, then
/// close the sink.
pub async fn run_writer<S>(mut outgoing_rx: UnboundedReceiver<ClientMessage>, mut sink: S)
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    info!("WebSocket writer task started");
    let mut audio_chunks: u64 = 0;

    while let Some(msg) = outgoing_rx.recv().await {
        let json = match msg.to_json() {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize outgoing message: {}", e);
                continue;
            }
        };

        match &msg {
            ClientMessage::RealtimeInput(_) => {
                audio_chunks += 1;
                debug!("Sending audio chunk #{}", audio_chunks);
            }
            ClientMessage::Setup(setup) => info!("Sending setup for model {}", setup.model),
            ClientMessage::ToolResponse(resp) => {
                for r in &resp.function_responses {
                    info!("Sending tool response {} ({})", r.id, r.name);
                }
            }
        }

        if let Err(e) = sink.send(Message::text(json)).await {
            error!("Failed to send to websocket: {}", e);
            break;
        }
    }

    info!(
        "WebSocket writer task shutting down ({} audio chunks sent)",
        audio_chunks
    );
    if let Err(e) = sink.close().await {
        debug!("Error closing websocket sink: {}", e);
    }
}
