//! Gemini Live API connection
//!
//! [`LiveService`] is the seam between the session and the remote voice
//! service: it performs the handshake and hands back a [`LiveChannel`],
//! an ordered outbound queue plus an ordered inbound stream.
//! [`GeminiLive`] implements it over a split WebSocket with one writer
//! task and one reader task.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::config::{SessionConfig, DEFAULT_MODEL};
use crate::gemini::{
    parse_server_message, ApiResponse, BidiGenerateContentSetup, ClientMessage, GeminiError,
    Result,
};
use crate::ws_writer::run_writer;

const LIVE_API_URL: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// How long teardown waits for the writer to flush its close frame.
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Configuration for the Gemini client
#[derive(Debug, Clone)]
pub struct GeminiClientConfig {
    pub url: String,
    pub default_model: String,
    pub setup_timeout: Duration,
}

impl Default for GeminiClientConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            default_model: DEFAULT_MODEL.to_string(),
            setup_timeout: Duration::from_secs(10),
        }
    }
}

impl GeminiClientConfig {
    /// Point the client at the public endpoint using an API key.
    pub fn from_api_key(api_key: &str) -> Self {
        Self {
            url: format!("{}?key={}", LIVE_API_URL, api_key),
            ..Default::default()
        }
    }
}

/// An open, set-up session with the remote service.
pub struct LiveChannel {
    outbound: Option<mpsc::UnboundedSender<ClientMessage>>,
    inbound: mpsc::Receiver<Result<ApiResponse>>,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl LiveChannel {
    pub fn new(
        outbound: mpsc::UnboundedSender<ClientMessage>,
        inbound: mpsc::Receiver<Result<ApiResponse>>,
        writer: Option<JoinHandle<()>>,
        reader: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            outbound: Some(outbound),
            inbound,
            writer,
            reader,
        }
    }

    /// A handle for producers that send without waiting.
    pub fn sender(&self) -> Option<mpsc::UnboundedSender<ClientMessage>> {
        self.outbound.clone()
    }

    /// Queue a message for the writer.
    pub fn send(&self, msg: ClientMessage) -> Result<()> {
        match &self.outbound {
            Some(tx) => tx.send(msg).map_err(|_| GeminiError::ChannelClosed),
            None => Err(GeminiError::ConnectionClosed),
        }
    }

    /// Next message from the service, `None` once the reader is gone.
    pub async fn recv(&mut self) -> Option<Result<ApiResponse>> {
        self.inbound.recv().await
    }

    /// Close the connection. Other outbound senders must be dropped first
    /// for the close frame to go out promptly. Safe to call repeatedly.
    pub async fn close(&mut self) {
        if self.outbound.take().is_none() {
            return;
        }
        if let Some(writer) = self.writer.take() {
            if tokio::time::timeout(WRITER_FLUSH_TIMEOUT, writer).await.is_err() {
                warn!("WebSocket writer did not finish in time");
            }
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.inbound.close();
        debug!("Live channel closed");
    }
}

impl Drop for LiveChannel {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// The remote conversational voice service.
#[async_trait]
pub trait LiveService: Send + Sync + 'static {
    /// Connect and complete the setup handshake for `config`.
    async fn open(&self, config: &SessionConfig) -> Result<LiveChannel>;
}

/// Gemini Live API over WebSocket.
pub struct GeminiLive {
    config: GeminiClientConfig,
}

impl GeminiLive {
    pub fn new(config: GeminiClientConfig) -> Self {
        Self { config }
    }

    /// Create a client from an API key with default settings.
    pub fn from_api_key(api_key: &str) -> Self {
        Self::new(GeminiClientConfig::from_api_key(api_key))
    }
}

#[async_trait]
impl LiveService for GeminiLive {
    async fn open(&self, config: &SessionConfig) -> Result<LiveChannel> {
        info!("Connecting to Gemini Live API");

        let (ws_stream, resp) = connect_async(self.config.url.as_str())
            .await
            .map_err(GeminiError::WebSocket)?;
        debug!("WebSocket connection response: {:?}", resp.status());

        let (sink, stream) = ws_stream.split();

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(run_writer(outbound_rx, sink));

        let (inbound_tx, inbound_rx) = mpsc::channel(100);
        let reader = tokio::spawn(read_messages(stream, inbound_tx));

        let mut channel = LiveChannel::new(outbound_tx, inbound_rx, Some(writer), Some(reader));

        let mut setup = BidiGenerateContentSetup::for_session(config);
        if setup.model.is_empty() {
            setup.model = self.config.default_model.clone();
        }
        info!("Sending setup with model {} and voice {}", setup.model, config.voice);
        channel.send(ClientMessage::Setup(setup))?;

        tokio::time::timeout(self.config.setup_timeout, wait_for_setup_complete(&mut channel))
            .await
            .map_err(|_| {
                error!("Timeout waiting for setup complete message");
                GeminiError::Timeout
            })??;

        info!("Gemini session setup complete");
        Ok(channel)
    }
}

async fn wait_for_setup_complete(channel: &mut LiveChannel) -> Result<()> {
    loop {
        match channel.recv().await {
            Some(Ok(ApiResponse::SetupComplete)) => return Ok(()),
            Some(Ok(other)) => debug!("Ignoring {:?} before setup complete", other),
            Some(Err(e)) => return Err(e),
            None => return Err(GeminiError::SetupNotComplete),
        }
    }
}

/// Reader task: parse every frame and forward responses in order.
async fn read_messages<S>(mut stream: S, response_tx: mpsc::Sender<Result<ApiResponse>>)
where
    S: futures_util::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    info!("Inbound message task started");

    loop {
        let text = match stream.next().await {
            Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    debug!("Ignoring non-UTF-8 binary message ({} bytes)", bytes.len());
                    continue;
                }
            },
            Some(Ok(Message::Close(frame))) => {
                info!("WebSocket closed: {:?}", frame);
                let _ = response_tx.send(Err(GeminiError::ConnectionClosed)).await;
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                error!("WebSocket error: {:?}", e);
                let _ = response_tx.send(Err(GeminiError::WebSocket(e))).await;
                break;
            }
            None => {
                let _ = response_tx.send(Err(GeminiError::ConnectionClosed)).await;
                break;
            }
        };

        let responses = match parse_server_message(&text) {
            Ok(responses) => responses,
            Err(e) => {
                warn!("Failed to parse server message: {}", e);
                continue;
            }
        };

        for response in responses {
            if response_tx.send(Ok(response)).await.is_err() {
                debug!("Response channel closed");
                return;
            }
        }
    }

    info!("Inbound message task terminated");
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use tokio_tungstenite::tungstenite::Error as WsError;

    #[test]
    fn test_config_from_api_key() {
        let config = GeminiClientConfig::from_api_key("secret");
        assert!(config.url.starts_with("wss://generativelanguage.googleapis.com/"));
        assert!(config.url.ends_with("?key=secret"));
        assert_eq!(config.setup_timeout, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_reader_forwards_in_order_and_reports_close() {
        let frames: Vec<std::result::Result<Message, WsError>> = vec![
            Ok(Message::text(r#"{"setupComplete": {}}"#)),
            Ok(Message::text("garbage")),
            Ok(Message::text(
                r#"{"serverContent": {"inputTranscription": {"text": "hey"}, "turnComplete": true}}"#,
            )),
            Ok(Message::Close(None)),
        ];
        let (tx, mut rx) = mpsc::channel(10);
        read_messages(stream::iter(frames), tx).await;

        assert!(matches!(rx.recv().await, Some(Ok(ApiResponse::SetupComplete))));
        match rx.recv().await {
            Some(Ok(ApiResponse::InputTranscription(t))) => assert_eq!(t.text, "hey"),
            other => panic!("Unexpected response: {:?}", other),
        }
        assert!(matches!(rx.recv().await, Some(Ok(ApiResponse::TurnComplete))));
        assert!(matches!(
            rx.recv().await,
            Some(Err(GeminiError::ConnectionClosed))
        ));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_reader_reports_end_of_stream() {
        let frames: Vec<std::result::Result<Message, WsError>> = vec![];
        let (tx, mut rx) = mpsc::channel(10);
        read_messages(stream::iter(frames), tx).await;
        assert!(matches!(
            rx.recv().await,
            Some(Err(GeminiError::ConnectionClosed))
        ));
    }

    #[tokio::test]
    async fn test_channel_close_is_idempotent() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (_in_tx, in_rx) = mpsc::channel(1);
        let mut channel = LiveChannel::new(out_tx, in_rx, None, None);

        channel.send(ClientMessage::audio(&[0, 0], 16_000)).unwrap();
        channel.close().await;
        channel.close().await;

        assert!(matches!(
            channel.send(ClientMessage::audio(&[0, 0], 16_000)),
            Err(GeminiError::ConnectionClosed)
        ));
        assert!(out_rx.recv().await.is_some());
        assert!(out_rx.recv().await.is_none());
    }

    // To run this test, set the GEMINI_API_KEY environment variable
    #[tokio::test]
    #[ignore]
    async fn test_api_handshake() {
        let api_key = match std::env::var("GEMINI_API_KEY") {
            Ok(key) => key,
            Err(_) => {
                println!("GEMINI_API_KEY environment variable not set, skipping test");
                return;
            }
        };

        let service = GeminiLive::from_api_key(&api_key);
        let mut channel = service
            .open(&SessionConfig::default())
            .await
            .expect("handshake failed");
        channel.close().await;
    }
}
