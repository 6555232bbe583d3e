//! Gemini Live API client
//!
//! Opens the BidiGenerateContent websocket, performs the setup handshake and
//! then splits the socket: a reader task turns server messages into
//! [`TransportEvent`]s, and a writer task drains the outbound queue.

use crate::events::{Outbound, TransportEvent};
use crate::gemini::{BidiGenerateContentSetup, ClientMessage, ServerMessage, LIVE_API_URL};
use crate::transport::{LiveConfig, Transport, TransportError, TransportSession};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// [`Transport`] backed by the Gemini Live API.
#[derive(Debug, Clone)]
pub struct GeminiTransport {
    url: String,
    setup_timeout: Duration,
}

impl GeminiTransport {
    pub fn from_api_key(api_key: &str, setup_timeout: Duration) -> Self {
        Self::with_url(format!("{}?key={}", LIVE_API_URL, api_key), setup_timeout)
    }

    /// Connect to an arbitrary endpoint speaking the same protocol.
    pub fn with_url(url: String, setup_timeout: Duration) -> Self {
        Self { url, setup_timeout }
    }
}

impl Transport for GeminiTransport {
    fn open(
        &self,
        config: LiveConfig,
    ) -> impl Future<Output = Result<TransportSession, TransportError>> + Send {
        let url = self.url.clone();
        let setup_timeout = self.setup_timeout;
        async move { open_session(url, setup_timeout, config).await }
    }
}

async fn open_session(
    url: String,
    setup_timeout: Duration,
    config: LiveConfig,
) -> Result<TransportSession, TransportError> {
    info!("Connecting to Gemini Live API (model {})", config.model);

    let (ws, resp) = connect_async(url.as_str()).await?;
    debug!("WebSocket connection response: {:?}", resp.status());

    // Split the socket so reads and writes never wait on each other
    let (mut sink, mut stream) = ws.split();

    let setup = ClientMessage::Setup(BidiGenerateContentSetup::from_config(&config));
    sink.send(Message::text(serde_json::to_string(&setup)?)).await?;
    info!("Setup message sent, waiting for acknowledgment");

    match tokio::time::timeout(setup_timeout, wait_for_setup_complete(&mut stream)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!("Setup failed: {}", e);
            return Err(e);
        }
        Err(_) => {
            error!("Timeout waiting for setup complete message");
            let _ = sink.close().await;
            return Err(TransportError::Timeout);
        }
    }
    info!("Gemini session setup complete");

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_writer(sink, outbound_rx));
    tokio::spawn(run_reader(stream, inbound_tx));

    Ok(TransportSession::new(outbound_tx, inbound_rx))
}

/// Message payload as text, if it carries one.
fn message_text(message: &Message) -> Option<&str> {
    match message {
        Message::Text(text) => Some(text.as_str()),
        // The endpoint sometimes sends JSON in binary frames
        Message::Binary(bytes) => std::str::from_utf8(bytes).ok(),
        _ => None,
    }
}

async fn wait_for_setup_complete(stream: &mut WsSource) -> Result<(), TransportError> {
    while let Some(message) = stream.next().await {
        let message = message?;
        if let Message::Close(frame) = &message {
            return Err(match frame {
                Some(frame) if !frame.reason.is_empty() => {
                    TransportError::Remote(frame.reason.to_string())
                }
                _ => TransportError::ConnectionClosed,
            });
        }
        let Some(text) = message_text(&message) else {
            continue;
        };
        match serde_json::from_str::<ServerMessage>(text) {
            Ok(ServerMessage::SetupComplete { .. }) => return Ok(()),
            Ok(other) => debug!("Ignoring message before setup complete: {:?}", other),
            Err(_) => debug!("Ignoring unrecognized message before setup: {}", text),
        }
    }
    Err(TransportError::SetupNotComplete)
}

async fn run_reader(mut stream: WsSource, events: mpsc::UnboundedSender<TransportEvent>) {
    info!("Inbound message task started");

    let terminal = loop {
        let message = match stream.next().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                error!("WebSocket error: {}", e);
                break TransportEvent::Error(e.to_string());
            }
            None => break TransportEvent::Closed,
        };

        if let Message::Close(frame) = &message {
            info!("WebSocket closed: {:?}", frame);
            break TransportEvent::Closed;
        }
        let Some(text) = message_text(&message) else {
            continue;
        };

        match serde_json::from_str::<ServerMessage>(text) {
            Ok(ServerMessage::ServerContent { server_content }) => {
                for event in server_content.into_events() {
                    if events.send(event).is_err() {
                        debug!("Event receiver dropped");
                        return;
                    }
                }
            }
            Ok(ServerMessage::GoAway { go_away }) => {
                warn!("Server going away: {}", go_away);
                break TransportEvent::Closed;
            }
            Ok(ServerMessage::SetupComplete { .. }) => debug!("Duplicate setupComplete"),
            // usageMetadata, toolCall and friends are not used here
            Err(_) => debug!("Ignoring unrecognized message: {}", text),
        }
    };

    let _ = events.send(terminal);
    info!("Inbound message task terminated");
}

async fn run_writer(mut sink: WsSink, mut outbound: mpsc::UnboundedReceiver<Outbound>) {
    info!("WebSocket writer task started");
    let mut sent = 0u64;

    while let Some(message) = outbound.recv().await {
        let payload = match message {
            Outbound::Audio(chunk) => ClientMessage::audio(chunk.into_text()),
            Outbound::Close => break,
        };
        let json = match serde_json::to_string(&payload) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize outbound message: {}", e);
                continue;
            }
        };
        if let Err(e) = sink.send(Message::text(json)).await {
            error!("Failed to send to websocket: {}", e);
            return;
        }
        sent += 1;
        if sent % 50 == 0 {
            debug!("Sent {} audio chunks", sent);
        }
    }

    // Reached on Close or when every sender is gone
    match serde_json::to_string(&ClientMessage::audio_stream_end()) {
        Ok(json) => {
            if let Err(e) = sink.send(Message::text(json)).await {
                debug!("Failed to send audioStreamEnd: {}", e);
            }
        }
        Err(e) => error!("Failed to serialize audioStreamEnd: {}", e),
    }
    if let Err(e) = sink.close().await {
        debug!("WebSocket close failed: {}", e);
    }
    info!("WebSocket writer task shutting down after {} chunks", sent);
}
