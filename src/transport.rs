//! Session transport contract
//!
//! A [`Transport`] opens a [`TransportSession`]: a send queue for captured
//! chunks and an ordered stream of [`TransportEvent`]s. The live endpoint
//! lives in `gemini_client`; [`MemoryTransport`] is an in-process loopback
//! used to drive sessions without a network.

use crate::events::{Outbound, TransportEvent};
use crate::pcm::EncodedAudioPayload;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::{debug, info};

/// Options sent to the endpoint when a session opens.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveConfig {
    pub model: String,
    pub response_modality: ResponseModality,
    pub voice: String,
    pub system_instruction: String,
    /// Ask the endpoint to transcribe its own speech.
    pub output_transcription: bool,
    /// Ask the endpoint to transcribe the user's speech.
    pub input_transcription: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseModality {
    Text,
    Audio,
}

impl ResponseModality {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseModality::Text => "TEXT",
            ResponseModality::Audio => "AUDIO",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Setup not complete")]
    SetupNotComplete,

    #[error("Timeout waiting for setup")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Remote error: {0}")]
    Remote(String),
}

impl TransportError {
    pub fn user_message(&self) -> String {
        match self {
            TransportError::Timeout | TransportError::SetupNotComplete => {
                "The quiz host did not answer. Please try again.".to_string()
            }
            TransportError::ConnectionClosed | TransportError::ChannelClosed => {
                "The connection to the quiz host was closed.".to_string()
            }
            _ => "Lost connection to the quiz host.".to_string(),
        }
    }
}

/// Opens live sessions.
pub trait Transport {
    /// Connect and wait for the endpoint to acknowledge the session.
    fn open(
        &self,
        config: LiveConfig,
    ) -> impl Future<Output = Result<TransportSession, TransportError>> + Send;
}

/// Cloneable, non-blocking handle for queueing captured chunks.
#[derive(Debug, Clone)]
pub struct ChunkSender {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ChunkSender {
    /// Queue a chunk. Never blocks and never drops while the session is open.
    pub fn send(&self, chunk: EncodedAudioPayload) -> Result<(), TransportError> {
        self.tx
            .send(Outbound::Audio(chunk))
            .map_err(|_| TransportError::ChannelClosed)
    }
}

/// One open session with the endpoint.
#[derive(Debug)]
pub struct TransportSession {
    outbound: mpsc::UnboundedSender<Outbound>,
    inbound: mpsc::UnboundedReceiver<TransportEvent>,
    close_requested: bool,
    finished: bool,
}

impl TransportSession {
    pub fn new(
        outbound: mpsc::UnboundedSender<Outbound>,
        inbound: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            close_requested: false,
            finished: false,
        }
    }

    pub fn send(&self, chunk: EncodedAudioPayload) -> Result<(), TransportError> {
        self.sender().send(chunk)
    }

    pub fn sender(&self) -> ChunkSender {
        ChunkSender {
            tx: self.outbound.clone(),
        }
    }

    /// Next inbound event. Once a terminal event has been returned, every
    /// further call returns [`TransportEvent::Closed`].
    pub async fn next_event(&mut self) -> TransportEvent {
        if self.finished {
            return TransportEvent::Closed;
        }
        let event = self.inbound.recv().await.unwrap_or(TransportEvent::Closed);
        if event.is_terminal() {
            self.finished = true;
        }
        event
    }

    /// Ask the writer to end the audio stream and close. Safe to call
    /// repeatedly.
    pub fn close(&mut self) {
        if self.close_requested {
            return;
        }
        self.close_requested = true;
        if self.outbound.send(Outbound::Close).is_err() {
            debug!("Transport writer already gone");
        }
    }
}

struct MemoryChannels {
    outbound: mpsc::UnboundedSender<Outbound>,
    inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Loopback transport. The paired [`RemoteEnd`] plays the endpoint.
pub struct MemoryTransport {
    channels: Mutex<Option<MemoryChannels>>,
    opened_with: Arc<Mutex<Option<LiveConfig>>>,
    refuse: Option<String>,
}

impl MemoryTransport {
    pub fn pair() -> (Self, RemoteEnd) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let opened_with = Arc::new(Mutex::new(None));
        let transport = Self {
            channels: Mutex::new(Some(MemoryChannels {
                outbound: out_tx,
                inbound: in_rx,
            })),
            opened_with: opened_with.clone(),
            refuse: None,
        };
        let remote = RemoteEnd {
            events: in_tx,
            received: out_rx,
            opened_with,
        };
        (transport, remote)
    }

    /// A transport whose `open` always fails with a remote error.
    pub fn refusing(reason: &str) -> Self {
        let (transport, _remote) = Self::pair();
        Self {
            refuse: Some(reason.to_string()),
            ..transport
        }
    }
}

impl Transport for MemoryTransport {
    fn open(
        &self,
        config: LiveConfig,
    ) -> impl Future<Output = Result<TransportSession, TransportError>> + Send {
        let result = match &self.refuse {
            Some(reason) => Err(TransportError::Remote(reason.clone())),
            None => match self.channels.lock().take() {
                Some(channels) => {
                    info!("Loopback session opened");
                    *self.opened_with.lock() = Some(config);
                    Ok(TransportSession::new(channels.outbound, channels.inbound))
                }
                None => Err(TransportError::ConnectionClosed),
            },
        };
        std::future::ready(result)
    }
}

/// Endpoint side of a [`MemoryTransport`].
pub struct RemoteEnd {
    events: mpsc::UnboundedSender<TransportEvent>,
    received: mpsc::UnboundedReceiver<Outbound>,
    opened_with: Arc<Mutex<Option<LiveConfig>>>,
}

impl RemoteEnd {
    /// Deliver an event to the client. Returns false once the client is gone.
    pub fn push(&self, event: TransportEvent) -> bool {
        self.events.send(event).is_ok()
    }

    pub async fn recv(&mut self) -> Option<Outbound> {
        self.received.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Outbound> {
        self.received.try_recv().ok()
    }

    /// The config the client opened with, once it has.
    pub fn opened_with(&self) -> Option<LiveConfig> {
        self.opened_with.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> LiveConfig {
        LiveConfig {
            model: "models/test".to_string(),
            response_modality: ResponseModality::Audio,
            voice: "Puck".to_string(),
            system_instruction: "Ask questions.".to_string(),
            output_transcription: true,
            input_transcription: false,
        }
    }

    #[tokio::test]
    async fn test_loopback_round_trip() {
        let (transport, mut remote) = MemoryTransport::pair();
        let mut session = transport.open(config()).await.unwrap();
        assert_eq!(remote.opened_with().unwrap().voice, "Puck");

        session.send(EncodedAudioPayload::from_samples(&[0.0; 4])).unwrap();
        match remote.recv().await {
            Some(Outbound::Audio(chunk)) => assert_eq!(chunk.bytes().len(), 8),
            other => panic!("unexpected outbound message: {:?}", other),
        }

        remote.push(TransportEvent::Text("Hello!".to_string()));
        assert_eq!(session.next_event().await, TransportEvent::Text("Hello!".to_string()));

        session.close();
        session.close();
        assert!(matches!(remote.recv().await, Some(Outbound::Close)));
        assert!(remote.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_events_end_with_closed() {
        let (transport, remote) = MemoryTransport::pair();
        let mut session = transport.open(config()).await.unwrap();

        remote.push(TransportEvent::Error("reset".to_string()));
        remote.push(TransportEvent::Text("late".to_string()));
        assert!(matches!(session.next_event().await, TransportEvent::Error(_)));
        assert_eq!(session.next_event().await, TransportEvent::Closed);

        drop(remote);
        assert_eq!(session.next_event().await, TransportEvent::Closed);
    }

    #[tokio::test]
    async fn test_dropped_remote_reads_as_closed() {
        let (transport, remote) = MemoryTransport::pair();
        let mut session = transport.open(config()).await.unwrap();
        drop(remote);
        assert_eq!(session.next_event().await, TransportEvent::Closed);
        assert!(session.send(EncodedAudioPayload::from_samples(&[0.0])).is_err());
    }

    #[tokio::test]
    async fn test_open_once_and_refusal() {
        let (transport, _remote) = MemoryTransport::pair();
        let _session = transport.open(config()).await.unwrap();
        assert!(matches!(
            transport.open(config()).await,
            Err(TransportError::ConnectionClosed)
        ));

        let refusing = MemoryTransport::refusing("quota exceeded");
        let err = refusing.open(config()).await.unwrap_err();
        assert!(matches!(err, TransportError::Remote(_)));
        assert!(!err.user_message().is_empty());
    }
}
