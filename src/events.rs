use crate::pcm::EncodedAudioPayload;

/// Inbound events from the live endpoint, in receipt order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A text fragment of the model's turn.
    Text(String),
    /// Base64 16-bit PCM at the output rate.
    Audio(String),
    /// The endpoint heard the user speak over the model.
    Interrupted,
    TurnComplete,
    /// Transcription of what the user said.
    InputTranscript(String),
    /// Transcription of what the model said.
    OutputTranscript(String),
    /// Graceful close. Always the last event.
    Closed,
    /// Connection-level failure. Always the last event.
    Error(String),
}

impl TransportEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransportEvent::Closed | TransportEvent::Error(_))
    }
}

/// Messages queued for the writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    Audio(EncodedAudioPayload),
    /// Tell the endpoint the audio stream has ended, then close.
    Close,
}
