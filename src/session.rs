//! Session orchestration
//!
//! The orchestrator owns everything a live game needs: the capture
//! pipeline, the playback scheduler, the transport session and the chunk
//! forwarder between them. Inbound transport events are handled one at a
//! time, in order, by [`SessionOrchestrator::handle_event`]. A microphone or
//! speaker that fails mid-game ends the session the same way a transport
//! failure does.
//!
//! ```text
//! Idle -> Preparing -> Connecting -> Connected -> Ended
//!   \________\______________\____________________/^
//! ```

use crate::audio::AudioBackend;
use crate::audio_decode;
use crate::capture::{CaptureError, CaptureHandle};
use crate::config::{OUTPUT_CHANNELS, OUTPUT_SAMPLE_RATE};
use crate::events::TransportEvent;
use crate::pcm;
use crate::playback::{PlaybackError, PlaybackScheduler};
use crate::quiz::{build_instruction, Question, QuizSet};
use crate::spectrum::SpectrumTap;
use crate::transport::{LiveConfig, ResponseModality, Transport, TransportError, TransportSession};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::RuntimeFlavor;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Preparing,
    Connecting,
    Connected,
    Ended,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Preparing => "preparing",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Ended => "ended",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Model,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => f.write_str("user"),
            Role::Model => f.write_str("model"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEntry {
    pub role: Role,
    pub text: String,
}

/// Ordered, append-only record of one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
}

impl Transcript {
    fn append(&mut self, role: Role, text: String) -> &TranscriptEntry {
        self.entries.push(TranscriptEntry { role, text });
        &self.entries[self.entries.len() - 1]
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Counters for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub chunks_sent: u64,
    pub fragments_played: u64,
    /// Audio fragments that could not be decoded.
    pub fragments_dropped: u64,
    pub interruptions: u64,
    pub turns_completed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// The player ended the game.
    UserEnded,
    /// The endpoint closed the session.
    RemoteClosed,
    CaptureUnavailable,
    PlaybackUnavailable,
    /// The session could not be opened.
    ConnectFailed(String),
    /// The open session failed.
    TransportFailed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("cannot {action} while {from}")]
    InvalidTransition {
        from: SessionState,
        action: &'static str,
    },

    #[error("no questions to ask")]
    NoQuestions,

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Playback(#[from] PlaybackError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl SessionError {
    pub fn user_message(&self) -> String {
        match self {
            SessionError::InvalidTransition { .. } => "That is not possible right now.".to_string(),
            SessionError::NoQuestions => "There are no questions to play yet.".to_string(),
            SessionError::Capture(e) => e.user_message(),
            SessionError::Playback(e) => e.user_message(),
            SessionError::Transport(e) => e.user_message(),
        }
    }
}

/// Per-session options that do not come from the quiz itself.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub model: String,
    pub voice: String,
    pub output_transcription: bool,
    pub input_transcription: bool,
}

type TranscriptSink = Box<dyn FnMut(&TranscriptEntry) + Send>;

/// Drives one game from start to end.
pub struct SessionOrchestrator {
    settings: SessionSettings,
    state: SessionState,
    topic: String,
    questions: Vec<Question>,
    transcript: Transcript,
    transcript_sink: Option<TranscriptSink>,
    stats: SessionStats,
    chunks_sent: Arc<AtomicU64>,
    capture: Option<CaptureHandle>,
    playback: Option<PlaybackScheduler>,
    transport: Option<TransportSession>,
    forwarder: Option<JoinHandle<()>>,
    capture_fault: Option<watch::Receiver<Option<String>>>,
    playback_fault: Option<watch::Receiver<Option<String>>>,
    end_reason: Option<EndReason>,
    user_error: Option<String>,
}

impl SessionOrchestrator {
    pub fn new(settings: SessionSettings) -> Self {
        Self {
            settings,
            state: SessionState::Idle,
            topic: String::new(),
            questions: Vec::new(),
            transcript: Transcript::default(),
            transcript_sink: None,
            stats: SessionStats::default(),
            chunks_sent: Arc::new(AtomicU64::new(0)),
            capture: None,
            playback: None,
            transport: None,
            forwarder: None,
            capture_fault: None,
            playback_fault: None,
            end_reason: None,
            user_error: None,
        }
    }

    /// Called with every transcript entry as it is appended.
    pub fn with_transcript_sink<F>(mut self, sink: F) -> Self
    where
        F: FnMut(&TranscriptEntry) + Send + 'static,
    {
        self.transcript_sink = Some(Box::new(sink));
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            chunks_sent: self.chunks_sent.load(Ordering::Relaxed),
            ..self.stats
        }
    }

    pub fn end_reason(&self) -> Option<&EndReason> {
        self.end_reason.as_ref()
    }

    /// Short message for the player when the session failed.
    pub fn user_error(&self) -> Option<&str> {
        self.user_error.as_deref()
    }

    pub fn questions(&self) -> &[Question] {
        &self.questions
    }

    pub fn playback(&self) -> Option<&PlaybackScheduler> {
        self.playback.as_ref()
    }

    pub fn capture_tap(&self) -> Option<SpectrumTap> {
        self.capture.as_ref().map(CaptureHandle::tap)
    }

    pub fn playback_tap(&self) -> Option<SpectrumTap> {
        self.playback.as_ref().map(PlaybackScheduler::tap)
    }

    /// True when no capture, playback or transport resource is held.
    pub fn resources_released(&self) -> bool {
        self.capture.is_none()
            && self.playback.is_none()
            && self.transport.is_none()
            && self.forwarder.is_none()
    }

    /// Idle -> Preparing.
    pub fn start_game(&mut self, topic: &str) -> Result<(), SessionError> {
        self.expect_state(SessionState::Idle, "start a game")?;
        self.topic = topic.to_string();
        self.transition(SessionState::Preparing);
        Ok(())
    }

    /// Store the question set. The session stays in Preparing until
    /// [`connect`](Self::connect).
    pub fn questions_ready(&mut self, set: QuizSet) -> Result<(), SessionError> {
        self.expect_state(SessionState::Preparing, "accept questions")?;
        if set.questions.is_empty() {
            return Err(SessionError::NoQuestions);
        }
        if !set.topic.is_empty() {
            self.topic = set.topic;
        }
        info!("{} questions ready", set.questions.len());
        self.questions = set.questions;
        Ok(())
    }

    /// The instruction sent to the endpoint when connecting.
    pub fn instruction(&self) -> String {
        build_instruction(&self.topic, &self.questions)
    }

    /// Preparing -> Connecting -> Connected.
    ///
    /// Opens capture first; if the microphone is unavailable the session
    /// ends without opening a transport. Any failure releases whatever was
    /// already opened and ends the session.
    pub async fn connect<T: Transport>(
        &mut self,
        transport: &T,
        backend: Arc<dyn AudioBackend>,
    ) -> Result<(), SessionError> {
        self.expect_state(SessionState::Preparing, "connect")?;
        if self.questions.is_empty() {
            return Err(SessionError::NoQuestions);
        }
        self.transition(SessionState::Connecting);

        let capture_backend = backend.clone();
        let capture = match tokio::task::spawn_blocking(move || CaptureHandle::start(capture_backend))
            .await
        {
            Ok(result) => result,
            Err(e) => Err(CaptureError::Unavailable(e.to_string())),
        };
        let mut capture = match capture {
            Ok(capture) => capture,
            Err(e) => return Err(self.fail(EndReason::CaptureUnavailable, e.into())),
        };
        let chunks = capture.take_chunks();
        self.capture_fault = Some(capture.watch_fault());
        self.capture = Some(capture);

        let playback = match tokio::task::spawn_blocking(move || backend.open_playback()).await {
            Ok(result) => result,
            Err(e) => Err(PlaybackError::Unavailable(e.to_string())),
        };
        match playback {
            Ok(playback) => {
                self.playback_fault = Some(playback.watch_fault());
                self.playback = Some(playback);
            }
            Err(e) => return Err(self.fail(EndReason::PlaybackUnavailable, e.into())),
        }

        let config = LiveConfig {
            model: self.settings.model.clone(),
            response_modality: ResponseModality::Audio,
            voice: self.settings.voice.clone(),
            system_instruction: self.instruction(),
            output_transcription: self.settings.output_transcription,
            input_transcription: self.settings.input_transcription,
        };
        let session = match transport.open(config).await {
            Ok(session) => session,
            Err(e) => {
                let reason = EndReason::ConnectFailed(e.to_string());
                return Err(self.fail(reason, e.into()));
            }
        };

        // Chunks captured while connecting are already queued and go first.
        if let Some(mut chunks) = chunks {
            let sender = session.sender();
            let sent = self.chunks_sent.clone();
            self.forwarder = Some(tokio::spawn(async move {
                while let Some(chunk) = chunks.recv().await {
                    if sender.send(chunk).is_err() {
                        debug!("Transport closed, chunk forwarder stopping");
                        break;
                    }
                    sent.fetch_add(1, Ordering::Relaxed);
                }
            }));
        }
        self.transport = Some(session);
        self.transition(SessionState::Connected);
        Ok(())
    }

    /// Wait for the next inbound event. `None` when no transport is open.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        match self.transport.as_mut() {
            Some(transport) => Some(transport.next_event().await),
            None => None,
        }
    }

    /// React to one inbound event. Events outside Connected are ignored,
    /// as is any event arriving after an audio device has failed.
    pub fn handle_event(&mut self, event: TransportEvent) {
        if self.state != SessionState::Connected || self.check_devices() {
            debug!("Ignoring {:?} while {}", event, self.state);
            return;
        }

        match event {
            TransportEvent::Text(text) | TransportEvent::OutputTranscript(text) => {
                self.append(Role::Model, text)
            }
            TransportEvent::InputTranscript(text) => self.append(Role::User, text),
            TransportEvent::Audio(data) => self.play_fragment(&data),
            TransportEvent::Interrupted => {
                self.stats.interruptions += 1;
                if let Some(playback) = &self.playback {
                    playback.interrupt();
                }
            }
            TransportEvent::TurnComplete => {
                self.stats.turns_completed += 1;
                debug!("Turn {} complete", self.stats.turns_completed);
            }
            TransportEvent::Closed => {
                info!("Transport closed by remote");
                self.end(EndReason::RemoteClosed);
            }
            TransportEvent::Error(message) => {
                error!("Transport error: {}", message);
                let user_message = TransportError::Remote(message.clone()).user_message();
                self.end(EndReason::TransportFailed(message));
                self.user_error = Some(user_message);
            }
        }
    }

    /// Handle events until the session ends or `end_signal` resolves.
    pub async fn run<F>(&mut self, end_signal: F) -> EndReason
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(end_signal);

        while self.state == SessionState::Connected {
            let wake = {
                let Some(transport) = self.transport.as_mut() else {
                    break;
                };
                tokio::select! {
                    _ = &mut end_signal => Wake::EndSignal,
                    detail = device_fault(&mut self.capture_fault) => Wake::CaptureFault(detail),
                    detail = device_fault(&mut self.playback_fault) => Wake::PlaybackFault(detail),
                    event = transport.next_event() => Wake::Event(event),
                }
            };
            match wake {
                Wake::Event(event) => self.handle_event(event),
                Wake::CaptureFault(detail) => {
                    self.fail(EndReason::CaptureUnavailable, CaptureError::Device(detail).into());
                }
                Wake::PlaybackFault(detail) => {
                    self.fail(EndReason::PlaybackUnavailable, PlaybackError::Unavailable(detail).into());
                }
                Wake::EndSignal => {
                    info!("Game ended by player");
                    self.end(EndReason::UserEnded);
                }
            }
        }

        self.end_reason.clone().unwrap_or(EndReason::UserEnded)
    }

    /// Release every resource and move to Ended. Safe from any state and
    /// safe to call repeatedly; only the first reason is kept.
    pub fn end(&mut self, reason: EndReason) {
        if self.state == SessionState::Ended {
            return;
        }
        self.teardown();
        info!("Session ended: {:?}", reason);
        self.end_reason = Some(reason);
        self.transition(SessionState::Ended);
    }

    /// End the session if the microphone or speaker has failed. Returns
    /// true when it did.
    pub fn check_devices(&mut self) -> bool {
        if self.state != SessionState::Connected {
            return false;
        }
        if let Some(e) = self.capture.as_ref().and_then(CaptureHandle::fault) {
            self.fail(EndReason::CaptureUnavailable, e.into());
            return true;
        }
        if let Some(e) = self.playback.as_ref().and_then(PlaybackScheduler::fault) {
            self.fail(EndReason::PlaybackUnavailable, e.into());
            return true;
        }
        false
    }

    fn fail(&mut self, reason: EndReason, error: SessionError) -> SessionError {
        warn!("Session failed: {}", error);
        self.end(reason);
        self.user_error = Some(error.user_message());
        error
    }

    fn teardown(&mut self) {
        self.capture_fault = None;
        self.playback_fault = None;
        let capture = self.capture.take();
        let playback = self.playback.take();
        if capture.is_some() || playback.is_some() {
            join_audio_threads(move || {
                if let Some(mut capture) = capture {
                    capture.stop();
                }
                if let Some(mut playback) = playback {
                    playback.shutdown();
                }
            });
        }
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
    }

    fn play_fragment(&mut self, data: &str) {
        let buffer = pcm::from_transport_text(data)
            .map_err(|e| e.to_string())
            .and_then(|bytes| {
                audio_decode::decode(&bytes, OUTPUT_SAMPLE_RATE, OUTPUT_CHANNELS)
                    .map_err(|e| e.to_string())
            });
        let buffer = match buffer {
            Ok(buffer) => buffer,
            Err(e) => {
                warn!("Dropping audio fragment: {}", e);
                self.stats.fragments_dropped += 1;
                return;
            }
        };
        let scheduled = match &self.playback {
            Some(playback) => playback.enqueue(buffer),
            None => return,
        };
        match scheduled {
            Ok(_) => self.stats.fragments_played += 1,
            Err(e) => {
                self.fail(EndReason::PlaybackUnavailable, e.into());
            }
        }
    }

    fn append(&mut self, role: Role, text: String) {
        let entry = self.transcript.append(role, text);
        if let Some(sink) = self.transcript_sink.as_mut() {
            sink(entry);
        }
    }

    fn expect_state(&self, expected: SessionState, action: &'static str) -> Result<(), SessionError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(SessionError::InvalidTransition {
                from: self.state,
                action,
            })
        }
    }

    fn transition(&mut self, to: SessionState) {
        info!("Session {} -> {}", self.state, to);
        self.state = to;
    }
}

enum Wake {
    Event(TransportEvent),
    CaptureFault(String),
    PlaybackFault(String),
    EndSignal,
}

/// Resolves with the detail of the first fault a device thread publishes.
/// Stays pending if there is no device or its thread ends cleanly.
async fn device_fault(fault: &mut Option<watch::Receiver<Option<String>>>) -> String {
    let Some(rx) = fault.as_mut() else {
        return std::future::pending::<String>().await;
    };
    loop {
        let current = rx.borrow_and_update().as_ref().cloned();
        if let Some(detail) = current {
            return detail;
        }
        if rx.changed().await.is_err() {
            return std::future::pending::<String>().await;
        }
    }
}

/// Joining the audio threads blocks for up to one device read or write. On
/// a multi-threaded runtime the worker hands its other tasks off first.
fn join_audio_threads<F: FnOnce()>(join: F) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(join)
        }
        _ => join(),
    }
}

impl Drop for SessionOrchestrator {
    fn drop(&mut self) {
        self.teardown();
    }
}
