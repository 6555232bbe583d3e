//! End-to-end game flow against an in-memory endpoint, microphone and
//! output clock.

use quizlive::audio::{AudioBackend, AudioError, MicSource};
use quizlive::events::{Outbound, TransportEvent};
use quizlive::pcm;
use quizlive::playback::{ManualClock, PlaybackError, PlaybackScheduler};
use quizlive::quiz::{Question, QuizSet};
use quizlive::session::{EndReason, Role, SessionOrchestrator, SessionSettings, SessionState, TranscriptEntry};
use quizlive::transport::MemoryTransport;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Produces quiet constant frames, a little faster than real time.
struct FakeMic {
    opened: Arc<AtomicUsize>,
}

impl MicSource for FakeMic {
    fn read_frame(&mut self, frame: &mut [f32]) -> Result<(), AudioError> {
        std::thread::sleep(Duration::from_millis(5));
        frame.iter_mut().for_each(|s| *s = 0.01);
        Ok(())
    }
}

impl Drop for FakeMic {
    fn drop(&mut self) {
        self.opened.fetch_sub(1, Ordering::SeqCst);
    }
}

struct FakeBackend {
    clock: Arc<ManualClock>,
    mics_open: Arc<AtomicUsize>,
}

impl AudioBackend for FakeBackend {
    fn open_input(&self) -> Result<Box<dyn MicSource>, AudioError> {
        self.mics_open.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeMic {
            opened: self.mics_open.clone(),
        }))
    }

    fn open_playback(&self) -> Result<PlaybackScheduler, PlaybackError> {
        Ok(PlaybackScheduler::headless(self.clock.clone()))
    }
}

fn settings() -> SessionSettings {
    SessionSettings {
        model: "models/gemini-2.0-flash-live-001".to_string(),
        voice: "Puck".to_string(),
        output_transcription: false,
        input_transcription: false,
    }
}

fn one_question() -> QuizSet {
    QuizSet {
        topic: String::new(),
        questions: vec![Question {
            question: "Q".to_string(),
            answer: "A".to_string(),
            context: "C".to_string(),
        }],
        sources: Vec::new(),
    }
}

async fn step(session: &mut SessionOrchestrator) {
    let event = tokio::time::timeout(Duration::from_secs(1), session.next_event())
        .await
        .expect("event should arrive")
        .expect("transport should be open");
    session.handle_event(event);
}

#[tokio::test]
async fn test_full_game_flow() {
    let clock = Arc::new(ManualClock::new());
    let mics_open = Arc::new(AtomicUsize::new(0));
    let backend = Arc::new(FakeBackend {
        clock: clock.clone(),
        mics_open: mics_open.clone(),
    });
    let (transport, mut remote) = MemoryTransport::pair();

    let mut session = SessionOrchestrator::new(settings());
    assert_eq!(session.state(), SessionState::Idle);

    session.start_game("general knowledge").unwrap();
    assert_eq!(session.state(), SessionState::Preparing);
    session.questions_ready(one_question()).unwrap();

    session.connect(&transport, backend).await.unwrap();
    assert_eq!(session.state(), SessionState::Connected);
    assert_eq!(mics_open.load(Ordering::SeqCst), 1);

    let config = remote.opened_with().unwrap();
    assert!(config.system_instruction.contains("Question 1: Q"));
    assert!(config.system_instruction.contains("Answer: A"));

    // Captured audio reaches the endpoint as 16-bit chunks
    match tokio::time::timeout(Duration::from_secs(1), remote.recv()).await {
        Ok(Some(Outbound::Audio(chunk))) => assert_eq!(chunk.bytes().len(), 8192),
        other => panic!("expected an audio chunk, got {:?}", other),
    }

    remote.push(TransportEvent::Text("Hello!".to_string()));
    step(&mut session).await;
    assert_eq!(
        session.transcript().entries(),
        &[TranscriptEntry {
            role: Role::Model,
            text: "Hello!".to_string(),
        }]
    );

    // 0.25 s of speech at 24 kHz
    remote.push(TransportEvent::Audio(pcm::to_transport_text(&vec![0u8; 12_000])));
    step(&mut session).await;
    assert_eq!(session.playback().unwrap().active_sources(), 1);

    remote.push(TransportEvent::Interrupted);
    step(&mut session).await;
    assert_eq!(session.playback().unwrap().active_sources(), 0);
    assert_eq!(session.playback().unwrap().next_start_time(), 0.0);

    // The next reply starts at the current clock, not at a stale time
    clock.set(3.0);
    remote.push(TransportEvent::Audio(pcm::to_transport_text(&vec![0u8; 12_000])));
    step(&mut session).await;
    assert!((session.playback().unwrap().next_start_time() - 3.25).abs() < 1e-9);

    remote.push(TransportEvent::Closed);
    step(&mut session).await;

    assert_eq!(session.state(), SessionState::Ended);
    assert_eq!(session.end_reason(), Some(&EndReason::RemoteClosed));
    assert!(session.resources_released());
    assert!(session.user_error().is_none());
    assert_eq!(mics_open.load(Ordering::SeqCst), 0);

    let stats = session.stats();
    assert_eq!(stats.fragments_played, 2);
    assert_eq!(stats.interruptions, 1);
    assert!(stats.chunks_sent >= 1);

    // Ending again is harmless
    session.end(EndReason::UserEnded);
    assert_eq!(session.end_reason(), Some(&EndReason::RemoteClosed));
}

#[tokio::test]
async fn test_player_ends_game() {
    let backend = Arc::new(FakeBackend {
        clock: Arc::new(ManualClock::new()),
        mics_open: Arc::new(AtomicUsize::new(0)),
    });
    let (transport, mut remote) = MemoryTransport::pair();

    let mut session = SessionOrchestrator::new(settings());
    session.start_game("").unwrap();
    session.questions_ready(one_question()).unwrap();
    session.connect(&transport, backend.clone()).await.unwrap();

    let (end_tx, end_rx) = tokio::sync::oneshot::channel::<()>();
    remote.push(TransportEvent::Text("First question: Q".to_string()));
    remote.push(TransportEvent::TurnComplete);

    let run = async {
        session
            .run(async {
                let _ = end_rx.await;
            })
            .await
    };
    let end = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = end_tx.send(());
    };
    let (reason, ()) = tokio::join!(run, end);

    assert_eq!(reason, EndReason::UserEnded);
    assert_eq!(session.state(), SessionState::Ended);
    assert_eq!(session.stats().turns_completed, 1);
    assert!(session.resources_released());
    assert_eq!(backend.mics_open.load(Ordering::SeqCst), 0);

    let mut last = None;
    while let Some(message) = remote.try_recv() {
        last = Some(message);
    }
    assert!(matches!(last, Some(Outbound::Close)));
}
