//! QuizLive - spoken trivia with a live voice host
//!
//! Loads a question set, opens a Gemini Live session and plays the game
//! through the default PulseAudio devices until Ctrl-C.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context};
use quizlive::audio::PulseBackend;
use quizlive::config::AppConfig;
use quizlive::gemini_client::GeminiTransport;
use quizlive::quiz::{JsonFileQuestions, QuestionSource};
use quizlive::session::{SessionOrchestrator, SessionSettings};
use quizlive::spectrum::SpectrumTap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const METER_INTERVAL: Duration = Duration::from_millis(33);
const METER_WIDTH: usize = 24;
const METER_BANDS: usize = 8;
const BAND_GLYPHS: [char; 5] = [' ', '.', ':', '|', '#'];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    info!("Starting quizlive");

    let mut args = std::env::args().skip(1);
    let path = args
        .next()
        .context("usage: quizlive <questions.json> [topic]")?;
    let topic = args.next().unwrap_or_default();

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e.user_message());
            return Err(e.into());
        }
    };

    let quiz = match JsonFileQuestions::new(&path).generate(&topic).await {
        Ok(quiz) => quiz,
        Err(e) => {
            eprintln!("{}", e.user_message());
            return Err(e.into());
        }
    };

    let settings = SessionSettings {
        model: config.model.clone(),
        voice: config.voice.clone(),
        output_transcription: true,
        input_transcription: true,
    };
    let mut session = SessionOrchestrator::new(settings).with_transcript_sink(|entry| {
        println!("\r{:>5}: {}", entry.role, entry.text);
    });
    session.start_game(&quiz.topic)?;
    session.questions_ready(quiz)?;

    let backend = Arc::new(PulseBackend::new(
        "quizlive",
        config.input_device.clone(),
        config.output_device.clone(),
    ));
    let transport = GeminiTransport::from_api_key(&config.api_key, config.setup_timeout);

    if let Err(e) = session.connect(&transport, backend).await {
        eprintln!("{}", e.user_message());
        return Err(e.into());
    }
    println!(
        "Connected. Answer out loud; press Ctrl-C to end the game ({} questions).",
        session.questions().len()
    );

    let meter = match (session.capture_tap(), session.playback_tap()) {
        (Some(mic), Some(host)) => Some(tokio::spawn(run_meter(mic, host))),
        _ => None,
    };

    let reason = session
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await;

    if let Some(meter) = meter {
        meter.abort();
    }

    let stats = session.stats();
    println!();
    println!("Game over ({:?}).", reason);
    println!(
        "Chunks sent: {}, fragments played: {}, dropped: {}, interruptions: {}, turns: {}",
        stats.chunks_sent,
        stats.fragments_played,
        stats.fragments_dropped,
        stats.interruptions,
        stats.turns_completed
    );

    match session.user_error() {
        Some(message) => {
            eprintln!("{}", message);
            Err(anyhow!("session failed: {:?}", reason))
        }
        None => Ok(()),
    }
}

/// Redraw a one-line level meter from both taps, independent of the audio
/// threads' frame rates.
async fn run_meter(mic: SpectrumTap, host: SpectrumTap) {
    let mut ticker = tokio::time::interval(METER_INTERVAL);
    let mut last = (u64::MAX, u64::MAX);
    loop {
        ticker.tick().await;
        let seen = (mic.sequence(), host.sequence());
        if seen == last {
            continue;
        }
        last = seen;

        let (heard, spoken) = (mic.snapshot(), host.snapshot());
        let line = format!(
            "\rmic [{}] {}  host [{}] {}",
            bar(heard.level),
            bands(&heard.bands(METER_BANDS)),
            bar(spoken.level),
            bands(&spoken.bands(METER_BANDS))
        );
        let mut out = std::io::stderr();
        let _ = out.write_all(line.as_bytes());
        let _ = out.flush();
    }
}

fn bar(level: f32) -> String {
    // Speech RMS rarely exceeds 0.3; scale so it fills the bar.
    let filled = ((level * 3.0).clamp(0.0, 1.0) * METER_WIDTH as f32).round() as usize;
    format!("{}{}", "#".repeat(filled), " ".repeat(METER_WIDTH - filled))
}

/// Low bins first; speech energy sits in the first few bands.
fn bands(values: &[f32]) -> String {
    values
        .iter()
        .map(|v| {
            let step = (v.clamp(0.0, 1.0) * (BAND_GLYPHS.len() - 1) as f32).round() as usize;
            BAND_GLYPHS[step]
        })
        .collect()
}
