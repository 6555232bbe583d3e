//! Runtime configuration and fixed audio constants
//!
//! Settings are taken from the environment, the same way the API key always
//! has been. Audio rates are fixed by the live endpoint and are not
//! configurable.

use std::time::Duration;

/// Capture rate expected by the live endpoint.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;
/// Samples per capture frame; one frame becomes one outbound chunk.
pub const CAPTURE_FRAME_SAMPLES: usize = 4096;
/// Rate of the synthesized speech returned by the endpoint.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;
/// Channel count of the synthesized speech and of the playback device.
pub const OUTPUT_CHANNELS: u16 = 1;
/// Frames mixed per render pass (20 ms at 24 kHz).
pub const RENDER_BLOCK_FRAMES: usize = 480;
/// Render blocks the playback device may hold ahead of the listener. The
/// output clock leads what is heard by at most this much (80 ms).
pub const PLAYBACK_BUFFER_BLOCKS: usize = 4;
/// FFT size of the visualization analysers.
pub const ANALYSER_FFT_SIZE: usize = 256;

pub const DEFAULT_MODEL: &str = "models/gemini-2.0-flash-live-001";
pub const DEFAULT_VOICE: &str = "Puck";
pub const DEFAULT_SETUP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("GEMINI_API_KEY is not set")]
    MissingApiKey,

    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

impl ConfigError {
    pub fn user_message(&self) -> String {
        match self {
            ConfigError::MissingApiKey => "Set GEMINI_API_KEY to play.".to_string(),
            ConfigError::Invalid { name, .. } => format!("{} has an invalid value.", name),
        }
    }
}

/// Application settings for one run of the client.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api_key: String,
    pub model: String,
    pub voice: String,
    /// PulseAudio source name; `None` uses the default input.
    pub input_device: Option<String>,
    /// PulseAudio sink name; `None` uses the default output.
    pub output_device: Option<String>,
    pub setup_timeout: Duration,
}

impl AppConfig {
    /// Load settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load settings through an arbitrary lookup (used by tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key = lookup("GEMINI_API_KEY")
            .filter(|k| !k.trim().is_empty())
            .ok_or(ConfigError::MissingApiKey)?;

        let setup_timeout = match lookup("QUIZLIVE_SETUP_TIMEOUT_SECS") {
            Some(raw) => {
                let secs: u64 = raw.trim().parse().map_err(|_| ConfigError::Invalid {
                    name: "QUIZLIVE_SETUP_TIMEOUT_SECS",
                    value: raw.clone(),
                })?;
                if secs == 0 {
                    return Err(ConfigError::Invalid {
                        name: "QUIZLIVE_SETUP_TIMEOUT_SECS",
                        value: raw,
                    });
                }
                Duration::from_secs(secs)
            }
            None => DEFAULT_SETUP_TIMEOUT,
        };

        Ok(Self {
            api_key,
            model: lookup("QUIZLIVE_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            voice: lookup("QUIZLIVE_VOICE").unwrap_or_else(|| DEFAULT_VOICE.to_string()),
            input_device: lookup("QUIZLIVE_INPUT_DEVICE").filter(|d| !d.is_empty()),
            output_device: lookup("QUIZLIVE_OUTPUT_DEVICE").filter(|d| !d.is_empty()),
            setup_timeout,
        })
    }
}
