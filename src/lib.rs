//! QuizLive - voice trivia host over the Gemini Live API
//!
//! Streams microphone audio to a live conversational endpoint and plays the
//! synthesized replies back without gaps, with barge-in handling and
//! spectrum taps for a level meter.

#![forbid(unsafe_code)]

pub mod util;
pub mod audio;
pub mod audio_decode;
pub mod capture;
pub mod config;
pub mod events;
pub mod gemini;
pub mod gemini_client;
pub mod pcm;
pub mod playback;
pub mod quiz;
pub mod session;
pub mod spectrum;
pub mod transport;
