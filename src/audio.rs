//! Audio hardware module
//!
//! PulseAudio input and output for a live session. Capture is a record
//! stream of F32LE mono at 16 kHz; playback is a playback stream of F32LE at
//! 24 kHz. Both are opened per session and released when dropped.

use crate::config::{
    CAPTURE_FRAME_SAMPLES, INPUT_SAMPLE_RATE, OUTPUT_CHANNELS, OUTPUT_SAMPLE_RATE,
    PLAYBACK_BUFFER_BLOCKS, RENDER_BLOCK_FRAMES,
};
use crate::playback::{PlaybackError, PlaybackScheduler};
use libpulse_binding::callbacks::ListResult;
use libpulse_binding::context::{Context, FlagSet as ContextFlagSet, State as ContextState};
use libpulse_binding::def::{BufferAttr, Retval};
use libpulse_binding::mainloop::standard::{IterateResult, Mainloop};
use libpulse_binding::proplist::Proplist;
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Represents an audio device
#[derive(Debug, Clone)]
pub struct AudioDevice {
    /// Device name (PulseAudio source or sink name)
    pub name: String,
    /// Human-readable description
    pub description: String,
    pub sample_rate: u32,
    pub channels: u8,
    pub kind: DeviceKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Microphone,
    /// Monitor of a playback sink
    Monitor,
    Output,
}

/// Device filter for [`list_devices`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Input,
    Output,
    Any,
}

#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("no audio devices found")]
    NoDevicesFound,

    #[error("PulseAudio context error: {0}")]
    PulseContext(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("stream error: {0}")]
    Stream(String),

    /// The source has no more audio to give; not a failure.
    #[error("end of audio stream")]
    EndOfStream,
}

/// A blocking source of normalized mono samples at 16 kHz.
pub trait MicSource {
    /// Fill `frame` completely, blocking until enough audio is available.
    fn read_frame(&mut self, frame: &mut [f32]) -> Result<(), AudioError>;
}

/// A blocking sink for interleaved float samples at the output rate.
pub trait SpeakerSink {
    /// Queue a block for playback; blocks when the device buffer is full.
    fn write_block(&mut self, samples: &[f32]) -> Result<(), AudioError>;

    /// Discard anything queued but not yet heard.
    fn flush(&mut self) -> Result<(), AudioError>;
}

/// Opens the per-session audio resources.
///
/// `open_input` is called on the capture thread, so implementations hand
/// back sources that never cross threads.
pub trait AudioBackend: Send + Sync + 'static {
    fn open_input(&self) -> Result<Box<dyn MicSource>, AudioError>;

    fn open_playback(&self) -> Result<PlaybackScheduler, PlaybackError>;
}

/// Microphone capture through the PulseAudio simple API.
pub struct PulseMic {
    simple: Simple,
    bytes: Vec<u8>,
}

impl PulseMic {
    pub fn open(app_name: &str, device_name: Option<&str>) -> Result<Self, AudioError> {
        let spec = Spec {
            format: Format::F32le,
            channels: 1,
            rate: INPUT_SAMPLE_RATE,
        };
        // One fragment per capture frame keeps reads aligned with frames.
        let attr = BufferAttr {
            maxlength: u32::MAX,
            tlength: u32::MAX,
            prebuf: u32::MAX,
            minreq: u32::MAX,
            fragsize: (CAPTURE_FRAME_SAMPLES * 4) as u32,
        };
        let simple = Simple::new(
            None,
            app_name,
            Direction::Record,
            device_name,
            "microphone",
            &spec,
            None,
            Some(&attr),
        )
        .map_err(|e| AudioError::Connection(format!("{}", e)))?;

        info!("Microphone opened: {}", device_name.unwrap_or("default"));
        Ok(Self {
            simple,
            bytes: Vec::with_capacity(CAPTURE_FRAME_SAMPLES * 4),
        })
    }
}

impl MicSource for PulseMic {
    fn read_frame(&mut self, frame: &mut [f32]) -> Result<(), AudioError> {
        self.bytes.resize(frame.len() * 4, 0);
        self.simple
            .read(&mut self.bytes)
            .map_err(|e| AudioError::Stream(format!("{}", e)))?;
        for (sample, raw) in frame.iter_mut().zip(self.bytes.chunks_exact(4)) {
            *sample = f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        }
        Ok(())
    }
}

/// Speech output through the PulseAudio simple API.
pub struct PulseSpeaker {
    simple: Simple,
    bytes: Vec<u8>,
}

impl PulseSpeaker {
    pub fn open(
        app_name: &str,
        device_name: Option<&str>,
        rate: u32,
        channels: u16,
    ) -> Result<Self, AudioError> {
        let spec = Spec {
            format: Format::F32le,
            channels: channels as u8,
            rate,
        };
        let attr = playback_buffer_attr(channels);
        let simple = Simple::new(
            None,
            app_name,
            Direction::Playback,
            device_name,
            "speech",
            &spec,
            None,
            Some(&attr),
        )
        .map_err(|e| AudioError::Connection(format!("{}", e)))?;

        info!(
            "Speaker opened: {} ({} Hz, {} ch)",
            device_name.unwrap_or("default"),
            rate,
            channels
        );
        Ok(Self {
            simple,
            bytes: Vec::new(),
        })
    }
}

/// Server-side queue of a few render blocks. Writes block once it is full,
/// so the frame clock leads what is heard by at most this queue.
fn playback_buffer_attr(channels: u16) -> BufferAttr {
    let block_bytes = (RENDER_BLOCK_FRAMES * channels as usize * std::mem::size_of::<f32>()) as u32;
    let target = block_bytes * PLAYBACK_BUFFER_BLOCKS as u32;
    BufferAttr {
        maxlength: target * 2,
        tlength: target,
        prebuf: target,
        minreq: block_bytes,
        fragsize: u32::MAX,
    }
}

impl SpeakerSink for PulseSpeaker {
    fn write_block(&mut self, samples: &[f32]) -> Result<(), AudioError> {
        self.bytes.clear();
        for s in samples {
            self.bytes.extend_from_slice(&s.to_le_bytes());
        }
        self.simple
            .write(&self.bytes)
            .map_err(|e| AudioError::Stream(format!("{}", e)))
    }

    fn flush(&mut self) -> Result<(), AudioError> {
        self.simple
            .flush()
            .map_err(|e| AudioError::Stream(format!("{}", e)))
    }
}

/// PulseAudio-backed session audio.
#[derive(Debug, Clone)]
pub struct PulseBackend {
    app_name: String,
    input_device: Option<String>,
    output_device: Option<String>,
}

impl PulseBackend {
    pub fn new(app_name: &str, input_device: Option<String>, output_device: Option<String>) -> Self {
        Self {
            app_name: app_name.to_string(),
            input_device,
            output_device,
        }
    }
}

impl AudioBackend for PulseBackend {
    fn open_input(&self) -> Result<Box<dyn MicSource>, AudioError> {
        let mic = PulseMic::open(&self.app_name, self.input_device.as_deref())?;
        Ok(Box::new(mic))
    }

    fn open_playback(&self) -> Result<PlaybackScheduler, PlaybackError> {
        let app_name = self.app_name.clone();
        let device = self.output_device.clone();
        PlaybackScheduler::spawn(move || {
            let speaker = PulseSpeaker::open(
                &app_name,
                device.as_deref(),
                OUTPUT_SAMPLE_RATE,
                OUTPUT_CHANNELS,
            )?;
            Ok(Box::new(speaker) as Box<dyn SpeakerSink>)
        })
    }
}

/// List PulseAudio sources and/or sinks.
pub fn list_devices(device_type: DeviceType) -> Result<Vec<AudioDevice>, AudioError> {
    let devices = Arc::new(Mutex::new(Vec::new()));
    // One slot per list operation; each flips to true at ListResult::End.
    let done = Arc::new(Mutex::new([false, false]));

    let mut proplist = Proplist::new()
        .ok_or_else(|| AudioError::PulseContext("Failed to create proplist".to_string()))?;
    proplist
        .set_str(
            libpulse_binding::proplist::properties::APPLICATION_NAME,
            "quizlive-device-lister",
        )
        .map_err(|_| AudioError::PulseContext("Failed to set proplist".to_string()))?;

    let mut mainloop = Mainloop::new()
        .ok_or_else(|| AudioError::PulseContext("Failed to create mainloop".to_string()))?;

    let mut context = Context::new_with_proplist(&mainloop, "quizlive-context", &proplist)
        .ok_or_else(|| AudioError::PulseContext("Failed to create context".to_string()))?;

    context
        .connect(None, ContextFlagSet::NOFLAGS, None)
        .map_err(|e| AudioError::Connection(format!("{}", e)))?;

    loop {
        match mainloop.iterate(true) {
            IterateResult::Quit(_) | IterateResult::Err(_) => {
                return Err(AudioError::PulseContext("Mainloop iterate failed".to_string()));
            }
            IterateResult::Success(_) => {}
        }
        match context.get_state() {
            ContextState::Ready => break,
            ContextState::Failed | ContextState::Terminated => {
                return Err(AudioError::Connection("Connection failed".to_string()));
            }
            _ => {}
        }
    }

    let introspector = context.introspect();

    let want_inputs = matches!(device_type, DeviceType::Input | DeviceType::Any);
    let want_outputs = matches!(device_type, DeviceType::Output | DeviceType::Any);
    {
        let mut flags = done.lock();
        flags[0] = !want_inputs;
        flags[1] = !want_outputs;
    }

    let _source_op = want_inputs.then(|| {
        let devices = devices.clone();
        let done = done.clone();
        introspector.get_source_info_list(move |result| match result {
            ListResult::Item(info) => {
                let is_monitor = info.monitor_of_sink.is_some()
                    || info
                        .name
                        .as_ref()
                        .map(|name| name.contains("monitor"))
                        .unwrap_or(false);
                if let (Some(name), Some(description)) = (info.name.as_ref(), info.description.as_ref()) {
                    devices.lock().push(AudioDevice {
                        name: name.to_string(),
                        description: description.to_string(),
                        sample_rate: info.sample_spec.rate,
                        channels: info.sample_spec.channels,
                        kind: if is_monitor {
                            DeviceKind::Monitor
                        } else {
                            DeviceKind::Microphone
                        },
                    });
                }
            }
            ListResult::End => done.lock()[0] = true,
            ListResult::Error => {
                error!("Error listing audio sources");
                done.lock()[0] = true;
            }
        })
    });

    let _sink_op = want_outputs.then(|| {
        let devices = devices.clone();
        let done = done.clone();
        introspector.get_sink_info_list(move |result| match result {
            ListResult::Item(info) => {
                if let (Some(name), Some(description)) = (info.name.as_ref(), info.description.as_ref()) {
                    devices.lock().push(AudioDevice {
                        name: name.to_string(),
                        description: description.to_string(),
                        sample_rate: info.sample_spec.rate,
                        channels: info.sample_spec.channels,
                        kind: DeviceKind::Output,
                    });
                }
            }
            ListResult::End => done.lock()[1] = true,
            ListResult::Error => {
                error!("Error listing audio sinks");
                done.lock()[1] = true;
            }
        })
    });

    loop {
        if done.lock().iter().all(|d| *d) {
            break;
        }
        match mainloop.iterate(true) {
            IterateResult::Quit(_) | IterateResult::Err(_) => {
                return Err(AudioError::PulseContext("Mainloop iterate failed".to_string()));
            }
            IterateResult::Success(_) => {}
        }
    }

    context.disconnect();
    mainloop.quit(Retval(0));

    let found = devices.lock().clone();
    debug!("Found {} audio devices", found.len());
    Ok(found)
}
