//! Microphone capture pipeline
//!
//! A dedicated OS thread reads fixed frames from the microphone, feeds the
//! input analyser, and hands each frame to the async side as an encoded
//! chunk. The device is opened on that thread and released when it exits.
//! A device failure is published through [`CaptureHandle::watch_fault`]
//! before the chunk stream closes.

use crate::audio::{AudioBackend, AudioError};
use crate::config::{ANALYSER_FFT_SIZE, CAPTURE_FRAME_SAMPLES};
use crate::pcm::EncodedAudioPayload;
use crate::spectrum::{SpectrumAnalyzer, SpectrumTap};
use crate::tdbg;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// Permission denied, no device, or the audio server is not running.
    #[error("microphone unavailable: {0}")]
    Unavailable(String),

    #[error("microphone failed: {0}")]
    Device(String),
}

impl CaptureError {
    pub fn user_message(&self) -> String {
        match self {
            CaptureError::Unavailable(_) => {
                "Microphone access is needed to play. Check that a microphone is connected and allowed."
                    .to_string()
            }
            CaptureError::Device(_) => "The microphone stopped working.".to_string(),
        }
    }
}

/// A running capture session.
pub struct CaptureHandle {
    chunks: Option<mpsc::UnboundedReceiver<EncodedAudioPayload>>,
    tap: SpectrumTap,
    fault: watch::Receiver<Option<String>>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    /// Open the input device and start producing chunks.
    ///
    /// Returns once the device is open, or with `Unavailable` if it could not
    /// be opened. Nothing is produced in the failure case.
    pub fn start(backend: Arc<dyn AudioBackend>) -> Result<Self, CaptureError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), AudioError>>();
        let shutdown = Arc::new(AtomicBool::new(false));
        let analyzer = SpectrumAnalyzer::new(ANALYSER_FFT_SIZE);
        let tap = analyzer.tap();
        let (fault_tx, fault) = watch::channel(None);

        let thread_shutdown = shutdown.clone();
        let handle = std::thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || {
                let mic = match backend.open_input() {
                    Ok(mic) => {
                        let _ = ready_tx.send(Ok(()));
                        mic
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = run_capture(mic, &tx, analyzer, &thread_shutdown) {
                    error!("Capture error: {}", e);
                    fault_tx.send_replace(Some(e.to_string()));
                }
                // The chunk stream closes here, after any fault is visible.
                drop(tx);
            })
            .map_err(|e| CaptureError::Unavailable(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(CaptureError::Unavailable(e.to_string()));
            }
            Err(_) => {
                let _ = handle.join();
                return Err(CaptureError::Unavailable(
                    "capture thread exited before opening the device".to_string(),
                ));
            }
        }

        info!("Capture started ({} samples per frame)", CAPTURE_FRAME_SAMPLES);
        Ok(Self {
            chunks: Some(rx),
            tap,
            fault,
            shutdown,
            handle: Some(handle),
        })
    }

    /// Take the chunk stream. Only the first call returns it.
    pub fn take_chunks(&mut self) -> Option<mpsc::UnboundedReceiver<EncodedAudioPayload>> {
        self.chunks.take()
    }

    pub fn tap(&self) -> SpectrumTap {
        self.tap.clone()
    }

    /// The device failure that ended capture, if any.
    pub fn fault(&self) -> Option<CaptureError> {
        self.fault
            .borrow()
            .as_ref()
            .map(|detail| CaptureError::Device(detail.clone()))
    }

    /// Changes once, to `Some(detail)`, if the microphone fails mid-session.
    pub fn watch_fault(&self) -> watch::Receiver<Option<String>> {
        self.fault.clone()
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop capturing and release the device. Safe to call repeatedly.
    ///
    /// No chunk is produced after this returns.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Capture thread panicked");
            }
            info!("Capture stopped");
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_capture(
    mut mic: Box<dyn crate::audio::MicSource>,
    tx: &mpsc::UnboundedSender<EncodedAudioPayload>,
    mut analyzer: SpectrumAnalyzer,
    shutdown: &AtomicBool,
) -> Result<(), AudioError> {
    let mut frame = vec![0.0f32; CAPTURE_FRAME_SAMPLES];
    let mut produced = 0u64;

    while !shutdown.load(Ordering::Acquire) {
        match mic.read_frame(&mut frame) {
            Ok(()) => {}
            Err(AudioError::EndOfStream) => {
                tdbg!("mic reached end of stream after {} frames", produced);
                break;
            }
            Err(e) => return Err(e),
        }
        // A read can straddle stop(); drop the frame it returned.
        if shutdown.load(Ordering::Acquire) {
            break;
        }

        analyzer.analyze(&frame);

        if tx.send(EncodedAudioPayload::from_samples(&frame)).is_err() {
            warn!("Chunk receiver dropped, ending capture");
            break;
        }
        produced += 1;
        if produced % 50 == 0 {
            tdbg!("captured {} frames", produced);
        }
    }
    // The device closes here as `mic` drops.
    Ok(())
}
