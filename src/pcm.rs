//! PCM codec for the wire
//!
//! Converts normalized float samples to 16-bit little-endian PCM and back,
//! plus the base64 text form the transport carries binary payloads in.

use base64::engine::general_purpose;
use base64::Engine;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed audio payload: {0}")]
    MalformedPayload(#[from] base64::DecodeError),

    #[error("16-bit PCM needs an even byte count, got {0}")]
    OddLength(usize),
}

/// Quantize one normalized sample to a signed 16-bit value.
///
/// Positive values scale by 0x7FFF and negative values by 0x8000 so the full
/// i16 range is used on both sides. The cast truncates toward zero.
#[inline]
pub fn quantize(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

/// Inverse of [`quantize`].
#[inline]
pub fn dequantize(value: i16) -> f32 {
    if value < 0 {
        value as f32 / 32768.0
    } else {
        value as f32 / 32767.0
    }
}

/// Encode float samples as 16-bit little-endian PCM.
pub fn encode(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        out.extend_from_slice(&quantize(s).to_le_bytes());
    }
    out
}

/// Decode 16-bit little-endian PCM into float samples.
pub fn decode(bytes: &[u8]) -> Result<Vec<f32>, CodecError> {
    if bytes.len() % 2 != 0 {
        return Err(CodecError::OddLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| dequantize(i16::from_le_bytes([pair[0], pair[1]])))
        .collect())
}

pub fn to_transport_text(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(bytes)
}

pub fn from_transport_text(text: &str) -> Result<Vec<u8>, CodecError> {
    Ok(general_purpose::STANDARD.decode(text)?)
}

/// One captured chunk, ready for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedAudioPayload {
    bytes: Vec<u8>,
    text: String,
}

impl EncodedAudioPayload {
    pub fn from_samples(samples: &[f32]) -> Self {
        let bytes = encode(samples);
        let text = to_transport_text(&bytes);
        Self { bytes, text }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Base64 form of [`bytes`](Self::bytes).
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn sample_count(&self) -> usize {
        self.bytes.len() / 2
    }

    pub fn into_text(self) -> String {
        self.text
    }
}
