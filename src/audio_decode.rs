//! Raw PCM to playable buffer
//!
//! Inbound speech is headerless 16-bit little-endian PCM, so it is unpacked
//! directly rather than handed to a container demuxer.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("payload of {len} bytes is not a whole number of {channels}-channel 16-bit frames")]
    Misaligned { len: usize, channels: u16 },

    #[error("invalid target format: {sample_rate} Hz, {channels} channels")]
    InvalidFormat { sample_rate: u32, channels: u16 },
}

/// Decoded, planar float audio at a fixed rate.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackBuffer {
    sample_rate: u32,
    channels: Vec<Vec<f32>>,
}

impl PlaybackBuffer {
    /// Build a buffer from planar channel data. All channels must have the
    /// same length.
    pub fn from_planar(sample_rate: u32, channels: Vec<Vec<f32>>) -> Result<Self, DecodeError> {
        let count = channels.len() as u16;
        if sample_rate == 0 || channels.is_empty() {
            return Err(DecodeError::InvalidFormat {
                sample_rate,
                channels: count,
            });
        }
        let frames = channels[0].len();
        if channels.iter().any(|c| c.len() != frames) {
            return Err(DecodeError::Misaligned {
                len: channels.iter().map(|c| c.len() * 2).sum(),
                channels: count,
            });
        }
        Ok(Self {
            sample_rate,
            channels,
        })
    }

    /// A mono buffer of silence lasting `seconds`.
    pub fn silence(sample_rate: u32, seconds: f64) -> Self {
        let frames = (seconds * sample_rate as f64).round() as usize;
        Self {
            sample_rate,
            channels: vec![vec![0.0; frames]],
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> u16 {
        self.channels.len() as u16
    }

    /// Number of sample frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    /// Duration in seconds.
    pub fn duration(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    pub fn channel(&self, index: usize) -> &[f32] {
        &self.channels[index]
    }
}

/// Unpack interleaved 16-bit little-endian PCM into a [`PlaybackBuffer`].
///
/// Each sample is divided by 0x8000. Fails without producing a partial buffer
/// when the byte count is not a multiple of `2 * channels`.
pub fn decode(bytes: &[u8], sample_rate: u32, channels: u16) -> Result<PlaybackBuffer, DecodeError> {
    if sample_rate == 0 || channels == 0 {
        return Err(DecodeError::InvalidFormat {
            sample_rate,
            channels,
        });
    }

    let frame_bytes = 2 * channels as usize;
    if bytes.len() % frame_bytes != 0 {
        return Err(DecodeError::Misaligned {
            len: bytes.len(),
            channels,
        });
    }

    let frames = bytes.len() / frame_bytes;
    let mut planar = vec![Vec::with_capacity(frames); channels as usize];
    for frame in bytes.chunks_exact(frame_bytes) {
        for (ch, sample) in frame.chunks_exact(2).enumerate() {
            let value = i16::from_le_bytes([sample[0], sample[1]]);
            planar[ch].push(value as f32 / 32768.0);
        }
    }

    Ok(PlaybackBuffer {
        sample_rate,
        channels: planar,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pcm;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_decode_mono() {
        let bytes = pcm::encode(&[0.0, 0.5, -0.5, -1.0]);
        let buffer = decode(&bytes, 24_000, 1).unwrap();
        assert_eq!(buffer.channel_count(), 1);
        assert_eq!(buffer.frames(), 4);
        assert_eq!(buffer.sample_rate(), 24_000);
        let samples = buffer.channel(0);
        assert_abs_diff_eq!(samples[0], 0.0);
        assert_abs_diff_eq!(samples[1], 0.5, epsilon = 2.0 / 32768.0);
        assert_abs_diff_eq!(samples[2], -0.5, epsilon = 2.0 / 32768.0);
        assert_abs_diff_eq!(samples[3], -1.0);
    }

    #[test]
    fn test_decode_interleaved_stereo() {
        // L, R, L, R
        let bytes = pcm::encode(&[0.25, -0.25, 0.75, -0.75]);
        let buffer = decode(&bytes, 24_000, 2).unwrap();
        assert_eq!(buffer.frames(), 2);
        assert_abs_diff_eq!(buffer.channel(0)[1], 0.75, epsilon = 2.0 / 32768.0);
        assert_abs_diff_eq!(buffer.channel(1)[0], -0.25, epsilon = 2.0 / 32768.0);
    }

    #[test]
    fn test_misaligned_lengths_rejected() {
        assert_eq!(
            decode(&[0u8; 3], 24_000, 1),
            Err(DecodeError::Misaligned { len: 3, channels: 1 })
        );
        for len in [1usize, 2, 3, 5, 6, 7] {
            assert!(
                matches!(decode(&vec![0u8; len], 24_000, 2), Err(DecodeError::Misaligned { .. })),
                "length {} should not decode as stereo",
                len
            );
        }
    }

    #[test]
    fn test_duration() {
        let buffer = decode(&vec![0u8; 48_000], 24_000, 1).unwrap();
        assert_eq!(buffer.frames(), 24_000);
        assert_abs_diff_eq!(buffer.duration(), 1.0);

        let empty = decode(&[], 24_000, 1).unwrap();
        assert_eq!(empty.frames(), 0);
        assert_abs_diff_eq!(empty.duration(), 0.0);
    }

    #[test]
    fn test_invalid_format() {
        assert!(matches!(
            decode(&[0, 0], 0, 1),
            Err(DecodeError::InvalidFormat { .. })
        ));
        assert!(matches!(
            decode(&[0, 0], 24_000, 0),
            Err(DecodeError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn test_silent_chunk_decodes_to_zeros() {
        let bytes = pcm::encode(&vec![0.0; 4096]);
        let buffer = decode(&bytes, 16_000, 1).unwrap();
        assert_eq!(buffer.frames(), 4096);
        assert!(buffer.channel(0).iter().all(|&s| s == 0.0));
    }
}
