//! Visualization taps
//!
//! An analyser owned by an audio thread publishes the magnitude spectrum of
//! the most recent frame; any number of [`SpectrumTap`] clones read copies of
//! it. Readers never see the analyser and cannot mutate audio state.

use parking_lot::RwLock;
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::sync::Arc;

/// One published analysis result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpectrumFrame {
    /// Magnitudes of the first `fft_size / 2` bins, scaled to [0, 1].
    pub bins: Vec<f32>,
    /// RMS level of the analysed samples.
    pub level: f32,
    /// Incremented on every publish; lets a render loop skip stale frames.
    pub sequence: u64,
}

impl SpectrumFrame {
    /// Collapse the bins into `count` equal-width bands, each the loudest
    /// bin it covers. Empty when there are no bins yet.
    pub fn bands(&self, count: usize) -> Vec<f32> {
        if self.bins.is_empty() || count == 0 {
            return Vec::new();
        }
        let width = self.bins.len().div_ceil(count);
        self.bins
            .chunks(width)
            .map(|band| band.iter().copied().fold(0.0, f32::max))
            .collect()
    }
}

/// Read-only handle on an analyser's latest output.
#[derive(Debug, Clone, Default)]
pub struct SpectrumTap {
    inner: Arc<RwLock<SpectrumFrame>>,
}

impl SpectrumTap {
    pub fn snapshot(&self) -> SpectrumFrame {
        self.inner.read().clone()
    }

    pub fn level(&self) -> f32 {
        self.inner.read().level
    }

    pub fn sequence(&self) -> u64 {
        self.inner.read().sequence
    }

    fn publish(&self, bins: &[f32], level: f32) {
        let mut frame = self.inner.write();
        frame.bins.clear();
        frame.bins.extend_from_slice(bins);
        frame.level = level;
        frame.sequence += 1;
    }
}

/// Windowed FFT analyser feeding a [`SpectrumTap`].
pub struct SpectrumAnalyzer {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    window_gain: f32,
    scratch: Vec<Complex<f32>>,
    bins: Vec<f32>,
    tap: SpectrumTap,
}

impl SpectrumAnalyzer {
    pub fn new(fft_size: usize) -> Self {
        let fft_size = fft_size.max(2);
        let window = build_hann_window(fft_size);
        let window_gain = window.iter().sum::<f32>().max(f32::EPSILON);
        Self {
            fft: FftPlanner::<f32>::new().plan_fft_forward(fft_size),
            window,
            window_gain,
            scratch: vec![Complex::new(0.0, 0.0); fft_size],
            bins: vec![0.0; fft_size / 2],
            tap: SpectrumTap::default(),
        }
    }

    pub fn tap(&self) -> SpectrumTap {
        self.tap.clone()
    }

    /// Analyse the tail of `samples` and publish the result.
    ///
    /// Only the last `fft_size` samples are transformed; shorter input is
    /// zero-padded at the front. Runs in O(fft_size log fft_size) plus one
    /// pass over `samples` for the level.
    pub fn analyze(&mut self, samples: &[f32]) {
        let n = self.window.len();
        let tail = &samples[samples.len().saturating_sub(n)..];
        let pad = n - tail.len();

        for (i, slot) in self.scratch.iter_mut().enumerate() {
            let s = if i < pad { 0.0 } else { tail[i - pad] };
            *slot = Complex::new(s * self.window[i], 0.0);
        }
        self.fft.process(&mut self.scratch);

        // A full-scale sine lands at 1.0 in its bin.
        let scale = 2.0 / self.window_gain;
        for (bin, value) in self.bins.iter_mut().zip(&self.scratch) {
            *bin = (value.norm() * scale).min(1.0);
        }

        self.tap.publish(&self.bins, rms(samples));
    }
}

pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

fn build_hann_window(size: usize) -> Vec<f32> {
    (0..size)
        .map(|i| {
            let phase = 2.0 * std::f32::consts::PI * i as f32 / size as f32;
            0.5 * (1.0 - phase.cos())
        })
        .collect()
}
