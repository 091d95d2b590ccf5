//! FFT-based spectrum analysis for the engine's analyser tap

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::f32::consts::PI;
use std::sync::Arc;

/// Number of logarithmic frequency bands reported per frame
pub const SPECTRUM_BANDS: usize = 32;

/// Default FFT window length in samples
pub const DEFAULT_FFT_SIZE: usize = 2048;

/// Band magnitudes for one analysis frame
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SpectrumData {
    /// Magnitude per band (0.0 - 1.0)
    pub bands: [f32; SPECTRUM_BANDS],
    /// Peak sample magnitude of the analysed window (0.0 - 1.0)
    pub peak: f32,
}

/// Windowed FFT analyzer producing smoothed logarithmic bands
pub struct SpectrumAnalyzer {
    sample_rate: u32,
    fft_size: usize,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    band_edges: [(f32, f32); SPECTRUM_BANDS],
    smoothing: f32,
    previous: [f32; SPECTRUM_BANDS],
    scratch: Vec<Complex<f32>>,
}

impl SpectrumAnalyzer {
    /// Create an analyzer with the default window length
    pub fn new(sample_rate: u32) -> Self {
        Self::with_fft_size(sample_rate, DEFAULT_FFT_SIZE)
    }

    /// Create an analyzer with a specific window length
    pub fn with_fft_size(sample_rate: u32, fft_size: usize) -> Self {
        let fft_size = fft_size.max(64);
        let fft = FftPlanner::new().plan_fft_forward(fft_size);

        // Hann window
        let window = (0..fft_size)
            .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / fft_size as f32).cos()))
            .collect();

        Self {
            sample_rate,
            fft_size,
            fft,
            window,
            band_edges: Self::band_edges(sample_rate),
            smoothing: 0.7,
            previous: [0.0; SPECTRUM_BANDS],
            scratch: vec![Complex::new(0.0, 0.0); fft_size],
        }
    }

    fn band_edges(sample_rate: u32) -> [(f32, f32); SPECTRUM_BANDS] {
        let mut edges = [(0.0f32, 0.0f32); SPECTRUM_BANDS];
        let log_min = 20.0f32.ln();
        let log_max = 20000.0f32.min(sample_rate as f32 / 2.0).ln();

        for (i, edge) in edges.iter_mut().enumerate() {
            let t0 = i as f32 / SPECTRUM_BANDS as f32;
            let t1 = (i + 1) as f32 / SPECTRUM_BANDS as f32;
            *edge = (
                (log_min + t0 * (log_max - log_min)).exp(),
                (log_min + t1 * (log_max - log_min)).exp(),
            );
        }
        edges
    }

    /// Window length in samples
    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Sample rate the band edges were computed for
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Recompute band edges for a new sample rate and drop smoothing history
    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        if sample_rate == self.sample_rate {
            return;
        }
        self.sample_rate = sample_rate;
        self.band_edges = Self::band_edges(sample_rate);
        self.previous = [0.0; SPECTRUM_BANDS];
    }

    /// Set the temporal smoothing factor (0.0 = none, 0.99 = heavy)
    pub fn set_smoothing(&mut self, smoothing: f32) {
        self.smoothing = smoothing.clamp(0.0, 0.99);
    }

    /// Analyze mono samples and return normalized band magnitudes
    ///
    /// Only the first `fft_size` samples are used; shorter input is zero padded.
    pub fn analyze(&mut self, samples: &[f32]) -> [f32; SPECTRUM_BANDS] {
        let used = samples.len().min(self.fft_size);
        for (slot, (&sample, &w)) in self
            .scratch
            .iter_mut()
            .zip(samples.iter().zip(self.window.iter()))
        {
            *slot = Complex::new(sample * w, 0.0);
        }
        for slot in self.scratch.iter_mut().skip(used) {
            *slot = Complex::new(0.0, 0.0);
        }

        self.fft.process(&mut self.scratch);

        let mut magnitudes = [0.0f32; SPECTRUM_BANDS];
        let bin_width = self.sample_rate as f32 / self.fft_size as f32;
        let nyquist_bin = self.fft_size / 2;

        for (mag, &(low, high)) in magnitudes.iter_mut().zip(self.band_edges.iter()) {
            let start = (low / bin_width) as usize;
            let end = ((high / bin_width) as usize).min(nyquist_bin);
            if start < end {
                let sum: f32 = self.scratch[start..end].iter().map(|c| c.norm()).sum();
                *mag = sum / (end - start) as f32;
            }
        }

        // Normalize against a floor so silence does not get amplified to full scale
        let max_magnitude = magnitudes.iter().copied().fold(0.0f32, f32::max);
        if max_magnitude > 0.0 {
            let scale = max_magnitude.max(100.0);
            for mag in &mut magnitudes {
                *mag = (*mag / scale).clamp(0.0, 1.0);
            }
        }

        for (mag, prev) in magnitudes.iter_mut().zip(self.previous.iter_mut()) {
            *mag = *prev * self.smoothing + *mag * (1.0 - self.smoothing);
            *prev = *mag;
        }

        magnitudes
    }

    /// Analyze samples and include the window's peak level
    pub fn process(&mut self, samples: &[f32]) -> SpectrumData {
        let bands = self.analyze(samples);
        let peak = samples
            .iter()
            .take(self.fft_size)
            .map(|s| s.abs())
            .fold(0.0f32, f32::max)
            .min(1.0);
        SpectrumData { bands, peak }
    }

    /// Clear smoothing history
    pub fn reset(&mut self) {
        self.previous = [0.0; SPECTRUM_BANDS];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, sample_rate: u32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * PI * freq * i as f32 / sample_rate as f32).sin())
            .collect()
    }

    #[test]
    fn test_silence_has_no_energy() {
        let mut analyzer = SpectrumAnalyzer::new(48000);
        let data = analyzer.process(&vec![0.0; 2048]);
        assert!(data.bands.iter().all(|&b| b == 0.0));
        assert_eq!(data.peak, 0.0);
    }

    #[test]
    fn test_low_tone_lands_in_low_bands() {
        let mut analyzer = SpectrumAnalyzer::new(48000);
        analyzer.set_smoothing(0.0);
        let bands = analyzer.analyze(&sine(100.0, 48000, 2048));

        let loudest = bands
            .iter()
            .enumerate()
            .fold((0, 0.0f32), |acc, (i, &b)| if b > acc.1 { (i, b) } else { acc })
            .0;
        assert!(loudest < SPECTRUM_BANDS / 2, "100 Hz peaked in band {}", loudest);
    }

    #[test]
    fn test_short_input_is_zero_padded() {
        let mut analyzer = SpectrumAnalyzer::with_fft_size(48000, 1024);
        let data = analyzer.process(&sine(1000.0, 48000, 100));
        assert!(data.peak > 0.9);
        assert!(data.bands.iter().all(|b| b.is_finite()));
    }

    #[test]
    fn test_sample_rate_change_resets_history() {
        let mut analyzer = SpectrumAnalyzer::new(48000);
        analyzer.analyze(&sine(440.0, 48000, 2048));
        analyzer.set_sample_rate(44100);
        assert_eq!(analyzer.sample_rate(), 44100);
        assert!(analyzer.previous.iter().all(|&p| p == 0.0));
    }
}
