//! Stereo width control with M/S processing
//!
//! Width 0.5 leaves the image untouched, 0.0 folds to mono and 1.0 doubles
//! the side signal. An optional crossover sums everything below it to mono
//! so widening never smears the low end.

use serde::{Deserialize, Serialize};

use super::biquad::{BiquadCoeffs, BiquadState};
use super::Effect;
use crate::error::EngineError;

pub const WIDTH_RANGE: (f32, f32) = (0.0, 1.0);
pub const BASS_MONO_RANGE: (f32, f32) = (60.0, 250.0);
pub const NEUTRAL_WIDTH: f32 = 0.5;

/// Persistable spatializer parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpatializerSettings {
    pub enabled: bool,
    pub width: f32,
    pub bass_mono: Option<f32>,
}

pub struct Spatializer {
    enabled: bool,
    sample_rate: f32,

    width: f32,
    side_gain_smooth: f32,
    bass_mono: Option<f32>,

    crossover: BiquadCoeffs,
    low_l: BiquadState,
    low_r: BiquadState,
}

impl Spatializer {
    const SMOOTH_COEFF: f32 = 0.995;

    pub fn new(sample_rate: f32) -> Self {
        Self {
            enabled: false,
            sample_rate,
            width: NEUTRAL_WIDTH,
            side_gain_smooth: 1.0,
            bass_mono: None,
            crossover: BiquadCoeffs::UNITY,
            low_l: BiquadState::default(),
            low_r: BiquadState::default(),
        }
    }

    fn check_width(width: f32) -> Result<(), EngineError> {
        EngineError::check_range(
            "width",
            f64::from(width),
            f64::from(WIDTH_RANGE.0),
            f64::from(WIDTH_RANGE.1),
        )
    }

    fn check_bass_mono(freq: Option<f32>) -> Result<(), EngineError> {
        match freq {
            Some(freq) => EngineError::check_range(
                "bass_mono",
                f64::from(freq),
                f64::from(BASS_MONO_RANGE.0),
                f64::from(BASS_MONO_RANGE.1),
            ),
            None => Ok(()),
        }
    }

    pub fn set_width(&mut self, width: f32) -> Result<(), EngineError> {
        Self::check_width(width)?;
        self.width = width;
        Ok(())
    }

    pub fn width(&self) -> f32 {
        self.width
    }

    /// Sum everything below `freq` to mono; `None` turns the crossover off
    pub fn set_bass_mono(&mut self, freq: Option<f32>) -> Result<(), EngineError> {
        Self::check_bass_mono(freq)?;
        self.bass_mono = freq;
        self.calculate_crossover();
        Ok(())
    }

    pub fn bass_mono(&self) -> Option<f32> {
        self.bass_mono
    }

    pub fn settings(&self) -> SpatializerSettings {
        SpatializerSettings {
            enabled: self.enabled,
            width: self.width,
            bass_mono: self.bass_mono,
        }
    }

    pub fn validate(settings: &SpatializerSettings) -> Result<(), EngineError> {
        Self::check_width(settings.width)?;
        Self::check_bass_mono(settings.bass_mono)
    }

    pub(crate) fn apply(&mut self, settings: &SpatializerSettings) {
        self.width = settings.width;
        self.bass_mono = settings.bass_mono;
        self.calculate_crossover();
        self.set_enabled(settings.enabled);
    }

    fn calculate_crossover(&mut self) {
        self.crossover = match self.bass_mono {
            Some(freq) => BiquadCoeffs::lowpass(freq, self.sample_rate),
            None => BiquadCoeffs::UNITY,
        };
        self.low_l.reset();
        self.low_r.reset();
    }

    #[inline]
    fn encode_ms(left: f32, right: f32) -> (f32, f32) {
        ((left + right) * 0.5, (left - right) * 0.5)
    }

    #[inline]
    fn decode_ms(mid: f32, side: f32) -> (f32, f32) {
        (mid + side, mid - side)
    }

    #[inline]
    fn process_sample(&mut self, left: f32, right: f32, side_gain: f32) -> (f32, f32) {
        let (low_mono, high_l, high_r) = if self.bass_mono.is_some() {
            let low_l = self.low_l.process(left, &self.crossover);
            let low_r = self.low_r.process(right, &self.crossover);
            ((low_l + low_r) * 0.5, left - low_l, right - low_r)
        } else {
            (0.0, left, right)
        };

        let (mid, side) = Self::encode_ms(high_l, high_r);
        let (out_l, out_r) = Self::decode_ms(mid, side * side_gain);
        (out_l + low_mono, out_r + low_mono)
    }
}

impl Effect for Spatializer {
    fn process(&mut self, samples: &mut [f32]) {
        if !self.enabled {
            return;
        }

        let target = self.width * 2.0;
        for frame in samples.chunks_exact_mut(2) {
            self.side_gain_smooth =
                Self::SMOOTH_COEFF * self.side_gain_smooth + (1.0 - Self::SMOOTH_COEFF) * target;
            if (self.side_gain_smooth - target).abs() < 1e-5 {
                self.side_gain_smooth = target;
            }
            let (out_l, out_r) = self.process_sample(frame[0], frame[1], self.side_gain_smooth);
            frame[0] = out_l;
            frame[1] = out_r;
        }
    }

    fn reset(&mut self) {
        self.low_l.reset();
        self.low_r.reset();
        self.side_gain_smooth = self.width * 2.0;
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn set_enabled(&mut self, enabled: bool) {
        // Entering from bypass starts at the configured width, no sweep.
        if enabled != self.enabled {
            self.reset();
        }
        self.enabled = enabled;
    }

    fn set_sample_rate(&mut self, sample_rate: f32) {
        self.sample_rate = sample_rate;
        self.calculate_crossover();
    }

    fn name(&self) -> &'static str {
        "Spatializer"
    }
}
