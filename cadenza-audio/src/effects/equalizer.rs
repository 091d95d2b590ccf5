//! 10-band graphic equalizer
//!
//! Shelves at the outer bands, peaking bells in between. Band gains and the
//! master gain are smoothed per block so edits never click.
//!
//! Bands: 32, 64, 125, 250, 500, 1k, 2k, 4k, 8k, 16k Hz, each ±12 dB.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::biquad::{BiquadCoeffs, BiquadState};
use super::Effect;
use crate::error::EngineError;

pub const BAND_COUNT: usize = 10;
pub const BAND_FREQUENCIES: [f32; BAND_COUNT] = [
    32.0, 64.0, 125.0, 250.0, 500.0, 1000.0, 2000.0, 4000.0, 8000.0, 16000.0,
];
pub const MIN_GAIN_DB: f32 = -12.0;
pub const MAX_GAIN_DB: f32 = 12.0;

/// One octave per band
const BAND_Q: f32 = 1.41;

/// Built-in band layouts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EqPreset {
    Flat,
    Rock,
    Pop,
    Jazz,
    Classical,
    Electronic,
    HipHop,
    Vocal,
    BassBoost,
    TrebleBoost,
}

impl EqPreset {
    pub const ALL: [EqPreset; 10] = [
        EqPreset::Flat,
        EqPreset::Rock,
        EqPreset::Pop,
        EqPreset::Jazz,
        EqPreset::Classical,
        EqPreset::Electronic,
        EqPreset::HipHop,
        EqPreset::Vocal,
        EqPreset::BassBoost,
        EqPreset::TrebleBoost,
    ];

    pub fn name(self) -> &'static str {
        match self {
            EqPreset::Flat => "flat",
            EqPreset::Rock => "rock",
            EqPreset::Pop => "pop",
            EqPreset::Jazz => "jazz",
            EqPreset::Classical => "classical",
            EqPreset::Electronic => "electronic",
            EqPreset::HipHop => "hip-hop",
            EqPreset::Vocal => "vocal",
            EqPreset::BassBoost => "bass-boost",
            EqPreset::TrebleBoost => "treble-boost",
        }
    }

    pub fn gains(self) -> [f32; BAND_COUNT] {
        match self {
            EqPreset::Flat => [0.0; BAND_COUNT],
            EqPreset::Rock => [5.0, 4.0, 3.0, 1.0, -1.0, -1.0, 1.0, 3.0, 4.0, 5.0],
            EqPreset::Pop => [-1.0, 1.0, 3.0, 4.0, 3.0, 1.0, -1.0, -1.0, 1.0, 2.0],
            EqPreset::Jazz => [3.0, 2.0, 1.0, 2.0, -1.0, -1.0, 0.0, 1.0, 2.0, 3.0],
            EqPreset::Classical => [4.0, 3.0, 2.0, 1.0, -1.0, -1.0, 0.0, 2.0, 3.0, 4.0],
            EqPreset::Electronic => [5.0, 4.0, 1.0, 0.0, -2.0, 2.0, 1.0, 2.0, 4.0, 5.0],
            EqPreset::HipHop => [5.0, 4.0, 2.0, 3.0, -1.0, -1.0, 1.0, 0.0, 2.0, 3.0],
            EqPreset::Vocal => [-2.0, -3.0, -2.0, 1.0, 4.0, 4.0, 3.0, 1.0, 0.0, -2.0],
            EqPreset::BassBoost => [6.0, 5.0, 4.0, 2.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            EqPreset::TrebleBoost => [0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 2.0, 4.0, 5.0, 6.0],
        }
    }

    /// Preset whose table equals `gains` exactly
    pub fn matching(gains: &[f32]) -> Option<EqPreset> {
        EqPreset::ALL
            .into_iter()
            .find(|preset| preset.gains().as_slice() == gains)
    }
}

impl fmt::Display for EqPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EqPreset {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EqPreset::ALL
            .into_iter()
            .find(|preset| preset.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| EngineError::InvalidValue {
                parameter: "preset",
                reason: format!("unknown preset '{s}'"),
            })
    }
}

/// Persistable equalizer parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EqualizerSettings {
    pub enabled: bool,
    pub bands: Vec<f32>,
    pub master_gain: f32,
}

pub struct Equalizer {
    enabled: bool,
    sample_rate: f32,

    gains: [f32; BAND_COUNT],
    master_gain: f32,

    gains_smooth: [f32; BAND_COUNT],
    master_linear_smooth: f32,
    smooth_coeff: f32,

    coeffs: [BiquadCoeffs; BAND_COUNT],
    state_l: [BiquadState; BAND_COUNT],
    state_r: [BiquadState; BAND_COUNT],
    needs_update: bool,
}

impl Equalizer {
    pub fn new(sample_rate: f32) -> Self {
        let mut eq = Self {
            enabled: true,
            sample_rate,
            gains: [0.0; BAND_COUNT],
            master_gain: 0.0,
            gains_smooth: [0.0; BAND_COUNT],
            master_linear_smooth: 1.0,
            smooth_coeff: Self::smooth_coeff(sample_rate),
            coeffs: [BiquadCoeffs::UNITY; BAND_COUNT],
            state_l: [BiquadState::default(); BAND_COUNT],
            state_r: [BiquadState::default(); BAND_COUNT],
            needs_update: true,
        };
        eq.update_coefficients();
        eq
    }

    /// Per-block smoothing step, ~5ms worth of 512-frame blocks
    fn smooth_coeff(sample_rate: f32) -> f32 {
        (512.0 / (sample_rate * 0.005)).min(1.0) * 0.5
    }

    fn check_gain(parameter: &'static str, db: f32) -> Result<(), EngineError> {
        EngineError::check_range(
            parameter,
            f64::from(db),
            f64::from(MIN_GAIN_DB),
            f64::from(MAX_GAIN_DB),
        )
    }

    pub fn set_band_gain(&mut self, index: usize, db: f32) -> Result<(), EngineError> {
        if index >= BAND_COUNT {
            return Err(EngineError::InvalidValue {
                parameter: "band",
                reason: format!("index {index} out of 0..{BAND_COUNT}"),
            });
        }
        Self::check_gain("band_gain", db)?;
        self.gains[index] = db;
        self.needs_update = true;
        Ok(())
    }

    /// Replace every band at once; nothing changes if any value is invalid
    pub fn set_band_values(&mut self, values: &[f32]) -> Result<(), EngineError> {
        if values.len() != BAND_COUNT {
            return Err(EngineError::InvalidValue {
                parameter: "bands",
                reason: format!("expected {BAND_COUNT} values, got {}", values.len()),
            });
        }
        for &db in values {
            Self::check_gain("band_gain", db)?;
        }
        self.gains.copy_from_slice(values);
        self.needs_update = true;
        Ok(())
    }

    pub fn band_values(&self) -> Vec<f32> {
        self.gains.to_vec()
    }

    pub fn band_frequencies(&self) -> [f32; BAND_COUNT] {
        BAND_FREQUENCIES
    }

    pub fn set_master_gain(&mut self, db: f32) -> Result<(), EngineError> {
        Self::check_gain("master_gain", db)?;
        self.master_gain = db;
        Ok(())
    }

    pub fn master_gain(&self) -> f32 {
        self.master_gain
    }

    pub fn apply_preset(&mut self, preset: EqPreset) {
        self.gains = preset.gains();
        self.needs_update = true;
    }

    /// Preset matching the current band values, `None` for custom
    pub fn current_preset(&self) -> Option<EqPreset> {
        EqPreset::matching(&self.gains)
    }

    pub fn settings(&self) -> EqualizerSettings {
        EqualizerSettings {
            enabled: self.enabled,
            bands: self.band_values(),
            master_gain: self.master_gain,
        }
    }

    pub fn validate(settings: &EqualizerSettings) -> Result<(), EngineError> {
        if settings.bands.len() != BAND_COUNT {
            return Err(EngineError::InvalidValue {
                parameter: "bands",
                reason: format!("expected {BAND_COUNT} values, got {}", settings.bands.len()),
            });
        }
        for &db in &settings.bands {
            Self::check_gain("band_gain", db)?;
        }
        Self::check_gain("master_gain", settings.master_gain)
    }

    /// Apply validated settings
    pub(crate) fn apply(&mut self, settings: &EqualizerSettings) {
        self.gains.copy_from_slice(&settings.bands);
        self.master_gain = settings.master_gain;
        self.needs_update = true;
        self.set_enabled(settings.enabled);
    }

    fn update_coefficients(&mut self) {
        let last = BAND_COUNT - 1;
        for (i, coeffs) in self.coeffs.iter_mut().enumerate() {
            let freq = BAND_FREQUENCIES[i];
            let gain = self.gains_smooth[i];
            *coeffs = match i {
                0 => BiquadCoeffs::low_shelf(freq, gain, self.sample_rate),
                i if i == last => BiquadCoeffs::high_shelf(freq, gain, self.sample_rate),
                _ => BiquadCoeffs::peaking(freq, gain, BAND_Q, self.sample_rate),
            };
        }
        self.needs_update = false;
    }

    fn smooth_and_update(&mut self) {
        let mut changed = false;
        for (smooth, &target) in self.gains_smooth.iter_mut().zip(self.gains.iter()) {
            if (*smooth - target).abs() > 0.001 {
                *smooth += (target - *smooth) * self.smooth_coeff;
                changed = true;
            } else if *smooth != target {
                *smooth = target;
                changed = true;
            }
        }
        if changed || self.needs_update {
            self.update_coefficients();
        }
    }
}

impl Effect for Equalizer {
    fn process(&mut self, samples: &mut [f32]) {
        if !self.enabled {
            return;
        }

        self.smooth_and_update();

        let master_target = 10.0f32.powf(self.master_gain / 20.0);
        let unity = self.master_gain == 0.0 && self.master_linear_smooth == 1.0;

        for frame in samples.chunks_exact_mut(2) {
            let mut left = frame[0];
            let mut right = frame[1];
            for band in 0..BAND_COUNT {
                let coeffs = &self.coeffs[band];
                left = self.state_l[band].process(left, coeffs);
                right = self.state_r[band].process(right, coeffs);
            }

            if !unity {
                self.master_linear_smooth =
                    0.999 * self.master_linear_smooth + 0.001 * master_target;
                if (self.master_linear_smooth - master_target).abs() < 1e-6 {
                    self.master_linear_smooth = master_target;
                }
                left *= self.master_linear_smooth;
                right *= self.master_linear_smooth;
            }

            frame[0] = left;
            frame[1] = right;
        }
    }

    fn reset(&mut self) {
        for state in self.state_l.iter_mut().chain(self.state_r.iter_mut()) {
            state.reset();
        }
        self.gains_smooth = self.gains;
        self.master_linear_smooth = 10.0f32.powf(self.master_gain / 20.0);
        self.needs_update = true;
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.reset();
        }
    }

    fn set_sample_rate(&mut self, sample_rate: f32) {
        self.sample_rate = sample_rate;
        self.smooth_coeff = Self::smooth_coeff(sample_rate);
        self.reset();
        self.update_coefficients();
    }

    fn name(&self) -> &'static str {
        "Equalizer"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    fn sine(freq: f32, len: usize) -> Vec<f32> {
        (0..len)
            .flat_map(|i| {
                let s = (2.0 * PI * freq * i as f32 / 48000.0).sin() * 0.25;
                [s, s]
            })
            .collect()
    }

    fn rms(samples: &[f32]) -> f32 {
        (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
    }

    #[test]
    fn test_flat_is_transparent() {
        let mut eq = Equalizer::new(48000.0);
        let mut samples = sine(440.0, 1024);
        let original = samples.clone();
        eq.process(&mut samples);
        assert_eq!(samples, original);
    }

    #[test]
    fn test_disabled_passthrough() {
        let mut eq = Equalizer::new(48000.0);
        eq.apply_preset(EqPreset::Rock);
        eq.set_enabled(false);
        let mut samples = vec![0.5, 0.5, 0.3, 0.3];
        let original = samples.clone();
        eq.process(&mut samples);
        assert_eq!(samples, original);
    }

    #[test]
    fn test_band_boost_raises_level() {
        let mut eq = Equalizer::new(48000.0);
        eq.set_band_gain(5, 12.0).unwrap();
        // Let smoothing settle
        for _ in 0..50 {
            let mut warm = sine(1000.0, 512);
            eq.process(&mut warm);
        }
        let mut samples = sine(1000.0, 4800);
        let before = rms(&samples);
        eq.process(&mut samples);
        assert!(rms(&samples) > before * 2.5);
    }

    #[test]
    fn test_out_of_range_rejected() {
        let mut eq = Equalizer::new(48000.0);
        eq.set_band_gain(2, 3.0).unwrap();
        assert!(eq.set_band_gain(2, 12.5).is_err());
        assert!(eq.set_band_gain(10, 0.0).is_err());
        assert!(eq.set_master_gain(-13.0).is_err());
        assert_eq!(eq.band_values()[2], 3.0);
    }

    #[test]
    fn test_bulk_set_is_all_or_nothing() {
        let mut eq = Equalizer::new(48000.0);
        let mut values = vec![1.0; BAND_COUNT];
        values[7] = 20.0;
        assert!(eq.set_band_values(&values).is_err());
        assert_eq!(eq.band_values(), vec![0.0; BAND_COUNT]);
        assert!(eq.set_band_values(&[0.0; 3]).is_err());
    }

    #[test]
    fn test_preset_identity_by_value() {
        let mut eq = Equalizer::new(48000.0);
        assert_eq!(eq.current_preset(), Some(EqPreset::Flat));

        eq.apply_preset(EqPreset::Jazz);
        assert_eq!(eq.current_preset(), Some(EqPreset::Jazz));
        eq.set_band_gain(0, 2.5).unwrap();
        assert_eq!(eq.current_preset(), None);

        eq.set_band_values(&EqPreset::Vocal.gains()).unwrap();
        assert_eq!(eq.current_preset(), Some(EqPreset::Vocal));
    }

    #[test]
    fn test_preset_names() {
        for preset in EqPreset::ALL {
            assert_eq!(preset.name().parse::<EqPreset>().ok(), Some(preset));
        }
        assert!("loudness".parse::<EqPreset>().is_err());
    }
}
