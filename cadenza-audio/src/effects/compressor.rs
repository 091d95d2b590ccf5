//! Feed-forward compressor
//!
//! Linked-stereo peak detection through a 60 Hz sidechain highpass, soft
//! knee, program-dependent release and automatic makeup gain.

use serde::{Deserialize, Serialize};

use super::biquad::{BiquadCoeffs, BiquadState};
use super::Effect;
use crate::error::EngineError;

pub const THRESHOLD_RANGE: (f32, f32) = (-60.0, 0.0);
pub const RATIO_RANGE: (f32, f32) = (1.0, 20.0);
pub const KNEE_RANGE: (f32, f32) = (0.0, 40.0);
pub const ATTACK_RANGE: (f32, f32) = (0.001, 1.0);
pub const RELEASE_RANGE: (f32, f32) = (0.01, 1.0);

/// Persistable compressor parameters (times in seconds)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressorSettings {
    pub enabled: bool,
    pub threshold: f32,
    pub ratio: f32,
    pub knee: f32,
    pub attack: f32,
    pub release: f32,
}

fn check(parameter: &'static str, value: f32, (min, max): (f32, f32)) -> Result<(), EngineError> {
    EngineError::check_range(parameter, f64::from(value), f64::from(min), f64::from(max))
}

pub struct Compressor {
    enabled: bool,
    sample_rate: f32,

    threshold: f32,
    ratio: f32,
    knee: f32,
    attack: f32,
    release: f32,

    attack_coeff: f32,
    release_coeff: f32,
    makeup_gain: f32,

    sidechain: BiquadCoeffs,
    sidechain_l: BiquadState,
    sidechain_r: BiquadState,

    envelope: f32,
    gain_smooth: f32,
    current_gr_db: f32,
}

impl Compressor {
    const GAIN_SMOOTH_COEFF: f32 = 0.9995;
    const SIDECHAIN_HPF_HZ: f32 = 60.0;

    pub fn new(sample_rate: f32) -> Self {
        let mut comp = Self {
            enabled: false,
            sample_rate,
            threshold: -24.0,
            ratio: 4.0,
            knee: 6.0,
            attack: 0.003,
            release: 0.25,
            attack_coeff: 0.0,
            release_coeff: 0.0,
            makeup_gain: 1.0,
            sidechain: BiquadCoeffs::UNITY,
            sidechain_l: BiquadState::default(),
            sidechain_r: BiquadState::default(),
            envelope: 1.0,
            gain_smooth: 1.0,
            current_gr_db: 0.0,
        };
        comp.update_coefficients();
        comp.calculate_makeup_gain();
        comp
    }

    pub fn set_threshold(&mut self, db: f32) -> Result<(), EngineError> {
        check("threshold", db, THRESHOLD_RANGE)?;
        self.threshold = db;
        self.calculate_makeup_gain();
        Ok(())
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn set_ratio(&mut self, ratio: f32) -> Result<(), EngineError> {
        check("ratio", ratio, RATIO_RANGE)?;
        self.ratio = ratio;
        self.calculate_makeup_gain();
        Ok(())
    }

    pub fn ratio(&self) -> f32 {
        self.ratio
    }

    pub fn set_knee(&mut self, db: f32) -> Result<(), EngineError> {
        check("knee", db, KNEE_RANGE)?;
        self.knee = db;
        Ok(())
    }

    pub fn knee(&self) -> f32 {
        self.knee
    }

    pub fn set_attack(&mut self, seconds: f32) -> Result<(), EngineError> {
        check("attack", seconds, ATTACK_RANGE)?;
        self.attack = seconds;
        self.update_coefficients();
        Ok(())
    }

    pub fn attack(&self) -> f32 {
        self.attack
    }

    pub fn set_release(&mut self, seconds: f32) -> Result<(), EngineError> {
        check("release", seconds, RELEASE_RANGE)?;
        self.release = seconds;
        self.update_coefficients();
        Ok(())
    }

    pub fn release(&self) -> f32 {
        self.release
    }

    /// Current gain reduction in dB (negative while compressing)
    pub fn gain_reduction_db(&self) -> f32 {
        self.current_gr_db
    }

    pub fn settings(&self) -> CompressorSettings {
        CompressorSettings {
            enabled: self.enabled,
            threshold: self.threshold,
            ratio: self.ratio,
            knee: self.knee,
            attack: self.attack,
            release: self.release,
        }
    }

    pub fn validate(settings: &CompressorSettings) -> Result<(), EngineError> {
        check("threshold", settings.threshold, THRESHOLD_RANGE)?;
        check("ratio", settings.ratio, RATIO_RANGE)?;
        check("knee", settings.knee, KNEE_RANGE)?;
        check("attack", settings.attack, ATTACK_RANGE)?;
        check("release", settings.release, RELEASE_RANGE)
    }

    pub(crate) fn apply(&mut self, settings: &CompressorSettings) {
        self.threshold = settings.threshold;
        self.ratio = settings.ratio;
        self.knee = settings.knee;
        self.attack = settings.attack;
        self.release = settings.release;
        self.update_coefficients();
        self.calculate_makeup_gain();
        self.set_enabled(settings.enabled);
    }

    fn update_coefficients(&mut self) {
        self.attack_coeff = (-1.0 / (self.sample_rate * self.attack)).exp();
        self.release_coeff = (-1.0 / (self.sample_rate * self.release)).exp();
        self.sidechain = BiquadCoeffs::highpass(Self::SIDECHAIN_HPF_HZ, self.sample_rate);
    }

    /// Compensate roughly a quarter of the static reduction, capped at 6 dB
    fn calculate_makeup_gain(&mut self) {
        let avg_compression_db = (self.threshold.abs() * (1.0 - 1.0 / self.ratio)) / 4.0;
        self.makeup_gain = 10.0f32.powf(avg_compression_db.min(6.0) / 20.0);
    }

    #[inline]
    fn linear_to_db(linear: f32) -> f32 {
        if linear > 1e-10 {
            20.0 * linear.log10()
        } else {
            -200.0
        }
    }

    /// Static curve: gain change in dB for an input level
    #[inline]
    fn compute_gain_reduction(&self, input_db: f32) -> f32 {
        let (threshold, ratio, knee) = (self.threshold, self.ratio, self.knee);

        if input_db < threshold - knee / 2.0 {
            0.0
        } else if knee <= 0.0 || input_db > threshold + knee / 2.0 {
            threshold + (input_db - threshold) / ratio - input_db
        } else {
            let x = input_db - (threshold - knee / 2.0);
            (1.0 / ratio - 1.0) * (x * x) / (2.0 * knee)
        }
    }

    #[inline]
    fn process_sample(&mut self, left: f32, right: f32) -> (f32, f32) {
        let sc_l = self.sidechain_l.process(left, &self.sidechain);
        let sc_r = self.sidechain_r.process(right, &self.sidechain);

        let peak_db = Self::linear_to_db(sc_l.abs().max(sc_r.abs()));
        let gr_db = self.compute_gain_reduction(peak_db);
        let target_gain = 10.0f32.powf(gr_db / 20.0);

        let coeff = if target_gain < self.envelope {
            self.attack_coeff
        } else {
            // Slower release the harder we were compressing
            let gr_factor = 1.0 + (-gr_db / 10.0).min(1.0);
            self.release_coeff.powf(1.0 / gr_factor)
        };
        self.envelope = coeff * self.envelope + (1.0 - coeff) * target_gain;

        self.gain_smooth = Self::GAIN_SMOOTH_COEFF * self.gain_smooth
            + (1.0 - Self::GAIN_SMOOTH_COEFF) * self.envelope;
        self.current_gr_db = Self::linear_to_db(self.gain_smooth);

        let gain = self.gain_smooth * self.makeup_gain;
        (left * gain, right * gain)
    }
}

impl Effect for Compressor {
    fn process(&mut self, samples: &mut [f32]) {
        if !self.enabled {
            return;
        }

        for frame in samples.chunks_exact_mut(2) {
            let (out_l, out_r) = self.process_sample(frame[0], frame[1]);
            frame[0] = out_l;
            frame[1] = out_r;
        }
    }

    fn reset(&mut self) {
        self.envelope = 1.0;
        self.gain_smooth = 1.0;
        self.current_gr_db = 0.0;
        self.sidechain_l.reset();
        self.sidechain_r.reset();
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
        self.update_coefficients();
        self.reset();
    }

    fn name(&self) -> &'static str {
        "Compressor"
    }
}
