//! Lookahead brickwall limiter, last stage before the master output
//!
//! Peaks are held across the lookahead window (monotonic deque, O(1)
//! amortized) so gain reduction is fully in place before the delayed peak
//! reaches the output. A fast and a slow envelope are combined: the fast one
//! catches transients, the slow one keeps sustained material from pumping.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use super::Effect;
use crate::error::EngineError;

pub const CEILING_RANGE: (f32, f32) = (-6.0, 0.0);
pub const DEFAULT_CEILING_DB: f32 = -1.0;

const LOOKAHEAD_MS: f32 = 5.0;
/// Soft knee below the ceiling
const KNEE_DB: f32 = 1.5;

const FAST_ATTACK_MS: f32 = 0.1;
const FAST_RELEASE_MS: f32 = 10.0;
const SLOW_ATTACK_MS: f32 = 2.0;
const SLOW_RELEASE_MS: f32 = 80.0;

/// Persistable limiter parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterSettings {
    pub enabled: bool,
    pub ceiling: f32,
}

/// Sliding-window maximum over the last `window` samples
struct PeakHold {
    deque: VecDeque<(f32, u64)>,
    window: u64,
    clock: u64,
}

impl PeakHold {
    fn new(window: usize) -> Self {
        Self {
            deque: VecDeque::with_capacity(window + 1),
            window: window as u64,
            clock: 0,
        }
    }

    #[inline]
    fn push(&mut self, peak: f32) -> f32 {
        while self.deque.front().is_some_and(|&(_, expires)| expires <= self.clock) {
            self.deque.pop_front();
        }
        while self.deque.back().is_some_and(|&(value, _)| value <= peak) {
            self.deque.pop_back();
        }
        self.deque.push_back((peak, self.clock + self.window));
        self.clock += 1;
        self.deque.front().map_or(0.0, |&(value, _)| value)
    }

    fn reset(&mut self) {
        self.deque.clear();
        self.clock = 0;
    }
}

#[inline]
fn time_to_coeff(ms: f32, sample_rate: f32) -> f32 {
    (-1.0 / (sample_rate * ms / 1000.0)).exp()
}

struct Envelope {
    fast: f32,
    slow: f32,
    fast_attack: f32,
    fast_release: f32,
    slow_attack: f32,
    slow_release: f32,
}

impl Envelope {
    fn new(sample_rate: f32) -> Self {
        Self {
            fast: 1.0,
            slow: 1.0,
            fast_attack: time_to_coeff(FAST_ATTACK_MS, sample_rate),
            fast_release: time_to_coeff(FAST_RELEASE_MS, sample_rate),
            slow_attack: time_to_coeff(SLOW_ATTACK_MS, sample_rate),
            slow_release: time_to_coeff(SLOW_RELEASE_MS, sample_rate),
        }
    }

    #[inline]
    fn follow(value: f32, target: f32, attack: f32, release: f32) -> f32 {
        let coeff = if target < value { attack } else { release };
        coeff * value + (1.0 - coeff) * target
    }

    #[inline]
    fn process(&mut self, target: f32) -> f32 {
        self.fast = Self::follow(self.fast, target, self.fast_attack, self.fast_release);
        if target < self.fast {
            // Never let the fast stage lag behind a drop
            self.fast = self.fast.min(target * 1.01);
        }
        self.slow = Self::follow(self.slow, target, self.slow_attack, self.slow_release);
        self.fast.min(self.slow).clamp(0.001, 1.0)
    }

    fn reset(&mut self) {
        self.fast = 1.0;
        self.slow = 1.0;
    }
}

pub struct Limiter {
    enabled: bool,
    sample_rate: f32,

    ceiling_db: f32,
    ceiling: f32,
    knee_threshold: f32,

    hold: PeakHold,
    envelope: Envelope,

    delay_l: Vec<f32>,
    delay_r: Vec<f32>,
    write_pos: usize,
    lookahead: usize,

    current_gr_db: f32,
}

impl Limiter {
    pub fn new(sample_rate: f32) -> Self {
        let lookahead = Self::lookahead_for(sample_rate);
        let mut limiter = Self {
            enabled: false,
            sample_rate,
            ceiling_db: DEFAULT_CEILING_DB,
            ceiling: 1.0,
            knee_threshold: 1.0,
            hold: PeakHold::new(lookahead),
            envelope: Envelope::new(sample_rate),
            delay_l: vec![0.0; lookahead],
            delay_r: vec![0.0; lookahead],
            write_pos: 0,
            lookahead,
            current_gr_db: 0.0,
        };
        limiter.update_ceiling();
        limiter
    }

    fn lookahead_for(sample_rate: f32) -> usize {
        ((sample_rate * LOOKAHEAD_MS / 1000.0) as usize).max(1)
    }

    fn check_ceiling(db: f32) -> Result<(), EngineError> {
        EngineError::check_range(
            "ceiling",
            f64::from(db),
            f64::from(CEILING_RANGE.0),
            f64::from(CEILING_RANGE.1),
        )
    }

    pub fn set_ceiling(&mut self, db: f32) -> Result<(), EngineError> {
        Self::check_ceiling(db)?;
        self.ceiling_db = db;
        self.update_ceiling();
        Ok(())
    }

    pub fn ceiling(&self) -> f32 {
        self.ceiling_db
    }

    /// Latency added by the lookahead, in frames
    pub fn latency_frames(&self) -> usize {
        self.lookahead
    }

    pub fn gain_reduction_db(&self) -> f32 {
        self.current_gr_db
    }

    pub fn settings(&self) -> LimiterSettings {
        LimiterSettings {
            enabled: self.enabled,
            ceiling: self.ceiling_db,
        }
    }

    pub fn validate(settings: &LimiterSettings) -> Result<(), EngineError> {
        Self::check_ceiling(settings.ceiling)
    }

    pub(crate) fn apply(&mut self, settings: &LimiterSettings) {
        self.ceiling_db = settings.ceiling;
        self.update_ceiling();
        self.set_enabled(settings.enabled);
    }

    fn update_ceiling(&mut self) {
        self.ceiling = 10.0f32.powf(self.ceiling_db / 20.0);
        self.knee_threshold = self.ceiling / 10.0f32.powf(KNEE_DB / 20.0);
    }

    /// Gain that brings `peak` under the ceiling, quadratic through the knee
    #[inline]
    fn gain_for(&self, peak: f32) -> f32 {
        if peak <= self.knee_threshold {
            1.0
        } else if peak >= self.ceiling {
            self.ceiling / peak
        } else {
            let range = self.ceiling - self.knee_threshold;
            let x = (peak - self.knee_threshold) / range;
            ((self.knee_threshold + x * x * range) / peak).min(1.0)
        }
    }

    #[inline]
    fn process_sample(&mut self, left: f32, right: f32) -> (f32, f32) {
        let held = self.hold.push(left.abs().max(right.abs()));
        let gain = self.envelope.process(self.gain_for(held));

        let delayed_l = self.delay_l[self.write_pos];
        let delayed_r = self.delay_r[self.write_pos];
        self.delay_l[self.write_pos] = left;
        self.delay_r[self.write_pos] = right;
        self.write_pos = (self.write_pos + 1) % self.lookahead;

        self.current_gr_db = 20.0 * gain.log10();

        // Hard clamp catches whatever the envelope could not
        (
            (delayed_l * gain).clamp(-self.ceiling, self.ceiling),
            (delayed_r * gain).clamp(-self.ceiling, self.ceiling),
        )
    }
}

impl Effect for Limiter {
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
        self.hold.reset();
        self.envelope.reset();
        self.delay_l.fill(0.0);
        self.delay_r.fill(0.0);
        self.write_pos = 0;
        self.current_gr_db = 0.0;
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
        self.lookahead = Self::lookahead_for(sample_rate);
        self.hold = PeakHold::new(self.lookahead);
        self.envelope = Envelope::new(sample_rate);
        self.delay_l = vec![0.0; self.lookahead];
        self.delay_r = vec![0.0; self.lookahead];
        self.write_pos = 0;
    }

    fn name(&self) -> &'static str {
        "Limiter"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled() -> Limiter {
        let mut limiter = Limiter::new(48000.0);
        limiter.set_enabled(true);
        limiter
    }

    #[test]
    fn test_output_never_exceeds_ceiling() {
        let mut limiter = enabled();
        limiter.set_ceiling(-3.0).unwrap();
        let ceiling = 10.0f32.powf(-3.0 / 20.0);

        let mut samples: Vec<f32> = (0..9600).map(|i| (i as f32 * 0.05).sin() * 1.5).collect();
        limiter.process(&mut samples);

        assert!(samples.iter().all(|s| s.abs() <= ceiling + 1e-6));
        assert!(limiter.gain_reduction_db() < 0.0);
    }

    #[test]
    fn test_quiet_signal_is_delayed_not_changed() {
        let mut limiter = enabled();
        let delay = limiter.latency_frames();
        let input: Vec<f32> = (0..2048).flat_map(|i| {
            let s = (i as f32 * 0.01).sin() * 0.3;
            [s, s]
        }).collect();
        let mut samples = input.clone();
        limiter.process(&mut samples);

        for i in (delay * 2)..samples.len() {
            assert!((samples[i] - input[i - delay * 2]).abs() < 1e-6);
        }
    }

    #[test]
    fn test_ceiling_range() {
        let mut limiter = Limiter::new(48000.0);
        assert!(limiter.set_ceiling(-7.0).is_err());
        assert!(limiter.set_ceiling(0.5).is_err());
        assert_eq!(limiter.ceiling(), DEFAULT_CEILING_DB);
    }

    #[test]
    fn test_peak_hold_window() {
        let mut hold = PeakHold::new(3);
        assert_eq!(hold.push(0.9), 0.9);
        assert_eq!(hold.push(0.1), 0.9);
        assert_eq!(hold.push(0.2), 0.9);
        assert_eq!(hold.push(0.1), 0.2);
    }

    #[test]
    fn test_disabled_passthrough() {
        let mut limiter = Limiter::new(48000.0);
        let mut samples = vec![1.5, -1.5, 0.3, 0.3];
        let original = samples.clone();
        limiter.process(&mut samples);
        assert_eq!(samples, original);
    }
}
