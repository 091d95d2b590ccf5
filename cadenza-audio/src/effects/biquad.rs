//! Biquad filter sections (RBJ Audio EQ Cookbook)

use std::f32::consts::PI;

/// Normalized biquad coefficients (a0 divided out)
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct BiquadCoeffs {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
}

impl Default for BiquadCoeffs {
    fn default() -> Self {
        Self::UNITY
    }
}

impl BiquadCoeffs {
    pub const UNITY: BiquadCoeffs = BiquadCoeffs {
        b0: 1.0,
        b1: 0.0,
        b2: 0.0,
        a1: 0.0,
        a2: 0.0,
    };

    fn normalize(b0: f32, b1: f32, b2: f32, a0: f32, a1: f32, a2: f32) -> Self {
        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
        }
    }

    /// Keep the centre frequency safely below Nyquist
    fn omega(freq: f32, sample_rate: f32) -> f32 {
        2.0 * PI * freq.min(sample_rate * 0.45) / sample_rate
    }

    pub fn peaking(freq: f32, gain_db: f32, q: f32, sample_rate: f32) -> Self {
        if gain_db.abs() < 0.01 {
            return Self::UNITY;
        }
        let a = 10.0f32.powf(gain_db / 40.0);
        let omega = Self::omega(freq, sample_rate);
        let (sin_w, cos_w) = omega.sin_cos();
        let alpha = sin_w / (2.0 * q);

        Self::normalize(
            1.0 + alpha * a,
            -2.0 * cos_w,
            1.0 - alpha * a,
            1.0 + alpha / a,
            -2.0 * cos_w,
            1.0 - alpha / a,
        )
    }

    pub fn low_shelf(freq: f32, gain_db: f32, sample_rate: f32) -> Self {
        if gain_db.abs() < 0.01 {
            return Self::UNITY;
        }
        let a = 10.0f32.powf(gain_db / 40.0);
        let omega = Self::omega(freq, sample_rate);
        let (sin_w, cos_w) = omega.sin_cos();
        // Shelf slope 1
        let two_sqrt_a_alpha = 2.0 * a.sqrt() * (sin_w / 2.0 * 2.0f32.sqrt());

        Self::normalize(
            a * ((a + 1.0) - (a - 1.0) * cos_w + two_sqrt_a_alpha),
            2.0 * a * ((a - 1.0) - (a + 1.0) * cos_w),
            a * ((a + 1.0) - (a - 1.0) * cos_w - two_sqrt_a_alpha),
            (a + 1.0) + (a - 1.0) * cos_w + two_sqrt_a_alpha,
            -2.0 * ((a - 1.0) + (a + 1.0) * cos_w),
            (a + 1.0) + (a - 1.0) * cos_w - two_sqrt_a_alpha,
        )
    }

    pub fn high_shelf(freq: f32, gain_db: f32, sample_rate: f32) -> Self {
        if gain_db.abs() < 0.01 {
            return Self::UNITY;
        }
        let a = 10.0f32.powf(gain_db / 40.0);
        let omega = Self::omega(freq, sample_rate);
        let (sin_w, cos_w) = omega.sin_cos();
        let two_sqrt_a_alpha = 2.0 * a.sqrt() * (sin_w / 2.0 * 2.0f32.sqrt());

        Self::normalize(
            a * ((a + 1.0) + (a - 1.0) * cos_w + two_sqrt_a_alpha),
            -2.0 * a * ((a - 1.0) + (a + 1.0) * cos_w),
            a * ((a + 1.0) + (a - 1.0) * cos_w - two_sqrt_a_alpha),
            (a + 1.0) - (a - 1.0) * cos_w + two_sqrt_a_alpha,
            2.0 * ((a - 1.0) - (a + 1.0) * cos_w),
            (a + 1.0) - (a - 1.0) * cos_w - two_sqrt_a_alpha,
        )
    }

    /// 2nd order Butterworth lowpass
    pub fn lowpass(freq: f32, sample_rate: f32) -> Self {
        let omega = Self::omega(freq, sample_rate);
        let (sin_w, cos_w) = omega.sin_cos();
        let alpha = sin_w / (2.0 * std::f32::consts::FRAC_1_SQRT_2);

        Self::normalize(
            (1.0 - cos_w) / 2.0,
            1.0 - cos_w,
            (1.0 - cos_w) / 2.0,
            1.0 + alpha,
            -2.0 * cos_w,
            1.0 - alpha,
        )
    }

    /// 2nd order Butterworth highpass
    pub fn highpass(freq: f32, sample_rate: f32) -> Self {
        let omega = Self::omega(freq, sample_rate);
        let (sin_w, cos_w) = omega.sin_cos();
        let alpha = sin_w / (2.0 * std::f32::consts::FRAC_1_SQRT_2);

        Self::normalize(
            (1.0 + cos_w) / 2.0,
            -(1.0 + cos_w),
            (1.0 + cos_w) / 2.0,
            1.0 + alpha,
            -2.0 * cos_w,
            1.0 - alpha,
        )
    }
}

/// Direct form I state for one channel
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct BiquadState {
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

impl BiquadState {
    #[inline]
    pub fn process(&mut self, input: f32, c: &BiquadCoeffs) -> f32 {
        let output = c.b0 * input + c.b1 * self.x1 + c.b2 * self.x2 - c.a1 * self.y1 - c.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = input;
        self.y2 = self.y1;
        self.y1 = output;
        output
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(coeffs: &BiquadCoeffs, input: &[f32]) -> Vec<f32> {
        let mut state = BiquadState::default();
        input.iter().map(|&x| state.process(x, coeffs)).collect()
    }

    #[test]
    fn test_zero_gain_is_unity() {
        assert_eq!(BiquadCoeffs::peaking(1000.0, 0.0, 1.4, 48000.0), BiquadCoeffs::UNITY);
        let input = [0.1, -0.5, 0.9, 0.0];
        assert_eq!(run(&BiquadCoeffs::UNITY, &input), input.to_vec());
    }

    #[test]
    fn test_lowpass_passes_dc() {
        let coeffs = BiquadCoeffs::lowpass(150.0, 48000.0);
        let out = run(&coeffs, &vec![1.0; 48000]);
        assert!((out[out.len() - 1] - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_low_shelf_boosts_dc() {
        let coeffs = BiquadCoeffs::low_shelf(100.0, 6.0, 48000.0);
        let out = run(&coeffs, &vec![0.25; 48000]);
        // +6 dB ~ x2
        assert!((out[out.len() - 1] - 0.5).abs() < 0.01);
    }

    #[test]
    fn test_stable_above_nyquist() {
        let coeffs = BiquadCoeffs::high_shelf(16000.0, 12.0, 8000.0);
        let out = run(&coeffs, &vec![0.5; 8000]);
        assert!(out.iter().all(|s| s.is_finite() && s.abs() < 10.0));
    }
}
