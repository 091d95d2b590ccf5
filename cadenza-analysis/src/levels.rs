//! Peak and RMS level measurement

/// Floor reported for digital silence
pub const SILENCE_DB: f32 = -120.0;

/// Level readings for a block of samples
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Levels {
    /// Absolute peak in dBFS
    pub peak_db: f32,
    /// Root-mean-square level in dBFS
    pub rms_db: f32,
    /// True when any sample reached full scale
    pub clipping: bool,
}

impl Default for Levels {
    fn default() -> Self {
        Self {
            peak_db: SILENCE_DB,
            rms_db: SILENCE_DB,
            clipping: false,
        }
    }
}

/// Convert linear amplitude to dBFS, floored at [`SILENCE_DB`]
#[inline]
pub fn linear_to_db(linear: f32) -> f32 {
    if linear > 1e-6 {
        (20.0 * linear.log10()).max(SILENCE_DB)
    } else {
        SILENCE_DB
    }
}

/// Convert dB to linear amplitude
#[inline]
pub fn db_to_linear(db: f32) -> f32 {
    10.0f32.powf(db / 20.0)
}

/// Measure peak and RMS of a sample block
pub fn measure(samples: &[f32]) -> Levels {
    if samples.is_empty() {
        return Levels::default();
    }

    let mut peak = 0.0f32;
    let mut sum_sq = 0.0f64;
    for &s in samples {
        peak = peak.max(s.abs());
        sum_sq += (s as f64) * (s as f64);
    }
    let rms = (sum_sq / samples.len() as f64).sqrt() as f32;

    Levels {
        peak_db: linear_to_db(peak),
        rms_db: linear_to_db(rms),
        clipping: peak >= 1.0,
    }
}
