//! Engine-wide output configuration

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::EngineError;

pub const DEFAULT_BUFFER_SIZE: u32 = 512;
pub const DEFAULT_SAMPLE_RATE: u32 = 48000;
pub const DEFAULT_BIT_DEPTH: u16 = 24;
pub const DEFAULT_CHANNEL_COUNT: u16 = 2;

pub const MIN_SAMPLE_RATE: u32 = 8000;
pub const MAX_SAMPLE_RATE: u32 = 192000;
pub const MIN_BUFFER_SIZE: u32 = 32;
pub const MAX_BUFFER_SIZE: u32 = 8192;
pub const MAX_CHANNEL_COUNT: u16 = 8;
pub const SUPPORTED_BIT_DEPTHS: [u16; 3] = [16, 24, 32];

/// Trade-off between responsiveness and dropout safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LatencyMode {
    Low,
    #[default]
    Balanced,
    Safe,
}

impl LatencyMode {
    pub fn as_str(self) -> &'static str {
        match self {
            LatencyMode::Low => "low",
            LatencyMode::Balanced => "balanced",
            LatencyMode::Safe => "safe",
        }
    }

    /// Number of device buffers queued ahead of the hardware
    pub fn buffers(self) -> u32 {
        match self {
            LatencyMode::Low => 1,
            LatencyMode::Balanced => 2,
            LatencyMode::Safe => 4,
        }
    }

    /// Latency hint handed to the output device
    pub fn target_latency(self, buffer_size: u32, sample_rate: u32) -> Duration {
        let frames = u64::from(buffer_size) * u64::from(self.buffers());
        Duration::from_micros(frames * 1_000_000 / u64::from(sample_rate.max(1)))
    }
}

impl fmt::Display for LatencyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LatencyMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(LatencyMode::Low),
            "balanced" => Ok(LatencyMode::Balanced),
            "safe" => Ok(LatencyMode::Safe),
            other => Err(EngineError::InvalidValue {
                parameter: "latency_mode",
                reason: format!("unknown latency mode '{other}'"),
            }),
        }
    }
}

/// Output connection parameters
///
/// Changing any field tears down and rebuilds the device connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub sample_rate: u32,
    pub bit_depth: u16,
    pub channel_count: u16,
    pub buffer_size: u32,
    pub latency_mode: LatencyMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            bit_depth: DEFAULT_BIT_DEPTH,
            channel_count: DEFAULT_CHANNEL_COUNT,
            buffer_size: DEFAULT_BUFFER_SIZE,
            latency_mode: LatencyMode::Balanced,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        Self::check_sample_rate(self.sample_rate)?;
        Self::check_bit_depth(self.bit_depth)?;
        Self::check_channel_count(self.channel_count)?;
        Self::check_buffer_size(self.buffer_size)?;
        Ok(())
    }

    pub fn check_sample_rate(rate: u32) -> Result<(), EngineError> {
        EngineError::check_range(
            "sample_rate",
            f64::from(rate),
            f64::from(MIN_SAMPLE_RATE),
            f64::from(MAX_SAMPLE_RATE),
        )
    }

    pub fn check_bit_depth(bits: u16) -> Result<(), EngineError> {
        if SUPPORTED_BIT_DEPTHS.contains(&bits) {
            Ok(())
        } else {
            Err(EngineError::InvalidValue {
                parameter: "bit_depth",
                reason: format!("{bits} is not one of 16, 24, 32"),
            })
        }
    }

    pub fn check_channel_count(channels: u16) -> Result<(), EngineError> {
        EngineError::check_range(
            "channel_count",
            f64::from(channels),
            1.0,
            f64::from(MAX_CHANNEL_COUNT),
        )
    }

    pub fn check_buffer_size(frames: u32) -> Result<(), EngineError> {
        EngineError::check_range(
            "buffer_size",
            f64::from(frames),
            f64::from(MIN_BUFFER_SIZE),
            f64::from(MAX_BUFFER_SIZE),
        )?;
        if !frames.is_power_of_two() {
            return Err(EngineError::InvalidValue {
                parameter: "buffer_size",
                reason: format!("{frames} is not a power of two"),
            });
        }
        Ok(())
    }

    pub fn target_latency(&self) -> Duration {
        self.latency_mode
            .target_latency(self.buffer_size, self.sample_rate)
    }
}

/// Buffering and notification thresholds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferPolicy {
    /// Audio that must be decoded before a loading source becomes ready
    pub prefetch: Duration,
    /// Smallest progress change (percent) worth a `buffer:progress` event
    pub progress_step: f32,
    /// Minimum spacing between throttled progress events
    pub progress_interval: Duration,
    /// Spacing of `source:timeupdate` while playing
    pub timeupdate_interval: Duration,
}

impl Default for BufferPolicy {
    fn default() -> Self {
        Self {
            prefetch: Duration::from_millis(250),
            progress_step: 1.0,
            progress_interval: Duration::from_millis(100),
            timeupdate_interval: Duration::from_millis(250),
        }
    }
}

impl BufferPolicy {
    /// Frames that satisfy the prefetch threshold at `sample_rate`
    pub fn prefetch_frames(&self, sample_rate: u32) -> u64 {
        (self.prefetch.as_secs_f64() * f64::from(sample_rate)).ceil() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.buffer_size, 512);
        assert_eq!(config.sample_rate, 48000);
        assert_eq!(config.bit_depth, 24);
        assert_eq!(config.channel_count, 2);
        assert_eq!(config.latency_mode, LatencyMode::Balanced);
    }

    #[test]
    fn test_invalid_values() {
        assert!(EngineConfig::check_sample_rate(4000).is_err());
        assert!(EngineConfig::check_sample_rate(384000).is_err());
        assert!(EngineConfig::check_bit_depth(20).is_err());
        assert!(EngineConfig::check_channel_count(0).is_err());
        assert!(EngineConfig::check_buffer_size(500).is_err());
        assert!(EngineConfig::check_buffer_size(16).is_err());
        assert!(EngineConfig::check_buffer_size(1024).is_ok());
    }

    #[test]
    fn test_latency_scales_with_mode() {
        let low = LatencyMode::Low.target_latency(512, 48000);
        let safe = LatencyMode::Safe.target_latency(512, 48000);
        assert_eq!(low, Duration::from_micros(10_666));
        assert_eq!(safe, Duration::from_micros(42_666));
        assert_eq!("SAFE".parse::<LatencyMode>().ok(), Some(LatencyMode::Safe));
    }

    #[test]
    fn test_prefetch_frames() {
        assert_eq!(BufferPolicy::default().prefetch_frames(48000), 12000);
    }
}
