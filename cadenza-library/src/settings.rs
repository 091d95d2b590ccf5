//! Player settings persistence
//!
//! Stores the output defaults and initial volume in a simple `key=value`
//! file. The engine itself persists nothing; the player reads this once at
//! startup and hands the values to the engine.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use cadenza_audio::EngineConfig;
use tracing::warn;

/// Startup settings for the player
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerSettings {
    pub engine: EngineConfig,
    /// Initial master volume, 0.0 to 1.0
    pub volume: f32,
    pub muted: bool,
    /// Equalizer preset applied at startup
    pub eq_preset: Option<String>,
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            volume: 1.0,
            muted: false,
            eq_preset: None,
        }
    }
}

impl PlayerSettings {
    /// Load settings from the default location
    ///
    /// Returns defaults if the file doesn't exist or can't be read.
    pub fn load() -> Self {
        Self::load_from(&Self::settings_path()).unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> io::Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(Self::parse(&content))
    }

    pub fn save(&self) -> io::Result<()> {
        self.save_to(&Self::settings_path())
    }

    pub fn save_to(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.serialize())
    }

    pub fn settings_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cadenza")
            .join("player.conf")
    }

    /// Parse `key=value` lines. Unknown keys are ignored; malformed or
    /// out-of-range values keep the default.
    pub fn parse(content: &str) -> Self {
        let mut settings = Self::default();
        let defaults = EngineConfig::default();

        for (number, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                warn!(line = number + 1, "ignoring settings line without '='");
                continue;
            };
            let (key, value) = (key.trim(), value.trim());

            match key {
                "sample_rate" => {
                    settings.engine.sample_rate = parse_checked(key, value, defaults.sample_rate, |v| {
                        EngineConfig::check_sample_rate(*v).is_ok()
                    })
                }
                "bit_depth" => {
                    settings.engine.bit_depth = parse_checked(key, value, defaults.bit_depth, |v| {
                        EngineConfig::check_bit_depth(*v).is_ok()
                    })
                }
                "channels" => {
                    settings.engine.channel_count =
                        parse_checked(key, value, defaults.channel_count, |v| {
                            EngineConfig::check_channel_count(*v).is_ok()
                        })
                }
                "buffer_size" => {
                    settings.engine.buffer_size = parse_checked(key, value, defaults.buffer_size, |v| {
                        EngineConfig::check_buffer_size(*v).is_ok()
                    })
                }
                "latency" => {
                    settings.engine.latency_mode =
                        parse_checked(key, value, defaults.latency_mode, |_| true)
                }
                "volume" => {
                    settings.volume =
                        parse_checked(key, value, 1.0, |v: &f32| (0.0..=1.0).contains(v))
                }
                "muted" => settings.muted = parse_checked(key, value, false, |_| true),
                "eq_preset" => {
                    if !value.is_empty() {
                        settings.eq_preset = Some(value.to_string());
                    }
                }
                _ => {}
            }
        }

        settings
    }

    pub fn serialize(&self) -> String {
        let mut lines = vec![
            "# Cadenza player settings".to_string(),
            format!("sample_rate={}", self.engine.sample_rate),
            format!("bit_depth={}", self.engine.bit_depth),
            format!("channels={}", self.engine.channel_count),
            format!("buffer_size={}", self.engine.buffer_size),
            format!("latency={}", self.engine.latency_mode),
            format!("volume={}", self.volume),
            format!("muted={}", self.muted),
        ];
        if let Some(ref preset) = self.eq_preset {
            lines.push(format!("eq_preset={preset}"));
        }
        lines.join("\n")
    }
}

fn parse_checked<T>(key: &str, value: &str, default: T, valid: impl Fn(&T) -> bool) -> T
where
    T: FromStr + std::fmt::Display,
{
    match value.parse::<T>() {
        Ok(parsed) if valid(&parsed) => parsed,
        _ => {
            warn!(key, value, fallback = %default, "invalid setting, using default");
            default
        }
    }
}
