//! Effects chain: Equalizer -> Compressor -> Spatializer -> Limiter
//!
//! The chain is built once per engine and only parameters and enabled flags
//! change afterwards. Every setter validates first and rejects out-of-range
//! values without touching anything. A disabled module is skipped entirely,
//! so its output is bit-identical to its input.

mod biquad;
mod compressor;
mod equalizer;
mod limiter;
mod spatializer;

use std::fmt;
use std::str::FromStr;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::EngineError;

pub use compressor::{Compressor, CompressorSettings};
pub use equalizer::{
    EqPreset, Equalizer, EqualizerSettings, BAND_COUNT, BAND_FREQUENCIES, MAX_GAIN_DB, MIN_GAIN_DB,
};
pub use limiter::{Limiter, LimiterSettings};
pub use spatializer::{Spatializer, SpatializerSettings, NEUTRAL_WIDTH};

/// Name reported when band values match no preset
pub const CUSTOM_PRESET: &str = "custom";

/// Trait for audio effects
pub trait Effect: Send {
    /// Process audio samples in place (stereo interleaved)
    fn process(&mut self, samples: &mut [f32]);

    /// Reset effect state
    fn reset(&mut self);

    /// Check if effect is enabled
    fn is_enabled(&self) -> bool;

    /// Enable/disable the effect
    fn set_enabled(&mut self, enabled: bool);

    /// Recompute rate-dependent coefficients
    fn set_sample_rate(&mut self, sample_rate: f32);

    /// Get effect name
    fn name(&self) -> &'static str;
}

/// Stage identifiers, in signal order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EffectKind {
    Equalizer,
    Compressor,
    Spatializer,
    Limiter,
}

impl EffectKind {
    pub const CHAIN_ORDER: [EffectKind; 4] = [
        EffectKind::Equalizer,
        EffectKind::Compressor,
        EffectKind::Spatializer,
        EffectKind::Limiter,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EffectKind::Equalizer => "equalizer",
            EffectKind::Compressor => "compressor",
            EffectKind::Spatializer => "spatializer",
            EffectKind::Limiter => "limiter",
        }
    }
}

impl fmt::Display for EffectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EffectKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EffectKind::CHAIN_ORDER
            .into_iter()
            .find(|kind| kind.as_str() == s.trim().to_ascii_lowercase())
            .ok_or_else(|| EngineError::InvalidValue {
                parameter: "effect",
                reason: format!("unknown effect '{s}'"),
            })
    }
}

/// Read access to one stage, tagged by kind
pub enum EffectModule<'a> {
    Equalizer(&'a Equalizer),
    Compressor(&'a Compressor),
    Spatializer(&'a Spatializer),
    Limiter(&'a Limiter),
}

/// Write access to one stage, tagged by kind
pub enum EffectModuleMut<'a> {
    Equalizer(&'a mut Equalizer),
    Compressor(&'a mut Compressor),
    Spatializer(&'a mut Spatializer),
    Limiter(&'a mut Limiter),
}

impl EffectModule<'_> {
    pub fn kind(&self) -> EffectKind {
        match self {
            EffectModule::Equalizer(_) => EffectKind::Equalizer,
            EffectModule::Compressor(_) => EffectKind::Compressor,
            EffectModule::Spatializer(_) => EffectKind::Spatializer,
            EffectModule::Limiter(_) => EffectKind::Limiter,
        }
    }

    pub fn as_effect(&self) -> &dyn Effect {
        match self {
            EffectModule::Equalizer(m) => *m,
            EffectModule::Compressor(m) => *m,
            EffectModule::Spatializer(m) => *m,
            EffectModule::Limiter(m) => *m,
        }
    }
}

/// Snapshot of every stage's parameters, for the shell to persist
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectsSettings {
    pub equalizer: EqualizerSettings,
    pub compressor: CompressorSettings,
    pub spatializer: SpatializerSettings,
    pub limiter: LimiterSettings,
}

struct Chain {
    sample_rate: u32,
    equalizer: Equalizer,
    compressor: Compressor,
    spatializer: Spatializer,
    limiter: Limiter,
}

impl Chain {
    fn stages_mut(&mut self) -> [&mut dyn Effect; 4] {
        [
            &mut self.equalizer,
            &mut self.compressor,
            &mut self.spatializer,
            &mut self.limiter,
        ]
    }

    fn module(&self, kind: EffectKind) -> EffectModule<'_> {
        match kind {
            EffectKind::Equalizer => EffectModule::Equalizer(&self.equalizer),
            EffectKind::Compressor => EffectModule::Compressor(&self.compressor),
            EffectKind::Spatializer => EffectModule::Spatializer(&self.spatializer),
            EffectKind::Limiter => EffectModule::Limiter(&self.limiter),
        }
    }

    fn module_mut(&mut self, kind: EffectKind) -> EffectModuleMut<'_> {
        match kind {
            EffectKind::Equalizer => EffectModuleMut::Equalizer(&mut self.equalizer),
            EffectKind::Compressor => EffectModuleMut::Compressor(&mut self.compressor),
            EffectKind::Spatializer => EffectModuleMut::Spatializer(&mut self.spatializer),
            EffectKind::Limiter => EffectModuleMut::Limiter(&mut self.limiter),
        }
    }

    fn effect_mut(&mut self, kind: EffectKind) -> &mut dyn Effect {
        match kind {
            EffectKind::Equalizer => &mut self.equalizer,
            EffectKind::Compressor => &mut self.compressor,
            EffectKind::Spatializer => &mut self.spatializer,
            EffectKind::Limiter => &mut self.limiter,
        }
    }
}

/// The engine's effect stages, shared between control and render paths
///
/// Default state is transparent: a flat equalizer, everything else bypassed.
pub struct EffectsChain {
    chain: Mutex<Chain>,
}

impl EffectsChain {
    pub fn new(sample_rate: u32) -> Self {
        let rate = sample_rate as f32;
        Self {
            chain: Mutex::new(Chain {
                sample_rate,
                equalizer: Equalizer::new(rate),
                compressor: Compressor::new(rate),
                spatializer: Spatializer::new(rate),
                limiter: Limiter::new(rate),
            }),
        }
    }

    /// Run every enabled stage over a stereo block (render path)
    pub fn process(&self, samples: &mut [f32], sample_rate: u32) {
        let mut chain = self.chain.lock();
        if chain.sample_rate != sample_rate {
            Self::retune(&mut chain, sample_rate);
        }
        for stage in chain.stages_mut() {
            if stage.is_enabled() {
                stage.process(samples);
            }
        }
    }

    fn retune(chain: &mut Chain, sample_rate: u32) {
        debug!(sample_rate, "effects retuned");
        chain.sample_rate = sample_rate;
        for stage in chain.stages_mut() {
            stage.set_sample_rate(sample_rate as f32);
        }
    }

    pub fn set_sample_rate(&self, sample_rate: u32) {
        let mut chain = self.chain.lock();
        if chain.sample_rate != sample_rate {
            Self::retune(&mut chain, sample_rate);
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.chain.lock().sample_rate
    }

    /// Clear filter and envelope state in every stage
    pub fn reset(&self) {
        for stage in self.chain.lock().stages_mut() {
            stage.reset();
        }
    }

    pub fn set_enabled(&self, kind: EffectKind, enabled: bool) {
        let mut chain = self.chain.lock();
        let stage = chain.effect_mut(kind);
        if stage.is_enabled() != enabled {
            debug!(effect = kind.as_str(), enabled, "effect toggled");
            stage.set_enabled(enabled);
        }
    }

    pub fn is_enabled(&self, kind: EffectKind) -> bool {
        self.chain.lock().module(kind).as_effect().is_enabled()
    }

    /// Inspect one stage
    pub fn with_module<R>(&self, kind: EffectKind, f: impl FnOnce(EffectModule<'_>) -> R) -> R {
        f(self.chain.lock().module(kind))
    }

    /// Adjust one stage through its own typed setters
    pub fn with_module_mut<R>(
        &self,
        kind: EffectKind,
        f: impl FnOnce(EffectModuleMut<'_>) -> R,
    ) -> R {
        f(self.chain.lock().module_mut(kind))
    }

    // Equalizer

    pub fn set_band_gain(&self, index: usize, db: f32) -> Result<(), EngineError> {
        self.chain.lock().equalizer.set_band_gain(index, db)
    }

    pub fn set_master_gain(&self, db: f32) -> Result<(), EngineError> {
        self.chain.lock().equalizer.set_master_gain(db)
    }

    pub fn master_gain(&self) -> f32 {
        self.chain.lock().equalizer.master_gain()
    }

    /// Set every band to a named preset in one step
    pub fn apply_preset(&self, name: &str) -> Result<EqPreset, EngineError> {
        let preset: EqPreset = name.parse()?;
        self.chain.lock().equalizer.apply_preset(preset);
        debug!(preset = preset.name(), "equalizer preset applied");
        Ok(preset)
    }

    pub fn band_values(&self) -> Vec<f32> {
        self.chain.lock().equalizer.band_values()
    }

    pub fn set_band_values(&self, values: &[f32]) -> Result<(), EngineError> {
        self.chain.lock().equalizer.set_band_values(values)
    }

    pub fn current_preset(&self) -> Option<EqPreset> {
        self.chain.lock().equalizer.current_preset()
    }

    /// Preset name, or `"custom"`
    pub fn current_preset_name(&self) -> &'static str {
        self.current_preset().map_or(CUSTOM_PRESET, EqPreset::name)
    }

    // Compressor

    pub fn set_threshold(&self, db: f32) -> Result<(), EngineError> {
        self.chain.lock().compressor.set_threshold(db)
    }

    pub fn threshold(&self) -> f32 {
        self.chain.lock().compressor.threshold()
    }

    pub fn set_ratio(&self, ratio: f32) -> Result<(), EngineError> {
        self.chain.lock().compressor.set_ratio(ratio)
    }

    pub fn ratio(&self) -> f32 {
        self.chain.lock().compressor.ratio()
    }

    // Spatializer

    pub fn set_width(&self, width: f32) -> Result<(), EngineError> {
        self.chain.lock().spatializer.set_width(width)
    }

    pub fn width(&self) -> f32 {
        self.chain.lock().spatializer.width()
    }

    // Limiter

    pub fn set_ceiling(&self, db: f32) -> Result<(), EngineError> {
        self.chain.lock().limiter.set_ceiling(db)
    }

    pub fn ceiling(&self) -> f32 {
        self.chain.lock().limiter.ceiling()
    }

    /// Gain reduction for metering; 0 for stages that never reduce gain
    pub fn gain_reduction_db(&self, kind: EffectKind) -> f32 {
        let chain = self.chain.lock();
        match kind {
            EffectKind::Compressor => chain.compressor.gain_reduction_db(),
            EffectKind::Limiter => chain.limiter.gain_reduction_db(),
            EffectKind::Equalizer | EffectKind::Spatializer => 0.0,
        }
    }

    pub fn snapshot(&self) -> EffectsSettings {
        let chain = self.chain.lock();
        EffectsSettings {
            equalizer: chain.equalizer.settings(),
            compressor: chain.compressor.settings(),
            spatializer: chain.spatializer.settings(),
            limiter: chain.limiter.settings(),
        }
    }

    /// Apply a snapshot; rejected as a whole if any value is out of range
    pub fn restore(&self, settings: &EffectsSettings) -> Result<(), EngineError> {
        Equalizer::validate(&settings.equalizer)?;
        Compressor::validate(&settings.compressor)?;
        Spatializer::validate(&settings.spatializer)?;
        Limiter::validate(&settings.limiter)?;

        let mut chain = self.chain.lock();
        chain.equalizer.apply(&settings.equalizer);
        chain.compressor.apply(&settings.compressor);
        chain.spatializer.apply(&settings.spatializer);
        chain.limiter.apply(&settings.limiter);
        debug!("effects settings restored");
        Ok(())
    }
}
