//! Audio engine for Cadenza - sources, buffering, effects and events
//!
//! - AudioEngine: the handle applications hold; wires everything below
//! - EventBus / ErrorManager: typed events and error classification
//! - EngineCore: device connection, master volume, analyser tap
//! - SourceManager / BufferManager: source lifecycle and buffering
//! - EffectsChain: equalizer, compressor, spatializer, limiter
//! - DeviceOutput / SourceLoader: seams for audio output and decoding

mod analyser;
mod buffer;
mod compat;
mod config;
mod core;
mod device;
pub mod effects;
mod engine;
mod error;
mod events;
mod loader;
mod pending;
mod source;
mod source_manager;

pub use analyser::Analyser;
pub use buffer::{BufferManager, BufferState};
pub use compat::{LegacyEvent, LegacyEventBridge};
pub use config::{
    BufferPolicy, EngineConfig, LatencyMode, DEFAULT_BIT_DEPTH, DEFAULT_BUFFER_SIZE,
    DEFAULT_CHANNEL_COUNT, DEFAULT_SAMPLE_RATE,
};
pub use crate::core::{EngineCore, OutputContext, RenderTarget};
pub use device::{
    DeviceErrorSink, DeviceInfo, DeviceOutput, OfflineHandle, OfflineOutput, RenderFn,
};
pub use effects::{EffectKind, EffectsChain, EffectsSettings, EqPreset};
pub use engine::{AudioEngine, EngineState};
pub use error::{DeviceError, EngineError, ErrorContext, ErrorKind, ErrorManager, ErrorRecord};
pub use events::{EngineEvent, EventBus, EventKind, SubscriptionId};
pub use loader::{BackendError, DecodeStream, MemoryLoader, SourceLoader};
pub use pending::Pending;
pub use source::{SourceId, SourceInfo, SourceState, TrackDescriptor};
pub use source_manager::{SourceManager, TransportState};

pub use cadenza_analysis::{Levels, SpectrumData};
