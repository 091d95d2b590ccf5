//! Audio engine - wires the components together behind one handle

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::analyser::Analyser;
use crate::buffer::{BufferManager, BufferState};
use crate::config::{BufferPolicy, EngineConfig};
use crate::core::{EngineCore, RenderTarget};
use crate::device::DeviceOutput;
use crate::effects::EffectsChain;
use crate::error::{EngineError, ErrorManager};
use crate::events::EventBus;
use crate::loader::SourceLoader;
use crate::pending::Pending;
use crate::source::{SourceId, SourceInfo, SourceState, TrackDescriptor};
use crate::source_manager::SourceManager;

/// Snapshot for display; lifecycle changes come from events, not from this
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EngineState {
    pub current_time: f64,
    pub duration: f64,
    pub is_playing: bool,
    pub volume: f32,
    pub muted: bool,
}

/// Sources feeding the effects chain; the core adds the master stage
struct Pipeline {
    sources: Arc<SourceManager>,
    effects: Arc<EffectsChain>,
}

impl RenderTarget for Pipeline {
    fn render(&self, out: &mut [f32], sample_rate: u32) {
        self.sources.render_into(out, sample_rate);
        self.effects.process(out, sample_rate);
    }
}

/// One playback engine: one output, one active source, one effects chain
///
/// Construct one per process and hand references to whatever needs it.
pub struct AudioEngine {
    bus: Arc<EventBus>,
    errors: Arc<ErrorManager>,
    buffers: Arc<BufferManager>,
    sources: Arc<SourceManager>,
    effects: Arc<EffectsChain>,
    core: EngineCore,
    disposed: AtomicBool,
}

impl AudioEngine {
    pub fn new(
        device: Box<dyn DeviceOutput>,
        loader: Arc<dyn SourceLoader>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        Self::with_policy(device, loader, config, BufferPolicy::default())
    }

    pub fn with_policy(
        device: Box<dyn DeviceOutput>,
        loader: Arc<dyn SourceLoader>,
        config: EngineConfig,
        policy: BufferPolicy,
    ) -> Result<Self, EngineError> {
        let bus = Arc::new(EventBus::new());
        let errors = Arc::new(ErrorManager::new(bus.clone()));
        let buffers = Arc::new(BufferManager::new(bus.clone(), policy));
        let sources = SourceManager::new(bus.clone(), errors.clone(), buffers.clone(), loader);
        let effects = Arc::new(EffectsChain::new(config.sample_rate));

        let pipeline = Arc::new(Pipeline {
            sources: sources.clone(),
            effects: effects.clone(),
        });
        let core = EngineCore::new(device, config, bus.clone(), errors.clone(), pipeline)?;

        info!(
            sample_rate = config.sample_rate,
            buffer_size = config.buffer_size,
            "audio engine ready"
        );
        Ok(Self {
            bus,
            errors,
            buffers,
            sources,
            effects,
            core,
            disposed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(EngineError::Disposed);
        }
        Ok(())
    }

    /// Load `descriptor` and start it as soon as enough is buffered
    ///
    /// Starts the output if it is suspended. A load still in flight is
    /// superseded and resolves to `Cancelled`.
    pub fn play(&self, descriptor: impl Into<TrackDescriptor>) -> Pending<SourceId> {
        if let Err(error) = self.ensure_open().and_then(|()| self.core.resume_now()) {
            return Pending::ready(Err(error));
        }
        self.sources
            .create_source(descriptor.into(), self.core.context().sample_rate, true)
    }

    /// Load `descriptor` without starting it
    pub fn load(&self, descriptor: impl Into<TrackDescriptor>) -> Pending<SourceId> {
        if let Err(error) = self.ensure_open() {
            return Pending::ready(Err(error));
        }
        self.sources
            .create_source(descriptor.into(), self.core.context().sample_rate, false)
    }

    pub fn pause(&self) -> Result<(), EngineError> {
        self.ensure_open()?;
        self.sources.pause()
    }

    /// Continue the active source (or start a loaded one)
    pub fn unpause(&self) -> Result<(), EngineError> {
        self.ensure_open()?;
        self.core.resume_now()?;
        self.sources.play()
    }

    /// Flip between playing and paused; returns whether it is now playing
    pub fn toggle(&self) -> Result<bool, EngineError> {
        if self.sources.transport().is_playing {
            self.pause().map(|()| false)
        } else {
            self.unpause().map(|()| true)
        }
    }

    /// Pause, rewind and drop the active source, cancelling any load in
    /// flight. Effects and output settings are kept.
    pub fn stop(&self) {
        if self.ensure_open().is_ok() {
            self.sources.stop();
        }
    }

    /// Returns the position actually reached after clamping
    pub fn seek(&self, seconds: f64) -> Result<f64, EngineError> {
        self.ensure_open()?;
        self.sources.seek(seconds)
    }

    pub fn set_volume(&self, volume: f32) -> Result<(), EngineError> {
        self.core.set_volume(volume)
    }

    pub fn set_muted(&self, muted: bool) {
        self.core.set_muted(muted);
    }

    pub fn get_state(&self) -> EngineState {
        let transport = self.sources.transport();
        EngineState {
            current_time: transport.current_time,
            duration: transport.duration,
            is_playing: transport.is_playing,
            volume: self.core.volume(),
            muted: self.core.is_muted(),
        }
    }

    pub fn effects(&self) -> &EffectsChain {
        &self.effects
    }

    pub fn analyser(&self) -> Arc<Analyser> {
        self.core.analyser()
    }

    /// Output connection: resume/suspend and reconfiguration
    pub fn core(&self) -> &EngineCore {
        &self.core
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn errors(&self) -> &ErrorManager {
        &self.errors
    }

    pub fn active_source(&self) -> Option<SourceInfo> {
        self.sources.active()
    }

    pub fn loading_source(&self) -> Option<SourceInfo> {
        self.sources.loading()
    }

    pub fn source_state(&self, id: SourceId) -> Option<SourceState> {
        self.sources.state(id)
    }

    pub fn buffer_state(&self, id: SourceId) -> Option<BufferState> {
        self.buffers.get_state(id)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Cancel loads, dispose sources, release the device. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sources.dispose_all();
        self.core.close();
        info!("audio engine disposed");
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{OfflineHandle, OfflineOutput};
    use crate::loader::MemoryLoader;
    use std::time::Duration;

    fn engine() -> (AudioEngine, OfflineHandle) {
        let loader = MemoryLoader::new();
        loader.insert_tone("tone.wav", 440.0, 1.0, 0.5, 48000);
        let (output, handle) = OfflineOutput::new();
        let engine = AudioEngine::new(Box::new(output), Arc::new(loader), EngineConfig::default())
            .unwrap();
        (engine, handle)
    }

    #[test]
    fn test_starts_suspended() {
        let (engine, handle) = engine();
        assert!(!engine.core().is_running());
        assert!(!handle.is_running());
        assert_eq!(engine.get_state(), EngineState { volume: 1.0, ..EngineState::default() });
    }

    #[test]
    fn test_play_resumes_output() {
        let (engine, handle) = engine();
        let id = engine
            .play("tone.wav")
            .wait_timeout(Duration::from_secs(5))
            .ok()
            .unwrap()
            .unwrap();
        assert!(handle.is_running());
        assert!(engine.get_state().is_playing);
        assert_eq!(engine.source_state(id), Some(SourceState::Playing));
    }

    #[test]
    fn test_toggle() {
        let (engine, _handle) = engine();
        engine.load("tone.wav").wait().unwrap();
        assert_eq!(engine.toggle(), Ok(true));
        assert_eq!(engine.toggle(), Ok(false));
        assert!(!engine.get_state().is_playing);
    }

    #[test]
    fn test_volume_range() {
        let (engine, _handle) = engine();
        assert!(engine.set_volume(1.5).is_err());
        engine.set_volume(0.25).unwrap();
        engine.set_muted(true);
        let state = engine.get_state();
        assert_eq!(state.volume, 0.25);
        assert!(state.muted);
    }

    #[test]
    fn test_dispose_is_terminal_and_idempotent() {
        let (engine, handle) = engine();
        engine.play("tone.wav").wait().unwrap();
        engine.dispose();
        engine.dispose();
        assert!(engine.is_disposed());
        assert!(!handle.is_open());
        assert!(engine.active_source().is_none());
        assert_eq!(engine.play("tone.wav").wait(), Err(EngineError::Disposed));
        assert_eq!(engine.pause(), Err(EngineError::Disposed));
    }
}
