//! Engine core - output device connection, master stage and configuration
//!
//! The core is the only component that touches the device. Reconfiguration
//! tears the connection down and rebuilds it around the same render target,
//! so whatever the target is playing carries on at its current position.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::analyser::Analyser;
use crate::config::{EngineConfig, LatencyMode};
use crate::device::{DeviceErrorSink, DeviceOutput, RenderFn};
use crate::error::{DeviceError, EngineError, ErrorContext, ErrorManager};
use crate::events::{EngineEvent, EventBus};
use crate::pending::Pending;

/// Smoothing coefficient for master gain (~5ms at 48kHz)
const MASTER_SMOOTH_COEFF: f32 = 0.995;

/// Whatever produces the pre-master signal
pub trait RenderTarget: Send + Sync {
    /// Fill `out` with stereo interleaved frames at `sample_rate`
    fn render(&self, out: &mut [f32], sample_rate: u32);
}

/// Identity and format of the current output connection
///
/// `id` changes every time the connection is rebuilt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputContext {
    pub id: u64,
    pub sample_rate: u32,
    pub channels: u16,
    pub latency: Duration,
}

/// Volume and mute shared with the render path
struct Master {
    volume: AtomicU32,
    muted: AtomicBool,
}

impl Master {
    fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }

    fn target_gain(&self) -> f32 {
        if self.muted.load(Ordering::Relaxed) {
            0.0
        } else {
            self.volume()
        }
    }
}

/// Owns the device connection, master volume/mute and the analyser tap
pub struct EngineCore {
    bus: Arc<EventBus>,
    errors: Arc<ErrorManager>,
    device: Mutex<Box<dyn DeviceOutput>>,
    /// Serializes reconfigurations against each other (and resume/suspend)
    reconfig: Mutex<()>,
    config: Mutex<EngineConfig>,
    context: Mutex<OutputContext>,
    target: Arc<dyn RenderTarget>,
    master: Arc<Master>,
    analyser: Arc<Analyser>,
    current_rate: Arc<AtomicU32>,
    generation: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    lost: Arc<Mutex<Option<DeviceError>>>,
    closed: AtomicBool,
}

impl EngineCore {
    /// Open the device (suspended) around `target`
    pub fn new(
        device: Box<dyn DeviceOutput>,
        config: EngineConfig,
        bus: Arc<EventBus>,
        errors: Arc<ErrorManager>,
        target: Arc<dyn RenderTarget>,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let core = Self {
            bus,
            errors,
            device: Mutex::new(device),
            reconfig: Mutex::new(()),
            config: Mutex::new(config),
            context: Mutex::new(OutputContext {
                id: 0,
                sample_rate: config.sample_rate,
                channels: config.channel_count,
                latency: config.target_latency(),
            }),
            target,
            master: Arc::new(Master {
                volume: AtomicU32::new(1.0f32.to_bits()),
                muted: AtomicBool::new(false),
            }),
            analyser: Arc::new(Analyser::new(config.sample_rate)),
            current_rate: Arc::new(AtomicU32::new(config.sample_rate)),
            generation: Arc::new(AtomicU64::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            lost: Arc::new(Mutex::new(None)),
            closed: AtomicBool::new(false),
        };

        {
            let mut device = core.device.lock();
            core.open_device(&mut **device, &config)?;
        }
        Ok(core)
    }

    fn render_fn(&self) -> RenderFn {
        let target = self.target.clone();
        let master = self.master.clone();
        let analyser = self.analyser.clone();
        let rate = self.current_rate.clone();
        let mut gain = master.target_gain();

        Box::new(move |out: &mut [f32]| {
            target.render(out, rate.load(Ordering::Relaxed));

            let goal = master.target_gain();
            for frame in out.chunks_exact_mut(2) {
                gain = MASTER_SMOOTH_COEFF * gain + (1.0 - MASTER_SMOOTH_COEFF) * goal;
                if (gain - goal).abs() < 1e-5 {
                    gain = goal;
                }
                frame[0] *= gain;
                frame[1] *= gain;
            }

            analyser.push(out);
        })
    }

    fn error_sink(&self, generation: u64) -> DeviceErrorSink {
        let bus = self.bus.clone();
        let errors = self.errors.clone();
        let running = self.running.clone();
        let lost = self.lost.clone();
        let current = self.generation.clone();

        Arc::new(move |error: DeviceError| {
            if current.load(Ordering::SeqCst) != generation {
                debug!(%error, "ignoring error from a closed connection");
                return;
            }
            {
                let mut lost = lost.lock();
                if lost.is_some() {
                    return;
                }
                *lost = Some(error.clone());
            }
            running.store(false, Ordering::SeqCst);
            errors.handle_error(&EngineError::Device(error), ErrorContext::engine("output"));
            bus.emit(EngineEvent::StateChange { running: false });
        })
    }

    fn open_device(
        &self,
        device: &mut dyn DeviceOutput,
        config: &EngineConfig,
    ) -> Result<OutputContext, EngineError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let info = device.open(config, self.render_fn(), self.error_sink(generation))?;

        self.current_rate.store(info.sample_rate, Ordering::Relaxed);
        self.analyser.set_sample_rate(info.sample_rate);

        let context = OutputContext {
            id: generation,
            sample_rate: info.sample_rate,
            channels: info.channels,
            latency: info.latency,
        };
        *self.context.lock() = context;

        info!(
            device = %info.name,
            sample_rate = info.sample_rate,
            channels = info.channels,
            latency_ms = info.latency.as_millis() as u64,
            "output connected"
        );
        Ok(context)
    }

    fn ensure_usable(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Disposed);
        }
        if let Some(error) = self.lost.lock().clone() {
            return Err(EngineError::Device(error));
        }
        Ok(())
    }

    /// Start the output; a no-op when already running
    pub fn resume(&self) -> Pending<()> {
        Pending::ready(self.resume_now())
    }

    pub(crate) fn resume_now(&self) -> Result<(), EngineError> {
        self.ensure_usable()?;
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        {
            let _serial = self.reconfig.lock();
            if self.running.load(Ordering::SeqCst) {
                return Ok(());
            }
            self.device.lock().start()?;
            self.running.store(true, Ordering::SeqCst);
        }

        debug!("output resumed");
        self.bus.emit(EngineEvent::StateChange { running: true });
        Ok(())
    }

    /// Stop pulling audio; a no-op when already suspended
    pub fn suspend(&self) -> Pending<()> {
        Pending::ready(self.suspend_now())
    }

    fn suspend_now(&self) -> Result<(), EngineError> {
        self.ensure_usable()?;
        {
            let _serial = self.reconfig.lock();
            if !self.running.load(Ordering::SeqCst) {
                return Ok(());
            }
            self.device.lock().stop()?;
            self.running.store(false, Ordering::SeqCst);
        }

        debug!("output suspended");
        self.bus.emit(EngineEvent::StateChange { running: false });
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// True once the output connection has been lost
    pub fn is_lost(&self) -> bool {
        self.lost.lock().is_some()
    }

    pub fn set_volume(&self, volume: f32) -> Result<(), EngineError> {
        EngineError::check_range("volume", f64::from(volume), 0.0, 1.0)?;
        let previous = self.master.volume.swap(volume.to_bits(), Ordering::Relaxed);
        if f32::from_bits(previous) != volume {
            self.bus.emit(EngineEvent::VolumeChange {
                volume,
                muted: self.is_muted(),
            });
        }
        Ok(())
    }

    pub fn volume(&self) -> f32 {
        self.master.volume()
    }

    pub fn set_muted(&self, muted: bool) {
        if self.master.muted.swap(muted, Ordering::Relaxed) != muted {
            self.bus.emit(EngineEvent::VolumeChange {
                volume: self.volume(),
                muted,
            });
        }
    }

    pub fn is_muted(&self) -> bool {
        self.master.muted.load(Ordering::Relaxed)
    }

    pub fn analyser(&self) -> Arc<Analyser> {
        self.analyser.clone()
    }

    pub fn context(&self) -> OutputContext {
        *self.context.lock()
    }

    pub fn config(&self) -> EngineConfig {
        *self.config.lock()
    }

    pub fn set_buffer_size(&self, frames: u32) -> Pending<OutputContext> {
        self.reconfigure(EngineConfig::check_buffer_size(frames), |c| c.buffer_size = frames)
    }

    pub fn set_sample_rate(&self, rate: u32) -> Pending<OutputContext> {
        self.reconfigure(EngineConfig::check_sample_rate(rate), |c| c.sample_rate = rate)
    }

    pub fn set_bit_depth(&self, bits: u16) -> Pending<OutputContext> {
        self.reconfigure(EngineConfig::check_bit_depth(bits), |c| c.bit_depth = bits)
    }

    pub fn set_channel_count(&self, channels: u16) -> Pending<OutputContext> {
        self.reconfigure(EngineConfig::check_channel_count(channels), |c| {
            c.channel_count = channels
        })
    }

    pub fn set_latency_hint(&self, mode: LatencyMode) -> Pending<OutputContext> {
        self.reconfigure(Ok(()), |c| c.latency_mode = mode)
    }

    /// Restore 512 frames, 48 kHz, 24 bit, stereo, balanced latency
    pub fn reset_buffer_settings(&self) -> Pending<OutputContext> {
        self.reconfigure(Ok(()), |c| *c = EngineConfig::default())
    }

    fn reconfigure(
        &self,
        check: Result<(), EngineError>,
        apply: impl FnOnce(&mut EngineConfig),
    ) -> Pending<OutputContext> {
        Pending::ready(check.and_then(|()| self.reconfigure_now(apply)))
    }

    fn reconfigure_now(
        &self,
        apply: impl FnOnce(&mut EngineConfig),
    ) -> Result<OutputContext, EngineError> {
        self.ensure_usable()?;
        let _serial = self.reconfig.lock();

        let current = self.config();
        let mut next = current;
        apply(&mut next);
        if next == current {
            return Ok(self.context());
        }

        let was_running = self.running.load(Ordering::SeqCst);
        let result = self.swap_device(&current, &next, was_running);
        if was_running && !self.running.load(Ordering::SeqCst) {
            warn!("output left stopped after reconfiguration");
            self.bus.emit(EngineEvent::StateChange { running: false });
        }
        let context = result?;

        info!(
            sample_rate = next.sample_rate,
            bit_depth = next.bit_depth,
            channels = next.channel_count,
            buffer_size = next.buffer_size,
            latency = next.latency_mode.as_str(),
            "output reconfigured"
        );
        self.bus.emit(EngineEvent::Reconfigured { context });
        Ok(context)
    }

    /// Reopen the device at `next`, falling back to `current` when the
    /// device refuses; restarts the output if it was running
    fn swap_device(
        &self,
        current: &EngineConfig,
        next: &EngineConfig,
        was_running: bool,
    ) -> Result<OutputContext, EngineError> {
        let mut device = self.device.lock();
        if was_running {
            if let Err(error) = device.stop() {
                warn!(%error, "stop before reconfiguration failed");
            }
        }
        device.close();

        let context = match self.open_device(&mut **device, next) {
            Ok(context) => context,
            Err(error) => {
                warn!(%error, "reconfiguration rejected by device, restoring previous settings");
                self.running.store(false, Ordering::SeqCst);
                self.open_device(&mut **device, current)?;
                if was_running {
                    device.start()?;
                    self.running.store(true, Ordering::SeqCst);
                }
                return Err(error);
            }
        };
        *self.config.lock() = *next;

        if was_running {
            if let Err(error) = device.start() {
                self.running.store(false, Ordering::SeqCst);
                return Err(error.into());
            }
        }
        Ok(context)
    }

    /// Release the device; the core is unusable afterwards
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _serial = self.reconfig.lock();
        let mut device = self.device.lock();
        if self.running.swap(false, Ordering::SeqCst) {
            if let Err(error) = device.stop() {
                debug!(%error, "stop during close failed");
            }
        }
        device.close();
        // Errors from the torn-down connection are stale from now on.
        self.generation.fetch_add(1, Ordering::SeqCst);
        info!("output released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{OfflineHandle, OfflineOutput};
    use crate::events::EventKind;

    struct Constant(f32);

    impl RenderTarget for Constant {
        fn render(&self, out: &mut [f32], _sample_rate: u32) {
            out.fill(self.0);
        }
    }

    fn core() -> (EngineCore, OfflineHandle, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        let errors = Arc::new(ErrorManager::new(bus.clone()));
        let (output, handle) = OfflineOutput::new();
        let core = EngineCore::new(
            Box::new(output),
            EngineConfig::default(),
            bus.clone(),
            errors,
            Arc::new(Constant(0.5)),
        )
        .unwrap();
        (core, handle, bus)
    }

    #[test]
    fn test_opens_suspended() {
        let (core, handle, _bus) = core();
        assert!(handle.is_open());
        assert!(!core.is_running());
        assert!(handle.pump(8).iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_resume_twice_is_noop() {
        let (core, handle, bus) = core();
        let rx = bus.subscribe_to(&[EventKind::StateChange]);
        core.resume().wait().unwrap();
        core.resume().wait().unwrap();
        assert_eq!(rx.try_iter().count(), 1);
        assert_eq!(handle.pump(4), vec![0.5; 8]);
    }

    #[test]
    fn test_volume_range_and_smoothing() {
        let (core, handle, _bus) = core();
        core.resume().wait().unwrap();
        assert!(core.set_volume(1.5).is_err());
        assert_eq!(core.volume(), 1.0);

        core.set_volume(0.0).unwrap();
        let out = handle.pump(4800);
        // Ramps down rather than stepping
        assert!(out[0] > 0.4);
        assert!(out[out.len() - 1].abs() < 1e-3);
    }

    #[test]
    fn test_mute_silences_output() {
        let (core, handle, _bus) = core();
        core.resume().wait().unwrap();
        core.set_muted(true);
        let out = handle.pump(4800);
        assert_eq!(out[out.len() - 1], 0.0);
        assert!(core.is_muted());
    }

    #[test]
    fn test_reconfigure_rebuilds_connection() {
        let (core, handle, bus) = core();
        let rx = bus.subscribe_to(&[EventKind::Reconfigured]);
        core.resume().wait().unwrap();
        let before = core.context();

        let context = core.set_sample_rate(44100).wait().unwrap();
        assert_eq!(context.sample_rate, 44100);
        assert_ne!(context.id, before.id);
        assert_eq!(handle.open_count(), 2);
        assert!(core.is_running());
        assert_eq!(core.analyser().sample_rate(), 44100);
        assert_eq!(rx.try_iter().count(), 1);

        // Same value again: nothing to rebuild
        core.set_sample_rate(44100).wait().unwrap();
        assert_eq!(handle.open_count(), 2);
    }

    #[test]
    fn test_invalid_setting_changes_nothing() {
        let (core, handle, bus) = core();
        let rx = bus.subscribe();
        assert!(core.set_buffer_size(1000).wait().is_err());
        assert!(core.set_bit_depth(12).wait().is_err());
        assert_eq!(core.config(), EngineConfig::default());
        assert_eq!(handle.open_count(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_reset_buffer_settings() {
        let (core, _handle, _bus) = core();
        core.set_buffer_size(2048).wait().unwrap();
        core.set_latency_hint(LatencyMode::Safe).wait().unwrap();
        core.reset_buffer_settings().wait().unwrap();
        assert_eq!(core.config(), EngineConfig::default());
    }

    #[test]
    fn test_rejected_device_config_restores_previous() {
        let (core, handle, _bus) = core();
        core.resume().wait().unwrap();
        handle.fail_next_open(DeviceError::Unsupported("no 8 channel output".into()));

        assert!(core.set_channel_count(8).wait().is_err());
        assert_eq!(core.config().channel_count, 2);
        assert!(core.is_running());
        assert_eq!(handle.pump(2), vec![0.5; 4]);
    }

    #[test]
    fn test_restart_failure_after_reconfigure_reports_stopped() {
        let (core, handle, bus) = core();
        let rx = bus.subscribe_to(&[EventKind::StateChange, EventKind::Reconfigured]);
        core.resume().wait().unwrap();
        rx.try_iter().for_each(drop);
        handle.fail_next_start(DeviceError::Stream("stream refused to start".into()));

        assert!(core.set_buffer_size(1024).wait().is_err());
        assert!(!core.is_running());
        assert!(!handle.is_running());
        assert_eq!(
            rx.try_iter().collect::<Vec<_>>(),
            vec![EngineEvent::StateChange { running: false }]
        );

        // The output can be started again by hand
        core.resume().wait().unwrap();
        assert!(core.is_running());
    }

    #[test]
    fn test_device_loss_is_terminal() {
        let (core, handle, bus) = core();
        let rx = bus.subscribe_to(&[EventKind::Error]);
        core.resume().wait().unwrap();
        handle.simulate_disconnect();

        assert!(core.is_lost());
        assert!(!core.is_running());
        assert!(matches!(
            rx.try_recv(),
            Ok(EngineEvent::Error {
                recoverable: false,
                ..
            })
        ));
        assert!(matches!(core.resume().wait(), Err(EngineError::Device(_))));
        assert!(matches!(
            core.set_sample_rate(44100).wait(),
            Err(EngineError::Device(_))
        ));
    }

    #[test]
    fn test_close_releases_device() {
        let (core, handle, _bus) = core();
        core.resume().wait().unwrap();
        core.close();
        core.close();
        assert!(!handle.is_open());
        assert_eq!(core.resume().wait(), Err(EngineError::Disposed));
    }
}
