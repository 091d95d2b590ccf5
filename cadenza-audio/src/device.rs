//! Output device contract
//!
//! The engine drives a platform audio output through [`DeviceOutput`]. The
//! device pulls audio by calling the render function it was opened with; the
//! render function always fills stereo interleaved `f32` frames at the
//! device's sample rate, and the device maps those onto its own channel
//! layout and sample format.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::DeviceError;

/// Pull callback invoked by the device for every output block
pub type RenderFn = Box<dyn FnMut(&mut [f32]) + Send>;

/// Asynchronous device failures (stream errors, disconnects)
pub type DeviceErrorSink = Arc<dyn Fn(DeviceError) + Send + Sync>;

/// What the device actually opened with
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub name: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub latency: Duration,
}

/// Platform audio output driven by the engine core
pub trait DeviceOutput: Send {
    fn name(&self) -> &str;

    /// Build the output connection, suspended
    fn open(
        &mut self,
        config: &EngineConfig,
        render: RenderFn,
        on_error: DeviceErrorSink,
    ) -> Result<DeviceInfo, DeviceError>;

    /// Start pulling audio
    fn start(&mut self) -> Result<(), DeviceError>;

    /// Stop pulling audio; the connection stays open
    fn stop(&mut self) -> Result<(), DeviceError>;

    /// Tear the connection down; a closed device may be opened again
    fn close(&mut self);
}

struct OfflineState {
    render: Option<RenderFn>,
    on_error: Option<DeviceErrorSink>,
    generation: u64,
    open: bool,
    running: bool,
    sample_rate: u32,
    opened: usize,
    fail_next_open: Option<DeviceError>,
    fail_next_start: Option<DeviceError>,
}

/// Device that renders only when asked, for tests and offline bouncing
pub struct OfflineOutput {
    state: Arc<Mutex<OfflineState>>,
}

/// Test-side handle to an [`OfflineOutput`]
#[derive(Clone)]
pub struct OfflineHandle {
    state: Arc<Mutex<OfflineState>>,
}

impl OfflineOutput {
    pub fn new() -> (OfflineOutput, OfflineHandle) {
        let state = Arc::new(Mutex::new(OfflineState {
            render: None,
            on_error: None,
            generation: 0,
            open: false,
            running: false,
            sample_rate: 0,
            opened: 0,
            fail_next_open: None,
            fail_next_start: None,
        }));
        (
            OfflineOutput {
                state: state.clone(),
            },
            OfflineHandle { state },
        )
    }
}

impl DeviceOutput for OfflineOutput {
    fn name(&self) -> &str {
        "offline"
    }

    fn open(
        &mut self,
        config: &EngineConfig,
        render: RenderFn,
        on_error: DeviceErrorSink,
    ) -> Result<DeviceInfo, DeviceError> {
        let mut state = self.state.lock();
        if let Some(err) = state.fail_next_open.take() {
            return Err(err);
        }
        state.render = Some(render);
        state.on_error = Some(on_error);
        state.generation += 1;
        state.open = true;
        state.running = false;
        state.sample_rate = config.sample_rate;
        state.opened += 1;
        debug!(sample_rate = config.sample_rate, "offline output opened");

        Ok(DeviceInfo {
            name: "offline".to_string(),
            sample_rate: config.sample_rate,
            channels: config.channel_count,
            latency: config.target_latency(),
        })
    }

    fn start(&mut self) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(DeviceError::Stream("output is not open".into()));
        }
        if let Some(err) = state.fail_next_start.take() {
            return Err(err);
        }
        state.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        self.state.lock().running = false;
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.state.lock();
        state.render = None;
        state.on_error = None;
        state.generation += 1;
        state.open = false;
        state.running = false;
    }
}

impl OfflineHandle {
    /// Render `frames` stereo frames; silence while suspended or closed
    pub fn pump(&self, frames: usize) -> Vec<f32> {
        let mut out = vec![0.0f32; frames * 2];

        // Render without the lock held: the render path may emit events whose
        // handlers reconfigure (close/reopen) this very device.
        let (mut render, generation) = {
            let mut state = self.state.lock();
            if !state.running {
                return out;
            }
            match state.render.take() {
                Some(render) => (render, state.generation),
                None => return out,
            }
        };

        render(&mut out);

        let mut state = self.state.lock();
        if state.generation == generation && state.render.is_none() {
            state.render = Some(render);
        }
        out
    }

    /// Pump in device-sized blocks
    pub fn pump_blocks(&self, blocks: usize, block_frames: usize) -> Vec<f32> {
        let mut out = Vec::with_capacity(blocks * block_frames * 2);
        for _ in 0..blocks {
            out.extend(self.pump(block_frames));
        }
        out
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    pub fn sample_rate(&self) -> u32 {
        self.state.lock().sample_rate
    }

    /// How many times the device has been opened
    pub fn open_count(&self) -> usize {
        self.state.lock().opened
    }

    /// Make the next `open` fail
    pub fn fail_next_open(&self, error: DeviceError) {
        self.state.lock().fail_next_open = Some(error);
    }

    /// Make the next `start` fail
    pub fn fail_next_start(&self, error: DeviceError) {
        self.state.lock().fail_next_start = Some(error);
    }

    /// Behave like an unplugged output: stop and report the loss
    pub fn simulate_disconnect(&self) {
        let sink = {
            let mut state = self.state.lock();
            state.running = false;
            state.on_error.clone()
        };
        info!("offline output disconnected");
        if let Some(sink) = sink {
            sink(DeviceError::Disconnected("output device removed".into()));
        }
    }
}
