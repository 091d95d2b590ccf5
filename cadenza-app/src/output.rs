//! cpal output device
//!
//! cpal streams are not `Send` on every platform, so the stream lives on a
//! dedicated thread and the engine talks to it over a command channel.

use std::thread::{self, JoinHandle};

use cadenza_audio::{DeviceError, DeviceErrorSink, DeviceInfo, DeviceOutput, EngineConfig, RenderFn};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, info, warn};

type Reply<T> = Sender<Result<T, DeviceError>>;

enum Command {
    Open {
        config: EngineConfig,
        render: RenderFn,
        on_error: DeviceErrorSink,
        reply: Reply<DeviceInfo>,
    },
    Start(Reply<()>),
    Stop(Reply<()>),
    Close,
    Shutdown,
}

/// The host's default output device
pub struct CpalOutput {
    name: String,
    commands: Sender<Command>,
    worker: Option<JoinHandle<()>>,
}

impl CpalOutput {
    pub fn new() -> Result<Self, DeviceError> {
        let (commands, rx) = crossbeam_channel::unbounded();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);

        let worker = thread::Builder::new()
            .name("cadenza-output".into())
            .spawn(move || {
                let host = cpal::default_host();
                let Some(device) = host.default_output_device() else {
                    let _ = ready_tx.send(Err(DeviceError::NoDevice));
                    return;
                };
                let name = device.name().unwrap_or_else(|_| "default".to_string());
                let _ = ready_tx.send(Ok(name));
                run_worker(device, rx);
            })
            .map_err(|e| DeviceError::Stream(format!("spawning output thread: {e}")))?;

        let name = ready_rx
            .recv()
            .map_err(|_| DeviceError::Stream("output thread exited".into()))??;
        info!(device = %name, host = ?cpal::default_host().id(), "using output device");

        Ok(Self {
            name,
            commands,
            worker: Some(worker),
        })
    }

    fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, DeviceError> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.commands
            .send(command(tx))
            .map_err(|_| DeviceError::Disconnected("output thread exited".into()))?;
        rx.recv()
            .map_err(|_| DeviceError::Disconnected("output thread exited".into()))?
    }
}

impl DeviceOutput for CpalOutput {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(
        &mut self,
        config: &EngineConfig,
        render: RenderFn,
        on_error: DeviceErrorSink,
    ) -> Result<DeviceInfo, DeviceError> {
        let config = *config;
        self.request(|reply| Command::Open {
            config,
            render,
            on_error,
            reply,
        })
    }

    fn start(&mut self) -> Result<(), DeviceError> {
        self.request(Command::Start)
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        self.request(Command::Stop)
    }

    fn close(&mut self) {
        let _ = self.commands.send(Command::Close);
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run_worker(device: cpal::Device, commands: Receiver<Command>) {
    let mut stream: Option<cpal::Stream> = None;

    for command in commands.iter() {
        match command {
            Command::Open {
                config,
                render,
                on_error,
                reply,
            } => {
                stream = None;
                let result = build_stream(&device, &config, render, on_error).map(|built| {
                    stream = Some(built);
                    DeviceInfo {
                        name: device.name().unwrap_or_else(|_| "default".to_string()),
                        sample_rate: config.sample_rate,
                        channels: config.channel_count,
                        latency: config.target_latency(),
                    }
                });
                let _ = reply.send(result);
            }
            Command::Start(reply) => {
                let result = match &stream {
                    Some(s) => s.play().map_err(play_error),
                    None => Err(DeviceError::Stream("output is not open".into())),
                };
                let _ = reply.send(result);
            }
            Command::Stop(reply) => {
                let result = match &stream {
                    Some(s) => s.pause().map_err(pause_error),
                    None => Ok(()),
                };
                let _ = reply.send(result);
            }
            Command::Close => {
                if stream.take().is_some() {
                    debug!("output stream closed");
                }
            }
            Command::Shutdown => break,
        }
    }
}

fn build_stream(
    device: &cpal::Device,
    config: &EngineConfig,
    render: RenderFn,
    on_error: DeviceErrorSink,
) -> Result<cpal::Stream, DeviceError> {
    let stream_config = cpal::StreamConfig {
        channels: config.channel_count,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Fixed(config.buffer_size),
    };

    let stream = if config.bit_depth == 16 {
        build_typed::<i16>(device, &stream_config, render, on_error)?
    } else {
        build_typed::<f32>(device, &stream_config, render, on_error)?
    };

    // Some hosts start streams on creation; the engine starts it explicitly
    if let Err(e) = stream.pause() {
        debug!(error = %e, "could not pause new stream");
    }
    Ok(stream)
}

fn build_typed<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut render: RenderFn,
    on_error: DeviceErrorSink,
) -> Result<cpal::Stream, DeviceError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = usize::from(config.channels.max(1));
    let mut stereo: Vec<f32> = Vec::with_capacity(config_frames(config) * 2);

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let frames = data.len() / channels;
                // Only grows when the host hands over a larger block than asked
                stereo.resize(frames * 2, 0.0);
                render(&mut stereo);
                write_frames(&stereo, data, channels);
            },
            move |err| {
                warn!(error = %err, "output stream error");
                on_error(stream_error(err));
            },
            None,
        )
        .map_err(build_error)
}

fn config_frames(config: &cpal::StreamConfig) -> usize {
    match config.buffer_size {
        cpal::BufferSize::Fixed(frames) => frames as usize,
        cpal::BufferSize::Default => 4096,
    }
}

/// Map stereo frames onto the device layout: mono downmixes, wider layouts
/// get left/right on the first two channels and silence elsewhere
fn write_frames<T>(stereo: &[f32], data: &mut [T], channels: usize)
where
    T: Sample + FromSample<f32>,
{
    for (frame, out) in stereo.chunks_exact(2).zip(data.chunks_exact_mut(channels)) {
        if channels == 1 {
            out[0] = T::from_sample((frame[0] + frame[1]) * 0.5);
            continue;
        }
        out[0] = T::from_sample(frame[0]);
        out[1] = T::from_sample(frame[1]);
        for sample in &mut out[2..] {
            *sample = T::EQUILIBRIUM;
        }
    }
}

fn build_error(err: cpal::BuildStreamError) -> DeviceError {
    match err {
        cpal::BuildStreamError::DeviceNotAvailable => {
            DeviceError::Disconnected("device not available".into())
        }
        cpal::BuildStreamError::StreamConfigNotSupported => {
            DeviceError::Unsupported("stream configuration not supported".into())
        }
        cpal::BuildStreamError::InvalidArgument => {
            DeviceError::Unsupported("invalid stream argument".into())
        }
        other => DeviceError::Stream(other.to_string()),
    }
}

fn stream_error(err: cpal::StreamError) -> DeviceError {
    match err {
        cpal::StreamError::DeviceNotAvailable => {
            DeviceError::Disconnected("device not available".into())
        }
        other => DeviceError::Stream(other.to_string()),
    }
}

fn play_error(err: cpal::PlayStreamError) -> DeviceError {
    match err {
        cpal::PlayStreamError::DeviceNotAvailable => {
            DeviceError::Disconnected("device not available".into())
        }
        other => DeviceError::Stream(other.to_string()),
    }
}

fn pause_error(err: cpal::PauseStreamError) -> DeviceError {
    match err {
        cpal::PauseStreamError::DeviceNotAvailable => {
            DeviceError::Disconnected("device not available".into())
        }
        other => DeviceError::Stream(other.to_string()),
    }
}
