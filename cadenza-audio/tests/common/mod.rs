//! Shared fixtures: scripted decode backends and an engine on an offline output

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cadenza_audio::{
    AudioEngine, BackendError, DecodeStream, EngineConfig, EngineError, EngineEvent, EventKind,
    OfflineHandle, OfflineOutput, Pending, SourceId, SourceLoader, TrackDescriptor,
};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

pub const TIMEOUT: Duration = Duration::from_secs(5);
pub const RATE: u32 = 48000;

/// How a scripted stream behaves
#[derive(Clone)]
pub struct Script {
    pub frames: usize,
    pub chunk_frames: usize,
    pub sample_rate: u32,
    /// Fail with a decode error once this many chunks have been delivered
    pub fail_after_chunks: Option<usize>,
    /// `open` blocks until this yields
    pub gate: Option<Receiver<()>>,
    /// Signalled when the stream is dropped
    pub dropped: Option<Sender<()>>,
}

impl Script {
    pub fn seconds(seconds: f64) -> Self {
        Self {
            frames: (seconds * f64::from(RATE)) as usize,
            chunk_frames: 4800,
            sample_rate: RATE,
            fail_after_chunks: None,
            gate: None,
            dropped: None,
        }
    }

    pub fn failing_after(mut self, chunks: usize) -> Self {
        self.fail_after_chunks = Some(chunks);
        self
    }

    pub fn chunked(mut self, chunk_frames: usize) -> Self {
        self.chunk_frames = chunk_frames;
        self
    }

    /// Hold `open` until the returned sender fires; the receiver reports when
    /// the stream is dropped
    pub fn gated(mut self) -> (Self, Sender<()>, Receiver<()>) {
        let (open_tx, open_rx) = crossbeam_channel::bounded(1);
        let (drop_tx, drop_rx) = crossbeam_channel::bounded(1);
        self.gate = Some(open_rx);
        self.dropped = Some(drop_tx);
        (self, open_tx, drop_rx)
    }
}

#[derive(Default)]
pub struct ScriptedLoader {
    scripts: Mutex<HashMap<String, Script>>,
}

impl ScriptedLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, locator: &str, script: Script) -> Self {
        self.scripts.lock().insert(locator.to_string(), script);
        self
    }
}

impl SourceLoader for ScriptedLoader {
    fn open(
        &self,
        descriptor: &TrackDescriptor,
        _target_rate: u32,
    ) -> Result<Box<dyn DecodeStream>, BackendError> {
        let script = self
            .scripts
            .lock()
            .get(&descriptor.locator)
            .cloned()
            .ok_or_else(|| BackendError::Unreachable(descriptor.locator.clone()))?;
        if let Some(gate) = &script.gate {
            let _ = gate.recv_timeout(TIMEOUT);
        }
        Ok(Box::new(ScriptedStream {
            script,
            position: 0,
            chunks: 0,
        }))
    }
}

struct ScriptedStream {
    script: Script,
    position: usize,
    chunks: usize,
}

impl DecodeStream for ScriptedStream {
    fn sample_rate(&self) -> u32 {
        self.script.sample_rate
    }

    fn total_frames(&self) -> Option<u64> {
        Some(self.script.frames as u64)
    }

    fn next_chunk(&mut self) -> Result<Option<Vec<f32>>, BackendError> {
        if self.script.fail_after_chunks == Some(self.chunks) {
            return Err(BackendError::Decode("corrupt frame".into()));
        }
        if self.position >= self.script.frames {
            return Ok(None);
        }
        let frames = self.script.chunk_frames.min(self.script.frames - self.position);
        self.position += frames;
        self.chunks += 1;
        Ok(Some(vec![0.25; frames * 2]))
    }
}

impl Drop for ScriptedStream {
    fn drop(&mut self) {
        if let Some(dropped) = &self.script.dropped {
            let _ = dropped.send(());
        }
    }
}

pub struct Harness {
    pub engine: AudioEngine,
    pub output: OfflineHandle,
    pub events: Receiver<EngineEvent>,
}

pub fn harness(loader: impl SourceLoader + 'static) -> Harness {
    let (output, handle) = OfflineOutput::new();
    let engine = AudioEngine::new(Box::new(output), Arc::new(loader), EngineConfig::default())
        .expect("offline output opens");
    let events = engine.events().subscribe();
    Harness {
        engine,
        output: handle,
        events,
    }
}

pub fn resolve<T>(pending: Pending<T>) -> Result<T, EngineError> {
    match pending.wait_timeout(TIMEOUT) {
        Ok(result) => result,
        Err(_) => panic!("operation did not resolve within {TIMEOUT:?}"),
    }
}

pub fn drain(events: &Receiver<EngineEvent>) -> Vec<EngineEvent> {
    events.try_iter().collect()
}

/// Lifecycle events only: source and buffer events without progress
pub fn lifecycle(events: &[EngineEvent]) -> Vec<EventKind> {
    events
        .iter()
        .map(EngineEvent::kind)
        .filter(|kind| {
            let name = kind.as_str();
            (name.starts_with("source:") || name.starts_with("buffer:"))
                && *kind != EventKind::BufferProgress
                && *kind != EventKind::SourceTimeUpdate
        })
        .collect()
}

pub fn for_source(events: &[EngineEvent], id: SourceId) -> Vec<EngineEvent> {
    events
        .iter()
        .filter(|event| event.source_id() == Some(id))
        .cloned()
        .collect()
}

/// Wait for an event matching `pred`, collecting everything seen on the way
pub fn wait_for(
    events: &Receiver<EngineEvent>,
    pred: impl Fn(&EngineEvent) -> bool,
) -> Vec<EngineEvent> {
    let deadline = Instant::now() + TIMEOUT;
    let mut seen = Vec::new();
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match events.recv_timeout(left) {
            Ok(event) => {
                let done = pred(&event);
                seen.push(event);
                if done {
                    return seen;
                }
            }
            Err(_) => break,
        }
    }
    panic!("expected event never arrived; saw {seen:?}");
}

/// Keep rendering small blocks until an event matching `pred` shows up
pub fn pump_until(h: &Harness, pred: impl Fn(&EngineEvent) -> bool) -> Vec<EngineEvent> {
    let deadline = Instant::now() + TIMEOUT;
    let mut seen = Vec::new();
    while Instant::now() < deadline {
        h.output.pump(512);
        for event in h.events.try_iter() {
            let done = pred(&event);
            seen.push(event);
            if done {
                return seen;
            }
        }
        thread::sleep(Duration::from_millis(1));
    }
    panic!("expected event never arrived; saw {seen:?}");
}

/// Block until every frame of the source has been decoded
pub fn wait_buffered(engine: &AudioEngine, id: SourceId) {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if engine
            .buffer_state(id)
            .is_some_and(|state| state.progress_percent >= 100.0)
        {
            return;
        }
        thread::sleep(Duration::from_millis(2));
    }
    panic!("source {id} never finished decoding");
}

pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
}
