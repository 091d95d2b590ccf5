//! Decode backend contract
//!
//! A [`SourceLoader`] turns a track descriptor into a [`DecodeStream`]. The
//! source manager drives the stream on a loader thread, one chunk at a time,
//! checking for cancellation between chunks.

use std::collections::HashMap;
use std::f32::consts::PI;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::debug;

use crate::source::TrackDescriptor;

/// Failures reported by decode backends
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("unreachable: {0}")]
    Unreachable(String),
    #[error("unsupported format: {0}")]
    Unsupported(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for BackendError {
    fn from(err: std::io::Error) -> Self {
        BackendError::Io(err.to_string())
    }
}

/// Streaming decoder for one track
pub trait DecodeStream: Send {
    /// Rate of the samples this stream yields
    fn sample_rate(&self) -> u32;

    /// Total frames, when the container says
    fn total_frames(&self) -> Option<u64>;

    /// Next block of stereo interleaved samples; `Ok(None)` at end of stream
    fn next_chunk(&mut self) -> Result<Option<Vec<f32>>, BackendError>;
}

/// Opens decode streams for descriptors
pub trait SourceLoader: Send + Sync {
    /// `target_rate` is the output rate; backends may resample to it or
    /// leave the stream at its native rate
    fn open(
        &self,
        descriptor: &TrackDescriptor,
        target_rate: u32,
    ) -> Result<Box<dyn DecodeStream>, BackendError>;
}

#[derive(Clone)]
struct Clip {
    samples: Arc<Vec<f32>>,
    sample_rate: u32,
}

/// Serves in-memory stereo clips by locator
pub struct MemoryLoader {
    clips: RwLock<HashMap<String, Clip>>,
    chunk_frames: usize,
}

impl Default for MemoryLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::with_chunk_frames(4096)
    }

    pub fn with_chunk_frames(chunk_frames: usize) -> Self {
        Self {
            clips: RwLock::new(HashMap::new()),
            chunk_frames: chunk_frames.max(1),
        }
    }

    /// Register stereo interleaved samples under `locator`
    pub fn insert(&self, locator: impl Into<String>, samples: Vec<f32>, sample_rate: u32) {
        self.clips.write().insert(
            locator.into(),
            Clip {
                samples: Arc::new(samples),
                sample_rate,
            },
        );
    }

    /// Register a sine tone
    pub fn insert_tone(
        &self,
        locator: impl Into<String>,
        freq: f32,
        seconds: f32,
        amplitude: f32,
        sample_rate: u32,
    ) {
        let frames = (seconds * sample_rate as f32) as usize;
        let samples = (0..frames)
            .flat_map(|i| {
                let s = (2.0 * PI * freq * i as f32 / sample_rate as f32).sin() * amplitude;
                [s, s]
            })
            .collect();
        self.insert(locator, samples, sample_rate);
    }

    pub fn contains(&self, locator: &str) -> bool {
        self.clips.read().contains_key(locator)
    }
}

impl SourceLoader for MemoryLoader {
    fn open(
        &self,
        descriptor: &TrackDescriptor,
        _target_rate: u32,
    ) -> Result<Box<dyn DecodeStream>, BackendError> {
        let clip = self
            .clips
            .read()
            .get(&descriptor.locator)
            .cloned()
            .ok_or_else(|| BackendError::Unreachable(descriptor.locator.clone()))?;
        debug!(locator = %descriptor.locator, frames = clip.samples.len() / 2, "memory clip opened");

        Ok(Box::new(MemoryStream {
            clip,
            position: 0,
            chunk_samples: self.chunk_frames * 2,
        }))
    }
}

struct MemoryStream {
    clip: Clip,
    position: usize,
    chunk_samples: usize,
}

impl DecodeStream for MemoryStream {
    fn sample_rate(&self) -> u32 {
        self.clip.sample_rate
    }

    fn total_frames(&self) -> Option<u64> {
        Some((self.clip.samples.len() / 2) as u64)
    }

    fn next_chunk(&mut self) -> Result<Option<Vec<f32>>, BackendError> {
        let samples = &self.clip.samples;
        if self.position >= samples.len() {
            return Ok(None);
        }
        let end = (self.position + self.chunk_samples).min(samples.len());
        let chunk = samples[self.position..end].to_vec();
        self.position = end;
        Ok(Some(chunk))
    }
}
