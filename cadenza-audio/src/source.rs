//! Track descriptors, source identity and per-source decoded audio

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// What to play. Only `locator` matters to the engine; the rest is carried
/// through untouched for the caller's bookkeeping.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrackDescriptor {
    pub locator: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub artist: Option<String>,
    #[serde(default)]
    pub album: Option<String>,
    #[serde(default)]
    pub artwork: Option<String>,
    /// Known duration in seconds, if the caller has one
    #[serde(default)]
    pub duration: Option<f64>,
    /// Container/codec hint such as `"mp3"` when the locator has no extension
    #[serde(default)]
    pub format_hint: Option<String>,
}

impl TrackDescriptor {
    pub fn new(locator: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            ..Self::default()
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.duration = Some(seconds);
        self
    }

    pub fn with_format_hint(mut self, hint: impl Into<String>) -> Self {
        self.format_hint = Some(hint.into());
        self
    }
}

impl From<&str> for TrackDescriptor {
    fn from(locator: &str) -> Self {
        TrackDescriptor::new(locator)
    }
}

/// Identity of one source; never reused within an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(u64);

impl SourceId {
    pub fn from_raw(raw: u64) -> Self {
        SourceId(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Source lifecycle
///
/// `Idle -> Loading -> Ready -> Playing <-> Paused -> Ended`, `Errored` from
/// any non-terminal state, `Disposed` from anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceState {
    Idle,
    Loading,
    Ready,
    Playing,
    Paused,
    Ended,
    Errored,
    Disposed,
}

impl SourceState {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceState::Idle => "idle",
            SourceState::Loading => "loading",
            SourceState::Ready => "ready",
            SourceState::Playing => "playing",
            SourceState::Paused => "paused",
            SourceState::Ended => "ended",
            SourceState::Errored => "errored",
            SourceState::Disposed => "disposed",
        }
    }

    /// States from which a seek makes sense
    pub fn is_seekable(self) -> bool {
        matches!(self, SourceState::Ready | SourceState::Playing | SourceState::Paused)
    }
}

impl fmt::Display for SourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a source
#[derive(Debug, Clone, PartialEq)]
pub struct SourceInfo {
    pub id: SourceId,
    pub state: SourceState,
    pub descriptor: Arc<TrackDescriptor>,
    /// Seconds
    pub position: f64,
    /// Seconds, when known
    pub duration: Option<f64>,
}

const UNKNOWN_TOTAL: u64 = u64::MAX;

/// Decoded stereo audio for one source, filled by its loader thread
pub(crate) struct StreamBuffer {
    samples: RwLock<Vec<f32>>,
    sample_rate: AtomicU32,
    total_frames: AtomicU64,
    complete: AtomicBool,
}

impl StreamBuffer {
    pub fn new() -> Self {
        Self {
            samples: RwLock::new(Vec::new()),
            sample_rate: AtomicU32::new(0),
            total_frames: AtomicU64::new(UNKNOWN_TOTAL),
            complete: AtomicBool::new(false),
        }
    }

    pub fn set_format(&self, sample_rate: u32, total_frames: Option<u64>) {
        self.sample_rate.store(sample_rate, Ordering::Release);
        self.total_frames
            .store(total_frames.unwrap_or(UNKNOWN_TOTAL), Ordering::Release);
    }

    /// Append stereo samples, returning the frames now available
    pub fn append(&self, chunk: &[f32]) -> u64 {
        let mut samples = self.samples.write();
        // Drop a dangling half frame rather than shift channels
        let whole = chunk.len() - chunk.len() % 2;
        samples.extend_from_slice(&chunk[..whole]);
        (samples.len() / 2) as u64
    }

    /// Mark decoding finished; the decoded extent becomes the total
    pub fn finish(&self) -> u64 {
        let frames = self.frames();
        self.total_frames.store(frames, Ordering::Release);
        self.complete.store(true, Ordering::Release);
        frames
    }

    pub fn frames(&self) -> u64 {
        (self.samples.read().len() / 2) as u64
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Acquire)
    }

    pub fn total_frames(&self) -> Option<u64> {
        match self.total_frames.load(Ordering::Acquire) {
            UNKNOWN_TOTAL => None,
            total => Some(total),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    pub fn samples(&self) -> &RwLock<Vec<f32>> {
        &self.samples
    }
}

/// A live source as tracked by the source manager
pub(crate) struct Source {
    pub id: SourceId,
    pub descriptor: Arc<TrackDescriptor>,
    pub state: SourceState,
    pub buffer: Arc<StreamBuffer>,
    /// Transport position in source frames
    pub position: f64,
    pub cancel: Arc<AtomicBool>,
    pub starved: bool,
    /// Position of the last `source:timeupdate`
    pub last_timeupdate: f64,
}

impl Source {
    pub fn new(id: SourceId, descriptor: Arc<TrackDescriptor>) -> Self {
        Self {
            id,
            descriptor,
            state: SourceState::Idle,
            buffer: Arc::new(StreamBuffer::new()),
            position: 0.0,
            cancel: Arc::new(AtomicBool::new(false)),
            starved: false,
            last_timeupdate: 0.0,
        }
    }

    fn rate(&self) -> f64 {
        f64::from(self.buffer.sample_rate().max(1))
    }

    /// Seconds; decoder total first, then the caller's hint
    pub fn duration(&self) -> Option<f64> {
        self.buffer
            .total_frames()
            .map(|frames| frames as f64 / self.rate())
            .or(self.descriptor.duration.filter(|d| d.is_finite() && *d >= 0.0))
    }

    /// Furthest seekable point in seconds
    pub fn seek_limit(&self) -> f64 {
        self.duration()
            .unwrap_or_else(|| self.buffer.frames() as f64 / self.rate())
    }

    pub fn position_secs(&self) -> f64 {
        self.position / self.rate()
    }

    pub fn set_position_secs(&mut self, seconds: f64) {
        self.position = seconds * self.rate();
        self.last_timeupdate = self.position;
    }

    /// Stop the loader thread, if any is still running
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn info(&self) -> SourceInfo {
        SourceInfo {
            id: self.id,
            state: self.state,
            descriptor: self.descriptor.clone(),
            position: self.position_secs(),
            duration: self.duration(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_append_and_finish() {
        let buffer = StreamBuffer::new();
        buffer.set_format(48000, None);
        assert_eq!(buffer.append(&[0.1, 0.2, 0.3, 0.4, 0.5]), 2);
        assert_eq!(buffer.total_frames(), None);
        assert_eq!(buffer.finish(), 2);
        assert_eq!(buffer.total_frames(), Some(2));
        assert!(buffer.is_complete());
    }

    #[test]
    fn test_duration_sources() {
        let descriptor = Arc::new(TrackDescriptor::new("a.wav").with_duration(12.5));
        let source = Source::new(SourceId::from_raw(1), descriptor);
        source.buffer.set_format(48000, None);
        assert_eq!(source.duration(), Some(12.5));

        source.buffer.set_format(48000, Some(96000));
        assert_eq!(source.duration(), Some(2.0));
    }

    #[test]
    fn test_unusable_duration_hint_ignored() {
        let descriptor = Arc::new(TrackDescriptor::new("a.wav").with_duration(-1.0));
        let source = Source::new(SourceId::from_raw(1), descriptor);
        source.buffer.set_format(1000, None);
        source.buffer.append(&vec![0.0; 500]);
        assert_eq!(source.duration(), None);
        assert_eq!(source.seek_limit(), 0.25);
    }

    #[test]
    fn test_seek_limit_falls_back_to_decoded_extent() {
        let source = Source::new(SourceId::from_raw(1), Arc::new(TrackDescriptor::new("x")));
        source.buffer.set_format(1000, None);
        source.buffer.append(&vec![0.0; 1000]);
        assert_eq!(source.seek_limit(), 0.5);
    }

    #[test]
    fn test_descriptor_serde_defaults() {
        let descriptor: TrackDescriptor =
            serde_json::from_str(r#"{"locator":"track.wav","title":"Intro"}"#).unwrap();
        assert_eq!(descriptor.locator, "track.wav");
        assert_eq!(descriptor.title.as_deref(), Some("Intro"));
        assert!(descriptor.duration.is_none());
    }
}
