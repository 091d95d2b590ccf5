//! Symphonia decode backend
//!
//! Opens local files, decodes them packet by packet and hands the engine
//! stereo interleaved `f32` chunks. When the file's rate differs from the
//! engine rate the stream is resampled on the fly with rubato.

use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use cadenza_audio::{BackendError, DecodeStream, SourceLoader, TrackDescriptor};
use rubato::{FftFixedIn, Resampler};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, trace, warn};

/// Consecutive undecodable packets tolerated before the stream fails
pub const MAX_BAD_PACKETS: usize = 8;

/// Input block handed to the resampler, in frames
const RESAMPLE_CHUNK: usize = 1024;

/// [`SourceLoader`] for files on the local filesystem
#[derive(Debug, Clone)]
pub struct SymphoniaLoader {
    resample: bool,
}

impl Default for SymphoniaLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl SymphoniaLoader {
    /// Loader that resamples every stream to the engine rate
    pub fn new() -> Self {
        Self { resample: true }
    }

    /// Loader that leaves streams at their native rate; the engine then
    /// converts rates while rendering
    pub fn native_rate() -> Self {
        Self { resample: false }
    }

    /// Open a stream directly, without going through the engine
    pub fn open_path(&self, path: &Path, target_rate: u32) -> Result<SymphoniaStream, BackendError> {
        let descriptor = TrackDescriptor::new(path.to_string_lossy());
        self.open_stream(&descriptor, target_rate)
    }

    fn open_stream(
        &self,
        descriptor: &TrackDescriptor,
        target_rate: u32,
    ) -> Result<SymphoniaStream, BackendError> {
        let path = locator_path(&descriptor.locator);
        let file = File::open(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound | ErrorKind::PermissionDenied => {
                BackendError::Unreachable(format!("{}: {e}", path.display()))
            }
            _ => BackendError::from(e),
        })?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }
        if let Some(format) = descriptor.format_hint.as_deref() {
            if format.contains('/') {
                hint.mime_type(format);
            } else {
                hint.with_extension(format);
            }
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(open_error)?;
        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| BackendError::Unsupported("no audio track".into()))?;
        let track_id = track.id;
        let params = track.codec_params.clone();

        let source_rate = params
            .sample_rate
            .ok_or_else(|| BackendError::Unsupported("unknown sample rate".into()))?;
        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(open_error)?;

        let resampler = if self.resample && target_rate > 0 && target_rate != source_rate {
            Some(StreamResampler::new(source_rate, target_rate)?)
        } else {
            None
        };
        let output_rate = if resampler.is_some() {
            target_rate
        } else {
            source_rate
        };
        let total_frames = params
            .n_frames
            .map(|n| scale_frames(n, source_rate, output_rate));

        debug!(
            path = %path.display(),
            source_rate,
            output_rate,
            channels = params.channels.map(|c| c.count()),
            ?total_frames,
            "opened decode stream"
        );

        Ok(SymphoniaStream {
            format,
            decoder,
            track_id,
            output_rate,
            total_frames,
            resampler,
            bad_packets: 0,
            finished: false,
        })
    }
}

impl SourceLoader for SymphoniaLoader {
    fn open(
        &self,
        descriptor: &TrackDescriptor,
        target_rate: u32,
    ) -> Result<Box<dyn DecodeStream>, BackendError> {
        Ok(Box::new(self.open_stream(descriptor, target_rate)?))
    }
}

/// One file being decoded
pub struct SymphoniaStream {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    output_rate: u32,
    total_frames: Option<u64>,
    resampler: Option<StreamResampler>,
    bad_packets: usize,
    finished: bool,
}

impl SymphoniaStream {
    /// Decode the next packet of the selected track as stereo frames.
    /// `Ok(None)` at end of stream.
    fn next_packet(&mut self) -> Result<Option<Vec<f32>>, BackendError> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                    return Ok(None);
                }
                // Chained streams would need a new decoder; treat as the end
                Err(SymphoniaError::ResetRequired) => return Ok(None),
                Err(e) => return Err(BackendError::Decode(e.to_string())),
            };
            if packet.track_id() != self.track_id {
                continue;
            }

            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    self.bad_packets = 0;
                    let spec = *decoded.spec();
                    let frames = decoded.frames();
                    if frames == 0 {
                        continue;
                    }
                    let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                    buf.copy_interleaved_ref(decoded);
                    return Ok(Some(fold_to_stereo(buf.samples(), spec.channels.count())));
                }
                Err(SymphoniaError::DecodeError(reason)) => {
                    self.bad_packets += 1;
                    warn!(reason, bad = self.bad_packets, "skipping corrupt packet");
                    if self.bad_packets >= MAX_BAD_PACKETS {
                        return Err(BackendError::Decode(format!(
                            "{} consecutive corrupt packets: {reason}",
                            self.bad_packets
                        )));
                    }
                }
                Err(SymphoniaError::IoError(e)) => {
                    self.bad_packets += 1;
                    if self.bad_packets >= MAX_BAD_PACKETS {
                        return Err(BackendError::Decode(e.to_string()));
                    }
                }
                Err(e) => return Err(BackendError::Decode(e.to_string())),
            }
        }
    }
}

impl DecodeStream for SymphoniaStream {
    fn sample_rate(&self) -> u32 {
        self.output_rate
    }

    fn total_frames(&self) -> Option<u64> {
        self.total_frames
    }

    fn next_chunk(&mut self) -> Result<Option<Vec<f32>>, BackendError> {
        while !self.finished {
            let Some(stereo) = self.next_packet()? else {
                self.finished = true;
                let tail = match self.resampler.as_mut() {
                    Some(resampler) => resampler.flush()?,
                    None => Vec::new(),
                };
                return Ok((!tail.is_empty()).then_some(tail));
            };
            let chunk = match self.resampler.as_mut() {
                Some(resampler) => resampler.push(&stereo)?,
                None => stereo,
            };
            if !chunk.is_empty() {
                trace!(frames = chunk.len() / 2, "decoded chunk");
                return Ok(Some(chunk));
            }
        }
        Ok(None)
    }
}

/// Streaming stereo resampler that trims the filter delay so output frames
/// line up with input frames
struct StreamResampler {
    inner: FftFixedIn<f32>,
    pending: [Vec<f32>; 2],
    skip: usize,
    frames_in: u64,
    frames_out: u64,
    from: u32,
    to: u32,
}

impl StreamResampler {
    fn new(from: u32, to: u32) -> Result<Self, BackendError> {
        let inner = FftFixedIn::<f32>::new(from as usize, to as usize, RESAMPLE_CHUNK, 2, 2)
            .map_err(|e| BackendError::Unsupported(format!("resampler: {e}")))?;
        let skip = inner.output_delay();
        Ok(Self {
            inner,
            pending: [Vec::new(), Vec::new()],
            skip,
            frames_in: 0,
            frames_out: 0,
            from,
            to,
        })
    }

    fn push(&mut self, stereo: &[f32]) -> Result<Vec<f32>, BackendError> {
        for frame in stereo.chunks_exact(2) {
            self.pending[0].push(frame[0]);
            self.pending[1].push(frame[1]);
        }
        self.frames_in += (stereo.len() / 2) as u64;

        let mut out = Vec::new();
        loop {
            let need = self.inner.input_frames_next();
            if self.pending[0].len() < need {
                break;
            }
            let input: [&[f32]; 2] = [&self.pending[0][..need], &self.pending[1][..need]];
            let block = self.inner.process(&input[..], None).map_err(resample_error)?;
            self.pending[0].drain(..need);
            self.pending[1].drain(..need);
            self.emit(&block, u64::MAX, &mut out);
        }
        Ok(out)
    }

    /// Drain what is left in the input queue and the filter
    fn flush(&mut self) -> Result<Vec<f32>, BackendError> {
        let expected = scale_frames(self.frames_in, self.from, self.to);
        let mut out = Vec::new();

        if !self.pending[0].is_empty() {
            let input: [&[f32]; 2] = [&self.pending[0], &self.pending[1]];
            let block = self
                .inner
                .process_partial(Some(&input[..]), None)
                .map_err(resample_error)?;
            self.pending[0].clear();
            self.pending[1].clear();
            self.emit(&block, expected, &mut out);
        }
        while self.frames_out < expected {
            let block = self
                .inner
                .process_partial::<&[f32]>(None, None)
                .map_err(resample_error)?;
            if block[0].is_empty() {
                break;
            }
            self.emit(&block, expected, &mut out);
        }
        Ok(out)
    }

    fn emit(&mut self, block: &[Vec<f32>], limit: u64, out: &mut Vec<f32>) {
        let frames = block[0].len();
        let skip = self.skip.min(frames);
        self.skip -= skip;
        for i in skip..frames {
            if self.frames_out >= limit {
                break;
            }
            out.push(block[0][i]);
            out.push(block[1][i]);
            self.frames_out += 1;
        }
    }
}

/// Interleaved samples with `channels` channels to stereo. Mono is
/// duplicated; wider layouts average even channels left and odd right.
pub fn fold_to_stereo(samples: &[f32], channels: usize) -> Vec<f32> {
    match channels {
        0 => Vec::new(),
        1 => samples.iter().flat_map(|&s| [s, s]).collect(),
        2 => samples.to_vec(),
        n => {
            let lefts = n.div_ceil(2) as f32;
            let rights = (n / 2) as f32;
            let mut out = Vec::with_capacity(samples.len() / n * 2);
            for frame in samples.chunks_exact(n) {
                let (mut l, mut r) = (0.0, 0.0);
                for (ch, s) in frame.iter().enumerate() {
                    if ch % 2 == 0 {
                        l += s;
                    } else {
                        r += s;
                    }
                }
                out.push(l / lefts);
                out.push(r / rights);
            }
            out
        }
    }
}

fn scale_frames(frames: u64, from: u32, to: u32) -> u64 {
    if from == to || from == 0 {
        return frames;
    }
    ((frames as u128 * to as u128 + from as u128 / 2) / from as u128) as u64
}

/// Locators are plain paths or `file://` URLs
fn locator_path(locator: &str) -> PathBuf {
    PathBuf::from(locator.strip_prefix("file://").unwrap_or(locator))
}

fn open_error(err: SymphoniaError) -> BackendError {
    match err {
        SymphoniaError::IoError(e) => BackendError::from(e),
        SymphoniaError::Unsupported(what) => BackendError::Unsupported(what.to_string()),
        other => BackendError::Decode(other.to_string()),
    }
}

fn resample_error(err: rubato::ResampleError) -> BackendError {
    BackendError::Decode(format!("resampler: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static FILE_SEQ: AtomicUsize = AtomicUsize::new(0);

    fn scratch_path(name: &str) -> PathBuf {
        let n = FILE_SEQ.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("cadenza-{}-{n}-{name}", std::process::id()))
    }

    /// Write a 16-bit PCM WAV file
    fn write_wav(path: &Path, rate: u32, channels: u16, samples: &[f32]) {
        let data_len = (samples.len() * 2) as u32;
        let mut bytes = Vec::with_capacity(44 + data_len as usize);
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
        bytes.extend_from_slice(b"WAVEfmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&channels.to_le_bytes());
        bytes.extend_from_slice(&rate.to_le_bytes());
        bytes.extend_from_slice(&(rate * u32::from(channels) * 2).to_le_bytes());
        bytes.extend_from_slice(&(channels * 2).to_le_bytes());
        bytes.extend_from_slice(&16u16.to_le_bytes());
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&data_len.to_le_bytes());
        for s in samples {
            let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        fs::write(path, bytes).unwrap();
    }

    fn sine(rate: u32, seconds: f32) -> Vec<f32> {
        let frames = (rate as f32 * seconds) as usize;
        (0..frames)
            .map(|i| 0.5 * (2.0 * PI * 440.0 * i as f32 / rate as f32).sin())
            .collect()
    }

    fn decode_all(stream: &mut dyn DecodeStream) -> Vec<f32> {
        let mut out = Vec::new();
        while let Some(chunk) = stream.next_chunk().unwrap() {
            assert_eq!(chunk.len() % 2, 0);
            out.extend(chunk);
        }
        out
    }

    #[test]
    fn test_fold_to_stereo() {
        assert_eq!(fold_to_stereo(&[0.1, 0.2], 1), vec![0.1, 0.1, 0.2, 0.2]);
        assert_eq!(fold_to_stereo(&[0.1, 0.2], 2), vec![0.1, 0.2]);
        assert_eq!(fold_to_stereo(&[1.0, 0.5, 0.0], 3), vec![0.5, 0.5]);
        assert!(fold_to_stereo(&[0.3], 0).is_empty());
    }

    #[test]
    fn test_scale_frames() {
        assert_eq!(scale_frames(44100, 44100, 48000), 48000);
        assert_eq!(scale_frames(48000, 48000, 48000), 48000);
        assert_eq!(scale_frames(100, 0, 48000), 100);
    }

    #[test]
    fn test_locator_path() {
        assert_eq!(locator_path("file:///music/a.flac"), PathBuf::from("/music/a.flac"));
        assert_eq!(locator_path("a.flac"), PathBuf::from("a.flac"));
    }

    #[test]
    fn test_missing_file_is_unreachable() {
        let result = SymphoniaLoader::new().open(&TrackDescriptor::new("/nonexistent/a.mp3"), 48000);
        assert!(matches!(result, Err(BackendError::Unreachable(_))));
    }

    #[test]
    fn test_garbage_is_rejected() {
        let path = scratch_path("garbage.bin");
        fs::write(&path, vec![0x5a; 4096]).unwrap();
        let result = SymphoniaLoader::new().open(&TrackDescriptor::new(path.to_string_lossy()), 48000);
        fs::remove_file(&path).ok();
        assert!(matches!(
            result,
            Err(BackendError::Unsupported(_) | BackendError::Decode(_))
        ));
    }

    #[test]
    fn test_mono_wav_at_native_rate() {
        let path = scratch_path("mono.wav");
        let mono = sine(48000, 0.5);
        write_wav(&path, 48000, 1, &mono);

        let mut stream = SymphoniaLoader::new().open_path(&path, 48000).unwrap();
        assert_eq!(stream.sample_rate(), 48000);
        assert_eq!(stream.total_frames(), Some(24000));
        let out = decode_all(&mut stream);
        fs::remove_file(&path).ok();

        assert_eq!(out.len(), 48000);
        assert_eq!(out[200], out[201]);
        assert!((out[200] - mono[100]).abs() < 1e-3);
    }

    #[test]
    fn test_resamples_to_engine_rate() {
        let path = scratch_path("cd.wav");
        let stereo: Vec<f32> = sine(44100, 1.0).into_iter().flat_map(|s| [s, s]).collect();
        write_wav(&path, 44100, 2, &stereo);

        let mut stream = SymphoniaLoader::new().open_path(&path, 48000).unwrap();
        assert_eq!(stream.sample_rate(), 48000);
        assert_eq!(stream.total_frames(), Some(48000));
        let out = decode_all(&mut stream);
        fs::remove_file(&path).ok();

        assert_eq!(out.len(), 2 * 48000);
        let mid = &out[40000..50000];
        let peak = mid.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!((peak - 0.5).abs() < 0.05, "peak {peak}");
    }

    #[test]
    fn test_native_rate_loader_skips_resampling() {
        let path = scratch_path("native.wav");
        write_wav(&path, 22050, 2, &vec![0.25; 2 * 2205]);

        let mut stream = SymphoniaLoader::native_rate().open_path(&path, 48000).unwrap();
        assert_eq!(stream.sample_rate(), 22050);
        let out = decode_all(&mut stream);
        fs::remove_file(&path).ok();
        assert_eq!(out.len(), 2 * 2205);
    }

    #[test]
    fn test_format_hint_for_extensionless_locator() {
        let path = scratch_path("track");
        write_wav(&path, 48000, 2, &vec![0.1; 960]);

        let descriptor = TrackDescriptor::new(path.to_string_lossy()).with_format_hint("wav");
        let stream = SymphoniaLoader::new().open(&descriptor, 48000);
        fs::remove_file(&path).ok();
        assert!(stream.is_ok());
    }
}
