//! Read-only analysis tap on the master output
//!
//! The render path pushes a mono fold of every block into an SPSC ring; the
//! query side drains it into a sliding window on demand. Nothing here can
//! influence the signal.

use std::sync::atomic::{AtomicU32, Ordering};

use cadenza_analysis::{measure, Levels, SpectrumAnalyzer, SpectrumData, DEFAULT_FFT_SIZE};
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

const RING_CAPACITY: usize = DEFAULT_FFT_SIZE * 4;

struct Reader {
    consumer: HeapCons<f32>,
    /// Circular window of the most recent samples
    window: Vec<f32>,
    write_pos: usize,
    spectrum: SpectrumAnalyzer,
    scratch: Vec<f32>,
}

impl Reader {
    fn drain(&mut self) {
        let len = self.window.len();
        loop {
            let read = self.consumer.pop_slice(&mut self.scratch);
            if read == 0 {
                break;
            }
            for &s in &self.scratch[..read] {
                self.window[self.write_pos] = s;
                self.write_pos = (self.write_pos + 1) % len;
            }
        }
    }

    fn ordered(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.window.len());
        out.extend_from_slice(&self.window[self.write_pos..]);
        out.extend_from_slice(&self.window[..self.write_pos]);
        out
    }
}

/// Level and spectrum inspection of what the device is playing
pub struct Analyser {
    producer: Mutex<HeapProd<f32>>,
    reader: Mutex<Reader>,
    sample_rate: AtomicU32,
}

impl Analyser {
    pub fn new(sample_rate: u32) -> Self {
        let (producer, consumer) = HeapRb::<f32>::new(RING_CAPACITY).split();
        Self {
            producer: Mutex::new(producer),
            reader: Mutex::new(Reader {
                consumer,
                window: vec![0.0; DEFAULT_FFT_SIZE],
                write_pos: 0,
                spectrum: SpectrumAnalyzer::new(sample_rate),
                scratch: vec![0.0; 1024],
            }),
            sample_rate: AtomicU32::new(sample_rate),
        }
    }

    /// Feed a rendered stereo block (render path; never blocks)
    pub(crate) fn push(&self, stereo: &[f32]) {
        let Some(mut producer) = self.producer.try_lock() else {
            return;
        };

        let frames = stereo.len() / 2;
        if producer.vacant_len() < frames {
            // Nobody has been reading; make room with the freshest audio.
            if let Some(mut reader) = self.reader.try_lock() {
                reader.drain();
            }
        }

        for frame in stereo.chunks_exact(2) {
            if producer.try_push((frame[0] + frame[1]) * 0.5).is_err() {
                break;
            }
        }
    }

    pub(crate) fn set_sample_rate(&self, sample_rate: u32) {
        self.sample_rate.store(sample_rate, Ordering::Relaxed);
        self.reader.lock().spectrum.set_sample_rate(sample_rate);
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Relaxed)
    }

    pub fn fft_size(&self) -> usize {
        DEFAULT_FFT_SIZE
    }

    /// Most recent mono samples, oldest first
    pub fn time_domain(&self) -> Vec<f32> {
        let mut reader = self.reader.lock();
        reader.drain();
        reader.ordered()
    }

    /// Logarithmic band magnitudes of the most recent window
    pub fn frequency_data(&self) -> SpectrumData {
        let mut reader = self.reader.lock();
        reader.drain();
        let samples = reader.ordered();
        reader.spectrum.process(&samples)
    }

    /// Peak and RMS of the most recent window
    pub fn levels(&self) -> Levels {
        let mut reader = self.reader.lock();
        reader.drain();
        measure(&reader.window)
    }

    /// Forget everything captured so far
    pub fn clear(&self) {
        let mut reader = self.reader.lock();
        reader.drain();
        reader.window.fill(0.0);
        reader.write_pos = 0;
        reader.spectrum.reset();
    }
}
