//! Audio analysis for Cadenza - spectrum and level metering
//!
//! Read-only measurements behind the engine's analyser tap:
//! - Spectrum: windowed FFT reduced to logarithmic bands
//! - Levels: peak/RMS in dBFS

mod levels;
mod spectrum;

pub use levels::{db_to_linear, linear_to_db, measure, Levels, SILENCE_DB};
pub use spectrum::{SpectrumAnalyzer, SpectrumData, DEFAULT_FFT_SIZE, SPECTRUM_BANDS};
