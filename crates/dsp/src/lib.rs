//! Signal processing for rfscope: windowed power spectra, FM
//! demodulation with de-emphasis, rational resampling and channel
//! filtering. Everything here is synchronous and free of I/O.

pub mod error;
pub mod filter;
pub mod fm;
pub mod gain;
pub mod processor;
pub mod resample;
pub mod spectrum;
pub mod window;

pub use error::{Error, Result};
pub use filter::bandpass;
pub use fm::{discriminate, FmDemodulator};
pub use gain::apply_gain_db;
pub use processor::{Mode, Processed, SignalProcessor, DEFAULT_AUDIO_RATE};
pub use resample::{resample, Resampler};
pub use spectrum::{spectrum, DisplayRange, SpectrumAnalyzer, SpectrumFrame};
pub use window::WindowKind;
