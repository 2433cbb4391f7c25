use std::fmt;
use std::str::FromStr;

use num_complex::Complex32;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::filter;
use crate::fm::FmDemodulator;
use crate::resample::Resampler;
use crate::spectrum::SpectrumAnalyzer;
use crate::window::WindowKind;

/// Output rate of FM mode.
pub const DEFAULT_AUDIO_RATE: f64 = 48_000.0;

/// What a block of samples is turned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Spectrum,
    #[serde(rename = "fm")]
    FmDemod,
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "spectrum" => Ok(Mode::Spectrum),
            "fm" => Ok(Mode::FmDemod),
            _ => Err(Error::UnknownMode(s.to_string())),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Spectrum => f.write_str("spectrum"),
            Mode::FmDemod => f.write_str("fm"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Processed {
    /// Centered dB magnitudes, one per input sample
    Spectrum(Vec<f32>),
    /// Normalized audio at the processor's audio rate
    Audio(Vec<f32>),
}

fn check_rate(rate: f64, what: &str) -> Result<()> {
    if rate.is_finite() && rate > 0.0 {
        Ok(())
    } else {
        Err(Error::InvalidParameter(format!("{} must be positive, got {}", what, rate)))
    }
}

/// The DSP pipeline bound to one input sample rate. The only state kept
/// between calls is what depends on that rate: de-emphasis coefficients
/// and the audio resampler taps. FFT plans are cached too.
pub struct SignalProcessor {
    sample_rate: f64,
    audio_rate: f64,
    analyzer: SpectrumAnalyzer,
    fm: FmDemodulator,
    resampler: Option<Resampler>,
}

impl SignalProcessor {
    pub fn new(sample_rate: f64) -> Result<Self> {
        check_rate(sample_rate, "sample rate")?;
        Ok(Self {
            sample_rate,
            audio_rate: DEFAULT_AUDIO_RATE,
            analyzer: SpectrumAnalyzer::default(),
            fm: FmDemodulator::new(sample_rate),
            resampler: None,
        })
    }

    pub fn with_audio_rate(mut self, audio_rate: f64) -> Result<Self> {
        check_rate(audio_rate, "audio rate")?;
        self.audio_rate = audio_rate;
        self.resampler = None;
        Ok(self)
    }

    pub fn with_window(mut self, window: WindowKind) -> Self {
        self.analyzer.set_window(window);
        self
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn audio_rate(&self) -> f64 {
        self.audio_rate
    }

    pub fn window(&self) -> WindowKind {
        self.analyzer.window()
    }

    pub fn set_window(&mut self, window: WindowKind) {
        self.analyzer.set_window(window);
    }

    /// Follow a retune. Rate-dependent state is rebuilt only on change.
    pub fn set_sample_rate(&mut self, sample_rate: f64) -> Result<()> {
        check_rate(sample_rate, "sample rate")?;
        if sample_rate != self.sample_rate {
            self.sample_rate = sample_rate;
            self.fm.set_sample_rate(sample_rate);
            self.resampler = None;
        }
        Ok(())
    }

    pub fn spectrum(&mut self, samples: &[Complex32]) -> Vec<f32> {
        self.analyzer.process(samples)
    }

    pub fn demodulate_fm(&self, samples: &[Complex32]) -> Vec<f32> {
        self.fm.demodulate(samples)
    }

    /// Resample audio taken at the input sample rate to `target_rate`.
    pub fn resample(&mut self, audio: &[f32], target_rate: f64) -> Result<Vec<f32>> {
        if target_rate != self.audio_rate {
            return crate::resample::resample(audio, self.sample_rate, target_rate);
        }
        if self.resampler.is_none() {
            self.resampler = Some(Resampler::for_rates(self.sample_rate, self.audio_rate)?);
        }
        match &self.resampler {
            Some(r) => Ok(r.process(audio)),
            None => Ok(Vec::new()),
        }
    }

    pub fn bandpass(&self, samples: &[Complex32], bandwidth: f64) -> Result<Vec<Complex32>> {
        filter::bandpass(samples, bandwidth, self.sample_rate)
    }

    pub fn process(&mut self, samples: &[Complex32], mode: Mode) -> Result<Processed> {
        match mode {
            Mode::Spectrum => Ok(Processed::Spectrum(self.spectrum(samples))),
            Mode::FmDemod => {
                let demodulated = self.demodulate_fm(samples);
                let audio_rate = self.audio_rate;
                Ok(Processed::Audio(self.resample(&demodulated, audio_rate)?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fm_tone(n: usize, offset: f64, fs: f64) -> Vec<Complex32> {
        (0..n)
            .map(|i| {
                let phase = (2.0 * std::f64::consts::PI * offset * i as f64 / fs)
                    .rem_euclid(2.0 * std::f64::consts::PI);
                Complex32::from_polar(1.0, phase as f32)
            })
            .collect()
    }

    #[test]
    fn test_mode_names() {
        assert_eq!("spectrum".parse::<Mode>().unwrap(), Mode::Spectrum);
        assert_eq!("FM".parse::<Mode>().unwrap(), Mode::FmDemod);
        assert!(matches!("am".parse::<Mode>(), Err(Error::UnknownMode(_))));
        assert_eq!(Mode::FmDemod.to_string(), "fm");
    }

    #[test]
    fn test_process_spectrum() {
        let mut p = SignalProcessor::new(2e6).unwrap();
        match p.process(&fm_tone(2048, 100e3, 2e6), Mode::Spectrum).unwrap() {
            Processed::Spectrum(mags) => assert_eq!(mags.len(), 2048),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            p.process(&[], Mode::Spectrum).unwrap(),
            Processed::Spectrum(Vec::new())
        );
    }

    #[test]
    fn test_process_fm_audio_length() {
        let mut p = SignalProcessor::new(2e6).unwrap();
        match p.process(&fm_tone(262144, 50e3, 2e6), Mode::FmDemod).unwrap() {
            // 262143 discriminator samples at 3/125
            Processed::Audio(audio) => assert_eq!(audio.len(), 6292),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_non_integer_rate_rejected() {
        let mut p = SignalProcessor::new(2_000_000.5).unwrap();
        assert!(matches!(
            p.process(&fm_tone(64, 10e3, 2e6), Mode::FmDemod),
            Err(Error::InvalidParameter(_))
        ));
        assert!(SignalProcessor::new(0.0).is_err());
        assert!(p.set_sample_rate(-1.0).is_err());
    }

    #[test]
    fn test_retune_rebuilds_rate_state() {
        let mut p = SignalProcessor::new(2e6).unwrap();
        p.resample(&[0.0; 16], DEFAULT_AUDIO_RATE).unwrap();
        p.set_sample_rate(240e3).unwrap();
        assert_eq!(p.sample_rate(), 240e3);
        // 240 kHz -> 48 kHz is exactly 1/5
        assert_eq!(p.resample(&[0.0; 100], DEFAULT_AUDIO_RATE).unwrap().len(), 20);
    }
}
