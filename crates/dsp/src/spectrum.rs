use num_complex::Complex32;
use rustfft::FftPlanner;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::window::WindowKind;

/// Added to |X| before the log so empty bins stay finite.
pub const MAGNITUDE_EPSILON: f32 = 1e-10;

/// Windowed FFT power spectrum in dB, DC centered.
///
/// Plans and window coefficients are cached, so reusing one analyzer for
/// blocks of the same length avoids replanning.
pub struct SpectrumAnalyzer {
    planner: FftPlanner<f32>,
    window: WindowKind,
    coeffs: Vec<f32>,
    scratch: Vec<Complex32>,
}

impl SpectrumAnalyzer {
    pub fn new(window: WindowKind) -> Self {
        Self {
            planner: FftPlanner::new(),
            window,
            coeffs: Vec::new(),
            scratch: Vec::new(),
        }
    }

    pub fn window(&self) -> WindowKind {
        self.window
    }

    pub fn set_window(&mut self, window: WindowKind) {
        if window != self.window {
            self.window = window;
            self.coeffs.clear();
        }
    }

    /// One magnitude per input sample, `20·log10(|X| + ε)`, fftshifted.
    /// Empty input yields empty output.
    pub fn process(&mut self, samples: &[Complex32]) -> Vec<f32> {
        let n = samples.len();
        if n == 0 {
            return Vec::new();
        }
        if self.coeffs.len() != n {
            self.coeffs = self.window.coefficients(n);
        }

        let mut buffer: Vec<Complex32> = samples
            .iter()
            .zip(&self.coeffs)
            .map(|(s, w)| *s * *w)
            .collect();

        let fft = self.planner.plan_fft_forward(n);
        let scratch_len = fft.get_inplace_scratch_len();
        if self.scratch.len() < scratch_len {
            self.scratch.resize(scratch_len, Complex32::new(0.0, 0.0));
        }
        fft.process_with_scratch(&mut buffer, &mut self.scratch[..scratch_len]);

        // fftshift: bin k of the output holds frequency k - n/2.
        let shift = n - n / 2;
        (0..n)
            .map(|k| {
                let x = buffer[(k + shift) % n];
                20.0 * (x.norm() + MAGNITUDE_EPSILON).log10()
            })
            .collect()
    }
}

impl Default for SpectrumAnalyzer {
    fn default() -> Self {
        Self::new(WindowKind::default())
    }
}

/// One-shot [`SpectrumAnalyzer::process`].
pub fn spectrum(samples: &[Complex32], window: WindowKind) -> Vec<f32> {
    SpectrumAnalyzer::new(window).process(samples)
}

/// Display clipping for magnitudes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DisplayRange {
    pub floor_db: f32,
    pub ceiling_db: f32,
}

impl Default for DisplayRange {
    fn default() -> Self {
        Self {
            floor_db: -100.0,
            ceiling_db: 0.0,
        }
    }
}

impl DisplayRange {
    pub fn clip(&self, magnitudes: &mut [f32]) {
        for m in magnitudes.iter_mut() {
            *m = m.clamp(self.floor_db, self.ceiling_db);
        }
    }
}

/// Power spectrum with its frequency axis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpectrumFrame {
    /// Hz
    pub center_freq: f64,
    /// Hz
    pub sample_rate: f64,
    /// Seconds since the Unix epoch
    pub timestamp: f64,
    /// Hz, ascending
    pub frequencies: Vec<f64>,
    /// dB, one per frequency
    pub magnitudes: Vec<f32>,
}

impl SpectrumFrame {
    /// Attach the absolute frequency axis to centered magnitudes.
    pub fn new(magnitudes: Vec<f32>, center_freq: f64, sample_rate: f64, captured_at: SystemTime) -> Self {
        let n = magnitudes.len();
        let bin_hz = if n > 0 { sample_rate / n as f64 } else { 0.0 };
        let half = (n / 2) as f64;
        let frequencies = (0..n)
            .map(|k| center_freq + (k as f64 - half) * bin_hz)
            .collect();
        let timestamp = captured_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        Self {
            center_freq,
            sample_rate,
            timestamp,
            frequencies,
            magnitudes,
        }
    }

    pub fn compute(
        analyzer: &mut SpectrumAnalyzer,
        samples: &[Complex32],
        center_freq: f64,
        sample_rate: f64,
        captured_at: SystemTime,
    ) -> Self {
        Self::new(analyzer.process(samples), center_freq, sample_rate, captured_at)
    }

    pub fn len(&self) -> usize {
        self.magnitudes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.magnitudes.is_empty()
    }

    /// (frequency, magnitude) pairs in ascending frequency.
    pub fn bins(&self) -> impl Iterator<Item = (f64, f32)> + '_ {
        self.frequencies
            .iter()
            .copied()
            .zip(self.magnitudes.iter().copied())
    }

    pub fn clip(&mut self, range: DisplayRange) {
        range.clip(&mut self.magnitudes);
    }

    /// Reduce to at most `max_bins` by keeping the strongest bin of each
    /// group, so narrow carriers survive.
    pub fn decimate(&self, max_bins: usize) -> SpectrumFrame {
        if max_bins == 0 || self.len() <= max_bins {
            return self.clone();
        }
        let group = self.len().div_ceil(max_bins);
        let mut frequencies = Vec::with_capacity(max_bins);
        let mut magnitudes = Vec::with_capacity(max_bins);
        for (freqs, mags) in self.frequencies.chunks(group).zip(self.magnitudes.chunks(group)) {
            let (i, peak) = mags
                .iter()
                .copied()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (i, m)| if m > best.1 { (i, m) } else { best });
            frequencies.push(freqs[i]);
            magnitudes.push(peak);
        }
        SpectrumFrame {
            center_freq: self.center_freq,
            sample_rate: self.sample_rate,
            timestamp: self.timestamp,
            frequencies,
            magnitudes,
        }
    }

    /// Strongest bin, if any.
    pub fn peak(&self) -> Option<(f64, f32)> {
        self.bins()
            .fold(None, |best: Option<(f64, f32)>, bin| match best {
                Some(b) if b.1 >= bin.1 => Some(b),
                _ => Some(bin),
            })
    }
}
