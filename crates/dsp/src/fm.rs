//! FM discriminator with broadcast de-emphasis.

use num_complex::Complex32;

/// Broadcast FM pre-emphasis time constant (Americas/Korea), seconds.
pub const DEEMPHASIS_TAU: f64 = 75e-6;

/// Below this peak a block is treated as silent and left unscaled.
const SILENCE: f32 = 1e-12;

/// Instantaneous phase step `arg(s[n] · conj(s[n-1]))`, radians/sample.
/// Produces one value fewer than the input; fewer than two samples give
/// an empty result.
pub fn discriminate(samples: &[Complex32]) -> Vec<f32> {
    samples
        .windows(2)
        .map(|w| (w[1] * w[0].conj()).arg())
        .collect()
}

/// One-pole RC low-pass `1 / (τs + 1)` mapped to z by the bilinear
/// transform at the current sample rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Deemphasis {
    tau: f64,
    sample_rate: f64,
    b0: f32,
    b1: f32,
    a1: f32,
}

impl Deemphasis {
    pub fn new(sample_rate: f64, tau: f64) -> Self {
        let mut d = Self {
            tau,
            sample_rate,
            b0: 1.0,
            b1: 0.0,
            a1: 0.0,
        };
        d.design();
        d
    }

    fn design(&mut self) {
        // s = 2fs(1 - z^-1)/(1 + z^-1)
        let k = 2.0 * self.sample_rate * self.tau;
        self.b0 = (1.0 / (1.0 + k)) as f32;
        self.b1 = self.b0;
        self.a1 = ((1.0 - k) / (1.0 + k)) as f32;
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Recompute coefficients if the rate changed.
    pub fn set_sample_rate(&mut self, sample_rate: f64) {
        if sample_rate != self.sample_rate {
            self.sample_rate = sample_rate;
            self.design();
        }
    }

    /// (b, a) in direct form, `a[0] == 1`.
    pub fn coefficients(&self) -> ([f32; 2], [f32; 2]) {
        ([self.b0, self.b1], [1.0, self.a1])
    }

    /// Filter one block from rest (zero initial state).
    pub fn apply(&self, input: &[f32]) -> Vec<f32> {
        let mut prev_x = 0.0f32;
        let mut prev_y = 0.0f32;
        input
            .iter()
            .map(|&x| {
                let y = self.b0 * x + self.b1 * prev_x - self.a1 * prev_y;
                prev_x = x;
                prev_y = y;
                y
            })
            .collect()
    }
}

/// Scale so the largest magnitude is 1. Silent blocks are left as is.
pub fn normalize_peak(audio: &mut [f32]) {
    let peak = audio.iter().fold(0.0f32, |m, v| m.max(v.abs()));
    if peak > SILENCE && peak.is_finite() {
        let inv = 1.0 / peak;
        for v in audio.iter_mut() {
            *v *= inv;
        }
    }
}

/// Discriminator, de-emphasis and peak normalization.
#[derive(Debug, Clone)]
pub struct FmDemodulator {
    deemphasis: Deemphasis,
}

impl FmDemodulator {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            deemphasis: Deemphasis::new(sample_rate, DEEMPHASIS_TAU),
        }
    }

    pub fn sample_rate(&self) -> f64 {
        self.deemphasis.sample_rate()
    }

    pub fn set_sample_rate(&mut self, sample_rate: f64) {
        self.deemphasis.set_sample_rate(sample_rate);
    }

    pub fn deemphasis(&self) -> &Deemphasis {
        &self.deemphasis
    }

    pub fn demodulate(&self, samples: &[Complex32]) -> Vec<f32> {
        let diff = discriminate(samples);
        if diff.is_empty() {
            return diff;
        }
        let mut audio = self.deemphasis.apply(&diff);
        normalize_peak(&mut audio);
        audio
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    fn tone(n: usize, freq: f64, fs: f64) -> Vec<Complex32> {
        (0..n)
            .map(|i| {
                let phase = (std::f64::consts::TAU * freq * i as f64 / fs).rem_euclid(std::f64::consts::TAU) as f32;
                Complex32::from_polar(0.7, phase)
            })
            .collect()
    }

    #[test]
    fn test_constant_offset_discriminator() {
        let fs = 2e6;
        let offset = 75e3;
        let out = discriminate(&tone(4096, offset, fs));
        assert_eq!(out.len(), 4095);
        let expected = (2.0 * std::f64::consts::PI * offset / fs) as f32;
        for (i, v) in out.iter().enumerate() {
            assert!(
                (v - expected).abs() < 1e-3,
                "sample {}: {} != {}",
                i,
                v,
                expected
            );
        }
    }

    #[test]
    fn test_negative_offset() {
        let out = discriminate(&tone(256, -10e3, 200e3));
        let expected = -2.0 * PI * 10e3 / 200e3;
        assert!(out.iter().all(|v| (v - expected).abs() < 1e-3));
    }

    #[test]
    fn test_short_input() {
        let demod = FmDemodulator::new(2e6);
        assert!(demod.demodulate(&[]).is_empty());
        assert!(demod.demodulate(&[Complex32::new(1.0, 0.0)]).is_empty());
    }

    #[test]
    fn test_deemphasis_coefficients() {
        // k = 2 * 48000 * 75e-6 = 7.2
        let d = Deemphasis::new(48e3, DEEMPHASIS_TAU);
        let (b, a) = d.coefficients();
        assert!((b[0] - 1.0 / 8.2).abs() < 1e-6);
        assert!((b[1] - 1.0 / 8.2).abs() < 1e-6);
        assert!((a[1] - (-6.2 / 8.2)).abs() < 1e-6);
        // DC gain of the bilinear RC is exactly one.
        assert!(((b[0] + b[1]) / (a[0] + a[1]) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_deemphasis_tracks_rate() {
        let mut d = Deemphasis::new(48e3, DEEMPHASIS_TAU);
        let before = d.coefficients();
        d.set_sample_rate(2e6);
        assert_ne!(before, d.coefficients());
        assert_eq!(d.sample_rate(), 2e6);
    }

    #[test]
    fn test_demodulate_normalizes() {
        let demod = FmDemodulator::new(2e6);
        let audio = demod.demodulate(&tone(20000, 50e3, 2e6));
        let peak = audio.iter().fold(0.0f32, |m, v| m.max(v.abs()));
        assert!((peak - 1.0).abs() < 1e-6, "peak {}", peak);
        // Settled output of a constant offset is flat.
        let tail = &audio[audio.len() - 100..];
        assert!(tail.iter().all(|v| (v - 1.0).abs() < 1e-3));
    }

    #[test]
    fn test_silent_block_not_scaled() {
        let demod = FmDemodulator::new(2e6);
        let still = vec![Complex32::new(0.5, 0.0); 64];
        let audio = demod.demodulate(&still);
        assert_eq!(audio.len(), 63);
        assert!(audio.iter().all(|v| *v == 0.0));
    }
}
