//! Butterworth low-pass in second-order sections, run forward-backward
//! for zero phase.

use std::f64::consts::PI;

use num_complex::{Complex32, Complex64};

use crate::error::{Error, Result};

/// Order of the channel filter.
pub const BANDPASS_ORDER: usize = 5;

/// One second-order section, transposed direct form II.
/// `H(z) = (b0 + b1 z^-1 + b2 z^-2) / (1 + a1 z^-1 + a2 z^-2)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Biquad {
    pub b: [f64; 3],
    pub a: [f64; 2],
}

impl Biquad {
    fn dc_gain(&self) -> f64 {
        (self.b[0] + self.b[1] + self.b[2]) / (1.0 + self.a[0] + self.a[1])
    }

    /// State that makes a constant input `x0` produce its settled output
    /// from the first sample.
    fn steady_state(&self, x0: Complex64) -> [Complex64; 2] {
        let y0 = x0 * self.dc_gain();
        [
            y0 - x0 * self.b[0],
            x0 * self.b[2] - y0 * self.a[1],
        ]
    }

    fn run(&self, data: &mut [Complex64]) {
        let Some(&x0) = data.first() else {
            return;
        };
        let [mut z1, mut z2] = self.steady_state(x0);
        for x in data.iter_mut() {
            let y = *x * self.b[0] + z1;
            z1 = *x * self.b[1] - y * self.a[0] + z2;
            z2 = *x * self.b[2] - y * self.a[1];
            *x = y;
        }
    }
}

/// Digital Butterworth low-pass by bilinear transform with prewarping.
///
/// - `order`: filter order (>= 1)
/// - `cutoff`: -3 dB frequency as a fraction of Nyquist, in (0, 1)
pub fn butterworth_lowpass(order: usize, cutoff: f64) -> Result<Vec<Biquad>> {
    if order == 0 {
        return Err(Error::InvalidParameter("filter order must be at least 1".into()));
    }
    if !(cutoff > 0.0 && cutoff < 1.0) {
        return Err(Error::InvalidParameter(format!(
            "normalized cutoff must be in (0, 1), got {}",
            cutoff
        )));
    }

    let k = (PI * cutoff / 2.0).tan();
    let k2 = k * k;
    let mut sections = Vec::with_capacity(order.div_ceil(2));

    // Conjugate pole pairs of the analog prototype, 1/(s^2 + c s + 1).
    for i in 0..order / 2 {
        let c = 2.0 * (PI * (2 * i + 1) as f64 / (2 * order) as f64).sin();
        let d0 = 1.0 + c * k + k2;
        sections.push(Biquad {
            b: [k2 / d0, 2.0 * k2 / d0, k2 / d0],
            a: [(2.0 * k2 - 2.0) / d0, (1.0 - c * k + k2) / d0],
        });
    }
    // Real pole at s = -1 for odd orders.
    if order % 2 == 1 {
        let d0 = 1.0 + k;
        sections.push(Biquad {
            b: [k / d0, k / d0, 0.0],
            a: [(k - 1.0) / d0, 0.0],
        });
    }
    Ok(sections)
}

fn run_cascade(sections: &[Biquad], data: &mut [Complex64]) {
    for s in sections {
        s.run(data);
    }
}

/// Forward-backward filtering with odd-extension padding, so the result
/// has no phase shift and no start-up transient at either edge.
pub fn filtfilt(sections: &[Biquad], input: &[Complex32]) -> Vec<Complex32> {
    let n = input.len();
    if n < 2 {
        return input.to_vec();
    }
    let padlen = (3 * (2 * sections.len() + 1)).min(n - 1);

    let x: Vec<Complex64> = input
        .iter()
        .map(|s| Complex64::new(s.re as f64, s.im as f64))
        .collect();
    let first = x[0];
    let last = x[n - 1];

    let mut ext = Vec::with_capacity(n + 2 * padlen);
    ext.extend((1..=padlen).rev().map(|i| first * 2.0 - x[i]));
    ext.extend_from_slice(&x);
    ext.extend((1..=padlen).map(|i| last * 2.0 - x[n - 1 - i]));

    run_cascade(sections, &mut ext);
    ext.reverse();
    run_cascade(sections, &mut ext);
    ext.reverse();

    ext[padlen..padlen + n]
        .iter()
        .map(|c| Complex32::new(c.re as f32, c.im as f32))
        .collect()
}

/// Zero-phase channel filter: low-pass with its -3 dB point at
/// `bandwidth` Hz.
///
/// The cutoff must stay below Nyquist; `bandwidth >= sample_rate / 2` is
/// rejected.
pub fn bandpass(samples: &[Complex32], bandwidth: f64, sample_rate: f64) -> Result<Vec<Complex32>> {
    if !(bandwidth.is_finite() && bandwidth > 0.0) {
        return Err(Error::InvalidParameter(format!(
            "bandwidth must be positive, got {}",
            bandwidth
        )));
    }
    if !(sample_rate.is_finite() && sample_rate > 0.0) {
        return Err(Error::InvalidParameter(format!(
            "sample rate must be positive, got {}",
            sample_rate
        )));
    }
    let nyquist = sample_rate / 2.0;
    if bandwidth >= nyquist {
        return Err(Error::InvalidParameter(format!(
            "bandwidth {} Hz is not below Nyquist ({} Hz)",
            bandwidth, nyquist
        )));
    }
    let sections = butterworth_lowpass(BANDPASS_ORDER, bandwidth / nyquist)?;
    Ok(filtfilt(&sections, samples))
}
