use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Default Kaiser shape when the name carries no parameter.
pub const DEFAULT_KAISER_BETA: f64 = 8.6;

/// Modified Bessel function of the first kind, order 0 (for Kaiser window)
fn bessel_i0(x: f64) -> f64 {
    let mut sum = 1.0;
    let mut term = 1.0;
    let x_sq_over_4 = x * x / 4.0;
    for k in 1..=30 {
        term *= x_sq_over_4 / (k * k) as f64;
        sum += term;
        if term < sum * 1e-12 {
            break;
        }
    }
    sum
}

/// Generate symmetric Kaiser window coefficients
///
/// - `n`: window length
/// - `beta`: shape parameter (higher = narrower mainlobe, lower sidelobes)
pub fn kaiser(n: usize, beta: f64) -> Vec<f64> {
    if n <= 1 {
        return vec![1.0; n];
    }
    let n_f = n as f64;
    let denom = bessel_i0(beta);

    (0..n)
        .map(|i| {
            let x = 2.0 * i as f64 / (n_f - 1.0) - 1.0;
            let arg = beta * (1.0 - x * x).max(0.0).sqrt();
            bessel_i0(arg) / denom
        })
        .collect()
}

/// Window applied before the spectrum FFT.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowKind {
    Rectangular,
    Hann,
    Hamming,
    Blackman,
    Kaiser(f64),
}

impl Default for WindowKind {
    fn default() -> Self {
        WindowKind::Hann
    }
}

impl WindowKind {
    /// Periodic ("DFT-even") coefficients of length `n`: the symmetric
    /// window of length n+1 with its last point dropped.
    pub fn coefficients(&self, n: usize) -> Vec<f32> {
        if n == 0 {
            return Vec::new();
        }
        let m = n as f64;
        let cosine = |a: &[f64]| -> Vec<f32> {
            (0..n)
                .map(|i| {
                    let t = 2.0 * PI * i as f64 / m;
                    a.iter()
                        .enumerate()
                        .map(|(k, c)| {
                            let sign = if k % 2 == 0 { 1.0 } else { -1.0 };
                            sign * c * (k as f64 * t).cos()
                        })
                        .sum::<f64>() as f32
                })
                .collect()
        };
        match self {
            WindowKind::Rectangular => vec![1.0; n],
            WindowKind::Hann => cosine(&[0.5, 0.5]),
            WindowKind::Hamming => cosine(&[0.54, 0.46]),
            WindowKind::Blackman => cosine(&[0.42, 0.5, 0.08]),
            WindowKind::Kaiser(beta) => {
                let mut w = kaiser(n + 1, *beta);
                w.truncate(n);
                w.into_iter().map(|v| v as f32).collect()
            }
        }
    }
}

fn unknown(s: &str) -> Error {
    Error::InvalidParameter(format!("unknown window: {}", s))
}

impl FromStr for WindowKind {
    type Err = Error;

    /// Accepts `hann`, `hanning`, `hamming`, `blackman`, `rect`/`boxcar`,
    /// `kaiser` and `kaiser:<beta>`.
    fn from_str(s: &str) -> Result<Self, Error> {
        let lower = s.trim().to_ascii_lowercase();
        let (name, param) = match lower.split_once(':') {
            Some((n, p)) => (n, Some(p)),
            None => (lower.as_str(), None),
        };
        let kind = match name {
            "hann" | "hanning" => WindowKind::Hann,
            "hamming" => WindowKind::Hamming,
            "blackman" => WindowKind::Blackman,
            "rect" | "rectangular" | "boxcar" => WindowKind::Rectangular,
            "kaiser" => {
                let beta = match param {
                    Some(p) => p
                        .parse::<f64>()
                        .ok()
                        .filter(|b| b.is_finite() && *b >= 0.0)
                        .ok_or_else(|| unknown(s))?,
                    None => DEFAULT_KAISER_BETA,
                };
                return Ok(WindowKind::Kaiser(beta));
            }
            _ => return Err(unknown(s)),
        };
        if param.is_some() {
            return Err(unknown(s));
        }
        Ok(kind)
    }
}

impl fmt::Display for WindowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowKind::Rectangular => f.write_str("rectangular"),
            WindowKind::Hann => f.write_str("hann"),
            WindowKind::Hamming => f.write_str("hamming"),
            WindowKind::Blackman => f.write_str("blackman"),
            WindowKind::Kaiser(beta) => write!(f, "kaiser:{}", beta),
        }
    }
}

/// Kaiser-windowed sinc lowpass with unity DC gain.
///
/// - `num_taps`: filter length (odd for a type I linear-phase filter)
/// - `cutoff`: cutoff as a fraction of Nyquist, in (0, 1]
/// - `beta`: Kaiser shape parameter
pub fn kaiser_lowpass(num_taps: usize, cutoff: f64, beta: f64) -> Vec<f64> {
    let win = kaiser(num_taps, beta);
    let half = (num_taps as f64 - 1.0) / 2.0;
    let mut h: Vec<f64> = (0..num_taps)
        .map(|n| {
            let t = n as f64 - half;
            let x = cutoff * t;
            let sinc_val = if x.abs() < 1e-12 {
                1.0
            } else {
                (PI * x).sin() / (PI * x)
            };
            cutoff * sinc_val * win[n]
        })
        .collect();

    let dc: f64 = h.iter().sum();
    if dc.abs() > 1e-12 {
        for v in h.iter_mut() {
            *v /= dc;
        }
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kaiser_window() {
        let w = kaiser(64, 7.0);
        assert_eq!(w.len(), 64);
        // Should be symmetric
        for i in 0..32 {
            assert!(
                (w[i] - w[63 - i]).abs() < 1e-10,
                "asymmetry at index {}: {} != {}",
                i,
                w[i],
                w[63 - i]
            );
        }
        // Peak at center
        assert!(w[31] > 0.99);
        // Edges should be small
        assert!(w[0] < 0.1);
    }

    #[test]
    fn test_hann_is_periodic() {
        let w = WindowKind::Hann.coefficients(8);
        assert_eq!(w.len(), 8);
        assert!(w[0].abs() < 1e-7);
        // Peak lands on n/2 for the periodic form, and there is no
        // trailing zero.
        assert!((w[4] - 1.0).abs() < 1e-6, "w[4] = {}", w[4]);
        assert!(w[7] > 0.1);
        for i in 1..4 {
            assert!((w[i] - w[8 - i]).abs() < 1e-6);
        }
    }

    #[test]
    fn test_blackman_endpoints() {
        let w = WindowKind::Blackman.coefficients(16);
        assert!(w[0].abs() < 1e-6);
        assert!((w[8] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_window_names() {
        assert_eq!("Hann".parse::<WindowKind>().unwrap(), WindowKind::Hann);
        assert_eq!("boxcar".parse::<WindowKind>().unwrap(), WindowKind::Rectangular);
        assert_eq!(
            "kaiser:5".parse::<WindowKind>().unwrap(),
            WindowKind::Kaiser(5.0)
        );
        assert!(matches!(
            "triangle".parse::<WindowKind>(),
            Err(Error::InvalidParameter(_))
        ));
        assert!("hann:3".parse::<WindowKind>().is_err());
    }

    #[test]
    fn test_kaiser_lowpass() {
        let h = kaiser_lowpass(61, 0.25, 5.0);
        assert_eq!(h.len(), 61);
        let dc: f64 = h.iter().sum();
        assert!((dc - 1.0).abs() < 1e-9, "dc gain {}", dc);
        // Should be symmetric with the peak at center
        let center = h.len() / 2;
        for i in 0..center {
            assert!((h[i] - h[h.len() - 1 - i]).abs() < 1e-12);
            assert!(h[i].abs() <= h[center]);
        }
    }
}
