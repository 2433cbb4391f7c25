use crate::error::{Error, Result};
use crate::window::kaiser_lowpass;

/// Kaiser shape of the anti-aliasing filter.
const KAISER_BETA: f64 = 5.0;
/// Filter half-length in units of max(up, down).
const HALF_LEN_FACTOR: usize = 10;

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// Reduce `target / source` to lowest terms. Both rates must be positive
/// whole numbers of Hz.
pub fn rational_ratio(source_rate: f64, target_rate: f64) -> Result<(usize, usize)> {
    let as_int = |rate: f64, what: &str| -> Result<u64> {
        if !rate.is_finite() || rate <= 0.0 || rate.fract() != 0.0 || rate > u32::MAX as f64 {
            return Err(Error::InvalidParameter(format!(
                "{} rate must be a positive integer number of Hz, got {}",
                what, rate
            )));
        }
        Ok(rate as u64)
    };
    let src = as_int(source_rate, "source")?;
    let dst = as_int(target_rate, "target")?;
    let g = gcd(src, dst);
    Ok(((dst / g) as usize, (src / g) as usize))
}

/// Rational polyphase resampler: upsample by `up`, low-pass, keep every
/// `down`th sample. The prototype is split into `up` branches so only
/// the non-zero upsampled inputs are multiplied.
///
/// Each call processes one block from rest, with the filter delay
/// removed so output sample 0 lines up with input sample 0.
#[derive(Debug, Clone)]
pub struct Resampler {
    up: usize,
    down: usize,
    half_len: usize,
    /// branches[l][t] = h[l + t*up]
    branches: Vec<Vec<f32>>,
}

impl Resampler {
    pub fn new(up: usize, down: usize) -> Result<Self> {
        if up == 0 || down == 0 {
            return Err(Error::InvalidParameter(format!(
                "resample ratio {}/{} must be positive",
                up, down
            )));
        }
        let g = gcd(up as u64, down as u64) as usize;
        let (up, down) = (up / g, down / g);

        let max_rate = up.max(down);
        let half_len = HALF_LEN_FACTOR * max_rate;
        let num_taps = 2 * half_len + 1;
        let h = kaiser_lowpass(num_taps, 1.0 / max_rate as f64, KAISER_BETA);

        let per_branch = num_taps.div_ceil(up);
        let mut branches = vec![vec![0.0f32; per_branch]; up];
        for (j, tap) in h.iter().enumerate() {
            // Zero-stuffing divides the signal by `up`; the gain restores it.
            branches[j % up][j / up] = (tap * up as f64) as f32;
        }

        Ok(Self {
            up,
            down,
            half_len,
            branches,
        })
    }

    /// Resampler for `source_rate -> target_rate`.
    pub fn for_rates(source_rate: f64, target_rate: f64) -> Result<Self> {
        let (up, down) = rational_ratio(source_rate, target_rate)?;
        Self::new(up, down)
    }

    pub fn ratio(&self) -> (usize, usize) {
        (self.up, self.down)
    }

    /// ⌈n·up/down⌉
    pub fn output_len(&self, input_len: usize) -> usize {
        (input_len * self.up).div_ceil(self.down)
    }

    pub fn process(&self, input: &[f32]) -> Vec<f32> {
        if self.up == 1 && self.down == 1 {
            return input.to_vec();
        }
        let n = input.len();
        let out_len = self.output_len(n);
        let mut out = Vec::with_capacity(out_len);

        for m in 0..out_len {
            // Position in the upsampled stream, delay compensated.
            let p = m * self.down + self.half_len;
            let branch = &self.branches[p % self.up];
            let base = p / self.up;
            let mut acc = 0.0f32;
            for (t, tap) in branch.iter().enumerate() {
                if t > base {
                    break;
                }
                let i = base - t;
                if i < n {
                    acc += tap * input[i];
                }
            }
            out.push(acc);
        }
        out
    }
}

/// One-shot resample of `audio` from `source_rate` to `target_rate`.
/// Non-integral rates are rejected.
pub fn resample(audio: &[f32], source_rate: f64, target_rate: f64) -> Result<Vec<f32>> {
    let resampler = Resampler::for_rates(source_rate, target_rate)?;
    Ok(resampler.process(audio))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(n: usize, freq: f64, fs: f64) -> Vec<f32> {
        (0..n)
            .map(|i| (2.0 * std::f64::consts::PI * freq * i as f64 / fs).sin() as f32)
            .collect()
    }

    #[test]
    fn test_rational_ratio() {
        assert_eq!(rational_ratio(2e6, 48e3).unwrap(), (3, 125));
        assert_eq!(rational_ratio(48e3, 48e3).unwrap(), (1, 1));
        assert!(matches!(
            rational_ratio(2e6, 44100.5),
            Err(Error::InvalidParameter(_))
        ));
        assert!(rational_ratio(0.0, 48e3).is_err());
        assert!(rational_ratio(f64::NAN, 48e3).is_err());
    }

    #[test]
    fn test_output_length() {
        let r = Resampler::for_rates(2e6, 48e3).unwrap();
        assert_eq!(r.output_len(262144), 6292);
        assert_eq!(r.process(&vec![0.0; 262144]).len(), 6292);
        assert!(r.process(&[]).is_empty());
    }

    #[test]
    fn test_identity_ratio() {
        let x = sine(100, 1e3, 48e3);
        assert_eq!(resample(&x, 48e3, 48e3).unwrap(), x);
    }

    #[test]
    fn test_dc_gain() {
        let r = Resampler::new(3, 2).unwrap();
        let out = r.process(&vec![1.0; 400]);
        // Away from the edges a constant stays constant.
        for v in &out[100..500] {
            assert!((v - 1.0).abs() < 0.01, "got {}", v);
        }
    }

    #[test]
    fn test_round_trip_preserves_sine() {
        let fs = 48e3;
        let x = sine(4800, 440.0, fs);
        let down = resample(&x, fs, 16e3).unwrap();
        assert_eq!(down.len(), 1600);
        let back = resample(&down, 16e3, fs).unwrap();
        assert_eq!(back.len(), x.len());
        for i in 600..4200 {
            assert!(
                (back[i] - x[i]).abs() < 0.02,
                "sample {}: {} vs {}",
                i,
                back[i],
                x[i]
            );
        }
    }

    #[test]
    fn test_upsample_aligns() {
        // 1 kHz at 8 kHz up to 48 kHz: every 6th output lands on an input.
        let x = sine(800, 1e3, 8e3);
        let y = resample(&x, 8e3, 48e3).unwrap();
        assert_eq!(y.len(), 4800);
        for i in 200..600 {
            assert!((y[i * 6] - x[i]).abs() < 0.02, "input {}", i);
        }
    }
}
