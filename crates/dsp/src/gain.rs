use std::ops::Mul;

use crate::error::{Error, Result};

/// Linear amplitude factor for a gain in dB.
pub fn db_to_amplitude(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

/// Scale every sample by `10^(db/20)`. Works for real audio and complex
/// baseband alike.
pub fn apply_gain_db<T>(samples: &[T], db: f32) -> Result<Vec<T>>
where
    T: Copy + Mul<f32, Output = T>,
{
    if !db.is_finite() {
        return Err(Error::InvalidParameter(format!("gain must be finite, got {} dB", db)));
    }
    let scale = db_to_amplitude(db);
    Ok(samples.iter().map(|&s| s * scale).collect())
}
