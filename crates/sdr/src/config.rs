// Copyright 2025-2026 CEMAXECUTER LLC

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// HackRF LNA (IF) gain: 0-40 dB in 8 dB steps.
pub const LNA_GAIN_MAX: i32 = 40;
pub const LNA_GAIN_STEP: i32 = 8;
/// HackRF VGA (baseband) gain: 0-62 dB in 2 dB steps.
pub const VGA_GAIN_MAX: i32 = 62;
pub const VGA_GAIN_STEP: i32 = 2;
/// HackRF sample rate ceiling.
pub const MAX_SAMPLE_RATE: f64 = 20e6;

/// The two gain stages in front of the HackRF ADC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GainStage {
    Lna,
    Vga,
}

impl GainStage {
    /// Gain element name as SoapySDR and libhackrf call it.
    pub fn name(&self) -> &'static str {
        match self {
            GainStage::Lna => "LNA",
            GainStage::Vga => "VGA",
        }
    }

    fn limits(&self) -> (i32, i32) {
        match self {
            GainStage::Lna => (LNA_GAIN_MAX, LNA_GAIN_STEP),
            GainStage::Vga => (VGA_GAIN_MAX, VGA_GAIN_STEP),
        }
    }

    pub fn validate(&self, value: i32) -> Result<()> {
        let (max, step) = self.limits();
        if !(0..=max).contains(&value) || value % step != 0 {
            return Err(Error::InvalidParameter(format!(
                "{} gain {} dB (expected 0-{} in {} dB steps)",
                self.name(),
                value,
                max,
                step
            )));
        }
        Ok(())
    }
}

/// Receiver parameters. Never mutated while a read is in flight: changes
/// produce a new value that goes through the controller or supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Hz
    pub sample_rate: f64,
    /// Hz
    pub center_freq: f64,
    /// Hz
    pub bandwidth: f64,
    pub lna_gain: i32,
    pub vga_gain: i32,
    /// Complex samples per read
    pub buffer_size: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            sample_rate: 2e6,
            center_freq: 100e6,
            bandwidth: 2.5e6,
            lna_gain: 32,
            vga_gain: 20,
            buffer_size: 256 * 1024,
        }
    }
}

impl DeviceConfig {
    pub fn validate(&self) -> Result<()> {
        let positive = |name: &str, v: f64| {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(Error::InvalidParameter(format!("{} must be positive, got {}", name, v)))
            }
        };
        positive("sample_rate", self.sample_rate)?;
        positive("center_freq", self.center_freq)?;
        positive("bandwidth", self.bandwidth)?;
        if self.sample_rate > MAX_SAMPLE_RATE {
            return Err(Error::InvalidParameter(format!(
                "sample rate {} exceeds {} MS/s",
                self.sample_rate,
                MAX_SAMPLE_RATE / 1e6
            )));
        }
        if self.buffer_size == 0 {
            return Err(Error::InvalidParameter("buffer_size must be non-zero".into()));
        }
        GainStage::Lna.validate(self.lna_gain)?;
        GainStage::Vga.validate(self.vga_gain)?;
        Ok(())
    }

    pub fn with_frequency(self, center_freq: f64) -> Self {
        Self { center_freq, ..self }
    }

    pub fn with_gains(self, lna_gain: i32, vga_gain: i32) -> Self {
        Self {
            lna_gain,
            vga_gain,
            ..self
        }
    }

    pub fn gain(&self, stage: GainStage) -> i32 {
        match stage {
            GainStage::Lna => self.lna_gain,
            GainStage::Vga => self.vga_gain,
        }
    }
}
