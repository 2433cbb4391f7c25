// Copyright 2025-2026 CEMAXECUTER LLC

use std::fmt;

use thiserror::Error;

/// How a failure should be handled by whoever observed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Timeout or overflow; retry the same call.
    Transient,
    /// The device is held elsewhere; needs the reset sequence.
    Busy,
    /// Malformed handle, unsupported parameter, vanished hardware.
    Fatal,
}

/// One step of applying a [`DeviceConfig`](crate::DeviceConfig) to hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigStep {
    SampleRate,
    Bandwidth,
    Frequency,
    LnaGain,
    VgaGain,
}

impl fmt::Display for ConfigStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConfigStep::SampleRate => "sample rate",
            ConfigStep::Bandwidth => "bandwidth",
            ConfigStep::Frequency => "frequency",
            ConfigStep::LnaGain => "LNA gain",
            ConfigStep::VgaGain => "VGA gain",
        };
        f.write_str(name)
    }
}

/// Outcome of a partially failed apply. Steps that succeeded stay applied.
#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    pub applied: Vec<ConfigStep>,
    pub failed: Vec<(ConfigStep, String)>,
}

impl ApplyReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

impl fmt::Display for ApplyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} step(s) applied, failed:", self.applied.len())?;
        for (step, msg) in &self.failed {
            write!(f, " [{}: {}]", step, msg)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("no HackRF device found")]
    DeviceNotFound,
    #[error("device busy: {0}")]
    DeviceBusy(String),
    #[error("device initialization failed: {0}")]
    InitializationFailed(String),
    #[error("stream setup failed: {0}")]
    StreamSetupFailed(String),
    #[error("read timed out")]
    ReadTimeout,
    #[error("read overflow, samples lost in driver")]
    ReadOverflow,
    #[error("fatal read error: {0}")]
    ReadFatal(String),
    #[error("queue saturated, item dropped")]
    QueueSaturated,
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("configuration partially applied: {0}")]
    PartialApply(ApplyReport),
    #[error("a streaming session is active")]
    SessionActive,
    #[error("device not initialized")]
    NoDevice,
    #[error("no streaming session")]
    NoSession,
    #[error("a frequency sweep is already running")]
    SweepActive,
    #[error("device handle faulted and must be recreated")]
    HandleFaulted,
    #[error("{call} failed: {message}")]
    Hardware {
        call: &'static str,
        message: String,
        class: ErrorClass,
    },
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::ReadTimeout | Error::ReadOverflow | Error::QueueSaturated => {
                ErrorClass::Transient
            }
            Error::DeviceBusy(_) => ErrorClass::Busy,
            Error::Hardware { class, .. } => *class,
            _ => ErrorClass::Fatal,
        }
    }

    /// Shorthand for a fatal driver-call failure.
    pub fn hardware(call: &'static str, message: impl Into<String>) -> Self {
        Error::Hardware {
            call,
            message: message.into(),
            class: ErrorClass::Fatal,
        }
    }
}

/// Classify a driver error string. libusb and SoapySDR report a claimed
/// device as "busy" / "resource busy" / LIBUSB_ERROR_BUSY.
pub fn classify_message(message: &str) -> ErrorClass {
    let lower = message.to_ascii_lowercase();
    if lower.contains("busy") || lower.contains("access denied") {
        ErrorClass::Busy
    } else if lower.contains("timeout") || lower.contains("overflow") {
        ErrorClass::Transient
    } else {
        ErrorClass::Fatal
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(Error::ReadTimeout.class(), ErrorClass::Transient);
        assert_eq!(Error::ReadOverflow.class(), ErrorClass::Transient);
        assert_eq!(Error::DeviceBusy("held".into()).class(), ErrorClass::Busy);
        assert_eq!(
            Error::InvalidParameter("lna".into()).class(),
            ErrorClass::Fatal
        );
        let hw = Error::Hardware {
            call: "setupStream",
            message: "LIBUSB_ERROR_BUSY".into(),
            class: ErrorClass::Busy,
        };
        assert_eq!(hw.class(), ErrorClass::Busy);
    }

    #[test]
    fn test_classify_message() {
        assert_eq!(classify_message("Resource busy"), ErrorClass::Busy);
        assert_eq!(classify_message("hackrf_open() failed: HACKRF_ERROR_LIBUSB (-1000) busy"), ErrorClass::Busy);
        assert_eq!(classify_message("read timeout"), ErrorClass::Transient);
        assert_eq!(classify_message("no such device"), ErrorClass::Fatal);
    }

    #[test]
    fn test_apply_report_display() {
        let report = ApplyReport {
            applied: vec![ConfigStep::SampleRate],
            failed: vec![(ConfigStep::Frequency, "out of range".into())],
        };
        assert!(!report.is_complete());
        let text = report.to_string();
        assert!(text.contains("frequency: out of range"), "got {}", text);
    }
}
