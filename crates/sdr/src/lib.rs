pub mod config;
pub mod controller;
pub mod error;
pub mod file;
pub mod handle;
pub mod sim;
pub mod tools;

#[cfg(feature = "hackrf")]
pub mod hackrf;

#[cfg(feature = "soapysdr")]
pub mod soapysdr;

use std::time::{Duration, SystemTime};

use num_complex::Complex32;

pub use config::{DeviceConfig, GainStage};
pub use controller::{ControllerTimings, DeviceController};
pub use error::{ApplyReport, ConfigStep, Error, ErrorClass, Result};
pub use handle::DeviceHandle;

/// A block of complex baseband samples stamped with the tuning that was
/// active when it was read. Moved, never shared, from the reader onward.
#[derive(Debug, Clone)]
pub struct SampleBlock {
    pub samples: Vec<Complex32>,
    /// Hz
    pub center_freq: f64,
    /// Hz
    pub sample_rate: f64,
    pub captured_at: SystemTime,
    /// Position in capture order within one session, starting at 0.
    pub sequence: u64,
}

impl SampleBlock {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Result of one timed read against an active stream.
#[derive(Debug)]
pub enum ReadStatus {
    /// Number of complex samples written to the front of the buffer
    Samples(usize),
    Timeout,
    /// Samples were lost in the driver/hardware
    Overflow,
    /// Finite sources (files) ran out
    EndOfStream,
    Error(Error),
}

/// What an availability probe found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Available,
    /// Present but claimed by another process
    Busy,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub serial: String,
    pub driver: String,
    pub label: String,
}

/// Low-level receiver backend. All calls block; only one thread at a time
/// drives a given instance (see [`DeviceHandle`]).
pub trait SdrDriver: Send {
    fn set_sample_rate(&mut self, rate: f64) -> Result<()>;

    fn set_bandwidth(&mut self, bandwidth: f64) -> Result<()>;

    fn set_frequency(&mut self, freq: f64) -> Result<()>;

    fn set_gain(&mut self, stage: GainStage, value: i32) -> Result<()>;

    fn gain(&self, stage: GainStage) -> Result<f64>;

    /// Set up and activate the RX stream.
    fn open_stream(&mut self) -> Result<()>;

    /// Read up to `buf.len()` samples, waiting at most `timeout`.
    fn read_stream(&mut self, buf: &mut [Complex32], timeout: Duration) -> ReadStatus;

    /// Deactivate and close the RX stream. No-op when none is open.
    fn close_stream(&mut self);
}

/// Opens drivers for one kind of hardware.
pub trait DriverFactory: Send + Sync {
    fn name(&self) -> &str;

    fn enumerate(&self) -> Result<Vec<DeviceInfo>>;

    fn open(&self) -> Result<Box<dyn SdrDriver>>;
}

/// Out-of-band availability check and hardware reset.
pub trait DeviceProbe: Send + Sync {
    fn probe(&self) -> Availability;

    fn reset(&self) -> Result<()>;
}
