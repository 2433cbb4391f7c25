// Copyright 2025-2026 CEMAXECUTER LLC

use std::fs::File;
use std::io::{self, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant};

use byteorder::{LittleEndian, ReadBytesExt};
use num_complex::Complex32;

use crate::config::GainStage;
use crate::error::{Error, Result};
use crate::{Availability, DeviceInfo, DeviceProbe, DriverFactory, ReadStatus, SdrDriver};

/// IQ sample format for file input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    /// Complex int8 (CS8): pairs of i8
    Ci8,
    /// Complex int16 (CS16): pairs of i16, little-endian
    Ci16,
    /// Complex float32 (CF32): pairs of f32, little-endian
    Cf32,
}

impl FromStr for SampleFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ci8" | "cs8" => Ok(SampleFormat::Ci8),
            "ci16" | "cs16" => Ok(SampleFormat::Ci16),
            "cf32" | "fc32" => Ok(SampleFormat::Cf32),
            other => Err(Error::InvalidParameter(format!(
                "unknown sample format: {} (use ci8, ci16, or cf32)",
                other
            ))),
        }
    }
}

impl SampleFormat {
    fn read_sample(&self, reader: &mut impl io::Read) -> io::Result<Complex32> {
        Ok(match self {
            SampleFormat::Ci8 => {
                let i = reader.read_i8()?;
                let q = reader.read_i8()?;
                Complex32::new(i as f32 / 128.0, q as f32 / 128.0)
            }
            SampleFormat::Ci16 => {
                let i = reader.read_i16::<LittleEndian>()?;
                let q = reader.read_i16::<LittleEndian>()?;
                Complex32::new(i as f32 / 32768.0, q as f32 / 32768.0)
            }
            SampleFormat::Cf32 => {
                let i = reader.read_f32::<LittleEndian>()?;
                let q = reader.read_f32::<LittleEndian>()?;
                Complex32::new(i, q)
            }
        })
    }
}

/// Replays a recorded IQ file as if it were a receiver. Tuning calls are
/// accepted and remembered; only the sample rate has an effect (pacing).
pub struct FileDriver {
    path: PathBuf,
    format: SampleFormat,
    looping: bool,
    realtime: bool,
    reader: Option<BufReader<File>>,
    sample_rate: f64,
    lna_gain: i32,
    vga_gain: i32,
    started: Option<Instant>,
    delivered: u64,
}

impl FileDriver {
    pub fn new(path: impl Into<PathBuf>, format: SampleFormat) -> Self {
        Self {
            path: path.into(),
            format,
            looping: false,
            realtime: false,
            reader: None,
            sample_rate: 2e6,
            lna_gain: 0,
            vga_gain: 0,
            started: None,
            delivered: 0,
        }
    }

    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    /// Deliver samples no faster than the configured sample rate.
    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    /// Time until the next block is due, if pacing says we are early.
    fn ahead_by(&self, samples: usize) -> Option<Duration> {
        let started = self.started?;
        let due = (self.delivered + samples as u64) as f64 / self.sample_rate;
        let elapsed = started.elapsed().as_secs_f64();
        (due > elapsed).then(|| Duration::from_secs_f64(due - elapsed))
    }

    fn fill(&mut self, buf: &mut [Complex32]) -> io::Result<usize> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(0);
        };
        let mut n = 0;
        // A file shorter than one sample must not rewind forever.
        let mut rewound = false;
        while n < buf.len() {
            match self.format.read_sample(reader) {
                Ok(sample) => {
                    buf[n] = sample;
                    n += 1;
                    rewound = false;
                }
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    if !self.looping || rewound {
                        break;
                    }
                    reader.seek(SeekFrom::Start(0))?;
                    rewound = true;
                    log::debug!("end of {}, rewinding", self.path.display());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(n)
    }
}

impl SdrDriver for FileDriver {
    fn set_sample_rate(&mut self, rate: f64) -> Result<()> {
        self.sample_rate = rate;
        Ok(())
    }

    fn set_bandwidth(&mut self, _bandwidth: f64) -> Result<()> {
        Ok(())
    }

    fn set_frequency(&mut self, _freq: f64) -> Result<()> {
        Ok(())
    }

    fn set_gain(&mut self, stage: GainStage, value: i32) -> Result<()> {
        match stage {
            GainStage::Lna => self.lna_gain = value,
            GainStage::Vga => self.vga_gain = value,
        }
        Ok(())
    }

    fn gain(&self, stage: GainStage) -> Result<f64> {
        Ok(match stage {
            GainStage::Lna => self.lna_gain as f64,
            GainStage::Vga => self.vga_gain as f64,
        })
    }

    fn open_stream(&mut self) -> Result<()> {
        let file = File::open(&self.path).map_err(|e| {
            Error::StreamSetupFailed(format!("failed to open {}: {}", self.path.display(), e))
        })?;
        self.reader = Some(BufReader::with_capacity(1024 * 1024, file));
        self.started = Some(Instant::now());
        self.delivered = 0;
        log::info!(
            "reading IQ from {} ({:?}, {} Hz{})",
            self.path.display(),
            self.format,
            self.sample_rate,
            if self.looping { ", looping" } else { "" }
        );
        Ok(())
    }

    fn read_stream(&mut self, buf: &mut [Complex32], timeout: Duration) -> ReadStatus {
        if self.reader.is_none() {
            return ReadStatus::Error(Error::ReadFatal("stream not open".into()));
        }
        if self.realtime {
            if let Some(wait) = self.ahead_by(buf.len()) {
                std::thread::sleep(wait.min(timeout));
                if wait > timeout {
                    return ReadStatus::Timeout;
                }
            }
        }
        match self.fill(buf) {
            Ok(0) => ReadStatus::EndOfStream,
            Ok(n) => {
                self.delivered += n as u64;
                ReadStatus::Samples(n)
            }
            Err(e) => ReadStatus::Error(Error::ReadFatal(format!("read error: {}", e))),
        }
    }

    fn close_stream(&mut self) {
        if self.reader.take().is_some() {
            log::info!("closed {}", self.path.display());
        }
    }
}

/// Opens [`FileDriver`]s over one recording.
pub struct FileFactory {
    path: PathBuf,
    format: SampleFormat,
    looping: bool,
    realtime: bool,
}

impl FileFactory {
    pub fn new(path: impl Into<PathBuf>, format: SampleFormat, looping: bool, realtime: bool) -> Self {
        Self {
            path: path.into(),
            format,
            looping,
            realtime,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DriverFactory for FileFactory {
    fn name(&self) -> &str {
        "file"
    }

    fn enumerate(&self) -> Result<Vec<DeviceInfo>> {
        if !self.path.is_file() {
            return Ok(Vec::new());
        }
        Ok(vec![DeviceInfo {
            serial: self.path.display().to_string(),
            driver: "file".to_string(),
            label: format!("IQ file ({:?})", self.format),
        }])
    }

    fn open(&self) -> Result<Box<dyn SdrDriver>> {
        if !self.path.is_file() {
            return Err(Error::DeviceNotFound);
        }
        Ok(Box::new(
            FileDriver::new(&self.path, self.format)
                .looping(self.looping)
                .realtime(self.realtime),
        ))
    }
}

/// A recording is available when the file exists; there is nothing to reset.
pub struct FileProbe {
    path: PathBuf,
}

impl FileProbe {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl DeviceProbe for FileProbe {
    fn probe(&self) -> Availability {
        if self.path.is_file() {
            Availability::Available
        } else {
            Availability::NotFound
        }
    }

    fn reset(&self) -> Result<()> {
        Ok(())
    }
}
