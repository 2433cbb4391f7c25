// Copyright 2025-2026 CEMAXECUTER LLC

//! Availability probe and reset through the hackrf host tools.
//!
//! `hackrf_info` tells the three cases apart without claiming the device
//! for longer than the query, and `hackrf_spiflash -R` resets the MCU.

use std::io;
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::{Availability, DeviceProbe};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

pub struct HackrfTools {
    info_program: String,
    reset_program: String,
    reset_args: Vec<String>,
    timeout: Duration,
}

impl Default for HackrfTools {
    fn default() -> Self {
        Self {
            info_program: "hackrf_info".to_string(),
            reset_program: "hackrf_spiflash".to_string(),
            reset_args: vec!["-R".to_string()],
            timeout: Duration::from_secs(2),
        }
    }
}

impl HackrfTools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_programs(mut self, info: &str, reset: &str, reset_args: &[&str]) -> Self {
        self.info_program = info.to_string();
        self.reset_program = reset.to_string();
        self.reset_args = reset_args.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Run a tool, killing it if it outlives the timeout. `Ok(None)` means
    /// it was killed.
    fn run(&self, program: &str, args: &[String]) -> io::Result<Option<Output>> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let deadline = Instant::now() + self.timeout;
        loop {
            if child.try_wait()?.is_some() {
                return child.wait_with_output().map(Some);
            }
            if Instant::now() >= deadline {
                log::warn!("{} did not exit within {:?}, killing it", program, self.timeout);
                let _ = child.kill();
                let _ = child.wait();
                return Ok(None);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

/// Map `hackrf_info` output to an availability.
pub fn classify_info_output(success: bool, stdout: &str, stderr: &str) -> Availability {
    let text = format!("{}\n{}", stdout, stderr).to_ascii_lowercase();
    if text.contains("no hackrf boards found") || text.contains("hackrf_error_not_found") {
        Availability::NotFound
    } else if text.contains("busy") || text.contains("hackrf_error_libusb") {
        Availability::Busy
    } else if success && text.contains("found hackrf") {
        Availability::Available
    } else if success {
        // Older tool versions print only the board details.
        if text.contains("serial number") {
            Availability::Available
        } else {
            Availability::NotFound
        }
    } else {
        Availability::Busy
    }
}

impl DeviceProbe for HackrfTools {
    fn probe(&self) -> Availability {
        match self.run(&self.info_program, &[]) {
            Ok(Some(output)) => classify_info_output(
                output.status.success(),
                &String::from_utf8_lossy(&output.stdout),
                &String::from_utf8_lossy(&output.stderr),
            ),
            Ok(None) => Availability::Busy,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::warn!("{} not installed, treating device as absent", self.info_program);
                Availability::NotFound
            }
            Err(e) => {
                log::warn!("failed to run {}: {}", self.info_program, e);
                Availability::NotFound
            }
        }
    }

    fn reset(&self) -> Result<()> {
        let output = self
            .run(&self.reset_program, &self.reset_args)
            .map_err(|e| Error::hardware("device reset", format!("{}: {}", self.reset_program, e)))?
            .ok_or_else(|| Error::hardware("device reset", format!("{} timed out", self.reset_program)))?;
        if output.status.success() {
            log::info!("{} {} completed", self.reset_program, self.reset_args.join(" "));
            Ok(())
        } else {
            Err(Error::hardware(
                "device reset",
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}
