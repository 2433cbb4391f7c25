// Copyright 2025-2026 CEMAXECUTER LLC

//! Simulated receiver for running without hardware.
//!
//! Produces a continuous complex tone at a configurable offset from the
//! tuned frequency. Failures, probe results and individual read outcomes
//! can be scripted through a shared [`SimScript`], which also records
//! every configuration call in order.

use std::collections::VecDeque;
use std::f64::consts::PI;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use num_complex::Complex32;

use crate::config::GainStage;
use crate::error::{ConfigStep, Error, Result};
use crate::{Availability, DeviceInfo, DeviceProbe, DriverFactory, ReadStatus, SdrDriver};

/// One scripted read outcome.
#[derive(Debug, Clone)]
pub enum SimRead {
    /// Fill the whole buffer with the tone
    Tone,
    Timeout,
    Overflow,
    Fatal(String),
    End,
}

/// A configuration or stream call the driver received.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverCall {
    SetSampleRate(f64),
    SetBandwidth(f64),
    SetFrequency(f64),
    SetGain(GainStage, i32),
    OpenStream,
    CloseStream,
}

impl DriverCall {
    pub fn step(&self) -> Option<ConfigStep> {
        match self {
            DriverCall::SetSampleRate(_) => Some(ConfigStep::SampleRate),
            DriverCall::SetBandwidth(_) => Some(ConfigStep::Bandwidth),
            DriverCall::SetFrequency(_) => Some(ConfigStep::Frequency),
            DriverCall::SetGain(GainStage::Lna, _) => Some(ConfigStep::LnaGain),
            DriverCall::SetGain(GainStage::Vga, _) => Some(ConfigStep::VgaGain),
            _ => None,
        }
    }
}

struct ScriptState {
    calls: Vec<DriverCall>,
    reads: VecDeque<SimRead>,
    failing_steps: Vec<(ConfigStep, String)>,
    open_stream_failures: usize,
    opens: VecDeque<Result<()>>,
    availability: Availability,
    reset_result: Result<()>,
    tone_offset: f64,
    amplitude: f32,
    read_delay: Duration,
    open_count: usize,
    probe_count: usize,
    reset_count: usize,
    read_count: usize,
}

impl Default for ScriptState {
    fn default() -> Self {
        Self {
            calls: Vec::new(),
            reads: VecDeque::new(),
            failing_steps: Vec::new(),
            open_stream_failures: 0,
            opens: VecDeque::new(),
            availability: Availability::Available,
            reset_result: Ok(()),
            tone_offset: 100e3,
            amplitude: 0.5,
            read_delay: Duration::ZERO,
            open_count: 0,
            probe_count: 0,
            reset_count: 0,
            read_count: 0,
        }
    }
}

/// Shared behavior and call log for the simulated driver, factory and probe.
#[derive(Clone, Default)]
pub struct SimScript {
    state: Arc<Mutex<ScriptState>>,
}

impl SimScript {
    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        // A panicking test thread must not hide the log from the others.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn push_read(&self, read: SimRead) {
        self.lock().reads.push_back(read);
    }

    pub fn fail_step(&self, step: ConfigStep, message: impl Into<String>) {
        self.lock().failing_steps.push((step, message.into()));
    }

    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.failing_steps.clear();
        state.open_stream_failures = 0;
    }

    pub fn fail_open_stream(&self, times: usize) {
        self.lock().open_stream_failures = times;
    }

    /// Queue the outcome of the next factory `open()`.
    pub fn push_open(&self, result: Result<()>) {
        self.lock().opens.push_back(result);
    }

    pub fn set_availability(&self, availability: Availability) {
        self.lock().availability = availability;
    }

    pub fn set_reset_result(&self, result: Result<()>) {
        self.lock().reset_result = result;
    }

    pub fn set_tone(&self, offset_hz: f64, amplitude: f32) {
        let mut state = self.lock();
        state.tone_offset = offset_hz;
        state.amplitude = amplitude;
    }

    /// Extra time spent inside every read, ignoring the read timeout.
    pub fn set_read_delay(&self, delay: Duration) {
        self.lock().read_delay = delay;
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn open_count(&self) -> usize {
        self.lock().open_count
    }

    pub fn probe_count(&self) -> usize {
        self.lock().probe_count
    }

    pub fn reset_count(&self) -> usize {
        self.lock().reset_count
    }

    pub fn read_count(&self) -> usize {
        self.lock().read_count
    }
}

pub struct SimDriver {
    script: SimScript,
    stream_open: bool,
    sample_rate: f64,
    phase: f64,
    lna_gain: i32,
    vga_gain: i32,
}

impl SimDriver {
    pub fn new(script: SimScript) -> Self {
        Self {
            script,
            stream_open: false,
            sample_rate: 2e6,
            phase: 0.0,
            lna_gain: 0,
            vga_gain: 0,
        }
    }

    fn record(&self, call: DriverCall) -> Result<()> {
        let mut state = self.script.lock();
        let step = call.step();
        state.calls.push(call);
        if let Some(step) = step {
            if let Some((_, msg)) = state.failing_steps.iter().find(|(s, _)| *s == step) {
                return Err(Error::hardware("sim", msg.clone()));
            }
        }
        Ok(())
    }

    fn fill_tone(&mut self, buf: &mut [Complex32], offset: f64, amplitude: f32) {
        let step = 2.0 * PI * offset / self.sample_rate;
        for sample in buf.iter_mut() {
            *sample = Complex32::new(
                amplitude * self.phase.cos() as f32,
                amplitude * self.phase.sin() as f32,
            );
            self.phase = (self.phase + step) % (2.0 * PI);
        }
    }
}

impl SdrDriver for SimDriver {
    fn set_sample_rate(&mut self, rate: f64) -> Result<()> {
        self.record(DriverCall::SetSampleRate(rate))?;
        self.sample_rate = rate;
        Ok(())
    }

    fn set_bandwidth(&mut self, bandwidth: f64) -> Result<()> {
        self.record(DriverCall::SetBandwidth(bandwidth))
    }

    fn set_frequency(&mut self, freq: f64) -> Result<()> {
        self.record(DriverCall::SetFrequency(freq))
    }

    fn set_gain(&mut self, stage: GainStage, value: i32) -> Result<()> {
        self.record(DriverCall::SetGain(stage, value))?;
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
        self.record(DriverCall::OpenStream)?;
        {
            let mut state = self.script.lock();
            if state.open_stream_failures > 0 {
                state.open_stream_failures -= 1;
                return Err(Error::StreamSetupFailed("simulated setupStream failure".into()));
            }
        }
        self.stream_open = true;
        Ok(())
    }

    fn read_stream(&mut self, buf: &mut [Complex32], timeout: Duration) -> ReadStatus {
        if !self.stream_open {
            return ReadStatus::Error(Error::ReadFatal("stream not open".into()));
        }
        let (next, delay, offset, amplitude) = {
            let mut state = self.script.lock();
            state.read_count += 1;
            (
                state.reads.pop_front().unwrap_or(SimRead::Tone),
                state.read_delay,
                state.tone_offset,
                state.amplitude,
            )
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        match next {
            SimRead::Tone => {
                self.fill_tone(buf, offset, amplitude);
                ReadStatus::Samples(buf.len())
            }
            SimRead::Timeout => {
                std::thread::sleep(timeout.min(Duration::from_millis(5)));
                ReadStatus::Timeout
            }
            SimRead::Overflow => ReadStatus::Overflow,
            SimRead::Fatal(msg) => ReadStatus::Error(Error::ReadFatal(msg)),
            SimRead::End => ReadStatus::EndOfStream,
        }
    }

    fn close_stream(&mut self) {
        if self.stream_open {
            self.stream_open = false;
            self.script.lock().calls.push(DriverCall::CloseStream);
        }
    }
}

/// Opens [`SimDriver`]s; the next outcome can be scripted with
/// [`SimScript::push_open`].
#[derive(Clone, Default)]
pub struct SimFactory {
    script: SimScript,
}

impl SimFactory {
    pub fn new(script: SimScript) -> Self {
        Self { script }
    }
}

impl DriverFactory for SimFactory {
    fn name(&self) -> &str {
        "sim"
    }

    fn enumerate(&self) -> Result<Vec<DeviceInfo>> {
        if self.script.lock().availability == Availability::NotFound {
            return Ok(Vec::new());
        }
        Ok(vec![DeviceInfo {
            serial: "0000000000000000".to_string(),
            driver: "sim".to_string(),
            label: "Simulated HackRF".to_string(),
        }])
    }

    fn open(&self) -> Result<Box<dyn SdrDriver>> {
        let outcome = {
            let mut state = self.script.lock();
            state.open_count += 1;
            state.opens.pop_front().unwrap_or(Ok(()))
        };
        outcome?;
        Ok(Box::new(SimDriver::new(self.script.clone())))
    }
}

#[derive(Clone, Default)]
pub struct SimProbe {
    script: SimScript,
}

impl SimProbe {
    pub fn new(script: SimScript) -> Self {
        Self { script }
    }
}

impl DeviceProbe for SimProbe {
    fn probe(&self) -> Availability {
        let mut state = self.script.lock();
        state.probe_count += 1;
        state.availability
    }

    fn reset(&self) -> Result<()> {
        let mut state = self.script.lock();
        state.reset_count += 1;
        state.reset_result.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tone_is_continuous_across_reads() {
        let script = SimScript::default();
        script.set_tone(250e3, 1.0);
        let mut driver = SimDriver::new(script);
        driver.set_sample_rate(1e6).unwrap();
        driver.open_stream().unwrap();

        let mut a = vec![Complex32::new(0.0, 0.0); 8];
        let mut b = vec![Complex32::new(0.0, 0.0); 8];
        assert!(matches!(driver.read_stream(&mut a, Duration::ZERO), ReadStatus::Samples(8)));
        assert!(matches!(driver.read_stream(&mut b, Duration::ZERO), ReadStatus::Samples(8)));

        // fs/4 tone: each sample rotates by 90 degrees, including across reads
        let rot = b[0] * a[7].conj();
        assert!(rot.re.abs() < 1e-5 && (rot.im - 1.0).abs() < 1e-5, "rotation {}", rot);
    }

    #[test]
    fn test_scripted_reads_then_tone() {
        let script = SimScript::default();
        script.push_read(SimRead::Overflow);
        script.push_read(SimRead::Fatal("usb gone".into()));
        let mut driver = SimDriver::new(script.clone());
        driver.open_stream().unwrap();
        let mut buf = vec![Complex32::new(0.0, 0.0); 4];
        assert!(matches!(driver.read_stream(&mut buf, Duration::ZERO), ReadStatus::Overflow));
        assert!(matches!(
            driver.read_stream(&mut buf, Duration::ZERO),
            ReadStatus::Error(Error::ReadFatal(_))
        ));
        assert!(matches!(driver.read_stream(&mut buf, Duration::ZERO), ReadStatus::Samples(4)));
        assert_eq!(script.read_count(), 3);
    }

    #[test]
    fn test_failing_step_is_recorded() {
        let script = SimScript::default();
        script.fail_step(ConfigStep::Frequency, "PLL unlock");
        let mut driver = SimDriver::new(script.clone());
        assert!(driver.set_frequency(6e9).is_err());
        assert_eq!(script.calls(), vec![DriverCall::SetFrequency(6e9)]);
    }
}
