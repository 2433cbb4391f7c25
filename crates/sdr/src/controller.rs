// Copyright 2025-2026 CEMAXECUTER LLC

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel;

use crate::config::{DeviceConfig, GainStage};
use crate::error::{ApplyReport, ConfigStep, Error, ErrorClass, Result};
use crate::handle::DeviceHandle;
use crate::{Availability, DeviceInfo, DeviceProbe, DriverFactory, SdrDriver};

/// Hardware apply order. Sample rate and bandwidth go before the
/// frequency, which only takes full effect once both are set.
pub const APPLY_ORDER: [ConfigStep; 5] = [
    ConfigStep::SampleRate,
    ConfigStep::Bandwidth,
    ConfigStep::Frequency,
    ConfigStep::LnaGain,
    ConfigStep::VgaGain,
];

#[derive(Debug, Clone, Copy)]
pub struct ControllerTimings {
    /// Minimum spacing between two initialize attempts
    pub cooldown: Duration,
    pub probe_timeout: Duration,
    /// Pause after closing a stale handle, before the reset command
    pub busy_settle: Duration,
    /// Pause after the reset command, before retrying
    pub reset_settle: Duration,
}

impl Default for ControllerTimings {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(2),
            busy_settle: Duration::from_millis(500),
            reset_settle: Duration::from_secs(3),
        }
    }
}

impl ControllerTimings {
    pub fn immediate() -> Self {
        Self {
            cooldown: Duration::ZERO,
            probe_timeout: Duration::from_secs(2),
            busy_settle: Duration::ZERO,
            reset_settle: Duration::ZERO,
        }
    }
}

/// Push every field of `config` to the driver in [`APPLY_ORDER`].
///
/// A failing step does not stop the remaining ones and nothing is rolled
/// back; the caller gets [`Error::PartialApply`] listing both sides.
pub fn apply_config(driver: &mut dyn SdrDriver, config: &DeviceConfig) -> Result<()> {
    let mut report = ApplyReport::default();
    for step in APPLY_ORDER {
        let result = match step {
            ConfigStep::SampleRate => driver.set_sample_rate(config.sample_rate),
            ConfigStep::Bandwidth => driver.set_bandwidth(config.bandwidth),
            ConfigStep::Frequency => driver.set_frequency(config.center_freq),
            ConfigStep::LnaGain => driver.set_gain(GainStage::Lna, config.lna_gain),
            ConfigStep::VgaGain => driver.set_gain(GainStage::Vga, config.vga_gain),
        };
        match result {
            Ok(()) => report.applied.push(step),
            Err(e) => {
                log::warn!("failed to set {}: {}", step, e);
                report.failed.push((step, e.to_string()));
            }
        }
    }
    if report.is_complete() {
        Ok(())
    } else {
        Err(Error::PartialApply(report))
    }
}

/// Owns the single live [`DeviceHandle`] and everything that touches the
/// hardware outside of a running stream.
pub struct DeviceController {
    factory: Arc<dyn DriverFactory>,
    probe: Arc<dyn DeviceProbe>,
    timings: ControllerTimings,
    handle: Option<DeviceHandle>,
    config: DeviceConfig,
    last_init: Option<Instant>,
}

impl DeviceController {
    pub fn new(factory: Arc<dyn DriverFactory>, probe: Arc<dyn DeviceProbe>) -> Self {
        Self {
            factory,
            probe,
            timings: ControllerTimings::default(),
            handle: None,
            config: DeviceConfig::default(),
            last_init: None,
        }
    }

    pub fn with_timings(mut self, timings: ControllerTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn handle(&self) -> Option<&DeviceHandle> {
        self.handle.as_ref()
    }

    /// Last configuration successfully pushed through this controller.
    pub fn config(&self) -> DeviceConfig {
        self.config
    }

    pub fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        self.factory.enumerate()
    }

    /// Time-bounded availability check. A probe that does not answer in
    /// time is reported as `Busy`: the device is there but not responding.
    pub fn probe_availability(&self) -> Availability {
        let probe = self.probe.clone();
        let (tx, rx) = channel::bounded(1);
        let spawned = thread::Builder::new()
            .name("rf-probe".to_string())
            .spawn(move || {
                let _ = tx.send(probe.probe());
            });
        if let Err(e) = spawned {
            log::warn!("could not spawn probe thread ({}), probing inline", e);
            return self.probe.probe();
        }
        match rx.recv_timeout(self.timings.probe_timeout) {
            Ok(availability) => {
                log::debug!("probe: {:?}", availability);
                availability
            }
            Err(_) => {
                log::warn!(
                    "availability probe did not answer within {:?}",
                    self.timings.probe_timeout
                );
                Availability::Busy
            }
        }
    }

    /// Open the device and apply `config`.
    ///
    /// A live handle is reused, with `config` applied to it if it differs
    /// from the last one (`SessionActive` while it streams). Calls closer
    /// together than the cooldown are delayed. A busy device gets exactly
    /// one reset-and-retry; if that fails the result is
    /// `InitializationFailed`.
    pub fn initialize(&mut self, config: &DeviceConfig) -> Result<DeviceHandle> {
        config.validate()?;
        if let Some(handle) = self.handle.clone() {
            if !handle.is_faulted() && !handle.is_released() {
                if self.config != *config {
                    self.reapply(&handle, config)?;
                }
                return Ok(handle);
            }
            log::info!("discarding faulted device handle #{}", handle.id());
            self.discard_handle();
        }

        self.wait_cooldown();
        let result = self.initialize_inner(config);
        self.last_init = Some(Instant::now());
        result
    }

    fn initialize_inner(&mut self, config: &DeviceConfig) -> Result<DeviceHandle> {
        match self.probe_availability() {
            Availability::NotFound => Err(Error::DeviceNotFound),
            Availability::Busy => {
                log::warn!("device reported busy before open");
                self.recover_busy();
                self.open_and_apply(config).map_err(after_reset)
            }
            Availability::Available => match self.open_and_apply(config) {
                Err(e) if e.class() == ErrorClass::Busy => {
                    log::warn!("device busy on open: {}", e);
                    self.recover_busy();
                    self.open_and_apply(config).map_err(after_reset)
                }
                Err(Error::DeviceNotFound) => Err(Error::DeviceNotFound),
                Err(e @ Error::InitializationFailed(_)) => Err(e),
                Err(e) => Err(Error::InitializationFailed(e.to_string())),
                Ok(handle) => Ok(handle),
            },
        }
    }

    fn wait_cooldown(&self) {
        if let Some(last) = self.last_init {
            let elapsed = last.elapsed();
            if elapsed < self.timings.cooldown {
                let wait = self.timings.cooldown - elapsed;
                log::debug!("initialize called {:?} after the last one, waiting {:?}", elapsed, wait);
                thread::sleep(wait);
            }
        }
    }

    /// Close stale handle, settle, hardware reset, settle.
    fn recover_busy(&mut self) {
        log::info!("busy recovery: closing stale handle");
        self.discard_handle();
        thread::sleep(self.timings.busy_settle);
        log::info!("busy recovery: resetting device");
        if let Err(e) = self.probe.reset() {
            log::warn!("device reset failed: {}", e);
        }
        thread::sleep(self.timings.reset_settle);
    }

    /// Apply `config` to the live handle the way a fresh open would: an
    /// incomplete apply is logged and kept.
    fn reapply(&mut self, handle: &DeviceHandle, config: &DeviceConfig) -> Result<()> {
        log::info!("device #{} already open, applying new configuration", handle.id());
        match self.apply(handle, config) {
            Ok(()) => Ok(()),
            Err(Error::PartialApply(report)) => {
                log::warn!("configuration incomplete: {}", report);
                self.config = *config;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn open_and_apply(&mut self, config: &DeviceConfig) -> Result<DeviceHandle> {
        let driver = self.factory.open()?;
        let handle = DeviceHandle::new(driver, self.factory.name());
        match handle.with_driver(|d| apply_config(d, config)) {
            Ok(()) => {}
            Err(Error::PartialApply(report)) => {
                log::warn!("initial configuration incomplete: {}", report);
            }
            Err(e) => {
                handle.release();
                return Err(e);
            }
        }
        log::info!(
            "device #{} open ({}, {:.3} MHz, {:.2} MS/s, bw {:.2} MHz, LNA={} VGA={})",
            handle.id(),
            handle.label(),
            config.center_freq / 1e6,
            config.sample_rate / 1e6,
            config.bandwidth / 1e6,
            config.lna_gain,
            config.vga_gain,
        );
        self.config = *config;
        self.handle = Some(handle.clone());
        Ok(handle)
    }

    fn discard_handle(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.release();
        }
    }

    fn idle_handle(&self) -> Result<&DeviceHandle> {
        let handle = self.handle.as_ref().ok_or(Error::NoDevice)?;
        if handle.is_streaming() {
            return Err(Error::SessionActive);
        }
        Ok(handle)
    }

    /// Apply a full configuration to an idle handle.
    pub fn apply(&mut self, handle: &DeviceHandle, config: &DeviceConfig) -> Result<()> {
        config.validate()?;
        if handle.is_streaming() {
            return Err(Error::SessionActive);
        }
        let result = handle.with_driver(|d| apply_config(d, config));
        if result.is_ok() {
            self.config = *config;
        }
        result
    }

    pub fn set_frequency(&mut self, freq: f64) -> Result<()> {
        let config = self.config.with_frequency(freq);
        config.validate()?;
        self.idle_handle()?.with_driver(|d| d.set_frequency(freq))?;
        self.config = config;
        Ok(())
    }

    pub fn set_sample_rate(&mut self, rate: f64) -> Result<()> {
        let config = DeviceConfig {
            sample_rate: rate,
            ..self.config
        };
        config.validate()?;
        self.idle_handle()?.with_driver(|d| d.set_sample_rate(rate))?;
        self.config = config;
        Ok(())
    }

    pub fn set_gains(&mut self, lna: i32, vga: i32) -> Result<()> {
        GainStage::Lna.validate(lna)?;
        GainStage::Vga.validate(vga)?;
        self.idle_handle()?.with_driver(|d| {
            d.set_gain(GainStage::Lna, lna)?;
            d.set_gain(GainStage::Vga, vga)
        })?;
        self.config = self.config.with_gains(lna, vga);
        Ok(())
    }

    /// Gains as reported by the hardware (LNA, VGA).
    pub fn gains(&self) -> Result<(f64, f64)> {
        self.idle_handle()?
            .with_driver(|d| Ok((d.gain(GainStage::Lna)?, d.gain(GainStage::Vga)?)))
    }

    /// Record a configuration that was applied elsewhere (the acquisition
    /// loop applies its own on setup).
    pub fn note_applied(&mut self, config: &DeviceConfig) {
        self.config = *config;
    }

    /// Release the handle. Safe to call repeatedly or with no handle.
    /// The caller stops any running session first.
    pub fn cleanup(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.is_streaming() {
                log::warn!("releasing device handle #{} while a stream holds it", handle.id());
            }
            handle.release();
        }
    }
}

fn after_reset(e: Error) -> Error {
    match e {
        Error::InitializationFailed(_) => e,
        other => Error::InitializationFailed(format!("retry after device reset: {}", other)),
    }
}

impl Drop for DeviceController {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{DriverCall, SimFactory, SimProbe, SimScript};

    fn controller(script: &SimScript) -> DeviceController {
        DeviceController::new(
            Arc::new(SimFactory::new(script.clone())),
            Arc::new(SimProbe::new(script.clone())),
        )
        .with_timings(ControllerTimings::immediate())
    }

    fn config_steps(script: &SimScript) -> Vec<ConfigStep> {
        script.calls().iter().filter_map(|c| c.step()).collect()
    }

    #[test]
    fn test_initialize_applies_in_order() {
        let script = SimScript::default();
        let mut ctrl = controller(&script);
        let handle = ctrl.initialize(&DeviceConfig::default()).unwrap();
        assert!(!handle.is_faulted());
        assert_eq!(script.open_count(), 1);
        assert_eq!(config_steps(&script), APPLY_ORDER.to_vec());
    }

    #[test]
    fn test_rate_and_bandwidth_precede_frequency() {
        let script = SimScript::default();
        let mut ctrl = controller(&script);
        let handle = ctrl.initialize(&DeviceConfig::default()).unwrap();

        for (rate, freq, bw) in [(2e6, 88.1e6, 1.75e6), (10e6, 433.92e6, 8e6), (20e6, 2.4e9, 20e6)] {
            script.clear_calls();
            let cfg = DeviceConfig {
                sample_rate: rate,
                center_freq: freq,
                bandwidth: bw,
                ..DeviceConfig::default()
            };
            ctrl.apply(&handle, &cfg).unwrap();
            let calls = script.calls();
            let pos = |pred: fn(&DriverCall) -> bool| calls.iter().position(pred).unwrap();
            let rate_at = pos(|c| matches!(c, DriverCall::SetSampleRate(_)));
            let bw_at = pos(|c| matches!(c, DriverCall::SetBandwidth(_)));
            let freq_at = pos(|c| matches!(c, DriverCall::SetFrequency(_)));
            assert!(rate_at < freq_at && bw_at < freq_at, "bad order: {:?}", calls);
        }
    }

    #[test]
    fn test_partial_apply_is_reported_without_rollback() {
        let script = SimScript::default();
        let mut ctrl = controller(&script);
        let handle = ctrl.initialize(&DeviceConfig::default()).unwrap();
        script.clear_calls();
        script.fail_step(ConfigStep::Frequency, "PLL did not lock");

        match ctrl.apply(&handle, &DeviceConfig::default()) {
            Err(Error::PartialApply(report)) => {
                assert_eq!(report.failed.len(), 1);
                assert_eq!(report.failed[0].0, ConfigStep::Frequency);
                assert_eq!(
                    report.applied,
                    vec![
                        ConfigStep::SampleRate,
                        ConfigStep::Bandwidth,
                        ConfigStep::LnaGain,
                        ConfigStep::VgaGain
                    ]
                );
            }
            other => panic!("expected PartialApply, got {:?}", other),
        }
        // gains were still pushed after the failing step
        assert_eq!(config_steps(&script).len(), 5);
    }

    #[test]
    fn test_not_found() {
        let script = SimScript::default();
        script.set_availability(Availability::NotFound);
        let mut ctrl = controller(&script);
        assert!(matches!(
            ctrl.initialize(&DeviceConfig::default()),
            Err(Error::DeviceNotFound)
        ));
        assert_eq!(script.open_count(), 0);
        assert_eq!(script.reset_count(), 0);
    }

    #[test]
    fn test_busy_probe_resets_once_then_succeeds() {
        let script = SimScript::default();
        script.set_availability(Availability::Busy);
        let mut ctrl = controller(&script);
        assert!(ctrl.initialize(&DeviceConfig::default()).is_ok());
        assert_eq!(script.reset_count(), 1);
        assert_eq!(script.open_count(), 1);
    }

    #[test]
    fn test_busy_probe_failed_retry_is_initialization_failure() {
        let script = SimScript::default();
        script.set_availability(Availability::Busy);
        script.push_open(Err(Error::DeviceBusy("still claimed".into())));
        let mut ctrl = controller(&script);
        let result = ctrl.initialize(&DeviceConfig::default());
        assert!(
            matches!(result, Err(Error::InitializationFailed(_))),
            "got {:?}",
            result
        );
        assert_eq!(script.reset_count(), 1);
        assert_eq!(script.open_count(), 1);
        assert!(ctrl.handle().is_none());
    }

    #[test]
    fn test_busy_on_open_retries_once() {
        let script = SimScript::default();
        script.push_open(Err(Error::DeviceBusy("LIBUSB_ERROR_BUSY".into())));
        let mut ctrl = controller(&script);
        assert!(ctrl.initialize(&DeviceConfig::default()).is_ok());
        assert_eq!(script.open_count(), 2);
        assert_eq!(script.reset_count(), 1);

        let script = SimScript::default();
        script.push_open(Err(Error::DeviceBusy("LIBUSB_ERROR_BUSY".into())));
        script.push_open(Err(Error::DeviceBusy("LIBUSB_ERROR_BUSY".into())));
        let mut ctrl = controller(&script);
        assert!(matches!(
            ctrl.initialize(&DeviceConfig::default()),
            Err(Error::InitializationFailed(_))
        ));
        assert_eq!(script.open_count(), 2);
        assert_eq!(script.reset_count(), 1);
    }

    #[test]
    fn test_initialize_reuses_live_handle() {
        let script = SimScript::default();
        let mut ctrl = controller(&script);
        let a = ctrl.initialize(&DeviceConfig::default()).unwrap();
        let b = ctrl.initialize(&DeviceConfig::default()).unwrap();
        assert!(a.same_device(&b));
        assert_eq!(script.open_count(), 1);

        a.mark_faulted();
        let c = ctrl.initialize(&DeviceConfig::default()).unwrap();
        assert!(!c.same_device(&a));
        assert_eq!(script.open_count(), 2);
    }

    #[test]
    fn test_initialize_applies_new_config_to_live_handle() {
        let script = SimScript::default();
        let mut ctrl = controller(&script);
        let a = ctrl.initialize(&DeviceConfig::default()).unwrap();
        script.clear_calls();

        let retuned = DeviceConfig::default().with_frequency(915e6).with_gains(16, 30);
        let b = ctrl.initialize(&retuned).unwrap();
        assert!(a.same_device(&b));
        assert_eq!(script.open_count(), 1);
        assert_eq!(config_steps(&script), APPLY_ORDER.to_vec());
        assert!(script.calls().contains(&DriverCall::SetFrequency(915e6)));
        assert_eq!(ctrl.config(), retuned);
        assert_eq!(ctrl.gains().unwrap(), (16.0, 30.0));

        // A streaming handle cannot be retuned from here.
        assert!(b.claim_stream());
        assert!(matches!(
            ctrl.initialize(&DeviceConfig::default()),
            Err(Error::SessionActive)
        ));
        assert_eq!(ctrl.config(), retuned);
        b.release_stream();
    }

    #[test]
    fn test_cooldown_delays_reinitialize() {
        let script = SimScript::default();
        let mut ctrl = controller(&script).with_timings(ControllerTimings {
            cooldown: Duration::from_millis(80),
            ..ControllerTimings::immediate()
        });
        ctrl.initialize(&DeviceConfig::default()).unwrap();
        ctrl.cleanup();
        let start = Instant::now();
        ctrl.initialize(&DeviceConfig::default()).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(60), "took {:?}", start.elapsed());
    }

    #[test]
    fn test_slow_probe_times_out_as_busy() {
        struct SlowProbe;
        impl DeviceProbe for SlowProbe {
            fn probe(&self) -> Availability {
                thread::sleep(Duration::from_millis(300));
                Availability::Available
            }
            fn reset(&self) -> Result<()> {
                Ok(())
            }
        }
        let ctrl = DeviceController::new(Arc::new(SimFactory::default()), Arc::new(SlowProbe))
            .with_timings(ControllerTimings {
                probe_timeout: Duration::from_millis(20),
                ..ControllerTimings::immediate()
            });
        let start = Instant::now();
        assert_eq!(ctrl.probe_availability(), Availability::Busy);
        assert!(start.elapsed() < Duration::from_millis(250));
    }

    #[test]
    fn test_mutators_refuse_while_streaming() {
        let script = SimScript::default();
        let mut ctrl = controller(&script);
        let handle = ctrl.initialize(&DeviceConfig::default()).unwrap();
        assert!(handle.claim_stream());
        assert!(matches!(ctrl.set_gains(16, 30), Err(Error::SessionActive)));
        assert!(matches!(ctrl.set_frequency(101.1e6), Err(Error::SessionActive)));
        handle.release_stream();
        ctrl.set_gains(16, 30).unwrap();
        assert_eq!(ctrl.config().lna_gain, 16);
        assert_eq!(ctrl.gains().unwrap(), (16.0, 30.0));
    }

    #[test]
    fn test_mutators_validate() {
        let script = SimScript::default();
        let mut ctrl = controller(&script);
        assert!(matches!(ctrl.set_gains(8, 20), Err(Error::NoDevice)));
        ctrl.initialize(&DeviceConfig::default()).unwrap();
        assert!(matches!(ctrl.set_gains(9, 20), Err(Error::InvalidParameter(_))));
        assert!(matches!(ctrl.set_sample_rate(-1.0), Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let script = SimScript::default();
        let mut ctrl = controller(&script);
        ctrl.cleanup();
        let handle = ctrl.initialize(&DeviceConfig::default()).unwrap();
        ctrl.cleanup();
        ctrl.cleanup();
        assert!(handle.is_released());
        assert!(ctrl.handle().is_none());
    }
}
