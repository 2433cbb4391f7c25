// Copyright 2025-2026 CEMAXECUTER LLC

//! The one thread that performs blocking hardware reads.
//!
//! ```text
//! Stopped -> SettingUp -> Reading <-> Recovering -> Stopped
//! ```
//!
//! Blocks go into a bounded crossbeam queue with `try_send`; a full queue
//! drops the new block. Parameter changes arrive as [`Command`]s and are
//! applied between reads, so nothing else touches the hardware while the
//! stream is up.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime};

use crossbeam::channel::{Receiver, Sender, TryRecvError, TrySendError};
use num_complex::Complex32;
use tokio::sync::oneshot;

use rf_sdr::controller::apply_config;
use rf_sdr::{DeviceConfig, DeviceHandle, Error, GainStage, ReadStatus, Result, SampleBlock};

use crate::options::StreamOptions;
use crate::stats::{should_log_drop, SessionStatus, StatusCell, StreamStats};

/// Requests from the supervisor, handled between two reads.
#[derive(Debug)]
pub enum Command {
    /// Close the stream, apply `config`, reopen.
    Reconfigure {
        config: DeviceConfig,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Change both gain stages on the live stream.
    SetGains {
        lna: i32,
        vga: i32,
        reply: oneshot::Sender<Result<()>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Stopped,
    SettingUp,
    Reading,
    Recovering,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopState::Stopped => "stopped",
            LoopState::SettingUp => "setting up",
            LoopState::Reading => "reading",
            LoopState::Recovering => "recovering",
        };
        f.write_str(name)
    }
}

/// The configuration the acquisition loop is streaming with right now.
/// Blocks are stamped from the same value.
#[derive(Debug, Clone)]
pub struct ConfigCell(Arc<Mutex<DeviceConfig>>);

impl ConfigCell {
    pub fn new(config: DeviceConfig) -> Self {
        Self(Arc::new(Mutex::new(config)))
    }

    pub fn get(&self) -> DeviceConfig {
        match self.0.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set(&self, config: DeviceConfig) {
        match self.0.lock() {
            Ok(mut guard) => *guard = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
    }
}

/// Why the loop ended.
#[derive(Debug)]
pub enum LoopExit {
    /// Stop flag, or the bridge went away
    Stopped,
    /// A finite source ran out
    EndOfStream,
    /// Setup or recovery failed
    Failed(Error),
}

pub struct AcquisitionLoop {
    handle: DeviceHandle,
    config: DeviceConfig,
    applied: ConfigCell,
    options: StreamOptions,
    queue: Sender<SampleBlock>,
    commands: Receiver<Command>,
    running: Arc<AtomicBool>,
    stats: Arc<StreamStats>,
    status: StatusCell,
    state: LoopState,
    sequence: u64,
}

impl AcquisitionLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        handle: DeviceHandle,
        config: DeviceConfig,
        options: StreamOptions,
        queue: Sender<SampleBlock>,
        commands: Receiver<Command>,
        running: Arc<AtomicBool>,
        stats: Arc<StreamStats>,
        status: StatusCell,
    ) -> Self {
        Self {
            handle,
            config,
            applied: ConfigCell::new(config),
            options,
            queue,
            commands,
            running,
            stats,
            status,
            state: LoopState::Stopped,
            sequence: 0,
        }
    }

    /// Shared view of the config later blocks are stamped with.
    pub fn config_cell(&self) -> ConfigCell {
        self.applied.clone()
    }

    fn set_config(&mut self, config: DeviceConfig) {
        self.config = config;
        self.applied.set(config);
    }

    fn transition(&mut self, next: LoopState) {
        if self.state != next {
            log::info!("acquisition: {} -> {}", self.state, next);
            self.state = next;
        }
        match next {
            LoopState::Reading => self.status.set(SessionStatus::Running),
            LoopState::Recovering => self.status.set(SessionStatus::Recovering),
            LoopState::SettingUp | LoopState::Stopped => {}
        }
    }

    /// Apply the current config and open the stream. An incomplete apply
    /// is logged and streaming goes ahead with what the hardware took.
    fn setup(&mut self) -> Result<()> {
        self.transition(LoopState::SettingUp);
        let config = self.config;
        self.handle.with_driver(|d| {
            if let Err(e) = apply_config(d, &config) {
                match e {
                    Error::PartialApply(report) => log::warn!("stream setup: {}", report),
                    other => return Err(other),
                }
            }
            d.open_stream()
        })?;
        log::info!(
            "stream up ({:.3} MHz, {:.2} MS/s, bw {:.2} MHz, LNA={} VGA={}, {} samples/read)",
            config.center_freq / 1e6,
            config.sample_rate / 1e6,
            config.bandwidth / 1e6,
            config.lna_gain,
            config.vga_gain,
            config.buffer_size,
        );
        Ok(())
    }

    fn close_stream(&self) {
        if self.handle.with_driver(|d| {
            d.close_stream();
            Ok(())
        })
        .is_err()
        {
            // Faulted handles still close through release.
            self.handle.release();
        }
    }

    /// Run until stopped, out of data, or unrecoverable. `ready` receives
    /// the outcome of the first setup.
    pub fn run(mut self, ready: Option<oneshot::Sender<Result<()>>>) -> LoopExit {
        if !self.handle.claim_stream() {
            let _ = ready.map(|tx| tx.send(Err(Error::SessionActive)));
            return LoopExit::Failed(Error::SessionActive);
        }

        let setup = self.setup();
        let failed = setup.as_ref().err().cloned();
        if let Some(tx) = ready {
            let _ = tx.send(setup);
        }
        let exit = match failed {
            Some(e) => {
                log::error!("stream setup failed: {}", e);
                LoopExit::Failed(e)
            }
            None => {
                self.transition(LoopState::Reading);
                self.read_loop()
            }
        };

        self.close_stream();
        self.transition(LoopState::Stopped);
        self.handle.release_stream();
        match &exit {
            LoopExit::Failed(e) => {
                self.handle.mark_faulted();
                self.status.set(SessionStatus::Failed(e.to_string()));
            }
            LoopExit::Stopped | LoopExit::EndOfStream => self.status.settle(SessionStatus::Stopped),
        }
        exit
    }

    fn read_loop(&mut self) -> LoopExit {
        let mut buf = vec![Complex32::new(0.0, 0.0); self.config.buffer_size];
        let timeout = self.options.read_timeout();

        while self.running.load(Ordering::SeqCst) {
            if let Some(exit) = self.handle_commands(&mut buf) {
                return exit;
            }

            let status = match self.handle.with_driver(|d| Ok(d.read_stream(&mut buf, timeout))) {
                Ok(status) => status,
                Err(e) => return LoopExit::Failed(e),
            };

            match status {
                ReadStatus::Samples(0) | ReadStatus::Timeout => {
                    self.stats.record_timeout();
                    log::debug!("read timed out");
                }
                ReadStatus::Samples(n) => {
                    self.stats.record_captured();
                    let block = SampleBlock {
                        samples: buf[..n].to_vec(),
                        center_freq: self.config.center_freq,
                        sample_rate: self.config.sample_rate,
                        captured_at: SystemTime::now(),
                        sequence: self.sequence,
                    };
                    self.sequence += 1;
                    match self.queue.try_send(block) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            let drops = self.stats.record_queue_drop();
                            if should_log_drop(drops) {
                                log::warn!("handoff queue full, dropped {} block(s) so far", drops);
                            }
                        }
                        Err(TrySendError::Disconnected(_)) => {
                            log::info!("bridge gone, ending acquisition");
                            return LoopExit::Stopped;
                        }
                    }
                }
                ReadStatus::Overflow => {
                    let n = self.stats.record_overflow();
                    log::warn!("overflow: samples lost in driver ({} total)", n);
                }
                ReadStatus::EndOfStream => {
                    log::info!("source exhausted after {} block(s)", self.sequence);
                    return LoopExit::EndOfStream;
                }
                ReadStatus::Error(e) => {
                    log::warn!("read failed: {}", e);
                    if let Err(fatal) = self.recover() {
                        log::error!("recovery failed: {}", fatal);
                        return LoopExit::Failed(fatal);
                    }
                }
            }
        }
        LoopExit::Stopped
    }

    /// Close, pause, set up again. One attempt; the supervisor decides
    /// whether to try more.
    fn recover(&mut self) -> Result<()> {
        self.transition(LoopState::Recovering);
        self.stats.record_recovery();
        self.close_stream();
        self.pause(self.options.recovery_pause());
        self.setup()?;
        self.transition(LoopState::Reading);
        Ok(())
    }

    /// Sleep, waking early on stop.
    fn pause(&self, total: Duration) {
        let step = Duration::from_millis(10);
        let mut left = total;
        while !left.is_zero() && self.running.load(Ordering::SeqCst) {
            let nap = left.min(step);
            thread::sleep(nap);
            left -= nap;
        }
    }

    fn handle_commands(&mut self, buf: &mut Vec<Complex32>) -> Option<LoopExit> {
        loop {
            let command = match self.commands.try_recv() {
                Ok(command) => command,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return None,
            };
            match command {
                Command::Reconfigure { config, reply } => {
                    log::info!(
                        "reconfigure: {:.3} MHz, {:.2} MS/s, bw {:.2} MHz",
                        config.center_freq / 1e6,
                        config.sample_rate / 1e6,
                        config.bandwidth / 1e6,
                    );
                    let result = self.reconfigure(config);
                    if self.config.buffer_size != buf.len() {
                        buf.resize(self.config.buffer_size, Complex32::new(0.0, 0.0));
                    }
                    let reopened = result.is_ok() || matches!(result, Err(Error::PartialApply(_)));
                    let _ = reply.send(result);
                    if !reopened {
                        if let Err(fatal) = self.recover() {
                            log::error!("recovery after reconfigure failed: {}", fatal);
                            return Some(LoopExit::Failed(fatal));
                        }
                    }
                }
                Command::SetGains { lna, vga, reply } => {
                    let result = self.handle.with_driver(|d| {
                        d.set_gain(GainStage::Lna, lna)?;
                        d.set_gain(GainStage::Vga, vga)
                    });
                    if result.is_ok() {
                        self.set_config(self.config.with_gains(lna, vga));
                        log::info!("gains set: LNA={} VGA={}", lna, vga);
                    }
                    let _ = reply.send(result);
                }
            }
        }
    }

    /// Close the stream, apply the new parameters, reopen. Later blocks
    /// carry the new tuning. A partial apply still reopens and is
    /// reported back. Any other failure keeps the previous config, so
    /// recovery brings the stream back as the supervisor last saw it.
    fn reconfigure(&mut self, config: DeviceConfig) -> Result<()> {
        self.close_stream();
        let mut partial = None;
        self.handle.with_driver(|d| {
            match apply_config(d, &config) {
                Ok(()) => {}
                Err(Error::PartialApply(report)) => partial = Some(report),
                Err(e) => return Err(e),
            }
            d.open_stream()
        })?;
        self.set_config(config);
        match partial {
            Some(report) => Err(Error::PartialApply(report)),
            None => Ok(()),
        }
    }
}
