// Copyright 2025-2026 CEMAXECUTER LLC

//! Session lifecycle and the async control surface.
//!
//! One [`StreamSupervisor`] owns the [`DeviceController`] and at most one
//! running session (acquisition thread + bridge task). Controller calls
//! block on hardware, so they run on tokio's blocking pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel;
use tokio::sync::{mpsc, oneshot};

use rf_sdr::{Availability, DeviceConfig, DeviceController, DeviceInfo, Error, GainStage, Result, SampleBlock};

use crate::acquisition::{AcquisitionLoop, Command, ConfigCell, LoopExit};
use crate::bridge::StreamBridge;
use crate::options::StreamOptions;
use crate::stats::{SessionStatus, StatsSnapshot, StatusCell, StreamStats};
use crate::sweep::{self, SweepPlan};

/// Pending commands the acquisition loop may have queued at once.
const COMMAND_CAPACITY: usize = 4;
/// How often stop checks whether the acquisition thread is done.
const JOIN_POLL: Duration = Duration::from_millis(5);

struct Sweep {
    plan: SweepPlan,
    /// Dropping it ends the sweep after its current step.
    stop: oneshot::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl Sweep {
    async fn stop(self, timeout: Duration) {
        drop(self.stop);
        let mut task = self.task;
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::error!("sweep task failed: {}", e),
            Err(_) => {
                log::warn!("sweep did not stop within {:?}, aborting it", timeout);
                task.abort();
            }
        }
    }
}

struct Session {
    /// What the acquisition loop is streaming with
    applied: ConfigCell,
    running: Arc<AtomicBool>,
    commands: channel::Sender<Command>,
    acquisition: Option<thread::JoinHandle<LoopExit>>,
    bridge: Option<tokio::task::JoinHandle<()>>,
    sweep: Option<Sweep>,
    /// Kept so stop can discard whatever is still queued.
    queue: channel::Receiver<SampleBlock>,
}

impl Session {
    fn is_finished(&self) -> bool {
        self.acquisition.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Sweep first, then the stop flag, bounded join of the acquisition
    /// thread, bounded wait on the bridge, then drop what is left in the
    /// queue.
    async fn shutdown(mut self, timeout: Duration) {
        if let Some(sweep) = self.sweep.take() {
            sweep.stop(timeout).await;
        }
        self.running.store(false, Ordering::SeqCst);

        if let Some(worker) = self.acquisition.take() {
            match join_acquisition(worker, timeout).await {
                Some(LoopExit::Failed(e)) => log::info!("acquisition ended with error: {}", e),
                Some(exit) => log::debug!("acquisition ended: {:?}", exit),
                None => {}
            }
        }

        if let Some(mut bridge) = self.bridge.take() {
            match tokio::time::timeout(timeout, &mut bridge).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::error!("bridge task failed: {}", e),
                Err(_) => {
                    log::warn!("bridge did not stop within {:?}, aborting it", timeout);
                    bridge.abort();
                }
            }
        }

        let discarded = self.queue.try_iter().count();
        if discarded > 0 {
            log::debug!("discarded {} queued block(s) on stop", discarded);
        }
    }
}

/// Wait for the acquisition thread without blocking the runtime. Gives up
/// after `timeout` and leaves the thread detached; it still closes the
/// stream once its current read returns.
async fn join_acquisition(worker: thread::JoinHandle<LoopExit>, timeout: Duration) -> Option<LoopExit> {
    let deadline = Instant::now() + timeout;
    while !worker.is_finished() {
        if Instant::now() >= deadline {
            log::warn!("acquisition thread did not stop within {:?}, detaching it", timeout);
            return None;
        }
        tokio::time::sleep(JOIN_POLL).await;
    }
    match worker.join() {
        Ok(exit) => Some(exit),
        Err(_) => {
            log::error!("acquisition thread panicked");
            None
        }
    }
}

/// Hand `command` to the acquisition loop and wait for its answer.
pub(crate) async fn request(
    commands: &channel::Sender<Command>,
    timeout: Duration,
    make: impl FnOnce(oneshot::Sender<Result<()>>) -> Command,
) -> Result<()> {
    let (reply_tx, reply_rx) = oneshot::channel();
    commands.try_send(make(reply_tx)).map_err(|e| match e {
        channel::TrySendError::Full(_) => Error::InvalidParameter("too many pending reconfigurations".into()),
        channel::TrySendError::Disconnected(_) => Error::NoSession,
    })?;
    match tokio::time::timeout(timeout, reply_rx).await {
        Ok(Ok(result)) => result,
        // The loop exited with the command still queued.
        Ok(Err(_)) => Err(Error::NoSession),
        Err(_) => Err(Error::StreamSetupFailed(format!(
            "no answer from acquisition loop within {:?}",
            timeout
        ))),
    }
}

pub struct StreamSupervisor {
    controller: Arc<Mutex<DeviceController>>,
    options: StreamOptions,
    session: Option<Session>,
    stats: Arc<StreamStats>,
    status: StatusCell,
}

impl StreamSupervisor {
    pub fn new(controller: DeviceController, options: StreamOptions) -> Self {
        Self {
            controller: Arc::new(Mutex::new(controller)),
            options,
            session: None,
            stats: Arc::new(StreamStats::default()),
            status: StatusCell::default(),
        }
    }

    pub fn options(&self) -> StreamOptions {
        self.options
    }

    /// Counters of the current (or last) session.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn status(&self) -> SessionStatus {
        self.status.get()
    }

    /// True while a session's acquisition thread is alive.
    pub fn is_active(&self) -> bool {
        self.session.as_ref().is_some_and(|s| !s.is_finished())
    }

    async fn with_controller<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut DeviceController) -> Result<T> + Send + 'static,
    {
        let controller = self.controller.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = controller.lock().map_err(|_| Error::HandleFaulted)?;
            f(&mut guard)
        })
        .await
        .map_err(|e| {
            log::error!("controller task failed: {}", e);
            Error::HandleFaulted
        })?
    }

    pub async fn probe_availability(&self) -> Result<Availability> {
        self.with_controller(|c| Ok(c.probe_availability())).await
    }

    pub async fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        self.with_controller(|c| c.list_devices()).await
    }

    /// Open the device (or reuse the live handle) and apply `config`.
    pub async fn initialize(&self, config: DeviceConfig) -> Result<()> {
        self.with_controller(move |c| c.initialize(&config).map(|_| ())).await
    }

    /// Configuration of the running session, or the last one applied to
    /// the idle device.
    pub async fn config(&self) -> Result<DeviceConfig> {
        match &self.session {
            Some(session) if !session.is_finished() => Ok(session.applied.get()),
            _ => self.with_controller(|c| Ok(c.config())).await,
        }
    }

    /// Keep the controller's record in step with what the session applied.
    /// Failure only costs the idle readback, so it is logged.
    async fn note_applied(&self, config: DeviceConfig) {
        let noted = self
            .with_controller(move |c| {
                c.note_applied(&config);
                Ok(())
            })
            .await;
        if let Err(e) = noted {
            log::warn!("could not record applied config: {}", e);
        }
    }

    /// Tear down a session whose acquisition thread already exited on its
    /// own (end of file, failed recovery).
    async fn reap_finished(&mut self) {
        if !self.session.as_ref().is_some_and(Session::is_finished) {
            return;
        }
        if let Some(session) = self.session.take() {
            log::info!("previous session ended on its own ({})", self.status.get());
            let last = session.applied.get();
            session.shutdown(self.options.stop_timeout()).await;
            self.note_applied(last).await;
        }
    }

    /// Start streaming with `config`. The returned channel yields blocks in
    /// capture order and closes when the session ends.
    pub async fn start_session(&mut self, config: DeviceConfig) -> Result<mpsc::Receiver<SampleBlock>> {
        self.reap_finished().await;
        if self.session.is_some() {
            return Err(Error::SessionActive);
        }
        config.validate()?;
        self.options.validate()?;

        self.status.set(SessionStatus::Starting);
        let handle = match self.with_controller(move |c| c.initialize(&config)).await {
            Ok(handle) => handle,
            Err(e) => {
                self.status.set(SessionStatus::Failed(e.to_string()));
                return Err(e);
            }
        };

        let stats = Arc::new(StreamStats::default());
        self.stats = stats.clone();
        let running = Arc::new(AtomicBool::new(true));
        let (queue_tx, queue_rx) = channel::bounded(self.options.queue_capacity);
        let (command_tx, command_rx) = channel::bounded(COMMAND_CAPACITY);
        let (consumer_tx, consumer_rx) = mpsc::channel(self.options.channel_capacity);
        let (ready_tx, ready_rx) = oneshot::channel();

        let acquisition = AcquisitionLoop::new(
            handle,
            config,
            self.options,
            queue_tx,
            command_rx,
            running.clone(),
            stats.clone(),
            self.status.clone(),
        );
        let applied = acquisition.config_cell();
        let worker = thread::Builder::new()
            .name("rf-acquisition".to_string())
            .spawn(move || acquisition.run(Some(ready_tx)))
            .map_err(|e| {
                let err = Error::StreamSetupFailed(format!("could not spawn acquisition thread: {}", e));
                self.status.set(SessionStatus::Failed(err.to_string()));
                err
            })?;

        let ready = match tokio::time::timeout(self.options.setup_timeout(), ready_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::StreamSetupFailed(
                "acquisition thread exited during setup".into(),
            )),
            Err(_) => Err(Error::StreamSetupFailed(format!(
                "stream not up after {:?}",
                self.options.setup_timeout()
            ))),
        };
        if let Err(e) = ready {
            running.store(false, Ordering::SeqCst);
            join_acquisition(worker, self.options.stop_timeout()).await;
            self.status.set(SessionStatus::Failed(e.to_string()));
            return Err(e);
        }

        let bridge = StreamBridge::new(
            queue_rx.clone(),
            consumer_tx,
            running.clone(),
            stats,
            self.options.bridge_poll(),
        );
        let bridge = tokio::spawn(bridge.run());

        self.session = Some(Session {
            applied,
            running,
            commands: command_tx,
            acquisition: Some(worker),
            bridge: Some(bridge),
            sweep: None,
            queue: queue_rx,
        });
        self.note_applied(config).await;
        log::info!("session started");
        Ok(consumer_rx)
    }

    /// Stop the session if there is one. Safe to call at any time; returns
    /// within about twice the stop timeout even if the hardware hangs.
    pub async fn stop_session(&mut self) -> Result<()> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        let last = session.applied.get();
        session.shutdown(self.options.stop_timeout()).await;
        self.note_applied(last).await;
        self.status.settle(SessionStatus::Stopped);
        log::info!("session stopped ({})", self.stats.snapshot());
        Ok(())
    }

    /// Change every parameter. While streaming, the acquisition loop
    /// closes and reopens the stream with `config`; otherwise it is
    /// applied to the idle device.
    pub async fn reconfigure_session(&mut self, config: DeviceConfig) -> Result<()> {
        config.validate()?;
        self.reap_finished().await;
        let Some(session) = &self.session else {
            return self
                .with_controller(move |c| {
                    let handle = c.handle().cloned().ok_or(Error::NoDevice)?;
                    c.apply(&handle, &config)
                })
                .await;
        };

        let previous = session.applied.get();
        if previous.buffer_size != config.buffer_size {
            log::debug!(
                "read size changes from {} to {} samples",
                previous.buffer_size,
                config.buffer_size
            );
        }
        let result = request(&session.commands, self.options.setup_timeout(), |reply| {
            Command::Reconfigure { config, reply }
        })
        .await;
        if result.is_ok() || matches!(result, Err(Error::PartialApply(_))) {
            self.note_applied(config).await;
        }
        result
    }

    /// Set both gain stages, through the running session if there is one.
    pub async fn set_gains(&mut self, lna: i32, vga: i32) -> Result<()> {
        GainStage::Lna.validate(lna)?;
        GainStage::Vga.validate(vga)?;
        self.reap_finished().await;
        let Some(session) = &self.session else {
            return self.with_controller(move |c| c.set_gains(lna, vga)).await;
        };

        request(&session.commands, self.options.setup_timeout(), |reply| Command::SetGains {
            lna,
            vga,
            reply,
        })
        .await?;
        let config = session.applied.get();
        self.note_applied(config).await;
        Ok(())
    }

    /// Step the running session from `start` to `stop` (Hz, inclusive) in
    /// `step` increments, `dwell` on each, wrapping around until
    /// [`stop_sweep`](Self::stop_sweep). Each step retunes through the
    /// acquisition loop like [`reconfigure_session`](Self::reconfigure_session).
    pub async fn start_sweep(&mut self, start: f64, stop: f64, step: f64, dwell: Duration) -> Result<()> {
        let plan = SweepPlan::new(start, stop, step, dwell)?;
        self.reap_finished().await;
        let reply_timeout = self.options.setup_timeout();
        let Some(session) = self.session.as_mut() else {
            return Err(Error::NoSession);
        };
        if session.sweep.as_ref().is_some_and(|s| !s.task.is_finished()) {
            return Err(Error::SweepActive);
        }
        if let Some(done) = session.sweep.take() {
            done.stop(reply_timeout).await;
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(sweep::run(
            plan,
            session.commands.clone(),
            session.applied.clone(),
            reply_timeout,
            stop_rx,
        ));
        session.sweep = Some(Sweep {
            plan,
            stop: stop_tx,
            task,
        });
        Ok(())
    }

    /// End the sweep, if any. The step in flight finishes first; no retune
    /// happens after this returns. The session keeps streaming on the
    /// frequency reached.
    pub async fn stop_sweep(&mut self) -> Result<()> {
        let timeout = self.options.setup_timeout();
        let Some(sweep) = self.session.as_mut().and_then(|s| s.sweep.take()) else {
            return Ok(());
        };
        sweep.stop(timeout).await;
        if let Some(session) = &self.session {
            let config = session.applied.get();
            self.note_applied(config).await;
        }
        Ok(())
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweep_plan().is_some()
    }

    /// Plan of the sweep in progress.
    pub fn sweep_plan(&self) -> Option<SweepPlan> {
        self.session
            .as_ref()
            .and_then(|s| s.sweep.as_ref())
            .filter(|s| !s.task.is_finished())
            .map(|s| s.plan)
    }

    /// (LNA, VGA) in dB. A running session reports its configured values
    /// rather than reading the hardware under the reader.
    pub async fn gains(&self) -> Result<(f64, f64)> {
        match &self.session {
            Some(session) if !session.is_finished() => {
                let config = session.applied.get();
                Ok((config.lna_gain as f64, config.vga_gain as f64))
            }
            _ => self.with_controller(|c| c.gains()).await,
        }
    }

    /// Stop any session and release the device.
    pub async fn cleanup(&mut self) -> Result<()> {
        self.stop_session().await?;
        self.with_controller(|c| {
            c.cleanup();
            Ok(())
        })
        .await?;
        self.status.set(SessionStatus::Idle);
        Ok(())
    }
}

impl Drop for StreamSupervisor {
    fn drop(&mut self) {
        if let Some(session) = &mut self.session {
            if let Some(sweep) = session.sweep.take() {
                sweep.task.abort();
            }
            session.running.store(false, Ordering::SeqCst);
            if let Some(bridge) = session.bridge.take() {
                bridge.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rf_sdr::sim::{DriverCall, SimFactory, SimProbe, SimRead, SimScript};
    use rf_sdr::ControllerTimings;

    fn supervisor(script: &SimScript, options: StreamOptions) -> StreamSupervisor {
        let controller = DeviceController::new(
            Arc::new(SimFactory::new(script.clone())),
            Arc::new(SimProbe::new(script.clone())),
        )
        .with_timings(ControllerTimings::immediate());
        StreamSupervisor::new(controller, options)
    }

    fn options() -> StreamOptions {
        StreamOptions {
            bridge_poll_ms: 1,
            recovery_pause_ms: 1,
            stop_timeout_ms: 1000,
            setup_timeout_ms: 2000,
            ..StreamOptions::default()
        }
    }

    fn config() -> DeviceConfig {
        DeviceConfig {
            buffer_size: 1024,
            ..DeviceConfig::default()
        }
    }

    fn paced_script() -> SimScript {
        let script = SimScript::default();
        script.set_read_delay(Duration::from_millis(1));
        script
    }

    async fn next_block(rx: &mut mpsc::Receiver<SampleBlock>) -> Option<SampleBlock> {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .ok()
            .flatten()
    }

    async fn wait_for(mut done: impl FnMut() -> bool) -> bool {
        for _ in 0..400 {
            if done() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        done()
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let script = paced_script();
        let mut sup = supervisor(&script, options());
        let mut rx = sup.start_session(config()).await.unwrap();
        assert!(next_block(&mut rx).await.is_some());

        assert!(matches!(sup.start_session(config()).await, Err(Error::SessionActive)));
        // The first session is untouched.
        assert!(sup.is_active());
        assert!(next_block(&mut rx).await.is_some());
        assert_eq!(script.open_count(), 1);

        sup.stop_session().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let script = paced_script();
        let mut sup = supervisor(&script, options());
        sup.stop_session().await.unwrap();
        sup.stop_session().await.unwrap();

        let _rx = sup.start_session(config()).await.unwrap();
        sup.stop_session().await.unwrap();
        sup.stop_session().await.unwrap();

        assert!(!sup.is_active());
        assert_eq!(sup.status(), SessionStatus::Stopped);
        assert_eq!(script.calls().last(), Some(&DriverCall::CloseStream));
        let closes = script.calls().iter().filter(|c| **c == DriverCall::CloseStream).count();
        assert_eq!(closes, 1);
    }

    #[tokio::test]
    async fn test_undrained_consumer_stays_bounded() {
        let script = SimScript::default();
        let mut sup = supervisor(
            &script,
            StreamOptions {
                channel_capacity: 4,
                ..options()
            },
        );
        let mut rx = sup.start_session(config()).await.unwrap();
        assert!(wait_for(|| sup.stats().channel_drops > 10).await);
        sup.stop_session().await.unwrap();

        let mut held = 0;
        while rx.try_recv().is_ok() {
            held += 1;
        }
        assert!(held <= 4, "{} blocks held", held);
        let snap = sup.stats();
        assert!(snap.channel_drops > 0);
        assert!(snap.captured >= snap.delivered + snap.channel_drops);
    }

    #[tokio::test]
    async fn test_blocks_arrive_in_capture_order() {
        let script = paced_script();
        let mut sup = supervisor(&script, options());
        let mut rx = sup.start_session(config()).await.unwrap();
        let mut last = None;
        for _ in 0..30 {
            let block = next_block(&mut rx).await.unwrap();
            if let Some(prev) = last {
                assert!(block.sequence > prev, "{} after {}", block.sequence, prev);
            }
            last = Some(block.sequence);
        }
        sup.stop_session().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_error_recovers_in_session() {
        let script = paced_script();
        script.push_read(SimRead::Fatal("libusb transfer error".into()));
        let mut sup = supervisor(&script, options());
        let mut rx = sup.start_session(config()).await.unwrap();

        assert!(next_block(&mut rx).await.is_some());
        assert_eq!(sup.stats().recoveries, 1);
        assert!(sup.is_active());
        assert_eq!(sup.status(), SessionStatus::Running);
        sup.stop_session().await.unwrap();
    }

    #[tokio::test]
    async fn test_unrecoverable_session_reports_and_restarts() {
        let script = paced_script();
        let mut sup = supervisor(&script, options());
        let mut rx = sup.start_session(config()).await.unwrap();
        assert!(next_block(&mut rx).await.is_some());

        script.fail_open_stream(1);
        script.push_read(SimRead::Fatal("device unplugged".into()));
        assert!(wait_for(|| matches!(sup.status(), SessionStatus::Failed(_))).await);
        // The consumer sees the end of the stream.
        while next_block(&mut rx).await.is_some() {}
        assert!(wait_for(|| !sup.is_active()).await);

        // A new start discards the faulted handle and opens a fresh one.
        let mut rx = sup.start_session(config()).await.unwrap();
        assert!(next_block(&mut rx).await.is_some());
        assert_eq!(script.open_count(), 2);
        sup.stop_session().await.unwrap();
    }

    #[tokio::test]
    async fn test_end_of_file_closes_channel() {
        let script = SimScript::default();
        for _ in 0..3 {
            script.push_read(SimRead::Tone);
        }
        script.push_read(SimRead::End);
        let mut sup = supervisor(&script, options());
        let mut rx = sup.start_session(config()).await.unwrap();

        let mut seen = 0;
        while next_block(&mut rx).await.is_some() {
            seen += 1;
        }
        assert_eq!(seen, 3);
        assert!(wait_for(|| !sup.is_active()).await);
        assert_eq!(sup.status(), SessionStatus::Stopped);
        sup.stop_session().await.unwrap();
    }

    #[tokio::test]
    async fn test_reconfigure_while_streaming() {
        let script = paced_script();
        let mut sup = supervisor(&script, options());
        let mut rx = sup.start_session(config()).await.unwrap();
        assert_eq!(next_block(&mut rx).await.unwrap().center_freq, 100e6);

        script.clear_calls();
        sup.reconfigure_session(config().with_frequency(433.92e6)).await.unwrap();
        assert_eq!(sup.config().await.unwrap().center_freq, 433.92e6);

        let mut retuned = false;
        for _ in 0..100 {
            if next_block(&mut rx).await.unwrap().center_freq == 433.92e6 {
                retuned = true;
                break;
            }
        }
        assert!(retuned);

        let calls = script.calls();
        let close = calls.iter().position(|c| *c == DriverCall::CloseStream).unwrap();
        let tune = calls.iter().position(|c| *c == DriverCall::SetFrequency(433.92e6)).unwrap();
        let open = calls.iter().position(|c| *c == DriverCall::OpenStream).unwrap();
        assert!(close < tune && tune < open);
        sup.stop_session().await.unwrap();
    }

    #[tokio::test]
    async fn test_reconfigure_idle_device() {
        let script = SimScript::default();
        let mut sup = supervisor(&script, options());
        assert!(matches!(
            sup.reconfigure_session(config()).await,
            Err(Error::NoDevice)
        ));

        sup.initialize(config()).await.unwrap();
        script.clear_calls();
        sup.reconfigure_session(config().with_frequency(915e6)).await.unwrap();
        assert_eq!(script.calls()[2], DriverCall::SetFrequency(915e6));
        assert_eq!(sup.config().await.unwrap().center_freq, 915e6);
    }

    #[tokio::test]
    async fn test_setup_failure_is_synchronous() {
        let script = paced_script();
        script.fail_open_stream(1);
        let mut sup = supervisor(&script, options());
        assert!(matches!(
            sup.start_session(config()).await,
            Err(Error::StreamSetupFailed(_))
        ));
        assert!(!sup.is_active());
        assert!(matches!(sup.status(), SessionStatus::Failed(_)));

        let mut rx = sup.start_session(config()).await.unwrap();
        assert!(next_block(&mut rx).await.is_some());
        sup.stop_session().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_bounded_when_read_hangs() {
        let script = SimScript::default();
        script.set_read_delay(Duration::from_millis(500));
        let mut sup = supervisor(
            &script,
            StreamOptions {
                stop_timeout_ms: 50,
                ..options()
            },
        );
        let _rx = sup.start_session(config()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = Instant::now();
        sup.stop_session().await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(400), "stop took {:?}", started.elapsed());
        assert!(!sup.is_active());
    }

    #[tokio::test]
    async fn test_gains_through_running_session() {
        let script = paced_script();
        let mut sup = supervisor(&script, options());
        let _rx = sup.start_session(config()).await.unwrap();

        sup.set_gains(16, 30).await.unwrap();
        assert_eq!(sup.gains().await.unwrap(), (16.0, 30.0));
        assert!(matches!(sup.set_gains(17, 30).await, Err(Error::InvalidParameter(_))));

        sup.stop_session().await.unwrap();
        // Idle readback comes from the driver.
        assert_eq!(sup.gains().await.unwrap(), (16.0, 30.0));
        assert!(script.calls().contains(&DriverCall::SetGain(GainStage::Lna, 16)));
    }

    #[tokio::test]
    async fn test_probe_and_cleanup() {
        let script = SimScript::default();
        script.set_availability(Availability::Busy);
        let mut sup = supervisor(&script, options());
        assert_eq!(sup.probe_availability().await.unwrap(), Availability::Busy);

        script.set_availability(Availability::Available);
        let _rx = sup.start_session(config()).await.unwrap();
        sup.cleanup().await.unwrap();
        sup.cleanup().await.unwrap();
        assert!(!sup.is_active());
        assert_eq!(sup.status(), SessionStatus::Idle);
        assert!(matches!(sup.gains().await, Err(Error::NoDevice)));
    }

    #[tokio::test]
    async fn test_failed_reconfigure_reports_streamed_config() {
        let script = paced_script();
        let mut sup = supervisor(&script, options());
        let mut rx = sup.start_session(config()).await.unwrap();
        assert!(next_block(&mut rx).await.is_some());

        // Tuning applies, the reopen fails, recovery reopens on the old config.
        script.fail_open_stream(1);
        let result = sup.reconfigure_session(config().with_frequency(433.92e6)).await;
        assert!(matches!(result, Err(Error::StreamSetupFailed(_))), "got {:?}", result);
        assert!(sup.is_active());

        let reported = sup.config().await.unwrap();
        assert_eq!(reported.center_freq, 100e6);
        while rx.try_recv().is_ok() {}
        for _ in 0..10 {
            let block = next_block(&mut rx).await.unwrap();
            assert_eq!(block.center_freq, reported.center_freq);
            assert_eq!(block.sample_rate, reported.sample_rate);
        }
        sup.stop_session().await.unwrap();
        assert_eq!(sup.config().await.unwrap().center_freq, 100e6);
    }

    #[tokio::test]
    async fn test_session_survives_lost_controller() {
        let script = paced_script();
        let mut sup = supervisor(&script, options());
        let mut rx = sup.start_session(config()).await.unwrap();

        let controller = sup.controller.clone();
        let _ = thread::spawn(move || {
            let _guard = controller.lock().unwrap();
            panic!("controller lock poisoned");
        })
        .join();

        // Retuning goes through the loop and does not need the controller.
        sup.reconfigure_session(config().with_frequency(915e6)).await.unwrap();
        assert_eq!(sup.config().await.unwrap().center_freq, 915e6);
        assert!(next_block(&mut rx).await.is_some());

        sup.stop_session().await.unwrap();
        assert!(!sup.is_active());
        assert_eq!(script.calls().last(), Some(&DriverCall::CloseStream));
    }

    #[tokio::test]
    async fn test_sweep_needs_session() {
        let script = SimScript::default();
        let mut sup = supervisor(&script, options());
        let dwell = Duration::from_millis(5);
        assert!(matches!(
            sup.start_sweep(400e6, 440e6, 20e6, dwell).await,
            Err(Error::NoSession)
        ));
        sup.stop_sweep().await.unwrap();

        let _rx = sup.start_session(config()).await.unwrap();
        assert!(matches!(
            sup.start_sweep(440e6, 400e6, 20e6, dwell).await,
            Err(Error::InvalidParameter(_))
        ));
        assert!(!sup.is_sweeping());
        sup.stop_session().await.unwrap();
    }

    #[tokio::test]
    async fn test_sweep_steps_and_wraps() {
        let script = paced_script();
        let mut sup = supervisor(&script, options());
        let mut rx = sup.start_session(config()).await.unwrap();

        sup.start_sweep(400e6, 440e6, 20e6, Duration::from_millis(5)).await.unwrap();
        assert!(sup.is_sweeping());
        assert_eq!(sup.sweep_plan().unwrap().steps(), 3);
        assert!(matches!(
            sup.start_sweep(400e6, 440e6, 20e6, Duration::from_millis(5)).await,
            Err(Error::SweepActive)
        ));

        // Frequencies in the order blocks saw them, repeats collapsed.
        let mut seen: Vec<f64> = Vec::new();
        for _ in 0..5000 {
            let freq = next_block(&mut rx).await.unwrap().center_freq;
            if seen.last() != Some(&freq) {
                seen.push(freq);
            }
            if seen.len() >= 6 {
                break;
            }
        }
        let swept: Vec<f64> = seen.into_iter().skip_while(|f| *f == 100e6).collect();
        assert!(swept.len() >= 5, "only saw {:?}", swept);
        assert_eq!(swept[..5], [400e6, 420e6, 440e6, 400e6, 420e6]);

        sup.stop_sweep().await.unwrap();
        assert!(!sup.is_sweeping());
        sup.stop_sweep().await.unwrap();

        // Streaming carries on where the sweep stopped.
        let settled = sup.config().await.unwrap().center_freq;
        assert!([400e6, 420e6, 440e6].contains(&settled));
        tokio::time::sleep(Duration::from_millis(30)).await;
        while rx.try_recv().is_ok() {}
        for _ in 0..20 {
            let freq = next_block(&mut rx).await.unwrap().center_freq;
            assert_eq!(freq, settled, "retuned after the sweep stopped");
        }
        sup.stop_session().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_session_ends_sweep() {
        let script = paced_script();
        let mut sup = supervisor(&script, options());
        let _rx = sup.start_session(config()).await.unwrap();
        sup.start_sweep(400e6, 500e6, 20e6, Duration::from_millis(2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        sup.stop_session().await.unwrap();
        assert!(!sup.is_sweeping());
        assert!(!sup.is_active());
        let calls = script.calls().len();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(script.calls().len(), calls);
        assert_eq!(script.calls().last(), Some(&DriverCall::CloseStream));
    }
}
