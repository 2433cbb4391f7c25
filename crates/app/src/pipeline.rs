use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use byteorder::{LittleEndian, WriteBytesExt};
use num_complex::Complex32;
use tokio::sync::mpsc;

use rf_dsp::{apply_gain_db, DisplayRange, Mode, Processed, SignalProcessor, SpectrumFrame, WindowKind};
use rf_sdr::{Availability, DeviceConfig, DeviceController, SampleBlock};
use rf_stream::{StreamOptions, StreamSupervisor, SweepPlan};

const STATS_INTERVAL: Duration = Duration::from_secs(5);

pub struct Settings {
    pub device: DeviceConfig,
    pub stream: StreamOptions,
    pub sweep: Option<SweepPlan>,
    pub mode: Mode,
    pub window: WindowKind,
    /// Hz
    pub channel_bw: Option<f64>,
    pub gain_db: f32,
    pub audio_out: Option<PathBuf>,
    pub max_bins: usize,
    pub duration: Option<Duration>,
    pub print_stats: bool,
}

/// Turns sample blocks into spectrum lines on stdout or audio in a file.
struct Consumer {
    processor: SignalProcessor,
    mode: Mode,
    channel_bw: Option<f64>,
    gain_db: f32,
    range: DisplayRange,
    max_bins: usize,
    spectrum_out: BufWriter<io::Stdout>,
    audio_out: Option<BufWriter<File>>,
    frames: u64,
    audio_samples: u64,
}

impl Consumer {
    fn new(settings: &Settings) -> Result<Self, String> {
        let processor = SignalProcessor::new(settings.device.sample_rate)
            .map_err(|e| e.to_string())?
            .with_window(settings.window);
        let audio_out = match settings.audio_out {
            Some(ref path) => {
                let file = File::create(path)
                    .map_err(|e| format!("failed to create {}: {}", path.display(), e))?;
                log::info!(
                    "writing {} Hz f32 audio to {}",
                    processor.audio_rate(),
                    path.display()
                );
                Some(BufWriter::new(file))
            }
            None => None,
        };
        Ok(Self {
            processor,
            mode: settings.mode,
            channel_bw: settings.channel_bw,
            gain_db: settings.gain_db,
            range: DisplayRange::default(),
            max_bins: settings.max_bins,
            spectrum_out: BufWriter::new(io::stdout()),
            audio_out,
            frames: 0,
            audio_samples: 0,
        })
    }

    fn handle(&mut self, block: &SampleBlock) -> Result<(), String> {
        if block.sample_rate != self.processor.sample_rate() {
            self.processor
                .set_sample_rate(block.sample_rate)
                .map_err(|e| e.to_string())?;
        }

        let filtered;
        let samples: &[Complex32] = match (self.mode, self.channel_bw) {
            (Mode::FmDemod, Some(bw)) => {
                filtered = self
                    .processor
                    .bandpass(&block.samples, bw)
                    .map_err(|e| e.to_string())?;
                &filtered
            }
            _ => &block.samples,
        };

        match self.processor.process(samples, self.mode).map_err(|e| e.to_string())? {
            Processed::Spectrum(magnitudes) => {
                let mut frame = SpectrumFrame::new(
                    magnitudes,
                    block.center_freq,
                    block.sample_rate,
                    block.captured_at,
                )
                .decimate(self.max_bins);
                frame.clip(self.range);
                serde_json::to_writer(&mut self.spectrum_out, &frame)
                    .map_err(|e| format!("spectrum output: {}", e))?;
                writeln!(self.spectrum_out).map_err(|e| format!("spectrum output: {}", e))?;
                self.spectrum_out
                    .flush()
                    .map_err(|e| format!("spectrum output: {}", e))?;
                self.frames += 1;
            }
            Processed::Audio(audio) => {
                let audio = apply_gain_db(&audio, self.gain_db).map_err(|e| e.to_string())?;
                if let Some(ref mut out) = self.audio_out {
                    for sample in &audio {
                        out.write_f32::<LittleEndian>(*sample)
                            .map_err(|e| format!("audio output: {}", e))?;
                    }
                }
                self.audio_samples += audio.len() as u64;
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), String> {
        if let Some(ref mut out) = self.audio_out {
            out.flush().map_err(|e| format!("audio output: {}", e))?;
        }
        Ok(())
    }

    fn summary(&self) -> String {
        match self.mode {
            Mode::Spectrum => format!("frames: {}", self.frames),
            Mode::FmDemod => format!(
                "audio: {:.1}s",
                self.audio_samples as f64 / self.processor.audio_rate()
            ),
        }
    }
}

async fn deadline(duration: Option<Duration>) {
    match duration {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

async fn consume(
    supervisor: &StreamSupervisor,
    rx: &mut mpsc::Receiver<SampleBlock>,
    consumer: &mut Consumer,
    settings: &Settings,
) -> Result<(), String> {
    let stats_start = Instant::now();
    let mut stats_tick = tokio::time::interval(STATS_INTERVAL);
    stats_tick.tick().await;

    let stop_at = deadline(settings.duration);
    tokio::pin!(stop_at);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            block = rx.recv() => match block {
                Some(block) => consumer.handle(&block)?,
                None => {
                    log::info!("stream ended ({})", supervisor.status());
                    break;
                }
            },
            _ = &mut ctrl_c => {
                log::info!("interrupted");
                break;
            }
            _ = &mut stop_at => {
                log::info!("duration reached");
                break;
            }
            _ = stats_tick.tick(), if settings.print_stats => {
                eprintln!(
                    "[{:.1}s] {} {}",
                    stats_start.elapsed().as_secs_f64(),
                    supervisor.stats(),
                    consumer.summary(),
                );
            }
        }
    }
    Ok(())
}

/// Stream with `settings` until the source ends, the duration passes or
/// the user interrupts.
pub async fn run(controller: DeviceController, settings: Settings) -> Result<(), String> {
    let mut supervisor = StreamSupervisor::new(controller, settings.stream);

    match supervisor.probe_availability().await.map_err(|e| e.to_string())? {
        Availability::NotFound => return Err("no HackRF device found".to_string()),
        Availability::Busy => log::warn!("device reports busy, initialization will try a reset"),
        Availability::Available => {}
    }

    let mut consumer = Consumer::new(&settings)?;
    let mut rx = supervisor
        .start_session(settings.device)
        .await
        .map_err(|e| e.to_string())?;

    let result = match settings.sweep {
        Some(plan) => match supervisor.start_sweep(plan.start, plan.stop, plan.step, plan.dwell).await {
            Ok(()) => consume(&supervisor, &mut rx, &mut consumer, &settings).await,
            Err(e) => Err(e.to_string()),
        },
        None => consume(&supervisor, &mut rx, &mut consumer, &settings).await,
    };

    // Tear down even if the consumer failed.
    drop(rx);
    supervisor.cleanup().await.map_err(|e| e.to_string())?;
    consumer.finish()?;
    if settings.print_stats {
        eprintln!("done: {} {}", supervisor.stats(), consumer.summary());
    }
    result
}

pub async fn list_devices(controller: DeviceController) -> Result<(), String> {
    let supervisor = StreamSupervisor::new(controller, StreamOptions::default());
    let devices = supervisor.list_devices().await.map_err(|e| e.to_string())?;
    if devices.is_empty() {
        println!("no devices found");
    }
    for (i, dev) in devices.iter().enumerate() {
        println!("[{}] {} ({}) serial {}", i, dev.label, dev.driver, dev.serial);
    }
    Ok(())
}
