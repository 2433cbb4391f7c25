mod pipeline;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use rf_dsp::{Mode, WindowKind};
use rf_sdr::file::{FileFactory, FileProbe, SampleFormat};
use rf_sdr::sim::{SimFactory, SimProbe, SimScript};
use rf_sdr::{DeviceConfig, DeviceController, DeviceProbe, DriverFactory};
use rf_stream::{StreamOptions, SweepPlan};

#[derive(Parser, Debug)]
#[command(name = "rfscope")]
#[command(about = "Live spectrum and FM audio from a HackRF")]
struct Cli {
    /// IQ file input instead of live hardware
    #[arg(short = 'f', long)]
    file: Option<PathBuf>,

    /// Sample format for file input: ci8, ci16, cf32
    #[arg(long, default_value = "ci8")]
    format: String,

    /// Replay the file in a loop
    #[arg(long = "loop")]
    looping: bool,

    /// Read the file as fast as possible instead of at the sample rate
    #[arg(long)]
    fast: bool,

    /// Use the built-in simulated receiver
    #[arg(long, conflicts_with = "file")]
    simulate: bool,

    /// JSON file with "device" and "stream" sections
    #[arg(long)]
    config: Option<PathBuf>,

    /// Center frequency in MHz
    #[arg(short = 'c', long)]
    center_freq: Option<f64>,

    /// Sample rate in MS/s
    #[arg(short = 'r', long)]
    sample_rate: Option<f64>,

    /// Baseband filter bandwidth in MHz
    #[arg(short = 'b', long)]
    bandwidth: Option<f64>,

    /// LNA gain in dB (0-40, 8 dB steps)
    #[arg(long)]
    lna: Option<i32>,

    /// VGA gain in dB (0-62, 2 dB steps)
    #[arg(long)]
    vga: Option<i32>,

    /// Sweep range in MHz, e.g. 400:500
    #[arg(long, value_name = "START:STOP")]
    sweep: Option<String>,

    /// Sweep step in MHz
    #[arg(long, default_value = "20")]
    sweep_step: f64,

    /// Time on each sweep frequency in ms
    #[arg(long, default_value = "10")]
    dwell: u64,

    /// Processing mode: spectrum or fm
    #[arg(short = 'm', long, default_value = "spectrum")]
    mode: String,

    /// FFT window: hann, hamming, blackman, rect, kaiser[:beta]
    #[arg(long, default_value = "hann")]
    window: String,

    /// Channel filter in kHz, applied before FM demodulation
    #[arg(long)]
    channel_bw: Option<f64>,

    /// Audio gain in dB
    #[arg(long, default_value = "0", allow_hyphen_values = true)]
    gain_db: f32,

    /// Raw f32 little-endian audio output file (fm mode)
    #[arg(short = 'w', long)]
    write: Option<PathBuf>,

    /// Maximum bins per spectrum line
    #[arg(long, default_value = "1024")]
    max_bins: usize,

    /// Stop after this many seconds
    #[arg(short = 'd', long)]
    duration: Option<f64>,

    /// List devices and exit
    #[arg(long)]
    list: bool,

    /// Verbose output
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Print statistics
    #[arg(long)]
    stats: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    device: DeviceConfig,
    stream: StreamOptions,
}

fn load_config(path: &Path) -> Result<ConfigFile, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    serde_json::from_str(&text).map_err(|e| format!("bad config {}: {}", path.display(), e))
}

type Backend = (Arc<dyn DriverFactory>, Arc<dyn DeviceProbe>);

fn backend(cli: &Cli) -> Result<Backend, String> {
    if let Some(ref file) = cli.file {
        let format: SampleFormat = cli.format.parse().map_err(|e| format!("{}", e))?;
        return Ok((
            Arc::new(FileFactory::new(file, format, cli.looping, !cli.fast)),
            Arc::new(FileProbe::new(file)),
        ));
    }
    if cli.simulate {
        let script = SimScript::default();
        return Ok((
            Arc::new(SimFactory::new(script.clone())),
            Arc::new(SimProbe::new(script)),
        ));
    }
    hardware_backend()
}

#[cfg(feature = "soapysdr")]
fn hardware_backend() -> Result<Backend, String> {
    Ok((
        Arc::new(rf_sdr::soapysdr::SoapyFactory::default()),
        Arc::new(rf_sdr::tools::HackrfTools::new()),
    ))
}

#[cfg(all(feature = "hackrf", not(feature = "soapysdr")))]
fn hardware_backend() -> Result<Backend, String> {
    Ok((
        Arc::new(rf_sdr::hackrf::HackrfFactory::default()),
        Arc::new(rf_sdr::hackrf::HackrfProbe),
    ))
}

#[cfg(not(any(feature = "hackrf", feature = "soapysdr")))]
fn hardware_backend() -> Result<Backend, String> {
    Err("built without hardware support (enable the hackrf or soapysdr feature), \
         use -f <file> or --simulate"
        .to_string())
}

fn sweep(cli: &Cli) -> Result<Option<SweepPlan>, String> {
    let Some(ref range) = cli.sweep else {
        return Ok(None);
    };
    let (start, stop) = range
        .split_once(':')
        .and_then(|(a, b)| Some((a.trim().parse::<f64>().ok()?, b.trim().parse::<f64>().ok()?)))
        .ok_or_else(|| format!("bad sweep range '{}', expected START:STOP in MHz", range))?;
    SweepPlan::new(
        start * 1e6,
        stop * 1e6,
        cli.sweep_step * 1e6,
        Duration::from_millis(cli.dwell),
    )
    .map(Some)
    .map_err(|e| e.to_string())
}

fn settings(cli: &Cli) -> Result<pipeline::Settings, String> {
    let file = match cli.config {
        Some(ref path) => load_config(path)?,
        None => ConfigFile::default(),
    };
    let mut device = file.device;
    if let Some(mhz) = cli.center_freq {
        device.center_freq = mhz * 1e6;
    }
    if let Some(msps) = cli.sample_rate {
        device.sample_rate = msps * 1e6;
    }
    if let Some(mhz) = cli.bandwidth {
        device.bandwidth = mhz * 1e6;
    }
    if let Some(lna) = cli.lna {
        device.lna_gain = lna;
    }
    if let Some(vga) = cli.vga {
        device.vga_gain = vga;
    }
    device.validate().map_err(|e| e.to_string())?;
    file.stream.validate().map_err(|e| e.to_string())?;

    let mode: Mode = cli.mode.parse().map_err(|e| format!("{}", e))?;
    let window: WindowKind = cli.window.parse().map_err(|e| format!("{}", e))?;
    if mode == Mode::FmDemod && cli.write.is_none() {
        log::warn!("fm mode without -w: audio is demodulated but not written");
    }

    Ok(pipeline::Settings {
        device,
        stream: file.stream,
        mode,
        window,
        sweep: sweep(cli)?,
        channel_bw: cli.channel_bw.map(|khz| khz * 1e3),
        gain_db: cli.gain_db,
        audio_out: cli.write.clone(),
        max_bins: cli.max_bins,
        duration: cli.duration.map(Duration::from_secs_f64),
        print_stats: cli.stats,
    })
}

fn main() {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    let (factory, probe) = match backend(&cli) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    };
    let controller = DeviceController::new(factory, probe);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    let result = if cli.list {
        runtime.block_on(pipeline::list_devices(controller))
    } else {
        match settings(&cli) {
            Ok(settings) => {
                if cli.verbose {
                    log::info!("rfscope starting");
                    log::info!("center frequency: {:.3} MHz", settings.device.center_freq / 1e6);
                    log::info!("mode: {}, window: {}", settings.mode, settings.window);
                }
                runtime.block_on(pipeline::run(controller, settings))
            }
            Err(e) => Err(e),
        }
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
