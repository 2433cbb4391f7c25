// Copyright 2025-2026 CEMAXECUTER LLC

//! Direct libhackrf backend: driver, factory, and an availability probe
//! that uses the library's own error codes instead of the host tools.

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_void};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use num_complex::Complex32;

use crate::config::GainStage;
use crate::error::{Error, ErrorClass, Result};
use crate::{Availability, DeviceInfo, DeviceProbe, DriverFactory, ReadStatus, SdrDriver};

const HACKRF_SUCCESS: c_int = 0;
const HACKRF_ERROR_NOT_FOUND: c_int = -5;
const HACKRF_ERROR_BUSY: c_int = -6;
const HACKRF_ERROR_LIBUSB: c_int = -1000;

/// Chunks buffered between the USB callback and `read_stream`.
const RX_CHUNKS: usize = 64;

#[repr(C)]
struct HackrfDeviceList {
    serial_numbers: *mut *mut c_char,
    usb_board_ids: *mut c_int,
    usb_device_index: *mut c_int,
    devicecount: c_int,
    usb_devices: *mut *mut c_void,
    usb_devicecount: c_int,
}

#[repr(C)]
pub struct HackrfTransfer {
    pub device: *mut c_void,
    pub buffer: *mut u8,
    pub buffer_length: i32,
    pub valid_length: i32,
    pub rx_ctx: *mut c_void,
    pub tx_ctx: *mut c_void,
}

type HackrfDevice = c_void;

extern "C" {
    fn hackrf_init() -> c_int;
    fn hackrf_exit() -> c_int;
    fn hackrf_open(device: *mut *mut HackrfDevice) -> c_int;
    fn hackrf_open_by_serial(
        desired_serial_number: *const c_char,
        device: *mut *mut HackrfDevice,
    ) -> c_int;
    fn hackrf_close(device: *mut HackrfDevice) -> c_int;
    fn hackrf_reset(device: *mut HackrfDevice) -> c_int;
    fn hackrf_set_sample_rate(device: *mut HackrfDevice, freq_hz: f64) -> c_int;
    fn hackrf_set_baseband_filter_bandwidth(device: *mut HackrfDevice, bandwidth_hz: u32) -> c_int;
    fn hackrf_compute_baseband_filter_bw(bandwidth_hz: u32) -> u32;
    fn hackrf_set_freq(device: *mut HackrfDevice, freq_hz: u64) -> c_int;
    fn hackrf_set_vga_gain(device: *mut HackrfDevice, value: u32) -> c_int;
    fn hackrf_set_lna_gain(device: *mut HackrfDevice, value: u32) -> c_int;
    fn hackrf_start_rx(
        device: *mut HackrfDevice,
        callback: unsafe extern "C" fn(*mut HackrfTransfer) -> c_int,
        rx_ctx: *mut c_void,
    ) -> c_int;
    fn hackrf_stop_rx(device: *mut HackrfDevice) -> c_int;
    fn hackrf_device_list() -> *mut HackrfDeviceList;
    fn hackrf_device_list_free(list: *mut HackrfDeviceList);
    fn hackrf_error_name(errcode: c_int) -> *const c_char;
}

fn error_name(code: c_int) -> String {
    unsafe {
        let p = hackrf_error_name(code);
        if p.is_null() {
            format!("error {}", code)
        } else {
            CStr::from_ptr(p).to_string_lossy().to_string()
        }
    }
}

fn class_of(code: c_int) -> ErrorClass {
    match code {
        HACKRF_ERROR_BUSY | HACKRF_ERROR_LIBUSB => ErrorClass::Busy,
        _ => ErrorClass::Fatal,
    }
}

fn check(call: &'static str, code: c_int) -> Result<()> {
    if code == HACKRF_SUCCESS {
        Ok(())
    } else {
        Err(Error::Hardware {
            call,
            message: format!("{} ({})", error_name(code), code),
            class: class_of(code),
        })
    }
}

/// List all available HackRF devices
pub fn list_devices() -> Result<Vec<DeviceInfo>> {
    unsafe {
        check("hackrf_init", hackrf_init())?;

        let list = hackrf_device_list();
        if list.is_null() {
            hackrf_exit();
            return Err(Error::hardware("hackrf_device_list", "returned null"));
        }

        let count = (*list).devicecount.max(0) as usize;
        let mut devices = Vec::with_capacity(count);

        for i in 0..count {
            let serial_ptr = *(*list).serial_numbers.add(i);
            if serial_ptr.is_null() {
                continue;
            }
            let serial_full = CStr::from_ptr(serial_ptr).to_string_lossy().to_string();
            let serial = serial_full.trim_start_matches('0').to_string();
            devices.push(DeviceInfo {
                label: format!("HackRF One #{} {}", i, serial),
                serial,
                driver: "hackrf".to_string(),
            });
        }

        hackrf_device_list_free(list);
        hackrf_exit();
        Ok(devices)
    }
}

/// Open a device (first one when `serial` is None). Caller holds one
/// `hackrf_init` reference on success.
unsafe fn open_device(serial: Option<&str>) -> std::result::Result<*mut HackrfDevice, c_int> {
    let r = hackrf_init();
    if r != HACKRF_SUCCESS {
        return Err(r);
    }
    let mut dev: *mut HackrfDevice = ptr::null_mut();
    let r = match serial {
        Some(s) => match CString::new(s) {
            Ok(cs) => hackrf_open_by_serial(cs.as_ptr(), &mut dev),
            Err(_) => HACKRF_ERROR_NOT_FOUND,
        },
        None => hackrf_open(&mut dev),
    };
    if r != HACKRF_SUCCESS {
        hackrf_exit();
        return Err(r);
    }
    Ok(dev)
}

/// Shared with the USB callback thread for the life of one stream.
struct RxContext {
    tx: Sender<Vec<i8>>,
    dropped: AtomicU64,
}

unsafe extern "C" fn rx_callback(transfer: *mut HackrfTransfer) -> c_int {
    let ctx = &*((*transfer).rx_ctx as *const RxContext);
    let valid = (*transfer).valid_length.max(0) as usize;
    let bytes = std::slice::from_raw_parts((*transfer).buffer as *const i8, valid);

    if ctx.tx.try_send(bytes.to_vec()).is_err() {
        ctx.dropped.fetch_add(1, Ordering::Relaxed);
    }
    0
}

struct RxStream {
    ctx: *mut RxContext,
    rx: Receiver<Vec<i8>>,
    pending: Vec<i8>,
    pending_offset: usize,
    seen_dropped: u64,
}

/// HackRF One via libhackrf. The library delivers samples through a
/// callback; a bounded channel turns that into blocking timed reads.
pub struct HackrfDriver {
    dev: *mut HackrfDevice,
    stream: Option<RxStream>,
    lna_gain: i32,
    vga_gain: i32,
}

// The device pointer is only used through &mut self and DeviceHandle
// serializes access.
unsafe impl Send for HackrfDriver {}

impl HackrfDriver {
    pub fn open(serial: Option<&str>) -> Result<Self> {
        let dev = unsafe { open_device(serial) }.map_err(|code| match code {
            HACKRF_ERROR_NOT_FOUND => Error::DeviceNotFound,
            c if class_of(c) == ErrorClass::Busy => Error::DeviceBusy(error_name(c)),
            c => Error::InitializationFailed(format!("hackrf_open: {}", error_name(c))),
        })?;
        log::info!("HackRF opened (serial={:?})", serial);
        Ok(Self {
            dev,
            stream: None,
            lna_gain: 0,
            vga_gain: 0,
        })
    }
}

impl SdrDriver for HackrfDriver {
    fn set_sample_rate(&mut self, rate: f64) -> Result<()> {
        check("hackrf_set_sample_rate", unsafe {
            hackrf_set_sample_rate(self.dev, rate)
        })
    }

    fn set_bandwidth(&mut self, bandwidth: f64) -> Result<()> {
        let bw = unsafe { hackrf_compute_baseband_filter_bw(bandwidth as u32) };
        log::debug!("baseband filter {} Hz (requested {} Hz)", bw, bandwidth);
        check("hackrf_set_baseband_filter_bandwidth", unsafe {
            hackrf_set_baseband_filter_bandwidth(self.dev, bw)
        })
    }

    fn set_frequency(&mut self, freq: f64) -> Result<()> {
        check("hackrf_set_freq", unsafe { hackrf_set_freq(self.dev, freq as u64) })
    }

    fn set_gain(&mut self, stage: GainStage, value: i32) -> Result<()> {
        let value_u = value.max(0) as u32;
        match stage {
            GainStage::Lna => {
                check("hackrf_set_lna_gain", unsafe { hackrf_set_lna_gain(self.dev, value_u) })?;
                self.lna_gain = value;
            }
            GainStage::Vga => {
                check("hackrf_set_vga_gain", unsafe { hackrf_set_vga_gain(self.dev, value_u) })?;
                self.vga_gain = value;
            }
        }
        Ok(())
    }

    /// libhackrf has no gain getters; report the last value it accepted.
    fn gain(&self, stage: GainStage) -> Result<f64> {
        Ok(match stage {
            GainStage::Lna => self.lna_gain as f64,
            GainStage::Vga => self.vga_gain as f64,
        })
    }

    fn open_stream(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let (tx, rx) = bounded::<Vec<i8>>(RX_CHUNKS);
        let ctx = Box::into_raw(Box::new(RxContext {
            tx,
            dropped: AtomicU64::new(0),
        }));

        let r = unsafe { hackrf_start_rx(self.dev, rx_callback, ctx as *mut c_void) };
        if r != HACKRF_SUCCESS {
            unsafe { drop(Box::from_raw(ctx)) };
            return Err(match class_of(r) {
                ErrorClass::Busy => Error::DeviceBusy(error_name(r)),
                _ => Error::StreamSetupFailed(format!("hackrf_start_rx: {}", error_name(r))),
            });
        }

        self.stream = Some(RxStream {
            ctx,
            rx,
            pending: Vec::new(),
            pending_offset: 0,
            seen_dropped: 0,
        });
        log::info!("HackRF RX streaming started");
        Ok(())
    }

    fn read_stream(&mut self, buf: &mut [Complex32], timeout: Duration) -> ReadStatus {
        let Some(stream) = self.stream.as_mut() else {
            return ReadStatus::Error(Error::ReadFatal("stream not open".into()));
        };

        let dropped = unsafe { (*stream.ctx).dropped.load(Ordering::Relaxed) };
        if dropped != stream.seen_dropped {
            stream.seen_dropped = dropped;
            return ReadStatus::Overflow;
        }

        if stream.pending_offset >= stream.pending.len() {
            match stream.rx.recv_timeout(timeout) {
                Ok(chunk) => {
                    stream.pending = chunk;
                    stream.pending_offset = 0;
                }
                Err(RecvTimeoutError::Timeout) => return ReadStatus::Timeout,
                Err(RecvTimeoutError::Disconnected) => {
                    return ReadStatus::Error(Error::ReadFatal("RX callback stopped".into()))
                }
            }
        }

        let avail = (stream.pending.len() - stream.pending_offset) / 2;
        let n = avail.min(buf.len());
        let iq = &stream.pending[stream.pending_offset..stream.pending_offset + n * 2];
        for (out, pair) in buf.iter_mut().zip(iq.chunks_exact(2)) {
            *out = Complex32::new(pair[0] as f32 / 128.0, pair[1] as f32 / 128.0);
        }
        stream.pending_offset += n * 2;
        ReadStatus::Samples(n)
    }

    fn close_stream(&mut self) {
        if let Some(stream) = self.stream.take() {
            unsafe {
                hackrf_stop_rx(self.dev);
                drop(Box::from_raw(stream.ctx));
            }
            log::info!("HackRF RX streaming stopped");
        }
    }
}

impl Drop for HackrfDriver {
    fn drop(&mut self) {
        self.close_stream();
        unsafe {
            hackrf_close(self.dev);
            hackrf_exit();
        }
    }
}

#[derive(Default)]
pub struct HackrfFactory {
    serial: Option<String>,
}

impl HackrfFactory {
    pub fn with_serial(serial: &str) -> Self {
        Self {
            serial: Some(serial.to_string()),
        }
    }
}

impl DriverFactory for HackrfFactory {
    fn name(&self) -> &str {
        "hackrf"
    }

    fn enumerate(&self) -> Result<Vec<DeviceInfo>> {
        list_devices()
    }

    fn open(&self) -> Result<Box<dyn SdrDriver>> {
        Ok(Box::new(HackrfDriver::open(self.serial.as_deref())?))
    }
}

/// Probe and reset through libhackrf. Opening briefly tells busy from
/// absent; reset re-enumerates the MCU.
#[derive(Default)]
pub struct HackrfProbe;

impl DeviceProbe for HackrfProbe {
    fn probe(&self) -> Availability {
        match unsafe { open_device(None) } {
            Ok(dev) => {
                unsafe {
                    hackrf_close(dev);
                    hackrf_exit();
                }
                Availability::Available
            }
            Err(HACKRF_ERROR_NOT_FOUND) => Availability::NotFound,
            Err(code) => {
                log::debug!("hackrf probe: {}", error_name(code));
                Availability::Busy
            }
        }
    }

    fn reset(&self) -> Result<()> {
        let dev = unsafe { open_device(None) }.map_err(|code| Error::Hardware {
            call: "hackrf_open",
            message: error_name(code),
            class: class_of(code),
        })?;
        let r = unsafe { hackrf_reset(dev) };
        unsafe {
            // The board detaches after reset; close may fail harmlessly.
            hackrf_close(dev);
            hackrf_exit();
        }
        check("hackrf_reset", r)
    }
}
