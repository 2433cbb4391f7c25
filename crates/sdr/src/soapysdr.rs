// Copyright 2025-2026 CEMAXECUTER LLC

//! HackRF through SoapySDR (driver=hackrf), CF32 stream on channel 0.

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_double, c_int, c_void};
use std::ptr;
use std::time::Duration;

use num_complex::Complex32;

use crate::config::GainStage;
use crate::error::{classify_message, Error, ErrorClass, Result};
use crate::{DeviceInfo, DriverFactory, ReadStatus, SdrDriver};

type SoapyDevice = c_void;
type SoapyStream = c_void;

const SOAPY_SDR_RX: c_int = 0;
const SOAPY_SDR_TIMEOUT: c_int = -1;
const SOAPY_SDR_OVERFLOW: c_int = -4;

#[repr(C)]
struct SoapyKwargs {
    size: usize,
    keys: *mut *mut c_char,
    vals: *mut *mut c_char,
}

extern "C" {
    fn SoapySDRDevice_enumerateStrArgs(args: *const c_char, length: *mut usize) -> *mut SoapyKwargs;
    fn SoapySDRDevice_makeStrArgs(args: *const c_char) -> *mut SoapyDevice;
    fn SoapySDRDevice_unmake(device: *mut SoapyDevice) -> c_int;
    fn SoapySDRDevice_setSampleRate(
        dev: *mut SoapyDevice,
        direction: c_int,
        channel: usize,
        rate: c_double,
    ) -> c_int;
    fn SoapySDRDevice_setFrequency(
        dev: *mut SoapyDevice,
        direction: c_int,
        channel: usize,
        frequency: c_double,
        args: *const SoapyKwargs,
    ) -> c_int;
    fn SoapySDRDevice_setGainElement(
        dev: *mut SoapyDevice,
        direction: c_int,
        channel: usize,
        name: *const c_char,
        value: c_double,
    ) -> c_int;
    fn SoapySDRDevice_getGainElement(
        dev: *const SoapyDevice,
        direction: c_int,
        channel: usize,
        name: *const c_char,
    ) -> c_double;
    fn SoapySDRDevice_setBandwidth(
        dev: *mut SoapyDevice,
        direction: c_int,
        channel: usize,
        bw: c_double,
    ) -> c_int;
    fn SoapySDRDevice_setAntenna(
        dev: *mut SoapyDevice,
        direction: c_int,
        channel: usize,
        name: *const c_char,
    ) -> c_int;
    fn SoapySDRDevice_setupStream(
        dev: *mut SoapyDevice,
        direction: c_int,
        format: *const c_char,
        channels: *const usize,
        num_chans: usize,
        args: *const SoapyKwargs,
    ) -> *mut SoapyStream;
    fn SoapySDRDevice_activateStream(
        dev: *mut SoapyDevice,
        stream: *mut SoapyStream,
        flags: c_int,
        time_ns: i64,
        num_elems: usize,
    ) -> c_int;
    fn SoapySDRDevice_deactivateStream(
        dev: *mut SoapyDevice,
        stream: *mut SoapyStream,
        flags: c_int,
        time_ns: i64,
    ) -> c_int;
    fn SoapySDRDevice_closeStream(dev: *mut SoapyDevice, stream: *mut SoapyStream) -> c_int;
    fn SoapySDRDevice_readStream(
        dev: *mut SoapyDevice,
        stream: *mut SoapyStream,
        buffs: *const *mut c_void,
        num_elems: usize,
        flags: *mut c_int,
        time_ns: *mut i64,
        timeout_us: i64,
    ) -> c_int;
    fn SoapySDRDevice_lastError() -> *const c_char;
    fn SoapySDR_errToStr(code: c_int) -> *const c_char;
    fn SoapySDRKwargsList_clear(info: *mut SoapyKwargs, length: usize);
}

const HACKRF_ARGS: &str = "driver=hackrf";

fn last_error() -> String {
    unsafe {
        let p = SoapySDRDevice_lastError();
        if p.is_null() {
            "unknown error".to_string()
        } else {
            CStr::from_ptr(p).to_string_lossy().to_string()
        }
    }
}

fn err_to_str(code: c_int) -> String {
    unsafe {
        let p = SoapySDR_errToStr(code);
        if p.is_null() {
            format!("error {}", code)
        } else {
            CStr::from_ptr(p).to_string_lossy().to_string()
        }
    }
}

fn c_string(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| Error::InvalidParameter(format!("embedded NUL in {:?}", s)))
}

/// Turn a SoapySDR status return into a classified error.
fn check(call: &'static str, ret: c_int) -> Result<()> {
    if ret == 0 {
        return Ok(());
    }
    let message = format!("{} ({})", last_error(), ret);
    Err(Error::Hardware {
        call,
        class: classify_message(&message),
        message,
    })
}

fn kwargs_get(kw: &SoapyKwargs, wanted: &str) -> Option<String> {
    for j in 0..kw.size {
        let key = unsafe { CStr::from_ptr(*kw.keys.add(j)).to_string_lossy() };
        if key == wanted {
            let val = unsafe { CStr::from_ptr(*kw.vals.add(j)).to_string_lossy() };
            return Some(val.to_string());
        }
    }
    None
}

pub fn list_devices() -> Result<Vec<DeviceInfo>> {
    let args = c_string(HACKRF_ARGS)?;
    let mut length: usize = 0;
    let results = unsafe { SoapySDRDevice_enumerateStrArgs(args.as_ptr(), &mut length) };
    if results.is_null() || length == 0 {
        return Ok(Vec::new());
    }

    let mut devices = Vec::with_capacity(length);
    for i in 0..length {
        let kw = unsafe { &*results.add(i) };
        devices.push(DeviceInfo {
            serial: kwargs_get(kw, "serial").unwrap_or_default(),
            driver: kwargs_get(kw, "driver").unwrap_or_else(|| "hackrf".to_string()),
            label: kwargs_get(kw, "label").unwrap_or_default(),
        });
    }

    unsafe { SoapySDRKwargsList_clear(results, length) };
    Ok(devices)
}

pub struct SoapyDriver {
    dev: *mut SoapyDevice,
    stream: *mut SoapyStream,
}

// The raw pointers are only touched through &mut self, and DeviceHandle
// serializes all access behind a mutex.
unsafe impl Send for SoapyDriver {}

impl SoapyDriver {
    pub fn open(args: &str) -> Result<Self> {
        let c_args = c_string(args)?;
        let dev = unsafe { SoapySDRDevice_makeStrArgs(c_args.as_ptr()) };
        if dev.is_null() {
            let message = last_error();
            return Err(match classify_message(&message) {
                ErrorClass::Busy => Error::DeviceBusy(message),
                _ => Error::InitializationFailed(format!("SoapySDR make failed: {}", message)),
            });
        }

        let driver = Self {
            dev,
            stream: ptr::null_mut(),
        };
        let antenna = c_string("RX")?;
        if let Err(e) = check("setAntenna", unsafe {
            SoapySDRDevice_setAntenna(dev, SOAPY_SDR_RX, 0, antenna.as_ptr())
        }) {
            log::warn!("could not select RX antenna: {}", e);
        }
        log::info!("SoapySDR device opened ({})", args);
        Ok(driver)
    }
}

impl SdrDriver for SoapyDriver {
    fn set_sample_rate(&mut self, rate: f64) -> Result<()> {
        check("setSampleRate", unsafe {
            SoapySDRDevice_setSampleRate(self.dev, SOAPY_SDR_RX, 0, rate)
        })
    }

    fn set_bandwidth(&mut self, bandwidth: f64) -> Result<()> {
        check("setBandwidth", unsafe {
            SoapySDRDevice_setBandwidth(self.dev, SOAPY_SDR_RX, 0, bandwidth)
        })
    }

    fn set_frequency(&mut self, freq: f64) -> Result<()> {
        check("setFrequency", unsafe {
            SoapySDRDevice_setFrequency(self.dev, SOAPY_SDR_RX, 0, freq, ptr::null())
        })
    }

    fn set_gain(&mut self, stage: GainStage, value: i32) -> Result<()> {
        let name = c_string(stage.name())?;
        check("setGainElement", unsafe {
            SoapySDRDevice_setGainElement(self.dev, SOAPY_SDR_RX, 0, name.as_ptr(), value as f64)
        })
    }

    fn gain(&self, stage: GainStage) -> Result<f64> {
        let name = c_string(stage.name())?;
        Ok(unsafe { SoapySDRDevice_getGainElement(self.dev, SOAPY_SDR_RX, 0, name.as_ptr()) })
    }

    fn open_stream(&mut self) -> Result<()> {
        if !self.stream.is_null() {
            return Ok(());
        }
        let format = c_string("CF32")?;
        let channel: usize = 0;
        let stream = unsafe {
            SoapySDRDevice_setupStream(
                self.dev,
                SOAPY_SDR_RX,
                format.as_ptr(),
                &channel,
                1,
                ptr::null(),
            )
        };
        if stream.is_null() {
            let message = last_error();
            return Err(match classify_message(&message) {
                ErrorClass::Busy => Error::DeviceBusy(message),
                _ => Error::StreamSetupFailed(format!("setupStream: {}", message)),
            });
        }

        let r = unsafe { SoapySDRDevice_activateStream(self.dev, stream, 0, 0, 0) };
        if r != 0 {
            unsafe { SoapySDRDevice_closeStream(self.dev, stream) };
            return Err(Error::StreamSetupFailed(format!(
                "activateStream: {}",
                err_to_str(r)
            )));
        }

        self.stream = stream;
        log::info!("SoapySDR RX stream active (CF32)");
        Ok(())
    }

    fn read_stream(&mut self, buf: &mut [Complex32], timeout: Duration) -> ReadStatus {
        if self.stream.is_null() {
            return ReadStatus::Error(Error::ReadFatal("stream not open".into()));
        }
        let mut flags: c_int = 0;
        let mut time_ns: i64 = 0;
        // Complex32 is repr(C) { re, im }, the CF32 layout.
        let buf_ptr = buf.as_mut_ptr() as *mut c_void;

        let ret = unsafe {
            SoapySDRDevice_readStream(
                self.dev,
                self.stream,
                &buf_ptr,
                buf.len(),
                &mut flags,
                &mut time_ns,
                timeout.as_micros() as i64,
            )
        };

        match ret {
            n if n >= 0 => ReadStatus::Samples(n as usize),
            SOAPY_SDR_TIMEOUT => ReadStatus::Timeout,
            SOAPY_SDR_OVERFLOW => ReadStatus::Overflow,
            code => ReadStatus::Error(Error::ReadFatal(format!(
                "readStream: {} ({})",
                err_to_str(code),
                code
            ))),
        }
    }

    fn close_stream(&mut self) {
        if self.stream.is_null() {
            return;
        }
        unsafe {
            SoapySDRDevice_deactivateStream(self.dev, self.stream, 0, 0);
            SoapySDRDevice_closeStream(self.dev, self.stream);
        }
        self.stream = ptr::null_mut();
        log::info!("SoapySDR RX stream closed");
    }
}

impl Drop for SoapyDriver {
    fn drop(&mut self) {
        self.close_stream();
        unsafe {
            SoapySDRDevice_unmake(self.dev);
        }
    }
}

/// Opens the first HackRF SoapySDR can see, or a specific serial.
pub struct SoapyFactory {
    args: String,
}

impl Default for SoapyFactory {
    fn default() -> Self {
        Self {
            args: HACKRF_ARGS.to_string(),
        }
    }
}

impl SoapyFactory {
    pub fn with_serial(serial: &str) -> Self {
        Self {
            args: format!("{},serial={}", HACKRF_ARGS, serial),
        }
    }
}

impl DriverFactory for SoapyFactory {
    fn name(&self) -> &str {
        "soapysdr"
    }

    fn enumerate(&self) -> Result<Vec<DeviceInfo>> {
        list_devices()
    }

    fn open(&self) -> Result<Box<dyn SdrDriver>> {
        if list_devices()?.is_empty() {
            return Err(Error::DeviceNotFound);
        }
        Ok(Box::new(SoapyDriver::open(&self.args)?))
    }
}
