//! Dynamic bindings to librtlsdr
//!
//! The library is loaded at runtime with `libloading`, so the crate builds
//! and runs without librtlsdr installed; a missing library degrades to the
//! mock-only device list instead of a link failure. All routine calls map
//! C return codes to `Result`, and the loaded handle lives in a process-wide
//! `OnceLock`.
//!
//! Sample format: the tuner delivers interleaved unsigned 8-bit I/Q
//! (`[I0, Q0, I1, Q1, ...]`, 128 ≈ zero). [`u8_to_f64`] maps a byte into
//! the normalized [-1, 1] range.

use std::ffi::{c_char, c_int, c_uint, c_void, CStr};
use std::ptr;
use std::sync::OnceLock;

use libloading::{Library, Symbol};

/// Opaque device pointer handed out by librtlsdr.
type DevHandle = *mut c_void;

/// Result type for driver calls.
pub type DriverResult<T> = Result<T, DriverError>;

/// Failures at the native-driver boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DriverError {
    #[error("librtlsdr not found; install the rtl-sdr package")]
    LibraryNotFound,

    #[error("open failed for device #{index}: error code {code}")]
    OpenFailed { index: u32, code: i32 },

    #[error("{call} failed with error code {code}")]
    CallFailed { call: &'static str, code: i32 },

    #[error("driver returned a null device handle")]
    NullHandle,
}

struct Driver {
    _lib: Library,
    device_count: Symbol<'static, unsafe extern "C" fn() -> c_uint>,
    device_name: Symbol<'static, unsafe extern "C" fn(c_uint) -> *const c_char>,
    device_usb_strings: Symbol<
        'static,
        unsafe extern "C" fn(c_uint, *mut c_char, *mut c_char, *mut c_char) -> c_int,
    >,
    open: Symbol<'static, unsafe extern "C" fn(*mut DevHandle, c_uint) -> c_int>,
    close: Symbol<'static, unsafe extern "C" fn(DevHandle) -> c_int>,
    set_center_freq: Symbol<'static, unsafe extern "C" fn(DevHandle, c_uint) -> c_int>,
    get_center_freq: Symbol<'static, unsafe extern "C" fn(DevHandle) -> c_uint>,
    set_sample_rate: Symbol<'static, unsafe extern "C" fn(DevHandle, c_uint) -> c_int>,
    get_sample_rate: Symbol<'static, unsafe extern "C" fn(DevHandle) -> c_uint>,
    set_tuner_gain_mode: Symbol<'static, unsafe extern "C" fn(DevHandle, c_int) -> c_int>,
    set_tuner_gain: Symbol<'static, unsafe extern "C" fn(DevHandle, c_int) -> c_int>,
    get_tuner_gain: Symbol<'static, unsafe extern "C" fn(DevHandle) -> c_int>,
    get_tuner_gains: Symbol<'static, unsafe extern "C" fn(DevHandle, *mut c_int) -> c_int>,
    set_agc_mode: Symbol<'static, unsafe extern "C" fn(DevHandle, c_int) -> c_int>,
    set_freq_correction: Symbol<'static, unsafe extern "C" fn(DevHandle, c_int) -> c_int>,
    reset_buffer: Symbol<'static, unsafe extern "C" fn(DevHandle) -> c_int>,
    read_sync:
        Symbol<'static, unsafe extern "C" fn(DevHandle, *mut c_void, c_int, *mut c_int) -> c_int>,
}

static DRIVER: OnceLock<Option<Driver>> = OnceLock::new();

#[cfg(target_os = "linux")]
const LIB_NAMES: &[&str] = &["librtlsdr.so.0", "librtlsdr.so"];
#[cfg(target_os = "macos")]
const LIB_NAMES: &[&str] = &["librtlsdr.dylib", "librtlsdr.0.dylib"];
#[cfg(target_os = "windows")]
const LIB_NAMES: &[&str] = &["rtlsdr.dll", "librtlsdr.dll"];

fn load_driver() -> Option<Driver> {
    for name in LIB_NAMES {
        let Ok(lib) = (unsafe { Library::new(name) }) else {
            continue;
        };

        let loaded = unsafe {
            // SAFETY: the symbols borrow the Library; storing both in the
            // same struct keeps the borrow alive for the process lifetime.
            let lib_ref: &'static Library = std::mem::transmute(&lib);

            Some(Driver {
                device_count: lib_ref.get(b"rtlsdr_get_device_count\0").ok()?,
                device_name: lib_ref.get(b"rtlsdr_get_device_name\0").ok()?,
                device_usb_strings: lib_ref.get(b"rtlsdr_get_device_usb_strings\0").ok()?,
                open: lib_ref.get(b"rtlsdr_open\0").ok()?,
                close: lib_ref.get(b"rtlsdr_close\0").ok()?,
                set_center_freq: lib_ref.get(b"rtlsdr_set_center_freq\0").ok()?,
                get_center_freq: lib_ref.get(b"rtlsdr_get_center_freq\0").ok()?,
                set_sample_rate: lib_ref.get(b"rtlsdr_set_sample_rate\0").ok()?,
                get_sample_rate: lib_ref.get(b"rtlsdr_get_sample_rate\0").ok()?,
                set_tuner_gain_mode: lib_ref.get(b"rtlsdr_set_tuner_gain_mode\0").ok()?,
                set_tuner_gain: lib_ref.get(b"rtlsdr_set_tuner_gain\0").ok()?,
                get_tuner_gain: lib_ref.get(b"rtlsdr_get_tuner_gain\0").ok()?,
                get_tuner_gains: lib_ref.get(b"rtlsdr_get_tuner_gains\0").ok()?,
                set_agc_mode: lib_ref.get(b"rtlsdr_set_agc_mode\0").ok()?,
                set_freq_correction: lib_ref.get(b"rtlsdr_set_freq_correction\0").ok()?,
                reset_buffer: lib_ref.get(b"rtlsdr_reset_buffer\0").ok()?,
                read_sync: lib_ref.get(b"rtlsdr_read_sync\0").ok()?,
                _lib: lib,
            })
        };

        if loaded.is_some() {
            tracing::info!("loaded RTL-SDR driver: {}", name);
            return loaded;
        }
    }
    tracing::debug!("librtlsdr not found; hardware devices unavailable");
    None
}

fn driver() -> Option<&'static Driver> {
    DRIVER.get_or_init(load_driver).as_ref()
}

/// True when librtlsdr loaded successfully.
pub fn is_available() -> bool {
    driver().is_some()
}

/// Number of connected RTL-SDR devices (0 when the library is missing).
pub fn device_count() -> u32 {
    driver()
        .map(|d| unsafe { (d.device_count)() })
        .unwrap_or(0)
}

/// Tuner name reported for a device index.
pub fn device_name(index: u32) -> Option<String> {
    driver().and_then(|d| {
        let ptr = unsafe { (d.device_name)(index) };
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { CStr::from_ptr(ptr).to_string_lossy().into_owned() })
        }
    })
}

/// USB descriptor strings for a device index.
pub struct UsbStrings {
    pub manufacturer: String,
    pub product: String,
    pub serial: String,
}

fn c_buf_to_string(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(0);
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

pub fn device_usb_strings(index: u32) -> Option<UsbStrings> {
    driver().and_then(|d| {
        let mut manufacturer = [0u8; 256];
        let mut product = [0u8; 256];
        let mut serial = [0u8; 256];

        let ret = unsafe {
            (d.device_usb_strings)(
                index,
                manufacturer.as_mut_ptr() as *mut c_char,
                product.as_mut_ptr() as *mut c_char,
                serial.as_mut_ptr() as *mut c_char,
            )
        };

        (ret == 0).then(|| UsbStrings {
            manufacturer: c_buf_to_string(&manufacturer),
            product: c_buf_to_string(&product),
            serial: c_buf_to_string(&serial),
        })
    })
}

/// An open tuner. Closes on drop.
pub struct TunerHandle {
    handle: DevHandle,
    index: u32,
    gains_tenth_db: Vec<i32>,
}

// SAFETY: librtlsdr serializes access internally for the synchronous API;
// the handle is only ever driven from one worker plus the control thread
// behind a mutex at the device layer.
unsafe impl Send for TunerHandle {}

impl TunerHandle {
    pub fn open(index: u32) -> DriverResult<Self> {
        let d = driver().ok_or(DriverError::LibraryNotFound)?;

        let mut handle: DevHandle = ptr::null_mut();
        let code = unsafe { (d.open)(&mut handle, index) };
        if code != 0 {
            return Err(DriverError::OpenFailed { index, code });
        }
        if handle.is_null() {
            return Err(DriverError::NullHandle);
        }

        let mut gains = [0i32; 64];
        let count = unsafe { (d.get_tuner_gains)(handle, gains.as_mut_ptr()) };
        let gains_tenth_db = if count > 0 {
            gains[..count as usize].to_vec()
        } else {
            Vec::new()
        };

        tracing::info!(
            index,
            gain_levels = gains_tenth_db.len(),
            "opened RTL-SDR tuner"
        );

        Ok(Self {
            handle,
            index,
            gains_tenth_db,
        })
    }

    fn call(&self, name: &'static str, code: c_int) -> DriverResult<()> {
        if code != 0 {
            Err(DriverError::CallFailed { call: name, code })
        } else {
            Ok(())
        }
    }

    /// Tuner gains in tenths of dB, as the driver reports them.
    pub fn gains_tenth_db(&self) -> &[i32] {
        &self.gains_tenth_db
    }

    pub fn set_center_freq(&mut self, hz: u32) -> DriverResult<()> {
        let d = driver().ok_or(DriverError::LibraryNotFound)?;
        self.call("set_center_freq", unsafe {
            (d.set_center_freq)(self.handle, hz)
        })
    }

    pub fn center_freq(&self) -> u32 {
        driver()
            .map(|d| unsafe { (d.get_center_freq)(self.handle) })
            .unwrap_or(0)
    }

    pub fn set_sample_rate(&mut self, hz: u32) -> DriverResult<()> {
        let d = driver().ok_or(DriverError::LibraryNotFound)?;
        self.call("set_sample_rate", unsafe {
            (d.set_sample_rate)(self.handle, hz)
        })
    }

    pub fn sample_rate(&self) -> u32 {
        driver()
            .map(|d| unsafe { (d.get_sample_rate)(self.handle) })
            .unwrap_or(0)
    }

    /// `manual = false` hands gain to the tuner AGC.
    pub fn set_gain_mode(&mut self, manual: bool) -> DriverResult<()> {
        let d = driver().ok_or(DriverError::LibraryNotFound)?;
        self.call("set_tuner_gain_mode", unsafe {
            (d.set_tuner_gain_mode)(self.handle, manual as c_int)
        })
    }

    /// Sets the nearest supported gain; returns the value applied.
    pub fn set_gain_tenth_db(&mut self, tenth_db: i32) -> DriverResult<i32> {
        let d = driver().ok_or(DriverError::LibraryNotFound)?;
        let snapped = self
            .gains_tenth_db
            .iter()
            .copied()
            .min_by_key(|g| (g - tenth_db).abs())
            .unwrap_or(tenth_db);
        self.call("set_tuner_gain", unsafe {
            (d.set_tuner_gain)(self.handle, snapped)
        })?;
        Ok(snapped)
    }

    pub fn gain_tenth_db(&self) -> i32 {
        driver()
            .map(|d| unsafe { (d.get_tuner_gain)(self.handle) })
            .unwrap_or(0)
    }

    /// RTL2832 baseband AGC, separate from the tuner gain mode.
    pub fn set_agc_mode(&mut self, on: bool) -> DriverResult<()> {
        let d = driver().ok_or(DriverError::LibraryNotFound)?;
        self.call("set_agc_mode", unsafe {
            (d.set_agc_mode)(self.handle, on as c_int)
        })
    }

    pub fn set_freq_correction(&mut self, ppm: i32) -> DriverResult<()> {
        let d = driver().ok_or(DriverError::LibraryNotFound)?;
        let code = unsafe { (d.set_freq_correction)(self.handle, ppm) };
        // The driver reports -2 when the correction is already applied.
        if code != 0 && code != -2 {
            return Err(DriverError::CallFailed {
                call: "set_freq_correction",
                code,
            });
        }
        Ok(())
    }

    pub fn reset_buffer(&mut self) -> DriverResult<()> {
        let d = driver().ok_or(DriverError::LibraryNotFound)?;
        self.call("reset_buffer", unsafe { (d.reset_buffer)(self.handle) })
    }

    /// Blocking synchronous read of raw interleaved I/Q bytes.
    ///
    /// `buf.len()` must be a multiple of 512. Returns bytes read.
    pub fn read_sync(&mut self, buf: &mut [u8]) -> DriverResult<usize> {
        let d = driver().ok_or(DriverError::LibraryNotFound)?;
        let mut n_read: c_int = 0;
        let code = unsafe {
            (d.read_sync)(
                self.handle,
                buf.as_mut_ptr() as *mut c_void,
                buf.len() as c_int,
                &mut n_read,
            )
        };
        if code != 0 {
            Err(DriverError::CallFailed {
                call: "read_sync",
                code,
            })
        } else {
            Ok(n_read as usize)
        }
    }
}

impl Drop for TunerHandle {
    fn drop(&mut self) {
        if let Some(d) = driver() {
            tracing::debug!(index = self.index, "closing RTL-SDR tuner");
            unsafe { (d.close)(self.handle) };
        }
    }
}

/// Map one raw tuner byte (128 ≈ zero) into [-1, 1].
#[inline]
pub fn u8_to_f64(byte: u8) -> f64 {
    (byte as f64 - 127.5) / 127.5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_normalization() {
        assert!(u8_to_f64(128).abs() < 0.01);
        assert!((u8_to_f64(0) + 1.0).abs() < 0.01);
        assert!((u8_to_f64(255) - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_availability_probe_is_safe() {
        // Works identically with or without librtlsdr installed.
        let available = is_available();
        let count = device_count();
        if !available {
            assert_eq!(count, 0);
        }
    }

    #[test]
    fn test_c_buf_to_string_stops_at_nul() {
        let mut buf = [0u8; 8];
        buf[..3].copy_from_slice(b"RTL");
        assert_eq!(c_buf_to_string(&buf), "RTL");
        assert_eq!(c_buf_to_string(&[0u8; 4]), "");
    }
}
