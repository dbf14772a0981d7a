//! RTL-SDR hardware device
//!
//! Binds the [`SdrDevice`] contract to an RTL2832U tuner through the
//! dynamically loaded driver in [`super::rtlsdr_ffi`]. A dedicated worker
//! thread blocks in the driver's synchronous read, converts each raw
//! interleaved 8-bit block to normalized complex samples, and republishes
//! it to subscribed sinks on that same thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use num_complex::Complex64;
use tracing::{debug, error, info, warn};

use crate::types::IqSample;

use super::rtlsdr_ffi::{self, TunerHandle};
use super::{DeviceInfo, DeviceSink, DeviceType, SdrDevice, SinkId, SinkRegistry};

/// Tunable range for RTL2832U-based receivers (R820T-class tuners).
pub const MIN_FREQUENCY_HZ: u64 = 24_000_000;
pub const MAX_FREQUENCY_HZ: u64 = 1_766_000_000;

/// Discrete sample rates the RTL2832U handles without gaps.
const SUPPORTED_SAMPLE_RATES: &[u32] = &[
    250_000, 1_024_000, 1_800_000, 1_920_000, 2_048_000, 2_400_000, 2_560_000, 3_200_000,
];

/// Raw read size in bytes (driver requires a multiple of 512).
const READ_CHUNK_BYTES: usize = 32_768;

/// Backoff after a failed streaming-loop read.
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Typical R820T gain table, used when a device cannot be probed at
/// enumeration time.
fn fallback_gains() -> Vec<f64> {
    vec![0.0, 0.9, 1.4, 2.7, 3.7, 7.7, 8.7, 12.5, 14.4, 15.7, 19.7, 20.7, 22.9, 25.4, 28.0, 29.7, 32.8, 33.8, 36.4, 37.2, 38.6, 40.2, 42.1, 43.4, 43.9, 44.5, 48.0, 49.6]
}

/// Enumerate connected RTL-SDR receivers.
///
/// Each device is opened briefly to read its real gain table; a busy or
/// failing device still enumerates with the fallback table.
pub fn enumerate() -> Vec<DeviceInfo> {
    if !rtlsdr_ffi::is_available() {
        return Vec::new();
    }

    let count = rtlsdr_ffi::device_count();
    let mut devices = Vec::with_capacity(count as usize);

    for index in 0..count {
        let name = rtlsdr_ffi::device_name(index).unwrap_or_else(|| "RTL-SDR".to_string());
        let usb = rtlsdr_ffi::device_usb_strings(index);

        let gains = match TunerHandle::open(index) {
            Ok(handle) => handle
                .gains_tenth_db()
                .iter()
                .map(|&g| g as f64 / 10.0)
                .collect(),
            Err(e) => {
                warn!(index, %e, "could not probe tuner gains, using defaults");
                fallback_gains()
            }
        };

        let (manufacturer, serial) = match usb {
            Some(u) => (u.manufacturer, u.serial),
            None => (String::new(), String::new()),
        };

        devices.push(DeviceInfo {
            // Mock owns index 0 in the combined enumeration.
            index: index + 1,
            name,
            manufacturer,
            serial,
            device_type: DeviceType::RtlSdr,
            min_frequency_hz: MIN_FREQUENCY_HZ,
            max_frequency_hz: MAX_FREQUENCY_HZ,
            supported_sample_rates: SUPPORTED_SAMPLE_RATES.to_vec(),
            available_gains_db: gains,
        });
    }

    devices
}

/// Parameters applied to the tuner on open and tracked across reopen.
#[derive(Debug, Clone)]
struct TunerConfig {
    frequency_hz: u64,
    sample_rate: u32,
    auto_gain: bool,
    gain_db: f64,
    ppm: i32,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            frequency_hz: 100_000_000,
            sample_rate: 2_400_000,
            auto_gain: true,
            gain_db: 0.0,
            ppm: 0,
        }
    }
}

/// Hardware-backed device.
pub struct RtlSdrDevice {
    info: DeviceInfo,
    config: TunerConfig,
    handle: Option<Arc<Mutex<TunerHandle>>>,
    registry: Arc<SinkRegistry>,
    streaming: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl RtlSdrDevice {
    pub fn new(info: DeviceInfo) -> Self {
        Self {
            info,
            config: TunerConfig::default(),
            handle: None,
            registry: SinkRegistry::new(),
            streaming: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    /// Driver index (the combined enumeration reserves 0 for the mock).
    fn driver_index(&self) -> u32 {
        self.info.index.saturating_sub(1)
    }

    fn apply_config(&self, handle: &mut TunerHandle) -> Result<(), String> {
        handle
            .set_sample_rate(self.config.sample_rate)
            .map_err(|e| e.to_string())?;
        handle
            .set_center_freq(self.config.frequency_hz as u32)
            .map_err(|e| e.to_string())?;
        handle
            .set_gain_mode(!self.config.auto_gain)
            .map_err(|e| e.to_string())?;
        if !self.config.auto_gain {
            handle
                .set_gain_tenth_db((self.config.gain_db * 10.0).round() as i32)
                .map_err(|e| e.to_string())?;
        }
        if self.config.ppm != 0 {
            handle
                .set_freq_correction(self.config.ppm)
                .map_err(|e| e.to_string())?;
        }
        Ok(())
    }

    fn join_worker(&mut self) {
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("RTL-SDR streaming worker panicked");
            }
        }
    }
}

impl SdrDevice for RtlSdrDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn open(&mut self) -> bool {
        if self.handle.is_some() {
            return true;
        }

        match TunerHandle::open(self.driver_index()) {
            Ok(mut handle) => {
                if let Err(msg) = self.apply_config(&mut handle) {
                    error!(%msg, "tuner configuration failed on open");
                    self.registry.publish_error(&msg);
                    return false;
                }
                info!(device = %self.info.name, "RTL-SDR device opened");
                self.handle = Some(Arc::new(Mutex::new(handle)));
                true
            }
            Err(e) => {
                error!(%e, "RTL-SDR open failed");
                self.registry.publish_error(&e.to_string());
                false
            }
        }
    }

    fn close(&mut self) {
        self.stop_streaming();
        if self.handle.take().is_some() {
            info!(device = %self.info.name, "RTL-SDR device closed");
        }
    }

    fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    fn set_frequency(&mut self, hz: u64) -> bool {
        if !self.info.in_frequency_range(hz) {
            return false;
        }
        self.config.frequency_hz = hz;
        if let Some(handle) = &self.handle {
            if let Err(e) = handle.lock().unwrap().set_center_freq(hz as u32) {
                warn!(%e, hz, "set_center_freq rejected");
                return false;
            }
        }
        true
    }

    fn frequency(&self) -> u64 {
        match &self.handle {
            Some(handle) => handle.lock().unwrap().center_freq() as u64,
            None => self.config.frequency_hz,
        }
    }

    fn set_sample_rate(&mut self, hz: u32) -> bool {
        if !self.info.supported_sample_rates.contains(&hz) {
            return false;
        }
        self.config.sample_rate = hz;
        if let Some(handle) = &self.handle {
            if let Err(e) = handle.lock().unwrap().set_sample_rate(hz) {
                warn!(%e, hz, "set_sample_rate rejected");
                return false;
            }
        }
        true
    }

    fn sample_rate(&self) -> u32 {
        match &self.handle {
            Some(handle) => handle.lock().unwrap().sample_rate(),
            None => self.config.sample_rate,
        }
    }

    fn set_gain_mode(&mut self, auto: bool) -> bool {
        self.config.auto_gain = auto;
        if let Some(handle) = &self.handle {
            let mut h = handle.lock().unwrap();
            if h.set_gain_mode(!auto).is_err() {
                return false;
            }
            // Tuner AGC and baseband AGC travel together.
            let _ = h.set_agc_mode(auto);
        }
        true
    }

    fn set_gain(&mut self, db: f64) -> bool {
        let snapped = self.info.nearest_gain(db);
        self.config.gain_db = snapped;
        if let Some(handle) = &self.handle {
            if self.config.auto_gain {
                // Stored for when auto-gain turns off.
                return true;
            }
            let tenth_db = (snapped * 10.0).round() as i32;
            if let Err(e) = handle.lock().unwrap().set_gain_tenth_db(tenth_db) {
                warn!(%e, db, "set_tuner_gain rejected");
                return false;
            }
        }
        true
    }

    fn gain(&self) -> f64 {
        match &self.handle {
            Some(handle) => handle.lock().unwrap().gain_tenth_db() as f64 / 10.0,
            None => self.config.gain_db,
        }
    }

    fn set_freq_correction(&mut self, ppm: i32) -> bool {
        self.config.ppm = ppm;
        if let Some(handle) = &self.handle {
            if let Err(e) = handle.lock().unwrap().set_freq_correction(ppm) {
                warn!(%e, ppm, "set_freq_correction rejected");
                return false;
            }
        }
        true
    }

    fn start_streaming(&mut self) -> bool {
        let Some(handle) = self.handle.clone() else {
            return false;
        };
        if self.streaming.swap(true, Ordering::SeqCst) {
            return true;
        }

        if let Err(e) = handle.lock().unwrap().reset_buffer() {
            warn!(%e, "reset_buffer before streaming failed");
        }

        let registry = self.registry.clone();
        let running = self.streaming.clone();

        let spawned = thread::Builder::new()
            .name("rtlsdr-stream".to_string())
            .spawn(move || {
                debug!("RTL-SDR streaming worker started");
                let mut raw = vec![0u8; READ_CHUNK_BYTES];
                let mut block = vec![Complex64::new(0.0, 0.0); READ_CHUNK_BYTES / 2];

                while running.load(Ordering::SeqCst) {
                    let read = handle.lock().unwrap().read_sync(&mut raw);
                    match read {
                        Ok(0) => {
                            warn!("RTL-SDR read returned no data");
                            thread::sleep(READ_ERROR_BACKOFF);
                        }
                        Ok(bytes) => {
                            let n = bytes / 2;
                            for (s, pair) in block[..n].iter_mut().zip(raw[..bytes].chunks_exact(2))
                            {
                                *s = Complex64::new(
                                    rtlsdr_ffi::u8_to_f64(pair[0]),
                                    rtlsdr_ffi::u8_to_f64(pair[1]),
                                );
                            }
                            registry.publish_samples(&block[..n], SystemTime::now());
                        }
                        Err(e) => {
                            // Never let one bad read end the stream silently.
                            error!(%e, "RTL-SDR read failed, backing off");
                            registry.publish_error(&e.to_string());
                            thread::sleep(READ_ERROR_BACKOFF);
                        }
                    }
                }
                debug!("RTL-SDR streaming worker stopped");
            });

        match spawned {
            Ok(worker) => {
                self.worker = Some(worker);
                true
            }
            Err(e) => {
                self.streaming.store(false, Ordering::SeqCst);
                self.registry
                    .publish_error(&format!("failed to spawn streaming worker: {e}"));
                false
            }
        }
    }

    fn stop_streaming(&mut self) {
        if self.streaming.swap(false, Ordering::SeqCst) {
            self.join_worker();
        }
    }

    fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    fn read_samples(&mut self, buf: &mut [IqSample]) -> usize {
        let Some(handle) = &self.handle else {
            return 0;
        };
        // Driver wants byte counts in multiples of 512.
        let bytes_wanted = (buf.len() * 2) & !511;
        if bytes_wanted == 0 {
            return 0;
        }
        let mut raw = vec![0u8; bytes_wanted];
        match handle.lock().unwrap().read_sync(&mut raw) {
            Ok(bytes) => {
                let n = bytes / 2;
                for (s, pair) in buf[..n].iter_mut().zip(raw[..bytes].chunks_exact(2)) {
                    *s = Complex64::new(
                        rtlsdr_ffi::u8_to_f64(pair[0]),
                        rtlsdr_ffi::u8_to_f64(pair[1]),
                    );
                }
                n
            }
            Err(e) => {
                self.registry.publish_error(&e.to_string());
                0
            }
        }
    }

    fn subscribe(&mut self, sink: Arc<dyn DeviceSink>) -> SinkId {
        self.registry.subscribe(sink)
    }

    fn unsubscribe(&mut self, id: SinkId) {
        self.registry.unsubscribe(id)
    }
}

impl Drop for RtlSdrDevice {
    fn drop(&mut self) {
        self.close();
    }
}
