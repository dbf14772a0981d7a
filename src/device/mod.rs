//! Hardware abstraction for SDR receivers
//!
//! The receiver orchestrator depends only on the [`SdrDevice`] trait. Two
//! implementations ship: a deterministic [`mock`] device for tests and
//! development, and an [`rtlsdr`] binding that loads librtlsdr dynamically
//! at runtime.
//!
//! ## Streaming model
//!
//! Each device owns exactly one background worker thread that performs the
//! hardware I/O. Subscribed sinks run **synchronously on that worker**;
//! there is no dispatch queue in between, so sink callbacks must stay cheap
//! and non-blocking.

pub mod mock;
pub mod rtlsdr;
pub mod rtlsdr_ffi;

pub use mock::{MockControls, MockSdrDevice, SimulatedStation};
pub use rtlsdr::RtlSdrDevice;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use serde::Serialize;

use crate::types::IqSample;

/// Concrete device backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceType {
    Mock,
    RtlSdr,
}

/// Immutable description of an enumerated device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub index: u32,
    pub name: String,
    pub manufacturer: String,
    pub serial: String,
    pub device_type: DeviceType,
    pub min_frequency_hz: u64,
    pub max_frequency_hz: u64,
    /// Discrete supported sample rates in Hz.
    pub supported_sample_rates: Vec<u32>,
    /// Available tuner gains in dB, sorted ascending.
    pub available_gains_db: Vec<f64>,
}

impl DeviceInfo {
    /// True when `hz` lies inside the tunable range.
    pub fn in_frequency_range(&self, hz: u64) -> bool {
        hz >= self.min_frequency_hz && hz <= self.max_frequency_hz
    }

    /// Snap a requested gain to the nearest available value.
    pub fn nearest_gain(&self, db: f64) -> f64 {
        self.available_gains_db
            .iter()
            .copied()
            .min_by(|a, b| {
                (a - db)
                    .abs()
                    .partial_cmp(&(b - db).abs())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .unwrap_or(db)
    }
}

/// Consumer of device notifications.
///
/// Both callbacks run synchronously on the device's streaming worker.
pub trait DeviceSink: Send + Sync {
    /// A freshly converted block of baseband samples.
    fn on_samples(&self, samples: &[IqSample], timestamp: SystemTime);

    /// A device-layer failure (missing library, open failure, read error).
    fn on_error(&self, _message: &str) {}
}

/// Opaque handle returned by [`SdrDevice::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkId(u64);

/// Shared registry the streaming workers publish through.
#[derive(Default)]
pub struct SinkRegistry {
    next_id: AtomicU64,
    sinks: Mutex<Vec<(u64, Arc<dyn DeviceSink>)>>,
}

impl SinkRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(&self, sink: Arc<dyn DeviceSink>) -> SinkId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sinks.lock().unwrap().push((id, sink));
        SinkId(id)
    }

    pub fn unsubscribe(&self, id: SinkId) {
        self.sinks.lock().unwrap().retain(|(sid, _)| *sid != id.0);
    }

    pub fn publish_samples(&self, samples: &[IqSample], timestamp: SystemTime) {
        let sinks = self.sinks.lock().unwrap();
        for (_, sink) in sinks.iter() {
            sink.on_samples(samples, timestamp);
        }
    }

    pub fn publish_error(&self, message: &str) {
        let sinks = self.sinks.lock().unwrap();
        for (_, sink) in sinks.iter() {
            sink.on_error(message);
        }
    }
}

/// Hardware port contract.
///
/// Parameter setters return `false` for out-of-range or unsupported values
/// instead of erroring; hard failures are reported through the sink's
/// `on_error`. `close` and `stop_streaming` are idempotent and safe from any
/// state.
pub trait SdrDevice: Send {
    fn info(&self) -> &DeviceInfo;

    /// Open the device. Returns false (and reports through `on_error`) when
    /// the backing driver is unavailable or the open fails.
    fn open(&mut self) -> bool;
    fn close(&mut self);
    fn is_open(&self) -> bool;

    /// Returns false when `hz` is outside the device range.
    fn set_frequency(&mut self, hz: u64) -> bool;
    fn frequency(&self) -> u64;

    /// Returns false when `hz` is not in the supported set.
    fn set_sample_rate(&mut self, hz: u32) -> bool;
    fn sample_rate(&self) -> u32;

    /// Toggle tuner hardware AGC.
    fn set_gain_mode(&mut self, auto: bool) -> bool;

    /// Requested gain is quantized to the nearest supported value.
    fn set_gain(&mut self, db: f64) -> bool;
    fn gain(&self) -> f64;

    fn set_freq_correction(&mut self, ppm: i32) -> bool;

    fn start_streaming(&mut self) -> bool;
    fn stop_streaming(&mut self);
    fn is_streaming(&self) -> bool;

    /// Synchronous pull of one block; returns samples read. Streaming
    /// subscribers normally make this unnecessary.
    fn read_samples(&mut self, buf: &mut [IqSample]) -> usize;

    fn subscribe(&mut self, sink: Arc<dyn DeviceSink>) -> SinkId;
    fn unsubscribe(&mut self, id: SinkId);
}

/// Enumerate every device the factory can construct.
///
/// The mock is always present at index 0; hardware devices follow when
/// librtlsdr loads and reports receivers.
pub fn enumerate_devices() -> Vec<DeviceInfo> {
    let mut devices = vec![mock::mock_device_info()];
    devices.extend(rtlsdr::enumerate());
    devices
}

/// Construct a device for an enumerated entry.
pub fn create_device(info: &DeviceInfo) -> Box<dyn SdrDevice> {
    match info.device_type {
        DeviceType::Mock => Box::new(MockSdrDevice::new()),
        DeviceType::RtlSdr => Box::new(RtlSdrDevice::new(info.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nearest_gain_snapping() {
        let info = DeviceInfo {
            index: 0,
            name: "test".into(),
            manufacturer: "test".into(),
            serial: "0".into(),
            device_type: DeviceType::Mock,
            min_frequency_hz: 0,
            max_frequency_hz: 1,
            supported_sample_rates: vec![],
            available_gains_db: vec![19.7, 20.7, 22.9],
        };
        assert_eq!(info.nearest_gain(21.0), 20.7);
        assert_eq!(info.nearest_gain(0.0), 19.7);
        assert_eq!(info.nearest_gain(100.0), 22.9);
    }

    #[test]
    fn test_enumeration_always_includes_mock() {
        let devices = enumerate_devices();
        assert!(!devices.is_empty());
        assert_eq!(devices[0].device_type, DeviceType::Mock);
    }

    #[test]
    fn test_sink_registry_unsubscribe() {
        use std::sync::atomic::AtomicUsize;

        struct Counter(AtomicUsize);
        impl DeviceSink for Counter {
            fn on_samples(&self, _: &[IqSample], _: SystemTime) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let registry = SinkRegistry::new();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let id = registry.subscribe(counter.clone());

        registry.publish_samples(&[], SystemTime::now());
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        registry.unsubscribe(id);
        registry.publish_samples(&[], SystemTime::now());
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }
}
