//! Deterministic mock SDR device
//!
//! Synthesizes a tone-plus-noise IQ stream from a table of simulated
//! stations, letting the whole receiver — tuning, squelch, scanning — run
//! without hardware. The tone amplitude at any tuned frequency is the
//! strongest station's strength scaled by proximity (linear falloff over a
//! 200 kHz window), so block RMS tracks the configured strength closely.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use num_complex::Complex64;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::types::IqSample;

use super::{DeviceInfo, DeviceSink, DeviceType, SdrDevice, SinkId, SinkRegistry};

/// Falloff window: a station contributes nothing beyond this distance.
const PROXIMITY_WINDOW_HZ: f64 = 200_000.0;

/// Synthesized tone offset from the tuned center.
const TONE_OFFSET_HZ: f64 = 1_000.0;

const DEFAULT_BLOCK_SIZE: usize = 16_384;

/// A simulated transmitter.
#[derive(Debug, Clone, Copy)]
pub struct SimulatedStation {
    pub frequency_hz: u64,
    /// Received strength in [0, 1] when tuned dead-on.
    pub strength: f64,
}

/// Catalog entry for the mock.
pub fn mock_device_info() -> DeviceInfo {
    DeviceInfo {
        index: 0,
        name: "Mock SDR".to_string(),
        manufacturer: "sdr-receiver".to_string(),
        serial: "MOCK001".to_string(),
        device_type: DeviceType::Mock,
        min_frequency_hz: 500_000,
        max_frequency_hz: 1_766_000_000,
        supported_sample_rates: vec![250_000, 1_024_000, 2_048_000, 2_400_000],
        available_gains_db: vec![0.0, 9.0, 19.7, 20.7, 22.9, 25.4, 28.0, 33.8, 40.2, 49.6],
    }
}

/// Tuning state shared with the streaming worker.
struct MockShared {
    frequency_hz: AtomicU64,
    sample_rate: AtomicU32,
    noise_floor_bits: AtomicU64,
    block_size: AtomicUsize,
    /// Closed→open transitions, not raw `open()` calls.
    open_count: AtomicUsize,
    stations: Mutex<Vec<SimulatedStation>>,
}

impl MockShared {
    fn noise_floor(&self) -> f64 {
        f64::from_bits(self.noise_floor_bits.load(Ordering::Relaxed))
    }

    /// Proximity-weighted strength of the strongest station at `hz`.
    fn strength_at(&self, hz: u64) -> f64 {
        let stations = self.stations.lock().unwrap();
        stations
            .iter()
            .map(|s| {
                let dist = (s.frequency_hz as f64 - hz as f64).abs();
                if dist >= PROXIMITY_WINDOW_HZ {
                    0.0
                } else {
                    s.strength * (1.0 - dist / PROXIMITY_WINDOW_HZ)
                }
            })
            .fold(0.0, f64::max)
    }

    /// Fill `block` with a tone at the current strength over uniform noise.
    fn synthesize(&self, block: &mut [IqSample], phase: &mut f64) {
        let sample_rate = self.sample_rate.load(Ordering::Relaxed) as f64;
        let amplitude = self.strength_at(self.frequency_hz.load(Ordering::Relaxed));
        let noise = self.noise_floor();
        let step = 2.0 * std::f64::consts::PI * TONE_OFFSET_HZ / sample_rate;

        let mut rng = rand::thread_rng();
        for s in block.iter_mut() {
            let tone = Complex64::new(phase.cos(), phase.sin()) * amplitude;
            let n = Complex64::new(
                rng.gen_range(-1.0..1.0) * noise,
                rng.gen_range(-1.0..1.0) * noise,
            );
            *s = tone + n;
            *phase += step;
            if *phase > std::f64::consts::TAU {
                *phase -= std::f64::consts::TAU;
            }
        }
    }
}

/// Handle for reconfiguring the simulation while the device is owned by a
/// receiver (tests drive squelch and scan scenarios through this).
#[derive(Clone)]
pub struct MockControls {
    shared: Arc<MockShared>,
    registry: Arc<SinkRegistry>,
}

impl MockControls {
    pub fn add_station(&self, frequency_hz: u64, strength: f64) {
        self.shared.stations.lock().unwrap().push(SimulatedStation {
            frequency_hz,
            strength: strength.clamp(0.0, 1.0),
        });
    }

    pub fn clear_stations(&self) {
        self.shared.stations.lock().unwrap().clear();
    }

    pub fn set_noise_floor(&self, level: f64) {
        self.shared
            .noise_floor_bits
            .store(level.max(0.0).to_bits(), Ordering::Relaxed);
    }

    pub fn set_block_size(&self, samples: usize) {
        self.shared
            .block_size
            .store(samples.max(256), Ordering::Relaxed);
    }

    /// Number of effective opens (closed→open transitions) so far.
    pub fn open_count(&self) -> usize {
        self.shared.open_count.load(Ordering::SeqCst)
    }

    /// Push a device-layer error to every subscribed sink, synchronously on
    /// the calling thread.
    pub fn inject_error(&self, message: &str) {
        self.registry.publish_error(message);
    }
}

/// Deterministic software device.
pub struct MockSdrDevice {
    info: DeviceInfo,
    shared: Arc<MockShared>,
    registry: Arc<SinkRegistry>,
    open: bool,
    streaming: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    auto_gain: bool,
    gain_db: f64,
    ppm: i32,
    pull_phase: f64,
}

impl Default for MockSdrDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSdrDevice {
    pub fn new() -> Self {
        Self {
            info: mock_device_info(),
            shared: Arc::new(MockShared {
                frequency_hz: AtomicU64::new(100_000_000),
                sample_rate: AtomicU32::new(2_400_000),
                noise_floor_bits: AtomicU64::new(0.01f64.to_bits()),
                block_size: AtomicUsize::new(DEFAULT_BLOCK_SIZE),
                open_count: AtomicUsize::new(0),
                stations: Mutex::new(Vec::new()),
            }),
            registry: SinkRegistry::new(),
            open: false,
            streaming: Arc::new(AtomicBool::new(false)),
            worker: None,
            auto_gain: true,
            gain_db: 0.0,
            ppm: 0,
            pull_phase: 0.0,
        }
    }

    /// Simulation handle that stays valid after the device is boxed away.
    pub fn controls(&self) -> MockControls {
        MockControls {
            shared: self.shared.clone(),
            registry: self.registry.clone(),
        }
    }

    fn join_worker(&mut self) {
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("mock streaming worker panicked");
            }
        }
    }
}

impl SdrDevice for MockSdrDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn open(&mut self) -> bool {
        if !self.open {
            info!(device = %self.info.name, "mock device opened");
            self.open = true;
            self.shared.open_count.fetch_add(1, Ordering::SeqCst);
        }
        true
    }

    fn close(&mut self) {
        self.stop_streaming();
        if self.open {
            info!(device = %self.info.name, "mock device closed");
            self.open = false;
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn set_frequency(&mut self, hz: u64) -> bool {
        if !self.info.in_frequency_range(hz) {
            return false;
        }
        self.shared.frequency_hz.store(hz, Ordering::Relaxed);
        true
    }

    fn frequency(&self) -> u64 {
        self.shared.frequency_hz.load(Ordering::Relaxed)
    }

    fn set_sample_rate(&mut self, hz: u32) -> bool {
        if !self.info.supported_sample_rates.contains(&hz) {
            return false;
        }
        self.shared.sample_rate.store(hz, Ordering::Relaxed);
        true
    }

    fn sample_rate(&self) -> u32 {
        self.shared.sample_rate.load(Ordering::Relaxed)
    }

    fn set_gain_mode(&mut self, auto: bool) -> bool {
        self.auto_gain = auto;
        true
    }

    fn set_gain(&mut self, db: f64) -> bool {
        self.gain_db = self.info.nearest_gain(db);
        true
    }

    fn gain(&self) -> f64 {
        self.gain_db
    }

    fn set_freq_correction(&mut self, ppm: i32) -> bool {
        self.ppm = ppm;
        true
    }

    fn start_streaming(&mut self) -> bool {
        if !self.open {
            return false;
        }
        if self.streaming.swap(true, Ordering::SeqCst) {
            return true;
        }

        let shared = self.shared.clone();
        let registry = self.registry.clone();
        let running = self.streaming.clone();

        let spawned = thread::Builder::new()
            .name("mock-sdr-stream".to_string())
            .spawn(move || {
                debug!("mock streaming worker started");
                let mut phase = 0.0f64;
                let mut block = vec![Complex64::new(0.0, 0.0); DEFAULT_BLOCK_SIZE];
                let mut next_deadline = Instant::now();

                while running.load(Ordering::SeqCst) {
                    let block_size = shared.block_size.load(Ordering::Relaxed);
                    block.resize(block_size, Complex64::new(0.0, 0.0));

                    shared.synthesize(&mut block, &mut phase);
                    registry.publish_samples(&block, SystemTime::now());

                    // Pace to the nominal sample rate.
                    let sample_rate = shared.sample_rate.load(Ordering::Relaxed).max(1);
                    next_deadline += Duration::from_secs_f64(block_size as f64 / sample_rate as f64);
                    let now = Instant::now();
                    if next_deadline > now {
                        thread::sleep(next_deadline - now);
                    } else {
                        // Fell behind; resynchronize instead of bursting.
                        next_deadline = now;
                    }
                }
                debug!("mock streaming worker stopped");
            });

        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
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
        if !self.open {
            return 0;
        }
        let mut phase = self.pull_phase;
        self.shared.synthesize(buf, &mut phase);
        self.pull_phase = phase;
        buf.len()
    }

    fn subscribe(&mut self, sink: Arc<dyn DeviceSink>) -> SinkId {
        self.registry.subscribe(sink)
    }

    fn unsubscribe(&mut self, id: SinkId) {
        self.registry.unsubscribe(id)
    }
}

impl Drop for MockSdrDevice {
    fn drop(&mut self) {
        self.close();
    }
}
