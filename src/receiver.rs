//! Radio receiver orchestrator
//!
//! Ties a device, the band model, and the DSP chain together behind one
//! control surface: startup/shutdown, tuning and band selection, blocking
//! frequency scan, and the per-block sample pipeline.
//!
//! ## State machine
//!
//! ```text
//! Stopped → Starting → Running ⇄ Scanning → Stopping → Stopped
//!               └──────────┴─→ Error  (device failure; recover via startup)
//! ```
//!
//! ## Locking
//!
//! State-changing operations serialize on one control mutex. The sample
//! pipeline — which runs synchronously on the device's streaming worker —
//! never takes that lock; it touches only atomics and the DSP-chain mutex,
//! so a retune can race a block already in flight by at most one stale
//! sample, which is expected and harmless.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime};

use num_complex::Complex64;
use tracing::{debug, error, info, warn};

use crate::bands::{self, BandKind, Modulation, RadioBand};
use crate::config::ReceiverConfig;
use crate::device::{DeviceSink, SdrDevice, SinkId};
use crate::dsp::{self, AgcProcessor, Decimator, Demodulator, LowPassFilter};
use crate::types::{AudioFormat, IqSample, RadioError, RadioResult, RadioState};

/// Receiver lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Stopped,
    Starting,
    Running,
    Scanning,
    Stopping,
    Error,
}

impl ReceiverState {
    pub fn name(self) -> &'static str {
        match self {
            ReceiverState::Stopped => "Stopped",
            ReceiverState::Starting => "Starting",
            ReceiverState::Running => "Running",
            ReceiverState::Scanning => "Scanning",
            ReceiverState::Stopping => "Stopping",
            ReceiverState::Error => "Error",
        }
    }
}

/// Consumer of receiver notifications.
///
/// `audio_data` and `signal_strength` fire on the device's streaming
/// worker; keep them cheap and never call back into the receiver from them.
pub trait ReceiverSink: Send + Sync {
    fn audio_data(&self, _pcm: &[f32], _format: AudioFormat) {}
    fn signal_strength(&self, _strength: f64) {}
    fn state_changed(&self, _state: ReceiverState) {}
    fn frequency_changed(&self, _frequency_hz: u64) {}
}

/// Handle returned by [`RadioReceiver::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverSinkId(u64);

/// Parameters for a blocking frequency scan.
#[derive(Debug, Clone, Copy)]
pub struct ScanParams {
    /// Step size in Hz; must be positive.
    pub step_hz: u64,
    /// Strength threshold in [0, 1] that counts as a hit.
    pub threshold: f64,
    /// Settle time at each step before the strength test.
    pub dwell: Duration,
}

enum ScanDirection {
    Up,
    Down,
}

/// Demodulation chain rebuilt on every band/modulation/rate change.
struct DspChain {
    demodulator: Box<dyn Demodulator>,
    decimator: Decimator,
    filter: LowPassFilter,
    agc: AgcProcessor,
    audio_format: AudioFormat,
    // Scratch buffers, grown on demand so the hot path never allocates
    // in steady state.
    demod_buf: Vec<f64>,
    wrapped_buf: Vec<IqSample>,
    decimated_buf: Vec<IqSample>,
    audio_buf: Vec<f64>,
    agc_buf: Vec<f64>,
    pcm_buf: Vec<f32>,
}

impl DspChain {
    fn build(
        modulation: Modulation,
        bandwidth_hz: u32,
        config: &ReceiverConfig,
    ) -> RadioResult<Self> {
        let demodulator =
            dsp::make_demodulator(modulation, config.sample_rate as f64, bandwidth_hz as f64)?;
        Ok(Self {
            demodulator,
            decimator: Decimator::new(config.sample_rate, config.decimation_factor()),
            filter: LowPassFilter::new(config.audio_sample_rate, config.audio_cutoff_hz),
            agc: AgcProcessor::default(),
            audio_format: AudioFormat::mono_f32(config.audio_sample_rate),
            demod_buf: Vec::new(),
            wrapped_buf: Vec::new(),
            decimated_buf: Vec::new(),
            audio_buf: Vec::new(),
            agc_buf: Vec::new(),
            pcm_buf: Vec::new(),
        })
    }

    /// Run one IQ block through the chain; returns the PCM produced.
    fn process(&mut self, iq: &[IqSample], volume: f64) -> &[f32] {
        let len = iq.len();
        self.demod_buf.resize(len, 0.0);
        self.wrapped_buf.resize(len, Complex64::new(0.0, 0.0));
        let out_cap = len / self.decimator.factor() + 1;
        self.decimated_buf.resize(out_cap, Complex64::new(0.0, 0.0));
        self.audio_buf.resize(out_cap, 0.0);
        self.agc_buf.resize(out_cap, 0.0);

        let n = self.demodulator.demodulate(iq, &mut self.demod_buf);

        // The decimator works on IQ-shaped blocks; carry the mono audio on
        // the in-phase channel.
        for (w, &a) in self.wrapped_buf[..n].iter_mut().zip(self.demod_buf[..n].iter()) {
            *w = Complex64::new(a, 0.0);
        }
        let m = self
            .decimator
            .process(&self.wrapped_buf[..n], &mut self.decimated_buf);

        for (a, d) in self.audio_buf[..m].iter_mut().zip(self.decimated_buf[..m].iter()) {
            *a = d.re;
        }
        self.filter.process_inplace(&mut self.audio_buf[..m]);

        let k = self.agc.process(&self.audio_buf[..m], &mut self.agc_buf);

        self.pcm_buf.resize(k, 0.0);
        for (p, &a) in self.pcm_buf.iter_mut().zip(self.agc_buf[..k].iter()) {
            *p = (a * volume) as f32;
        }
        &self.pcm_buf
    }
}

/// State guarded by the control mutex.
struct Control {
    device: Box<dyn SdrDevice>,
    state: ReceiverState,
    band: RadioBand,
    modulation: Modulation,
    bandwidth_hz: u32,
    frequency_hz: u64,
    auto_gain: bool,
    gain_db: f64,
    device_sink_id: Option<SinkId>,
    config: ReceiverConfig,
}

/// State shared between the control surface and the sample pipeline.
struct Shared {
    control: Mutex<Control>,
    chain: Mutex<Option<DspChain>>,
    strength_bits: AtomicU64,
    volume_bits: AtomicU64,
    squelch_bits: AtomicU64,
    squelch_open: AtomicBool,
    muted: AtomicBool,
    scan_active: AtomicBool,
    scan_cancel: AtomicBool,
    /// Set when a device error arrives while the control lock is held;
    /// observed at the next scan step, cleared by startup/shutdown.
    error_pending: AtomicBool,
    next_sink_id: AtomicU64,
    sinks: Mutex<Vec<(u64, Arc<dyn ReceiverSink>)>>,
}

impl Shared {
    fn strength(&self) -> f64 {
        f64::from_bits(self.strength_bits.load(Ordering::Relaxed))
    }

    fn volume(&self) -> f64 {
        f64::from_bits(self.volume_bits.load(Ordering::Relaxed))
    }

    fn squelch_threshold(&self) -> f64 {
        f64::from_bits(self.squelch_bits.load(Ordering::Relaxed))
    }

    fn notify_state(&self, state: ReceiverState) {
        let sinks = self.sinks.lock().unwrap();
        for (_, sink) in sinks.iter() {
            sink.state_changed(state);
        }
    }

    fn notify_frequency(&self, hz: u64) {
        let sinks = self.sinks.lock().unwrap();
        for (_, sink) in sinks.iter() {
            sink.frequency_changed(hz);
        }
    }

    fn notify_strength(&self, strength: f64) {
        let sinks = self.sinks.lock().unwrap();
        for (_, sink) in sinks.iter() {
            sink.signal_strength(strength);
        }
    }

    fn notify_audio(&self, pcm: &[f32], format: AudioFormat) {
        let sinks = self.sinks.lock().unwrap();
        for (_, sink) in sinks.iter() {
            sink.audio_data(pcm, format);
        }
    }
}

/// Bridges device sample notifications into the receiver pipeline.
///
/// Holds the shared state weakly so the device registry never keeps a
/// dropped receiver alive.
struct PipelineSink {
    shared: Weak<Shared>,
}

impl DeviceSink for PipelineSink {
    fn on_samples(&self, samples: &[IqSample], _timestamp: SystemTime) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        if samples.is_empty() {
            return;
        }

        // Strength is published unconditionally, even when the audio is
        // muted or squelched.
        let mean_power =
            samples.iter().map(|s| s.norm_sqr()).sum::<f64>() / samples.len() as f64;
        let strength = mean_power.sqrt().clamp(0.0, 1.0);
        shared
            .strength_bits
            .store(strength.to_bits(), Ordering::Relaxed);
        shared.notify_strength(strength);

        let squelch = shared.squelch_threshold();
        let squelch_open = squelch <= 0.0 || strength >= squelch;
        shared.squelch_open.store(squelch_open, Ordering::Relaxed);

        if shared.muted.load(Ordering::Relaxed) || !squelch_open {
            return;
        }

        let volume = shared.volume();
        let mut chain_guard = shared.chain.lock().unwrap();
        let Some(chain) = chain_guard.as_mut() else {
            return;
        };
        let format = chain.audio_format;
        let pcm_len = chain.process(samples, volume).len();
        if pcm_len == 0 {
            return;
        }
        // Split the borrow so the notification can read the scratch buffer.
        let pcm = std::mem::take(&mut chain.pcm_buf);
        drop(chain_guard);
        shared.notify_audio(&pcm, format);
        if let Some(chain) = shared.chain.lock().unwrap().as_mut() {
            chain.pcm_buf = pcm;
        };
    }

    fn on_error(&self, message: &str) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        error!(%message, "device reported an error");
        // A control operation already holding the lock handles its own
        // failure path; a failure during steady-state Running or Scanning
        // transitions here. When the lock is contended, the pending flag
        // carries the error to the scan loop's next step instead.
        match shared.control.try_lock() {
            Ok(mut ctl) => {
                if matches!(ctl.state, ReceiverState::Running | ReceiverState::Scanning) {
                    ctl.state = ReceiverState::Error;
                    drop(ctl);
                    shared.notify_state(ReceiverState::Error);
                }
            }
            Err(_) => {
                shared.error_pending.store(true, Ordering::SeqCst);
            }
        };
    }
}

/// SDR receiver engine.
///
/// All methods take `&self`; clone an `Arc<RadioReceiver>` to drive a scan
/// from a background thread while a UI thread keeps issuing control calls.
pub struct RadioReceiver {
    shared: Arc<Shared>,
}

impl RadioReceiver {
    /// Build a receiver around a device, leaving it Stopped.
    pub fn new(device: Box<dyn SdrDevice>, config: ReceiverConfig) -> Self {
        let band = bands::preset_for_kind(config.initial_band)
            .unwrap_or_else(|| bands::preset_for_kind(BandKind::FmBroadcast).expect("catalog"));
        let frequency_hz = config
            .initial_frequency_hz
            .map(|hz| band.clamp_frequency(hz))
            .unwrap_or_else(|| band.center_frequency());
        let modulation = band.default_modulation;
        let bandwidth_hz = band.default_bandwidth_hz;

        let shared = Arc::new(Shared {
            control: Mutex::new(Control {
                device,
                state: ReceiverState::Stopped,
                band,
                modulation,
                bandwidth_hz,
                frequency_hz,
                auto_gain: config.auto_gain,
                gain_db: config.gain_db,
                device_sink_id: None,
                config: config.clone(),
            }),
            chain: Mutex::new(None),
            strength_bits: AtomicU64::new(0.0f64.to_bits()),
            volume_bits: AtomicU64::new(config.volume.clamp(0.0, 1.0).to_bits()),
            squelch_bits: AtomicU64::new(config.squelch_threshold.clamp(0.0, 1.0).to_bits()),
            squelch_open: AtomicBool::new(true),
            muted: AtomicBool::new(false),
            scan_active: AtomicBool::new(false),
            scan_cancel: AtomicBool::new(false),
            error_pending: AtomicBool::new(false),
            next_sink_id: AtomicU64::new(0),
            sinks: Mutex::new(Vec::new()),
        });

        Self { shared }
    }

    // ----- notifications ---------------------------------------------------

    pub fn subscribe(&self, sink: Arc<dyn ReceiverSink>) -> ReceiverSinkId {
        let id = self.shared.next_sink_id.fetch_add(1, Ordering::Relaxed);
        self.shared.sinks.lock().unwrap().push((id, sink));
        ReceiverSinkId(id)
    }

    pub fn unsubscribe(&self, id: ReceiverSinkId) {
        self.shared
            .sinks
            .lock()
            .unwrap()
            .retain(|(sid, _)| *sid != id.0);
    }

    // ----- lifecycle -------------------------------------------------------

    /// Open the device, build the DSP chain, and start streaming.
    ///
    /// Returns false without side effects when already Running or Scanning;
    /// any failure along the way transitions to Error and returns false.
    pub fn startup(&self) -> bool {
        let mut ctl = self.shared.control.lock().unwrap();
        if matches!(ctl.state, ReceiverState::Running | ReceiverState::Scanning) {
            warn!(state = ctl.state.name(), "startup rejected");
            return false;
        }

        ctl.state = ReceiverState::Starting;
        self.shared.notify_state(ReceiverState::Starting);
        info!(
            frequency_hz = ctl.frequency_hz,
            band = %ctl.band.name,
            "receiver starting"
        );

        let ok = self.bring_up(&mut ctl);
        if ok {
            ctl.state = ReceiverState::Running;
            self.shared.notify_state(ReceiverState::Running);
            info!("receiver running");
        } else {
            ctl.state = ReceiverState::Error;
            self.shared.notify_state(ReceiverState::Error);
            error!("startup failed");
        }
        // Errors raised while this lock was held are reflected in `ok`
        // already; drop any stale pending flag.
        self.shared.error_pending.store(false, Ordering::SeqCst);
        ok
    }

    fn bring_up(&self, ctl: &mut Control) -> bool {
        if !ctl.device.open() {
            return false;
        }
        if !ctl.device.set_sample_rate(ctl.config.sample_rate) {
            error!(rate = ctl.config.sample_rate, "unsupported sample rate");
            return false;
        }
        if !ctl.device.set_frequency(ctl.frequency_hz) {
            error!(hz = ctl.frequency_hz, "device rejected startup frequency");
            return false;
        }
        if !ctl.device.set_gain_mode(ctl.auto_gain) {
            return false;
        }
        if !ctl.auto_gain && !ctl.device.set_gain(ctl.gain_db) {
            return false;
        }
        if ctl.config.ppm_correction != 0
            && !ctl.device.set_freq_correction(ctl.config.ppm_correction)
        {
            return false;
        }

        match DspChain::build(ctl.modulation, ctl.bandwidth_hz, &ctl.config) {
            Ok(chain) => *self.shared.chain.lock().unwrap() = Some(chain),
            Err(e) => {
                error!(%e, "DSP chain build failed");
                return false;
            }
        }

        if ctl.device_sink_id.is_none() {
            let sink = Arc::new(PipelineSink {
                shared: Arc::downgrade(&self.shared),
            });
            ctl.device_sink_id = Some(ctl.device.subscribe(sink));
        }

        if !ctl.device.start_streaming() {
            error!("device failed to start streaming");
            return false;
        }
        true
    }

    /// Stop streaming and close the device. Safe from any state, including
    /// Error, and safe to call repeatedly.
    pub fn shutdown(&self) {
        self.cancel_scan();
        let mut ctl = self.shared.control.lock().unwrap();
        if ctl.state == ReceiverState::Stopped {
            return;
        }
        ctl.state = ReceiverState::Stopping;
        self.shared.notify_state(ReceiverState::Stopping);

        if let Some(id) = ctl.device_sink_id.take() {
            ctl.device.unsubscribe(id);
        }
        ctl.device.stop_streaming();
        ctl.device.close();
        *self.shared.chain.lock().unwrap() = None;

        ctl.state = ReceiverState::Stopped;
        self.shared.error_pending.store(false, Ordering::SeqCst);
        self.shared.notify_state(ReceiverState::Stopped);
        info!("receiver stopped");
    }

    pub fn state(&self) -> ReceiverState {
        self.shared.control.lock().unwrap().state
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self.state(),
            ReceiverState::Running | ReceiverState::Scanning
        )
    }

    // ----- tuning ----------------------------------------------------------

    /// Tune to an arbitrary frequency, auto-selecting the band.
    ///
    /// Catalog containment wins; a frequency inside the device range but
    /// outside every catalog band gets a synthesized ±1 MHz custom band.
    /// Out of device range returns false with nothing changed.
    pub fn set_frequency(&self, hz: u64) -> bool {
        let mut ctl = self.shared.control.lock().unwrap();
        if !ctl.device.info().in_frequency_range(hz) {
            return false;
        }

        if !ctl.band.contains_frequency(hz) {
            let band = match bands::find_band_for_frequency(hz) {
                Some(band) => band,
                None => bands::custom_band_around(hz),
            };
            debug!(from = %ctl.band.name, to = %band.name, "band change on retune");
            ctl.modulation = band.default_modulation;
            ctl.bandwidth_hz = band.default_bandwidth_hz;
            ctl.band = band;
            if !self.rebuild_chain(&ctl) {
                // Chain rebuild only fails for unsupported modulations,
                // which catalog and custom bands never carry.
                return false;
            }
        }

        self.apply_frequency(&mut ctl, hz)
    }

    /// Tune within the currently active band.
    ///
    /// Unlike [`set_frequency`](Self::set_frequency) this is a contract
    /// precondition: a frequency outside the band is an error, not a soft
    /// failure.
    pub fn set_frequency_in_band(&self, hz: u64) -> RadioResult<()> {
        let mut ctl = self.shared.control.lock().unwrap();
        if !ctl.band.contains_frequency(hz) {
            return Err(RadioError::OutOfBand {
                frequency_hz: hz,
                band: ctl.band.name.clone(),
                min_hz: ctl.band.min_frequency_hz,
                max_hz: ctl.band.max_frequency_hz,
            });
        }
        if self.apply_frequency(&mut ctl, hz) {
            Ok(())
        } else {
            Err(RadioError::Device("device rejected frequency".into()))
        }
    }

    /// Step up within the band; refuses at the edge (no wraparound).
    pub fn tune_up(&self, step_hz: u64) -> bool {
        if step_hz == 0 {
            return false;
        }
        let mut ctl = self.shared.control.lock().unwrap();
        let next = ctl.frequency_hz.saturating_add(step_hz);
        if !ctl.band.contains_frequency(next) {
            return false;
        }
        self.apply_frequency(&mut ctl, next)
    }

    /// Step down within the band; refuses at the edge (no wraparound).
    pub fn tune_down(&self, step_hz: u64) -> bool {
        if step_hz == 0 {
            return false;
        }
        let mut ctl = self.shared.control.lock().unwrap();
        let Some(next) = ctl.frequency_hz.checked_sub(step_hz) else {
            return false;
        };
        if !ctl.band.contains_frequency(next) {
            return false;
        }
        self.apply_frequency(&mut ctl, next)
    }

    fn apply_frequency(&self, ctl: &mut Control, hz: u64) -> bool {
        if ctl.device.is_open() && !ctl.device.set_frequency(hz) {
            return false;
        }
        ctl.frequency_hz = hz;
        self.shared.notify_frequency(hz);
        true
    }

    pub fn frequency(&self) -> u64 {
        self.shared.control.lock().unwrap().frequency_hz
    }

    // ----- band & modulation ----------------------------------------------

    /// Switch to a catalog band, retuning to its center or to `frequency_hz`
    /// clamped into the band. Rebuilds the whole DSP chain.
    pub fn set_band(&self, kind: BandKind, frequency_hz: Option<u64>) -> bool {
        let Some(band) = bands::preset_for_kind(kind) else {
            warn!(?kind, "no catalog preset for band");
            return false;
        };
        let mut ctl = self.shared.control.lock().unwrap();
        let target = frequency_hz
            .map(|hz| band.clamp_frequency(hz))
            .unwrap_or_else(|| band.center_frequency());
        if !ctl.device.info().in_frequency_range(target) {
            warn!(hz = target, "band target outside device range");
            return false;
        }

        ctl.modulation = band.default_modulation;
        ctl.bandwidth_hz = band.default_bandwidth_hz;
        ctl.band = band;
        if !self.rebuild_chain(&ctl) {
            return false;
        }
        self.apply_frequency(&mut ctl, target)
    }

    pub fn band(&self) -> RadioBand {
        self.shared.control.lock().unwrap().band.clone()
    }

    /// Override the band's default modulation. Swaps only the demodulator;
    /// decimator and filter stay, the AGC restarts from unity gain.
    pub fn set_modulation(&self, modulation: Modulation) -> bool {
        let mut ctl = self.shared.control.lock().unwrap();
        if ctl.modulation == modulation {
            return true;
        }
        let bandwidth = dsp::recommended_bandwidth(modulation);
        let demodulator = match dsp::make_demodulator(
            modulation,
            ctl.config.sample_rate as f64,
            bandwidth as f64,
        ) {
            Ok(d) => d,
            Err(e) => {
                warn!(%e, "modulation change rejected");
                return false;
            }
        };

        ctl.modulation = modulation;
        ctl.bandwidth_hz = bandwidth;
        if let Some(chain) = self.shared.chain.lock().unwrap().as_mut() {
            chain.demodulator = demodulator;
            chain.agc.reset();
        }
        true
    }

    pub fn modulation(&self) -> Modulation {
        self.shared.control.lock().unwrap().modulation
    }

    fn rebuild_chain(&self, ctl: &Control) -> bool {
        if !ctl.device.is_open() && ctl.state == ReceiverState::Stopped {
            // Chain is built at startup; just record the settings for now.
            return true;
        }
        match DspChain::build(ctl.modulation, ctl.bandwidth_hz, &ctl.config) {
            Ok(chain) => {
                *self.shared.chain.lock().unwrap() = Some(chain);
                true
            }
            Err(e) => {
                warn!(%e, "DSP chain rebuild failed");
                false
            }
        }
    }

    // ----- scanning --------------------------------------------------------

    /// Scan toward the band's upper edge. Blocking; run it off any
    /// latency-sensitive thread.
    ///
    /// Returns `Ok(true)` with the frequency parked on the first step whose
    /// most recent strength sample meets the threshold, `Ok(false)` when
    /// the edge is reached or the scan is cancelled.
    pub fn scan_up(&self, params: ScanParams) -> RadioResult<bool> {
        self.scan(ScanDirection::Up, params)
    }

    /// Scan toward the band's lower edge; mirror of [`scan_up`](Self::scan_up).
    pub fn scan_down(&self, params: ScanParams) -> RadioResult<bool> {
        self.scan(ScanDirection::Down, params)
    }

    /// Request cancellation of an in-flight scan. Advisory: the scan
    /// observes it at the next step boundary, overshooting by at most one
    /// dwell interval.
    pub fn cancel_scan(&self) {
        if self.shared.scan_active.load(Ordering::SeqCst) {
            self.shared.scan_cancel.store(true, Ordering::SeqCst);
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.shared.scan_active.load(Ordering::SeqCst)
    }

    fn scan(&self, direction: ScanDirection, params: ScanParams) -> RadioResult<bool> {
        if params.step_hz == 0 {
            return Err(RadioError::InvalidStep(0));
        }
        let threshold = params.threshold.clamp(0.0, 1.0);

        if self.shared.scan_active.swap(true, Ordering::SeqCst) {
            return Err(RadioError::ScanInProgress);
        }
        self.shared.scan_cancel.store(false, Ordering::SeqCst);

        {
            let mut ctl = self.shared.control.lock().unwrap();
            if ctl.state != ReceiverState::Running {
                self.shared.scan_active.store(false, Ordering::SeqCst);
                return Err(RadioError::InvalidState {
                    operation: "scan",
                    state: ctl.state.name(),
                });
            }
            ctl.state = ReceiverState::Scanning;
            self.shared.notify_state(ReceiverState::Scanning);
            info!(
                step_hz = params.step_hz,
                threshold,
                dwell_ms = params.dwell.as_millis() as u64,
                "scan started"
            );
        }

        let mut found = false;
        loop {
            // Advance one step, briefly holding the control lock.
            {
                let mut ctl = self.shared.control.lock().unwrap();
                if self.shared.error_pending.swap(false, Ordering::SeqCst) {
                    ctl.state = ReceiverState::Error;
                    self.shared.notify_state(ReceiverState::Error);
                    break;
                }
                if ctl.state != ReceiverState::Scanning {
                    break; // shutdown raced us
                }
                let next = match direction {
                    ScanDirection::Up => ctl.frequency_hz.saturating_add(params.step_hz),
                    ScanDirection::Down => {
                        match ctl.frequency_hz.checked_sub(params.step_hz) {
                            Some(hz) => hz,
                            None => break,
                        }
                    }
                };
                if !ctl.band.contains_frequency(next) {
                    debug!(edge_hz = ctl.frequency_hz, "scan reached band edge");
                    break;
                }
                if !self.apply_frequency(&mut ctl, next) {
                    break;
                }
            }

            std::thread::sleep(params.dwell);

            if self.shared.scan_cancel.load(Ordering::SeqCst) {
                info!("scan cancelled");
                break;
            }

            // Single dwell-end sample, deliberately not a windowed average:
            // averaging would shift where the scan terminates.
            let strength = self.shared.strength();
            if strength >= threshold {
                info!(strength, "scan hit");
                found = true;
                break;
            }
        }

        {
            let mut ctl = self.shared.control.lock().unwrap();
            if ctl.state == ReceiverState::Scanning {
                ctl.state = ReceiverState::Running;
                self.shared.notify_state(ReceiverState::Running);
            }
        }
        self.shared.scan_cancel.store(false, Ordering::SeqCst);
        self.shared.scan_active.store(false, Ordering::SeqCst);
        Ok(found)
    }

    // ----- audio & gain setpoints ------------------------------------------

    /// Linear output volume, clamped to [0, 1].
    pub fn set_volume(&self, volume: f64) {
        self.shared
            .volume_bits
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub fn volume(&self) -> f64 {
        self.shared.volume()
    }

    /// Squelch threshold, clamped to [0, 1]; 0 disables squelch.
    pub fn set_squelch_threshold(&self, threshold: f64) {
        self.shared
            .squelch_bits
            .store(threshold.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub fn squelch_threshold(&self) -> f64 {
        self.shared.squelch_threshold()
    }

    pub fn set_muted(&self, muted: bool) {
        self.shared.muted.store(muted, Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.shared.muted.load(Ordering::Relaxed)
    }

    /// Latest per-block RMS signal strength in [0, 1].
    pub fn signal_strength(&self) -> f64 {
        self.shared.strength()
    }

    pub fn set_auto_gain(&self, auto: bool) -> bool {
        let mut ctl = self.shared.control.lock().unwrap();
        if !ctl.device.set_gain_mode(auto) {
            return false;
        }
        ctl.auto_gain = auto;
        if !auto {
            let gain = ctl.gain_db;
            ctl.device.set_gain(gain);
        }
        true
    }

    pub fn auto_gain(&self) -> bool {
        self.shared.control.lock().unwrap().auto_gain
    }

    /// Manual tuner gain in dB. Snapped to the device's nearest supported
    /// value; only reaches the hardware while auto-gain is off.
    pub fn set_gain(&self, db: f64) -> bool {
        let mut ctl = self.shared.control.lock().unwrap();
        let snapped = ctl.device.info().nearest_gain(db);
        ctl.gain_db = snapped;
        if ctl.auto_gain {
            return true;
        }
        ctl.device.set_gain(snapped)
    }

    pub fn gain(&self) -> f64 {
        self.shared.control.lock().unwrap().gain_db
    }

    // ----- snapshot --------------------------------------------------------

    /// Compose a read-only snapshot of the whole receiver.
    pub fn radio_state(&self) -> RadioState {
        let ctl = self.shared.control.lock().unwrap();
        let audio_format = self
            .shared
            .chain
            .lock()
            .unwrap()
            .as_ref()
            .map(|c| c.audio_format)
            .unwrap_or_else(|| AudioFormat::mono_f32(ctl.config.audio_sample_rate));
        RadioState {
            frequency_hz: ctl.frequency_hz,
            band: ctl.band.clone(),
            modulation: ctl.modulation,
            state: ctl.state.name(),
            signal_strength: self.shared.strength(),
            volume: self.shared.volume(),
            squelch_threshold: self.shared.squelch_threshold(),
            squelch_open: self.shared.squelch_open.load(Ordering::Relaxed),
            muted: self.shared.muted.load(Ordering::Relaxed),
            gain_db: if ctl.device.is_open() {
                ctl.device.gain()
            } else {
                ctl.gain_db
            },
            auto_gain: ctl.auto_gain,
            bandwidth_hz: ctl.bandwidth_hz,
            audio_format,
            device_name: ctl.device.info().name.clone(),
        }
    }
}

impl Drop for RadioReceiver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::{MockControls, MockSdrDevice};
    use std::sync::atomic::AtomicUsize;

    // Small blocks keep strength updates well inside a 30 ms scan dwell.
    const TEST_BLOCK: usize = 4_096;

    /// Route receiver logs through the test harness; enable with
    /// `RUST_LOG=sdr_receiver=debug`.
    fn init_logs() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn fm_receiver() -> (RadioReceiver, MockControls) {
        init_logs();
        let device = MockSdrDevice::new();
        let controls = device.controls();
        controls.set_block_size(TEST_BLOCK);
        controls.set_noise_floor(0.01);
        let receiver = RadioReceiver::new(Box::new(device), ReceiverConfig::default());
        (receiver, controls)
    }

    fn scan_params() -> ScanParams {
        ScanParams {
            step_hz: 100_000,
            threshold: 0.5,
            dwell: Duration::from_millis(30),
        }
    }

    #[derive(Default)]
    struct Recorder {
        audio_blocks: AtomicUsize,
        strength_events: AtomicUsize,
        states: Mutex<Vec<ReceiverState>>,
        frequencies: Mutex<Vec<u64>>,
    }

    impl ReceiverSink for Recorder {
        fn audio_data(&self, _pcm: &[f32], _format: AudioFormat) {
            self.audio_blocks.fetch_add(1, Ordering::SeqCst);
        }
        fn signal_strength(&self, _strength: f64) {
            self.strength_events.fetch_add(1, Ordering::SeqCst);
        }
        fn state_changed(&self, state: ReceiverState) {
            self.states.lock().unwrap().push(state);
        }
        fn frequency_changed(&self, hz: u64) {
            self.frequencies.lock().unwrap().push(hz);
        }
    }

    #[test]
    fn starts_at_band_center_and_reports_running() {
        let (receiver, _controls) = fm_receiver();
        assert_eq!(receiver.state(), ReceiverState::Stopped);
        assert_eq!(receiver.frequency(), 97_750_000);

        let recorder = Arc::new(Recorder::default());
        receiver.subscribe(recorder.clone());

        assert!(receiver.startup());
        assert_eq!(receiver.state(), ReceiverState::Running);
        assert_eq!(
            recorder.states.lock().unwrap().as_slice(),
            &[ReceiverState::Starting, ReceiverState::Running]
        );
        assert!(!receiver.startup(), "double startup must be rejected");
        receiver.shutdown();
        assert_eq!(receiver.state(), ReceiverState::Stopped);
    }

    #[test]
    fn shutdown_and_restart_cycle() {
        let (receiver, controls) = fm_receiver();
        assert!(receiver.startup());
        assert_eq!(controls.open_count(), 1);
        assert!(!receiver.startup(), "rejected startup must not reopen");
        assert_eq!(controls.open_count(), 1);
        receiver.shutdown();
        receiver.shutdown(); // idempotent
        assert!(receiver.startup());
        assert_eq!(receiver.state(), ReceiverState::Running);
        assert_eq!(controls.open_count(), 2, "one open per startup cycle");
        receiver.shutdown();
    }

    #[test]
    fn device_error_while_running_enters_error_state() {
        let (receiver, controls) = fm_receiver();
        assert!(receiver.startup());
        assert_eq!(controls.open_count(), 1);

        controls.inject_error("usb transfer failed");
        assert_eq!(receiver.state(), ReceiverState::Error);
        assert_eq!(receiver.radio_state().state, "Error");

        // Recovery is a fresh startup; the still-open device is reused.
        assert!(receiver.startup());
        assert_eq!(receiver.state(), ReceiverState::Running);
        assert_eq!(controls.open_count(), 1, "recovery must not double-open");
        receiver.shutdown();
    }

    #[test]
    fn device_error_during_scan_terminates_it() {
        let (receiver, controls) = fm_receiver();
        assert!(receiver.startup());
        assert!(receiver.set_frequency_in_band(87_500_000).is_ok());

        let receiver = Arc::new(receiver);
        let scanner = Arc::clone(&receiver);
        let handle = std::thread::spawn(move || {
            scanner.scan_up(ScanParams {
                step_hz: 100_000,
                threshold: 0.5,
                dwell: Duration::from_millis(50),
            })
        });

        std::thread::sleep(Duration::from_millis(60));
        assert!(receiver.is_scanning());
        controls.inject_error("tuner lost");

        let found = handle.join().unwrap().unwrap();
        assert!(!found);
        assert!(!receiver.is_scanning());
        assert_eq!(receiver.state(), ReceiverState::Error);
        receiver.shutdown();
    }

    #[test]
    fn tuning_respects_band_edges() {
        let (receiver, _controls) = fm_receiver();
        assert!(receiver.set_frequency_in_band(107_900_000).is_ok());
        assert!(!receiver.tune_up(200_000), "step past upper edge");
        assert_eq!(receiver.frequency(), 107_900_000);
        assert!(receiver.tune_up(100_000));
        assert_eq!(receiver.frequency(), 108_000_000);

        assert!(receiver.set_frequency_in_band(87_500_000).is_ok());
        assert!(!receiver.tune_down(100_000), "step past lower edge");
        assert!(!receiver.tune_up(0), "zero step is a no-op");

        match receiver.set_frequency_in_band(50_000_000) {
            Err(RadioError::OutOfBand { frequency_hz, .. }) => {
                assert_eq!(frequency_hz, 50_000_000)
            }
            other => panic!("expected OutOfBand, got {other:?}"),
        }
    }

    #[test]
    fn set_frequency_switches_bands_automatically() {
        let (receiver, _controls) = fm_receiver();
        assert!(receiver.set_frequency(162_450_000));
        assert_eq!(receiver.band().kind, BandKind::Weather);
        assert_eq!(receiver.modulation(), Modulation::NarrowbandFm);

        // Inside device range but outside every catalog band.
        assert!(receiver.set_frequency(450_000_000));
        assert_eq!(receiver.band().kind, BandKind::Custom);

        // Outside the mock device's tuning range entirely.
        assert!(!receiver.set_frequency(3_000_000_000));
        assert_eq!(receiver.frequency(), 450_000_000);
    }

    #[test]
    fn band_switch_retunes_and_swaps_modulation() {
        let (receiver, _controls) = fm_receiver();
        assert!(receiver.startup());
        assert!(receiver.set_band(BandKind::AmBroadcast, Some(1_000_000)));
        assert_eq!(receiver.frequency(), 1_000_000);
        assert_eq!(receiver.modulation(), Modulation::Am);

        // Requested frequency clamps into the new band.
        assert!(receiver.set_band(BandKind::FmBroadcast, Some(1_000_000)));
        assert_eq!(receiver.frequency(), 87_500_000);
        receiver.shutdown();
    }

    #[test]
    fn scan_up_stops_on_station() {
        let (receiver, controls) = fm_receiver();
        controls.add_station(94_700_000, 0.9);
        assert!(receiver.startup());
        assert!(receiver.set_frequency_in_band(94_000_000).is_ok());

        let found = receiver.scan_up(scan_params()).unwrap();
        assert!(found, "scan should hit the 94.7 MHz station");
        assert_eq!(receiver.frequency(), 94_700_000);
        assert_eq!(receiver.state(), ReceiverState::Running);
        receiver.shutdown();
    }

    #[test]
    fn scan_up_without_stations_reaches_band_edge() {
        let (receiver, _controls) = fm_receiver();
        assert!(receiver.startup());
        assert!(receiver.set_frequency_in_band(107_500_000).is_ok());

        let found = receiver.scan_up(scan_params()).unwrap();
        assert!(!found);
        assert_eq!(receiver.frequency(), 108_000_000);
        assert_eq!(receiver.state(), ReceiverState::Running);
        receiver.shutdown();
    }

    #[test]
    fn scan_down_finds_station_below() {
        let (receiver, controls) = fm_receiver();
        controls.add_station(94_700_000, 0.9);
        assert!(receiver.startup());
        assert!(receiver.set_frequency_in_band(95_100_000).is_ok());

        let found = receiver.scan_down(scan_params()).unwrap();
        assert!(found);
        assert_eq!(receiver.frequency(), 94_700_000);
        receiver.shutdown();
    }

    #[test]
    fn scan_rejects_zero_step_and_wrong_state() {
        let (receiver, _controls) = fm_receiver();
        let mut params = scan_params();
        params.step_hz = 0;
        assert!(matches!(
            receiver.scan_up(params),
            Err(RadioError::InvalidStep(0))
        ));
        // Not running yet.
        assert!(matches!(
            receiver.scan_up(scan_params()),
            Err(RadioError::InvalidState { .. })
        ));
    }

    #[test]
    fn scan_cancellation_returns_promptly() {
        let (receiver, _controls) = fm_receiver();
        assert!(receiver.startup());
        assert!(receiver.set_frequency_in_band(87_500_000).is_ok());

        let receiver = Arc::new(receiver);
        let scanner = Arc::clone(&receiver);
        let handle = std::thread::spawn(move || {
            scanner.scan_up(ScanParams {
                step_hz: 100_000,
                threshold: 0.5,
                dwell: Duration::from_millis(50),
            })
        });

        // Let the scan take a few steps, then cancel.
        std::thread::sleep(Duration::from_millis(120));
        assert!(receiver.is_scanning());
        receiver.cancel_scan();

        let found = handle.join().unwrap().unwrap();
        assert!(!found, "cancelled scan reports no hit");
        assert!(!receiver.is_scanning());
        assert_eq!(receiver.state(), ReceiverState::Running);
        assert!(
            receiver.frequency() < 108_000_000,
            "cancellation must land before the band edge"
        );
        receiver.shutdown();
    }

    #[test]
    fn concurrent_scan_is_rejected() {
        let (receiver, _controls) = fm_receiver();
        assert!(receiver.startup());
        assert!(receiver.set_frequency_in_band(87_500_000).is_ok());

        let receiver = Arc::new(receiver);
        let scanner = Arc::clone(&receiver);
        let handle = std::thread::spawn(move || scanner.scan_up(scan_params()));

        std::thread::sleep(Duration::from_millis(40));
        assert!(matches!(
            receiver.scan_up(scan_params()),
            Err(RadioError::ScanInProgress)
        ));
        receiver.cancel_scan();
        let _ = handle.join().unwrap();
        receiver.shutdown();
    }

    #[test]
    fn mute_suppresses_audio_but_not_strength() {
        let (receiver, controls) = fm_receiver();
        controls.add_station(97_750_000, 0.9);
        let recorder = Arc::new(Recorder::default());
        receiver.subscribe(recorder.clone());

        assert!(receiver.startup());
        std::thread::sleep(Duration::from_millis(60));
        assert!(recorder.audio_blocks.load(Ordering::SeqCst) > 0);

        receiver.set_muted(true);
        std::thread::sleep(Duration::from_millis(30));
        let audio_at_mute = recorder.audio_blocks.load(Ordering::SeqCst);
        let strength_at_mute = recorder.strength_events.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(60));
        assert!(
            recorder.audio_blocks.load(Ordering::SeqCst) <= audio_at_mute + 1,
            "audio must stop while muted"
        );
        assert!(
            recorder.strength_events.load(Ordering::SeqCst) > strength_at_mute,
            "strength keeps updating while muted"
        );

        receiver.set_muted(false);
        let resumed_from = recorder.audio_blocks.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(60));
        assert!(recorder.audio_blocks.load(Ordering::SeqCst) > resumed_from);
        receiver.shutdown();
    }

    #[test]
    fn squelch_gates_audio_by_strength() {
        let (receiver, controls) = fm_receiver();
        controls.add_station(97_750_000, 0.4);
        let recorder = Arc::new(Recorder::default());
        receiver.subscribe(recorder.clone());

        // Threshold above the 0.4 station silences the output.
        receiver.set_squelch_threshold(0.6);
        assert!(receiver.startup());
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(recorder.audio_blocks.load(Ordering::SeqCst), 0);
        assert!(!receiver.radio_state().squelch_open);

        // Dropping it below the station reopens the gate.
        receiver.set_squelch_threshold(0.3);
        std::thread::sleep(Duration::from_millis(80));
        assert!(recorder.audio_blocks.load(Ordering::SeqCst) > 0);
        assert!(receiver.radio_state().squelch_open);
        receiver.shutdown();
    }

    #[test]
    fn volume_scales_published_pcm() {
        struct Peak(Mutex<f32>);
        impl ReceiverSink for Peak {
            fn audio_data(&self, pcm: &[f32], _format: AudioFormat) {
                let peak = pcm.iter().fold(0.0f32, |m, s| m.max(s.abs()));
                let mut slot = self.0.lock().unwrap();
                *slot = slot.max(peak);
            }
        }

        let (receiver, controls) = fm_receiver();
        controls.add_station(97_750_000, 0.9);
        let peak = Arc::new(Peak(Mutex::new(0.0)));
        receiver.subscribe(peak.clone());

        receiver.set_volume(0.0);
        assert!(receiver.startup());
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(*peak.0.lock().unwrap(), 0.0, "zero volume means silence");

        receiver.set_volume(1.0);
        std::thread::sleep(Duration::from_millis(80));
        assert!(*peak.0.lock().unwrap() > 0.0);

        receiver.set_volume(2.0);
        assert_eq!(receiver.volume(), 1.0, "volume clamps to [0, 1]");
        receiver.shutdown();
    }

    #[test]
    fn gain_snaps_to_supported_values() {
        let (receiver, _controls) = fm_receiver();
        assert!(receiver.startup());
        assert!(receiver.set_auto_gain(false));
        assert!(receiver.set_gain(21.0));
        assert_eq!(receiver.gain(), 20.7);
        assert!(receiver.set_auto_gain(true));
        assert!(receiver.auto_gain());
        receiver.shutdown();
    }

    #[test]
    fn radio_state_snapshot_is_consistent() {
        let (receiver, controls) = fm_receiver();
        controls.add_station(97_750_000, 0.8);
        assert!(receiver.startup());
        receiver.set_volume(0.5);
        receiver.set_squelch_threshold(0.2);
        std::thread::sleep(Duration::from_millis(60));

        let state = receiver.radio_state();
        assert_eq!(state.state, "Running");
        assert_eq!(state.frequency_hz, 97_750_000);
        assert_eq!(state.band.kind, BandKind::FmBroadcast);
        assert_eq!(state.modulation, Modulation::WidebandFm);
        assert_eq!(state.volume, 0.5);
        assert_eq!(state.squelch_threshold, 0.2);
        assert!(state.signal_strength > 0.5);
        assert!(state.squelch_open);
        assert_eq!(state.audio_format.sample_rate, 48_000);
        receiver.shutdown();
        assert_eq!(receiver.radio_state().state, "Stopped");
    }

    #[test]
    fn unsubscribed_sink_stops_receiving() {
        let (receiver, controls) = fm_receiver();
        controls.add_station(97_750_000, 0.9);
        let recorder = Arc::new(Recorder::default());
        let id = receiver.subscribe(recorder.clone());

        assert!(receiver.startup());
        std::thread::sleep(Duration::from_millis(60));
        receiver.unsubscribe(id);
        let at_unsub = recorder.strength_events.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(recorder.strength_events.load(Ordering::SeqCst), at_unsub);
        receiver.shutdown();
    }

    #[test]
    fn drop_shuts_down_cleanly() {
        let (receiver, controls) = fm_receiver();
        controls.add_station(97_750_000, 0.9);
        assert!(receiver.startup());
        std::thread::sleep(Duration::from_millis(40));
        drop(receiver);
        // Worker threads exit on their own; nothing left to observe here
        // beyond the absence of a hang or panic.
    }
}
