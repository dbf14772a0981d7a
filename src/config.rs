//! Receiver configuration
//!
//! Startup parameters for a [`crate::receiver::RadioReceiver`]. The struct
//! is serde-serializable so an embedding application can persist and reload
//! it; the engine itself never touches disk.

use serde::{Deserialize, Serialize};

use crate::bands::BandKind;

/// Configuration applied by `startup()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// SDR sample rate in Hz. Must be one of the device's supported rates.
    pub sample_rate: u32,
    /// Output audio rate in Hz. The decimation factor is
    /// `sample_rate / audio_sample_rate`.
    pub audio_sample_rate: u32,
    /// Band tuned at startup.
    pub initial_band: BandKind,
    /// Explicit startup frequency; defaults to the band center.
    pub initial_frequency_hz: Option<u64>,
    /// Linear output volume in [0, 1].
    pub volume: f64,
    /// Squelch threshold in [0, 1]; 0 disables squelch.
    pub squelch_threshold: f64,
    /// Hand gain control to the tuner AGC.
    pub auto_gain: bool,
    /// Manual tuner gain in dB, applied while auto-gain is off.
    pub gain_db: f64,
    /// Frequency correction in PPM.
    pub ppm_correction: i32,
    /// Output low-pass cutoff in Hz.
    pub audio_cutoff_hz: f64,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            sample_rate: 2_400_000,
            audio_sample_rate: 48_000,
            initial_band: BandKind::FmBroadcast,
            initial_frequency_hz: None,
            volume: 0.8,
            squelch_threshold: 0.0,
            auto_gain: true,
            gain_db: 0.0,
            ppm_correction: 0,
            audio_cutoff_hz: 15_000.0,
        }
    }
}

impl ReceiverConfig {
    /// Integer decimation factor from SDR rate to audio rate, at least 1.
    pub fn decimation_factor(&self) -> usize {
        (self.sample_rate / self.audio_sample_rate.max(1)).max(1) as usize
    }
}
