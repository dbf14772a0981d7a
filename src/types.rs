//! Core types for the receiver engine
//!
//! Defines the fundamental sample and format types shared by the device
//! layer, the DSP chain, and the receiver orchestrator.
//!
//! ## I/Q samples
//!
//! SDR hardware delivers complex baseband samples: the **I** (in-phase)
//! component is the real part, the **Q** (quadrature) component the
//! imaginary part. Together they carry both amplitude and phase, which is
//! what makes FM discrimination and envelope detection possible downstream.

use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::bands::{Modulation, RadioBand};

/// A single complex baseband sample.
///
/// Magnitude squared (I² + Q²) is available as [`Complex64::norm_sqr`].
pub type IqSample = Complex64;

/// A buffer of I/Q samples.
pub type IqBuffer = Vec<IqSample>;

/// PCM format attached to every published audio block.
///
/// Set once per DSP-chain rebuild; blocks are 32-bit float mono unless a
/// future stereo WBFM path changes the channel count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Output sample rate in Hz.
    pub sample_rate: u32,
    /// Channel count (1 = mono).
    pub channels: u16,
    /// Bits per sample (32 = float PCM).
    pub bits_per_sample: u16,
}

impl AudioFormat {
    /// Mono float PCM at the given rate.
    pub fn mono_f32(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 1,
            bits_per_sample: 32,
        }
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::mono_f32(48_000)
    }
}

/// Result type for receiver operations with hard contracts.
pub type RadioResult<T> = Result<T, RadioError>;

/// Errors raised by the receiver engine.
///
/// Soft validation failures (out-of-range tuning, unsupported sample rate)
/// surface as `false` from the boolean setters instead; these variants cover
/// contract violations and device-layer failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RadioError {
    #[error("frequency {frequency_hz} Hz outside band {band} ({min_hz}-{max_hz} Hz)")]
    OutOfBand {
        frequency_hz: u64,
        band: String,
        min_hz: u64,
        max_hz: u64,
    },

    #[error("step must be positive, got {0}")]
    InvalidStep(i64),

    #[error("a frequency scan is already in progress")]
    ScanInProgress,

    #[error("{operation} not allowed in state {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("no demodulator available for {0:?}")]
    UnsupportedModulation(Modulation),

    #[error("device error: {0}")]
    Device(String),
}

/// Read-only snapshot of the whole receiver, recomputed on demand.
#[derive(Debug, Clone, Serialize)]
pub struct RadioState {
    pub frequency_hz: u64,
    pub band: RadioBand,
    pub modulation: Modulation,
    pub state: &'static str,
    /// Latest per-block RMS signal strength in [0, 1].
    pub signal_strength: f64,
    pub volume: f64,
    pub squelch_threshold: f64,
    pub squelch_open: bool,
    pub muted: bool,
    pub gain_db: f64,
    pub auto_gain: bool,
    pub bandwidth_hz: u32,
    pub audio_format: AudioFormat,
    pub device_name: String,
}
