//! Sample-rate reduction and anti-alias filtering
//!
//! [`Decimator`] combines a windowed-sinc FIR lowpass with integer
//! downsampling, only computing the outputs that survive decimation — the
//! standard move for taking a wideband SDR stream (2.4 MS/s) down to audio
//! rate (48 kHz, factor 50). [`LowPassFilter`] band-limits the decimated
//! stream in place before output.
//!
//! Both keep bounded internal state (one FIR delay line, one IIR pole), so
//! latency does not grow across calls.

use crate::types::IqSample;
use num_complex::Complex64;
use std::f64::consts::PI;

/// Windowed-sinc lowpass taps, cutoff as a fraction of Nyquist.
fn design_lowpass(num_taps: usize, cutoff: f64) -> Vec<f64> {
    let n = num_taps.max(3);
    let m = (n - 1) as f64;
    let mut taps: Vec<f64> = (0..n)
        .map(|i| {
            let x = i as f64 - m / 2.0;
            let sinc = if x.abs() < 1e-12 {
                cutoff
            } else {
                (PI * cutoff * x).sin() / (PI * x)
            };
            // Hamming window
            let window = 0.54 - 0.46 * (2.0 * PI * i as f64 / m).cos();
            sinc * window
        })
        .collect();

    // Normalize for unity DC gain
    let sum: f64 = taps.iter().sum();
    if sum.abs() > 1e-12 {
        for t in taps.iter_mut() {
            *t /= sum;
        }
    }
    taps
}

/// Decimating FIR filter over IQ-shaped blocks.
#[derive(Debug, Clone)]
pub struct Decimator {
    taps: Vec<f64>,
    factor: usize,
    history: Vec<Complex64>,
    phase: usize,
}

impl Decimator {
    /// Build for the given input rate and integer reduction factor.
    ///
    /// The anti-alias cutoff sits at the output Nyquist; tap count scales
    /// with the factor (8 per decimation step, capped to keep the hot path
    /// affordable at megasample rates).
    pub fn new(input_sample_rate: u32, factor: usize) -> Self {
        let factor = factor.max(1);
        let num_taps = (factor * 8 + 1).min(257);
        let cutoff = 1.0 / factor as f64;
        let _ = input_sample_rate; // rate only documents the design point
        Self {
            taps: design_lowpass(num_taps, cutoff),
            factor,
            history: vec![Complex64::new(0.0, 0.0); num_taps],
            phase: 0,
        }
    }

    /// Decimation factor.
    pub fn factor(&self) -> usize {
        self.factor
    }

    /// Filter and downsample `input` into `output`, returning the reduced
    /// sample count. `output` must hold at least `input.len() / factor + 1`.
    pub fn process(&mut self, input: &[IqSample], output: &mut [IqSample]) -> usize {
        let mut written = 0;
        for &sample in input {
            self.history.rotate_right(1);
            self.history[0] = sample;

            self.phase += 1;
            if self.phase >= self.factor {
                self.phase = 0;
                if written >= output.len() {
                    break;
                }
                let mut sum = Complex64::new(0.0, 0.0);
                for (&tap, &h) in self.taps.iter().zip(self.history.iter()) {
                    sum += h * tap;
                }
                output[written] = sum;
                written += 1;
            }
        }
        written
    }

    /// Clear the delay line.
    pub fn reset(&mut self) {
        self.history.fill(Complex64::new(0.0, 0.0));
        self.phase = 0;
    }
}

/// Default audio cutoff in Hz.
pub const DEFAULT_AUDIO_CUTOFF_HZ: f64 = 15_000.0;

/// Single-pole IIR lowpass applied in place to decimated audio.
#[derive(Debug, Clone)]
pub struct LowPassFilter {
    alpha: f64,
    state: f64,
}

impl LowPassFilter {
    pub fn new(sample_rate: u32, cutoff_hz: f64) -> Self {
        let cutoff = cutoff_hz.min(sample_rate as f64 / 2.0).max(1.0);
        Self {
            alpha: 1.0 - (-2.0 * PI * cutoff / sample_rate as f64).exp(),
            state: 0.0,
        }
    }

    /// Default 15 kHz cutoff for broadcast audio.
    pub fn audio_default(sample_rate: u32) -> Self {
        Self::new(sample_rate, DEFAULT_AUDIO_CUTOFF_HZ)
    }

    /// Band-limit `samples` in place.
    pub fn process_inplace(&mut self, samples: &mut [f64]) {
        for s in samples.iter_mut() {
            self.state = self.alpha * *s + (1.0 - self.alpha) * self.state;
            *s = self.state;
        }
    }

    /// Clear filter state.
    pub fn reset(&mut self) {
        self.state = 0.0;
    }
}
