//! FM demodulators (quadrature discriminator)
//!
//! Both variants measure instantaneous frequency as the phase difference
//! between consecutive samples:
//!
//! ```text
//! y[n] = gain * arg( x[n] * conj(x[n-1]) ),  gain = fs / (2π * deviation)
//! ```
//!
//! so a tone at exactly the design deviation maps to ±1.0. Narrowband FM
//! (aviation, weather, ~12.5 kHz channels) derives its deviation from the
//! channel bandwidth; wideband broadcast FM uses the standard 75 kHz
//! deviation. Each applies the de-emphasis time constant conventional for
//! its service.

use num_complex::Complex64;
use std::f64::consts::PI;

use crate::bands::Modulation;
use crate::types::IqSample;

use super::Demodulator;

/// Shared discriminator + de-emphasis core.
#[derive(Debug, Clone)]
struct FmCore {
    gain: f64,
    prev: Complex64,
    deemph_alpha: f64,
    deemph_state: f64,
}

impl FmCore {
    fn new(sample_rate: f64, deviation_hz: f64, deemph_tau: f64) -> Self {
        Self {
            gain: sample_rate / (2.0 * PI * deviation_hz.max(1.0)),
            prev: Complex64::new(1.0, 0.0),
            deemph_alpha: 1.0 / (1.0 + sample_rate * deemph_tau),
            deemph_state: 0.0,
        }
    }

    fn demodulate(&mut self, iq: &[IqSample], audio: &mut [f64]) -> usize {
        let count = iq.len().min(audio.len());
        for (out, &x) in audio.iter_mut().zip(iq.iter()).take(count) {
            let product = x * self.prev.conj();
            self.prev = x;
            let demod = self.gain * product.arg();

            self.deemph_state =
                self.deemph_alpha * demod + (1.0 - self.deemph_alpha) * self.deemph_state;
            *out = self.deemph_state;
        }
        count
    }
}

/// Narrowband FM demodulator.
#[derive(Debug, Clone)]
pub struct NbfmDemodulator {
    core: FmCore,
}

impl NbfmDemodulator {
    /// Deviation is half the channel bandwidth, the usual NBFM convention
    /// (12.5 kHz channel → ±6.25 kHz swing). De-emphasis tau 750 µs.
    pub fn new(sample_rate: f64, bandwidth_hz: f64) -> Self {
        Self {
            core: FmCore::new(sample_rate, bandwidth_hz / 2.0, 750e-6),
        }
    }
}

impl Demodulator for NbfmDemodulator {
    fn configure(&mut self, sample_rate: f64, bandwidth_hz: f64) {
        self.core = FmCore::new(sample_rate, bandwidth_hz / 2.0, 750e-6);
    }

    fn demodulate(&mut self, iq: &[IqSample], audio: &mut [f64]) -> usize {
        self.core.demodulate(iq, audio)
    }

    fn modulation(&self) -> Modulation {
        Modulation::NarrowbandFm
    }
}

/// Broadcast FM deviation in Hz.
const WBFM_DEVIATION_HZ: f64 = 75_000.0;

/// Wideband (broadcast) FM demodulator, mono.
///
/// Stereo decoding (19 kHz pilot, L-R subcarrier) is a possible extension;
/// the published audio format stays mono until it lands.
#[derive(Debug, Clone)]
pub struct WbfmDemodulator {
    core: FmCore,
}

impl WbfmDemodulator {
    /// De-emphasis tau 75 µs (US broadcast standard).
    pub fn new(sample_rate: f64, _bandwidth_hz: f64) -> Self {
        Self {
            core: FmCore::new(sample_rate, WBFM_DEVIATION_HZ, 75e-6),
        }
    }
}

impl Demodulator for WbfmDemodulator {
    fn configure(&mut self, sample_rate: f64, _bandwidth_hz: f64) {
        self.core = FmCore::new(sample_rate, WBFM_DEVIATION_HZ, 75e-6);
    }

    fn demodulate(&mut self, iq: &[IqSample], audio: &mut [f64]) -> usize {
        self.core.demodulate(iq, audio)
    }

    fn modulation(&self) -> Modulation {
        Modulation::WidebandFm
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(freq: f64, fs: f64, n: usize) -> Vec<Complex64> {
        (0..n)
            .map(|i| {
                let phase = 2.0 * PI * freq * i as f64 / fs;
                Complex64::new(phase.cos(), phase.sin())
            })
            .collect()
    }

    #[test]
    fn test_dc_input_gives_zero() {
        let mut demod = NbfmDemodulator::new(48_000.0, 12_500.0);
        let dc = vec![Complex64::new(1.0, 0.0); 200];
        let mut audio = vec![0.0; 200];
        demod.demodulate(&dc, &mut audio);
        for &v in &audio {
            assert!(v.abs() < 1e-9, "DC should demodulate to 0, got {}", v);
        }
    }

    #[test]
    fn test_deviation_tone_maps_near_unity() {
        // A tone at the design deviation should settle near +1.0 once the
        // de-emphasis filter charges.
        let fs = 48_000.0;
        let bw = 12_500.0;
        let mut demod = NbfmDemodulator::new(fs, bw);
        let samples = tone(bw / 2.0, fs, 48_000);
        let mut audio = vec![0.0; samples.len()];
        demod.demodulate(&samples, &mut audio);

        let tail = &audio[40_000..];
        let mean: f64 = tail.iter().sum::<f64>() / tail.len() as f64;
        assert!((mean - 1.0).abs() < 0.05, "settled output {} not ~1.0", mean);
    }

    #[test]
    fn test_sign_follows_frequency() {
        let fs = 2_400_000.0;
        let mut demod = WbfmDemodulator::new(fs, 180_000.0);
        let up = tone(50_000.0, fs, 10_000);
        let down = tone(-50_000.0, fs, 10_000);

        let mut audio = vec![0.0; 10_000];
        demod.demodulate(&up, &mut audio);
        let up_mean: f64 = audio[5_000..].iter().sum::<f64>() / 5_000.0;

        let mut demod = WbfmDemodulator::new(fs, 180_000.0);
        demod.demodulate(&down, &mut audio);
        let down_mean: f64 = audio[5_000..].iter().sum::<f64>() / 5_000.0;

        assert!(up_mean > 0.0 && down_mean < 0.0);
        assert!((up_mean + down_mean).abs() < 0.01, "response not symmetric");
    }

    #[test]
    fn test_configure_resets_state() {
        let fs = 48_000.0;
        let mut demod = NbfmDemodulator::new(fs, 12_500.0);
        let samples = tone(3_000.0, fs, 1_000);
        let mut audio = vec![0.0; 1_000];
        demod.demodulate(&samples, &mut audio);

        demod.configure(fs, 12_500.0);
        let dc = vec![Complex64::new(1.0, 0.0); 10];
        let mut out = vec![0.0; 10];
        demod.demodulate(&dc, &mut out);
        for &v in &out {
            assert!(v.abs() < 1e-9);
        }
    }
}
