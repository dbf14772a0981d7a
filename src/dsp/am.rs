//! AM envelope demodulator
//!
//! Recovers baseband audio from an amplitude-modulated carrier by envelope
//! detection: `|x[n]|` followed by a DC blocker to remove the carrier level
//! and a single-pole lowpass sized to the channel bandwidth.
//!
//! ```text
//! audio[n] = lowpass( dcblock( |iq[n]| ) )
//! ```

use crate::bands::Modulation;
use crate::types::IqSample;

use super::Demodulator;

/// AM envelope detector with DC blocking and audio lowpass.
#[derive(Debug, Clone)]
pub struct AmDemodulator {
    sample_rate: f64,
    bandwidth_hz: f64,
    /// DC blocker: y[n] = x[n] - x[n-1] + alpha * y[n-1]
    dc_prev_in: f64,
    dc_prev_out: f64,
    dc_alpha: f64,
    /// Audio lowpass (single-pole IIR) sized to half the channel bandwidth.
    lp_state: f64,
    lp_alpha: f64,
}

impl AmDemodulator {
    pub fn new(sample_rate: f64, bandwidth_hz: f64) -> Self {
        let mut demod = Self {
            sample_rate,
            bandwidth_hz,
            dc_prev_in: 0.0,
            dc_prev_out: 0.0,
            dc_alpha: 0.95,
            lp_state: 0.0,
            lp_alpha: 1.0,
        };
        demod.configure(sample_rate, bandwidth_hz);
        demod
    }
}

impl Demodulator for AmDemodulator {
    fn configure(&mut self, sample_rate: f64, bandwidth_hz: f64) {
        self.sample_rate = sample_rate;
        self.bandwidth_hz = bandwidth_hz;
        let cutoff = (bandwidth_hz / 2.0).max(100.0);
        self.lp_alpha = 1.0 - (-2.0 * std::f64::consts::PI * cutoff / sample_rate).exp();
        self.dc_prev_in = 0.0;
        self.dc_prev_out = 0.0;
        self.lp_state = 0.0;
    }

    fn demodulate(&mut self, iq: &[IqSample], audio: &mut [f64]) -> usize {
        let count = iq.len().min(audio.len());
        for (out, &x) in audio.iter_mut().zip(iq.iter()).take(count) {
            let envelope = x.norm();

            let dc_blocked = envelope - self.dc_prev_in + self.dc_alpha * self.dc_prev_out;
            self.dc_prev_in = envelope;
            self.dc_prev_out = dc_blocked;

            self.lp_state = self.lp_alpha * dc_blocked + (1.0 - self.lp_alpha) * self.lp_state;
            *out = self.lp_state;
        }
        count
    }

    fn modulation(&self) -> Modulation {
        Modulation::Am
    }
}
