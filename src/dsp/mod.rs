//! Demodulation and audio conditioning blocks
//!
//! Each block is a small stateful struct with a block-processing API, the
//! same shape GNU-Radio-style flowgraphs use. The receiver assembles them
//! into a chain: demodulator → decimator → low-pass filter → AGC.

pub mod agc;
pub mod am;
pub mod decimator;
pub mod fm;

pub use agc::AgcProcessor;
pub use am::AmDemodulator;
pub use decimator::{Decimator, LowPassFilter};
pub use fm::{NbfmDemodulator, WbfmDemodulator};

use crate::bands::Modulation;
use crate::types::{IqSample, RadioError, RadioResult};

/// Capability shared by all demodulators.
///
/// Instances are stateful only with respect to sample rate and bandwidth;
/// switching modulation type means constructing a new instance through
/// [`make_demodulator`], never reconfiguring in place.
pub trait Demodulator: Send + std::fmt::Debug {
    /// Reconfigure for a new input sample rate and channel bandwidth.
    /// Resets any internal filter state.
    fn configure(&mut self, sample_rate: f64, bandwidth_hz: f64);

    /// Demodulate `iq` into `audio`, returning the number of samples
    /// written. Output length never exceeds `iq.len()`.
    fn demodulate(&mut self, iq: &[IqSample], audio: &mut [f64]) -> usize;

    /// The modulation this instance was built for.
    fn modulation(&self) -> Modulation;
}

/// Channel bandwidth a modulation defaults to when the band does not
/// override it.
pub fn recommended_bandwidth(modulation: Modulation) -> u32 {
    match modulation {
        Modulation::Am => 10_000,
        Modulation::NarrowbandFm => 12_500,
        Modulation::WidebandFm => 180_000,
        Modulation::Ssb => 3_000,
    }
}

/// Construct the demodulator for a modulation type.
pub fn make_demodulator(
    modulation: Modulation,
    sample_rate: f64,
    bandwidth_hz: f64,
) -> RadioResult<Box<dyn Demodulator>> {
    match modulation {
        Modulation::Am => Ok(Box::new(AmDemodulator::new(sample_rate, bandwidth_hz))),
        Modulation::NarrowbandFm => {
            Ok(Box::new(NbfmDemodulator::new(sample_rate, bandwidth_hz)))
        }
        Modulation::WidebandFm => Ok(Box::new(WbfmDemodulator::new(sample_rate, bandwidth_hz))),
        Modulation::Ssb => Err(RadioError::UnsupportedModulation(modulation)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_covers_am_and_fm() {
        for m in [
            Modulation::Am,
            Modulation::NarrowbandFm,
            Modulation::WidebandFm,
        ] {
            let demod = make_demodulator(m, 2_400_000.0, recommended_bandwidth(m) as f64)
                .expect("factory should build this modulation");
            assert_eq!(demod.modulation(), m);
        }
    }

    #[test]
    fn test_factory_rejects_ssb() {
        let err = make_demodulator(Modulation::Ssb, 2_400_000.0, 3_000.0).unwrap_err();
        assert!(matches!(err, RadioError::UnsupportedModulation(_)));
    }

    #[test]
    fn test_recommended_bandwidths() {
        assert_eq!(recommended_bandwidth(Modulation::NarrowbandFm), 12_500);
        assert_eq!(recommended_bandwidth(Modulation::WidebandFm), 180_000);
        assert_eq!(recommended_bandwidth(Modulation::Am), 10_000);
    }
}
