//! Band catalog and frequency model
//!
//! A [`RadioBand`] is a named frequency range with a default modulation,
//! bandwidth, and tuning step. The built-in catalog covers the broadcast,
//! aviation, and weather allocations this receiver targets; out-of-catalog
//! frequencies get an ad hoc `Custom` band synthesized around them.
//!
//! Containment and clamping are pure functions on the band's own bounds, so
//! the catalog can be queried without touching any device state.

use serde::{Deserialize, Serialize};

/// Demodulation scheme selected for a band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Modulation {
    /// Amplitude modulation (envelope detection).
    Am,
    /// Narrowband FM, ~12.5 kHz channels (aviation, weather).
    NarrowbandFm,
    /// Wideband broadcast FM, ~180 kHz channels.
    WidebandFm,
    /// Single sideband. Extension point; no demodulator is shipped for it.
    Ssb,
}

/// Band category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BandKind {
    FmBroadcast,
    AmBroadcast,
    Weather,
    Aircraft,
    Shortwave,
    Custom,
}

/// A named frequency range with tuning defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadioBand {
    pub name: String,
    pub kind: BandKind,
    pub min_frequency_hz: u64,
    pub max_frequency_hz: u64,
    pub default_modulation: Modulation,
    pub default_bandwidth_hz: u32,
    pub default_step_hz: u32,
}

impl RadioBand {
    /// True when `hz` lies inside this band, bounds inclusive.
    pub fn contains_frequency(&self, hz: u64) -> bool {
        hz >= self.min_frequency_hz && hz <= self.max_frequency_hz
    }

    /// Clamp `hz` into this band's bounds.
    pub fn clamp_frequency(&self, hz: u64) -> u64 {
        hz.clamp(self.min_frequency_hz, self.max_frequency_hz)
    }

    /// Default tuning target: the band center.
    pub fn center_frequency(&self) -> u64 {
        self.min_frequency_hz + (self.max_frequency_hz - self.min_frequency_hz) / 2
    }
}

/// Half-width of a synthesized custom band around the requested frequency.
pub const CUSTOM_BAND_HALF_WIDTH_HZ: u64 = 1_000_000;

fn preset(
    name: &str,
    kind: BandKind,
    min_hz: u64,
    max_hz: u64,
    modulation: Modulation,
    bandwidth_hz: u32,
    step_hz: u32,
) -> RadioBand {
    RadioBand {
        name: name.to_string(),
        kind,
        min_frequency_hz: min_hz,
        max_frequency_hz: max_hz,
        default_modulation: modulation,
        default_bandwidth_hz: bandwidth_hz,
        default_step_hz: step_hz,
    }
}

/// The fixed band catalog, in lookup-precedence order.
pub fn presets() -> Vec<RadioBand> {
    vec![
        preset(
            "FM Broadcast",
            BandKind::FmBroadcast,
            87_500_000,
            108_000_000,
            Modulation::WidebandFm,
            180_000,
            100_000,
        ),
        preset(
            "AM Broadcast",
            BandKind::AmBroadcast,
            520_000,
            1_710_000,
            Modulation::Am,
            10_000,
            10_000,
        ),
        preset(
            "NOAA Weather",
            BandKind::Weather,
            162_400_000,
            162_550_000,
            Modulation::NarrowbandFm,
            12_500,
            25_000,
        ),
        preset(
            "Airband",
            BandKind::Aircraft,
            118_000_000,
            137_000_000,
            Modulation::Am,
            12_500,
            25_000,
        ),
        preset(
            "Shortwave",
            BandKind::Shortwave,
            2_300_000,
            26_100_000,
            Modulation::Am,
            10_000,
            5_000,
        ),
    ]
}

/// Look up a catalog preset by kind. `Custom` has no preset.
pub fn preset_for_kind(kind: BandKind) -> Option<RadioBand> {
    presets().into_iter().find(|b| b.kind == kind)
}

/// First catalog entry containing `hz`, or `None`.
pub fn find_band_for_frequency(hz: u64) -> Option<RadioBand> {
    presets().into_iter().find(|b| b.contains_frequency(hz))
}

/// Build an ad hoc band over an explicit range.
pub fn custom_band(name: &str, min_hz: u64, max_hz: u64, modulation: Modulation) -> RadioBand {
    RadioBand {
        name: name.to_string(),
        kind: BandKind::Custom,
        min_frequency_hz: min_hz,
        max_frequency_hz: max_hz,
        default_modulation: modulation,
        default_bandwidth_hz: crate::dsp::recommended_bandwidth(modulation),
        default_step_hz: 25_000,
    }
}

/// Synthesize the ±1 MHz narrowband-FM band used when tuning outside the
/// catalog but inside device range.
pub fn custom_band_around(hz: u64) -> RadioBand {
    let min_hz = hz.saturating_sub(CUSTOM_BAND_HALF_WIDTH_HZ);
    let max_hz = hz.saturating_add(CUSTOM_BAND_HALF_WIDTH_HZ);
    custom_band(
        &format!("Custom {:.3} MHz", hz as f64 / 1e6),
        min_hz,
        max_hz,
        Modulation::NarrowbandFm,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_and_clamp() {
        let fm = preset_for_kind(BandKind::FmBroadcast).unwrap();
        assert!(fm.contains_frequency(87_500_000));
        assert!(fm.contains_frequency(108_000_000));
        assert!(fm.contains_frequency(94_700_000));
        assert!(!fm.contains_frequency(87_499_999));
        assert!(!fm.contains_frequency(108_000_001));

        assert_eq!(fm.clamp_frequency(50_000_000), 87_500_000);
        assert_eq!(fm.clamp_frequency(200_000_000), 108_000_000);
        assert_eq!(fm.clamp_frequency(100_000_000), 100_000_000);
    }

    #[test]
    fn test_find_band_for_frequency() {
        assert_eq!(
            find_band_for_frequency(94_700_000).unwrap().kind,
            BandKind::FmBroadcast
        );
        assert_eq!(
            find_band_for_frequency(162_475_000).unwrap().kind,
            BandKind::Weather
        );
        assert_eq!(
            find_band_for_frequency(121_500_000).unwrap().kind,
            BandKind::Aircraft
        );
        assert_eq!(
            find_band_for_frequency(1_000_000).unwrap().kind,
            BandKind::AmBroadcast
        );
        // Between airband and weather, no catalog entry
        assert!(find_band_for_frequency(150_000_000).is_none());
    }

    #[test]
    fn test_catalog_defaults() {
        let fm = preset_for_kind(BandKind::FmBroadcast).unwrap();
        assert_eq!(fm.default_modulation, Modulation::WidebandFm);
        assert_eq!(fm.default_bandwidth_hz, 180_000);
        assert_eq!(fm.default_step_hz, 100_000);

        let air = preset_for_kind(BandKind::Aircraft).unwrap();
        assert_eq!(air.default_modulation, Modulation::Am);
        assert_eq!(air.default_bandwidth_hz, 12_500);
    }

    #[test]
    fn test_custom_band_around() {
        let band = custom_band_around(433_920_000);
        assert_eq!(band.kind, BandKind::Custom);
        assert_eq!(band.default_modulation, Modulation::NarrowbandFm);
        assert_eq!(band.min_frequency_hz, 432_920_000);
        assert_eq!(band.max_frequency_hz, 434_920_000);
        assert!(band.contains_frequency(433_920_000));
    }

    #[test]
    fn test_custom_band_near_zero_saturates() {
        let band = custom_band_around(500_000);
        assert_eq!(band.min_frequency_hz, 0);
        assert_eq!(band.max_frequency_hz, 1_500_000);
    }

    #[test]
    fn test_band_center() {
        let fm = preset_for_kind(BandKind::FmBroadcast).unwrap();
        assert_eq!(fm.center_frequency(), 97_750_000);
    }
}
