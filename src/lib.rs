//! # SDR Receiver Engine
//!
//! This crate implements a software-defined radio receiver: it tunes an SDR
//! device (RTL-SDR hardware or a built-in simulator), demodulates the I/Q
//! stream to audio, and exposes tuning, band selection, squelch, and a
//! blocking frequency scanner behind one thread-safe control surface.
//!
//! ## Overview
//!
//! - **Devices**: a common [`SdrDevice`](device::SdrDevice) trait with a
//!   mock implementation for tests and an RTL-SDR binding loaded at runtime
//!   via `librtlsdr`
//! - **Bands**: a catalog of common listening bands (FM/AM broadcast, NOAA
//!   weather, airband, shortwave) with per-band modulation defaults
//! - **DSP**: AM envelope and FM quadrature demodulators, a decimating FIR
//!   for rate conversion, an audio low-pass, and a dual-rate AGC
//! - **Receiver**: the [`RadioReceiver`](receiver::RadioReceiver)
//!   orchestrator that owns the device, runs the sample pipeline on the
//!   device's streaming worker, and drives the scan state machine
//!
//! ## Signal Flow
//!
//! ```text
//! device I/Q → strength (RMS) → squelch/mute gate → demodulate
//!            → decimate to audio rate → low-pass → AGC → volume → f32 PCM
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use sdr_receiver::{
//!     MockSdrDevice, RadioReceiver, ReceiverConfig, ScanParams,
//! };
//!
//! let device = MockSdrDevice::new();
//! let controls = device.controls();
//! controls.add_station(94_700_000, 0.9);
//!
//! let receiver = Arc::new(RadioReceiver::new(
//!     Box::new(device),
//!     ReceiverConfig::default(),
//! ));
//! receiver.startup();
//!
//! // Scan blocks the calling thread until a station, edge, or cancel.
//! let found = receiver
//!     .scan_up(ScanParams {
//!         step_hz: 100_000,
//!         threshold: 0.5,
//!         dwell: Duration::from_millis(30),
//!     })
//!     .unwrap();
//! if found {
//!     println!("station at {} Hz", receiver.frequency());
//! }
//! receiver.shutdown();
//! ```

pub mod bands;
pub mod config;
pub mod device;
pub mod dsp;
pub mod receiver;
pub mod types;

pub use bands::{BandKind, Modulation, RadioBand};
pub use config::ReceiverConfig;
pub use device::{
    enumerate_devices, DeviceInfo, DeviceSink, DeviceType, MockSdrDevice, RtlSdrDevice, SdrDevice,
};
pub use receiver::{RadioReceiver, ReceiverSink, ReceiverSinkId, ReceiverState, ScanParams};
pub use types::{AudioFormat, IqBuffer, IqSample, RadioError, RadioResult, RadioState};
