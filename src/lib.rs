//! Driver for the Stepper Probe, a BLE stepper-motor analyzer.
//!
//! The probe sits in series with the motor's two coils and reports, over a
//! custom GATT service: a static calibration record, a continuous stream
//! of 19-byte state reports (step position with sub-step resolution,
//! derived from the two coil currents), three step-speed histograms, and a
//! multi-packet capture buffer of the raw coil-current waveform.
//!
//! The payload decoders ([`probe_info`], [`probe_state`], [`histogram`],
//! [`capture`]) are pure: they take the byte buffers delivered by the
//! transport and return immutable records, so they can be exercised
//! without any Bluetooth hardware. [`bluetooth`] and [`probe`] supply the
//! BlueZ transport and the high level driver on top of it.
//!
//! # Timing
//!
//! State reports are timestamped by the device's own clock (the
//! `time_ticks_per_sec` calibration constant), not by arrival time: BLE
//! delivery latency varies and notifications may arrive in bursts. Use
//! `ProbeState::timestamp_secs` for charting, never the host clock.

pub mod bluetooth;
pub mod capture;
pub mod codec;
pub mod errors;
pub mod histogram;
pub mod logging;
pub mod probe;
pub mod probe_info;
pub mod probe_state;

pub use bluetooth::{BleConnector, DiscoveredProbe, GattLink};
pub use capture::{CaptureSignal, CaptureSignalFetcher, CaptureTransport, FetchStep};
pub use errors::{BluetoothError, ProbeError, Result};
pub use histogram::{Histogram, HistogramKind};
pub use probe::Probe;
pub use probe_info::ProbeInfo;
pub use probe_state::ProbeState;
