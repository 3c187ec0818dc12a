//! Capture-signal reassembly and the incremental fetch state machine.
//!
//! A capture signal is a waveform of the two coil currents, sampled on the
//! device at a divider-controlled rate and frozen by the snapshot command.
//! The frozen buffer is larger than a single characteristic read, so it is
//! fetched as a chain of packets: each read returns the next chunk, and a
//! continuation bit on the packet says whether more chunks remain.
//!
//! [`CaptureSignalFetcher`] drives that chain one transport operation per
//! [`step`](CaptureSignalFetcher::step) call, which keeps a fetch cycle
//! interleavable with the periodic state and histogram reads on the same
//! connection. Any error resets the session to its initial state, so a
//! cycle can never be left stuck mid-collection.

use std::mem;

use log::{debug, warn};
use serde::Serialize;

use crate::codec;
use crate::errors::{ProbeError, Result};
use crate::probe_info::ProbeInfo;

/// Format id of a capture packet.
pub const CAPTURE_PACKET_FORMAT: u8 = 0x40;

// Capture packet status flags (byte 1).
const FLAG_SNAPSHOT_AVAILABLE: u8 = 0x80;
const FLAG_MORE_PACKETS: u8 = 0x01;

// Capture packet field offsets. Bytes 2:4 (snapshot sequence number) and
// 7:9 (start item index) are carried on the wire but not validated;
// packets are trusted to arrive in characteristic-read order.
const DIVIDER_OFFSET: usize = 4;
const POINT_COUNT_OFFSET: usize = 5;
const POINTS_OFFSET: usize = 9;
const POINT_LEN: usize = 4;

/// A reassembled capture signal: coil currents over time.
///
/// The three sequences have equal length; `times_sec[i]` is the sample
/// time of `amps_a[i]` and `amps_b[i]`. Immutable once decoded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptureSignal {
    pub times_sec: Vec<f64>,
    pub amps_a: Vec<f64>,
    pub amps_b: Vec<f64>,
}

impl CaptureSignal {
    /// Decode an ordered sequence of capture packets into one signal.
    ///
    /// The sample divider is taken from the first packet only; sample
    /// times are the running point index across all packets times the
    /// divider period.
    pub fn decode(packets: &[Vec<u8>], info: &ProbeInfo) -> Result<CaptureSignal> {
        let first = packets
            .first()
            .ok_or(ProbeError::EmptyInput("no capture signal packets"))?;

        let divider = codec::read_u8(first, DIVIDER_OFFSET)?;
        let time_step_secs = codec::ticks_to_secs(u64::from(divider), info.time_ticks_per_sec)?;

        let mut times_sec = Vec::new();
        let mut amps_a = Vec::new();
        let mut amps_b = Vec::new();
        for packet in packets {
            let n = codec::read_u16_be(packet, POINT_COUNT_OFFSET)? as usize;
            for i in 0..n {
                let base = POINTS_OFFSET + i * POINT_LEN;
                let ticks_a = codec::read_i16_be(packet, base)?;
                let ticks_b = codec::read_i16_be(packet, base + 2)?;
                times_sec.push(amps_a.len() as f64 * time_step_secs);
                amps_a.push(codec::ticks_to_amps(
                    f64::from(ticks_a),
                    info.current_ticks_per_amp,
                )?);
                amps_b.push(codec::ticks_to_amps(
                    f64::from(ticks_b),
                    info.current_ticks_per_amp,
                )?);
            }
        }

        Ok(CaptureSignal {
            times_sec,
            amps_a,
            amps_b,
        })
    }

    /// Number of samples in the signal.
    pub fn len(&self) -> usize {
        self.times_sec.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times_sec.is_empty()
    }
}

/// The two transport operations a fetch cycle needs.
///
/// Implemented by [`Probe`](crate::probe::Probe) over GATT and by
/// in-memory mocks in tests.
pub trait CaptureTransport {
    /// Ask the device to freeze the current capture buffer for retrieval.
    fn write_snapshot_command(&mut self) -> Result<()>;

    /// Read the next chunk of the frozen buffer.
    fn read_next_packet(&mut self) -> Result<Vec<u8>>;
}

/// Outcome of one [`CaptureSignalFetcher::step`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchStep {
    /// The cycle made progress; call `step` again.
    Pending,
    /// The cycle completed; the session is back at its initial state.
    Ready(CaptureSignal),
}

#[derive(Debug)]
enum FetchState {
    /// Initial state: the next step writes the snapshot command.
    AwaitingSnapshot,
    /// Mid-collection: packets read so far, in arrival order.
    Collecting { packets: Vec<Vec<u8>> },
}

/// Drives the multi-step snapshot/read/reassemble protocol.
///
/// One fetcher per connection; `step` calls must be serialized by the
/// caller (one transport operation is in flight per step). The fetcher
/// borrows the transport per call rather than owning it, so the same
/// connection can service other reads between steps.
#[derive(Debug)]
pub struct CaptureSignalFetcher {
    info: ProbeInfo,
    state: FetchState,
}

impl CaptureSignalFetcher {
    pub fn new(info: ProbeInfo) -> Self {
        Self {
            info,
            state: FetchState::AwaitingSnapshot,
        }
    }

    /// Discard any partially collected packets and return to the initial
    /// state. Idempotent; this is the sole recovery path and is applied
    /// on every error branch of [`step`](Self::step).
    pub fn reset(&mut self) {
        self.state = FetchState::AwaitingSnapshot;
    }

    /// True when the next `step` call starts a new fetch cycle.
    pub fn awaiting_snapshot(&self) -> bool {
        matches!(self.state, FetchState::AwaitingSnapshot)
    }

    /// Perform the next transport operation of the fetch cycle.
    ///
    /// Returns [`FetchStep::Pending`] while the cycle is in progress and
    /// [`FetchStep::Ready`] with the decoded signal once the final packet
    /// arrived. On any error the session resets itself before returning,
    /// so the next call starts a fresh cycle.
    pub fn step<T: CaptureTransport>(&mut self, transport: &mut T) -> Result<FetchStep> {
        match &mut self.state {
            FetchState::AwaitingSnapshot => {
                transport.write_snapshot_command()?;
                self.state = FetchState::Collecting {
                    packets: Vec::new(),
                };
                Ok(FetchStep::Pending)
            }
            FetchState::Collecting { packets } => {
                let packet = match transport.read_next_packet() {
                    Ok(packet) => packet,
                    Err(e) => {
                        warn!("error reading capture signal packet: {e}");
                        self.reset();
                        return Err(e);
                    }
                };

                if packet.len() < 2 {
                    self.reset();
                    return Err(ProbeError::Protocol(format!(
                        "capture packet too short: {} bytes",
                        packet.len()
                    )));
                }
                if packet[0] != CAPTURE_PACKET_FORMAT {
                    self.reset();
                    return Err(ProbeError::Protocol(format!(
                        "unexpected capture packet format id {:#04x}",
                        packet[0]
                    )));
                }
                let flags = packet[1];
                if flags & FLAG_SNAPSHOT_AVAILABLE == 0 {
                    self.reset();
                    return Err(ProbeError::Protocol(
                        "capture signal data not available".into(),
                    ));
                }

                packets.push(packet);
                if flags & FLAG_MORE_PACKETS != 0 {
                    debug!("capture packet {} collected, more pending", packets.len());
                    return Ok(FetchStep::Pending);
                }

                // Final packet: decode and start the next cycle clean.
                // Leaving the state reset first makes a decode failure
                // recover exactly like every other error.
                let packets =
                    match mem::replace(&mut self.state, FetchState::AwaitingSnapshot) {
                        FetchState::Collecting { packets } => packets,
                        FetchState::AwaitingSnapshot => unreachable!(),
                    };
                let signal = CaptureSignal::decode(&packets, &self.info)?;
                debug!("capture signal fetched: {} samples", signal.len());
                Ok(FetchStep::Ready(signal))
            }
        }
    }
}
