//! Periodic stepper state reports.
//!
//! The probe streams one fixed 19-byte state record per notification. The
//! record carries raw coil-current ticks from the two orthogonal current
//! sensors; the decoder turns those into a continuous, fractional step
//! position by combining the device's full-step counter with an
//! arctangent-based interpolation inside the current step quadrant.

use std::f64::consts::PI;
use std::fmt;

use serde::Serialize;

use crate::codec;
use crate::errors::{ProbeError, Result};
use crate::probe_info::ProbeInfo;

/// Wire length of a state record.
pub const STATE_RECORD_LEN: usize = 19;

// Flag byte layout. Bits 0-1 are the step quadrant.
const FLAG_QUADRANT_MASK: u8 = 0x03;
const FLAG_REVERSED_DIRECTION: u8 = 0x10;
const FLAG_ENERGIZED: u8 = 0x20;

/// A single decoded state report.
///
/// Value type: decoded fresh per notification, consumed by the caller
/// (e.g. for charting) and discarded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeState {
    /// Device time since power-up.
    pub timestamp_secs: f64,
    /// Signed step position with sub-step resolution.
    pub steps: f64,
    pub amps_a: f64,
    pub amps_b: f64,
    /// Combined coil current magnitude, `sqrt(a^2 + b^2)`.
    pub amps_abs: f64,
    /// Raw coil current readings, in current-sensor ticks.
    pub ticks_a: i16,
    pub ticks_b: i16,
    /// Step quadrant, 0-3.
    pub quadrant: u8,
    pub is_reversed_direction: bool,
    pub is_energized: bool,
    /// Number of times the stepper was seen non-energized.
    pub non_energized_count: i32,
}

impl ProbeState {
    /// Decode a 19-byte state record.
    ///
    /// Wire layout, big-endian: timestamp:u48, full_steps:i32, flags:u8,
    /// ticks_a:i16, ticks_b:i16, non_energized_count:i32.
    pub fn decode(data: &[u8], info: &ProbeInfo) -> Result<ProbeState> {
        if data.len() != STATE_RECORD_LEN {
            return Err(ProbeError::MalformedPayload {
                expected: STATE_RECORD_LEN,
                actual: data.len(),
            });
        }

        let ticks_timestamp = codec::read_u48_be(data, 0)?;
        let full_steps = codec::read_i32_be(data, 6)?;
        let flags = codec::read_u8(data, 10)?;
        let quadrant = flags & FLAG_QUADRANT_MASK;
        let is_reversed_direction = flags & FLAG_REVERSED_DIRECTION != 0;
        let is_energized = flags & FLAG_ENERGIZED != 0;
        let ticks_a = codec::read_i16_be(data, 11)?;
        let ticks_b = codec::read_i16_be(data, 13)?;
        let non_energized_count = codec::read_i32_be(data, 15)?;

        let timestamp_secs = codec::ticks_to_secs(ticks_timestamp, info.time_ticks_per_sec)?;
        let amps_a = codec::ticks_to_amps(f64::from(ticks_a), info.current_ticks_per_amp)?;
        let amps_b = codec::ticks_to_amps(f64::from(ticks_b), info.current_ticks_per_amp)?;
        let amps_abs = (amps_a * amps_a + amps_b * amps_b).sqrt();

        let steps = fractional_steps(full_steps, quadrant, ticks_a, ticks_b, is_reversed_direction);

        Ok(ProbeState {
            timestamp_secs,
            steps,
            amps_a,
            amps_b,
            amps_abs,
            ticks_a,
            ticks_b,
            quadrant,
            is_reversed_direction,
            is_energized,
            non_energized_count,
        })
    }
}

/// Step position with sub-step resolution.
///
/// The two coil currents are sinusoidal and 90 degrees apart, so their
/// arctangent locates the rotor within the quadrant: `atan2` lands in
/// `[-pi, pi]`, scaled to a magnitude in `[0, 2]` steps. The per-quadrant
/// adjustment maps that magnitude to `[-0.5, 0.5]` around the full-step
/// count, flipped when the direction interpretation is reversed.
///
/// `quadrant` must already be masked to two bits.
fn fractional_steps(full_steps: i32, quadrant: u8, ticks_a: i16, ticks_b: i16, reversed: bool) -> f64 {
    let radians = f64::from(ticks_b).atan2(f64::from(ticks_a));
    let magnitude = (radians * 2.0 / PI).abs();

    let adjustment = match quadrant {
        0 => magnitude - 0.5,
        1 => magnitude - 1.5,
        2 => -magnitude + 1.5,
        3 => -magnitude + 0.5,
        _ => unreachable!("quadrant is masked to two bits"),
    };

    if reversed {
        f64::from(full_steps) - adjustment
    } else {
        f64::from(full_steps) + adjustment
    }
}

impl fmt::Display for ProbeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The 'energized' flag is unreliable with noisy current sensors,
        // so it is not part of the one-line summary.
        let direction = if self.is_reversed_direction { "Bck" } else { "Fwd" };
        write!(
            f,
            "TS:{:9.3}, Steps:{:8.2}, A:{:5.2}, B:{:5.2}, abs:{:4.2} ({:5}, {:5}, {}, {})",
            self.timestamp_secs,
            self.steps,
            self.amps_a,
            self.amps_b,
            self.amps_abs,
            self.ticks_a,
            self.ticks_b,
            self.quadrant,
            direction
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_info(current_ticks_per_amp: u16, time_ticks_per_sec: u32) -> ProbeInfo {
        ProbeInfo {
            model: "Stepper Probe ESP32".into(),
            manufacturer: "Zapta".into(),
            hardware_config: 1,
            current_ticks_per_amp,
            time_ticks_per_sec,
            histogram_bucket_ticks_per_sec: 100,
            firmware_version: "test".into(),
        }
    }

    fn encode_state(
        timestamp_ticks: u64,
        full_steps: i32,
        flags: u8,
        ticks_a: i16,
        ticks_b: i16,
        non_energized_count: i32,
    ) -> Vec<u8> {
        let mut data = Vec::with_capacity(STATE_RECORD_LEN);
        data.extend_from_slice(&timestamp_ticks.to_be_bytes()[2..]);
        data.extend_from_slice(&full_steps.to_be_bytes());
        data.push(flags);
        data.extend_from_slice(&ticks_a.to_be_bytes());
        data.extend_from_slice(&ticks_b.to_be_bytes());
        data.extend_from_slice(&non_energized_count.to_be_bytes());
        data
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn decodes_field_layout() {
        let info = test_info(1000, 1_000_000);
        let data = encode_state(2_000_000, -7, FLAG_ENERGIZED | 0x01, 500, -250, 42);
        let state = ProbeState::decode(&data, &info).unwrap();

        assert_close(state.timestamp_secs, 2.0);
        assert_eq!(state.ticks_a, 500);
        assert_eq!(state.ticks_b, -250);
        assert_close(state.amps_a, 0.5);
        assert_close(state.amps_b, -0.25);
        assert_close(state.amps_abs, (0.25f64 + 0.0625).sqrt());
        assert_eq!(state.quadrant, 1);
        assert!(!state.is_reversed_direction);
        assert!(state.is_energized);
        assert_eq!(state.non_energized_count, 42);
    }

    #[test]
    fn integer_fields_round_trip_through_reencoding() {
        let info = test_info(1000, 1_000_000);
        let data = encode_state(0x0102_0304_0506, -123_456, 0x31, -32768, 32767, i32::MIN);
        let state = ProbeState::decode(&data, &info).unwrap();

        let flags = state.quadrant
            | if state.is_reversed_direction { FLAG_REVERSED_DIRECTION } else { 0 }
            | if state.is_energized { FLAG_ENERGIZED } else { 0 };
        let timestamp_ticks = (state.timestamp_secs * f64::from(info.time_ticks_per_sec)).round();
        // The sub-step adjustment is within (-0.5, 0.5) for these ticks, so
        // rounding recovers the stored full-step count.
        let full_steps = state.steps.round() as i32;
        let reencoded = encode_state(
            timestamp_ticks as u64,
            full_steps,
            flags,
            state.ticks_a,
            state.ticks_b,
            state.non_energized_count,
        );
        assert_eq!(reencoded, data);
    }

    #[test]
    fn rejects_wrong_length() {
        let info = test_info(1000, 1_000_000);
        assert!(matches!(
            ProbeState::decode(&[0u8; 18], &info),
            Err(ProbeError::MalformedPayload {
                expected: 19,
                actual: 18
            })
        ));
        assert!(ProbeState::decode(&[0u8; 20], &info).is_err());
    }

    #[test]
    fn zero_current_calibration_is_rejected() {
        let info = test_info(0, 1_000_000);
        let data = encode_state(0, 0, 0, 1, 0, 0);
        assert!(matches!(
            ProbeState::decode(&data, &info),
            Err(ProbeError::InvalidCalibration("current_ticks_per_amp"))
        ));
    }

    #[test]
    fn quadrant_zero_on_axis_adjustment_is_minus_half() {
        // ticks_a=1, ticks_b=0: angle 0, magnitude 0, quadrant 0.
        let info = test_info(1000, 1_000_000);
        let data = encode_state(0, 10, 0x00, 1, 0, 0);
        let state = ProbeState::decode(&data, &info).unwrap();
        assert_close(state.steps, 10.0 - 0.5);
    }

    #[test]
    fn magnitude_one_adjustment_per_quadrant() {
        // ticks_a=0, ticks_b=1: angle pi/2, magnitude exactly 1.
        // Adjustment by quadrant: 0 -> +0.5, 1 -> -0.5, 2 -> +0.5, 3 -> -0.5.
        let info = test_info(1000, 1_000_000);
        for (quadrant, expected) in [(0u8, 0.5), (1, -0.5), (2, 0.5), (3, -0.5)] {
            let data = encode_state(0, 100, quadrant, 0, 1, 0);
            let state = ProbeState::decode(&data, &info).unwrap();
            assert_close(state.steps, 100.0 + expected);
        }
    }

    #[test]
    fn negative_angle_magnitudes_mirror_positive_ones() {
        // ticks_a=0, ticks_b=-1: angle -pi/2, |magnitude| is still 1.
        let info = test_info(1000, 1_000_000);
        let data = encode_state(0, 100, 0x02, 0, -1, 0);
        let state = ProbeState::decode(&data, &info).unwrap();
        assert_close(state.steps, 100.5);
    }

    #[test]
    fn reversed_direction_flips_adjustment_sign() {
        let info = test_info(1000, 1_000_000);
        let forward = encode_state(0, 10, 0x00, 1, 0, 0);
        let backward = encode_state(0, 10, FLAG_REVERSED_DIRECTION, 1, 0, 0);
        let fwd = ProbeState::decode(&forward, &info).unwrap();
        let bck = ProbeState::decode(&backward, &info).unwrap();
        assert_close(fwd.steps, 9.5);
        assert_close(bck.steps, 10.5);
    }

    #[test]
    fn quadrant_is_masked_from_flag_bits() {
        // Bits 2-3 of the flag byte are not part of the quadrant.
        let info = test_info(1000, 1_000_000);
        let data = encode_state(0, 0, 0x0F, 1, 1, 0);
        let state = ProbeState::decode(&data, &info).unwrap();
        assert_eq!(state.quadrant, 3);
    }
}
