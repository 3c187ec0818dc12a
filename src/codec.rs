//! Big-endian field extraction and fixed-point unit conversions.
//!
//! Every numeric field the probe sends is big-endian. The extraction
//! functions take a buffer and a byte offset and fail with
//! [`ProbeError::TruncatedBuffer`] when the buffer is too short, so the
//! payload decoders never index out of bounds. The conversion functions
//! scale raw device ticks to physical units and refuse a zero divisor
//! instead of producing infinities.

use crate::errors::{ProbeError, Result};

fn field(data: &[u8], offset: usize, need: usize) -> Result<&[u8]> {
    offset
        .checked_add(need)
        .and_then(|end| data.get(offset..end))
        .ok_or(ProbeError::TruncatedBuffer {
            offset,
            need,
            len: data.len(),
        })
}

pub fn read_u8(data: &[u8], offset: usize) -> Result<u8> {
    Ok(field(data, offset, 1)?[0])
}

pub fn read_u16_be(data: &[u8], offset: usize) -> Result<u16> {
    let b = field(data, offset, 2)?;
    Ok(u16::from_be_bytes([b[0], b[1]]))
}

pub fn read_u24_be(data: &[u8], offset: usize) -> Result<u32> {
    let b = field(data, offset, 3)?;
    Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
}

pub fn read_u32_be(data: &[u8], offset: usize) -> Result<u32> {
    let b = field(data, offset, 4)?;
    Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

pub fn read_u48_be(data: &[u8], offset: usize) -> Result<u64> {
    let b = field(data, offset, 6)?;
    Ok(u64::from_be_bytes([0, 0, b[0], b[1], b[2], b[3], b[4], b[5]]))
}

pub fn read_i16_be(data: &[u8], offset: usize) -> Result<i16> {
    let b = field(data, offset, 2)?;
    Ok(i16::from_be_bytes([b[0], b[1]]))
}

pub fn read_i32_be(data: &[u8], offset: usize) -> Result<i32> {
    let b = field(data, offset, 4)?;
    Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

/// Convert current-sense ticks to amps using the probe's calibration.
pub fn ticks_to_amps(ticks: f64, current_ticks_per_amp: u16) -> Result<f64> {
    if current_ticks_per_amp == 0 {
        return Err(ProbeError::InvalidCalibration("current_ticks_per_amp"));
    }
    Ok(ticks / f64::from(current_ticks_per_amp))
}

/// Convert timer ticks to seconds using the probe's clock calibration.
pub fn ticks_to_secs(ticks: u64, time_ticks_per_sec: u32) -> Result<f64> {
    if time_ticks_per_sec == 0 {
        return Err(ProbeError::InvalidCalibration("time_ticks_per_sec"));
    }
    Ok(ticks as f64 / f64::from(time_ticks_per_sec))
}

/// Histogram values arrive in tenths of a percent.
pub fn tenths_to_percent(raw: u16) -> f64 {
    f64::from(raw) / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_unsigned_fields() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07];
        assert_eq!(read_u8(&data, 0).unwrap(), 0x01);
        assert_eq!(read_u16_be(&data, 1).unwrap(), 0x0203);
        assert_eq!(read_u24_be(&data, 2).unwrap(), 0x030405);
        assert_eq!(read_u32_be(&data, 3).unwrap(), 0x04050607);
        assert_eq!(read_u48_be(&data, 0).unwrap(), 0x010203040506);
    }

    #[test]
    fn reads_signed_fields() {
        assert_eq!(read_i16_be(&[0xFF, 0xFE], 0).unwrap(), -2);
        assert_eq!(read_i16_be(&[0x7F, 0xFF], 0).unwrap(), i16::MAX);
        assert_eq!(read_i32_be(&[0xFF, 0xFF, 0xFF, 0x9C], 0).unwrap(), -100);
    }

    #[test]
    fn truncated_read_reports_offset_and_need() {
        let err = read_u32_be(&[0x00, 0x01], 1).unwrap_err();
        match err {
            ProbeError::TruncatedBuffer { offset, need, len } => {
                assert_eq!((offset, need, len), (1, 4, 2));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn offset_overflow_is_truncation_not_panic() {
        assert!(read_u16_be(&[0u8; 4], usize::MAX).is_err());
    }

    #[test]
    fn zero_divisors_are_rejected() {
        assert!(matches!(
            ticks_to_amps(100.0, 0),
            Err(ProbeError::InvalidCalibration("current_ticks_per_amp"))
        ));
        assert!(matches!(
            ticks_to_secs(100, 0),
            Err(ProbeError::InvalidCalibration("time_ticks_per_sec"))
        ));
    }

    #[test]
    fn scales_ticks_to_units() {
        assert_eq!(ticks_to_amps(250.0, 500).unwrap(), 0.5);
        assert_eq!(ticks_to_secs(1_000_000, 1_000_000).unwrap(), 1.0);
        assert_eq!(tenths_to_percent(125), 12.5);
    }
}
