//! Bucketed distribution reports.
//!
//! The probe maintains three histograms keyed by step speed: coil current
//! by speed, time spent by speed, and distance travelled by speed. All
//! three share one wire layout (format id, bucket count, then one u16 per
//! bucket) and differ only in the format id and the scaling of the raw
//! bucket values, so they decode through a single type parameterized by
//! [`HistogramKind`].

use serde::Serialize;

use crate::codec;
use crate::errors::{ProbeError, Result};
use crate::probe_info::ProbeInfo;

/// Which of the probe's three histograms a payload carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HistogramKind {
    /// Coil current by speed, buckets in amps.
    Current,
    /// Time by speed, buckets in percent of total time.
    Time,
    /// Distance by speed, buckets in percent of total distance.
    Distance,
}

impl HistogramKind {
    /// Expected format id at byte 0 of the payload.
    pub fn format_id(self) -> u8 {
        match self {
            HistogramKind::Current => 0x10,
            HistogramKind::Time => 0x20,
            HistogramKind::Distance => 0x30,
        }
    }

    /// Scale a raw bucket value to its display unit.
    ///
    /// Current buckets are in sensor ticks; time and distance buckets
    /// arrive in tenths of a percent.
    fn scale(self, raw: u16, info: &ProbeInfo) -> Result<f64> {
        match self {
            HistogramKind::Current => {
                codec::ticks_to_amps(f64::from(raw), info.current_ticks_per_amp)
            }
            HistogramKind::Time | HistogramKind::Distance => Ok(codec::tenths_to_percent(raw)),
        }
    }
}

/// A decoded histogram. Immutable once decoded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Histogram {
    pub kind: HistogramKind,
    /// Width of each bucket on the speed axis, in caller units per second.
    pub bucket_width: f64,
    /// Scaled bucket values; length equals the bucket count declared in
    /// the payload.
    pub heights: Vec<f64>,
}

impl Histogram {
    /// Decode a histogram payload of the given kind.
    ///
    /// `steps_per_unit` converts the speed axis from steps to a caller
    /// unit (e.g. mm of travel); pass 1.0 to keep steps.
    pub fn decode(
        kind: HistogramKind,
        data: &[u8],
        info: &ProbeInfo,
        steps_per_unit: f64,
    ) -> Result<Histogram> {
        let format = codec::read_u8(data, 0)?;
        if format != kind.format_id() {
            return Err(ProbeError::UnsupportedFormat(format));
        }
        if steps_per_unit == 0.0 {
            return Err(ProbeError::InvalidCalibration("steps_per_unit"));
        }

        let bucket_count = codec::read_u8(data, 1)? as usize;
        let mut heights = Vec::with_capacity(bucket_count);
        for i in 0..bucket_count {
            let raw = codec::read_u16_be(data, 2 + i * 2)?;
            heights.push(kind.scale(raw, info)?);
        }

        Ok(Histogram {
            kind,
            bucket_width: f64::from(info.histogram_bucket_ticks_per_sec) / steps_per_unit,
            heights,
        })
    }

    /// Bucket center positions on the speed axis, derived on demand.
    pub fn centers(&self) -> Vec<f64> {
        let w = self.bucket_width;
        (0..self.heights.len())
            .map(|i| w / 2.0 + i as f64 * w)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_info(current_ticks_per_amp: u16) -> ProbeInfo {
        ProbeInfo {
            model: "Stepper Probe ESP32".into(),
            manufacturer: "Zapta".into(),
            hardware_config: 1,
            current_ticks_per_amp,
            time_ticks_per_sec: 1_000_000,
            histogram_bucket_ticks_per_sec: 100,
            firmware_version: "test".into(),
        }
    }

    #[test]
    fn decodes_current_histogram_in_amps() {
        let data = [0x10, 0x02, 0x00, 0x0A, 0x00, 0x14];
        let info = test_info(10);
        let h = Histogram::decode(HistogramKind::Current, &data, &info, 1.0).unwrap();
        assert_eq!(h.heights, vec![1.0, 2.0]);
        assert_eq!(h.bucket_width, 100.0);
    }

    #[test]
    fn decodes_time_and_distance_histograms_in_percent() {
        // 125 and 1000 tenths of a percent.
        let data_time = [0x20, 0x02, 0x00, 0x7D, 0x03, 0xE8];
        let data_distance = [0x30, 0x02, 0x00, 0x7D, 0x03, 0xE8];
        let info = test_info(10);
        let t = Histogram::decode(HistogramKind::Time, &data_time, &info, 1.0).unwrap();
        let d = Histogram::decode(HistogramKind::Distance, &data_distance, &info, 1.0).unwrap();
        assert_eq!(t.heights, vec![12.5, 100.0]);
        assert_eq!(d.heights, t.heights);
    }

    #[test]
    fn bucket_count_matches_heights_len() {
        let mut data = vec![0x10, 0x05];
        for v in 0u16..5 {
            data.extend_from_slice(&(v * 10).to_be_bytes());
        }
        let info = test_info(10);
        let h = Histogram::decode(HistogramKind::Current, &data, &info, 1.0).unwrap();
        assert_eq!(h.heights.len(), 5);
    }

    #[test]
    fn rejects_mismatched_format_id() {
        let data = [0x20, 0x00];
        let info = test_info(10);
        assert!(matches!(
            Histogram::decode(HistogramKind::Current, &data, &info, 1.0),
            Err(ProbeError::UnsupportedFormat(0x20))
        ));
    }

    #[test]
    fn rejects_payload_shorter_than_declared_count() {
        let data = [0x10, 0x03, 0x00, 0x0A];
        let info = test_info(10);
        assert!(matches!(
            Histogram::decode(HistogramKind::Current, &data, &info, 1.0),
            Err(ProbeError::TruncatedBuffer { .. })
        ));
    }

    #[test]
    fn zero_current_calibration_is_rejected() {
        let data = [0x10, 0x01, 0x00, 0x0A];
        let info = test_info(0);
        assert!(matches!(
            Histogram::decode(HistogramKind::Current, &data, &info, 1.0),
            Err(ProbeError::InvalidCalibration("current_ticks_per_amp"))
        ));
    }

    #[test]
    fn steps_per_unit_scales_bucket_width() {
        let data = [0x10, 0x01, 0x00, 0x0A];
        let info = test_info(10);
        let h = Histogram::decode(HistogramKind::Current, &data, &info, 40.0).unwrap();
        assert_eq!(h.bucket_width, 2.5);
    }

    #[test]
    fn centers_are_half_width_offset_multiples() {
        let data = [0x10, 0x03, 0x00, 0x01, 0x00, 0x02, 0x00, 0x03];
        let info = test_info(10);
        let h = Histogram::decode(HistogramKind::Current, &data, &info, 1.0).unwrap();
        assert_eq!(h.centers(), vec![50.0, 150.0, 250.0]);
    }
}
