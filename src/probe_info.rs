//! Static probe description, read once per connection.
//!
//! The record combines the calibration constants from the probe-info
//! characteristic with the model and manufacturer strings read from their
//! companion characteristics. It never changes for the lifetime of a
//! connection and is shared freely between the decoders.

use std::fmt;

use serde::Serialize;

use crate::codec;
use crate::errors::{ProbeError, Result};

/// Format id of the probe-info payload.
pub const PROBE_INFO_FORMAT: u8 = 0x01;

/// Minimum payload length: format id plus the fixed calibration fields.
const MIN_PAYLOAD_LEN: usize = 9;

/// Firmware version reported for devices that predate the version field.
const UNKNOWN_VERSION: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeInfo {
    pub model: String,
    pub manufacturer: String,
    pub hardware_config: u8,
    pub current_ticks_per_amp: u16,
    pub time_ticks_per_sec: u32,
    pub histogram_bucket_ticks_per_sec: u16,
    pub firmware_version: String,
}

impl ProbeInfo {
    /// Decode the probe-info payload.
    ///
    /// `model` and `manufacturer` come from companion characteristic reads.
    /// The trailing length-prefixed firmware version string is optional:
    /// firmware older than the field omits it, in which case the version
    /// reads as `"unknown"`.
    pub fn decode(data: &[u8], model: &str, manufacturer: &str) -> Result<ProbeInfo> {
        if data.len() < MIN_PAYLOAD_LEN {
            return Err(ProbeError::MalformedPayload {
                expected: MIN_PAYLOAD_LEN,
                actual: data.len(),
            });
        }
        let format = codec::read_u8(data, 0)?;
        if format != PROBE_INFO_FORMAT {
            return Err(ProbeError::UnsupportedFormat(format));
        }

        let hardware_config = codec::read_u8(data, 1)?;
        let current_ticks_per_amp = codec::read_u16_be(data, 2)?;
        let time_ticks_per_sec = codec::read_u24_be(data, 4)?;
        let histogram_bucket_ticks_per_sec = codec::read_u16_be(data, 7)?;

        let firmware_version = if data.len() > MIN_PAYLOAD_LEN {
            let len = codec::read_u8(data, 9)? as usize;
            let end = 10usize
                .checked_add(len)
                .ok_or(ProbeError::TruncatedBuffer {
                    offset: 10,
                    need: len,
                    len: data.len(),
                })?;
            let bytes = data.get(10..end).ok_or(ProbeError::TruncatedBuffer {
                offset: 10,
                need: len,
                len: data.len(),
            })?;
            String::from_utf8_lossy(bytes).into_owned()
        } else {
            UNKNOWN_VERSION.to_string()
        };

        Ok(ProbeInfo {
            model: model.to_string(),
            manufacturer: manufacturer.to_string(),
            hardware_config,
            current_ticks_per_amp,
            time_ticks_per_sec,
            histogram_bucket_ticks_per_sec,
            firmware_version,
        })
    }
}

impl fmt::Display for ProbeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Model: [{}]", self.model)?;
        writeln!(f, "Manufacturer: [{}]", self.manufacturer)?;
        writeln!(f, "Firmware version: [{}]", self.firmware_version)?;
        writeln!(f, "Hardware config: [{}]", self.hardware_config)?;
        writeln!(f, "Current ticks per amp: [{}]", self.current_ticks_per_amp)?;
        writeln!(f, "Time ticks per sec: [{}]", self.time_ticks_per_sec)?;
        write!(
            f,
            "Histogram bucket ticks per sec: [{}]",
            self.histogram_bucket_ticks_per_sec
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload_with_version(version: &str) -> Vec<u8> {
        let mut data = vec![
            0x01, // format
            0x02, // hardware config
            0x04, 0xD2, // current ticks per amp = 1234
            0x0F, 0x42, 0x40, // time ticks per sec = 1_000_000
            0x00, 0x64, // histogram bucket ticks per sec = 100
        ];
        data.push(version.len() as u8);
        data.extend_from_slice(version.as_bytes());
        data
    }

    #[test]
    fn decodes_full_payload() {
        let data = payload_with_version("0.9.1");
        let info = ProbeInfo::decode(&data, "Stepper Probe ESP32", "Zapta").unwrap();
        assert_eq!(info.model, "Stepper Probe ESP32");
        assert_eq!(info.manufacturer, "Zapta");
        assert_eq!(info.hardware_config, 2);
        assert_eq!(info.current_ticks_per_amp, 1234);
        assert_eq!(info.time_ticks_per_sec, 1_000_000);
        assert_eq!(info.histogram_bucket_ticks_per_sec, 100);
        assert_eq!(info.firmware_version, "0.9.1");
    }

    #[test]
    fn missing_version_field_defaults_to_unknown() {
        // Fixed fields only, as sent by firmware older than the version field.
        let data = &payload_with_version("x")[..9];
        let info = ProbeInfo::decode(data, "m", "v").unwrap();
        assert_eq!(info.firmware_version, "unknown");
    }

    #[test]
    fn rejects_unexpected_format_id() {
        let mut data = payload_with_version("1.0");
        data[0] = 0x02;
        assert!(matches!(
            ProbeInfo::decode(&data, "m", "v"),
            Err(ProbeError::UnsupportedFormat(0x02))
        ));
    }

    #[test]
    fn rejects_short_payload() {
        let err = ProbeInfo::decode(&[0x01, 0x02, 0x03], "m", "v").unwrap_err();
        assert!(matches!(
            err,
            ProbeError::MalformedPayload {
                expected: 9,
                actual: 3
            }
        ));
    }

    #[test]
    fn rejects_version_tail_shorter_than_its_length_prefix() {
        let mut data = payload_with_version("abc");
        data.truncate(data.len() - 1);
        assert!(matches!(
            ProbeInfo::decode(&data, "m", "v"),
            Err(ProbeError::TruncatedBuffer { .. })
        ));
    }
}
