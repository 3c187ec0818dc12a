use std::io;

use thiserror::Error;

/// Errors produced by the probe driver and the payload decoders.
///
/// Decode errors are local and non-fatal: each decoder returns a typed
/// failure and leaves the caller free to retry on the next read or
/// notification.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("bluetooth error: {0}")]
    Bluetooth(#[from] BluetoothError),
    #[error("truncated buffer: need {need} bytes at offset {offset}, buffer has {len}")]
    TruncatedBuffer {
        offset: usize,
        need: usize,
        len: usize,
    },
    #[error("unsupported payload format id {0:#04x}")]
    UnsupportedFormat(u8),
    #[error("malformed payload: expected {expected} bytes, got {actual}")]
    MalformedPayload { expected: usize, actual: usize },
    #[error("invalid calibration: {0} is zero")]
    InvalidCalibration(&'static str),
    #[error("empty input: {0}")]
    EmptyInput(&'static str),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("timeout: {0}")]
    Timeout(String),
}

#[derive(Debug, Error)]
pub enum BluetoothError {
    #[error("device not found during scan: {name}")]
    NotFound { name: String },
    #[error("connection not established: {0}")]
    NotConnected(String),
    #[error("gatt connection failed: {0}")]
    Connection(String),
    #[error("gatt service {0} not present on device")]
    ServiceNotFound(bluer::Uuid),
    #[error("gatt characteristic {name} ({uuid}) not present on device")]
    CharacteristicNotFound {
        name: &'static str,
        uuid: bluer::Uuid,
    },
}

pub type Result<T> = std::result::Result<T, ProbeError>;
