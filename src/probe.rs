//! High level probe driver.
//!
//! `Probe` is the API a monitoring program talks to: it owns the GATT
//! connection, caches the device's [`ProbeInfo`] for the lifetime of the
//! connection, and exposes the telemetry characteristics as typed decode
//! results and the command characteristic as methods.

use std::time::Duration;

use bluer::gatt::remote::Characteristic;
use bluer::Address;
use log::{debug, info};

use crate::bluetooth::{
    BleConnector, GattLink, NotificationStream, CAPTURE_SIGNAL_UUID, COMMAND_UUID,
    CURRENT_HISTOGRAM_UUID, DISTANCE_HISTOGRAM_UUID, MANUFACTURER_NAME_UUID, MODEL_NUMBER_UUID,
    PROBE_INFO_UUID, STEPPER_STATE_UUID, TIME_HISTOGRAM_UUID,
};
use crate::capture::CaptureTransport;
use crate::errors::{ProbeError, Result};
use crate::histogram::{Histogram, HistogramKind};
use crate::probe_info::ProbeInfo;
use crate::probe_state::ProbeState;

// Command characteristic opcodes.
const CMD_RESET_DATA: u8 = 0x01;
const CMD_CAPTURE_SIGNAL_SNAPSHOT: u8 = 0x02;
const CMD_SET_CAPTURE_DIVIDER: u8 = 0x03;
const CMD_TOGGLE_DIRECTION: u8 = 0x04;
const CMD_ZERO_CALIBRATION: u8 = 0x05;
const CMD_CONNECTION_WDT: u8 = 0x06;
const CMD_SET_NICKNAME: u8 = 0x07;

/// A connected probe.
///
/// # Example
/// ```ignore
/// let connector = BleConnector::default();
/// let mut probe = Probe::connect(&connector, "STP-0C8B95F2B436")?;
/// println!("{}", probe.info());
///
/// probe.subscribe_states()?;
/// loop {
///     let state = probe.next_state(Duration::from_secs(5))?;
///     println!("{state}");
/// }
/// ```
pub struct Probe {
    link: GattLink,
    info: ProbeInfo,
    state_chrc: Characteristic,
    current_histogram_chrc: Characteristic,
    time_histogram_chrc: Characteristic,
    distance_histogram_chrc: Characteristic,
    command_chrc: Characteristic,
    capture_chrc: Characteristic,
    state_notifications: Option<NotificationStream>,
}

impl Probe {
    /// Discover the probe named `target` (device name, nickname, or MAC
    /// address), connect, and read its static description.
    pub fn connect(connector: &BleConnector, target: &str) -> Result<Probe> {
        let link = connector.find_and_connect(target)?;
        Self::from_link(link)
    }

    /// Build a driver over an established connection.
    pub fn from_link(link: GattLink) -> Result<Probe> {
        let model_chrc = link.characteristic(MODEL_NUMBER_UUID, "model number")?;
        let manufacturer_chrc = link.characteristic(MANUFACTURER_NAME_UUID, "manufacturer")?;
        let info_chrc = link.characteristic(PROBE_INFO_UUID, "probe info")?;
        let state_chrc = link.characteristic(STEPPER_STATE_UUID, "stepper state")?;
        let current_histogram_chrc =
            link.characteristic(CURRENT_HISTOGRAM_UUID, "current histogram")?;
        let time_histogram_chrc = link.characteristic(TIME_HISTOGRAM_UUID, "time histogram")?;
        let distance_histogram_chrc =
            link.characteristic(DISTANCE_HISTOGRAM_UUID, "distance histogram")?;
        let command_chrc = link.characteristic(COMMAND_UUID, "command")?;
        let capture_chrc = link.characteristic(CAPTURE_SIGNAL_UUID, "capture signal")?;

        let model = read_string(&link, &model_chrc)?;
        let manufacturer = read_string(&link, &manufacturer_chrc)?;
        let info_raw = link.read(&info_chrc)?;
        let info = ProbeInfo::decode(&info_raw, &model, &manufacturer)?;
        info!(
            "connected to {} ({}), firmware {}",
            link.name(),
            link.address(),
            info.firmware_version
        );

        Ok(Probe {
            link,
            info,
            state_chrc,
            current_histogram_chrc,
            time_histogram_chrc,
            distance_histogram_chrc,
            command_chrc,
            capture_chrc,
            state_notifications: None,
        })
    }

    /// Static device description, cached at connection time.
    pub fn info(&self) -> &ProbeInfo {
        &self.info
    }

    /// Advertised device name.
    pub fn name(&self) -> &str {
        self.link.name()
    }

    /// Advertised nickname, possibly empty.
    pub fn nickname(&self) -> &str {
        self.link.nickname()
    }

    pub fn address(&self) -> Address {
        self.link.address()
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    // ------------------------------------------------------------------
    // Telemetry reads
    // ------------------------------------------------------------------

    /// Poll the current stepper state. For a continuous stream use
    /// [`subscribe_states`](Self::subscribe_states) instead.
    pub fn read_state(&self) -> Result<ProbeState> {
        let raw = self.link.read(&self.state_chrc)?;
        ProbeState::decode(&raw, &self.info)
    }

    /// Read the coil-current histogram, in amps per bucket.
    pub fn read_current_histogram(&self, steps_per_unit: f64) -> Result<Histogram> {
        let raw = self.link.read(&self.current_histogram_chrc)?;
        Histogram::decode(HistogramKind::Current, &raw, &self.info, steps_per_unit)
    }

    /// Read the time-by-speed histogram, in percent per bucket.
    pub fn read_time_histogram(&self, steps_per_unit: f64) -> Result<Histogram> {
        let raw = self.link.read(&self.time_histogram_chrc)?;
        Histogram::decode(HistogramKind::Time, &raw, &self.info, steps_per_unit)
    }

    /// Read the distance-by-speed histogram, in percent per bucket.
    pub fn read_distance_histogram(&self, steps_per_unit: f64) -> Result<Histogram> {
        let raw = self.link.read(&self.distance_histogram_chrc)?;
        Histogram::decode(HistogramKind::Distance, &raw, &self.info, steps_per_unit)
    }

    // ------------------------------------------------------------------
    // State notifications
    // ------------------------------------------------------------------

    /// Start state-report notifications. Reports are pulled with
    /// [`next_state`](Self::next_state).
    pub fn subscribe_states(&mut self) -> Result<()> {
        let stream = self.link.subscribe(&self.state_chrc)?;
        self.state_notifications = Some(stream);
        info!("started stepper state notifications");
        Ok(())
    }

    /// Wait for the next state report, up to `timeout`.
    pub fn next_state(&mut self, timeout: Duration) -> Result<ProbeState> {
        let stream = self
            .state_notifications
            .as_mut()
            .ok_or_else(|| ProbeError::Protocol("state notifications not subscribed".into()))?;
        let raw = self.link.next_notification(stream, timeout)?;
        ProbeState::decode(&raw, &self.info)
    }

    // ------------------------------------------------------------------
    // Device commands
    // ------------------------------------------------------------------

    /// Reset the probe's accumulated data (step counts, histograms).
    pub fn reset_data(&self) -> Result<()> {
        self.send_command(&[CMD_RESET_DATA])
    }

    /// Freeze the device-side capture buffer for retrieval.
    pub fn capture_signal_snapshot(&self) -> Result<()> {
        self.send_command(&[CMD_CAPTURE_SIGNAL_SNAPSHOT])
    }

    /// Set the capture sample divider. Takes effect from the next
    /// device-side capture; an already frozen snapshot keeps the divider
    /// it was sampled with.
    pub fn set_capture_divider(&self, divider: u8) -> Result<()> {
        self.send_command(&[CMD_SET_CAPTURE_DIVIDER, divider])
    }

    /// Toggle the forward/backward direction interpretation. Persisted on
    /// the device.
    pub fn toggle_direction(&self) -> Result<()> {
        self.send_command(&[CMD_TOGGLE_DIRECTION])
    }

    /// Re-zero the current sensors. Call with the stepper disconnected or
    /// powered off. Persisted on the device.
    pub fn zero_calibration(&self) -> Result<()> {
        self.send_command(&[CMD_ZERO_CALIBRATION])
    }

    /// Arm the probe's connection watchdog: the device drops the
    /// connection if no watchdog write arrives within `secs`. Useful on
    /// hosts that keep the BLE connection alive after the program exits.
    pub fn connection_watchdog(&self, secs: u8) -> Result<()> {
        self.send_command(&[CMD_CONNECTION_WDT, secs])
    }

    /// Assign a nickname, persisted on the device and advertised next to
    /// the factory name.
    pub fn set_nickname(&self, nickname: &str) -> Result<()> {
        if !crate::bluetooth::is_valid_nickname(nickname) {
            return Err(ProbeError::Protocol(format!(
                "invalid nickname {nickname:?}: expected 1-16 chars of [a-zA-Z0-9. -_#]"
            )));
        }
        let bytes = nickname.as_bytes();
        let mut payload = Vec::with_capacity(2 + bytes.len());
        payload.push(CMD_SET_NICKNAME);
        payload.push(bytes.len() as u8);
        payload.extend_from_slice(bytes);
        self.send_command(&payload)
    }

    pub fn disconnect(self) {
        self.link.disconnect();
    }

    fn send_command(&self, payload: &[u8]) -> Result<()> {
        debug!("sending command {:02X?}", payload);
        self.link.write(&self.command_chrc, payload)
    }
}

impl CaptureTransport for Probe {
    fn write_snapshot_command(&mut self) -> Result<()> {
        self.capture_signal_snapshot()
    }

    fn read_next_packet(&mut self) -> Result<Vec<u8>> {
        self.link.read(&self.capture_chrc)
    }
}

fn read_string(link: &GattLink, chrc: &Characteristic) -> Result<String> {
    let raw = link.read(chrc)?;
    Ok(String::from_utf8_lossy(&raw)
        .trim_end_matches('\0')
        .to_string())
}
