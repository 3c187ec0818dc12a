//! BlueZ connection layer for the probe.
//!
//! Discovers a probe by its advertised name or nickname, connects, and
//! resolves the stepper GATT service. The public API is synchronous: the
//! returned [`GattLink`] owns a tokio runtime and blocks on each GATT
//! operation, so the driver above it stays a plain sequential state
//! machine.

use std::collections::HashMap;
use std::pin::Pin;
use std::time::{Duration, Instant};

use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, AdapterEvent, Address, Device, Session, Uuid};
use futures::{Stream, StreamExt};
use log::{debug, info, warn};
use tokio::runtime::Runtime;

use crate::errors::{BluetoothError, ProbeError, Result};

const SCAN_TIMEOUT_SECS: u64 = 30;
const CONNECT_TIMEOUT_SECS: u64 = 20;
const DEFAULT_IO_TIMEOUT_SECS: u64 = 5;
const MAX_CONNECT_RETRIES: u32 = 3;
const RETRY_DELAY_MS: u64 = 500;

const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;

/// Expand a 16-bit assigned number to a full 128-bit UUID.
const fn assigned_uuid(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// The probe's stepper service and its characteristics.
pub const STEPPER_SERVICE_UUID: Uuid = Uuid::from_u128(0x6b6a78d7_8ee0_4a26_ba7b_62e357dd9720);
pub const MODEL_NUMBER_UUID: Uuid = assigned_uuid(0x2a24);
pub const MANUFACTURER_NAME_UUID: Uuid = assigned_uuid(0x2a29);
pub const PROBE_INFO_UUID: Uuid = assigned_uuid(0xff01);
pub const STEPPER_STATE_UUID: Uuid = assigned_uuid(0xff02);
pub const CURRENT_HISTOGRAM_UUID: Uuid = assigned_uuid(0xff03);
pub const TIME_HISTOGRAM_UUID: Uuid = assigned_uuid(0xff04);
pub const DISTANCE_HISTOGRAM_UUID: Uuid = assigned_uuid(0xff05);
pub const COMMAND_UUID: Uuid = assigned_uuid(0xff06);
pub const CAPTURE_SIGNAL_UUID: Uuid = assigned_uuid(0xff07);

/// Manufacturer-data id under which the probe advertises its nickname.
const NICKNAME_MANUFACTURER_ID: u16 = 4369;

/// True for factory device names: `STP-` followed by 12 uppercase hex
/// digits of the MAC address.
pub fn is_probe_device_name(name: &str) -> bool {
    match name.strip_prefix("STP-") {
        Some(hex) => {
            hex.len() == 12
                && hex
                    .bytes()
                    .all(|b| matches!(b, b'0'..=b'9' | b'A'..=b'F'))
        }
        None => false,
    }
}

/// True for nicknames the probe accepts: 1-16 chars from a small
/// printable set.
pub fn is_valid_nickname(nickname: &str) -> bool {
    (1..=16).contains(&nickname.len())
        && nickname
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || ". -_#".contains(c))
}

fn gatt_err(e: bluer::Error) -> ProbeError {
    ProbeError::Bluetooth(BluetoothError::Connection(e.to_string()))
}

/// A probe seen while scanning.
#[derive(Debug, Clone)]
pub struct DiscoveredProbe {
    pub address: Address,
    pub name: String,
    /// User-assigned nickname from the advertisement, possibly empty.
    pub nickname: String,
}

/// High level connector that discovers and connects to a probe.
#[derive(Debug, Clone)]
pub struct BleConnector {
    pub scan_timeout: Duration,
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for BleConnector {
    fn default() -> Self {
        Self {
            scan_timeout: Duration::from_secs(SCAN_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            io_timeout: Duration::from_secs(DEFAULT_IO_TIMEOUT_SECS),
            max_retries: MAX_CONNECT_RETRIES,
            retry_delay: Duration::from_millis(RETRY_DELAY_MS),
        }
    }
}

impl BleConnector {
    /// Scan for advertising probes until the scan timeout elapses.
    pub fn scan(&self) -> Result<Vec<DiscoveredProbe>> {
        let rt = Runtime::new()?;
        rt.block_on(self.scan_async())
    }

    /// Discover a probe by name, nickname, or MAC address and open a
    /// connection with the stepper service resolved.
    pub fn find_and_connect(&self, target: &str) -> Result<GattLink> {
        let rt = Runtime::new()?;
        let (session, device, name, nickname) = rt.block_on(async {
            let (session, adapter) = open_adapter().await?;
            let (device, name, nickname) = self.find_device(&adapter, target).await?;
            self.connect_device(&device).await?;
            Ok::<_, ProbeError>((session, device, name, nickname))
        })?;
        let characteristics = rt.block_on(resolve_characteristics(&device))?;
        info!("gatt connection established: device={}", device.address());
        Ok(GattLink {
            rt,
            _session: session,
            device,
            name,
            nickname,
            characteristics,
            io_timeout: self.io_timeout,
        })
    }

    async fn scan_async(&self) -> Result<Vec<DiscoveredProbe>> {
        let (_session, adapter) = open_adapter().await?;
        let mut events = adapter.discover_devices().await.map_err(gatt_err)?;
        let deadline = Instant::now() + self.scan_timeout;
        let mut found = Vec::new();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let event = match tokio::time::timeout(remaining, events.next()).await {
                Ok(Some(event)) => event,
                Ok(None) | Err(_) => break,
            };
            let AdapterEvent::DeviceAdded(address) = event else {
                continue;
            };
            let device = adapter.device(address).map_err(gatt_err)?;
            let name = device_name(&device).await;
            if !is_probe_device_name(&name) {
                continue;
            }
            let nickname = advertised_nickname(&device).await;
            info!("probe discovered: name={name}, nickname={nickname:?}, address={address}");
            found.push(DiscoveredProbe {
                address,
                name,
                nickname,
            });
        }
        Ok(found)
    }

    async fn find_device(
        &self,
        adapter: &Adapter,
        target: &str,
    ) -> Result<(Device, String, String)> {
        let wanted_address: Option<Address> = target.parse().ok();
        let mut events = adapter.discover_devices().await.map_err(gatt_err)?;
        let deadline = Instant::now() + self.scan_timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let event = match tokio::time::timeout(remaining, events.next()).await {
                Ok(Some(event)) => event,
                Ok(None) | Err(_) => break,
            };
            let AdapterEvent::DeviceAdded(address) = event else {
                continue;
            };
            let device = adapter.device(address).map_err(gatt_err)?;
            let name = device_name(&device).await;
            if !is_probe_device_name(&name) {
                debug!("ignoring non-probe device: name={name:?}, address={address}");
                continue;
            }
            let nickname = advertised_nickname(&device).await;
            if wanted_address == Some(address)
                || name == target
                || (!nickname.is_empty() && nickname == target)
            {
                info!("found probe {name} ({nickname:?}) at {address}");
                return Ok((device, name, nickname));
            }
        }
        Err(ProbeError::Bluetooth(BluetoothError::NotFound {
            name: target.to_string(),
        }))
    }

    async fn connect_device(&self, device: &Device) -> Result<()> {
        let mut last_error = None;
        for attempt in 0..self.max_retries {
            if attempt > 0 {
                let delay = self.retry_delay * (1 << (attempt - 1).min(3));
                warn!(
                    "retrying gatt connection after {:?} (device={}, attempt={})",
                    delay,
                    device.address(),
                    attempt
                );
                tokio::time::sleep(delay).await;
            }

            match tokio::time::timeout(self.connect_timeout, device.connect()).await {
                Ok(Ok(())) => match self.wait_services_resolved(device).await {
                    Ok(()) => return Ok(()),
                    Err(e) => last_error = Some(e),
                },
                Ok(Err(e)) => {
                    warn!(
                        "gatt connection attempt failed: device={}, attempt={}, error={}",
                        device.address(),
                        attempt,
                        e
                    );
                    last_error = Some(gatt_err(e));
                }
                Err(_) => {
                    last_error = Some(ProbeError::Timeout("gatt connect timed out".into()));
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            ProbeError::Bluetooth(BluetoothError::NotConnected("max retries exceeded".into()))
        }))
    }

    async fn wait_services_resolved(&self, device: &Device) -> Result<()> {
        let deadline = Instant::now() + self.connect_timeout;
        while Instant::now() < deadline {
            if device.is_services_resolved().await.unwrap_or(false) {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Err(ProbeError::Timeout(
            "gatt service resolution timed out".into(),
        ))
    }
}

async fn open_adapter() -> Result<(Session, Adapter)> {
    let session = Session::new().await.map_err(gatt_err)?;
    let adapter = session.default_adapter().await.map_err(gatt_err)?;
    adapter.set_powered(true).await.map_err(gatt_err)?;
    Ok((session, adapter))
}

async fn device_name(device: &Device) -> String {
    match device.name().await {
        Ok(Some(name)) => name,
        _ => String::new(),
    }
}

async fn advertised_nickname(device: &Device) -> String {
    match device.manufacturer_data().await {
        Ok(Some(data)) => data
            .get(&NICKNAME_MANUFACTURER_ID)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .unwrap_or_default(),
        _ => String::new(),
    }
}

async fn resolve_characteristics(device: &Device) -> Result<HashMap<Uuid, Characteristic>> {
    let mut stepper_service = None;
    for service in device.services().await.map_err(gatt_err)? {
        if service.uuid().await.map_err(gatt_err)? == STEPPER_SERVICE_UUID {
            stepper_service = Some(service);
            break;
        }
    }
    let service = stepper_service.ok_or(ProbeError::Bluetooth(BluetoothError::ServiceNotFound(
        STEPPER_SERVICE_UUID,
    )))?;

    let mut characteristics = HashMap::new();
    for chrc in service.characteristics().await.map_err(gatt_err)? {
        characteristics.insert(chrc.uuid().await.map_err(gatt_err)?, chrc);
    }
    debug!("resolved {} stepper characteristics", characteristics.len());
    Ok(characteristics)
}

/// A notification subscription on one characteristic. Poll it through
/// [`GattLink::next_notification`].
pub struct NotificationStream {
    inner: Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>,
}

/// An established connection with the stepper service resolved.
///
/// Owns the tokio runtime that drives the underlying bluer session; all
/// methods block the calling thread for at most the configured IO
/// timeout.
pub struct GattLink {
    // Field order keeps the bluer handles dropping before the runtime
    // that drives them.
    _session: Session,
    device: Device,
    name: String,
    nickname: String,
    characteristics: HashMap<Uuid, Characteristic>,
    io_timeout: Duration,
    rt: Runtime,
}

impl GattLink {
    /// Look up a characteristic resolved at connection time.
    pub fn characteristic(&self, uuid: Uuid, name: &'static str) -> Result<Characteristic> {
        self.characteristics.get(&uuid).cloned().ok_or_else(|| {
            ProbeError::Bluetooth(BluetoothError::CharacteristicNotFound { name, uuid })
        })
    }

    /// Read a characteristic's value.
    pub fn read(&self, chrc: &Characteristic) -> Result<Vec<u8>> {
        self.rt.block_on(async {
            tokio::time::timeout(self.io_timeout, chrc.read())
                .await
                .map_err(|_| ProbeError::Timeout("characteristic read timed out".into()))?
                .map_err(gatt_err)
        })
    }

    /// Write a characteristic's value.
    pub fn write(&self, chrc: &Characteristic, payload: &[u8]) -> Result<()> {
        self.rt.block_on(async {
            tokio::time::timeout(self.io_timeout, chrc.write(payload))
                .await
                .map_err(|_| ProbeError::Timeout("characteristic write timed out".into()))?
                .map_err(gatt_err)
        })
    }

    /// Subscribe to value notifications on a characteristic.
    pub fn subscribe(&self, chrc: &Characteristic) -> Result<NotificationStream> {
        let stream = self.rt.block_on(async {
            tokio::time::timeout(self.io_timeout, chrc.notify())
                .await
                .map_err(|_| ProbeError::Timeout("notify subscription timed out".into()))?
                .map_err(gatt_err)
        })?;
        Ok(NotificationStream {
            inner: Box::pin(stream),
        })
    }

    /// Wait for the next notification, up to `timeout`.
    pub fn next_notification(
        &self,
        stream: &mut NotificationStream,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        self.rt.block_on(async {
            match tokio::time::timeout(timeout, stream.inner.next()).await {
                Ok(Some(payload)) => Ok(payload),
                Ok(None) => Err(ProbeError::Bluetooth(BluetoothError::NotConnected(
                    "notification stream ended".into(),
                ))),
                Err(_) => Err(ProbeError::Timeout(format!(
                    "no notification within {timeout:?}"
                ))),
            }
        })
    }

    pub fn is_connected(&self) -> bool {
        self.rt
            .block_on(self.device.is_connected())
            .unwrap_or(false)
    }

    pub fn address(&self) -> Address {
        self.device.address()
    }

    /// Advertised device name (`STP-` + MAC digits).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Advertised nickname, possibly empty.
    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn disconnect(&self) {
        info!("disconnecting from {}", self.device.address());
        if let Err(e) = self.rt.block_on(self.device.disconnect()) {
            warn!("disconnect failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_factory_device_names() {
        assert!(is_probe_device_name("STP-0C8B95F2B436"));
        assert!(!is_probe_device_name("STP-0c8b95f2b436")); // lowercase hex
        assert!(!is_probe_device_name("STP-0C8B95F2B43")); // too short
        assert!(!is_probe_device_name("STP-0C8B95F2B4367")); // too long
        assert!(!is_probe_device_name("XYZ-0C8B95F2B436"));
        assert!(!is_probe_device_name(""));
    }

    #[test]
    fn validates_nicknames() {
        assert!(is_valid_nickname("mill z-axis #2"));
        assert!(is_valid_nickname("A"));
        assert!(!is_valid_nickname(""));
        assert!(!is_valid_nickname("seventeen-chars-x"));
        assert!(!is_valid_nickname("tab\tchar"));
    }

    #[test]
    fn expands_assigned_uuids_onto_the_base() {
        assert_eq!(
            MODEL_NUMBER_UUID.to_string(),
            "00002a24-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            CAPTURE_SIGNAL_UUID.to_string(),
            "0000ff07-0000-1000-8000-00805f9b34fb"
        );
    }
}
