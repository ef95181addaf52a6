//! btleplug-backed [`Radio`] implementation.
//!
//! Peripherals are expected to expose the Nordic UART service: payloads
//! are written to the write characteristic and received as notifications
//! on the notify characteristic.

use crate::domain::models::{AddressType, DeviceAddress};
use crate::domain::settings::Settings;
use crate::infrastructure::radio::{LinkHandle, Radio, RadioError, RadioLink, RawAdvertisement};
use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, CentralEvent, Characteristic, Manager as _, Peripheral as _,
    PeripheralProperties, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-attempt link establishment timeout. The connection manager's retry
/// window sits above this.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Short discovery probe used when a connect targets an address the
/// adapter has not seen yet.
const DISCOVERY_PROBE: Duration = Duration::from_secs(2);

const NOTIFY_CHANNEL_CAPACITY: usize = 64;

/// GATT UUIDs of the UART-style data link.
#[derive(Debug, Clone)]
pub struct LinkUuids {
    pub service: Uuid,
    pub write_char: Uuid,
    pub notify_char: Uuid,
}

impl LinkUuids {
    pub fn from_settings(settings: &Settings) -> Result<Self, RadioError> {
        let parse = |value: &str| {
            Uuid::parse_str(value)
                .map_err(|e| RadioError::Unavailable(format!("invalid link UUID '{value}': {e}")))
        };
        Ok(Self {
            service: parse(&settings.uart_service_uuid)?,
            write_char: parse(&settings.uart_write_char_uuid)?,
            notify_char: parse(&settings.uart_notify_char_uuid)?,
        })
    }
}

pub struct BtleRadio {
    adapter: Adapter,
    uuids: LinkUuids,
}

impl BtleRadio {
    /// Bind to the first available BLE adapter.
    pub async fn new(uuids: LinkUuids) -> Result<Self, RadioError> {
        let manager = Manager::new()
            .await
            .map_err(|e| RadioError::Unavailable(format!("BLE manager init failed: {e}")))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| RadioError::Unavailable(format!("failed to enumerate adapters: {e}")))?
            .into_iter()
            .next()
            .ok_or_else(|| RadioError::Unavailable("no BLE adapter found".to_string()))?;

        if let Ok(name) = adapter.adapter_info().await {
            info!("BLE adapter initialized: {}", name);
        }

        Ok(Self { adapter, uuids })
    }

    async fn find_peripheral(&self, target: BDAddr) -> Result<Option<Peripheral>, RadioError> {
        let peripherals = self.adapter.peripherals().await.map_err(classify)?;
        for peripheral in peripherals {
            if let Ok(Some(props)) = peripheral.properties().await {
                if props.address == target {
                    return Ok(Some(peripheral));
                }
            }
        }
        Ok(None)
    }

    /// Run a short discovery pass so a directly-addressed connect can find
    /// a peripheral the adapter has not cached yet.
    async fn probe_for(&self, target: BDAddr) -> Result<Option<Peripheral>, RadioError> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(classify)?;
        tokio::time::sleep(DISCOVERY_PROBE).await;
        let _ = self.adapter.stop_scan().await;
        self.find_peripheral(target).await
    }
}

#[async_trait]
impl Radio for BtleRadio {
    async fn scan(&mut self, duration: Duration) -> Result<Vec<RawAdvertisement>, RadioError> {
        let mut events = self.adapter.events().await.map_err(classify)?;

        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(classify)?;
        debug!("scan pass started ({:?})", duration);

        let deadline = Instant::now() + duration;
        let mut observed = Vec::new();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let event = match timeout(remaining, events.next()).await {
                Ok(Some(event)) => event,
                Ok(None) => break, // event stream closed
                Err(_) => break,   // pass duration elapsed
            };

            let id = match event {
                CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                _ => continue,
            };
            let Ok(peripheral) = self.adapter.peripheral(&id).await else {
                continue;
            };
            let Ok(Some(props)) = peripheral.properties().await else {
                continue;
            };
            observed.push(RawAdvertisement {
                address: DeviceAddress::new(props.address.into_inner()),
                address_type: map_address_type(&props),
                rssi: props.rssi.unwrap_or(0),
                fragments: fragments_from_properties(&props),
            });
        }

        if let Err(e) = self.adapter.stop_scan().await {
            warn!("failed to stop scan: {}", e);
        }
        debug!("scan pass finished: {} raw events", observed.len());
        Ok(observed)
    }

    async fn open(&mut self, address: DeviceAddress) -> Result<LinkHandle, RadioError> {
        let target = BDAddr::from(address.octets());

        let peripheral = match self.find_peripheral(target).await? {
            Some(p) => p,
            None => self
                .probe_for(target)
                .await?
                .ok_or_else(|| RadioError::Link(format!("peripheral {address} not in range")))?,
        };

        timeout(CONNECT_TIMEOUT, peripheral.connect())
            .await
            .map_err(|_| RadioError::Timeout)?
            .map_err(classify)?;

        peripheral.discover_services().await.map_err(classify)?;

        let characteristics = peripheral.characteristics();
        let write_char = find_characteristic(&characteristics, self.uuids.write_char)?;
        let notify_char = find_characteristic(&characteristics, self.uuids.notify_char)?;

        peripheral.subscribe(&notify_char).await.map_err(classify)?;

        let address_type = peripheral
            .properties()
            .await
            .ok()
            .flatten()
            .map(|props| map_address_type(&props))
            .unwrap_or(AddressType::Public);

        // Forward notifications until the peripheral drops; the closed
        // channel is the session's link-loss signal.
        let mut stream = peripheral.notifications().await.map_err(classify)?;
        let (tx, rx) = mpsc::channel(NOTIFY_CHANNEL_CAPACITY);
        let notify_uuid = self.uuids.notify_char;
        let forwarder = tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                if notification.uuid != notify_uuid {
                    continue;
                }
                if tx.send(notification.value).await.is_err() {
                    break;
                }
            }
        });

        info!("link established to {} ({})", address, address_type);
        Ok(LinkHandle {
            link: Box::new(BtleLink {
                peripheral,
                write_char,
                forwarder: Some(forwarder),
            }),
            address_type,
            notifications: rx,
        })
    }
}

struct BtleLink {
    peripheral: Peripheral,
    write_char: Characteristic,
    forwarder: Option<JoinHandle<()>>,
}

#[async_trait]
impl RadioLink for BtleLink {
    async fn write(&mut self, payload: &[u8]) -> Result<(), RadioError> {
        self.peripheral
            .write(&self.write_char, payload, WriteType::WithResponse)
            .await
            .map_err(classify)
    }

    async fn close(&mut self) {
        if let Some(task) = self.forwarder.take() {
            task.abort();
        }
        if let Err(e) = self.peripheral.disconnect().await {
            debug!("disconnect during close: {}", e);
        }
    }
}

fn find_characteristic(
    characteristics: &std::collections::BTreeSet<Characteristic>,
    uuid: Uuid,
) -> Result<Characteristic, RadioError> {
    characteristics
        .iter()
        .find(|c| c.uuid == uuid)
        .cloned()
        .ok_or_else(|| RadioError::Fatal(format!("characteristic {uuid} not found on peripheral")))
}

fn map_address_type(props: &PeripheralProperties) -> AddressType {
    match props.address_type {
        Some(btleplug::api::AddressType::Random) => AddressType::Random,
        _ => AddressType::Public,
    }
}

/// Rebuild standard advertising-data fragments from the parsed properties
/// btleplug exposes.
fn fragments_from_properties(props: &PeripheralProperties) -> Vec<(u8, Vec<u8>)> {
    let mut fragments = Vec::new();
    if let Some(name) = &props.local_name {
        fragments.push((0x09, name.as_bytes().to_vec()));
    }
    if let Some(tx_power) = props.tx_power_level {
        fragments.push((0x0A, vec![tx_power as u8]));
    }
    for (company_id, data) in &props.manufacturer_data {
        let mut value = company_id.to_le_bytes().to_vec();
        value.extend_from_slice(data);
        fragments.push((0xFF, value));
    }
    for (service_uuid, data) in &props.service_data {
        let mut value = service_uuid.as_u128().to_le_bytes().to_vec();
        value.extend_from_slice(data);
        fragments.push((0x21, value));
    }
    if !props.services.is_empty() {
        let mut value = Vec::with_capacity(props.services.len() * 16);
        for service in &props.services {
            value.extend_from_slice(&service.as_u128().to_le_bytes());
        }
        fragments.push((0x07, value));
    }
    fragments
}

fn classify(err: btleplug::Error) -> RadioError {
    use btleplug::Error as E;
    match err {
        E::TimedOut(_) => RadioError::Timeout,
        E::DeviceNotFound | E::NotConnected => RadioError::Link(err.to_string()),
        E::PermissionDenied | E::NotSupported(_) => RadioError::Unavailable(err.to_string()),
        other => RadioError::Fatal(other.to_string()),
    }
}
