//! BlueZ D-Bus backend.
//!
//! This backend uses the `bluer` crate to communicate with the BlueZ daemon
//! via D-Bus. It requires the `bluetoothd` daemon to be running. It provides
//! all three link types: LE discovery, GATT client connections and RFCOMM
//! streams for classic serial scales.

use super::{
    ADVERTISEMENT_CHANNEL_BUFFER_SIZE, AdvertisementSource, GATT_EVENT_CHANNEL_BUFFER_SIZE,
    GattConnection, GattEvent, GattLink, GattSession, LinkError, LinkFuture, ScanFilter,
    SppLink, SppStream,
};
use crate::advertisement::ScannedDeviceInfo;
use crate::mac_address::MacAddress;
use bluer::gatt::remote::{Characteristic, CharacteristicWriteRequest};
use bluer::gatt::WriteOp;
use bluer::{
    Adapter, AdapterEvent, Address, Device, DeviceEvent, DeviceProperty, DiscoveryFilter,
    DiscoveryTransport, Session,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// RFCOMM channel of the serial port profile on the scales we know.
const SPP_RFCOMM_CHANNEL: u8 = 1;

impl From<bluer::Error> for LinkError {
    fn from(err: bluer::Error) -> Self {
        LinkError::Bluetooth(err.to_string())
    }
}

/// Default adapter of a BlueZ session.
pub struct BluerLink {
    _session: Session,
    adapter: Adapter,
}

impl BluerLink {
    pub async fn new() -> Result<Self, LinkError> {
        let session = Session::new().await?;
        let adapter = session.default_adapter().await?;
        adapter.set_powered(true).await?;
        debug!(adapter = adapter.name(), "bluer adapter ready");
        Ok(Self {
            _session: session,
            adapter,
        })
    }
}

/// Snapshot of what BlueZ currently knows about `address`.
async fn device_info(adapter: &Adapter, address: Address) -> Result<ScannedDeviceInfo, LinkError> {
    let device = adapter.device(address)?;
    let mut info = ScannedDeviceInfo::new(address.into());
    info.name = device.name().await?;
    info.rssi = device.rssi().await?.unwrap_or_default();
    if let Some(uuids) = device.uuids().await? {
        info.service_uuids = uuids.into_iter().collect();
        info.service_uuids.sort();
    }
    if let Some(data) = device.manufacturer_data().await? {
        info.manufacturer_data = data.into_iter().collect();
    }
    if let Some(data) = device.service_data().await? {
        info.service_data = data.into_iter().collect();
    }
    Ok(info)
}

impl AdvertisementSource for BluerLink {
    fn scan(&self, filter: ScanFilter) -> LinkFuture<'_, mpsc::Receiver<ScannedDeviceInfo>> {
        Box::pin(async move {
            let mut discovery_filter = DiscoveryFilter::default();
            discovery_filter.transport = DiscoveryTransport::Le;
            discovery_filter.duplicate_data = true;
            self.adapter.set_discovery_filter(discovery_filter).await?;
            let mut discovery = Box::pin(self.adapter.discover_devices_with_changes().await?);
            let adapter = self.adapter.clone();
            let (tx, rx) = mpsc::channel(ADVERTISEMENT_CHANNEL_BUFFER_SIZE);

            // The task owns the discovery stream; dropping it ends the scan.
            tokio::spawn(async move {
                while let Some(event) = discovery.next().await {
                    let AdapterEvent::DeviceAdded(address) = event else {
                        continue;
                    };
                    if filter.address.is_some_and(|a| a != MacAddress::from(address)) {
                        continue;
                    }
                    match device_info(&adapter, address).await {
                        Ok(info) => {
                            if tx.send(info).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => debug!(%address, error = %e, "device properties unavailable"),
                    }
                }
                debug!("discovery stopped");
            });
            Ok(rx)
        })
    }
}

impl GattLink for BluerLink {
    fn find(&self, address: MacAddress, timeout: Duration) -> LinkFuture<'_, ScannedDeviceInfo> {
        Box::pin(async move {
            let mut results = self.scan(ScanFilter::address(address)).await?;
            match tokio::time::timeout(timeout, results.recv()).await {
                Ok(Some(info)) => Ok(info),
                Ok(None) => Err(LinkError::Closed),
                Err(_) => Err(LinkError::NotFound(address)),
            }
        })
    }

    fn connect(&self, address: MacAddress) -> LinkFuture<'_, GattSession> {
        Box::pin(async move {
            let device = self.adapter.device(address.into())?;
            if !device.is_connected().await? {
                device.connect().await?;
            }

            let mut characteristics = HashMap::new();
            for service in device.services().await? {
                let service_uuid = service.uuid().await?;
                for characteristic in service.characteristics().await? {
                    characteristics.insert((service_uuid, characteristic.uuid().await?), characteristic);
                }
            }
            debug!(%address, count = characteristics.len(), "GATT services resolved");

            let (tx, rx) = mpsc::channel(GATT_EVENT_CHANNEL_BUFFER_SIZE);
            let mut device_events = Box::pin(device.events().await?);
            let watcher_tx = tx.clone();
            tokio::spawn(async move {
                while let Some(event) = device_events.next().await {
                    if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
                        let _ = watcher_tx.send(GattEvent::Disconnected(None)).await;
                        break;
                    }
                }
            });

            let name = device.name().await.ok().flatten();
            let connection = BluerGattConnection {
                device,
                name,
                characteristics,
                events: tx,
            };
            Ok(GattSession {
                connection: Arc::new(connection),
                events: rx,
            })
        })
    }
}

struct BluerGattConnection {
    device: Device,
    name: Option<String>,
    characteristics: HashMap<(Uuid, Uuid), Characteristic>,
    events: mpsc::Sender<GattEvent>,
}

impl BluerGattConnection {
    fn characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<&Characteristic, LinkError> {
        self.characteristics
            .get(&(service, characteristic))
            .ok_or(LinkError::MissingCharacteristic {
                service,
                characteristic,
            })
    }
}

impl GattConnection for BluerGattConnection {
    fn device_name(&self) -> Option<String> {
        self.name.clone()
    }

    fn has_characteristic(&self, service: Uuid, characteristic: Uuid) -> bool {
        self.characteristics.contains_key(&(service, characteristic))
    }

    fn set_notify(&self, service: Uuid, characteristic: Uuid) -> LinkFuture<'_, ()> {
        Box::pin(async move {
            let chr = self.characteristic(service, characteristic)?;
            let notifications = chr.notify().await?;
            let tx = self.events.clone();
            tokio::spawn(async move {
                let mut notifications = Box::pin(notifications);
                while let Some(value) = notifications.next().await {
                    let event = GattEvent::Notification {
                        characteristic,
                        value,
                    };
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                debug!(%characteristic, "notification stream ended");
            });
            Ok(())
        })
    }

    fn write(
        &self,
        service: Uuid,
        characteristic: Uuid,
        payload: Vec<u8>,
        with_response: bool,
    ) -> LinkFuture<'_, ()> {
        Box::pin(async move {
            let chr = self.characteristic(service, characteristic)?;
            if with_response {
                chr.write(&payload).await?;
            } else {
                let mut request = CharacteristicWriteRequest::default();
                request.op_type = WriteOp::Command;
                chr.write_ext(&payload, &request).await?;
            }
            Ok(())
        })
    }

    fn read(&self, service: Uuid, characteristic: Uuid) -> LinkFuture<'_, Vec<u8>> {
        Box::pin(async move { Ok(self.characteristic(service, characteristic)?.read().await?) })
    }

    fn disconnect(&self) -> LinkFuture<'_, ()> {
        Box::pin(async move {
            if let Err(e) = self.device.disconnect().await {
                warn!(address = %self.device.address(), error = %e, "disconnect failed");
            }
            let _ = self.events.send(GattEvent::Disconnected(None)).await;
            Ok(())
        })
    }
}

impl SppLink for BluerLink {
    fn connect(&self, address: MacAddress) -> LinkFuture<'_, Box<dyn SppStream>> {
        Box::pin(async move {
            let target = bluer::rfcomm::SocketAddr::new(address.into(), SPP_RFCOMM_CHANNEL);
            let stream = bluer::rfcomm::Stream::connect(target).await?;
            debug!(%address, channel = SPP_RFCOMM_CHANNEL, "RFCOMM connected");
            Ok(Box::new(stream) as Box<dyn SppStream>)
        })
    }
}
