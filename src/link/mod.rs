//! Physical Bluetooth links.
//!
//! Three narrow traits sit between the adapters and the radio: an
//! [`AdvertisementSource`] for scanning, a [`GattLink`] for connection-oriented
//! scales and an [`SppLink`] for classic serial streams. Backends implement
//! whichever of them they can; tests substitute fakes.

#[cfg(feature = "bluer")]
pub mod bluer;

#[cfg(feature = "hci")]
pub mod hci;

use crate::advertisement::ScannedDeviceInfo;
use crate::mac_address::MacAddress;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Channel buffer size for scan results.
pub const ADVERTISEMENT_CHANNEL_BUFFER_SIZE: usize = 100;

/// Channel buffer size for notifications of one GATT connection.
pub const GATT_EVENT_CHANNEL_BUFFER_SIZE: usize = 64;

/// Error type for link operations.
#[derive(Error, Debug)]
pub enum LinkError {
    /// Bluetooth/adapter related error
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("device {0} not found")]
    NotFound(MacAddress),
    #[error("characteristic {characteristic} of service {service} not found")]
    MissingCharacteristic { service: Uuid, characteristic: Uuid },
    #[error("link closed")]
    Closed,
    /// Backend not available (not compiled in, or no support for this link type)
    #[error("Backend '{0}' not available")]
    BackendNotAvailable(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type LinkFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, LinkError>> + Send + 'a>>;

/// Available link backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// BlueZ D-Bus backend (requires bluetoothd daemon)
    #[cfg(feature = "bluer")]
    Bluer,
    /// Raw HCI socket backend, advertisements only (no daemon required)
    #[cfg(feature = "hci")]
    Hci,
}

impl Default for Backend {
    fn default() -> Self {
        #[cfg(feature = "bluer")]
        return Backend::Bluer;
        #[cfg(all(feature = "hci", not(feature = "bluer")))]
        return Backend::Hci;
        #[cfg(not(any(feature = "bluer", feature = "hci")))]
        compile_error!("At least one backend feature must be enabled");
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(feature = "bluer")]
            Backend::Bluer => write!(f, "bluer"),
            #[cfg(feature = "hci")]
            Backend::Hci => write!(f, "hci"),
            #[cfg(not(any(feature = "bluer", feature = "hci")))]
            _ => unreachable!("Backend enum has no variants when no backend features are enabled"),
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            #[cfg(feature = "bluer")]
            "bluer" | "bluez" => Ok(Backend::Bluer),
            #[cfg(feature = "hci")]
            "hci" | "raw" => Ok(Backend::Hci),
            _ => Err(format!("Unknown backend: {}", s)),
        }
    }
}

/// Restricts what a scan reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanFilter {
    pub address: Option<MacAddress>,
}

impl ScanFilter {
    pub fn address(address: MacAddress) -> Self {
        Self {
            address: Some(address),
        }
    }

    pub fn accepts(&self, device: &ScannedDeviceInfo) -> bool {
        self.address.is_none_or(|a| a == device.address)
    }
}

pub trait AdvertisementSource: Send + Sync {
    /// Start scanning. Every received advertisement is sent as a fresh snapshot
    /// of the device; the scan stops when the receiver is dropped.
    fn scan(&self, filter: ScanFilter) -> LinkFuture<'_, mpsc::Receiver<ScannedDeviceInfo>>;
}

/// Something the connected peer did.
#[derive(Debug, Clone, PartialEq)]
pub enum GattEvent {
    Notification { characteristic: Uuid, value: Vec<u8> },
    /// The peer (or the stack) dropped the link.
    Disconnected(Option<String>),
}

/// An open GATT connection with discovered services.
pub trait GattConnection: Send + Sync {
    fn device_name(&self) -> Option<String>;

    fn has_characteristic(&self, service: Uuid, characteristic: Uuid) -> bool;

    /// Subscribe; values arrive as [`GattEvent::Notification`].
    fn set_notify(&self, service: Uuid, characteristic: Uuid) -> LinkFuture<'_, ()>;

    fn write(
        &self,
        service: Uuid,
        characteristic: Uuid,
        payload: Vec<u8>,
        with_response: bool,
    ) -> LinkFuture<'_, ()>;

    fn read(&self, service: Uuid, characteristic: Uuid) -> LinkFuture<'_, Vec<u8>>;

    fn disconnect(&self) -> LinkFuture<'_, ()>;
}

pub struct GattSession {
    pub connection: Arc<dyn GattConnection>,
    pub events: mpsc::Receiver<GattEvent>,
}

pub trait GattLink: Send + Sync {
    /// Scan until `address` is seen or `timeout` passes.
    fn find(&self, address: MacAddress, timeout: Duration) -> LinkFuture<'_, ScannedDeviceInfo>;

    fn connect(&self, address: MacAddress) -> LinkFuture<'_, GattSession>;
}

/// Byte stream of a classic serial port profile connection.
pub trait SppStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> SppStream for T {}

pub trait SppLink: Send + Sync {
    fn connect(&self, address: MacAddress) -> LinkFuture<'_, Box<dyn SppStream>>;
}

/// Stand-in for link types a backend cannot provide.
#[derive(Debug, Clone)]
pub struct Unavailable(pub &'static str);

impl GattLink for Unavailable {
    fn find(&self, _address: MacAddress, _timeout: Duration) -> LinkFuture<'_, ScannedDeviceInfo> {
        Box::pin(async move { Err(LinkError::BackendNotAvailable(self.0.to_string())) })
    }

    fn connect(&self, _address: MacAddress) -> LinkFuture<'_, GattSession> {
        Box::pin(async move { Err(LinkError::BackendNotAvailable(self.0.to_string())) })
    }
}

impl SppLink for Unavailable {
    fn connect(&self, _address: MacAddress) -> LinkFuture<'_, Box<dyn SppStream>> {
        Box::pin(async move { Err(LinkError::BackendNotAvailable(self.0.to_string())) })
    }
}

/// The links one backend provides.
#[derive(Clone)]
pub struct Links {
    pub advertisements: Arc<dyn AdvertisementSource>,
    pub gatt: Arc<dyn GattLink>,
    pub spp: Arc<dyn SppLink>,
}

/// Open the links of `backend`.
pub async fn open(backend: Backend) -> Result<Links, LinkError> {
    match backend {
        #[cfg(feature = "bluer")]
        Backend::Bluer => {
            let link = Arc::new(bluer::BluerLink::new().await?);
            Ok(Links {
                advertisements: link.clone(),
                gatt: link.clone(),
                spp: link,
            })
        }
        #[cfg(feature = "hci")]
        Backend::Hci => {
            let unavailable = Arc::new(Unavailable("hci"));
            Ok(Links {
                advertisements: Arc::new(hci::HciScanner::new(0)),
                gatt: unavailable.clone(),
                spp: unavailable,
            })
        }
    }
}
