//! Picks the adapter for a scanned device.
//!
//! The modern handlers are asked in registry order and the first one that
//! recognizes the device wins. Its link mode decides the adapter, its default
//! tuning applies unless a profile was saved in the store. Devices no handler
//! knows may still have a legacy driver, looked up by the handler hint or the
//! advertised name.

use crate::advertisement::ScannedDeviceInfo;
use crate::driver::yunmai::{YunmaiDriver, YunmaiVariant};
use crate::handler::{DeviceSupport, LinkMode, ScaleDeviceHandler, registry};
use crate::link::Links;
use crate::settings::lookup_tuning;
use crate::transport::broadcast::BroadcastAdapter;
use crate::transport::gatt::GattAdapter;
use crate::transport::legacy::LegacyScaleAdapter;
use crate::transport::spp::SppAdapter;
use crate::transport::{AdapterEnv, Communicator};
use crate::tuning::TuningProfile;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// What the factory settled on for a device.
pub enum Resolution {
    Modern {
        handler: Box<dyn ScaleDeviceHandler>,
        support: DeviceSupport,
        tuning: TuningProfile,
    },
    Legacy(YunmaiVariant),
}

impl fmt::Debug for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Modern {
                handler,
                support,
                tuning,
            } => f
                .debug_struct("Modern")
                .field("handler", &handler.name())
                .field("support", support)
                .field("tuning", tuning)
                .finish(),
            Resolution::Legacy(variant) => f.debug_tuple("Legacy").field(variant).finish(),
        }
    }
}

/// Name of the first handler that recognizes `device`, with what it declared.
pub fn first_match(device: &ScannedDeviceInfo) -> Option<(Box<dyn ScaleDeviceHandler>, DeviceSupport)> {
    registry::handlers().into_iter().find_map(|handler| {
        let support = handler.support_for(device)?;
        Some((handler, support))
    })
}

/// Legacy driver for a device name, by prefix.
pub fn legacy_driver_for(device: &ScannedDeviceInfo) -> Option<YunmaiVariant> {
    device
        .handler_hint
        .as_deref()
        .and_then(YunmaiVariant::for_name)
        .or_else(|| device.name.as_deref().and_then(YunmaiVariant::for_name))
}

pub struct ScaleFactory {
    links: Links,
    env: AdapterEnv,
}

impl ScaleFactory {
    pub fn new(links: Links, env: AdapterEnv) -> Self {
        Self { links, env }
    }

    /// Which handler (or legacy driver) would serve `device`, and with which tuning.
    pub async fn resolve(&self, device: &ScannedDeviceInfo) -> Option<Resolution> {
        if let Some((handler, support)) = first_match(device) {
            let tuning = lookup_tuning(self.env.store.as_ref(), support.tuning_profile).await;
            debug!(
                address = %device.address,
                handler = handler.name(),
                mode = ?support.link_mode,
                %tuning,
                "modern handler matched"
            );
            return Some(Resolution::Modern {
                handler,
                support,
                tuning,
            });
        }
        let variant = legacy_driver_for(device)?;
        debug!(address = %device.address, ?variant, "legacy driver matched");
        Some(Resolution::Legacy(variant))
    }

    /// A ready adapter for `device`, or `None` when nothing supports it.
    pub async fn create_communicator(&self, device: &ScannedDeviceInfo) -> Option<Box<dyn Communicator>> {
        let Some(resolution) = self.resolve(device).await else {
            info!(address = %device.address, name = device.name_or_empty(), "no handler for device");
            return None;
        };
        let env = self.env.clone();
        let communicator: Box<dyn Communicator> = match resolution {
            Resolution::Modern {
                handler,
                support,
                tuning,
            } => {
                info!(
                    address = %device.address,
                    device = %support.display_name,
                    handler = handler.name(),
                    %tuning,
                    "using modern handler"
                );
                match support.link_mode {
                    LinkMode::ConnectGatt => Box::new(GattAdapter::new(
                        handler,
                        self.links.gatt.clone(),
                        tuning.for_gatt(),
                        env,
                    )),
                    LinkMode::BroadcastOnly => Box::new(BroadcastAdapter::new(
                        handler,
                        self.links.advertisements.clone(),
                        tuning.for_broadcast(),
                        env,
                    )),
                    LinkMode::ClassicSpp => Box::new(SppAdapter::new(
                        handler,
                        self.links.spp.clone(),
                        tuning.for_spp(),
                        env,
                    )),
                }
            }
            Resolution::Legacy(variant) => {
                info!(address = %device.address, driver = variant.driver_name(), "using legacy driver");
                let driver = Arc::new(YunmaiDriver::new(variant, self.links.gatt.clone()));
                Box::new(LegacyScaleAdapter::new(driver, env))
            }
        };
        Some(communicator)
    }
}
