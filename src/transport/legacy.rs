//! Adapter for status-code drivers.
//!
//! The driver owns its link. This adapter hands it the user context, registers
//! a status channel and translates each [`LegacyStatus`] into a
//! [`BluetoothEvent`]. A terminal status ends the session and unregisters the
//! channel.

use super::{AdapterCore, AdapterEnv, Communicator, SessionTicket};
use crate::driver::{LegacyScaleDriver, LegacyStatus};
use crate::event::{BluetoothEvent, EventStream, InteractionFeedback, InteractionKind};
use crate::mac_address::MacAddress;
use crate::settings::{DRIVER_SETTINGS_READ_TIMEOUT, PreferenceStore};
use crate::user::ScaleUser;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Store key of the per-installation base the drivers derive scale user ids from.
pub const UNIQUE_NUMBER_KEY: &str = "unique_number_base";

const UNIQUE_NUMBER_MIN: i32 = 100;
const UNIQUE_NUMBER_MAX: i32 = 65535;

/// The saved base, or a fresh one that gets saved. Zero counts as unset.
pub async fn unique_number_base(store: &dyn PreferenceStore) -> i32 {
    let saved = match tokio::time::timeout(DRIVER_SETTINGS_READ_TIMEOUT, store.get(UNIQUE_NUMBER_KEY)).await {
        Ok(Ok(value)) => value.and_then(|v| v.as_i64()).and_then(|v| i32::try_from(v).ok()),
        Ok(Err(e)) => {
            warn!(error = %e, "unique number base unavailable");
            None
        }
        Err(_) => {
            warn!("unique number base read timed out");
            None
        }
    };
    if let Some(base) = saved.filter(|b| *b != 0) {
        debug!(base, "loaded unique number base");
        return base;
    }

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or_default();
    let span = (UNIQUE_NUMBER_MAX - UNIQUE_NUMBER_MIN) as u32;
    let base = UNIQUE_NUMBER_MIN + (nanos % span) as i32;
    if let Err(e) = store.put(UNIQUE_NUMBER_KEY, Value::from(base)).await {
        warn!(error = %e, "could not save unique number base");
    }
    info!(base, "generated unique number base");
    base
}

fn with_info(what: &str, info: Option<String>) -> String {
    match info.filter(|i| !i.is_empty()) {
        Some(info) => format!("{what} - {info}"),
        None => what.to_string(),
    }
}

struct Shared {
    core: AdapterCore,
    driver: Arc<dyn LegacyScaleDriver>,
    env: AdapterEnv,
}

impl Shared {
    /// Selected user, user list, unique number and the user's last reading.
    async fn provide_user_data(&self, user: &ScaleUser) {
        let driver = &self.driver;
        driver.set_selected_user(user.clone());
        let users = self.env.users.users();
        debug!(driver = driver.driver_name(), users = users.len(), "providing users");
        driver.set_user_list(users);
        driver.set_unique_number(unique_number_base(self.env.store.as_ref()).await);
        let last = if user.id == -1 {
            None
        } else {
            self.env.users.last_measurement_for(user.id)
        };
        driver.set_cached_last_measurement(last);
    }

    async fn run(self: Arc<Self>, ticket: SessionTicket, user: ScaleUser) {
        let address = ticket.address;
        self.provide_user_data(&user).await;

        let (tx, mut statuses) = mpsc::unbounded_channel();
        self.driver.register_callback(Some(tx));
        if let Err(e) = self.driver.connect(address) {
            error!(%address, driver = self.driver.driver_name(), error = %e, "driver connect failed");
            self.end(
                &ticket,
                BluetoothEvent::ConnectionFailed {
                    address,
                    error: format!("{} could not connect: {e}", self.driver.driver_name()),
                },
            );
            return;
        }

        loop {
            let Some(status) = statuses.recv().await else {
                self.end(
                    &ticket,
                    BluetoothEvent::Disconnected {
                        address,
                        reason: Some("driver stopped reporting".into()),
                    },
                );
                return;
            };
            debug!(%address, ?status, "driver status");
            if let Some(terminal) = self.translate(&ticket, status) {
                self.end(&ticket, terminal);
                return;
            }
        }
    }

    /// Emit what a non-terminal status means; hand back the event of a terminal one.
    fn translate(&self, ticket: &SessionTicket, status: LegacyStatus) -> Option<BluetoothEvent> {
        let address = ticket.address;
        let message = |text: String| BluetoothEvent::message(text, address);
        match status {
            LegacyStatus::RetrieveScaleData(Some(measurement)) => {
                info!(%address, weight = measurement.weight, "measurement from driver");
                self.core.emit(BluetoothEvent::MeasurementReceived {
                    measurement,
                    address,
                });
            }
            LegacyStatus::RetrieveScaleData(None) => {
                warn!(%address, "driver delivered something that is not a measurement");
                self.core.emit(message("Unexpected data from the scale driver".into()));
            }
            LegacyStatus::InitProcess(text) => {
                self.core
                    .emit(message(text.unwrap_or_else(|| "Initializing".into())));
            }
            LegacyStatus::ConnectionRetrying => {
                self.core.emit(message("reconnecting".into()));
            }
            LegacyStatus::ConnectionEstablished => {
                info!(%address, driver = self.driver.driver_name(), "connected");
                self.core.mark_connected(ticket);
                self.core.emit(BluetoothEvent::Connected {
                    name: self.driver.driver_name().to_string(),
                    address,
                });
            }
            LegacyStatus::ConnectionDisconnect(info) => {
                return Some(BluetoothEvent::Disconnected {
                    address,
                    reason: Some(with_info("disconnected", info)),
                });
            }
            LegacyStatus::ConnectionLost(info) => {
                return Some(BluetoothEvent::Disconnected {
                    address,
                    reason: Some(with_info("connection lost", info)),
                });
            }
            LegacyStatus::NoDeviceFound(info) => {
                warn!(%address, "scale not found");
                return Some(BluetoothEvent::ConnectionFailed {
                    address,
                    error: with_info("device not found", info),
                });
            }
            LegacyStatus::UnexpectedError(info) => {
                error!(%address, "driver reported an unexpected error");
                return Some(BluetoothEvent::ConnectionFailed {
                    address,
                    error: with_info("unexpected error", info),
                });
            }
            LegacyStatus::ScaleMessage(text) => self.core.emit(message(text)),
            LegacyStatus::UserInteractionRequired {
                kind: Some(kind),
                data,
            } => {
                self.core.emit(BluetoothEvent::UserInteractionRequired {
                    address,
                    kind,
                    data,
                });
            }
            LegacyStatus::UserInteractionRequired { kind: None, .. } => {
                warn!(%address, "interaction request without a usable kind");
                self.core
                    .emit(message("Invalid user interaction request from the scale driver".into()));
            }
            LegacyStatus::Unknown(code) => {
                warn!(%address, code, "unknown driver status");
                self.core.emit(message(format!("Unknown driver status {code}")));
            }
        }
        None
    }

    fn end(&self, ticket: &SessionTicket, event: BluetoothEvent) {
        self.driver.register_callback(None);
        self.core.finish(ticket, event);
    }
}

pub struct LegacyScaleAdapter {
    shared: Arc<Shared>,
}

impl LegacyScaleAdapter {
    pub fn new(driver: Arc<dyn LegacyScaleDriver>, env: AdapterEnv) -> Self {
        let name = driver.driver_name().to_string();
        Self {
            shared: Arc::new(Shared {
                core: AdapterCore::new(name, Duration::ZERO),
                driver,
                env,
            }),
        }
    }
}

impl Communicator for LegacyScaleAdapter {
    fn name(&self) -> &str {
        self.shared.core.name()
    }

    fn connect(&self, address: MacAddress, user: Option<ScaleUser>) {
        let core = &self.shared.core;
        let Some(user) = user else {
            core.emit(BluetoothEvent::ConnectionFailed {
                address,
                error: "no user selected".into(),
            });
            return;
        };
        let Some(ticket) = core.begin(address) else {
            return;
        };
        let task = tokio::spawn(self.shared.clone().run(ticket.clone(), user));
        core.track(&ticket, task);
    }

    fn disconnect(&self) {
        if self.shared.core.active_address().is_none() {
            debug!(driver = self.name(), "disconnect while idle");
            return;
        }
        // the driver answers with a disconnect status that ends the session
        self.shared.driver.disconnect();
    }

    fn request_measurement(&self) {
        let core = &self.shared.core;
        match core.active_address() {
            Some(address) if core.is_connected() => core.emit(BluetoothEvent::message(
                "The scale sends its measurement automatically",
                address,
            )),
            Some(address) => core.emit(BluetoothEvent::message("Not connected", address)),
            None => warn!(driver = self.name(), "measurement requested without a session"),
        }
    }

    fn events(&self) -> EventStream {
        self.shared.core.events()
    }

    fn connecting(&self) -> watch::Receiver<bool> {
        self.shared.core.connecting()
    }

    fn connected(&self) -> watch::Receiver<bool> {
        self.shared.core.connected()
    }

    fn provide_user_interaction_feedback(
        &self,
        kind: InteractionKind,
        app_user_id: i32,
        feedback: InteractionFeedback,
    ) {
        let core = &self.shared.core;
        let result = self
            .shared
            .driver
            .process_user_interaction_feedback(kind, app_user_id, &feedback);
        if let Err(e) = result {
            error!(driver = self.name(), %kind, error = %e, "delivering user feedback failed");
            if let Some(address) = core.active_address() {
                core.emit(BluetoothEvent::message(
                    format!("Delivering user feedback failed: {e}"),
                    address,
                ));
            }
        }
    }

    fn release(&self) {
        let shared = &self.shared;
        shared.driver.register_callback(None);
        if shared.core.active_address().is_some() {
            shared.driver.disconnect();
        }
        shared.core.release();
    }
}
