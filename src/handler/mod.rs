//! Vendor protocol handlers.
//!
//! A handler knows one family of scales: how to recognize it from a scan
//! ([`ScaleDeviceHandler::support_for`]) and how to talk to it once an adapter has
//! opened the link. Handlers never touch the radio directly. They queue I/O
//! through the [`Transport`] in their [`HandlerContext`] and report results
//! through its [`Callbacks`]; the adapter serializes and paces everything.

pub mod aaax;
pub mod ihealth_hs3;
pub mod mi_scale;
pub mod one_byone;
pub mod qn;
pub mod registry;
pub mod s400;
pub mod soehnle;
pub mod standard_weight;
pub mod trisa;
pub mod yoda;

use crate::advertisement::ScannedDeviceInfo;
use crate::event::{InteractionData, InteractionFeedback, InteractionKind};
use crate::measurement::ScaleMeasurement;
use crate::settings::{DriverSettings, SettingsError};
use crate::tuning::TuningProfile;
use crate::user::ScaleUser;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Errors raised by handler code while talking to a scale.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("frame too short: expected {expected} bytes, got {actual}")]
    ShortFrame { expected: usize, actual: usize },
    #[error("checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    Checksum { expected: u8, actual: u8 },
    #[error("unexpected frame: {0}")]
    Unexpected(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Settings(#[from] SettingsError),
}

impl HandlerError {
    /// Fail with [`HandlerError::ShortFrame`] unless `data` holds at least `expected` bytes.
    pub fn require_len(data: &[u8], expected: usize) -> Result<(), HandlerError> {
        if data.len() < expected {
            Err(HandlerError::ShortFrame {
                expected,
                actual: data.len(),
            })
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceCapability {
    BodyComposition,
    TimeSync,
    UserSync,
    HistoryRead,
    LiveWeightStream,
    UnitConfig,
    BatteryLevel,
}

/// How the scale exchanges data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkMode {
    #[default]
    ConnectGatt,
    BroadcastOnly,
    ClassicSpp,
}

impl fmt::Display for LinkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkMode::ConnectGatt => write!(f, "gatt"),
            LinkMode::BroadcastOnly => write!(f, "broadcast"),
            LinkMode::ClassicSpp => write!(f, "spp"),
        }
    }
}

/// What a handler declares about a device it recognized.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSupport {
    pub display_name: String,
    /// Features the device offers.
    pub capabilities: Vec<DeviceCapability>,
    /// Features this handler implements, a subset of `capabilities`.
    pub implemented: Vec<DeviceCapability>,
    pub tuning_profile: TuningProfile,
    pub link_mode: LinkMode,
}

impl DeviceSupport {
    pub fn new(display_name: impl Into<String>, link_mode: LinkMode) -> Self {
        Self {
            display_name: display_name.into(),
            capabilities: Vec::new(),
            implemented: Vec::new(),
            tuning_profile: TuningProfile::Balanced,
            link_mode,
        }
    }

    pub fn capabilities(mut self, capabilities: &[DeviceCapability]) -> Self {
        self.capabilities = capabilities.to_vec();
        self
    }

    pub fn implemented(mut self, implemented: &[DeviceCapability]) -> Self {
        self.implemented = implemented.to_vec();
        self
    }

    pub fn tuning(mut self, profile: TuningProfile) -> Self {
        self.tuning_profile = profile;
        self
    }
}

/// How a broadcast handler used an advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastAction {
    /// Not relevant, keep scanning quietly.
    Ignored,
    /// Processed, but the reading is not final yet.
    ConsumedKeepScanning,
    /// Final reading processed, the session is over.
    ConsumedStop,
}

/// I/O surface the adapter provides. Calls queue work and return immediately.
pub trait Transport: Send + Sync {
    fn set_notify_on(&self, service: Uuid, characteristic: Uuid);
    fn write(&self, service: Uuid, characteristic: Uuid, payload: &[u8], with_response: bool);
    fn read(&self, service: Uuid, characteristic: Uuid);
    fn disconnect(&self);
    fn has_characteristic(&self, service: Uuid, characteristic: Uuid) -> bool;
}

/// Transport for links without characteristics (broadcast listening).
pub struct NoopTransport;

impl Transport for NoopTransport {
    fn set_notify_on(&self, _service: Uuid, _characteristic: Uuid) {}
    fn write(&self, _service: Uuid, _characteristic: Uuid, _payload: &[u8], _with_response: bool) {}
    fn read(&self, _service: Uuid, _characteristic: Uuid) {}
    fn disconnect(&self) {}
    fn has_characteristic(&self, _service: Uuid, _characteristic: Uuid) -> bool {
        false
    }
}

/// Where handler output goes.
pub trait Callbacks: Send + Sync {
    fn publish(&self, measurement: ScaleMeasurement);
    fn info(&self, message: String);
    fn warn(&self, message: String);
    /// A problem worth telling the user about. The session goes on.
    fn error(&self, message: String);
    /// A handler entry point failed.
    fn failure(&self, message: String);
    fn user_interaction_required(&self, kind: InteractionKind, data: InteractionData);
}

/// Application-side knowledge about users, provided to the adapters.
pub trait UserDirectory: Send + Sync {
    fn users(&self) -> Vec<ScaleUser>;
    fn last_measurement_for(&self, user_id: i32) -> Option<ScaleMeasurement>;
}

/// Fixed set of users, for the CLI and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticUsers {
    users: Vec<ScaleUser>,
    last: HashMap<i32, ScaleMeasurement>,
}

impl StaticUsers {
    pub fn new(users: Vec<ScaleUser>) -> Self {
        Self {
            users,
            last: HashMap::new(),
        }
    }

    pub fn with_last_measurement(mut self, user_id: i32, measurement: ScaleMeasurement) -> Self {
        self.last.insert(user_id, measurement);
        self
    }
}

impl UserDirectory for StaticUsers {
    fn users(&self) -> Vec<ScaleUser> {
        self.users.clone()
    }

    fn last_measurement_for(&self, user_id: i32) -> Option<ScaleMeasurement> {
        self.last.get(&user_id).cloned()
    }
}

/// Per-session view of the users: the selected one plus the directory.
#[derive(Clone)]
pub struct SessionData {
    user: Option<ScaleUser>,
    directory: Arc<dyn UserDirectory>,
}

impl SessionData {
    pub fn new(user: Option<ScaleUser>, directory: Arc<dyn UserDirectory>) -> Self {
        Self { user, directory }
    }

    pub fn current_user(&self) -> Option<&ScaleUser> {
        self.user.as_ref()
    }

    pub fn users_for_device(&self) -> Vec<ScaleUser> {
        self.directory.users()
    }

    pub fn last_measurement_for(&self, user_id: i32) -> Option<ScaleMeasurement> {
        self.directory.last_measurement_for(user_id)
    }
}

/// Everything a handler may use while attached to a link.
pub struct HandlerContext {
    pub transport: Arc<dyn Transport>,
    pub callbacks: Arc<dyn Callbacks>,
    pub settings: DriverSettings,
    pub data: SessionData,
}

impl HandlerContext {
    pub fn set_notify_on(&self, service: Uuid, characteristic: Uuid) {
        self.transport.set_notify_on(service, characteristic);
    }

    pub fn write(&self, service: Uuid, characteristic: Uuid, payload: &[u8]) {
        self.transport.write(service, characteristic, payload, true);
    }

    pub fn write_without_response(&self, service: Uuid, characteristic: Uuid, payload: &[u8]) {
        self.transport.write(service, characteristic, payload, false);
    }

    pub fn read(&self, service: Uuid, characteristic: Uuid) {
        self.transport.read(service, characteristic);
    }

    pub fn has_characteristic(&self, service: Uuid, characteristic: Uuid) -> bool {
        let found = self.transport.has_characteristic(service, characteristic);
        if !found {
            debug!(%service, %characteristic, "characteristic not present");
        }
        found
    }

    pub fn request_disconnect(&self) {
        debug!("requesting disconnect");
        self.transport.disconnect();
    }

    pub fn publish(&self, measurement: ScaleMeasurement) {
        info!(weight = measurement.weight, "publishing measurement");
        self.callbacks.publish(measurement);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.callbacks.info(message.into());
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.callbacks.warn(message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.callbacks.error(message.into());
    }

    pub fn request_user_interaction(&self, kind: InteractionKind, data: InteractionData) {
        self.callbacks.user_interaction_required(kind, data);
    }
}

/// A vendor protocol.
///
/// Everything except `name` and `support_for` has a do-nothing default, so
/// broadcast handlers only implement `on_advertisement` and GATT handlers
/// leave it alone.
pub trait ScaleDeviceHandler: Send {
    /// Stable identifier, also the driver settings namespace.
    fn name(&self) -> &'static str;

    fn support_for(&self, device: &ScannedDeviceInfo) -> Option<DeviceSupport>;

    /// Forget everything learned on a previous link. Runs on every attach, so
    /// each session starts from the state `new()` would give.
    fn reset(&mut self);

    /// The link is ready for I/O.
    fn on_connected(&mut self, _ctx: &HandlerContext, _user: &ScaleUser) -> Result<(), HandlerError> {
        Ok(())
    }

    fn on_notification(
        &mut self,
        _ctx: &HandlerContext,
        _characteristic: Uuid,
        _data: &[u8],
        _user: &ScaleUser,
    ) -> Result<(), HandlerError> {
        Ok(())
    }

    fn on_disconnected(&mut self, _ctx: &HandlerContext) {}

    fn on_advertisement(
        &mut self,
        _ctx: &HandlerContext,
        _device: &ScannedDeviceInfo,
        _user: &ScaleUser,
    ) -> BroadcastAction {
        BroadcastAction::Ignored
    }

    fn on_user_interaction_feedback(
        &mut self,
        _ctx: &HandlerContext,
        _kind: InteractionKind,
        _app_user_id: i32,
        _feedback: &InteractionFeedback,
    ) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// A handler plus the context of the link it is currently attached to.
///
/// Entry points log, pull the selected user out of the context, and turn handler
/// errors into [`Callbacks::failure`] so a bad frame never ends the session.
pub struct HandlerSession {
    handler: Box<dyn ScaleDeviceHandler>,
    ctx: Option<HandlerContext>,
}

impl HandlerSession {
    pub fn new(handler: Box<dyn ScaleDeviceHandler>) -> Self {
        Self { handler, ctx: None }
    }

    pub fn name(&self) -> &'static str {
        self.handler.name()
    }

    pub fn support_for(&self, device: &ScannedDeviceInfo) -> Option<DeviceSupport> {
        self.handler.support_for(device)
    }

    pub fn is_attached(&self) -> bool {
        self.ctx.is_some()
    }

    pub fn attach(&mut self, ctx: HandlerContext) {
        debug!(handler = self.name(), "attach");
        self.handler.reset();
        self.ctx = Some(ctx);
    }

    /// Drop the link context and hand it back, so its settings can be flushed.
    pub fn detach(&mut self) -> Option<HandlerContext> {
        debug!(handler = self.name(), "detach");
        self.ctx.take()
    }

    pub fn handle_connected(&mut self, user: &ScaleUser) {
        let Some(ctx) = self.ctx.as_ref() else {
            warn!(handler = self.handler.name(), "handleConnected without context");
            return;
        };
        debug!(
            handler = self.handler.name(),
            user_id = user.id,
            height = user.body_height,
            age = user.age(),
            "handleConnected"
        );
        if let Err(e) = self.handler.on_connected(ctx, user) {
            error!(handler = self.handler.name(), error = %e, "onConnected failed");
            ctx.callbacks.failure(format!("connect handling failed: {e}"));
        }
    }

    pub fn handle_notification(&mut self, characteristic: Uuid, data: &[u8]) {
        let Some(ctx) = self.ctx.as_ref() else {
            return;
        };
        let Some(user) = ctx.data.current_user().cloned() else {
            debug!(handler = self.handler.name(), "notification without selected user dropped");
            return;
        };
        if let Err(e) = self.handler.on_notification(ctx, characteristic, data, &user) {
            error!(handler = self.handler.name(), %characteristic, error = %e, "onNotification failed");
            ctx.callbacks
                .failure(format!("could not parse data from {characteristic}: {e}"));
        }
    }

    pub fn handle_advertisement(&mut self, device: &ScannedDeviceInfo) -> BroadcastAction {
        let Some(ctx) = self.ctx.as_ref() else {
            return BroadcastAction::Ignored;
        };
        let Some(user) = ctx.data.current_user().cloned() else {
            return BroadcastAction::Ignored;
        };
        self.handler.on_advertisement(ctx, device, &user)
    }

    pub fn handle_disconnected(&mut self) {
        debug!(handler = self.handler.name(), "handleDisconnected");
        if let Some(ctx) = self.ctx.as_ref() {
            self.handler.on_disconnected(ctx);
        }
    }

    pub fn handle_user_interaction_feedback(
        &mut self,
        kind: InteractionKind,
        app_user_id: i32,
        feedback: &InteractionFeedback,
    ) -> Result<(), HandlerError> {
        let Some(ctx) = self.ctx.as_ref() else {
            return Err(HandlerError::Unexpected(
                "interaction feedback without an attached link".into(),
            ));
        };
        self.handler
            .on_user_interaction_feedback(ctx, kind, app_user_id, feedback)
    }
}
