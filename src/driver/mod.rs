//! Status-code drivers.
//!
//! Older scale drivers do not talk through a [`HandlerContext`](crate::handler::HandlerContext).
//! They run their own link and report progress as a stream of [`LegacyStatus`]
//! values on a registered callback channel. The
//! [`LegacyScaleAdapter`](crate::transport::legacy::LegacyScaleAdapter) turns
//! those into [`BluetoothEvent`](crate::event::BluetoothEvent)s.

pub mod yunmai;

use crate::event::{InteractionData, InteractionFeedback, InteractionKind};
use crate::link::LinkError;
use crate::mac_address::MacAddress;
use crate::measurement::ScaleMeasurement;
use crate::user::ScaleUser;
use thiserror::Error;
use tokio::sync::mpsc;

/// Progress report of a legacy driver.
#[derive(Debug, Clone, PartialEq)]
pub enum LegacyStatus {
    /// A reading. `None` when the driver handed over something that is not a measurement.
    RetrieveScaleData(Option<ScaleMeasurement>),
    InitProcess(Option<String>),
    ConnectionRetrying,
    ConnectionEstablished,
    ConnectionDisconnect(Option<String>),
    ConnectionLost(Option<String>),
    NoDeviceFound(Option<String>),
    UnexpectedError(Option<String>),
    ScaleMessage(String),
    /// `kind` is `None` when the driver sent an interaction the app does not know.
    UserInteractionRequired {
        kind: Option<InteractionKind>,
        data: InteractionData,
    },
    /// Status code outside the known set.
    Unknown(i32),
}

pub type StatusSender = mpsc::UnboundedSender<LegacyStatus>;

#[derive(Error, Debug)]
pub enum LegacyDriverError {
    #[error("no user selected")]
    NoUser,
    #[error("driver is busy with {0}")]
    Busy(MacAddress),
    #[error("{0} is not supported by this driver")]
    Unsupported(String),
    #[error(transparent)]
    Link(#[from] LinkError),
}

/// A driver that owns its connection and reports through [`LegacyStatus`].
///
/// The setters provide the user context before `connect`; all calls return
/// immediately, the actual work happens on a task the driver spawns.
pub trait LegacyScaleDriver: Send + Sync {
    fn driver_name(&self) -> &str;

    /// Install (or with `None`, remove) the status channel.
    fn register_callback(&self, callback: Option<StatusSender>);

    fn set_selected_user(&self, user: ScaleUser);

    fn set_user_list(&self, users: Vec<ScaleUser>);

    /// Per-installation number the driver mixes into user ids it registers on the scale.
    fn set_unique_number(&self, base: i32);

    fn set_cached_last_measurement(&self, measurement: Option<ScaleMeasurement>);

    fn connect(&self, address: MacAddress) -> Result<(), LegacyDriverError>;

    fn disconnect(&self);

    fn process_user_interaction_feedback(
        &self,
        kind: InteractionKind,
        app_user_id: i32,
        feedback: &InteractionFeedback,
    ) -> Result<(), LegacyDriverError>;
}

/// Unique number as the drivers put it on the wire. An unset base (`-1`) falls back to 99.
pub fn unique_number(base: i32, user: &ScaleUser) -> i32 {
    let base = if base == -1 { 99 } else { base };
    base + user.id
}
