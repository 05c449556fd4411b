//! Lifecycle and measurement events emitted by every scale adapter.
//!
//! Events travel over an [`EventBus`]: a tokio broadcast channel that drops the
//! oldest entries when a subscriber falls behind, plus a single-slot replay of the
//! most recent event so a subscriber that attaches late still sees the current state.

use crate::mac_address::MacAddress;
use crate::measurement::ScaleMeasurement;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::debug;

/// Default capacity of an adapter's event channel.
pub const EVENT_CHANNEL_BUFFER_SIZE: usize = 64;

/// The kind of user action a scale is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InteractionKind {
    /// The scale holds several user slots and needs to know which one is ours.
    ChooseUser,
    /// The scale wants the consent code shown on its display.
    EnterConsent,
}

impl fmt::Display for InteractionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InteractionKind::ChooseUser => write!(f, "choose-user"),
            InteractionKind::EnterConsent => write!(f, "enter-consent"),
        }
    }
}

/// A user slot stored on the scale itself, offered when choosing a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleUserSlot {
    pub index: i32,
    pub label: String,
}

/// Payload that accompanies an interaction request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InteractionData {
    None,
    /// Slots the user may pick from. Index `-1` means "create a new slot".
    UserSlots(Vec<ScaleUserSlot>),
    /// The scale slot whose consent code must be entered.
    ConsentFor { user_index: i32 },
}

/// The answer to an interaction request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InteractionFeedback {
    /// Chosen scale slot, `-1` registers a new one.
    UserIndex(i32),
    /// Consent code for the slot the scale asked about.
    Consent { user_index: i32, code: i32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BluetoothEvent {
    /// Broadcast adapters: the scale is being listened for.
    Listening(MacAddress),
    /// Broadcast adapters: a final reading arrived and listening stopped.
    BroadcastComplete(MacAddress),
    Connected {
        name: String,
        address: MacAddress,
    },
    Disconnected {
        address: MacAddress,
        reason: Option<String>,
    },
    ConnectionFailed {
        address: MacAddress,
        error: String,
    },
    MeasurementReceived {
        measurement: ScaleMeasurement,
        address: MacAddress,
    },
    Error {
        address: MacAddress,
        error: String,
    },
    DeviceMessage {
        message: String,
        address: MacAddress,
    },
    UserInteractionRequired {
        address: MacAddress,
        kind: InteractionKind,
        data: InteractionData,
    },
}

impl BluetoothEvent {
    pub fn message(message: impl Into<String>, address: MacAddress) -> Self {
        BluetoothEvent::DeviceMessage {
            message: message.into(),
            address,
        }
    }

    /// `Disconnected`, `ConnectionFailed` and `BroadcastComplete` end a session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BluetoothEvent::Disconnected { .. }
                | BluetoothEvent::ConnectionFailed { .. }
                | BluetoothEvent::BroadcastComplete(_)
        )
    }

    pub fn address(&self) -> MacAddress {
        match self {
            BluetoothEvent::Listening(address) | BluetoothEvent::BroadcastComplete(address) => {
                *address
            }
            BluetoothEvent::Connected { address, .. }
            | BluetoothEvent::Disconnected { address, .. }
            | BluetoothEvent::ConnectionFailed { address, .. }
            | BluetoothEvent::MeasurementReceived { address, .. }
            | BluetoothEvent::Error { address, .. }
            | BluetoothEvent::DeviceMessage { address, .. }
            | BluetoothEvent::UserInteractionRequired { address, .. } => *address,
        }
    }
}

impl fmt::Display for BluetoothEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BluetoothEvent::Listening(a) => write!(f, "[{a}] listening"),
            BluetoothEvent::BroadcastComplete(a) => write!(f, "[{a}] broadcast complete"),
            BluetoothEvent::Connected { name, address } => write!(f, "[{address}] connected to {name}"),
            BluetoothEvent::Disconnected { address, reason } => match reason {
                Some(reason) => write!(f, "[{address}] disconnected: {reason}"),
                None => write!(f, "[{address}] disconnected"),
            },
            BluetoothEvent::ConnectionFailed { address, error } => {
                write!(f, "[{address}] connection failed: {error}")
            }
            BluetoothEvent::MeasurementReceived { measurement, address } => {
                write!(f, "[{address}] measurement {:.2}", measurement.weight)
            }
            BluetoothEvent::Error { address, error } => write!(f, "[{address}] error: {error}"),
            BluetoothEvent::DeviceMessage { message, address } => write!(f, "[{address}] {message}"),
            BluetoothEvent::UserInteractionRequired { address, kind, .. } => {
                write!(f, "[{address}] waiting for user interaction ({kind})")
            }
        }
    }
}

/// Multi-consumer event stream with replay of the latest event.
///
/// Producers never block: `emit` succeeds even with no subscribers, and slow
/// subscribers lose the oldest events instead of stalling the adapter.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BluetoothEvent>,
    latest: Arc<Mutex<Option<BluetoothEvent>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_BUFFER_SIZE)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            latest: Arc::new(Mutex::new(None)),
        }
    }

    pub fn emit(&self, event: BluetoothEvent) {
        debug!(event = %event, "emit");
        // the slot lock orders emit against subscribe so a replayed event is never delivered twice
        let mut latest = self.latest.lock();
        *latest = Some(event.clone());
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> EventStream {
        let latest = self.latest.lock();
        EventStream {
            replay: latest.clone(),
            rx: self.tx.subscribe(),
        }
    }

    /// The most recently emitted event, if any.
    pub fn latest(&self) -> Option<BluetoothEvent> {
        self.latest.lock().clone()
    }
}

/// A subscription to an [`EventBus`].
pub struct EventStream {
    replay: Option<BluetoothEvent>,
    rx: broadcast::Receiver<BluetoothEvent>,
}

impl EventStream {
    /// Wait for the next event. Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<BluetoothEvent> {
        if let Some(event) = self.replay.take() {
            return Some(event);
        }
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "event subscriber lagged, oldest events dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<BluetoothEvent> {
        if let Some(event) = self.replay.take() {
            return Some(event);
        }
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Wait until a terminal event shows up, returning it.
    pub async fn until_terminal(&mut self) -> Option<BluetoothEvent> {
        while let Some(event) = self.recv().await {
            if event.is_terminal() {
                return Some(event);
            }
        }
        None
    }
}
