//! Transport adapters.
//!
//! An adapter owns one physical session at a time and drives a handler (or a
//! legacy driver) through it. Whatever the transport, callers see the same
//! [`Communicator`] surface: connect/disconnect, a replaying event stream and
//! two observable flags.
//!
//! Every session ends with exactly one terminal event. [`AdapterCore`] enforces
//! that: a session is identified by a ticket and only the first `finish` for the
//! current ticket emits.

pub mod broadcast;
pub mod gatt;
pub mod legacy;
pub mod spp;

use crate::event::{
    BluetoothEvent, EventBus, EventStream, InteractionData, InteractionFeedback, InteractionKind,
};
use crate::handler::{Callbacks, HandlerSession, UserDirectory};
use crate::mac_address::MacAddress;
use crate::measurement::ScaleMeasurement;
use crate::settings::PreferenceStore;
use crate::user::ScaleUser;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Uniform surface of every adapter.
pub trait Communicator: Send + Sync {
    /// Handler or driver name, for logs.
    fn name(&self) -> &str;

    /// Start a session. Progress and the outcome arrive as events.
    fn connect(&self, address: MacAddress, user: Option<ScaleUser>);

    /// End the current session. Safe to call in any state and more than once.
    fn disconnect(&self);

    fn request_measurement(&self);

    fn events(&self) -> EventStream;

    fn connecting(&self) -> watch::Receiver<bool>;

    fn connected(&self) -> watch::Receiver<bool>;

    fn provide_user_interaction_feedback(
        &self,
        kind: InteractionKind,
        app_user_id: i32,
        feedback: InteractionFeedback,
    );

    /// Tear down for good.
    fn release(&self);
}

/// Collaborators of the modern adapters besides their link.
#[derive(Clone)]
pub struct AdapterEnv {
    pub store: Arc<dyn PreferenceStore>,
    pub users: Arc<dyn UserDirectory>,
}

/// Identifies one session of an adapter.
#[derive(Debug, Clone)]
pub(crate) struct SessionTicket {
    pub id: u64,
    pub address: MacAddress,
    /// Signalled by `disconnect()`; the session task tears down when it fires.
    pub stop: Arc<Notify>,
}

struct ActiveSession {
    ticket: SessionTicket,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct CoreState {
    counter: u64,
    active: Option<ActiveSession>,
    last_disconnect: Option<Instant>,
}

/// Session bookkeeping shared by all adapters.
pub(crate) struct AdapterCore {
    name: String,
    bus: EventBus,
    connecting: watch::Sender<bool>,
    connected: watch::Sender<bool>,
    cooldown: Duration,
    state: Mutex<CoreState>,
}

impl AdapterCore {
    pub fn new(name: impl Into<String>, cooldown: Duration) -> Self {
        Self {
            name: name.into(),
            bus: EventBus::default(),
            connecting: watch::Sender::new(false),
            connected: watch::Sender::new(false),
            cooldown,
            state: Mutex::new(CoreState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn emit(&self, event: BluetoothEvent) {
        self.bus.emit(event);
    }

    pub fn events(&self) -> EventStream {
        self.bus.subscribe()
    }

    pub fn connecting(&self) -> watch::Receiver<bool> {
        self.connecting.subscribe()
    }

    pub fn connected(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Address of the session in progress.
    pub fn active_address(&self) -> Option<MacAddress> {
        self.state.lock().active.as_ref().map(|a| a.ticket.address)
    }

    /// Open a session for `address`. Returns `None` when one is already running:
    /// silently for the same address, with a `ConnectionFailed` for another one.
    pub fn begin(&self, address: MacAddress) -> Option<SessionTicket> {
        let mut state = self.state.lock();
        if let Some(active) = state.active.as_ref() {
            let current = active.ticket.address;
            drop(state);
            if current == address {
                debug!(adapter = %self.name, %address, "connect ignored: already connecting/connected");
            } else {
                warn!(adapter = %self.name, %address, %current, "connect rejected: busy");
                self.emit(BluetoothEvent::ConnectionFailed {
                    address,
                    error: format!("busy with {current}"),
                });
            }
            return None;
        }

        state.counter += 1;
        let ticket = SessionTicket {
            id: state.counter,
            address,
            stop: Arc::new(Notify::new()),
        };
        state.active = Some(ActiveSession {
            ticket: ticket.clone(),
            task: None,
        });
        drop(state);

        info!(adapter = %self.name, %address, session = ticket.id, "session start");
        self.connected.send_replace(false);
        self.connecting.send_replace(true);
        Some(ticket)
    }

    /// Remember the task running `ticket` so `release` can cancel it.
    pub fn track(&self, ticket: &SessionTicket, task: JoinHandle<()>) {
        let mut state = self.state.lock();
        match state.active.as_mut() {
            Some(active) if active.ticket.id == ticket.id => active.task = Some(task),
            // the session already finished
            _ => {}
        }
    }

    /// How long a new connection attempt still has to wait after the last disconnect.
    pub fn cooldown_remaining(&self) -> Duration {
        self.state
            .lock()
            .last_disconnect
            .map(|at| self.cooldown.saturating_sub(at.elapsed()))
            .unwrap_or_default()
    }

    pub fn mark_connected(&self, ticket: &SessionTicket) {
        if self.is_current(ticket) {
            self.connecting.send_replace(false);
            self.connected.send_replace(true);
        }
    }

    pub fn is_current(&self, ticket: &SessionTicket) -> bool {
        self.state
            .lock()
            .active
            .as_ref()
            .is_some_and(|a| a.ticket.id == ticket.id)
    }

    /// End the session of `ticket` with `event`. Only the first call per session emits.
    pub fn finish(&self, ticket: &SessionTicket, event: BluetoothEvent) -> bool {
        {
            let mut state = self.state.lock();
            if !state
                .active
                .as_ref()
                .is_some_and(|a| a.ticket.id == ticket.id)
            {
                debug!(adapter = %self.name, session = ticket.id, "session already finished");
                return false;
            }
            state.active = None;
            state.last_disconnect = Some(Instant::now());
        }
        info!(adapter = %self.name, address = %ticket.address, session = ticket.id, "session end");
        self.connecting.send_replace(false);
        self.connected.send_replace(false);
        self.emit(event);
        true
    }

    /// Ask the running session to stop.
    pub fn stop(&self) {
        match self.state.lock().active.as_ref() {
            Some(active) => active.ticket.stop.notify_one(),
            None => debug!(adapter = %self.name, "disconnect while idle"),
        }
    }

    /// Cancel the running session outright.
    pub fn release(&self) {
        let active = self.state.lock().active.take();
        if let Some(active) = active {
            if let Some(task) = active.task {
                task.abort();
            }
            self.connecting.send_replace(false);
            self.connected.send_replace(false);
            self.emit(BluetoothEvent::Disconnected {
                address: active.ticket.address,
                reason: Some("released".into()),
            });
        }
    }

    pub fn request_measurement(&self) {
        match self.active_address() {
            Some(address) => self.emit(BluetoothEvent::message("Waiting for measurement", address)),
            None => warn!(adapter = %self.name, "measurement requested without a session"),
        }
    }

    /// Hand interaction feedback to the handler of the current session.
    pub fn deliver_feedback(
        &self,
        session: &Mutex<HandlerSession>,
        kind: InteractionKind,
        app_user_id: i32,
        feedback: &InteractionFeedback,
    ) {
        let result = session
            .lock()
            .handle_user_interaction_feedback(kind, app_user_id, feedback);
        if let Err(e) = result {
            error!(adapter = %self.name, %kind, error = %e, "delivering user feedback failed");
            if let Some(address) = self.active_address() {
                self.emit(BluetoothEvent::message(
                    format!("Delivering user feedback failed: {e}"),
                    address,
                ));
            }
        }
    }
}

/// [`Callbacks`] that turn handler output into events of one session.
pub(crate) struct AdapterCallbacks {
    bus: EventBus,
    address: MacAddress,
}

impl AdapterCallbacks {
    pub fn new(core: &AdapterCore, address: MacAddress) -> Self {
        Self {
            bus: core.bus.clone(),
            address,
        }
    }
}

impl Callbacks for AdapterCallbacks {
    fn publish(&self, measurement: ScaleMeasurement) {
        self.bus.emit(BluetoothEvent::MeasurementReceived {
            measurement,
            address: self.address,
        });
    }

    fn info(&self, message: String) {
        self.bus.emit(BluetoothEvent::message(message, self.address));
    }

    fn warn(&self, message: String) {
        warn!(address = %self.address, "{message}");
        self.bus.emit(BluetoothEvent::message(message, self.address));
    }

    fn error(&self, message: String) {
        error!(address = %self.address, "{message}");
        self.bus.emit(BluetoothEvent::message(message, self.address));
    }

    fn failure(&self, message: String) {
        self.bus.emit(BluetoothEvent::Error {
            address: self.address,
            error: message,
        });
    }

    fn user_interaction_required(&self, kind: InteractionKind, data: InteractionData) {
        self.bus.emit(BluetoothEvent::UserInteractionRequired {
            address: self.address,
            kind,
            data,
        });
    }
}
