//! Connection-oriented adapter.
//!
//! A session scans for the address, connects (with retries), attaches the
//! handler and forwards notifications to it. Everything the handler asks the
//! link to do goes through a single I/O worker that spaces the operations out
//! according to the [`GattTuning`] and bounds each one by the operation timeout.

use super::{AdapterCallbacks, AdapterCore, AdapterEnv, Communicator, SessionTicket};
use crate::event::{BluetoothEvent, EventStream, InteractionFeedback, InteractionKind};
use crate::handler::{
    Callbacks, HandlerContext, HandlerSession, ScaleDeviceHandler, SessionData, Transport,
};
use crate::link::{GattConnection, GattEvent, GattLink, GattSession, LinkError, LinkFuture};
use crate::mac_address::MacAddress;
use crate::settings::DriverSettings;
use crate::tuning::GattTuning;
use crate::user::ScaleUser;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

enum IoOp {
    Notify {
        service: Uuid,
        characteristic: Uuid,
    },
    Write {
        service: Uuid,
        characteristic: Uuid,
        payload: Vec<u8>,
        with_response: bool,
    },
    Read {
        service: Uuid,
        characteristic: Uuid,
    },
    Disconnect,
}

/// The handler's view of the link: every call is queued for the I/O worker.
struct GattTransport {
    ops: mpsc::UnboundedSender<IoOp>,
    connection: Arc<dyn GattConnection>,
}

impl GattTransport {
    fn enqueue(&self, op: IoOp) {
        if self.ops.send(op).is_err() {
            debug!("I/O queue closed, operation dropped");
        }
    }
}

impl Transport for GattTransport {
    fn set_notify_on(&self, service: Uuid, characteristic: Uuid) {
        self.enqueue(IoOp::Notify {
            service,
            characteristic,
        });
    }

    fn write(&self, service: Uuid, characteristic: Uuid, payload: &[u8], with_response: bool) {
        self.enqueue(IoOp::Write {
            service,
            characteristic,
            payload: payload.to_vec(),
            with_response,
        });
    }

    fn read(&self, service: Uuid, characteristic: Uuid) {
        self.enqueue(IoOp::Read {
            service,
            characteristic,
        });
    }

    fn disconnect(&self) {
        self.enqueue(IoOp::Disconnect);
    }

    fn has_characteristic(&self, service: Uuid, characteristic: Uuid) -> bool {
        self.connection.has_characteristic(service, characteristic)
    }
}

async fn timed<T>(limit: Duration, what: &'static str, fut: LinkFuture<'_, T>) -> Result<T, LinkError> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| LinkError::Timeout(what))?
}

/// Runs queued operations one at a time until the queue closes or the handler
/// asks for a disconnect.
async fn io_worker(
    connection: Arc<dyn GattConnection>,
    tuning: GattTuning,
    mut ops: mpsc::UnboundedReceiver<IoOp>,
    handler: Arc<Mutex<HandlerSession>>,
    callbacks: Arc<AdapterCallbacks>,
    stop: Arc<Notify>,
) {
    let limit = tuning.operation_timeout();
    let missing = |service: Uuid, characteristic: Uuid| {
        if connection.has_characteristic(service, characteristic) {
            false
        } else {
            callbacks.warn(format!(
                "Characteristic {characteristic} of service {service} not found"
            ));
            true
        }
    };

    while let Some(op) = ops.recv().await {
        match op {
            IoOp::Notify {
                service,
                characteristic,
            } => {
                if missing(service, characteristic) {
                    continue;
                }
                sleep(Duration::from_millis(tuning.notify_setup_delay_ms)).await;
                debug!(%characteristic, "enable notify");
                if let Err(e) = timed(limit, "notify", connection.set_notify(service, characteristic)).await {
                    callbacks.warn(format!("Enabling notifications on {characteristic} failed: {e}"));
                }
            }
            IoOp::Write {
                service,
                characteristic,
                payload,
                with_response,
            } => {
                if missing(service, characteristic) {
                    continue;
                }
                sleep(tuning.write_gap(with_response)).await;
                debug!(%characteristic, len = payload.len(), with_response, "write");
                let write = connection.write(service, characteristic, payload, with_response);
                if let Err(e) = timed(limit, "write", write).await {
                    callbacks.warn(format!("Write to {characteristic} failed: {e}"));
                }
                sleep(Duration::from_millis(tuning.post_write_delay_ms)).await;
            }
            IoOp::Read {
                service,
                characteristic,
            } => {
                if missing(service, characteristic) {
                    continue;
                }
                debug!(%characteristic, "read");
                match timed(limit, "read", connection.read(service, characteristic)).await {
                    Ok(value) => handler.lock().handle_notification(characteristic, &value),
                    Err(e) => callbacks.warn(format!("Read of {characteristic} failed: {e}")),
                }
                sleep(Duration::from_millis(tuning.post_read_delay_ms)).await;
            }
            IoOp::Disconnect => {
                debug!("disconnect requested by handler");
                stop.notify_one();
                break;
            }
        }
    }
}

/// The open connection of the running session and its I/O worker.
struct LiveLink {
    connection: Arc<dyn GattConnection>,
    worker: JoinHandle<()>,
}

struct Shared {
    core: AdapterCore,
    handler_name: &'static str,
    handler: Arc<Mutex<HandlerSession>>,
    link: Arc<dyn GattLink>,
    tuning: GattTuning,
    env: AdapterEnv,
    live: Mutex<Option<LiveLink>>,
}

impl Shared {
    async fn establish(&self, address: MacAddress) -> Result<GattSession, LinkError> {
        let cooldown = self.core.cooldown_remaining();
        if !cooldown.is_zero() {
            debug!(%address, ?cooldown, "cooldown before reconnect");
            sleep(cooldown).await;
        }

        let retries = self.tuning.common.max_retries;
        let mut attempt = 0;
        loop {
            match self.attempt(address).await {
                Ok(session) => return Ok(session),
                Err(e) if attempt < retries => {
                    attempt += 1;
                    warn!(%address, error = %e, attempt, "connection failed, retrying");
                    self.core.emit(BluetoothEvent::message(
                        format!("reconnecting ({attempt}/{retries})"),
                        address,
                    ));
                    sleep(self.tuning.common.retry_backoff()).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt(&self, address: MacAddress) -> Result<GattSession, LinkError> {
        let device = self
            .link
            .find(address, Duration::from_millis(self.tuning.scan_timeout_ms))
            .await?;
        debug!(%address, name = device.name_or_empty(), rssi = device.rssi, "found, connecting");
        sleep(Duration::from_millis(self.tuning.connect_after_scan_delay_ms)).await;
        let session = self.link.connect(address).await?;
        debug!(
            %address,
            high_priority = self.tuning.request_high_priority,
            mtu = self.tuning.request_mtu_bytes,
            "link parameters left to the stack"
        );
        Ok(session)
    }

    async fn run(self: Arc<Self>, ticket: SessionTicket, user: ScaleUser) {
        let address = ticket.address;
        let established = tokio::select! {
            _ = ticket.stop.notified() => None,
            result = self.establish(address) => Some(result),
        };
        let GattSession {
            connection,
            mut events,
        } = match established {
            None => {
                self.core.finish(
                    &ticket,
                    BluetoothEvent::Disconnected {
                        address,
                        reason: Some("disconnect requested".into()),
                    },
                );
                return;
            }
            Some(Err(e)) => {
                warn!(%address, error = %e, "giving up");
                self.core.finish(
                    &ticket,
                    BluetoothEvent::ConnectionFailed {
                        address,
                        error: e.to_string(),
                    },
                );
                return;
            }
            Some(Ok(session)) => session,
        };

        let name = connection.device_name().unwrap_or_else(|| "Unknown".into());
        info!(%address, %name, handler = self.handler_name, "connected");
        self.core.mark_connected(&ticket);
        self.core.emit(BluetoothEvent::Connected {
            name,
            address,
        });

        let settings = DriverSettings::load(self.env.store.clone(), self.handler_name, address).await;
        let callbacks = Arc::new(AdapterCallbacks::new(&self.core, address));
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let ctx = HandlerContext {
            transport: Arc::new(GattTransport {
                ops: ops_tx,
                connection: connection.clone(),
            }),
            callbacks: callbacks.clone() as Arc<dyn Callbacks>,
            settings,
            data: SessionData::new(Some(user.clone()), self.env.users.clone()),
        };
        self.handler.lock().attach(ctx);
        let worker = tokio::spawn(io_worker(
            connection.clone(),
            self.tuning,
            ops_rx,
            self.handler.clone(),
            callbacks,
            ticket.stop.clone(),
        ));
        *self.live.lock() = Some(LiveLink {
            connection: connection.clone(),
            worker,
        });
        self.handler.lock().handle_connected(&user);

        let reason = loop {
            tokio::select! {
                _ = ticket.stop.notified() => {
                    if let Err(e) = timed(self.tuning.operation_timeout(), "disconnect", connection.disconnect()).await {
                        warn!(%address, error = %e, "disconnect failed");
                    }
                    break Some("disconnect requested".to_string());
                }
                event = events.recv() => match event {
                    Some(GattEvent::Notification { characteristic, value }) => {
                        self.handler.lock().handle_notification(characteristic, &value);
                    }
                    Some(GattEvent::Disconnected(reason)) => break reason,
                    None => break Some("link closed".to_string()),
                },
            }
        };

        if let Some(live) = self.live.lock().take() {
            live.worker.abort();
        }
        let detached = {
            let mut handler = self.handler.lock();
            handler.handle_disconnected();
            handler.detach()
        };
        if let Some(ctx) = detached {
            ctx.settings.flush().await;
        }
        self.core
            .finish(&ticket, BluetoothEvent::Disconnected { address, reason });
    }
}

pub struct GattAdapter {
    shared: Arc<Shared>,
}

impl GattAdapter {
    pub fn new(
        handler: Box<dyn ScaleDeviceHandler>,
        link: Arc<dyn GattLink>,
        tuning: GattTuning,
        env: AdapterEnv,
    ) -> Self {
        let handler_name = handler.name();
        Self {
            shared: Arc::new(Shared {
                core: AdapterCore::new(handler_name, tuning.common.reconnect_cooldown()),
                handler_name,
                handler: Arc::new(Mutex::new(HandlerSession::new(handler))),
                link,
                tuning,
                env,
                live: Mutex::new(None),
            }),
        }
    }
}

impl Communicator for GattAdapter {
    fn name(&self) -> &str {
        self.shared.handler_name
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
        self.shared.core.stop();
    }

    fn request_measurement(&self) {
        self.shared.core.request_measurement();
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
        self.shared
            .core
            .deliver_feedback(&self.shared.handler, kind, app_user_id, &feedback);
    }

    /// Stops the worker and closes the link before the session task goes away.
    /// The disconnect is bounded by the operation timeout.
    fn release(&self) {
        let shared = &self.shared;
        let live = shared.live.lock().take();
        if let Some(LiveLink { connection, worker }) = live {
            worker.abort();
            let limit = shared.tuning.operation_timeout();
            match Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move {
                        if let Err(e) = timed(limit, "disconnect", connection.disconnect()).await {
                            warn!(error = %e, "disconnect on release failed");
                        }
                    });
                }
                Err(_) => warn!("released outside a runtime, link left to the stack"),
            }
        }
        shared.core.release();
        shared.handler.lock().detach();
    }
}
