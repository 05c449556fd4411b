//! Classic Bluetooth serial adapter.
//!
//! The scale is a byte stream. Everything read from it reaches the handler as a
//! notification on [`CLASSIC_DATA_UUID`]; everything the handler writes is cut
//! into chunks and paced by the [`SppTuning`]. Notify and read requests have no
//! meaning on a stream and are ignored.

use super::{AdapterCallbacks, AdapterCore, AdapterEnv, Communicator, SessionTicket};
use crate::codec::{CLASSIC_DATA_UUID, HexPreview};
use crate::event::{BluetoothEvent, EventStream, InteractionFeedback, InteractionKind};
use crate::handler::{
    Callbacks, HandlerContext, HandlerSession, ScaleDeviceHandler, SessionData, Transport,
};
use crate::link::{LinkError, SppLink, SppStream};
use crate::mac_address::MacAddress;
use crate::settings::DriverSettings;
use crate::tuning::SppTuning;
use crate::user::ScaleUser;
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Notify, mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Size of the read buffer; one read hands at most this much to the handler.
pub const SPP_READ_BUFFER_SIZE: usize = 1024;

struct SppTransport {
    writes: mpsc::UnboundedSender<Vec<u8>>,
    stop: Arc<Notify>,
}

impl Transport for SppTransport {
    fn set_notify_on(&self, _service: Uuid, _characteristic: Uuid) {}

    fn write(&self, _service: Uuid, _characteristic: Uuid, payload: &[u8], _with_response: bool) {
        if self.writes.send(payload.to_vec()).is_err() {
            debug!("SPP writer gone, payload dropped");
        }
    }

    fn read(&self, _service: Uuid, _characteristic: Uuid) {}

    fn disconnect(&self) {
        self.stop.notify_one();
    }

    fn has_characteristic(&self, _service: Uuid, _characteristic: Uuid) -> bool {
        false
    }
}

/// Writes queued payloads one after the other, each cut into paced chunks.
async fn writer(
    mut sink: WriteHalf<Box<dyn SppStream>>,
    mut payloads: mpsc::UnboundedReceiver<Vec<u8>>,
    tuning: SppTuning,
    callbacks: Arc<AdapterCallbacks>,
) {
    let chunk_size = tuning.write_chunk_bytes.max(1);
    let gap = Duration::from_millis(tuning.inter_chunk_delay_ms);
    while let Some(payload) = payloads.recv().await {
        debug!(len = payload.len(), data = %HexPreview::new(&payload), "SPP write");
        for (i, chunk) in payload.chunks(chunk_size).enumerate() {
            if i > 0 && !gap.is_zero() {
                sleep(gap).await;
            }
            if let Err(e) = sink.write_all(chunk).await {
                callbacks.warn(format!("SPP write failed: {e}"));
                break;
            }
        }
        if let Err(e) = sink.flush().await {
            callbacks.warn(format!("SPP write failed: {e}"));
        }
    }
}

/// One read. `Ok(None)` when nothing arrived within `idle` (zero waits forever).
async fn read_some(
    source: &mut ReadHalf<Box<dyn SppStream>>,
    buf: &mut [u8],
    idle: Duration,
) -> io::Result<Option<usize>> {
    if idle.is_zero() {
        return source.read(buf).await.map(Some);
    }
    match tokio::time::timeout(idle, source.read(buf)).await {
        Ok(read) => read.map(Some),
        Err(_) => Ok(None),
    }
}

struct Shared {
    core: AdapterCore,
    handler_name: &'static str,
    handler: Arc<Mutex<HandlerSession>>,
    link: Arc<dyn SppLink>,
    tuning: SppTuning,
    env: AdapterEnv,
}

impl Shared {
    async fn establish(&self, address: MacAddress) -> Result<Box<dyn SppStream>, LinkError> {
        let cooldown = self.core.cooldown_remaining();
        if !cooldown.is_zero() {
            debug!(%address, ?cooldown, "cooldown before reconnect");
            sleep(cooldown).await;
        }

        let limit = Duration::from_millis(self.tuning.connect_timeout_ms);
        let retries = self.tuning.common.max_retries;
        let mut attempt = 0;
        loop {
            let result = match tokio::time::timeout(limit, self.link.connect(address)).await {
                Ok(result) => result,
                Err(_) => Err(LinkError::Timeout("SPP connect")),
            };
            match result {
                Ok(stream) => return Ok(stream),
                Err(e) if attempt < retries => {
                    attempt += 1;
                    warn!(%address, error = %e, attempt, "SPP connect failed, retrying");
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

    async fn run(self: Arc<Self>, ticket: SessionTicket, user: ScaleUser) {
        let address = ticket.address;
        let established = tokio::select! {
            _ = ticket.stop.notified() => None,
            result = self.establish(address) => Some(result),
        };
        let stream = match established {
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
            Some(Ok(stream)) => stream,
        };

        sleep(self.tuning.settle_delay()).await;
        info!(%address, handler = self.handler_name, "SPP connected");
        self.core.mark_connected(&ticket);
        self.core.emit(BluetoothEvent::Connected {
            name: "Unknown".into(),
            address,
        });

        let (mut source, sink) = tokio::io::split(stream);
        let settings = DriverSettings::load(self.env.store.clone(), self.handler_name, address).await;
        let callbacks = Arc::new(AdapterCallbacks::new(&self.core, address));
        let (writes_tx, writes_rx) = mpsc::unbounded_channel();
        let ctx = HandlerContext {
            transport: Arc::new(SppTransport {
                writes: writes_tx,
                stop: ticket.stop.clone(),
            }),
            callbacks: callbacks.clone() as Arc<dyn Callbacks>,
            settings,
            data: SessionData::new(Some(user.clone()), self.env.users.clone()),
        };
        self.handler.lock().attach(ctx);
        let writer = tokio::spawn(writer(sink, writes_rx, self.tuning, callbacks));
        self.handler.lock().handle_connected(&user);

        let idle = Duration::from_millis(self.tuning.read_timeout_ms);
        let mut buf = [0u8; SPP_READ_BUFFER_SIZE];
        let reason = loop {
            tokio::select! {
                _ = ticket.stop.notified() => break "disconnect requested".to_string(),
                read = read_some(&mut source, &mut buf, idle) => match read {
                    Ok(Some(0)) => break "SPP stream closed".to_string(),
                    Ok(Some(n)) => {
                        debug!(%address, len = n, data = %HexPreview::new(&buf[..n]), "SPP read");
                        self.handler.lock().handle_notification(CLASSIC_DATA_UUID, &buf[..n]);
                    }
                    Ok(None) => {
                        warn!(%address, ?idle, "no data from scale, disconnecting");
                        break "read timeout".to_string();
                    }
                    Err(e) => break format!("SPP read failed: {e}"),
                },
            }
        };

        writer.abort();
        let detached = {
            let mut handler = self.handler.lock();
            handler.handle_disconnected();
            handler.detach()
        };
        if let Some(ctx) = detached {
            ctx.settings.flush().await;
        }
        self.core.finish(
            &ticket,
            BluetoothEvent::Disconnected {
                address,
                reason: Some(reason),
            },
        );
    }
}

pub struct SppAdapter {
    shared: Arc<Shared>,
}

impl SppAdapter {
    pub fn new(
        handler: Box<dyn ScaleDeviceHandler>,
        link: Arc<dyn SppLink>,
        tuning: SppTuning,
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
            }),
        }
    }
}

impl Communicator for SppAdapter {
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

    fn release(&self) {
        self.shared.core.release();
        self.shared.handler.lock().detach();
    }
}
