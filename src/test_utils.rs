//! Fakes and fixtures shared by the unit tests.

use crate::advertisement::ScannedDeviceInfo;
use crate::codec::uuid16;
use crate::driver::{LegacyDriverError, LegacyScaleDriver, LegacyStatus, StatusSender};
use crate::event::{
    BluetoothEvent, EventStream, InteractionData, InteractionFeedback, InteractionKind,
};
use crate::handler::{
    BroadcastAction, Callbacks, DeviceSupport, HandlerContext, HandlerError, LinkMode,
    ScaleDeviceHandler, SessionData, StaticUsers, Transport,
};
use crate::link::{
    ADVERTISEMENT_CHANNEL_BUFFER_SIZE, AdvertisementSource, GATT_EVENT_CHANNEL_BUFFER_SIZE,
    GattConnection, GattEvent, GattLink, GattSession, LinkError, LinkFuture, ScanFilter, SppLink,
    SppStream,
};
use crate::mac_address::MacAddress;
use crate::measurement::ScaleMeasurement;
use crate::settings::{DriverSettings, MemoryStore, PreferenceStore, StoreFuture};
use crate::user::{ActivityLevel, Gender, ScaleUser, WeightUnit};
use chrono::NaiveDate;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep};
use uuid::Uuid;

/// A stable MAC address for unit tests.
pub const TEST_MAC: MacAddress = MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

/// User id 1: male, 180 cm, born 1990, kilograms.
pub fn test_user() -> ScaleUser {
    ScaleUser {
        id: 1,
        user_name: "Alex".into(),
        birthday: NaiveDate::from_ymd_opt(1990, 6, 15).unwrap(),
        body_height: 180.0,
        gender: Gender::Male,
        initial_weight: 80.0,
        goal_weight: 75.0,
        scale_unit: WeightUnit::Kg,
        activity_level: ActivityLevel::Mild,
    }
}

/// Collect events until the session ends (or nothing happens for a minute),
/// plus whatever is queued right after.
pub async fn drain(events: &mut EventStream) -> Vec<BluetoothEvent> {
    let mut seen = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_secs(60), events.recv()).await {
        let terminal = event.is_terminal();
        seen.push(event);
        if terminal {
            break;
        }
    }
    tokio::task::yield_now().await;
    while let Some(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

// --- handler contexts ---

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedWrite {
    pub service: Uuid,
    pub characteristic: Uuid,
    pub payload: Vec<u8>,
    pub with_response: bool,
}

/// Transport that records what the handler asked for.
///
/// `has_characteristic` answers true only for the characteristics it was built with.
#[derive(Default)]
pub struct RecordingTransport {
    characteristics: Vec<(Uuid, Uuid)>,
    writes: Mutex<Vec<RecordedWrite>>,
    notified: Mutex<Vec<(Uuid, Uuid)>>,
    reads: Mutex<Vec<(Uuid, Uuid)>>,
    disconnects: AtomicUsize,
}

impl RecordingTransport {
    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.writes.lock().clone()
    }

    pub fn notified(&self) -> Vec<(Uuid, Uuid)> {
        self.notified.lock().clone()
    }

    pub fn reads(&self) -> Vec<(Uuid, Uuid)> {
        self.reads.lock().clone()
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

impl Transport for RecordingTransport {
    fn set_notify_on(&self, service: Uuid, characteristic: Uuid) {
        self.notified.lock().push((service, characteristic));
    }

    fn write(&self, service: Uuid, characteristic: Uuid, payload: &[u8], with_response: bool) {
        self.writes.lock().push(RecordedWrite {
            service,
            characteristic,
            payload: payload.to_vec(),
            with_response,
        });
    }

    fn read(&self, service: Uuid, characteristic: Uuid) {
        self.reads.lock().push((service, characteristic));
    }

    fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn has_characteristic(&self, service: Uuid, characteristic: Uuid) -> bool {
        self.characteristics.contains(&(service, characteristic))
    }
}

/// Callbacks that keep everything for later assertions.
pub struct Recorder {
    pub transport: Arc<RecordingTransport>,
    published: Mutex<Vec<ScaleMeasurement>>,
    infos: Mutex<Vec<String>>,
    warnings: Mutex<Vec<String>>,
    errors: Mutex<Vec<String>>,
    failures: Mutex<Vec<String>>,
    interactions: Mutex<Vec<(InteractionKind, InteractionData)>>,
}

impl Recorder {
    fn new(transport: Arc<RecordingTransport>) -> Self {
        Self {
            transport,
            published: Mutex::default(),
            infos: Mutex::default(),
            warnings: Mutex::default(),
            errors: Mutex::default(),
            failures: Mutex::default(),
            interactions: Mutex::default(),
        }
    }

    pub fn published(&self) -> Vec<ScaleMeasurement> {
        self.published.lock().clone()
    }

    pub fn infos(&self) -> Vec<String> {
        self.infos.lock().clone()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.warnings.lock().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }

    pub fn failures(&self) -> Vec<String> {
        self.failures.lock().clone()
    }

    pub fn interactions(&self) -> Vec<(InteractionKind, InteractionData)> {
        self.interactions.lock().clone()
    }
}

impl Callbacks for Recorder {
    fn publish(&self, measurement: ScaleMeasurement) {
        self.published.lock().push(measurement);
    }

    fn info(&self, message: String) {
        self.infos.lock().push(message);
    }

    fn warn(&self, message: String) {
        self.warnings.lock().push(message);
    }

    fn error(&self, message: String) {
        self.errors.lock().push(message);
    }

    fn failure(&self, message: String) {
        self.failures.lock().push(message);
    }

    fn user_interaction_required(&self, kind: InteractionKind, data: InteractionData) {
        self.interactions.lock().push((kind, data));
    }
}

/// Builds a [`HandlerContext`] over a [`RecordingTransport`] and a [`MemoryStore`].
pub struct ContextBuilder {
    address: MacAddress,
    handler: String,
    user: Option<ScaleUser>,
    users: Vec<ScaleUser>,
    settings: Vec<(String, Value)>,
    characteristics: Vec<(Uuid, Uuid)>,
}

impl ContextBuilder {
    pub fn new(address: MacAddress) -> Self {
        Self {
            address,
            handler: "TestHandler".into(),
            user: None,
            users: Vec::new(),
            settings: Vec::new(),
            characteristics: Vec::new(),
        }
    }

    /// Selected user; also the user list unless `users` sets one.
    pub fn user(mut self, user: ScaleUser) -> Self {
        self.user = Some(user);
        self
    }

    pub fn users(mut self, users: Vec<ScaleUser>) -> Self {
        self.users = users;
        self
    }

    /// Raw store entry, with the full `ble/{handler}/{address}/` key.
    pub fn setting(mut self, key: impl Into<String>, value: Value) -> Self {
        self.settings.push((key.into(), value));
        self
    }

    /// Settings namespace.
    pub fn handler(mut self, name: &str) -> Self {
        self.handler = name.to_string();
        self
    }

    pub fn characteristic(mut self, service: Uuid, characteristic: Uuid) -> Self {
        self.characteristics.push((service, characteristic));
        self
    }

    pub async fn build(self) -> (HandlerContext, Arc<Recorder>) {
        let store: Arc<dyn PreferenceStore> = Arc::new(MemoryStore::with_values(self.settings));
        let settings = DriverSettings::load(store, &self.handler, self.address).await;
        let transport = Arc::new(RecordingTransport {
            characteristics: self.characteristics,
            ..RecordingTransport::default()
        });
        let recorder = Arc::new(Recorder::new(transport.clone()));
        let users = if self.users.is_empty() {
            self.user.iter().cloned().collect()
        } else {
            self.users
        };
        let ctx = HandlerContext {
            transport,
            callbacks: recorder.clone(),
            settings,
            data: SessionData::new(self.user, Arc::new(StaticUsers::new(users))),
        };
        (ctx, recorder)
    }
}

pub async fn recording_context(
    address: MacAddress,
    user: Option<ScaleUser>,
) -> (HandlerContext, Arc<Recorder>) {
    recording_context_with(address, user, "TestHandler", Vec::new()).await
}

pub async fn recording_context_with(
    address: MacAddress,
    user: Option<ScaleUser>,
    handler: &str,
    settings: Vec<(String, Value)>,
) -> (HandlerContext, Arc<Recorder>) {
    let mut builder = ContextBuilder::new(address).handler(handler);
    if let Some(user) = user {
        builder = builder.user(user);
    }
    for (key, value) in settings {
        builder = builder.setting(key, value);
    }
    builder.build().await
}

/// A store that never answers.
pub struct SlowStore;

impl PreferenceStore for SlowStore {
    fn get<'a>(&'a self, _key: &'a str) -> StoreFuture<'a, Option<Value>> {
        Box::pin(std::future::pending())
    }

    fn put<'a>(&'a self, _key: &'a str, _value: Value) -> StoreFuture<'a, ()> {
        Box::pin(std::future::pending())
    }

    fn entries<'a>(&'a self, _prefix: &'a str) -> StoreFuture<'a, Vec<(String, Value)>> {
        Box::pin(std::future::pending())
    }
}

/// A memory store that answers every write after `delay`.
pub struct DelayedStore {
    pub inner: MemoryStore,
    pub delay: Duration,
}

impl DelayedStore {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryStore::new(),
            delay,
        }
    }
}

impl PreferenceStore for DelayedStore {
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<Value>> {
        self.inner.get(key)
    }

    fn put<'a>(&'a self, key: &'a str, value: Value) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            self.inner.put(key, value).await
        })
    }

    fn entries<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<(String, Value)>> {
        self.inner.entries(prefix)
    }
}

// --- echo handler ---

pub const ECHO_SERVICE: Uuid = uuid16(0xFFF0);
pub const ECHO_NOTIFY: Uuid = uuid16(0xFFF1);
pub const ECHO_WRITE: Uuid = uuid16(0xFFF2);
pub const ECHO_READ: Uuid = uuid16(0xFFF3);
pub const ECHO_COMPANY: u16 = 0xFFFF;

/// Minimal protocol for adapter tests.
///
/// Connect: notify, write `01`, read. A frame `[w, ..]` publishes weight `w` and
/// answers `A0 w`; `FF` asks for a disconnect. Advertisements carry `[w, stable]`
/// under [`ECHO_COMPANY`].
pub struct EchoHandler {
    mode: LinkMode,
}

impl EchoHandler {
    pub fn gatt() -> Self {
        Self {
            mode: LinkMode::ConnectGatt,
        }
    }

    pub fn broadcast() -> Self {
        Self {
            mode: LinkMode::BroadcastOnly,
        }
    }

    pub fn spp() -> Self {
        Self {
            mode: LinkMode::ClassicSpp,
        }
    }
}

impl ScaleDeviceHandler for EchoHandler {
    fn name(&self) -> &'static str {
        "EchoHandler"
    }

    fn reset(&mut self) {}

    fn support_for(&self, device: &ScannedDeviceInfo) -> Option<DeviceSupport> {
        (device.upper_name() == "ECHO").then(|| DeviceSupport::new("Echo", self.mode))
    }

    fn on_connected(&mut self, ctx: &HandlerContext, _user: &ScaleUser) -> Result<(), HandlerError> {
        ctx.set_notify_on(ECHO_SERVICE, ECHO_NOTIFY);
        ctx.write(ECHO_SERVICE, ECHO_WRITE, &[0x01]);
        ctx.read(ECHO_SERVICE, ECHO_READ);
        Ok(())
    }

    fn on_notification(
        &mut self,
        ctx: &HandlerContext,
        _characteristic: Uuid,
        data: &[u8],
        user: &ScaleUser,
    ) -> Result<(), HandlerError> {
        match data.first() {
            None => {}
            Some(0xFF) => ctx.request_disconnect(),
            Some(&weight) => {
                ctx.publish(ScaleMeasurement {
                    user_id: Some(user.id),
                    ..ScaleMeasurement::with_weight(f32::from(weight))
                });
                ctx.write_without_response(ECHO_SERVICE, ECHO_WRITE, &[0xA0, weight]);
            }
        }
        Ok(())
    }

    fn on_disconnected(&mut self, ctx: &HandlerContext) {
        ctx.info("echo closed");
    }

    fn on_advertisement(
        &mut self,
        ctx: &HandlerContext,
        device: &ScannedDeviceInfo,
        _user: &ScaleUser,
    ) -> BroadcastAction {
        let Some([weight, stable]) = device
            .manufacturer_data
            .get(&ECHO_COMPANY)
            .and_then(|d| <[u8; 2]>::try_from(d.as_slice()).ok())
        else {
            return BroadcastAction::Ignored;
        };
        ctx.publish(ScaleMeasurement::with_weight(f32::from(weight)));
        if stable == 1 {
            BroadcastAction::ConsumedStop
        } else {
            BroadcastAction::ConsumedKeepScanning
        }
    }

    fn on_user_interaction_feedback(
        &mut self,
        ctx: &HandlerContext,
        _kind: InteractionKind,
        _app_user_id: i32,
        feedback: &InteractionFeedback,
    ) -> Result<(), HandlerError> {
        match feedback {
            InteractionFeedback::UserIndex(index) => {
                let index = u8::try_from(*index)
                    .map_err(|_| HandlerError::Unexpected(format!("user index {index}")))?;
                ctx.write(ECHO_SERVICE, ECHO_WRITE, &[0xB0, index]);
                Ok(())
            }
            other => Err(HandlerError::Unexpected(format!("{other:?}"))),
        }
    }
}

/// Echo advertisement from [`TEST_MAC`] at -60 dBm.
pub fn echo_advert(weight: u8, stable: bool) -> ScannedDeviceInfo {
    let mut device = ScannedDeviceInfo::new(TEST_MAC).with_name("ECHO");
    device.rssi = -60;
    device
        .manufacturer_data
        .insert(ECHO_COMPANY, vec![weight, u8::from(stable)]);
    device
}

/// Final AAA007 weight frame from [`TEST_MAC`], masked with company 0x5A01.
pub fn aaax_final_advert(grams: u32) -> ScannedDeviceInfo {
    let mut payload = [0u8; 6];
    payload[..4].copy_from_slice(&((1u32 << 31) | grams).to_be_bytes());
    payload[4] = 0xAD;
    let sum: u32 = payload[..5].iter().map(|b| u32::from(*b)).sum();
    payload[5] = (sum & 0x1F) as u8;

    let mut data = vec![0x11; 6];
    data.extend(payload.iter().map(|b| b ^ 0x5A));
    let mut device = ScannedDeviceInfo::new(TEST_MAC).with_name("AAA007");
    device.rssi = -60;
    device.manufacturer_data.insert(0x5A01, data);
    device
}

// --- GATT ---

#[derive(Debug, Clone, PartialEq)]
pub enum GattOp {
    Notify(Uuid, Uuid),
    Write {
        service: Uuid,
        characteristic: Uuid,
        payload: Vec<u8>,
        with_response: bool,
    },
    Read(Uuid, Uuid),
}

/// Connection that records operations. With no characteristics configured
/// every characteristic exists.
pub struct FakeGattConnection {
    name: Option<String>,
    characteristics: Mutex<Vec<(Uuid, Uuid)>>,
    ops: Mutex<Vec<(Instant, GattOp)>>,
    read_values: Mutex<HashMap<Uuid, Vec<u8>>>,
    disconnects: AtomicUsize,
    events: Mutex<Option<mpsc::Sender<GattEvent>>>,
}

impl FakeGattConnection {
    fn new(name: Option<String>) -> Self {
        Self {
            name,
            characteristics: Mutex::default(),
            ops: Mutex::default(),
            read_values: Mutex::default(),
            disconnects: AtomicUsize::new(0),
            events: Mutex::new(None),
        }
    }

    fn record(&self, op: GattOp) {
        self.ops.lock().push((Instant::now(), op));
    }

    pub fn ops(&self) -> Vec<GattOp> {
        self.ops.lock().iter().map(|(_, op)| op.clone()).collect()
    }

    pub fn timed_ops(&self) -> Vec<(Instant, GattOp)> {
        self.ops.lock().clone()
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn set_read_value(&self, characteristic: Uuid, value: Vec<u8>) {
        self.read_values.lock().insert(characteristic, value);
    }
}

impl GattConnection for FakeGattConnection {
    fn device_name(&self) -> Option<String> {
        self.name.clone()
    }

    fn has_characteristic(&self, service: Uuid, characteristic: Uuid) -> bool {
        let known = self.characteristics.lock();
        known.is_empty() || known.contains(&(service, characteristic))
    }

    fn set_notify(&self, service: Uuid, characteristic: Uuid) -> LinkFuture<'_, ()> {
        self.record(GattOp::Notify(service, characteristic));
        Box::pin(async { Ok(()) })
    }

    fn write(
        &self,
        service: Uuid,
        characteristic: Uuid,
        payload: Vec<u8>,
        with_response: bool,
    ) -> LinkFuture<'_, ()> {
        self.record(GattOp::Write {
            service,
            characteristic,
            payload,
            with_response,
        });
        Box::pin(async { Ok(()) })
    }

    fn read(&self, service: Uuid, characteristic: Uuid) -> LinkFuture<'_, Vec<u8>> {
        self.record(GattOp::Read(service, characteristic));
        let value = self
            .read_values
            .lock()
            .get(&characteristic)
            .cloned()
            .unwrap_or_default();
        Box::pin(async move { Ok(value) })
    }

    fn disconnect(&self) -> LinkFuture<'_, ()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        if let Some(events) = self.events.lock().take() {
            let _ = events.try_send(GattEvent::Disconnected(None));
        }
        Box::pin(async { Ok(()) })
    }
}

/// Link to one scripted device. All sessions share one [`FakeGattConnection`].
pub struct FakeGattLink {
    device: Option<ScannedDeviceInfo>,
    connection: Arc<FakeGattConnection>,
    failing_connects: AtomicUsize,
    connect_attempts: AtomicUsize,
}

impl FakeGattLink {
    pub fn new(device: ScannedDeviceInfo) -> Self {
        Self {
            connection: Arc::new(FakeGattConnection::new(device.name.clone())),
            device: Some(device),
            failing_connects: AtomicUsize::new(0),
            connect_attempts: AtomicUsize::new(0),
        }
    }

    /// A link that never finds anything.
    pub fn missing() -> Self {
        Self {
            device: None,
            connection: Arc::new(FakeGattConnection::new(None)),
            failing_connects: AtomicUsize::new(0),
            connect_attempts: AtomicUsize::new(0),
        }
    }

    /// The first `n` connects fail.
    pub fn failing_connects(self, n: usize) -> Self {
        self.failing_connects.store(n, Ordering::SeqCst);
        self
    }

    /// Restrict the connection to the listed characteristics.
    pub fn with_characteristic(self, service: Uuid, characteristic: Uuid) -> Self {
        self.connection
            .characteristics
            .lock()
            .push((service, characteristic));
        self
    }

    pub fn connection(&self) -> Arc<FakeGattConnection> {
        self.connection.clone()
    }

    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    fn events(&self) -> Option<mpsc::Sender<GattEvent>> {
        self.connection.events.lock().clone()
    }

    /// Deliver a notification on the open session.
    pub async fn notify(&self, characteristic: Uuid, value: Vec<u8>) {
        if let Some(events) = self.events() {
            let _ = events
                .send(GattEvent::Notification {
                    characteristic,
                    value,
                })
                .await;
        }
    }

    /// The peer goes away.
    pub async fn drop_link(&self, reason: Option<String>) {
        let events = self.connection.events.lock().take();
        if let Some(events) = events {
            let _ = events.send(GattEvent::Disconnected(reason)).await;
        }
    }
}

impl GattLink for FakeGattLink {
    fn find(&self, address: MacAddress, timeout: Duration) -> LinkFuture<'_, ScannedDeviceInfo> {
        let found = self.device.clone().filter(|d| d.address == address);
        Box::pin(async move {
            match found {
                Some(device) => Ok(device),
                None => {
                    sleep(timeout).await;
                    Err(LinkError::NotFound(address))
                }
            }
        })
    }

    fn connect(&self, _address: MacAddress) -> LinkFuture<'_, GattSession> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        Box::pin(async move {
            if failing {
                return Err(LinkError::Timeout("connect"));
            }
            let (tx, rx) = mpsc::channel(GATT_EVENT_CHANNEL_BUFFER_SIZE);
            *self.connection.events.lock() = Some(tx);
            Ok(GattSession {
                connection: self.connection.clone(),
                events: rx,
            })
        })
    }
}

// --- broadcast ---

/// Plays one scripted list of `(delay, advertisement)` per scan, then keeps the
/// scan open until the receiver goes away. Scans past the script see nothing.
/// The filter is ignored, like a backend that cannot filter in hardware.
#[derive(Default)]
pub struct FakeAdvertisementSource {
    attempts: Mutex<VecDeque<Vec<(Duration, ScannedDeviceInfo)>>>,
    scans: AtomicUsize,
    failing: bool,
}

impl FakeAdvertisementSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// A source whose scans cannot start.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    /// Script for the next scan; delays are relative to the previous packet.
    pub fn attempt(self, packets: Vec<(Duration, ScannedDeviceInfo)>) -> Self {
        self.attempts.lock().push_back(packets);
        self
    }

    pub fn scans(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }
}

impl AdvertisementSource for FakeAdvertisementSource {
    fn scan(&self, _filter: ScanFilter) -> LinkFuture<'_, mpsc::Receiver<ScannedDeviceInfo>> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        let script = self.attempts.lock().pop_front().unwrap_or_default();
        let failing = self.failing;
        Box::pin(async move {
            if failing {
                return Err(LinkError::Bluetooth("adapter powered off".into()));
            }
            let (tx, rx) = mpsc::channel(ADVERTISEMENT_CHANNEL_BUFFER_SIZE);
            tokio::spawn(async move {
                for (delay, device) in script {
                    sleep(delay).await;
                    if tx.send(device).await.is_err() {
                        return;
                    }
                }
                tx.closed().await;
            });
            Ok(rx)
        })
    }
}

// --- SPP ---

/// Serial link over an in-memory duplex pipe. The scale's end is picked up
/// with [`FakeSppLink::take_device`].
#[derive(Default)]
pub struct FakeSppLink {
    device: Mutex<Option<DuplexStream>>,
    failing_connects: AtomicUsize,
    connect_attempts: AtomicUsize,
}

impl FakeSppLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_connects(self, n: usize) -> Self {
        self.failing_connects.store(n, Ordering::SeqCst);
        self
    }

    pub fn take_device(&self) -> Option<DuplexStream> {
        self.device.lock().take()
    }

    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }
}

impl SppLink for FakeSppLink {
    fn connect(&self, _address: MacAddress) -> LinkFuture<'_, Box<dyn SppStream>> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        Box::pin(async move {
            if failing {
                return Err(LinkError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "host is down",
                )));
            }
            let (near, far) = tokio::io::duplex(4096);
            *self.device.lock() = Some(far);
            Ok(Box::new(near) as Box<dyn SppStream>)
        })
    }
}

// --- legacy drivers ---

/// Driver that records the calls it gets. Statuses are injected with [`FakeLegacyDriver::send`].
pub struct FakeLegacyDriver {
    name: String,
    fail_connect: bool,
    callback: Mutex<Option<StatusSender>>,
    selected_user: Mutex<Option<ScaleUser>>,
    user_list: Mutex<Vec<ScaleUser>>,
    unique_number: Mutex<Option<i32>>,
    cached_last: Mutex<Option<ScaleMeasurement>>,
    connects: Mutex<Vec<MacAddress>>,
    calls: Mutex<Vec<&'static str>>,
}

impl FakeLegacyDriver {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fail_connect: false,
            callback: Mutex::new(None),
            selected_user: Mutex::new(None),
            user_list: Mutex::default(),
            unique_number: Mutex::new(None),
            cached_last: Mutex::new(None),
            connects: Mutex::default(),
            calls: Mutex::default(),
        }
    }

    pub fn failing_connect(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    /// Report a status; false when no callback is registered.
    pub fn send(&self, status: LegacyStatus) -> bool {
        match self.callback.lock().as_ref() {
            Some(callback) => callback.send(status).is_ok(),
            None => false,
        }
    }

    pub fn has_callback(&self) -> bool {
        self.callback.lock().is_some()
    }

    pub fn selected_user(&self) -> Option<ScaleUser> {
        self.selected_user.lock().clone()
    }

    pub fn user_list(&self) -> Vec<ScaleUser> {
        self.user_list.lock().clone()
    }

    pub fn unique_number(&self) -> Option<i32> {
        *self.unique_number.lock()
    }

    pub fn cached_last_measurement(&self) -> Option<ScaleMeasurement> {
        self.cached_last.lock().clone()
    }

    pub fn connects(&self) -> Vec<MacAddress> {
        self.connects.lock().clone()
    }

    pub fn disconnects(&self) -> usize {
        self.calls.lock().iter().filter(|c| **c == "disconnect").count()
    }

    /// `connect`, `unregister` and `disconnect` calls, in order.
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }
}

impl LegacyScaleDriver for FakeLegacyDriver {
    fn driver_name(&self) -> &str {
        &self.name
    }

    fn register_callback(&self, callback: Option<StatusSender>) {
        if callback.is_none() {
            self.calls.lock().push("unregister");
        }
        *self.callback.lock() = callback;
    }

    fn set_selected_user(&self, user: ScaleUser) {
        *self.selected_user.lock() = Some(user);
    }

    fn set_user_list(&self, users: Vec<ScaleUser>) {
        *self.user_list.lock() = users;
    }

    fn set_unique_number(&self, base: i32) {
        *self.unique_number.lock() = Some(base);
    }

    fn set_cached_last_measurement(&self, measurement: Option<ScaleMeasurement>) {
        *self.cached_last.lock() = measurement;
    }

    fn connect(&self, address: MacAddress) -> Result<(), LegacyDriverError> {
        self.calls.lock().push("connect");
        self.connects.lock().push(address);
        if self.fail_connect {
            return Err(LegacyDriverError::Link(LinkError::Closed));
        }
        Ok(())
    }

    fn disconnect(&self) {
        self.calls.lock().push("disconnect");
    }

    fn process_user_interaction_feedback(
        &self,
        kind: InteractionKind,
        _app_user_id: i32,
        _feedback: &InteractionFeedback,
    ) -> Result<(), LegacyDriverError> {
        Err(LegacyDriverError::Unsupported(format!("{kind} feedback")))
    }
}
