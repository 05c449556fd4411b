//! Broadcast-only adapter.
//!
//! There is no connection: the session scans for the address and hands every
//! admitted advertisement to the handler until it reports a final reading.
//! "Connecting" means scanning; the connected flag never goes up.
//!
//! Admission, in order: the address, the optional RSSI floor, de-duplication of
//! identical packets (payload plus a coarse RSSI bucket) inside the dedup
//! window, and a stabilize window that keeps bursts from reaching the handler
//! back to back. The first forward of an attempt is never held back.

use super::{AdapterCallbacks, AdapterCore, AdapterEnv, Communicator, SessionTicket};
use crate::advertisement::ScannedDeviceInfo;
use crate::codec::HexPreview;
use crate::event::{BluetoothEvent, EventStream, InteractionFeedback, InteractionKind};
use crate::handler::{
    BroadcastAction, HandlerContext, HandlerSession, ScaleDeviceHandler, SessionData, Transport,
};
use crate::link::{AdvertisementSource, ScanFilter};
use crate::mac_address::MacAddress;
use crate::settings::DriverSettings;
use crate::tuning::BroadcastTuning;
use crate::user::ScaleUser;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Rolling hash of an advertisement. The RSSI is folded in as a 3 dB bucket so
/// level jitter alone does not count as new data.
pub fn content_hash(bytes: &[u8], rssi: i16) -> i32 {
    if bytes.is_empty() {
        return i32::from(rssi);
    }
    let mut h: i32 = 1_125_899_907;
    for b in bytes {
        h = h.wrapping_mul(131) ^ i32::from(*b);
    }
    (h << 1) ^ (i32::from(rssi) / 3)
}

/// Per-attempt admission state.
struct PacketFilter {
    address: MacAddress,
    min_rssi: Option<i16>,
    dedup_window: Duration,
    stabilize_window: Duration,
    seen: HashMap<i32, Instant>,
    last_forward: Option<Instant>,
}

impl PacketFilter {
    fn new(address: MacAddress, tuning: &BroadcastTuning) -> Self {
        Self {
            address,
            min_rssi: tuning.min_rssi_dbm,
            dedup_window: Duration::from_millis(tuning.packet_dedup_window_ms),
            stabilize_window: Duration::from_millis(tuning.stabilize_window_ms),
            seen: HashMap::new(),
            last_forward: None,
        }
    }

    fn admit(&mut self, device: &ScannedDeviceInfo, now: Instant) -> bool {
        if device.address != self.address {
            return false;
        }
        if let Some(min) = self.min_rssi
            && device.rssi < min
        {
            debug!(rssi = device.rssi, min, "advertisement below RSSI floor");
            return false;
        }

        let hash = content_hash(&device.payload_bytes(), device.rssi);
        if let Some(last) = self.seen.get(&hash)
            && now.duration_since(*last) <= self.dedup_window
        {
            debug!(hash, "duplicate advertisement");
            return false;
        }
        self.seen.insert(hash, now);
        let window = self.dedup_window;
        self.seen.retain(|_, at| now.duration_since(*at) <= window);

        if let Some(last) = self.last_forward
            && now.duration_since(last) < self.stabilize_window
        {
            debug!("inside stabilize window, not forwarded");
            return false;
        }
        true
    }

    fn forwarded(&mut self, now: Instant) {
        self.last_forward = Some(now);
    }
}

/// Handlers of broadcast scales have nothing to write; a disconnect request ends listening.
struct ListeningTransport {
    stop: Arc<Notify>,
}

impl Transport for ListeningTransport {
    fn set_notify_on(&self, _service: Uuid, _characteristic: Uuid) {}

    fn write(&self, _service: Uuid, _characteristic: Uuid, _payload: &[u8], _with_response: bool) {}

    fn read(&self, _service: Uuid, _characteristic: Uuid) {}

    fn disconnect(&self) {
        self.stop.notify_one();
    }

    fn has_characteristic(&self, _service: Uuid, _characteristic: Uuid) -> bool {
        false
    }
}

enum AttemptEnd {
    Complete,
    Stopped,
    TimedOut,
    ScanFailed(String),
}

struct Shared {
    core: AdapterCore,
    handler_name: &'static str,
    handler: Arc<Mutex<HandlerSession>>,
    source: Arc<dyn AdvertisementSource>,
    tuning: BroadcastTuning,
    env: AdapterEnv,
}

impl Shared {
    async fn run(self: Arc<Self>, ticket: SessionTicket, user: ScaleUser) {
        let address = ticket.address;
        let cooldown = self.core.cooldown_remaining();
        if !cooldown.is_zero() {
            debug!(%address, ?cooldown, "cooldown before listening");
            sleep(cooldown).await;
        }

        let settings = DriverSettings::load(self.env.store.clone(), self.handler_name, address).await;
        let ctx = HandlerContext {
            transport: Arc::new(ListeningTransport {
                stop: ticket.stop.clone(),
            }),
            callbacks: Arc::new(AdapterCallbacks::new(&self.core, address)),
            settings,
            data: SessionData::new(Some(user), self.env.users.clone()),
        };
        self.handler.lock().attach(ctx);
        info!(%address, handler = self.handler_name, "listening");
        self.core.emit(BluetoothEvent::Listening(address));

        let outcome = self.listen(&ticket).await;

        let detached = {
            let mut handler = self.handler.lock();
            handler.handle_disconnected();
            handler.detach()
        };
        if let Some(ctx) = detached {
            ctx.settings.flush().await;
        }
        self.core.finish(&ticket, outcome);
    }

    async fn listen(&self, ticket: &SessionTicket) -> BluetoothEvent {
        let address = ticket.address;
        let retries = self.tuning.common.max_retries;
        let mut attempt = 0;
        loop {
            debug!(%address, attempt = attempt + 1, "broadcast scan attempt");
            match self.scan_attempt(ticket).await {
                AttemptEnd::Complete => return BluetoothEvent::BroadcastComplete(address),
                AttemptEnd::Stopped => {
                    return BluetoothEvent::Disconnected {
                        address,
                        reason: Some("disconnect requested".into()),
                    };
                }
                AttemptEnd::ScanFailed(error) => {
                    warn!(%address, %error, "scan could not be started");
                    return BluetoothEvent::ConnectionFailed { address, error };
                }
                AttemptEnd::TimedOut => {
                    attempt += 1;
                    if attempt > retries {
                        warn!(%address, "no final reading, giving up");
                        return BluetoothEvent::ConnectionFailed {
                            address,
                            error: format!("no final reading after {attempt} scan attempts"),
                        };
                    }
                    warn!(%address, attempt, "broadcast scan timed out, retrying");
                    self.core.emit(BluetoothEvent::message(
                        format!("rescanning ({attempt}/{retries})"),
                        address,
                    ));
                    tokio::select! {
                        _ = ticket.stop.notified() => {
                            return BluetoothEvent::Disconnected {
                                address,
                                reason: Some("disconnect requested".into()),
                            };
                        }
                        _ = sleep(self.tuning.common.retry_backoff()) => {}
                    }
                }
            }
        }
    }

    async fn scan_attempt(&self, ticket: &SessionTicket) -> AttemptEnd {
        let address = ticket.address;
        let scan = tokio::select! {
            _ = ticket.stop.notified() => return AttemptEnd::Stopped,
            scan = self.source.scan(ScanFilter::address(address)) => scan,
        };
        let mut adverts = match scan {
            Ok(rx) => rx,
            Err(e) => return AttemptEnd::ScanFailed(e.to_string()),
        };

        let mut filter = PacketFilter::new(address, &self.tuning);
        let deadline = sleep(Duration::from_millis(self.tuning.max_scan_ms));
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = ticket.stop.notified() => return AttemptEnd::Stopped,
                _ = &mut deadline => return AttemptEnd::TimedOut,
                advert = adverts.recv() => {
                    let Some(device) = advert else {
                        debug!(%address, "scan ended early");
                        return AttemptEnd::TimedOut;
                    };
                    let now = Instant::now();
                    if !filter.admit(&device, now) {
                        continue;
                    }
                    debug!(
                        %address,
                        rssi = device.rssi,
                        data = %HexPreview::new(&device.payload_bytes()),
                        "forwarding advertisement"
                    );
                    let action = self.handler.lock().handle_advertisement(&device);
                    debug!(%address, ?action, "handler answered");
                    match action {
                        BroadcastAction::Ignored => {}
                        BroadcastAction::ConsumedKeepScanning => {
                            filter.forwarded(now);
                            self.core
                                .emit(BluetoothEvent::message("Waiting for measurement", address));
                        }
                        BroadcastAction::ConsumedStop => {
                            filter.forwarded(now);
                            return AttemptEnd::Complete;
                        }
                    }
                }
            }
        }
    }
}

pub struct BroadcastAdapter {
    shared: Arc<Shared>,
}

impl BroadcastAdapter {
    pub fn new(
        handler: Box<dyn ScaleDeviceHandler>,
        source: Arc<dyn AdvertisementSource>,
        tuning: BroadcastTuning,
        env: AdapterEnv,
    ) -> Self {
        let handler_name = handler.name();
        Self {
            shared: Arc::new(Shared {
                core: AdapterCore::new(handler_name, tuning.common.reconnect_cooldown()),
                handler_name,
                handler: Arc::new(Mutex::new(HandlerSession::new(handler))),
                source,
                tuning,
                env,
            }),
        }
    }
}

impl Communicator for BroadcastAdapter {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::StaticUsers;
    use crate::settings::MemoryStore;
    use crate::handler::aaax::AaaxHandler;
    use crate::test_utils::{
        EchoHandler, FakeAdvertisementSource, TEST_MAC, aaax_final_advert, drain, echo_advert,
        test_user,
    };
    use crate::tuning::TuningProfile;

    fn adapter(source: FakeAdvertisementSource, profile: TuningProfile) -> (BroadcastAdapter, Arc<FakeAdvertisementSource>) {
        adapter_with(Box::new(EchoHandler::broadcast()), source, profile)
    }

    fn adapter_with(
        handler: Box<dyn ScaleDeviceHandler>,
        source: FakeAdvertisementSource,
        profile: TuningProfile,
    ) -> (BroadcastAdapter, Arc<FakeAdvertisementSource>) {
        let source = Arc::new(source);
        let adapter = BroadcastAdapter::new(
            handler,
            source.clone(),
            profile.for_broadcast(),
            AdapterEnv {
                store: Arc::new(MemoryStore::new()),
                users: Arc::new(StaticUsers::new(vec![test_user()])),
            },
        );
        (adapter, source)
    }

    fn weights(events: &[BluetoothEvent]) -> Vec<f32> {
        events
            .iter()
            .filter_map(|e| match e {
                BluetoothEvent::MeasurementReceived { measurement, .. } => Some(measurement.weight),
                _ => None,
            })
            .collect()
    }

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[test]
    fn test_content_hash() {
        assert_eq!(content_hash(&[], -70), -70);
        // -60 and -61 share a bucket, -63 does not
        assert_eq!(content_hash(&[1, 2, 3], -60), content_hash(&[1, 2, 3], -61));
        assert_ne!(content_hash(&[1, 2, 3], -60), content_hash(&[1, 2, 3], -63));
        assert_ne!(content_hash(&[1, 2, 3], -60), content_hash(&[1, 2, 4], -60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_listen_until_final_reading() {
        let (adapter, _source) = adapter(
            FakeAdvertisementSource::new()
                .attempt(vec![(ms(100), echo_advert(70, false)), (ms(1000), echo_advert(71, true))]),
            TuningProfile::Balanced,
        );
        let mut events = adapter.events();
        adapter.connect(TEST_MAC, Some(test_user()));
        assert!(*adapter.connecting().borrow());

        let all = drain(&mut events).await;
        assert_eq!(all.first(), Some(&BluetoothEvent::Listening(TEST_MAC)));
        assert_eq!(weights(&all), vec![70.0, 71.0]);
        assert!(all.contains(&BluetoothEvent::message("Waiting for measurement", TEST_MAC)));
        assert_eq!(all.last(), Some(&BluetoothEvent::BroadcastComplete(TEST_MAC)));
        assert_eq!(all.iter().filter(|e| e.is_terminal()).count(), 1);
        assert!(!*adapter.connected().borrow());
        assert!(!*adapter.connecting().borrow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicates_and_stabilize_window() {
        let (adapter, _source) = adapter(
            FakeAdvertisementSource::new().attempt(vec![
                (ms(100), echo_advert(70, false)),
                // same packet inside the dedup window
                (ms(100), echo_advert(70, false)),
                // new data, but inside the stabilize window of the first forward
                (ms(100), echo_advert(72, false)),
                (ms(600), echo_advert(73, true)),
            ]),
            TuningProfile::Balanced,
        );
        let mut events = adapter.events();
        adapter.connect(TEST_MAC, Some(test_user()));
        let all = drain(&mut events).await;
        assert_eq!(weights(&all), vec![70.0, 73.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rssi_floor() {
        let mut weak = echo_advert(60, true);
        weak.rssi = -95;
        let (adapter, _source) = adapter(
            FakeAdvertisementSource::new().attempt(vec![(ms(100), weak), (ms(100), echo_advert(61, true))]),
            TuningProfile::Aggressive,
        );
        let mut events = adapter.events();
        adapter.connect(TEST_MAC, Some(test_user()));
        let all = drain(&mut events).await;
        assert_eq!(weights(&all), vec![61.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_addresses_are_ignored() {
        let mut other = echo_advert(60, true);
        other.address = MacAddress([1, 2, 3, 4, 5, 6]);
        let (adapter, _source) = adapter(
            FakeAdvertisementSource::new().attempt(vec![(ms(100), other), (ms(100), echo_advert(61, true))]),
            TuningProfile::Balanced,
        );
        let mut events = adapter.events();
        adapter.connect(TEST_MAC, Some(test_user()));
        let all = drain(&mut events).await;
        assert_eq!(weights(&all), vec![61.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_attempts_exhausted() {
        let (adapter, source) = adapter(FakeAdvertisementSource::new(), TuningProfile::Balanced);
        let mut events = adapter.events();
        adapter.connect(TEST_MAC, Some(test_user()));

        let terminal = events.until_terminal().await;
        assert!(matches!(terminal, Some(BluetoothEvent::ConnectionFailed { .. })));
        assert_eq!(source.scans(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_timeout() {
        let (adapter, source) = adapter(
            FakeAdvertisementSource::new()
                .attempt(vec![])
                .attempt(vec![(ms(100), echo_advert(80, true))]),
            TuningProfile::Balanced,
        );
        let mut events = adapter.events();
        adapter.connect(TEST_MAC, Some(test_user()));
        let all = drain(&mut events).await;
        assert!(all.contains(&BluetoothEvent::message("rescanning (1/3)", TEST_MAC)));
        assert_eq!(weights(&all), vec![80.0]);
        assert_eq!(all.last(), Some(&BluetoothEvent::BroadcastComplete(TEST_MAC)));
        assert_eq!(source.scans(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_while_listening() {
        let (adapter, _source) = adapter(FakeAdvertisementSource::new(), TuningProfile::Balanced);
        let mut events = adapter.events();
        adapter.connect(TEST_MAC, Some(test_user()));
        assert_eq!(events.recv().await, Some(BluetoothEvent::Listening(TEST_MAC)));

        adapter.disconnect();
        adapter.disconnect();
        let rest = drain(&mut events).await;
        assert_eq!(rest.iter().filter(|e| e.is_terminal()).count(), 1);
        assert!(matches!(rest.last(), Some(BluetoothEvent::Disconnected { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_start_failure() {
        let (adapter, _source) = adapter(FakeAdvertisementSource::failing(), TuningProfile::Balanced);
        let mut events = adapter.events();
        adapter.connect(TEST_MAC, Some(test_user()));
        assert!(matches!(
            events.until_terminal().await,
            Some(BluetoothEvent::ConnectionFailed { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_session_publishes_again() {
        let (adapter, source) = adapter_with(
            Box::new(AaaxHandler::new()),
            FakeAdvertisementSource::new()
                .attempt(vec![(ms(100), aaax_final_advert(70_000))])
                .attempt(vec![(ms(100), aaax_final_advert(70_500))]),
            TuningProfile::Balanced,
        );
        let mut events = adapter.events();

        adapter.connect(TEST_MAC, Some(test_user()));
        let first = drain(&mut events).await;
        assert_eq!(weights(&first), vec![70.0]);
        assert_eq!(first.last(), Some(&BluetoothEvent::BroadcastComplete(TEST_MAC)));

        adapter.connect(TEST_MAC, Some(test_user()));
        let second = drain(&mut events).await;
        assert_eq!(second.first(), Some(&BluetoothEvent::Listening(TEST_MAC)));
        assert_eq!(weights(&second), vec![70.5]);
        assert_eq!(second.last(), Some(&BluetoothEvent::BroadcastComplete(TEST_MAC)));
        assert_eq!(second.iter().filter(|e| e.is_terminal()).count(), 1);
        assert_eq!(source.scans(), 2);
    }
}
