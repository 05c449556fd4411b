//! Yunmai SE and Mini.
//!
//! The scale is configured with three commands on FFE5/FFE9 (user record, clock,
//! start), then streams frames on FFE0/FFE4. Only frames with `0x02` at offset 3
//! are final readings. The Mini also reports resistance and, from protocol
//! version `0x1E` on, body fat; everything else comes from [`YunmaiCalculator`].

use super::{LegacyDriverError, LegacyScaleDriver, LegacyStatus, StatusSender, unique_number};
use crate::calc::YunmaiCalculator;
use crate::codec::{HexPreview, u16_be, u32_be, uuid16, xor_checksum};
use crate::event::{InteractionFeedback, InteractionKind};
use crate::link::{GattConnection, GattEvent, GattLink, GattSession, LinkError};
use crate::mac_address::MacAddress;
use crate::measurement::ScaleMeasurement;
use crate::user::{ScaleUser, WeightUnit};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SERVICE_MEASUREMENT: Uuid = uuid16(0xFFE0);
const CHAR_MEASUREMENT: Uuid = uuid16(0xFFE4);
const SERVICE_COMMAND: Uuid = uuid16(0xFFE5);
const CHAR_COMMAND: Uuid = uuid16(0xFFE9);

const SCAN_TIMEOUT: Duration = Duration::from_secs(20);
const CONNECT_AFTER_SCAN_DELAY: Duration = Duration::from_secs(1);
const OPERATION_TIMEOUT: Duration = Duration::from_secs(5);
/// The scale needs a moment to store the user record.
const USER_COMMAND_SETTLE: Duration = Duration::from_millis(300);
/// The link is dropped after this long without a frame.
const IDLE_DISCONNECT: Duration = Duration::from_secs(60);

const START_COMMAND: [u8; 5] = [0x0d, 0x05, 0x13, 0x00, 0x16];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YunmaiVariant {
    Mini,
    Se,
}

impl YunmaiVariant {
    /// Variant for an advertised name, if it is a Yunmai at all.
    pub fn for_name(name: &str) -> Option<Self> {
        let name = name.to_uppercase();
        if name.starts_with("YUNMAI-SIGNAL") || name.starts_with("YUNMAI-ISM") {
            Some(YunmaiVariant::Mini)
        } else if name.starts_with("YUNMAI-ISSE") {
            Some(YunmaiVariant::Se)
        } else {
            None
        }
    }

    pub fn driver_name(self) -> &'static str {
        match self {
            YunmaiVariant::Mini => "Yunmai Mini",
            YunmaiVariant::Se => "Yunmai SE",
        }
    }
}

struct DriverContext {
    callback: Option<StatusSender>,
    user: Option<ScaleUser>,
    users: Vec<ScaleUser>,
    unique_base: i32,
    last_measurement: Option<ScaleMeasurement>,
}

/// Sends statuses to whatever callback is registered at the time of sending.
#[derive(Clone)]
struct Reporter(Arc<Mutex<DriverContext>>);

impl Reporter {
    fn send(&self, status: LegacyStatus) {
        debug!(?status, "yunmai status");
        if let Some(callback) = self.0.lock().callback.as_ref() {
            let _ = callback.send(status);
        }
    }
}

struct Running {
    address: MacAddress,
    stop: Arc<Notify>,
    task: JoinHandle<()>,
}

pub struct YunmaiDriver {
    variant: YunmaiVariant,
    gatt: Arc<dyn GattLink>,
    context: Arc<Mutex<DriverContext>>,
    running: Mutex<Option<Running>>,
}

impl YunmaiDriver {
    pub fn new(variant: YunmaiVariant, gatt: Arc<dyn GattLink>) -> Self {
        Self {
            variant,
            gatt,
            context: Arc::new(Mutex::new(DriverContext {
                callback: None,
                user: None,
                users: Vec::new(),
                unique_base: -1,
                last_measurement: None,
            })),
            running: Mutex::new(None),
        }
    }

    pub fn variant(&self) -> YunmaiVariant {
        self.variant
    }
}

impl Drop for YunmaiDriver {
    fn drop(&mut self) {
        if let Some(running) = self.running.lock().take() {
            running.task.abort();
        }
    }
}

impl LegacyScaleDriver for YunmaiDriver {
    fn driver_name(&self) -> &str {
        self.variant.driver_name()
    }

    fn register_callback(&self, callback: Option<StatusSender>) {
        self.context.lock().callback = callback;
    }

    fn set_selected_user(&self, user: ScaleUser) {
        self.context.lock().user = Some(user);
    }

    fn set_user_list(&self, users: Vec<ScaleUser>) {
        self.context.lock().users = users;
    }

    fn set_unique_number(&self, base: i32) {
        self.context.lock().unique_base = base;
    }

    fn set_cached_last_measurement(&self, measurement: Option<ScaleMeasurement>) {
        self.context.lock().last_measurement = measurement;
    }

    fn connect(&self, address: MacAddress) -> Result<(), LegacyDriverError> {
        let (user, unique) = {
            let context = self.context.lock();
            let user = context.user.clone().ok_or(LegacyDriverError::NoUser)?;
            debug!(
                users = context.users.len(),
                cached = context.last_measurement.is_some(),
                "yunmai user context"
            );
            let unique = unique_number(context.unique_base, &user);
            (user, unique)
        };

        let mut running = self.running.lock();
        if let Some(current) = running.as_ref().filter(|r| !r.task.is_finished()) {
            if current.address == address {
                debug!(%address, "already connecting");
                return Ok(());
            }
            return Err(LegacyDriverError::Busy(current.address));
        }

        let stop = Arc::new(Notify::new());
        let session = YunmaiSession {
            variant: self.variant,
            gatt: self.gatt.clone(),
            reporter: Reporter(self.context.clone()),
            address,
            user,
            unique,
            stop: stop.clone(),
        };
        let task = tokio::spawn(session.run());
        *running = Some(Running {
            address,
            stop,
            task,
        });
        Ok(())
    }

    fn disconnect(&self) {
        if let Some(running) = self.running.lock().as_ref() {
            running.stop.notify_one();
        }
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

struct YunmaiSession {
    variant: YunmaiVariant,
    gatt: Arc<dyn GattLink>,
    reporter: Reporter,
    address: MacAddress,
    user: ScaleUser,
    unique: i32,
    stop: Arc<Notify>,
}

enum Interrupted<T> {
    Stopped,
    Done(T),
}

impl YunmaiSession {
    async fn until_stopped<T>(&self, fut: impl Future<Output = T>) -> Interrupted<T> {
        tokio::select! {
            _ = self.stop.notified() => Interrupted::Stopped,
            value = fut => Interrupted::Done(value),
        }
    }

    async fn run(self) {
        let address = self.address;
        info!(%address, driver = self.variant.driver_name(), "connecting");

        let found = match self.until_stopped(self.gatt.find(address, SCAN_TIMEOUT)).await {
            Interrupted::Stopped => return self.reporter.send(LegacyStatus::ConnectionDisconnect(None)),
            Interrupted::Done(found) => found,
        };
        if let Err(e) = found {
            warn!(%address, error = %e, "scale not found");
            return self.reporter.send(LegacyStatus::NoDeviceFound(Some(e.to_string())));
        }

        if let Interrupted::Stopped = self
            .until_stopped(tokio::time::sleep(CONNECT_AFTER_SCAN_DELAY))
            .await
        {
            return self.reporter.send(LegacyStatus::ConnectionDisconnect(None));
        }

        let GattSession {
            connection,
            mut events,
        } = match self.until_stopped(self.gatt.connect(address)).await {
            Interrupted::Stopped => return self.reporter.send(LegacyStatus::ConnectionDisconnect(None)),
            Interrupted::Done(Err(e)) => {
                warn!(%address, error = %e, "connection failed");
                return self.reporter.send(LegacyStatus::ConnectionLost(Some(e.to_string())));
            }
            Interrupted::Done(Ok(session)) => session,
        };
        self.reporter.send(LegacyStatus::ConnectionEstablished);

        if let Err(e) = self.initialize(connection.as_ref()).await {
            warn!(%address, error = %e, "initialization failed");
            let _ = connection.disconnect().await;
            return self
                .reporter
                .send(LegacyStatus::UnexpectedError(Some(e.to_string())));
        }
        self.reporter
            .send(LegacyStatus::ScaleMessage("Step on the scale".into()));

        loop {
            tokio::select! {
                _ = self.stop.notified() => {
                    let _ = connection.disconnect().await;
                    return self.reporter.send(LegacyStatus::ConnectionDisconnect(None));
                }
                _ = tokio::time::sleep(IDLE_DISCONNECT) => {
                    info!(%address, "no data, disconnecting");
                    let _ = connection.disconnect().await;
                    return self
                        .reporter
                        .send(LegacyStatus::ConnectionDisconnect(Some("idle timeout".into())));
                }
                event = events.recv() => match event {
                    Some(GattEvent::Notification { characteristic, value }) => {
                        debug!(%characteristic, data = %HexPreview::new(&value), "notify");
                        if let Some(measurement) = decode_frame(self.variant, &value, &self.user) {
                            self.reporter.send(LegacyStatus::RetrieveScaleData(Some(measurement)));
                        }
                    }
                    Some(GattEvent::Disconnected(reason)) => {
                        return self.reporter.send(LegacyStatus::ConnectionLost(reason));
                    }
                    None => return self.reporter.send(LegacyStatus::ConnectionLost(None)),
                },
            }
        }
    }

    async fn initialize(&self, connection: &dyn GattConnection) -> Result<(), LinkError> {
        with_timeout(
            "write",
            connection.write(SERVICE_COMMAND, CHAR_COMMAND, user_command(self.unique, &self.user), true),
        )
        .await?;
        tokio::time::sleep(USER_COMMAND_SETTLE).await;
        with_timeout(
            "write",
            connection.write(SERVICE_COMMAND, CHAR_COMMAND, time_command(Utc::now()), true),
        )
        .await?;
        with_timeout("notify", connection.set_notify(SERVICE_MEASUREMENT, CHAR_MEASUREMENT)).await?;
        with_timeout(
            "write",
            connection.write(SERVICE_COMMAND, CHAR_COMMAND, START_COMMAND.to_vec(), true),
        )
        .await
    }
}

async fn with_timeout<T>(
    what: &'static str,
    fut: impl Future<Output = Result<T, LinkError>>,
) -> Result<T, LinkError> {
    tokio::time::timeout(OPERATION_TIMEOUT, fut)
        .await
        .map_err(|_| LinkError::Timeout(what))?
}

fn with_xor_trailer(mut frame: Vec<u8>) -> Vec<u8> {
    let last = frame.len() - 1;
    frame[last] = xor_checksum(&frame[1..last]);
    frame
}

/// User record: id, height, sex, age, display unit and body type.
fn user_command(unique: i32, user: &ScaleUser) -> Vec<u8> {
    let id = (unique as u16).to_be_bytes();
    let sex = if user.gender.is_male() { 0x01 } else { 0x02 };
    let unit = if matches!(user.scale_unit, WeightUnit::Kg) { 0x01 } else { 0x02 };
    with_xor_trailer(vec![
        0x0d,
        0x12,
        0x10,
        0x01,
        0x00,
        0x00,
        id[0],
        id[1],
        user.body_height as u8,
        sex,
        user.age() as u8,
        0x55,
        0x5a,
        0x00,
        0x00,
        unit,
        YunmaiCalculator::activity_flag(user.activity_level),
        0x00,
    ])
}

fn time_command(now: DateTime<Utc>) -> Vec<u8> {
    let ts = (now.timestamp() as u32).to_be_bytes();
    with_xor_trailer(vec![
        0x0d, 0x0d, 0x11, ts[0], ts[1], ts[2], ts[3], 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    ])
}

/// Final reading of a notification frame, `None` for progress frames.
fn decode_frame(variant: YunmaiVariant, data: &[u8], user: &ScaleUser) -> Option<ScaleMeasurement> {
    if data.get(3) != Some(&0x02) {
        return None;
    }
    let timestamp = u32_be(data, 5)?;
    let weight = f32::from(u16_be(data, 13)?) / 100.0;
    let mut measurement = ScaleMeasurement {
        user_id: Some(user.id),
        date_time: DateTime::from_timestamp(i64::from(timestamp), 0),
        weight,
        ..ScaleMeasurement::default()
    };

    if variant == YunmaiVariant::Mini {
        let calc = YunmaiCalculator::new(user.gender.sex_flag(), user.body_height, user.activity_level);
        let resistance = u16_be(data, 15)?;
        let fat = if (data[1] as i8) >= 0x1E {
            f32::from(u16_be(data, 17)?) / 100.0
        } else {
            calc.fat(user.age(), weight, i32::from(resistance))
        };
        debug!(weight, fat, resistance, "yunmai reading");

        if fat != 0.0 {
            measurement.fat = fat;
            measurement.muscle = calc.muscle(fat);
            measurement.water = calc.water(fat);
            measurement.bone = calc.bone_mass(measurement.muscle, weight);
            measurement.lbm = calc.lean_body_mass(weight, fat);
            measurement.visceral_fat = calc.visceral_fat(fat, user.age());
        } else {
            warn!(weight, resistance, "body fat is zero");
        }
    }
    Some(measurement)
}
