//! Soehnle Shape / Style scales.
//!
//! A vendor service (352e3000-…) carries measurements and commands, next to
//! the standard battery, current time and user data services. The scale keeps
//! up to seven users of its own. Which app user sits in which scale index is
//! stored in driver settings under `userScaleIndex{n}`, `-1` meaning free.
//!
//! With no mapping at all the scale gets a factory reset first, so the indexes
//! it hands out start from a known state.

use super::{
    DeviceCapability, DeviceSupport, HandlerContext, HandlerError, LinkMode, ScaleDeviceHandler,
};
use crate::advertisement::ScannedDeviceInfo;
use crate::calc::SoehnleCalculator;
use crate::codec::{HexPreview, u16_be, uuid16};
use crate::measurement::ScaleMeasurement;
use crate::user::{ActivityLevel, ScaleUser};
use chrono::{DateTime, Datelike, Local, NaiveDate, TimeZone, Timelike, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

const SVC_BATTERY: Uuid = uuid16(0x180F);
const CHR_BATTERY_LEVEL: Uuid = uuid16(0x2A19);

const SVC_CURRENT_TIME: Uuid = uuid16(0x1805);
const CHR_CURRENT_TIME: Uuid = uuid16(0x2A2B);

const SVC_USER_DATA: Uuid = uuid16(0x181C);
const CHR_USER_CONTROL_POINT: Uuid = uuid16(0x2A9F);
const CHR_USER_AGE: Uuid = uuid16(0x2A80);
const CHR_USER_GENDER: Uuid = uuid16(0x2A8C);
const CHR_USER_HEIGHT: Uuid = uuid16(0x2A8E);

const SVC_SOEHNLE: Uuid = Uuid::from_u128(0x352e3000_28e9_40b8_a361_6db4cca4147c);
const CHR_SOEHNLE_A: Uuid = Uuid::from_u128(0x352e3001_28e9_40b8_a361_6db4cca4147c);
const CHR_SOEHNLE_B: Uuid = Uuid::from_u128(0x352e3004_28e9_40b8_a361_6db4cca4147c);
const CHR_SOEHNLE_CMD: Uuid = Uuid::from_u128(0x352e3002_28e9_40b8_a361_6db4cca4147c);

const SCALE_INDEXES: std::ops::RangeInclusive<i32> = 1..=7;
const NO_USER: i32 = -1;

const UCP_CREATE_USER: [u8; 3] = [0x01, 0x00, 0x00];
const UCP_RESPONSE: u8 = 0x20;
const CMD_FACTORY_RESET: [u8; 2] = [0x0B, 0xFF];
const CMD_HISTORY: u8 = 0x09;
const LOW_BATTERY_PERCENT: u8 = 10;

#[derive(Debug, Default)]
pub struct SoehnleHandler;

impl SoehnleHandler {
    pub fn new() -> Self {
        Self
    }

    fn index_key(index: i32) -> String {
        format!("userScaleIndex{index}")
    }

    fn user_for_index(ctx: &HandlerContext, index: i32) -> i32 {
        ctx.settings
            .get_int(&Self::index_key(index), NO_USER)
            .unwrap_or(NO_USER)
    }

    fn index_for_user(ctx: &HandlerContext, app_user_id: i32) -> Option<i32> {
        SCALE_INDEXES.clone().find(|i| Self::user_for_index(ctx, *i) == app_user_id)
    }

    fn factory_reset(ctx: &HandlerContext) {
        debug!("Soehnle factory reset, clearing index mappings");
        ctx.write(SVC_SOEHNLE, CHR_SOEHNLE_CMD, &CMD_FACTORY_RESET);
        for index in SCALE_INDEXES {
            ctx.settings.put_int(&Self::index_key(index), NO_USER);
        }
    }

    fn current_time_payload(now: DateTime<Local>) -> [u8; 10] {
        let [year_lo, year_hi] = (now.year() as u16).to_le_bytes();
        [
            year_lo,
            year_hi,
            now.month() as u8,
            now.day() as u8,
            now.hour() as u8,
            now.minute() as u8,
            now.second() as u8,
            now.weekday().number_from_monday() as u8,
            0x00,
            0x00,
        ]
    }

    /// The vendor formulas count heavy and extreme as 4 and 5.
    fn activity(level: ActivityLevel) -> i32 {
        match level {
            ActivityLevel::Sedentary => 0,
            ActivityLevel::Mild => 1,
            ActivityLevel::Moderate => 2,
            ActivityLevel::Heavy => 4,
            ActivityLevel::Extreme => 5,
        }
    }

    fn handle_battery(ctx: &HandlerContext, data: &[u8]) {
        if let Some(&level) = data.first() {
            debug!(level, "Soehnle battery");
            if level <= LOW_BATTERY_PERCENT {
                ctx.warn(format!("Scale battery low ({level}%)"));
            }
        }
    }

    fn handle_user_control_point(ctx: &HandlerContext, data: &[u8], user: &ScaleUser) {
        let [UCP_RESPONSE, op, result, rest @ ..] = data else {
            return;
        };
        match op {
            0x01 if *result == 0x01 => {
                let Some(&index) = rest.first() else {
                    return;
                };
                debug!(index, app_user_id = user.id, "Soehnle user created");
                ctx.settings.put_int(&Self::index_key(i32::from(index)), user.id);
                ctx.info("Step on the scale for a reference measurement");
            }
            0x01 => ctx.error("Could not create the user on the scale"),
            0x02 if *result != 0x01 => {
                warn!(result, "Soehnle user select failed, creating instead");
                ctx.write(SVC_USER_DATA, CHR_USER_CONTROL_POINT, &UCP_CREATE_USER);
            }
            _ => {}
        }
    }

    /// History frame: `09 idx yyyy mm dd hh mi ss wwww imp5 imp50`, big endian.
    fn handle_measurement(ctx: &HandlerContext, data: &[u8], user: &ScaleUser) {
        if data.len() != 15 || data[0] != CMD_HISTORY {
            return;
        }
        let (Some(year), Some(raw_weight), Some(imp5), Some(imp50)) =
            (u16_be(data, 2), u16_be(data, 9), u16_be(data, 11), u16_be(data, 13))
        else {
            return;
        };
        let index = i32::from(data[1]);
        let app_user_id = Self::user_for_index(ctx, index);
        if app_user_id == NO_USER {
            warn!(index, "Soehnle reading for an unknown scale index");
            return;
        }

        let date_time = NaiveDate::from_ymd_opt(i32::from(year), u32::from(data[4]), u32::from(data[5]))
            .and_then(|d| d.and_hms_opt(u32::from(data[6]), u32::from(data[7]), u32::from(data[8])))
            .and_then(|naive| Local.from_local_datetime(&naive).earliest())
            .map(|local| local.with_timezone(&Utc));

        let weight = f32::from(raw_weight) / 10.0;
        let (imp5, imp50) = (f32::from(imp5), f32::from(imp50));
        let lib = SoehnleCalculator::new(
            user.gender.is_male(),
            user.age(),
            user.body_height,
            Self::activity(user.activity_level),
        );
        debug!(index, weight, imp5, imp50, "Soehnle reading");
        ctx.publish(ScaleMeasurement {
            date_time,
            user_id: Some(app_user_id),
            weight,
            fat: lib.fat(weight, imp50),
            water: lib.water(weight, imp50),
            muscle: lib.muscle(weight, imp50, imp5),
            ..ScaleMeasurement::default()
        });
    }
}

impl ScaleDeviceHandler for SoehnleHandler {
    fn name(&self) -> &'static str {
        "SoehnleHandler"
    }

    fn reset(&mut self) {}

    fn support_for(&self, device: &ScannedDeviceInfo) -> Option<DeviceSupport> {
        let name = device.name.as_deref()?;
        if !["Shape200", "Shape100", "Shape50", "Style100"]
            .iter()
            .any(|prefix| name.starts_with(prefix))
        {
            return None;
        }
        let caps = [
            DeviceCapability::BodyComposition,
            DeviceCapability::TimeSync,
            DeviceCapability::UserSync,
            DeviceCapability::HistoryRead,
            DeviceCapability::BatteryLevel,
        ];
        Some(
            DeviceSupport::new("Soehnle Scale", LinkMode::ConnectGatt)
                .capabilities(&caps)
                .implemented(&caps),
        )
    }

    fn on_connected(&mut self, ctx: &HandlerContext, user: &ScaleUser) -> Result<(), HandlerError> {
        if SCALE_INDEXES.clone().all(|i| Self::user_for_index(ctx, i) == NO_USER) {
            Self::factory_reset(ctx);
        }

        ctx.set_notify_on(SVC_BATTERY, CHR_BATTERY_LEVEL);
        ctx.read(SVC_BATTERY, CHR_BATTERY_LEVEL);
        ctx.write(SVC_CURRENT_TIME, CHR_CURRENT_TIME, &Self::current_time_payload(Local::now()));
        ctx.set_notify_on(SVC_USER_DATA, CHR_USER_CONTROL_POINT);

        match Self::index_for_user(ctx, user.id) {
            Some(index) => {
                debug!(index, app_user_id = user.id, "Soehnle selecting user");
                ctx.write(SVC_USER_DATA, CHR_USER_CONTROL_POINT, &[0x02, index as u8, 0x00, 0x00]);
            }
            None => ctx.write(SVC_USER_DATA, CHR_USER_CONTROL_POINT, &UCP_CREATE_USER),
        }

        ctx.write(SVC_USER_DATA, CHR_USER_AGE, &[user.age().clamp(0, 255) as u8]);
        ctx.write(SVC_USER_DATA, CHR_USER_GENDER, &[u8::from(!user.gender.is_male())]);
        ctx.write(SVC_USER_DATA, CHR_USER_HEIGHT, &(user.body_height as i16).to_le_bytes());

        ctx.set_notify_on(SVC_SOEHNLE, CHR_SOEHNLE_A);
        ctx.set_notify_on(SVC_SOEHNLE, CHR_SOEHNLE_B);
        for index in SCALE_INDEXES {
            ctx.write(SVC_SOEHNLE, CHR_SOEHNLE_CMD, &[CMD_HISTORY, index as u8]);
        }
        Ok(())
    }

    fn on_notification(
        &mut self,
        ctx: &HandlerContext,
        characteristic: Uuid,
        data: &[u8],
        user: &ScaleUser,
    ) -> Result<(), HandlerError> {
        if characteristic == CHR_SOEHNLE_A {
            Self::handle_measurement(ctx, data, user);
        } else if characteristic == CHR_USER_CONTROL_POINT {
            Self::handle_user_control_point(ctx, data, user);
        } else if characteristic == CHR_BATTERY_LEVEL {
            Self::handle_battery(ctx, data);
        } else {
            debug!(%characteristic, data = %HexPreview::new(data), "Soehnle notify");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{ContextBuilder, Recorder, TEST_MAC, test_user};
    use serde_json::json;

    fn settings_key(key: &str) -> String {
        format!("ble/SoehnleHandler/{TEST_MAC}/{key}")
    }

    fn writes_to(recorder: &Recorder, characteristic: Uuid) -> Vec<Vec<u8>> {
        recorder
            .transport
            .writes()
            .into_iter()
            .filter(|w| w.characteristic == characteristic)
            .map(|w| w.payload)
            .collect()
    }

    /// 2024-03-05 07:08:09, 80.0 kg, imp5 550, imp50 500.
    fn history_frame(index: u8) -> Vec<u8> {
        let mut frame = vec![CMD_HISTORY, index, 0x07, 0xE8, 3, 5, 7, 8, 9];
        frame.extend_from_slice(&800u16.to_be_bytes());
        frame.extend_from_slice(&550u16.to_be_bytes());
        frame.extend_from_slice(&500u16.to_be_bytes());
        frame
    }

    #[test]
    fn test_support_by_name_prefix() {
        let handler = SoehnleHandler::new();
        for name in ["Shape200 AB12", "Shape50", "Style100 X"] {
            let device = ScannedDeviceInfo::new(TEST_MAC).with_name(name);
            let support = handler.support_for(&device).unwrap();
            assert_eq!(support.display_name, "Soehnle Scale");
            assert_eq!(support.link_mode, LinkMode::ConnectGatt);
        }
        let other = ScannedDeviceInfo::new(TEST_MAC).with_name("Shape10");
        assert!(handler.support_for(&other).is_none());
        assert!(handler.support_for(&ScannedDeviceInfo::new(TEST_MAC)).is_none());
    }

    #[tokio::test]
    async fn test_first_connect_resets_scale_and_creates_user() {
        let user = test_user();
        let (ctx, recorder) = ContextBuilder::new(TEST_MAC)
            .handler("SoehnleHandler")
            .user(user.clone())
            .build()
            .await;
        let mut handler = SoehnleHandler::new();
        handler.on_connected(&ctx, &user).unwrap();

        let writes = recorder.transport.writes();
        assert_eq!(writes[0].characteristic, CHR_SOEHNLE_CMD);
        assert_eq!(writes[0].payload, CMD_FACTORY_RESET.to_vec());
        assert_eq!(writes[1].characteristic, CHR_CURRENT_TIME);
        assert_eq!(writes_to(&recorder, CHR_USER_CONTROL_POINT), vec![UCP_CREATE_USER.to_vec()]);
        assert_eq!(writes_to(&recorder, CHR_USER_GENDER), vec![vec![0x00]]);
        assert_eq!(writes_to(&recorder, CHR_USER_HEIGHT), vec![vec![180, 0]]);

        let history = writes_to(&recorder, CHR_SOEHNLE_CMD);
        assert_eq!(history.len(), 8);
        assert_eq!(history[1], vec![CMD_HISTORY, 1]);
        assert_eq!(history[7], vec![CMD_HISTORY, 7]);
        assert_eq!(
            recorder.transport.notified(),
            vec![
                (SVC_BATTERY, CHR_BATTERY_LEVEL),
                (SVC_USER_DATA, CHR_USER_CONTROL_POINT),
                (SVC_SOEHNLE, CHR_SOEHNLE_A),
                (SVC_SOEHNLE, CHR_SOEHNLE_B),
            ]
        );
        assert_eq!(ctx.settings.get_int("userScaleIndex4", 0).unwrap(), NO_USER);
    }

    #[tokio::test]
    async fn test_known_user_is_selected() {
        let user = test_user();
        let (ctx, recorder) = ContextBuilder::new(TEST_MAC)
            .handler("SoehnleHandler")
            .user(user.clone())
            .setting(settings_key("userScaleIndex3"), json!(user.id))
            .build()
            .await;
        let mut handler = SoehnleHandler::new();
        handler.on_connected(&ctx, &user).unwrap();

        assert_eq!(writes_to(&recorder, CHR_USER_CONTROL_POINT), vec![vec![0x02, 3, 0x00, 0x00]]);
        let commands = writes_to(&recorder, CHR_SOEHNLE_CMD);
        assert_eq!(commands.len(), 7);
        assert!(!commands.contains(&CMD_FACTORY_RESET.to_vec()));
    }

    #[tokio::test]
    async fn test_create_response_stores_index() {
        let user = test_user();
        let (ctx, recorder) = ContextBuilder::new(TEST_MAC)
            .handler("SoehnleHandler")
            .user(user.clone())
            .build()
            .await;
        let mut handler = SoehnleHandler::new();
        handler
            .on_notification(&ctx, CHR_USER_CONTROL_POINT, &[UCP_RESPONSE, 0x01, 0x01, 0x05], &user)
            .unwrap();

        assert_eq!(ctx.settings.get_int("userScaleIndex5", NO_USER).unwrap(), user.id);
        assert_eq!(recorder.infos().len(), 1);

        handler
            .on_notification(&ctx, CHR_USER_CONTROL_POINT, &[UCP_RESPONSE, 0x01, 0x04, 0x06], &user)
            .unwrap();
        assert_eq!(ctx.settings.get_int("userScaleIndex6", NO_USER).unwrap(), NO_USER);
        assert_eq!(recorder.errors().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_select_falls_back_to_create() {
        let user = test_user();
        let (ctx, recorder) = ContextBuilder::new(TEST_MAC).user(user.clone()).build().await;
        let mut handler = SoehnleHandler::new();
        handler
            .on_notification(&ctx, CHR_USER_CONTROL_POINT, &[UCP_RESPONSE, 0x02, 0x05], &user)
            .unwrap();
        assert_eq!(writes_to(&recorder, CHR_USER_CONTROL_POINT), vec![UCP_CREATE_USER.to_vec()]);
    }

    #[tokio::test]
    async fn test_history_frame_published_for_mapped_index() {
        let user = test_user();
        let (ctx, recorder) = ContextBuilder::new(TEST_MAC)
            .handler("SoehnleHandler")
            .user(user.clone())
            .setting(settings_key("userScaleIndex2"), json!(7))
            .build()
            .await;
        let mut handler = SoehnleHandler::new();
        handler.on_notification(&ctx, CHR_SOEHNLE_A, &history_frame(2), &user).unwrap();
        handler.on_notification(&ctx, CHR_SOEHNLE_A, &history_frame(3), &user).unwrap();
        handler.on_notification(&ctx, CHR_SOEHNLE_A, &history_frame(2)[..14], &user).unwrap();

        let published = recorder.published();
        assert_eq!(published.len(), 1);
        let m = &published[0];
        assert_eq!(m.user_id, Some(7));
        assert!((m.weight - 80.0).abs() < 1e-4);
        let local = m.date_time.unwrap().with_timezone(&Local);
        assert_eq!((local.year(), local.month(), local.day()), (2024, 3, 5));
        assert_eq!((local.hour(), local.minute(), local.second()), (7, 8, 9));

        let lib = SoehnleCalculator::new(true, user.age(), 180.0, 1);
        assert_eq!(m.fat, lib.fat(80.0, 500.0));
        assert_eq!(m.water, lib.water(80.0, 500.0));
        assert_eq!(m.muscle, lib.muscle(80.0, 500.0, 550.0));
    }

    #[tokio::test]
    async fn test_low_battery_warns() {
        let user = test_user();
        let (ctx, recorder) = ContextBuilder::new(TEST_MAC).user(user.clone()).build().await;
        let mut handler = SoehnleHandler::new();
        handler.on_notification(&ctx, CHR_BATTERY_LEVEL, &[55], &user).unwrap();
        assert!(recorder.warnings().is_empty());
        handler.on_notification(&ctx, CHR_BATTERY_LEVEL, &[9], &user).unwrap();
        assert_eq!(recorder.warnings(), vec!["Scale battery low (9%)".to_string()]);
    }
}
