//! 1byone "Health Scale" and the Eufy C1 (T9146) / P1 (T9147), which share its protocol.
//!
//! Commands go to FFF1, everything comes back on FFF4:
//!
//! 1. `FD 37 unit group 00.. xor` selects unit and user group.
//! 2. `F1 yyyy mm dd HH MM SS` sets the clock, acknowledged with `F1 00`.
//! 3. `F2 00` requests history: `CF` records, then `F2 00` again. If any came,
//!    `F2 01` clears them.
//!
//! Live readings are `CF` frames too, 11 bytes, or 18+ with a timestamp.

use super::{
    DeviceCapability, DeviceSupport, HandlerContext, HandlerError, LinkMode, ScaleDeviceHandler,
};
use crate::advertisement::ScannedDeviceInfo;
use crate::calc::OneByoneCalculator;
use crate::codec::{HexPreview, u16_be, u16_le, uuid16, xor_checksum};
use crate::measurement::ScaleMeasurement;
use crate::user::{ActivityLevel, ScaleUser, WeightUnit};
use chrono::{DateTime, Datelike, Local, NaiveDate, TimeZone, Timelike, Utc};
use tracing::debug;
use uuid::Uuid;

const SVC_MAIN: Uuid = uuid16(0xFFF0);
const CHR_NOTIFY: Uuid = uuid16(0xFFF4);
const CHR_WRITE: Uuid = uuid16(0xFFF1);
const SVC_BATTERY: Uuid = uuid16(0x180F);
const CHR_BATTERY_LEVEL: Uuid = uuid16(0x2A19);

const CLOCK_ACK: [u8; 2] = [0xF1, 0x00];
const HISTORY_MARKER: [u8; 2] = [0xF2, 0x00];
const HISTORY_CLEAR: [u8; 2] = [0xF2, 0x01];
const MEASUREMENT_FRAME: u8 = 0xCF;

/// Measurements closer together than this are dropped.
const MIN_SAVE_INTERVAL_MS: i64 = 3000;
const LOW_BATTERY_PERCENT: u8 = 10;

#[derive(Debug, Default)]
pub struct OneByoneHandler {
    waiting_clock_ack: bool,
    history_mode: bool,
    history_count: usize,
    last_saved_ms: i64,
}

impl OneByoneHandler {
    pub fn new() -> Self {
        Self::default()
    }

    fn model(device: &ScannedDeviceInfo) -> Option<&'static str> {
        let name = device.name_or_empty().to_lowercase();
        if name.contains("t9146") {
            Some("Eufy C1")
        } else if name.contains("t9147") {
            Some("Eufy P1")
        } else if name.contains("health scale") {
            Some("1byone (classic)")
        } else {
            None
        }
    }

    fn mode_unit_command(user: &ScaleUser) -> [u8; 11] {
        let unit = match user.scale_unit {
            WeightUnit::Kg => 0x00,
            WeightUnit::Lb => 0x01,
            WeightUnit::St => 0x02,
        };
        let mut cmd = [0xFD, 0x37, unit, 0x01, 0, 0, 0, 0, 0, 0, 0];
        cmd[10] = xor_checksum(&cmd[..10]);
        cmd
    }

    fn clock_command(now: DateTime<Local>) -> [u8; 8] {
        let [year_hi, year_lo] = (now.year() as u16).to_be_bytes();
        [
            0xF1,
            year_hi,
            year_lo,
            now.month() as u8,
            now.day() as u8,
            now.hour() as u8,
            now.minute() as u8,
            now.second() as u8,
        ]
    }

    fn people_type(level: ActivityLevel) -> i32 {
        match level {
            ActivityLevel::Sedentary | ActivityLevel::Mild => 0,
            ActivityLevel::Moderate => 1,
            ActivityLevel::Heavy | ActivityLevel::Extreme => 2,
        }
    }

    /// Timestamp carried by frames of 18 bytes or more. Month and day are clamped
    /// like the scale firmware does; any other invalid field rejects the frame.
    fn frame_timestamp(bytes: &[u8]) -> Option<DateTime<Utc>> {
        let year = u16_be(bytes, 11)?;
        let month = bytes[13].clamp(1, 12);
        let day = bytes[14].max(1);
        let naive = NaiveDate::from_ymd_opt(i32::from(year), u32::from(month), u32::from(day))?
            .and_hms_opt(u32::from(bytes[15]), u32::from(bytes[16]), u32::from(bytes[17]))?;
        Some(Local.from_local_datetime(&naive).earliest()?.with_timezone(&Utc))
    }

    fn parse_measurement(&mut self, ctx: &HandlerContext, bytes: &[u8], user: &ScaleUser) {
        let Some(raw_weight) = u16_le(bytes, 3) else {
            return;
        };
        let weight = f32::from(raw_weight) / 100.0;
        // high byte first at offset 2
        let impedance = f32::from(u16::from_le_bytes([bytes[1], bytes[2]])) * 0.1;
        let has_impedance = bytes[9] != 1 && impedance != 0.0;
        let has_timestamp = bytes.len() >= 18;

        if !has_impedance || (self.history_mode && !has_timestamp) {
            return;
        }

        let timestamp = if has_timestamp {
            match Self::frame_timestamp(bytes) {
                Some(ts) => Some(ts),
                None => {
                    debug!(frame = %HexPreview::new(bytes), "invalid history timestamp, frame dropped");
                    return;
                }
            }
        } else {
            None
        };

        let now = Utc::now();
        let at_ms = timestamp.map_or(now, |ts| ts.max(now)).timestamp_millis();
        if at_ms - self.last_saved_ms < MIN_SAVE_INTERVAL_MS {
            return;
        }
        self.last_saved_ms = at_ms;

        let lib = OneByoneCalculator::new(
            user.gender.sex_flag(),
            user.age(),
            user.body_height,
            Self::people_type(user.activity_level),
        );
        let fat = lib.body_fat(weight, impedance);
        ctx.publish(ScaleMeasurement {
            user_id: Some(user.id),
            date_time: Some(timestamp.unwrap_or(now)),
            weight,
            fat,
            water: lib.water(fat),
            bone: lib.bone_mass(weight, impedance),
            visceral_fat: lib.visceral_fat(weight),
            muscle: lib.muscle(weight, impedance),
            lbm: lib.lbm(weight, fat),
            impedance: f64::from(impedance),
            ..ScaleMeasurement::default()
        });
    }
}

impl ScaleDeviceHandler for OneByoneHandler {
    fn name(&self) -> &'static str {
        "OneByoneHandler"
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn support_for(&self, device: &ScannedDeviceInfo) -> Option<DeviceSupport> {
        let model = Self::model(device)?;
        let caps = [
            DeviceCapability::BodyComposition,
            DeviceCapability::TimeSync,
            DeviceCapability::HistoryRead,
            DeviceCapability::UnitConfig,
            DeviceCapability::LiveWeightStream,
        ];
        Some(
            DeviceSupport::new(model, LinkMode::ConnectGatt)
                .capabilities(&caps)
                .implemented(&caps),
        )
    }

    fn on_connected(&mut self, ctx: &HandlerContext, user: &ScaleUser) -> Result<(), HandlerError> {
        ctx.set_notify_on(SVC_MAIN, CHR_NOTIFY);
        ctx.write(SVC_MAIN, CHR_WRITE, &Self::mode_unit_command(user));

        self.waiting_clock_ack = true;
        ctx.write(SVC_MAIN, CHR_WRITE, &Self::clock_command(Local::now()));

        ctx.set_notify_on(SVC_BATTERY, CHR_BATTERY_LEVEL);
        ctx.read(SVC_BATTERY, CHR_BATTERY_LEVEL);
        Ok(())
    }

    fn on_notification(
        &mut self,
        ctx: &HandlerContext,
        characteristic: Uuid,
        data: &[u8],
        user: &ScaleUser,
    ) -> Result<(), HandlerError> {
        if characteristic == CHR_BATTERY_LEVEL {
            HandlerError::require_len(data, 1)?;
            let level = data[0];
            debug!(level, "battery level");
            if level <= LOW_BATTERY_PERCENT {
                ctx.warn(format!("Scale battery low ({level}%)"));
            }
            return Ok(());
        }
        if characteristic != CHR_NOTIFY {
            debug!(%characteristic, data = %HexPreview::new(data), "unexpected notification");
            return Ok(());
        }

        if data == CLOCK_ACK && self.waiting_clock_ack {
            self.waiting_clock_ack = false;
            self.history_mode = true;
            self.history_count = 0;
            ctx.write(SVC_MAIN, CHR_WRITE, &HISTORY_MARKER);
            return Ok(());
        }
        if data == HISTORY_MARKER {
            if self.history_mode {
                self.history_mode = false;
                if self.history_count > 0 {
                    ctx.write(SVC_MAIN, CHR_WRITE, &HISTORY_CLEAR);
                }
                ctx.info("Step on the scale");
            }
            return Ok(());
        }

        if data.first() == Some(&MEASUREMENT_FRAME) && data.len() >= 11 {
            if self.history_mode {
                self.history_count += 1;
            }
            self.parse_measurement(ctx, data, user);
        } else if data.len() <= 6 {
            debug!(data = %HexPreview::new(data), "short frame");
        }
        Ok(())
    }

    fn on_disconnected(&mut self, _ctx: &HandlerContext) {
        self.waiting_clock_ack = false;
        self.history_mode = false;
        self.history_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{ContextBuilder, TEST_MAC, test_user};

    fn live_frame(raw_weight: u16, raw_impedance: u16) -> Vec<u8> {
        let [imp_lo, imp_hi] = raw_impedance.to_le_bytes();
        let [w_lo, w_hi] = raw_weight.to_le_bytes();
        vec![MEASUREMENT_FRAME, imp_lo, imp_hi, w_lo, w_hi, 0, 0, 0, 0, 0, 0]
    }

    fn history_frame(raw_weight: u16, raw_impedance: u16, year: u16, month: u8, day: u8) -> Vec<u8> {
        let mut frame = live_frame(raw_weight, raw_impedance);
        frame.extend_from_slice(&year.to_be_bytes());
        frame.extend_from_slice(&[month, day, 8, 0, 0]);
        frame
    }

    #[test]
    fn test_support_for_models() {
        let handler = OneByoneHandler::new();
        let name = |n: &str| ScannedDeviceInfo::new(TEST_MAC).with_name(n);
        assert_eq!(handler.support_for(&name("eufy T9146")).unwrap().display_name, "Eufy C1");
        assert_eq!(handler.support_for(&name("eufy T9147")).unwrap().display_name, "Eufy P1");
        assert_eq!(
            handler.support_for(&name("Health Scale")).unwrap().display_name,
            "1byone (classic)"
        );
        assert!(handler.support_for(&name("Scale")).is_none());
    }

    #[test]
    fn test_mode_unit_command() {
        let user = ScaleUser {
            scale_unit: WeightUnit::Lb,
            ..test_user()
        };
        let cmd = OneByoneHandler::mode_unit_command(&user);
        assert_eq!(cmd[..4], [0xFD, 0x37, 0x01, 0x01]);
        assert_eq!(cmd[10], 0xFD ^ 0x37 ^ 0x01 ^ 0x01);
    }

    #[tokio::test]
    async fn test_clock_ack_requests_history_and_clears_it() {
        let user = test_user();
        let (ctx, recorder) = ContextBuilder::new(TEST_MAC).user(user.clone()).build().await;
        let mut handler = OneByoneHandler::new();
        handler.on_connected(&ctx, &user).unwrap();
        assert_eq!(recorder.transport.writes().len(), 2);

        handler.on_notification(&ctx, CHR_NOTIFY, &CLOCK_ACK, &user).unwrap();
        // history record without timestamp is not stored
        handler.on_notification(&ctx, CHR_NOTIFY, &live_frame(7000, 5000), &user).unwrap();
        handler
            .on_notification(&ctx, CHR_NOTIFY, &history_frame(7000, 5000, 2024, 2, 3), &user)
            .unwrap();
        handler.on_notification(&ctx, CHR_NOTIFY, &HISTORY_MARKER, &user).unwrap();

        let payloads: Vec<Vec<u8>> = recorder.transport.writes().into_iter().map(|w| w.payload).collect();
        assert_eq!(payloads[2], HISTORY_MARKER.to_vec());
        assert_eq!(payloads[3], HISTORY_CLEAR.to_vec());
        assert_eq!(recorder.published().len(), 1);
        assert_eq!(recorder.infos(), vec!["Step on the scale".to_string()]);
    }

    #[tokio::test]
    async fn test_live_measurement_with_body_composition() {
        let user = test_user();
        let (ctx, recorder) = ContextBuilder::new(TEST_MAC).user(user.clone()).build().await;
        let mut handler = OneByoneHandler::new();

        handler.on_notification(&ctx, CHR_NOTIFY, &live_frame(7250, 5000), &user).unwrap();
        // rate limited
        handler.on_notification(&ctx, CHR_NOTIFY, &live_frame(7260, 5000), &user).unwrap();

        let published = recorder.published();
        assert_eq!(published.len(), 1);
        let m = &published[0];
        assert!((m.weight - 72.5).abs() < 1e-4);
        assert!((m.impedance - 500.0).abs() < 1e-3);
        assert!(m.fat > 0.0);
        assert!(m.water > 0.0);
        assert!(m.lbm > 0.0);
    }

    #[tokio::test]
    async fn test_missing_impedance_dropped() {
        let user = test_user();
        let (ctx, recorder) = ContextBuilder::new(TEST_MAC).user(user.clone()).build().await;
        let mut handler = OneByoneHandler::new();
        handler.on_notification(&ctx, CHR_NOTIFY, &live_frame(7250, 0), &user).unwrap();
        let mut flagged = live_frame(7250, 5000);
        flagged[9] = 1;
        handler.on_notification(&ctx, CHR_NOTIFY, &flagged, &user).unwrap();
        assert!(recorder.published().is_empty());
    }

    #[tokio::test]
    async fn test_low_battery_warns() {
        let user = test_user();
        let (ctx, recorder) = ContextBuilder::new(TEST_MAC).user(user.clone()).build().await;
        let mut handler = OneByoneHandler::new();
        handler.on_notification(&ctx, CHR_BATTERY_LEVEL, &[55], &user).unwrap();
        handler.on_notification(&ctx, CHR_BATTERY_LEVEL, &[8], &user).unwrap();
        assert_eq!(recorder.warnings(), vec!["Scale battery low (8%)".to_string()]);
        assert!(handler.on_notification(&ctx, CHR_BATTERY_LEVEL, &[], &user).is_err());
    }
}
