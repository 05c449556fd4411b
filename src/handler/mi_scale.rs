//! Xiaomi Mi Scale v1 and v2 (Mi Body Composition Scale).
//!
//! Both expose a vendor history characteristic under the body composition and
//! weight services. After connecting we set the unit (v2 only), write the
//! current time and request the newest history entry. Live frames (13 bytes)
//! and history records (10 bytes) then arrive on the history characteristic.

use super::{
    DeviceCapability, DeviceSupport, HandlerContext, HandlerError, LinkMode, ScaleDeviceHandler,
};
use crate::advertisement::ScannedDeviceInfo;
use crate::calc::MiScaleCalculator;
use crate::codec::{HexPreview, u16_le, uuid16};
use crate::measurement::ScaleMeasurement;
use crate::user::{ScaleUser, WeightUnit};
use chrono::{DateTime, Datelike, Local, Months, NaiveDate, TimeZone, Timelike, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

const SERVICE_BODY_COMPOSITION: Uuid = uuid16(0x181B);
const SERVICE_WEIGHT: Uuid = uuid16(0x181D);
const CHAR_CURRENT_TIME: Uuid = uuid16(0x2A2B);
const CHAR_WEIGHT_MEASUREMENT: Uuid = uuid16(0x2A9D);

const SERVICE_MI_CONFIG: Uuid = Uuid::from_u128(0x00001530_0000_3512_2118_0009af100700);
const CHAR_MI_CONFIG: Uuid = Uuid::from_u128(0x00001542_0000_3512_2118_0009af100700);
const CHAR_MI_HISTORY: Uuid = Uuid::from_u128(0x00002a2f_0000_3512_2118_0009af100700);

const ENABLE_HISTORY_MAGIC: [u8; 5] = [0x01, 0x96, 0x8A, 0xBD, 0x62];
const HISTORY_STOP: u8 = 0x03;

const LIVE_FRAME_LEN: usize = 13;
const HISTORY_RECORD_LEN: usize = 10;
const PLAUSIBLE_YEARS: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Variant {
    V1,
    V2,
}

#[derive(Debug, Default)]
pub struct MiScaleHandler {
    history: Vec<u8>,
    history_mode: bool,
    imported: usize,
    announced: Option<u8>,
    warned_status_bits: bool,
}

impl MiScaleHandler {
    pub fn new() -> Self {
        Self::default()
    }

    fn variant_of(device: &ScannedDeviceInfo) -> Option<Variant> {
        let name = device.upper_name();
        let known = name.starts_with("MIBCS")
            || name.starts_with("MIBFS")
            || name == "MI SCALE2"
            || name.starts_with("MI_SCALE");
        if !known {
            return None;
        }
        if device.advertises(&SERVICE_MI_CONFIG) || name == "MIBCS" || name == "MIBFS" {
            Some(Variant::V2)
        } else {
            Some(Variant::V1)
        }
    }

    /// Low 16 bits of the current Unix time, used as a request marker.
    fn unique16() -> u16 {
        (Utc::now().timestamp() & 0xFFFF) as u16
    }

    fn history_request(opcode: u8) -> [u8; 5] {
        let [hi, lo] = Self::unique16().to_be_bytes();
        [opcode, 0xFF, 0xFF, hi, lo]
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
            0x03,
            0x00,
            0x00,
        ]
    }

    fn write_current_time(ctx: &HandlerContext) {
        let payload = Self::current_time_payload(Local::now());
        // firmware variants differ in which service carries the clock
        ctx.write(SERVICE_BODY_COMPOSITION, CHAR_CURRENT_TIME, &payload);
        ctx.write(SERVICE_WEIGHT, CHAR_CURRENT_TIME, &payload);
        debug!(payload = %HexPreview::new(&payload), "current time written");
    }

    fn send_unit(ctx: &HandlerContext, user: &ScaleUser) {
        let unit = match user.scale_unit {
            WeightUnit::Kg => 0,
            WeightUnit::Lb => 1,
            WeightUnit::St => 2,
        };
        let cmd = [0x06, 0x04, 0x00, unit];
        ctx.write(SERVICE_MI_CONFIG, CHAR_MI_CONFIG, &cmd);
        debug!(cmd = %HexPreview::new(&cmd), "unit set");
    }

    fn minute_date(year: u16, month: u8, day: u8, hour: u8, minute: u8) -> Option<DateTime<Utc>> {
        let naive = NaiveDate::from_ymd_opt(i32::from(year), u32::from(month), u32::from(day))?
            .and_hms_opt(u32::from(hour), u32::from(minute), 0)?;
        let local = Local.from_local_datetime(&naive).earliest()?;
        Some(local.with_timezone(&Utc))
    }

    fn plausible(date: DateTime<Utc>) -> bool {
        let now = Utc::now();
        let span = Months::new(12 * PLAUSIBLE_YEARS);
        match (now.checked_sub_months(span), now.checked_add_months(span)) {
            (Some(min), Some(max)) => date > min && date < max,
            _ => false,
        }
    }

    fn native_weight(raw: u16, lbs: bool, catty: bool) -> f32 {
        if lbs || catty {
            f32::from(raw) / 100.0
        } else {
            f32::from(raw) / 200.0
        }
    }

    /// v2 live frame, with or without impedance.
    fn parse_live(&self, ctx: &HandlerContext, d: &[u8], user: &ScaleUser) -> bool {
        if d.len() != LIVE_FRAME_LEN {
            return false;
        }
        let (c0, c1) = (d[0], d[1]);
        let lbs = c0 & 0x01 != 0;
        let catty = c1 & 0x40 != 0;
        let stable = c1 & 0x20 != 0;
        let removed = c1 & 0x80 != 0;
        let has_impedance = c1 & 0x02 != 0;
        if !stable || removed {
            return false;
        }

        let (Some(year), Some(raw)) = (u16_le(d, 2), u16_le(d, 11)) else {
            return false;
        };
        let Some(date) = Self::minute_date(year, d[4], d[5], d[6], d[7]).filter(|dt| Self::plausible(*dt))
        else {
            return false;
        };

        let mut measurement = ScaleMeasurement {
            date_time: Some(date),
            weight: user.scale_unit.to_kilogram(Self::native_weight(raw, lbs, catty)),
            user_id: Some(user.id),
            ..ScaleMeasurement::default()
        };

        if has_impedance && let Some(imp) = u16_le(d, 9).filter(|imp| *imp > 0) {
            let imp = f32::from(imp);
            let lib = MiScaleCalculator::new(user.gender.sex_flag(), user.age(), user.body_height);
            let weight = measurement.weight;
            measurement.impedance = f64::from(imp);
            measurement.water = lib.water(weight, imp);
            measurement.visceral_fat = lib.visceral_fat(weight);
            measurement.fat = lib.body_fat(weight, imp);
            measurement.muscle = lib.muscle(weight, imp);
            measurement.lbm = lib.lbm(weight, imp);
            measurement.bone = lib.bone_mass(weight, imp);
        }

        ctx.publish(measurement);
        true
    }

    /// `[status][weight LE][year LE][month][day][hour][minute][second]`
    fn parse_history_record(&mut self, ctx: &HandlerContext, d: &[u8], user: &ScaleUser) -> bool {
        if d.len() != HISTORY_RECORD_LEN {
            return false;
        }
        let status = d[0];
        let lbs = status & 0x01 != 0;
        let catty = status & 0x10 != 0;
        let stable = status & 0x20 != 0;
        let removed = status & 0x80 != 0;
        if !stable || removed {
            return false;
        }
        if !self.warned_status_bits && status & 0x06 != 0 {
            warn!(status, "history status has unexpected bits set, ignoring them");
            self.warned_status_bits = true;
        }

        let (Some(raw), Some(year)) = (u16_le(d, 1), u16_le(d, 3)) else {
            return false;
        };
        let Some(date) = Self::minute_date(year, d[5], d[6], d[7], d[8]).filter(|dt| Self::plausible(*dt))
        else {
            return false;
        };

        ctx.publish(ScaleMeasurement {
            date_time: Some(date),
            weight: user.scale_unit.to_kilogram(Self::native_weight(raw, lbs, catty)),
            user_id: Some(user.id),
            ..ScaleMeasurement::default()
        });
        true
    }

    fn parse_history_buffer(&mut self, ctx: &HandlerContext, records: &[u8], user: &ScaleUser) {
        for record in records.chunks_exact(HISTORY_RECORD_LEN) {
            if self.parse_history_record(ctx, record, user) {
                self.imported += 1;
            }
        }
    }

    fn append_history_chunk(&mut self, ctx: &HandlerContext, chunk: &[u8], user: &ScaleUser) {
        if chunk.len() < 2 {
            return;
        }
        self.history.extend_from_slice(chunk);
        let full = self.history.len() / HISTORY_RECORD_LEN * HISTORY_RECORD_LEN;
        if full >= HISTORY_RECORD_LEN {
            let records: Vec<u8> = self.history.drain(..full).collect();
            self.parse_history_buffer(ctx, &records, user);
        }
    }

    fn flush_history(&mut self, ctx: &HandlerContext, user: &ScaleUser) {
        let leftover = std::mem::take(&mut self.history);
        if !leftover.is_empty() && leftover.len() % HISTORY_RECORD_LEN == 0 {
            self.parse_history_buffer(ctx, &leftover, user);
        }
    }

    fn handle_history_notify(&mut self, ctx: &HandlerContext, d: &[u8], user: &ScaleUser) {
        if d == [HISTORY_STOP] {
            self.flush_history(ctx, user);
            ctx.write(SERVICE_BODY_COMPOSITION, CHAR_MI_HISTORY, &[HISTORY_STOP]);
            ctx.write(SERVICE_BODY_COMPOSITION, CHAR_MI_HISTORY, &Self::history_request(0x04));
            info!(imported = self.imported, announced = ?self.announced, "history import done");
            self.history_mode = false;
            return;
        }

        if d.len() >= 6 && d[0] == 0x01 && d[2] == 0xFF {
            self.announced = Some(d[1]);
            info!(count = d[1], "history count announced");
            return;
        }

        match d.len() {
            LIVE_FRAME_LEN => {
                if self.parse_live(ctx, d, user) && self.history_mode {
                    self.imported += 1;
                }
            }
            len if len == 2 * LIVE_FRAME_LEN => {
                let (a, b) = d.split_at(LIVE_FRAME_LEN);
                let parsed = [self.parse_live(ctx, a, user), self.parse_live(ctx, b, user)];
                if self.history_mode {
                    self.imported += parsed.iter().filter(|ok| **ok).count();
                }
            }
            _ => self.append_history_chunk(ctx, d, user),
        }
    }
}

impl ScaleDeviceHandler for MiScaleHandler {
    fn name(&self) -> &'static str {
        "MiScaleHandler"
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn support_for(&self, device: &ScannedDeviceInfo) -> Option<DeviceSupport> {
        let (display, caps): (&str, &[DeviceCapability]) = match Self::variant_of(device)? {
            Variant::V1 => (
                "Xiaomi Mi Scale v1",
                &[
                    DeviceCapability::LiveWeightStream,
                    DeviceCapability::HistoryRead,
                    DeviceCapability::TimeSync,
                ],
            ),
            Variant::V2 => (
                "Xiaomi Mi Scale v2",
                &[
                    DeviceCapability::LiveWeightStream,
                    DeviceCapability::HistoryRead,
                    DeviceCapability::TimeSync,
                    DeviceCapability::UnitConfig,
                    DeviceCapability::BodyComposition,
                ],
            ),
        };
        Some(
            DeviceSupport::new(display, LinkMode::ConnectGatt)
                .capabilities(caps)
                .implemented(caps),
        )
    }

    fn on_connected(&mut self, ctx: &HandlerContext, user: &ScaleUser) -> Result<(), HandlerError> {
        let variant = if ctx.has_characteristic(SERVICE_MI_CONFIG, CHAR_MI_CONFIG) {
            Variant::V2
        } else {
            Variant::V1
        };
        info!(?variant, "Mi Scale connected, starting init sequence");

        if variant == Variant::V2 {
            Self::send_unit(ctx, user);
        }
        Self::write_current_time(ctx);

        ctx.set_notify_on(SERVICE_BODY_COMPOSITION, CHAR_MI_HISTORY);
        ctx.set_notify_on(SERVICE_WEIGHT, CHAR_MI_HISTORY);

        ctx.write(SERVICE_BODY_COMPOSITION, CHAR_MI_HISTORY, &ENABLE_HISTORY_MAGIC);
        ctx.write(SERVICE_BODY_COMPOSITION, CHAR_MI_HISTORY, &Self::history_request(0x01));
        ctx.write(SERVICE_BODY_COMPOSITION, CHAR_MI_HISTORY, &[0x02]);
        self.history_mode = true;

        ctx.set_notify_on(SERVICE_BODY_COMPOSITION, CHAR_WEIGHT_MEASUREMENT);
        ctx.set_notify_on(SERVICE_WEIGHT, CHAR_WEIGHT_MEASUREMENT);

        ctx.info("Waiting for measurement, step on the scale");
        Ok(())
    }

    fn on_notification(
        &mut self,
        ctx: &HandlerContext,
        characteristic: Uuid,
        data: &[u8],
        user: &ScaleUser,
    ) -> Result<(), HandlerError> {
        if characteristic == CHAR_CURRENT_TIME {
            return Ok(());
        }
        if characteristic == CHAR_MI_HISTORY {
            self.handle_history_notify(ctx, data, user);
        } else {
            debug!(%characteristic, data = %HexPreview::new(data), "unhandled notification");
        }
        Ok(())
    }

    fn on_disconnected(&mut self, _ctx: &HandlerContext) {
        *self = Self::default();
    }
}
