//! Bluetooth SIG Weight Scale / Body Composition / User Data profiles.
//!
//! Any device advertising 181D, 181B or 181C lands here. On connect we
//! subscribe to the measurement characteristics, set the clock and try to
//! unlock the scale for the current user:
//!
//! * If a scale slot is already mapped to the user and a consent code is saved,
//!   the consent goes out immediately.
//! * With a mapping but no code, the user is asked for it (`EnterConsent`).
//! * Without a mapping the scale is asked to list its users. The answer, or its
//!   absence, turns into a `ChooseUser` request with a "create new" entry.
//!
//! Slot to user mappings and consent codes persist in driver settings under
//! `userMap/userIdByIndex/{slot}` and `userMap/consentByIndex/{slot}`.
//!
//! Weight and body composition arrive as separate indications. A reading that
//! names a known user is held back until its partner arrives, then the two are
//! merged and published. Whatever is still held at disconnect is published as is.

use super::{
    DeviceCapability, DeviceSupport, HandlerContext, HandlerError, LinkMode, ScaleDeviceHandler,
};
use crate::advertisement::ScannedDeviceInfo;
use crate::codec::{HexPreview, uuid16};
use crate::event::{InteractionData, InteractionFeedback, InteractionKind, ScaleUserSlot};
use crate::measurement::ScaleMeasurement;
use crate::user::ScaleUser;
use chrono::{DateTime, Datelike, Local, NaiveDate, TimeZone, Timelike, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

const SVC_DEVICE_INFO: Uuid = uuid16(0x180A);
const CHR_MANUFACTURER_NAME: Uuid = uuid16(0x2A29);
const CHR_MODEL_NUMBER: Uuid = uuid16(0x2A24);

const SVC_CURRENT_TIME: Uuid = uuid16(0x1805);
const CHR_CURRENT_TIME: Uuid = uuid16(0x2A2B);

const SVC_WEIGHT_SCALE: Uuid = uuid16(0x181D);
const CHR_WEIGHT_MEASUREMENT: Uuid = uuid16(0x2A9D);

const SVC_BODY_COMPOSITION: Uuid = uuid16(0x181B);
const CHR_BODY_COMPOSITION_MEASUREMENT: Uuid = uuid16(0x2A9C);

const SVC_USER_DATA: Uuid = uuid16(0x181C);
const CHR_DATABASE_CHANGE_INCREMENT: Uuid = uuid16(0x2A99);
const CHR_USER_CONTROL_POINT: Uuid = uuid16(0x2A9F);
const CHR_USER_DATE_OF_BIRTH: Uuid = uuid16(0x2A85);
const CHR_USER_GENDER: Uuid = uuid16(0x2A8C);
const CHR_USER_HEIGHT: Uuid = uuid16(0x2A8E);

const SVC_BATTERY: Uuid = uuid16(0x180F);
const CHR_BATTERY_LEVEL: Uuid = uuid16(0x2A19);

const UCP_REGISTER_NEW_USER: u8 = 0x01;
const UCP_CONSENT: u8 = 0x02;
const UCP_LIST_ALL_USERS: u8 = 0x04;
const UCP_RESPONSE: u8 = 0x20;

const UCP_RESULT_SUCCESS: u8 = 0x01;
const UCP_RESULT_OPERATION_FAILED: u8 = 0x04;
const UCP_RESULT_USER_NOT_AUTHORIZED: u8 = 0x05;

const MAX_SCALE_SLOTS: i32 = 256;
const NO_USER: i32 = -1;
const CREATE_NEW_SLOT: i32 = -1;
const LOW_BATTERY_PERCENT: u8 = 10;

const CREATE_USER_LABEL: &str = "Create new user on the scale";

/// Sequential little-endian reader over a measurement frame.
struct FrameReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> FrameReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn u8(&mut self) -> Result<u8, HandlerError> {
        HandlerError::require_len(self.data, self.offset + 1)?;
        let value = self.data[self.offset];
        self.offset += 1;
        Ok(value)
    }

    fn u16(&mut self) -> Result<u16, HandlerError> {
        HandlerError::require_len(self.data, self.offset + 2)?;
        let value = u16::from_le_bytes([self.data[self.offset], self.data[self.offset + 1]]);
        self.offset += 2;
        Ok(value)
    }

    /// Date Time characteristic layout. An invalid date reads as `None`.
    fn date_time(&mut self) -> Result<Option<DateTime<Utc>>, HandlerError> {
        let year = self.u16()?;
        let month = self.u8()?.max(1);
        let day = self.u8()?;
        let (hour, minute, second) = (self.u8()?, self.u8()?, self.u8()?);
        Ok(
            NaiveDate::from_ymd_opt(i32::from(year), u32::from(month), u32::from(day))
                .and_then(|d| d.and_hms_opt(u32::from(hour), u32::from(minute), u32::from(second)))
                .and_then(|naive| Local.from_local_datetime(&naive).earliest())
                .map(|local| local.with_timezone(&Utc)),
        )
    }
}

#[derive(Debug, Default)]
pub struct StandardWeightProfileHandler {
    previous: Option<ScaleMeasurement>,
    registering_new_user: bool,
    pending_app_user_id: Option<i32>,
    pending_consent_for_new_user: Option<i32>,
    awaiting_reference_after_register: bool,
}

impl StandardWeightProfileHandler {
    pub fn new() -> Self {
        Self::default()
    }

    fn user_key(slot: i32) -> String {
        format!("userMap/userIdByIndex/{slot}")
    }

    fn consent_key(slot: i32) -> String {
        format!("userMap/consentByIndex/{slot}")
    }

    fn load_user_for_slot(ctx: &HandlerContext, slot: i32) -> i32 {
        ctx.settings
            .get_int(&Self::user_key(slot), NO_USER)
            .unwrap_or(NO_USER)
    }

    fn save_user_for_slot(ctx: &HandlerContext, slot: i32, app_user_id: i32) {
        debug!(slot, app_user_id, "saving slot mapping");
        ctx.settings.put_int(&Self::user_key(slot), app_user_id);
    }

    fn load_consent(ctx: &HandlerContext, slot: i32) -> Option<i32> {
        ctx.settings
            .get_int(&Self::consent_key(slot), -1)
            .ok()
            .filter(|c| *c != -1)
    }

    fn save_consent(ctx: &HandlerContext, slot: i32, consent: i32) {
        debug!(slot, consent, "saving consent code");
        ctx.settings.put_int(&Self::consent_key(slot), consent);
    }

    fn known_slot_for(ctx: &HandlerContext, app_user_id: i32) -> Option<i32> {
        (0..MAX_SCALE_SLOTS).find(|slot| Self::load_user_for_slot(ctx, *slot) == app_user_id)
    }

    /// Map `slot` to `app_user_id`, dropping any other slot the user had.
    fn link_slot(ctx: &HandlerContext, slot: i32, app_user_id: i32) {
        for other in (0..MAX_SCALE_SLOTS).filter(|s| *s != slot) {
            if Self::load_user_for_slot(ctx, other) == app_user_id {
                Self::save_user_for_slot(ctx, other, NO_USER);
            }
        }
        Self::save_user_for_slot(ctx, slot, app_user_id);
    }

    fn random_consent() -> i32 {
        (Utc::now().timestamp_subsec_nanos() % 10_000) as i32
    }

    fn current_user_id(&self, ctx: &HandlerContext) -> i32 {
        self.pending_app_user_id
            .or_else(|| ctx.data.current_user().map(|u| u.id))
            .unwrap_or(NO_USER)
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

    fn send_consent(ctx: &HandlerContext, slot: i32, consent: i32) {
        let [c_lo, c_hi] = (consent as u16).to_le_bytes();
        debug!(slot, consent, "UCP consent");
        ctx.write(SVC_USER_DATA, CHR_USER_CONTROL_POINT, &[UCP_CONSENT, slot as u8, c_lo, c_hi]);
    }

    fn send_register_new_user(ctx: &HandlerContext, consent: i32) {
        let [c_lo, c_hi] = (consent as u16).to_le_bytes();
        debug!(consent, "UCP register new user");
        ctx.write(SVC_USER_DATA, CHR_USER_CONTROL_POINT, &[UCP_REGISTER_NEW_USER, c_lo, c_hi]);
    }

    fn request_consent(&mut self, ctx: &HandlerContext, app_user_id: i32, slot: i32) {
        self.pending_app_user_id = Some(app_user_id);
        ctx.info(format!("Consent code needed for scale user {slot}"));
        ctx.request_user_interaction(
            InteractionKind::EnterConsent,
            InteractionData::ConsentFor { user_index: slot },
        );
    }

    fn present_choice(ctx: &HandlerContext, slots: &[i32]) {
        let mut items: Vec<ScaleUserSlot> = slots
            .iter()
            .map(|index| ScaleUserSlot {
                index: *index,
                label: format!("P{index:02}"),
            })
            .collect();
        items.push(ScaleUserSlot {
            index: CREATE_NEW_SLOT,
            label: CREATE_USER_LABEL.to_string(),
        });
        ctx.request_user_interaction(InteractionKind::ChooseUser, InteractionData::UserSlots(items));
    }

    /// Unlock the scale with a stored mapping. `false` when the user has no slot yet.
    fn try_auto_consent(&mut self, ctx: &HandlerContext, user: &ScaleUser) -> bool {
        let Some(slot) = Self::known_slot_for(ctx, user.id) else {
            debug!(user_id = user.id, "no scale slot known for user");
            return false;
        };
        ctx.info(format!("Using scale user {slot} for user {}", user.id));
        match Self::load_consent(ctx, slot) {
            Some(consent) => Self::send_consent(ctx, slot, consent),
            None => self.request_consent(ctx, user.id, slot),
        }
        true
    }

    fn write_user_data(ctx: &HandlerContext) {
        let Some(user) = ctx.data.current_user() else {
            warn!("no user selected, user data not written");
            return;
        };
        let [y_lo, y_hi] = (user.birthday.year() as u16).to_le_bytes();
        ctx.write(
            SVC_USER_DATA,
            CHR_USER_DATE_OF_BIRTH,
            &[y_lo, y_hi, user.birthday.month() as u8, user.birthday.day() as u8],
        );
        ctx.write(SVC_USER_DATA, CHR_USER_GENDER, &[u8::from(!user.gender.is_male())]);
        let height = (user.body_height as i32).clamp(0, 300) as u16;
        ctx.write(SVC_USER_DATA, CHR_USER_HEIGHT, &height.to_le_bytes());
        ctx.write(SVC_USER_DATA, CHR_DATABASE_CHANGE_INCREMENT, &1u32.to_le_bytes());
    }

    fn mapped_user(ctx: &HandlerContext, slot: u8) -> Option<i32> {
        let app_id = Self::load_user_for_slot(ctx, i32::from(slot));
        (app_id != NO_USER).then_some(app_id)
    }

    fn parse_weight(ctx: &HandlerContext, value: &[u8]) -> Result<ScaleMeasurement, HandlerError> {
        let mut r = FrameReader::new(value);
        let flags = r.u8()?;
        let is_kg = flags & 0x01 == 0;
        let multiplier = if is_kg { 0.005 } else { 0.01 };

        let mut m = ScaleMeasurement::with_weight(f32::from(r.u16()?) * multiplier);
        if flags & 0x02 != 0 {
            m.date_time = r.date_time()?;
        }
        if flags & 0x04 != 0 {
            let slot = r.u8()?;
            m.user_id = Self::mapped_user(ctx, slot);
            debug!(flags, slot, user_id = ?m.user_id, weight = m.weight, "weight measurement");
        }
        if flags & 0x08 != 0 {
            let bmi = f32::from(r.u16()?) * 0.1;
            let height = f32::from(r.u16()?) * 0.001;
            debug!(bmi, height, "BMI and height");
        }
        Ok(m)
    }

    fn parse_body_composition(&self, ctx: &HandlerContext, value: &[u8]) -> Result<ScaleMeasurement, HandlerError> {
        HandlerError::require_len(value, 4)?;
        let mut r = FrameReader::new(value);
        let flags = r.u16()?;
        let is_kg = flags & 0x0001 == 0;
        let mass = if is_kg { 0.005 } else { 0.01 };

        let mut m = ScaleMeasurement {
            fat: f32::from(r.u16()?) * 0.1,
            ..ScaleMeasurement::default()
        };
        if flags & 0x0002 != 0 {
            m.date_time = r.date_time()?;
        }
        if flags & 0x0004 != 0 {
            let slot = r.u8()?;
            m.user_id = Self::mapped_user(ctx, slot);
            debug!(slot, user_id = ?m.user_id, fat = m.fat, "body composition");
        }
        if flags & 0x0008 != 0 {
            let joules = f32::from(r.u16()?);
            m.bmr = (joules / 4.1868 * 10.0).trunc() / 10.0;
        }
        if flags & 0x0010 != 0 {
            m.muscle = f32::from(r.u16()?) * 0.1;
        }
        if flags & 0x0020 != 0 {
            debug!(muscle_mass = f32::from(r.u16()?) * mass, "muscle mass");
        }
        if flags & 0x0040 != 0 {
            debug!(fat_free_mass = f32::from(r.u16()?) * mass, "fat free mass");
        }
        let soft_lean = if flags & 0x0080 != 0 {
            Some(f32::from(r.u16()?) * mass)
        } else {
            None
        };
        if flags & 0x0100 != 0 {
            m.water = f32::from(r.u16()?) * mass;
        }
        if flags & 0x0200 != 0 {
            m.impedance = f64::from(r.u16()?) * 0.1;
        }
        if flags & 0x0400 != 0 {
            m.weight = f32::from(r.u16()?) * mass;
        } else if let Some(prev) = self.previous.as_ref().filter(|p| p.weight > 0.0) {
            m.weight = prev.weight;
        }
        if flags & 0x0800 != 0 {
            debug!(height = r.u16()?, "height");
        }
        if flags & 0x1000 != 0 {
            warn!("multi-packet body composition measurement not supported");
        }

        if let Some(soft_lean) = soft_lean
            && m.weight > 0.0
        {
            let lean = m.weight - m.weight * (m.fat / 100.0);
            m.lbm = lean;
            m.bone = lean - soft_lean;
        }
        Ok(m)
    }

    /// Pair weight with body composition. Readings for unknown users go out
    /// right away; a reading for a known user waits for its partner.
    fn merge_with_previous(&mut self, ctx: &HandlerContext, mut incoming: ScaleMeasurement) {
        let Some(prev) = self.previous.take() else {
            if incoming.user_id.is_none() {
                ctx.publish(incoming);
            } else {
                self.previous = Some(incoming);
            }
            return;
        };

        let same_user = incoming.user_id.is_none() || incoming.user_id == prev.user_id;
        if prev.user_id.is_some() && same_user {
            incoming.merge_with(&prev);
            debug!(user_id = ?incoming.user_id, "publishing merged measurement");
            ctx.publish(incoming);
            return;
        }

        ctx.publish(prev);
        if incoming.user_id.is_none() {
            ctx.publish(incoming);
        } else {
            self.previous = Some(incoming);
        }
    }

    fn handle_control_point(&mut self, ctx: &HandlerContext, value: &[u8]) {
        let Some(&op) = value.first() else {
            warn!("empty user control point indication");
            return;
        };
        if op != UCP_RESPONSE {
            debug!(op, "user control point indication without response opcode");
            return;
        }
        if value.len() < 3 {
            warn!(data = %HexPreview::new(value), "user control point response too short");
            return;
        }
        let (request, result) = (value[1], value[2]);
        debug!(request, result, data = %HexPreview::new(value), "user control point response");

        match request {
            UCP_REGISTER_NEW_USER => self.on_register_response(ctx, result, value.get(3).copied()),
            UCP_CONSENT => self.on_consent_response(ctx, result),
            UCP_LIST_ALL_USERS => self.on_list_response(ctx, result, value),
            other => warn!(request = other, result, "response to unknown control point request"),
        }
    }

    fn on_register_response(&mut self, ctx: &HandlerContext, result: u8, slot: Option<u8>) {
        let (UCP_RESULT_SUCCESS, Some(slot)) = (result, slot) else {
            warn!(result, "register new user failed");
            if result == UCP_RESULT_OPERATION_FAILED {
                ctx.warn("All user slots on the scale are in use");
            } else {
                ctx.warn(format!("Registering a new scale user failed (code {result})"));
            }
            self.registering_new_user = false;
            return;
        };

        let slot = i32::from(slot);
        let app_id = self.current_user_id(ctx);
        info!(slot, app_id, "new scale user registered");
        Self::link_slot(ctx, slot, app_id);
        if let Some(consent) = self.pending_consent_for_new_user {
            Self::save_consent(ctx, slot, consent);
        }
        Self::write_user_data(ctx);

        let consent = Self::load_consent(ctx, slot)
            .or(self.pending_consent_for_new_user)
            .unwrap_or_else(|| {
                let consent = Self::random_consent();
                Self::save_consent(ctx, slot, consent);
                consent
            });
        Self::send_consent(ctx, slot, consent);

        self.awaiting_reference_after_register = true;
        self.registering_new_user = false;
        self.pending_app_user_id = None;
        self.pending_consent_for_new_user = None;
    }

    fn on_consent_response(&mut self, ctx: &HandlerContext, result: u8) {
        match result {
            UCP_RESULT_SUCCESS => {
                debug!(app_id = self.current_user_id(ctx), "consent accepted");
                self.pending_app_user_id = None;
                if self.awaiting_reference_after_register {
                    ctx.info("Step on the scale for a reference measurement");
                    self.awaiting_reference_after_register = false;
                }
            }
            UCP_RESULT_USER_NOT_AUTHORIZED => {
                ctx.error("The scale rejected the consent code");
                let app_id = self.current_user_id(ctx);
                if let Some(slot) = Self::known_slot_for(ctx, app_id) {
                    ctx.info(format!("Consent code needed for scale user {slot}"));
                }
            }
            other => warn!(result = other, "unhandled consent result"),
        }
    }

    fn on_list_response(&mut self, ctx: &HandlerContext, result: u8, value: &[u8]) {
        if result != UCP_RESULT_SUCCESS {
            warn!(result, "listing scale users not supported");
            ctx.info("Scale does not list its users, measurements are read without consent");
            ctx.info("Create a new scale user to store measurements");
            Self::present_choice(ctx, &[]);
            return;
        }
        let Some(&count) = value.get(3) else {
            Self::present_choice(ctx, &[]);
            return;
        };
        let count = usize::from(count);
        if count > 0 && value.len() >= 4 + count {
            let slots: Vec<i32> = value[4..4 + count].iter().map(|b| i32::from(*b)).collect();
            debug!(?slots, "scale user slots");
            Self::present_choice(ctx, &slots);
        } else {
            let app_id = self.current_user_id(ctx);
            if let Some(slot) = Self::known_slot_for(ctx, app_id) {
                Self::save_user_for_slot(ctx, slot, NO_USER);
            }
            Self::present_choice(ctx, &[]);
        }
    }
}

impl ScaleDeviceHandler for StandardWeightProfileHandler {
    fn name(&self) -> &'static str {
        "StandardWeightProfileHandler"
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn support_for(&self, device: &ScannedDeviceInfo) -> Option<DeviceSupport> {
        let standard = [SVC_WEIGHT_SCALE, SVC_BODY_COMPOSITION, SVC_USER_DATA]
            .iter()
            .any(|svc| device.advertises(svc));
        if !standard {
            return None;
        }
        let caps = [
            DeviceCapability::BodyComposition,
            DeviceCapability::TimeSync,
            DeviceCapability::UserSync,
            DeviceCapability::BatteryLevel,
        ];
        Some(
            DeviceSupport::new("Bluetooth Standard Weight Profile", LinkMode::ConnectGatt)
                .capabilities(&caps)
                .implemented(&caps),
        )
    }

    fn on_connected(&mut self, ctx: &HandlerContext, user: &ScaleUser) -> Result<(), HandlerError> {
        ctx.set_notify_on(SVC_WEIGHT_SCALE, CHR_WEIGHT_MEASUREMENT);
        ctx.set_notify_on(SVC_BODY_COMPOSITION, CHR_BODY_COMPOSITION_MEASUREMENT);
        ctx.set_notify_on(SVC_USER_DATA, CHR_DATABASE_CHANGE_INCREMENT);
        ctx.set_notify_on(SVC_USER_DATA, CHR_USER_CONTROL_POINT);
        ctx.set_notify_on(SVC_BATTERY, CHR_BATTERY_LEVEL);

        ctx.write(SVC_CURRENT_TIME, CHR_CURRENT_TIME, &Self::current_time_payload(Local::now()));

        ctx.read(SVC_DEVICE_INFO, CHR_MANUFACTURER_NAME);
        ctx.read(SVC_DEVICE_INFO, CHR_MODEL_NUMBER);
        ctx.read(SVC_BATTERY, CHR_BATTERY_LEVEL);

        if !self.try_auto_consent(ctx, user) {
            debug!("UCP list all users");
            ctx.write(SVC_USER_DATA, CHR_USER_CONTROL_POINT, &[UCP_LIST_ALL_USERS]);
        }

        ctx.info("Step on the scale");
        Ok(())
    }

    fn on_notification(
        &mut self,
        ctx: &HandlerContext,
        characteristic: Uuid,
        data: &[u8],
        _user: &ScaleUser,
    ) -> Result<(), HandlerError> {
        match characteristic {
            CHR_WEIGHT_MEASUREMENT => {
                if !data.is_empty() {
                    let m = Self::parse_weight(ctx, data)?;
                    self.merge_with_previous(ctx, m);
                }
            }
            CHR_BODY_COMPOSITION_MEASUREMENT => {
                let m = self.parse_body_composition(ctx, data)?;
                self.merge_with_previous(ctx, m);
            }
            CHR_USER_CONTROL_POINT => self.handle_control_point(ctx, data),
            CHR_DATABASE_CHANGE_INCREMENT => debug!("user data change increment notified"),
            CHR_BATTERY_LEVEL => {
                if let Some(&level) = data.first() {
                    debug!(level, "battery level");
                    if level <= LOW_BATTERY_PERCENT {
                        ctx.warn(format!("Scale battery low ({level}%)"));
                    }
                }
            }
            CHR_MANUFACTURER_NAME | CHR_MODEL_NUMBER => {
                debug!(info = %String::from_utf8_lossy(data), "device information");
            }
            other => debug!(characteristic = %other, data = %HexPreview::new(data), "unhandled notification"),
        }
        Ok(())
    }

    fn on_disconnected(&mut self, ctx: &HandlerContext) {
        if let Some(pending) = self.previous.take() {
            debug!("flushing pending measurement at disconnect");
            ctx.publish(pending);
        }
    }

    fn on_user_interaction_feedback(
        &mut self,
        ctx: &HandlerContext,
        kind: InteractionKind,
        app_user_id: i32,
        feedback: &InteractionFeedback,
    ) -> Result<(), HandlerError> {
        match (kind, feedback) {
            (InteractionKind::ChooseUser, InteractionFeedback::UserIndex(slot)) => {
                self.pending_app_user_id = Some(app_user_id);
                if *slot == CREATE_NEW_SLOT {
                    let consent = Self::random_consent();
                    self.pending_consent_for_new_user = Some(consent);
                    self.registering_new_user = true;
                    ctx.info("Registering a new user on the scale");
                    Self::send_register_new_user(ctx, consent);
                } else {
                    Self::link_slot(ctx, *slot, app_user_id);
                    ctx.info(format!("Linked user {app_user_id} to scale user {slot}"));
                    match Self::load_consent(ctx, *slot) {
                        Some(consent) => Self::send_consent(ctx, *slot, consent),
                        None => self.request_consent(ctx, app_user_id, *slot),
                    }
                }
                Ok(())
            }
            (InteractionKind::EnterConsent, InteractionFeedback::Consent { user_index, code }) => {
                if *code < 0 {
                    warn!(code, "invalid consent code ignored");
                    return Ok(());
                }
                let slot = if (0..MAX_SCALE_SLOTS).contains(user_index) {
                    Some(*user_index)
                } else {
                    Self::known_slot_for(ctx, app_user_id)
                };
                let Some(slot) = slot else {
                    ctx.info("Create a new scale user to store measurements");
                    return Ok(());
                };
                Self::save_consent(ctx, slot, *code);
                Self::send_consent(ctx, slot, *code);
                Ok(())
            }
            (kind, feedback) => Err(HandlerError::Unexpected(format!(
                "feedback {feedback:?} does not answer {kind}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{ContextBuilder, TEST_MAC, test_user};
    use serde_json::json;

    fn settings_key(key: &str) -> String {
        format!("ble/StandardWeightProfileHandler/{TEST_MAC}/{key}")
    }

    fn ucp_writes(recorder: &crate::test_utils::Recorder) -> Vec<Vec<u8>> {
        recorder
            .transport
            .writes()
            .into_iter()
            .filter(|w| w.characteristic == CHR_USER_CONTROL_POINT)
            .map(|w| w.payload)
            .collect()
    }

    /// Weight 72.5 kg for scale slot 1.
    const WEIGHT_SLOT_1: [u8; 4] = [0x04, 0xA4, 0x38, 0x01];
    /// Body fat 21.5 % and water 40 kg for scale slot 1.
    const BODY_SLOT_1: [u8; 7] = [0x04, 0x01, 0xD7, 0x00, 0x01, 0x40, 0x1F];

    #[test]
    fn test_support_for_standard_services() {
        let handler = StandardWeightProfileHandler::new();
        let mut device = ScannedDeviceInfo::new(TEST_MAC).with_name("BF700");
        assert!(handler.support_for(&device).is_none());
        device.service_uuids.push(SVC_USER_DATA);
        assert!(handler.support_for(&device).is_some());
    }

    #[tokio::test]
    async fn test_connect_without_mapping_lists_users() {
        let user = test_user();
        let (ctx, recorder) = ContextBuilder::new(TEST_MAC)
            .handler("StandardWeightProfileHandler")
            .user(user.clone())
            .build()
            .await;
        let mut handler = StandardWeightProfileHandler::new();
        handler.on_connected(&ctx, &user).unwrap();

        assert_eq!(recorder.transport.notified().len(), 5);
        assert_eq!(ucp_writes(&recorder), vec![vec![UCP_LIST_ALL_USERS]]);

        handler
            .on_notification(&ctx, CHR_USER_CONTROL_POINT, &[UCP_RESPONSE, UCP_LIST_ALL_USERS, 1, 2, 1, 3], &user)
            .unwrap();
        let interactions = recorder.interactions();
        let (kind, InteractionData::UserSlots(slots)) = &interactions[0] else {
            panic!("expected user slots");
        };
        assert_eq!(*kind, InteractionKind::ChooseUser);
        let indices: Vec<i32> = slots.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![1, 3, CREATE_NEW_SLOT]);
        assert_eq!(slots[0].label, "P01");
    }

    #[tokio::test]
    async fn test_connect_with_saved_consent_sends_it() {
        let user = test_user();
        let (ctx, recorder) = ContextBuilder::new(TEST_MAC)
            .handler("StandardWeightProfileHandler")
            .user(user.clone())
            .setting(settings_key("userMap/userIdByIndex/2"), json!(user.id))
            .setting(settings_key("userMap/consentByIndex/2"), json!(1234))
            .build()
            .await;
        let mut handler = StandardWeightProfileHandler::new();
        handler.on_connected(&ctx, &user).unwrap();

        assert_eq!(ucp_writes(&recorder), vec![vec![UCP_CONSENT, 2, 0xD2, 0x04]]);
        assert!(recorder.interactions().is_empty());
    }

    #[tokio::test]
    async fn test_mapping_without_consent_asks_for_it() {
        let user = test_user();
        let (ctx, recorder) = ContextBuilder::new(TEST_MAC)
            .handler("StandardWeightProfileHandler")
            .user(user.clone())
            .setting(settings_key("userMap/userIdByIndex/4"), json!(user.id))
            .build()
            .await;
        let mut handler = StandardWeightProfileHandler::new();
        handler.on_connected(&ctx, &user).unwrap();

        assert_eq!(
            recorder.interactions(),
            vec![(InteractionKind::EnterConsent, InteractionData::ConsentFor { user_index: 4 })]
        );

        handler
            .on_user_interaction_feedback(
                &ctx,
                InteractionKind::EnterConsent,
                user.id,
                &InteractionFeedback::Consent { user_index: 4, code: 42 },
            )
            .unwrap();
        assert_eq!(ucp_writes(&recorder), vec![vec![UCP_CONSENT, 4, 42, 0]]);
        assert_eq!(ctx.settings.get_int("userMap/consentByIndex/4", -1).unwrap(), 42);
    }

    #[tokio::test]
    async fn test_choose_create_new_registers_and_maps() {
        let user = test_user();
        let (ctx, recorder) = ContextBuilder::new(TEST_MAC)
            .handler("StandardWeightProfileHandler")
            .user(user.clone())
            .build()
            .await;
        let mut handler = StandardWeightProfileHandler::new();

        handler
            .on_user_interaction_feedback(
                &ctx,
                InteractionKind::ChooseUser,
                user.id,
                &InteractionFeedback::UserIndex(CREATE_NEW_SLOT),
            )
            .unwrap();
        let consent = handler.pending_consent_for_new_user.unwrap();
        let [c_lo, c_hi] = (consent as u16).to_le_bytes();
        assert_eq!(ucp_writes(&recorder), vec![vec![UCP_REGISTER_NEW_USER, c_lo, c_hi]]);

        handler
            .on_notification(&ctx, CHR_USER_CONTROL_POINT, &[UCP_RESPONSE, UCP_REGISTER_NEW_USER, 1, 5], &user)
            .unwrap();
        assert_eq!(ctx.settings.get_int("userMap/userIdByIndex/5", -1).unwrap(), user.id);
        assert_eq!(ctx.settings.get_int("userMap/consentByIndex/5", -1).unwrap(), consent);
        let ucp = ucp_writes(&recorder);
        assert_eq!(ucp.last().unwrap(), &vec![UCP_CONSENT, 5, c_lo, c_hi]);
        let user_data = recorder
            .transport
            .writes()
            .iter()
            .filter(|w| w.service == SVC_USER_DATA && w.characteristic != CHR_USER_CONTROL_POINT)
            .count();
        assert_eq!(user_data, 4);

        handler
            .on_notification(&ctx, CHR_USER_CONTROL_POINT, &[UCP_RESPONSE, UCP_CONSENT, 1], &user)
            .unwrap();
        assert!(recorder.infos().iter().any(|m| m.contains("reference measurement")));
    }

    #[tokio::test]
    async fn test_register_failure_warns() {
        let user = test_user();
        let (ctx, recorder) = ContextBuilder::new(TEST_MAC).user(user.clone()).build().await;
        let mut handler = StandardWeightProfileHandler::new();
        handler
            .on_notification(
                &ctx,
                CHR_USER_CONTROL_POINT,
                &[UCP_RESPONSE, UCP_REGISTER_NEW_USER, UCP_RESULT_OPERATION_FAILED],
                &user,
            )
            .unwrap();
        assert_eq!(recorder.warnings(), vec!["All user slots on the scale are in use".to_string()]);
    }

    #[tokio::test]
    async fn test_weight_and_body_composition_merge() {
        let user = test_user();
        let (ctx, recorder) = ContextBuilder::new(TEST_MAC)
            .handler("StandardWeightProfileHandler")
            .user(user.clone())
            .setting(settings_key("userMap/userIdByIndex/1"), json!(user.id))
            .build()
            .await;
        let mut handler = StandardWeightProfileHandler::new();

        handler
            .on_notification(&ctx, CHR_WEIGHT_MEASUREMENT, &WEIGHT_SLOT_1, &user)
            .unwrap();
        assert!(recorder.published().is_empty());

        handler
            .on_notification(&ctx, CHR_BODY_COMPOSITION_MEASUREMENT, &BODY_SLOT_1, &user)
            .unwrap();
        let published = recorder.published();
        assert_eq!(published.len(), 1);
        let m = &published[0];
        assert_eq!(m.user_id, Some(user.id));
        assert!((m.weight - 72.5).abs() < 1e-3);
        assert!((m.fat - 21.5).abs() < 1e-3);
        assert!((m.water - 40.0).abs() < 1e-3);
    }

    #[tokio::test]
    async fn test_unmapped_reading_published_immediately() {
        let user = test_user();
        let (ctx, recorder) = ContextBuilder::new(TEST_MAC).user(user.clone()).build().await;
        let mut handler = StandardWeightProfileHandler::new();
        handler
            .on_notification(&ctx, CHR_WEIGHT_MEASUREMENT, &[0x00, 0xA4, 0x38], &user)
            .unwrap();
        let published = recorder.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].user_id, None);
    }

    #[tokio::test]
    async fn test_pending_measurement_flushed_on_disconnect() {
        let user = test_user();
        let (ctx, recorder) = ContextBuilder::new(TEST_MAC)
            .handler("StandardWeightProfileHandler")
            .user(user.clone())
            .setting(settings_key("userMap/userIdByIndex/1"), json!(user.id))
            .build()
            .await;
        let mut handler = StandardWeightProfileHandler::new();
        handler
            .on_notification(&ctx, CHR_WEIGHT_MEASUREMENT, &WEIGHT_SLOT_1, &user)
            .unwrap();
        handler.on_disconnected(&ctx);
        assert_eq!(recorder.published().len(), 1);
    }

    #[tokio::test]
    async fn test_truncated_frame_is_an_error() {
        let user = test_user();
        let (ctx, _recorder) = ContextBuilder::new(TEST_MAC).user(user.clone()).build().await;
        let mut handler = StandardWeightProfileHandler::new();
        let result = handler.on_notification(&ctx, CHR_WEIGHT_MEASUREMENT, &[0x02, 0xA4, 0x38, 0xE8], &user);
        assert!(matches!(result, Err(HandlerError::ShortFrame { .. })));
    }

    #[tokio::test]
    async fn test_mismatched_feedback_is_rejected() {
        let user = test_user();
        let (ctx, _recorder) = ContextBuilder::new(TEST_MAC).user(user.clone()).build().await;
        let mut handler = StandardWeightProfileHandler::new();
        assert!(
            handler
                .on_user_interaction_feedback(
                    &ctx,
                    InteractionKind::EnterConsent,
                    user.id,
                    &InteractionFeedback::UserIndex(1),
                )
                .is_err()
        );
    }
}
