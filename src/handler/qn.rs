//! QN / Renpho ES-26M style scales.
//!
//! Two nearly identical layouts exist: type 1 on service FFE0 (notify FFE1,
//! indicate FFE2, config FFE3, time FFE4) and type 2 on FFF0 (notify FFF1, a
//! shared write characteristic FFF2). We configure whichever is present.
//!
//! Vendor frames start with an opcode and a length, followed by a protocol
//! type byte that every reply must echo. All outgoing frames end with the low
//! byte of the sum of the preceding bytes.

use super::{
    DeviceCapability, DeviceSupport, HandlerContext, HandlerError, LinkMode, ScaleDeviceHandler,
};
use crate::advertisement::ScannedDeviceInfo;
use crate::calc::TrisaCalculator;
use crate::codec::{HexPreview, sum_checksum, u16_be, uuid16};
use crate::measurement::ScaleMeasurement;
use crate::user::{ScaleUser, WeightUnit};
use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

/// Seconds between the Unix epoch and the scale's epoch.
const SCALE_UNIX_TIMESTAMP_OFFSET: i64 = 946_702_800;

const SVC_T1: Uuid = uuid16(0xFFE0);
const CHR_T1_NOTIFY_WEIGHT_TIME: Uuid = uuid16(0xFFE1);
const CHR_T1_INDICATE_MISC: Uuid = uuid16(0xFFE2);
const CHR_T1_WRITE_CONFIG: Uuid = uuid16(0xFFE3);
const CHR_T1_WRITE_TIME: Uuid = uuid16(0xFFE4);

const SVC_T2: Uuid = uuid16(0xFFF0);
const CHR_T2_NOTIFY_WEIGHT_TIME: Uuid = uuid16(0xFFF1);
const CHR_T2_WRITE_SHARED: Uuid = uuid16(0xFFF2);

const SVC_GENERIC_ACCESS: Uuid = uuid16(0x1800);
const CHR_DEVICE_NAME: Uuid = uuid16(0x2A00);
const SVC_DEVICE_INFO: Uuid = uuid16(0x180A);
const DEVICE_INFO_CHARS: [u16; 4] = [0x2A29, 0x2A24, 0x2A26, 0x2A28];

const OP_LIVE_WEIGHT: u8 = 0x10;
const OP_SCALE_INFO: u8 = 0x12;
const OP_LEGACY_ACK: u8 = 0x14;
const OP_TIME_REQUEST: u8 = 0x21;

#[derive(Debug)]
pub struct QnHandler {
    published: bool,
    weight_scale_factor: f32,
    protocol_type: u8,
}

impl Default for QnHandler {
    fn default() -> Self {
        Self {
            published: false,
            weight_scale_factor: 100.0,
            protocol_type: 0,
        }
    }
}

impl QnHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the last byte with the checksum of the rest.
    fn seal(mut frame: Vec<u8>) -> Vec<u8> {
        let last = frame.len() - 1;
        frame[last] = sum_checksum(&frame[..last]);
        frame
    }

    /// Write to the type 2 shared characteristic, else the type 1 config one.
    fn write_reply(ctx: &HandlerContext, frame: &[u8]) {
        if ctx.has_characteristic(SVC_T2, CHR_T2_WRITE_SHARED) {
            ctx.write(SVC_T2, CHR_T2_WRITE_SHARED, frame);
        } else if ctx.has_characteristic(SVC_T1, CHR_T1_WRITE_CONFIG) {
            ctx.write(SVC_T1, CHR_T1_WRITE_CONFIG, frame);
        }
    }

    fn handle_vendor_frame(&mut self, ctx: &HandlerContext, data: &[u8], user: &ScaleUser) {
        if data.len() < 3 {
            return;
        }
        if self.protocol_type == 0 {
            self.protocol_type = data[2];
            debug!(protocol_type = format_args!("{:#04x}", data[2]), "QN protocol type");
        }

        match data[0] {
            OP_LIVE_WEIGHT => self.handle_live_weight(ctx, data, user),
            OP_LEGACY_ACK => {
                let reply = Self::seal(vec![0x20, 0x08, self.protocol_type, 0x25, 0x74, 0x18, 0x30, 0x00]);
                Self::write_reply(ctx, &reply);
            }
            OP_SCALE_INFO => {
                if data.len() > 10 {
                    self.weight_scale_factor = if data[10] == 1 { 100.0 } else { 10.0 };
                    debug!(factor = self.weight_scale_factor, "QN weight scale factor");
                }
            }
            OP_TIME_REQUEST => {
                let reply = Self::seal(vec![
                    0xA0,
                    0x0D,
                    self.protocol_type,
                    0xFE,
                    0xFF,
                    0xEE,
                    0x01,
                    0x1C,
                    0x06,
                    0x86,
                    0x03,
                    0x02,
                    0x00,
                ]);
                Self::write_reply(ctx, &reply);
            }
            op => debug!(op = format_args!("{op:#04x}"), data = %HexPreview::new(data), "QN unhandled opcode"),
        }
    }

    /// Opcode 0x10: weight in bytes 3..5, stable flag in 5, resistances in 6..10.
    fn handle_live_weight(&mut self, ctx: &HandlerContext, data: &[u8], user: &ScaleUser) {
        debug!(data = %HexPreview::new(data), "QN live frame");
        if data.len() < 10 || data[5] != 1 || self.published {
            return;
        }
        let (Some(raw), Some(r1), Some(r2)) = (u16_be(data, 3), u16_be(data, 6), u16_be(data, 8)) else {
            return;
        };

        let mut weight = f32::from(raw) / self.weight_scale_factor;
        // some type 2 units report /10 before the 0x12 frame arrives
        if weight <= 5.0 || weight >= 250.0 {
            weight /= 10.0;
        }
        debug!(weight, r1, r2, factor = self.weight_scale_factor, "QN stable weight");
        if weight <= 0.0 {
            return;
        }

        let r1 = f32::from(r1);
        let impedance = if r1 < 410.0 { 3.0 } else { 0.3 * (r1 - 400.0) };
        let trisa = TrisaCalculator::new(user.gender.sex_flag(), user.age(), user.body_height);

        ctx.publish(ScaleMeasurement {
            date_time: Some(Utc::now()),
            user_id: Some(user.id),
            weight,
            fat: trisa.fat(weight, impedance),
            water: trisa.water(weight, impedance),
            muscle: trisa.muscle(weight, impedance),
            bone: trisa.bone(weight, impedance),
            ..ScaleMeasurement::default()
        });
        self.published = true;
    }
}

impl ScaleDeviceHandler for QnHandler {
    fn name(&self) -> &'static str {
        "QNHandler"
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn support_for(&self, device: &ScannedDeviceInfo) -> Option<DeviceSupport> {
        let name = device.name_or_empty().to_lowercase();
        let has_service = device.advertises(&SVC_T1) || device.advertises(&SVC_T2);
        let qn_name = name.contains("qn-scale") || name.contains("renpho-scale");
        if !(has_service && qn_name) {
            return None;
        }
        let caps = [
            DeviceCapability::TimeSync,
            DeviceCapability::LiveWeightStream,
            DeviceCapability::BodyComposition,
        ];
        Some(
            DeviceSupport::new("QN Scale", LinkMode::ConnectGatt)
                .capabilities(&caps)
                .implemented(&caps),
        )
    }

    fn on_connected(&mut self, ctx: &HandlerContext, user: &ScaleUser) -> Result<(), HandlerError> {
        ctx.read(SVC_GENERIC_ACCESS, CHR_DEVICE_NAME);
        for short in DEVICE_INFO_CHARS {
            ctx.read(SVC_DEVICE_INFO, uuid16(short));
        }

        for (service, characteristic) in [
            (SVC_T1, CHR_T1_NOTIFY_WEIGHT_TIME),
            (SVC_T1, CHR_T1_INDICATE_MISC),
            (SVC_T2, CHR_T2_NOTIFY_WEIGHT_TIME),
        ] {
            if ctx.has_characteristic(service, characteristic) {
                ctx.set_notify_on(service, characteristic);
            }
        }

        // the vendor app sends lb for stones as well
        let unit = match user.scale_unit {
            WeightUnit::Lb | WeightUnit::St => 0x02,
            WeightUnit::Kg => 0x01,
        };
        let config = Self::seal(vec![0x13, 0x09, self.protocol_type, unit, 0x10, 0x00, 0x00, 0x00, 0x00]);
        if ctx.has_characteristic(SVC_T1, CHR_T1_WRITE_CONFIG) {
            ctx.write(SVC_T1, CHR_T1_WRITE_CONFIG, &config);
        }
        if ctx.has_characteristic(SVC_T2, CHR_T2_WRITE_SHARED) {
            ctx.write(SVC_T2, CHR_T2_WRITE_SHARED, &config);
        }

        let scale_time = (Utc::now().timestamp() - SCALE_UNIX_TIMESTAMP_OFFSET) as u32;
        let mut time = vec![0x02];
        time.extend_from_slice(&scale_time.to_le_bytes());
        if ctx.has_characteristic(SVC_T1, CHR_T1_WRITE_TIME) {
            ctx.write(SVC_T1, CHR_T1_WRITE_TIME, &time);
        }
        if ctx.has_characteristic(SVC_T2, CHR_T2_WRITE_SHARED) {
            ctx.write(SVC_T2, CHR_T2_WRITE_SHARED, &time);
        }

        ctx.info("Step on the scale");
        Ok(())
    }

    fn on_notification(
        &mut self,
        ctx: &HandlerContext,
        characteristic: Uuid,
        data: &[u8],
        user: &ScaleUser,
    ) -> Result<(), HandlerError> {
        if characteristic == CHR_T1_NOTIFY_WEIGHT_TIME || characteristic == CHR_T2_NOTIFY_WEIGHT_TIME {
            self.handle_vendor_frame(ctx, data, user);
        } else if characteristic == CHR_T1_INDICATE_MISC {
            debug!(data = %HexPreview::new(data), "QN indicate");
        } else {
            debug!(%characteristic, data = %HexPreview::with_limit(data, 64), "QN notify");
        }
        Ok(())
    }
}
