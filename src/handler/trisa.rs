//! Trisa Body Analyze 4.0 (Transtek GBF-1257-B).
//!
//! Pairing happens once: the scale uploads a 32-bit password which is kept in
//! driver settings as `trisa/password`. On later connections the scale sends a
//! challenge that must be answered with `challenge ^ password`, followed by the
//! current time. Device timestamps count seconds from 2010-01-01 UTC.

use super::{
    DeviceCapability, DeviceSupport, HandlerContext, HandlerError, LinkMode, ScaleDeviceHandler,
};
use crate::advertisement::ScannedDeviceInfo;
use crate::calc::TrisaCalculator;
use crate::codec::{HexPreview, uuid16};
use crate::measurement::ScaleMeasurement;
use crate::user::ScaleUser;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

const SVC_WEIGHT: Uuid = uuid16(0x7802);
const CHR_MEASUREMENT: Uuid = uuid16(0x8A21);
/// Host to device.
const CHR_DOWNLOAD: Uuid = uuid16(0x8A81);
/// Device to host.
const CHR_UPLOAD: Uuid = uuid16(0x8A82);

const UPLOAD_PASSWORD: u8 = 0xA0;
const UPLOAD_CHALLENGE: u8 = 0xA1;

const DOWNLOAD_UTC: u8 = 0x02;
const DOWNLOAD_RESULT: u8 = 0x20;
const DOWNLOAD_BROADCAST_ID: u8 = 0x21;

const BROADCAST_ID: i32 = 0;
const PASSWORD_KEY: &str = "trisa/password";
const NO_PASSWORD: i32 = -1;

/// 2010-01-01T00:00:00Z as a Unix timestamp.
const DEVICE_EPOCH_SECONDS: i64 = 1_262_304_000;

#[derive(Debug, Default)]
pub struct TrisaBodyAnalyzeHandler {
    password: Option<i32>,
}

impl TrisaBodyAnalyzeHandler {
    pub fn new() -> Self {
        Self::default()
    }

    fn write_command(ctx: &HandlerContext, opcode: u8, argument: i32) {
        let mut frame = vec![opcode];
        frame.extend_from_slice(&argument.to_le_bytes());
        ctx.write(SVC_WEIGHT, CHR_DOWNLOAD, &frame);
    }

    fn i32_le(data: &[u8], offset: usize) -> Option<i32> {
        let b = data.get(offset..offset + 4)?;
        Some(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// 24-bit little endian mantissa followed by a signed decimal exponent.
    fn base10_float(data: &[u8], offset: usize) -> Option<f32> {
        let b = data.get(offset..offset + 4)?;
        let mantissa = u32::from_le_bytes([b[0], b[1], b[2], 0]);
        let exponent = b[3] as i8;
        Some((f64::from(mantissa) * 10f64.powi(i32::from(exponent))) as f32)
    }

    /// Rounded to the nearest second.
    fn device_time(now: DateTime<Utc>) -> i32 {
        ((now.timestamp_millis() + 500) / 1000 - DEVICE_EPOCH_SECONDS) as i32
    }

    fn handle_upload(&mut self, ctx: &HandlerContext, data: &[u8]) {
        let Some(&opcode) = data.first() else {
            warn!("Trisa upload without payload");
            return;
        };
        let Some(argument) = Self::i32_le(data, 1) else {
            warn!(data = %HexPreview::new(data), "Trisa upload too short");
            return;
        };
        match opcode {
            UPLOAD_PASSWORD => {
                info!("Trisa pairing password received");
                self.password = Some(argument);
                ctx.settings.put_int(PASSWORD_KEY, argument);
                ctx.info("Pairing with the scale succeeded, reconnect to take a measurement");
                Self::write_command(ctx, DOWNLOAD_BROADCAST_ID, BROADCAST_ID);
                ctx.request_disconnect();
            }
            UPLOAD_CHALLENGE => {
                let Some(password) = self.password else {
                    ctx.warn("Scale is not paired yet, put it in pairing mode and connect again");
                    ctx.request_disconnect();
                    return;
                };
                Self::write_command(ctx, DOWNLOAD_RESULT, argument ^ password);
                Self::write_command(ctx, DOWNLOAD_UTC, Self::device_time(Utc::now()));
            }
            op => warn!(op = format_args!("{op:#04x}"), "Trisa unknown upload opcode"),
        }
    }

    /// Flags byte (bit 0 timestamp, bit 1 resistance 1, bit 2 resistance 2),
    /// weight, timestamp, then the resistances that are flagged.
    fn parse_measurement(data: &[u8], user: &ScaleUser) -> Option<ScaleMeasurement> {
        let flags = *data.first()?;
        if data.len() < 9 || flags & 0x01 == 0 {
            return None;
        }
        let weight = Self::base10_float(data, 1)?;
        let device_seconds = Self::i32_le(data, 5)?;
        let mut measurement = ScaleMeasurement {
            date_time: DateTime::from_timestamp(DEVICE_EPOCH_SECONDS + i64::from(device_seconds), 0),
            weight,
            ..ScaleMeasurement::default()
        };

        let r2_offset = if flags & 0x02 != 0 { 13 } else { 9 };
        let age = user.age();
        if flags & 0x04 != 0 && age > 0 && user.body_height > 0.0 {
            if let Some(resistance) = Self::base10_float(data, r2_offset) {
                let impedance = if resistance < 410.0 { 3.0 } else { 0.3 * (resistance - 400.0) };
                let lib = TrisaCalculator::new(user.gender.sex_flag(), age, user.body_height);
                measurement.fat = lib.fat(weight, impedance);
                measurement.water = lib.water(weight, impedance);
                measurement.muscle = lib.muscle(weight, impedance);
                measurement.bone = lib.bone(weight, impedance);
            }
        }
        Some(measurement)
    }
}

impl ScaleDeviceHandler for TrisaBodyAnalyzeHandler {
    fn name(&self) -> &'static str {
        "TrisaBodyAnalyzeHandler"
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn support_for(&self, device: &ScannedDeviceInfo) -> Option<DeviceSupport> {
        let name = device.name.as_deref()?;
        if !(name.starts_with("01257B") || name.starts_with("11257B")) {
            return None;
        }
        let caps = [DeviceCapability::BodyComposition, DeviceCapability::TimeSync];
        Some(
            DeviceSupport::new("Trisa Body Analyze 4.0", LinkMode::ConnectGatt)
                .capabilities(&caps)
                .implemented(&caps),
        )
    }

    fn on_connected(&mut self, ctx: &HandlerContext, _user: &ScaleUser) -> Result<(), HandlerError> {
        ctx.set_notify_on(SVC_WEIGHT, CHR_MEASUREMENT);
        ctx.set_notify_on(SVC_WEIGHT, CHR_UPLOAD);
        self.password = ctx
            .settings
            .get_int(PASSWORD_KEY, NO_PASSWORD)
            .ok()
            .filter(|p| *p != NO_PASSWORD);
        debug!(paired = self.password.is_some(), "Trisa connected");
        Ok(())
    }

    fn on_notification(
        &mut self,
        ctx: &HandlerContext,
        characteristic: Uuid,
        data: &[u8],
        user: &ScaleUser,
    ) -> Result<(), HandlerError> {
        if characteristic == CHR_UPLOAD {
            self.handle_upload(ctx, data);
        } else if characteristic == CHR_MEASUREMENT {
            match Self::parse_measurement(data, user) {
                Some(measurement) => ctx.publish(measurement),
                None => warn!(data = %HexPreview::with_limit(data, 24), "Trisa measurement not parsed"),
            }
        } else {
            debug!(%characteristic, data = %HexPreview::new(data), "Trisa notify");
        }
        Ok(())
    }
}
