//! iHealth HS3 (HS33FA4A), classic serial link.
//!
//! The scale streams frames into the serial link; a weight frame is
//! `A0 09 A6 28`, five ignored bytes, then two bytes whose hex digits spell the
//! weight with one decimal (`12 34` is 123.4 kg). `A0 09 A6 33` is a clock
//! frame and is skipped.

use super::{DeviceCapability, DeviceSupport, HandlerContext, HandlerError, LinkMode, ScaleDeviceHandler};
use crate::advertisement::ScannedDeviceInfo;
use crate::codec::CLASSIC_DATA_UUID;
use crate::measurement::ScaleMeasurement;
use crate::user::ScaleUser;
use chrono::Utc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// The same weight repeated within this window is a resend.
const DUPLICATE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum ParseState {
    #[default]
    SeekStart,
    ExpectLength,
    ExpectMarker,
    ExpectType,
    Skip(u8),
    WeightHigh,
    WeightLow(u8),
}

#[derive(Debug, Default)]
pub struct IHealthHs3Handler {
    state: ParseState,
    last_weight: Option<([u8; 2], Instant)>,
}

impl IHealthHs3Handler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the byte stream through the frame parser, returning completed weights.
    fn feed(&mut self, chunk: &[u8]) -> Vec<[u8; 2]> {
        let mut weights = Vec::new();
        for &b in chunk {
            self.state = match self.state {
                ParseState::SeekStart if b == 0xA0 => ParseState::ExpectLength,
                ParseState::SeekStart => ParseState::SeekStart,
                ParseState::ExpectLength if b == 0x09 => ParseState::ExpectMarker,
                ParseState::ExpectLength if b == 0xA0 => ParseState::ExpectLength,
                ParseState::ExpectMarker if b == 0xA6 => ParseState::ExpectType,
                ParseState::ExpectType if b == 0x28 => ParseState::Skip(5),
                ParseState::Skip(1) => ParseState::WeightHigh,
                ParseState::Skip(n) => ParseState::Skip(n - 1),
                ParseState::WeightHigh => ParseState::WeightLow(b),
                ParseState::WeightLow(high) => {
                    weights.push([high, b]);
                    ParseState::SeekStart
                }
                _ => ParseState::SeekStart,
            };
        }
        weights
    }

    fn is_duplicate(&self, weight: [u8; 2], now: Instant) -> bool {
        matches!(self.last_weight, Some((last, at)) if last == weight && now - at < DUPLICATE_WINDOW)
    }

    /// `12 34` reads as "123.4".
    fn decode_weight(bytes: [u8; 2]) -> Option<f32> {
        let hex = format!("{:02X}{:02X}", bytes[0], bytes[1]);
        let (int, frac) = hex.split_at(3);
        format!("{int}.{frac}").parse().ok()
    }
}

impl ScaleDeviceHandler for IHealthHs3Handler {
    fn name(&self) -> &'static str {
        "IHealthHS3Handler"
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn support_for(&self, device: &ScannedDeviceInfo) -> Option<DeviceSupport> {
        if !device.upper_name().starts_with("IHEALTH HS3") {
            return None;
        }
        let caps = [DeviceCapability::LiveWeightStream];
        Some(
            DeviceSupport::new("iHealth HS3", LinkMode::ClassicSpp)
                .capabilities(&caps)
                .implemented(&caps),
        )
    }

    fn on_connected(&mut self, ctx: &HandlerContext, _user: &ScaleUser) -> Result<(), HandlerError> {
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
        if characteristic != CLASSIC_DATA_UUID || data.is_empty() {
            return Ok(());
        }
        for weight in self.feed(data) {
            let now = Instant::now();
            if self.is_duplicate(weight, now) {
                debug!("HS3: duplicate weight within window dropped");
                continue;
            }
            self.last_weight = Some((weight, now));
            let Some(kg) = Self::decode_weight(weight) else {
                warn!(high = weight[0], low = weight[1], "HS3: weight bytes are not decimal digits");
                continue;
            };
            ctx.publish(ScaleMeasurement {
                date_time: Some(Utc::now()),
                weight: kg,
                ..ScaleMeasurement::default()
            });
        }
        Ok(())
    }
}
