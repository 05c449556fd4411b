//! Yoda1 / Yoda0 broadcast scales.
//!
//! Weight travels in the first manufacturer data record of each advertisement.
//! Yoda1 frames carry a big-endian weight in bytes 0..2 and a flag byte at 6.
//! Yoda0 frames carry the weight in bytes 4..6 and a combined stable/unit
//! code at 10.

use super::{
    BroadcastAction, DeviceCapability, DeviceSupport, HandlerContext, LinkMode, ScaleDeviceHandler,
};
use crate::advertisement::ScannedDeviceInfo;
use crate::codec::u16_be;
use crate::measurement::ScaleMeasurement;
use crate::user::{ScaleUser, WeightUnit};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Variant {
    #[default]
    Yoda1,
    Yoda0,
}

impl Variant {
    fn from_name(name: &str) -> Option<Self> {
        let upper = name.to_uppercase();
        if upper.starts_with("YODA1") {
            Some(Variant::Yoda1)
        } else if upper.starts_with("YODA0") {
            Some(Variant::Yoda0)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Reading {
    weight: f32,
    stable: bool,
}

#[derive(Debug, Default)]
pub struct YodaHandler {
    variant: Variant,
}

impl YodaHandler {
    pub fn new() -> Self {
        Self::default()
    }

    fn parse_yoda1(payload: &[u8]) -> Option<Reading> {
        let ctrl = *payload.get(6)?;
        let raw = f32::from(u16_be(payload, 0)?);
        let unit_is_kg = ctrl & 0x04 != 0;
        let one_decimal = ctrl & 0x08 != 0;

        // jin otherwise
        let mut weight = if unit_is_kg { raw / 10.0 } else { raw / 20.0 };
        if !one_decimal {
            weight /= 10.0;
        }
        Some(Reading {
            weight,
            stable: ctrl & 0x01 != 0,
        })
    }

    fn parse_yoda0(payload: &[u8]) -> Option<Reading> {
        let ctrl = *payload.get(10)?;
        let raw = u16_be(payload, 4)?;
        let stable = matches!(ctrl, 0x25 | 0x31 | 0x39);

        let weight = match ctrl {
            0x30 | 0x31 => WeightUnit::Lb.to_kilogram(f32::from(raw) / 10.0),
            0x38 | 0x39 => {
                let stones = f32::from(raw / 256);
                let pounds = f32::from(raw % 256) / 10.0;
                WeightUnit::Lb.to_kilogram(stones * 14.0 + pounds)
            }
            _ => f32::from(raw) / 100.0,
        };
        Some(Reading { weight, stable })
    }
}

impl ScaleDeviceHandler for YodaHandler {
    fn name(&self) -> &'static str {
        "Yoda1Handler"
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn support_for(&self, device: &ScannedDeviceInfo) -> Option<DeviceSupport> {
        Variant::from_name(device.name_or_empty())?;
        let caps = [DeviceCapability::LiveWeightStream];
        Some(
            DeviceSupport::new("Yoda Scale", LinkMode::BroadcastOnly)
                .capabilities(&caps)
                .implemented(&caps),
        )
    }

    fn on_advertisement(
        &mut self,
        ctx: &HandlerContext,
        device: &ScannedDeviceInfo,
        user: &ScaleUser,
    ) -> BroadcastAction {
        if let Some(variant) = Variant::from_name(device.name_or_empty()) {
            self.variant = variant;
        }
        let Some(payload) = device.manufacturer_data.values().next() else {
            return BroadcastAction::Ignored;
        };
        if payload.len() < 7 {
            return BroadcastAction::Ignored;
        }

        let reading = match self.variant {
            // Yoda1 reports in the unit shown on its display.
            Variant::Yoda1 => Self::parse_yoda1(payload).map(|r| Reading {
                weight: user.scale_unit.to_kilogram(r.weight),
                ..r
            }),
            Variant::Yoda0 => Self::parse_yoda0(payload),
        };
        let Some(reading) = reading else {
            return BroadcastAction::Ignored;
        };
        debug!(variant = ?self.variant, weight = reading.weight, stable = reading.stable, "Yoda frame");

        if reading.stable {
            ctx.publish(ScaleMeasurement::with_weight(reading.weight));
            BroadcastAction::ConsumedStop
        } else {
            BroadcastAction::ConsumedKeepScanning
        }
    }
}
