//! AAA002 / AAA007 / AAA013 broadcast scales.
//!
//! Manufacturer data of at least 12 bytes: the advertiser MAC, then a 6-byte
//! payload XOR-masked with the high byte of the company id.
//!
//! ```text
//! payload[0..4]  big-endian [ final:1 | reserved:13 | grams:18 ]
//! payload[4]     frame type, 0xAD weight or 0xA6 impedance
//! payload[5]     checksum, low 5 bits of sum(payload[0..5])
//! ```

use super::{
    BroadcastAction, DeviceCapability, DeviceSupport, HandlerContext, LinkMode, ScaleDeviceHandler,
};
use crate::advertisement::ScannedDeviceInfo;
use crate::codec::{u32_be, HexPreview};
use crate::measurement::ScaleMeasurement;
use crate::user::ScaleUser;
use chrono::Utc;
use tracing::debug;

const KNOWN_NAMES: [&str; 3] = ["AAA002", "AAA007", "AAA013"];
const FRAME_WEIGHT: u8 = 0xAD;
const FRAME_IMPEDANCE: u8 = 0xA6;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Frame {
    Weight { grams: u32, is_final: bool },
    Impedance,
    Other(u8),
}

#[derive(Debug, Default)]
pub struct AaaxHandler {
    published: bool,
}

impl AaaxHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unmask and validate one manufacturer record.
    fn decode(company: u16, data: &[u8]) -> Option<Frame> {
        if data.len() < 12 {
            return None;
        }
        let key = (company >> 8) as u8;
        let mut payload = [0u8; 6];
        for (out, b) in payload.iter_mut().zip(&data[6..12]) {
            *out = b ^ key;
        }

        let sum: u32 = payload[..5].iter().map(|b| u32::from(*b)).sum();
        if sum & 0x1F != u32::from(payload[5] & 0x1F) {
            debug!(payload = %HexPreview::new(&payload), "AAAx: checksum mismatch");
            return None;
        }

        Some(match payload[4] {
            FRAME_WEIGHT => {
                let value = u32_be(&payload, 0)?;
                Frame::Weight {
                    grams: value & 0x3FFFF,
                    is_final: value >> 31 == 1,
                }
            }
            FRAME_IMPEDANCE => Frame::Impedance,
            other => Frame::Other(other),
        })
    }
}

impl ScaleDeviceHandler for AaaxHandler {
    fn name(&self) -> &'static str {
        "AAAxHandler"
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn support_for(&self, device: &ScannedDeviceInfo) -> Option<DeviceSupport> {
        let name = device.name_or_empty().trim();
        if !KNOWN_NAMES.contains(&name) {
            return None;
        }
        let caps = [DeviceCapability::LiveWeightStream];
        Some(
            DeviceSupport::new(format!("AAA-series Broadcast Scale ({name})"), LinkMode::BroadcastOnly)
                .capabilities(&caps)
                .implemented(&caps),
        )
    }

    fn on_advertisement(
        &mut self,
        ctx: &HandlerContext,
        device: &ScannedDeviceInfo,
        _user: &ScaleUser,
    ) -> BroadcastAction {
        if self.published {
            return BroadcastAction::ConsumedStop;
        }

        for (company, data) in &device.manufacturer_data {
            match Self::decode(*company, data) {
                Some(Frame::Weight { grams, is_final }) => {
                    debug!(grams, is_final, "AAAx weight frame");
                    if !is_final || grams == 0 {
                        return BroadcastAction::ConsumedKeepScanning;
                    }
                    ctx.publish(ScaleMeasurement {
                        date_time: Some(Utc::now()),
                        weight: grams as f32 / 1000.0,
                        ..ScaleMeasurement::default()
                    });
                    self.published = true;
                    return BroadcastAction::ConsumedStop;
                }
                Some(Frame::Impedance) => {
                    debug!("AAAx impedance frame ignored");
                    return BroadcastAction::ConsumedKeepScanning;
                }
                Some(Frame::Other(kind)) => debug!("AAAx: unsupported frame type {kind:#04x}"),
                None => {}
            }
        }
        BroadcastAction::Ignored
    }
}
