//! Xiaomi Body Composition Scale S400.
//!
//! Broadcast only. Readings arrive as AES-CCM encrypted service data and are
//! decrypted with the bind key the user extracted from the vendor cloud. The
//! key and (optionally) the MAC address come from driver settings.

use super::{
    BroadcastAction, DeviceCapability, DeviceSupport, HandlerContext, LinkMode, ScaleDeviceHandler,
};
use crate::advertisement::ScannedDeviceInfo;
use crate::calc::MiScaleCalculator;
use crate::codec::uuid16;
use crate::measurement::ScaleMeasurement;
use crate::s400::{S400Decryptor, S400Reading, is_valid_bind_key, is_valid_mac_address};
use crate::user::ScaleUser;
use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const SETTINGS_KEY_BIND_KEY: &str = "s400_bind_key";
pub const SETTINGS_KEY_MAC_ADDRESS: &str = "s400_mac_address";

const KNOWN_NAME_PATTERNS: [&str; 3] = ["SCALE S400", "XMTZC14HM", "XMTZC"];
const BODY_COMPOSITION_SERVICE: Uuid = uuid16(0x181B);

#[derive(Debug, Default)]
pub struct MiScaleS400Handler {
    warned_missing_config: bool,
}

impl MiScaleS400Handler {
    pub fn new() -> Self {
        Self::default()
    }

    fn service_data(device: &ScannedDeviceInfo) -> Option<&[u8]> {
        if let Some(data) = device.service_data.get(&BODY_COMPOSITION_SERVICE)
            && data.len() >= 24
        {
            return Some(data);
        }
        device
            .service_data
            .values()
            .find(|data| (24..=26).contains(&data.len()))
            .map(Vec::as_slice)
    }

    /// Build the published measurement, with body composition when the reading
    /// carries an impedance.
    pub fn to_measurement(reading: &S400Reading, user: &ScaleUser) -> ScaleMeasurement {
        let mut measurement = ScaleMeasurement {
            date_time: Some(Utc::now()),
            weight: reading.weight_kg,
            user_id: Some(user.id),
            heart_rate: reading.heart_rate,
            ..ScaleMeasurement::default()
        };
        if let Some(impedance) = reading.impedance.filter(|imp| *imp > 0.0) {
            let lib = MiScaleCalculator::new(user.gender.sex_flag(), user.age(), user.body_height);
            let weight = measurement.weight;
            measurement.impedance = f64::from(impedance);
            measurement.fat = lib.body_fat(weight, impedance);
            measurement.water = lib.water(weight, impedance);
            measurement.muscle = lib.muscle(weight, impedance);
            measurement.bone = lib.bone_mass(weight, impedance);
            measurement.lbm = lib.lbm(weight, impedance);
            measurement.visceral_fat = lib.visceral_fat(weight);
        }
        measurement
    }
}

impl ScaleDeviceHandler for MiScaleS400Handler {
    fn name(&self) -> &'static str {
        "MiScaleS400Handler"
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn support_for(&self, device: &ScannedDeviceInfo) -> Option<DeviceSupport> {
        let name = device.upper_name();
        if !KNOWN_NAME_PATTERNS.iter().any(|p| name.contains(p)) {
            return None;
        }
        let caps = [DeviceCapability::LiveWeightStream, DeviceCapability::BodyComposition];
        Some(
            DeviceSupport::new("Xiaomi Body Composition Scale S400", LinkMode::BroadcastOnly)
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
        let bind_key = ctx
            .settings
            .get_string(SETTINGS_KEY_BIND_KEY, None)
            .ok()
            .flatten()
            .filter(|key| is_valid_bind_key(key));
        let Some(bind_key) = bind_key else {
            if !self.warned_missing_config {
                warn!("S400: missing or invalid bind key");
                ctx.warn("S400 bind key missing or invalid, configure it in the scale settings");
                self.warned_missing_config = true;
            }
            return BroadcastAction::Ignored;
        };

        let mac = ctx
            .settings
            .get_string(SETTINGS_KEY_MAC_ADDRESS, None)
            .ok()
            .flatten()
            .filter(|mac| is_valid_mac_address(mac))
            .unwrap_or_else(|| device.address.to_string());

        let Some(data) = Self::service_data(device) else {
            return BroadcastAction::Ignored;
        };
        debug!(len = data.len(), address = %device.address, "S400 advertisement");

        let Some(decryptor) = S400Decryptor::new(&mac, &bind_key) else {
            return BroadcastAction::Ignored;
        };
        let Some(reading) = decryptor.decrypt(data) else {
            debug!("S400: no valid measurement in advertisement");
            return BroadcastAction::Ignored;
        };

        info!(
            weight = reading.weight_kg,
            impedance = ?reading.impedance,
            heart_rate = ?reading.heart_rate,
            "S400 measurement"
        );
        ctx.publish(Self::to_measurement(&reading, user));
        BroadcastAction::ConsumedStop
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::s400::seal_frame;
    use crate::test_utils::{recording_context_with, test_user};
    use serde_json::json;

    const MAC: &str = "84:46:93:64:A5:E6";
    const KEY: &str = "58305740b64e4b425e518aa1f4e51339";

    fn advert(frame: Vec<u8>) -> ScannedDeviceInfo {
        let mut info = ScannedDeviceInfo::new(MAC.parse().unwrap()).with_name("Xiaomi Scale S400 A5E6");
        info.service_data.insert(BODY_COMPOSITION_SERVICE, frame);
        info
    }

    fn configured() -> Vec<(String, serde_json::Value)> {
        vec![(
            format!("ble/MiScaleS400Handler/{MAC}/{SETTINGS_KEY_BIND_KEY}"),
            json!(KEY),
        )]
    }

    #[test]
    fn test_support_for_names() {
        let handler = MiScaleS400Handler::new();
        for name in ["Xiaomi Scale S400 8E8B", "XMTZC14HM", "xmtzc12"] {
            let info = ScannedDeviceInfo::default().with_name(name);
            let support = handler.support_for(&info).expect(name);
            assert_eq!(support.link_mode, LinkMode::BroadcastOnly);
        }
        assert!(handler.support_for(&ScannedDeviceInfo::default().with_name("MIBCS")).is_none());
    }

    #[tokio::test]
    async fn test_weight_and_heart_rate_published() {
        let user = test_user();
        let (ctx, recorder) =
            recording_context_with(MAC.parse().unwrap(), Some(user.clone()), "MiScaleS400Handler", configured())
                .await;
        let mut handler = MiScaleS400Handler::new();

        let frame = seal_frame(MAC, KEY, 700 | (80 << 11), [0x48, 0x59, 0x01, 0x02, 0x03]);
        let action = handler.on_advertisement(&ctx, &advert(frame), &user);

        assert_eq!(action, BroadcastAction::ConsumedStop);
        let published = recorder.published();
        assert_eq!(published.len(), 1);
        assert!((published[0].weight - 70.0).abs() < 1e-4);
        assert_eq!(published[0].heart_rate, Some(130));
        assert_eq!(published[0].fat, 0.0);
        assert_eq!(published[0].user_id, Some(user.id));
    }

    #[tokio::test]
    async fn test_impedance_adds_body_composition() {
        let user = test_user();
        let (ctx, recorder) =
            recording_context_with(MAC.parse().unwrap(), Some(user.clone()), "MiScaleS400Handler", configured())
                .await;
        let mut handler = MiScaleS400Handler::new();

        let frame = seal_frame(MAC, KEY, 812 | (5000 << 18), [0x48, 0x59, 0x01, 0x02, 0x03]);
        handler.on_advertisement(&ctx, &advert(frame), &user);

        let m = &recorder.published()[0];
        assert_eq!(m.impedance, 500.0);
        assert!(m.fat > 0.0);
        assert!(m.water > 0.0);
        assert!(m.muscle > 0.0);
    }

    #[tokio::test]
    async fn test_missing_bind_key_warns_once() {
        let user = test_user();
        let (ctx, recorder) =
            recording_context_with(MAC.parse().unwrap(), Some(user.clone()), "MiScaleS400Handler", vec![]).await;
        let mut handler = MiScaleS400Handler::new();
        let frame = seal_frame(MAC, KEY, 700, [0x48, 0x59, 0x01, 0x02, 0x03]);

        for _ in 0..3 {
            let action = handler.on_advertisement(&ctx, &advert(frame.clone()), &user);
            assert_eq!(action, BroadcastAction::Ignored);
        }
        assert_eq!(recorder.warnings().len(), 1);
        assert!(recorder.published().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_key_is_ignored() {
        let user = test_user();
        let (ctx, recorder) =
            recording_context_with(MAC.parse().unwrap(), Some(user.clone()), "MiScaleS400Handler", configured())
                .await;
        let mut handler = MiScaleS400Handler::new();
        let frame = seal_frame(MAC, "00000000000000000000000000000000", 700, [0x48, 0x59, 0x01, 0x02, 0x03]);
        assert_eq!(
            handler.on_advertisement(&ctx, &advert(frame), &user),
            BroadcastAction::Ignored
        );
        assert!(recorder.published().is_empty());
    }
}
