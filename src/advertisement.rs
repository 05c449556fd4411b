//! What a scan tells us about a device, before any connection is made.

use crate::mac_address::MacAddress;
use std::collections::BTreeMap;
use uuid::Uuid;

// AD types
const AD_TYPE_UUID16_INCOMPLETE: u8 = 0x02;
const AD_TYPE_UUID16_COMPLETE: u8 = 0x03;
const AD_TYPE_UUID128_INCOMPLETE: u8 = 0x06;
const AD_TYPE_UUID128_COMPLETE: u8 = 0x07;
const AD_TYPE_SHORT_NAME: u8 = 0x08;
const AD_TYPE_COMPLETE_NAME: u8 = 0x09;
const AD_TYPE_SERVICE_DATA_UUID16: u8 = 0x16;
const AD_TYPE_MANUFACTURER_DATA: u8 = 0xFF;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScannedDeviceInfo {
    pub name: Option<String>,
    pub address: MacAddress,
    pub rssi: i16,
    pub service_uuids: Vec<Uuid>,
    /// Company id to payload (company id bytes stripped).
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
    pub service_data: BTreeMap<Uuid, Vec<u8>>,
    /// Name of the handler a previous lookup settled on, if any.
    pub handler_hint: Option<String>,
}

impl ScannedDeviceInfo {
    pub fn new(address: MacAddress) -> Self {
        Self {
            address,
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Device name, or the empty string.
    pub fn name_or_empty(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }

    /// Upper-cased device name, used by the name heuristics.
    pub fn upper_name(&self) -> String {
        self.name_or_empty().to_uppercase()
    }

    pub fn advertises(&self, service: &Uuid) -> bool {
        self.service_uuids.contains(service)
    }

    /// Flat byte view of the advertised data, stable across identical packets.
    pub fn payload_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        for (company, data) in &self.manufacturer_data {
            bytes.extend_from_slice(&company.to_le_bytes());
            bytes.extend_from_slice(data);
        }
        for (uuid, data) in &self.service_data {
            bytes.extend_from_slice(uuid.as_bytes());
            bytes.extend_from_slice(data);
        }
        bytes
    }

    /// Merge the AD structures of a raw advertisement into this record.
    ///
    /// Malformed trailing structures are ignored.
    pub fn absorb_ad_structures(&mut self, ad_data: &[u8]) {
        let mut offset = 0;
        while offset + 2 <= ad_data.len() {
            let len = ad_data[offset] as usize;
            if len == 0 || offset + 1 + len > ad_data.len() {
                break;
            }
            let ad_type = ad_data[offset + 1];
            let body = &ad_data[offset + 2..offset + 1 + len];

            match ad_type {
                AD_TYPE_MANUFACTURER_DATA if body.len() >= 2 => {
                    let company = u16::from_le_bytes([body[0], body[1]]);
                    self.manufacturer_data.insert(company, body[2..].to_vec());
                }
                AD_TYPE_SERVICE_DATA_UUID16 if body.len() >= 2 => {
                    let short = u16::from_le_bytes([body[0], body[1]]);
                    self.service_data
                        .insert(crate::codec::uuid16(short), body[2..].to_vec());
                }
                AD_TYPE_UUID16_INCOMPLETE | AD_TYPE_UUID16_COMPLETE => {
                    for chunk in body.chunks_exact(2) {
                        let uuid = crate::codec::uuid16(u16::from_le_bytes([chunk[0], chunk[1]]));
                        if !self.service_uuids.contains(&uuid) {
                            self.service_uuids.push(uuid);
                        }
                    }
                }
                AD_TYPE_UUID128_INCOMPLETE | AD_TYPE_UUID128_COMPLETE => {
                    for chunk in body.chunks_exact(16) {
                        let mut raw = [0u8; 16];
                        raw.copy_from_slice(chunk);
                        raw.reverse();
                        let uuid = Uuid::from_bytes(raw);
                        if !self.service_uuids.contains(&uuid) {
                            self.service_uuids.push(uuid);
                        }
                    }
                }
                AD_TYPE_SHORT_NAME | AD_TYPE_COMPLETE_NAME => {
                    if let Ok(name) = std::str::from_utf8(body)
                        && (ad_type == AD_TYPE_COMPLETE_NAME || self.name.is_none())
                    {
                        self.name = Some(name.trim_end_matches('\0').to_string());
                    }
                }
                _ => {}
            }

            offset += 1 + len;
        }
    }
}
