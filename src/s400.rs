//! Decryption of Xiaomi S400 body composition scale advertisements.
//!
//! The S400 never accepts a connection for measurements. It broadcasts
//! AES-128-CCM encrypted service data instead, keyed with a per-device
//! "bind key" obtained from the vendor cloud. The nonce is built from the
//! scale's MAC address and parts of the frame itself.

use crate::mac_address::MacAddress;
use aes::Aes128;
use ccm::Ccm;
use ccm::aead::generic_array::GenericArray;
use ccm::aead::{Aead, KeyInit, Payload};
use ccm::consts::{U4, U12};

type S400Cipher = Ccm<Aes128, U4, U12>;

/// Service data length without the 2-byte UUID header.
const FRAME_LEN: usize = 24;
/// Service data length with the 2-byte UUID header still attached.
const FRAME_LEN_WITH_HEADER: usize = 26;
const BIND_KEY_HEX_LEN: usize = 32;
const ASSOCIATED_DATA: [u8; 1] = [0x11];

/// A decrypted S400 reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct S400Reading {
    pub weight_kg: f32,
    /// Impedance in ohms, only present on a full body composition reading.
    pub impedance: Option<f32>,
    /// Heart rate in beats per minute.
    pub heart_rate: Option<i32>,
}

/// Decryptor bound to one scale (MAC address and bind key).
pub struct S400Decryptor {
    cipher: S400Cipher,
    mac: MacAddress,
}

impl std::fmt::Debug for S400Decryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // the key stays out of logs
        f.debug_struct("S400Decryptor").field("mac", &self.mac).finish()
    }
}

impl S400Decryptor {
    /// Build a decryptor from the `XX:XX:XX:XX:XX:XX` address and the 32 hex
    /// character bind key. Returns `None` if either is malformed.
    pub fn new(mac_address: &str, bind_key: &str) -> Option<Self> {
        let mac: MacAddress = mac_address.parse().ok()?;
        if !is_valid_bind_key(bind_key) {
            return None;
        }
        let key = hex::decode(bind_key).ok()?;
        let cipher = S400Cipher::new_from_slice(&key).ok()?;
        Some(Self { cipher, mac })
    }

    pub fn mac(&self) -> MacAddress {
        self.mac
    }

    /// Decrypt one service data frame (24 bytes, or 26 with the UUID header).
    ///
    /// Any failure (length, authentication, implausible payload) yields `None`.
    pub fn decrypt(&self, service_data: &[u8]) -> Option<S400Reading> {
        let data = match service_data.len() {
            FRAME_LEN_WITH_HEADER => &service_data[2..],
            FRAME_LEN => service_data,
            _ => return None,
        };

        let nonce = build_nonce(self.mac, data);
        let len = data.len();
        let mut ciphertext = Vec::with_capacity(len - 12 + 4);
        ciphertext.extend_from_slice(&data[5..len - 7]);
        ciphertext.extend_from_slice(&data[len - 4..]);

        let plaintext = self
            .cipher
            .decrypt(
                GenericArray::from_slice(&nonce),
                Payload {
                    msg: &ciphertext,
                    aad: &ASSOCIATED_DATA,
                },
            )
            .ok()?;

        parse_plaintext(&plaintext)
    }
}

/// Reversed MAC, then bytes 2..5 and the 3 bytes preceding the tag.
fn build_nonce(mac: MacAddress, data: &[u8]) -> [u8; 12] {
    let len = data.len();
    let mut nonce = [0u8; 12];
    nonce[..6].copy_from_slice(&mac.reversed());
    nonce[6..9].copy_from_slice(&data[2..5]);
    nonce[9..].copy_from_slice(&data[len - 7..len - 4]);
    nonce
}

fn parse_plaintext(plaintext: &[u8]) -> Option<S400Reading> {
    if plaintext.len() < 12 {
        return None;
    }
    let value = u32::from_le_bytes([plaintext[4], plaintext[5], plaintext[6], plaintext[7]]);

    let weight_raw = value & 0x7FF;
    let heart_rate_raw = (value >> 11) & 0x7F;
    let impedance_raw = value >> 18;

    let weight_kg = weight_raw as f32 / 10.0;
    let heart_rate = (1..=126)
        .contains(&heart_rate_raw)
        .then_some(heart_rate_raw as i32 + 50);
    let impedance =
        (impedance_raw != 0 && weight_raw != 0).then_some(impedance_raw as f32 / 10.0);

    (weight_kg > 0.0).then_some(S400Reading {
        weight_kg,
        impedance,
        heart_rate,
    })
}

/// One-shot decryption with string credentials.
pub fn decrypt(service_data: &[u8], mac_address: &str, bind_key: &str) -> Option<S400Reading> {
    S400Decryptor::new(mac_address, bind_key)?.decrypt(service_data)
}

/// A bind key is exactly 32 hex characters, either case.
pub fn is_valid_bind_key(bind_key: &str) -> bool {
    bind_key.len() == BIND_KEY_HEX_LEN && bind_key.bytes().all(|b| b.is_ascii_hexdigit())
}

pub use crate::mac_address::is_valid_mac_address;

/// Encrypt a plaintext word into a 24-byte frame the way the scale does.
#[cfg(test)]
pub(crate) fn seal_frame(mac: &str, bind_key: &str, word: u32, header: [u8; 5]) -> Vec<u8> {
    let mac: MacAddress = mac.parse().unwrap();
    let cipher = S400Cipher::new_from_slice(&hex::decode(bind_key).unwrap()).unwrap();
    let trailer = [0x00, 0x00, 0x00];

    let mut plaintext = vec![0u8; 12];
    plaintext[4..8].copy_from_slice(&word.to_le_bytes());

    let mut frame = header.to_vec();
    frame.extend_from_slice(&[0u8; 12]);
    frame.extend_from_slice(&trailer);
    frame.extend_from_slice(&[0u8; 4]);
    let nonce = build_nonce(mac, &frame);

    let sealed = cipher
        .encrypt(
            GenericArray::from_slice(&nonce),
            Payload {
                msg: &plaintext,
                aad: &ASSOCIATED_DATA,
            },
        )
        .unwrap();
    frame[5..17].copy_from_slice(&sealed[..12]);
    frame[20..].copy_from_slice(&sealed[12..]);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_MAC: &str = "84:46:93:64:A5:E6";
    const TEST_BIND_KEY: &str = "58305740b64e4b425e518aa1f4e51339";

    fn assert_weight(reading: Option<S400Reading>, expected: f32) -> S400Reading {
        let reading = reading.expect("decryption failed");
        assert!(
            (reading.weight_kg - expected).abs() < 0.1,
            "expected {expected}, got {}",
            reading.weight_kg
        );
        reading
    }

    #[test]
    fn test_valid_bind_keys() {
        assert!(is_valid_bind_key("58305740b64e4b425e518aa1f4e51339"));
        assert!(is_valid_bind_key("00000000000000000000000000000000"));
        assert!(is_valid_bind_key("FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF"));
        assert!(is_valid_bind_key("abcdef0123456789abcdef0123456789"));
    }

    #[test]
    fn test_invalid_bind_keys() {
        assert!(!is_valid_bind_key("58305740b64e4b425e518aa1f4e5133"));
        assert!(!is_valid_bind_key("58305740b64e4b425e518aa1f4e513399"));
        assert!(!is_valid_bind_key("58305740b64e4b425e518aa1f4e5133g"));
        assert!(!is_valid_bind_key(""));
    }

    #[test]
    fn test_mac_validation() {
        assert!(is_valid_mac_address("84:46:93:64:A5:E6"));
        assert!(is_valid_mac_address("aa:bb:cc:dd:ee:ff"));
        assert!(!is_valid_mac_address("844693e4A5E6"));
        assert!(!is_valid_mac_address("84-46-93-64-A5-E6"));
        assert!(!is_valid_mac_address("84:46:93:64:A5:GG"));
    }

    #[test]
    fn test_decrypt_24_byte_frame() {
        let data = hex::decode("4859d53b2d3314943c58b133638c7457a4000000c3e670dc").unwrap();
        let reading = assert_weight(decrypt(&data, TEST_MAC, TEST_BIND_KEY), 74.2);
        if let Some(impedance) = reading.impedance {
            assert!(impedance > 0.0);
        }
    }

    #[test]
    fn test_decrypt_26_byte_frame_from_hex() {
        let data = hex::decode("95FE4859D53B3BDE6BC8D05B51C0CDFD9021C9000000925C5039").unwrap();
        assert_weight(decrypt(&data, TEST_MAC, TEST_BIND_KEY), 73.2);
    }

    #[test]
    fn test_decrypt_26_byte_frame_from_bytes() {
        let data = [
            149, 254, 72, 89, 213, 59, 77, 111, 53, 156, 229, 111, 31, 126, 126, 10, 221, 220, 38,
            0, 0, 0, 12, 19, 211, 196,
        ];
        assert_weight(decrypt(&data, TEST_MAC, TEST_BIND_KEY), 73.3);
    }

    #[test]
    fn test_decrypt_weight_only_frame() {
        let data = [
            149, 254, 72, 89, 213, 59, 99, 187, 88, 121, 80, 225, 4, 44, 172, 28, 95, 24, 246, 0,
            0, 0, 219, 233, 112, 52,
        ];
        let reading = decrypt(&data, TEST_MAC, TEST_BIND_KEY).unwrap();
        assert!(reading.weight_kg > 0.0);
        assert_eq!(reading.impedance, None);
    }

    #[test]
    fn test_decrypt_rejects_bad_inputs() {
        let data = hex::decode("4859d53b2d3314943c58b133638c7457a4000000c3e670dc").unwrap();
        assert_eq!(decrypt(&[], TEST_MAC, TEST_BIND_KEY), None);
        assert_eq!(decrypt(&data[..11], TEST_MAC, TEST_BIND_KEY), None);
        assert_eq!(decrypt(&data, TEST_MAC, "58305740b64e4b42"), None);
        assert_eq!(decrypt(&data, "not-a-mac", TEST_BIND_KEY), None);
        // wrong key fails authentication
        assert_eq!(
            decrypt(&data, TEST_MAC, "00000000000000000000000000000000"),
            None
        );
    }

    #[test]
    fn test_tag_flip_fails_authentication() {
        let mut data = hex::decode("4859d53b2d3314943c58b133638c7457a4000000c3e670dc").unwrap();
        let last = data.len() - 1;
        data[last] ^= 0x01;
        assert_eq!(decrypt(&data, TEST_MAC, TEST_BIND_KEY), None);
    }

    #[test]
    fn test_sealed_frame_decodes_fields() {
        // weight 700 (70.0 kg), heart rate raw 80 (130 bpm), no impedance
        let word = 700 | (80 << 11);
        let frame = seal_frame(TEST_MAC, TEST_BIND_KEY, word, [0x48, 0x59, 0xD5, 0x3B, 0x01]);
        let reading = decrypt(&frame, TEST_MAC, TEST_BIND_KEY).unwrap();
        assert_eq!(reading.weight_kg, 70.0);
        assert_eq!(reading.heart_rate, Some(130));
        assert_eq!(reading.impedance, None);

        let mut with_header = vec![0x95, 0xFE];
        with_header.extend_from_slice(&frame);
        assert_eq!(decrypt(&with_header, TEST_MAC, TEST_BIND_KEY), Some(reading));
    }

    #[test]
    fn test_sealed_frame_with_impedance() {
        let word = 812 | (5000 << 18);
        let frame = seal_frame(TEST_MAC, TEST_BIND_KEY, word, [0x48, 0x59, 0xD5, 0x3B, 0x02]);
        let reading = decrypt(&frame, TEST_MAC, TEST_BIND_KEY).unwrap();
        assert_eq!(reading.weight_kg, 81.2);
        assert_eq!(reading.impedance, Some(500.0));
        assert_eq!(reading.heart_rate, None);
    }

    #[test]
    fn test_zero_weight_is_rejected() {
        let frame = seal_frame(TEST_MAC, TEST_BIND_KEY, 80 << 11, [0x48, 0x59, 0xD5, 0x3B, 0x03]);
        assert_eq!(decrypt(&frame, TEST_MAC, TEST_BIND_KEY), None);
    }
}
