//! Link timing presets.
//!
//! A scale handler names a [`TuningProfile`]; each adapter turns it into the
//! concrete pacing numbers for its transport.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TuningProfile {
    #[default]
    Balanced,
    Conservative,
    Aggressive,
}

impl TuningProfile {
    /// Case-insensitive parse that falls back to `fallback` for anything unknown.
    pub fn parse_or(name: &str, fallback: TuningProfile) -> TuningProfile {
        name.trim().parse().unwrap_or(fallback)
    }

    pub fn for_gatt(self) -> GattTuning {
        match self {
            TuningProfile::Balanced => GattTuning {
                common: CommonTuning {
                    reconnect_cooldown_ms: 2200,
                    retry_backoff_ms: 1500,
                    max_retries: 3,
                },
                notify_setup_delay_ms: 120,
                write_with_response_delay_ms: 80,
                write_without_response_delay_ms: 35,
                post_write_delay_ms: 20,
                post_read_delay_ms: 20,
                connect_after_scan_delay_ms: 650,
                operation_timeout_ms: 3000,
                scan_timeout_ms: 20_000,
                request_high_priority: true,
                request_mtu_bytes: 185,
            },
            TuningProfile::Conservative => GattTuning {
                common: CommonTuning {
                    reconnect_cooldown_ms: 2500,
                    retry_backoff_ms: 1800,
                    max_retries: 3,
                },
                notify_setup_delay_ms: 160,
                write_with_response_delay_ms: 100,
                write_without_response_delay_ms: 50,
                post_write_delay_ms: 30,
                post_read_delay_ms: 30,
                connect_after_scan_delay_ms: 800,
                operation_timeout_ms: 5000,
                scan_timeout_ms: 30_000,
                request_high_priority: true,
                request_mtu_bytes: 0,
            },
            TuningProfile::Aggressive => GattTuning {
                common: CommonTuning {
                    reconnect_cooldown_ms: 1200,
                    retry_backoff_ms: 1200,
                    max_retries: 2,
                },
                notify_setup_delay_ms: 80,
                write_with_response_delay_ms: 60,
                write_without_response_delay_ms: 25,
                post_write_delay_ms: 15,
                post_read_delay_ms: 15,
                connect_after_scan_delay_ms: 400,
                operation_timeout_ms: 2000,
                scan_timeout_ms: 15_000,
                request_high_priority: true,
                request_mtu_bytes: 247,
            },
        }
    }

    pub fn for_broadcast(self) -> BroadcastTuning {
        let common = self.for_gatt().common;
        match self {
            TuningProfile::Balanced => BroadcastTuning {
                common,
                max_scan_ms: 20_000,
                min_rssi_dbm: None,
                packet_dedup_window_ms: 800,
                stabilize_window_ms: 500,
            },
            TuningProfile::Conservative => BroadcastTuning {
                common,
                max_scan_ms: 30_000,
                min_rssi_dbm: None,
                packet_dedup_window_ms: 1200,
                stabilize_window_ms: 800,
            },
            TuningProfile::Aggressive => BroadcastTuning {
                common,
                max_scan_ms: 12_000,
                min_rssi_dbm: Some(-90),
                packet_dedup_window_ms: 500,
                stabilize_window_ms: 250,
            },
        }
    }

    pub fn for_spp(self) -> SppTuning {
        let common = self.for_gatt().common;
        match self {
            TuningProfile::Balanced => SppTuning {
                common,
                connect_timeout_ms: 10_000,
                read_timeout_ms: 60_000,
                write_chunk_bytes: 64,
                inter_chunk_delay_ms: 20,
            },
            TuningProfile::Conservative => SppTuning {
                common,
                connect_timeout_ms: 15_000,
                read_timeout_ms: 90_000,
                write_chunk_bytes: 32,
                inter_chunk_delay_ms: 30,
            },
            TuningProfile::Aggressive => SppTuning {
                common,
                connect_timeout_ms: 8000,
                read_timeout_ms: 45_000,
                write_chunk_bytes: 128,
                inter_chunk_delay_ms: 10,
            },
        }
    }
}

impl fmt::Display for TuningProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TuningProfile::Balanced => write!(f, "balanced"),
            TuningProfile::Conservative => write!(f, "conservative"),
            TuningProfile::Aggressive => write!(f, "aggressive"),
        }
    }
}

impl FromStr for TuningProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "balanced" => Ok(TuningProfile::Balanced),
            "conservative" => Ok(TuningProfile::Conservative),
            "aggressive" => Ok(TuningProfile::Aggressive),
            _ => Err(format!("Unknown tuning profile: {}", s)),
        }
    }
}

/// Retry and cooldown settings shared by every transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommonTuning {
    /// Minimum pause between a disconnect and the next connection attempt.
    pub reconnect_cooldown_ms: u64,
    pub retry_backoff_ms: u64,
    pub max_retries: u32,
}

impl CommonTuning {
    pub fn reconnect_cooldown(&self) -> Duration {
        Duration::from_millis(self.reconnect_cooldown_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattTuning {
    pub common: CommonTuning,
    pub notify_setup_delay_ms: u64,
    pub write_with_response_delay_ms: u64,
    pub write_without_response_delay_ms: u64,
    pub post_write_delay_ms: u64,
    pub post_read_delay_ms: u64,
    pub connect_after_scan_delay_ms: u64,
    /// Upper bound for a single read, write or notify-enable.
    pub operation_timeout_ms: u64,
    pub scan_timeout_ms: u64,
    pub request_high_priority: bool,
    /// `0` (or anything up to the 23 byte default) leaves the MTU alone.
    pub request_mtu_bytes: u16,
}

impl GattTuning {
    pub fn write_gap(&self, with_response: bool) -> Duration {
        Duration::from_millis(if with_response {
            self.write_with_response_delay_ms
        } else {
            self.write_without_response_delay_ms
        })
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastTuning {
    pub common: CommonTuning,
    /// Length of one scan attempt.
    pub max_scan_ms: u64,
    /// Advertisements weaker than this are ignored.
    pub min_rssi_dbm: Option<i16>,
    /// Identical packets inside this window are collapsed.
    pub packet_dedup_window_ms: u64,
    /// Minimum spacing between two forwards to the handler.
    pub stabilize_window_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SppTuning {
    pub common: CommonTuning,
    pub connect_timeout_ms: u64,
    /// The stream is closed after this long without incoming bytes. `0` disables it.
    pub read_timeout_ms: u64,
    pub write_chunk_bytes: usize,
    pub inter_chunk_delay_ms: u64,
}

impl SppTuning {
    /// Pause between connect and handing the stream to the handler.
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(50.max(self.inter_chunk_delay_ms * 3))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lenient_parse() {
        assert_eq!(
            TuningProfile::parse_or("AGGRESSIVE", TuningProfile::Balanced),
            TuningProfile::Aggressive
        );
        assert_eq!(
            TuningProfile::parse_or(" conservative ", TuningProfile::Balanced),
            TuningProfile::Conservative
        );
        assert_eq!(
            TuningProfile::parse_or("turbo", TuningProfile::Conservative),
            TuningProfile::Conservative
        );
        assert_eq!(TuningProfile::parse_or("", TuningProfile::Balanced), TuningProfile::Balanced);
    }

    #[test]
    fn test_gatt_presets() {
        let balanced = TuningProfile::Balanced.for_gatt();
        assert_eq!(balanced.notify_setup_delay_ms, 120);
        assert_eq!(balanced.write_gap(true), Duration::from_millis(80));
        assert_eq!(balanced.write_gap(false), Duration::from_millis(35));
        assert_eq!(balanced.common.reconnect_cooldown_ms, 2200);
        assert_eq!(balanced.connect_after_scan_delay_ms, 650);
        assert_eq!(balanced.request_mtu_bytes, 185);

        let conservative = TuningProfile::Conservative.for_gatt();
        assert_eq!(conservative.common.retry_backoff_ms, 1800);
        assert_eq!(conservative.request_mtu_bytes, 0);

        let aggressive = TuningProfile::Aggressive.for_gatt();
        assert_eq!(aggressive.common.max_retries, 2);
        assert_eq!(aggressive.post_write_delay_ms, 15);
        assert_eq!(aggressive.request_mtu_bytes, 247);
    }

    #[test]
    fn test_spp_settle_delay() {
        assert_eq!(
            TuningProfile::Balanced.for_spp().settle_delay(),
            Duration::from_millis(60)
        );
        assert_eq!(
            TuningProfile::Aggressive.for_spp().settle_delay(),
            Duration::from_millis(50)
        );
    }

    #[test]
    fn test_display_round_trips_through_parse() {
        for profile in [
            TuningProfile::Balanced,
            TuningProfile::Conservative,
            TuningProfile::Aggressive,
        ] {
            assert_eq!(profile.to_string().parse::<TuningProfile>(), Ok(profile));
        }
    }
}
