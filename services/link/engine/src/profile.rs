//! Modulation profile table and retry-parameter derivation.
//!
//! Profiles are ordered from most robust (index 0, LoRa SF12) to fastest
//! (index 12, GFSK 100 kb/s). Indices and numeric fields are part of the
//! over-the-air contract: negotiation frames carry the index only.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Number of profiles in [`PROFILES`]
pub const PROFILE_COUNT: usize = 13;

/// Modulation family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RadioMode {
    /// Chirp spread spectrum
    LoRa,
    /// Gaussian frequency shift keying
    Fsk,
}

impl RadioMode {
    /// Profile selected when this mode is forced manually
    pub fn default_profile(self) -> u8 {
        match self {
            RadioMode::LoRa => 0,
            RadioMode::Fsk => 10,
        }
    }
}

impl fmt::Display for RadioMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RadioMode::LoRa => write!(f, "LoRa"),
            RadioMode::Fsk => write!(f, "FSK"),
        }
    }
}

/// One row of the profile table
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProfileDescriptor {
    /// Modulation family
    pub mode: RadioMode,
    /// LoRa bandwidth or FSK receive bandwidth, kHz
    pub bandwidth_khz: f32,
    /// LoRa spreading factor (0 for FSK)
    pub spreading_factor: u8,
    /// LoRa coding rate denominator, 5..=8 (0 for FSK)
    pub coding_rate: u8,
    /// FSK bit rate in bit/s (0 for LoRa)
    pub bitrate: u32,
    /// FSK frequency deviation in Hz (0 for LoRa)
    pub deviation: u32,
}

const fn lora(bandwidth_khz: f32, spreading_factor: u8, coding_rate: u8) -> ProfileDescriptor {
    ProfileDescriptor {
        mode: RadioMode::LoRa,
        bandwidth_khz,
        spreading_factor,
        coding_rate,
        bitrate: 0,
        deviation: 0,
    }
}

const fn fsk(bandwidth_khz: f32, bitrate: u32, deviation: u32) -> ProfileDescriptor {
    ProfileDescriptor {
        mode: RadioMode::Fsk,
        bandwidth_khz,
        spreading_factor: 0,
        coding_rate: 0,
        bitrate,
        deviation,
    }
}

/// The profile table
pub static PROFILES: [ProfileDescriptor; PROFILE_COUNT] = [
    lora(125.0, 12, 7),
    lora(125.0, 11, 7),
    lora(125.0, 10, 7),
    lora(250.0, 9, 6),
    lora(250.0, 8, 6),
    lora(250.0, 7, 5),
    lora(500.0, 9, 5),
    lora(500.0, 8, 5),
    lora(500.0, 7, 5),
    fsk(117.3, 19_200, 10_000),
    fsk(156.2, 38_400, 20_000),
    fsk(187.2, 50_000, 25_000),
    fsk(234.3, 100_000, 50_000),
];

/// Look up a profile by index
pub fn profile(index: u8) -> Option<&'static ProfileDescriptor> {
    PROFILES.get(index as usize)
}

/// Timing derived from the active profile
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RetryParams {
    /// Estimated time on air of a 50 byte frame, ms
    pub packet_time_ms: f32,
    /// Age after which a pending frame is retransmitted
    pub retry_timeout: Duration,
    /// Retransmissions before a pending frame is dropped
    pub max_retries: u8,
    /// Bulk-ACK periodic flush interval
    pub bulk_ack_interval: Duration,
    /// Bulk-ACK opportunistic flush threshold
    pub bulk_ack_max_wait: Duration,
}

impl ProfileDescriptor {
    /// Estimated time on air in milliseconds
    pub fn packet_time_ms(&self) -> f32 {
        match self.mode {
            RadioMode::LoRa => {
                let sf = self.spreading_factor as f32;
                let symbol_time = (1u32 << self.spreading_factor) as f32 / (self.bandwidth_khz * 1000.0);
                let preamble_time = (8.0 + 4.25) * symbol_time;
                let blocks = ((8.0 * 50.0 - 4.0 * sf + 28.0 + 16.0) / (4.0 * (sf - 2.0)))
                    .ceil()
                    .max(0.0);
                let payload_symbols = 8.0 + blocks * self.coding_rate as f32;
                (preamble_time + payload_symbols * symbol_time) * 1000.0
            }
            RadioMode::Fsk => (50.0 * 8.0 * 1000.0) / self.bitrate as f32,
        }
    }

    /// Retry timeout, retry limit and bulk-ACK windows for this profile
    pub fn retry_params(&self) -> RetryParams {
        let packet_time_ms = self.packet_time_ms();
        match self.mode {
            RadioMode::LoRa => {
                let timeout = 8500u32.max((packet_time_ms * 3.5 + 1000.0) as u32);
                let (max_retries, interval, max_wait) = match self.spreading_factor {
                    0..=7 => (2, 1800, 1200),
                    8..=9 => (3, 2500, 1500),
                    _ => (4, 3000, 1800),
                };
                RetryParams {
                    packet_time_ms,
                    retry_timeout: Duration::from_millis(timeout as u64),
                    max_retries,
                    bulk_ack_interval: Duration::from_millis(interval),
                    bulk_ack_max_wait: Duration::from_millis(max_wait),
                }
            }
            RadioMode::Fsk => {
                let timeout = 1500u32.max((packet_time_ms * 2.5 + 600.0) as u32);
                RetryParams {
                    packet_time_ms,
                    retry_timeout: Duration::from_millis(timeout as u64),
                    max_retries: if self.bitrate >= 19_200 { 2 } else { 3 },
                    bulk_ack_interval: Duration::from_millis(600),
                    bulk_ack_max_wait: Duration::from_millis(250),
                }
            }
        }
    }
}

/// Active link state, recomputed on every successful profile switch
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LinkState {
    /// Active profile index
    pub profile: u8,
    /// Active modulation
    pub mode: RadioMode,
    /// Automatic selection suspended by a manual mode change
    pub manual_override: bool,
    /// Derived timing
    pub retry: RetryParams,
}

impl LinkState {
    /// State for a profile index, `None` if out of range
    pub fn for_profile(index: u8, manual_override: bool) -> Option<Self> {
        let descriptor = profile(index)?;
        Some(Self {
            profile: index,
            mode: descriptor.mode,
            manual_override,
            retry: descriptor.retry_params(),
        })
    }

    /// Human readable profile line
    pub fn describe(&self) -> String {
        describe_profile(self.profile)
    }
}

/// Human readable description of a profile
pub fn describe_profile(index: u8) -> String {
    match profile(index) {
        Some(p) if p.mode == RadioMode::LoRa => format!(
            "LoRa #{}: SF={}, CR={}, BW={:.1}kHz",
            index, p.spreading_factor, p.coding_rate, p.bandwidth_khz
        ),
        Some(p) => format!(
            "FSK #{}: {:.1}kb/s, dev={:.1}k, bw={:.1}k",
            index,
            p.bitrate as f32 / 1000.0,
            p.deviation as f32 / 1000.0,
            p.bandwidth_khz
        ),
        None => format!("invalid profile #{}", index),
    }
}

/// One row of the signal quality table
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalThreshold {
    /// Minimum RSSI in dBm
    pub min_rssi: f32,
    /// Minimum SNR in dB
    pub min_snr: f32,
    /// Profile chosen when both thresholds are met
    pub profile: u8,
}

const fn threshold(min_rssi: f32, min_snr: f32, profile: u8) -> SignalThreshold {
    SignalThreshold {
        min_rssi,
        min_snr,
        profile,
    }
}

/// Signal quality to profile table, fastest profile first
pub static SIGNAL_TABLE: [SignalThreshold; 13] = [
    threshold(-75.0, 10.0, 12),
    threshold(-80.0, 8.0, 11),
    threshold(-85.0, 6.0, 10),
    threshold(-90.0, 4.0, 9),
    threshold(-95.0, 2.0, 8),
    threshold(-100.0, 0.0, 7),
    threshold(-105.0, -2.0, 6),
    threshold(-110.0, -4.0, 5),
    threshold(-114.0, -6.0, 4),
    threshold(-116.0, -8.0, 3),
    threshold(-118.0, -10.0, 2),
    threshold(-119.0, -12.0, 1),
    threshold(-120.0, -15.0, 0),
];

/// First profile whose thresholds are met, profile 0 when none are
pub fn select_profile(rssi: f32, snr: f32) -> u8 {
    SIGNAL_TABLE
        .iter()
        .find(|t| rssi >= t.min_rssi && snr >= t.min_snr)
        .map(|t| t.profile)
        .unwrap_or(0)
}

/// Candidate for automatic selection.
///
/// Moving to a faster profile requires the RSSI to clear the threshold by
/// `hysteresis_db`; moving to a slower one does not. Returns `None` when
/// the current profile should be kept.
pub fn select_with_hysteresis(rssi: f32, snr: f32, current: u8, hysteresis_db: f32) -> Option<u8> {
    let down = select_profile(rssi, snr);
    if down < current {
        return Some(down);
    }
    let up = select_profile(rssi - hysteresis_db, snr);
    if up > current {
        return Some(up);
    }
    None
}
