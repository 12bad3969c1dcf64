//! Radio transport abstraction.
//!
//! The engine never talks to hardware directly. A transport applies one
//! setting at a time, transmits and reads raw frames, and signals packet
//! arrival through a [`Notify`] handle (the interrupt line on real radios).

use crate::error::TransportError;
use crate::profile::RadioMode;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::Notify;

/// One radio configuration command
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RadioSetting {
    /// Select the modem
    Modem(RadioMode),
    /// Carrier frequency, MHz
    Frequency(f32),
    /// LoRa spreading factor
    SpreadingFactor(u8),
    /// LoRa coding rate denominator
    CodingRate(u8),
    /// LoRa bandwidth, kHz
    Bandwidth(f32),
    /// LoRa preamble length, symbols
    PreambleLength(u16),
    /// Hardware CRC
    Crc(bool),
    /// Output power, dBm
    OutputPower(i8),
    /// LoRa sync word
    SyncWord(u8),
    /// FSK bit rate, kb/s
    BitRate(f32),
    /// FSK frequency deviation, kHz
    FrequencyDeviation(f32),
    /// FSK receive bandwidth, kHz
    RxBandwidth(f32),
}

impl RadioSetting {
    /// Stable name used in logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            RadioSetting::Modem(_) => "modem",
            RadioSetting::Frequency(_) => "frequency",
            RadioSetting::SpreadingFactor(_) => "spreading_factor",
            RadioSetting::CodingRate(_) => "coding_rate",
            RadioSetting::Bandwidth(_) => "bandwidth",
            RadioSetting::PreambleLength(_) => "preamble_length",
            RadioSetting::Crc(_) => "crc",
            RadioSetting::OutputPower(_) => "output_power",
            RadioSetting::SyncWord(_) => "sync_word",
            RadioSetting::BitRate(_) => "bit_rate",
            RadioSetting::FrequencyDeviation(_) => "frequency_deviation",
            RadioSetting::RxBandwidth(_) => "rx_bandwidth",
        }
    }
}

/// Parameters for the combined FSK initialisation used when the radio
/// cannot change the bit rate on its own
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FskParams {
    /// Bit rate, kb/s
    pub bitrate_kbps: f32,
    /// Frequency deviation, kHz
    pub deviation_khz: f32,
    /// Receive bandwidth, kHz
    pub rx_bandwidth_khz: f32,
}

/// A packet read from the radio
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedPacket {
    /// Raw frame bytes
    pub data: Bytes,
    /// RSSI, dBm
    pub rssi: f32,
    /// SNR, dB
    pub snr: f32,
}

/// Half-duplex packet radio
#[async_trait]
pub trait RadioTransport: Send + Sync {
    /// Leave receive mode
    async fn standby(&mut self) -> Result<(), TransportError>;

    /// Apply one setting
    async fn apply(&mut self, setting: RadioSetting) -> Result<(), TransportError>;

    /// Switch to FSK with all modulation parameters at once
    async fn begin_fsk(&mut self, params: FskParams) -> Result<(), TransportError>;

    /// Enter continuous receive mode
    async fn start_receive(&mut self) -> Result<(), TransportError>;

    /// Transmit one frame, returning once it has left the antenna
    async fn transmit(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// Read the packet that triggered the receive signal
    async fn read_packet(&mut self) -> Result<ReceivedPacket, TransportError>;

    /// Signal notified whenever a packet is waiting
    fn rx_signal(&self) -> Arc<Notify>;
}
