//! Engine configuration.
//!
//! Defaults reproduce the firmware constants of the reference radio node.

use link_wire::Address;
use std::time::Duration;

/// RF constants applied on every profile switch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RfConfig {
    /// Carrier frequency in MHz
    pub frequency_mhz: f32,
    /// Output power in dBm
    pub tx_power_dbm: i8,
    /// LoRa preamble length in symbols
    pub preamble_len: u16,
    /// LoRa sync word
    pub sync_word: u8,
}

impl Default for RfConfig {
    fn default() -> Self {
        Self {
            frequency_mhz: 863.0,
            tx_power_dbm: 22,
            preamble_len: 8,
            sync_word: 0x16,
        }
    }
}

/// Automatic profile selection settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AutoAsaConfig {
    /// Run the selection actor
    pub enabled: bool,
    /// Time between evaluations
    pub interval: Duration,
    /// Extra RSSI margin in dB required before moving to a faster profile
    pub hysteresis_db: f32,
}

impl Default for AutoAsaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(10),
            hysteresis_db: 3.0,
        }
    }
}

/// Link engine configuration
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// This node's address
    pub address: Address,
    /// Peer used by automatic profile selection
    pub default_peer: Address,
    /// Profile applied at start
    pub initial_profile: u8,
    /// RF constants
    pub rf: RfConfig,

    /// Outgoing queue capacity
    pub outgoing_capacity: usize,
    /// Inbound queue capacity
    pub inbound_capacity: usize,
    /// Wait bound for a high-priority outgoing enqueue
    pub enqueue_front_wait: Duration,
    /// Wait bound for a normal outgoing enqueue
    pub enqueue_back_wait: Duration,
    /// Wait bound for a high-priority inbound enqueue
    pub inbound_front_wait: Duration,
    /// Wait bound for a normal inbound enqueue
    pub inbound_back_wait: Duration,
    /// How long the drain actor waits for a frame before idling
    pub drain_wait: Duration,

    /// Radio lock bound for transmit and profile changes
    pub radio_lock_timeout: Duration,
    /// Radio lock bound for reading a received packet
    pub radio_rx_lock_timeout: Duration,
    /// Pending list lock bound
    pub pending_lock_timeout: Duration,
    /// Negotiation and bulk-ACK lock bound
    pub negotiation_lock_timeout: Duration,

    /// Base period of the retry scan
    pub retry_scan_base: Duration,
    /// Upper bound of the random jitter added to each retry scan
    pub retry_scan_jitter: Duration,
    /// Negotiation timer period
    pub negotiation_poll: Duration,
    /// Bulk-ACK timeout check period
    pub bulk_ack_poll: Duration,
    /// Delay between the negotiation handshake and the switch
    pub asa_switch_delay: Duration,
    /// How long an unanswered negotiation request blocks new automatic requests
    pub asa_request_timeout: Duration,

    /// Automatic profile selection
    pub auto_asa: AutoAsaConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            address: Address::MASTER,
            default_peer: Address::SLAVE,
            initial_profile: 0,
            rf: RfConfig::default(),
            outgoing_capacity: 45,
            inbound_capacity: 35,
            enqueue_front_wait: Duration::from_millis(100),
            enqueue_back_wait: Duration::from_millis(200),
            inbound_front_wait: Duration::from_millis(10),
            inbound_back_wait: Duration::from_millis(500),
            drain_wait: Duration::from_millis(500),
            radio_lock_timeout: Duration::from_millis(3000),
            radio_rx_lock_timeout: Duration::from_millis(50),
            pending_lock_timeout: Duration::from_millis(100),
            negotiation_lock_timeout: Duration::from_millis(100),
            retry_scan_base: Duration::from_millis(211),
            retry_scan_jitter: Duration::from_millis(99),
            negotiation_poll: Duration::from_millis(200),
            bulk_ack_poll: Duration::from_millis(100),
            asa_switch_delay: Duration::from_millis(3000),
            asa_request_timeout: Duration::from_secs(10),
            auto_asa: AutoAsaConfig::default(),
        }
    }
}
