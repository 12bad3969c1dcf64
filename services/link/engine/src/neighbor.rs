//! Per-peer link quality table.

use dashmap::DashMap;
use link_wire::Address;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// Weight of a new RSSI sample in the moving average
pub const RSSI_ALPHA: f32 = 0.25;

/// A peer not heard from for this long is reported inactive
pub const ACTIVE_WINDOW: Duration = Duration::from_secs(30);

/// Link quality record for one peer
#[derive(Debug, Clone)]
pub struct NeighborRecord {
    /// Frames received from the peer
    pub rx_count: u32,
    /// Frames sent to the peer
    pub tx_count: u32,
    /// Exponential moving average of RSSI, dBm
    pub rssi_filtered: Option<f32>,
    /// Last raw RSSI, dBm
    pub last_rssi: f32,
    /// Last raw SNR, dB
    pub last_snr: f32,
    /// Last frame received
    pub last_seen: Option<Instant>,
}

impl Default for NeighborRecord {
    fn default() -> Self {
        Self {
            rx_count: 0,
            tx_count: 0,
            rssi_filtered: None,
            last_rssi: -200.0,
            last_snr: -200.0,
            last_seen: None,
        }
    }
}

impl NeighborRecord {
    /// Whether the peer was heard within [`ACTIVE_WINDOW`]
    pub fn is_active(&self, now: Instant) -> bool {
        self.last_seen
            .map(|at| now.saturating_duration_since(at) <= ACTIVE_WINDOW)
            .unwrap_or(false)
    }
}

/// Serializable neighbor view
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NeighborInfo {
    /// Peer address
    pub address: u8,
    /// Frames received
    pub rx_count: u32,
    /// Frames sent
    pub tx_count: u32,
    /// Filtered RSSI
    pub rssi_filtered: Option<f32>,
    /// Last raw RSSI
    pub last_rssi: f32,
    /// Last raw SNR
    pub last_snr: f32,
    /// Milliseconds since the last frame
    pub last_seen_ms: Option<u64>,
    /// Heard within the active window
    pub active: bool,
}

/// Neighbor table
#[derive(Debug, Default)]
pub struct NeighborTable {
    records: DashMap<Address, NeighborRecord>,
}

impl NeighborTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for a frame received from `peer`
    pub fn record_rx(&self, peer: Address, rssi: f32, snr: f32, now: Instant) {
        let mut record = self.records.entry(peer).or_default();
        record.rx_count = record.rx_count.saturating_add(1);
        record.rssi_filtered = Some(match record.rssi_filtered {
            Some(avg) => avg + RSSI_ALPHA * (rssi - avg),
            None => rssi,
        });
        record.last_rssi = rssi;
        record.last_snr = snr;
        record.last_seen = Some(now);
    }

    /// Account for a frame sent to `peer`. Broadcasts are not attributed.
    pub fn record_tx(&self, peer: Address) {
        if peer.is_broadcast() {
            return;
        }
        let mut record = self.records.entry(peer).or_default();
        record.tx_count = record.tx_count.saturating_add(1);
    }

    /// Copy of one record
    pub fn get(&self, peer: Address) -> Option<NeighborRecord> {
        self.records.get(&peer).map(|r| r.clone())
    }

    /// Number of known peers
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// No peers known
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Snapshot ordered by address
    pub fn snapshot(&self, now: Instant) -> Vec<NeighborInfo> {
        let mut list: Vec<NeighborInfo> = self
            .records
            .iter()
            .map(|entry| {
                let r = entry.value();
                NeighborInfo {
                    address: entry.key().0,
                    rx_count: r.rx_count,
                    tx_count: r.tx_count,
                    rssi_filtered: r.rssi_filtered,
                    last_rssi: r.last_rssi,
                    last_snr: r.last_snr,
                    last_seen_ms: r
                        .last_seen
                        .map(|at| now.saturating_duration_since(at).as_millis() as u64),
                    active: r.is_active(now),
                }
            })
            .collect();
        list.sort_by_key(|n| n.address);
        list
    }
}
