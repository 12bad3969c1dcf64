//! Acknowledgement processing and receive-side ACK batching.

use crate::pending::PendingTracker;
use link_wire::{Address, BulkAck, PacketId, PacketType};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Result of matching one acknowledged id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Entry found and removed
    Matched {
        /// Acknowledged id
        id: PacketId,
        /// Type of the acknowledged frame
        original_type: PacketType,
    },
    /// Nothing pending under this id (duplicate or late ACK)
    Unmatched(PacketId),
}

/// Match a single acknowledged id against the pending set
pub fn process_ack(pending: &mut PendingTracker, id: PacketId) -> AckOutcome {
    match pending.remove(id) {
        Some(entry) => AckOutcome::Matched {
            id,
            original_type: entry.frame.packet_type(),
        },
        None => AckOutcome::Unmatched(id),
    }
}

/// Match every unique id of a bulk ACK
pub fn process_bulk_ack(
    pending: &mut PendingTracker,
    bulk: &BulkAck,
) -> SmallVec<[AckOutcome; 10]> {
    if bulk.has_duplicates() {
        warn!("Bulk ACK carries duplicate ids: {:?}", bulk.ids());
    }
    bulk.unique_ids()
        .into_iter()
        .map(|id| process_ack(pending, id))
        .collect()
}

/// Ids waiting to be acknowledged to one peer
#[derive(Debug, Default)]
pub struct BulkAckBuffer {
    batch: BulkAck,
    last_flush: Option<Instant>,
}

impl BulkAckBuffer {
    /// Buffer that has never flushed; the first id goes out immediately
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer whose flush window starts at `now`
    pub fn started_at(now: Instant) -> Self {
        Self {
            batch: BulkAck::new(),
            last_flush: Some(now),
        }
    }

    /// Ids currently buffered
    pub fn len(&self) -> usize {
        self.batch.len()
    }

    /// Nothing buffered
    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    /// Whether an id is already buffered
    pub fn contains(&self, id: PacketId) -> bool {
        self.batch.ids().contains(&id)
    }

    fn elapsed_over(&self, now: Instant, limit: Duration) -> bool {
        match self.last_flush {
            Some(at) => now.saturating_duration_since(at) > limit,
            None => true,
        }
    }

    /// Buffer an id. Returns a batch to send when the buffer filled up or
    /// `max_wait` has passed since the last flush. Ids already buffered are
    /// ignored.
    pub fn add(&mut self, id: PacketId, now: Instant, max_wait: Duration) -> Option<BulkAck> {
        if !self.batch.add(id) {
            return None;
        }
        if self.batch.is_full() || self.elapsed_over(now, max_wait) {
            return self.flush(now);
        }
        None
    }

    /// Take the buffered batch, if any
    pub fn flush(&mut self, now: Instant) -> Option<BulkAck> {
        if self.batch.is_empty() {
            return None;
        }
        self.last_flush = Some(now);
        Some(std::mem::take(&mut self.batch))
    }

    /// Flush if ids have waited longer than `interval`
    pub fn check_timeout(&mut self, now: Instant, interval: Duration) -> Option<BulkAck> {
        if !self.batch.is_empty() && self.elapsed_over(now, interval) {
            return self.flush(now);
        }
        None
    }
}

/// Per-peer bulk ACK buffers
#[derive(Debug, Default)]
pub struct BulkAckBuffers {
    peers: HashMap<Address, BulkAckBuffer>,
}

impl BulkAckBuffers {
    /// No buffers
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer an id for `peer`
    pub fn add(
        &mut self,
        peer: Address,
        id: PacketId,
        now: Instant,
        max_wait: Duration,
    ) -> Option<BulkAck> {
        self.peers.entry(peer).or_default().add(id, now, max_wait)
    }

    /// Flush the buffer for `peer`
    pub fn flush(&mut self, peer: Address, now: Instant) -> Option<BulkAck> {
        self.peers.get_mut(&peer)?.flush(now)
    }

    /// Flush every buffer whose ids have waited longer than `interval`
    pub fn due(&mut self, now: Instant, interval: Duration) -> Vec<(Address, BulkAck)> {
        self.peers
            .iter_mut()
            .filter_map(|(peer, buf)| buf.check_timeout(now, interval).map(|b| (*peer, b)))
            .collect()
    }

    /// Total ids buffered across peers
    pub fn buffered(&self) -> usize {
        self.peers.values().map(BulkAckBuffer::len).sum()
    }
}
