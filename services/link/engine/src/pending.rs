//! Pending (unacknowledged) frame tracker.
//!
//! Keyed by packet id: at most one live entry per id. Sending a frame with an
//! id that is already pending refreshes the entry instead of adding another.
//! Ids are 8 bit, so more than 255 simultaneously outstanding frames alias.

use link_wire::{Frame, PacketId, PacketType};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// A frame awaiting acknowledgement
#[derive(Debug, Clone)]
pub struct PendingEntry {
    /// Copy of the transmitted frame
    pub frame: Frame,
    /// Last (re)transmission enqueue time
    pub timestamp: Instant,
    /// Retransmissions so far
    pub retries: u8,
}

/// Read-only view of a pending entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingInfo {
    /// Packet id
    pub id: PacketId,
    /// Packet type
    pub packet_type: PacketType,
    /// Destination address
    pub destination: u8,
    /// Retransmissions so far
    pub retries: u8,
    /// Time since the last (re)transmission, ms
    pub age_ms: u64,
}

/// Outcome of one retry scan
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Ids re-enqueued
    pub resent: Vec<PacketId>,
    /// Ids that were due but could not be re-enqueued
    pub deferred: Vec<PacketId>,
    /// Entries removed after exhausting their retries
    pub exhausted: Vec<PendingEntry>,
}

/// Pending set
#[derive(Debug, Default)]
pub struct PendingTracker {
    entries: HashMap<PacketId, PendingEntry>,
}

impl PendingTracker {
    /// Empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a frame. Returns `true` when an entry with the same id already
    /// existed and was refreshed (retries reset, timestamp updated).
    pub fn upsert(&mut self, frame: Frame, now: Instant) -> bool {
        let refreshed = self.entries.contains_key(&frame.id());
        self.entries.insert(
            frame.id(),
            PendingEntry {
                frame,
                timestamp: now,
                retries: 0,
            },
        );
        refreshed
    }

    /// Swap the stored copy of a pending frame for `frame`, keeping its
    /// retry count and timestamp. An id that is not pending starts a fresh
    /// entry. Returns `true` when an existing entry was kept.
    pub fn replace_frame(&mut self, frame: Frame, now: Instant) -> bool {
        match self.entries.get_mut(&frame.id()) {
            Some(entry) => {
                entry.frame = frame;
                true
            }
            None => {
                self.upsert(frame, now);
                false
            }
        }
    }

    /// Remove an entry
    pub fn remove(&mut self, id: PacketId) -> Option<PendingEntry> {
        self.entries.remove(&id)
    }

    /// Whether an id is pending
    pub fn contains(&self, id: PacketId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Number of pending entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// No pending entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all entries, returning how many were removed
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    /// Retry scan.
    ///
    /// Entries older than `timeout` are handed to `resend` while they have
    /// retries left; a successful resend resets the timestamp and bumps the
    /// retry count, a failed one leaves the entry untouched for the next
    /// scan. Entries that are due with `max_retries` already spent are
    /// removed.
    pub fn sweep<F>(
        &mut self,
        now: Instant,
        timeout: Duration,
        max_retries: u8,
        mut resend: F,
    ) -> SweepReport
    where
        F: FnMut(&Frame) -> bool,
    {
        let mut report = SweepReport::default();
        let mut exhausted = Vec::new();

        for (id, entry) in self.entries.iter_mut() {
            if now.saturating_duration_since(entry.timestamp) <= timeout {
                continue;
            }
            if entry.retries >= max_retries {
                exhausted.push(*id);
            } else if resend(&entry.frame) {
                entry.timestamp = now;
                entry.retries += 1;
                report.resent.push(*id);
            } else {
                report.deferred.push(*id);
            }
        }

        for id in exhausted {
            if let Some(entry) = self.entries.remove(&id) {
                report.exhausted.push(entry);
            }
        }
        report
    }

    /// Snapshot for diagnostics, ordered by id
    pub fn snapshot(&self, now: Instant) -> Vec<PendingInfo> {
        let mut list: Vec<PendingInfo> = self
            .entries
            .values()
            .map(|e| PendingInfo {
                id: e.frame.id(),
                packet_type: e.frame.packet_type(),
                destination: e.frame.header.receiver.0,
                retries: e.retries,
                age_ms: now.saturating_duration_since(e.timestamp).as_millis() as u64,
            })
            .collect();
        list.sort_by_key(|info| info.id);
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use link_wire::{Address, Flags, Header};

    fn frame(id: PacketId) -> Frame {
        let mut header = Header::new(PacketType::Status, Address(1), Address(2), id);
        header.flags = Flags::ACK_REQUIRED;
        Frame::new(header, Bytes::from_static(b"x")).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_id_refreshes() {
        let mut tracker = PendingTracker::new();
        let start = Instant::now();
        assert!(!tracker.upsert(frame(5), start));

        tokio::time::advance(Duration::from_millis(500)).await;
        let report = tracker.sweep(Instant::now(), Duration::from_millis(100), 3, |_| true);
        assert_eq!(report.resent, vec![5]);

        let later = Instant::now();
        assert!(tracker.upsert(frame(5), later));
        assert_eq!(tracker.len(), 1);
        let snapshot = tracker.snapshot(later);
        assert_eq!(snapshot[0].retries, 0);
        assert_eq!(snapshot[0].age_ms, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replaced_frame_keeps_retry_progress() {
        let mut tracker = PendingTracker::new();
        tracker.upsert(frame(4), Instant::now());
        tokio::time::advance(Duration::from_millis(300)).await;
        let report = tracker.sweep(Instant::now(), Duration::from_millis(100), 2, |_| true);
        assert_eq!(report.resent, vec![4]);

        tokio::time::advance(Duration::from_millis(50)).await;
        let mut header = Header::new(PacketType::Aggregate, Address(1), Address(2), 4);
        header.flags = Flags::ACK_REQUIRED | Flags::AGGREGATED;
        let aggregate = Frame::new(header, Bytes::from_static(b"xyz")).unwrap();
        assert!(tracker.replace_frame(aggregate, Instant::now()));

        let snapshot = tracker.snapshot(Instant::now());
        assert_eq!(snapshot[0].packet_type, PacketType::Aggregate);
        assert_eq!(snapshot[0].retries, 1);
        assert_eq!(snapshot[0].age_ms, 50);

        // one retry left, then the entry is dropped
        tokio::time::advance(Duration::from_millis(101)).await;
        let mut resent = Vec::new();
        let report = tracker.sweep(Instant::now(), Duration::from_millis(100), 2, |f| {
            resent.push(f.packet_type());
            true
        });
        assert_eq!(report.resent, vec![4]);
        assert_eq!(resent, vec![PacketType::Aggregate]);
        tokio::time::advance(Duration::from_millis(101)).await;
        let report = tracker.sweep(Instant::now(), Duration::from_millis(100), 2, |_| true);
        assert_eq!(report.exhausted.len(), 1);

        assert!(!tracker.replace_frame(frame(6), Instant::now()));
        assert_eq!(tracker.snapshot(Instant::now())[0].retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion() {
        let mut tracker = PendingTracker::new();
        tracker.upsert(frame(9), Instant::now());
        let timeout = Duration::from_millis(1000);
        let max_retries = 3;

        let mut attempts = 0;
        let mut removed = 0;
        for _ in 0..20 {
            tokio::time::advance(Duration::from_millis(1001)).await;
            let report = tracker.sweep(Instant::now(), timeout, max_retries, |_| {
                attempts += 1;
                true
            });
            removed += report.exhausted.len();
        }

        assert_eq!(attempts, 3);
        assert_eq!(removed, 1);
        assert!(tracker.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_resend_leaves_entry() {
        let mut tracker = PendingTracker::new();
        tracker.upsert(frame(1), Instant::now());
        tokio::time::advance(Duration::from_millis(200)).await;

        let report = tracker.sweep(Instant::now(), Duration::from_millis(100), 2, |_| false);
        assert_eq!(report.deferred, vec![1]);
        assert_eq!(tracker.snapshot(Instant::now())[0].retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_young_entries_untouched() {
        let mut tracker = PendingTracker::new();
        tracker.upsert(frame(1), Instant::now());
        tokio::time::advance(Duration::from_millis(100)).await;

        let report = tracker.sweep(Instant::now(), Duration::from_millis(100), 2, |_| {
            panic!("entry is not due")
        });
        assert!(report.resent.is_empty());
        assert!(tracker.contains(1));
    }

    #[test]
    fn test_remove_and_clear() {
        let mut tracker = PendingTracker::new();
        let now = Instant::now();
        tracker.upsert(frame(1), now);
        tracker.upsert(frame(2), now);
        assert!(tracker.remove(1).is_some());
        assert!(tracker.remove(1).is_none());
        assert_eq!(tracker.clear(), 1);
        assert!(tracker.is_empty());
    }
}
