//! Bounded two-level priority queues and opportunistic aggregation.
//!
//! High-priority items go to the front, everything else to the back. Every
//! enqueue and dequeue is bounded by a wait; a full queue is reported as
//! [`LinkError::QueueFull`] once the wait runs out.

use crate::error::LinkError;
use link_wire::{Aggregate, Flags, Frame, Header, PacketType, MAX_AGGREGATE_CANDIDATE};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::{timeout_at, Instant};
use tracing::debug;

/// Maximum queue entries inspected when looking for an aggregation partner
pub const AGGREGATION_SCAN_LIMIT: usize = 30;

/// Bounded FIFO with front insertion for urgent items
#[derive(Debug)]
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    item_ready: Notify,
    space_ready: Notify,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            item_ready: Notify::new(),
            space_ready: Notify::new(),
        }
    }

    /// Queue capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items currently queued, or `None` if the queue stayed locked for `wait`
    pub async fn len(&self, wait: Duration) -> Option<usize> {
        let items = tokio::time::timeout(wait, self.items.lock()).await.ok()?;
        Some(items.len())
    }

    /// Insert at the front, waiting up to `wait` for space
    pub async fn push_front(&self, item: T, wait: Duration) -> Result<(), LinkError> {
        self.push(item, wait, true).await
    }

    /// Insert at the back, waiting up to `wait` for space
    pub async fn push_back(&self, item: T, wait: Duration) -> Result<(), LinkError> {
        self.push(item, wait, false).await
    }

    /// Insert at the back without waiting. Returns the item if the queue is
    /// busy or full.
    pub fn try_push_back(&self, item: T) -> Result<(), T> {
        let Ok(mut items) = self.items.try_lock() else {
            return Err(item);
        };
        if items.len() >= self.capacity {
            return Err(item);
        }
        items.push_back(item);
        drop(items);
        self.item_ready.notify_one();
        Ok(())
    }

    async fn push(&self, item: T, wait: Duration, front: bool) -> Result<(), LinkError> {
        let deadline = Instant::now() + wait;
        loop {
            let space = self.space_ready.notified();
            {
                let mut items = timeout_at(deadline, self.items.lock())
                    .await
                    .map_err(|_| LinkError::QueueFull)?;
                if items.len() < self.capacity {
                    if front {
                        items.push_front(item);
                    } else {
                        items.push_back(item);
                    }
                    drop(items);
                    self.item_ready.notify_one();
                    return Ok(());
                }
            }
            if timeout_at(deadline, space).await.is_err() {
                return Err(LinkError::QueueFull);
            }
        }
    }

    /// Remove the front item, waiting up to `wait` for one to arrive
    pub async fn pop(&self, wait: Duration) -> Option<T> {
        let deadline = Instant::now() + wait;
        loop {
            let ready = self.item_ready.notified();
            {
                let mut items = timeout_at(deadline, self.items.lock()).await.ok()?;
                if let Some(item) = items.pop_front() {
                    drop(items);
                    self.space_ready.notify_one();
                    return Some(item);
                }
            }
            timeout_at(deadline, ready).await.ok()?;
        }
    }

    /// Remove the front item if one is immediately available
    pub fn try_pop(&self) -> Option<T> {
        let mut items = self.items.try_lock().ok()?;
        let item = items.pop_front();
        if item.is_some() {
            drop(items);
            self.space_ready.notify_one();
        }
        item
    }
}

/// Whether a new frame may be folded into a queued one
pub fn is_aggregation_candidate(frame: &Frame) -> bool {
    !frame.is_high_priority()
        && !frame.packet_type().is_link_control()
        && frame.packet_type() != PacketType::Aggregate
        && frame.payload.len() <= MAX_AGGREGATE_CANDIDATE
}

enum Partner {
    Aggregate(usize, Aggregate),
    Single(usize),
}

/// Bits an aggregate keeps from the frame it is built on. Payload bits such
/// as `ENCRYPTED` describe one member only and are dropped.
const AGGREGATE_INHERITED: Flags = Flags::ACK_REQUIRED.union(Flags::INTERNAL_ONLY);

fn merged_flags(base: Flags, candidate: &Frame) -> Flags {
    let mut flags = (base & AGGREGATE_INHERITED) | Flags::AGGREGATED;
    if candidate.ack_required() {
        flags |= Flags::ACK_REQUIRED;
    }
    flags
}

impl BoundedQueue<Frame> {
    /// Fold `candidate` into a queued frame to the same destination.
    ///
    /// Scans at most [`AGGREGATION_SCAN_LIMIT`] entries. A queued aggregate
    /// with room is preferred; otherwise the first eligible single frame is
    /// replaced by a new aggregate holding both. The result keeps the queued
    /// frame's id and position and is returned so the caller can track it.
    /// `None` means the candidate was not folded and should be queued as is.
    pub async fn try_aggregate(&self, candidate: &Frame, wait: Duration) -> Option<Frame> {
        if !is_aggregation_candidate(candidate) {
            return None;
        }

        let mut items = tokio::time::timeout(wait, self.items.lock()).await.ok()?;
        let receiver = candidate.header.receiver;

        let mut partner = None;
        for (pos, queued) in items.iter().take(AGGREGATION_SCAN_LIMIT).enumerate() {
            if queued.header.receiver != receiver {
                continue;
            }
            if queued.packet_type() == PacketType::Aggregate {
                if let Ok(agg) = Aggregate::decode(&queued.payload) {
                    if agg.can_fit(candidate.payload.len()) {
                        partner = Some(Partner::Aggregate(pos, agg));
                        break;
                    }
                }
            } else if partner.is_none() && is_aggregation_candidate(queued) {
                partner = Some(Partner::Single(pos));
            }
        }

        let (pos, agg) = match partner? {
            Partner::Aggregate(pos, mut agg) => {
                agg.push(candidate.packet_type(), candidate.payload.clone())
                    .ok()?;
                (pos, agg)
            }
            Partner::Single(pos) => {
                let queued = &items[pos];
                let mut agg = Aggregate::new();
                agg.push(queued.packet_type(), queued.payload.clone()).ok()?;
                agg.push(candidate.packet_type(), candidate.payload.clone())
                    .ok()?;
                (pos, agg)
            }
        };

        let found = &items[pos];
        let mut header = Header::new(
            PacketType::Aggregate,
            found.header.sender,
            found.header.receiver,
            found.header.packet_id,
        );
        header.flags = merged_flags(found.header.flags, candidate);
        let frame = Frame::new(header, agg.encode()).ok()?;

        debug!(
            "Aggregated type {} into frame {} ({} sub-packets) to {}",
            candidate.packet_type(),
            frame.id(),
            agg.len(),
            receiver
        );

        items[pos] = frame.clone();
        Some(frame)
    }

    /// Ids, types and destinations of queued frames, front first. `None` if
    /// the queue stayed locked for `wait`.
    pub async fn describe(&self, wait: Duration) -> Option<Vec<(u8, PacketType, u8)>> {
        let items = tokio::time::timeout(wait, self.items.lock()).await.ok()?;
        Some(
            items
                .iter()
                .map(|f| (f.id(), f.packet_type(), f.header.receiver.0))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use link_wire::Address;

    fn payload(bytes: &[u8]) -> Bytes {
        Bytes::copy_from_slice(bytes)
    }

    fn frame(id: u8, to: u8, ty: PacketType, len: usize, flags: Flags) -> Frame {
        let mut header = Header::new(ty, Address(1), Address(to), id);
        header.flags = flags;
        Frame::new(header, payload(&vec![id; len])).unwrap()
    }

    #[tokio::test]
    async fn test_priority_order() {
        let queue = BoundedQueue::new(8);
        let wait = Duration::from_millis(10);
        queue.push_back(1, wait).await.unwrap();
        queue.push_back(2, wait).await.unwrap();
        queue.push_front(3, wait).await.unwrap();

        assert_eq!(queue.pop(wait).await, Some(3));
        assert_eq!(queue.pop(wait).await, Some(1));
        assert_eq!(queue.pop(wait).await, Some(2));
        assert_eq!(queue.try_pop(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_times_out() {
        let queue = BoundedQueue::new(1);
        queue.push_back(1, Duration::from_millis(10)).await.unwrap();

        let start = Instant::now();
        let result = queue.push_back(2, Duration::from_millis(200)).await;
        assert!(matches!(result, Err(LinkError::QueueFull)));
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert_eq!(queue.try_push_back(3), Err(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_times_out_when_empty() {
        let queue: BoundedQueue<u8> = BoundedQueue::new(4);
        assert_eq!(queue.pop(Duration::from_millis(500)).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_push_succeeds_when_space_frees() {
        let queue = std::sync::Arc::new(BoundedQueue::new(1));
        queue.push_back(1, Duration::from_millis(10)).await.unwrap();

        let popper = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            popper.pop(Duration::from_millis(10)).await
        });

        queue.push_back(2, Duration::from_millis(200)).await.unwrap();
        assert_eq!(queue.pop(Duration::from_millis(10)).await, Some(2));
    }

    #[tokio::test]
    async fn test_aggregate_two_frames() {
        let queue = BoundedQueue::new(8);
        let wait = Duration::from_millis(10);
        queue
            .push_back(frame(1, 2, PacketType::Status, 10, Flags::empty()), wait)
            .await
            .unwrap();
        queue
            .push_back(frame(2, 3, PacketType::Status, 10, Flags::empty()), wait)
            .await
            .unwrap();

        let candidate = frame(3, 2, PacketType::Nav, 8, Flags::ACK_REQUIRED);
        let agg = queue.try_aggregate(&candidate, wait).await.unwrap();
        assert_eq!(agg.id(), 1);
        assert_eq!(agg.packet_type(), PacketType::Aggregate);
        assert!(agg.flags().contains(Flags::AGGREGATED | Flags::ACK_REQUIRED));

        let parsed = Aggregate::decode(&agg.payload).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed.entries()[0].packet_type, PacketType::Status);
        assert_eq!(parsed.entries()[1].packet_type, PacketType::Nav);

        // position preserved, frame to address 3 untouched
        assert_eq!(
            queue.describe(wait).await,
            Some(vec![(1, PacketType::Aggregate, 2), (2, PacketType::Status, 3)])
        );
    }

    #[tokio::test]
    async fn test_aggregate_drops_payload_flags() {
        let queue = BoundedQueue::new(8);
        let wait = Duration::from_millis(10);
        let flags = Flags::ACK_REQUIRED | Flags::ENCRYPTED | Flags::COMPRESSED | Flags::INTERNAL_ONLY;
        queue
            .push_back(frame(1, 2, PacketType::Status, 6, flags), wait)
            .await
            .unwrap();

        let plain = frame(2, 2, PacketType::Nav, 6, Flags::empty());
        let agg = queue.try_aggregate(&plain, wait).await.unwrap();
        assert_eq!(
            agg.flags(),
            Flags::ACK_REQUIRED | Flags::INTERNAL_ONLY | Flags::AGGREGATED
        );
    }

    #[tokio::test]
    async fn test_existing_aggregate_preferred() {
        let queue = BoundedQueue::new(8);
        let wait = Duration::from_millis(10);
        queue
            .push_back(frame(1, 2, PacketType::Status, 5, Flags::empty()), wait)
            .await
            .unwrap();
        let first = queue
            .try_aggregate(&frame(2, 2, PacketType::Nav, 5, Flags::empty()), wait)
            .await
            .unwrap();
        assert!(!first.ack_required());
        queue
            .push_back(frame(3, 2, PacketType::Ping, 5, Flags::empty()), wait)
            .await
            .unwrap();

        let grown = queue
            .try_aggregate(&frame(4, 2, PacketType::Pong, 5, Flags::empty()), wait)
            .await
            .unwrap();
        assert_eq!(grown.id(), 1);
        assert_eq!(Aggregate::decode(&grown.payload).unwrap().len(), 3);
        assert_eq!(queue.len(wait).await, Some(2));
    }

    #[tokio::test]
    async fn test_ineligible_frames_not_aggregated() {
        let queue = BoundedQueue::new(8);
        let wait = Duration::from_millis(10);

        // empty queue
        let small = frame(1, 2, PacketType::Status, 4, Flags::empty());
        assert!(queue.try_aggregate(&small, wait).await.is_none());

        queue
            .push_back(frame(2, 2, PacketType::Status, 40, Flags::empty()), wait)
            .await
            .unwrap();
        queue
            .push_back(frame(3, 2, PacketType::BulkAck, 2, Flags::empty()), wait)
            .await
            .unwrap();
        queue
            .push_back(frame(4, 2, PacketType::Status, 4, Flags::HIGH_PRIORITY), wait)
            .await
            .unwrap();

        // no eligible partner
        assert!(queue.try_aggregate(&small, wait).await.is_none());
        // ineligible candidates
        let urgent = frame(5, 2, PacketType::Status, 4, Flags::HIGH_PRIORITY);
        assert!(queue.try_aggregate(&urgent, wait).await.is_none());
        let big = frame(6, 2, PacketType::Status, 31, Flags::empty());
        assert!(queue.try_aggregate(&big, wait).await.is_none());
        let ack = frame(7, 2, PacketType::Ack, 1, Flags::empty());
        assert!(queue.try_aggregate(&ack, wait).await.is_none());
    }

    #[tokio::test]
    async fn test_full_aggregate_not_extended() {
        let queue = BoundedQueue::new(8);
        let wait = Duration::from_millis(10);
        queue
            .push_back(frame(1, 2, PacketType::Status, 1, Flags::empty()), wait)
            .await
            .unwrap();
        for id in 2..=5 {
            queue
                .try_aggregate(&frame(id, 2, PacketType::Status, 1, Flags::empty()), wait)
                .await
                .unwrap();
        }
        // five sub-packets: sixth is not folded
        let sixth = frame(6, 2, PacketType::Status, 1, Flags::empty());
        assert!(queue.try_aggregate(&sixth, wait).await.is_none());
    }
}
