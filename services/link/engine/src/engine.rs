//! The link engine.
//!
//! [`LinkEngine::start`] programs the radio with the initial profile and
//! spawns the background actors (receive, drain, retry scan, negotiation
//! timer, bulk-ACK timer, automatic profile selection). The actors share
//! state only through the engine's queues and locks. Every wait except the
//! receive actor's wait for the radio interrupt is time bounded.

use crate::ack::BulkAckBuffers;
use crate::config::{AutoAsaConfig, LinkConfig};
use crate::error::LinkError;
use crate::negotiation::{Negotiation, NegotiationPhase};
use crate::neighbor::{NeighborInfo, NeighborRecord, NeighborTable};
use crate::pending::{PendingInfo, PendingTracker};
use crate::profile::{profile, LinkState, RadioMode};
use crate::queue::BoundedQueue;
use crate::radio::configure;
use crate::stats::{LinkStats, StatsSnapshot};
use crate::transport::RadioTransport;
use bytes::Bytes;
use link_wire::{
    encode_ack, encode_profile_index, frame_packet, Address, BulkAck, Flags, Frame, Header,
    LogicalPacket, PacketId, PacketType,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, MutexGuard, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

/// A validated frame delivered to the application
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    /// The frame
    pub frame: Frame,
    /// RSSI at reception, dBm
    pub rssi: f32,
    /// SNR at reception, dB
    pub snr: f32,
}

/// Notifications for the application
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// A pending frame was acknowledged
    Acked {
        /// Acknowledged id
        id: PacketId,
        /// Node that acknowledged it
        from: Address,
        /// Type of the acknowledged frame
        original_type: PacketType,
    },
    /// A pending frame was dropped after its last retry
    RetryExhausted {
        /// Dropped id
        id: PacketId,
        /// Destination
        to: Address,
        /// Type of the dropped frame
        packet_type: PacketType,
    },
    /// The active profile changed
    ProfileChanged {
        /// New profile index
        profile: u8,
        /// New modulation
        mode: RadioMode,
    },
    /// A negotiated switch has been scheduled
    SwitchScheduled {
        /// Target profile
        target: u8,
    },
}

/// Queue depths for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    /// Frames waiting to be transmitted
    pub tx_depth: usize,
    /// Outgoing capacity
    pub tx_capacity: usize,
    /// Frames waiting for the application
    pub rx_depth: usize,
    /// Inbound capacity
    pub rx_capacity: usize,
    /// Frames awaiting acknowledgement
    pub pending: usize,
    /// Ids waiting to be acknowledged
    pub acks_buffered: usize,
}

/// Full diagnostics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    /// Node address
    pub address: u8,
    /// Active link state
    pub link: LinkState,
    /// Profile description
    pub profile: String,
    /// Negotiation phase
    pub negotiation: NegotiationPhase,
    /// Queue depths
    pub queues: QueueStatus,
    /// Pending frames
    pub pending: Vec<PendingInfo>,
    /// Neighbor table
    pub neighbors: Vec<NeighborInfo>,
    /// Counters
    pub stats: StatsSnapshot,
}

/// State shared by the engine handle and its actors
pub(crate) struct Shared {
    pub(crate) config: LinkConfig,
    pub(crate) address: AtomicU8,
    pub(crate) next_id: AtomicU8,
    pub(crate) radio: Mutex<Box<dyn RadioTransport>>,
    pub(crate) rx_signal: Arc<Notify>,
    pub(crate) outgoing: BoundedQueue<Frame>,
    pub(crate) inbound: BoundedQueue<InboundFrame>,
    pub(crate) pending: Mutex<PendingTracker>,
    pub(crate) bulk_acks: Mutex<BulkAckBuffers>,
    pub(crate) negotiation: Mutex<Negotiation>,
    pub(crate) state: watch::Sender<LinkState>,
    pub(crate) auto_asa: RwLock<AutoAsaConfig>,
    pub(crate) neighbors: NeighborTable,
    pub(crate) stats: LinkStats,
    pub(crate) events: mpsc::UnboundedSender<LinkEvent>,
}

impl Shared {
    pub(crate) fn address(&self) -> Address {
        Address(self.address.load(Ordering::Relaxed))
    }

    /// Next id from the 8 bit counter; the first id handed out is 1
    pub(crate) fn next_packet_id(&self) -> PacketId {
        self.next_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    pub(crate) fn link_state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub(crate) fn emit(&self, event: LinkEvent) {
        // receiver may have been dropped by the application
        let _ = self.events.send(event);
    }

    pub(crate) async fn lock_within<'a, T>(
        &self,
        mutex: &'a Mutex<T>,
        bound: Duration,
        what: &'static str,
    ) -> Result<MutexGuard<'a, T>, LinkError> {
        match timeout(bound, mutex.lock()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                LinkStats::bump(&self.stats.lock_timeouts);
                debug!("Timed out waiting for {} lock", what);
                Err(LinkError::LockTimeout(what))
            }
        }
    }

    /// Count a queue read that gave up waiting for the queue lock
    pub(crate) fn bounded_read<T>(&self, read: Option<T>, what: &'static str) -> Option<T> {
        if read.is_none() {
            LinkStats::bump(&self.stats.lock_timeouts);
            debug!("Timed out waiting for {} lock", what);
        }
        read
    }

    /// Program `index` into the radio and commit the new link state.
    ///
    /// `manual` replaces the override flag when given. A failing radio
    /// command aborts the switch and leaves the previous state in place.
    pub(crate) async fn apply_profile(
        &self,
        index: u8,
        manual: Option<bool>,
    ) -> Result<LinkState, LinkError> {
        let descriptor = profile(index).ok_or(LinkError::InvalidProfile(index))?;
        let manual_override = manual.unwrap_or(self.link_state().manual_override);
        let next = LinkState::for_profile(index, manual_override)
            .ok_or(LinkError::InvalidProfile(index))?;

        let mut radio = self
            .lock_within(&self.radio, self.config.radio_lock_timeout, "radio")
            .await?;

        if let Err(e) = configure(&mut **radio, descriptor, &self.config.rf).await {
            warn!("Failed to apply profile {}: {}", index, e);
            if let Err(e) = radio.start_receive().await {
                warn!("Radio did not resume receive: {}", e);
            }
            return Err(e.into());
        }
        if let Err(e) = radio.start_receive().await {
            warn!("Radio did not resume receive on profile {}: {}", index, e);
        }
        let previous = self.state.send_replace(next);
        drop(radio);

        LinkStats::bump(&self.stats.profile_switches);
        info!(
            "Profile {} applied: retry timeout {:?}, max retries {}, bulk ACK {:?}/{:?}",
            next.describe(),
            next.retry.retry_timeout,
            next.retry.max_retries,
            next.retry.bulk_ack_interval,
            next.retry.bulk_ack_max_wait
        );
        if previous.profile != index {
            self.emit(LinkEvent::ProfileChanged {
                profile: index,
                mode: next.mode,
            });
        }
        Ok(next)
    }

    async fn track(&self, frame: Frame) {
        let id = frame.id();
        let packet_type = frame.packet_type();
        let Ok(mut pending) = self
            .lock_within(&self.pending, self.config.pending_lock_timeout, "pending")
            .await
        else {
            warn!("Frame {} not tracked for retry: pending list busy", id);
            return;
        };
        if pending.upsert(frame, Instant::now()) {
            warn!(
                "Duplicate packet id {} (type {}) refreshed in pending list",
                id, packet_type
            );
        }
    }

    /// Track an aggregate built on a queued frame. A frame already being
    /// retried keeps its retry count and timestamp.
    async fn track_aggregate(&self, aggregate: Frame) {
        let id = aggregate.id();
        let Ok(mut pending) = self
            .lock_within(&self.pending, self.config.pending_lock_timeout, "pending")
            .await
        else {
            warn!("Aggregate {} not tracked for retry: pending list busy", id);
            return;
        };
        if pending.replace_frame(aggregate, Instant::now()) {
            debug!("Pending frame {} replaced by its aggregate", id);
        }
    }

    async fn untrack(&self, id: PacketId) {
        if let Ok(mut pending) = self
            .lock_within(&self.pending, self.config.pending_lock_timeout, "pending")
            .await
        {
            pending.remove(id);
        }
    }

    /// Queue a framed packet, folding it into a queued aggregate when
    /// possible. Returns the id the frame travels under.
    pub(crate) async fn enqueue(&self, frame: Frame) -> Result<PacketId, LinkError> {
        let urgent = frame.is_high_priority();
        let wait = if urgent {
            self.config.enqueue_front_wait
        } else {
            self.config.enqueue_back_wait
        };

        if let Some(aggregate) = self.outgoing.try_aggregate(&frame, wait).await {
            LinkStats::bump(&self.stats.aggregations);
            let id = aggregate.id();
            if aggregate.ack_required() {
                self.track_aggregate(aggregate).await;
            }
            return Ok(id);
        }

        let id = frame.id();
        let packet_type = frame.packet_type();
        let ack_required = frame.ack_required();
        if ack_required {
            self.track(frame.clone()).await;
        }

        let queued = if urgent {
            self.outgoing.push_front(frame, wait).await
        } else {
            self.outgoing.push_back(frame, wait).await
        };
        if let Err(e) = queued {
            LinkStats::bump(&self.stats.queue_full);
            warn!("Outgoing queue full, frame {} (type {}) not sent", id, packet_type);
            if ack_required {
                self.untrack(id).await;
            }
            return Err(e);
        }
        Ok(id)
    }

    /// Queue a high-priority link service frame
    pub(crate) async fn send_control(
        &self,
        receiver: Address,
        packet_type: PacketType,
        payload: Bytes,
    ) -> Result<PacketId, LinkError> {
        let mut header = Header::new(packet_type, self.address(), receiver, self.next_packet_id());
        header.flags = Flags::HIGH_PRIORITY | Flags::SERVICE;
        let frame = Frame::new(header, payload)?;
        self.enqueue(frame).await
    }

    /// Send a batch of acknowledgements; one id goes out as a single ACK
    pub(crate) async fn send_ack_batch(&self, peer: Address, batch: BulkAck) {
        let result = match batch.ids() {
            [id] => self.send_control(peer, PacketType::Ack, encode_ack(*id)).await,
            _ => {
                LinkStats::bump(&self.stats.bulk_acks_sent);
                self.send_control(peer, PacketType::BulkAck, batch.encode())
                    .await
            }
        };
        match result {
            Ok(_) => debug!("ACK for {:?} queued to {}", batch.ids(), peer),
            Err(e) => warn!("ACK for {:?} to {} not queued: {}", batch.ids(), peer, e),
        }
    }

    /// Initiate a negotiation
    pub(crate) async fn request_profile(
        &self,
        peer: Address,
        index: u8,
    ) -> Result<PacketId, LinkError> {
        if profile(index).is_none() {
            return Err(LinkError::InvalidProfile(index));
        }
        let id = self
            .send_control(peer, PacketType::ProfileRequest, encode_profile_index(index))
            .await?;
        if let Ok(mut negotiation) = self
            .lock_within(&self.negotiation, self.config.negotiation_lock_timeout, "negotiation")
            .await
        {
            negotiation.record_request(index, Instant::now());
        }
        info!("ASA request for profile {} sent to {}", index, peer);
        Ok(id)
    }

    pub(crate) async fn negotiation_phase(&self) -> NegotiationPhase {
        match self
            .lock_within(&self.negotiation, self.config.negotiation_lock_timeout, "negotiation")
            .await
        {
            Ok(negotiation) => negotiation.phase(Instant::now(), self.config.asa_request_timeout),
            Err(_) => NegotiationPhase::Busy,
        }
    }
}

/// Handle to a running link engine
pub struct LinkEngine {
    shared: Arc<Shared>,
    running: AtomicBool,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl LinkEngine {
    /// Program the radio with the initial profile and start the actors.
    ///
    /// Returns the engine and the receiving end of its event channel.
    pub async fn start(
        config: LinkConfig,
        radio: Box<dyn RadioTransport>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<LinkEvent>), LinkError> {
        let initial = LinkState::for_profile(config.initial_profile, false)
            .ok_or(LinkError::InvalidProfile(config.initial_profile))?;
        let rx_signal = radio.rx_signal();
        let (events, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(initial);

        let shared = Arc::new(Shared {
            address: AtomicU8::new(config.address.0),
            next_id: AtomicU8::new(0),
            radio: Mutex::new(radio),
            rx_signal,
            outgoing: BoundedQueue::new(config.outgoing_capacity),
            inbound: BoundedQueue::new(config.inbound_capacity),
            pending: Mutex::new(PendingTracker::new()),
            bulk_acks: Mutex::new(BulkAckBuffers::new()),
            negotiation: Mutex::new(Negotiation::new()),
            state,
            auto_asa: RwLock::new(config.auto_asa),
            neighbors: NeighborTable::new(),
            stats: LinkStats::default(),
            events,
            config,
        });

        shared
            .apply_profile(shared.config.initial_profile, Some(false))
            .await?;

        let tasks = vec![
            tokio::spawn(shared.clone().receive_loop()),
            tokio::spawn(shared.clone().drain_loop()),
            tokio::spawn(shared.clone().retry_loop()),
            tokio::spawn(shared.clone().negotiation_loop()),
            tokio::spawn(shared.clone().bulk_ack_loop()),
            tokio::spawn(shared.clone().auto_asa_loop()),
        ];

        info!(
            "Link engine started at address {} on {}",
            shared.address(),
            shared.link_state().describe()
        );

        Ok((
            Self {
                shared,
                running: AtomicBool::new(true),
                tasks: StdMutex::new(tasks),
            },
            events_rx,
        ))
    }

    fn ensure_running(&self) -> Result<(), LinkError> {
        if self.running.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(LinkError::Stopped)
        }
    }

    /// This node's address
    pub fn address(&self) -> Address {
        self.shared.address()
    }

    /// Change this node's address
    pub fn set_address(&self, address: Address) {
        self.shared.address.store(address.0, Ordering::Relaxed);
        info!("Node address set to {}", address);
    }

    /// Last packet id handed out
    pub fn current_packet_id(&self) -> PacketId {
        self.shared.next_id.load(Ordering::Relaxed)
    }

    /// Frame and queue a packet. The returned id is the one to watch for
    /// acknowledgement; it differs from a freshly assigned id when the
    /// packet was folded into a queued aggregate.
    pub async fn send(
        &self,
        destination: Address,
        packet: &LogicalPacket,
        payload: Option<&[u8]>,
    ) -> Result<PacketId, LinkError> {
        self.ensure_running()?;
        let mut packet = *packet;
        packet.packet_id = self.shared.next_packet_id();

        let frame = frame_packet(self.address(), destination, &packet, payload).map_err(|e| {
            LinkStats::bump(&self.shared.stats.framing_errors);
            e
        })?;
        self.shared.enqueue(frame).await
    }

    /// Next inbound frame, if one is waiting
    pub fn receive(&self) -> Option<InboundFrame> {
        self.shared.inbound.try_pop()
    }

    /// Next inbound frame, waiting up to `wait`
    pub async fn receive_timeout(&self, wait: Duration) -> Option<InboundFrame> {
        self.shared.inbound.pop(wait).await
    }

    /// Switch to a profile, keeping the manual override flag
    pub async fn apply_profile(&self, index: u8) -> Result<LinkState, LinkError> {
        self.ensure_running()?;
        self.shared.apply_profile(index, None).await
    }

    /// Switch to the default profile of `mode` and suspend automatic selection
    pub async fn force_mode(&self, mode: RadioMode) -> Result<LinkState, LinkError> {
        self.ensure_running()?;
        self.shared
            .apply_profile(mode.default_profile(), Some(true))
            .await
    }

    /// Resume automatic selection
    pub fn clear_manual_override(&self) {
        self.shared.state.send_modify(|s| s.manual_override = false);
    }

    /// Ask `peer` to switch both ends to `index`
    pub async fn request_profile(&self, peer: Address, index: u8) -> Result<PacketId, LinkError> {
        self.ensure_running()?;
        self.shared.request_profile(peer, index).await
    }

    /// Whether `id` is still awaiting acknowledgement. A busy pending list
    /// reports `false`.
    pub async fn is_packet_pending(&self, id: PacketId) -> bool {
        let shared = &self.shared;
        match shared
            .lock_within(&shared.pending, shared.config.pending_lock_timeout, "pending")
            .await
        {
            Ok(pending) => pending.contains(id),
            Err(_) => false,
        }
    }

    /// Forget a pending frame without waiting for its ACK
    pub async fn remove_pending(&self, id: PacketId) -> Result<bool, LinkError> {
        let shared = &self.shared;
        let mut pending = shared
            .lock_within(&shared.pending, shared.config.pending_lock_timeout, "pending")
            .await?;
        Ok(pending.remove(id).is_some())
    }

    /// Forget every pending frame
    pub async fn clear_pending(&self) -> Result<usize, LinkError> {
        let shared = &self.shared;
        let mut pending = shared
            .lock_within(&shared.pending, shared.config.pending_lock_timeout, "pending")
            .await?;
        let removed = pending.clear();
        info!("Cleared {} pending frames", removed);
        Ok(removed)
    }

    /// Send buffered acknowledgements for `peer` now
    pub async fn flush_bulk_ack(&self, peer: Address) -> Result<bool, LinkError> {
        let shared = &self.shared;
        let batch = shared
            .lock_within(&shared.bulk_acks, shared.config.negotiation_lock_timeout, "bulk ack")
            .await?
            .flush(peer, Instant::now());
        match batch {
            Some(batch) => {
                shared.send_ack_batch(peer, batch).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Active link state
    pub fn link_state(&self) -> LinkState {
        self.shared.link_state()
    }

    /// Watch link state changes
    pub fn subscribe_link_state(&self) -> watch::Receiver<LinkState> {
        self.shared.state.subscribe()
    }

    /// Current negotiation phase
    pub async fn negotiation_phase(&self) -> NegotiationPhase {
        self.shared.negotiation_phase().await
    }

    /// Automatic selection settings
    pub async fn auto_asa(&self) -> AutoAsaConfig {
        *self.shared.auto_asa.read().await
    }

    /// Enable or disable automatic selection
    pub async fn set_auto_asa_enabled(&self, enabled: bool) {
        self.shared.auto_asa.write().await.enabled = enabled;
        info!("Automatic profile selection {}", if enabled { "enabled" } else { "disabled" });
    }

    /// Change the automatic selection period
    pub async fn set_auto_asa_interval(&self, interval: Duration) {
        self.shared.auto_asa.write().await.interval = interval;
    }

    /// Change the upgrade margin in dB
    pub async fn set_auto_asa_hysteresis(&self, hysteresis_db: f32) {
        self.shared.auto_asa.write().await.hysteresis_db = hysteresis_db;
    }

    /// Queue depths. A part whose lock stays busy past its bound reads as 0.
    pub async fn queue_status(&self) -> QueueStatus {
        let shared = &self.shared;
        let wait = shared.config.pending_lock_timeout;
        let tx_depth = shared.outgoing.len(wait).await;
        let rx_depth = shared.inbound.len(wait).await;
        let pending = shared
            .lock_within(&shared.pending, wait, "pending")
            .await
            .map(|p| p.len());
        let acks_buffered = shared
            .lock_within(&shared.bulk_acks, shared.config.negotiation_lock_timeout, "bulk ack")
            .await
            .map(|b| b.buffered());
        QueueStatus {
            tx_depth: shared.bounded_read(tx_depth, "outgoing queue").unwrap_or(0),
            tx_capacity: shared.outgoing.capacity(),
            rx_depth: shared.bounded_read(rx_depth, "inbound queue").unwrap_or(0),
            rx_capacity: shared.inbound.capacity(),
            pending: pending.unwrap_or(0),
            acks_buffered: acks_buffered.unwrap_or(0),
        }
    }

    /// Queued outgoing frames as (id, type, destination), front first.
    /// Empty if the queue stays busy past the pending lock bound.
    pub async fn outgoing_snapshot(&self) -> Vec<(PacketId, PacketType, u8)> {
        let shared = &self.shared;
        let frames = shared
            .outgoing
            .describe(shared.config.pending_lock_timeout)
            .await;
        shared
            .bounded_read(frames, "outgoing queue")
            .unwrap_or_default()
    }

    /// Pending frames. Empty if the pending list stays busy past its bound.
    pub async fn pending_snapshot(&self) -> Vec<PendingInfo> {
        let shared = &self.shared;
        match shared
            .lock_within(&shared.pending, shared.config.pending_lock_timeout, "pending")
            .await
        {
            Ok(pending) => pending.snapshot(Instant::now()),
            Err(_) => Vec::new(),
        }
    }

    /// Neighbor table
    pub fn neighbors(&self) -> Vec<NeighborInfo> {
        self.shared.neighbors.snapshot(Instant::now())
    }

    /// One neighbor record
    pub fn neighbor(&self, peer: Address) -> Option<NeighborRecord> {
        self.shared.neighbors.get(peer)
    }

    /// Counters
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Everything above in one serializable value
    pub async fn diagnostics(&self) -> Diagnostics {
        let link = self.link_state();
        Diagnostics {
            address: self.address().0,
            profile: link.describe(),
            link,
            negotiation: self.negotiation_phase().await,
            queues: self.queue_status().await,
            pending: self.pending_snapshot().await,
            neighbors: self.neighbors(),
            stats: self.stats(),
        }
    }

    /// Stop all actors. Further sends fail with [`LinkError::Stopped`].
    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            info!("Link engine at address {} shutting down", self.address());
        }
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for LinkEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AutoAsaConfig;
    use crate::loopback::{LoopbackAir, LoopbackHandle};
    use link_wire::Aggregate;

    fn node(address: u8, peer: u8, initial_profile: u8) -> LinkConfig {
        LinkConfig {
            address: Address(address),
            default_peer: Address(peer),
            initial_profile,
            ..LinkConfig::default()
        }
    }

    async fn attach(
        air: &LoopbackAir,
        config: LinkConfig,
    ) -> (LinkEngine, mpsc::UnboundedReceiver<LinkEvent>, LoopbackHandle) {
        let radio = air.radio();
        let handle = radio.handle();
        let (engine, events) = LinkEngine::start(config, Box::new(radio)).await.unwrap();
        (engine, events, handle)
    }

    async fn wait_event<F>(events: &mut mpsc::UnboundedReceiver<LinkEvent>, mut wanted: F) -> LinkEvent
    where
        F: FnMut(&LinkEvent) -> bool,
    {
        timeout(Duration::from_secs(120), async {
            loop {
                let event = events.recv().await.unwrap();
                if wanted(&event) {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    async fn wait_profile(engine: &LinkEngine, profile: u8) {
        let mut state = engine.subscribe_link_state();
        timeout(Duration::from_secs(60), state.wait_for(|s| s.profile == profile))
            .await
            .unwrap()
            .unwrap();
    }

    fn status() -> LogicalPacket {
        LogicalPacket::new(PacketType::Status).with_len(3)
    }

    /// Too large to be folded into an aggregate
    fn bulky() -> LogicalPacket {
        LogicalPacket::new(PacketType::Status).with_len(40)
    }

    fn sent_types(handle: &LoopbackHandle) -> Vec<PacketType> {
        handle
            .sent()
            .iter()
            .map(|f| Frame::decode(f).unwrap().packet_type())
            .collect()
    }

    fn inbound(sender: u8, id: PacketId, flags: Flags) -> Bytes {
        let mut header = Header::new(PacketType::Status, Address(sender), Address(1), id);
        header.flags = flags;
        Frame::new(header, Bytes::from_static(b"abc")).unwrap().encode()
    }

    #[tokio::test(start_paused = true)]
    async fn test_acknowledged_delivery() {
        let air = LoopbackAir::new();
        let (a, mut a_events, _) = attach(&air, node(1, 2, 0)).await;
        let (b, _b_events, _) = attach(&air, node(2, 1, 0)).await;

        let id = a
            .send(Address(2), &status().ack_required(), Some(b"abc"))
            .await
            .unwrap();
        assert_eq!(id, 1);
        assert!(a.is_packet_pending(id).await);

        let inbound = b.receive_timeout(Duration::from_secs(30)).await.unwrap();
        assert_eq!(inbound.frame.header.sender, Address(1));
        assert_eq!(&inbound.frame.payload[..], b"abc");

        let event = wait_event(&mut a_events, |e| matches!(e, LinkEvent::Acked { .. })).await;
        assert_eq!(
            event,
            LinkEvent::Acked {
                id,
                from: Address(2),
                original_type: PacketType::Status
            }
        );
        assert!(!a.is_packet_pending(id).await);
        assert_eq!(a.stats().acks_matched, 1);
        assert_eq!(a.neighbor(Address(2)).unwrap().rx_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_without_peer() {
        let air = LoopbackAir::new();
        // profile 12: 1.5 s retry timeout, 2 retries
        let (a, mut events, handle) = attach(&air, node(1, 2, 12)).await;

        let id = a
            .send(Address(2), &status().ack_required(), Some(b"xyz"))
            .await
            .unwrap();

        let event = wait_event(&mut events, |e| matches!(e, LinkEvent::RetryExhausted { .. })).await;
        assert_eq!(
            event,
            LinkEvent::RetryExhausted {
                id,
                to: Address(2),
                packet_type: PacketType::Status
            }
        );
        assert_eq!(handle.sent().len(), 3);
        let stats = a.stats();
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.retry_exhausted, 1);
        assert!(!a.is_packet_pending(id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_frame_recovered_by_retry() {
        let air = LoopbackAir::new();
        let (a, mut a_events, _) = attach(&air, node(1, 2, 0)).await;
        let (b, _b_events, _) = attach(&air, node(2, 1, 0)).await;

        air.set_loss(1.0);
        let id = a
            .send(Address(2), &status().ack_required(), Some(b"abc"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(b.receive().is_none());

        air.set_loss(0.0);
        let event = wait_event(&mut a_events, |e| matches!(e, LinkEvent::Acked { .. })).await;
        assert!(matches!(event, LinkEvent::Acked { id: acked, .. } if acked == id));
        assert!(a.stats().retries >= 1);
        assert_eq!(&b.receive().unwrap().frame.payload[..], b"abc");
    }

    #[tokio::test(start_paused = true)]
    async fn test_aggregating_into_a_retry_keeps_its_budget() {
        let air = LoopbackAir::new();
        // profile 12: 1.5 s retry timeout, 2 retries
        let (a, mut events, handle) = attach(&air, node(1, 2, 12)).await;

        let id = a
            .send(Address(2), &status().ack_required(), Some(b"xyz"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handle.sent().len(), 1);

        // a frame stuck on the radio keeps the retransmission queued
        let radio = a.shared.radio.lock().await;
        a.send(Address(3), &bulky(), Some(&[0u8; 40])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1900)).await;
        assert_eq!(a.pending_snapshot().await[0].retries, 1);
        assert_eq!(a.outgoing_snapshot().await, vec![(id, PacketType::Status, 2)]);

        let folded = a.send(Address(2), &status(), Some(b"abc")).await.unwrap();
        assert_eq!(folded, id);
        let pending = a.pending_snapshot().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].packet_type, PacketType::Aggregate);
        assert_eq!(pending[0].retries, 1);
        drop(radio);

        let event = wait_event(&mut events, |e| matches!(e, LinkEvent::RetryExhausted { .. })).await;
        assert!(matches!(event, LinkEvent::RetryExhausted { id: dropped, .. } if dropped == id));
        assert_eq!(a.stats().retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_urgent_frame_flushes_buffered_acks() {
        let air = LoopbackAir::new();
        let (a, _events, handle) = attach(&air, node(1, 2, 0)).await;

        handle.inject(&inbound(2, 10, Flags::ACK_REQUIRED));
        handle.inject(&inbound(2, 11, Flags::ACK_REQUIRED));
        tokio::time::sleep(Duration::from_millis(100)).await;
        // first id goes out at once, the second waits for the batch
        assert_eq!(sent_types(&handle), vec![PacketType::Ack]);
        assert_eq!(a.queue_status().await.acks_buffered, 1);

        handle.inject(&inbound(2, 12, Flags::ACK_REQUIRED | Flags::HIGH_PRIORITY));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sent_types(&handle), vec![PacketType::Ack, PacketType::BulkAck]);
        let bulk = Frame::decode(&handle.sent()[1]).unwrap();
        assert_eq!(BulkAck::decode(&bulk.payload).unwrap().ids(), &[11, 12]);
        assert_eq!(a.stats().bulk_acks_sent, 1);
        assert_eq!(a.queue_status().await.acks_buffered, 0);

        // the urgent frame is delivered first
        assert_eq!(a.receive().unwrap().frame.id(), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_bulk_ack_clears_sender_pending() {
        let air = LoopbackAir::new();
        let (a, mut a_events, _) = attach(&air, node(1, 2, 0)).await;
        let (b, _b_events, b_handle) = attach(&air, node(2, 1, 0)).await;

        let mut ids = Vec::new();
        for fill in 1..=3u8 {
            let id = a
                .send(Address(2), &bulky().ack_required(), Some(&[fill; 40]))
                .await
                .unwrap();
            ids.push(id);
        }
        assert_eq!(ids, vec![1, 2, 3]);

        let mut acked = Vec::new();
        while acked.len() < 3 {
            if let LinkEvent::Acked { id, .. } =
                wait_event(&mut a_events, |e| matches!(e, LinkEvent::Acked { .. })).await
            {
                acked.push(id);
            }
        }
        acked.sort_unstable();
        assert_eq!(acked, ids);

        // one immediate ACK, then a single batch from the periodic flush
        assert_eq!(sent_types(&b_handle), vec![PacketType::Ack, PacketType::BulkAck]);
        let bulk = Frame::decode(&b_handle.sent()[1]).unwrap();
        assert_eq!(BulkAck::decode(&bulk.payload).unwrap().ids(), &[2, 3]);
        assert_eq!(b.stats().bulk_acks_sent, 1);
        assert!(a.pending_snapshot().await.is_empty());
        assert_eq!(a.stats().acks_matched, 3);
        assert_eq!(a.stats().retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_outgoing_queue_rejects_send() {
        let air = LoopbackAir::new();
        let mut config = node(1, 2, 0);
        config.outgoing_capacity = 1;
        let (a, _events, _) = attach(&air, config).await;

        let radio = a.shared.radio.lock().await;
        a.send(Address(2), &bulky(), Some(&[1u8; 40])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        a.send(Address(2), &bulky(), Some(&[2u8; 40])).await.unwrap();

        let full = a
            .send(Address(2), &bulky().ack_required(), Some(&[3u8; 40]))
            .await;
        assert!(matches!(full, Err(LinkError::QueueFull)));
        assert_eq!(a.stats().queue_full, 1);
        assert!(!a.is_packet_pending(a.current_packet_id()).await);
        drop(radio);
    }

    #[tokio::test(start_paused = true)]
    async fn test_diagnostics_bounded_by_held_pending_list() {
        let air = LoopbackAir::new();
        let (a, _events, _) = attach(&air, node(1, 2, 0)).await;
        let id = a
            .send(Address(2), &status().ack_required(), Some(b"abc"))
            .await
            .unwrap();

        let held = a.shared.pending.lock().await;
        let before = a.stats().lock_timeouts;
        let queues = timeout(Duration::from_secs(1), a.queue_status())
            .await
            .unwrap();
        assert_eq!(queues.pending, 0);
        let snapshot = timeout(Duration::from_secs(1), a.pending_snapshot())
            .await
            .unwrap();
        assert!(snapshot.is_empty());
        assert!(a.stats().lock_timeouts >= before + 2);
        drop(held);

        assert_eq!(a.queue_status().await.pending, 1);
        assert_eq!(a.pending_snapshot().await[0].id, id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_selection_waits_for_busy_negotiation() {
        let air = LoopbackAir::new();
        let (a, _events, handle) = attach(&air, node(1, 2, 0)).await;
        handle.set_signal(-112.0, -3.0);
        handle.inject(&inbound(2, 7, Flags::empty()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(a.neighbor(Address(2)).is_some());

        let held = a.shared.negotiation.lock().await;
        assert_eq!(a.negotiation_phase().await, NegotiationPhase::Busy);
        a.shared.auto_select(3.0).await;
        drop(held);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!sent_types(&handle).contains(&PacketType::ProfileRequest));
        assert_eq!(a.negotiation_phase().await, NegotiationPhase::Idle);

        a.shared.auto_select(3.0).await;
        assert_eq!(a.negotiation_phase().await, NegotiationPhase::RequestSent(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_negotiated_switch_on_both_ends() {
        let air = LoopbackAir::new();
        let (a, mut a_events, _) = attach(&air, node(1, 2, 0)).await;
        let (b, mut b_events, _) = attach(&air, node(2, 1, 0)).await;

        a.request_profile(Address(2), 3).await.unwrap();
        assert_eq!(a.negotiation_phase().await, NegotiationPhase::RequestSent(3));

        let scheduled = wait_event(&mut b_events, |_| true).await;
        assert_eq!(scheduled, LinkEvent::SwitchScheduled { target: 3 });

        wait_profile(&a, 3).await;
        wait_profile(&b, 3).await;
        assert_eq!(a.negotiation_phase().await, NegotiationPhase::Idle);
        assert_eq!(b.negotiation_phase().await, NegotiationPhase::Idle);
        assert_eq!(b.link_state().mode, RadioMode::LoRa);

        // the link still works on the new profile
        let id = a
            .send(Address(2), &status().ack_required(), Some(b"new"))
            .await
            .unwrap();
        let event = wait_event(&mut a_events, |e| matches!(e, LinkEvent::Acked { .. })).await;
        assert!(matches!(event, LinkEvent::Acked { id: acked, .. } if acked == id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_for_active_profile_gets_no_response() {
        let air = LoopbackAir::new();
        let (a, _a_events, _) = attach(&air, node(1, 2, 3)).await;
        let (b, _b_events, b_handle) = attach(&air, node(2, 1, 3)).await;

        a.request_profile(Address(2), 3).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(a.link_state().profile, 3);
        assert_eq!(b.link_state().profile, 3);
        assert_eq!(b.negotiation_phase().await, NegotiationPhase::Idle);
        assert!(b_handle
            .sent()
            .iter()
            .all(|f| Frame::decode(f).unwrap().packet_type() != PacketType::ProfileResponse));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_profile_change_keeps_state() {
        let air = LoopbackAir::new();
        let (a, mut events, handle) = attach(&air, node(1, 2, 0)).await;

        handle.fail_setting(Some("spreading_factor"));
        let err = a.apply_profile(5).await.unwrap_err();
        assert!(matches!(err, LinkError::Transport(_)));
        assert_eq!(a.link_state().profile, 0);
        assert!(handle.is_receiving());

        handle.fail_setting(None);
        let state = a.apply_profile(5).await.unwrap();
        assert_eq!(state.profile, 5);
        assert_eq!(
            wait_event(&mut events, |_| true).await,
            LinkEvent::ProfileChanged {
                profile: 5,
                mode: RadioMode::LoRa
            }
        );
        assert_eq!(a.stats().profile_switches, 2);
        assert!(matches!(
            a.apply_profile(13).await,
            Err(LinkError::InvalidProfile(13))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_override() {
        let air = LoopbackAir::new();
        let (a, _events, _) = attach(&air, node(1, 2, 0)).await;

        let state = a.force_mode(RadioMode::Fsk).await.unwrap();
        assert_eq!(state.profile, 10);
        assert!(state.manual_override);

        // plain profile changes keep the override
        assert!(a.apply_profile(11).await.unwrap().manual_override);

        a.clear_manual_override();
        assert!(!a.link_state().manual_override);
        assert_eq!(a.link_state().profile, 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_small_packets_share_a_frame() {
        let air = LoopbackAir::new();
        let (a, _a_events, _) = attach(&air, node(1, 2, 0)).await;
        let (b, _b_events, _) = attach(&air, node(2, 1, 0)).await;

        let first = a.send(Address(2), &status(), Some(b"one")).await.unwrap();
        let second = a.send(Address(2), &status(), Some(b"two")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(a.stats().aggregations, 1);

        let inbound = b.receive_timeout(Duration::from_secs(30)).await.unwrap();
        assert_eq!(inbound.frame.packet_type(), PacketType::Aggregate);
        let aggregate = Aggregate::decode(&inbound.frame.payload).unwrap();
        let payloads: Vec<&[u8]> = aggregate.entries().iter().map(|e| &e.payload[..]).collect();
        assert_eq!(payloads, vec![&b"one"[..], &b"two"[..]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_selection_requests_better_profile() {
        let air = LoopbackAir::new();
        let mut config = node(1, 2, 0);
        config.auto_asa = AutoAsaConfig {
            enabled: true,
            interval: Duration::from_secs(2),
            hysteresis_db: 3.0,
        };
        let (a, _a_events, a_handle) = attach(&air, config).await;
        let (b, _b_events, _) = attach(&air, node(2, 1, 0)).await;
        a_handle.set_signal(-112.0, -3.0);

        b.send(Address(1), &status(), Some(b"hi!")).await.unwrap();

        wait_profile(&a, 3).await;
        wait_profile(&b, 3).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_validation_and_shutdown() {
        let air = LoopbackAir::new();
        let (a, _events, _) = attach(&air, node(1, 2, 0)).await;

        let short = a.send(Address(2), &status(), Some(b"x")).await;
        assert!(matches!(short, Err(LinkError::Framing(_))));
        let oversize = LogicalPacket::new(PacketType::Status).with_len(86);
        assert!(a.send(Address(2), &oversize, Some(&[0u8; 86])).await.is_err());
        assert_eq!(a.stats().framing_errors, 2);

        let queues = a.queue_status().await;
        assert_eq!(queues.tx_capacity, 45);
        assert_eq!(queues.rx_capacity, 35);

        a.shutdown();
        assert!(matches!(
            a.send(Address(2), &status(), Some(b"abc")).await,
            Err(LinkError::Stopped)
        ));
    }
}
