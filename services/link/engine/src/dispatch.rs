//! Receive path: read the radio, validate, route control frames and
//! deliver the rest.

use crate::ack::{process_ack, process_bulk_ack, AckOutcome};
use crate::engine::{InboundFrame, LinkEvent, Shared};
use crate::error::TransportError;
use crate::negotiation::{Negotiation, RequestAction};
use crate::stats::LinkStats;
use crate::transport::ReceivedPacket;
use link_wire::{
    decode_ack, decode_profile_index, encode_profile_index, Address, BulkAck, Frame, PacketId,
    PacketType,
};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

impl Shared {
    /// Wait for the radio interrupt and drain everything it announced
    pub(crate) async fn receive_loop(self: Arc<Self>) {
        let signal = self.rx_signal.clone();
        loop {
            signal.notified().await;
            self.drain_radio().await;
        }
    }

    async fn drain_radio(&self) {
        loop {
            let read = {
                let Ok(mut radio) = self
                    .lock_within(&self.radio, self.config.radio_rx_lock_timeout, "radio")
                    .await
                else {
                    // transmitter or profile switch holds the radio, try again
                    self.rx_signal.notify_one();
                    return;
                };
                let read = radio.read_packet().await;
                if !matches!(read, Err(TransportError::NoPacket)) {
                    if let Err(e) = radio.start_receive().await {
                        warn!("Radio did not resume receive: {}", e);
                    }
                }
                read
            };

            match read {
                Ok(packet) => self.dispatch(packet).await,
                Err(TransportError::NoPacket) => return,
                Err(TransportError::Integrity) => {
                    LinkStats::bump(&self.stats.rx_errors);
                    debug!("Dropped frame with bad CRC");
                }
                Err(e) => {
                    LinkStats::bump(&self.stats.rx_errors);
                    warn!("Radio read failed: {}", e);
                    return;
                }
            }
        }
    }

    pub(crate) async fn dispatch(&self, packet: ReceivedPacket) {
        let frame = match Frame::decode(&packet.data) {
            Ok(frame) => frame,
            Err(e) => {
                LinkStats::bump(&self.stats.rx_errors);
                debug!("Rejected {} byte frame: {}", packet.data.len(), e);
                return;
            }
        };

        let own = self.address();
        let sender = frame.header.sender;
        let receiver = frame.header.receiver;
        if sender == own {
            LinkStats::bump(&self.stats.rx_errors);
            debug!("Rejected frame {} carrying our own address", frame.id());
            return;
        }
        if receiver != own && !receiver.is_broadcast() {
            LinkStats::bump(&self.stats.foreign_frames);
            return;
        }

        LinkStats::bump(&self.stats.frames_received);
        self.neighbors
            .record_rx(sender, packet.rssi, packet.snr, Instant::now());
        debug!(
            "RX type {} id {} from {} len {} rssi {:.1} snr {:.1}",
            frame.packet_type(),
            frame.id(),
            sender,
            frame.header.payload_len,
            packet.rssi,
            packet.snr
        );

        // ACKs that themselves ask for an ACK are application traffic
        let ack_required = frame.ack_required();
        match frame.packet_type() {
            PacketType::Ack if !ack_required => self.handle_ack(&frame).await,
            PacketType::BulkAck if !ack_required => self.handle_bulk_ack(&frame).await,
            PacketType::ProfileRequest => self.handle_profile_request(&frame).await,
            PacketType::ProfileResponse => self.handle_profile_response(&frame).await,
            _ => self.deliver(frame, packet.rssi, packet.snr).await,
        }
    }

    async fn handle_ack(&self, frame: &Frame) {
        let id = match decode_ack(&frame.payload) {
            Ok(id) => id,
            Err(e) => {
                LinkStats::bump(&self.stats.rx_errors);
                debug!("Malformed ACK from {}: {}", frame.header.sender, e);
                return;
            }
        };
        let Ok(mut pending) = self
            .lock_within(&self.pending, self.config.pending_lock_timeout, "pending")
            .await
        else {
            return;
        };
        let outcome = process_ack(&mut pending, id);
        drop(pending);
        self.record_ack(outcome, frame.header.sender);
    }

    async fn handle_bulk_ack(&self, frame: &Frame) {
        let batch = match BulkAck::decode(&frame.payload) {
            Ok(batch) => batch,
            Err(e) => {
                LinkStats::bump(&self.stats.rx_errors);
                debug!("Malformed bulk ACK from {}: {}", frame.header.sender, e);
                return;
            }
        };
        let Ok(mut pending) = self
            .lock_within(&self.pending, self.config.pending_lock_timeout, "pending")
            .await
        else {
            return;
        };
        let outcomes = process_bulk_ack(&mut pending, &batch);
        drop(pending);
        for outcome in outcomes {
            self.record_ack(outcome, frame.header.sender);
        }
    }

    fn record_ack(&self, outcome: AckOutcome, from: Address) {
        match outcome {
            AckOutcome::Matched { id, original_type } => {
                LinkStats::bump(&self.stats.acks_matched);
                debug!("ACK for {} (type {}) from {}", id, original_type, from);
                self.emit(LinkEvent::Acked {
                    id,
                    from,
                    original_type,
                });
            }
            AckOutcome::Unmatched(id) => {
                LinkStats::bump(&self.stats.duplicate_acks);
                debug!("ACK for {} from {} matches nothing pending", id, from);
            }
        }
    }

    async fn handle_profile_request(&self, frame: &Frame) {
        let sender = frame.header.sender;
        let requested = match decode_profile_index(&frame.payload) {
            Ok(index) => index,
            Err(e) => {
                LinkStats::bump(&self.stats.rx_errors);
                debug!("Malformed ASA request from {}: {}", sender, e);
                return;
            }
        };
        let current = self.link_state().profile;

        match Negotiation::classify_request(requested, current) {
            RequestAction::AlreadyActive => {
                info!("ASA request from {} for profile {}: already active", sender, requested);
            }
            RequestAction::Invalid(index) => {
                warn!("ASA request from {} for unknown profile {} ignored", sender, index);
            }
            RequestAction::Respond(target) => {
                // the response goes out on the current profile, the switch waits
                if let Err(e) = self
                    .send_control(sender, PacketType::ProfileResponse, encode_profile_index(target))
                    .await
                {
                    warn!("ASA response to {} not queued: {}", sender, e);
                    return;
                }
                if let Ok(mut negotiation) = self
                    .lock_within(&self.negotiation, self.config.negotiation_lock_timeout, "negotiation")
                    .await
                {
                    negotiation.record_response_sent(target, Instant::now());
                }
                info!(
                    "ASA request from {}: switching {} -> {} in {:?}",
                    sender, current, target, self.config.asa_switch_delay
                );
                self.emit(LinkEvent::SwitchScheduled { target });
            }
        }
    }

    async fn handle_profile_response(&self, frame: &Frame) {
        let sender = frame.header.sender;
        let target = match decode_profile_index(&frame.payload) {
            Ok(index) => index,
            Err(e) => {
                LinkStats::bump(&self.stats.rx_errors);
                debug!("Malformed ASA response from {}: {}", sender, e);
                return;
            }
        };
        if target == self.link_state().profile {
            info!("ASA response from {}: profile {} already active", sender, target);
            return;
        }
        if let Ok(mut negotiation) = self
            .lock_within(&self.negotiation, self.config.negotiation_lock_timeout, "negotiation")
            .await
        {
            negotiation.record_response_received(target, Instant::now());
        }
        info!("ASA response from {}: switching to profile {}", sender, target);
        self.emit(LinkEvent::SwitchScheduled { target });
    }

    async fn deliver(&self, frame: Frame, rssi: f32, snr: f32) {
        let sender = frame.header.sender;
        let id = frame.id();
        let urgent = frame.is_high_priority();
        if frame.ack_required() {
            self.queue_ack(sender, id, urgent).await;
        }

        let inbound = InboundFrame { frame, rssi, snr };
        let delivered = if urgent {
            self.inbound
                .push_front(inbound, self.config.inbound_front_wait)
                .await
        } else {
            self.inbound
                .push_back(inbound, self.config.inbound_back_wait)
                .await
        };
        if delivered.is_err() {
            LinkStats::bump(&self.stats.inbound_dropped);
            warn!("Inbound queue full, frame {} from {} dropped", id, sender);
        }
    }

    async fn queue_ack(&self, peer: Address, id: PacketId, urgent: bool) {
        let max_wait = self.link_state().retry.bulk_ack_max_wait;
        let batch = {
            let Ok(mut buffers) = self
                .lock_within(&self.bulk_acks, self.config.negotiation_lock_timeout, "bulk ack")
                .await
            else {
                warn!("ACK for {} to {} lost: bulk ACK buffer busy", id, peer);
                return;
            };
            let now = Instant::now();
            match buffers.add(peer, id, now, max_wait) {
                Some(batch) => Some(batch),
                None if urgent => buffers.flush(peer, now),
                None => None,
            }
        };
        if let Some(batch) = batch {
            self.send_ack_batch(peer, batch).await;
        }
    }
}
