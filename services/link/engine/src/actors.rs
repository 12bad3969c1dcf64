//! Background actors: transmit drain, retry scan, negotiation timer,
//! bulk-ACK timer and automatic profile selection.

use crate::engine::{LinkEvent, Shared};
use crate::negotiation::{NegotiationPhase, PollOutcome};
use crate::pacing::{after_transmit, burst_cooldown, idle_backoff, retry_scan_delay, BURST_LENGTH};
use crate::profile::select_with_hysteresis;
use crate::stats::LinkStats;
use link_wire::Frame;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

impl Shared {
    /// Pop frames and hand them to the radio, pacing between transmissions
    pub(crate) async fn drain_loop(self: Arc<Self>) {
        let mut rng = StdRng::from_entropy();
        let mut burst = 0u32;
        loop {
            match self.outgoing.pop(self.config.drain_wait).await {
                Some(frame) => {
                    let airtime = self.transmit(&frame).await;
                    sleep(after_transmit(airtime)).await;
                    burst += 1;
                    if burst >= BURST_LENGTH {
                        burst = 0;
                        sleep(burst_cooldown(&mut rng)).await;
                    }
                }
                None => {
                    burst = 0;
                    let profile = self.link_state().profile;
                    sleep(idle_backoff(profile, &mut rng)).await;
                }
            }
        }
    }

    /// Transmit one frame and return to receive mode. Returns the time the
    /// radio spent transmitting.
    async fn transmit(&self, frame: &Frame) -> Duration {
        let bytes = frame.encode();
        let Ok(mut radio) = self
            .lock_within(&self.radio, self.config.radio_lock_timeout, "radio")
            .await
        else {
            LinkStats::bump(&self.stats.tx_errors);
            warn!("Radio busy, frame {} (type {}) not sent", frame.id(), frame.packet_type());
            return Duration::ZERO;
        };

        let started = Instant::now();
        let result = radio.transmit(&bytes).await;
        let airtime = started.elapsed();
        if let Err(e) = radio.start_receive().await {
            warn!("Radio did not resume receive after TX: {}", e);
        }
        drop(radio);

        match result {
            Ok(()) => {
                LinkStats::bump(&self.stats.frames_sent);
                self.neighbors.record_tx(frame.header.receiver);
                debug!(
                    "TX type {} id {} to {} len {} in {:?}",
                    frame.packet_type(),
                    frame.id(),
                    frame.header.receiver,
                    bytes.len(),
                    airtime
                );
            }
            Err(e) => {
                LinkStats::bump(&self.stats.tx_errors);
                warn!("TX of frame {} failed: {}", frame.id(), e);
            }
        }
        airtime
    }

    pub(crate) async fn retry_loop(self: Arc<Self>) {
        let mut rng = StdRng::from_entropy();
        loop {
            sleep(retry_scan_delay(
                self.config.retry_scan_base,
                self.config.retry_scan_jitter,
                &mut rng,
            ))
            .await;
            self.retry_scan().await;
        }
    }

    /// Requeue overdue pending frames and drop the exhausted ones
    pub(crate) async fn retry_scan(&self) {
        let retry = self.link_state().retry;
        let Ok(mut pending) = self
            .lock_within(&self.pending, self.config.pending_lock_timeout, "pending")
            .await
        else {
            return;
        };
        let report = pending.sweep(
            Instant::now(),
            retry.retry_timeout,
            retry.max_retries,
            |frame| self.outgoing.try_push_back(frame.clone()).is_ok(),
        );
        drop(pending);

        if !report.resent.is_empty() {
            self.stats
                .retries
                .fetch_add(report.resent.len() as u64, Ordering::Relaxed);
            debug!("Retrying frames {:?}", report.resent);
        }
        if !report.deferred.is_empty() {
            debug!("Outgoing queue busy, retry of {:?} deferred", report.deferred);
        }
        for entry in report.exhausted {
            LinkStats::bump(&self.stats.retry_exhausted);
            warn!(
                "Frame {} (type {}) to {} dropped after {} retries",
                entry.frame.id(),
                entry.frame.packet_type(),
                entry.frame.header.receiver,
                entry.retries
            );
            self.emit(LinkEvent::RetryExhausted {
                id: entry.frame.id(),
                to: entry.frame.header.receiver,
                packet_type: entry.frame.packet_type(),
            });
        }
    }

    /// Apply scheduled switches once the delay has passed
    pub(crate) async fn negotiation_loop(self: Arc<Self>) {
        let mut ticker = interval(self.config.negotiation_poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let outcome = match self
                .lock_within(&self.negotiation, self.config.negotiation_lock_timeout, "negotiation")
                .await
            {
                Ok(mut negotiation) => negotiation.poll(Instant::now(), self.config.asa_switch_delay),
                Err(_) => continue,
            };
            match outcome {
                PollOutcome::Switch(target) => match self.apply_profile(target, None).await {
                    Ok(state) => info!("Negotiated switch complete: {}", state.describe()),
                    Err(e) => warn!("Negotiated switch to profile {} failed: {}", target, e),
                },
                PollOutcome::Invalid(target) => {
                    warn!("Discarded scheduled switch to unknown profile {}", target);
                }
                PollOutcome::Idle | PollOutcome::Waiting => {}
            }
        }
    }

    /// Flush ACK batches that have waited a full interval
    pub(crate) async fn bulk_ack_loop(self: Arc<Self>) {
        let mut ticker = interval(self.config.bulk_ack_poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let flush_interval = self.link_state().retry.bulk_ack_interval;
            let due = match self
                .lock_within(&self.bulk_acks, self.config.negotiation_lock_timeout, "bulk ack")
                .await
            {
                Ok(mut buffers) => buffers.due(Instant::now(), flush_interval),
                Err(_) => continue,
            };
            for (peer, batch) in due {
                self.send_ack_batch(peer, batch).await;
            }
        }
    }

    pub(crate) async fn auto_asa_loop(self: Arc<Self>) {
        loop {
            let period = self.auto_asa.read().await.interval;
            sleep(period).await;
            let settings = *self.auto_asa.read().await;
            if settings.enabled {
                self.auto_select(settings.hysteresis_db).await;
            }
        }
    }

    /// Request a better profile from the default peer when its signal
    /// quality calls for one
    pub(crate) async fn auto_select(&self, hysteresis_db: f32) {
        let state = self.link_state();
        if state.manual_override {
            return;
        }
        // a busy negotiation lock may hide a handshake in flight
        if self.negotiation_phase().await != NegotiationPhase::Idle {
            return;
        }
        let peer = self.config.default_peer;
        let Some(record) = self.neighbors.get(peer) else {
            return;
        };
        if !record.is_active(Instant::now()) {
            return;
        }
        let Some(rssi) = record.rssi_filtered else {
            return;
        };
        if let Some(target) = select_with_hysteresis(rssi, record.last_snr, state.profile, hysteresis_db) {
            info!(
                "Auto ASA: peer {} rssi {:.1} snr {:.1}, profile {} -> {}",
                peer, rssi, record.last_snr, state.profile, target
            );
            if let Err(e) = self.request_profile(peer, target).await {
                warn!("Auto ASA request to {} failed: {}", peer, e);
            }
        }
    }
}
