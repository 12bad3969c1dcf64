//! ASA (adaptive symmetric agreement) negotiation state.
//!
//! The responder answers a request on its current profile and only then
//! schedules the switch; the initiator schedules the same switch when the
//! response arrives. Each side applies the switch once the switch delay has
//! passed since its own handshake event, so the response is never sent on a
//! modulation the initiator is not listening on.

use crate::profile::PROFILE_COUNT;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// What to do with an incoming negotiation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestAction {
    /// Requested profile is already active
    AlreadyActive,
    /// Reply and schedule a switch to this profile
    Respond(u8),
    /// Index outside the profile table
    Invalid(u8),
}

/// Timer decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Nothing scheduled
    Idle,
    /// Switch scheduled, delay not yet elapsed
    Waiting,
    /// Switch now; state has been cleared
    Switch(u8),
    /// Scheduled target was invalid; state has been cleared
    Invalid(u8),
}

/// Externally visible negotiation phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "target", rename_all = "snake_case")]
pub enum NegotiationPhase {
    /// No negotiation in progress
    Idle,
    /// Request sent, no response yet
    RequestSent(u8),
    /// Handshake complete, switch pending
    SwitchScheduled(u8),
    /// Negotiation state held by another task past the lock bound
    Busy,
}

#[derive(Debug, Clone, Copy)]
struct ScheduledSwitch {
    target: u8,
    response_sent: Option<Instant>,
    response_received: Option<Instant>,
}

impl ScheduledSwitch {
    fn last_event(&self) -> Option<Instant> {
        match (self.response_sent, self.response_received) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Negotiation state for one node
#[derive(Debug, Default)]
pub struct Negotiation {
    scheduled: Option<ScheduledSwitch>,
    request: Option<(u8, Instant)>,
}

impl Negotiation {
    /// Idle state
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify a request against the active profile
    pub fn classify_request(requested: u8, current: u8) -> RequestAction {
        if requested as usize >= PROFILE_COUNT {
            RequestAction::Invalid(requested)
        } else if requested == current {
            RequestAction::AlreadyActive
        } else {
            RequestAction::Respond(requested)
        }
    }

    /// Initiator: a request for `target` went out
    pub fn record_request(&mut self, target: u8, now: Instant) {
        self.request = Some((target, now));
    }

    /// Responder: the response for `target` has been queued
    pub fn record_response_sent(&mut self, target: u8, now: Instant) {
        self.schedule(target).response_sent = Some(now);
    }

    /// Initiator: a response naming `target` arrived
    pub fn record_response_received(&mut self, target: u8, now: Instant) {
        self.request = None;
        self.schedule(target).response_received = Some(now);
    }

    fn schedule(&mut self, target: u8) -> &mut ScheduledSwitch {
        let switch = self.scheduled.get_or_insert(ScheduledSwitch {
            target,
            response_sent: None,
            response_received: None,
        });
        switch.target = target;
        switch
    }

    /// Current phase. Requests older than `request_timeout` count as idle.
    pub fn phase(&self, now: Instant, request_timeout: Duration) -> NegotiationPhase {
        if let Some(switch) = &self.scheduled {
            return NegotiationPhase::SwitchScheduled(switch.target);
        }
        match self.request {
            Some((target, at)) if now.saturating_duration_since(at) <= request_timeout => {
                NegotiationPhase::RequestSent(target)
            }
            _ => NegotiationPhase::Idle,
        }
    }

    /// Timer tick. Clears the state when it returns `Switch` or `Invalid`.
    pub fn poll(&mut self, now: Instant, delay: Duration) -> PollOutcome {
        let Some(switch) = self.scheduled else {
            return PollOutcome::Idle;
        };

        if switch.target as usize >= PROFILE_COUNT {
            self.scheduled = None;
            return PollOutcome::Invalid(switch.target);
        }

        let Some(last) = switch.last_event() else {
            self.scheduled = None;
            return PollOutcome::Idle;
        };
        if now.saturating_duration_since(last) <= delay {
            return PollOutcome::Waiting;
        }

        self.scheduled = None;
        self.request = None;
        PollOutcome::Switch(switch.target)
    }
}
