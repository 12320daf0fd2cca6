use std::time::Duration;

use crate::error::DisconnectReason;

/// Fixed delay between automatic reconnection attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// What the session should do about a lost connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconnectDecision {
    RetryAfter(Duration),
    /// Hold the retry until connectivity comes back.
    RetryWhenOnline,
    Stay,
}

/// Decides whether a dropped connection should be retried. Purely a state
/// machine; the session owns the clock and the actual dialing.
#[derive(Debug, Default)]
pub struct ReconnectionController {
    pending: bool,
    waiting_for_network: bool,
}

impl ReconnectionController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only transport-level losses are retried. Rejections, removals and
    /// application errors terminate the session for good.
    pub fn on_disconnected(
        &mut self,
        reason: Option<DisconnectReason>,
        auto_reconnect: bool,
        online: bool,
    ) -> ReconnectDecision {
        if !auto_reconnect || reason != Some(DisconnectReason::ConnectionError) {
            self.pending = false;
            self.waiting_for_network = false;
            return ReconnectDecision::Stay;
        }

        self.pending = true;
        if online {
            self.waiting_for_network = false;
            ReconnectDecision::RetryAfter(RECONNECT_DELAY)
        } else {
            self.waiting_for_network = true;
            ReconnectDecision::RetryWhenOnline
        }
    }

    /// Returns true when a deferred retry should fire now.
    pub fn on_connectivity_restored(&mut self) -> bool {
        if self.pending && self.waiting_for_network {
            self.waiting_for_network = false;
            true
        } else {
            false
        }
    }

    /// A user-initiated disconnect or a successful connection cancels any
    /// pending retry.
    pub fn cancel(&mut self) {
        self.pending = false;
        self.waiting_for_network = false;
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }
}
