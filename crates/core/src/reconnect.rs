//! Per-peer reconnection bookkeeping.
//!
//! The manager is a pure state machine: it decides *whether* and *when* a
//! peer should be retried, the connection actors own the timers. Each failure
//! class has its own [`ExponentialBackoff`] policy and every peer gets at most
//! [`ReconnectPolicy::max_attempts`] attempts before it is marked permanently
//! failed.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    time::Duration,
};

use rand::{rngs::SmallRng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{types::PeerId, util::backoff::ExponentialBackoff};

/// Why a link needs to be re-established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureReason {
    IpChange,
    ConnectionLost,
    IceFailed,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::IpChange => f.write_str("ip-change"),
            FailureReason::ConnectionLost => f.write_str("connection-lost"),
            FailureReason::IceFailed => f.write_str("ice-failed"),
        }
    }
}

/// Backoff parameters for every failure class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub connection_lost: ExponentialBackoff,
    pub ice_failed: ExponentialBackoff,
    pub ip_change: ExponentialBackoff,
}

impl ReconnectPolicy {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
    pub const DEFAULT_BASE: Duration = Duration::from_secs(1);
    pub const DEFAULT_IP_CHANGE_BASE: Duration = Duration::from_secs(2);
    pub const DEFAULT_CAP: Duration = Duration::from_secs(30);
    pub const DEFAULT_JITTER_PERCENT: u32 = 10;

    pub fn backoff(&self, reason: FailureReason) -> &ExponentialBackoff {
        match reason {
            FailureReason::ConnectionLost => &self.connection_lost,
            FailureReason::IceFailed => &self.ice_failed,
            FailureReason::IpChange => &self.ip_change,
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        let standard = ExponentialBackoff::new(Self::DEFAULT_BASE, Self::DEFAULT_CAP)
            .with_jitter(Self::DEFAULT_JITTER_PERCENT);
        Self {
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            connection_lost: standard.clone(),
            ice_failed: standard,
            ip_change: ExponentialBackoff::new(Self::DEFAULT_IP_CHANGE_BASE, Self::DEFAULT_CAP)
                .with_jitter(Self::DEFAULT_JITTER_PERCENT),
        }
    }
}

/// An in-flight reconnection sequence for one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectionAttempt {
    pub peer: PeerId,
    pub reason: FailureReason,
    pub attempt: u32,
    pub max_attempts: u32,
    pub started_at: Instant,
}

/// Emitted when a peer exhausts its attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermanentFailure {
    pub peer: PeerId,
    pub reason: FailureReason,
    pub attempts: u32,
}

#[derive(Debug)]
pub struct ReconnectionManager {
    attempts: HashMap<PeerId, ReconnectionAttempt>,
    permanently_failed: HashSet<PeerId>,
    policy: ReconnectPolicy,
    rng: SmallRng,
}

impl Default for ReconnectionManager {
    fn default() -> Self {
        Self::new(ReconnectPolicy::default())
    }
}

impl ReconnectionManager {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            attempts: HashMap::new(),
            permanently_failed: HashSet::new(),
            policy,
            rng: SmallRng::from_entropy(),
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Whether another attempt may be started for `peer`.
    ///
    /// Every failure reason is retryable until the attempt ceiling is hit.
    pub fn should_retry(&self, peer: &PeerId, reason: FailureReason) -> bool {
        if self.permanently_failed.contains(peer) {
            tracing::debug!(%peer, %reason, "Peer permanently failed, not retrying");
            return false;
        }
        self.attempts
            .get(peer)
            .map_or(true, |state| state.attempt < state.max_attempts)
    }

    /// Starts the next attempt for `peer` and returns its 1-based number.
    ///
    /// The reason of the most recent failure wins, so an IP change during a
    /// connection-lost sequence switches to the IP change schedule.
    pub fn begin_attempt(&mut self, peer: &PeerId, reason: FailureReason) -> u32 {
        let max_attempts = self.policy.max_attempts;
        let state = self
            .attempts
            .entry(peer.clone())
            .or_insert_with(|| ReconnectionAttempt {
                peer: peer.clone(),
                reason,
                attempt: 0,
                max_attempts,
                started_at: Instant::now(),
            });
        state.reason = reason;
        state.attempt = (state.attempt + 1).min(state.max_attempts);
        tracing::debug!(
            %peer,
            %reason,
            attempt = state.attempt,
            max_attempts = state.max_attempts,
            "Reconnection attempt started"
        );
        state.attempt
    }

    /// Clears every trace of failure for `peer`. Calling it again is a no-op.
    pub fn mark_success(&mut self, peer: &PeerId) {
        let had_attempt = self.attempts.remove(peer).is_some();
        let was_failed = self.permanently_failed.remove(peer);
        if had_attempt || was_failed {
            tracing::debug!(%peer, "Reconnection state cleared");
        }
    }

    /// Records that the current attempt for `peer` failed.
    ///
    /// At the ceiling the peer becomes permanently failed and the returned
    /// value must be surfaced to the caller; below it nothing changes and the
    /// next [`Self::begin_attempt`] continues the sequence.
    pub fn mark_failure(&mut self, peer: &PeerId) -> Option<PermanentFailure> {
        let state = self.attempts.get(peer)?;
        if state.attempt < state.max_attempts {
            return None;
        }
        let state = self.attempts.remove(peer)?;
        self.permanently_failed.insert(peer.clone());
        tracing::warn!(
            %peer,
            reason = %state.reason,
            attempts = state.attempt,
            "Peer permanently failed"
        );
        Some(PermanentFailure {
            peer: state.peer,
            reason: state.reason,
            attempts: state.attempt,
        })
    }

    /// Deterministic, jitter-free delay for the given attempt of a failure class.
    pub fn base_delay_for(&self, reason: FailureReason, attempt: u32) -> Duration {
        self.policy.backoff(reason).delay_for_attempt(attempt)
    }

    /// Delay to wait before running `attempt`, including jitter.
    pub fn delay_for(&mut self, reason: FailureReason, attempt: u32) -> Duration {
        let backoff = self.policy.backoff(reason).clone();
        backoff.jittered_delay_for_attempt(attempt, &mut self.rng)
    }

    pub fn current(&self, peer: &PeerId) -> Option<&ReconnectionAttempt> {
        self.attempts.get(peer)
    }

    pub fn has_active_attempt(&self, peer: &PeerId) -> bool {
        self.attempts.contains_key(peer)
    }

    pub fn is_permanently_failed(&self, peer: &PeerId) -> bool {
        self.permanently_failed.contains(peer)
    }

    /// Peers that exhausted their attempts, in no particular order.
    pub fn permanently_failed(&self) -> impl Iterator<Item = &PeerId> {
        self.permanently_failed.iter()
    }

    /// External trigger (force reconnect, fresh offer): forget everything
    /// about `peer` so a new sequence can start from attempt 1.
    pub fn reset(&mut self, peer: &PeerId) {
        self.mark_success(peer);
    }

    /// Drops all state, used on force-reconnect and teardown.
    pub fn clear(&mut self) {
        self.attempts.clear();
        self.permanently_failed.clear();
    }
}
