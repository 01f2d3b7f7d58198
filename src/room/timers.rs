use std::collections::HashMap;

use tokio::time::Instant;

use crate::reconnect::RecoveryCheck;
use crate::signaling::PeerId;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKey {
    Heartbeat,
    /// Next quality sample for a peer; the first one fires after the start delay.
    Quality(PeerId),
    Recovery(PeerId, RecoveryCheck),
}

impl TimerKey {
    fn peer(&self) -> Option<&str> {
        match self {
            TimerKey::Heartbeat => None,
            TimerKey::Quality(peer_id) | TimerKey::Recovery(peer_id, _) => Some(peer_id),
        }
    }
}

/// Deadlines owned by the session task. Each key is armed at most once, so
/// re-arming replaces the previous deadline, and cancelling is a plain removal.
#[derive(Debug, Default)]
pub struct TimerTable {
    deadlines: HashMap<TimerKey, Instant>,
}

impl TimerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, key: TimerKey, deadline: Instant) {
        self.deadlines.insert(key, deadline);
    }

    /// Arms a recovery timer, replacing whichever one the peer had pending.
    pub fn arm_recovery(&mut self, peer_id: &str, check: RecoveryCheck, deadline: Instant) {
        self.cancel_recovery(peer_id);
        self.arm(TimerKey::Recovery(peer_id.to_string(), check), deadline);
    }

    pub fn cancel(&mut self, key: &TimerKey) -> bool {
        self.deadlines.remove(key).is_some()
    }

    pub fn cancel_recovery(&mut self, peer_id: &str) {
        self.deadlines
            .retain(|key, _| !matches!(key, TimerKey::Recovery(peer, _) if peer == peer_id));
    }

    /// Drops every timer that belongs to `peer_id`.
    pub fn cancel_peer(&mut self, peer_id: &str) {
        self.deadlines.retain(|key, _| key.peer() != Some(peer_id));
    }

    pub fn clear(&mut self) {
        self.deadlines.clear();
    }

    pub fn is_armed(&self, key: &TimerKey) -> bool {
        self.deadlines.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Removes and returns the earliest timer due at `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<TimerKey> {
        let key = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .min_by_key(|(_, deadline)| **deadline)
            .map(|(key, _)| key.clone())?;
        self.deadlines.remove(&key);
        Some(key)
    }
}
