//! Per-peer recovery state machine.
//!
//! [`ReconnectionController::step`] is pure: it takes the peer's current
//! [`ReconnectRecord`] and one input and returns the next record plus the effects
//! the session must carry out (arm or cancel the peer's recovery timer, send an
//! ICE-restart offer, or give up on the peer).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::connection::LinkHealth;

/// `min(base * factor^n, cap)` in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base_ms: u64,
    pub factor: f64,
    pub cap_ms: u64,
}

impl Backoff {
    pub const fn new(base_ms: u64, factor: f64, cap_ms: u64) -> Self {
        Self {
            base_ms,
            factor,
            cap_ms,
        }
    }

    pub fn delay(&self, n: u32) -> Duration {
        let raw = self.base_ms as f64 * self.factor.powi(n as i32);
        Duration::from_millis(raw.min(self.cap_ms as f64) as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecoveryPolicy {
    pub max_attempts: u32,
    /// How long a `disconnected` link may self-heal before recovery starts.
    pub grace: Duration,
    /// Recheck delay after an ICE-restart offer went out.
    pub offer_backoff: Backoff,
    /// Retry delay after creating the restart offer itself failed.
    pub failure_backoff: Backoff,
}

/// What the pending recovery timer will do when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecoveryCheck {
    /// End of the disconnected grace period.
    Grace,
    /// Backoff after a restart offer was sent.
    Recheck,
    /// Backoff after the restart offer could not be created.
    Retry,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconnectRecord {
    pub attempts: u32,
    pub pending: Option<RecoveryCheck>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryInput {
    Health(LinkHealth),
    TimerFired(RecoveryCheck, LinkHealth),
    OfferSent,
    OfferFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryEffect {
    Schedule(RecoveryCheck, Duration),
    CancelTimer,
    /// Renegotiate with an ICE-restart offer; `attempt` is 1-based.
    IceRestart { attempt: u32 },
    GiveUp { attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct ReconnectionController {
    policy: RecoveryPolicy,
}

impl ReconnectionController {
    pub fn new(policy: RecoveryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RecoveryPolicy {
        &self.policy
    }

    pub fn step(
        &self,
        mut record: ReconnectRecord,
        input: RecoveryInput,
    ) -> (ReconnectRecord, Vec<RecoveryEffect>) {
        let mut effects = Vec::new();
        match input {
            RecoveryInput::Health(LinkHealth::Connected) => {
                record.attempts = 0;
                if record.pending.take().is_some() {
                    effects.push(RecoveryEffect::CancelTimer);
                }
            }
            RecoveryInput::Health(LinkHealth::Disconnected) => {
                if record.pending.is_none() {
                    record.pending = Some(RecoveryCheck::Grace);
                    effects.push(RecoveryEffect::Schedule(RecoveryCheck::Grace, self.policy.grace));
                }
            }
            RecoveryInput::Health(LinkHealth::Failed) => match record.pending {
                // A restart is already in flight; its recheck decides what happens next.
                Some(RecoveryCheck::Recheck) | Some(RecoveryCheck::Retry) => {}
                Some(RecoveryCheck::Grace) => {
                    record.pending = None;
                    effects.push(RecoveryEffect::CancelTimer);
                    self.attempt(&mut record, &mut effects);
                }
                None => self.attempt(&mut record, &mut effects),
            },
            RecoveryInput::Health(LinkHealth::Pending) | RecoveryInput::Health(LinkHealth::Closed) => {}
            RecoveryInput::TimerFired(check, health) => {
                if record.pending != Some(check) {
                    return (record, effects);
                }
                record.pending = None;
                let retry = match check {
                    RecoveryCheck::Grace | RecoveryCheck::Recheck => health.is_degraded(),
                    RecoveryCheck::Retry => true,
                };
                if retry {
                    self.attempt(&mut record, &mut effects);
                }
            }
            RecoveryInput::OfferSent => {
                let n = record.attempts.saturating_sub(1);
                record.pending = Some(RecoveryCheck::Recheck);
                effects.push(RecoveryEffect::Schedule(
                    RecoveryCheck::Recheck,
                    self.policy.offer_backoff.delay(n),
                ));
            }
            RecoveryInput::OfferFailed => {
                let n = record.attempts.saturating_sub(1);
                record.pending = Some(RecoveryCheck::Retry);
                effects.push(RecoveryEffect::Schedule(
                    RecoveryCheck::Retry,
                    self.policy.failure_backoff.delay(n),
                ));
            }
        }
        (record, effects)
    }

    fn attempt(&self, record: &mut ReconnectRecord, effects: &mut Vec<RecoveryEffect>) {
        if record.attempts >= self.policy.max_attempts {
            effects.push(RecoveryEffect::GiveUp {
                attempts: record.attempts,
            });
            return;
        }
        record.attempts += 1;
        effects.push(RecoveryEffect::IceRestart {
            attempt: record.attempts,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;

    fn controller() -> ReconnectionController {
        ReconnectionController::new(SessionConfig::default().recovery)
    }

    #[test]
    fn offer_backoff_grows_and_caps() {
        let backoff = Backoff::new(2000, 1.5, 8000);
        let delays: Vec<u64> = (0..6).map(|n| backoff.delay(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![2000, 3000, 4500, 6750, 8000, 8000]);
    }

    #[test]
    fn failure_backoff_grows_and_caps() {
        let backoff = Backoff::new(1000, 2.0, 10000);
        let delays: Vec<u64> = (0..6).map(|n| backoff.delay(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 10000, 10000]);
    }

    #[test]
    fn disconnect_is_debounced() {
        let c = controller();
        let (record, effects) = c.step(
            ReconnectRecord::default(),
            RecoveryInput::Health(LinkHealth::Disconnected),
        );
        assert_eq!(
            effects,
            vec![RecoveryEffect::Schedule(RecoveryCheck::Grace, Duration::from_secs(3))]
        );
        let (record, effects) = c.step(record, RecoveryInput::Health(LinkHealth::Disconnected));
        assert!(effects.is_empty());
        assert_eq!(record.pending, Some(RecoveryCheck::Grace));
    }

    #[test]
    fn self_healed_link_cancels_grace() {
        let c = controller();
        let (record, _) = c.step(
            ReconnectRecord::default(),
            RecoveryInput::Health(LinkHealth::Disconnected),
        );
        let (record, effects) = c.step(record, RecoveryInput::Health(LinkHealth::Connected));
        assert_eq!(effects, vec![RecoveryEffect::CancelTimer]);
        assert_eq!(record, ReconnectRecord::default());
    }

    #[test]
    fn grace_expiry_restarts_only_if_still_degraded() {
        let c = controller();
        let record = ReconnectRecord {
            attempts: 0,
            pending: Some(RecoveryCheck::Grace),
        };
        let (_, effects) = c.step(
            record,
            RecoveryInput::TimerFired(RecoveryCheck::Grace, LinkHealth::Pending),
        );
        assert!(effects.is_empty());

        let (record, effects) = c.step(
            record,
            RecoveryInput::TimerFired(RecoveryCheck::Grace, LinkHealth::Disconnected),
        );
        assert_eq!(effects, vec![RecoveryEffect::IceRestart { attempt: 1 }]);
        assert_eq!(record.attempts, 1);
    }

    #[test]
    fn failure_restarts_immediately() {
        let c = controller();
        let (record, effects) = c.step(
            ReconnectRecord::default(),
            RecoveryInput::Health(LinkHealth::Failed),
        );
        assert_eq!(effects, vec![RecoveryEffect::IceRestart { attempt: 1 }]);
        let (record, effects) = c.step(record, RecoveryInput::OfferSent);
        assert_eq!(
            effects,
            vec![RecoveryEffect::Schedule(RecoveryCheck::Recheck, Duration::from_millis(2000))]
        );
        // The second signal reporting failure while a recheck is pending is a no-op.
        let (_, effects) = c.step(record, RecoveryInput::Health(LinkHealth::Failed));
        assert!(effects.is_empty());
    }

    #[test]
    fn failure_during_grace_cancels_it() {
        let c = controller();
        let record = ReconnectRecord {
            attempts: 0,
            pending: Some(RecoveryCheck::Grace),
        };
        let (record, effects) = c.step(record, RecoveryInput::Health(LinkHealth::Failed));
        assert_eq!(
            effects,
            vec![RecoveryEffect::CancelTimer, RecoveryEffect::IceRestart { attempt: 1 }]
        );
        assert_eq!(record.pending, None);
    }

    #[test]
    fn attempts_never_exceed_max() {
        let c = controller();
        let mut record = ReconnectRecord::default();
        let mut restarts = 0;
        let mut gave_up = 0;
        let (next, mut effects) = c.step(record, RecoveryInput::Health(LinkHealth::Failed));
        record = next;
        for _ in 0..20 {
            let mut follow_up = None;
            for effect in effects.drain(..) {
                match effect {
                    RecoveryEffect::IceRestart { .. } => {
                        restarts += 1;
                        follow_up = Some(RecoveryInput::OfferSent);
                    }
                    RecoveryEffect::Schedule(check, _) => {
                        follow_up = Some(RecoveryInput::TimerFired(check, LinkHealth::Failed));
                    }
                    RecoveryEffect::GiveUp { attempts } => {
                        assert_eq!(attempts, 5);
                        gave_up += 1;
                    }
                    RecoveryEffect::CancelTimer => {}
                }
            }
            assert!(record.attempts <= 5);
            let Some(input) = follow_up else { break };
            let (next, more) = c.step(record, input);
            record = next;
            effects = more;
        }
        assert_eq!(restarts, 5);
        assert_eq!(gave_up, 1);
    }

    #[test]
    fn offer_failure_retries_without_state_check() {
        let c = controller();
        let record = ReconnectRecord {
            attempts: 2,
            pending: None,
        };
        let (record, effects) = c.step(record, RecoveryInput::OfferFailed);
        assert_eq!(
            effects,
            vec![RecoveryEffect::Schedule(RecoveryCheck::Retry, Duration::from_millis(2000))]
        );
        let (_, effects) = c.step(
            record,
            RecoveryInput::TimerFired(RecoveryCheck::Retry, LinkHealth::Pending),
        );
        assert_eq!(effects, vec![RecoveryEffect::IceRestart { attempt: 3 }]);
    }

    #[test]
    fn stale_timer_is_ignored() {
        let c = controller();
        let (record, effects) = c.step(
            ReconnectRecord::default(),
            RecoveryInput::TimerFired(RecoveryCheck::Recheck, LinkHealth::Failed),
        );
        assert!(effects.is_empty());
        assert_eq!(record, ReconnectRecord::default());
    }
}
