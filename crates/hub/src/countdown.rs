//! The single pending auto-action timer of a controller session.
//!
//! There is never more than one [`PendingTimer`]: arming replaces whatever
//! was armed before. The session loop sleeps until [`Countdown::deadline`];
//! cancelling is just clearing the slot, and a wake-up for a timer that is
//! no longer armed finds nothing to take.

use std::time::Duration;
use tokio::time::Instant;

use crate::store::GateAction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingTimer {
    pub target: GateAction,
    pub armed_at: Instant,
    pub duration: Duration,
}

impl PendingTimer {
    pub fn deadline(&self) -> Instant {
        self.armed_at + self.duration
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.deadline().saturating_duration_since(now)
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.deadline()
    }
}

#[derive(Debug, Default)]
pub struct Countdown {
    pending: Option<PendingTimer>,
}

impl Countdown {
    /// Arm a new timer, returning the one it replaced (if any).
    pub fn arm(
        &mut self,
        target: GateAction,
        duration: Duration,
        now: Instant,
    ) -> Option<PendingTimer> {
        self.pending.replace(PendingTimer {
            target,
            armed_at: now,
            duration,
        })
    }

    pub fn cancel(&mut self) -> Option<PendingTimer> {
        self.pending.take()
    }

    /// Cancel only when the armed timer targets `action`.
    pub fn cancel_if(&mut self, action: GateAction) -> bool {
        if self.target() == Some(action) {
            self.pending = None;
            true
        } else {
            false
        }
    }

    /// Take the timer if it has elapsed.
    pub fn take_due(&mut self, now: Instant) -> Option<PendingTimer> {
        if self.pending.is_some_and(|p| p.is_due(now)) {
            self.pending.take()
        } else {
            None
        }
    }

    pub fn pending(&self) -> Option<&PendingTimer> {
        self.pending.as_ref()
    }

    pub fn target(&self) -> Option<GateAction> {
        self.pending.map(|p| p.target)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.pending.map(|p| p.deadline())
    }

    pub fn is_armed(&self) -> bool {
        self.pending.is_some()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const DELAY: Duration = Duration::from_secs(30);

    #[test]
    fn arm_replaces_previous_timer() {
        let now = Instant::now();
        let mut c = Countdown::default();
        assert!(c.arm(GateAction::Open, DELAY, now).is_none());
        let prev = c.arm(GateAction::Close, DELAY, now).unwrap();
        assert_eq!(prev.target, GateAction::Open);
        assert_eq!(c.target(), Some(GateAction::Close));
    }

    #[test]
    fn cancel_if_only_matching_target() {
        let now = Instant::now();
        let mut c = Countdown::default();
        c.arm(GateAction::Open, DELAY, now);
        assert!(!c.cancel_if(GateAction::Close));
        assert!(c.is_armed());
        assert!(c.cancel_if(GateAction::Open));
        assert!(!c.is_armed());
    }

    #[test]
    fn take_due_before_deadline_keeps_timer() {
        let armed_at = Instant::now();
        let mut c = Countdown::default();
        c.arm(GateAction::Open, DELAY, armed_at);
        assert!(c.take_due(armed_at + Duration::from_secs(29)).is_none());
        assert!(c.is_armed());
    }

    #[test]
    fn take_due_at_deadline_empties_slot() {
        let armed_at = Instant::now();
        let mut c = Countdown::default();
        c.arm(GateAction::Open, DELAY, armed_at);
        let t = c.take_due(armed_at + DELAY).unwrap();
        assert_eq!(t.target, GateAction::Open);
        assert!(c.pending().is_none());
    }

    #[test]
    fn remaining_saturates_at_zero() {
        let armed_at = Instant::now();
        let mut c = Countdown::default();
        c.arm(GateAction::Close, DELAY, armed_at);
        let p = *c.pending().unwrap();
        assert_eq!(p.remaining(armed_at + Duration::from_secs(10)), Duration::from_secs(20));
        assert_eq!(p.remaining(armed_at + Duration::from_secs(90)), Duration::ZERO);
    }
}
