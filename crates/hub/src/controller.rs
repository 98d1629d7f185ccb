//! Hysteresis auto-control: turns each valid snapshot into gate decisions.
//!
//! ## Control states
//!
//! ```text
//!            [dry & empty, gate closed, open limit clear]
//!  Normal ─────────────────────────────────────────────▶ ArmedOpen
//!    ▲  ▲                                                    │
//!    │  └──[condition gone | manual action | fired]──────────┘
//!    │
//!    │     [full & gate open, close limit clear]
//!    └──────────────────────────────────────────────────▶ ArmedClose
//!          ◀──[condition gone | manual action | fired]──
//! ```
//!
//! The armed state *is* the session countdown: `ArmedOpen` means a timer
//! targeting `open` is pending. The controller is synchronous; it mutates
//! the session's [`GateState`] and returns [`Effect`]s for the session to
//! carry out (notifications, ledger writes, the actual command).

use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

use crate::device::SensorSnapshot;
use crate::state::GateState;
use crate::store::GateAction;

/// Soil moisture strictly below this percentage counts as dry.
pub const DEFAULT_DRY_THRESHOLD: f64 = 75.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IrrigationCondition {
    DryEmpty,
    FullOpen,
    Normal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlState {
    Normal,
    ArmedOpen,
    ArmedClose,
}

/// Dry-empty is checked first; full-open only when dry-empty is false.
/// Water level compares by exact equality: anything strictly between 0 and
/// 100 is normal whatever the soil reads.
pub fn classify(snapshot: &SensorSnapshot, dry_threshold: f64) -> IrrigationCondition {
    if snapshot.water_level_percent == 0.0 && snapshot.soil_moisture_percent < dry_threshold {
        IrrigationCondition::DryEmpty
    } else if snapshot.water_level_percent == 100.0 && snapshot.gate_open {
        IrrigationCondition::FullOpen
    } else {
        IrrigationCondition::Normal
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Countdown started toward `action`.
    Armed(GateAction),
    /// Countdown toward `action` cancelled without acting.
    Disarmed(GateAction),
    /// Countdown elapsed; the session must issue `action` as an auto command.
    Fire(GateAction),
    /// The device reports a manual (button) actuation not seen before.
    ManualObserved {
        action: GateAction,
        device_time: String,
    },
    /// The device reports an auto actuation of its own not seen before.
    DeviceAutoObserved {
        action: GateAction,
        device_time: String,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct HysteresisController {
    pub dry_threshold: f64,
    pub auto_delay: Duration,
}

impl HysteresisController {
    pub fn new(dry_threshold: f64, auto_delay: Duration) -> Self {
        Self {
            dry_threshold,
            auto_delay,
        }
    }

    /// The action the current reading asks for, if any. Limit flags veto
    /// their direction.
    fn wanted(&self, snapshot: &SensorSnapshot) -> Option<GateAction> {
        match classify(snapshot, self.dry_threshold) {
            IrrigationCondition::DryEmpty
                if !snapshot.gate_open && !snapshot.open_limit_reached =>
            {
                Some(GateAction::Open)
            }
            IrrigationCondition::FullOpen if !snapshot.close_limit_reached => {
                Some(GateAction::Close)
            }
            _ => None,
        }
    }

    /// Process one snapshot. Snapshots taken while the gate is moving are
    /// ignored entirely.
    pub fn observe(
        &self,
        state: &mut GateState,
        snapshot: &SensorSnapshot,
        now: Instant,
        command_in_flight: bool,
    ) -> Vec<Effect> {
        if snapshot.gate_is_moving {
            return Vec::new();
        }

        let mut effects = Vec::new();

        state.gate_open = snapshot.gate_open;
        state.condition = classify(snapshot, self.dry_threshold);
        state.last_snapshot = Some(snapshot.clone());

        // One-shot: consumed by the first poll after our own command lands.
        let suppress_auto = if command_in_flight {
            state.suppress_next_auto_notification
        } else {
            std::mem::take(&mut state.suppress_next_auto_notification)
        };

        // ── Manual actuation reported by the device ─────────────────
        let mut manual_intervened = false;
        if let (Some(action), Some(t)) = (
            snapshot.manual_action,
            snapshot.manual_action_time.as_deref(),
        ) {
            if state.last_manual_action_time.as_deref() != Some(t) {
                state.last_manual_action_time = Some(t.to_string());
                manual_intervened = true;
                if let Some(p) = state.countdown.cancel() {
                    effects.push(Effect::Disarmed(p.target));
                }
                effects.push(Effect::ManualObserved {
                    action,
                    device_time: t.to_string(),
                });
            }
        }

        // ── Auto actuation reported by the device ───────────────────
        if let (Some(action), Some(t)) =
            (snapshot.auto_action, snapshot.auto_action_time.as_deref())
        {
            if state.last_auto_action_time.as_deref() != Some(t) {
                state.last_auto_action_time = Some(t.to_string());
                if !suppress_auto && !manual_intervened {
                    effects.push(Effect::DeviceAutoObserved {
                        action,
                        device_time: t.to_string(),
                    });
                }
            }
        }

        // A manual action suppresses auto-control for this cycle.
        if manual_intervened {
            return effects;
        }

        // ── Condition → countdown ───────────────────────────────────
        let wanted = self.wanted(snapshot);
        match (state.countdown.target(), wanted) {
            (Some(armed), Some(w)) if armed == w => {
                if let Some(action) = self.fire_if_due(state, now, command_in_flight) {
                    effects.push(Effect::Fire(action));
                }
            }
            (Some(armed), _) => {
                state.countdown.cancel();
                effects.push(Effect::Disarmed(armed));
            }
            (None, Some(w)) => {
                if !command_in_flight {
                    state.countdown.arm(w, self.auto_delay, now);
                    effects.push(Effect::Armed(w));
                }
            }
            (None, None) => {}
        }

        effects
    }

    /// Called when the countdown deadline passes between polls.
    pub fn on_deadline(
        &self,
        state: &mut GateState,
        now: Instant,
        command_in_flight: bool,
    ) -> Option<GateAction> {
        self.fire_if_due(state, now, command_in_flight)
    }

    /// The instant the session should wake for the countdown, or `None` if
    /// nothing can fire before the next poll anyway. An elapsed timer that
    /// cannot fire yet (command in flight, device unreachable) is left to
    /// the poll ticker instead of waking the loop in a spin.
    pub fn next_deadline(
        &self,
        state: &GateState,
        now: Instant,
        command_in_flight: bool,
    ) -> Option<Instant> {
        let deadline = state.countdown.deadline()?;
        if deadline > now || self.can_fire(state, command_in_flight) {
            Some(deadline)
        } else {
            None
        }
    }

    fn can_fire(&self, state: &GateState, command_in_flight: bool) -> bool {
        !command_in_flight && state.device_reachable
    }

    fn fire_if_due(
        &self,
        state: &mut GateState,
        now: Instant,
        command_in_flight: bool,
    ) -> Option<GateAction> {
        if !self.can_fire(state, command_in_flight) {
            return None;
        }
        let timer = state.countdown.take_due(now)?;
        state.suppress_next_auto_notification = true;
        Some(timer.target)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
