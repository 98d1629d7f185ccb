use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::controller::{ControlState, IrrigationCondition};
use crate::countdown::Countdown;
use crate::device::SensorSnapshot;
use crate::store::GateAction;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<GateState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Everything one user's controller session knows between polls. Lost on
/// restart; the durable history lives in the store.
pub struct GateState {
    pub user_id: String,
    pub started_at: Instant,
    /// Last gate position reported by the device or confirmed by a command.
    pub gate_open: bool,
    pub countdown: Countdown,
    pub condition: IrrigationCondition,
    pub last_snapshot: Option<SensorSnapshot>,
    pub last_polled: Option<OffsetDateTime>,
    pub device_reachable: bool,
    /// Set when the hub fires an auto action itself, so the device's echo
    /// of it is not announced a second time.
    pub suppress_next_auto_notification: bool,
    pub last_manual_action_time: Option<String>,
    pub last_auto_action_time: Option<String>,
    pub last_message: Option<String>,
    pub events: VecDeque<SessionEvent>,
}

#[derive(Clone, Serialize)]
pub struct SessionEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Controller,
    Command,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct CountdownStatus {
    pub target: GateAction,
    pub remaining_secs: u64,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub user_id: String,
    pub uptime_secs: u64,
    pub gate_open: bool,
    pub condition: IrrigationCondition,
    pub control_state: ControlState,
    pub countdown: Option<CountdownStatus>,
    pub pending_device_action: Option<GateAction>,
    pub device_reachable: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_polled: Option<OffsetDateTime>,
    pub snapshot: Option<SensorSnapshot>,
    pub last_message: Option<String>,
    pub unseen_notifications: u64,
    pub events: Vec<SessionEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl GateState {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            started_at: Instant::now(),
            gate_open: false,
            countdown: Countdown::default(),
            condition: IrrigationCondition::Normal,
            last_snapshot: None,
            last_polled: None,
            device_reachable: false,
            suppress_next_auto_notification: false,
            last_manual_action_time: None,
            last_auto_action_time: None,
            last_message: None,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared(user_id: &str) -> SharedState {
        Arc::new(RwLock::new(Self::new(user_id)))
    }

    pub fn control_state(&self) -> ControlState {
        match self.countdown.target() {
            None => ControlState::Normal,
            Some(GateAction::Open) => ControlState::ArmedOpen,
            Some(GateAction::Close) => ControlState::ArmedClose,
        }
    }

    /// Record a controller transition (arm, disarm, fire).
    pub fn record_controller(&mut self, detail: String) {
        self.push_event(EventKind::Controller, detail);
    }

    /// Record a command result and make it the message shown to the user.
    pub fn record_command(&mut self, message: String) {
        self.last_message = Some(message.clone());
        self.push_event(EventKind::Command, message);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self, now: Instant, unseen_notifications: u64) -> StatusResponse {
        StatusResponse {
            user_id: self.user_id.clone(),
            uptime_secs: now.saturating_duration_since(self.started_at).as_secs(),
            gate_open: self.gate_open,
            condition: self.condition,
            control_state: self.control_state(),
            countdown: self.countdown.pending().map(|p| CountdownStatus {
                target: p.target,
                remaining_secs: p.remaining(now).as_secs(),
            }),
            pending_device_action: self
                .last_snapshot
                .as_ref()
                .and_then(|s| s.pending_auto_action),
            device_reachable: self.device_reachable,
            last_polled: self.last_polled,
            snapshot: self.last_snapshot.clone(),
            last_message: self.last_message.clone(),
            unseen_notifications,
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SessionEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
