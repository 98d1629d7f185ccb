//! Paddy field + irrigation gate model behind the simulator's HTTP API.
//!
//! Models just enough physics to drive the hub's controller through all of
//! its conditions:
//! - Water level drains while the gate is closed and fills while it is open
//! - Soil dries once the standing water is gone and soaks back up under water
//! - The gate takes a few seconds to travel and reports `gateIsMoving`
//! - End-stop flags are raised once the gate rests at either end
//! - Physical button presses are reported as `manualAction` events
//!
//! Levels are clamped, so an empty field reads exactly 0 and a full one
//! exactly 100, which is what the controller's conditions test for.

use serde::Serialize;
use std::fmt;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Seconds the gate needs to go from one end to the other.
pub const TRAVEL_SECS: f64 = 4.0;

/// Soil wetting rate while water stands in the field (%/s).
const SOAK_RATE: f64 = 1.5;

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Pre-configured field behaviours selectable via `SIM_SCENARIO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Gate closed, shallow water draining fast and soil drying after it.
    /// Reaches the dry/empty condition within a minute or so.
    Drying,
    /// Gate open with the field almost full. Reaches the full/open
    /// condition within seconds.
    Flooding,
    /// Gate closed, mid-level water, barely moving. Never triggers.
    Stable,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "flooding" => Self::Flooding,
            "stable" => Self::Stable,
            _ => Self::Drying,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drying => write!(f, "drying"),
            Self::Flooding => write!(f, "flooding"),
            Self::Stable => write!(f, "stable"),
        }
    }
}

struct Rates {
    /// Water lost per second with the gate closed (%/s).
    drain: f64,
    /// Water gained per second with the gate open (%/s).
    inflow: f64,
    /// Soil moisture lost per second once the field is empty (%/s).
    dry: f64,
}

impl Scenario {
    fn rates(self) -> Rates {
        match self {
            Self::Drying => Rates { drain: 2.0, inflow: 5.0, dry: 1.5 },
            Self::Flooding => Rates { drain: 0.5, inflow: 3.0, dry: 0.2 },
            Self::Stable => Rates { drain: 0.02, inflow: 1.0, dry: 0.01 },
        }
    }

    /// (water %, soil %, gate open)
    fn start(self) -> (f64, f64, bool) {
        match self {
            Self::Drying => (20.0, 82.0, false),
            Self::Flooding => (88.0, 95.0, true),
            Self::Stable => (50.0, 90.0, false),
        }
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// `GET /data` body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub soil_moisture_percent: f64,
    pub water_level_percent: f64,
    pub gate_open: bool,
    pub gate_is_moving: bool,
    pub pending_auto_action: Option<&'static str>,
    pub auto_action: Option<&'static str>,
    pub auto_action_time: Option<String>,
    pub manual_action: Option<&'static str>,
    pub manual_action_time: Option<String>,
    pub open_limit_reached: bool,
    pub close_limit_reached: bool,
}

/// Answer to `/open` or `/close`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Gate started (or reversed) toward the requested end. HTTP 200.
    Applied,
    /// Gate already there or already heading there. HTTP 202.
    AlreadyThere,
}

impl Reply {
    pub fn status(self) -> u16 {
        match self {
            Self::Applied => 200,
            Self::AlreadyThere => 202,
        }
    }
}

fn action_word(open: bool) -> &'static str {
    if open {
        "open"
    } else {
        "close"
    }
}

/// Event times carry the full date so a press at the same wall-clock
/// second on another day is a different event.
fn event_time(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// Gate travel in progress.
#[derive(Debug, Clone, Copy)]
struct Travel {
    to_open: bool,
    remaining: f64,
}

pub struct GateSim {
    rates: Rates,
    water: f64,
    soil: f64,
    gate_open: bool,
    travel: Option<Travel>,
    /// Soil sensor noise sigma (%).
    noise: f64,
    manual_action: Option<&'static str>,
    manual_action_time: Option<String>,
}

impl GateSim {
    pub fn new(scenario: Scenario) -> Self {
        let (water, soil, gate_open) = scenario.start();
        Self {
            rates: scenario.rates(),
            water,
            soil,
            gate_open,
            travel: None,
            noise: 0.3,
            manual_action: None,
            manual_action_time: None,
        }
    }

    /// Disable sensor noise.
    pub fn quiet(mut self) -> Self {
        self.noise = 0.0;
        self
    }

    pub fn is_moving(&self) -> bool {
        self.travel.is_some()
    }

    /// Advance the model by `dt` seconds.
    pub fn step(&mut self, dt: f64) {
        if let Some(t) = self.travel.as_mut() {
            t.remaining -= dt;
            if t.remaining <= 0.0 {
                self.gate_open = t.to_open;
                self.travel = None;
            }
        }

        // Water only flows in once the gate has fully opened.
        let flowing = self.gate_open && self.travel.is_none();
        self.water = if flowing {
            self.water + self.rates.inflow * dt
        } else {
            self.water - self.rates.drain * dt
        }
        .clamp(0.0, 100.0);

        let jitter = (fastrand::f64() - 0.5) * 2.0 * self.noise;
        self.soil = if self.water > 0.0 {
            self.soil + SOAK_RATE * dt
        } else {
            self.soil - self.rates.dry * dt + jitter
        }
        .clamp(0.0, 100.0);
    }

    /// Remote `/open` or `/close`.
    pub fn command(&mut self, open: bool) -> Reply {
        match self.travel {
            Some(t) if t.to_open == open => Reply::AlreadyThere,
            Some(t) => {
                // Reverse: it has to cover what it already travelled.
                self.travel = Some(Travel {
                    to_open: open,
                    remaining: TRAVEL_SECS - t.remaining,
                });
                Reply::Applied
            }
            None if self.gate_open == open => Reply::AlreadyThere,
            None => {
                self.travel = Some(Travel {
                    to_open: open,
                    remaining: TRAVEL_SECS,
                });
                Reply::Applied
            }
        }
    }

    /// Someone pressed the gate's physical button. Reported on the next
    /// `/data` as a manual action.
    pub fn press_button(&mut self, open: bool, at: OffsetDateTime) -> Reply {
        let reply = self.command(open);
        if reply == Reply::Applied {
            self.manual_action = Some(action_word(open));
            self.manual_action_time = Some(event_time(at));
        }
        reply
    }

    pub fn snapshot(&self) -> Snapshot {
        let resting = self.travel.is_none();
        Snapshot {
            soil_moisture_percent: (self.soil * 10.0).round() / 10.0,
            water_level_percent: (self.water * 10.0).round() / 10.0,
            gate_open: self.gate_open,
            gate_is_moving: !resting,
            pending_auto_action: None,
            auto_action: None,
            auto_action_time: None,
            manual_action: self.manual_action,
            manual_action_time: self.manual_action_time.clone(),
            open_limit_reached: resting && self.gate_open,
            close_limit_reached: resting && !self.gate_open,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
