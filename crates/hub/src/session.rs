//! One controller session per user: polls the device, feeds the
//! hysteresis controller, and carries out what it decides.
//!
//! The loop waits on three things at once: the poll ticker, the countdown
//! deadline, and shutdown. Polling and controller evaluation run inline so
//! snapshots are handled strictly in order; an auto command is spawned so
//! the next poll is not held up by command latency. Its permit is taken
//! under the state lock before spawning, so a snapshot arriving meanwhile
//! sees it in flight.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::{interval, sleep_until, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::command::{actuation_notice, CommandPermit, GateCommandService};
use crate::controller::{Effect, HysteresisController};
use crate::device::{DeviceError, GateDevice, SensorSnapshot};
use crate::ledger::{clock_label, ActionLedger};
use crate::state::{GateState, SharedState};
use crate::store::{GateAction, Profile, Store, TriggeredBy};

#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub auto_delay: Duration,
    pub dry_threshold: f64,
}

/// What the HTTP API needs to reach a running session.
pub struct SessionHandle<S, D> {
    pub user_id: String,
    pub name: String,
    pub state: SharedState,
    pub service: Arc<GateCommandService<S, D>>,
    pub ledger: ActionLedger<S>,
}

impl<S: Clone, D> Clone for SessionHandle<S, D> {
    fn clone(&self) -> Self {
        Self {
            user_id: self.user_id.clone(),
            name: self.name.clone(),
            state: self.state.clone(),
            service: self.service.clone(),
            ledger: self.ledger.clone(),
        }
    }
}

/// User id -> session. Built once at startup.
pub type Registry<S, D> = Arc<HashMap<String, SessionHandle<S, D>>>;

pub struct ControllerSession<S, D> {
    device: D,
    address: Option<String>,
    controller: HysteresisController,
    settings: SessionSettings,
    handle: SessionHandle<S, D>,
}

fn armed_notice(action: GateAction, delay: Duration) -> (&'static str, String) {
    let secs = delay.as_secs();
    match action {
        GateAction::Open => (
            "Low Water & Dry Soil",
            format!(
                "Tap to open the irrigation gate and start watering, or it will automatically open in {secs}s."
            ),
        ),
        GateAction::Close => (
            "Water Level is Full",
            format!("Tap to close the gate, or it will close automatically in {secs}s."),
        ),
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl<S: Store, D: GateDevice> ControllerSession<S, D> {
    pub fn new(
        profile: &Profile,
        device: D,
        ledger: ActionLedger<S>,
        settings: SessionSettings,
    ) -> Self {
        let state = GateState::shared(&profile.user_id);
        let service = GateCommandService::new(
            device.clone(),
            profile.device_address.clone(),
            ledger.clone(),
            state.clone(),
            settings.request_timeout,
        );
        Self {
            device,
            address: profile.device_address.clone(),
            controller: HysteresisController::new(settings.dry_threshold, settings.auto_delay),
            settings,
            handle: SessionHandle {
                user_id: profile.user_id.clone(),
                name: profile.name.clone(),
                state,
                service: Arc::new(service),
                ledger,
            },
        }
    }

    pub fn handle(&self) -> SessionHandle<S, D> {
        self.handle.clone()
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let user = self.handle.user_id.clone();

        // No configured address means no polling at all.
        let Some(address) = self.address.clone() else {
            info!(user = %user, "no device address configured; session idle");
            self.handle
                .state
                .write()
                .await
                .record_system("no device address configured".into());
            let _ = shutdown.changed().await;
            return;
        };

        info!(
            user = %user,
            %address,
            poll_ms = self.settings.poll_interval.as_millis() as u64,
            auto_delay_s = self.settings.auto_delay.as_secs(),
            "controller session started"
        );
        self.handle
            .state
            .write()
            .await
            .record_system(format!("session started for device {address}"));

        let mut ticker = interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = {
                let st = self.handle.state.read().await;
                self.controller
                    .next_deadline(&st, Instant::now(), self.handle.service.is_busy())
            };

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.poll_once(&address).await,
                _ = wait_until(deadline) => self.on_deadline().await,
            }
        }

        let mut st = self.handle.state.write().await;
        if let Some(p) = st.countdown.cancel() {
            debug!(user = %user, target = %p.target, "countdown cancelled at shutdown");
        }
        st.record_system("session stopped".into());
        info!(user = %user, "controller session stopped");
    }

    async fn poll_once(&self, address: &str) {
        let user = &self.handle.user_id;
        let polled = match timeout(self.settings.request_timeout, self.device.poll(address)).await {
            Ok(r) => r,
            Err(_) => Err(DeviceError::Unreachable(format!(
                "no answer within {}ms",
                self.settings.request_timeout.as_millis()
            ))),
        };

        let snapshot = match polled {
            Ok(s) => s,
            Err(DeviceError::Unreachable(msg)) => {
                let mut st = self.handle.state.write().await;
                if st.device_reachable {
                    warn!(user = %user, "device became unreachable: {msg}");
                    st.record_error(format!("device unreachable: {msg}"));
                } else {
                    debug!(user = %user, "poll failed: {msg}");
                }
                st.device_reachable = false;
                return;
            }
        };

        self.observe(snapshot).await;
    }

    async fn observe(&self, snapshot: SensorSnapshot) {
        let user = &self.handle.user_id;

        let (effects, fire) = {
            let mut st = self.handle.state.write().await;
            if !st.device_reachable {
                info!(user = %user, "device reachable");
                st.record_system("device reachable".into());
            }
            st.device_reachable = true;
            st.last_polled = Some(OffsetDateTime::now_utc());

            if snapshot.gate_is_moving {
                debug!(user = %user, "gate moving; snapshot discarded");
                return;
            }

            let now = Instant::now();
            let effects = self
                .controller
                .observe(&mut st, &snapshot, now, self.handle.service.is_busy());
            let mut fire = None;
            let mut rest = Vec::with_capacity(effects.len());
            for effect in effects {
                match effect {
                    Effect::Armed(a) => st.record_controller(format!(
                        "armed {a} countdown ({}s)",
                        self.settings.auto_delay.as_secs()
                    )),
                    Effect::Disarmed(a) => {
                        st.record_controller(format!("countdown to {a} cancelled"))
                    }
                    Effect::Fire(a) => {
                        fire = self.claim_slot(&mut st, a, now).map(|p| (p, a));
                        continue;
                    }
                    _ => {}
                }
                rest.push(effect);
            }
            (rest, fire)
        };

        if let Some((permit, action)) = fire {
            self.spawn_auto(permit, action);
        }
        for effect in effects {
            self.apply(effect).await;
        }
    }

    async fn on_deadline(&self) {
        let fire = {
            let mut st = self.handle.state.write().await;
            let now = Instant::now();
            self.controller
                .on_deadline(&mut st, now, self.handle.service.is_busy())
                .and_then(|a| self.claim_slot(&mut st, a, now).map(|p| (p, a)))
        };
        if let Some((permit, action)) = fire {
            self.spawn_auto(permit, action);
        }
    }

    /// Take the command slot for an elapsed countdown. The slot is only
    /// claimed here, once a fire is decided, so polling never blocks a
    /// dashboard command. If a command got in first, the timer goes back
    /// as already due and the next poll fires it.
    fn claim_slot(
        &self,
        st: &mut GateState,
        action: GateAction,
        now: Instant,
    ) -> Option<CommandPermit> {
        match self.handle.service.try_acquire() {
            Ok(permit) => {
                st.record_controller(format!("countdown elapsed; auto {action}"));
                Some(permit)
            }
            Err(_) => {
                st.countdown.arm(action, Duration::ZERO, now);
                st.suppress_next_auto_notification = false;
                debug!(
                    user = %self.handle.user_id,
                    %action,
                    "command in flight; auto fire deferred"
                );
                None
            }
        }
    }

    fn spawn_auto(&self, permit: CommandPermit, action: GateAction) {
        info!(user = %self.handle.user_id, %action, "auto countdown elapsed; issuing command");
        let service = self.handle.service.clone();
        let user = self.handle.user_id.clone();
        tokio::spawn(async move {
            match service.execute_with(permit, action, TriggeredBy::Auto).await {
                Ok(report) => debug!(
                    user = %user,
                    %action,
                    outcome = ?report.outcome,
                    "auto command finished"
                ),
                Err(e) => warn!(user = %user, %action, "auto command failed: {e}"),
            }
        });
    }

    async fn apply(&self, effect: Effect) {
        let ledger = &self.handle.ledger;
        match effect {
            Effect::Armed(action) => {
                let (title, description) = armed_notice(action, self.settings.auto_delay);
                info!(user = %self.handle.user_id, %action, "countdown armed");
                ledger.append_notification(title, &description).await;
            }
            Effect::Disarmed(action) => {
                info!(user = %self.handle.user_id, %action, "countdown cancelled");
            }
            Effect::ManualObserved { action, device_time } => {
                let key = ledger.event_key("manual", &device_time);
                self.device_event(action, TriggeredBy::ManualButton, &key).await;
            }
            Effect::DeviceAutoObserved { action, device_time } => {
                let key = ledger.event_key(&format!("auto:{action}"), &device_time);
                self.device_event(action, TriggeredBy::Auto, &key).await;
            }
            Effect::Fire(_) => {}
        }
    }

    /// Log a device-reported actuation once, and push it only when the
    /// record is new.
    async fn device_event(&self, action: GateAction, triggered_by: TriggeredBy, key: &str) {
        let ledger = &self.handle.ledger;
        if !ledger.append_device_event(action, triggered_by, key).await {
            return;
        }
        info!(
            user = %self.handle.user_id,
            %action,
            triggered_by = triggered_by.as_str(),
            "device-reported actuation"
        );
        let at = clock_label(ledger.local_now());
        if let Some((title, description)) = actuation_notice(action, triggered_by, &at) {
            ledger.append_notification(&title, &description).await;
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
