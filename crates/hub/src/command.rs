//! Gate commands: one in flight per session, device result interpreted,
//! mirror + ledger + notification updated on a confirmed actuation.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::device::{CommandResult, DeviceError, GateDevice};
use crate::ledger::{clock_label, ActionLedger};
use crate::state::SharedState;
use crate::store::{GateAction, Store, TriggeredBy};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("another gate command is already in progress")]
    ConcurrentCommandRejected,
    #[error("gate device unreachable: {0}")]
    DeviceUnreachable(String),
    #[error("no gate device configured")]
    NoDeviceConfigured,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CommandOutcome {
    Applied,
    AlreadyInState,
    Unexpected { status: u16 },
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandReport {
    pub action: GateAction,
    pub triggered_by: TriggeredBy,
    #[serde(flatten)]
    pub outcome: CommandOutcome,
    pub message: String,
}

/// Proof that the caller holds the session's single command slot. The slot
/// is released when the permit drops, whatever path the command took.
pub struct CommandPermit {
    flag: Arc<AtomicBool>,
}

impl Drop for CommandPermit {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

pub struct GateCommandService<S, D> {
    device: D,
    address: Option<String>,
    ledger: ActionLedger<S>,
    state: SharedState,
    timeout: Duration,
    in_flight: Arc<AtomicBool>,
}

fn position_word(action: GateAction) -> &'static str {
    match action {
        GateAction::Open => "open",
        GateAction::Close => "closed",
    }
}

impl<S: Store, D: GateDevice> GateCommandService<S, D> {
    pub fn new(
        device: D,
        address: Option<String>,
        ledger: ActionLedger<S>,
        state: SharedState,
        timeout: Duration,
    ) -> Self {
        Self {
            device,
            address,
            ledger,
            state,
            timeout,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn has_device(&self) -> bool {
        self.address.is_some()
    }

    /// Claim the command slot without waiting.
    pub fn try_acquire(&self) -> Result<CommandPermit, CommandError> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| CommandError::ConcurrentCommandRejected)?;
        Ok(CommandPermit {
            flag: self.in_flight.clone(),
        })
    }

    pub async fn execute(
        &self,
        action: GateAction,
        triggered_by: TriggeredBy,
    ) -> Result<CommandReport, CommandError> {
        if !self.has_device() {
            return Err(CommandError::NoDeviceConfigured);
        }
        let permit = self.try_acquire()?;
        self.execute_with(permit, action, triggered_by).await
    }

    /// Close the gate now, dropping any armed countdown first. A rejected
    /// call leaves the countdown armed.
    pub async fn emergency_close(&self) -> Result<CommandReport, CommandError> {
        if !self.has_device() {
            return Err(CommandError::NoDeviceConfigured);
        }
        let permit = self.try_acquire()?;
        {
            let mut st = self.state.write().await;
            if let Some(p) = st.countdown.cancel() {
                st.record_controller(format!(
                    "countdown to {} cancelled by emergency close",
                    p.target
                ));
            }
        }
        warn!(user = %self.ledger.user_id(), "emergency close requested");
        self.execute_with(permit, GateAction::Close, TriggeredBy::Emergency)
            .await
    }

    /// Run a command under an already-held permit. The permit is held until
    /// the ledger and notification writes are done.
    pub async fn execute_with(
        &self,
        permit: CommandPermit,
        action: GateAction,
        triggered_by: TriggeredBy,
    ) -> Result<CommandReport, CommandError> {
        let _permit = permit;
        let address = self
            .address
            .as_deref()
            .ok_or(CommandError::NoDeviceConfigured)?;
        let user = self.ledger.user_id();

        let sent = tokio::time::timeout(self.timeout, self.device.command(address, action)).await;
        let result = match sent {
            Ok(Ok(r)) => r,
            Ok(Err(DeviceError::Unreachable(msg))) => {
                return Err(self.unreachable(action, msg).await)
            }
            Err(_) => {
                let msg = format!("no answer within {}ms", self.timeout.as_millis());
                return Err(self.unreachable(action, msg).await);
            }
        };

        let (outcome, message) = match result {
            CommandResult::Applied => {
                let message = format!("Gate successfully {}.", action.past_tense());
                {
                    let mut st = self.state.write().await;
                    st.gate_open = action.leaves_open();
                    st.countdown.cancel_if(action);
                    st.record_command(message.clone());
                }
                info!(user, %action, triggered_by = triggered_by.as_str(), "gate command applied");
                self.ledger.append_gate_action(action, triggered_by).await;
                self.confirm(action, triggered_by).await;
                (CommandOutcome::Applied, message)
            }
            CommandResult::AlreadyInState => {
                let message = format!("Gate is already {}.", position_word(action));
                let mut st = self.state.write().await;
                st.gate_open = action.leaves_open();
                st.countdown.cancel_if(action);
                st.record_command(message.clone());
                info!(user, %action, "gate already in requested state");
                (CommandOutcome::AlreadyInState, message)
            }
            CommandResult::Unexpected(status) => {
                let message = format!(
                    "Unexpected response from the gate device (HTTP {status}); gate state unknown."
                );
                self.state.write().await.record_command(message.clone());
                warn!(user, %action, status, "unexpected device response to gate command");
                (CommandOutcome::Unexpected { status }, message)
            }
        };

        Ok(CommandReport {
            action,
            triggered_by,
            outcome,
            message,
        })
    }

    async fn unreachable(&self, action: GateAction, detail: String) -> CommandError {
        warn!(user = %self.ledger.user_id(), %action, "gate command failed: {detail}");
        let mut st = self.state.write().await;
        st.record_error(format!("{action} command failed: {detail}"));
        st.last_message = Some("Failed to reach the gate device.".into());
        CommandError::DeviceUnreachable(detail)
    }

    async fn confirm(&self, action: GateAction, triggered_by: TriggeredBy) {
        let at = clock_label(self.ledger.local_now());
        if let Some((title, description)) = actuation_notice(action, triggered_by, &at) {
            self.ledger.append_notification(&title, &description).await;
        }
    }
}

/// Title and description pushed for a confirmed actuation. UI-issued
/// manual commands are answered directly and get none.
pub fn actuation_notice(
    action: GateAction,
    triggered_by: TriggeredBy,
    at: &str,
) -> Option<(String, String)> {
    let word = match action {
        GateAction::Open => "Opened",
        GateAction::Close => "Closed",
    };
    let notice = match triggered_by {
        TriggeredBy::Manual => return None,
        TriggeredBy::Emergency => (
            "Emergency Gate Close".to_string(),
            format!("The irrigation gate was closed by emergency stop at {at}."),
        ),
        TriggeredBy::Auto => (
            format!("Gate {word} Automatically"),
            format!("The irrigation gate was {} automatically at {at}.", action.past_tense()),
        ),
        TriggeredBy::ManualButton => (
            format!("Manual Gate {word}"),
            format!("The irrigation gate was {} manually at {at}.", action.past_tense()),
        ),
    };
    Some(notice)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::fake::FakeDevice;
    use crate::device::SensorSnapshot;
    use crate::ledger::EVENT_CAPACITY;
    use crate::state::GateState;
    use crate::store::MemoryStore;
    use time::macros::offset;
    use tokio::sync::broadcast;
    use tokio::time::Instant;

    type Service = GateCommandService<MemoryStore, FakeDevice>;

    fn snapshot(gate_open: bool) -> SensorSnapshot {
        SensorSnapshot {
            soil_moisture_percent: 60.0,
            water_level_percent: 50.0,
            gate_open,
            gate_is_moving: false,
            pending_auto_action: None,
            auto_action: None,
            auto_action_time: None,
            manual_action: None,
            manual_action_time: None,
            open_limit_reached: false,
            close_limit_reached: false,
        }
    }

    fn service_with(
        device: FakeDevice,
        address: Option<&str>,
    ) -> (Arc<Service>, MemoryStore, SharedState) {
        let store = MemoryStore::new();
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        let ledger = ActionLedger::new(store.clone(), "u1", offset!(+8), tx);
        let state = GateState::shared("u1");
        let svc = GateCommandService::new(
            device,
            address.map(str::to_string),
            ledger,
            state.clone(),
            Duration::from_secs(5),
        );
        (Arc::new(svc), store, state)
    }

    fn service(device: FakeDevice) -> (Arc<Service>, MemoryStore, SharedState) {
        service_with(device, Some("127.0.0.1:9"))
    }

    #[tokio::test]
    async fn applied_open_writes_one_record_and_updates_mirror() {
        let device = FakeDevice::new(Some(snapshot(false)));
        let (svc, store, state) = service(device.clone());

        let report = svc.execute(GateAction::Open, TriggeredBy::Manual).await.unwrap();
        assert_eq!(report.outcome, CommandOutcome::Applied);
        assert_eq!(report.message, "Gate successfully opened.");
        assert_eq!(device.commands(), vec![GateAction::Open]);

        let actions = store.gate_actions("u1", None).await.unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].triggered_by, TriggeredBy::Manual);
        assert!(state.read().await.gate_open);
        assert!(!svc.is_busy());
    }

    #[tokio::test]
    async fn manual_ui_command_is_not_pushed() {
        let (svc, store, _) = service(FakeDevice::new(Some(snapshot(false))));
        svc.execute(GateAction::Open, TriggeredBy::Manual).await.unwrap();
        assert!(store.notifications("u1", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn auto_command_is_pushed() {
        let (svc, store, _) = service(FakeDevice::new(Some(snapshot(true))));
        svc.execute(GateAction::Close, TriggeredBy::Auto).await.unwrap();
        let notes = store.notifications("u1", None).await.unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].title, "Gate Closed Automatically");
        assert!(notes[0]
            .description
            .starts_with("The irrigation gate was closed automatically at "));
    }

    #[tokio::test]
    async fn applied_cancels_matching_countdown_only() {
        let (svc, _, state) = service(FakeDevice::new(Some(snapshot(false))));
        state
            .write()
            .await
            .countdown
            .arm(GateAction::Close, Duration::from_secs(30), Instant::now());
        svc.execute(GateAction::Open, TriggeredBy::Manual).await.unwrap();
        assert_eq!(state.read().await.countdown.target(), Some(GateAction::Close));

        svc.execute(GateAction::Close, TriggeredBy::Manual).await.unwrap();
        assert!(!state.read().await.countdown.is_armed());
    }

    #[tokio::test]
    async fn already_in_state_writes_no_record() {
        let device = FakeDevice::new(Some(snapshot(true)));
        device.set_status(Some(202));
        let (svc, store, state) = service(device);

        let report = svc.execute(GateAction::Open, TriggeredBy::Manual).await.unwrap();
        assert_eq!(report.outcome, CommandOutcome::AlreadyInState);
        assert_eq!(report.message, "Gate is already open.");
        assert!(store.gate_actions("u1", None).await.unwrap().is_empty());
        assert!(store.notifications("u1", None).await.unwrap().is_empty());
        assert_eq!(state.read().await.last_message.as_deref(), Some("Gate is already open."));
    }

    #[tokio::test]
    async fn unexpected_status_writes_no_record() {
        let device = FakeDevice::new(Some(snapshot(false)));
        device.set_status(Some(500));
        let (svc, store, state) = service(device);

        let report = svc.execute(GateAction::Open, TriggeredBy::Auto).await.unwrap();
        assert_eq!(report.outcome, CommandOutcome::Unexpected { status: 500 });
        assert!(store.gate_actions("u1", None).await.unwrap().is_empty());
        assert!(store.notifications("u1", None).await.unwrap().is_empty());
        assert!(!state.read().await.gate_open);
    }

    #[tokio::test]
    async fn unreachable_device_releases_guard() {
        let device = FakeDevice::new(Some(snapshot(false)));
        device.set_status(None);
        let (svc, store, state) = service(device);

        let err = svc.execute(GateAction::Open, TriggeredBy::Manual).await.unwrap_err();
        assert!(matches!(err, CommandError::DeviceUnreachable(_)));
        assert!(!svc.is_busy());
        assert!(store.gate_actions("u1", None).await.unwrap().is_empty());
        assert_eq!(
            state.read().await.last_message.as_deref(),
            Some("Failed to reach the gate device.")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn command_timeout_is_unreachable() {
        let device = FakeDevice::new(Some(snapshot(false))).holding();
        let (svc, store, _) = service(device);

        let err = svc.execute(GateAction::Open, TriggeredBy::Manual).await.unwrap_err();
        assert!(matches!(err, CommandError::DeviceUnreachable(_)));
        assert!(!svc.is_busy());
        assert!(store.gate_actions("u1", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn no_device_configured() {
        let device = FakeDevice::new(None);
        let (svc, _, _) = service_with(device.clone(), None);
        assert_eq!(
            svc.execute(GateAction::Open, TriggeredBy::Manual).await.unwrap_err(),
            CommandError::NoDeviceConfigured
        );
        assert!(device.commands().is_empty());
    }

    #[tokio::test]
    async fn concurrent_command_is_rejected_synchronously() {
        let device = FakeDevice::new(Some(snapshot(false))).holding();
        let (svc, store, _) = service(device.clone());

        let first = tokio::spawn({
            let svc = svc.clone();
            async move { svc.execute(GateAction::Open, TriggeredBy::Manual).await }
        });
        while device.commands().is_empty() {
            tokio::task::yield_now().await;
        }

        assert_eq!(
            svc.execute(GateAction::Close, TriggeredBy::Manual).await.unwrap_err(),
            CommandError::ConcurrentCommandRejected
        );

        device.release();
        let report = first.await.unwrap().unwrap();
        assert_eq!(report.outcome, CommandOutcome::Applied);
        assert_eq!(device.commands(), vec![GateAction::Open]);
        assert_eq!(store.gate_actions("u1", None).await.unwrap().len(), 1);
        assert!(!svc.is_busy());
    }

    #[tokio::test]
    async fn permit_released_on_drop() {
        let (svc, _, _) = service(FakeDevice::new(None));
        let permit = svc.try_acquire().unwrap();
        assert!(svc.is_busy());
        assert!(svc.try_acquire().is_err());
        drop(permit);
        assert!(svc.try_acquire().is_ok());
    }

    #[tokio::test]
    async fn emergency_close_cancels_countdown_and_logs() {
        let (svc, store, state) = service(FakeDevice::new(Some(snapshot(true))));
        state
            .write()
            .await
            .countdown
            .arm(GateAction::Open, Duration::from_secs(30), Instant::now());

        let report = svc.emergency_close().await.unwrap();
        assert_eq!(report.outcome, CommandOutcome::Applied);
        assert!(!state.read().await.countdown.is_armed());

        let actions = store.gate_actions("u1", None).await.unwrap();
        assert_eq!(actions[0].triggered_by, TriggeredBy::Emergency);
        let notes = store.notifications("u1", None).await.unwrap();
        assert_eq!(notes[0].title, "Emergency Gate Close");
    }

    #[tokio::test]
    async fn rejected_emergency_close_keeps_countdown() {
        let (svc, _, state) = service(FakeDevice::new(Some(snapshot(true))));
        state
            .write()
            .await
            .countdown
            .arm(GateAction::Close, Duration::from_secs(30), Instant::now());

        let held = svc.try_acquire().unwrap();
        assert_eq!(
            svc.emergency_close().await.unwrap_err(),
            CommandError::ConcurrentCommandRejected
        );
        assert_eq!(state.read().await.countdown.target(), Some(GateAction::Close));
        drop(held);

        let (svc, _, state) = service_with(FakeDevice::new(None), None);
        state
            .write()
            .await
            .countdown
            .arm(GateAction::Close, Duration::from_secs(30), Instant::now());
        assert_eq!(
            svc.emergency_close().await.unwrap_err(),
            CommandError::NoDeviceConfigured
        );
        assert!(state.read().await.countdown.is_armed());
    }

    #[test]
    fn actuation_notice_texts() {
        assert_eq!(actuation_notice(GateAction::Open, TriggeredBy::Manual, "08:00:00"), None);
        let (title, desc) =
            actuation_notice(GateAction::Open, TriggeredBy::ManualButton, "08:00:00").unwrap();
        assert_eq!(title, "Manual Gate Opened");
        assert_eq!(desc, "The irrigation gate was opened manually at 08:00:00.");
    }

    #[test]
    fn report_serializes_flat() {
        let report = CommandReport {
            action: GateAction::Open,
            triggered_by: TriggeredBy::Manual,
            outcome: CommandOutcome::Unexpected { status: 500 },
            message: "m".into(),
        };
        let v = serde_json::to_value(&report).unwrap();
        assert_eq!(v["result"], "unexpected");
        assert_eq!(v["status"], 500);
        assert_eq!(v["triggered_by"], "manual");
    }
}
