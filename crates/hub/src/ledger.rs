//! Per-user gate-action and notification history.
//!
//! Writes never fail outward: a record that cannot be persisted is logged
//! and dropped, and the caller carries on with its next decision. Dedup is
//! carried by the store (unique dedup keys, unique system notification per
//! local day), so concurrent writers need no lock.
//!
//! Every record that was written is also broadcast as a [`LedgerEvent`];
//! the push forwarder in [`crate::mqtt`] is the main subscriber.

use anyhow::Result;
use time::macros::format_description;
use time::{Date, OffsetDateTime, UtcOffset};
use tokio::sync::broadcast;
use tracing::{debug, error};

use crate::store::{
    GateAction, GateActionRecord, NotificationRecord, NotificationStream, Store, TriggeredBy,
};

/// Capacity of the ledger broadcast channel shared by all users.
pub const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum LedgerEvent {
    GateAction {
        user_id: String,
        record: GateActionRecord,
    },
    Notification {
        user_id: String,
        record: NotificationRecord,
    },
}

#[derive(Clone)]
pub struct ActionLedger<S> {
    store: S,
    user_id: String,
    utc_offset: UtcOffset,
    events: broadcast::Sender<LedgerEvent>,
}

/// Wall-clock label used inside actuation notifications ("14:05:09").
pub fn clock_label(ts: OffsetDateTime) -> String {
    ts.format(format_description!("[hour]:[minute]:[second]"))
        .unwrap_or_default()
}

/// Dedup key for an actuation the device reported. A bare clock label
/// ("14:05:09") repeats every day, so it is qualified with the local date.
pub fn device_event_key(kind: &str, device_time: &str, today: Date) -> String {
    let has_date = device_time.contains('-') || device_time.bytes().all(|b| b.is_ascii_digit());
    if has_date {
        format!("{kind}:{device_time}")
    } else {
        format!("{kind}:{today}T{device_time}")
    }
}

impl<S: Store> ActionLedger<S> {
    pub fn new(
        store: S,
        user_id: &str,
        utc_offset: UtcOffset,
        events: broadcast::Sender<LedgerEvent>,
    ) -> Self {
        Self {
            store,
            user_id: user_id.to_string(),
            utc_offset,
            events,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Current time at the device's UTC offset.
    pub fn local_now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc().to_offset(self.utc_offset)
    }

    pub fn today(&self) -> Date {
        self.local_now().date()
    }

    /// Calendar day of `ts` as seen by the device, not the UTC date.
    pub fn local_day(&self, ts: OffsetDateTime) -> Date {
        ts.to_offset(self.utc_offset).date()
    }

    // ------------------------------------------------------------------
    // Gate actions
    // ------------------------------------------------------------------

    /// Append a confirmed actuation issued by the hub itself.
    pub async fn append_gate_action(&self, action: GateAction, triggered_by: TriggeredBy) -> bool {
        let record = GateActionRecord {
            action,
            triggered_by,
            timestamp: OffsetDateTime::now_utc(),
        };
        self.write_gate_action(record, None).await
    }

    pub fn event_key(&self, kind: &str, device_time: &str) -> String {
        device_event_key(kind, device_time, self.today())
    }

    /// Append an actuation reported by the device. `dedup_key` identifies
    /// the device event; returns `false` if it was already recorded.
    pub async fn append_device_event(
        &self,
        action: GateAction,
        triggered_by: TriggeredBy,
        dedup_key: &str,
    ) -> bool {
        let record = GateActionRecord {
            action,
            triggered_by,
            timestamp: OffsetDateTime::now_utc(),
        };
        self.write_gate_action(record, Some(dedup_key)).await
    }

    async fn write_gate_action(&self, record: GateActionRecord, dedup_key: Option<&str>) -> bool {
        match self
            .store
            .append_gate_action(&self.user_id, &record, dedup_key)
            .await
        {
            Ok(true) => {
                let _ = self.events.send(LedgerEvent::GateAction {
                    user_id: self.user_id.clone(),
                    record,
                });
                true
            }
            Ok(false) => {
                debug!(user = %self.user_id, key = ?dedup_key, "gate action already recorded");
                false
            }
            Err(e) => {
                error!(
                    user = %self.user_id,
                    action = %record.action,
                    triggered_by = record.triggered_by.as_str(),
                    "ledger: append_gate_action failed: {e:#}"
                );
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    /// Emit a system notification unless an identical description was
    /// already recorded on today's local date. Returns whether it was
    /// emitted. A failed write still emits: the push goes out, only the
    /// history entry is lost.
    pub async fn append_notification(&self, title: &str, description: &str) -> bool {
        self.append_notification_at(title, description, OffsetDateTime::now_utc())
            .await
    }

    pub(crate) async fn append_notification_at(
        &self,
        title: &str,
        description: &str,
        at: OffsetDateTime,
    ) -> bool {
        let record = NotificationRecord {
            stream: NotificationStream::System,
            title: title.to_string(),
            description: description.to_string(),
            timestamp: at,
            seen: false,
            weather: None,
        };
        self.write_notification(record).await
    }

    /// Append a weather-stream record. No per-day dedup; the weather
    /// refresher decides whether anything changed.
    pub async fn append_weather(&self, record: NotificationRecord) -> bool {
        debug_assert_eq!(record.stream, NotificationStream::Weather);
        self.write_notification(record).await
    }

    async fn write_notification(&self, record: NotificationRecord) -> bool {
        let day = self.local_day(record.timestamp);
        let emitted = match self
            .store
            .append_notification(&self.user_id, &record, day)
            .await
        {
            Ok(inserted) => inserted,
            Err(e) => {
                error!(
                    user = %self.user_id,
                    title = %record.title,
                    "ledger: append_notification failed: {e:#}"
                );
                true
            }
        };
        if emitted {
            let _ = self.events.send(LedgerEvent::Notification {
                user_id: self.user_id.clone(),
                record,
            });
        } else {
            debug!(
                user = %self.user_id,
                description = %record.description,
                "already notified today"
            );
        }
        emitted
    }

    /// Whether `description` was already notified on today's local date.
    /// A failed lookup counts as "not yet".
    pub async fn has_notified_today(&self, description: &str) -> bool {
        match self
            .store
            .notified_on(&self.user_id, description, self.today())
            .await
        {
            Ok(v) => v,
            Err(e) => {
                error!(user = %self.user_id, "ledger: notified_on failed: {e:#}");
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // History reads and bulk operations
    // ------------------------------------------------------------------

    pub async fn gate_actions(&self, limit: Option<u32>) -> Result<Vec<GateActionRecord>> {
        self.store.gate_actions(&self.user_id, limit).await
    }

    pub async fn notifications(
        &self,
        stream: Option<NotificationStream>,
    ) -> Result<Vec<NotificationRecord>> {
        self.store.notifications(&self.user_id, stream).await
    }

    pub async fn unseen_count(&self) -> Result<u64> {
        self.store.unseen_count(&self.user_id).await
    }

    pub async fn mark_all_seen(&self) -> Result<u64> {
        self.store.mark_all_seen(&self.user_id).await
    }

    pub async fn clear_notifications(&self) -> Result<u64> {
        self.store.clear_notifications(&self.user_id).await
    }

    pub async fn clear_gate_actions(&self) -> Result<u64> {
        self.store.clear_gate_actions(&self.user_id).await
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use time::macros::{datetime, offset};

    fn ledger(store: MemoryStore) -> ActionLedger<MemoryStore> {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        ActionLedger::new(store, "u1", offset!(+8), tx)
    }

    fn subscribed_ledger(
        store: MemoryStore,
    ) -> (ActionLedger<MemoryStore>, broadcast::Receiver<LedgerEvent>) {
        let (tx, rx) = broadcast::channel(EVENT_CAPACITY);
        (ActionLedger::new(store, "u1", offset!(+8), tx), rx)
    }

    #[test]
    fn local_day_uses_device_offset() {
        let l = ledger(MemoryStore::new());
        // 2024-06-01 20:30 UTC is already 2024-06-02 at +08:00.
        let ts = datetime!(2024-06-01 20:30 UTC);
        assert_eq!(l.local_day(ts), time::macros::date!(2024 - 06 - 02));
    }

    #[test]
    fn clock_label_format() {
        assert_eq!(clock_label(datetime!(2024-06-01 07:05:09 UTC)), "07:05:09");
    }

    #[tokio::test]
    async fn same_notification_twice_same_day_persists_once() {
        let store = MemoryStore::new();
        let l = ledger(store.clone());
        assert!(l.append_notification("Low Water & Dry Soil", "dry").await);
        assert!(!l.append_notification("Low Water & Dry Soil", "dry").await);
        assert_eq!(store.notifications("u1", None).await.unwrap().len(), 1);
        assert!(l.has_notified_today("dry").await);
        assert!(!l.has_notified_today("wet").await);
    }

    #[tokio::test]
    async fn same_description_next_local_day_is_new() {
        let store = MemoryStore::new();
        let l = ledger(store.clone());
        assert!(
            l.append_notification_at("t", "dry", datetime!(2024-06-01 10:00 UTC))
                .await
        );
        // 16:30 UTC is 00:30 next day at +08:00.
        assert!(
            l.append_notification_at("t", "dry", datetime!(2024-06-01 16:30 UTC))
                .await
        );
        // 15:59 UTC is still 23:59 on the first day.
        assert!(
            !l.append_notification_at("t", "dry", datetime!(2024-06-01 15:59 UTC))
                .await
        );
        assert_eq!(store.notifications("u1", None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn device_event_dedup_key() {
        let store = MemoryStore::new();
        let l = ledger(store.clone());
        assert!(
            l.append_device_event(GateAction::Open, TriggeredBy::Auto, "auto:open:100")
                .await
        );
        assert!(
            !l.append_device_event(GateAction::Open, TriggeredBy::Auto, "auto:open:100")
                .await
        );
        assert!(
            l.append_device_event(GateAction::Open, TriggeredBy::Auto, "auto:open:101")
                .await
        );
        assert_eq!(l.gate_actions(None).await.unwrap().len(), 2);
    }

    #[test]
    fn clock_only_event_times_get_the_local_date() {
        let day1 = time::macros::date!(2024 - 06 - 01);
        let day2 = time::macros::date!(2024 - 06 - 02);
        assert_eq!(
            device_event_key("manual", "14:05:09", day1),
            "manual:2024-06-01T14:05:09"
        );
        assert_ne!(
            device_event_key("manual", "14:05:09", day1),
            device_event_key("manual", "14:05:09", day2)
        );
        assert_eq!(
            device_event_key("auto:open", "2024-06-01T14:05:09Z", day2),
            "auto:open:2024-06-01T14:05:09Z"
        );
        assert_eq!(device_event_key("manual", "1717200000", day2), "manual:1717200000");
    }

    #[tokio::test]
    async fn same_clock_time_next_day_is_recorded_again() {
        let store = MemoryStore::new();
        let l = ledger(store.clone());
        let day1 = device_event_key("manual", "14:05:09", time::macros::date!(2024 - 06 - 01));
        let day2 = device_event_key("manual", "14:05:09", time::macros::date!(2024 - 06 - 02));
        assert!(
            l.append_device_event(GateAction::Open, TriggeredBy::ManualButton, &day1)
                .await
        );
        assert!(
            l.append_device_event(GateAction::Open, TriggeredBy::ManualButton, &day2)
                .await
        );
        assert_eq!(l.gate_actions(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn subscribers_see_written_records_only() {
        let store = MemoryStore::new();
        let (l, mut rx) = subscribed_ledger(store);

        l.append_gate_action(GateAction::Close, TriggeredBy::Manual).await;
        l.append_notification("t", "d").await;
        l.append_notification("t", "d").await; // duplicate, not broadcast

        match rx.recv().await.unwrap() {
            LedgerEvent::GateAction { user_id, record } => {
                assert_eq!(user_id, "u1");
                assert_eq!(record.action, GateAction::Close);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(
            rx.recv().await.unwrap(),
            LedgerEvent::Notification { .. }
        ));
        assert!(rx.try_recv().is_err());
    }
}
