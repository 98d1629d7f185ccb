//! Persistence seam: the per-user collections the hub reads and writes,
//! behind one async trait. [`crate::db::Db`] is the SQLite backend;
//! [`MemoryStore`] keeps everything in process (tests, `DB_URL=memory`).

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use time::{Date, OffsetDateTime};

use crate::plan::{FarmingPlan, HarvestRecord};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateAction {
    Open,
    Close,
}

impl GateAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Close => "close",
        }
    }

    pub fn past_tense(self) -> &'static str {
        match self {
            Self::Open => "opened",
            Self::Close => "closed",
        }
    }

    /// Gate position once this action has been applied.
    pub fn leaves_open(self) -> bool {
        matches!(self, Self::Open)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Some(Self::Open),
            "close" => Some(Self::Close),
            _ => None,
        }
    }
}

impl fmt::Display for GateAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggeredBy {
    /// Countdown elapsed in the hub, or reported by the device as its own.
    Auto,
    /// Command issued from the dashboard.
    Manual,
    /// Physical button on the device, observed through a poll.
    ManualButton,
    Emergency,
}

impl TriggeredBy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
            Self::ManualButton => "manual-button",
            Self::Emergency => "emergency",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(Self::Auto),
            "manual" => Some(Self::Manual),
            "manual-button" => Some(Self::ManualButton),
            "emergency" => Some(Self::Emergency),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateActionRecord {
    pub action: GateAction,
    pub triggered_by: TriggeredBy,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStream {
    System,
    Weather,
}

impl NotificationStream {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Weather => "weather",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Self::System),
            "weather" => Some(Self::Weather),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherDetails {
    pub temp: f64,
    pub humidity: i64,
    pub icon: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub stream: NotificationStream,
    pub title: String,
    pub description: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub seen: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weather: Option<WeatherDetails>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: String,
    pub name: String,
    pub device_address: Option<String>,
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// Every collection is keyed by user id. Read queries return newest first.
pub trait Store: Clone + Send + Sync + 'static {
    fn upsert_profile(&self, profile: &Profile) -> impl Future<Output = Result<()>> + Send;

    fn load_profiles(&self) -> impl Future<Output = Result<Vec<Profile>>> + Send;

    /// Returns `false` without writing when `dedup_key` was already used
    /// for this user.
    fn append_gate_action(
        &self,
        user_id: &str,
        record: &GateActionRecord,
        dedup_key: Option<&str>,
    ) -> impl Future<Output = Result<bool>> + Send;

    fn gate_actions(
        &self,
        user_id: &str,
        limit: Option<u32>,
    ) -> impl Future<Output = Result<Vec<GateActionRecord>>> + Send;

    fn latest_gate_action(
        &self,
        user_id: &str,
    ) -> impl Future<Output = Result<Option<GateActionRecord>>> + Send;

    fn clear_gate_actions(&self, user_id: &str) -> impl Future<Output = Result<u64>> + Send;

    /// System-stream records are unique per (user, day, description);
    /// returns `false` when an identical one already exists for `day`.
    fn append_notification(
        &self,
        user_id: &str,
        record: &NotificationRecord,
        day: Date,
    ) -> impl Future<Output = Result<bool>> + Send;

    fn notified_on(
        &self,
        user_id: &str,
        description: &str,
        day: Date,
    ) -> impl Future<Output = Result<bool>> + Send;

    fn notifications(
        &self,
        user_id: &str,
        stream: Option<NotificationStream>,
    ) -> impl Future<Output = Result<Vec<NotificationRecord>>> + Send;

    fn latest_weather(
        &self,
        user_id: &str,
    ) -> impl Future<Output = Result<Option<NotificationRecord>>> + Send;

    fn unseen_count(&self, user_id: &str) -> impl Future<Output = Result<u64>> + Send;

    fn mark_all_seen(&self, user_id: &str) -> impl Future<Output = Result<u64>> + Send;

    fn clear_notifications(&self, user_id: &str) -> impl Future<Output = Result<u64>> + Send;

    fn get_plan(&self, user_id: &str) -> impl Future<Output = Result<Option<FarmingPlan>>> + Send;

    fn put_plan(
        &self,
        user_id: &str,
        plan: &FarmingPlan,
    ) -> impl Future<Output = Result<()>> + Send;

    fn delete_plan(&self, user_id: &str) -> impl Future<Output = Result<bool>> + Send;

    fn append_harvest(
        &self,
        user_id: &str,
        record: &HarvestRecord,
    ) -> impl Future<Output = Result<()>> + Send;

    fn harvests(&self, user_id: &str) -> impl Future<Output = Result<Vec<HarvestRecord>>> + Send;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct UserData {
    gate_actions: Vec<(GateActionRecord, Option<String>)>,
    notifications: Vec<(NotificationRecord, Date)>,
    plan: Option<FarmingPlan>,
    harvests: Vec<HarvestRecord>,
}

#[derive(Default)]
struct MemoryInner {
    profiles: Vec<Profile>,
    users: HashMap<String, UserData>,
}

/// Vectors are kept in insertion order and reversed on read.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryInner>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))
    }
}

fn newest_first<T: Clone>(items: impl DoubleEndedIterator<Item = T>) -> Vec<T> {
    items.rev().collect()
}

impl Store for MemoryStore {
    async fn upsert_profile(&self, profile: &Profile) -> Result<()> {
        let mut inner = self.lock()?;
        match inner.profiles.iter_mut().find(|p| p.user_id == profile.user_id) {
            Some(existing) => *existing = profile.clone(),
            None => inner.profiles.push(profile.clone()),
        }
        Ok(())
    }

    async fn load_profiles(&self) -> Result<Vec<Profile>> {
        let mut profiles = self.lock()?.profiles.clone();
        profiles.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(profiles)
    }

    async fn append_gate_action(
        &self,
        user_id: &str,
        record: &GateActionRecord,
        dedup_key: Option<&str>,
    ) -> Result<bool> {
        let mut inner = self.lock()?;
        let user = inner.users.entry(user_id.to_string()).or_default();
        if let Some(key) = dedup_key {
            if user
                .gate_actions
                .iter()
                .any(|(_, k)| k.as_deref() == Some(key))
            {
                return Ok(false);
            }
        }
        user.gate_actions
            .push((record.clone(), dedup_key.map(str::to_string)));
        Ok(true)
    }

    async fn gate_actions(
        &self,
        user_id: &str,
        limit: Option<u32>,
    ) -> Result<Vec<GateActionRecord>> {
        let inner = self.lock()?;
        let Some(user) = inner.users.get(user_id) else {
            return Ok(Vec::new());
        };
        let mut records = newest_first(user.gate_actions.iter().map(|(r, _)| r.clone()));
        if let Some(n) = limit {
            records.truncate(n as usize);
        }
        Ok(records)
    }

    async fn latest_gate_action(&self, user_id: &str) -> Result<Option<GateActionRecord>> {
        let inner = self.lock()?;
        Ok(inner
            .users
            .get(user_id)
            .and_then(|u| u.gate_actions.last())
            .map(|(r, _)| r.clone()))
    }

    async fn clear_gate_actions(&self, user_id: &str) -> Result<u64> {
        let mut inner = self.lock()?;
        Ok(inner
            .users
            .get_mut(user_id)
            .map(|u| u.gate_actions.drain(..).count() as u64)
            .unwrap_or(0))
    }

    async fn append_notification(
        &self,
        user_id: &str,
        record: &NotificationRecord,
        day: Date,
    ) -> Result<bool> {
        let mut inner = self.lock()?;
        let user = inner.users.entry(user_id.to_string()).or_default();
        if record.stream == NotificationStream::System
            && user.notifications.iter().any(|(n, d)| {
                n.stream == NotificationStream::System
                    && *d == day
                    && n.description == record.description
            })
        {
            return Ok(false);
        }
        user.notifications.push((record.clone(), day));
        Ok(true)
    }

    async fn notified_on(&self, user_id: &str, description: &str, day: Date) -> Result<bool> {
        let inner = self.lock()?;
        Ok(inner.users.get(user_id).is_some_and(|u| {
            u.notifications
                .iter()
                .any(|(n, d)| *d == day && n.description == description)
        }))
    }

    async fn notifications(
        &self,
        user_id: &str,
        stream: Option<NotificationStream>,
    ) -> Result<Vec<NotificationRecord>> {
        let inner = self.lock()?;
        let Some(user) = inner.users.get(user_id) else {
            return Ok(Vec::new());
        };
        let mut records: Vec<NotificationRecord> = user
            .notifications
            .iter()
            .filter(|(n, _)| stream.map_or(true, |s| n.stream == s))
            .map(|(n, _)| n.clone())
            .collect();
        // Stable sort keeps insertion order among equal timestamps.
        records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        records.reverse();
        Ok(records)
    }

    async fn latest_weather(&self, user_id: &str) -> Result<Option<NotificationRecord>> {
        let inner = self.lock()?;
        Ok(inner.users.get(user_id).and_then(|u| {
            u.notifications
                .iter()
                .rev()
                .find(|(n, _)| n.stream == NotificationStream::Weather)
                .map(|(n, _)| n.clone())
        }))
    }

    async fn unseen_count(&self, user_id: &str) -> Result<u64> {
        let inner = self.lock()?;
        Ok(inner
            .users
            .get(user_id)
            .map(|u| u.notifications.iter().filter(|(n, _)| !n.seen).count() as u64)
            .unwrap_or(0))
    }

    async fn mark_all_seen(&self, user_id: &str) -> Result<u64> {
        let mut inner = self.lock()?;
        let mut changed = 0;
        if let Some(user) = inner.users.get_mut(user_id) {
            for (n, _) in user.notifications.iter_mut().filter(|(n, _)| !n.seen) {
                n.seen = true;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn clear_notifications(&self, user_id: &str) -> Result<u64> {
        let mut inner = self.lock()?;
        Ok(inner
            .users
            .get_mut(user_id)
            .map(|u| u.notifications.drain(..).count() as u64)
            .unwrap_or(0))
    }

    async fn get_plan(&self, user_id: &str) -> Result<Option<FarmingPlan>> {
        let inner = self.lock()?;
        Ok(inner.users.get(user_id).and_then(|u| u.plan.clone()))
    }

    async fn put_plan(&self, user_id: &str, plan: &FarmingPlan) -> Result<()> {
        let mut inner = self.lock()?;
        inner.users.entry(user_id.to_string()).or_default().plan = Some(plan.clone());
        Ok(())
    }

    async fn delete_plan(&self, user_id: &str) -> Result<bool> {
        let mut inner = self.lock()?;
        Ok(inner
            .users
            .get_mut(user_id)
            .and_then(|u| u.plan.take())
            .is_some())
    }

    async fn append_harvest(&self, user_id: &str, record: &HarvestRecord) -> Result<()> {
        let mut inner = self.lock()?;
        inner
            .users
            .entry(user_id.to_string())
            .or_default()
            .harvests
            .push(record.clone());
        Ok(())
    }

    async fn harvests(&self, user_id: &str) -> Result<Vec<HarvestRecord>> {
        let inner = self.lock()?;
        Ok(inner
            .users
            .get(user_id)
            .map(|u| newest_first(u.harvests.iter().cloned()))
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Test double: a store whose history writes fail
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod failing {
    use super::*;

    /// Reads come from an inner [`MemoryStore`]; every gate-action and
    /// notification append errors, like a database that went away.
    #[derive(Clone, Default)]
    pub struct FailingStore {
        pub inner: MemoryStore,
    }

    impl Store for FailingStore {
        async fn upsert_profile(&self, profile: &Profile) -> Result<()> {
            self.inner.upsert_profile(profile).await
        }

        async fn load_profiles(&self) -> Result<Vec<Profile>> {
            self.inner.load_profiles().await
        }

        async fn append_gate_action(
            &self,
            _user_id: &str,
            _record: &GateActionRecord,
            _dedup_key: Option<&str>,
        ) -> Result<bool> {
            Err(anyhow!("disk I/O error"))
        }

        async fn gate_actions(
            &self,
            user_id: &str,
            limit: Option<u32>,
        ) -> Result<Vec<GateActionRecord>> {
            self.inner.gate_actions(user_id, limit).await
        }

        async fn latest_gate_action(&self, user_id: &str) -> Result<Option<GateActionRecord>> {
            self.inner.latest_gate_action(user_id).await
        }

        async fn clear_gate_actions(&self, user_id: &str) -> Result<u64> {
            self.inner.clear_gate_actions(user_id).await
        }

        async fn append_notification(
            &self,
            _user_id: &str,
            _record: &NotificationRecord,
            _day: Date,
        ) -> Result<bool> {
            Err(anyhow!("disk I/O error"))
        }

        async fn notified_on(&self, user_id: &str, description: &str, day: Date) -> Result<bool> {
            self.inner.notified_on(user_id, description, day).await
        }

        async fn notifications(
            &self,
            user_id: &str,
            stream: Option<NotificationStream>,
        ) -> Result<Vec<NotificationRecord>> {
            self.inner.notifications(user_id, stream).await
        }

        async fn latest_weather(&self, user_id: &str) -> Result<Option<NotificationRecord>> {
            self.inner.latest_weather(user_id).await
        }

        async fn unseen_count(&self, user_id: &str) -> Result<u64> {
            self.inner.unseen_count(user_id).await
        }

        async fn mark_all_seen(&self, user_id: &str) -> Result<u64> {
            self.inner.mark_all_seen(user_id).await
        }

        async fn clear_notifications(&self, user_id: &str) -> Result<u64> {
            self.inner.clear_notifications(user_id).await
        }

        async fn get_plan(&self, user_id: &str) -> Result<Option<FarmingPlan>> {
            self.inner.get_plan(user_id).await
        }

        async fn put_plan(&self, user_id: &str, plan: &FarmingPlan) -> Result<()> {
            self.inner.put_plan(user_id, plan).await
        }

        async fn delete_plan(&self, user_id: &str) -> Result<bool> {
            self.inner.delete_plan(user_id).await
        }

        async fn append_harvest(&self, user_id: &str, record: &HarvestRecord) -> Result<()> {
            self.inner.append_harvest(user_id, record).await
        }

        async fn harvests(&self, user_id: &str) -> Result<Vec<HarvestRecord>> {
            self.inner.harvests(user_id).await
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{date, datetime};

    fn system_note(description: &str, at: OffsetDateTime) -> NotificationRecord {
        NotificationRecord {
            stream: NotificationStream::System,
            title: "t".into(),
            description: description.into(),
            timestamp: at,
            seen: false,
            weather: None,
        }
    }

    #[test]
    fn gate_action_parse_is_case_insensitive() {
        assert_eq!(GateAction::parse(" OPEN "), Some(GateAction::Open));
        assert_eq!(GateAction::parse("close"), Some(GateAction::Close));
        assert_eq!(GateAction::parse("toggle"), None);
    }

    #[test]
    fn triggered_by_serializes_kebab_case() {
        let json = serde_json::to_string(&TriggeredBy::ManualButton).unwrap();
        assert_eq!(json, "\"manual-button\"");
        assert_eq!(TriggeredBy::parse("manual-button"), Some(TriggeredBy::ManualButton));
    }

    #[tokio::test]
    async fn gate_action_dedup_key_blocks_second_append() {
        let store = MemoryStore::new();
        let rec = GateActionRecord {
            action: GateAction::Open,
            triggered_by: TriggeredBy::Auto,
            timestamp: datetime!(2024-06-01 08:00 UTC),
        };
        assert!(store.append_gate_action("u1", &rec, Some("auto:open:1")).await.unwrap());
        assert!(!store.append_gate_action("u1", &rec, Some("auto:open:1")).await.unwrap());
        // No key: always appended.
        assert!(store.append_gate_action("u1", &rec, None).await.unwrap());
        assert!(store.append_gate_action("u1", &rec, None).await.unwrap());
        assert_eq!(store.gate_actions("u1", None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn dedup_keys_are_per_user() {
        let store = MemoryStore::new();
        let rec = GateActionRecord {
            action: GateAction::Close,
            triggered_by: TriggeredBy::ManualButton,
            timestamp: datetime!(2024-06-01 08:00 UTC),
        };
        assert!(store.append_gate_action("u1", &rec, Some("manual:5")).await.unwrap());
        assert!(store.append_gate_action("u2", &rec, Some("manual:5")).await.unwrap());
    }

    #[tokio::test]
    async fn gate_actions_newest_first_with_limit() {
        let store = MemoryStore::new();
        for (i, action) in [GateAction::Open, GateAction::Close, GateAction::Open]
            .into_iter()
            .enumerate()
        {
            let rec = GateActionRecord {
                action,
                triggered_by: TriggeredBy::Manual,
                timestamp: datetime!(2024-06-01 08:00 UTC) + time::Duration::minutes(i as i64),
            };
            store.append_gate_action("u1", &rec, None).await.unwrap();
        }
        let latest = store.gate_actions("u1", Some(2)).await.unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].action, GateAction::Open);
        assert_eq!(latest[1].action, GateAction::Close);
        let newest = store.latest_gate_action("u1").await.unwrap().unwrap();
        assert_eq!(newest.timestamp, datetime!(2024-06-01 08:02 UTC));
        assert!(store.latest_gate_action("u2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn system_notification_unique_per_day() {
        let store = MemoryStore::new();
        let day = date!(2024 - 06 - 01);
        let note = system_note("Low water", datetime!(2024-06-01 08:00 UTC));
        assert!(store.append_notification("u1", &note, day).await.unwrap());
        assert!(!store.append_notification("u1", &note, day).await.unwrap());
        assert!(store
            .append_notification("u1", &note, date!(2024 - 06 - 02))
            .await
            .unwrap());
        assert!(store.notified_on("u1", "Low water", day).await.unwrap());
        assert!(!store.notified_on("u1", "Other", day).await.unwrap());
    }

    #[tokio::test]
    async fn weather_records_are_not_deduplicated() {
        let store = MemoryStore::new();
        let day = date!(2024 - 06 - 01);
        let mut note = system_note("light rain", datetime!(2024-06-01 08:00 UTC));
        note.stream = NotificationStream::Weather;
        assert!(store.append_notification("u1", &note, day).await.unwrap());
        assert!(store.append_notification("u1", &note, day).await.unwrap());
        assert_eq!(
            store
                .notifications("u1", Some(NotificationStream::Weather))
                .await
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn mark_all_seen_and_clear() {
        let store = MemoryStore::new();
        let day = date!(2024 - 06 - 01);
        store
            .append_notification("u1", &system_note("a", datetime!(2024-06-01 08:00 UTC)), day)
            .await
            .unwrap();
        store
            .append_notification("u1", &system_note("b", datetime!(2024-06-01 09:00 UTC)), day)
            .await
            .unwrap();
        assert_eq!(store.unseen_count("u1").await.unwrap(), 2);
        assert_eq!(store.mark_all_seen("u1").await.unwrap(), 2);
        assert_eq!(store.unseen_count("u1").await.unwrap(), 0);
        assert_eq!(store.mark_all_seen("u1").await.unwrap(), 0);

        let all = store.notifications("u1", None).await.unwrap();
        assert_eq!(all[0].description, "b");

        assert_eq!(store.clear_notifications("u1").await.unwrap(), 2);
        assert!(store.notifications("u1", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_user_reads_empty() {
        let store = MemoryStore::new();
        assert!(store.gate_actions("nobody", None).await.unwrap().is_empty());
        assert_eq!(store.unseen_count("nobody").await.unwrap(), 0);
        assert!(store.get_plan("nobody").await.unwrap().is_none());
        assert!(!store.delete_plan("nobody").await.unwrap());
    }

    #[tokio::test]
    async fn upsert_profile_replaces_existing() {
        let store = MemoryStore::new();
        let mut p = Profile {
            user_id: "u1".into(),
            name: "A".into(),
            device_address: None,
        };
        store.upsert_profile(&p).await.unwrap();
        p.device_address = Some("192.168.1.55".into());
        store.upsert_profile(&p).await.unwrap();
        let profiles = store.load_profiles().await.unwrap();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].device_address.as_deref(), Some("192.168.1.55"));
    }
}
