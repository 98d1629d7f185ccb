use anyhow::{anyhow, Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use time::macros::format_description;
use time::{Date, OffsetDateTime};

use crate::plan::{FarmingPlan, HarvestRecord, PlantingMethod};
use crate::store::{
    GateAction, GateActionRecord, NotificationRecord, NotificationStream, Profile, Store,
    TriggeredBy, WeatherDetails,
};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

// ---------------------------------------------------------------------------
// Column encodings
// ---------------------------------------------------------------------------

fn to_ms(ts: OffsetDateTime) -> i64 {
    (ts.unix_timestamp_nanos() / 1_000_000) as i64
}

fn from_ms(ms: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
        .with_context(|| format!("timestamp {ms} out of range"))
}

fn fmt_date(d: Date) -> Result<String> {
    d.format(format_description!("[year]-[month]-[day]"))
        .context("failed to format date")
}

fn parse_date(s: &str) -> Result<Date> {
    Date::parse(s, format_description!("[year]-[month]-[day]"))
        .with_context(|| format!("bad date '{s}'"))
}

fn gate_action_from_row(r: &SqliteRow) -> Result<GateActionRecord> {
    let action: String = r.try_get("action")?;
    let triggered_by: String = r.try_get("triggered_by")?;
    Ok(GateActionRecord {
        action: GateAction::parse(&action).ok_or_else(|| anyhow!("bad action '{action}'"))?,
        triggered_by: TriggeredBy::parse(&triggered_by)
            .ok_or_else(|| anyhow!("bad triggered_by '{triggered_by}'"))?,
        timestamp: from_ms(r.try_get("ts_ms")?)?,
    })
}

fn notification_from_row(r: &SqliteRow) -> Result<NotificationRecord> {
    let stream: String = r.try_get("stream")?;
    let temp: Option<f64> = r.try_get("temp")?;
    let humidity: Option<i64> = r.try_get("humidity")?;
    let icon: Option<String> = r.try_get("icon")?;
    let weather = match (temp, humidity, icon) {
        (Some(temp), Some(humidity), Some(icon)) => Some(WeatherDetails {
            temp,
            humidity,
            icon,
        }),
        _ => None,
    };
    Ok(NotificationRecord {
        stream: NotificationStream::parse(&stream)
            .ok_or_else(|| anyhow!("bad stream '{stream}'"))?,
        title: r.try_get("title")?,
        description: r.try_get("description")?,
        timestamp: from_ms(r.try_get("ts_ms")?)?,
        seen: r.try_get("seen")?,
        weather,
    })
}

fn planting_method(s: &str) -> Result<PlantingMethod> {
    PlantingMethod::parse(s).ok_or_else(|| anyhow!("bad planting_method '{s}'"))
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/paddy/paddy.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // Every connection to an in-memory url opens its own empty database.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }
}

impl Store for Db {
    // ----------------------------
    // Profiles
    // ----------------------------

    async fn upsert_profile(&self, p: &Profile) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO profiles (user_id, name, device_address)
            VALUES (?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
              name=excluded.name,
              device_address=excluded.device_address
            "#,
        )
        .bind(&p.user_id)
        .bind(&p.name)
        .bind(&p.device_address)
        .execute(&self.pool)
        .await
        .context("upsert_profile failed")?;
        Ok(())
    }

    async fn load_profiles(&self) -> Result<Vec<Profile>> {
        let rows = sqlx::query(
            "SELECT user_id, name, device_address FROM profiles ORDER BY user_id",
        )
        .fetch_all(&self.pool)
        .await
        .context("load_profiles failed")?;

        rows.iter()
            .map(|r| -> Result<Profile> {
                Ok(Profile {
                    user_id: r.try_get("user_id")?,
                    name: r.try_get("name")?,
                    device_address: r.try_get("device_address")?,
                })
            })
            .collect()
    }

    // ----------------------------
    // Gate actions
    // ----------------------------

    async fn append_gate_action(
        &self,
        user_id: &str,
        rec: &GateActionRecord,
        dedup_key: Option<&str>,
    ) -> Result<bool> {
        let done = sqlx::query(
            r#"
            INSERT INTO gate_actions (user_id, action, triggered_by, ts_ms, dedup_key)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(rec.action.as_str())
        .bind(rec.triggered_by.as_str())
        .bind(to_ms(rec.timestamp))
        .bind(dedup_key)
        .execute(&self.pool)
        .await
        .context("append_gate_action failed")?;
        Ok(done.rows_affected() == 1)
    }

    async fn gate_actions(
        &self,
        user_id: &str,
        limit: Option<u32>,
    ) -> Result<Vec<GateActionRecord>> {
        // LIMIT -1 means no limit in SQLite.
        let limit = limit.map(i64::from).unwrap_or(-1);
        let rows = sqlx::query(
            r#"
            SELECT action, triggered_by, ts_ms
            FROM gate_actions
            WHERE user_id = ?
            ORDER BY ts_ms DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("gate_actions failed")?;

        rows.iter().map(gate_action_from_row).collect()
    }

    async fn latest_gate_action(&self, user_id: &str) -> Result<Option<GateActionRecord>> {
        Ok(self.gate_actions(user_id, Some(1)).await?.into_iter().next())
    }

    async fn clear_gate_actions(&self, user_id: &str) -> Result<u64> {
        let done = sqlx::query("DELETE FROM gate_actions WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .context("clear_gate_actions failed")?;
        Ok(done.rows_affected())
    }

    // ----------------------------
    // Notifications
    // ----------------------------

    async fn append_notification(
        &self,
        user_id: &str,
        rec: &NotificationRecord,
        day: Date,
    ) -> Result<bool> {
        let w = rec.weather.as_ref();
        let done = sqlx::query(
            r#"
            INSERT INTO notifications
              (user_id, stream, title, description, ts_ms, day, seen, temp, humidity, icon)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(rec.stream.as_str())
        .bind(&rec.title)
        .bind(&rec.description)
        .bind(to_ms(rec.timestamp))
        .bind(fmt_date(day)?)
        .bind(rec.seen)
        .bind(w.map(|w| w.temp))
        .bind(w.map(|w| w.humidity))
        .bind(w.map(|w| w.icon.clone()))
        .execute(&self.pool)
        .await
        .context("append_notification failed")?;
        Ok(done.rows_affected() == 1)
    }

    async fn notified_on(&self, user_id: &str, description: &str, day: Date) -> Result<bool> {
        let row = sqlx::query(
            r#"
            SELECT 1 FROM notifications
            WHERE user_id = ? AND stream = 'system' AND day = ? AND description = ?
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(fmt_date(day)?)
        .bind(description)
        .fetch_optional(&self.pool)
        .await
        .context("notified_on failed")?;
        Ok(row.is_some())
    }

    async fn notifications(
        &self,
        user_id: &str,
        stream: Option<NotificationStream>,
    ) -> Result<Vec<NotificationRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT stream, title, description, ts_ms, seen, temp, humidity, icon
            FROM notifications
            WHERE user_id = ? AND (? IS NULL OR stream = ?)
            ORDER BY ts_ms DESC, id DESC
            "#,
        )
        .bind(user_id)
        .bind(stream.map(|s| s.as_str()))
        .bind(stream.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await
        .context("notifications failed")?;

        rows.iter().map(notification_from_row).collect()
    }

    async fn latest_weather(&self, user_id: &str) -> Result<Option<NotificationRecord>> {
        let row = sqlx::query(
            r#"
            SELECT stream, title, description, ts_ms, seen, temp, humidity, icon
            FROM notifications
            WHERE user_id = ? AND stream = 'weather'
            ORDER BY ts_ms DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("latest_weather failed")?;

        row.as_ref().map(notification_from_row).transpose()
    }

    async fn unseen_count(&self, user_id: &str) -> Result<u64> {
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM notifications WHERE user_id = ? AND seen = 0",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .context("unseen_count failed")?;
        Ok(n as u64)
    }

    async fn mark_all_seen(&self, user_id: &str) -> Result<u64> {
        let done = sqlx::query("UPDATE notifications SET seen = 1 WHERE user_id = ? AND seen = 0")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .context("mark_all_seen failed")?;
        Ok(done.rows_affected())
    }

    async fn clear_notifications(&self, user_id: &str) -> Result<u64> {
        let done = sqlx::query("DELETE FROM notifications WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .context("clear_notifications failed")?;
        Ok(done.rows_affected())
    }

    // ----------------------------
    // Farming plan + harvests
    // ----------------------------

    async fn get_plan(&self, user_id: &str) -> Result<Option<FarmingPlan>> {
        let row = sqlx::query(
            r#"
            SELECT rice_variety, planting_method, hectare_coverage,
                   start_date, first_application, second_application
            FROM farming_plans
            WHERE user_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("get_plan failed")?;

        let Some(r) = row else {
            return Ok(None);
        };
        Ok(Some(FarmingPlan {
            rice_variety: r.try_get("rice_variety")?,
            planting_method: planting_method(r.try_get("planting_method")?)?,
            hectare_coverage: r.try_get("hectare_coverage")?,
            start_date: parse_date(r.try_get("start_date")?)?,
            first_application: parse_date(r.try_get("first_application")?)?,
            second_application: parse_date(r.try_get("second_application")?)?,
        }))
    }

    async fn put_plan(&self, user_id: &str, plan: &FarmingPlan) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO farming_plans (
              user_id, rice_variety, planting_method, hectare_coverage,
              start_date, first_application, second_application
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
              rice_variety=excluded.rice_variety,
              planting_method=excluded.planting_method,
              hectare_coverage=excluded.hectare_coverage,
              start_date=excluded.start_date,
              first_application=excluded.first_application,
              second_application=excluded.second_application
            "#,
        )
        .bind(user_id)
        .bind(&plan.rice_variety)
        .bind(plan.planting_method.as_str())
        .bind(plan.hectare_coverage)
        .bind(fmt_date(plan.start_date)?)
        .bind(fmt_date(plan.first_application)?)
        .bind(fmt_date(plan.second_application)?)
        .execute(&self.pool)
        .await
        .context("put_plan failed")?;
        Ok(())
    }

    async fn delete_plan(&self, user_id: &str) -> Result<bool> {
        let done = sqlx::query("DELETE FROM farming_plans WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .context("delete_plan failed")?;
        Ok(done.rows_affected() > 0)
    }

    async fn append_harvest(&self, user_id: &str, h: &HarvestRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO harvests (
              user_id, rice_variety, planting_method, hectare_coverage,
              start_date, harvest_date, harvest_amount
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(user_id)
        .bind(&h.rice_variety)
        .bind(h.planting_method.as_str())
        .bind(h.hectare_coverage)
        .bind(fmt_date(h.start_date)?)
        .bind(fmt_date(h.harvest_date)?)
        .bind(h.harvest_amount)
        .execute(&self.pool)
        .await
        .context("append_harvest failed")?;
        Ok(())
    }

    async fn harvests(&self, user_id: &str) -> Result<Vec<HarvestRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT rice_variety, planting_method, hectare_coverage,
                   start_date, harvest_date, harvest_amount
            FROM harvests
            WHERE user_id = ?
            ORDER BY id DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("harvests failed")?;

        rows.iter()
            .map(|r| -> Result<HarvestRecord> {
                Ok(HarvestRecord {
                    rice_variety: r.try_get("rice_variety")?,
                    planting_method: planting_method(r.try_get("planting_method")?)?,
                    hectare_coverage: r.try_get("hectare_coverage")?,
                    start_date: parse_date(r.try_get("start_date")?)?,
                    harvest_date: parse_date(r.try_get("harvest_date")?)?,
                    harvest_amount: r.try_get("harvest_amount")?,
                })
            })
            .collect()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
