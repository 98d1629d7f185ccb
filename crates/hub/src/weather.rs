//! Weather stream: periodic current-conditions fetch from OpenWeather,
//! appended per user only when the conditions changed.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::ledger::ActionLedger;
use crate::store::{NotificationRecord, NotificationStream, Store, WeatherDetails};

pub const OPENWEATHER_URL: &str = "https://api.openweathermap.org/data/2.5/weather";

pub const WEATHER_TITLE: &str = "Weather Update";

#[derive(Debug, Clone, PartialEq)]
pub struct CurrentWeather {
    pub description: String,
    pub temp: f64,
    pub humidity: i64,
    /// Full icon image URL.
    pub icon: String,
}

// OpenWeather `data/2.5/weather` response, only the fields we read.
#[derive(Deserialize)]
struct OwResponse {
    main: OwMain,
    weather: Vec<OwCondition>,
}

#[derive(Deserialize)]
struct OwMain {
    temp: f64,
    humidity: i64,
}

#[derive(Deserialize)]
struct OwCondition {
    description: String,
    icon: String,
}

#[derive(Clone)]
pub struct WeatherClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    location: String,
}

impl WeatherClient {
    pub fn new(api_key: &str, location: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build weather http client")?;
        Ok(Self {
            client,
            base_url: OPENWEATHER_URL.to_string(),
            api_key: api_key.to_string(),
            location: location.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.to_string();
        self
    }

    pub async fn current(&self) -> Result<CurrentWeather> {
        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("q", self.location.as_str()),
                ("units", "metric"),
                ("appid", self.api_key.as_str()),
            ])
            .send()
            .await
            .context("weather request failed")?;

        if !response.status().is_success() {
            bail!("weather API answered {}", response.status());
        }

        let body: OwResponse = response.json().await.context("bad weather payload")?;
        let condition = body
            .weather
            .into_iter()
            .next()
            .context("weather payload has no conditions")?;
        Ok(CurrentWeather {
            description: condition.description,
            temp: body.main.temp,
            humidity: body.main.humidity,
            icon: format!("https://openweathermap.org/img/wn/{}@2x.png", condition.icon),
        })
    }
}

/// Append `current` to the user's weather stream unless the description
/// and temperature both match the latest record. Returns whether it was
/// appended.
pub async fn record_if_changed<S: Store>(
    ledger: &ActionLedger<S>,
    current: &CurrentWeather,
) -> bool {
    match ledger.store().latest_weather(ledger.user_id()).await {
        Ok(Some(last)) => {
            let same_temp = last.weather.as_ref().is_some_and(|w| w.temp == current.temp);
            if last.description == current.description && same_temp {
                debug!(user = %ledger.user_id(), "weather unchanged");
                return false;
            }
        }
        Ok(None) => {}
        Err(e) => {
            error!(user = %ledger.user_id(), "weather: latest_weather failed: {e:#}");
        }
    }

    let record = NotificationRecord {
        stream: NotificationStream::Weather,
        title: WEATHER_TITLE.to_string(),
        description: current.description.clone(),
        timestamp: OffsetDateTime::now_utc(),
        seen: false,
        weather: Some(WeatherDetails {
            temp: current.temp,
            humidity: current.humidity,
            icon: current.icon.clone(),
        }),
    };
    ledger.append_weather(record).await
}

/// Fetch once per `every` and fan the result out to every user. A failed
/// fetch is retried on the next tick.
pub async fn run_weather_refresh<S: Store>(
    client: WeatherClient,
    ledgers: Vec<ActionLedger<S>>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    info!(location = %client.location, every_min = every.as_secs() / 60, "weather refresh started");
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let current = match client.current().await {
                    Ok(c) => c,
                    Err(e) => {
                        warn!("weather fetch failed: {e:#}");
                        continue;
                    }
                };
                let mut appended = 0;
                for ledger in &ledgers {
                    if record_if_changed(ledger, &current).await {
                        appended += 1;
                    }
                }
                debug!(
                    description = %current.description,
                    temp = current.temp,
                    appended,
                    "weather refreshed"
                );
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
