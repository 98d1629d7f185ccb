mod command;
mod config;
mod controller;
mod countdown;
mod db;
mod device;
mod ledger;
mod mqtt;
mod plan;
mod session;
mod state;
mod store;
mod weather;
mod web;

use anyhow::Result;
use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;
use db::Db;
use device::HttpDevice;
use ledger::{ActionLedger, EVENT_CAPACITY};
use mqtt::{LogSink, MqttSink};
use session::ControllerSession;
use store::{MemoryStore, Store};
use weather::WeatherClient;

fn env_port(name: &str, default: u16) -> u16 {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:paddy.db?mode=rwc".to_string());

    let cfg = config::load(&config_path)?;

    // ── Store ───────────────────────────────────────────────────────
    if db_url == "memory" {
        warn!("DB_URL=memory: history is not persisted");
        run(cfg, MemoryStore::new()).await
    } else {
        let db = Db::connect(&db_url).await?;
        db.migrate().await?;
        info!(%db_url, "db ready");
        run(cfg, db).await
    }
}

async fn run<S: Store>(cfg: Config, store: S) -> Result<()> {
    config::apply(&cfg, &store).await?;

    let profiles = store.load_profiles().await?;
    if profiles.is_empty() {
        warn!("no users configured; the API will reject every request");
    }

    let settings = cfg.session_settings();
    let utc_offset = cfg.utc_offset()?;
    let device = HttpDevice::new(settings.request_timeout)?;
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    let (stop, stop_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();

    // ── Sessions ────────────────────────────────────────────────────
    let mut registry = HashMap::new();
    let mut ledgers = Vec::new();
    for profile in &profiles {
        let ledger = ActionLedger::new(store.clone(), &profile.user_id, utc_offset, events.clone());
        ledgers.push(ledger.clone());
        let session = ControllerSession::new(profile, device.clone(), ledger, settings);
        registry.insert(profile.user_id.clone(), session.handle());
        tasks.spawn(session.run(stop_rx.clone()));
    }
    let registry = Arc::new(registry);
    info!(sessions = registry.len(), "controller sessions started");

    // ── Push (MQTT) ─────────────────────────────────────────────────
    match env::var("MQTT_HOST") {
        Ok(host) => {
            let port = env_port("MQTT_PORT", 1883);
            let (client, eventloop) = mqtt::connect(&host, port);
            info!(%host, port, "pushing ledger events over mqtt");
            tasks.spawn(mqtt::drive(eventloop, stop_rx.clone()));
            tasks.spawn(mqtt::forward_events(
                events.subscribe(),
                MqttSink(client),
                stop_rx.clone(),
            ));
        }
        Err(_) => {
            info!("MQTT_HOST not set; ledger events are only logged");
            tasks.spawn(mqtt::forward_events(events.subscribe(), LogSink, stop_rx.clone()));
        }
    }

    // ── Background watchers ─────────────────────────────────────────
    if let Some(w) = &cfg.weather {
        let client = WeatherClient::new(&w.api_key, &w.location, settings.request_timeout)?;
        let every = Duration::from_secs(w.refresh_min * 60);
        tasks.spawn(weather::run_weather_refresh(client, ledgers.clone(), every, stop_rx.clone()));
    }
    tasks.spawn(plan::run_progress_watch(ledgers, stop_rx.clone()));

    // ── Shutdown on ctrl-c ──────────────────────────────────────────
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("ctrl-c handler failed: {e}");
            return;
        }
        info!("shutdown requested");
        let _ = stop.send(true);
    });

    // ── Web server (runs until shutdown) ─────────────────────────────
    let served = web::serve(registry, env_port("WEB_PORT", 8080), stop_rx).await;
    if served.is_err() {
        tasks.abort_all();
    }

    while tasks.join_next().await.is_some() {}
    info!("hub stopped");
    served
}
