//! Development stand-in for the field gate device. Serves the device's
//! `/data`, `/open` and `/close` endpoints over a simulated paddy.

mod sim;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use sim::{GateSim, Reply, Scenario};

type SharedSim = Arc<RwLock<GateSim>>;

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

fn router(sim: SharedSim) -> Router {
    Router::new()
        .route("/data", get(data))
        .route("/open", get(open))
        .route("/close", get(close))
        .route("/button/{action}", post(button))
        .with_state(sim)
}

fn reply(r: Reply) -> impl IntoResponse {
    let status = StatusCode::from_u16(r.status()).unwrap_or(StatusCode::OK);
    let body = match r {
        Reply::Applied => "OK",
        Reply::AlreadyThere => "ALREADY",
    };
    (status, body)
}

async fn data(State(sim): State<SharedSim>) -> impl IntoResponse {
    Json(sim.read().await.snapshot())
}

async fn open(State(sim): State<SharedSim>) -> impl IntoResponse {
    let r = sim.write().await.command(true);
    info!(?r, "remote open");
    reply(r)
}

async fn close(State(sim): State<SharedSim>) -> impl IntoResponse {
    let r = sim.write().await.command(false);
    info!(?r, "remote close");
    reply(r)
}

/// Simulate a press of the gate's physical button (`open` or `close`).
async fn button(
    State(sim): State<SharedSim>,
    Path(action): Path<String>,
) -> impl IntoResponse {
    let open = match action.as_str() {
        "open" => true,
        "close" => false,
        _ => return (StatusCode::BAD_REQUEST, "use open or close").into_response(),
    };
    let r = sim
        .write()
        .await
        .press_button(open, OffsetDateTime::now_utc());
    info!(%action, ?r, "button pressed");
    reply(r).into_response()
}

// ---------------------------------------------------------------------------
// Entry-point
// ---------------------------------------------------------------------------

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
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

    let port: u16 = env_or("SIM_PORT", 8081);
    let tick_ms: u64 = env_or("SIM_TICK_MS", 1000);
    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());

    let sim: SharedSim = Arc::new(RwLock::new(GateSim::new(scenario)));

    let ticking = Arc::clone(&sim);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(tick_ms));
        let dt = tick_ms as f64 / 1000.0;
        loop {
            ticker.tick().await;
            let mut s = ticking.write().await;
            s.step(dt);
            let snap = s.snapshot();
            debug!(
                water = snap.water_level_percent,
                soil = snap.soil_moisture_percent,
                gate_open = snap.gate_open,
                moving = snap.gate_is_moving,
                "tick"
            );
        }
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind sim port {port}"))?;
    info!(%scenario, tick_ms, "gate simulator listening on http://{addr}");

    axum::serve(listener, router(sim))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("sim server error")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn app(scenario: Scenario) -> (Router, SharedSim) {
        let sim = Arc::new(RwLock::new(GateSim::new(scenario).quiet()));
        (router(sim.clone()), sim)
    }

    async fn send(app: &Router, method: Method, uri: &str) -> (StatusCode, Vec<u8>) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes().to_vec();
        (status, body)
    }

    #[tokio::test]
    async fn data_serves_snapshot_json() {
        let (app, _) = app(Scenario::Stable);
        let (status, body) = send(&app, Method::GET, "/data").await;
        assert_eq!(status, StatusCode::OK);
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["waterLevelPercent"], 50.0);
        assert_eq!(v["gateOpen"], false);
        assert_eq!(v["gateIsMoving"], false);
    }

    #[tokio::test]
    async fn open_then_open_again_is_202() {
        let (app, sim) = app(Scenario::Drying);
        let (status, body) = send(&app, Method::GET, "/open").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"OK");
        assert!(sim.read().await.is_moving());

        let (status, body) = send(&app, Method::GET, "/open").await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body, b"ALREADY");
    }

    #[tokio::test]
    async fn close_when_closed_is_202() {
        let (app, _) = app(Scenario::Drying);
        let (status, _) = send(&app, Method::GET, "/close").await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn button_press_shows_up_in_data() {
        let (app, _) = app(Scenario::Drying);
        let (status, _) = send(&app, Method::POST, "/button/open").await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = send(&app, Method::GET, "/data").await;
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["manualAction"], "open");
        assert!(v["manualActionTime"].is_string());

        let (status, _) = send(&app, Method::POST, "/button/sideways").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
