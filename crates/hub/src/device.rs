//! HTTP client for the field gate device.
//!
//! The device exposes three endpoints: `GET /data` returns the current
//! [`SensorSnapshot`], `GET /open` and `GET /close` actuate the gate and
//! answer `200` when applied, `202` when the gate was already there.
//! [`GateDevice`] is the seam the controller and command service use, so
//! tests can swap in a scripted device.

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::store::GateAction;

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// One `/data` reading. The device firmware has shipped with both the long
/// and the short field names, so both are accepted. Optional flags default
/// to `false` / `None`; the two percentages are required, since defaulting
/// water level to 0 would read as an empty field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorSnapshot {
    #[serde(alias = "soil")]
    pub soil_moisture_percent: f64,
    #[serde(alias = "waterPercent")]
    pub water_level_percent: f64,
    #[serde(default)]
    pub gate_open: bool,
    #[serde(default)]
    pub gate_is_moving: bool,
    #[serde(default, alias = "pending", deserialize_with = "lenient_action")]
    pub pending_auto_action: Option<GateAction>,
    #[serde(default, deserialize_with = "lenient_action")]
    pub auto_action: Option<GateAction>,
    #[serde(default, deserialize_with = "lenient_time")]
    pub auto_action_time: Option<String>,
    #[serde(default, deserialize_with = "lenient_action")]
    pub manual_action: Option<GateAction>,
    #[serde(default, deserialize_with = "lenient_time")]
    pub manual_action_time: Option<String>,
    #[serde(default)]
    pub open_limit_reached: bool,
    #[serde(default)]
    pub close_limit_reached: bool,
}

impl SensorSnapshot {
    /// Reject readings outside [0, 100]; the whole poll is then discarded.
    pub fn validate(&self) -> Result<(), String> {
        for (name, v) in [
            ("soil moisture", self.soil_moisture_percent),
            ("water level", self.water_level_percent),
        ] {
            if !(0.0..=100.0).contains(&v) {
                return Err(format!("{name} {v} out of range [0, 100]"));
            }
        }
        Ok(())
    }
}

/// `""`, `null` and unknown words all mean "no action".
fn lenient_action<'de, D>(d: D) -> Result<Option<GateAction>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(d)?;
    Ok(raw.as_deref().and_then(GateAction::parse))
}

/// Event times arrive as strings or as millisecond counters.
fn lenient_time<'de, D>(d: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<serde_json::Value> = Option::deserialize(d)?;
    Ok(match raw {
        Some(serde_json::Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

// ---------------------------------------------------------------------------
// Results and errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandResult {
    Applied,
    AlreadyInState,
    Unexpected(u16),
}

impl CommandResult {
    pub fn from_status(status: u16) -> Self {
        match status {
            200 => Self::Applied,
            202 => Self::AlreadyInState,
            other => Self::Unexpected(other),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// Network failure, timeout, bad status on `/data`, or unparsable body.
    #[error("device unreachable: {0}")]
    Unreachable(String),
}

// ---------------------------------------------------------------------------
// Device seam
// ---------------------------------------------------------------------------

pub trait GateDevice: Clone + Send + Sync + 'static {
    fn poll(
        &self,
        address: &str,
    ) -> impl Future<Output = Result<SensorSnapshot, DeviceError>> + Send;

    fn command(
        &self,
        address: &str,
        action: GateAction,
    ) -> impl Future<Output = Result<CommandResult, DeviceError>> + Send;
}

/// Accepts a bare address (`192.168.1.55`, `127.0.0.1:8081`) or a full
/// `http://` base URL.
pub fn base_url(address: &str) -> String {
    let trimmed = address.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

#[derive(Clone)]
pub struct HttpDevice {
    client: reqwest::Client,
}

impl HttpDevice {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .context("failed to build device http client")?;
        Ok(Self { client })
    }
}

impl GateDevice for HttpDevice {
    async fn poll(&self, address: &str) -> Result<SensorSnapshot, DeviceError> {
        let url = format!("{}/data", base_url(address));
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| DeviceError::Unreachable(format!("GET {url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeviceError::Unreachable(format!("GET {url}: status {status}")));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| DeviceError::Unreachable(format!("GET {url}: {e}")))?;
        let snapshot: SensorSnapshot = serde_json::from_slice(&body)
            .map_err(|e| DeviceError::Unreachable(format!("bad /data payload: {e}")))?;
        snapshot
            .validate()
            .map_err(|e| DeviceError::Unreachable(format!("bad /data payload: {e}")))?;
        Ok(snapshot)
    }

    async fn command(
        &self,
        address: &str,
        action: GateAction,
    ) -> Result<CommandResult, DeviceError> {
        let url = format!("{}/{}", base_url(address), action.as_str());
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| DeviceError::Unreachable(format!("GET {url}: {e}")))?;

        let status = response.status().as_u16();
        // Body carries no information beyond the status; keep it for the logs.
        let body = response.text().await.unwrap_or_default();
        debug!(%url, status, body = %body.trim(), "device command answered");
        Ok(CommandResult::from_status(status))
    }
}

// ===========================================================================
// Tests
// ===========================================================================


// ---------------------------------------------------------------------------
// Scripted device for controller/command tests
// ---------------------------------------------------------------------------
