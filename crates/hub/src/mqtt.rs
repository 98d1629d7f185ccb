//! Push surface: every ledger event is forwarded as JSON over MQTT
//! (`notify/<user_id>` for notifications, `gate/<user_id>/action` for
//! actuations). Publishing is QoS 0 and never waits on the broker; a full
//! queue or a dropped connection loses the push, not the persisted record.

use anyhow::{anyhow, Result};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::ledger::LedgerEvent;
use crate::store::{GateAction, NotificationStream, TriggeredBy};

const CLIENT_ID: &str = "paddy-hub";

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PushMessage<'a> {
    Notification {
        stream: NotificationStream,
        title: &'a str,
        description: &'a str,
        #[serde(with = "time::serde::rfc3339")]
        timestamp: OffsetDateTime,
    },
    GateAction {
        action: GateAction,
        triggered_by: TriggeredBy,
        #[serde(with = "time::serde::rfc3339")]
        timestamp: OffsetDateTime,
    },
}

pub fn notify_topic(user_id: &str) -> String {
    format!("notify/{user_id}")
}

pub fn action_topic(user_id: &str) -> String {
    format!("gate/{user_id}/action")
}

/// Topic and JSON body for one ledger event.
pub fn encode(event: &LedgerEvent) -> Result<(String, Vec<u8>)> {
    let (topic, msg) = match event {
        LedgerEvent::Notification { user_id, record } => (
            notify_topic(user_id),
            PushMessage::Notification {
                stream: record.stream,
                title: &record.title,
                description: &record.description,
                timestamp: record.timestamp,
            },
        ),
        LedgerEvent::GateAction { user_id, record } => (
            action_topic(user_id),
            PushMessage::GateAction {
                action: record.action,
                triggered_by: record.triggered_by,
                timestamp: record.timestamp,
            },
        ),
    };
    Ok((topic, serde_json::to_vec(&msg)?))
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

pub trait PushSink: Send + 'static {
    fn push(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
}

/// Non-blocking publish into the rumqttc request queue.
pub struct MqttSink(pub AsyncClient);

impl PushSink for MqttSink {
    fn push(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.0
            .try_publish(topic, QoS::AtMostOnce, false, payload)
            .map_err(|e| anyhow!("mqtt publish to {topic} failed: {e}"))
    }
}

/// Used when no broker is configured.
pub struct LogSink;

impl PushSink for LogSink {
    fn push(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        info!(%topic, payload = %String::from_utf8_lossy(&payload), "push");
        Ok(())
    }
}

pub fn connect(host: &str, port: u16) -> (AsyncClient, EventLoop) {
    let mut options = MqttOptions::new(CLIENT_ID, host, port);
    options.set_keep_alive(Duration::from_secs(30));
    AsyncClient::new(options, 64)
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Forward ledger events to `sink` until shutdown or the channel closes.
pub async fn forward_events<P: PushSink>(
    mut events: broadcast::Receiver<LedgerEvent>,
    sink: P,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => break,
            ev = events.recv() => ev,
        };
        match event {
            Ok(ev) => match encode(&ev) {
                Ok((topic, payload)) => {
                    if let Err(e) = sink.push(&topic, payload) {
                        warn!("{e:#}");
                    }
                }
                Err(e) => warn!("push encode failed: {e:#}"),
            },
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "push forwarder lagged; events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("push forwarder stopped");
}

/// Drive the rumqttc connection. Nothing is subscribed; the loop only keeps
/// the connection alive and flushes publishes.
pub async fn drive(mut eventloop: EventLoop, mut shutdown: watch::Receiver<bool>) {
    loop {
        let polled = tokio::select! {
            _ = shutdown.changed() => break,
            p = eventloop.poll() => p,
        };
        match polled {
            Ok(Event::Incoming(Packet::ConnAck(_))) => info!("mqtt connected"),
            Ok(Event::Incoming(Packet::Disconnect)) => warn!("mqtt disconnected"),
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}. reconnecting...");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
