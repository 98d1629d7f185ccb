//! JSON API over the running sessions. Every `/api` route acts on behalf of
//! the user named by the `x-user-id` header.

use anyhow::{Context, Result};
use axum::extract::{FromRequestParts, Query};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info};

use crate::command::{CommandError, CommandOutcome, CommandReport};
use crate::device::GateDevice;
use crate::plan::{self, FarmingPlan, PlanError};
use crate::session::{Registry, SessionHandle};
use crate::state::StatusResponse;
use crate::store::{
    GateAction, GateActionRecord, NotificationRecord, NotificationStream, Store, TriggeredBy,
};

pub const USER_HEADER: &str = "x-user-id";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("missing or unknown x-user-id header")]
    Unauthorized,
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Command(CommandError::ConcurrentCommandRejected) => StatusCode::CONFLICT,
            ApiError::Command(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Plan(PlanError::NoPlan) => StatusCode::NOT_FOUND,
            ApiError::Plan(PlanError::Invalid(_) | PlanError::InvalidAmount) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Plan(PlanError::Store(_)) | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            error!("api error: {self:#}");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Current user
// ---------------------------------------------------------------------------

/// The session of the user making the request.
pub struct CurrentSession<S, D>(pub SessionHandle<S, D>);

impl<S: Store, D: GateDevice> FromRequestParts<Registry<S, D>> for CurrentSession<S, D> {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        sessions: &Registry<S, D>,
    ) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .ok_or(ApiError::Unauthorized)?;
        sessions
            .get(user_id)
            .cloned()
            .map(CurrentSession)
            .ok_or(ApiError::Unauthorized)
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router<S: Store, D: GateDevice>(sessions: Registry<S, D>) -> Router {
    Router::new()
        .route("/api/status", get(api_status::<S, D>))
        .route("/api/gate/open", post(gate_open::<S, D>))
        .route("/api/gate/close", post(gate_close::<S, D>))
        .route("/api/gate/emergency-close", post(gate_emergency_close::<S, D>))
        .route(
            "/api/gate/actions",
            get(list_actions::<S, D>).delete(clear_actions::<S, D>),
        )
        .route(
            "/api/notifications",
            get(list_notifications::<S, D>).delete(clear_notifications::<S, D>),
        )
        .route("/api/notifications/unseen", get(unseen_notifications::<S, D>))
        .route("/api/notifications/seen", post(mark_seen::<S, D>))
        .route(
            "/api/plan",
            get(get_plan::<S, D>)
                .put(put_plan::<S, D>)
                .delete(delete_plan::<S, D>),
        )
        .route("/api/plan/progress", get(plan_progress::<S, D>))
        .route("/api/harvest", post(harvest::<S, D>))
        .route("/api/harvests", get(list_harvests::<S, D>))
        .route("/api/harvests/summary", get(harvest_summary::<S, D>))
        .with_state(sessions)
}

// -- Status -----------------------------------------------------------------

#[derive(Serialize)]
struct StatusBody {
    name: String,
    #[serde(flatten)]
    status: StatusResponse,
    latest_gate_action: Option<GateActionRecord>,
}

async fn api_status<S: Store, D: GateDevice>(
    CurrentSession(s): CurrentSession<S, D>,
) -> Result<Json<StatusBody>, ApiError> {
    let unseen = s.ledger.unseen_count().await?;
    let latest = s.ledger.store().latest_gate_action(&s.user_id).await?;
    let status = s.state.read().await.to_status(Instant::now(), unseen);
    Ok(Json(StatusBody {
        name: s.name,
        status,
        latest_gate_action: latest,
    }))
}

// -- Gate commands ----------------------------------------------------------

fn command_response(report: CommandReport) -> Response {
    let status = match report.outcome {
        CommandOutcome::Applied | CommandOutcome::AlreadyInState => StatusCode::OK,
        CommandOutcome::Unexpected { .. } => StatusCode::BAD_GATEWAY,
    };
    (status, Json(report)).into_response()
}

async fn gate_open<S: Store, D: GateDevice>(
    CurrentSession(s): CurrentSession<S, D>,
) -> Result<Response, ApiError> {
    let report = s.service.execute(GateAction::Open, TriggeredBy::Manual).await?;
    Ok(command_response(report))
}

async fn gate_close<S: Store, D: GateDevice>(
    CurrentSession(s): CurrentSession<S, D>,
) -> Result<Response, ApiError> {
    let report = s.service.execute(GateAction::Close, TriggeredBy::Manual).await?;
    Ok(command_response(report))
}

async fn gate_emergency_close<S: Store, D: GateDevice>(
    CurrentSession(s): CurrentSession<S, D>,
) -> Result<Response, ApiError> {
    let report = s.service.emergency_close().await?;
    Ok(command_response(report))
}

// -- Gate history -----------------------------------------------------------

#[derive(Deserialize)]
struct ActionsQuery {
    limit: Option<u32>,
}

async fn list_actions<S: Store, D: GateDevice>(
    CurrentSession(s): CurrentSession<S, D>,
    Query(q): Query<ActionsQuery>,
) -> Result<Json<Vec<GateActionRecord>>, ApiError> {
    Ok(Json(s.ledger.gate_actions(q.limit).await?))
}

async fn clear_actions<S: Store, D: GateDevice>(
    CurrentSession(s): CurrentSession<S, D>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deleted = s.ledger.clear_gate_actions().await?;
    info!(user = %s.user_id, deleted, "gate action history cleared");
    Ok(Json(json!({ "deleted": deleted })))
}

// -- Notifications ----------------------------------------------------------

#[derive(Deserialize)]
struct NotificationsQuery {
    stream: Option<NotificationStream>,
}

async fn list_notifications<S: Store, D: GateDevice>(
    CurrentSession(s): CurrentSession<S, D>,
    Query(q): Query<NotificationsQuery>,
) -> Result<Json<Vec<NotificationRecord>>, ApiError> {
    Ok(Json(s.ledger.notifications(q.stream).await?))
}

async fn unseen_notifications<S: Store, D: GateDevice>(
    CurrentSession(s): CurrentSession<S, D>,
) -> Result<Json<serde_json::Value>, ApiError> {
    Ok(Json(json!({ "unseen": s.ledger.unseen_count().await? })))
}

async fn mark_seen<S: Store, D: GateDevice>(
    CurrentSession(s): CurrentSession<S, D>,
) -> Result<Json<serde_json::Value>, ApiError> {
    Ok(Json(json!({ "marked": s.ledger.mark_all_seen().await? })))
}

async fn clear_notifications<S: Store, D: GateDevice>(
    CurrentSession(s): CurrentSession<S, D>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deleted = s.ledger.clear_notifications().await?;
    info!(user = %s.user_id, deleted, "notifications cleared");
    Ok(Json(json!({ "deleted": deleted })))
}

// -- Farming plan -----------------------------------------------------------

async fn get_plan<S: Store, D: GateDevice>(
    CurrentSession(s): CurrentSession<S, D>,
) -> Result<Json<FarmingPlan>, ApiError> {
    let plan = s.ledger.store().get_plan(&s.user_id).await?;
    Ok(Json(plan.ok_or(PlanError::NoPlan)?))
}

/// Create or replace the plan. Stages falling on today are announced
/// straight away rather than at the next background check.
async fn put_plan<S: Store, D: GateDevice>(
    CurrentSession(s): CurrentSession<S, D>,
    Json(body): Json<FarmingPlan>,
) -> Result<Json<plan::Progress>, ApiError> {
    plan::save_plan(s.ledger.store(), &s.user_id, &body).await?;
    let today = s.ledger.today();
    plan::announce_stages(&s.ledger, &body, today).await;
    Ok(Json(body.progress(today)))
}

async fn delete_plan<S: Store, D: GateDevice>(
    CurrentSession(s): CurrentSession<S, D>,
) -> Result<StatusCode, ApiError> {
    if s.ledger.store().delete_plan(&s.user_id).await? {
        info!(user = %s.user_id, "farming plan deleted");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(PlanError::NoPlan.into())
    }
}

async fn plan_progress<S: Store, D: GateDevice>(
    CurrentSession(s): CurrentSession<S, D>,
) -> Result<Json<plan::Progress>, ApiError> {
    let plan = s
        .ledger
        .store()
        .get_plan(&s.user_id)
        .await?
        .ok_or(PlanError::NoPlan)?;
    Ok(Json(plan.progress(s.ledger.today())))
}

// -- Harvests ---------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HarvestRequest {
    harvest_amount: f64,
}

async fn harvest<S: Store, D: GateDevice>(
    CurrentSession(s): CurrentSession<S, D>,
    Json(body): Json<HarvestRequest>,
) -> Result<(StatusCode, Json<plan::HarvestRecord>), ApiError> {
    let record = plan::record_harvest(
        s.ledger.store(),
        &s.user_id,
        body.harvest_amount,
        s.ledger.today(),
    )
    .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn list_harvests<S: Store, D: GateDevice>(
    CurrentSession(s): CurrentSession<S, D>,
) -> Result<Json<Vec<plan::HarvestRecord>>, ApiError> {
    Ok(Json(s.ledger.store().harvests(&s.user_id).await?))
}

async fn harvest_summary<S: Store, D: GateDevice>(
    CurrentSession(s): CurrentSession<S, D>,
) -> Result<Json<plan::HarvestSummary>, ApiError> {
    let history = s.ledger.store().harvests(&s.user_id).await?;
    Ok(Json(plan::summarize_harvests(&history)))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve<S: Store, D: GateDevice>(
    sessions: Registry<S, D>,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("api listening on http://{addr}");

    axum::serve(listener, router(sessions))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
