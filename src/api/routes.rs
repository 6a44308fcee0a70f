//! REST endpoints. Handlers are thin: parse, call the engine, map the
//! outcome. Race-lost outcomes answer 409 with the outcome as the body.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ApiError;
use crate::approvals::model::ApprovalOutcome;
use crate::completion::model::ExtraWorkOutcome;
use crate::edge_case::model::{DecisionOutcome, EdgeCaseChoice};
use crate::engine::Engine;
use crate::jobs::model::NewJob;
use crate::offers::model::{AcceptOutcome, DeclineOutcome};
use crate::rooms::model::{RoomEvidence, RoomSpec};

/// Shared state for every route.
#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<Engine>,
}

/// Build the router for the engine's REST surface.
pub fn engine_routes(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/jobs", post(register_job))
        .route("/api/jobs/{id}", get(job_snapshot))
        .route("/api/jobs/{id}/rooms", post(partition_rooms))
        .route("/api/jobs/{id}/cancel", post(cancel_job))
        .route("/api/jobs/{id}/settle", post(settle_job))
        .route("/api/jobs/{id}/join-requests", post(request_join))
        .route("/api/jobs/{id}/workers/{cleaner}/start", post(start_worker))
        .route("/api/jobs/{id}/workers/{cleaner}/drop-out", post(drop_out))
        .route("/api/jobs/{id}/workers/{cleaner}/complete", post(complete_worker))
        .route("/api/appointments/{appointment_id}", delete(delete_appointment))
        .route("/api/offers/{id}/accept", post(accept_offer))
        .route("/api/offers/{id}/decline", post(decline_offer))
        .route("/api/join-requests/{id}/approve", post(approve_join))
        .route("/api/join-requests/{id}/decline", post(decline_join))
        .route("/api/rooms/{id}/assign", post(assign_room))
        .route("/api/rooms/{id}/start", post(start_room))
        .route("/api/rooms/{id}/complete", post(complete_room))
        .route("/api/extra-work/{id}/accept", post(accept_extra_work))
        .route("/api/extra-work/{id}/decline", post(decline_extra_work))
        .route("/api/decisions/{id}", post(decide))
        .with_state(ApiState { engine })
}

type ApiResult<T> = Result<T, ApiError>;

/// 200 with the outcome, or 409 when the caller lost a race.
fn outcome<T: Serialize>(race_lost: bool, body: T) -> (StatusCode, Json<T>) {
    let status = if race_lost {
        StatusCode::CONFLICT
    } else {
        StatusCode::OK
    };
    (status, Json(body))
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "crew-engine"
    }))
}

// ── Request bodies ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RegisterJob {
    #[serde(flatten)]
    job: NewJob,
    #[serde(default)]
    rooms: Vec<RoomSpec>,
}

#[derive(Deserialize)]
struct Rooms {
    rooms: Vec<RoomSpec>,
}

#[derive(Deserialize)]
struct Cleaner {
    cleaner_id: String,
}

#[derive(Deserialize)]
struct CleanerDecline {
    cleaner_id: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
struct Requester {
    requester_id: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
struct CompleteRoom {
    cleaner_id: String,
    #[serde(flatten)]
    evidence: RoomEvidence,
}

#[derive(Deserialize)]
struct CancelJob {
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
struct Decide {
    requester_id: String,
    choice: EdgeCaseChoice,
}

// ── Jobs ────────────────────────────────────────────────────────────────

async fn register_job(
    State(state): State<ApiState>,
    Json(body): Json<RegisterJob>,
) -> ApiResult<impl IntoResponse> {
    let job = state.engine.register_job(body.job, body.rooms).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

async fn job_snapshot(State(state): State<ApiState>, Path(id): Path<Uuid>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.snapshot(id).await?))
}

async fn partition_rooms(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(body): Json<Rooms>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.partitioner().partition(id, &body.rooms).await?))
}

async fn cancel_job(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    body: Option<Json<CancelJob>>,
) -> ApiResult<impl IntoResponse> {
    let reason = body
        .and_then(|Json(b)| b.reason)
        .unwrap_or_else(|| "requester cancelled".into());
    Ok(Json(state.engine.edge_cases().cancel_job(id, &reason).await?))
}

async fn settle_job(State(state): State<ApiState>, Path(id): Path<Uuid>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.settlement().settle(id).await?))
}

async fn request_join(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(body): Json<Cleaner>,
) -> ApiResult<impl IntoResponse> {
    let request = state.engine.approvals().request(id, &body.cleaner_id).await?;
    Ok((StatusCode::CREATED, Json(request)))
}

async fn delete_appointment(
    State(state): State<ApiState>,
    Path(appointment_id): Path<String>,
) -> ApiResult<StatusCode> {
    if state.engine.delete_for_appointment(&appointment_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Ok(StatusCode::NOT_FOUND)
    }
}

// ── Workers ─────────────────────────────────────────────────────────────

async fn start_worker(
    State(state): State<ApiState>,
    Path((id, cleaner)): Path<(Uuid, String)>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.completion().start(id, &cleaner).await?))
}

async fn drop_out(
    State(state): State<ApiState>,
    Path((id, cleaner)): Path<(Uuid, String)>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.completion().drop_out(id, &cleaner).await?))
}

async fn complete_worker(
    State(state): State<ApiState>,
    Path((id, cleaner)): Path<(Uuid, String)>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.completion().mark_completed(id, &cleaner).await?))
}

// ── Offers ──────────────────────────────────────────────────────────────

async fn accept_offer(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(body): Json<Cleaner>,
) -> ApiResult<impl IntoResponse> {
    let result = state.engine.offers().accept(id, &body.cleaner_id).await?;
    let lost = !matches!(result, AcceptOutcome::Accepted { .. });
    Ok(outcome(lost, result))
}

async fn decline_offer(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(body): Json<CleanerDecline>,
) -> ApiResult<impl IntoResponse> {
    let result = state
        .engine
        .offers()
        .decline(id, &body.cleaner_id, body.reason.as_deref())
        .await?;
    let lost = matches!(result, DeclineOutcome::NoLongerPending { .. });
    Ok(outcome(lost, result))
}

// ── Join requests ───────────────────────────────────────────────────────

async fn approve_join(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(body): Json<Requester>,
) -> ApiResult<impl IntoResponse> {
    let result = state.engine.approvals().approve(id, &body.requester_id).await?;
    let lost = !matches!(result, ApprovalOutcome::Approved { .. });
    Ok(outcome(lost, result))
}

async fn decline_join(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(body): Json<Requester>,
) -> ApiResult<impl IntoResponse> {
    let result = state
        .engine
        .approvals()
        .decline(id, &body.requester_id, body.reason.as_deref())
        .await?;
    let lost = matches!(result, ApprovalOutcome::NoLongerPending { .. });
    Ok(outcome(lost, result))
}

// ── Rooms ───────────────────────────────────────────────────────────────

async fn assign_room(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(body): Json<Cleaner>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.partitioner().assign(id, &body.cleaner_id).await?))
}

async fn start_room(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(body): Json<Cleaner>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.completion().start_room(id, &body.cleaner_id).await?))
}

async fn complete_room(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(body): Json<CompleteRoom>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(
        state
            .engine
            .completion()
            .complete_room(id, &body.cleaner_id, body.evidence)
            .await?,
    ))
}

// ── Extra work ──────────────────────────────────────────────────────────

async fn accept_extra_work(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(body): Json<Cleaner>,
) -> ApiResult<impl IntoResponse> {
    let result = state
        .engine
        .completion()
        .accept_extra_work(id, &body.cleaner_id)
        .await?;
    let lost = matches!(result, ExtraWorkOutcome::NoLongerAvailable { .. });
    Ok(outcome(lost, result))
}

async fn decline_extra_work(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(body): Json<CleanerDecline>,
) -> ApiResult<impl IntoResponse> {
    let reason = body.reason.as_deref().unwrap_or("declined");
    let result = state
        .engine
        .completion()
        .decline_extra_work(id, &body.cleaner_id, reason)
        .await?;
    let lost = matches!(result, ExtraWorkOutcome::NoLongerAvailable { .. });
    Ok(outcome(lost, result))
}

// ── Edge-case decisions ─────────────────────────────────────────────────

async fn decide(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(body): Json<Decide>,
) -> ApiResult<impl IntoResponse> {
    let result = state
        .engine
        .edge_cases()
        .decide(id, &body.requester_id, body.choice)
        .await?;
    let lost = matches!(result, DecisionOutcome::NoLongerPending { .. });
    Ok(outcome(lost, result))
}
