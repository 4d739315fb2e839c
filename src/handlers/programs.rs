use axum::{
    extract::{Path, Query, State},
    response::Response,
    Json,
};
use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    entities::program_session::{Model as SessionModel, SessionStatus},
    errors::ServiceError,
    handlers::common::created_response,
    services::scheduling::SessionSlot,
    ApiResponse, ApiResult, AppState,
};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AvailabilityQuery {
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct Availability {
    pub coach_id: Uuid,
    pub available: bool,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct SessionStatusRequest {
    pub status: SessionStatus,
}

/// Whether a coach is free for a time range
#[utoipa::path(
    get,
    path = "/api/v1/coaches/{coach_id}/availability",
    params(
        ("coach_id" = Uuid, Path, description = "Coach ID"),
        ("date" = String, Query, description = "YYYY-MM-DD"),
        ("start" = String, Query, description = "HH:MM:SS"),
        ("end" = String, Query, description = "HH:MM:SS, after start"),
    ),
    responses(
        (status = 200, description = "Availability computed", body = Availability),
        (status = 400, description = "start is not before end", body = crate::errors::ErrorResponse),
    ),
    tag = "Scheduling",
    security(("Bearer" = []))
)]
pub async fn coach_availability(
    State(state): State<AppState>,
    Path(coach_id): Path<Uuid>,
    Query(query): Query<AvailabilityQuery>,
    _auth_user: AuthUser,
) -> ApiResult<Availability> {
    let available = state
        .services
        .scheduling
        .check_coach_availability(coach_id, query.date, query.start, query.end)
        .await?;
    Ok(Json(ApiResponse::success(Availability {
        coach_id,
        available,
    })))
}

/// Add a session to a program
#[utoipa::path(
    post,
    path = "/api/v1/programs/{program_id}/sessions",
    params(("program_id" = Uuid, Path, description = "Program ID")),
    request_body = SessionSlot,
    responses(
        (status = 201, description = "Session scheduled"),
        (status = 403, description = "Only the program's coach or an admin", body = crate::errors::ErrorResponse),
        (status = 409, description = "Coach already booked for that time", body = crate::errors::ErrorResponse),
    ),
    tag = "Scheduling",
    security(("Bearer" = []))
)]
pub async fn add_session(
    State(state): State<AppState>,
    Path(program_id): Path<Uuid>,
    auth_user: AuthUser,
    Json(slot): Json<SessionSlot>,
) -> Result<Response, ServiceError> {
    let session = state
        .services
        .scheduling
        .add_session(&auth_user.actor(), program_id, slot)
        .await?;
    Ok(created_response(session))
}

/// Move a scheduled session
#[utoipa::path(
    put,
    path = "/api/v1/programs/{program_id}/sessions/{session_id}",
    params(
        ("program_id" = Uuid, Path, description = "Program ID"),
        ("session_id" = Uuid, Path, description = "Session ID"),
    ),
    request_body = SessionSlot,
    responses(
        (status = 200, description = "Session rescheduled"),
        (status = 409, description = "Coach already booked, or session no longer scheduled", body = crate::errors::ErrorResponse),
    ),
    tag = "Scheduling",
    security(("Bearer" = []))
)]
pub async fn update_session(
    State(state): State<AppState>,
    Path((program_id, session_id)): Path<(Uuid, Uuid)>,
    auth_user: AuthUser,
    Json(slot): Json<SessionSlot>,
) -> ApiResult<SessionModel> {
    let session = state
        .services
        .scheduling
        .update_session(&auth_user.actor(), program_id, session_id, slot)
        .await?;
    Ok(Json(ApiResponse::success(session)))
}

/// Complete or cancel a scheduled session
#[utoipa::path(
    put,
    path = "/api/v1/programs/{program_id}/sessions/{session_id}/status",
    params(
        ("program_id" = Uuid, Path, description = "Program ID"),
        ("session_id" = Uuid, Path, description = "Session ID"),
    ),
    request_body = SessionStatusRequest,
    responses(
        (status = 200, description = "Status updated"),
        (status = 409, description = "Transition not allowed", body = crate::errors::ErrorResponse),
    ),
    tag = "Scheduling",
    security(("Bearer" = []))
)]
pub async fn update_session_status(
    State(state): State<AppState>,
    Path((program_id, session_id)): Path<(Uuid, Uuid)>,
    auth_user: AuthUser,
    Json(payload): Json<SessionStatusRequest>,
) -> ApiResult<SessionModel> {
    let session = state
        .services
        .scheduling
        .update_session_status(&auth_user.actor(), program_id, session_id, payload.status)
        .await?;
    Ok(Json(ApiResponse::success(session)))
}
