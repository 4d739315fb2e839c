use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{header, HeaderValue},
    response::Response,
};
use tower::ServiceExt;
use tower_http::services::ServeFile;
use uuid::Uuid;

use crate::{auth::AuthUser, errors::ServiceError, AppState};

/// Stream a course or program file to an enrolled user
#[utoipa::path(
    get,
    path = "/api/v1/media/{id}",
    params(("id" = Uuid, Path, description = "Media file ID")),
    responses(
        (status = 200, description = "File bytes with the stored content type"),
        (status = 206, description = "Requested byte range"),
        (status = 403, description = "Enrollment required", body = crate::errors::ErrorResponse),
        (status = 404, description = "File not found", body = crate::errors::ErrorResponse),
    ),
    tag = "Media",
    security(("Bearer" = []))
)]
pub async fn download_media(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    auth_user: AuthUser,
    request: Request,
) -> Result<Response, ServiceError> {
    let content = state
        .services
        .media
        .open_media(id, &auth_user.actor())
        .await?;

    // ServeFile handles range and conditional requests
    let mut response = ServeFile::new(&content.path)
        .oneshot(request)
        .await
        .unwrap_or_else(|never| match never {})
        .map(Body::new);
    if !response.status().is_success() {
        return Ok(response);
    }

    let content_type = HeaderValue::from_str(&content.mime_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    let disposition = HeaderValue::from_str(&format!(
        "inline; filename=\"{}\"",
        content.file_name.replace('"', "")
    ))
    .unwrap_or_else(|_| HeaderValue::from_static("inline"));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(header::CONTENT_DISPOSITION, disposition);
    Ok(response)
}
