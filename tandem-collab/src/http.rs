//! HTTP endpoints for checkpoints.
//!
//! | Method | Path                               | Result                       |
//! |--------|------------------------------------|------------------------------|
//! | GET    | `/diagrams/{diagram_id}/versions`  | `200 [VersionSummary]`       |
//! | POST   | `/diagrams/{diagram_id}/versions`  | `201 VersionSummary`         |
//! | POST   | `/versions/{version_id}/restore`   | `200 { "diagram_id": .. }`   |
//!
//! Identity resolution happens upstream; the resolved user id arrives in the
//! `x-user-id` header.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::versions::{VersionError, VersionService, VersionSummary};

/// Header carrying the authenticated user id.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Shared state for version handlers
#[derive(Clone)]
pub struct ApiState {
    pub versions: Arc<VersionService>,
}

/// Body of a create request. The whole body is optional.
#[derive(Debug, Default, Deserialize)]
pub struct CreateVersionRequest {
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RestoreResponse {
    pub diagram_id: Uuid,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing or invalid x-user-id header")]
    Unauthorized,
    #[error("malformed request body: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Version(#[from] VersionError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Version(VersionError::DiagramNotFound(_))
            | ApiError::Version(VersionError::VersionNotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Version(VersionError::Storage(_)) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, ApiError::Version(e) if e.is_retryable())
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    retryable: bool,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            log::error!("Version request failed: {self}");
        }
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
                retryable: self.retryable(),
            }),
        )
            .into_response()
    }
}

pub fn version_routes(versions: Arc<VersionService>) -> Router {
    Router::new()
        .route(
            "/diagrams/{diagram_id}/versions",
            get(list_versions).post(create_version),
        )
        .route("/versions/{version_id}/restore", post(restore_version))
        .with_state(ApiState { versions })
}

fn user_id(headers: &HeaderMap) -> Result<Uuid, ApiError> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v.trim()).ok())
        .ok_or(ApiError::Unauthorized)
}

fn parse_create(body: &[u8]) -> Result<CreateVersionRequest, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(CreateVersionRequest::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(e.to_string()))
}

async fn list_versions(
    State(state): State<ApiState>,
    Path(diagram_id): Path<Uuid>,
) -> Result<Json<Vec<VersionSummary>>, ApiError> {
    Ok(Json(state.versions.list_versions(diagram_id).await?))
}

async fn create_version(
    State(state): State<ApiState>,
    Path(diagram_id): Path<Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<VersionSummary>), ApiError> {
    let created_by = user_id(&headers)?;
    let request = parse_create(&body)?;
    let version = state
        .versions
        .create_version(diagram_id, request.message, created_by)
        .await?;
    Ok((StatusCode::CREATED, Json(version.summary())))
}

async fn restore_version(
    State(state): State<ApiState>,
    Path(version_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<RestoreResponse>, ApiError> {
    let user = user_id(&headers)?;
    let diagram_id = state.versions.restore_version(version_id).await?;
    log::debug!("User {user} restored version {version_id}");
    Ok(Json(RestoreResponse { diagram_id }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreError;

    #[test]
    fn test_error_status_mapping() {
        let id = Uuid::new_v4();
        assert_eq!(ApiError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ApiError::from(VersionError::DiagramNotFound(id)).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(VersionError::VersionNotFound(id)).status(),
            StatusCode::NOT_FOUND
        );
        let storage = ApiError::from(VersionError::Storage(StoreError::Database("x".into())));
        assert_eq!(storage.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(storage.retryable());
    }

    #[test]
    fn test_user_id_header() {
        let mut headers = HeaderMap::new();
        assert!(matches!(user_id(&headers), Err(ApiError::Unauthorized)));

        headers.insert(USER_ID_HEADER, "not-a-uuid".parse().unwrap());
        assert!(user_id(&headers).is_err());

        let id = Uuid::new_v4();
        headers.insert(USER_ID_HEADER, id.to_string().parse().unwrap());
        assert_eq!(user_id(&headers).unwrap(), id);
    }

    #[test]
    fn test_create_body_is_optional() {
        assert!(parse_create(b"").unwrap().message.is_none());
        assert!(parse_create(b"  \n").unwrap().message.is_none());
        assert!(parse_create(b"{}").unwrap().message.is_none());
        assert_eq!(
            parse_create(br#"{"message":"initial"}"#).unwrap().message.as_deref(),
            Some("initial")
        );
        assert!(matches!(parse_create(b"{nope"), Err(ApiError::BadRequest(_))));
    }
}
