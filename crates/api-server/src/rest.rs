//! Shared REST state, error mapping, tenant extraction and operational
//! endpoints.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{FromRequestParts, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use salesflow_core::TenantId;
use salesflow_journey::{JourneyError, JourneyRuntime, ValidationIssue};
use serde::Serialize;
use tracing::error;
use uuid::Uuid;

/// Header carrying the caller's tenant.
pub const TENANT_HEADER: &str = "x-tenant-id";

/// Shared application state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<JourneyRuntime>,
    pub node_id: String,
    pub start_time: Instant,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issues: Option<Vec<ValidationIssue>>,
}

/// Error returned by every handler: a status plus an `ErrorResponse` body.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorResponse,
}

impl ApiError {
    pub fn new(status: StatusCode, error: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorResponse {
                error: error.to_string(),
                message: message.into(),
                issues: None,
            },
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }
}

impl From<JourneyError> for ApiError {
    fn from(err: JourneyError) -> Self {
        match err {
            JourneyError::Validation(issues) => {
                metrics::counter!("api.validation_errors").increment(1);
                Self {
                    status: StatusCode::UNPROCESSABLE_ENTITY,
                    body: ErrorResponse {
                        error: "validation_failed".to_string(),
                        message: format!("{} validation issue(s)", issues.len()),
                        issues: Some(issues),
                    },
                }
            }
            JourneyError::Conflict(message) => Self::new(StatusCode::CONFLICT, "conflict", message),
            // Another tenant's entity is indistinguishable from a missing one.
            JourneyError::NotFound { kind, id } | JourneyError::TenantMismatch { kind, id } => {
                Self::new(StatusCode::NOT_FOUND, "not_found", format!("{kind} {id} not found"))
            }
            other => {
                error!(error = %other, "Request failed");
                metrics::counter!("api.errors").increment(1);
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "Internal processing error",
                )
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// Tenant taken from the `x-tenant-id` header.
#[derive(Debug, Clone, Copy)]
pub struct Tenant(pub TenantId);

#[axum::async_trait]
impl<S> FromRequestParts<S> for Tenant
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(TENANT_HEADER)
            .ok_or_else(|| ApiError::bad_request(format!("missing {TENANT_HEADER} header")))?;
        let id = raw
            .to_str()
            .ok()
            .and_then(|s| Uuid::parse_str(s.trim()).ok())
            .ok_or_else(|| ApiError::bad_request(format!("{TENANT_HEADER} must be a UUID")))?;
        Ok(Tenant(TenantId(id)))
    }
}

/// GET /health: Health check endpoint.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        node_id: state.node_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

/// GET /ready: Readiness probe. The execution store must answer a due
/// query.
pub async fn readiness(State(state): State<AppState>) -> StatusCode {
    let now = state.runtime.clock.now();
    match state.runtime.executions.due(now, 1).await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            error!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// GET /live: Liveness probe.
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub uptime_secs: u64,
}
