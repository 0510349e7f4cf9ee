//! Journey REST API endpoints: definitions, executions, automation rules.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use salesflow_core::ContactId;
use salesflow_journey::schema::{self, StepTypeInfo};
use salesflow_journey::trigger::{AutomationRule, NewAutomationRule, TriggerEvent};
use salesflow_journey::types::{
    ExecutionStatus, ExecutionStepAttempt, ExecutionView, Journey, JourneyDetail, JourneyPatch,
    NewJourney, Page, StepType,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

use crate::rest::{ApiError, AppState, Tenant};

type ApiResult<T> = Result<T, ApiError>;

// ─── Journeys ──────────────────────────────────────────────────────────────

/// POST /api/v1/journeys: Create a draft journey with its steps.
pub async fn create_journey(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Json(req): Json<NewJourney>,
) -> ApiResult<(StatusCode, Json<JourneyDetail>)> {
    let journey = state.runtime.definitions.create(&tenant, req)?;
    let detail = state.runtime.definitions.detail(&tenant, journey.id).await?;
    metrics::counter!("api.journeys.created").increment(1);
    Ok((StatusCode::CREATED, Json(detail)))
}

pub async fn list_journeys(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
) -> Json<Vec<Journey>> {
    Json(state.runtime.definitions.list(&tenant))
}

/// GET /api/v1/journeys/:id: Journey with steps and execution counts.
pub async fn get_journey(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<JourneyDetail>> {
    Ok(Json(state.runtime.definitions.detail(&tenant, id).await?))
}

pub async fn update_journey(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<Uuid>,
    Json(patch): Json<JourneyPatch>,
) -> ApiResult<Json<Journey>> {
    Ok(Json(state.runtime.definitions.update(&tenant, id, patch)?))
}

/// DELETE /api/v1/journeys/:id: Soft delete; refused while executions are live.
pub async fn delete_journey(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.runtime.definitions.delete(&tenant, id).await?;
    metrics::counter!("api.journeys.deleted").increment(1);
    Ok(StatusCode::NO_CONTENT)
}

pub async fn publish_journey(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Journey>> {
    Ok(Json(state.runtime.definitions.publish(&tenant, id)?))
}

pub async fn archive_journey(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Journey>> {
    Ok(Json(state.runtime.definitions.archive(&tenant, id).await?))
}

#[derive(Debug, Serialize)]
pub struct CancelledResponse {
    pub cancelled: usize,
    pub execution_ids: Vec<Uuid>,
}

/// POST /api/v1/journeys/:id/cancel-executions: Cancel every live execution.
pub async fn cancel_journey_executions(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<CancelledResponse>> {
    let cancelled = state.runtime.gateway.cancel_for_journey(&tenant, id).await?;
    info!(journey_id = %id, cancelled = cancelled.len(), "Journey executions cancelled");
    Ok(Json(CancelledResponse {
        cancelled: cancelled.len(),
        execution_ids: cancelled.iter().map(|e| e.id).collect(),
    }))
}

// ─── Step types ────────────────────────────────────────────────────────────

pub async fn list_step_types() -> Json<Vec<StepTypeInfo>> {
    Json(schema::step_types())
}

#[derive(Debug, Deserialize)]
pub struct StepTypeQuery {
    pub step_type: StepType,
}

/// GET /api/v1/journeys/step-types/schema?step_type=...: JSON schema of a
/// step type's config object.
pub async fn step_type_schema(Query(query): Query<StepTypeQuery>) -> Json<serde_json::Value> {
    Json(schema::config_schema(query.step_type))
}

// ─── Executions ────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    pub created: bool,
    pub next_step_at: Option<DateTime<Utc>>,
}

/// POST /api/v1/journeys/:id/contacts/:contact_id/run: Start a journey for
/// a contact. 201 for a new execution, 200 when one was already active.
pub async fn run_for_contact(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path((journey_id, contact_id)): Path<(Uuid, String)>,
) -> ApiResult<(StatusCode, Json<RunResponse>)> {
    let outcome = state
        .runtime
        .gateway
        .start_journey(&tenant, journey_id, ContactId::new(contact_id))
        .await?;
    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(RunResponse {
            execution_id: outcome.execution.id,
            status: outcome.execution.status,
            created: outcome.created,
            next_step_at: outcome.execution.next_step_at,
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ExecutionListQuery {
    pub status: Option<ExecutionStatus>,
    pub page: Option<usize>,
    pub per_page: Option<usize>,
}

pub async fn list_executions(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(journey_id): Path<Uuid>,
    Query(query): Query<ExecutionListQuery>,
) -> ApiResult<Json<Page<ExecutionView>>> {
    let page = state
        .runtime
        .engine
        .list_executions(&tenant, journey_id, query.status, query.page, query.per_page)
        .await?;
    Ok(Json(page))
}

pub async fn get_execution(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ExecutionView>> {
    Ok(Json(state.runtime.engine.execution_view(&tenant, id).await?))
}

pub async fn execution_attempts(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<ExecutionStepAttempt>>> {
    Ok(Json(state.runtime.engine.attempts(&tenant, id).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    pub reason: Option<String>,
}

/// POST /api/v1/executions/:id/cancel: Idempotent on terminal executions.
pub async fn cancel_execution(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<Uuid>,
    body: Option<Json<CancelRequest>>,
) -> ApiResult<Json<ExecutionView>> {
    let reason = body
        .and_then(|Json(req)| req.reason)
        .unwrap_or_else(|| "cancelled via api".to_string());
    state
        .runtime
        .gateway
        .cancel_execution(&tenant, id, &reason)
        .await?;
    Ok(Json(state.runtime.engine.execution_view(&tenant, id).await?))
}

/// POST /api/v1/contacts/:contact_id/unsubscribe: Cancel everything the
/// contact is enrolled in.
pub async fn unsubscribe_contact(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(contact_id): Path<String>,
) -> ApiResult<Json<CancelledResponse>> {
    let contact = ContactId::new(contact_id);
    let cancelled = state
        .runtime
        .gateway
        .cancel_for_contact(&tenant, &contact)
        .await?;
    metrics::counter!("api.contacts.unsubscribed").increment(1);
    Ok(Json(CancelledResponse {
        cancelled: cancelled.len(),
        execution_ids: cancelled.iter().map(|e| e.id).collect(),
    }))
}

// ─── Automation ────────────────────────────────────────────────────────────

pub async fn list_rules(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
) -> Json<Vec<AutomationRule>> {
    Json(state.runtime.gateway.list_rules(&tenant))
}

pub async fn create_rule(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Json(req): Json<NewAutomationRule>,
) -> ApiResult<(StatusCode, Json<AutomationRule>)> {
    let rule = state.runtime.gateway.register_rule(&tenant, req)?;
    Ok((StatusCode::CREATED, Json(rule)))
}

pub async fn delete_rule(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.runtime.gateway.remove_rule(&tenant, id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct EventRequest {
    pub contact_id: String,
    pub event_name: String,
    #[serde(default)]
    pub properties: HashMap<String, serde_json::Value>,
    pub occurred_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct EventResponse {
    pub started: usize,
    pub executions: Vec<RunResponse>,
}

/// POST /api/v1/automation/events: Feed a contact event to the automation
/// rules.
pub async fn ingest_event(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Json(req): Json<EventRequest>,
) -> ApiResult<(StatusCode, Json<EventResponse>)> {
    if req.contact_id.trim().is_empty() || req.event_name.trim().is_empty() {
        return Err(ApiError::bad_request(
            "contact_id and event_name must not be empty",
        ));
    }
    let outcomes = state
        .runtime
        .gateway
        .handle_event(TriggerEvent {
            tenant_id: tenant,
            contact_id: ContactId::new(req.contact_id),
            event_name: req.event_name,
            properties: req.properties,
            occurred_at: req.occurred_at,
        })
        .await?;
    metrics::counter!("api.automation.events").increment(1);
    let executions: Vec<RunResponse> = outcomes
        .into_iter()
        .map(|o| RunResponse {
            execution_id: o.execution.id,
            status: o.execution.status,
            created: o.created,
            next_step_at: o.execution.next_step_at,
        })
        .collect();
    Ok((
        StatusCode::ACCEPTED,
        Json(EventResponse {
            started: executions.iter().filter(|e| e.created).count(),
            executions,
        }),
    ))
}
