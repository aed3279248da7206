//! REST API handlers for journey administration, event ingestion, and
//! operational endpoints.
//!
//! Mutating endpoints honor an `x-request-id` header: a replay with a key
//! the server has already answered returns the recorded response instead
//! of repeating the mutation.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use waypoint_core::collaborators::CatalogLookup;
use waypoint_core::event_bus::{make_event, EngineEventSink, EngineEventType};
use waypoint_core::types::DomainEvent;
use waypoint_core::EngineError;
use waypoint_definition::{
    DefinitionStatus, DefinitionStore, JourneyDefinition, JourneyGraph, TriggerSpec,
};
use waypoint_engine::{
    ExecutionRecord, ExecutionStats, ExecutionStore, StepAttempt, StepAttemptStore,
};
use waypoint_scheduler::{urgency_band, QueueItem, WorkQueue};
use waypoint_triggers::TriggerEvaluator;

/// Maximum string field length (names, subject ids, event types).
const MAX_FIELD_LEN: usize = 256;

/// Recorded responses for mutating calls, keyed by client request id.
/// Entries age out on a retention window, like the event dedup map.
#[derive(Default)]
pub struct IdempotencyCache {
    entries: DashMap<String, (StatusCode, serde_json::Value, DateTime<Utc>)>,
}

impl IdempotencyCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, key: &str) -> Option<(StatusCode, serde_json::Value)> {
        self.entries
            .get(key)
            .map(|entry| (entry.value().0, entry.value().1.clone()))
    }

    fn insert(&self, key: String, status: StatusCode, body: serde_json::Value) {
        self.entries.insert(key, (status, body, Utc::now()));
    }

    /// Drop recorded responses older than the retention window.
    pub fn prune(&self, now: DateTime<Utc>, retention: Duration) -> usize {
        let cutoff = now - retention;
        let before = self.entries.len();
        self.entries.retain(|_, v| v.2 > cutoff);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Shared application state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub definitions: Arc<DefinitionStore>,
    pub executions: Arc<ExecutionStore>,
    pub attempts: Arc<StepAttemptStore>,
    pub queue: Arc<WorkQueue>,
    pub evaluator: Arc<TriggerEvaluator>,
    pub catalog: Arc<dyn CatalogLookup>,
    pub event_sink: Arc<dyn EngineEventSink>,
    pub idempotency: Arc<IdempotencyCache>,
    pub node_id: String,
    pub start_time: Instant,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn engine_error(e: EngineError) -> ApiError {
    let status = match &e {
        EngineError::Validation(_) => StatusCode::BAD_REQUEST,
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::InvalidTransition(_) | EngineError::ConcurrencyConflict(_) => {
            StatusCode::CONFLICT
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        metrics::counter!("api.errors").increment(1);
    }
    (
        status,
        Json(ErrorResponse {
            error: e.kind().to_string(),
            message: e.to_string(),
        }),
    )
}

fn bad_request(message: &str) -> ApiError {
    metrics::counter!("api.validation_errors").increment(1);
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: "invalid_request".to_string(),
            message: message.to_string(),
        }),
    )
}

fn check_field(value: &str, name: &'static str) -> Result<(), ApiError> {
    if value.is_empty() {
        return Err(bad_request(&format!("'{name}' must not be empty")));
    }
    if value.len() > MAX_FIELD_LEN {
        return Err(bad_request(&format!("'{name}' exceeds maximum length")));
    }
    Ok(())
}

fn request_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= MAX_FIELD_LEN)
        .map(str::to_string)
}

/// Returns the recorded response for a request id the server already answered.
fn replay(state: &AppState, key: &str) -> Option<Response> {
    state.idempotency.get(key).map(|(status, body)| {
        debug!(request_id = %key, "Replaying recorded response");
        metrics::counter!("api.idempotent_replays").increment(1);
        (status, Json(body)).into_response()
    })
}

/// Records a successful mutation response under the client request id (if
/// one was supplied) and converts it into the wire response.
fn record_response<T: Serialize>(
    state: &AppState,
    key: Option<String>,
    status: StatusCode,
    body: &T,
) -> Result<Response, ApiError> {
    let value = serde_json::to_value(body)
        .map_err(EngineError::from)
        .map_err(engine_error)?;
    if let Some(key) = key {
        state.idempotency.insert(key, status, value.clone());
    }
    Ok((status, Json(value)).into_response())
}

#[derive(Deserialize)]
pub struct CreateJourneyRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub trigger_specs: Vec<TriggerSpec>,
    pub graph: JourneyGraph,
}

/// POST /v1/journeys — create a journey definition (version 1, draft).
pub async fn create_journey(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateJourneyRequest>,
) -> Result<Response, ApiError> {
    let key = request_key(&headers);
    if let Some(response) = key.as_deref().and_then(|k| replay(&state, k)) {
        return Ok(response);
    }
    check_field(&request.name, "name")?;
    if request.trigger_specs.is_empty() {
        return Err(bad_request("at least one trigger spec is required"));
    }

    let definition = state
        .definitions
        .create(
            request.name,
            request.description,
            request.trigger_specs,
            request.graph,
            state.catalog.as_ref(),
        )
        .map_err(engine_error)?;
    record_response(&state, key, StatusCode::CREATED, &definition)
}

/// GET /v1/journeys — latest version of every journey.
pub async fn list_journeys(State(state): State<AppState>) -> Json<Vec<JourneyDefinition>> {
    Json(state.definitions.list())
}

/// GET /v1/journeys/{id}
pub async fn get_journey(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JourneyDefinition>, ApiError> {
    state
        .definitions
        .get(id)
        .map(Json)
        .ok_or_else(|| engine_error(EngineError::NotFound(format!("journey {id}"))))
}

#[derive(Deserialize)]
pub struct UpdateJourneyRequest {
    pub trigger_specs: Vec<TriggerSpec>,
    pub graph: JourneyGraph,
}

/// PUT /v1/journeys/{id} — publish an edited graph as a new version.
/// In-flight executions keep running on the version they started with.
pub async fn update_journey(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<UpdateJourneyRequest>,
) -> Result<Response, ApiError> {
    let key = request_key(&headers);
    if let Some(response) = key.as_deref().and_then(|k| replay(&state, k)) {
        return Ok(response);
    }
    if request.trigger_specs.is_empty() {
        return Err(bad_request("at least one trigger spec is required"));
    }
    let definition = state
        .definitions
        .publish_new_version(
            id,
            request.trigger_specs,
            request.graph,
            state.catalog.as_ref(),
        )
        .map_err(engine_error)?;
    record_response(&state, key, StatusCode::OK, &definition)
}

#[derive(Deserialize)]
pub struct StatusRequest {
    pub status: DefinitionStatus,
}

/// POST /v1/journeys/{id}/status — move through the definition lifecycle.
pub async fn set_journey_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<StatusRequest>,
) -> Result<Response, ApiError> {
    let key = request_key(&headers);
    if let Some(response) = key.as_deref().and_then(|k| replay(&state, k)) {
        return Ok(response);
    }
    state
        .definitions
        .set_status(id, request.status)
        .map_err(engine_error)?;
    let definition = state
        .definitions
        .get(id)
        .ok_or_else(|| engine_error(EngineError::NotFound(format!("journey {id}"))))?;
    record_response(&state, key, StatusCode::OK, &definition)
}

/// GET /v1/journeys/{id}/stats
pub async fn journey_stats(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ExecutionStats>, ApiError> {
    if state.definitions.get(id).is_none() {
        return Err(engine_error(EngineError::NotFound(format!("journey {id}"))));
    }
    Ok(Json(state.executions.stats(id)))
}

#[derive(Serialize)]
pub struct EventResponse {
    pub started: Vec<Uuid>,
    pub resumed: Vec<Uuid>,
    pub duplicate: bool,
}

/// POST /v1/events — ingest a domain event. Delivery is at-least-once;
/// replays of the same (type, subject, occurred_at) are absorbed here.
pub async fn ingest_event(
    State(state): State<AppState>,
    Json(event): Json<DomainEvent>,
) -> Result<(StatusCode, Json<EventResponse>), ApiError> {
    check_field(&event.event_type, "event_type")?;
    check_field(&event.subject_id, "subject_id")?;

    let report = state.evaluator.handle_event(&event);
    info!(
        event_type = %event.event_type,
        subject_id = %event.subject_id,
        started = report.started.len(),
        resumed = report.resumed.len(),
        duplicate = report.duplicate,
        "Event ingested"
    );
    Ok((
        StatusCode::ACCEPTED,
        Json(EventResponse {
            started: report.started,
            resumed: report.resumed,
            duplicate: report.duplicate,
        }),
    ))
}

#[derive(Deserialize)]
pub struct EnrollRequest {
    pub journey_id: Uuid,
    pub subject_id: String,
    #[serde(default)]
    pub anchor_date: Option<DateTime<Utc>>,
}

/// POST /v1/executions — enroll a subject directly, bypassing triggers.
///
/// If the journey runs on a date-offset trigger and an anchor is given,
/// the execution stays pending until the sweep finds its offset due.
/// Otherwise the entry node is queued immediately.
pub async fn enroll(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<EnrollRequest>,
) -> Result<Response, ApiError> {
    let key = request_key(&headers);
    if let Some(response) = key.as_deref().and_then(|k| replay(&state, k)) {
        return Ok(response);
    }
    check_field(&request.subject_id, "subject_id")?;

    let definition = state
        .definitions
        .get(request.journey_id)
        .ok_or_else(|| {
            engine_error(EngineError::NotFound(format!(
                "journey {}",
                request.journey_id
            )))
        })?;
    if definition.status != DefinitionStatus::Active {
        return Err(engine_error(EngineError::InvalidTransition(format!(
            "journey {} is not active",
            definition.id
        ))));
    }

    let record = state
        .executions
        .create(
            definition.id,
            definition.version,
            request.subject_id,
            request.anchor_date,
        )
        .map_err(engine_error)?;

    let sweep_driven =
        definition.anchor_trigger_offset().is_some() && request.anchor_date.is_some();
    if !sweep_driven {
        let entry = definition.graph.entry_node().ok_or_else(|| {
            engine_error(EngineError::Validation(format!(
                "journey {} has no entry node",
                definition.id
            )))
        })?;
        let now = Utc::now();
        let attempt = state.attempts.create_or_get(record.id, entry.id, now, None);
        state.queue.enqueue(QueueItem {
            execution_id: record.id,
            node_id: entry.id,
            attempt_id: attempt.id,
            urgency_band: urgency_band(record.anchor_date, now),
            not_before: now,
            enqueued_at: now,
        });
    }

    info!(
        execution_id = %record.id,
        journey_id = %definition.id,
        sweep_driven,
        "Manual enrollment"
    );
    record_response(&state, key, StatusCode::CREATED, &record)
}

#[derive(Serialize)]
pub struct ExecutionDetail {
    #[serde(flatten)]
    pub record: ExecutionRecord,
    pub attempts: Vec<StepAttempt>,
}

/// GET /v1/executions/{id} — record plus its step attempt audit trail.
pub async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ExecutionDetail>, ApiError> {
    let record = state
        .executions
        .get(id)
        .ok_or_else(|| engine_error(EngineError::NotFound(format!("execution {id}"))))?;
    let mut attempts = state.attempts.list_for_execution(id);
    attempts.sort_by_key(|a| a.scheduled_for);
    Ok(Json(ExecutionDetail { record, attempts }))
}

/// POST /v1/executions/{id}/cancel — terminal and irreversible. Queued
/// items for the execution drain as no-ops.
pub async fn cancel_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let key = request_key(&headers);
    if let Some(response) = key.as_deref().and_then(|k| replay(&state, k)) {
        return Ok(response);
    }
    let record = state.executions.cancel(id).map_err(engine_error)?;
    warn!(execution_id = %id, "Execution cancelled via API");
    metrics::counter!("api.cancellations").increment(1);
    state.event_sink.emit(make_event(
        EngineEventType::ExecutionCancelled,
        Some(record.id),
        Some(record.journey_id),
        Some(record.subject_id.clone()),
        None,
    ));
    record_response(&state, key, StatusCode::OK, &record)
}

#[derive(Deserialize)]
pub struct ReanchorRequest {
    pub anchor_date: DateTime<Utc>,
}

/// POST /v1/executions/{id}/reanchor — move the anchor date; pending
/// anchor-derived steps are rescheduled, executed ones stay done.
pub async fn reanchor_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<ReanchorRequest>,
) -> Result<Response, ApiError> {
    let key = request_key(&headers);
    if let Some(response) = key.as_deref().and_then(|k| replay(&state, k)) {
        return Ok(response);
    }
    let record = state
        .evaluator
        .reanchor(id, request.anchor_date)
        .map_err(engine_error)?;
    record_response(&state, key, StatusCode::OK, &record)
}

/// GET /v1/subjects/{id}/executions
pub async fn subject_executions(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<Vec<ExecutionRecord>> {
    Json(state.executions.list_by_subject(&id))
}

/// GET /health — Health check endpoint.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        node_id: state.node_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        queue_depth: state.queue.pending_len(),
        leased: state.queue.leased_len(),
    })
}

/// GET /ready — Readiness probe for Kubernetes.
pub async fn readiness(State(state): State<AppState>) -> StatusCode {
    if state.start_time.elapsed().as_secs() > 0 {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// GET /live — Liveness probe for Kubernetes.
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub uptime_secs: u64,
    pub queue_depth: usize,
    pub leased: usize,
}
