//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use super::state::AppState;
use super::ApiError;
use crate::detect::{Incident, IncidentUpdate, NewIncident};
use crate::ingest::{LogRecord, LogSubmission};
use crate::storage::{Page, Paged};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/ingest", post(ingest))
        .route("/incidents", get(list_incidents).post(create_incident))
        .route(
            "/incidents/{id}",
            get(get_incident).patch(update_incident).delete(delete_incident),
        )
        .route("/incidents/{id}/logs", get(incident_logs))
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    #[serde(default = "default_page")]
    page: u32,
    #[serde(default = "default_limit")]
    limit: u32,
}

fn default_page() -> u32 {
    1
}

fn default_limit() -> u32 {
    10
}

impl From<PageQuery> for Page {
    fn from(q: PageQuery) -> Self {
        Page::new(q.page, q.limit)
    }
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "buffered_logs": state.buffer.len(),
        },
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }
    }))
}

/// Accept one log record. Acknowledged before it is durable.
async fn ingest(
    State(state): State<AppState>,
    Json(submission): Json<LogSubmission>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let record = submission.into_record()?;
    state.buffer.submit(record);
    Ok((
        StatusCode::CREATED,
        Json(json!({ "status": "success", "received": true })),
    ))
}

async fn create_incident(
    State(state): State<AppState>,
    Json(incident): Json<NewIncident>,
) -> Result<(StatusCode, Json<Incident>), ApiError> {
    if incident.title.trim().is_empty() {
        return Err(ApiError::BadRequest("title must not be empty".to_string()));
    }
    let created = state.incidents.create(incident).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn list_incidents(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Paged<Incident>>, ApiError> {
    Ok(Json(state.incidents.list(query.into()).await?))
}

async fn get_incident(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Incident>, ApiError> {
    state
        .incidents
        .get(id)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(id))
}

async fn update_incident(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(update): Json<IncidentUpdate>,
) -> Result<Json<Incident>, ApiError> {
    if update.title.as_deref().is_some_and(|t| t.trim().is_empty()) {
        return Err(ApiError::BadRequest("title must not be empty".to_string()));
    }
    state
        .incidents
        .update(id, update)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(id))
}

async fn delete_incident(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    if state.incidents.delete(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found(id))
    }
}

async fn incident_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Paged<LogRecord>>, ApiError> {
    if state.incidents.get(id).await?.is_none() {
        return Err(not_found(id));
    }
    Ok(Json(state.logs.logs_for_incident(id, query.into()).await?))
}

fn not_found(id: Uuid) -> ApiError {
    ApiError::NotFound(format!("incident {} not found", id))
}
