use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use hydrolink_client::{Granularity, ServiceConnection, UsageResponse};
use serde::Deserialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::coordinator::{AppState, PollHealth, UsageSnapshot};
use crate::error::{ApiError, ApiResult};
use crate::sensors::{self, EntityState};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/status", get(status))
        .route("/api/v1/usage", get(usage_snapshot))
        .route("/api/v1/connections", get(list_connections))
        .route("/api/v1/connections/:id", get(get_connection))
        .route("/api/v1/connections/:id/hourly", get(hourly_usage))
        .route("/api/v1/connections/:id/sensors", get(connection_sensors))
        .with_state(state)
}

async fn health() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

async fn status(State(state): State<AppState>) -> Json<PollHealth> {
    Json(state.health().await)
}

/// Latest full usage snapshot. 503 until the first successful poll.
async fn usage_snapshot(State(state): State<AppState>) -> ApiResult<Json<UsageSnapshot>> {
    let snapshot = state.snapshot().await;
    if snapshot.polled_at.is_none() {
        return Err(ApiError::Unavailable(
            "no usage snapshot published yet".to_string(),
        ));
    }
    Ok(Json(UsageSnapshot::clone(&snapshot)))
}

async fn list_connections(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<ServiceConnection>>> {
    let connections = state.connections.get_connections().await?;
    Ok(Json(connections))
}

async fn get_connection(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<ServiceConnection>> {
    let client = Arc::clone(&state.client);
    let connection = tokio::task::spawn_blocking(move || client.get_service_connection(id))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;

    match connection {
        Some(connection) => Ok(Json(connection)),
        None => Err(ApiError::NotFound(format!(
            "service connection {id} not found"
        ))),
    }
}

#[derive(Debug, Deserialize)]
struct HourlyParams {
    start: Option<String>,
    end: Option<String>,
}

/// Hourly usage for an arbitrary range, defaulting to the last 24 hours.
async fn hourly_usage(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<HourlyParams>,
) -> ApiResult<Json<UsageResponse>> {
    let (start, end) = resolve_hourly_range(&params, OffsetDateTime::now_utc())?;
    let client = Arc::clone(&state.client);
    let response =
        tokio::task::spawn_blocking(move || client.get_usage(id, start, end, Granularity::Hour))
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))??;
    Ok(Json(response))
}

/// Derived entity states for one connection, computed from the latest
/// snapshot.
async fn connection_sensors(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Vec<EntityState>>> {
    let snapshot = state.snapshot().await;
    if snapshot.polled_at.is_none() {
        return Err(ApiError::Unavailable(
            "no usage snapshot published yet".to_string(),
        ));
    }

    let connections = state.connections.get_connections().await?;
    let connection = connections
        .into_iter()
        .find(|c| c.id == id)
        .ok_or_else(|| ApiError::NotFound(format!("service connection {id} not found")))?;

    let records = snapshot
        .connections
        .get(&id)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let today = OffsetDateTime::now_utc().date();
    Ok(Json(sensors::connection_entities(&connection, records, today)))
}

fn resolve_hourly_range(
    params: &HourlyParams,
    now: OffsetDateTime,
) -> ApiResult<(OffsetDateTime, OffsetDateTime)> {
    let end = match &params.end {
        Some(raw) => parse_rfc3339(raw)?,
        None => now,
    };
    let start = match &params.start {
        Some(raw) => parse_rfc3339(raw)?,
        None => end - time::Duration::hours(24),
    };
    if start >= end {
        return Err(ApiError::InvalidInput(
            "start must be before end".to_string(),
        ));
    }
    Ok((start, end))
}

fn parse_rfc3339(raw: &str) -> ApiResult<OffsetDateTime> {
    OffsetDateTime::parse(raw, &Rfc3339)
        .map_err(|_| ApiError::InvalidInput(format!("invalid RFC3339 timestamp: {raw}")))
}
