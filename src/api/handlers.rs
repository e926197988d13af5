//! Request handlers for the read/control API

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::ApiState;
use crate::alarm::AlarmConfig;
use crate::error::TankSrvError;
use crate::log_writer;

/// Error envelope with the status code the taxonomy assigns.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<TankSrvError> for ApiError {
    fn from(err: TankSrvError) -> Self {
        let status = match &err {
            TankSrvError::InvalidParameter(_) => StatusCode::BAD_REQUEST,
            TankSrvError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

pub async fn health(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let stats = &state.stats;
    Json(json!({
        "status": "ok",
        "service": "tanksrv",
        "uptime_s": state.started_at.elapsed().as_secs(),
        "ticks": stats.ticks.load(Ordering::Relaxed),
        "last_ok": stats.last_ok.load(Ordering::Relaxed),
        "last_fail": stats.last_fail.load(Ordering::Relaxed),
        "last_duration_ms": stats.last_duration_ms.load(Ordering::Relaxed),
        "active_alarms": state.alarms.active_count(),
    }))
}

pub async fn get_snapshots(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(state.cache.all())
}

pub async fn get_snapshot(
    State(state): State<Arc<ApiState>>,
    Path(tank_id): Path<String>,
) -> std::result::Result<Response, ApiError> {
    match state.cache.get(&tank_id) {
        Some(snapshot) => Ok(Json(snapshot).into_response()),
        None => Err(TankSrvError::NotFound(format!("tank '{tank_id}'")).into()),
    }
}

pub async fn get_tanks(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let set = state.loader.current();
    let tanks: Vec<Value> = set
        .families
        .iter()
        .flat_map(|family| {
            family.devices.iter().map(move |d| {
                json!({
                    "tank_id": d.tank_id,
                    "family": family.id,
                    "ip": d.ip,
                })
            })
        })
        .collect();
    Json(json!({ "tanks": tanks, "enable": set.enable_map }))
}

pub async fn get_enable_map(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(state.loader.current().enable_map.clone())
}

pub async fn put_enable_map(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<Value>,
) -> std::result::Result<Response, ApiError> {
    let object = body
        .as_object()
        .ok_or_else(|| ApiError::bad_request("enable map must be a JSON object"))?;

    let mut map = HashMap::with_capacity(object.len());
    for (tank_id, value) in object {
        match value.as_bool() {
            Some(enabled) => {
                map.insert(tank_id.clone(), enabled);
            },
            None => {
                return Err(ApiError::bad_request(format!(
                    "enable value for '{tank_id}' must be a boolean"
                )))
            },
        }
    }
    state.loader.save_enable_map(&map)?;
    Ok(Json(json!({ "ok": true, "count": map.len() })).into_response())
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    pub tank_id: String,
    pub field: String,
    pub family: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
}

fn parse_ts(raw: &Option<String>, name: &str) -> std::result::Result<Option<DateTime<Utc>>, ApiError> {
    match raw {
        None => Ok(None),
        Some(raw) => raw
            .parse::<DateTime<Utc>>()
            .map(Some)
            .map_err(|e| ApiError::bad_request(format!("invalid {name} timestamp '{raw}': {e}"))),
    }
}

pub async fn query_logs(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<LogQuery>,
) -> std::result::Result<Response, ApiError> {
    let end = parse_ts(&query.end, "end")?.unwrap_or_else(Utc::now);
    let start = parse_ts(&query.start, "start")?.unwrap_or(end - Duration::hours(24));
    if start > end {
        return Err(ApiError::bad_request("start must not be after end"));
    }

    let points = log_writer::query_series(
        &state.log_dir,
        &query.tank_id,
        query.family.as_deref(),
        &query.field,
        start,
        end,
    )?;
    Ok(Json(json!({
        "tank_id": query.tank_id,
        "field": query.field,
        "points": points,
    }))
    .into_response())
}

pub async fn list_files(
    State(state): State<Arc<ApiState>>,
) -> std::result::Result<Response, ApiError> {
    let files = log_writer::list_log_files(&state.log_dir)?;
    Ok(Json(json!({ "files": files })).into_response())
}

pub async fn download_file(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> std::result::Result<Response, ApiError> {
    let path = log_writer::resolve_log_file(&state.log_dir, &name)?;
    let body = tokio::fs::read(&path)
        .await
        .map_err(|e| ApiError::from(TankSrvError::from(e)))?;
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/x-ndjson".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{name}\""),
            ),
        ],
        body,
    )
        .into_response())
}

pub async fn get_thresholds(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(state.alarms.get_thresholds())
}

pub async fn set_thresholds(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<Value>,
) -> std::result::Result<Response, ApiError> {
    let config: AlarmConfig = serde_json::from_value(body)
        .map_err(|e| ApiError::bad_request(format!("invalid thresholds payload: {e}")))?;
    state.alarms.set_thresholds(config).map_err(ApiError::from)?;
    Ok(Json(state.alarms.get_thresholds()).into_response())
}

pub async fn get_co2(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(state.loader.current().co2.clone())
}
