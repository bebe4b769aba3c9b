use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, NaiveDate, Utc};
use log::{debug, error};
use serde::{Deserialize, Serialize};

use crate::models::Reading;

use super::ApiState;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: &self.message,
        });
        (self.status, body).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LatestParams {
    pub since_uuid: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoricalParams {
    pub date: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub cached_readings: usize,
    pub pending_uploads: usize,
}

/// GET /latest
pub async fn latest(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<LatestParams>,
) -> Json<Vec<Reading>> {
    let readings = match params.since_uuid.as_deref().filter(|id| !id.is_empty()) {
        Some(since) => state.store.snapshot_since(since),
        None => state.store.snapshot(),
    };
    debug!("serving {} cached readings", readings.len());
    Json(readings)
}

/// GET /historical?date=YYYY-MM-DD
pub async fn historical(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<HistoricalParams>,
) -> Result<Json<Vec<Reading>>, ApiError> {
    let Some(raw) = params.date.as_deref().map(str::trim).filter(|d| !d.is_empty()) else {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "Missing 'date' query parameter (YYYY-MM-DD)",
        ));
    };
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("Invalid date '{raw}', expected YYYY-MM-DD"),
        )
    })?;

    let Some(history) = state.history.as_ref() else {
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "Historical storage is not configured",
        ));
    };

    history.readings_for_date(date).await.map(Json).map_err(|err| {
        error!("historical query for {date} failed: {err:#}");
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to retrieve data for {date}. Check service logs."),
        )
    })
}

/// GET /health
pub async fn health(State(state): State<Arc<ApiState>>) -> Json<HealthReport> {
    Json(HealthReport {
        status: "ok".into(),
        timestamp: Utc::now(),
        cached_readings: state.store.cached_len(),
        pending_uploads: state.store.pending_len(),
    })
}
