use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use wattloop_core::DeviceId;
use wattloop_telemetry::{TelemetryBatch, TelemetryQuery, DEFAULT_QUERY_LIMIT};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/batch", post(insert_batch))
        .route("/:device_id/aggregate", get(aggregate))
        .route("/:device_id", get(query_readings))
}

/// Direct write path; bypasses the ingestion buffer.
pub async fn insert_batch(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::TelemetryBatchRequest>,
) -> axum::response::Response {
    let batch = match TelemetryBatch::new(body.readings) {
        Ok(batch) => batch,
        Err(e) => return errors::service_error_to_response(e.into()),
    };

    match services.telemetry.insert_batch(&batch).await {
        Ok(written) => (
            StatusCode::CREATED,
            Json(serde_json::json!({ "written": written })),
        )
            .into_response(),
        Err(e) => errors::telemetry_error_to_response(e),
    }
}

pub async fn query_readings(
    Extension(services): Extension<Arc<AppServices>>,
    Path(device_id): Path<String>,
    Query(params): Query<dto::TelemetryRangeQuery>,
) -> axum::response::Response {
    let device_id: DeviceId = match dto::parse_id(&device_id, "device") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let (start, end) = params.range();
    let mut query = TelemetryQuery::new(device_id, start, end)
        .with_limit(params.limit.unwrap_or(DEFAULT_QUERY_LIMIT));
    if let Some(metric) = params.metric {
        query = query.with_metric(metric);
    }

    match services.telemetry.query(&query).await {
        Ok(readings) => Json(serde_json::json!({
            "device_id": device_id,
            "count": readings.len(),
            "readings": readings,
        }))
        .into_response(),
        Err(e) => errors::telemetry_error_to_response(e),
    }
}

pub async fn aggregate(
    Extension(services): Extension<Arc<AppServices>>,
    Path(device_id): Path<String>,
    Query(params): Query<dto::TelemetryRangeQuery>,
) -> axum::response::Response {
    let device_id: DeviceId = match dto::parse_id(&device_id, "device") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(metric) = params.metric.as_deref() else {
        return errors::json_error(
            StatusCode::BAD_REQUEST,
            "validation",
            "metric query parameter is required",
        );
    };

    let (start, end) = params.range();
    match services
        .telemetry
        .aggregate(device_id, metric, start, end)
        .await
    {
        // `aggregation` is null when the range holds no readings.
        Ok(aggregation) => Json(serde_json::json!({
            "device_id": device_id,
            "metric": metric,
            "aggregation": aggregation,
        }))
        .into_response(),
        Err(e) => errors::telemetry_error_to_response(e),
    }
}
