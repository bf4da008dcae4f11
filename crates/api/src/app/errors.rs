use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use wattloop_infra::services::ServiceError;
use wattloop_infra::telemetry_store::TelemetryStoreError;

pub fn service_error_to_response(err: ServiceError) -> axum::response::Response {
    let status = match &err {
        ServiceError::Validation(_) | ServiceError::InvalidAction(_) => StatusCode::BAD_REQUEST,
        ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
        ServiceError::Conflict(_) | ServiceError::InvalidTransition(_) => StatusCode::CONFLICT,
        ServiceError::SafetyViolation(_) | ServiceError::ApprovalRequired(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        ServiceError::Unavailable(_) => StatusCode::BAD_GATEWAY,
        ServiceError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!(error = %err, "request failed");
    }
    json_error(status, err.code(), err.to_string())
}

pub fn telemetry_error_to_response(err: TelemetryStoreError) -> axum::response::Response {
    service_error_to_response(err.into())
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
