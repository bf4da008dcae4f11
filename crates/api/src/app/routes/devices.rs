use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;

use wattloop_core::{DeviceId, GatewayId};
use wattloop_infra::ingestion::{DeviceRecord, DeviceRegistry};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(register_device))
        .route("/discovered/:gateway_id", get(list_discovered))
        .route(
            "/discovered/:gateway_id/:external_id/claim",
            post(claim_discovered),
        )
}

/// Make a device (and its gateway) known to ingestion and the dispatcher.
pub async fn register_device(
    Extension(services): Extension<Arc<AppServices>>,
    Json(record): Json<DeviceRecord>,
) -> axum::response::Response {
    services.registry.add_device(record);
    tracing::info!(device_id = %record.id, gateway_id = %record.gateway_id, "device registered");

    (StatusCode::CREATED, Json(record)).into_response()
}

/// Unclaimed devices a gateway reported, oldest first.
pub async fn list_discovered(
    Extension(services): Extension<Arc<AppServices>>,
    Path(gateway_id): Path<String>,
) -> axum::response::Response {
    let gateway_id: GatewayId = match dto::parse_id(&gateway_id, "gateway") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    Json(services.discovery.list(gateway_id, Utc::now())).into_response()
}

/// Register a discovered device and drop it from the discovery cache.
pub async fn claim_discovered(
    Extension(services): Extension<Arc<AppServices>>,
    Path((gateway_id, external_id)): Path<(String, String)>,
    body: Option<Json<dto::ClaimDeviceRequest>>,
) -> axum::response::Response {
    let gateway_id: GatewayId = match dto::parse_id(&gateway_id, "gateway") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let request = body.map(|Json(req)| req).unwrap_or_default();
    let device_id = request.device_id.unwrap_or_else(DeviceId::new);

    match services.registry.device(device_id).await {
        Ok(Some(_)) => {
            return errors::json_error(
                StatusCode::CONFLICT,
                "conflict",
                format!("device {device_id} is already registered"),
            );
        }
        Ok(None) => {}
        Err(e) => {
            return errors::json_error(StatusCode::BAD_GATEWAY, "unavailable", e.to_string());
        }
    }

    let Some(discovered) = services.discovery.take(gateway_id, &external_id, Utc::now()) else {
        return errors::json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("no pending discovery {external_id} on gateway {gateway_id}"),
        );
    };

    let record = DeviceRecord {
        id: device_id,
        gateway_id,
        safety_profile: request.safety_profile,
    };
    services.registry.add_device(record);
    tracing::info!(
        device_id = %record.id,
        %gateway_id,
        external_id = %discovered.external_id,
        "discovered device claimed"
    );

    (
        StatusCode::CREATED,
        Json(json!({
            "device": record,
            "discovered": discovered,
        })),
    )
        .into_response()
}
