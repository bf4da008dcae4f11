use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use wattloop_core::CommandId;
use wattloop_energy::NewCommand;
use wattloop_infra::services::Completion;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_command))
        .route("/:id/dispatch", post(dispatch_command))
        .route("/:id/ack", post(ack_command))
        .route("/:id/complete", post(complete_command))
        .route("/:id/proofs", get(get_proofs))
        .route("/:id", get(get_command))
}

fn command_id(raw: &str) -> Result<CommandId, axum::response::Response> {
    dto::parse_id(raw, "command")
}

/// Create a `queued` command. The response carries its idempotency key.
pub async fn create_command(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<NewCommand>,
) -> axum::response::Response {
    match services.dispatcher.create(body).await {
        Ok(command) => (StatusCode::CREATED, Json(command)).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn get_command(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match command_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.dispatcher.get(id).await {
        Ok(command) => Json(command).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn dispatch_command(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match command_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.dispatcher.dispatch(id).await {
        Ok(command) => Json(command).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn ack_command(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match command_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.dispatcher.mark_acked(id).await {
        Ok(command) => Json(command).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

/// Gateway result callback. Replays return the stored command unchanged.
pub async fn complete_command(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Json(body): Json<Completion>,
) -> axum::response::Response {
    let id = match command_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.dispatcher.complete(id, body).await {
        Ok(command) => Json(command).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn get_proofs(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match command_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.dispatcher.proofs(id).await {
        Ok(proofs) => Json(proofs).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}
