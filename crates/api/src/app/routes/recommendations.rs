use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use wattloop_core::{AssetId, RecommendationId};
use wattloop_energy::{
    CommandAction, NewRecommendation, RecommendationAction, RecommendationStatus,
};
use wattloop_infra::services::Trigger;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_recommendation))
        .route("/evaluate", post(evaluate_trigger))
        .route("/:id/respond", post(respond))
        .route("/:id/approve", post(approve_and_dispatch))
        .route("/:id", get(get_recommendation))
}

pub async fn create_recommendation(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<NewRecommendation>,
) -> axum::response::Response {
    match services.recommendations.create(body).await {
        Ok(rec) => (StatusCode::CREATED, Json(rec)).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

/// Run a trigger through the engine. `204` when it did not fire.
pub async fn evaluate_trigger(
    Extension(services): Extension<Arc<AppServices>>,
    Json(trigger): Json<Trigger>,
) -> axum::response::Response {
    match services.recommendations.evaluate(trigger).await {
        Ok(Some(rec)) => (StatusCode::CREATED, Json(rec)).into_response(),
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn get_recommendation(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: RecommendationId = match dto::parse_id(&id, "recommendation") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.recommendations.get(id).await {
        Ok(rec) => Json(rec).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn respond(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Json(body): Json<dto::RespondRequest>,
) -> axum::response::Response {
    let id: RecommendationId = match dto::parse_id(&id, "recommendation") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let action: RecommendationAction = match body.action.parse() {
        Ok(v) => v,
        Err(e) => return errors::service_error_to_response(e.into()),
    };

    match services.recommendations.respond(id, action).await {
        Ok(rec) => Json(rec).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

/// Approve and send the command in one call. Safe to retry.
pub async fn approve_and_dispatch(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Json(body): Json<dto::ApproveRequest>,
) -> axum::response::Response {
    let id: RecommendationId = match dto::parse_id(&id, "recommendation") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let action: CommandAction = match body.action.parse() {
        Ok(v) => v,
        Err(e) => return errors::service_error_to_response(e.into()),
    };

    match services
        .dispatcher
        .approve_and_dispatch(id, action, body.params, body.requested_by)
        .await
    {
        Ok(command) => Json(command).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn list_for_asset(
    Extension(services): Extension<Arc<AppServices>>,
    Path(asset_id): Path<String>,
    Query(params): Query<dto::RecommendationListQuery>,
) -> axum::response::Response {
    let asset_id: AssetId = match dto::parse_id(&asset_id, "asset") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let status = match params.status.as_deref().map(str::parse::<RecommendationStatus>) {
        None => None,
        Some(Ok(status)) => Some(status),
        Some(Err(e)) => return errors::service_error_to_response(e.into()),
    };
    let page = dto::PageQuery {
        page: params.page,
        page_size: params.page_size,
    }
    .to_request();

    match services
        .recommendations
        .list_for_asset(asset_id, status, page)
        .await
    {
        Ok(page) => Json(page).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}
