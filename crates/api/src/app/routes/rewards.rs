use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    response::IntoResponse,
    routing::get,
    Json, Router,
};

use wattloop_core::UserId;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/:user_id/balance", get(get_balance))
        .route("/:user_id/ledger", get(get_ledger))
}

pub async fn get_balance(
    Extension(services): Extension<Arc<AppServices>>,
    Path(user_id): Path<String>,
) -> axum::response::Response {
    let user_id: UserId = match dto::parse_id(&user_id, "user") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.rewards.balance(user_id).await {
        Ok(balance) => Json(balance).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

/// Newest first.
pub async fn get_ledger(
    Extension(services): Extension<Arc<AppServices>>,
    Path(user_id): Path<String>,
    Query(params): Query<dto::PageQuery>,
) -> axum::response::Response {
    let user_id: UserId = match dto::parse_id(&user_id, "user") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.rewards.ledger(user_id, params.to_request()).await {
        Ok(page) => Json(page).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}
