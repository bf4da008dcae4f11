use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    response::IntoResponse,
    routing::get,
    Json, Router,
};

use wattloop_core::UserId;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new().route("/:user_id", get(list_streaks))
}

pub async fn list_streaks(
    Extension(services): Extension<Arc<AppServices>>,
    Path(user_id): Path<String>,
) -> axum::response::Response {
    let user_id: UserId = match dto::parse_id(&user_id, "user") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.streaks.list(user_id).await {
        Ok(streaks) => Json(streaks).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}
