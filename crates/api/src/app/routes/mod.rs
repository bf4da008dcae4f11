use axum::{routing::get, Router};

pub mod commands;
pub mod devices;
pub mod recommendations;
pub mod rewards;
pub mod streaks;
pub mod system;
pub mod telemetry;

/// Router for every control-loop endpoint.
pub fn router() -> Router {
    Router::new()
        .route(
            "/assets/:asset_id/recommendations",
            get(recommendations::list_for_asset),
        )
        .nest("/telemetry", telemetry::router())
        .nest("/recommendations", recommendations::router())
        .nest("/commands", commands::router())
        .nest("/devices", devices::router())
        .nest("/rewards", rewards::router())
        .nest("/streaks", streaks::router())
}
