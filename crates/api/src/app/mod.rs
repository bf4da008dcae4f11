//! HTTP application wiring (Axum router + service wiring).
//!
//! - `services.rs`: stores, broker, services and background tasks
//! - `routes/`: HTTP routes + handlers (one file per area)
//! - `dto.rs`: request DTOs and parsing helpers
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use tower::ServiceBuilder;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

pub use services::{build_services, AppServices, BackgroundTasks};

/// Build the full HTTP router around already-wired services.
pub fn build_app(services: Arc<AppServices>) -> Router {
    Router::new()
        .route("/health", get(routes::system::health))
        .merge(routes::router().layer(Extension(services)))
        .layer(ServiceBuilder::new())
}
