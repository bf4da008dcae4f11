//! Infrastructure layer: stores, ingestion, services and background tasks.
//!
//! Every seam (telemetry store, record stores, broker, device registry, gateway
//! transport, event sink) is a trait with an in-memory implementation used by
//! tests and the dev server, plus a Postgres or Redis one for production.

pub mod buffer;
pub mod config;
pub mod discovery;
pub mod events;
pub mod ingestion;
pub mod pg;
pub mod retry;
pub mod services;
pub mod store;
pub mod sweeper;
pub mod telemetry_store;
pub mod transport;
pub mod worker;

#[cfg(test)]
mod integration_tests;
