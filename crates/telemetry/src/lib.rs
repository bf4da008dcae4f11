//! Telemetry domain module.
//!
//! Normalized device readings, the bounded batch used by every write path, the
//! pub/sub wire format, and query/aggregation value types. Pure logic, no IO.

pub mod query;
pub mod reading;
pub mod wire;

pub use query::{TelemetryAggregation, TelemetryQuery, DEFAULT_QUERY_LIMIT, MAX_QUERY_LIMIT};
pub use reading::{TelemetryBatch, TelemetryReading, MAX_BATCH_SIZE};
pub use wire::{topic_matches, StatusSubject, StatusUpdate, TelemetryPayload, Topic, WireReading};
