//! Durable run-event records for audit and post-run inspection.

pub mod log;
pub mod record;

pub use log::{generate_run_id, EventError, EventLog, EventResult};
pub use record::{RunEventRecord, RunManifest, EVENT_SCHEMA_VERSION};
