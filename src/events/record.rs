use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current run-event schema version.
pub const EVENT_SCHEMA_VERSION: u32 = 1;

/// One scheduling event captured for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEventRecord {
    /// Event schema version.
    pub schema_version: u32,
    /// The run this event belongs to.
    pub run_id: String,
    /// When the event was captured.
    pub recorded_at: DateTime<Utc>,
    /// Event kind (e.g. "batch_planned", "item_failed").
    pub kind: String,
    /// Event-specific JSON payload.
    pub payload: Value,
}

impl RunEventRecord {
    /// Create a new record with the current timestamp.
    pub fn new(run_id: impl Into<String>, kind: impl Into<String>, payload: Value) -> Self {
        Self {
            schema_version: EVENT_SCHEMA_VERSION,
            run_id: run_id.into(),
            recorded_at: Utc::now(),
            kind: kind.into(),
            payload,
        }
    }
}

/// Manifest stored alongside a run's event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    /// Event schema version.
    pub schema_version: u32,
    /// Run identifier.
    pub run_id: String,
    /// When the run's event stream was created.
    pub created_at: DateTime<Utc>,
    /// Timestamp of the latest record.
    pub updated_at: DateTime<Utc>,
    /// Records appended so far.
    pub record_count: u64,
}

impl RunManifest {
    /// Create a new manifest.
    pub fn new(run_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            schema_version: EVENT_SCHEMA_VERSION,
            run_id: run_id.into(),
            created_at: timestamp,
            updated_at: timestamp,
            record_count: 0,
        }
    }

    /// Account for a newly appended record.
    pub fn record(&mut self, timestamp: DateTime<Utc>) {
        self.updated_at = timestamp;
        self.record_count = self.record_count.saturating_add(1);
    }
}
