//! Durable JSONL log of scheduling events.
//!
//! Every terminal condition (failure, block, stall) lands here in addition
//! to the checkpoint notifier, so an embedder can always reconstruct what a
//! run did after the fact.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::events::record::{RunEventRecord, RunManifest};

const RUNS_DIR_NAME: &str = "runs";
const MANIFEST_FILE_NAME: &str = "run.json";
const EVENTS_FILE_NAME: &str = "events.jsonl";

/// Errors that can occur while recording run events.
#[derive(Error, Debug)]
pub enum EventError {
    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid run identifier.
    #[error("Invalid run ID")]
    InvalidRunId,
}

/// Result type for event-log operations.
pub type EventResult<T> = Result<T, EventError>;

/// Append-only event log for one run, rooted under a base directory.
#[derive(Debug, Clone)]
pub struct EventLog {
    run_id: String,
    run_dir: PathBuf,
}

impl EventLog {
    /// Create the log directory for `run_id` under `base_dir`.
    pub fn new(base_dir: &Path, run_id: String) -> EventResult<Self> {
        if run_id.trim().is_empty() {
            return Err(EventError::InvalidRunId);
        }
        let run_dir = base_dir.join(RUNS_DIR_NAME).join(&run_id);
        fs::create_dir_all(&run_dir)?;
        Ok(Self { run_id, run_dir })
    }

    /// The run this log belongs to.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Directory holding this run's stream and manifest.
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Append one event. Failures are reported, never fatal to the run.
    pub fn emit(&self, kind: &str, payload: Value) {
        let record = RunEventRecord::new(self.run_id.clone(), kind, payload);
        if let Err(err) = self.append_record(&record) {
            warn!(
                run = %self.run_id,
                kind,
                error = %err,
                "failed to write run event"
            );
        }
    }

    /// Append a record to the stream and update the manifest.
    pub fn append_record(&self, record: &RunEventRecord) -> EventResult<()> {
        let events_path = self.run_dir.join(EVENTS_FILE_NAME);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&events_path)?;
        let json = serde_json::to_string(record)?;
        writeln!(file, "{}", json)?;

        let mut manifest = self.load_or_create_manifest(record)?;
        manifest.record(record.recorded_at);
        self.write_manifest(&manifest)?;
        Ok(())
    }

    /// Read back every record for this run, in append order.
    pub fn read_records(&self) -> EventResult<Vec<RunEventRecord>> {
        let events_path = self.run_dir.join(EVENTS_FILE_NAME);
        let contents = match fs::read_to_string(&events_path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(EventError::Io(err)),
        };
        let mut records = Vec::new();
        for line in contents.lines().filter(|line| !line.trim().is_empty()) {
            records.push(serde_json::from_str(line)?);
        }
        Ok(records)
    }

    /// Read the run manifest, if any records were written.
    pub fn read_manifest(&self) -> EventResult<Option<RunManifest>> {
        let manifest_path = self.run_dir.join(MANIFEST_FILE_NAME);
        match fs::read_to_string(&manifest_path) {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(EventError::Io(err)),
        }
    }

    fn load_or_create_manifest(&self, record: &RunEventRecord) -> EventResult<RunManifest> {
        Ok(self
            .read_manifest()?
            .unwrap_or_else(|| RunManifest::new(self.run_id.clone(), record.recorded_at)))
    }

    fn write_manifest(&self, manifest: &RunManifest) -> EventResult<()> {
        let manifest_path = self.run_dir.join(MANIFEST_FILE_NAME);
        let json = serde_json::to_string_pretty(manifest)?;
        fs::write(manifest_path, json)?;
        Ok(())
    }
}

/// Generate a unique run identifier.
pub fn generate_run_id() -> String {
    let timestamp_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0);
    let pid = std::process::id();
    format!("run-{}-{}", timestamp_ms, pid)
}
