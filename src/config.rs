//! Scheduler configuration, loadable from TOML files and environment
//! variables.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::conflict::PatternClassifier;
use crate::scheduler::RetryPolicy;

/// Resource-key patterns driving conflict-tier classification.
///
/// Keys matching `escalate_patterns` are exclusive-owner resources; keys
/// matching `sequential_patterns` are aggregation points; everything else
/// falls into the lenient `Retry` tier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Regexes for aggregation-point resources.
    #[serde(default)]
    pub sequential_patterns: Vec<String>,
    /// Regexes for exclusive-owner resources.
    #[serde(default)]
    pub escalate_patterns: Vec<String>,
}

impl ClassifierConfig {
    /// Compile the configured patterns into a classifier. With no patterns
    /// configured, the built-in defaults apply.
    pub fn build(&self) -> Result<PatternClassifier, regex::Error> {
        if self.sequential_patterns.is_empty() && self.escalate_patterns.is_empty() {
            return Ok(PatternClassifier::default());
        }
        PatternClassifier::new(&self.sequential_patterns, &self.escalate_patterns)
    }
}

/// Configuration for a planning run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum items executed concurrently per batch.
    pub parallelism_cap: usize,
    /// Retry budget and backoff schedule for failed items.
    pub retry: RetryPolicy,
    /// Conflict-tier classification patterns.
    pub classifier: ClassifierConfig,
    /// Directory for the durable run-event log. `None` disables it.
    pub event_log_dir: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            parallelism_cap: 3,
            retry: RetryPolicy::default(),
            classifier: ClassifierConfig::default(),
            event_log_dir: None,
        }
    }
}

impl SchedulerConfig {
    /// Create a config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the parallelism cap (minimum 1).
    pub fn with_parallelism_cap(mut self, cap: usize) -> Self {
        self.parallelism_cap = cap.max(1);
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the classifier patterns.
    pub fn with_classifier(mut self, classifier: ClassifierConfig) -> Self {
        self.classifier = classifier;
        self
    }

    /// Enable the run-event log under `dir`.
    pub fn with_event_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.event_log_dir = Some(dir.into());
        self
    }

    /// Load configuration by layering a TOML file and `CONVOY_`-prefixed
    /// environment variables over the defaults.
    pub fn load(path: &Path) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("CONVOY").separator("__"))
            .build()?;
        settings.try_deserialize()
    }
}
