//! Queue registry and descriptors
//!
//! The queue set is fixed configuration, not a runtime surface: adding a
//! queue means shipping a config change. Descriptors cache aggregates for
//! dashboards; dispatch decisions always go back to the Broker and Store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fixed set of queue names accepted by the service
pub const QUEUE_NAMES: [&str; 8] = [
    "business-discovery",
    "instagram-detection",
    "video-scraping",
    "video-analysis",
    "report-generation",
    "file-processing",
    "cleanup",
    "notifications",
];

/// Check a name against the fixed registry
pub fn is_registered_queue(name: &str) -> bool {
    QUEUE_NAMES.contains(&name)
}

/// Per-queue dispatch and retention settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfiguration {
    /// Worker slots for this queue
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Default attempt cap for jobs submitted without one
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Base delay for exponential retry backoff
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Most recent completed records kept by retention
    #[serde(default = "default_retain_completed")]
    pub retain_completed: usize,

    /// Most recent failed records kept by retention
    #[serde(default = "default_retain_failed")]
    pub retain_failed: usize,
}

impl Default for QueueConfiguration {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            retain_completed: default_retain_completed(),
            retain_failed: default_retain_failed(),
        }
    }
}

impl QueueConfiguration {
    /// Validate admin-supplied configuration updates
    pub fn validate(&self) -> Result<(), String> {
        if self.concurrency == 0 {
            return Err("concurrency must be at least 1".to_string());
        }
        if self.retry_attempts == 0 {
            return Err("retry_attempts must be at least 1".to_string());
        }
        if self.retry_delay_ms == 0 {
            return Err("retry_delay_ms must be positive".to_string());
        }
        Ok(())
    }
}

fn default_concurrency() -> usize {
    4
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    2_000
}

fn default_retain_completed() -> usize {
    1_000
}

fn default_retain_failed() -> usize {
    5_000
}

/// Health classification refreshed by the Scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Error,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Warning => "warning",
            HealthStatus::Error => "error",
        }
    }

    /// Severity rank for worst-of aggregation
    pub fn rank(&self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Warning => 1,
            HealthStatus::Error => 2,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a queue from completed/failed counts over the observation window
pub fn evaluate_health(completed: u64, failed: u64) -> HealthStatus {
    if failed > completed {
        HealthStatus::Error
    } else if failed > 10 && failed as f64 > 0.1 * completed as f64 {
        HealthStatus::Warning
    } else {
        HealthStatus::Healthy
    }
}

/// Aggregates recomputed by the metrics refresh task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueAggregates {
    pub processing_rate_per_min: f64,
    pub avg_processing_time_ms: f64,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub health_status: HealthStatus,
    pub last_health_check: Option<DateTime<Utc>>,
}

impl Default for QueueAggregates {
    fn default() -> Self {
        Self {
            processing_rate_per_min: 0.0,
            avg_processing_time_ms: 0.0,
            last_processed_at: None,
            health_status: HealthStatus::Healthy,
            last_health_check: None,
        }
    }
}

/// One record per named queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueDescriptor {
    pub name: String,
    pub description: String,

    /// Pause flag; workers skip reservation while false
    pub is_active: bool,

    pub configuration: QueueConfiguration,

    #[serde(default)]
    pub aggregates: QueueAggregates,
}

impl QueueDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            is_active: true,
            configuration: QueueConfiguration::default(),
            aggregates: QueueAggregates::default(),
        }
    }

    pub fn with_configuration(mut self, configuration: QueueConfiguration) -> Self {
        self.configuration = configuration;
        self
    }
}

/// Live counts derived from Broker and Store on demand
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct QueueCounts {
    pub waiting: usize,
    pub active: usize,
    pub delayed: usize,
    pub completed: usize,
    pub failed: usize,
}
